use log::{debug, warn};
use serialport::{FlowControl, SerialPort, SerialPortType};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{discover_until, LinkConfig, ReadFailure, ReadLoop, Transport};
use crate::{
    device::{Address, DataBits, DeviceInfo, Parity, SerialSettings, StopBits, TransportKind},
    error::{DeviceError, Error, LinkError},
    listeners::Listeners,
};

/// Transport over a system serial port.
pub struct SerialTransport {
    config: LinkConfig,
    port: Option<Box<dyn SerialPort>>,
    reader: Option<ReadLoop>,
}

impl SerialTransport {
    pub fn new(config: LinkConfig) -> Self {
        SerialTransport {
            config,
            port: None,
            reader: None,
        }
    }

    fn scan(cancel: &AtomicBool) -> Result<Vec<DeviceInfo>, Error> {
        let ports = serialport::available_ports().map_err(DeviceError::Serial)?;
        let mut found = Vec::with_capacity(ports.len());
        for port in ports {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            let info = match port.port_type {
                SerialPortType::UsbPort(usb) => DeviceInfo::serial(
                    port.port_name,
                    Some((usb.vid, usb.pid)),
                    usb.serial_number,
                    usb.product,
                ),
                _ => DeviceInfo::serial(port.port_name, None, None, None),
            };
            found.push(info);
        }
        Ok(found)
    }

    fn open_port(&self, path: &str, settings: &SerialSettings) -> Result<Box<dyn SerialPort>, Error> {
        let data_bits = match settings.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        };
        let stop_bits = match settings.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        };
        let flow_control = if settings.rts_cts {
            FlowControl::Hardware
        } else if settings.xon_xoff {
            FlowControl::Software
        } else {
            FlowControl::None
        };
        debug!(
            "opening {} at {} baud, {:?} {:?} {:?} {:?}",
            path, settings.baud_rate, data_bits, parity, stop_bits, flow_control
        );

        serialport::new(path, settings.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(self.config.write_timeout)
            .open()
            .map_err(|err| DeviceError::Serial(err).into())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, Error> {
        self.port.as_mut().ok_or_else(|| LinkError::NotConnected.into())
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn discover(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
        found: &mut dyn FnMut(DeviceInfo),
    ) -> Result<(), Error> {
        discover_until(timeout, cancel, found, Self::scan)
    }

    fn connect(&mut self, device: &DeviceInfo) -> Result<(), Error> {
        let Address::Serial { port, .. } = device.address() else {
            return Err(DeviceError::WrongTransport {
                device: device.to_string(),
                expected: TransportKind::Serial,
                actual: device.kind(),
            }
            .into());
        };
        if self.port.is_some() {
            return Err(DeviceError::AlreadyConnected(device.to_string()).into());
        }
        let opened = self.open_port(port, device.serial_settings())?;
        self.port = Some(opened);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        if let Some(mut port) = self.port.take() {
            port.flush().map_err(LinkError::Io)?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, Error> {
        let timeout = self.config.write_timeout;
        let port = self.port()?;
        let written = port.write(chunk).map_err(|err| match err.kind() {
            io::ErrorKind::TimedOut => LinkError::Timeout(timeout),
            _ => LinkError::Io(err),
        })?;
        port.flush().map_err(LinkError::Io)?;
        Ok(written)
    }

    fn start_reading(
        &mut self,
        sink: Listeners<Vec<u8>>,
        on_failure: ReadFailure,
    ) -> Result<(), Error> {
        let read_timeout = self.config.read_timeout;
        let mut reader = self.port()?.try_clone().map_err(DeviceError::Serial)?;
        reader
            .set_timeout(read_timeout)
            .map_err(DeviceError::Serial)?;

        let read_loop = ReadLoop::spawn(
            "serial-read",
            move |buf: &mut [u8]| match reader.read(buf) {
                Ok(n) => Ok(Some(n)),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
                Err(err) => Err(LinkError::Io(err).into()),
            },
            sink,
            on_failure,
        )?;
        self.reader = Some(read_loop);
        Ok(())
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!("{}", err);
        }
    }
}
