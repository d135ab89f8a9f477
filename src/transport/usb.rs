use log::{debug, info, warn};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use super::{discover_until, LinkConfig, ReadFailure, ReadLoop, Transport};
use crate::{
    device::{Address, DeviceInfo, TransportKind, UsbSettings},
    error::{DeviceError, Error, LinkError},
    listeners::Listeners,
};

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Endpoints {
    config: u8,
    iface: u8,
    setting: u8,
    address_in: u8,
    address_out: u8,
}

struct Link {
    handle: Arc<DeviceHandle<Context>>,
    endpoints: Endpoints,
    detached_driver: bool,
    label: String,
}

/// Bulk transport over libusb.
pub struct UsbTransport {
    config: LinkConfig,
    link: Option<Link>,
    reader: Option<ReadLoop>,
}

impl UsbTransport {
    pub fn new(config: LinkConfig) -> Self {
        UsbTransport {
            config,
            link: None,
            reader: None,
        }
    }

    fn scan(context: &Context, cancel: &AtomicBool) -> Result<Vec<DeviceInfo>, Error> {
        let devices = context.devices().map_err(DeviceError::Usb)?;
        let mut found = Vec::new();

        for device in devices.iter() {
            if cancel.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(err) => {
                    debug!("{:?}", err);
                    continue;
                }
            };
            if device_desc.class_code() == 0x09 {
                // hub
                continue;
            }
            if Self::find_endpoints(&device, &device_desc, &UsbSettings::default()).is_none() {
                continue;
            }

            let (serial_number, product) = Self::read_strings(&device, &device_desc);
            found.push(DeviceInfo::usb(
                device_desc.vendor_id(),
                device_desc.product_id(),
                serial_number,
                device.bus_number(),
                device.address(),
                product,
            ));
        }
        Ok(found)
    }

    /// Serial number and product strings, when the device can be opened.
    fn read_strings(
        device: &Device<Context>,
        device_desc: &DeviceDescriptor,
    ) -> (Option<String>, Option<String>) {
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(err) => {
                debug!("Failed to open device: {:?}", err);
                return (None, None);
            }
        };
        let language = match handle.read_languages(DESCRIPTOR_TIMEOUT) {
            Ok(languages) if !languages.is_empty() => languages[0],
            _ => return (None, None),
        };
        let serial = handle
            .read_serial_number_string(language, device_desc, DESCRIPTOR_TIMEOUT)
            .ok();
        let product = handle
            .read_product_string(language, device_desc, DESCRIPTOR_TIMEOUT)
            .ok();
        (serial, product)
    }

    fn open_device(
        context: &Context,
        vid: u16,
        pid: u16,
        serial: Option<&str>,
    ) -> Result<(Device<Context>, DeviceDescriptor, DeviceHandle<Context>), Error> {
        let devices = context.devices().map_err(DeviceError::Usb)?;

        if devices.is_empty() {
            debug!("Failed to read device list");
            return Err(DeviceError::DeviceListNotReadable.into());
        }
        for device in devices.iter() {
            let device_desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(err) => {
                    debug!("{:?}", err);
                    continue;
                }
            };
            if device_desc.vendor_id() != vid || device_desc.product_id() != pid {
                continue;
            }

            let handle = match device.open() {
                Ok(handle) => handle,
                Err(err) => {
                    debug!("Failed to open device: {:?}", err);
                    continue;
                }
            };
            let Some(serial) = serial else {
                return Ok((device, device_desc, handle));
            };
            let languages = handle
                .read_languages(DESCRIPTOR_TIMEOUT)
                .map_err(DeviceError::Usb)?;
            let Some(language) = languages.first() else {
                continue;
            };
            match handle.read_serial_number_string(*language, &device_desc, DESCRIPTOR_TIMEOUT) {
                Ok(s) if s == serial => return Ok((device, device_desc, handle)),
                Ok(_) => continue,
                Err(err) => {
                    debug!("Failed to read serial number string: {:?}", err);
                    continue;
                }
            }
        }
        debug!("No device match with this serial: {:?}", serial);
        Err(DeviceError::NotFound(format!("{:04x}:{:04x}", vid, pid)).into())
    }

    /// First interface offering both a bulk IN and a bulk OUT endpoint.
    /// Explicit numbers in `settings` narrow or override the search.
    fn find_endpoints(
        device: &Device<Context>,
        device_desc: &DeviceDescriptor,
        settings: &UsbSettings,
    ) -> Option<Endpoints> {
        for n in 0..device_desc.num_configurations() {
            let config_desc = match device.config_descriptor(n) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if settings
                .configuration
                .map_or(false, |c| c != config_desc.number())
            {
                continue;
            }
            for interface in config_desc.interfaces() {
                for interface_desc in interface.descriptors() {
                    if settings
                        .interface
                        .map_or(false, |i| i != interface_desc.interface_number())
                    {
                        continue;
                    }
                    let bulk = |direction: Direction| {
                        interface_desc
                            .endpoint_descriptors()
                            .find(|e| {
                                e.direction() == direction
                                    && e.transfer_type() == TransferType::Bulk
                            })
                            .map(|e| e.address())
                    };
                    let address_in = settings.endpoint_in.or_else(|| bulk(Direction::In));
                    let address_out = settings.endpoint_out.or_else(|| bulk(Direction::Out));
                    if let (Some(address_in), Some(address_out)) = (address_in, address_out) {
                        return Some(Endpoints {
                            config: config_desc.number(),
                            iface: interface_desc.interface_number(),
                            setting: interface_desc.setting_number(),
                            address_in,
                            address_out,
                        });
                    }
                }
            }
        }
        None
    }

    fn link(&self) -> Result<&Link, Error> {
        self.link.as_ref().ok_or_else(|| LinkError::NotConnected.into())
    }
}

/// Interface ownership calls made while connecting.
trait InterfaceControl {
    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool>;
    fn detach_kernel_driver(&self, iface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&self, iface: u8) -> rusb::Result<()>;
    fn active_configuration(&self) -> rusb::Result<u8>;
    fn set_active_configuration(&self, config: u8) -> rusb::Result<()>;
    fn claim_interface(&self, iface: u8) -> rusb::Result<()>;
    fn release_interface(&self, iface: u8) -> rusb::Result<()>;
    fn set_alternate_setting(&self, iface: u8, setting: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> InterfaceControl for DeviceHandle<T> {
    fn kernel_driver_active(&self, iface: u8) -> rusb::Result<bool> {
        DeviceHandle::kernel_driver_active(self, iface)
    }
    fn detach_kernel_driver(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, iface)
    }
    fn attach_kernel_driver(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, iface)
    }
    fn active_configuration(&self) -> rusb::Result<u8> {
        DeviceHandle::active_configuration(self)
    }
    fn set_active_configuration(&self, config: u8) -> rusb::Result<()> {
        DeviceHandle::set_active_configuration(self, config)
    }
    fn claim_interface(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, iface)
    }
    fn release_interface(&self, iface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, iface)
    }
    fn set_alternate_setting(&self, iface: u8, setting: u8) -> rusb::Result<()> {
        DeviceHandle::set_alternate_setting(self, iface, setting)
    }
}

/// Detach a bound kernel driver and claim the interface. Returns whether a
/// driver was detached. On failure the interface is released and the driver
/// handed back, so the device is left as it was found.
fn claim_interface(handle: &impl InterfaceControl, endpoints: &Endpoints) -> rusb::Result<bool> {
    // Printer-class interfaces are often bound to usblp.
    let detached = match handle.kernel_driver_active(endpoints.iface) {
        Ok(true) => {
            handle.detach_kernel_driver(endpoints.iface)?;
            true
        }
        _ => false,
    };

    let mut claimed = false;
    let result = (|| {
        if handle.active_configuration().ok() != Some(endpoints.config) {
            handle.set_active_configuration(endpoints.config)?;
        }
        handle.claim_interface(endpoints.iface)?;
        claimed = true;
        handle.set_alternate_setting(endpoints.iface, endpoints.setting)
    })();

    if let Err(err) = result {
        debug!("claiming interface {} failed: {:?}", endpoints.iface, err);
        if claimed {
            handle.release_interface(endpoints.iface).ok();
        }
        if detached {
            if let Err(err) = handle.attach_kernel_driver(endpoints.iface) {
                warn!("Failed to reattach kernel driver: {:?}", err);
            }
        }
        return Err(err);
    }
    Ok(detached)
}

impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn discover(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
        found: &mut dyn FnMut(DeviceInfo),
    ) -> Result<(), Error> {
        let context = Context::new().map_err(DeviceError::Usb)?;
        discover_until(timeout, cancel, found, |cancel| Self::scan(&context, cancel))
    }

    fn connect(&mut self, device: &DeviceInfo) -> Result<(), Error> {
        let Address::Usb {
            vendor_id,
            product_id,
            serial_number,
            ..
        } = device.address()
        else {
            return Err(DeviceError::WrongTransport {
                device: device.to_string(),
                expected: TransportKind::Usb,
                actual: device.kind(),
            }
            .into());
        };
        if self.link.is_some() {
            return Err(DeviceError::AlreadyConnected(device.to_string()).into());
        }

        let context = Context::new().map_err(DeviceError::Usb)?;
        let (usb_device, device_desc, handle) =
            Self::open_device(&context, *vendor_id, *product_id, serial_number.as_deref())?;

        let endpoints = Self::find_endpoints(&usb_device, &device_desc, device.usb_settings())
            .ok_or_else(|| DeviceError::MissingEndpoint(device.to_string()))?;
        debug!("{:?}", endpoints);

        let detached_driver = claim_interface(&handle, &endpoints).map_err(DeviceError::Usb)?;
        info!(" Kernel driver detached: {}", detached_driver);

        self.link = Some(Link {
            handle: Arc::new(handle),
            endpoints,
            detached_driver,
            label: device.to_string(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(mut reader) = self.reader.take() {
            reader.stop();
        }
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        debug!("releasing {}", link.label);
        link.handle
            .release_interface(link.endpoints.iface)
            .map_err(DeviceError::Usb)?;
        if link.detached_driver {
            if let Err(err) = link.handle.attach_kernel_driver(link.endpoints.iface) {
                warn!("Failed to reattach kernel driver: {:?}", err);
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, Error> {
        let link = self.link()?;
        link.handle
            .write_bulk(link.endpoints.address_out, chunk, self.config.write_timeout)
            .map_err(|err| match err {
                rusb::Error::Timeout => LinkError::Timeout(self.config.write_timeout).into(),
                err => LinkError::Usb(err).into(),
            })
    }

    fn start_reading(
        &mut self,
        sink: Listeners<Vec<u8>>,
        on_failure: ReadFailure,
    ) -> Result<(), Error> {
        let link = self.link()?;
        let handle = Arc::clone(&link.handle);
        let address = link.endpoints.address_in;
        let timeout = self.config.read_timeout;

        let reader = ReadLoop::spawn(
            "usb-read",
            move |buf: &mut [u8]| match handle.read_bulk(address, buf, timeout) {
                Ok(n) => Ok(Some(n)),
                Err(rusb::Error::Timeout) => Ok(None),
                Err(err) => Err(LinkError::Usb(err).into()),
            },
            sink,
            on_failure,
        )?;
        self.reader = Some(reader);
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!("{}", err);
        }
    }
}
