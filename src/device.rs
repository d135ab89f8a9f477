//! Discovered peripherals and their link parameters.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Serial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

/// Serial line settings applied on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub(crate) baud_rate: u32,
    pub(crate) data_bits: DataBits,
    pub(crate) parity: Parity,
    pub(crate) stop_bits: StopBits,
    pub(crate) rts_cts: bool,
    pub(crate) xon_xoff: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::new(115_200)
    }
}

impl SerialSettings {
    pub fn new(baud_rate: u32) -> Self {
        SerialSettings {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            rts_cts: false,
            xon_xoff: false,
        }
    }

    pub fn data_bits(self, data_bits: DataBits) -> Self {
        SerialSettings { data_bits, ..self }
    }

    pub fn parity(self, parity: Parity) -> Self {
        SerialSettings { parity, ..self }
    }

    pub fn stop_bits(self, stop_bits: StopBits) -> Self {
        SerialSettings { stop_bits, ..self }
    }

    /// Hardware (RTS/CTS) flow control. Takes precedence over XON/XOFF.
    pub fn rts_cts(self, rts_cts: bool) -> Self {
        SerialSettings { rts_cts, ..self }
    }

    /// Software (XON/XOFF) flow control.
    pub fn xon_xoff(self, xon_xoff: bool) -> Self {
        SerialSettings { xon_xoff, ..self }
    }

    pub fn baud(&self) -> u32 {
        self.baud_rate
    }
}

/// Explicit USB interface/endpoint selection. Unset values are discovered
/// from the descriptors on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsbSettings {
    pub configuration: Option<u8>,
    pub interface: Option<u8>,
    pub endpoint_in: Option<u8>,
    pub endpoint_out: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Usb {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        bus: u8,
        address: u8,
    },
    Serial {
        port: String,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        serial_number: Option<String>,
    },
}

/// A discovered peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    address: Address,
    name: Option<String>,
    serial: SerialSettings,
    usb: UsbSettings,
    id: String,
}

impl DeviceInfo {
    pub fn usb(
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        bus: u8,
        address: u8,
        name: Option<String>,
    ) -> Self {
        Self::with_address(
            Address::Usb {
                vendor_id,
                product_id,
                serial_number,
                bus,
                address,
            },
            name,
        )
    }

    pub fn serial(
        port: impl Into<String>,
        usb_ids: Option<(u16, u16)>,
        serial_number: Option<String>,
        name: Option<String>,
    ) -> Self {
        Self::with_address(
            Address::Serial {
                port: port.into(),
                vendor_id: usb_ids.map(|(v, _)| v),
                product_id: usb_ids.map(|(_, p)| p),
                serial_number,
            },
            name,
        )
    }

    fn with_address(address: Address, name: Option<String>) -> Self {
        let mut info = DeviceInfo {
            address,
            name,
            serial: SerialSettings::default(),
            usb: UsbSettings::default(),
            id: String::new(),
        };
        info.id = info.compute_id();
        info
    }

    /// Attach user-configured serial parameters.
    pub fn with_serial_settings(self, serial: SerialSettings) -> Self {
        let mut info = DeviceInfo { serial, ..self };
        info.id = info.compute_id();
        info
    }

    /// Attach explicit USB interface/endpoint numbers.
    pub fn with_usb_settings(self, usb: UsbSettings) -> Self {
        let mut info = DeviceInfo { usb, ..self };
        info.id = info.compute_id();
        info
    }

    pub fn kind(&self) -> TransportKind {
        match self.address {
            Address::Usb { .. } => TransportKind::Usb,
            Address::Serial { .. } => TransportKind::Serial,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn serial_settings(&self) -> &SerialSettings {
        &self.serial
    }

    pub fn usb_settings(&self) -> &UsbSettings {
        &self.usb
    }

    /// Stable identifier derived from addressing and link parameters.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key used to recognise the same physical USB device across scans.
    pub fn composite_key(&self) -> String {
        match &self.address {
            Address::Usb {
                vendor_id,
                product_id,
                serial_number,
                ..
            } => format!(
                "{:04x}:{:04x}:{}",
                vendor_id,
                product_id,
                serial_number.as_deref().unwrap_or("")
            ),
            Address::Serial { port, .. } => port.clone(),
        }
    }

    fn compute_id(&self) -> String {
        let canonical = match &self.address {
            Address::Usb { .. } => format!("usb|{}|{:?}", self.composite_key(), self.usb),
            Address::Serial { port, .. } => format!("serial|{}|{:?}", port, self.serial),
        };
        format!("{:08x}", crc32fast::hash(canonical.as_bytes()))
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Address::Usb {
                vendor_id,
                product_id,
                serial_number,
                ..
            } => write!(
                f,
                "{:04x}:{:04x}@{}",
                vendor_id,
                product_id,
                serial_number.as_deref().unwrap_or("-")
            ),
            Address::Serial { port, .. } => f.write_str(port),
        }
    }
}
