//! Inkline printhead driver
//!
//! This crate turns images into the column layout of a 552-nozzle handheld
//! printhead and ships the result to the device with a stop-and-wait frame
//! protocol over USB bulk endpoints or a serial port.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use inkline::{
//!     ConnectionManager, EncodeOptions, Encoder, FrameKind, LinkConfig, PayloadStore,
//!     TransferConfig, TransportKind,
//! };
//!
//! let encoder = Encoder::new(PayloadStore::in_temp_dir().unwrap(), EncodeOptions::default());
//! let data = encoder.encode(&image::open("label.png").unwrap()).unwrap();
//!
//! let mut manager = ConnectionManager::new(LinkConfig::default());
//! let found = manager.discover(&[TransportKind::Usb], Duration::from_secs(3)).unwrap();
//! if let Ok(inkline::DiscoveryEvent::Found(device)) = found.recv() {
//!     manager.connect(device).unwrap();
//!     let transfer = manager
//!         .submit_transfer(Arc::new(data), TransferConfig::new(FrameKind::StxA))
//!         .unwrap();
//!     transfer.join().unwrap();
//! }
//! ```

pub mod codec;
pub mod data;
pub mod device;
pub mod dither;
mod encode;
mod error;
pub mod layout;
mod listeners;
mod manager;
pub mod packet;
pub mod protocol;
mod store;
pub mod transport;

pub use crate::{
    codec::{Codec, PackBits, Zlib},
    data::{LayoutDirection, LogoData, MultiRowData, OtaData, RowData, TransferData},
    device::{Address, DeviceInfo, SerialSettings, TransportKind, UsbSettings},
    encode::{join, EncodeOptions, Encoder, RowImage, TARGET_HEIGHT},
    error::{
        DeviceError, EncodingError, Error, ErrorCode, FramingError, LinkError, ProtocolError,
    },
    layout::{format_binary_to_hardware_layout, COLUMN_BYTES, PRINTHEAD_HEIGHT},
    listeners::Listeners,
    manager::{
        ConnectionEvent, ConnectionManager, DiscoveryEvent, TransferHandle, TransportFactory,
    },
    packet::{FrameKind, Packet, PacketFramer},
    protocol::{run_transfer, FrameSink, TransferConfig, TransferEvent, TransferState},
    store::PayloadStore,
    transport::{ConnectionStatus, LinkConfig, ReadFailure, Transport},
};
