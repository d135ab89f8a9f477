//! Error types for encoding, framing and transfer operations.
//!
//! This module defines all possible errors that can occur while turning an
//! image into printhead data and shipping it to the device.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the crate.
///
/// Each variant wraps one error category so callers can match on the kind of
/// failure without caring about the details.
#[derive(Error, Debug)]
pub enum Error {
    /// Image could not be turned into printhead data.
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    /// Payload or cursor invariant was violated.
    ///
    /// Indicates a programming defect; unreachable in correct use.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// Byte-level I/O to the device failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The peer drove the transfer into an unrecoverable state.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Connecting, disconnecting or enumerating a device failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Payload storage failure.
    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Stable code reported with transfer error events.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Encoding(_) => ErrorCode::Encoding,
            Self::Framing(_) => ErrorCode::Framing,
            Self::Link(_) => ErrorCode::Link,
            Self::Protocol(ProtocolError::TooManyErrors { .. }) => ErrorCode::DataTransfer,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Device(_) => ErrorCode::Device,
            Self::Storage { .. } => ErrorCode::Storage,
        }
    }
}

/// Coarse error classification delivered to the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Encoding,
    Framing,
    Link,
    Protocol,
    DataTransfer,
    Device,
    Storage,
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Can't read source image {path:?}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error("Buffer holds {actual} bytes but {width}x{height}x{channels} needs {expected}")]
    BufferSize {
        width: usize,
        height: usize,
        channels: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Unsupported channel count {0}, expected 3 (RGB) or 4 (RGBA)")]
    Channels(usize),

    #[error("Error row has {actual} entries, image width is {width}")]
    ErrorRowWidth { width: usize, actual: usize },

    #[error("Image height {height} exceeds the printhead height {max}")]
    TooTall { height: usize, max: usize },

    #[error("{codec} stream is corrupt: {reason}")]
    Codec { codec: &'static str, reason: String },

    #[error("Image is empty")]
    Empty,

    #[error("Beyond distances {top}+{bottom} leave no printable rows in a {height} pixel image")]
    NoValidArea { top: u32, bottom: u32, height: u32 },

    #[error("Row {index} failed to encode: {source}")]
    Row {
        index: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("Worker thread panicked")]
    WorkerPanicked,
}

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("No packet left in row {row} (index {index} of {count})")]
    RowExhausted { row: usize, index: i64, count: usize },

    #[error("No row after row {0}")]
    NoNextRow(usize),

    #[error("Payload of row {row} is {actual} bytes, expected {expected}")]
    LengthMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Row {row} compression flag differs from the payload's ({expected})")]
    CompressionMismatch { row: usize, expected: bool },

    #[error("Payload has no data")]
    EmptyPayload,
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("Short write at offset {offset}: wrote {written} of {requested} bytes")]
    ShortWrite {
        offset: usize,
        requested: usize,
        written: usize,
    },

    #[error("No response from device within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Usb(rusb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Transfer aborted after {count} consecutive NAKs at packet {index}")]
    TooManyErrors { count: u32, index: i64 },

    #[error("Unexpected {control:?} while {state:?}")]
    UnexpectedControl {
        control: crate::protocol::Control,
        state: crate::protocol::TransferState,
    },

    #[error("Transfer stopped by request")]
    Stopped,

    #[error("Read channel closed during transfer")]
    ReadClosed,

    #[error("Transfer thread panicked")]
    Panicked,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error("Can't read device list, permission issue ?")]
    DeviceListNotReadable,

    #[error("Device {0} not found")]
    NotFound(String),

    #[error("Device {0} has no bulk IN/OUT endpoint pair")]
    MissingEndpoint(String),

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("A transfer is already running on {0}")]
    TransferInProgress(String),

    #[error("Device {device} is a {actual:?} device, not {expected:?}")]
    WrongTransport {
        device: String,
        expected: crate::device::TransportKind,
        actual: crate::device::TransportKind,
    },
}
