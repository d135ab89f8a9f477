//! Byte transports to the device.
//!
//! - [`usb`]: bulk endpoints through libusb
//! - [`serial`]: system serial ports
//!
//! Both move raw bytes only. Frames and acknowledgements are handled by
//! [`crate::protocol`].

pub mod serial;
pub mod usb;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::device::{DeviceInfo, TransportKind};
use crate::error::{Error, LinkError};
use crate::listeners::Listeners;

pub use serial::SerialTransport;
pub use usb::UsbTransport;

/// Largest single OS-level write.
pub const MAX_CHUNK: usize = 10 * 1024;

const READ_BUFFER: usize = 1024;

/// Pause between discovery scans.
const SCAN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ConnectFail,
    Disconnecting,
}

/// Called once with the error that ended a read loop.
pub type ReadFailure = Box<dyn FnOnce(Error) + Send>;

/// Link-level tuning shared by both transports.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    chunk_size: usize,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            chunk_size: MAX_CHUNK,
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl LinkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes per OS-level write, capped at [`MAX_CHUNK`].
    pub fn chunk_size(self, chunk_size: usize) -> Self {
        LinkConfig {
            chunk_size: chunk_size.clamp(1, MAX_CHUNK),
            ..self
        }
    }

    pub fn write_timeout(self, write_timeout: Duration) -> Self {
        LinkConfig {
            write_timeout,
            ..self
        }
    }

    /// Poll period of the read loop; also bounds how long disconnect waits.
    pub fn read_timeout(self, read_timeout: Duration) -> Self {
        LinkConfig {
            read_timeout,
            ..self
        }
    }
}

/// A device link.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Report each newly seen device until `timeout` elapses or `cancel` is
    /// set. `cancel` is checked between devices.
    fn discover(
        &self,
        timeout: Duration,
        cancel: &AtomicBool,
        found: &mut dyn FnMut(DeviceInfo),
    ) -> Result<(), Error>;

    fn connect(&mut self, device: &DeviceInfo) -> Result<(), Error>;

    fn disconnect(&mut self) -> Result<(), Error>;

    fn is_connected(&self) -> bool;

    /// Chunk size used by [`Transport::write`].
    fn chunk_size(&self) -> usize;

    /// One OS-level write. Returns the number of bytes accepted.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<usize, Error>;

    /// Start the background read loop. Every received byte run goes to
    /// `sink` untouched. A read error ends the loop and is handed to
    /// `on_failure`.
    fn start_reading(
        &mut self,
        sink: Listeners<Vec<u8>>,
        on_failure: ReadFailure,
    ) -> Result<(), Error>;

    /// Write `data` in chunks, calling `progress(written, total)` after each.
    fn write(
        &mut self,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<usize, Error> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected.into());
        }
        let mut offset = 0;
        for chunk in data.chunks(self.chunk_size()) {
            let written = self.write_chunk(chunk)?;
            if written != chunk.len() {
                debug!(
                    "write error: bytes wrote {} != bytes supplied {}, possibly timeout ?",
                    written,
                    chunk.len()
                );
                return Err(LinkError::ShortWrite {
                    offset,
                    requested: chunk.len(),
                    written,
                }
                .into());
            }
            offset += written;
            progress(offset, data.len());
        }
        Ok(offset)
    }
}

/// Create the adapter for `kind`.
pub fn open(kind: TransportKind, link: &LinkConfig) -> Box<dyn Transport> {
    match kind {
        TransportKind::Usb => Box::new(UsbTransport::new(link.clone())),
        TransportKind::Serial => Box::new(SerialTransport::new(link.clone())),
    }
}

/// Repeat `scan` until the deadline, reporting devices not seen before.
pub(crate) fn discover_until(
    timeout: Duration,
    cancel: &AtomicBool,
    found: &mut dyn FnMut(DeviceInfo),
    mut scan: impl FnMut(&AtomicBool) -> Result<Vec<DeviceInfo>, Error>,
) -> Result<(), Error> {
    let deadline = Instant::now() + timeout;
    let mut seen = HashSet::new();

    loop {
        for info in scan(cancel)? {
            if cancel.load(Ordering::SeqCst) {
                return Ok(());
            }
            if seen.insert(info.composite_key()) {
                debug!("discovered {}", info);
                found(info);
            }
        }

        let now = Instant::now();
        if cancel.load(Ordering::SeqCst) || now >= deadline {
            return Ok(());
        }
        thread::sleep(SCAN_INTERVAL.min(deadline - now));
    }
}

/// Background thread pulling bytes off a link.
pub(crate) struct ReadLoop {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReadLoop {
    /// `read` returns `Ok(None)` on a poll timeout; an error ends the loop
    /// and goes to `on_failure`. A requested stop does not call it.
    pub(crate) fn spawn<F>(
        name: &str,
        mut read: F,
        sink: Listeners<Vec<u8>>,
        on_failure: ReadFailure,
    ) -> Result<Self, Error>
    where
        F: FnMut(&mut [u8]) -> Result<Option<usize>, Error> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUFFER];
                let mut failure = None;
                while flag.load(Ordering::SeqCst) {
                    match read(&mut buf) {
                        Ok(Some(n)) if n > 0 => sink.send(buf[..n].to_vec()),
                        Ok(_) => {}
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                flag.store(false, Ordering::SeqCst);
                if let Some(err) = failure {
                    warn!("read loop stopped: {}", err);
                    on_failure(err);
                }
            })
            .map_err(LinkError::Io)?;

        Ok(ReadLoop {
            running,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("read loop panicked");
            }
        }
    }
}

impl Drop for ReadLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
