//! Connection lifecycle, discovery and transfer submission.
//!
//! A [`ConnectionManager`] owns at most one active connection. Byte runs read
//! from the device are fanned out to every subscriber, which is how a running
//! transfer sees the device's control bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::data::TransferData;
use crate::device::{DeviceInfo, TransportKind};
use crate::error::{DeviceError, Error, ErrorCode, LinkError, ProtocolError};
use crate::listeners::Listeners;
use crate::protocol::{run_transfer, FrameSink, TransferConfig, TransferEvent, TransferState};
use crate::transport::{self, ConnectionStatus, LinkConfig, ReadFailure, Transport};

/// Builds a transport adapter for a kind.
pub type TransportFactory = Arc<dyn Fn(TransportKind, &LinkConfig) -> Box<dyn Transport> + Send + Sync>;

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(DeviceInfo),
    Finished(TransportKind),
    Failed {
        kind: TransportKind,
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub device: DeviceInfo,
    pub status: ConnectionStatus,
    pub error: Option<String>,
}

struct Discovery {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct Active {
    device: DeviceInfo,
    transport: SharedTransport,
}

pub struct ConnectionManager {
    link: LinkConfig,
    factory: TransportFactory,
    active: Option<Active>,
    status: Arc<Mutex<ConnectionStatus>>,
    discoveries: HashMap<TransportKind, Discovery>,
    transfer_stop: Option<Arc<AtomicBool>>,
    transfer_busy: Arc<AtomicBool>,
    discovery_events: Listeners<DiscoveryEvent>,
    connection_events: Listeners<ConnectionEvent>,
    read_events: Listeners<Vec<u8>>,
}

impl ConnectionManager {
    pub fn new(link: LinkConfig) -> Self {
        Self::with_factory(link, Arc::new(transport::open))
    }

    pub fn with_factory(link: LinkConfig, factory: TransportFactory) -> Self {
        ConnectionManager {
            link,
            factory,
            active: None,
            status: Arc::new(Mutex::new(ConnectionStatus::Disconnected)),
            discoveries: HashMap::new(),
            transfer_stop: None,
            transfer_busy: Arc::new(AtomicBool::new(false)),
            discovery_events: Listeners::new(),
            connection_events: Listeners::new(),
            read_events: Listeners::new(),
        }
    }

    pub fn subscribe_discovery(&self) -> Receiver<DiscoveryEvent> {
        self.discovery_events.subscribe()
    }

    pub fn subscribe_connection(&self) -> Receiver<ConnectionEvent> {
        self.connection_events.subscribe()
    }

    /// Raw byte runs from the connected device.
    pub fn subscribe_read(&self) -> Receiver<Vec<u8>> {
        self.read_events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        *guard(&self.status)
    }

    /// False once the link is lost, even before [`disconnect`] is called.
    ///
    /// [`disconnect`]: ConnectionManager::disconnect
    pub fn is_connected(&self) -> bool {
        self.active.is_some() && self.status() == ConnectionStatus::Connected
    }

    pub fn connected_device(&self) -> Option<&DeviceInfo> {
        self.active
            .as_ref()
            .filter(|_| self.is_connected())
            .map(|a| &a.device)
    }

    /// Scan `kinds` for up to `timeout`. Found devices arrive on the returned
    /// receiver, followed by one `Finished` or `Failed` per kind. A scan
    /// already running for a kind is cancelled first.
    pub fn discover(
        &mut self,
        kinds: &[TransportKind],
        timeout: Duration,
    ) -> Result<Receiver<DiscoveryEvent>, Error> {
        let events = self.discovery_events.subscribe();

        for &kind in kinds {
            self.stop_discovery(kind);

            let transport = (self.factory)(kind, &self.link);
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            let listeners = self.discovery_events.clone();

            let handle = thread::Builder::new()
                .name(format!("discover-{:?}", kind).to_lowercase())
                .spawn(move || {
                    let result = transport.discover(timeout, &flag, &mut |info| {
                        listeners.send(DiscoveryEvent::Found(info))
                    });
                    match result {
                        Ok(()) => listeners.send(DiscoveryEvent::Finished(kind)),
                        Err(err) => {
                            warn!("{:?} discovery failed: {}", kind, err);
                            listeners.send(DiscoveryEvent::Failed {
                                kind,
                                code: err.code(),
                                message: err.to_string(),
                            })
                        }
                    }
                })
                .map_err(LinkError::Io)?;

            self.discoveries.insert(kind, Discovery { cancel, handle });
        }
        Ok(events)
    }

    pub fn stop_discovery(&mut self, kind: TransportKind) {
        if let Some(discovery) = self.discoveries.remove(&kind) {
            debug!("cancelling {:?} discovery", kind);
            discovery.cancel.store(true, Ordering::SeqCst);
            if discovery.handle.join().is_err() {
                warn!("{:?} discovery thread panicked", kind);
            }
        }
    }

    fn stop_all_discoveries(&mut self) {
        let kinds: Vec<TransportKind> = self.discoveries.keys().copied().collect();
        for kind in kinds {
            self.stop_discovery(kind);
        }
    }

    /// Connect to `device`. Fails if a connection is already active.
    /// Running discoveries are cancelled first.
    pub fn connect(&mut self, device: DeviceInfo) -> Result<(), Error> {
        if let Some(current) = self.connected_device() {
            return Err(DeviceError::AlreadyConnected(current.to_string()).into());
        }
        // drop a link that was lost under us
        self.disconnect()?;
        self.stop_all_discoveries();
        self.set_status(&device, ConnectionStatus::Connecting, None);

        let mut transport = (self.factory)(device.kind(), &self.link);
        let on_failure = self.link_lost(&device);
        let result = transport
            .connect(&device)
            .and_then(|()| transport.start_reading(self.read_events.clone(), on_failure));

        if let Err(err) = result {
            if let Err(cleanup) = transport.disconnect() {
                debug!("cleanup after failed connect: {}", cleanup);
            }
            self.set_status(&device, ConnectionStatus::ConnectFail, Some(err.to_string()));
            return Err(err);
        }

        info!("connected to {}", device);
        self.active = Some(Active {
            device: device.clone(),
            transport: Arc::new(Mutex::new(transport)),
        });
        // the read loop may already have failed
        let mut status = guard(&self.status);
        if *status == ConnectionStatus::Connecting {
            *status = ConnectionStatus::Connected;
            drop(status);
            self.publish(&device, ConnectionStatus::Connected, None);
        }
        Ok(())
    }

    /// Handler for a read loop dying under an open connection: the link is
    /// reported `Disconnected` with the error, and read subscribers (a
    /// running transfer included) see their channel close.
    fn link_lost(&self, device: &DeviceInfo) -> ReadFailure {
        let status = Arc::clone(&self.status);
        let events = self.connection_events.clone();
        let reads = self.read_events.clone();
        let device = device.clone();

        Box::new(move |err: Error| {
            warn!("lost connection to {}: {}", device, err);
            *guard(&status) = ConnectionStatus::Disconnected;
            reads.close();
            events.send(ConnectionEvent {
                device,
                status: ConnectionStatus::Disconnected,
                error: Some(err.to_string()),
            });
        })
    }

    /// Tear down the active connection. A running transfer is stopped.
    pub fn disconnect(&mut self) -> Result<(), Error> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        if let Some(stop) = self.transfer_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if self.status() == ConnectionStatus::Disconnected {
            // lost link, already reported
            if let Err(err) = lock(&active.transport).disconnect() {
                debug!("cleanup after lost link: {}", err);
            }
            return Ok(());
        }
        self.set_status(&active.device, ConnectionStatus::Disconnecting, None);

        let result = lock(&active.transport).disconnect();
        let error = result.as_ref().err().map(|e| e.to_string());
        self.set_status(&active.device, ConnectionStatus::Disconnected, error);
        info!("disconnected from {}", active.device);
        result
    }

    /// Write raw bytes to the connected device.
    pub fn write(&self, data: &[u8], progress: &mut dyn FnMut(usize, usize)) -> Result<usize, Error> {
        let active = self.active.as_ref().ok_or(LinkError::NotConnected)?;
        let written = lock(&active.transport).write(data, progress)?;
        Ok(written)
    }

    /// Run a transfer of `data` on a background thread.
    ///
    /// Only one transfer may run per connection.
    pub fn submit_transfer(
        &mut self,
        data: Arc<dyn TransferData>,
        config: TransferConfig,
    ) -> Result<TransferHandle, Error> {
        let active = self.active.as_ref().ok_or(LinkError::NotConnected)?;
        if self
            .transfer_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DeviceError::TransferInProgress(active.device.to_string()).into());
        }

        // subscribe before the thread starts so no early request is missed
        let incoming = self.read_events.subscribe();
        let (events_tx, events) = channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let busy = BusyGuard(Arc::clone(&self.transfer_busy));
        let mut sink = LinkSink {
            transport: Arc::clone(&active.transport),
        };

        let spawned = thread::Builder::new()
            .name("transfer".to_string())
            .spawn(move || {
                let _busy = busy;
                run_transfer(&*data, &config, &mut sink, &incoming, &events_tx, &flag)
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                self.transfer_busy.store(false, Ordering::SeqCst);
                return Err(LinkError::Io(err).into());
            }
        };

        self.transfer_stop = Some(Arc::clone(&stop));
        Ok(TransferHandle {
            stop,
            events,
            handle,
        })
    }

    fn set_status(&mut self, device: &DeviceInfo, status: ConnectionStatus, error: Option<String>) {
        *guard(&self.status) = status;
        self.publish(device, status, error);
    }

    fn publish(&self, device: &DeviceInfo, status: ConnectionStatus, error: Option<String>) {
        debug!("{} -> {:?}", device, status);
        self.connection_events.send(ConnectionEvent {
            device: device.clone(),
            status,
            error,
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_all_discoveries();
        if let Err(err) = self.disconnect() {
            warn!("{}", err);
        }
    }
}

/// A transfer running on its own thread.
pub struct TransferHandle {
    stop: Arc<AtomicBool>,
    events: Receiver<TransferEvent>,
    handle: JoinHandle<Result<TransferState, Error>>,
}

impl TransferHandle {
    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events
    }

    /// Ask the transfer to abort at its next poll.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn join(self) -> Result<TransferState, Error> {
        self.handle.join().map_err(|_| ProtocolError::Panicked)?
    }
}

/// Clears the transfer slot when the transfer thread ends, panics included.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct LinkSink {
    transport: SharedTransport,
}

impl FrameSink for LinkSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        lock(&self.transport).write(frame, &mut |_, _| {})?;
        Ok(())
    }
}

fn lock(transport: &SharedTransport) -> MutexGuard<'_, Box<dyn Transport>> {
    guard(transport)
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
