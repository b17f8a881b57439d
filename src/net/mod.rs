//! Network coordinator: lifecycle, connection table, message dispatch.
//!
//! The coordinator owns every peer session by identity, the accept loop on
//! the service port, and the subscription to discovery events. Sessions and
//! engines never reference the coordinator back; they communicate through
//! channels, and the caller consumes one event stream fed by a dedicated
//! emit task.

pub mod discovery;
pub mod interfaces;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transfer;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{lookup_host, TcpListener};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::config::NetworkConfig;
use crate::error::{Result, VaultError};
use crate::pairing::PairingSecrets;
use crate::types::{epoch_secs, DeviceInfo, NetworkState};

use discovery::{Discovery, DiscoveryEvent};
use protocol::MessageType;
use session::{PeerSession, SessionEvent};
use sync::{IndexSyncManager, SyncProgress};
use transfer::{FileRequestOutcome, FileResolver, FileTransferManager, TransferProgress};

/// Everything the coordinator reports to its caller, delivered in order on
/// one channel.
#[derive(Debug)]
pub enum NetworkEvent {
    DeviceDiscovered(DeviceInfo),
    DeviceLost(DeviceInfo),
    DeviceConnected(DeviceInfo),
    DeviceDisconnected(DeviceInfo),
    StateChanged(NetworkState),
    Error { message: String },
    SyncProgress(SyncProgress),
    SyncComplete { device_id: String, files_received: i64 },
    FileTransferProgress(TransferProgress),
    FileTransferComplete(TransferProgress),
    FileTransferError(TransferProgress),
}

/// Per-process coordinator for discovery, sessions, sync and transfer.
pub struct NetworkManager {
    config: NetworkConfig,
    secrets: Arc<PairingSecrets>,
    discovery: Arc<Discovery>,
    sync: Arc<IndexSyncManager>,
    transfers: Arc<FileTransferManager>,
    sessions: Arc<Mutex<HashMap<String, Arc<PeerSession>>>>,
    state: Mutex<NetworkState>,
    server_port: AtomicU16,
    events_tx: mpsc::UnboundedSender<NetworkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
    external_tx: Mutex<Option<mpsc::UnboundedSender<NetworkEvent>>>,
    /// Sink sessions push frames and closures into. Replaced on every
    /// `start` together with its dispatch task.
    session_tx: Mutex<mpsc::UnboundedSender<SessionEvent>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NetworkManager {
    /// Build a coordinator. Returns the manager and the receiver for its
    /// event stream. Nothing touches the network until `start`.
    pub fn new(
        config: NetworkConfig,
        secrets: Arc<PairingSecrets>,
        store: Arc<dyn CatalogStore>,
        resolver: FileResolver,
        cache_root: PathBuf,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NetworkEvent>)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (external_tx, external_rx) = mpsc::unbounded_channel();
        // Placeholder sink; `start` installs a live one with its dispatcher.
        let (session_tx, _) = mpsc::unbounded_channel();

        let sync = Arc::new(IndexSyncManager::new(
            store,
            secrets.device_id().to_string(),
            config.sync_batch_size,
            config.sync_batch_pause,
            config.request_timeout,
            events_tx.clone(),
        )?);
        let transfers = Arc::new(FileTransferManager::new(
            cache_root,
            config.chunk_size,
            config.file_request_timeout,
            resolver,
            events_tx.clone(),
        ));
        let discovery = Arc::new(Discovery::new(
            config.discovery_port,
            config.announce_interval,
            config.device_ttl,
        ));

        let manager = Arc::new(Self {
            config,
            secrets,
            discovery,
            sync,
            transfers,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(NetworkState::Stopped),
            server_port: AtomicU16::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            external_tx: Mutex::new(Some(external_tx)),
            session_tx: Mutex::new(session_tx),
            tasks: Mutex::new(Vec::new()),
        });
        Ok((manager, external_rx))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Bind the service listener, start discovery and message dispatch.
    /// Pass 0 to pick an ephemeral port; `server_port` reports the bound one.
    pub async fn start(self: &Arc<Self>, port: u16) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, NetworkState::Starting | NetworkState::Running) {
                return Err(VaultError::InvalidArgument(
                    "network manager already running".to_string(),
                ));
            }
            *state = NetworkState::Starting;
        }
        self.emit(NetworkEvent::StateChanged(NetworkState::Starting));
        self.spawn_emit_task();

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.lock().unwrap() = NetworkState::Error;
                self.emit(NetworkEvent::StateChanged(NetworkState::Error));
                self.emit(NetworkEvent::Error {
                    message: format!("failed to bind service port {}: {}", port, e),
                });
                return Err(e.into());
            }
        };
        let bound_port = listener.local_addr()?.port();
        self.server_port.store(bound_port, Ordering::SeqCst);

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        *self.session_tx.lock().unwrap() = session_tx;
        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();

        self.spawn_accept_task(listener);
        self.spawn_dispatch_task(session_rx);
        self.spawn_discovery_task(discovery_rx);

        if let Err(e) = self
            .discovery
            .start(self.local_device(bound_port), discovery_tx)
        {
            *self.state.lock().unwrap() = NetworkState::Error;
            self.emit(NetworkEvent::StateChanged(NetworkState::Error));
            self.emit(NetworkEvent::Error {
                message: format!("failed to start discovery: {}", e),
            });
            return Err(e);
        }

        *self.state.lock().unwrap() = NetworkState::Running;
        self.emit(NetworkEvent::StateChanged(NetworkState::Running));
        info!(port = bound_port, device_id = %self.secrets.device_id(), "network manager started");
        Ok(())
    }

    /// Stop accepting, stop discovery, close every session, cancel every
    /// in-flight transfer. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, NetworkState::Stopped | NetworkState::Stopping) {
                return;
            }
            *state = NetworkState::Stopping;
        }
        self.emit(NetworkEvent::StateChanged(NetworkState::Stopping));

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.discovery.stop();

        let sessions: Vec<Arc<PeerSession>> = {
            let mut table = self.sessions.lock().unwrap();
            table.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
        self.transfers.cancel_all();

        self.server_port.store(0, Ordering::SeqCst);
        *self.state.lock().unwrap() = NetworkState::Stopped;
        self.emit(NetworkEvent::StateChanged(NetworkState::Stopped));
        info!("network manager stopped");
    }

    pub fn state(&self) -> NetworkState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == NetworkState::Running
    }

    pub fn server_port(&self) -> u16 {
        self.server_port.load(Ordering::SeqCst)
    }

    // ── Connections ─────────────────────────────────────────────────────────

    /// Connect to a device discovery has seen.
    pub async fn connect_to_device(self: &Arc<Self>, device_id: &str) -> Result<()> {
        if self.is_connected_to(device_id) {
            return Err(VaultError::InvalidArgument(format!(
                "already connected to {}",
                device_id
            )));
        }
        let device = self.discovery.device(device_id).ok_or_else(|| {
            VaultError::NotFound(format!("device {} not discovered", device_id))
        })?;
        self.connect_to_address(&device.ip_address, device.service_port)
            .await
    }

    /// Open a session to an explicit address.
    pub async fn connect_to_address(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        if !self.is_running() {
            return Err(VaultError::InvalidArgument(
                "network manager is not running".to_string(),
            ));
        }
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| VaultError::NotFound(format!("no address for {}:{}", host, port)))?;

        let session_tx = self.session_tx.lock().unwrap().clone();
        let session =
            PeerSession::connect(addr, &self.secrets, &self.config, session_tx).await?;
        let peer_id = session.device_id().to_string();

        // Simultaneous connections to the same identity converge on the one
        // initiated by the smaller device id; we are the initiator here.
        let (kept, to_close) = {
            let mut table = self.sessions.lock().unwrap();
            let existing_live = table.get(&peer_id).is_some_and(|s| s.is_connected());
            if !existing_live || self.secrets.device_id() < peer_id.as_str() {
                let old = table.insert(peer_id.clone(), session.clone());
                (true, old)
            } else {
                (false, Some(session.clone()))
            }
        };
        if let Some(old) = to_close {
            old.close().await;
        }
        if !kept {
            return Err(VaultError::InvalidArgument(format!(
                "already connected to {}",
                peer_id
            )));
        }
        session.start_receiver();
        self.emit(NetworkEvent::DeviceConnected(session.peer_info()));
        Ok(())
    }

    /// Close the session with one device, if any.
    pub async fn disconnect_device(&self, device_id: &str) {
        let session = self.sessions.lock().unwrap().remove(device_id);
        if let Some(session) = session {
            let info = session.peer_info();
            session.close().await;
            self.transfers.cancel_all_for(device_id);
            self.emit(NetworkEvent::DeviceDisconnected(info));
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = {
            let table = self.sessions.lock().unwrap();
            table.keys().cloned().collect()
        };
        for id in ids {
            self.disconnect_device(&id).await;
        }
    }

    pub fn is_connected_to(&self, device_id: &str) -> bool {
        let table = self.sessions.lock().unwrap();
        table.get(device_id).is_some_and(|s| s.is_connected())
    }

    pub fn connected_devices(&self) -> Vec<DeviceInfo> {
        let table = self.sessions.lock().unwrap();
        table
            .values()
            .filter(|s| s.is_connected())
            .map(|s| s.peer_info())
            .collect()
    }

    /// Devices currently visible through discovery, flagged with whether a
    /// session is open.
    pub fn discovered_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = self.discovery.devices();
        let table = self.sessions.lock().unwrap();
        for device in &mut devices {
            device.is_connected = table
                .get(&device.device_id)
                .is_some_and(|s| s.is_connected());
        }
        devices
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn sync(&self) -> &IndexSyncManager {
        &self.sync
    }

    pub fn transfers(&self) -> &FileTransferManager {
        &self.transfers
    }

    // ── Sync and transfer passthroughs ──────────────────────────────────────

    /// Start a sync round with a connected device.
    pub async fn request_sync(&self, device_id: &str, full_sync: bool) -> Result<()> {
        let session = self.session(device_id)?;
        self.sync.request_sync(&session, full_sync).await
    }

    /// Fetch a file body from a connected device, or return the cached copy
    /// without touching the network.
    pub async fn request_file(
        &self,
        device_id: &str,
        file_id: i64,
        file_name: &str,
        expected_size: i64,
        checksum: Option<&str>,
    ) -> Result<FileRequestOutcome> {
        if let Some(path) = self
            .transfers
            .cached_path_matching(device_id, file_id, checksum)
        {
            return Ok(FileRequestOutcome::Cached(path));
        }
        let session = self.session(device_id)?;
        self.transfers
            .request_file(&session, file_id, file_name, expected_size, checksum)
            .await
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn session(&self, device_id: &str) -> Result<Arc<PeerSession>> {
        let table = self.sessions.lock().unwrap();
        table
            .get(device_id)
            .filter(|s| s.is_connected())
            .cloned()
            .ok_or_else(|| {
                VaultError::Network(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("not connected to {}", device_id),
                ))
            })
    }

    fn local_device(&self, port: u16) -> DeviceInfo {
        DeviceInfo {
            device_id: self.secrets.device_id().to_string(),
            device_name: self.secrets.device_name().to_string(),
            device_type: self.secrets.device_type(),
            ip_address: String::new(),
            service_port: port,
            last_seen_at: epoch_secs(),
            is_online: true,
            is_connected: false,
        }
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Forward internal events to the caller on a dedicated task, so no
    /// component ever delivers to the caller from inside a lock.
    fn spawn_emit_task(&self) {
        let Some(mut events_rx) = self.events_rx.lock().unwrap().take() else {
            return;
        };
        let Some(external_tx) = self.external_tx.lock().unwrap().take() else {
            return;
        };
        // Not tracked in `tasks`: it drains remaining events after stop and
        // ends when the manager is dropped.
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if external_tx.send(event).is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_accept_task(self: &Arc<Self>, listener: TcpListener) {
        let secrets = self.secrets.clone();
        let config = self.config.clone();
        let session_tx = self.session_tx.lock().unwrap().clone();
        let sessions = self.sessions.clone();
        let events_tx = self.events_tx.clone();
        let local_id = self.secrets.device_id().to_string();

        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(addr = %addr, "inbound connection");
                let secrets = secrets.clone();
                let config = config.clone();
                let session_tx = session_tx.clone();
                let sessions = sessions.clone();
                let events_tx = events_tx.clone();
                let local_id = local_id.clone();

                tokio::spawn(async move {
                    let session =
                        match PeerSession::accept(stream, &secrets, &config, session_tx).await {
                            Ok(session) => session,
                            Err(e) => {
                                warn!(addr = %addr, error = %e, "inbound handshake failed");
                                return;
                            }
                        };
                    let peer_id = session.device_id().to_string();

                    // Duplicate sessions for one identity: the connection
                    // initiated by the smaller device id survives, so both
                    // ends converge. This inbound one was initiated by the
                    // peer.
                    let (kept, to_close) = {
                        let mut table = sessions.lock().unwrap();
                        let existing_live =
                            table.get(&peer_id).is_some_and(|s| s.is_connected());
                        if !existing_live || peer_id.as_str() < local_id.as_str() {
                            let old = table.insert(peer_id.clone(), session.clone());
                            (true, old)
                        } else {
                            (false, Some(session.clone()))
                        }
                    };
                    if let Some(old) = to_close {
                        old.close().await;
                    }
                    if kept {
                        session.start_receiver();
                        let _ = events_tx.send(NetworkEvent::DeviceConnected(session.peer_info()));
                    } else {
                        debug!(device_id = %peer_id, "duplicate inbound session closed");
                    }
                });
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_dispatch_task(&self, mut session_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let sessions = self.sessions.clone();
        let sync = self.sync.clone();
        let transfers = self.transfers.clone();
        let events_tx = self.events_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                match event {
                    SessionEvent::Frame { device_id, frame } => {
                        route_frame(&sessions, &sync, &transfers, device_id, frame);
                    }
                    SessionEvent::Closed { device_id } => {
                        // A replacement session may already own the slot;
                        // only remove the entry if it is the dead one.
                        let removed = {
                            let mut table = sessions.lock().unwrap();
                            let dead = table
                                .get(&device_id)
                                .is_some_and(|s| !s.is_connected());
                            if dead {
                                table.remove(&device_id)
                            } else {
                                None
                            }
                        };
                        if let Some(session) = removed {
                            transfers.cancel_all_for(&device_id);
                            let _ = events_tx
                                .send(NetworkEvent::DeviceDisconnected(session.peer_info()));
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    fn spawn_discovery_task(&self, mut discovery_rx: mpsc::UnboundedReceiver<DiscoveryEvent>) {
        let sessions = self.sessions.clone();
        let transfers = self.transfers.clone();
        let events_tx = self.events_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = discovery_rx.recv().await {
                match event {
                    // No auto-connect on discovery; the caller decides.
                    DiscoveryEvent::Found(device) | DiscoveryEvent::Updated(device) => {
                        let _ = events_tx.send(NetworkEvent::DeviceDiscovered(device));
                    }
                    DiscoveryEvent::Lost(device) => {
                        let session = sessions.lock().unwrap().remove(&device.device_id);
                        if let Some(session) = session {
                            session.close().await;
                        }
                        transfers.cancel_all_for(&device.device_id);
                        let _ = events_tx.send(NetworkEvent::DeviceLost(device));
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }
}

fn route_frame(
    sessions: &Arc<Mutex<HashMap<String, Arc<PeerSession>>>>,
    sync: &Arc<IndexSyncManager>,
    transfers: &Arc<FileTransferManager>,
    device_id: String,
    frame: protocol::Frame,
) {
    let session_for = |id: &str| -> Option<Arc<PeerSession>> {
        sessions.lock().unwrap().get(id).cloned()
    };
    match frame.msg_type {
        MessageType::IndexSyncRequest => {
            if let Some(session) = session_for(&device_id) {
                let sync = sync.clone();
                tokio::spawn(async move {
                    sync.handle_sync_request(session, frame).await;
                });
            }
        }
        MessageType::IndexDelta => {
            sync.handle_index_delta(&device_id, &frame);
        }
        MessageType::FileRequest => {
            if let Some(session) = session_for(&device_id) {
                let transfers = transfers.clone();
                tokio::spawn(async move {
                    transfers.handle_file_request(session, frame).await;
                });
            }
        }
        MessageType::FileChunk => {
            transfers.handle_file_chunk(&device_id, &frame);
        }
        other => {
            debug!(device_id = %device_id, msg_type = ?other, "unroutable frame ignored");
        }
    }
}
