//! On-demand chunked file transfer with an on-disk cache.
//!
//! Requested bodies are streamed into `<cacheRoot>/<peerDeviceId>/<fileId><ext>`
//! in strict offset order. A file that already sits at that location (and
//! matches the declared checksum, when one is given) satisfies the request
//! without any wire traffic. Serving goes through a resolver callback so the
//! catalog decides what a file id maps to and whether the peer may have it.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::types::epoch_secs;

use super::protocol::{
    FileChunkPayload, FileNotFoundPayload, FileRequestPayload, FileResponsePayload, Frame,
    MessageType,
};
use super::session::PeerSession;
use super::NetworkEvent;

/// Minimum gap between progress events for one transfer. The first chunk
/// and the final chunk always emit.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);

/// Lifecycle of one transfer. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

/// Caller-visible snapshot of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub request_id: String,
    pub device_id: String,
    pub file_id: i64,
    pub file_name: String,
    pub total_size: i64,
    pub transferred_size: i64,
    pub status: TransferStatus,
    pub error: Option<String>,
    pub local_path: Option<PathBuf>,
}

impl TransferProgress {
    pub fn progress(&self) -> f64 {
        if self.total_size > 0 {
            self.transferred_size as f64 / self.total_size as f64
        } else {
            0.0
        }
    }
}

struct TransferDescriptor {
    device_id: String,
    file_id: i64,
    file_name: String,
    expected_size: i64,
    checksum: Option<String>,
    cache_path: PathBuf,
    writer: Option<std::fs::File>,
    status: TransferStatus,
    total_size: i64,
    transferred_size: i64,
    chunks_expected: u32,
    chunks_received: u32,
    error: Option<String>,
    local_path: Option<PathBuf>,
    started_at: i64,
    last_progress_emit: Option<Instant>,
}

impl TransferDescriptor {
    fn snapshot(&self, request_id: Uuid) -> TransferProgress {
        TransferProgress {
            request_id: request_id.to_string(),
            device_id: self.device_id.clone(),
            file_id: self.file_id,
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            transferred_size: self.transferred_size,
            status: self.status,
            error: self.error.clone(),
            local_path: self.local_path.clone(),
        }
    }

    /// Terminal transition with partial-file cleanup. No-op once terminal.
    fn abort(&mut self, status: TransferStatus, reason: &str) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = Some(reason.to_string());
        self.writer = None;
        let _ = std::fs::remove_file(&self.cache_path);
        true
    }
}

/// How the catalog answers a file id lookup for a peer request.
pub enum ResolvedFile {
    /// Absolute path of a servable file.
    Path(PathBuf),
    /// Unknown id.
    NotFound,
    /// Known id but not family-visible. The peer only ever learns
    /// "not found".
    Denied,
}

pub type FileResolver = Arc<dyn Fn(i64) -> ResolvedFile + Send + Sync>;

/// Result of `request_file`.
#[derive(Debug)]
pub enum FileRequestOutcome {
    /// Already present in the cache; no frames were sent.
    Cached(PathBuf),
    /// Transfer registered under this request id.
    Transfer(Uuid),
}

/// Chunked request/response engine plus the cache discipline.
pub struct FileTransferManager {
    cache_root: PathBuf,
    chunk_size: usize,
    request_timeout: Duration,
    resolver: FileResolver,
    transfers: Mutex<HashMap<Uuid, TransferDescriptor>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

impl FileTransferManager {
    pub(crate) fn new(
        cache_root: PathBuf,
        chunk_size: usize,
        request_timeout: Duration,
        resolver: FileResolver,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Self {
        Self {
            cache_root,
            chunk_size,
            request_timeout,
            resolver,
            transfers: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Fetch a file from a peer into the cache, or return the cached copy.
    pub async fn request_file(
        &self,
        session: &Arc<PeerSession>,
        file_id: i64,
        file_name: &str,
        expected_size: i64,
        checksum: Option<&str>,
    ) -> Result<FileRequestOutcome> {
        let peer = session.device_id().to_string();
        if let Some(path) = self.cached_path_matching(&peer, file_id, checksum) {
            info!(device_id = %peer, file_id, path = %path.display(), "file served from cache");
            return Ok(FileRequestOutcome::Cached(path));
        }

        let cache_path = self.cache_path_for(&peer, file_id, file_name);
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = open_cache_writer(&cache_path)?;

        let request_id = Uuid::new_v4();
        {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.insert(
                request_id,
                TransferDescriptor {
                    device_id: peer.clone(),
                    file_id,
                    file_name: file_name.to_string(),
                    expected_size,
                    checksum: checksum.map(|c| c.to_string()),
                    cache_path: cache_path.clone(),
                    writer: Some(writer),
                    status: TransferStatus::Pending,
                    total_size: 0,
                    transferred_size: 0,
                    chunks_expected: 0,
                    chunks_received: 0,
                    error: None,
                    local_path: None,
                    started_at: epoch_secs(),
                    last_progress_emit: None,
                },
            );
        }
        info!(device_id = %peer, file_id, file_name, "requesting file");

        let request = Frame::reply(
            MessageType::FileRequest,
            request_id,
            &FileRequestPayload {
                file_id,
                file_name: file_name.to_string(),
                expected_size,
                checksum: checksum.map(|c| c.to_string()),
            },
        )?;
        let reply = match session.request(request, self.request_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_transfer(request_id, TransferStatus::Failed, &e.to_string());
                return Err(e);
            }
        };

        match reply.msg_type {
            MessageType::FileResponse => {
                let payload: FileResponsePayload = reply.payload_json()?;
                if expected_size > 0 && payload.total_size != expected_size {
                    let reason = format!(
                        "size mismatch: expected {}, peer reports {}",
                        expected_size, payload.total_size
                    );
                    self.fail_transfer(request_id, TransferStatus::Failed, &reason);
                    return Err(VaultError::ProtocolDecode(reason));
                }
                let chunk = if payload.chunk_size > 0 {
                    payload.chunk_size as u64
                } else {
                    self.chunk_size as u64
                };
                let mut transfers = self.transfers.lock().unwrap();
                if let Some(desc) = transfers.get_mut(&request_id) {
                    if !desc.status.is_terminal() {
                        desc.status = TransferStatus::InProgress;
                        desc.total_size = payload.total_size;
                        desc.chunks_expected =
                            (payload.total_size as u64).div_ceil(chunk.max(1)) as u32;
                    }
                }
                Ok(FileRequestOutcome::Transfer(request_id))
            }
            MessageType::FileNotFound => {
                let reason = reply
                    .payload_json::<FileNotFoundPayload>()
                    .map(|p| p.reason)
                    .unwrap_or_else(|_| "not found".to_string());
                self.fail_transfer(request_id, TransferStatus::Failed, &reason);
                Err(VaultError::NotFound(reason))
            }
            other => {
                let reason = format!("unexpected reply {:?} to file request", other);
                self.fail_transfer(request_id, TransferStatus::Failed, &reason);
                Err(VaultError::ProtocolDecode(reason))
            }
        }
    }

    /// Responder side: resolve the id, then stream the body in order.
    pub(crate) async fn handle_file_request(&self, session: Arc<PeerSession>, request: Frame) {
        let peer = session.device_id().to_string();
        let payload: FileRequestPayload = match request.payload_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id = %peer, error = %e, "invalid file request");
                return;
            }
        };
        let file_id = payload.file_id;

        let path = match (self.resolver)(file_id) {
            ResolvedFile::Path(path) => path,
            ResolvedFile::NotFound => {
                debug!(device_id = %peer, file_id, "file request for unknown id");
                self.send_not_found(&session, request.request_id).await;
                return;
            }
            ResolvedFile::Denied => {
                warn!(
                    device_id = %peer,
                    file_id,
                    "security: peer requested a file that is not family-visible"
                );
                self.send_not_found(&session, request.request_id).await;
                return;
            }
        };

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                warn!(device_id = %peer, file_id, error = %e, "failed to open requested file");
                self.send_not_found(&session, request.request_id).await;
                return;
            }
        };
        let total_size = match file.metadata().await {
            Ok(m) => m.len() as i64,
            Err(e) => {
                warn!(device_id = %peer, file_id, error = %e, "failed to stat requested file");
                self.send_not_found(&session, request.request_id).await;
                return;
            }
        };

        let response = match Frame::reply(
            MessageType::FileResponse,
            request.request_id,
            &FileResponsePayload {
                total_size,
                chunk_size: self.chunk_size as i64,
            },
        ) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to encode file response");
                return;
            }
        };
        if session.send(response).await.is_err() {
            return;
        }
        info!(device_id = %peer, file_id, total_size, "serving file");

        let mut offset: i64 = 0;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(device_id = %peer, file_id, error = %e, "read failed mid-stream");
                    return;
                }
            };
            let chunk = FileChunkPayload {
                request_id: request.request_id.to_string(),
                offset,
                total_size,
                data: FileChunkPayload::encode_data(&buf[..n]),
            };
            let frame = match Frame::reply(MessageType::FileChunk, request.request_id, &chunk) {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "failed to encode file chunk");
                    return;
                }
            };
            if session.send(frame).await.is_err() {
                debug!(device_id = %peer, file_id, offset, "session closed mid-stream");
                return;
            }
            offset += n as i64;
        }
        debug!(device_id = %peer, file_id, bytes = offset, "file served");
    }

    /// Receiving side: write one chunk, enforcing strict offset order.
    /// Events are collected under the lock and emitted after it is released.
    pub(crate) fn handle_file_chunk(&self, peer_device_id: &str, frame: &Frame) {
        let payload: FileChunkPayload = match frame.payload_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id = %peer_device_id, error = %e, "invalid file chunk");
                return;
            }
        };
        let events = {
            let mut transfers = self.transfers.lock().unwrap();
            self.apply_chunk(&mut transfers, peer_device_id, frame.request_id, payload)
        };
        self.emit_all(events);
    }

    fn apply_chunk(
        &self,
        transfers: &mut HashMap<Uuid, TransferDescriptor>,
        peer_device_id: &str,
        request_id: Uuid,
        payload: FileChunkPayload,
    ) -> Vec<NetworkEvent> {
        let mut events: Vec<NetworkEvent> = Vec::new();
        let Some(desc) = transfers.get_mut(&request_id) else {
            trace!(device_id = %peer_device_id, "chunk for unknown transfer");
            return events;
        };
        if desc.status.is_terminal() {
            return events;
        }
        if desc.device_id != peer_device_id {
            warn!(device_id = %peer_device_id, "chunk from a device that does not own the transfer");
            return events;
        }

        let data = match payload.decode_data() {
            Ok(d) => d,
            Err(e) => {
                if desc.abort(TransferStatus::Failed, &e.to_string()) {
                    events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
                }
                return events;
            }
        };

        if desc.total_size == 0 {
            desc.total_size = payload.total_size;
            desc.chunks_expected =
                (payload.total_size as u64).div_ceil(self.chunk_size.max(1) as u64) as u32;
        }
        if desc.expected_size > 0 && desc.total_size != desc.expected_size {
            let reason = format!(
                "size mismatch: expected {}, peer reports {}",
                desc.expected_size, desc.total_size
            );
            if desc.abort(TransferStatus::Failed, &reason) {
                events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
            }
            return events;
        }
        if desc.status == TransferStatus::Pending {
            desc.status = TransferStatus::InProgress;
        }

        if payload.offset != desc.transferred_size {
            let reason = format!(
                "chunk out of order: offset {}, expected {}",
                payload.offset, desc.transferred_size
            );
            if desc.abort(TransferStatus::Failed, &reason) {
                events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
            }
            return events;
        }
        if desc.transferred_size + data.len() as i64 > desc.total_size {
            let reason = format!(
                "chunk overruns declared size {} at offset {}",
                desc.total_size, payload.offset
            );
            if desc.abort(TransferStatus::Failed, &reason) {
                events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
            }
            return events;
        }

        let write_result = match desc.writer.as_mut() {
            Some(writer) => writer.write_all(&data),
            None => Err(std::io::Error::other("transfer writer missing")),
        };
        if let Err(e) = write_result {
            if desc.abort(TransferStatus::Failed, &format!("write failed: {}", e)) {
                events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
            }
            return events;
        }

        desc.transferred_size += data.len() as i64;
        desc.chunks_received += 1;

        let finished = desc.transferred_size == desc.total_size;
        let first = desc.chunks_received == 1;
        let due = desc
            .last_progress_emit
            .map(|t| t.elapsed() >= PROGRESS_EMIT_INTERVAL)
            .unwrap_or(true);
        if first || finished || due {
            desc.last_progress_emit = Some(Instant::now());
            events.push(NetworkEvent::FileTransferProgress(desc.snapshot(request_id)));
        }

        if finished {
            // Close the writer before verifying the bytes on disk.
            if let Some(writer) = desc.writer.take() {
                let _ = writer.sync_all();
            }
            if let Some(expected) = desc.checksum.clone() {
                match sha256_hex(&desc.cache_path) {
                    Ok(actual) if actual.eq_ignore_ascii_case(&expected) => {}
                    Ok(actual) => {
                        let reason =
                            format!("checksum mismatch: expected {}, got {}", expected, actual);
                        if desc.abort(TransferStatus::Failed, &reason) {
                            events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
                        }
                        return events;
                    }
                    Err(e) => {
                        if desc.abort(TransferStatus::Failed, &e.to_string()) {
                            events.push(NetworkEvent::FileTransferError(desc.snapshot(request_id)));
                        }
                        return events;
                    }
                }
            }
            desc.status = TransferStatus::Completed;
            desc.local_path = Some(desc.cache_path.clone());
            info!(
                device_id = %desc.device_id,
                file_id = desc.file_id,
                bytes = desc.total_size,
                chunks = desc.chunks_received,
                chunks_expected = desc.chunks_expected,
                secs = epoch_secs() - desc.started_at,
                "file transfer complete"
            );
            events.push(NetworkEvent::FileTransferComplete(desc.snapshot(request_id)));
        }
        events
    }

    async fn send_not_found(&self, session: &Arc<PeerSession>, request_id: Uuid) {
        if let Ok(frame) = Frame::reply(
            MessageType::FileNotFound,
            request_id,
            &FileNotFoundPayload {
                reason: "not found".to_string(),
            },
        ) {
            let _ = session.send(frame).await;
        }
    }

    fn emit_all(&self, events: Vec<NetworkEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    fn fail_transfer(&self, request_id: Uuid, status: TransferStatus, reason: &str) {
        let event = {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.get_mut(&request_id).and_then(|desc| {
                desc.abort(status, reason)
                    .then(|| NetworkEvent::FileTransferError(desc.snapshot(request_id)))
            })
        };
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    /// Cancel one transfer: terminal `Cancelled`, partial file deleted.
    pub fn cancel_request(&self, request_id: Uuid) {
        self.fail_transfer(request_id, TransferStatus::Cancelled, "cancelled");
    }

    /// Cancel every active transfer with one device.
    pub fn cancel_all_for(&self, device_id: &str) {
        let ids: Vec<Uuid> = {
            let transfers = self.transfers.lock().unwrap();
            transfers
                .iter()
                .filter(|(_, d)| d.device_id == device_id && d.status.is_active())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel_request(id);
        }
    }

    /// Cancel every active transfer, regardless of device.
    pub fn cancel_all(&self) {
        let ids: Vec<Uuid> = {
            let transfers = self.transfers.lock().unwrap();
            transfers
                .iter()
                .filter(|(_, d)| d.status.is_active())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.cancel_request(id);
        }
    }

    pub fn progress(&self, request_id: Uuid) -> Option<TransferProgress> {
        let transfers = self.transfers.lock().unwrap();
        transfers.get(&request_id).map(|d| d.snapshot(request_id))
    }

    pub fn active_transfers(&self) -> Vec<TransferProgress> {
        let transfers = self.transfers.lock().unwrap();
        transfers
            .iter()
            .filter(|(_, d)| d.status.is_active())
            .map(|(id, d)| d.snapshot(*id))
            .collect()
    }

    pub fn has_active_transfers(&self) -> bool {
        let transfers = self.transfers.lock().unwrap();
        transfers.values().any(|d| d.status.is_active())
    }

    // ── Cache discipline ────────────────────────────────────────────────────

    fn cache_path_for(&self, device_id: &str, file_id: i64, file_name: &str) -> PathBuf {
        let mut name = file_id.to_string();
        if let Some(ext) = Path::new(file_name).extension().and_then(|e| e.to_str()) {
            name.push('.');
            name.push_str(ext);
        }
        self.cache_root.join(device_id).join(name)
    }

    /// First cache entry whose stem is the file id, any or no extension.
    pub fn cached_path(&self, device_id: &str, file_id: i64) -> Option<PathBuf> {
        let dir = self.cache_root.join(device_id);
        let wanted = file_id.to_string();
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem == wanted)
            {
                return Some(path);
            }
        }
        None
    }

    pub fn is_cached(&self, device_id: &str, file_id: i64, checksum: Option<&str>) -> bool {
        self.cached_path_matching(device_id, file_id, checksum)
            .is_some()
    }

    pub(crate) fn cached_path_matching(
        &self,
        device_id: &str,
        file_id: i64,
        checksum: Option<&str>,
    ) -> Option<PathBuf> {
        let path = self.cached_path(device_id, file_id)?;
        if let Some(expected) = checksum {
            if !expected.is_empty() {
                match sha256_hex(&path) {
                    Ok(actual) if actual.eq_ignore_ascii_case(expected) => {}
                    _ => return None,
                }
            }
        }
        Some(path)
    }

    /// Delete the whole cache. Refused while any transfer is active.
    pub fn clear_cache(&self) -> Result<()> {
        if self.has_active_transfers() {
            return Err(VaultError::InvalidArgument(
                "cannot clear cache while transfers are active".to_string(),
            ));
        }
        match std::fs::remove_dir_all(&self.cache_root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn cache_size(&self) -> u64 {
        dir_size(&self.cache_root)
    }
}

fn open_cache_writer(path: &Path) -> Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    Ok(options.open(path)?)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_hex(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = hasher.finalize();
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}
