//! Catalog index synchronization between paired devices.
//!
//! The initiator asks a peer for everything that changed since its cursor;
//! the responder answers with a count and then streams one delta frame per
//! record, batched with a short pause so a slow receiver can keep up. The
//! cursor only advances once the last expected delta has been materialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::CatalogStore;
use crate::error::{Result, VaultError};
use crate::types::{epoch_secs, CatalogRecord, RemoteFileRecord, Visibility};

use super::protocol::{
    DeltaPayload, Frame, IndexSyncRequestPayload, IndexSyncResponsePayload, MessageType,
};
use super::session::PeerSession;
use super::NetworkEvent;

/// Progress of one sync round with a peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub device_id: String,
    pub total_files: i64,
    pub received_files: i64,
    pub is_complete: bool,
    pub error: Option<String>,
}

impl SyncProgress {
    pub fn progress(&self) -> f64 {
        if self.total_files > 0 {
            self.received_files as f64 / self.total_files as f64
        } else {
            0.0
        }
    }
}

struct SyncRound {
    progress: SyncProgress,
    /// Becomes the cursor when the round completes; monotonic with respect
    /// to prior cursors.
    started_at: i64,
}

/// Delta request/response engine plus the remote-catalog read surface.
pub struct IndexSyncManager {
    store: Arc<dyn CatalogStore>,
    local_device_id: String,
    batch_size: usize,
    batch_pause: Duration,
    request_timeout: Duration,
    rounds: Mutex<HashMap<String, SyncRound>>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

impl IndexSyncManager {
    pub(crate) fn new(
        store: Arc<dyn CatalogStore>,
        local_device_id: String,
        batch_size: usize,
        batch_pause: Duration,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<NetworkEvent>,
    ) -> Result<Self> {
        store.create_tables_if_missing()?;
        Ok(Self {
            store,
            local_device_id,
            batch_size,
            batch_pause,
            request_timeout,
            rounds: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Start a sync round with a connected peer. Resolves once the peer has
    /// answered with the expected delta count; the deltas themselves arrive
    /// through the message dispatch.
    pub async fn request_sync(&self, session: &Arc<PeerSession>, full_sync: bool) -> Result<()> {
        let peer = session.device_id().to_string();
        let since = if full_sync {
            0
        } else {
            self.store.sync_cursor(&peer)?
        };
        let started_at = epoch_secs();
        {
            let mut rounds = self.rounds.lock().unwrap();
            rounds.insert(
                peer.clone(),
                SyncRound {
                    progress: SyncProgress {
                        device_id: peer.clone(),
                        total_files: 0,
                        received_files: 0,
                        is_complete: false,
                        error: None,
                    },
                    started_at,
                },
            );
        }
        info!(device_id = %peer, since, full_sync, "requesting index sync");

        let request = Frame::request(
            MessageType::IndexSyncRequest,
            &IndexSyncRequestPayload {
                since_timestamp: since,
            },
        )?;
        let reply = match session.request(request, self.request_timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_round(&peer, &e.to_string());
                return Err(e);
            }
        };
        if reply.msg_type != MessageType::IndexSyncResponse {
            let e = VaultError::ProtocolDecode(format!(
                "expected sync response, got {:?}",
                reply.msg_type
            ));
            self.fail_round(&peer, &e.to_string());
            return Err(e);
        }
        let payload: IndexSyncResponsePayload = reply.payload_json()?;

        // Deltas race with this response through the dispatch task, so the
        // round may already have received everything by the time the total
        // is known.
        let mut completed: Option<(i64, i64)> = None;
        let snapshot = {
            let mut rounds = self.rounds.lock().unwrap();
            match rounds.get_mut(&peer) {
                Some(round) => {
                    round.progress.total_files = payload.total_files;
                    if !round.progress.is_complete
                        && round.progress.received_files >= payload.total_files
                    {
                        round.progress.is_complete = true;
                        completed = Some((round.started_at, round.progress.received_files));
                    }
                    Some(round.progress.clone())
                }
                None => None,
            }
        };
        if let Some(progress) = snapshot {
            info!(device_id = %peer, total = progress.total_files, "sync round sized");
            let _ = self.events.send(NetworkEvent::SyncProgress(progress));
        }
        if let Some((round_start, received)) = completed {
            self.store.set_sync_cursor(&peer, round_start)?;
            info!(device_id = %peer, received, "index sync complete");
            let _ = self.events.send(NetworkEvent::SyncComplete {
                device_id: peer,
                files_received: received,
            });
        }
        Ok(())
    }

    /// Responder side: count the matching records, answer with the total,
    /// then stream the deltas. Stops quietly if the session goes away.
    pub(crate) async fn handle_sync_request(&self, session: Arc<PeerSession>, request: Frame) {
        let peer = session.device_id().to_string();
        let payload: IndexSyncRequestPayload = match request.payload_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id = %peer, error = %e, "invalid sync request");
                return;
            }
        };
        let since = payload.since_timestamp;
        let total = match self.store.count_family_changes_since(since) {
            Ok(n) => n,
            Err(e) => {
                warn!(device_id = %peer, error = %e, "counting catalog changes failed");
                return;
            }
        };
        info!(device_id = %peer, since, total, "serving index sync");

        let response = match Frame::reply(
            MessageType::IndexSyncResponse,
            request.request_id,
            &IndexSyncResponsePayload { total_files: total },
        ) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "failed to encode sync response");
                return;
            }
        };
        if session.send(response).await.is_err() {
            return;
        }

        let mut sent: i64 = 0;
        let mut offset = 0usize;
        while sent < total {
            let batch = match self.store.family_changes_since(since, self.batch_size, offset) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(device_id = %peer, error = %e, "reading catalog changes failed");
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            offset += batch.len();
            for record in &batch {
                if record.visibility != Visibility::Family || record.is_remote {
                    continue;
                }
                let delta = match Frame::reply(
                    MessageType::IndexDelta,
                    request.request_id,
                    &delta_from_record(record, &self.local_device_id),
                ) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "failed to encode delta");
                        continue;
                    }
                };
                if session.send(delta).await.is_err() {
                    debug!(device_id = %peer, sent, "session closed mid-stream");
                    return;
                }
                sent += 1;
            }
            if sent < total {
                tokio::time::sleep(self.batch_pause).await;
            }
        }
        info!(device_id = %peer, sent, "index sync served");
    }

    /// Initiator side: materialize one received delta. The source device id
    /// is always the session's authenticated identity, whatever the payload
    /// claims.
    pub(crate) fn handle_index_delta(&self, peer_device_id: &str, frame: &Frame) {
        let payload: DeltaPayload = match frame.payload_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(device_id = %peer_device_id, error = %e, "invalid index delta");
                return;
            }
        };
        if payload.device_id == self.local_device_id {
            debug!(device_id = %peer_device_id, "discarding delta that claims the local identity");
            return;
        }
        let now = epoch_secs();
        let record = RemoteFileRecord {
            local_id: 0,
            remote_id: payload.id,
            source_device_id: peer_device_id.to_string(),
            path: payload.path,
            name: payload.name,
            mime_type: payload.mime_type,
            size: payload.size,
            modified_at: payload.modified_at,
            checksum: payload.checksum,
            synced_at: now,
            is_deleted: payload.is_deleted,
        };
        let stored = if record.is_deleted {
            match self.store.mark_remote_deleted(peer_device_id, record.remote_id, now) {
                Ok(()) => true,
                Err(VaultError::NotFound(_)) => true,
                Err(e) => {
                    warn!(device_id = %peer_device_id, error = %e, "marking remote record deleted failed");
                    false
                }
            }
        } else {
            match self.store.upsert_remote(&record) {
                Ok(()) => true,
                Err(e) => {
                    warn!(device_id = %peer_device_id, error = %e, "storing remote record failed");
                    false
                }
            }
        };
        if !stored {
            return;
        }

        let mut completed: Option<(i64, i64)> = None;
        let progress = {
            let mut rounds = self.rounds.lock().unwrap();
            match rounds.get_mut(peer_device_id) {
                Some(round) => {
                    round.progress.received_files += 1;
                    if !round.progress.is_complete
                        && round.progress.total_files > 0
                        && round.progress.received_files >= round.progress.total_files
                    {
                        round.progress.is_complete = true;
                        completed = Some((round.started_at, round.progress.received_files));
                    }
                    Some(round.progress.clone())
                }
                None => {
                    debug!(device_id = %peer_device_id, "delta outside any sync round");
                    None
                }
            }
        };
        if let Some(progress) = progress {
            let _ = self.events.send(NetworkEvent::SyncProgress(progress));
        }
        if let Some((started_at, received)) = completed {
            if let Err(e) = self.store.set_sync_cursor(peer_device_id, started_at) {
                warn!(device_id = %peer_device_id, error = %e, "storing sync cursor failed");
            }
            info!(device_id = %peer_device_id, received, "index sync complete");
            let _ = self.events.send(NetworkEvent::SyncComplete {
                device_id: peer_device_id.to_string(),
                files_received: received,
            });
        }
    }

    fn fail_round(&self, peer: &str, message: &str) {
        let mut rounds = self.rounds.lock().unwrap();
        if let Some(round) = rounds.get_mut(peer) {
            round.progress.is_complete = true;
            round.progress.error = Some(message.to_string());
        }
        drop(rounds);
        let _ = self.events.send(NetworkEvent::Error {
            message: format!("sync with {} failed: {}", peer, message),
        });
    }

    // ── Progress and remote-catalog queries ─────────────────────────────────

    pub fn sync_progress(&self, device_id: &str) -> Option<SyncProgress> {
        let rounds = self.rounds.lock().unwrap();
        rounds.get(device_id).map(|r| r.progress.clone())
    }

    pub fn is_syncing(&self) -> bool {
        let rounds = self.rounds.lock().unwrap();
        rounds.values().any(|r| !r.progress.is_complete)
    }

    pub fn is_syncing_with(&self, device_id: &str) -> bool {
        let rounds = self.rounds.lock().unwrap();
        rounds
            .get(device_id)
            .is_some_and(|r| !r.progress.is_complete)
    }

    pub fn last_sync_at(&self, device_id: &str) -> Result<i64> {
        self.store.sync_cursor(device_id)
    }

    pub fn remote_files_from(&self, device_id: &str) -> Result<Vec<RemoteFileRecord>> {
        self.store.remote_files_from(device_id)
    }

    pub fn all_remote_files(&self) -> Result<Vec<RemoteFileRecord>> {
        self.store.all_remote_files()
    }

    pub fn search_remote_files(&self, query: &str, limit: usize) -> Result<Vec<RemoteFileRecord>> {
        self.store.search_remote_files(query, limit)
    }

    pub fn remote_file_count(&self) -> Result<i64> {
        self.store.remote_file_count()
    }

    pub fn remote_file_count_from(&self, device_id: &str) -> Result<i64> {
        self.store.remote_file_count_from(device_id)
    }
}

fn delta_from_record(record: &CatalogRecord, local_device_id: &str) -> DeltaPayload {
    DeltaPayload {
        id: record.id,
        path: record.relative_path.clone(),
        name: record.name.clone(),
        mime_type: record.mime_type.clone(),
        size: record.size,
        modified_at: record.modified_at,
        checksum: record.checksum.clone().unwrap_or_default(),
        device_id: local_device_id.to_string(),
        sync_version: record.sync_version,
        is_deleted: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::net::session::tests::{secrets, session_pair, test_config};
    use crate::net::session::SessionEvent;
    use tokio::time::timeout;

    fn family_record(id: i64, name: &str, indexed_at: i64) -> CatalogRecord {
        CatalogRecord {
            id,
            relative_path: format!("a/{}", name),
            name: name.to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 10,
            modified_at: indexed_at,
            checksum: Some(format!("cks-{}", id)),
            visibility: Visibility::Family,
            source_device_id: None,
            is_remote: false,
            sync_version: 1,
            indexed_at,
        }
    }

    struct SyncFixture {
        initiator: Arc<IndexSyncManager>,
        initiator_store: Arc<MemoryCatalog>,
        initiator_session: Arc<crate::net::session::PeerSession>,
        initiator_events: mpsc::UnboundedReceiver<NetworkEvent>,
        responder_id: String,
    }

    /// Wire two sync managers over a real session pair, with minimal
    /// dispatch loops standing in for the coordinator.
    async fn sync_fixture(responder_store: Arc<MemoryCatalog>) -> SyncFixture {
        let config = test_config();
        let i_secrets = secrets("Initiator", [42u8; 32]);
        let r_secrets = secrets("Responder", [42u8; 32]);
        let responder_id = r_secrets.device_id().to_string();
        let (i_session, mut i_rx, r_session, mut r_rx) =
            session_pair(&i_secrets, &r_secrets, &config).await;

        let (i_events_tx, i_events_rx) = mpsc::unbounded_channel();
        let (r_events_tx, _r_events_rx) = mpsc::unbounded_channel();

        let initiator_store = Arc::new(MemoryCatalog::new());
        let initiator = Arc::new(
            IndexSyncManager::new(
                initiator_store.clone(),
                i_secrets.device_id().to_string(),
                config.sync_batch_size,
                config.sync_batch_pause,
                config.request_timeout,
                i_events_tx,
            )
            .unwrap(),
        );
        let responder = Arc::new(
            IndexSyncManager::new(
                responder_store,
                r_secrets.device_id().to_string(),
                config.sync_batch_size,
                config.sync_batch_pause,
                config.request_timeout,
                r_events_tx,
            )
            .unwrap(),
        );

        // Responder dispatch: serve sync requests.
        let responder_session = r_session.clone();
        tokio::spawn(async move {
            while let Some(event) = r_rx.recv().await {
                if let SessionEvent::Frame { frame, .. } = event {
                    if frame.msg_type == MessageType::IndexSyncRequest {
                        let responder = responder.clone();
                        let session = responder_session.clone();
                        tokio::spawn(async move {
                            responder.handle_sync_request(session, frame).await;
                        });
                    }
                }
            }
        });

        // Initiator dispatch: materialize deltas.
        let initiator_for_dispatch = initiator.clone();
        tokio::spawn(async move {
            while let Some(event) = i_rx.recv().await {
                if let SessionEvent::Frame { device_id, frame } = event {
                    if frame.msg_type == MessageType::IndexDelta {
                        initiator_for_dispatch.handle_index_delta(&device_id, &frame);
                    }
                }
            }
        });

        SyncFixture {
            initiator,
            initiator_store,
            initiator_session: i_session,
            initiator_events: i_events_rx,
            responder_id,
        }
    }

    async fn wait_for_complete(
        events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> (String, i64, usize) {
        let mut progress_events = 0usize;
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(NetworkEvent::SyncProgress(_)) => progress_events += 1,
                Some(NetworkEvent::SyncComplete {
                    device_id,
                    files_received,
                }) => return (device_id, files_received, progress_events),
                Some(_) => continue,
                None => panic!("event channel closed before sync completed"),
            }
        }
    }

    #[tokio::test]
    async fn first_sync_materializes_all_family_records() {
        let responder_store = Arc::new(MemoryCatalog::new());
        responder_store.insert_local(family_record(1, "1.jpg", 100));
        responder_store.insert_local(family_record(2, "2.pdf", 101));
        responder_store.insert_local(family_record(3, "3.txt", 102));

        let mut fx = sync_fixture(responder_store).await;
        let before = epoch_secs();
        fx.initiator
            .request_sync(&fx.initiator_session, true)
            .await
            .unwrap();

        let (device_id, files_received, _) = wait_for_complete(&mut fx.initiator_events).await;
        assert_eq!(device_id, fx.responder_id);
        assert_eq!(files_received, 3);

        let remote = fx.initiator_store.remote_files_from(&fx.responder_id).unwrap();
        assert_eq!(remote.len(), 3);
        let ids: Vec<i64> = remote.iter().map(|r| r.remote_id).collect();
        assert!(ids.contains(&1) && ids.contains(&2) && ids.contains(&3));
        for record in &remote {
            assert_eq!(record.source_device_id, fx.responder_id);
        }

        let cursor = fx.initiator_store.sync_cursor(&fx.responder_id).unwrap();
        assert!(cursor >= before);
        assert!(!fx.initiator.is_syncing());
    }

    #[tokio::test]
    async fn private_records_never_leave_the_responder() {
        let responder_store = Arc::new(MemoryCatalog::new());
        responder_store.insert_local(family_record(1, "shared.jpg", 100));
        let mut private = family_record(2, "secret.pdf", 101);
        private.visibility = Visibility::Private;
        responder_store.insert_local(private);

        let mut fx = sync_fixture(responder_store).await;
        fx.initiator
            .request_sync(&fx.initiator_session, true)
            .await
            .unwrap();

        let (_, files_received, _) = wait_for_complete(&mut fx.initiator_events).await;
        assert_eq!(files_received, 1);
        let remote = fx.initiator_store.all_remote_files().unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].name, "shared.jpg");
    }

    #[tokio::test]
    async fn second_sync_with_no_changes_is_empty() {
        let responder_store = Arc::new(MemoryCatalog::new());
        responder_store.insert_local(family_record(1, "1.jpg", 100));
        responder_store.insert_local(family_record(2, "2.pdf", 101));

        let mut fx = sync_fixture(responder_store).await;
        fx.initiator
            .request_sync(&fx.initiator_session, true)
            .await
            .unwrap();
        let (_, first_received, _) = wait_for_complete(&mut fx.initiator_events).await;
        assert_eq!(first_received, 2);

        // Cursor is now ahead of every indexed_at; the next delta sync is a
        // zero-file round that completes immediately.
        fx.initiator
            .request_sync(&fx.initiator_session, false)
            .await
            .unwrap();
        let (_, second_received, _) = wait_for_complete(&mut fx.initiator_events).await;
        assert_eq!(second_received, 0);
        assert_eq!(fx.initiator_store.remote_file_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn delta_source_identity_comes_from_the_session() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryCatalog::new());
        let manager = IndexSyncManager::new(
            store.clone(),
            "device-local".to_string(),
            100,
            Duration::from_millis(10),
            Duration::from_secs(2),
            events_tx,
        )
        .unwrap();

        let delta = DeltaPayload {
            id: 9,
            path: "x/forged.bin".to_string(),
            name: "forged.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            size: 1,
            modified_at: 1,
            checksum: String::new(),
            device_id: "device-forged".to_string(),
            sync_version: 1,
            is_deleted: false,
        };
        let frame = Frame::request(MessageType::IndexDelta, &delta).unwrap();
        manager.handle_index_delta("device-peer", &frame);

        let remote = store.all_remote_files().unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].source_device_id, "device-peer");
    }

    #[tokio::test]
    async fn delta_claiming_local_identity_is_discarded() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryCatalog::new());
        let manager = IndexSyncManager::new(
            store.clone(),
            "device-local".to_string(),
            100,
            Duration::from_millis(10),
            Duration::from_secs(2),
            events_tx,
        )
        .unwrap();

        let delta = DeltaPayload {
            id: 1,
            path: "a/echo.jpg".to_string(),
            name: "echo.jpg".to_string(),
            mime_type: "image/jpeg".to_string(),
            size: 1,
            modified_at: 1,
            checksum: String::new(),
            device_id: "device-local".to_string(),
            sync_version: 1,
            is_deleted: false,
        };
        let frame = Frame::request(MessageType::IndexDelta, &delta).unwrap();
        manager.handle_index_delta("device-peer", &frame);
        assert_eq!(store.remote_file_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn deletion_delta_marks_the_record() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryCatalog::new());
        let manager = IndexSyncManager::new(
            store.clone(),
            "device-local".to_string(),
            100,
            Duration::from_millis(10),
            Duration::from_secs(2),
            events_tx,
        )
        .unwrap();

        let mut delta = DeltaPayload {
            id: 5,
            path: "a/old.png".to_string(),
            name: "old.png".to_string(),
            mime_type: "image/png".to_string(),
            size: 2,
            modified_at: 2,
            checksum: String::new(),
            device_id: "device-peer".to_string(),
            sync_version: 1,
            is_deleted: false,
        };
        let frame = Frame::request(MessageType::IndexDelta, &delta).unwrap();
        manager.handle_index_delta("device-peer", &frame);
        assert_eq!(store.remote_file_count().unwrap(), 1);

        delta.is_deleted = true;
        let frame = Frame::request(MessageType::IndexDelta, &delta).unwrap();
        manager.handle_index_delta("device-peer", &frame);
        assert_eq!(store.remote_file_count().unwrap(), 0);
    }
}
