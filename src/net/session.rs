//! Authenticated, full-duplex peer session over TCP.
//!
//! A session owns the socket, one inbound task, one outbound task, and the
//! map of pending request futures. Frames are sealed with the channel keys
//! derived from the family PSK; the handshake verifies that the identity
//! claimed in the application hello matches the PSK identity from the
//! preamble. Sessions hold no reference to the coordinator; they only push
//! events into its channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{NetworkConfig, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::error::{Result, VaultError};
use crate::pairing::PairingSecrets;
use crate::types::{epoch_secs, ConnectionState, DeviceInfo, DeviceType};

use super::protocol::{
    derive_channel_keys, read_preamble, read_sealed_frame, write_preamble, write_sealed_frame,
    ChannelHello, Frame, HelloPayload, MessageType, SessionCipher,
};

/// Bounded depth of the per-session outbound queue. Senders block when the
/// socket cannot keep up, which is the backpressure for chunk streaming.
const OUTBOUND_QUEUE: usize = 16;

/// Events a session pushes to the coordinator.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// A decoded non-response frame.
    Frame { device_id: String, frame: Frame },
    /// The session reached a terminal state on its own (peer goodbye,
    /// transport error, liveness failure).
    Closed { device_id: String },
}

/// Read half plus everything the receive task needs; parked until the
/// coordinator has registered the session and calls `start_receiver`.
struct RecvParts {
    rd: OwnedReadHalf,
    cipher: SessionCipher,
    idle_read_timeout: Duration,
    ping_timeout: Duration,
    max_payload: usize,
}

struct SessionShared {
    device_id: String,
    state: Mutex<ConnectionState>,
    outbound_tx: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Frame>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    recv_parts: Mutex<Option<RecvParts>>,
}

impl SessionShared {
    /// Move to a terminal state (first one wins) and fail every pending
    /// request by dropping its responder.
    fn finish(&self, state: ConnectionState) {
        {
            let mut current = self.state.lock().unwrap();
            if !current.is_terminal() {
                *current = state;
            }
        }
        self.pending.lock().unwrap().clear();
    }
}

/// One authenticated connection to a sibling device.
pub struct PeerSession {
    peer: DeviceInfo,
    shared: Arc<SessionShared>,
}

impl PeerSession {
    /// Open an outbound session.
    pub(crate) async fn connect(
        addr: SocketAddr,
        secrets: &PairingSecrets,
        config: &NetworkConfig,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        let stream = timeout(config.request_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| VaultError::Timeout)??;
        establish(stream, true, secrets, config, events_tx).await
    }

    /// Complete the handshake on an accepted socket.
    pub(crate) async fn accept(
        stream: TcpStream,
        secrets: &PairingSecrets,
        config: &NetworkConfig,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>> {
        establish(stream, false, secrets, config, events_tx).await
    }

    pub fn device_id(&self) -> &str {
        &self.peer.device_id
    }

    pub fn peer_info(&self) -> DeviceInfo {
        let mut info = self.peer.clone();
        info.is_connected = self.is_connected();
        info
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Enqueue a frame. Wire order matches enqueue order for this session.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_connected() {
            return Err(VaultError::disconnected());
        }
        self.shared
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| VaultError::disconnected())
    }

    /// Send a frame and wait for the response carrying the same request id.
    pub async fn request(&self, frame: Frame, wait: Duration) -> Result<Frame> {
        let request_id = frame.request_id;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert(request_id, tx);

        if let Err(e) = self.send(frame).await {
            self.shared.pending.lock().unwrap().remove(&request_id);
            return Err(e);
        }

        match timeout(wait, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(VaultError::disconnected()),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&request_id);
                Err(VaultError::Timeout)
            }
        }
    }

    /// Spawn the receive task. Called once the session is registered in the
    /// connection table, so no frame is dispatched for an unknown session.
    /// Frames arriving earlier wait in the socket buffer.
    pub(crate) fn start_receiver(&self) {
        let Some(parts) = self.shared.recv_parts.lock().unwrap().take() else {
            return;
        };
        let task = tokio::spawn(run_inbound(
            parts.rd,
            parts.cipher,
            self.shared.clone(),
            self.shared.events_tx.clone(),
            self.shared.outbound_tx.clone(),
            parts.idle_read_timeout,
            parts.ping_timeout,
            parts.max_payload,
        ));
        self.shared.tasks.lock().unwrap().push(task);
    }

    /// Best-effort goodbye, then tear the session down. The coordinator is
    /// responsible for its own bookkeeping when it calls this; no `Closed`
    /// event is emitted.
    pub async fn close(&self) {
        if self.is_connected() {
            let _ = self
                .shared
                .outbound_tx
                .try_send(Frame::control(MessageType::Goodbye, Uuid::new_v4()));
            // Give the outbound task a moment to flush the goodbye.
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.shared.finish(ConnectionState::Disconnected);
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("device_id", &self.peer.device_id)
            .field("state", &self.state())
            .finish()
    }
}

fn is_disconnect(err: &VaultError) -> bool {
    matches!(
        err,
        VaultError::Network(io) if matches!(
            io.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

async fn establish(
    stream: TcpStream,
    is_initiator: bool,
    secrets: &PairingSecrets,
    config: &NetworkConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) -> Result<Arc<PeerSession>> {
    let remote_addr = stream.peer_addr()?;
    let _ = stream.set_nodelay(true);
    let (mut rd, mut wr) = stream.into_split();
    let hs_timeout = config.request_timeout;

    // Preamble exchange: PSK identity + 32-byte nonce, plaintext.
    let local_nonce: [u8; 32] = rand::random();
    let local_preamble = ChannelHello::new(secrets.psk_identity(), &local_nonce);
    let remote_preamble = if is_initiator {
        write_preamble(&mut wr, &local_preamble).await?;
        timeout(hs_timeout, read_preamble(&mut rd))
            .await
            .map_err(|_| VaultError::Timeout)??
    } else {
        let p = timeout(hs_timeout, read_preamble(&mut rd))
            .await
            .map_err(|_| VaultError::Timeout)??;
        write_preamble(&mut wr, &local_preamble).await?;
        p
    };

    if remote_preamble.psk_identity == secrets.device_id() {
        return Err(VaultError::Auth("peer claims the local identity".to_string()));
    }
    let remote_nonce = remote_preamble.nonce_bytes()?;
    let (initiator_nonce, acceptor_nonce) = if is_initiator {
        (local_nonce, remote_nonce)
    } else {
        (remote_nonce, local_nonce)
    };
    let mut keys = derive_channel_keys(
        secrets.psk32(),
        &initiator_nonce,
        &acceptor_nonce,
        is_initiator,
    )?;

    // Sealed hello exchange. Decryption failure here means the peer does
    // not hold the family PSK.
    let local_hello = HelloPayload {
        device_id: secrets.device_id().to_string(),
        device_name: secrets.device_name().to_string(),
        device_type: secrets.device_type().code(),
        protocol_version: PROTOCOL_VERSION,
        confirm: keys.local_confirm.clone(),
    };
    let max_payload = config.max_frame_payload;

    let remote_hello: HelloPayload = if is_initiator {
        let frame = Frame::request(MessageType::Hello, &local_hello)?;
        write_sealed_frame(&mut wr, &mut keys.send, &frame, max_payload).await?;
        let reply = timeout(hs_timeout, read_sealed_frame(&mut rd, &keys.recv, max_payload))
            .await
            .map_err(|_| VaultError::Timeout)??;
        if reply.msg_type != MessageType::HelloAck {
            return Err(VaultError::Auth(format!(
                "expected hello ack, got {:?}",
                reply.msg_type
            )));
        }
        reply.payload_json()?
    } else {
        let frame = timeout(hs_timeout, read_sealed_frame(&mut rd, &keys.recv, max_payload))
            .await
            .map_err(|_| VaultError::Timeout)??;
        if frame.msg_type != MessageType::Hello {
            return Err(VaultError::Auth(format!(
                "expected hello, got {:?}",
                frame.msg_type
            )));
        }
        let hello: HelloPayload = frame.payload_json()?;
        let ack = Frame::reply(MessageType::HelloAck, frame.request_id, &local_hello)?;
        write_sealed_frame(&mut wr, &mut keys.send, &ack, max_payload).await?;
        hello
    };

    if remote_hello.protocol_version < MIN_PROTOCOL_VERSION {
        return Err(VaultError::Auth(format!(
            "unsupported protocol version {}",
            remote_hello.protocol_version
        )));
    }
    if remote_hello.confirm != keys.remote_confirm {
        return Err(VaultError::Auth("key confirmation mismatch".to_string()));
    }
    if remote_hello.device_id != remote_preamble.psk_identity {
        return Err(VaultError::Auth(format!(
            "hello identity {} does not match PSK identity {}",
            remote_hello.device_id, remote_preamble.psk_identity
        )));
    }

    let peer = DeviceInfo {
        device_id: remote_hello.device_id.clone(),
        device_name: remote_hello.device_name.clone(),
        device_type: DeviceType::try_from(remote_hello.device_type)?,
        ip_address: remote_addr.ip().to_string(),
        // Only meaningful for outbound sessions; inbound peers connect from
        // an ephemeral port and announce their service port via discovery.
        service_port: if is_initiator { remote_addr.port() } else { 0 },
        last_seen_at: epoch_secs(),
        is_online: true,
        is_connected: true,
    };

    let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let shared = Arc::new(SessionShared {
        device_id: peer.device_id.clone(),
        state: Mutex::new(ConnectionState::Connected),
        outbound_tx: outbound_tx.clone(),
        pending: Mutex::new(HashMap::new()),
        tasks: Mutex::new(Vec::new()),
        events_tx,
        recv_parts: Mutex::new(Some(RecvParts {
            rd,
            cipher: keys.recv,
            idle_read_timeout: config.idle_read_timeout,
            ping_timeout: config.ping_timeout,
            max_payload,
        })),
    });

    let outbound = tokio::spawn(run_outbound(
        outbound_rx,
        wr,
        keys.send,
        shared.device_id.clone(),
        max_payload,
    ));
    shared.tasks.lock().unwrap().push(outbound);

    debug!(
        device_id = %peer.device_id,
        addr = %remote_addr,
        initiator = is_initiator,
        "peer session established"
    );
    Ok(Arc::new(PeerSession { peer, shared }))
}

async fn run_outbound(
    mut rx: mpsc::Receiver<Frame>,
    mut wr: OwnedWriteHalf,
    mut cipher: SessionCipher,
    device_id: String,
    max_payload: usize,
) {
    use tokio::io::AsyncWriteExt;

    while let Some(frame) = rx.recv().await {
        let was_goodbye = frame.msg_type == MessageType::Goodbye;
        if let Err(e) = write_sealed_frame(&mut wr, &mut cipher, &frame, max_payload).await {
            debug!(device_id = %device_id, error = %e, "outbound write failed");
            break;
        }
        if was_goodbye {
            let _ = wr.shutdown().await;
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_inbound(
    mut rd: OwnedReadHalf,
    cipher: SessionCipher,
    shared: Arc<SessionShared>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    outbound_tx: mpsc::Sender<Frame>,
    idle_read_timeout: Duration,
    ping_timeout: Duration,
    max_payload: usize,
) {
    let mut end_state = ConnectionState::Failed;

    loop {
        let frame = match timeout(idle_read_timeout, read_sealed_frame(&mut rd, &cipher, max_payload)).await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                if is_disconnect(&e) {
                    end_state = ConnectionState::Disconnected;
                } else {
                    warn!(device_id = %shared.device_id, error = %e, "session read failed");
                }
                break;
            }
            Err(_) => {
                // Nothing read for a while: probe the peer. Any frame that
                // arrives within the ping window proves liveness.
                if outbound_tx
                    .send(Frame::control(MessageType::Ping, Uuid::new_v4()))
                    .await
                    .is_err()
                {
                    break;
                }
                match timeout(ping_timeout, read_sealed_frame(&mut rd, &cipher, max_payload)).await {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => {
                        if is_disconnect(&e) {
                            end_state = ConnectionState::Disconnected;
                        } else {
                            warn!(device_id = %shared.device_id, error = %e, "session read failed");
                        }
                        break;
                    }
                    Err(_) => {
                        warn!(device_id = %shared.device_id, "no pong before timeout, failing session");
                        break;
                    }
                }
            }
        };

        match frame.msg_type {
            MessageType::Ping => {
                let _ = outbound_tx
                    .send(Frame::control(MessageType::Pong, frame.request_id))
                    .await;
            }
            MessageType::Pong => {}
            MessageType::Goodbye => {
                end_state = ConnectionState::Disconnected;
                break;
            }
            t if t.is_response() => {
                let waiter = shared.pending.lock().unwrap().remove(&frame.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    // IndexDeltaAck is reserved and accepted silently; late
                    // responses after a timeout land here too.
                    None => trace!(
                        device_id = %shared.device_id,
                        msg_type = ?frame.msg_type,
                        "response with no pending request"
                    ),
                }
            }
            _ => {
                let _ = events_tx.send(SessionEvent::Frame {
                    device_id: shared.device_id.clone(),
                    frame,
                });
            }
        }
    }

    shared.finish(end_state);
    let _ = events_tx.send(SessionEvent::Closed {
        device_id: shared.device_id.clone(),
    });
}
