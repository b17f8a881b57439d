//! Wire protocol: typed frames, payload shapes, and the per-session cipher.
//!
//! Every frame is `[4 bytes BE length][frame body]`. In the established
//! channel the body is sealed: `[8 bytes LE nonce counter][ciphertext]`
//! where the plaintext is `[1 byte type tag][16 bytes request id][payload]`.
//! Control payloads are UTF-8 JSON; file chunk data rides inside the JSON as
//! base64. The channel key is derived from the pairing PSK with HKDF-SHA256
//! and each direction gets its own key, so nonce counters never collide.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// Plaintext frame header: 1 byte tag + 16 request-id bytes.
pub const FRAME_HEADER_LEN: usize = 17;

/// Sealed-frame overhead on top of the payload: nonce counter, header,
/// AEAD tag.
pub const SEAL_OVERHEAD: usize = 8 + FRAME_HEADER_LEN + 16;

/// Handshake preambles never exceed this.
const MAX_PREAMBLE_LEN: usize = 1024;

const KEY_INFO_INITIATOR: &[u8] = b"familyvault-frames-initiator";
const KEY_INFO_ACCEPTOR: &[u8] = b"familyvault-frames-acceptor";
const CONFIRM_LABEL_INITIATOR: &[u8] = b"familyvault-confirm-initiator";
const CONFIRM_LABEL_ACCEPTOR: &[u8] = b"familyvault-confirm-acceptor";

// ── Message types ────────────────────────────────────────────────────────────

/// Closed set of frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    HelloAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    Goodbye = 0x05,
    IndexSyncRequest = 0x20,
    IndexSyncResponse = 0x21,
    IndexDelta = 0x22,
    IndexDeltaAck = 0x23,
    FileRequest = 0x30,
    FileResponse = 0x31,
    FileChunk = 0x32,
    FileNotFound = 0x34,
}

impl MessageType {
    /// Response tags complete a pending `request()` future; everything else
    /// is dispatched to the registered message handler.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::HelloAck
                | MessageType::Pong
                | MessageType::IndexSyncResponse
                | MessageType::IndexDeltaAck
                | MessageType::FileResponse
                | MessageType::FileNotFound
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = VaultError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            x if x == MessageType::Hello as u8 => Ok(MessageType::Hello),
            x if x == MessageType::HelloAck as u8 => Ok(MessageType::HelloAck),
            x if x == MessageType::Ping as u8 => Ok(MessageType::Ping),
            x if x == MessageType::Pong as u8 => Ok(MessageType::Pong),
            x if x == MessageType::Goodbye as u8 => Ok(MessageType::Goodbye),
            x if x == MessageType::IndexSyncRequest as u8 => Ok(MessageType::IndexSyncRequest),
            x if x == MessageType::IndexSyncResponse as u8 => Ok(MessageType::IndexSyncResponse),
            x if x == MessageType::IndexDelta as u8 => Ok(MessageType::IndexDelta),
            x if x == MessageType::IndexDeltaAck as u8 => Ok(MessageType::IndexDeltaAck),
            x if x == MessageType::FileRequest as u8 => Ok(MessageType::FileRequest),
            x if x == MessageType::FileResponse as u8 => Ok(MessageType::FileResponse),
            x if x == MessageType::FileChunk as u8 => Ok(MessageType::FileChunk),
            x if x == MessageType::FileNotFound as u8 => Ok(MessageType::FileNotFound),
            x => Err(VaultError::ProtocolDecode(format!(
                "unknown message type 0x{:02x}",
                x
            ))),
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: Uuid,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Frame with a fresh request id and a JSON payload.
    pub fn request<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self {
            msg_type,
            request_id: Uuid::new_v4(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Frame correlated to an existing request id.
    pub fn reply<T: Serialize>(msg_type: MessageType, request_id: Uuid, payload: &T) -> Result<Self> {
        Ok(Self {
            msg_type,
            request_id,
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Control frame with an empty JSON object payload.
    pub fn control(msg_type: MessageType, request_id: Uuid) -> Self {
        Self {
            msg_type,
            request_id,
            payload: b"{}".to_vec(),
        }
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.push(self.msg_type as u8);
        out.extend_from_slice(self.request_id.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(VaultError::ProtocolDecode("truncated frame".to_string()));
        }
        let msg_type = MessageType::try_from(bytes[0])?;
        let mut rid = [0u8; 16];
        rid.copy_from_slice(&bytes[1..17]);
        Ok(Self {
            msg_type,
            request_id: Uuid::from_bytes(rid),
            payload: bytes[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

// ── Session cipher ───────────────────────────────────────────────────────────

/// Per-direction AEAD state. The nonce is an 8-byte counter (LE) padded to
/// 12 bytes; the counter is prepended to each sealed body so the receiver
/// does not have to track it.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    send_counter: u64,
}

impl SessionCipher {
    fn from_key(key: &[u8; 32]) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| VaultError::Internal(format!("cipher init failed: {}", e)))?;
        Ok(Self {
            cipher,
            send_counter: 0,
        })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let counter = self.send_counter.to_le_bytes();
        self.send_counter = self.send_counter.checked_add(1).ok_or_else(|| {
            VaultError::Internal("session nonce counter overflow".to_string())
        })?;

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..8].copy_from_slice(&counter);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Internal("encryption failed".to_string()))?;

        let mut body = Vec::with_capacity(8 + ciphertext.len());
        body.extend_from_slice(&counter);
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }

    pub fn open(&self, body: &[u8]) -> Result<Vec<u8>> {
        if body.len() < 8 + 16 {
            return Err(VaultError::ProtocolDecode("sealed frame too short".to_string()));
        }
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..8].copy_from_slice(&body[..8]);
        let nonce = Nonce::from(nonce_bytes);

        self.cipher
            .decrypt(&nonce, &body[8..])
            .map_err(|_| VaultError::Auth("frame authentication failed".to_string()))
    }
}

/// Keys and confirmation tags for one established channel.
pub struct ChannelKeys {
    pub send: SessionCipher,
    pub recv: SessionCipher,
    /// Tag this side includes in its hello.
    pub local_confirm: String,
    /// Tag expected from the remote hello.
    pub remote_confirm: String,
}

/// Derive direction-bound frame keys and key-confirmation tags from the
/// family PSK and both handshake nonces.
pub fn derive_channel_keys(
    psk: &[u8; 32],
    initiator_nonce: &[u8; 32],
    acceptor_nonce: &[u8; 32],
    is_initiator: bool,
) -> Result<ChannelKeys> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(initiator_nonce);
    salt[32..].copy_from_slice(acceptor_nonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
    let mut initiator_key = [0u8; 32];
    let mut acceptor_key = [0u8; 32];
    hk.expand(KEY_INFO_INITIATOR, &mut initiator_key)
        .map_err(|e| VaultError::Internal(format!("HKDF expand failed: {}", e)))?;
    hk.expand(KEY_INFO_ACCEPTOR, &mut acceptor_key)
        .map_err(|e| VaultError::Internal(format!("HKDF expand failed: {}", e)))?;

    let initiator_tag = confirm_tag(psk, CONFIRM_LABEL_INITIATOR, &salt);
    let acceptor_tag = confirm_tag(psk, CONFIRM_LABEL_ACCEPTOR, &salt);

    let (send_key, recv_key, local_confirm, remote_confirm) = if is_initiator {
        (initiator_key, acceptor_key, initiator_tag, acceptor_tag)
    } else {
        (acceptor_key, initiator_key, acceptor_tag, initiator_tag)
    };

    Ok(ChannelKeys {
        send: SessionCipher::from_key(&send_key)?,
        recv: SessionCipher::from_key(&recv_key)?,
        local_confirm,
        remote_confirm,
    })
}

/// HMAC-SHA256(psk, label ‖ nonces), truncated to 16 bytes, hex.
fn confirm_tag(psk: &[u8; 32], label: &[u8], nonces: &[u8]) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(psk)
        .expect("HMAC accepts any key length");
    mac.update(label);
    mac.update(nonces);
    let tag = mac.finalize().into_bytes();
    tag[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

// ── Handshake preamble ───────────────────────────────────────────────────────

/// Plaintext preamble sent by each side before the channel is keyed.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHello {
    /// PSK identity: the sender's device UUID.
    pub psk_identity: String,
    /// 32 random bytes, base64.
    pub nonce: String,
}

impl ChannelHello {
    pub fn new(psk_identity: &str, nonce: &[u8; 32]) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Self {
            psk_identity: psk_identity.to_string(),
            nonce: STANDARD.encode(nonce),
        }
    }

    pub fn nonce_bytes(&self) -> Result<[u8; 32]> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let raw = STANDARD
            .decode(&self.nonce)
            .map_err(|e| VaultError::ProtocolDecode(format!("bad preamble nonce: {}", e)))?;
        raw.try_into()
            .map_err(|_| VaultError::ProtocolDecode("preamble nonce must be 32 bytes".to_string()))
    }
}

pub async fn write_preamble<W: AsyncWrite + Unpin>(
    writer: &mut W,
    hello: &ChannelHello,
) -> Result<()> {
    let body = serde_json::to_vec(hello)?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_preamble<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ChannelHello> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_PREAMBLE_LEN {
        return Err(VaultError::ProtocolDecode(format!(
            "preamble length {} out of range",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

// ── Sealed frame IO ──────────────────────────────────────────────────────────

pub async fn write_sealed_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &mut SessionCipher,
    frame: &Frame,
    max_payload: usize,
) -> Result<()> {
    if frame.payload.len() > max_payload {
        return Err(VaultError::ProtocolDecode(format!(
            "outgoing payload of {} bytes exceeds limit",
            frame.payload.len()
        )));
    }
    let body = cipher.seal(&frame.encode())?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_sealed_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &SessionCipher,
    max_payload: usize,
) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload + SEAL_OVERHEAD {
        return Err(VaultError::ProtocolDecode(format!(
            "incoming frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Frame::decode(&cipher.open(&body)?)
}

// ── Control payloads ─────────────────────────────────────────────────────────

/// Application-level hello, sent sealed in both directions.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: String,
    pub device_name: String,
    pub device_type: i32,
    pub protocol_version: i32,
    /// Key-confirmation tag binding the hello to the handshake nonces.
    pub confirm: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSyncRequestPayload {
    pub since_timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSyncResponsePayload {
    pub total_files: i64,
}

/// One catalog record on the wire. The receiver overwrites `device_id`
/// with the session's authenticated identity.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    #[serde(default)]
    pub checksum: String,
    pub device_id: String,
    pub sync_version: i64,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequestPayload {
    pub file_id: i64,
    pub file_name: String,
    pub expected_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResponsePayload {
    pub total_size: i64,
    pub chunk_size: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunkPayload {
    pub request_id: String,
    pub offset: i64,
    pub total_size: i64,
    /// Chunk bytes, base64.
    pub data: String,
}

impl FileChunkPayload {
    pub fn encode_data(bytes: &[u8]) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(bytes)
    }

    pub fn decode_data(&self) -> Result<Vec<u8>> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD
            .decode(&self.data)
            .map_err(|e| VaultError::ProtocolDecode(format!("bad chunk data: {}", e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNotFoundPayload {
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keys() -> (ChannelKeys, ChannelKeys) {
        let psk = [3u8; 32];
        let ni = [1u8; 32];
        let na = [2u8; 32];
        let initiator = derive_channel_keys(&psk, &ni, &na, true).unwrap();
        let acceptor = derive_channel_keys(&psk, &ni, &na, false).unwrap();
        (initiator, acceptor)
    }

    #[test]
    fn message_type_tags_are_stable() {
        assert_eq!(MessageType::IndexSyncRequest as u8, 0x20);
        assert_eq!(MessageType::IndexSyncResponse as u8, 0x21);
        assert_eq!(MessageType::IndexDelta as u8, 0x22);
        assert_eq!(MessageType::IndexDeltaAck as u8, 0x23);
        assert_eq!(MessageType::FileRequest as u8, 0x30);
        assert_eq!(MessageType::FileResponse as u8, 0x31);
        assert_eq!(MessageType::FileChunk as u8, 0x32);
        assert_eq!(MessageType::FileNotFound as u8, 0x34);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(MessageType::try_from(0x33).is_err());
        assert!(MessageType::try_from(0xff).is_err());
    }

    #[test]
    fn frame_round_trip() {
        let frame = Frame::request(
            MessageType::IndexSyncRequest,
            &IndexSyncRequestPayload { since_timestamp: 42 },
        )
        .unwrap();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::IndexSyncRequest);
        assert_eq!(decoded.request_id, frame.request_id);
        let payload: IndexSyncRequestPayload = decoded.payload_json().unwrap();
        assert_eq!(payload.since_timestamp, 42);
    }

    #[test]
    fn seal_and_open_across_directions() {
        let (mut initiator, acceptor) = test_keys();
        let sealed = initiator.send.seal(b"hello family").unwrap();
        assert_eq!(acceptor.recv.open(&sealed).unwrap(), b"hello family");
        // The acceptor's send key must not open initiator traffic.
        assert!(acceptor.send.cipher.decrypt(
            &Nonce::from([0u8; 12]),
            &sealed[8..],
        ).is_err());
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let (mut initiator, acceptor) = test_keys();
        let mut sealed = initiator.send.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            acceptor.recv.open(&sealed),
            Err(VaultError::Auth(_))
        ));
    }

    #[test]
    fn nonce_counter_advances_per_frame() {
        let (mut initiator, acceptor) = test_keys();
        let a = initiator.send.seal(b"one").unwrap();
        let b = initiator.send.seal(b"two").unwrap();
        assert_eq!(&a[..8], &0u64.to_le_bytes());
        assert_eq!(&b[..8], &1u64.to_le_bytes());
        assert_eq!(acceptor.recv.open(&b).unwrap(), b"two");
    }

    #[test]
    fn confirm_tags_are_direction_bound() {
        let (initiator, acceptor) = test_keys();
        assert_eq!(initiator.local_confirm, acceptor.remote_confirm);
        assert_eq!(initiator.remote_confirm, acceptor.local_confirm);
        assert_ne!(initiator.local_confirm, initiator.remote_confirm);
    }

    #[tokio::test]
    async fn sealed_frame_io_round_trip() {
        let (mut initiator, acceptor) = test_keys();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let frame = Frame::request(
            MessageType::FileRequest,
            &FileRequestPayload {
                file_id: 42,
                file_name: "photo.jpg".to_string(),
                expected_size: 131_072,
                checksum: None,
            },
        )
        .unwrap();
        write_sealed_frame(&mut a, &mut initiator.send, &frame, 1024).await.unwrap();
        let read = read_sealed_frame(&mut b, &acceptor.recv, 1024).await.unwrap();
        assert_eq!(read.msg_type, MessageType::FileRequest);
        assert_eq!(read.request_id, frame.request_id);
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected_before_reading_body() {
        let (_, acceptor) = test_keys();
        let (mut a, mut b) = tokio::io::duplex(1024);
        // Announce an absurd length; the reader must bail on the prefix alone.
        a.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();
        let err = read_sealed_frame(&mut b, &acceptor.recv, 4096).await.unwrap_err();
        assert!(matches!(err, VaultError::ProtocolDecode(_)));
    }

    #[test]
    fn chunk_data_base64_round_trip() {
        let data = vec![0u8, 1, 2, 250, 251, 252];
        let payload = FileChunkPayload {
            request_id: Uuid::new_v4().to_string(),
            offset: 0,
            total_size: 6,
            data: FileChunkPayload::encode_data(&data),
        };
        assert_eq!(payload.decode_data().unwrap(), data);
    }
}
