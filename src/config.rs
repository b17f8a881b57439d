//! Tunable knobs for discovery, sessions, sync and transfer.
//!
//! Everything is passed in through the coordinator's constructor; there are
//! no environment variables and no global state.

use std::time::Duration;

/// Announce datagrams carry this application marker.
pub const APP_NAME: &str = "FamilyVault";

/// Current wire protocol version.
pub const PROTOCOL_VERSION: i32 = 1;

/// Oldest protocol version this implementation accepts.
pub const MIN_PROTOCOL_VERSION: i32 = 1;

/// Default UDP port for discovery announces.
pub const DISCOVERY_PORT: u16 = 45679;

/// Default TCP port for the peer service.
pub const SERVICE_PORT: u16 = 45678;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port the coordinator listens on (0 picks an ephemeral port).
    pub service_port: u16,
    /// UDP port announces are broadcast on and received from.
    pub discovery_port: u16,
    /// How often an announce is broadcast.
    pub announce_interval: Duration,
    /// A device is offline once no announce has been heard for this long.
    pub device_ttl: Duration,
    /// Idle read time after which a session probes the peer with a ping.
    pub idle_read_timeout: Duration,
    /// Time after a ping within which some frame must arrive.
    pub ping_timeout: Duration,
    /// Default timeout for request/response round trips.
    pub request_timeout: Duration,
    /// Timeout for the file request round trip.
    pub file_request_timeout: Duration,
    /// File transfer chunk size in bytes.
    pub chunk_size: usize,
    /// Catalog records per sync batch.
    pub sync_batch_size: usize,
    /// Pause between sync batches so a slow receiver can keep up.
    pub sync_batch_pause: Duration,
    /// Frames with a larger payload fail the session.
    pub max_frame_payload: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            service_port: SERVICE_PORT,
            discovery_port: DISCOVERY_PORT,
            announce_interval: Duration::from_secs(5),
            device_ttl: Duration::from_secs(15),
            idle_read_timeout: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            file_request_timeout: Duration::from_secs(30),
            chunk_size: 64 * 1024,
            sync_batch_size: 100,
            sync_batch_pause: Duration::from_millis(10),
            max_frame_payload: 8 * 1024 * 1024,
        }
    }
}
