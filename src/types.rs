//! Shared data model: device identity, catalog records, connection states.

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Device class declared at pairing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    /// Numeric code used on the wire (announce datagrams and hello frames).
    pub fn code(self) -> i32 {
        match self {
            DeviceType::Desktop => 0,
            DeviceType::Mobile => 1,
            DeviceType::Tablet => 2,
        }
    }
}

impl TryFrom<i32> for DeviceType {
    type Error = VaultError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceType::Desktop),
            1 => Ok(DeviceType::Mobile),
            2 => Ok(DeviceType::Tablet),
            x => Err(VaultError::ProtocolDecode(format!(
                "unknown device type {}",
                x
            ))),
        }
    }
}

/// File visibility. Private files never leave the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Family,
}

/// State of one peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// A device on the LAN, either this one or a discovered sibling.
///
/// For discovered devices `ip_address` always comes from the datagram
/// source address, never from the announce payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub ip_address: String,
    pub service_port: u16,
    /// Wall-clock seconds of the last announce heard from this device.
    pub last_seen_at: i64,
    pub is_online: bool,
    pub is_connected: bool,
}

/// A record in the local catalog, as seen by the sync engine.
///
/// `visibility` is the effective value after folder inheritance; only
/// records with `visibility == Family` and `is_remote == false` are
/// eligible to leave the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    pub id: i64,
    pub relative_path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: Option<String>,
    pub visibility: Visibility,
    pub source_device_id: Option<String>,
    pub is_remote: bool,
    pub sync_version: i64,
    pub indexed_at: i64,
}

/// A catalog record received from another device, keyed by
/// `(source_device_id, remote_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileRecord {
    /// Row id in the local store; 0 until the store assigns one.
    pub local_id: i64,
    /// File id on the source device.
    pub remote_id: i64,
    pub source_device_id: String,
    pub path: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub modified_at: i64,
    pub checksum: String,
    /// When this record was received.
    pub synced_at: i64,
    pub is_deleted: bool,
}

/// Current wall-clock time as epoch seconds.
pub fn epoch_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
