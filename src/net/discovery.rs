//! LAN device discovery over UDP broadcast.
//!
//! One announcer task broadcasts a JSON presence datagram on every interface
//! broadcast address, one listener task processes incoming datagrams, and one
//! reaper task expires devices that have gone quiet. The device table is read
//! by the coordinator; events are emitted outside the table lock.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{APP_NAME, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
use crate::error::Result;
use crate::types::{epoch_secs, DeviceInfo, DeviceType};

use super::interfaces::broadcast_addresses;

/// Datagrams larger than this are dropped.
const MAX_DATAGRAM: usize = 2048;

/// Reaper wake interval.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Presence announce, one JSON object per datagram.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AnnouncePayload {
    pub app: String,
    pub protocol_version: i32,
    pub min_protocol_version: i32,
    pub device_id: String,
    pub device_name: String,
    pub device_type: i32,
    pub service_port: u16,
}

impl AnnouncePayload {
    fn for_device(device: &DeviceInfo) -> Self {
        Self {
            app: APP_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            device_id: device.device_id.clone(),
            device_name: device.device_name.clone(),
            device_type: device.device_type.code(),
            service_port: device.service_port,
        }
    }
}

/// Device table changes surfaced to the coordinator.
#[derive(Debug, Clone)]
pub(crate) enum DiscoveryEvent {
    Found(DeviceInfo),
    Updated(DeviceInfo),
    Lost(DeviceInfo),
}

struct DeviceEntry {
    info: DeviceInfo,
    last_seen: Instant,
}

/// Validate a datagram and build the device it announces. The IP always
/// comes from the datagram source, never from the payload.
fn parse_announce(data: &[u8], src_ip: IpAddr, local_device_id: &str) -> Option<DeviceInfo> {
    let announce: AnnouncePayload = serde_json::from_slice(data).ok()?;
    if announce.app != APP_NAME {
        return None;
    }
    if announce.device_id.is_empty() || announce.device_id == local_device_id {
        return None;
    }
    if announce.protocol_version < 1 || PROTOCOL_VERSION < announce.min_protocol_version {
        debug!(device_id = %announce.device_id, "incompatible protocol version in announce");
        return None;
    }
    Some(DeviceInfo {
        device_id: announce.device_id,
        device_name: announce.device_name,
        device_type: DeviceType::try_from(announce.device_type).unwrap_or(DeviceType::Desktop),
        ip_address: src_ip.to_string(),
        service_port: announce.service_port,
        last_seen_at: epoch_secs(),
        is_online: true,
        is_connected: false,
    })
}

/// Upsert into the table. Returns the event to emit, if any: `Found` for a
/// new key, `Updated` when the IP or name changed, nothing for a plain
/// refresh.
fn upsert_device(
    devices: &mut HashMap<String, DeviceEntry>,
    info: DeviceInfo,
) -> Option<DiscoveryEvent> {
    match devices.get_mut(&info.device_id) {
        None => {
            info!(device_id = %info.device_id, name = %info.device_name, ip = %info.ip_address, "discovered device");
            devices.insert(
                info.device_id.clone(),
                DeviceEntry {
                    info: info.clone(),
                    last_seen: Instant::now(),
                },
            );
            Some(DiscoveryEvent::Found(info))
        }
        Some(entry) => {
            let changed = entry.info.ip_address != info.ip_address
                || entry.info.device_name != info.device_name;
            entry.info = info.clone();
            entry.last_seen = Instant::now();
            if changed {
                Some(DiscoveryEvent::Updated(info))
            } else {
                None
            }
        }
    }
}

/// Periodic UDP announce + listener + TTL reaper.
pub struct Discovery {
    discovery_port: u16,
    announce_interval: Duration,
    device_ttl: Duration,
    running: AtomicBool,
    devices: Mutex<HashMap<String, DeviceEntry>>,
    local_device_id: Mutex<String>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(discovery_port: u16, announce_interval: Duration, device_ttl: Duration) -> Self {
        Self {
            discovery_port,
            announce_interval,
            device_ttl,
            running: AtomicBool::new(false),
            devices: Mutex::new(HashMap::new()),
            local_device_id: Mutex::new(String::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the discovery socket and spawn the announcer, listener and
    /// reaper tasks. Idempotent while running.
    pub(crate) fn start(
        self: &Arc<Self>,
        local_device: DeviceInfo,
        event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.local_device_id.lock().unwrap() = local_device.device_id.clone();

        let socket = match self.bind_socket() {
            Ok(s) => Arc::new(s),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            port = self.discovery_port,
            interval_secs = self.announce_interval.as_secs(),
            ttl_secs = self.device_ttl.as_secs(),
            "discovery started"
        );

        let announcer = tokio::spawn(run_announcer(
            socket.clone(),
            self.clone(),
            local_device,
        ));
        let listener = tokio::spawn(run_listener(socket, self.clone(), event_tx.clone()));
        let reaper = tokio::spawn(run_reaper(self.clone(), event_tx));

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(announcer);
        tasks.push(listener);
        tasks.push(reaper);
        Ok(())
    }

    /// Stop all tasks and forget every device. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.devices.lock().unwrap().clear();
        info!("discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        let devices = self.devices.lock().unwrap();
        devices.values().map(|e| e.info.clone()).collect()
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceInfo> {
        let devices = self.devices.lock().unwrap();
        devices.get(device_id).map(|e| e.info.clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    fn bind_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.discovery_port);
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            for task in self.tasks.lock().unwrap().drain(..) {
                task.abort();
            }
        }
    }
}

async fn run_announcer(socket: Arc<UdpSocket>, discovery: Arc<Discovery>, local: DeviceInfo) {
    let message = match serde_json::to_vec(&AnnouncePayload::for_device(&local)) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "failed to serialize announce");
            return;
        }
    };
    let port = discovery.discovery_port;
    let targets: Vec<SocketAddr> = broadcast_addresses()
        .into_iter()
        .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))
        .collect();

    // Announce bursts at startup so siblings notice a new device quickly;
    // a lone datagram is easily lost.
    for i in 0..3 {
        for target in &targets {
            let _ = socket.send_to(&message, target).await;
        }
        if i < 2 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    let mut ticker = tokio::time::interval(discovery.announce_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for target in &targets {
            if let Err(e) = socket.send_to(&message, target).await {
                debug!(target = %target, error = %e, "announce send failed");
            }
        }
    }
}

async fn run_listener(
    socket: Arc<UdpSocket>,
    discovery: Arc<Discovery>,
    event_tx: mpsc::UnboundedSender<DiscoveryEvent>,
) {
    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "discovery recv failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let local_id = discovery.local_device_id.lock().unwrap().clone();
        let Some(info) = parse_announce(&buf[..len], src.ip(), &local_id) else {
            continue;
        };
        let event = {
            let mut devices = discovery.devices.lock().unwrap();
            upsert_device(&mut devices, info)
        };
        if let Some(event) = event {
            let _ = event_tx.send(event);
        }
    }
}

async fn run_reaper(discovery: Arc<Discovery>, event_tx: mpsc::UnboundedSender<DiscoveryEvent>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        let expired = {
            let mut devices = discovery.devices.lock().unwrap();
            reap_expired(&mut devices, discovery.device_ttl)
        };
        for mut info in expired {
            info!(device_id = %info.device_id, name = %info.device_name, "device went offline");
            info.is_online = false;
            let _ = event_tx.send(DiscoveryEvent::Lost(info));
        }
    }
}

fn reap_expired(devices: &mut HashMap<String, DeviceEntry>, ttl: Duration) -> Vec<DeviceInfo> {
    let now = Instant::now();
    let expired: Vec<String> = devices
        .iter()
        .filter(|(_, entry)| now.duration_since(entry.last_seen) > ttl)
        .map(|(id, _)| id.clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|id| devices.remove(&id).map(|e| e.info))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_json(device_id: &str, name: &str) -> Vec<u8> {
        serde_json::to_vec(&AnnouncePayload {
            app: APP_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            device_id: device_id.to_string(),
            device_name: name.to_string(),
            device_type: 0,
            service_port: 45678,
        })
        .unwrap()
    }

    fn src() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn announce_is_parsed_with_source_ip() {
        let data = announce_json("device-A", "Living Room PC");
        let info = parse_announce(&data, src(), "device-local").unwrap();
        assert_eq!(info.device_id, "device-A");
        assert_eq!(info.ip_address, "192.168.1.20");
        assert_eq!(info.service_port, 45678);
        assert!(info.is_online);
    }

    #[test]
    fn foreign_app_announces_are_ignored() {
        let mut announce: serde_json::Value =
            serde_json::from_slice(&announce_json("device-A", "PC")).unwrap();
        announce["app"] = "SomethingElse".into();
        let data = serde_json::to_vec(&announce).unwrap();
        assert!(parse_announce(&data, src(), "device-local").is_none());
    }

    #[test]
    fn own_announces_are_ignored() {
        let data = announce_json("device-local", "Me");
        assert!(parse_announce(&data, src(), "device-local").is_none());
    }

    #[test]
    fn empty_device_id_is_ignored() {
        let data = announce_json("", "Anonymous");
        assert!(parse_announce(&data, src(), "device-local").is_none());
    }

    #[test]
    fn incompatible_versions_are_ignored() {
        let mut announce: serde_json::Value =
            serde_json::from_slice(&announce_json("device-A", "PC")).unwrap();
        announce["protocolVersion"] = 0.into();
        let data = serde_json::to_vec(&announce).unwrap();
        assert!(parse_announce(&data, src(), "device-local").is_none());

        let mut announce: serde_json::Value =
            serde_json::from_slice(&announce_json("device-A", "PC")).unwrap();
        announce["minProtocolVersion"] = (PROTOCOL_VERSION + 1).into();
        let data = serde_json::to_vec(&announce).unwrap();
        assert!(parse_announce(&data, src(), "device-local").is_none());
    }

    #[test]
    fn malformed_datagrams_are_ignored() {
        assert!(parse_announce(b"not json", src(), "device-local").is_none());
        assert!(parse_announce(b"", src(), "device-local").is_none());
    }

    #[test]
    fn upsert_classifies_new_updated_refresh() {
        let mut devices = HashMap::new();
        let data = announce_json("device-A", "PC");
        let info = parse_announce(&data, src(), "device-local").unwrap();

        assert!(matches!(
            upsert_device(&mut devices, info.clone()),
            Some(DiscoveryEvent::Found(_))
        ));
        // Same IP and name: a plain refresh, no event.
        assert!(upsert_device(&mut devices, info.clone()).is_none());

        let moved = parse_announce(&data, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99)), "device-local")
            .unwrap();
        match upsert_device(&mut devices, moved) {
            Some(DiscoveryEvent::Updated(updated)) => {
                assert_eq!(updated.ip_address, "192.168.1.99");
            }
            other => panic!("expected Updated, got {:?}", other),
        }

        let renamed = parse_announce(
            &announce_json("device-A", "Renamed PC"),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 99)),
            "device-local",
        )
        .unwrap();
        assert!(matches!(
            upsert_device(&mut devices, renamed),
            Some(DiscoveryEvent::Updated(_))
        ));
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn reap_removes_only_expired_entries() {
        let mut devices = HashMap::new();
        let fresh = parse_announce(&announce_json("fresh", "A"), src(), "local").unwrap();
        upsert_device(&mut devices, fresh);
        let stale = parse_announce(&announce_json("stale", "B"), src(), "local").unwrap();
        upsert_device(&mut devices, stale);
        devices.get_mut("stale").unwrap().last_seen =
            Instant::now() - Duration::from_secs(60);

        let lost = reap_expired(&mut devices, Duration::from_secs(15));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].device_id, "stale");
        assert!(devices.contains_key("fresh"));
        assert!(!devices.contains_key("stale"));
    }
}
