//! Pairing secrets consumed by the networking core.
//!
//! Pairing itself (PIN/QR exchange) happens elsewhere; the core only needs
//! the stable device identity and the 32-byte family PSK it produced.

use uuid::Uuid;

use crate::types::DeviceType;

/// Identity and key material established at pairing time. Immutable.
#[derive(Clone)]
pub struct PairingSecrets {
    device_id: String,
    device_name: String,
    device_type: DeviceType,
    psk: [u8; 32],
}

impl PairingSecrets {
    pub fn new(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        psk: [u8; 32],
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            psk,
        }
    }

    /// Mint a fresh identity with a random v4 UUID. The device name falls
    /// back to the hostname when empty.
    pub fn generate(device_name: &str, device_type: DeviceType, psk: [u8; 32]) -> Self {
        let name = if device_name.is_empty() {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "FamilyVault Device".to_string())
        } else {
            device_name.to_string()
        };
        Self {
            device_id: Uuid::new_v4().to_string(),
            device_name: name,
            device_type,
            psk,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn psk32(&self) -> &[u8; 32] {
        &self.psk
    }

    /// PSK identity presented during the channel handshake. Equals the
    /// device UUID.
    pub fn psk_identity(&self) -> &str {
        &self.device_id
    }
}

impl std::fmt::Debug for PairingSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The PSK never appears in logs.
        f.debug_struct("PairingSecrets")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("device_type", &self.device_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_mints_uuid_identity() {
        let secrets = PairingSecrets::generate("Laptop", DeviceType::Desktop, [7u8; 32]);
        assert_eq!(secrets.device_name(), "Laptop");
        assert_eq!(secrets.psk_identity(), secrets.device_id());
        assert!(Uuid::parse_str(secrets.device_id()).is_ok());
    }

    #[test]
    fn debug_hides_psk() {
        let secrets = PairingSecrets::generate("Laptop", DeviceType::Desktop, [9u8; 32]);
        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains("psk"));
    }
}
