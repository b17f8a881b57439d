//! Networking and synchronization core of the FamilyVault family file vault.
//!
//! Each device keeps a local catalog of its own files. This crate discovers
//! sibling devices on the LAN, opens sessions authenticated with the shared
//! key established at pairing, exchanges catalog deltas so every device sees
//! the family-visible files of the whole fleet, and streams file bodies on
//! demand into a local cache.
//!
//! The entry point is [`net::NetworkManager`]: construct it with the pairing
//! secrets, a [`catalog::CatalogStore`], a file resolver and a cache
//! directory, then consume its event stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use familyvault_net::catalog::MemoryCatalog;
//! use familyvault_net::config::NetworkConfig;
//! use familyvault_net::net::transfer::{FileResolver, ResolvedFile};
//! use familyvault_net::net::NetworkManager;
//! use familyvault_net::pairing::PairingSecrets;
//! use familyvault_net::types::DeviceType;
//!
//! # async fn run() -> familyvault_net::Result<()> {
//! let secrets = Arc::new(PairingSecrets::generate("Living Room PC", DeviceType::Desktop, [0u8; 32]));
//! let store = Arc::new(MemoryCatalog::new());
//! let resolver: FileResolver = Arc::new(|_| ResolvedFile::NotFound);
//! let (manager, mut events) = NetworkManager::new(
//!     NetworkConfig::default(),
//!     secrets,
//!     store,
//!     resolver,
//!     "/tmp/familyvault-cache".into(),
//! )?;
//! manager.start(0).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod net;
pub mod pairing;
pub mod types;

pub use config::NetworkConfig;
pub use error::{Result, VaultError};
pub use net::{NetworkEvent, NetworkManager};
pub use pairing::PairingSecrets;
pub use types::{DeviceInfo, DeviceType, NetworkState, Visibility};
