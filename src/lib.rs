//! wgsync - WireGuard state synchronization
//!
//! Keeps kernel WireGuard devices in line with a set of interface and peer
//! records, and renders client configurations for the peers.
//!
//! # Features
//!
//! - Curve25519 key generation and derivation
//! - Idempotent device convergence (only changed state is pushed)
//! - Lowest-free-host address allocation, safe under concurrent creation
//! - Client `.conf` rendering, with a placeholder when private keys are not kept
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wgsync::{CommandController, Engine, Registry, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::load("/var/lib/wgsync/registry.json")?;
//!     let engine = Engine::new(Arc::new(CommandController::new()), Settings::default());
//!     engine.sync_all(&registry).await?;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod crypto;
pub mod device;
pub mod engine;
pub mod error;
pub mod records;

pub use config::{render_peer_config, Settings};
pub use crypto::{PrivateKey, PublicKey};
pub use device::{CommandController, DeviceController, MemoryController};
pub use engine::{Engine, InterfaceSync, SyncReport};
pub use error::{Result, WgSyncError};
pub use records::{Interface, Peer, PeerId, RecordStore, Registry};
