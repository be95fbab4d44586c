//! Kernel WireGuard device control
//!
//! [`DeviceController`] is the control channel the engine pushes desired
//! state through. Two implementations exist:
//!
//! - [`CommandController`] drives `ip` and `wg` against the kernel module
//! - [`MemoryController`] simulates the kernel in-process, for tests and
//!   dry runs
//!
//! Errors are never retried here; the caller decides.

mod command;
mod memory;

pub use command::CommandController;
pub use memory::{MemoryController, MutatingCall};

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::DeviceError;

/// Handle to an existing kernel device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    name: String,
    index: u32,
}

impl DeviceHandle {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel interface index
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// How [`DeviceController::ensure_device`] treats a missing device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureMode {
    /// Create the device when it does not exist
    Create,
    /// Fail with `NoSuchDevice` instead (diagnostics)
    LookupOnly,
}

/// Peer as currently configured on the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    pub allowed_ips: BTreeSet<IpNet>,
    /// 0 = off
    pub persistent_keepalive: u16,
}

/// Interface attributes and peers as currently configured on the device
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub private_key: Option<PrivateKey>,
    pub listen_port: Option<u16>,
    pub peers: BTreeMap<PublicKey, PeerState>,
}

impl DeviceState {
    /// Whether the interface attributes already match
    pub fn interface_matches(&self, private_key: &PrivateKey, listen_port: u16) -> bool {
        self.private_key.as_ref() == Some(private_key) && self.listen_port == Some(listen_port)
    }

    /// Whether a peer is already configured exactly like this
    pub fn peer_matches(
        &self,
        public_key: &PublicKey,
        allowed_ips: &BTreeSet<Ipv4Net>,
        persistent_keepalive: u16,
    ) -> bool {
        self.peers.get(public_key).is_some_and(|peer| {
            peer.persistent_keepalive == persistent_keepalive
                && peer.allowed_ips.len() == allowed_ips.len()
                && allowed_ips
                    .iter()
                    .all(|net| peer.allowed_ips.contains(&IpNet::V4(*net)))
        })
    }
}

/// Control surface of the kernel WireGuard device
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Find a device by name
    async fn lookup(&self, name: &str) -> Result<Option<DeviceHandle>, DeviceError>;

    /// Create a WireGuard device
    async fn create(&self, name: &str) -> Result<DeviceHandle, DeviceError>;

    /// Read interface attributes and peers
    async fn device_state(&self, device: &DeviceHandle) -> Result<DeviceState, DeviceError>;

    /// Apply private key and listen port
    async fn set_interface(
        &self,
        device: &DeviceHandle,
        private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError>;

    /// Addresses currently bound to the device
    async fn addresses(&self, device: &DeviceHandle) -> Result<BTreeSet<Ipv4Net>, DeviceError>;

    async fn add_address(&self, device: &DeviceHandle, address: Ipv4Net)
        -> Result<(), DeviceError>;

    async fn remove_address(
        &self,
        device: &DeviceHandle,
        address: Ipv4Net,
    ) -> Result<(), DeviceError>;

    /// Create the peer, or replace its allowed IPs and keepalive
    async fn upsert_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
        allowed_ips: &BTreeSet<Ipv4Net>,
        persistent_keepalive: u16,
    ) -> Result<(), DeviceError>;

    /// Remove the peer; no-op when it is not configured
    async fn remove_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
    ) -> Result<(), DeviceError>;

    /// Return a handle to the named device, creating it if requested
    async fn ensure_device(
        &self,
        name: &str,
        mode: EnsureMode,
    ) -> Result<DeviceHandle, DeviceError> {
        if let Some(device) = self.lookup(name).await? {
            return Ok(device);
        }

        match mode {
            EnsureMode::Create => {
                tracing::info!("Creating WireGuard device {}", name);
                self.create(name).await
            }
            EnsureMode::LookupOnly => Err(DeviceError::NoSuchDevice {
                name: name.to_string(),
            }),
        }
    }

    /// Converge the bound addresses to `desired`
    ///
    /// Only the symmetric difference is touched, stale entries first.
    /// Returns the number of add/remove operations issued.
    async fn set_addresses(
        &self,
        device: &DeviceHandle,
        desired: &BTreeSet<Ipv4Net>,
    ) -> Result<usize, DeviceError> {
        let current = self.addresses(device).await?;
        let mut changes = 0;

        for stale in current.difference(desired) {
            tracing::info!("Removing address {} from {}", stale, device.name());
            self.remove_address(device, *stale).await?;
            changes += 1;
        }

        for missing in desired.difference(&current) {
            tracing::info!("Adding address {} to {}", missing, device.name());
            self.add_address(device, *missing).await?;
            changes += 1;
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(items: &[&str]) -> BTreeSet<Ipv4Net> {
        items.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_ensure_device_lookup_only() {
        let controller = MemoryController::new();

        let err = controller
            .ensure_device("wg0", EnsureMode::LookupOnly)
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NoSuchDevice { .. }));

        let created = controller
            .ensure_device("wg0", EnsureMode::Create)
            .await
            .unwrap();
        let again = controller
            .ensure_device("wg0", EnsureMode::Create)
            .await
            .unwrap();
        assert_eq!(created, again);

        let found = controller
            .ensure_device("wg0", EnsureMode::LookupOnly)
            .await
            .unwrap();
        assert_eq!(found, created);
        assert_eq!(controller.take_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_set_addresses_touches_only_difference() {
        let controller = MemoryController::new();
        let device = controller.create("wg0").await.unwrap();
        controller
            .set_addresses(&device, &nets(&["10.0.0.1/24", "10.0.1.1/24"]))
            .await
            .unwrap();
        controller.take_calls().await;

        let changes = controller
            .set_addresses(&device, &nets(&["10.0.1.1/24", "10.0.2.1/24"]))
            .await
            .unwrap();
        assert_eq!(changes, 2);

        let calls = controller.take_calls().await;
        assert_eq!(
            calls,
            vec![
                MutatingCall::RemoveAddress {
                    device: "wg0".to_string(),
                    address: "10.0.0.1/24".parse().unwrap(),
                },
                MutatingCall::AddAddress {
                    device: "wg0".to_string(),
                    address: "10.0.2.1/24".parse().unwrap(),
                },
            ]
        );
        assert_eq!(
            controller.addresses(&device).await.unwrap(),
            nets(&["10.0.1.1/24", "10.0.2.1/24"])
        );

        let changes = controller
            .set_addresses(&device, &nets(&["10.0.1.1/24", "10.0.2.1/24"]))
            .await
            .unwrap();
        assert_eq!(changes, 0);
        assert!(controller.take_calls().await.is_empty());
    }

    #[test]
    fn test_peer_matches() {
        let key = PrivateKey::generate().public_key();
        let mut state = DeviceState::default();
        state.peers.insert(
            key,
            PeerState {
                allowed_ips: ["10.0.0.2/32".parse().unwrap()].into_iter().collect(),
                persistent_keepalive: 0,
            },
        );

        assert!(state.peer_matches(&key, &nets(&["10.0.0.2/32"]), 0));
        assert!(!state.peer_matches(&key, &nets(&["10.0.0.2/32"]), 25));
        assert!(!state.peer_matches(&key, &nets(&["10.0.0.3/32"]), 0));
        assert!(!state.peer_matches(&key, &nets(&["10.0.0.2/32", "10.1.0.0/16"]), 0));
    }
}
