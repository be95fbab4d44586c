//! In-process simulated WireGuard device
//!
//! Behaves like the kernel control channel and records every mutating call,
//! so convergence can be observed without touching the host.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tokio::sync::Mutex;

use super::{DeviceController, DeviceHandle, DeviceState, PeerState};
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::DeviceError;

/// A mutating call issued through the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutatingCall {
    CreateDevice { device: String },
    SetInterface { device: String, listen_port: u16 },
    AddAddress { device: String, address: Ipv4Net },
    RemoveAddress { device: String, address: Ipv4Net },
    UpsertPeer { device: String, public_key: PublicKey },
    RemovePeer { device: String, public_key: PublicKey },
}

#[derive(Default)]
struct SimDevice {
    index: u32,
    private_key: Option<PrivateKey>,
    listen_port: Option<u16>,
    addresses: BTreeSet<Ipv4Net>,
    peers: BTreeMap<PublicKey, PeerState>,
}

#[derive(Default)]
struct SimKernel {
    devices: BTreeMap<String, SimDevice>,
    next_index: u32,
    calls: Vec<MutatingCall>,
    unavailable: bool,
}

impl SimKernel {
    fn check_available(&self) -> Result<(), DeviceError> {
        if self.unavailable {
            return Err(DeviceError::Unavailable {
                reason: "wireguard module not loaded".to_string(),
            });
        }
        Ok(())
    }

    fn device(&mut self, device: &DeviceHandle) -> Result<&mut SimDevice, DeviceError> {
        self.check_available()?;
        self.devices
            .get_mut(device.name())
            .ok_or_else(|| DeviceError::NoSuchDevice {
                name: device.name().to_string(),
            })
    }
}

/// Simulated kernel device control channel
#[derive(Default)]
pub struct MemoryController {
    kernel: Mutex<SimKernel>,
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail as if the kernel module were missing
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.kernel.lock().await.unavailable = unavailable;
    }

    /// Mutating calls issued so far
    pub async fn calls(&self) -> Vec<MutatingCall> {
        self.kernel.lock().await.calls.clone()
    }

    /// Drain the call log
    pub async fn take_calls(&self) -> Vec<MutatingCall> {
        std::mem::take(&mut self.kernel.lock().await.calls)
    }
}

#[async_trait]
impl DeviceController for MemoryController {
    async fn lookup(&self, name: &str) -> Result<Option<DeviceHandle>, DeviceError> {
        let kernel = self.kernel.lock().await;
        kernel.check_available()?;
        Ok(kernel
            .devices
            .get(name)
            .map(|device| DeviceHandle::new(name, device.index)))
    }

    async fn create(&self, name: &str) -> Result<DeviceHandle, DeviceError> {
        let mut kernel = self.kernel.lock().await;
        kernel.check_available()?;
        if let Some(device) = kernel.devices.get(name) {
            return Err(DeviceError::CommandFailed {
                command: format!("link add {}", name),
                reason: format!("device {} (index {}) exists", name, device.index),
            });
        }

        kernel.next_index += 1;
        let index = kernel.next_index;
        kernel.devices.insert(
            name.to_string(),
            SimDevice {
                index,
                ..Default::default()
            },
        );
        kernel.calls.push(MutatingCall::CreateDevice {
            device: name.to_string(),
        });
        Ok(DeviceHandle::new(name, index))
    }

    async fn device_state(&self, device: &DeviceHandle) -> Result<DeviceState, DeviceError> {
        let mut kernel = self.kernel.lock().await;
        let sim = kernel.device(device)?;
        Ok(DeviceState {
            private_key: sim.private_key.clone(),
            listen_port: sim.listen_port,
            peers: sim.peers.clone(),
        })
    }

    async fn set_interface(
        &self,
        device: &DeviceHandle,
        private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError> {
        let mut kernel = self.kernel.lock().await;
        let sim = kernel.device(device)?;
        sim.private_key = Some(private_key.clone());
        sim.listen_port = Some(listen_port);
        kernel.calls.push(MutatingCall::SetInterface {
            device: device.name().to_string(),
            listen_port,
        });
        Ok(())
    }

    async fn addresses(&self, device: &DeviceHandle) -> Result<BTreeSet<Ipv4Net>, DeviceError> {
        let mut kernel = self.kernel.lock().await;
        Ok(kernel.device(device)?.addresses.clone())
    }

    async fn add_address(
        &self,
        device: &DeviceHandle,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        let mut kernel = self.kernel.lock().await;
        kernel.device(device)?.addresses.insert(address);
        kernel.calls.push(MutatingCall::AddAddress {
            device: device.name().to_string(),
            address,
        });
        Ok(())
    }

    async fn remove_address(
        &self,
        device: &DeviceHandle,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        let mut kernel = self.kernel.lock().await;
        kernel.device(device)?.addresses.remove(&address);
        kernel.calls.push(MutatingCall::RemoveAddress {
            device: device.name().to_string(),
            address,
        });
        Ok(())
    }

    async fn upsert_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
        allowed_ips: &BTreeSet<Ipv4Net>,
        persistent_keepalive: u16,
    ) -> Result<(), DeviceError> {
        let mut kernel = self.kernel.lock().await;
        kernel.device(device)?.peers.insert(
            *public_key,
            PeerState {
                allowed_ips: allowed_ips.iter().copied().map(IpNet::V4).collect(),
                persistent_keepalive,
            },
        );
        kernel.calls.push(MutatingCall::UpsertPeer {
            device: device.name().to_string(),
            public_key: *public_key,
        });
        Ok(())
    }

    async fn remove_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
    ) -> Result<(), DeviceError> {
        let mut kernel = self.kernel.lock().await;
        kernel.device(device)?.peers.remove(public_key);
        kernel.calls.push(MutatingCall::RemovePeer {
            device: device.name().to_string(),
            public_key: *public_key,
        });
        Ok(())
    }
}
