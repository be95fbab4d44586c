//! Reconciliation engine
//!
//! Converges the kernel WireGuard devices to the interface and peer records.
//! The record-store layer calls [`Engine::sync_interface`],
//! [`Engine::sync_peer`] and [`Engine::remove_peer`] around each mutation
//! and persists the derived fields (generated keys, allocated addresses)
//! that come back. [`Engine::sync_all`] is the startup pass.
//!
//! Every push reads the device state first and only issues the operations
//! that change something, so re-running a sync is free of side effects.
//!
//! Pushes for one interface are serialized behind a per-interface lock, in
//! the order device, interface attributes, addresses, peers. Address
//! allocation additionally goes through an engine-wide lease table so two
//! peers created concurrently never receive the same address, even before
//! either has been persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError};

use ipnet::Ipv4Net;
use tokio::sync::Mutex;

use crate::allocator;
use crate::config::Settings;
use crate::crypto::{PrivateKey, PublicKey};
use crate::device::{DeviceController, DeviceHandle, DeviceState, EnsureMode};
use crate::error::{DeviceError, Result, ValidationError};
use crate::records::{Interface, Peer, PeerId, RecordStore};

/// Records after an interface sync, with derived fields filled in
#[derive(Debug, Clone)]
pub struct InterfaceSync {
    pub interface: Interface,
    pub peers: Vec<Peer>,
}

/// Outcome of [`Engine::sync_all`]
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Interfaces that were converged
    pub synced: Vec<InterfaceSync>,
    /// Interfaces skipped because the control channel was unavailable
    pub unavailable: Vec<String>,
}

/// Drives a [`DeviceController`] towards the stored records
pub struct Engine {
    controller: Arc<dyn DeviceController>,
    settings: Settings,
    /// One lock per interface name
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Addresses handed out, possibly not persisted yet
    leases: std::sync::Mutex<BTreeMap<PeerId, Ipv4Addr>>,
}

impl Engine {
    pub fn new(controller: Arc<dyn DeviceController>, settings: Settings) -> Self {
        Self {
            controller,
            settings,
            locks: std::sync::Mutex::new(HashMap::new()),
            leases: std::sync::Mutex::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn interface_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Converge the sync of every interface in the store
    ///
    /// An unreachable control channel (e.g. the wireguard module is not
    /// loaded yet) skips the interface; every other error aborts the pass.
    pub async fn sync_all(&self, store: &dyn RecordStore) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for interface in store.interfaces() {
            match self.sync_interface(store, &interface).await {
                Ok(synced) => report.synced.push(synced),
                Err(e) if e.is_device_unavailable() => {
                    tracing::warn!("Skipping interface {}: {}", interface.name, e);
                    report.unavailable.push(interface.name.clone());
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            "Startup sync finished: {} synced, {} unavailable",
            report.synced.len(),
            report.unavailable.len()
        );
        Ok(report)
    }

    /// Converge one interface and all of its stored peers
    pub async fn sync_interface(
        &self,
        store: &dyn RecordStore,
        interface: &Interface,
    ) -> Result<InterfaceSync> {
        interface.validate()?;

        let mut interface = interface.clone();
        if interface.private_key.is_none() {
            tracing::info!("Generating private key for interface {}", interface.name);
            interface.private_key = Some(PrivateKey::generate());
        }

        let lock = self.interface_lock(&interface.name);
        let _guard = lock.lock().await;

        let (device, state) = self.push_interface(&interface).await?;

        let mut peers = Vec::new();
        for peer in store.peers_of(&interface.name) {
            let peer = self.push_peer(store, &interface, &device, &state, peer).await?;
            peers.push(peer);
        }

        Ok(InterfaceSync { interface, peers })
    }

    /// Converge one peer, allocating its address and keys when missing
    ///
    /// The owning interface is read from the store and must have been
    /// synced already.
    pub async fn sync_peer(&self, store: &dyn RecordStore, peer: Peer) -> Result<Peer> {
        let interface =
            store
                .interface(&peer.interface)
                .ok_or_else(|| ValidationError::UnknownInterface {
                    name: peer.interface.clone(),
                })?;
        interface.validate()?;
        if interface.private_key.is_none() {
            return Err(ValidationError::Unsynced {
                what: interface.name.clone(),
                field: "private key".to_string(),
            }
            .into());
        }

        let lock = self.interface_lock(&interface.name);
        let _guard = lock.lock().await;

        let (device, state) = self.push_interface(&interface).await?;
        self.push_peer(store, &interface, &device, &state, peer).await
    }

    /// Remove a peer from its device ahead of purging the record
    pub async fn remove_peer(&self, peer: &Peer) -> Result<()> {
        let lock = self.interface_lock(&peer.interface);
        let _guard = lock.lock().await;

        self.release(&peer.id());

        let Some(public_key) = peer.public_key else {
            tracing::debug!("Peer {} has no public key, nothing to remove", peer.id());
            return Ok(());
        };

        let device = match self
            .controller
            .ensure_device(&peer.interface, EnsureMode::LookupOnly)
            .await
        {
            Ok(device) => device,
            Err(DeviceError::NoSuchDevice { name }) => {
                tracing::debug!("Device {} does not exist, nothing to remove", name);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!("Removing peer {} ({})", peer.id(), public_key.short());
        self.controller.remove_peer(&device, &public_key).await?;
        Ok(())
    }

    /// Ensure the device, then push interface attributes and addresses
    ///
    /// Caller holds the interface lock.
    async fn push_interface(
        &self,
        interface: &Interface,
    ) -> Result<(DeviceHandle, DeviceState)> {
        let private_key = interface
            .private_key
            .as_ref()
            .ok_or_else(|| ValidationError::Unsynced {
                what: interface.name.clone(),
                field: "private key".to_string(),
            })?;

        let device = self
            .controller
            .ensure_device(&interface.name, EnsureMode::Create)
            .await?;
        let state = self.controller.device_state(&device).await?;

        if state.interface_matches(private_key, interface.listen_port) {
            tracing::debug!("Interface {} attributes up to date", interface.name);
        } else {
            tracing::info!(
                "Configuring interface {} (listen port {})",
                interface.name,
                interface.listen_port
            );
            self.controller
                .set_interface(&device, private_key, interface.listen_port)
                .await?;
        }

        let desired: BTreeSet<Ipv4Net> = interface.addresses.iter().copied().collect();
        let changes = self.controller.set_addresses(&device, &desired).await?;
        if changes == 0 {
            tracing::debug!("Interface {} addresses up to date", interface.name);
        }

        Ok((device, state))
    }

    /// Resolve keys and address of a peer, then push it to the device
    ///
    /// Caller holds the interface lock. `state` is the device state read
    /// before this push sequence.
    async fn push_peer(
        &self,
        store: &dyn RecordStore,
        interface: &Interface,
        device: &DeviceHandle,
        state: &DeviceState,
        peer: Peer,
    ) -> Result<Peer> {
        let (peer, replaced) = self.resolve_keys(peer)?;
        check_unique_key(store, &peer)?;

        let leased = peer.address.is_none();
        let peer = self.assign_address(store, interface, peer)?;

        let mut result = self.upsert(device, state, &peer).await;
        if result.is_ok() {
            if let Some(stale) = replaced {
                result = self.remove_stale_key(store, device, state, &peer, &stale).await;
            }
        }
        if result.is_err() && leased {
            self.release(&peer.id());
        }
        result.map(|_| peer)
    }

    /// Drop a replaced public key from the device unless another peer owns it
    async fn remove_stale_key(
        &self,
        store: &dyn RecordStore,
        device: &DeviceHandle,
        state: &DeviceState,
        peer: &Peer,
        stale: &PublicKey,
    ) -> Result<()> {
        if !state.peers.contains_key(stale) {
            return Ok(());
        }
        let id = peer.id();
        if store
            .peers()
            .iter()
            .any(|other| other.id() != id && other.public_key.as_ref() == Some(stale))
        {
            return Ok(());
        }

        tracing::info!("Removing replaced key {} of peer {}", stale.short(), id);
        self.controller.remove_peer(device, stale).await?;
        Ok(())
    }

    async fn upsert(&self, device: &DeviceHandle, state: &DeviceState, peer: &Peer) -> Result<()> {
        let public_key = peer
            .public_key
            .ok_or_else(|| ValidationError::MissingRequiredKey {
                peer: peer.id().to_string(),
            })?;
        let allowed_ips = peer.device_allowed_ips();

        if state.peer_matches(&public_key, &allowed_ips, peer.interface_persistent_keepalive) {
            tracing::debug!("Peer {} up to date", peer.id());
            return Ok(());
        }

        tracing::info!(
            "Configuring peer {} ({}) with {} allowed ips",
            peer.id(),
            public_key.short(),
            allowed_ips.len()
        );
        self.controller
            .upsert_peer(
                device,
                &public_key,
                &allowed_ips,
                peer.interface_persistent_keepalive,
            )
            .await?;
        Ok(())
    }

    /// Apply the key invariants: a private key always determines the public key
    ///
    /// Returns the peer and the stale public key it replaced, if any.
    fn resolve_keys(&self, mut peer: Peer) -> Result<(Peer, Option<PublicKey>)> {
        let mut replaced = None;
        match (&peer.private_key, &peer.public_key) {
            (Some(private_key), stored) => {
                let derived = private_key.public_key();
                if let Some(stored) = stored.filter(|stored| *stored != derived) {
                    tracing::warn!(
                        "Replacing stale public key of peer {} with the derived one",
                        peer.id()
                    );
                    replaced = Some(stored);
                }
                peer.public_key = Some(derived);
            }
            (None, Some(_)) => {}
            (None, None) => {
                if !self.settings.store_private_keys {
                    return Err(ValidationError::MissingRequiredKey {
                        peer: peer.id().to_string(),
                    }
                    .into());
                }
                tracing::info!("Generating key pair for peer {}", peer.id());
                let private_key = PrivateKey::generate();
                peer.public_key = Some(private_key.public_key());
                peer.private_key = Some(private_key);
            }
        }
        Ok((peer, replaced))
    }

    /// Validate a configured address or lease a free one
    fn assign_address(
        &self,
        store: &dyn RecordStore,
        interface: &Interface,
        mut peer: Peer,
    ) -> Result<Peer> {
        let id = peer.id();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);

        let mut owners: BTreeMap<Ipv4Addr, String> = store
            .peers()
            .into_iter()
            .filter(|other| other.id() != id)
            .filter_map(|other| other.address.map(|address| (address, other.id().to_string())))
            .collect();
        for (owner, address) in leases.iter() {
            if owner != &id {
                owners.entry(*address).or_insert_with(|| owner.to_string());
            }
        }

        let address = match peer.address {
            Some(address) => {
                if !interface.hosts_address(address) {
                    return Err(ValidationError::AddressOutsideSubnets {
                        address,
                        interface: interface.name.clone(),
                    }
                    .into());
                }
                if interface.own_addresses().any(|own| own == address) {
                    return Err(ValidationError::AddressInUse {
                        address,
                        owner: interface.name.clone(),
                    }
                    .into());
                }
                if let Some(owner) = owners.get(&address) {
                    return Err(ValidationError::AddressInUse {
                        address,
                        owner: owner.clone(),
                    }
                    .into());
                }
                address
            }
            None => {
                let occupied: BTreeSet<Ipv4Addr> = owners.keys().copied().collect();
                let address = allocator::allocate(interface, &occupied)?;
                tracing::info!("Allocated {} to peer {}", address, id);
                address
            }
        };

        leases.insert(id, address);
        peer.address = Some(address);
        Ok(peer)
    }

    fn release(&self, id: &PeerId) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Reject a public key already used by another peer
fn check_unique_key(store: &dyn RecordStore, peer: &Peer) -> Result<()> {
    let Some(public_key) = peer.public_key else {
        return Ok(());
    };
    let id = peer.id();

    match store
        .peers()
        .into_iter()
        .find(|other| other.id() != id && other.public_key == Some(public_key))
    {
        Some(owner) => Err(ValidationError::DuplicateKey {
            public_key: public_key.to_string(),
            owner: owner.id().to_string(),
        }
        .into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryController, MutatingCall};
    use crate::error::{AllocationError, WgSyncError};
    use crate::records::Registry;

    fn setup(settings: Settings) -> (Arc<MemoryController>, Engine, Registry) {
        let controller = Arc::new(MemoryController::new());
        let engine = Engine::new(controller.clone(), settings);

        let mut registry = Registry::in_memory();
        let mut iface = Interface::new("wg0", 1194);
        iface.addresses.push("10.0.0.1/24".parse().unwrap());
        registry.upsert_interface(iface);
        (controller, engine, registry)
    }

    /// Sync the interface and persist what comes back
    async fn sync_and_store(engine: &Engine, registry: &mut Registry, name: &str) {
        let iface = registry.interface(name).unwrap();
        let synced = engine.sync_interface(&*registry, &iface).await.unwrap();
        registry.upsert_interface(synced.interface);
        for peer in synced.peers {
            registry.upsert_peer(peer);
        }
    }

    async fn create_peer(engine: &Engine, registry: &mut Registry, peer: Peer) -> Peer {
        let peer = engine.sync_peer(&*registry, peer).await.unwrap();
        registry.upsert_peer(peer.clone());
        peer
    }

    #[tokio::test]
    async fn test_sync_interface_generates_key_and_pushes() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        let iface = registry.interface("wg0").unwrap();
        assert!(iface.private_key.is_some());

        let calls = controller.calls().await;
        assert_eq!(
            calls,
            vec![
                MutatingCall::CreateDevice {
                    device: "wg0".to_string()
                },
                MutatingCall::SetInterface {
                    device: "wg0".to_string(),
                    listen_port: 1194
                },
                MutatingCall::AddAddress {
                    device: "wg0".to_string(),
                    address: "10.0.0.1/24".parse().unwrap()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_second_sync_is_a_no_op() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;
        create_peer(&engine, &mut registry, Peer::new("wg0", "phone")).await;

        sync_and_store(&engine, &mut registry, "wg0").await;
        controller.take_calls().await;

        sync_and_store(&engine, &mut registry, "wg0").await;
        assert!(controller.take_calls().await.is_empty());

        engine.sync_all(&registry).await.unwrap();
        assert!(controller.take_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_listen_port_change_is_pushed() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        controller.take_calls().await;

        let mut iface = registry.interface("wg0").unwrap();
        iface.listen_port = 51820;
        registry.upsert_interface(iface);
        sync_and_store(&engine, &mut registry, "wg0").await;

        assert_eq!(
            controller.take_calls().await,
            vec![MutatingCall::SetInterface {
                device: "wg0".to_string(),
                listen_port: 51820
            }]
        );
    }

    #[tokio::test]
    async fn test_peer_gets_address_and_keys() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        let peer = create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;
        assert_eq!(peer.address, Some(Ipv4Addr::new(10, 0, 0, 2)));
        let private_key = peer.private_key.clone().unwrap();
        assert_eq!(peer.public_key, Some(private_key.public_key()));

        let device = controller.lookup("wg0").await.unwrap().unwrap();
        let state = controller.device_state(&device).await.unwrap();
        let expected: BTreeSet<Ipv4Net> = ["10.0.0.2/32".parse().unwrap()].into_iter().collect();
        assert!(state.peer_matches(&private_key.public_key(), &expected, 0));
    }

    #[tokio::test]
    async fn test_sequential_allocations_are_unique() {
        let (_controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        let mut seen = BTreeSet::new();
        for i in 0..40 {
            let peer =
                create_peer(&engine, &mut registry, Peer::new("wg0", format!("peer{}", i))).await;
            let address = peer.address.unwrap();
            assert_ne!(address, Ipv4Addr::new(10, 0, 0, 1));
            assert!(seen.insert(address));
        }
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let (_controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        // Both see the same store snapshot, neither is persisted in between
        let (a, b) = tokio::join!(
            engine.sync_peer(&registry, Peer::new("wg0", "a")),
            engine.sync_peer(&registry, Peer::new("wg0", "b")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.address, b.address);
    }

    #[tokio::test]
    async fn test_exhaustion_is_typed() {
        let (_controller, engine, mut registry) = setup(Settings::default());
        let mut iface = registry.interface("wg0").unwrap();
        iface.addresses = vec!["10.0.0.1/29".parse().unwrap()];
        registry.upsert_interface(iface);
        sync_and_store(&engine, &mut registry, "wg0").await;

        // .2 through .6
        for i in 0..5 {
            create_peer(&engine, &mut registry, Peer::new("wg0", format!("peer{}", i))).await;
        }

        let err = engine
            .sync_peer(&registry, Peer::new("wg0", "onemore"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Allocation(AllocationError::SubnetExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_public_key_is_overwritten() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        // Device first knows the peer under an unrelated key
        let stale = PrivateKey::generate().public_key();
        let mut peer = Peer::new("wg0", "laptop");
        peer.public_key = Some(stale);
        let mut peer = create_peer(&engine, &mut registry, peer).await;
        controller.take_calls().await;

        let private_key = PrivateKey::generate();
        peer.private_key = Some(private_key.clone());
        registry.upsert_peer(peer);

        sync_and_store(&engine, &mut registry, "wg0").await;
        let stored = registry.peers_of("wg0");
        let derived = private_key.public_key();
        assert_eq!(stored[0].public_key, Some(derived));

        assert_eq!(
            controller.take_calls().await,
            vec![
                MutatingCall::UpsertPeer {
                    device: "wg0".to_string(),
                    public_key: derived
                },
                MutatingCall::RemovePeer {
                    device: "wg0".to_string(),
                    public_key: stale
                },
            ]
        );

        let device = controller.lookup("wg0").await.unwrap().unwrap();
        let state = controller.device_state(&device).await.unwrap();
        assert!(!state.peers.contains_key(&stale));
        assert!(state.peers.contains_key(&derived));

        // Converged: nothing left to push
        sync_and_store(&engine, &mut registry, "wg0").await;
        assert!(controller.take_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_without_retention() {
        let settings = Settings {
            store_private_keys: false,
            ..Settings::default()
        };
        let (_controller, engine, mut registry) = setup(settings);
        sync_and_store(&engine, &mut registry, "wg0").await;

        let err = engine
            .sync_peer(&registry, Peer::new("wg0", "laptop"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Validation(ValidationError::MissingRequiredKey { .. })
        ));

        // a public key alone is fine
        let mut peer = Peer::new("wg0", "laptop");
        peer.public_key = Some(PrivateKey::generate().public_key());
        let peer = engine.sync_peer(&registry, peer).await.unwrap();
        assert!(peer.private_key.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_public_key_rejected_before_push() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        let first = create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;
        controller.take_calls().await;

        let mut clone = Peer::new("wg0", "clone");
        clone.public_key = first.public_key;
        let err = engine.sync_peer(&registry, clone).await.unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Validation(ValidationError::DuplicateKey { .. })
        ));
        assert!(controller.take_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_explicit_address_validation() {
        let (_controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;

        let mut peer = Peer::new("wg0", "outside");
        peer.address = Some(Ipv4Addr::new(192, 168, 1, 10));
        assert!(matches!(
            engine.sync_peer(&registry, peer).await.unwrap_err(),
            WgSyncError::Validation(ValidationError::AddressOutsideSubnets { .. })
        ));

        let mut peer = Peer::new("wg0", "gateway");
        peer.address = Some(Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(
            engine.sync_peer(&registry, peer).await.unwrap_err(),
            WgSyncError::Validation(ValidationError::AddressInUse { .. })
        ));

        let mut peer = Peer::new("wg0", "twin");
        peer.address = Some(Ipv4Addr::new(10, 0, 0, 2));
        assert!(matches!(
            engine.sync_peer(&registry, peer).await.unwrap_err(),
            WgSyncError::Validation(ValidationError::AddressInUse { .. })
        ));

        let mut peer = Peer::new("wg0", "chosen");
        peer.address = Some(Ipv4Addr::new(10, 0, 0, 200));
        let peer = engine.sync_peer(&registry, peer).await.unwrap();
        assert_eq!(peer.address, Some(Ipv4Addr::new(10, 0, 0, 200)));
    }

    #[tokio::test]
    async fn test_remove_peer_is_not_recreated() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        let peer = create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;
        controller.take_calls().await;

        engine.remove_peer(&peer).await.unwrap();
        registry.remove_peer(&peer.id());

        assert_eq!(
            controller.take_calls().await,
            vec![MutatingCall::RemovePeer {
                device: "wg0".to_string(),
                public_key: peer.public_key.unwrap()
            }]
        );

        engine.sync_all(&registry).await.unwrap();
        assert!(controller.take_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_removed_address_is_reusable() {
        let (_controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;
        let peer = create_peer(&engine, &mut registry, Peer::new("wg0", "laptop")).await;

        engine.remove_peer(&peer).await.unwrap();
        registry.remove_peer(&peer.id());

        let next = create_peer(&engine, &mut registry, Peer::new("wg0", "phone")).await;
        assert_eq!(next.address, peer.address);
    }

    #[tokio::test]
    async fn test_sync_all_swallows_only_unavailable() {
        let (controller, engine, registry) = setup(Settings::default());
        controller.set_unavailable(true).await;

        let report = engine.sync_all(&registry).await.unwrap();
        assert!(report.synced.is_empty());
        assert_eq!(report.unavailable, vec!["wg0".to_string()]);

        let iface = registry.interface("wg0").unwrap();
        let err = engine.sync_interface(&registry, &iface).await.unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Device(DeviceError::Unavailable { .. })
        ));

        controller.set_unavailable(false).await;
        let mut broken = Registry::in_memory();
        broken.upsert_interface(Interface::new("bad-name", 1194));
        assert!(engine.sync_all(&broken).await.is_err());
    }

    #[tokio::test]
    async fn test_sync_peer_requires_synced_interface() {
        let (controller, engine, registry) = setup(Settings::default());
        let err = engine
            .sync_peer(&registry, Peer::new("wg0", "laptop"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Validation(ValidationError::Unsynced { .. })
        ));
        assert!(controller.calls().await.is_empty());

        let err = engine
            .sync_peer(&registry, Peer::new("wg7", "laptop"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WgSyncError::Validation(ValidationError::UnknownInterface { .. })
        ));
    }

    #[tokio::test]
    async fn test_interface_allowed_ips_and_keepalive_pushed() {
        let (controller, engine, mut registry) = setup(Settings::default());
        sync_and_store(&engine, &mut registry, "wg0").await;

        let mut peer = Peer::new("wg0", "router");
        peer.interface_allowed_ips = vec!["192.168.50.0/24".parse().unwrap()];
        peer.interface_persistent_keepalive = 25;
        let peer = create_peer(&engine, &mut registry, peer).await;

        let device = controller.lookup("wg0").await.unwrap().unwrap();
        let state = controller.device_state(&device).await.unwrap();
        assert!(state.peer_matches(
            &peer.public_key.unwrap(),
            &peer.device_allowed_ips(),
            25
        ));
        assert_eq!(peer.device_allowed_ips().len(), 2);
    }
}
