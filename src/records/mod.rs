//! Interface and peer records
//!
//! These are the declarative records the engine converges the kernel device
//! to. Storing and querying them is the job of a [`RecordStore`];
//! [`Registry`] is the JSON-file backed store used by the CLI.

mod registry;

pub use registry::{default_registry_path, Registry, RegistryLock};

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};

use crate::crypto::{PrivateKey, PublicKey};
use crate::error::ValidationError;

/// Longest interface name the Linux kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Listen port used when none is given
pub const DEFAULT_LISTEN_PORT: u16 = 1194;

/// WireGuard interface record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Kernel device name, alphanumeric
    pub name: String,
    /// UDP listen port
    pub listen_port: u16,
    /// Addresses bound to the device, host bits kept (e.g. 10.0.0.1/24)
    #[serde(default)]
    pub addresses: Vec<Ipv4Net>,
    /// Generated on first sync when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
}

impl Interface {
    pub fn new(name: impl Into<String>, listen_port: u16) -> Self {
        Self {
            name: name.into(),
            listen_port,
            addresses: Vec::new(),
            private_key: None,
        }
    }

    /// Public key derived from the private key, if one is set
    pub fn public_key(&self) -> Option<PublicKey> {
        self.private_key.as_ref().map(PrivateKey::public_key)
    }

    /// The interface's own host addresses inside its subnets
    pub fn own_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.addresses.iter().map(|net| net.addr())
    }

    /// Whether `address` is a usable host of one of the interface subnets
    pub fn hosts_address(&self, address: Ipv4Addr) -> bool {
        self.addresses.iter().any(|net| {
            let subnet = net.trunc();
            subnet.contains(&address)
                && (subnet.prefix_len() >= 31
                    || (address != subnet.network() && address != subnet.broadcast()))
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_interface_name(&self.name)?;
        if self.listen_port == 0 {
            return Err(ValidationError::InvalidPort { port: 0 });
        }
        Ok(())
    }
}

/// Check an interface name against `^[A-Za-z0-9]+$` and the kernel length limit
pub fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric());

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Identity of a peer: its name is unique within its interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub interface: String,
    pub name: String,
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.interface)
    }
}

/// WireGuard peer record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Name of the owning interface
    pub interface: String,
    pub name: String,
    /// Only kept when private key storage is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKey>,
    /// Recomputed from the private key whenever one is present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// DNS servers for the rendered client config
    #[serde(default)]
    pub dns: Vec<IpAddr>,
    /// Address inside the tunnel, allocated on first sync when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,
    /// AllowedIPs of the rendered client config
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
    /// Extra routes the device accepts from this peer, besides its address
    #[serde(default)]
    pub interface_allowed_ips: Vec<Ipv4Net>,
    /// Keepalive of the rendered client config, 0 = off
    #[serde(default)]
    pub persistent_keepalive: u16,
    /// Keepalive pushed to the device, 0 = off
    #[serde(default)]
    pub interface_persistent_keepalive: u16,
}

impl Peer {
    pub fn new(interface: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            name: name.into(),
            private_key: None,
            public_key: None,
            dns: Vec::new(),
            address: None,
            allowed_ips: Vec::new(),
            interface_allowed_ips: Vec::new(),
            persistent_keepalive: 0,
            interface_persistent_keepalive: 0,
        }
    }

    pub fn id(&self) -> PeerId {
        PeerId {
            interface: self.interface.clone(),
            name: self.name.clone(),
        }
    }

    /// Apply key text supplied by an operator for a new peer
    ///
    /// At most one of the two keys may be given; a private key makes the
    /// public key derived.
    pub fn with_key_input(
        mut self,
        private_key: Option<&str>,
        public_key: Option<&str>,
    ) -> Result<Self, ValidationError> {
        match (private_key, public_key) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::ConflictingKeyInput {
                    peer: self.id().to_string(),
                })
            }
            (Some(text), None) => {
                let key: PrivateKey = text
                    .parse()
                    .map_err(|e| ValidationError::invalid_key("PrivateKey", e))?;
                self.public_key = Some(key.public_key());
                self.private_key = Some(key);
            }
            (None, Some(text)) => {
                let key: PublicKey = text
                    .parse()
                    .map_err(|e| ValidationError::invalid_key("PublicKey", e))?;
                self.public_key = Some(key);
                self.private_key = None;
            }
            (None, None) => {}
        }
        Ok(self)
    }

    /// Routes the device accepts from this peer: its own host route plus extras
    pub fn device_allowed_ips(&self) -> BTreeSet<Ipv4Net> {
        let mut routes: BTreeSet<Ipv4Net> =
            self.interface_allowed_ips.iter().map(Ipv4Net::trunc).collect();
        if let Some(address) = self.address {
            routes.insert(Ipv4Net::from(address));
        }
        routes
    }
}

/// Read access to the stored interface and peer records
pub trait RecordStore: Send + Sync {
    fn interfaces(&self) -> Vec<Interface>;

    fn interface(&self, name: &str) -> Option<Interface> {
        self.interfaces().into_iter().find(|iface| iface.name == name)
    }

    /// Every stored peer, across all interfaces
    fn peers(&self) -> Vec<Peer>;

    fn peers_of(&self, interface: &str) -> Vec<Peer> {
        self.peers()
            .into_iter()
            .filter(|peer| peer.interface == interface)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_name_validation() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("testInterface").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wg-0").is_err());
        assert!(validate_interface_name("averyveryverylongname").is_err());
    }

    #[test]
    fn test_interface_port_validation() {
        assert!(Interface::new("wg0", 51820).validate().is_ok());
        assert_eq!(
            Interface::new("wg0", 0).validate(),
            Err(ValidationError::InvalidPort { port: 0 })
        );
    }

    #[test]
    fn test_hosts_address_excludes_network_and_broadcast() {
        let mut iface = Interface::new("wg0", 1194);
        iface.addresses.push("10.0.0.1/24".parse().unwrap());

        assert!(iface.hosts_address("10.0.0.5".parse().unwrap()));
        assert!(!iface.hosts_address("10.0.0.0".parse().unwrap()));
        assert!(!iface.hosts_address("10.0.0.255".parse().unwrap()));
        assert!(!iface.hosts_address("10.0.1.5".parse().unwrap()));
    }

    #[test]
    fn test_key_input_conflict() {
        let key = PrivateKey::generate();
        let private = key.to_string();
        let public = key.public_key().to_string();

        let err = Peer::new("wg0", "laptop")
            .with_key_input(Some(&private), Some(&public))
            .unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingKeyInput { .. }));
    }

    #[test]
    fn test_key_input_private_derives_public() {
        let key = PrivateKey::generate();
        let peer = Peer::new("wg0", "laptop")
            .with_key_input(Some(&key.to_string()), None)
            .unwrap();
        assert_eq!(peer.public_key, Some(key.public_key()));
        assert_eq!(peer.private_key, Some(key));
    }

    #[test]
    fn test_key_input_rejects_bad_key() {
        let err = Peer::new("wg0", "laptop")
            .with_key_input(None, Some("dG9vIHNob3J0"))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidKey { .. }));
    }

    #[test]
    fn test_device_allowed_ips_include_host_route() {
        let mut peer = Peer::new("wg0", "router");
        peer.address = Some("10.0.0.7".parse().unwrap());
        peer.interface_allowed_ips = vec!["192.168.10.1/24".parse().unwrap()];

        let routes: Vec<String> = peer
            .device_allowed_ips()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(routes, vec!["10.0.0.7/32", "192.168.10.0/24"]);
    }
}
