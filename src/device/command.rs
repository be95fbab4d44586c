//! Command-line WireGuard device control
//!
//! Drives the kernel module through `ip` (iproute2) and `wg`
//! (wireguard-tools). Both tools talk netlink to the kernel, so this is the
//! same control channel with a stable text interface in front of it.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use tokio::process::Command;

use super::{DeviceController, DeviceHandle, DeviceState, PeerState};
use crate::crypto::{PrivateKey, PublicKey};
use crate::error::DeviceError;

/// Device control through the `ip` and `wg` commands
#[derive(Debug, Clone)]
pub struct CommandController {
    /// Path to wg command (default: "wg")
    wg_path: String,
    /// Path to ip command (default: "ip")
    ip_path: String,
}

impl Default for CommandController {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandController {
    /// Create a controller using `wg` and `ip` from PATH
    pub fn new() -> Self {
        Self::with_paths("wg", "ip")
    }

    /// Create with custom command paths
    pub fn with_paths(wg_path: impl Into<String>, ip_path: impl Into<String>) -> Self {
        Self {
            wg_path: wg_path.into(),
            ip_path: ip_path.into(),
        }
    }

    /// Run a command and return its stdout
    async fn exec<S: AsRef<str> + Sync>(
        &self,
        program: &str,
        args: &[S],
        device: &str,
    ) -> Result<String, DeviceError> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let command_line = format!("{} {}", program, args.join(" "));
        tracing::debug!("Executing: {}", command_line);

        let output = Command::new(program).args(&args).output().await.map_err(|e| {
            match e.kind() {
                std::io::ErrorKind::NotFound => DeviceError::Unavailable {
                    reason: format!("{} not found", program),
                },
                std::io::ErrorKind::PermissionDenied => DeviceError::Unavailable {
                    reason: format!("permission denied running {}", program),
                },
                _ => DeviceError::Io(e),
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&command_line, stderr.trim(), device));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn ip<S: AsRef<str> + Sync>(&self, args: &[S], device: &str) -> Result<String, DeviceError> {
        self.exec(&self.ip_path, args, device).await
    }

    async fn wg<S: AsRef<str> + Sync>(&self, args: &[S], device: &str) -> Result<String, DeviceError> {
        self.exec(&self.wg_path, args, device).await
    }

    /// Write a key to an owner-only temp file for `wg set ... private-key`
    fn write_temp_key(key: &PrivateKey) -> Result<tempfile::NamedTempFile, DeviceError> {
        let mut file = tempfile::NamedTempFile::new()?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        file.write_all(key.to_string().as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}

#[async_trait]
impl DeviceController for CommandController {
    async fn lookup(&self, name: &str) -> Result<Option<DeviceHandle>, DeviceError> {
        match self.ip(&["-o", "link", "show", "dev", name], name).await {
            Ok(output) => parse_link_index(&output)
                .map(|index| Some(DeviceHandle::new(name, index)))
                .ok_or_else(|| DeviceError::BadOutput {
                    command: "ip -o link show".to_string(),
                    reason: format!("no interface index in {:?}", output.trim()),
                }),
            Err(DeviceError::NoSuchDevice { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, name: &str) -> Result<DeviceHandle, DeviceError> {
        self.ip(&["link", "add", "dev", name, "type", "wireguard"], name)
            .await?;
        self.lookup(name)
            .await?
            .ok_or_else(|| DeviceError::NoSuchDevice {
                name: name.to_string(),
            })
    }

    async fn device_state(&self, device: &DeviceHandle) -> Result<DeviceState, DeviceError> {
        let output = self.wg(&["show", device.name(), "dump"], device.name()).await?;
        parse_wg_dump(&output)
    }

    async fn set_interface(
        &self,
        device: &DeviceHandle,
        private_key: &PrivateKey,
        listen_port: u16,
    ) -> Result<(), DeviceError> {
        let key_file = Self::write_temp_key(private_key)?;
        let key_path = key_file.path().to_string_lossy().to_string();

        self.wg(
            &interface_args(device.name(), listen_port, &key_path),
            device.name(),
        )
        .await?;
        Ok(())
    }

    async fn addresses(&self, device: &DeviceHandle) -> Result<BTreeSet<Ipv4Net>, DeviceError> {
        let output = self
            .ip(&["-o", "-4", "address", "show", "dev", device.name()], device.name())
            .await?;
        parse_ip_addresses(&output)
    }

    async fn add_address(
        &self,
        device: &DeviceHandle,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        self.ip(&address_args("add", address, device.name()), device.name())
            .await?;
        Ok(())
    }

    async fn remove_address(
        &self,
        device: &DeviceHandle,
        address: Ipv4Net,
    ) -> Result<(), DeviceError> {
        self.ip(&address_args("del", address, device.name()), device.name())
            .await?;
        Ok(())
    }

    async fn upsert_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
        allowed_ips: &BTreeSet<Ipv4Net>,
        persistent_keepalive: u16,
    ) -> Result<(), DeviceError> {
        self.wg(
            &peer_args(device.name(), public_key, allowed_ips, persistent_keepalive),
            device.name(),
        )
        .await?;
        Ok(())
    }

    async fn remove_peer(
        &self,
        device: &DeviceHandle,
        public_key: &PublicKey,
    ) -> Result<(), DeviceError> {
        let key = public_key.to_string();
        self.wg(&["set", device.name(), "peer", &key, "remove"], device.name())
            .await?;
        Ok(())
    }
}

/// `wg set` arguments for the interface attributes
fn interface_args(device: &str, listen_port: u16, key_path: &str) -> Vec<String> {
    vec![
        "set".to_string(),
        device.to_string(),
        "listen-port".to_string(),
        listen_port.to_string(),
        "private-key".to_string(),
        key_path.to_string(),
    ]
}

/// `ip address add|del` arguments
fn address_args(action: &str, address: Ipv4Net, device: &str) -> Vec<String> {
    vec![
        "-4".to_string(),
        "address".to_string(),
        action.to_string(),
        address.to_string(),
        "dev".to_string(),
        device.to_string(),
    ]
}

/// `wg set ... peer` arguments; the allowed IPs replace the current list
fn peer_args(
    device: &str,
    public_key: &PublicKey,
    allowed_ips: &BTreeSet<Ipv4Net>,
    persistent_keepalive: u16,
) -> Vec<String> {
    let allowed = allowed_ips
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let keepalive = match persistent_keepalive {
        0 => "off".to_string(),
        seconds => seconds.to_string(),
    };

    vec![
        "set".to_string(),
        device.to_string(),
        "peer".to_string(),
        public_key.to_string(),
        "persistent-keepalive".to_string(),
        keepalive,
        "allowed-ips".to_string(),
        allowed,
    ]
}

/// Map a failed command's stderr onto the device error kinds
fn classify_failure(command: &str, stderr: &str, device: &str) -> DeviceError {
    const MISSING: [&str; 3] = ["does not exist", "No such device", "Cannot find device"];
    const UNREACHABLE: [&str; 4] = [
        "Operation not permitted",
        "Protocol not supported",
        "Unknown device type",
        "Operation not supported",
    ];

    if MISSING.iter().any(|m| stderr.contains(m)) {
        DeviceError::NoSuchDevice {
            name: device.to_string(),
        }
    } else if UNREACHABLE.iter().any(|m| stderr.contains(m)) {
        DeviceError::Unavailable {
            reason: stderr.to_string(),
        }
    } else {
        DeviceError::CommandFailed {
            command: command.to_string(),
            reason: stderr.to_string(),
        }
    }
}

/// Parse the index out of `ip -o link show` ("7: wg0: <POINTOPOINT,...")
fn parse_link_index(output: &str) -> Option<u32> {
    output.lines().next()?.split(':').next()?.trim().parse().ok()
}

/// Parse `ip -o -4 address show`
///
/// ```text
/// 7: wg0    inet 10.0.0.1/24 scope global wg0\       valid_lft forever preferred_lft forever
/// ```
fn parse_ip_addresses(output: &str) -> Result<BTreeSet<Ipv4Net>, DeviceError> {
    let mut addresses = BTreeSet::new();

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        if fields.by_ref().find(|field| *field == "inet").is_none() {
            continue;
        }

        let value = fields.next().unwrap_or_default();
        let address: Ipv4Net = value.parse().map_err(|_| DeviceError::BadOutput {
            command: "ip -o -4 address show".to_string(),
            reason: format!("invalid address {:?}", value),
        })?;
        addresses.insert(address);
    }

    Ok(addresses)
}

/// Parse `wg show <dev> dump`
///
/// The first line holds the interface (private key, public key, listen port,
/// fwmark); every other line is a peer (public key, preshared key, endpoint,
/// allowed ips, latest handshake, rx, tx, persistent keepalive), tab separated.
fn parse_wg_dump(output: &str) -> Result<DeviceState, DeviceError> {
    let bad = |reason: String| DeviceError::BadOutput {
        command: "wg show dump".to_string(),
        reason,
    };

    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let interface = lines
        .next()
        .ok_or_else(|| bad("empty output".to_string()))?;

    let fields: Vec<&str> = interface.split('\t').collect();
    if fields.len() < 3 {
        return Err(bad(format!("short interface line {:?}", interface)));
    }

    let private_key = match fields[0] {
        "(none)" => None,
        text => Some(
            text.parse::<PrivateKey>()
                .map_err(|e| bad(format!("private key: {}", e)))?,
        ),
    };

    let listen_port = match fields[2]
        .parse::<u16>()
        .map_err(|_| bad(format!("listen port {:?}", fields[2])))?
    {
        0 => None,
        port => Some(port),
    };

    let mut peers = BTreeMap::new();
    for line in lines {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 8 {
            return Err(bad(format!("short peer line {:?}", line)));
        }

        let public_key: PublicKey = fields[0]
            .parse()
            .map_err(|e| bad(format!("peer public key: {}", e)))?;

        let allowed_ips = match fields[3] {
            "(none)" | "" => BTreeSet::new(),
            list => list
                .split(',')
                .map(|net| {
                    net.trim()
                        .parse::<IpNet>()
                        .map_err(|_| bad(format!("allowed ip {:?}", net)))
                })
                .collect::<Result<BTreeSet<_>, _>>()?,
        };

        let persistent_keepalive = match fields[7] {
            "off" => 0,
            seconds => seconds
                .parse()
                .map_err(|_| bad(format!("keepalive {:?}", seconds)))?,
        };

        peers.insert(
            public_key,
            PeerState {
                allowed_ips,
                persistent_keepalive,
            },
        );
    }

    Ok(DeviceState {
        private_key,
        listen_port,
        peers,
    })
}
