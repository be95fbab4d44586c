//! Client configuration rendering
//!
//! Produces the `[Interface]`/`[Peer]` text a peer loads into its WireGuard
//! client, describing the peer's side of the tunnel.

use crate::crypto::PublicKey;
use crate::error::ValidationError;
use crate::records::{Interface, Peer};

use super::Settings;

/// Stand-in for a private key that is not retained
///
/// Deterministic and carries the peer's public key so an operator can match
/// it with the key handed out separately.
pub fn private_key_placeholder(public_key: &PublicKey) -> String {
    format!("<INSERT-PRIVATE-KEY-FOR:{}>", public_key)
}

fn unsynced(what: String, field: &str) -> ValidationError {
    ValidationError::Unsynced {
        what,
        field: field.to_string(),
    }
}

/// Render the client configuration for `peer` on `interface`
pub fn render_peer_config(
    peer: &Peer,
    interface: &Interface,
    settings: &Settings,
) -> Result<String, ValidationError> {
    let address = peer
        .address
        .ok_or_else(|| unsynced(peer.id().to_string(), "address"))?;
    let public_key = peer
        .public_key
        .ok_or_else(|| unsynced(peer.id().to_string(), "public key"))?;
    let server_key = interface
        .public_key()
        .ok_or_else(|| unsynced(interface.name.clone(), "private key"))?;

    let private_key = match &peer.private_key {
        Some(key) => key.to_string(),
        None => private_key_placeholder(&public_key),
    };

    // Bracket IPv6 literals so the port separator stays unambiguous
    let host = if settings.endpoint.contains(':') && !settings.endpoint.starts_with('[') {
        format!("[{}]", settings.endpoint)
    } else {
        settings.endpoint.clone()
    };

    let mut lines = vec![
        "[Interface]".to_string(),
        format!("Address={}/32", address),
        format!("PrivateKey={}", private_key),
    ];
    if !peer.dns.is_empty() {
        lines.push(format!("DNS={}", join(&peer.dns)));
    }
    lines.push("[Peer]".to_string());
    lines.push(format!("Endpoint={}:{}", host, interface.listen_port));
    lines.push(format!("PublicKey={}", server_key));
    lines.push(format!("AllowedIPs={}", join(&peer.allowed_ips)));
    if peer.persistent_keepalive > 0 {
        lines.push(format!("PersistentKeepalive={}", peer.persistent_keepalive));
    }

    let mut config = lines.join("\n");
    config.push('\n');
    Ok(config)
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
