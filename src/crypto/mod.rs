//! Key management for WireGuard
//!
//! Generation, parsing and derivation of X25519 key pairs (keys).

pub mod keys;

pub use keys::{PrivateKey, PublicKey, KEY_LEN};
