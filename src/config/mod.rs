//! Settings and client configuration output
//!
//! - `settings`: process-wide options (endpoint host, key retention)
//! - `render`: standard WireGuard `.conf` text for a peer

mod render;
mod settings;

pub use render::{private_key_placeholder, render_peer_config};
pub use settings::{Settings, ENV_ENDPOINT, ENV_STORE_PRIVATE_KEYS};
