//! Error types for wgsync

use std::net::Ipv4Addr;

use thiserror::Error;

/// Main error type for wgsync
#[derive(Error, Debug)]
pub enum WgSyncError {
    /// Record validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Address allocation errors
    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),

    /// Kernel device control errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Record registry errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Settings file errors
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Key decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid base64")]
    InvalidEncoding,

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// Interface and peer record validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid key in {field}: {source}")]
    InvalidKey {
        field: String,
        #[source]
        source: KeyError,
    },

    #[error("Both a private and a public key were supplied for peer {peer}")]
    ConflictingKeyInput { peer: String },

    #[error("Peer {peer} has no key and private key storage is disabled")]
    MissingRequiredKey { peer: String },

    #[error("Public key {public_key} is already used by peer {owner}")]
    DuplicateKey { public_key: String, owner: String },

    #[error("Invalid interface name: {name}")]
    InvalidName { name: String },

    #[error("Invalid listen port: {port}")]
    InvalidPort { port: u32 },

    #[error("Address {address} is not a host of any subnet of interface {interface}")]
    AddressOutsideSubnets { address: Ipv4Addr, interface: String },

    #[error("Address {address} is already in use by {owner}")]
    AddressInUse { address: Ipv4Addr, owner: String },

    #[error("A record named {name} already exists")]
    DuplicateName { name: String },

    #[error("Unknown interface: {name}")]
    UnknownInterface { name: String },

    #[error("Unknown peer: {peer}")]
    UnknownPeer { peer: String },

    #[error("{what} is not synchronized yet: missing {field}")]
    Unsynced { what: String, field: String },
}

/// Address allocation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("No free address left in the subnets of interface {interface}")]
    SubnetExhausted { interface: String },
}

/// Kernel device control channel errors
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No such device: {name}")]
    NoSuchDevice { name: String },

    #[error("Device control channel unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Unexpected output from `{command}`: {reason}")]
    BadOutput { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Record registry errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write registry {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry {path} is locked by another process")]
    Locked { path: String },

    #[error("Failed to lock registry {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt registry {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings loading errors
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Settings file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid settings file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {variable}: {value}")]
    InvalidEnv { variable: String, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ValidationError {
    /// Wrap a key decoding failure with the name of the offending field
    pub fn invalid_key(field: &str, source: KeyError) -> Self {
        Self::InvalidKey {
            field: field.to_string(),
            source,
        }
    }
}

impl WgSyncError {
    /// Whether the kernel control channel could not be reached at all
    pub fn is_device_unavailable(&self) -> bool {
        matches!(self, Self::Device(DeviceError::Unavailable { .. }))
    }

    /// Get a user-friendly error message with suggested action
    pub fn user_message(&self) -> String {
        match self {
            Self::Device(DeviceError::Unavailable { reason }) => {
                format!(
                    "Cannot reach the WireGuard control channel ({}).\n  \
                    Check that the wireguard kernel module is loaded and that \
                    `ip` and `wg` are installed. Run as root or grant CAP_NET_ADMIN.",
                    reason
                )
            }

            Self::Allocation(AllocationError::SubnetExhausted { interface }) => {
                format!(
                    "Interface {} has no free address left.\n  \
                    Add another subnet with `setup-interface {} --address ...` \
                    or delete unused peers.",
                    interface, interface
                )
            }

            Self::Validation(ValidationError::InvalidKey { field, .. }) => {
                format!(
                    "Invalid {}. Expected 32-byte base64-encoded key.",
                    field
                )
            }

            Self::Validation(ValidationError::MissingRequiredKey { peer }) => {
                format!(
                    "Peer {} needs a --private-key or --public-key because \
                    private key storage is disabled.",
                    peer
                )
            }

            _ => format!("{}", self),
        }
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 1,
            Self::Allocation(_) => 2,
            Self::Device(DeviceError::Unavailable { .. }) => 3,
            Self::Device(_) => 4,
            Self::Store(_) => 5,
            Self::Settings(_) => 6,
        }
    }
}

/// Result type alias for wgsync operations
pub type Result<T> = std::result::Result<T, WgSyncError>;
