//! wgsync CLI - WireGuard state synchronization
//!
//! Management commands over the record registry. Every command that changes
//! records runs them through the engine first, so the kernel devices and the
//! registry file never drift apart.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ipnet::{IpNet, Ipv4Net};
use tracing_subscriber::{fmt, EnvFilter};

use wgsync::device::DeviceController;
use wgsync::error::ValidationError;
use wgsync::records::{default_registry_path, DEFAULT_LISTEN_PORT};
use wgsync::{
    render_peer_config, CommandController, Engine, Interface, InterfaceSync, MemoryController,
    Peer, PeerId, PrivateKey, PublicKey, RecordStore, Registry, Settings, WgSyncError,
};

/// wgsync - keep WireGuard devices in sync with interface and peer records
#[derive(Parser, Debug)]
#[command(name = "wgsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the registry file (default: /var/lib/wgsync/registry.json)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Path to a TOML settings file
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Hostname peers use to reach the server
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Do not keep peer private keys in the registry
    #[arg(long, global = true)]
    no_store_private_keys: bool,

    /// Simulate the kernel and leave the registry untouched
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or update a WireGuard interface
    SetupInterface {
        name: String,

        /// UDP listen port (default: 1194, or the current port when updating)
        #[arg(long)]
        listen_port: Option<u16>,

        /// Use this private key instead of generating one
        #[arg(long)]
        private_key: Option<String>,

        /// Interface address in CIDR notation, repeatable; replaces the current list
        #[arg(long = "address")]
        addresses: Vec<Ipv4Net>,
    },

    /// Create a peer and print its client configuration
    CreatePeer {
        interface: String,
        name: String,

        /// Fixed address instead of the next free one
        #[arg(long)]
        address: Option<Ipv4Addr>,

        /// DNS server for the client, repeatable
        #[arg(long)]
        dns: Vec<IpAddr>,

        /// Networks the client routes through the tunnel, repeatable
        #[arg(long = "allowed-ips")]
        allowed_ips: Vec<IpNet>,

        /// Extra networks the server accepts from this peer, repeatable
        #[arg(long = "interface-allowed-ips")]
        interface_allowed_ips: Vec<Ipv4Net>,

        /// Keepalive interval written to the client configuration
        #[arg(long, default_value_t = 0)]
        persistent_keepalive: u16,

        /// Keepalive interval configured on the server side
        #[arg(long, default_value_t = 0)]
        interface_persistent_keepalive: u16,

        /// Use this private key instead of generating one
        #[arg(long, conflicts_with = "public_key")]
        private_key: Option<String>,

        /// Only register this public key; the client keeps its private key
        #[arg(long)]
        public_key: Option<String>,
    },

    /// Delete peers by public key
    DeletePeers {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        public_keys: Vec<String>,

        /// Delete every peer
        #[arg(long)]
        all: bool,
    },

    /// Drop every stored peer private key
    ClearPrivateKeys,

    /// Print the client configuration of a peer
    ShowConfig { interface: String, name: String },

    /// Converge every interface to the registry
    Sync,
}

impl Command {
    /// Whether the command talks to the kernel
    fn touches_devices(&self) -> bool {
        !matches!(self, Command::ClearPrivateKeys | Command::ShowConfig { .. })
    }

    /// Whether the command writes the registry
    fn mutates_registry(&self) -> bool {
        !matches!(self, Command::ShowConfig { .. })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<WgSyncError>() {
            Some(err) => {
                eprintln!("Error: {}", err.user_message());
                ExitCode::from(err.exit_code())
            }
            None => {
                eprintln!("Error: {:#}", e);
                ExitCode::from(255)
            }
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(&cli)?;

    let registry_path = cli.registry.clone().unwrap_or_else(default_registry_path);
    tracing::debug!("Loading registry from: {}", registry_path.display());
    let mut registry = if cli.command.mutates_registry() && !cli.dry_run {
        Registry::load_locked(&registry_path)
    } else {
        Registry::load(&registry_path)
    }
    .map_err(WgSyncError::from)?;

    let controller: Arc<dyn DeviceController> = if cli.dry_run {
        tracing::info!("Dry run: using the simulated kernel, the registry is not saved");
        Arc::new(MemoryController::new())
    } else {
        if cli.command.touches_devices() {
            check_privileges();
        }
        Arc::new(CommandController::with_paths(
            &settings.wg_path,
            &settings.ip_path,
        ))
    };
    let engine = Engine::new(controller, settings);

    let ctx = Context {
        engine: &engine,
        dry_run: cli.dry_run,
    };

    // Devices may have been reset since the last run
    if cli.command.touches_devices() {
        ctx.startup_sync(&mut registry).await?;
    }

    match cli.command {
        Command::SetupInterface {
            name,
            listen_port,
            private_key,
            addresses,
        } => {
            ctx.setup_interface(&mut registry, name, listen_port, private_key, addresses)
                .await?
        }
        Command::CreatePeer {
            interface,
            name,
            address,
            dns,
            allowed_ips,
            interface_allowed_ips,
            persistent_keepalive,
            interface_persistent_keepalive,
            private_key,
            public_key,
        } => {
            let mut peer = Peer::new(interface, name)
                .with_key_input(private_key.as_deref(), public_key.as_deref())
                .map_err(WgSyncError::from)?;
            peer.address = address;
            peer.dns = dns;
            peer.allowed_ips = allowed_ips;
            peer.interface_allowed_ips = interface_allowed_ips;
            peer.persistent_keepalive = persistent_keepalive;
            peer.interface_persistent_keepalive = interface_persistent_keepalive;

            let config = ctx.create_peer(&mut registry, peer).await?;
            print!("{}", config);
        }
        Command::DeletePeers { public_keys, all } => {
            ctx.delete_peers(&mut registry, &public_keys, all).await?
        }
        Command::ClearPrivateKeys => {
            let count = registry.clear_private_keys();
            ctx.save(&registry)?;
            println!("Cleared {} private keys", count);
        }
        Command::ShowConfig { interface, name } => {
            let config = show_config(&registry, engine.settings(), &interface, &name)?;
            print!("{}", config);
        }
        Command::Sync => tracing::info!("Sync complete"),
    }

    Ok(())
}

/// Settings file, then environment, then flags
fn load_settings(cli: &Cli) -> wgsync::Result<Settings> {
    let settings = match &cli.settings {
        Some(path) => {
            tracing::debug!("Loading settings from: {}", path.display());
            Settings::from_file(path)?
        }
        None => Settings::default(),
    };
    let mut settings = settings.with_env()?;

    if let Some(endpoint) = &cli.endpoint {
        settings.endpoint = endpoint.clone();
    }
    if cli.no_store_private_keys {
        settings.store_private_keys = false;
    }
    Ok(settings)
}

struct Context<'a> {
    engine: &'a Engine,
    dry_run: bool,
}

impl Context<'_> {
    fn save(&self, registry: &Registry) -> wgsync::Result<()> {
        if self.dry_run {
            tracing::debug!("Dry run: not saving the registry");
            return Ok(());
        }
        registry.save()?;
        Ok(())
    }

    /// Strip private keys that must not be retained
    fn retained(&self, mut peer: Peer) -> Peer {
        if !self.engine.settings().store_private_keys {
            peer.private_key = None;
        }
        peer
    }

    fn store_synced(&self, registry: &mut Registry, synced: InterfaceSync) {
        registry.upsert_interface(synced.interface);
        for peer in synced.peers {
            registry.upsert_peer(self.retained(peer));
        }
    }

    /// Converge every stored interface and persist the derived fields
    async fn startup_sync(&self, registry: &mut Registry) -> wgsync::Result<()> {
        let report = self.engine.sync_all(&*registry).await?;
        for synced in report.synced {
            self.store_synced(registry, synced);
        }
        self.save(registry)
    }

    async fn setup_interface(
        &self,
        registry: &mut Registry,
        name: String,
        listen_port: Option<u16>,
        private_key: Option<String>,
        addresses: Vec<Ipv4Net>,
    ) -> wgsync::Result<()> {
        let mut interface = registry
            .interface(&name)
            .unwrap_or_else(|| Interface::new(name, DEFAULT_LISTEN_PORT));

        if let Some(port) = listen_port {
            interface.listen_port = port;
        }
        if let Some(text) = private_key {
            interface.private_key = Some(
                text.parse()
                    .map_err(|e| ValidationError::invalid_key("PrivateKey", e))?,
            );
        }
        if !addresses.is_empty() {
            interface.addresses = addresses;
        }

        let synced = self.engine.sync_interface(&*registry, &interface).await?;
        let public_key = synced.interface.public_key();
        let (name, port) = (synced.interface.name.clone(), synced.interface.listen_port);
        self.store_synced(registry, synced);
        self.save(registry)?;

        if let Some(public_key) = public_key {
            println!(
                "Interface {} listening on port {} with public key {}",
                name, port, public_key
            );
        }
        Ok(())
    }

    /// Sync and store a new peer, returning its client configuration
    async fn create_peer(&self, registry: &mut Registry, peer: Peer) -> wgsync::Result<String> {
        let interface =
            registry
                .interface(&peer.interface)
                .ok_or_else(|| ValidationError::UnknownInterface {
                    name: peer.interface.clone(),
                })?;
        if registry.peer(&peer.id()).is_some() {
            return Err(ValidationError::DuplicateName {
                name: peer.id().to_string(),
            }
            .into());
        }

        // Without retention the key pair is made here, so the config below
        // is the only place the private key ever appears
        let mut peer = peer;
        if peer.private_key.is_none()
            && peer.public_key.is_none()
            && !self.engine.settings().store_private_keys
        {
            tracing::info!("Generating key pair for peer {}", peer.id());
            peer.private_key = Some(PrivateKey::generate());
        }

        let peer = self.engine.sync_peer(&*registry, peer).await?;

        // Rendered while the private key is still in memory
        let config = render_peer_config(&peer, &interface, self.engine.settings())?;

        registry.insert_peer(self.retained(peer))?;
        self.save(registry)?;
        Ok(config)
    }

    async fn delete_peers(
        &self,
        registry: &mut Registry,
        public_keys: &[String],
        all: bool,
    ) -> wgsync::Result<()> {
        let ids: Vec<PeerId> = if all {
            registry.peers().iter().map(Peer::id).collect()
        } else {
            let mut ids = Vec::new();
            for text in public_keys {
                let key: PublicKey = text
                    .parse()
                    .map_err(|e| ValidationError::invalid_key("PublicKey", e))?;
                match registry.peer_by_public_key(&key) {
                    Some(peer) => ids.push(peer.id()),
                    None => tracing::warn!("No peer with public key {}", key),
                }
            }
            ids
        };

        for id in ids {
            let Some(peer) = registry.peer(&id).cloned() else {
                continue;
            };
            self.engine.remove_peer(&peer).await?;
            registry.remove_peer(&id);
            self.save(registry)?;
            println!("Deleted peer {}", id);
        }
        Ok(())
    }
}

fn show_config(
    registry: &Registry,
    settings: &Settings,
    interface: &str,
    name: &str,
) -> wgsync::Result<String> {
    let iface = registry
        .interface(interface)
        .ok_or_else(|| ValidationError::UnknownInterface {
            name: interface.to_string(),
        })?;
    let id = PeerId {
        interface: interface.to_string(),
        name: name.to_string(),
    };
    let peer = registry.peer(&id).ok_or_else(|| ValidationError::UnknownPeer {
        peer: id.to_string(),
    })?;

    Ok(render_peer_config(peer, &iface, settings)?)
}

/// Warn when kernel commands are likely to be refused
fn check_privileges() {
    #[cfg(unix)]
    {
        if unsafe { libc::geteuid() } != 0 {
            tracing::warn!("Running without root. Device changes may fail.");
            tracing::warn!("Either run with sudo or grant CAP_NET_ADMIN to `ip` and `wg`.");
        }
    }
}
