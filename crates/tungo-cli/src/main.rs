use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use tundev::{SystemClock, TunManager};
use tungo_client::ClientRouter;
use tungo_core::config::{ClientConfig, ConnectionSettings, ServerConfig};
use tungo_core::keys::Identity;
use tungo_server::Server;

#[derive(Parser, Debug)]
#[command(name = "tungo", version, about = "Point-to-point VPN over TCP or UDP")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Data directory for key material
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a tunnel client
    Client {
        /// Client configuration file (JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Run as a tunnel server
    Server {
        /// Server configuration file (JSON)
        #[arg(long)]
        config: PathBuf,
    },

    /// Generate an Ed25519 identity and print both halves, base64
    Keygen {
        /// Also persist the private key to this file
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tungo")
    });

    match cli.cmd {
        Commands::Client { config } => {
            let config = ClientConfig::load(&config)
                .with_context(|| format!("loading client config {:?}", config))?;
            let identity = load_optional_identity(&data_dir)?;
            let manager = tun_manager(config.active())?;

            let router = ClientRouter::new(config, manager, identity);
            router.run(interrupt_token()).await?;
        }

        Commands::Server { config } => {
            let config = ServerConfig::load(&config)
                .with_context(|| format!("loading server config {:?}", config))?;
            let manager = tun_manager(config.device_settings())?;
            let server = Server::new(config, manager, Arc::new(SystemClock))?;

            server.run(interrupt_token()).await?;
        }

        Commands::Keygen { out } => {
            let identity = Identity::generate();
            if let Some(path) = &out {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, identity.private_base64())
                    .with_context(|| format!("writing {:?}", path))?;
                println!("private key written to {}", path.display());
            } else {
                println!("ed25519Private: {}", identity.private_base64());
            }
            println!("ed25519Public:  {}", identity.public_base64());
            println!("fingerprint:    {}", identity.fingerprint());
        }
    }

    Ok(())
}

/// A token that fires on ctrl-c, so supervisors run their teardown
/// instead of being dropped mid-flight.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; tearing down");
            signal.cancel();
        }
    });
    cancel
}

/// The client's own long-term key, if one has been provisioned. Only
/// needed against servers that enforce an allow-list.
fn load_optional_identity(data_dir: &PathBuf) -> Result<Option<Identity>> {
    let path = data_dir.join("identity.key");
    if path.exists() {
        Ok(Some(Identity::load(&path)?))
    } else {
        Ok(None)
    }
}

#[cfg(unix)]
fn tun_manager(settings: &ConnectionSettings) -> Result<Arc<dyn TunManager>> {
    use std::net::Ipv4Addr;
    use tundev::os::{OsTunConfig, OsTunManager};

    let address: Ipv4Addr = settings
        .interface_address
        .parse()
        .context("interfaceAddress must be an IPv4 address for the tun device")?;
    Ok(OsTunManager::new(OsTunConfig {
        name: settings.interface_name.clone(),
        address,
        prefix: settings.interface_ip_cidr,
        mtu: settings.mtu,
    }))
}

#[cfg(not(unix))]
fn tun_manager(_settings: &ConnectionSettings) -> Result<Arc<dyn TunManager>> {
    anyhow::bail!("no tun device backend for this platform")
}
