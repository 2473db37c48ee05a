//! tunnel-rs-mesh
//!
//! Master process of the encrypted overlay mesh. Spawns the workers and
//! serves them configuration, peer mappings and stats collection.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tunnel_mesh::config::{expand_tilde, load_config, load_network_config};
use tunnel_mesh::{Config, PeerKey};

#[derive(Parser)]
#[command(name = "tunnel-rs-mesh")]
#[command(version)]
#[command(about = "Multi-queue encrypted overlay mesh")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the master and its workers
    Run {
        #[command(flatten)]
        options: ConfigOptions,
    },
    /// Validate the configuration and print it with defaults filled in
    CheckConfig {
        #[command(flatten)]
        options: ConfigOptions,
    },
    /// Generate peer keys (base64) for the `peers` table
    GenerateKey {
        /// Number of keys to generate
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
}

#[derive(clap::Args)]
struct ConfigOptions {
    /// Path to config file (default: ~/.config/tunnel-rs/mesh.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persisted network configuration (JSON) overriding `[network]`
    #[arg(long)]
    network_config: Option<PathBuf>,

    /// Number of worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Queues owned by each worker
    #[arg(short, long)]
    queues_per_worker: Option<usize>,

    /// UDP port shared by every socket queue
    #[arg(short = 'p', long)]
    listen_port: Option<u16>,

    /// TUN interface name
    #[arg(short, long)]
    device: Option<String>,

    /// Directory for the control socket and instance lock
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

impl ConfigOptions {
    /// Load the config file and apply command-line overrides.
    fn resolve(&self) -> Result<Config> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(path) = &self.network_config {
            config.network = load_network_config(path)?;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(queues) = self.queues_per_worker {
            config.queues_per_worker = queues;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(device) = &self.device {
            config.device_name = device.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = expand_tilde(dir);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Run { options } => tunnel_mesh::run_master(options.resolve()?).await,
        Command::CheckConfig { options } => {
            let config = options.resolve()?;
            config.validate().context("Invalid configuration")?;
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
            Ok(())
        }
        Command::GenerateKey { count } => {
            for _ in 0..count {
                println!("{}", PeerKey::generate().to_base64());
            }
            Ok(())
        }
    }
}
