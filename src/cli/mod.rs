use clap::{Parser, Subcommand};

pub mod config;
pub mod run;
pub mod verify;

use std::path::PathBuf;

use config::AgoraConfig;

#[derive(Parser)]
#[command(name = "agora")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Anonymous ballot ingestion and audit core", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the core services (anchor worker, analytics cache)
    Run {
        /// Path to config file (default: ./agora.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Verify the audit chain and every poll's Merkle root offline
    VerifyAudit {
        /// Path to config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the active receipt public key (SPKI PEM)
    ReceiptKey,

    /// Print a commented default configuration file
    DefaultConfig,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { config } => run::execute(load_config(config)?).await,
        Commands::VerifyAudit { config } => verify::execute(load_config(config)?).await,
        Commands::ReceiptKey => {
            let signer = run::load_signer(&AgoraConfig::default())?;
            print!("{}", signer.public_key_pem());
            Ok(())
        }
        Commands::DefaultConfig => {
            print!("{}", AgoraConfig::generate_default_toml());
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AgoraConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => AgoraConfig::load(&path),
        None => {
            let default_path = PathBuf::from("agora.toml");
            if default_path.exists() {
                AgoraConfig::load(&default_path)
            } else {
                Ok(AgoraConfig::default())
            }
        }
    }
}

/// Initialize tracing from the configured level.
pub fn init_logging(config: &AgoraConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
