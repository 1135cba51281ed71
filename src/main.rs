//! CLI entry point for cryptobox.
//!
//! This binary manages a file-backed cryptobox: the local identity, prekey
//! bundles for publication, saved sessions and the configuration file.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use cryptobox::{
    utils::{CryptoboxConfig, DEFAULT_CONFIG_FILE},
    Cryptobox, FileStore, PreKeyBundle,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

/// Cryptobox - identity, prekey and session management
#[derive(Parser)]
#[command(name = "cryptobox")]
#[command(about = "Manage identities, prekeys and sessions for a Double Ratchet channel")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the identity, prekeys and sessions
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local identity if needed and show its fingerprint
    Identity {
        /// Display format (json, pretty)
        #[arg(short, long, default_value = "pretty")]
        format: String,
    },
    /// Generate one-time prekeys and print their bundles as base64
    Prekeys {
        /// First prekey id
        #[arg(short, long, default_value = "0")]
        start: u16,
        /// Number of prekeys to generate (defaults to prekeys.batch_size)
        #[arg(short, long)]
        count: Option<u16>,
    },
    /// Generate the last-resort prekey and print its bundle as base64
    LastResort,
    /// Manage saved sessions
    Session {
        #[command(subcommand)]
        action: SessionCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List saved sessions
    List,
    /// Delete a saved session
    Delete {
        /// Session id
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = CryptoboxConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command {
        Commands::Identity { format } => handle_identity_command(&format, &config).await,
        Commands::Prekeys { start, count } => {
            let count = count.unwrap_or(config.prekeys.batch_size);
            handle_prekeys_command(start, count, &config).await
        }
        Commands::LastResort => handle_last_resort_command(&config).await,
        Commands::Session { action } => handle_session_commands(action, &config).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

async fn open_store(config: &CryptoboxConfig) -> Result<Arc<FileStore>> {
    config.ensure_directories()?;
    Ok(Arc::new(FileStore::open(config.storage.clone()).await?))
}

async fn open_cryptobox(config: &CryptoboxConfig) -> Result<Cryptobox<FileStore>> {
    Ok(Cryptobox::open(open_store(config).await?).await?)
}

async fn handle_identity_command(format: &str, config: &CryptoboxConfig) -> Result<()> {
    let cbox = open_cryptobox(config).await?;

    match format {
        "json" => {
            let identity = serde_json::json!({
                "fingerprint": cbox.fingerprint(),
                "public_key": general_purpose::STANDARD.encode(cbox.identity().public_key().as_bytes()),
                "identity_file": config.storage.identity_file,
            });
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        "pretty" => {
            println!("Identity");
            println!("========");
            println!("Fingerprint: {}", cbox.fingerprint());
            println!("Stored in: {}", config.storage.identity_file.display());
        }
        _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
    }

    Ok(())
}

async fn handle_prekeys_command(start: u16, count: u16, config: &CryptoboxConfig) -> Result<()> {
    let cbox = open_cryptobox(config).await?;

    for bundle in cbox.new_prekeys(start, count).await? {
        print_bundle(&bundle)?;
    }
    if config.prekeys.generate_last_resort {
        print_bundle(&cbox.new_last_resort_prekey().await?)?;
    }

    info!("Prekeys stored in {}", config.storage.prekeys_dir.display());
    Ok(())
}

async fn handle_last_resort_command(config: &CryptoboxConfig) -> Result<()> {
    let cbox = open_cryptobox(config).await?;
    print_bundle(&cbox.new_last_resort_prekey().await?)
}

fn print_bundle(bundle: &[u8]) -> Result<()> {
    let prekey_id = PreKeyBundle::deserialise(bundle)?.prekey_id;
    println!("{}\t{}", prekey_id, general_purpose::STANDARD.encode(bundle));
    Ok(())
}

async fn handle_session_commands(action: SessionCommands, config: &CryptoboxConfig) -> Result<()> {
    match action {
        SessionCommands::List => {
            let store = open_store(config).await?;
            for id in store.session_ids().await? {
                println!("{}", id);
            }
        }
        SessionCommands::Delete { id } => {
            let cbox = open_cryptobox(config).await?;
            cbox.delete(&id).await?;
            println!("✓ Session deleted: {}", id);
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &CryptoboxConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = CryptoboxConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                CryptoboxConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
