use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eupay_core::audit::AuditLog;
use eupay_core::config::CoreConfig;
use eupay_core::iban::Iban;
use eupay_core::key_vault::KeyVault;
use eupay_core::paths;
use eupay_core::payload::EncryptedPayload;
use eupay_core::secure_storage::{KeyringStore, SecureStore};
use eupay_core::token_store::TokenStore;
use eupay_core::unlock::TicketLedger;

#[derive(Parser)]
#[command(name = "eupay")]
#[command(about = "EU Pay client security tooling", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Keyring account the identity and tokens are stored under
    #[arg(long, global = true, default_value = "default")]
    account: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the device identity, creating it on first use
    Identity,

    /// Validate an EU/EEA IBAN
    CheckIban { iban: String },

    /// Decode an encrypted payload header without decrypting it
    InspectPayload {
        /// Payload as base64, or hex with --hex
        payload: String,
        #[arg(long)]
        hex: bool,
    },

    /// Show recent private-key access entries
    Audit {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Remove the stored token pair
    Logout,
}

fn load_config(path: Option<PathBuf>) -> Result<CoreConfig> {
    let path = match path {
        Some(path) => path,
        None => paths::config_path()?,
    };
    CoreConfig::load(&path)
}

fn open_audit(config: &CoreConfig) -> Result<AuditLog> {
    let path = match &config.audit_log_path {
        Some(path) => path.clone(),
        None => paths::audit_log_path()?,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    AuditLog::open(&path, config.audit_log_max_bytes)
        .with_context(|| format!("open audit log {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "eupay_core=warn,eupay=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identity => {
            let config = load_config(cli.config)?;
            let store: Arc<dyn SecureStore> = Arc::new(KeyringStore::new(cli.account));
            let vault = KeyVault::new(
                store,
                TicketLedger::new(config.ticket_ttl()),
                Arc::new(open_audit(&config)?),
            );
            let public = vault.ensure_identity().context("load device identity")?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "agreement_key": public.agreement,
                    "signing_key": hex::encode(public.signing),
                    "fingerprint": public.fingerprint(),
                }))?
            );
        }

        Commands::CheckIban { iban } => match Iban::parse(&iban) {
            Ok(iban) => println!("valid {} ({})", iban, iban.country()),
            Err(err) => {
                eprintln!("invalid: {err}");
                std::process::exit(1);
            }
        },

        Commands::InspectPayload { payload, hex } => {
            let parsed = if hex {
                let bytes = hex::decode(payload.trim()).context("decode hex payload")?;
                EncryptedPayload::from_bytes(&bytes)?
            } else {
                EncryptedPayload::from_b64(&payload)?
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": parsed.version,
                    "sender_public_key": parsed.sender_public_key,
                    "sender_fingerprint": parsed.sender_public_key.fingerprint(),
                    "nonce": hex::encode(parsed.nonce),
                    "ciphertext_len": parsed.ciphertext.len(),
                    "tag": hex::encode(parsed.tag),
                    "digest": parsed.digest(),
                }))?
            );
        }

        Commands::Audit { limit } => {
            let config = load_config(cli.config)?;
            let log = open_audit(&config)?;
            for entry in log.read_recent(Some(limit))? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            let intact = log.verify_chain()?;
            println!("chain {}", if intact { "intact" } else { "BROKEN" });
            if !intact {
                std::process::exit(2);
            }
        }

        Commands::Logout => {
            let store: Arc<dyn SecureStore> = Arc::new(KeyringStore::new(cli.account));
            let tokens = TokenStore::load(store)?;
            tokens.invalidate()?;
            tracing::info!("signed out");
            println!("signed out");
        }
    }

    Ok(())
}
