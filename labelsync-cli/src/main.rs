use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use labelsync_core::{
    get_default_config_path, get_default_wallet_path, LabelSyncConfig, LabelSyncError,
    LocalWallet, PullOutcome, SessionRegistry, SqliteStorage, Storage, SyncClient, SyncObserver,
    Wallet,
};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Storage key the wallet fingerprint is remembered under.
const FINGERPRINT_KEY: &str = "fingerprint";

/// Label Sync CLI - keep wallet labels in step with a label server
#[derive(Parser)]
#[command(name = "labelsync")]
#[command(about = "Encrypted wallet label sync", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Label server URL, overriding the config file
    #[arg(long, global = true)]
    server: Option<String>,

    /// Wallet database path
    #[arg(long, global = true)]
    wallet: Option<PathBuf>,

    /// Wallet fingerprint (e.g. master public key); stored on first use
    #[arg(long, global = true)]
    fingerprint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set a label locally and upload it
    Set {
        /// Address, txid or other label key
        key: String,

        /// Label text
        label: String,
    },

    /// List local labels
    List,

    /// Upload every local label
    Push,

    /// Fetch labels from the server
    Pull {
        /// Re-fetch everything and overwrite local labels
        #[arg(long)]
        force: bool,
    },

    /// Show sync status
    Status,
}

/// Prints sync events the user should act on.
struct CliObserver;

impl SyncObserver for CliObserver {
    fn on_pulled(&self, wallet: &Arc<dyn Wallet>, outcome: &PullOutcome) {
        if let PullOutcome::Merged {
            applied, dropped, ..
        } = outcome
        {
            println!("{}: {} labels updated, {} unreadable", wallet.name(), applied, dropped);
        }
    }

    fn on_wallet_not_synced(&self, wallet: &Arc<dyn Wallet>) {
        eprintln!(
            "{} is out of sync with the label server, run `labelsync pull --force`",
            wallet.name()
        );
    }

    fn on_request_failure(&self, wallet: &Arc<dyn Wallet>, error: &LabelSyncError) {
        eprintln!("{}: label upload failed: {}", wallet.name(), error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(get_default_config_path);
    let mut config = LabelSyncConfig::load_or_default(&config_path)?;
    if let Some(server) = &cli.server {
        config.server_url = server.trim_end_matches('/').to_string();
    }

    let wallet_path = cli
        .wallet
        .clone()
        .or_else(|| config.storage_path.clone())
        .unwrap_or_else(get_default_wallet_path);
    let wallet = Arc::new(open_wallet(&wallet_path, cli.fingerprint.as_deref())?);

    if let Commands::List = cli.command {
        let mut labels: Vec<_> = wallet.labels()?.into_iter().collect();
        labels.sort();
        for (key, label) in labels {
            println!("{}\t{}", key, label);
        }
        return Ok(());
    }

    let client = SyncClient::new(&config)?;
    let registry = SessionRegistry::new(client, Arc::new(CliObserver))?;
    let identity = wallet.identity();

    if !registry.start_wallet(wallet.clone()) {
        bail!(
            "wallet {} has no fingerprint, pass --fingerprint once to enable sync",
            wallet_path.display()
        );
    }
    // Let the initial pull land before acting on local state.
    registry.wait_idle().await;

    match cli.command {
        Commands::Set { key, label } => {
            {
                let mut state = wallet.lock_state()?;
                state.labels.insert(key.clone(), label.clone());
                state.persist_labels()?;
            }
            if registry.set_label(identity, &key, &label) {
                info!("Uploading label for {}", key);
            } else {
                warn!("Label for {:?} kept locally only", key);
            }
        }
        Commands::Push => {
            registry.push(identity);
        }
        Commands::Pull { force } => match registry.pull(identity, force).await? {
            PullOutcome::Unchanged => println!("Labels are up to date"),
            PullOutcome::Deferred => println!("Pull failed, see log"),
            PullOutcome::Merged { .. } | PullOutcome::Inactive => {}
        },
        Commands::Status => {
            if let Some(status) = registry.status(identity)? {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        }
        Commands::List => {}
    }

    let report = registry.shutdown().await?;
    info!(
        "Done: {} wallet(s) stopped, {} task(s) joined",
        report.wallets_stopped, report.tasks_joined
    );
    Ok(())
}

/// Open the wallet database, remembering a newly supplied fingerprint.
fn open_wallet(path: &Path, fingerprint: Option<&str>) -> Result<LocalWallet> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut storage = SqliteStorage::open(path)
        .with_context(|| format!("opening wallet {}", path.display()))?;

    let fingerprint = match fingerprint {
        Some(fp) => {
            storage.put(FINGERPRINT_KEY, Value::String(fp.to_string()))?;
            Some(fp.to_string())
        }
        None => match storage.get(FINGERPRINT_KEY)? {
            Some(Value::String(fp)) => Some(fp),
            _ => None,
        },
    };

    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wallet".to_string());

    Ok(LocalWallet::open(
        name,
        fingerprint.map(String::into_bytes),
        Box::new(storage),
    )?)
}
