use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use guard_core::backup_store::BackupStore;
use guard_core::crypto::EncryptionKey;
use guard_core::paths::{backup_dir, data_dir, key_path, settings_path};
use guard_core::settings::MonitorSettings;
use guard_service::enforcement::restore::RestoreReason;
use guard_service::engine::DEFAULT_EVENT_LIMIT;
use guard_service::{IntegritySink, MonitorService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock file integrity guard", long_about = None)]
struct Cli {
    /// Override the data directory (key file, settings, backups)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the data directory, key file and default settings
    Init,
    /// Take an encrypted backup of each file and enroll it
    Protect {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Stop protecting files and drop their backups
    Unprotect {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print enrolled files as JSON
    List,
    /// Monitor enrolled files until Ctrl-C
    Run,
}

const COOLDOWN_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Mirrors sink callbacks into the log.
struct TracingSink;

impl IntegritySink for TracingSink {
    fn on_violation(&self, path: &Path, expected_hash: &str, actual_hash: &str) {
        warn!(
            path = %path.display(),
            expected = expected_hash,
            actual = actual_hash,
            "integrity violation"
        );
    }

    fn on_restore(&self, path: &Path, reason: RestoreReason) {
        info!(path = %path.display(), %reason, "file restored");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let data = match cli.data_dir {
        Some(dir) => dir,
        None => data_dir()?,
    };
    match cli.command {
        Commands::Init => init_command(&data),
        Commands::Protect { paths } => protect_command(&data, &paths),
        Commands::Unprotect { paths } => unprotect_command(&data, &paths),
        Commands::List => list_command(&data),
        Commands::Run => run_command(&data).await,
    }
}

fn open_service(data: &Path) -> Result<MonitorService> {
    let settings = MonitorSettings::load(settings_path(data))
        .with_context(|| format!("loading settings from {}", data.display()))?;
    let service = MonitorService::open(settings, data)
        .with_context(|| format!("opening data directory {}", data.display()))?;
    service.load_enrolled()?;
    Ok(service)
}

fn init_command(data: &Path) -> Result<()> {
    std::fs::create_dir_all(data)?;
    EncryptionKey::load_or_generate(&key_path(data))?;
    let settings_file = settings_path(data);
    if settings_file.exists() {
        MonitorSettings::load(&settings_file)?;
    } else {
        MonitorSettings::default().save(&settings_file)?;
    }
    BackupStore::load_or_create(backup_dir(data))?;
    println!("Data directory ready: {}", data.display());
    Ok(())
}

fn protect_command(data: &Path, paths: &[PathBuf]) -> Result<()> {
    let service = open_service(data)?;
    for path in paths {
        let entry = service
            .protect_file(path)
            .with_context(|| format!("protecting {}", path.display()))?;
        println!("Protected: {} ({})", entry.path.display(), entry.baseline_hash);
    }
    Ok(())
}

fn unprotect_command(data: &Path, paths: &[PathBuf]) -> Result<()> {
    let service = open_service(data)?;
    for path in paths {
        if service.unprotect_file(path)? {
            println!("Unprotected: {}", path.display());
        } else {
            println!("Not protected: {}", path.display());
        }
    }
    Ok(())
}

fn list_command(data: &Path) -> Result<()> {
    let service = open_service(data)?;
    println!("{}", serde_json::to_string_pretty(&service.protected_files())?);
    Ok(())
}

async fn run_command(data: &Path) -> Result<()> {
    let service = open_service(data)?;
    if service.protected_files().is_empty() {
        bail!("no protected files; run `guard-service protect <path>` first");
    }
    if !service.start(Arc::new(TracingSink)) {
        let reason = service
            .get_events(1)
            .into_iter()
            .next()
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown".into());
        return Err(anyhow!("monitoring did not start: {reason}"));
    }

    let status = service.status();
    info!(
        protected = status.protected_count,
        directories = status.directory_count,
        cooldown_secs = service.settings().cooldown_secs,
        "monitoring; press Ctrl-C to stop"
    );

    let mut prune = tokio::time::interval(COOLDOWN_PRUNE_INTERVAL);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = prune.tick() => {
                let pruned = service.prune_cooldowns();
                if pruned > 0 {
                    debug!(pruned, "expired cooldown entries dropped");
                }
            }
        }
    }
    service.stop();

    println!("{}", serde_json::to_string_pretty(&service.status())?);
    println!(
        "{}",
        serde_json::to_string_pretty(&service.get_events(DEFAULT_EVENT_LIMIT))?
    );
    Ok(())
}
