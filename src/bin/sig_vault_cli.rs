//! Sig-Vault CLI - browse and transfer media on a NAS share or a Nextcloud account
//!
//! Usage:
//!   sig-vault ls [path]                    List a directory
//!   sig-vault get <remote> [--out path]    Download through the cache
//!   sig-vault put <local> [remote_dir]     Upload a file
//!   sig-vault cache list|evict|invalidate  Manage the local cache
//!   sig-vault quota                        Show used and free space

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::Level;

use sig_vault::vault_config::default_config_path;
use sig_vault::{
    load_vault_config_from, StorageMode, TransferHandle, TransferSnapshot, TransferState, Vault,
};

#[derive(Parser)]
#[command(
    name = "sig-vault",
    about = "Sig-Vault - media library over SMB shares and Nextcloud",
    version
)]
struct Cli {
    /// Settings file (default: <config dir>/sig-vault/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend to use instead of the configured default
    #[arg(long, value_enum, global = true)]
    mode: Option<ModeArg>,
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Local,
    Cloud,
}

impl From<ModeArg> for StorageMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Local => StorageMode::Local,
            ModeArg::Cloud => StorageMode::Cloud,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List a remote directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file into the cache
    Get {
        remote: String,
        /// Also copy the cached file here
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Upload a local file into a remote directory
    Put {
        local: PathBuf,
        #[arg(default_value = "/")]
        remote_dir: String,
    },
    /// Show used and free space on the backend
    Quota,
    /// Inspect or trim the local cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cached downloads
    List,
    /// Free at least this many bytes, oldest downloads first
    Evict { bytes: u64 },
    /// Force the next download of a remote file to refetch it
    Invalidate { remote: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_vault_config_from(&config_path)?;
    if let Some(mode) = cli.mode {
        config.default_mode = mode.into();
    }
    let vault = Vault::open(&config).await.with_context(|| {
        format!("Failed to open {:?} backend from {}", config.default_mode, config_path.display())
    })?;

    match cli.command {
        Commands::Ls { path } => {
            let entries = vault.browse_path(&path).await?;
            for entry in &entries {
                let size = match entry.size() {
                    Some(size) if !entry.is_dir() => HumanBytes(size).to_string(),
                    _ => "-".to_string(),
                };
                let modified = entry
                    .modified_at()
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let kind = if entry.is_dir() { "DIR" } else { "   " };
                println!("{} {:>10}  {:16}  {}", kind, size, modified, entry.name());
            }
            println!("{} entries", entries.len());
        }
        Commands::Get { remote, out } => {
            let handle = vault.download_path(&remote).await?;
            let snap = follow(&vault, handle, &remote).await?;
            if snap.from_cache {
                println!("Cached: {}", snap.local_path.display());
            } else {
                println!(
                    "Downloaded {} to {}",
                    HumanBytes(snap.bytes_done),
                    snap.local_path.display()
                );
            }
            if let Some(out) = out {
                let target = if out.is_dir() {
                    let name = snap.remote_ref.name().unwrap_or("download");
                    out.join(name)
                } else {
                    out
                };
                tokio::fs::copy(&snap.local_path, &target)
                    .await
                    .with_context(|| format!("Failed to copy to {}", target.display()))?;
                println!("Copied to {}", target.display());
            }
        }
        Commands::Put { local, remote_dir } => {
            if !local.is_file() {
                bail!("{} is not a file", local.display());
            }
            let dir = vault.parse_path(&remote_dir)?;
            let handle = vault.upload(&local, &dir).await?;
            let snap = follow(&vault, handle, &local.display().to_string()).await?;
            println!("Uploaded {} to {}", HumanBytes(snap.bytes_done), snap.remote_ref);
        }
        Commands::Quota => match vault.quota().await? {
            Some(quota) => {
                let show = |n: Option<u64>| n.map_or("unlimited".to_string(), |n| HumanBytes(n).to_string());
                println!(
                    "Used {}, free {}, total {}",
                    HumanBytes(quota.used),
                    show(quota.free),
                    show(quota.total)
                );
            }
            None => println!("This backend does not report a quota"),
        },
        Commands::Cache { action } => match action {
            CacheAction::List => {
                let mut records = vault.cache().records();
                records.sort_by_key(|r| r.fetched_at);
                for r in &records {
                    println!(
                        "{} {:>10}  {}  {}",
                        if r.stale { "STALE" } else { "     " },
                        HumanBytes(r.size_at_download).to_string(),
                        r.fetched_at.format("%Y-%m-%d %H:%M"),
                        r.remote_ref
                    );
                }
                println!(
                    "{} records, {} in {}",
                    records.len(),
                    HumanBytes(vault.cache().total_bytes()),
                    vault.cache().root().display()
                );
            }
            CacheAction::Evict { bytes } => {
                let report = vault.evict(bytes).await?;
                println!(
                    "Evicted {} records, freed {}",
                    report.evicted.len(),
                    HumanBytes(report.freed_bytes)
                );
            }
            CacheAction::Invalidate { remote } => {
                let remote_ref = vault.remote_ref(&remote)?;
                if vault.invalidate(&remote_ref).await? {
                    println!("Invalidated {}", remote_ref);
                } else {
                    println!("{} is not cached", remote_ref);
                }
            }
        },
    }
    Ok(())
}

/// Render progress until the job ends; Ctrl-C cancels it
async fn follow(vault: &Vault, handle: TransferHandle, label: &str) -> Result<TransferSnapshot> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::with_template(
            "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )?
        .progress_chars("=> "),
    );
    pb.set_message(label.to_string());

    let id = handle.id();
    let mut sub = handle.subscribe();
    let mut last = handle.snapshot();
    let mut interrupted = false;
    loop {
        tokio::select! {
            snap = sub.next() => match snap {
                Some(snap) => {
                    if let Some(total) = snap.bytes_total {
                        pb.set_length(total);
                    }
                    pb.set_position(snap.bytes_done);
                    last = snap;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                pb.set_message(format!("{} (cancelling)", label));
                vault.cancel(id)?;
            }
        }
    }
    pb.finish_and_clear();

    match last.state {
        TransferState::Succeeded => Ok(last),
        TransferState::Cancelled => bail!("Transfer {} cancelled", id),
        TransferState::Failed => {
            let reason = last
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            bail!("Transfer {} failed: {}", id, reason)
        }
        state => bail!("Transfer {} ended in {:?}", id, state),
    }
}
