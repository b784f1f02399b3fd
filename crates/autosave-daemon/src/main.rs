//! autosave-daemon: Headless autosave for a directory of drafts.
//!
//! Each `<id>.json` file in the drafts directory is an editor's working
//! copy. The daemon runs one debounced sync session per draft and persists
//! to a file-backed content store.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use autosave_core::SyncConfig;
use autosave_daemon::{DraftWatcher, FileStore, ManagerConfig, SessionManager};

#[derive(Parser, Debug)]
#[command(name = "autosave-daemon")]
#[command(about = "Debounced autosave for editor drafts")]
struct Args {
    /// Directory of draft files to watch
    #[arg(short, long)]
    drafts: PathBuf,

    /// Directory the content store writes documents to
    #[arg(short, long)]
    store: PathBuf,

    /// Quiet period after the last edit before saving, in milliseconds
    #[arg(long, default_value_t = 2000)]
    debounce_ms: u64,

    /// Owner recorded on newly created documents
    #[arg(long, default_value = "local")]
    owner: String,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,autosave_daemon=debug"
    } else {
        "info,autosave_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting autosave-daemon");
    info!("Drafts path: {:?}", args.drafts);
    info!("Store path: {:?}", args.store);

    tokio::fs::create_dir_all(&args.drafts)
        .await
        .with_context(|| format!("Failed to create {}", args.drafts.display()))?;

    let store = Arc::new(FileStore::open(args.store.clone()).await?);
    info!("Store holds {} document(s)", store.list().await?.len());

    let config = ManagerConfig {
        owner_id: args.owner,
        sync: SyncConfig::builder()
            .debounce(Duration::from_millis(args.debounce_ms))
            .build(),
    };
    let (mut manager, mut session_rx) = SessionManager::new(store, config);

    let mut watcher = DraftWatcher::new(args.drafts.clone())?;
    info!("Watching {:?}", watcher.drafts_path());

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Handle draft watcher events
            Some(event) = watcher.event_rx().recv() => {
                let id = event.id.clone();
                if let Err(e) = manager.on_draft_event(event).await {
                    error!("Failed to handle draft {}: {:#}", id, e);
                }
            }

            // Handle session events (saves, failures, deleted documents)
            Some(event) = session_rx.recv() => {
                manager.on_sync_event(&event);
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down, flushing {} session(s)", manager.session_count());
    manager.shutdown().await;
    Ok(())
}
