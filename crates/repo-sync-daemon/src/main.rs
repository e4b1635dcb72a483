//! repo-sync-daemon: keeps a vault directory in sync with a GitHub repository.
//!
//! Pulls on start and on an interval, watches the vault for edits, and pushes
//! them as one commit once the vault has been quiet for the debounce window.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use repo_sync_core::{ChangeKind, EngineState, SyncCoordinator};
use repo_sync_daemon::github::{DEFAULT_API_BASE, GitHubRemote};
use repo_sync_daemon::native_fs::NativeFs;
use repo_sync_daemon::persistence::StateStorage;
use repo_sync_daemon::watcher::{FileEvent, FileEventKind, FileWatcher};

#[derive(Parser, Debug)]
#[command(name = "repo-sync-daemon")]
#[command(about = "Sync a local vault with a GitHub repository")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// State file (defaults to <vault>/.sync/state.json)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Repository owner (overrides the state file)
    #[arg(long)]
    owner: Option<String>,

    /// Repository name (overrides the state file)
    #[arg(long)]
    repo: Option<String>,

    /// Branch to track (overrides the state file)
    #[arg(long)]
    branch: Option<String>,

    /// Access token (overrides the state file)
    #[arg(long, env = "REPO_SYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// API base url, for GitHub Enterprise
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// Quiet period after the last edit before pushing
    #[arg(long, default_value_t = 2000)]
    debounce_ms: u64,

    /// Seconds between background pulls (0 disables)
    #[arg(long, default_value_t = 60)]
    pull_interval_secs: u64,

    /// Pull once and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn apply_overrides(&self, state: &mut EngineState) {
        let settings = &mut state.settings;
        if let Some(owner) = &self.owner {
            settings.owner = owner.clone();
        }
        if let Some(repo) = &self.repo {
            settings.repo = repo.clone();
        }
        if let Some(branch) = &self.branch {
            settings.branch = branch.clone();
        }
        if let Some(token) = &self.token {
            settings.credential_material = token.clone();
        }
    }
}

struct Daemon {
    coordinator: SyncCoordinator<NativeFs, GitHubRemote>,
    storage: StateStorage,
}

impl Daemon {
    async fn on_file_changed(&self, event: FileEvent) {
        let kind = match event.kind {
            FileEventKind::Modified if self.coordinator.is_tracked(&event.path).await => {
                ChangeKind::Update
            }
            FileEventKind::Modified => ChangeKind::Create,
            FileEventKind::Deleted => ChangeKind::Delete,
        };
        debug!("Recording {:?} for {}", kind, event.path);
        self.coordinator.record_change(&event.path, kind);
    }

    async fn pull(&self) {
        match self.coordinator.pull().await {
            Ok(report) => {
                for (path, err) in &report.failed {
                    error!("Could not apply {}: {}", path, err);
                }
                for (path, err) in &report.skipped {
                    warn!("Skipped {}: {}", path, err);
                }
                self.save_state().await;
            }
            Err(e) => error!("Pull failed: {}", e),
        }
    }

    async fn push(&self) {
        if self.coordinator.pending_changes().is_empty() {
            return;
        }
        match self.coordinator.push().await {
            Ok(outcome) => {
                match &outcome.commit {
                    Some(commit) => info!("Pushed {} file(s) as {}", outcome.paths.len(), commit),
                    None => debug!("Nothing to push"),
                }
                self.save_state().await;
            }
            Err(e) => error!("Push failed (edit the files again to retry): {}", e),
        }
    }

    async fn save_state(&self) {
        let state = self.coordinator.to_state().await;
        if let Err(e) = self.storage.save(&state) {
            error!("Failed to save state: {:#}", e);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,repo_sync_daemon=debug,repo_sync_core=debug"
    } else {
        "info,repo_sync_daemon=info,repo_sync_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting repo-sync-daemon");
    info!("Vault path: {:?}", args.vault);

    let storage = match &args.state {
        Some(path) => StateStorage::at(path.clone()),
        None => StateStorage::in_vault(&args.vault),
    };
    let mut state = storage.load()?;
    args.apply_overrides(&mut state);
    state
        .settings
        .validate()
        .context("Repository settings are incomplete")?;
    info!(
        "Syncing with {}/{} ({})",
        state.settings.owner,
        state.settings.repo,
        state.settings.branch()
    );

    let remote = GitHubRemote::with_api_base(&state.settings, &args.api_base)?;
    let fs = NativeFs::new(args.vault.clone());
    let coordinator = SyncCoordinator::from_state(state, fs, remote)?;

    let _events = coordinator.events().subscribe(|event| {
        if let Ok(json) = serde_json::to_string(&event) {
            debug!("Sync event: {}", json);
        }
    });

    let daemon = Daemon {
        coordinator,
        storage,
    };

    daemon.pull().await;
    if args.once {
        info!("Single pull complete");
        return Ok(());
    }

    let mut watcher = FileWatcher::new(args.vault.clone())?;
    info!("File watcher started");

    let debounce = Duration::from_millis(args.debounce_ms);
    let mut push_deadline: Option<Instant> = None;

    let mut pull_timer = (args.pull_interval_secs > 0).then(|| {
        let period = Duration::from_secs(args.pull_interval_secs);
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    info!("Daemon running. Press Ctrl+C to stop.");

    // Main event loop
    loop {
        tokio::select! {
            // Record edits and restart the quiet period
            Some(event) = watcher.event_rx().recv() => {
                daemon.on_file_changed(event).await;
                push_deadline = Some(Instant::now() + debounce);
            }

            // Vault has been quiet long enough
            _ = wait_until(push_deadline) => {
                push_deadline = None;
                daemon.push().await;
            }

            // Background pull; local edits go out first so they are not overwritten
            _ = next_tick(&mut pull_timer) => {
                if push_deadline.take().is_some() {
                    daemon.push().await;
                }
                daemon.pull().await;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    daemon.push().await;
    daemon.save_state().await;
    info!("Shutting down");
    Ok(())
}
