//! Config hot-reload.
//!
//! Watches `conductor.toml` and hands the freshly parsed scaling policies to
//! a callback after a debounce window. Other sections need a restart.

use conductor_core::{ConductorError, ConductorResult};
use conductor_orchestrator::TierPolicies;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

/// The part of the config that is re-applied while running.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadableConfig {
    #[serde(default)]
    pub controller: ReloadableController,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReloadableController {
    #[serde(default)]
    pub policies: TierPolicies,
}

/// Keeps the file watch alive; dropping it stops watching.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `config_path`.
    ///
    /// `on_reload` runs on a background thread `debounce_ms` after the first
    /// write of a burst. Parse errors are logged and skipped.
    pub fn start<F>(config_path: PathBuf, debounce_ms: u64, on_reload: F) -> ConductorResult<Self>
    where
        F: Fn(ReloadableConfig) + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ConductorError::Config(format!("Failed to create file watcher: {e}")))?;

        watcher
            .watch(config_path.as_ref(), RecursiveMode::NonRecursive)
            .map_err(|e| ConductorError::Config(format!("Failed to watch config file: {e}")))?;

        let path = config_path.clone();
        std::thread::spawn(move || {
            let debounce = Duration::from_millis(debounce_ms);

            while rx.recv().is_ok() {
                // Let the writer finish, then collapse the burst into one reload.
                let settle = Instant::now() + debounce;
                loop {
                    let left = settle.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    match rx.recv_timeout(left) {
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }

                match parse_config(&path) {
                    Ok(config) => on_reload(config),
                    Err(e) => tracing::warn!(error = %e, "Failed to reload config"),
                }
            }
            tracing::debug!("Config watcher thread exiting");
        });

        tracing::info!(path = %config_path.display(), "Config hot-reload watcher started");
        Ok(Self { _watcher: watcher })
    }
}

/// Read the reloadable part of a config file. Policies are validated.
pub fn parse_config(path: &Path) -> ConductorResult<ReloadableConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConductorError::Config(format!("Failed to read config '{}': {e}", path.display())))?;
    let config: ReloadableConfig = toml::from_str(&content)
        .map_err(|e| ConductorError::Config(format!("Failed to parse config '{}': {e}", path.display())))?;
    for tier in conductor_core::AgentTier::ALL {
        config.controller.policies.get(tier).validate()?;
    }
    Ok(config)
}
