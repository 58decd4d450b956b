use std::path::{Path, PathBuf};

use infrastructure::config::{AgentConfig, Backend};
use infrastructure::constants::CONFIG_RELOAD_DEBOUNCE;
use notify_debouncer_mini::{DebouncedEvent, DebouncedEventKind, new_debouncer};
use tokio_util::sync::CancellationToken;

use crate::startup::{SharedRegistry, log_report, reconcile_shared};

/// Spawn a background task that re-reconciles the registry whenever the
/// config file changes or SIGHUP arrives.
///
/// The parent directory is watched rather than the file itself so that
/// editors replacing the file by rename keep triggering reloads.
pub fn spawn_reload_task(
    config_path: PathBuf,
    registry: SharedRegistry,
    backend: Backend,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel::<()>(4);

        // Watcher events carry absolute paths.
        let watched = std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone());
        let watch_dir = watched
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let mut debouncer = match new_debouncer(
            CONFIG_RELOAD_DEBOUNCE,
            move |res: Result<Vec<DebouncedEvent>, notify::Error>| {
                if let Ok(events) = res
                    && events
                        .iter()
                        .any(|e| e.kind == DebouncedEventKind::Any && e.path == watched)
                {
                    // one notification per batch is enough
                    let _ = notify_tx.blocking_send(());
                }
            },
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create file watcher, hot-reload disabled");
                return;
            }
        };

        if let Err(e) = debouncer
            .watcher()
            .watch(&watch_dir, notify::RecursiveMode::NonRecursive)
        {
            tracing::warn!(
                path = %config_path.display(),
                error = %e,
                "failed to watch config file, hot-reload disabled"
            );
            return;
        }

        tracing::info!(path = %config_path.display(), "config file watcher started");

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGHUP handler, hot-reload disabled");
                    return;
                }
            };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = notify_rx.recv() => {
                        tracing::info!("config file change detected, reloading");
                    }
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading configuration");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                tokio::select! {
                    () = cancel_token.cancelled() => break,
                    _ = notify_rx.recv() => {
                        tracing::info!("config file change detected, reloading");
                    }
                }
            }

            perform_reload(&config_path, &registry, backend).await;
        }
        tracing::info!("config watcher shutting down");
    })
}

/// Load the config and reconcile against it. An invalid file is rejected
/// as a whole and the running state is left untouched.
pub async fn perform_reload(config_path: &Path, registry: &SharedRegistry, backend: Backend) {
    // Phase 1: YAML and config-level validation
    let config = match AgentConfig::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected");
            return;
        }
    };

    // Phase 2: conversion to desired state
    let specs = match config.network_specs() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected: invalid networks");
            return;
        }
    };

    // --dry-run pins the backend, so only a real backend can drift.
    if backend != Backend::DryRun && config.agent.backend != backend {
        tracing::warn!(
            active = backend.as_str(),
            configured = config.agent.backend.as_str(),
            "backend changes take effect on restart"
        );
    }

    // Phase 3: reconcile
    let started = std::time::Instant::now();
    match reconcile_shared(registry, specs).await {
        Ok(report) => {
            log_report(&report);
            tracing::info!(
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "config reload applied"
            );
        }
        Err(e) => tracing::warn!(error = %e, "config reload rejected"),
    }
}
