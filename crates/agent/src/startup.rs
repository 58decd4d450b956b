use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adapters::command::{CommandRunner, SystemCommandRunner};
use adapters::dry_run::{LogRoutingPort, LogSocketDiag};
use adapters::fallthrough::NoopFallthrough;
use adapters::routing::iproute2::{IpRouteProgrammer, SysfsIndexLookup};
use adapters::sockdiag::ss_reaper::SsSocketReaper;
use anyhow::{Context, anyhow};
use application::network_reconcile::{ReconcileReport, reconcile};
use application::network_registry::NetworkRegistry;
use application::physical_network::KernelPorts;
use domain::network::entity::{NetId, NetworkSpec};
use domain::network::error::NetworkError;
use infrastructure::config::{AgentConfig, AgentInfo, Backend};
use infrastructure::logging::init_logging;
use tracing::{info, warn};

use crate::cli::Cli;

/// Registry shared between the daemon loop and the reload task. Kernel
/// calls block, so every access goes through `spawn_blocking`.
pub type SharedRegistry = Arc<Mutex<NetworkRegistry>>;

/// Load the config and install logging. CLI flags take precedence over
/// the config file.
pub fn bootstrap(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let config = AgentConfig::load(Path::new(&cli.config))
        .with_context(|| format!("failed to load {}", cli.config))?;

    let log_level = cli.log_level.unwrap_or(config.agent.log_level);
    let log_format = cli.log_format.unwrap_or(config.agent.log_format);
    init_logging(log_level, log_format)?;
    Ok(config)
}

/// `--dry-run` forces the log-only backend regardless of the config.
pub fn effective_backend(agent: &AgentInfo, dry_run: bool) -> Backend {
    if dry_run { Backend::DryRun } else { agent.backend }
}

/// Kernel collaborators for the selected backend.
pub fn build_ports(agent: &AgentInfo, backend: Backend) -> KernelPorts {
    match backend {
        Backend::Iproute2 => {
            let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
            KernelPorts {
                routing: Arc::new(IpRouteProgrammer::new(
                    agent.ip_binary.clone(),
                    Arc::clone(&runner),
                    Arc::new(SysfsIndexLookup::new()),
                )),
                sockets: Arc::new(SsSocketReaper::new(agent.ss_binary.clone(), runner)),
            }
        }
        Backend::DryRun => KernelPorts {
            routing: Arc::new(LogRoutingPort),
            sockets: Arc::new(LogSocketDiag),
        },
    }
}

pub fn build_registry(agent: &AgentInfo, backend: Backend) -> SharedRegistry {
    let ports = build_ports(agent, backend);
    Arc::new(Mutex::new(NetworkRegistry::new(
        ports,
        Arc::new(NoopFallthrough),
    )))
}

/// Reconcile the shared registry on the blocking pool.
pub async fn reconcile_shared(
    registry: &SharedRegistry,
    specs: Vec<NetworkSpec>,
) -> anyhow::Result<ReconcileReport> {
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || -> anyhow::Result<ReconcileReport> {
        let mut guard = registry
            .lock()
            .map_err(|_| anyhow!("network registry lock poisoned"))?;
        Ok(reconcile(&mut guard, &specs)?)
    })
    .await?
}

/// Tear down every network on the blocking pool.
pub async fn drain_shared(registry: &SharedRegistry) -> anyhow::Result<Vec<(NetId, NetworkError)>> {
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(NetId, NetworkError)>> {
        let mut guard = registry
            .lock()
            .map_err(|_| anyhow!("network registry lock poisoned"))?;
        Ok(guard.drain())
    })
    .await?
}

pub fn log_report(report: &ReconcileReport) {
    if report.is_success() {
        info!(
            applied = report.applied.len(),
            created = report.created.len(),
            destroyed = report.destroyed.len(),
            "reconcile complete"
        );
        return;
    }
    for failure in &report.failed {
        warn!(net_id = %failure.net_id, "network not reconciled: {}", failure.error);
    }
    warn!(
        applied = report.applied.len(),
        failed = report.failed.len(),
        "reconcile finished with failures"
    );
}

/// Run the daemon until SIGINT or SIGTERM.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    // ── 1. Load config and initialize logging ───────────────────────
    let config = bootstrap(cli)?;
    let backend = effective_backend(&config.agent, cli.dry_run);

    // Service root span: fields appear in every subsequent log entry
    let _root_span = tracing::span!(
        tracing::Level::INFO,
        "service",
        service.name = "physnetd",
        service.version = env!("CARGO_PKG_VERSION"),
    )
    .entered();

    info!(
        config_path = %cli.config,
        backend = backend.as_str(),
        network_count = config.networks.len(),
        "physnetd starting"
    );

    // ── 2. Build the registry and reconcile once ────────────────────
    let registry = build_registry(&config.agent, backend);
    let report = reconcile_shared(&registry, config.network_specs()?).await?;
    log_report(&report);

    // ── 3. Shutdown signal and config watcher ───────────────────────
    let cancel_token = crate::shutdown::create_shutdown_token();
    let reload_handle = crate::reload::spawn_reload_task(
        PathBuf::from(&cli.config),
        Arc::clone(&registry),
        backend,
        cancel_token.clone(),
    );

    // ── 4. Ready, wait for cancellation ─────────────────────────────
    info!("physnetd ready, waiting for shutdown signal");
    cancel_token.cancelled().await;

    // ── 5. Ordered shutdown sequence ────────────────────────────────
    info!("shutdown phase 1: stopping config watcher");
    let _ = tokio::time::timeout(Duration::from_secs(1), reload_handle).await;

    info!("shutdown phase 2: draining networks");
    let failures = drain_shared(&registry).await?;
    for (net_id, e) in &failures {
        warn!(%net_id, "network left partially programmed: {e}");
    }

    info!(undrained = failures.len(), "physnetd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::network::entity::Permission;

    fn spec(net_id: u32, interfaces: &[&str], default: bool) -> NetworkSpec {
        NetworkSpec {
            net_id: NetId(net_id),
            local: false,
            permission: Permission::None,
            default,
            interfaces: interfaces.iter().map(|s| (*s).to_string()).collect(),
            uid_policies: domain::network::uid_range::UidRangeMap::new(),
        }
    }

    #[test]
    fn dry_run_flag_overrides_config_backend() {
        let agent = AgentInfo::default();
        assert_eq!(agent.backend, Backend::Iproute2);
        assert_eq!(effective_backend(&agent, true), Backend::DryRun);
        assert_eq!(effective_backend(&agent, false), Backend::Iproute2);
    }

    #[tokio::test]
    async fn reconcile_and_drain_through_shared_registry() {
        let registry = build_registry(&AgentInfo::default(), Backend::DryRun);

        let report = reconcile_shared(&registry, vec![spec(100, &["eth0"], true)])
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.created, vec![NetId(100)]);
        {
            let guard = registry.lock().unwrap();
            assert_eq!(guard.default_network(), Some(NetId(100)));
            assert_eq!(guard.owner_of("eth0"), Some(NetId(100)));
        }

        let failures = drain_shared(&registry).await.unwrap();
        assert!(failures.is_empty());
        assert!(registry.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inconsistent_specs_are_an_error() {
        let registry = build_registry(&AgentInfo::default(), Backend::DryRun);
        let specs = vec![spec(100, &["eth0"], false), spec(101, &["eth0"], false)];
        assert!(reconcile_shared(&registry, specs).await.is_err());
        assert!(registry.lock().unwrap().is_empty());
    }
}
