use std::path::Path;

use anyhow::{Context, Result, bail};
use application::network_reconcile::ReconcileReport;
use domain::network::entity::{NetId, NetworkSpec};
use infrastructure::config::AgentConfig;

use crate::cli::{Cli, OutputFormat};
use crate::startup;

// ── Validate ────────────────────────────────────────────────────────────

/// Parse and validate the config without touching the kernel.
pub fn cmd_validate(cli: &Cli) -> Result<()> {
    let config = AgentConfig::load(Path::new(&cli.config))
        .with_context(|| format!("failed to load {}", cli.config))?;
    let specs = config.network_specs()?;
    application::network_reconcile::validate_specs(&specs)?;
    let backend = startup::effective_backend(&config.agent, cli.dry_run);

    if cli.output == OutputFormat::Json {
        let doc = serde_json::json!({
            "valid": true,
            "backend": backend.as_str(),
            "networks": specs.iter().map(spec_json).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("{}: OK ({} networks, backend {backend})", cli.config, specs.len());
    print_spec_table(&specs);
    Ok(())
}

// ── Apply ───────────────────────────────────────────────────────────────

/// Reconcile once and exit. Fails if any network could not be applied.
pub async fn cmd_apply(cli: &Cli) -> Result<()> {
    let config = startup::bootstrap(cli)?;
    let backend = startup::effective_backend(&config.agent, cli.dry_run);
    let registry = startup::build_registry(&config.agent, backend);
    let report = startup::reconcile_shared(&registry, config.network_specs()?).await?;

    if cli.output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
    } else {
        println!("{report}");
    }

    if !report.is_success() {
        bail!("{} network(s) failed to reconcile", report.failed.len());
    }
    Ok(())
}

// ── Formatting ──────────────────────────────────────────────────────────

fn spec_json(spec: &NetworkSpec) -> serde_json::Value {
    serde_json::json!({
        "net_id": spec.net_id.as_u32(),
        "kind": spec.kind().as_str(),
        "permission": spec.permission.as_str(),
        "default": spec.default,
        "interfaces": spec.interfaces,
        "uid_policies": spec
            .uid_policies
            .iter()
            .map(|(p, ranges)| serde_json::json!({
                "sub_priority": p,
                "uids": ranges.to_string(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn report_json(report: &ReconcileReport) -> serde_json::Value {
    let ids = |ids: &[NetId]| {
        ids.iter().map(|id| id.as_u32()).collect::<Vec<_>>()
    };
    serde_json::json!({
        "success": report.is_success(),
        "applied": ids(&report.applied),
        "created": ids(&report.created),
        "destroyed": ids(&report.destroyed),
        "failed": report
            .failed
            .iter()
            .map(|f| serde_json::json!({
                "net_id": f.net_id.as_u32(),
                "error": f.error.to_string(),
            }))
            .collect::<Vec<_>>(),
    })
}

fn print_spec_table(specs: &[NetworkSpec]) {
    if specs.is_empty() {
        println!("No networks configured.");
        return;
    }

    println!(
        "{:>6}  {:<8}  {:<10}  {:<7}  {:<24}  UID POLICIES",
        "NET", "KIND", "PERMISSION", "DEFAULT", "INTERFACES"
    );
    for spec in specs {
        let interfaces: Vec<&str> = spec.interfaces.iter().map(String::as_str).collect();
        let policies: Vec<String> = spec
            .uid_policies
            .iter()
            .map(|(p, ranges)| format!("{p}:{ranges}"))
            .collect();
        println!(
            "{:>6}  {:<8}  {:<10}  {:<7}  {:<24}  {}",
            spec.net_id.as_u32(),
            spec.kind().as_str(),
            spec.permission.as_str(),
            if spec.default { "yes" } else { "no" },
            interfaces.join(","),
            policies.join(" "),
        );
    }
}

#[cfg(test)]
mod tests {
    use domain::network::entity::Permission;
    use domain::network::error::NetworkError;
    use domain::network::uid_range::{UidRangeMap, UidRanges};

    use super::*;
    use application::network_reconcile::ReconcileFailure;

    #[test]
    fn spec_json_shape() {
        let spec = NetworkSpec {
            net_id: NetId(100),
            local: false,
            permission: Permission::System,
            default: true,
            interfaces: ["wlan0".to_string(), "eth0".to_string()].into_iter().collect(),
            uid_policies: UidRangeMap::single(5, UidRanges::parse("10000-10999").unwrap()),
        };
        let doc = spec_json(&spec);
        assert_eq!(doc["net_id"], 100);
        assert_eq!(doc["permission"], "system");
        assert_eq!(doc["default"], true);
        assert_eq!(doc["interfaces"], serde_json::json!(["eth0", "wlan0"]));
        assert_eq!(doc["uid_policies"][0]["sub_priority"], 5);
        assert_eq!(doc["uid_policies"][0]["uids"], "10000-10999");
    }

    #[test]
    fn report_json_lists_failures() {
        let report = ReconcileReport {
            applied: vec![NetId(100)],
            created: vec![NetId(100), NetId(101)],
            destroyed: vec![],
            failed: vec![ReconcileFailure {
                net_id: NetId(101),
                error: NetworkError::NetworkNotFound { net_id: NetId(101) },
            }],
        };
        let doc = report_json(&report);
        assert_eq!(doc["success"], false);
        assert_eq!(doc["created"], serde_json::json!([100, 101]));
        assert_eq!(doc["failed"][0]["net_id"], 101);
        assert!(doc["failed"][0]["error"].as_str().unwrap().contains("101"));
    }
}
