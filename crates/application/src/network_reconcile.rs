use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use domain::network::entity::{NetId, NetworkSpec};
use domain::network::error::NetworkError;
use domain::network::uid_range::UidRanges;

use crate::network_registry::NetworkRegistry;

/// A network that could not be brought to its desired state.
#[derive(Debug, Clone)]
pub struct ReconcileFailure {
    pub net_id: NetId,
    pub error: NetworkError,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Desired networks that now match their spec.
    pub applied: Vec<NetId>,
    pub created: Vec<NetId>,
    pub destroyed: Vec<NetId>,
    pub failed: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    fn fail(&mut self, net_id: NetId, error: NetworkError) {
        tracing::warn!(%net_id, "reconcile failed: {error}");
        self.failed.push(ReconcileFailure { net_id, error });
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} created, {} destroyed, {} failed",
            self.applied.len(),
            self.created.len(),
            self.destroyed.len(),
            self.failed.len()
        )?;
        for failure in &self.failed {
            write!(f, "\n  network {}: {}", failure.net_id, failure.error)?;
        }
        Ok(())
    }
}

/// Reject desired-state documents the registry could never satisfy.
pub fn validate_specs(specs: &[NetworkSpec]) -> Result<(), NetworkError> {
    let mut ids = BTreeSet::new();
    let mut owners: BTreeMap<&str, NetId> = BTreeMap::new();
    let mut default = None;
    for spec in specs {
        if !ids.insert(spec.net_id) {
            return Err(NetworkError::DuplicateNetwork {
                net_id: spec.net_id,
            });
        }
        if spec.local != spec.net_id.is_local() {
            return Err(NetworkError::InvalidNetId {
                net_id: spec.net_id.as_u32(),
                reason: format!("the local network must use id {}", NetId::LOCAL),
            });
        }
        if !spec.local {
            spec.net_id.validate_physical()?;
        }
        if spec.default {
            if spec.local {
                return Err(NetworkError::InvalidArgument {
                    reason: "the local network cannot be the default network".to_string(),
                });
            }
            if let Some(other) = default.replace(spec.net_id) {
                return Err(NetworkError::InvalidArgument {
                    reason: format!(
                        "networks {other} and {} are both marked default",
                        spec.net_id
                    ),
                });
            }
        }
        for interface in &spec.interfaces {
            if let Some(owner) = owners.insert(interface, spec.net_id) {
                return Err(NetworkError::InterfaceInUse {
                    interface: interface.clone(),
                    owner,
                });
            }
        }
    }
    Ok(())
}

/// Drive `registry` towards `specs`.
///
/// Networks are created first and stale memberships are stripped before
/// any network is destroyed or gains interfaces, so an interface can move
/// between networks in a single pass. Failures are collected per network
/// and never stop the others. The default network is selected last.
pub fn reconcile(
    registry: &mut NetworkRegistry,
    specs: &[NetworkSpec],
) -> Result<ReconcileReport, NetworkError> {
    validate_specs(specs)?;

    let mut report = ReconcileReport::default();
    let mut broken: BTreeSet<NetId> = BTreeSet::new();
    let desired: BTreeSet<NetId> = specs.iter().map(|s| s.net_id).collect();

    for spec in specs {
        if registry.network(spec.net_id).is_some() {
            continue;
        }
        let created = if spec.local {
            registry.create_local_network()
        } else {
            registry.create_physical_network(spec.net_id, spec.permission)
        };
        match created {
            Ok(()) => report.created.push(spec.net_id),
            Err(e) => {
                broken.insert(spec.net_id);
                report.fail(spec.net_id, e);
            }
        }
    }

    for spec in specs {
        if broken.contains(&spec.net_id) {
            continue;
        }
        if let Err(e) = strip_stale(registry, spec) {
            broken.insert(spec.net_id);
            report.fail(spec.net_id, e);
        }
    }

    for net_id in registry.net_ids() {
        if desired.contains(&net_id) {
            continue;
        }
        match registry.destroy_network(net_id) {
            Ok(()) => report.destroyed.push(net_id),
            Err(e) => report.fail(net_id, e),
        }
    }

    for spec in specs {
        if broken.contains(&spec.net_id) {
            continue;
        }
        match apply_spec(registry, spec) {
            Ok(()) => report.applied.push(spec.net_id),
            Err(e) => {
                broken.insert(spec.net_id);
                report.fail(spec.net_id, e);
            }
        }
    }

    let wanted_default = specs.iter().find(|s| s.default).map(|s| s.net_id);
    if let Err(e) = registry.set_default_network(wanted_default) {
        let net_id = wanted_default
            .or(registry.default_network())
            .unwrap_or(NetId::LOCAL);
        report.applied.retain(|id| Some(*id) != wanted_default);
        report.fail(net_id, e);
    }

    tracing::info!(
        applied = report.applied.len(),
        created = report.created.len(),
        destroyed = report.destroyed.len(),
        failed = report.failed.len(),
        "reconcile complete"
    );
    Ok(report)
}

/// Remove interfaces and UID ranges the desired state no longer lists.
///
/// A UID range goes away whole unless the desired state lists it with the
/// same bounds; partial overlap still means a new rule.
fn strip_stale(registry: &mut NetworkRegistry, spec: &NetworkSpec) -> Result<(), NetworkError> {
    let Some(network) = registry.network(spec.net_id) else {
        return Ok(());
    };
    let stale_interfaces: Vec<String> = network
        .interfaces()
        .filter(|i| !spec.interfaces.contains(*i))
        .map(str::to_string)
        .collect();
    let stale_users: Vec<(i32, UidRanges)> = network
        .uid_range_map()
        .iter()
        .map(|(p, current)| {
            let wanted = spec.uid_policies.get(p).cloned().unwrap_or_default();
            (p, current.without(&wanted))
        })
        .filter(|(_, stale)| !stale.is_empty())
        .collect();

    for interface in stale_interfaces {
        registry.remove_interface(spec.net_id, &interface)?;
    }
    for (sub_priority, stale) in stale_users {
        registry.remove_users(spec.net_id, &stale, sub_priority)?;
    }
    Ok(())
}

/// Apply permission, then add missing interfaces, then missing UID ranges.
fn apply_spec(registry: &mut NetworkRegistry, spec: &NetworkSpec) -> Result<(), NetworkError> {
    registry.set_permission(spec.net_id, spec.permission)?;

    for interface in &spec.interfaces {
        registry.add_interface(spec.net_id, interface)?;
    }

    let Some(network) = registry.network(spec.net_id) else {
        return Err(NetworkError::NetworkNotFound {
            net_id: spec.net_id,
        });
    };
    let missing_users: Vec<(i32, UidRanges)> = spec
        .uid_policies
        .iter()
        .map(|(p, wanted)| {
            let current = network
                .uid_range_map()
                .get(p)
                .cloned()
                .unwrap_or_default();
            (p, wanted.without(&current))
        })
        .filter(|(_, missing)| !missing.is_empty())
        .collect();
    for (sub_priority, missing) in missing_users {
        registry.add_users(spec.net_id, &missing, sub_priority)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use domain::network::entity::Permission;
    use domain::network::uid_range::UidRangeMap;
    use ports::test_utils::{KernelCall, RecordingKernel};

    use crate::physical_network::KernelPorts;

    fn setup() -> (Arc<RecordingKernel>, NetworkRegistry) {
        let kernel = Arc::new(RecordingKernel::new());
        let ports = KernelPorts {
            routing: kernel.clone(),
            sockets: kernel.clone(),
        };
        (kernel.clone(), NetworkRegistry::new(ports, kernel))
    }

    fn spec(net_id: u32, interfaces: &[&str]) -> NetworkSpec {
        NetworkSpec {
            net_id: NetId(net_id),
            local: false,
            permission: Permission::None,
            default: false,
            interfaces: interfaces.iter().map(ToString::to_string).collect(),
            uid_policies: UidRangeMap::new(),
        }
    }

    fn with_users(mut spec: NetworkSpec, sub_priority: i32, uids: &str) -> NetworkSpec {
        spec.uid_policies
            .add(&UidRanges::parse(uids).unwrap(), sub_priority);
        spec
    }

    #[test]
    fn builds_networks_from_scratch() {
        let (kernel, mut registry) = setup();
        let mut primary = with_users(spec(100, &["eth0"]), 0, "10000-10999");
        primary.default = true;
        let mut local = spec(99, &["rndis0"]);
        local.local = true;

        let report = reconcile(&mut registry, &[primary, local]).unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.created, [NetId(100), NetId::LOCAL]);
        assert_eq!(registry.default_network(), Some(NetId(100)));
        assert_eq!(registry.owner_of("rndis0"), Some(NetId::LOCAL));
        assert!(registry.network(NetId::LOCAL).unwrap().is_local());
        let state = kernel.state();
        assert!(state.defaults.contains(&("eth0".to_string(), Permission::None)));
        assert!(state.uid_rules.contains_key(&("eth0".to_string(), 0)));
    }

    #[test]
    fn second_pass_is_a_noop() {
        let (kernel, mut registry) = setup();
        let mut primary = with_users(spec(100, &["eth0", "wlan0"]), 3, "1-5");
        primary.default = true;
        primary.permission = Permission::Network;
        let specs = [primary];

        reconcile(&mut registry, &specs).unwrap();
        kernel.clear_calls();
        let report = reconcile(&mut registry, &specs).unwrap();

        assert!(report.is_success());
        assert!(report.created.is_empty());
        assert!(kernel.calls().is_empty(), "{:?}", kernel.calls());
    }

    #[test]
    fn moves_interface_between_networks() {
        let (_kernel, mut registry) = setup();
        reconcile(&mut registry, &[spec(100, &["eth0"]), spec(101, &[])]).unwrap();

        let report =
            reconcile(&mut registry, &[spec(100, &[]), spec(101, &["eth0"])]).unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(registry.owner_of("eth0"), Some(NetId(101)));
    }

    #[test]
    fn moves_interface_out_of_destroyed_network() {
        let (kernel, mut registry) = setup();
        let mut old = spec(100, &["eth0"]);
        old.default = true;
        reconcile(&mut registry, &[old]).unwrap();

        let mut new = spec(101, &["eth0"]);
        new.default = true;
        let report = reconcile(&mut registry, &[new]).unwrap();

        assert!(report.is_success(), "{report}");
        assert_eq!(report.destroyed, [NetId(100)]);
        assert_eq!(registry.net_ids(), [NetId(101)]);
        assert_eq!(registry.default_network(), Some(NetId(101)));
        assert_eq!(kernel.state().attached["eth0"].0, NetId(101));
    }

    #[test]
    fn updates_permission_and_uid_policies() {
        let (kernel, mut registry) = setup();
        reconcile(
            &mut registry,
            &[with_users(spec(100, &["eth0"]), 0, "100-199")],
        )
        .unwrap();

        let mut next = with_users(spec(100, &["eth0"]), 0, "150-249");
        next.permission = Permission::System;
        reconcile(&mut registry, &[next]).unwrap();

        let network = registry.network(NetId(100)).unwrap();
        assert_eq!(network.permission(), Permission::System);
        assert_eq!(network.uid_range_map().get(0).unwrap().to_string(), "150-249");
        assert_eq!(
            kernel.state().uid_rules[&("eth0".to_string(), 0)].to_string(),
            "150-249"
        );
    }

    #[test]
    fn reshapes_uid_ranges_as_whole_rules() {
        let (kernel, mut registry) = setup();
        let rules = |kernel: &RecordingKernel| {
            kernel.state().uid_rules[&("eth0".to_string(), 0)].to_string()
        };
        reconcile(
            &mut registry,
            &[with_users(spec(100, &["eth0"]), 0, "100-199,200-299")],
        )
        .unwrap();
        assert_eq!(rules(&kernel), "100-199,200-299");

        let narrowed = reconcile(
            &mut registry,
            &[with_users(spec(100, &["eth0"]), 0, "100-199")],
        )
        .unwrap();
        assert!(narrowed.is_success(), "{narrowed}");
        assert_eq!(rules(&kernel), "100-199");

        let widened = reconcile(
            &mut registry,
            &[with_users(spec(100, &["eth0"]), 0, "100-299")],
        )
        .unwrap();
        assert!(widened.is_success(), "{widened}");
        assert_eq!(rules(&kernel), "100-299");
        assert_eq!(
            registry
                .network(NetId(100))
                .unwrap()
                .uid_range_map()
                .get(0)
                .unwrap()
                .to_string(),
            "100-299"
        );
    }

    #[test]
    fn failure_in_one_network_does_not_stop_others() {
        let (kernel, mut registry) = setup();
        kernel.fail_if(|c| matches!(c, KernelCall::Attach { interface, .. } if interface == "eth0"));

        let report =
            reconcile(&mut registry, &[spec(100, &["eth0"]), spec(101, &["eth1"])]).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].net_id, NetId(100));
        assert_eq!(report.applied, [NetId(101)]);
        assert_eq!(registry.owner_of("eth1"), Some(NetId(101)));
    }

    #[test]
    fn default_selection_failure_is_reported() {
        let (kernel, mut registry) = setup();
        kernel.fail_if(|c| matches!(c, KernelCall::AddToDefault { .. }));
        let mut primary = spec(100, &["eth0"]);
        primary.default = true;

        let report = reconcile(&mut registry, &[primary]).unwrap();

        assert!(!report.is_success());
        assert!(report.applied.is_empty());
        assert_eq!(registry.default_network(), None);
    }

    #[test]
    fn rejects_inconsistent_documents() {
        let (_kernel, mut registry) = setup();
        let mut a = spec(100, &[]);
        a.default = true;
        let mut b = spec(101, &[]);
        b.default = true;
        assert!(reconcile(&mut registry, &[a, b]).is_err());

        assert!(matches!(
            validate_specs(&[spec(100, &["eth0"]), spec(101, &["eth0"])]),
            Err(NetworkError::InterfaceInUse { .. })
        ));
        assert!(matches!(
            validate_specs(&[spec(100, &[]), spec(100, &[])]),
            Err(NetworkError::DuplicateNetwork { .. })
        ));
        let mut local = spec(100, &[]);
        local.local = true;
        assert!(validate_specs(&[local]).is_err());
        assert!(registry.is_empty());
    }
}
