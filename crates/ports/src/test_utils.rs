//! Deterministic in-memory kernel for tests.
//!
//! [`RecordingKernel`] implements all three kernel-facing ports, records
//! every call in order (including calls that were made to fail) and keeps a
//! small model of the resulting kernel state so tests can assert on both
//! call ordering and end state.
//!
//! UID rules are modelled the way the kernel stores them: one rule per
//! range with exact bounds. Installing a rule twice fails with `EEXIST`
//! and deleting a rule that is not installed fails with `ENOENT`, without
//! touching any other rule of the call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;
use domain::network::route::Route;
use domain::network::uid_range::{UidRange, UidRangeMap, UidRanges};

use crate::secondary::fallthrough_port::FallthroughDelegate;
use crate::secondary::routing_port::RoutingPort;
use crate::secondary::socket_diag_port::{SocketDiagPort, SocketDiagSession};

/// One collaborator call as observed by the fake kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelCall {
    Attach {
        net_id: NetId,
        interface: String,
        permission: Permission,
        local: bool,
    },
    Detach {
        net_id: NetId,
        interface: String,
        permission: Permission,
        local: bool,
    },
    ModifyPermission {
        net_id: NetId,
        interface: String,
        old: Permission,
        new: Permission,
    },
    AddToDefault {
        interface: String,
        permission: Permission,
    },
    RemoveFromDefault {
        interface: String,
        permission: Permission,
    },
    AddFallthrough {
        interface: String,
        permission: Permission,
    },
    RemoveFallthrough {
        interface: String,
        permission: Permission,
    },
    AddUsers {
        net_id: NetId,
        interface: String,
        policies: Vec<(i32, String)>,
    },
    RemoveUsers {
        net_id: NetId,
        interface: String,
        policies: Vec<(i32, String)>,
    },
    AddRoute {
        interface: String,
        destination: String,
    },
    RemoveRoute {
        interface: String,
        destination: String,
    },
    OpenSession,
    DestroySockets {
        net_id: NetId,
        permission: Permission,
        exclude_loopback: bool,
    },
}

impl KernelCall {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::Detach { .. } => "detach",
            Self::ModifyPermission { .. } => "modify_permission",
            Self::AddToDefault { .. } => "add_to_default",
            Self::RemoveFromDefault { .. } => "remove_from_default",
            Self::AddFallthrough { .. } => "add_fallthrough",
            Self::RemoveFallthrough { .. } => "remove_fallthrough",
            Self::AddUsers { .. } => "add_users",
            Self::RemoveUsers { .. } => "remove_users",
            Self::AddRoute { .. } => "add_route",
            Self::RemoveRoute { .. } => "remove_route",
            Self::OpenSession => "open_session",
            Self::DestroySockets { .. } => "destroy_sockets",
        }
    }

    /// Interface the call is about, if any.
    pub fn interface(&self) -> Option<&str> {
        match self {
            Self::Attach { interface, .. }
            | Self::Detach { interface, .. }
            | Self::ModifyPermission { interface, .. }
            | Self::AddToDefault { interface, .. }
            | Self::RemoveFromDefault { interface, .. }
            | Self::AddFallthrough { interface, .. }
            | Self::RemoveFallthrough { interface, .. }
            | Self::AddUsers { interface, .. }
            | Self::RemoveUsers { interface, .. }
            | Self::AddRoute { interface, .. }
            | Self::RemoveRoute { interface, .. } => Some(interface),
            Self::OpenSession | Self::DestroySockets { .. } => None,
        }
    }
}

/// Modelled kernel state after all successful calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    /// Attached interface -> (network, permission its rules carry).
    pub attached: BTreeMap<String, (NetId, Permission)>,
    /// Default-table registrations.
    pub defaults: BTreeSet<(String, Permission)>,
    pub fallthroughs: BTreeSet<(String, Permission)>,
    /// (interface, sub-priority) -> UID ranges with installed rules, one
    /// range per rule.
    pub uid_rules: BTreeMap<(String, i32), UidRanges>,
    /// (interface, destination) of routes currently installed.
    pub routes: BTreeSet<(String, String)>,
}

type FailRule = Box<dyn Fn(&KernelCall) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    calls: Vec<KernelCall>,
    state: KernelState,
    fail_rules: Vec<FailRule>,
}

#[derive(Default)]
pub struct RecordingKernel {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future call matching `rule` fail without changing state.
    pub fn fail_if(&self, rule: impl Fn(&KernelCall) -> bool + Send + Sync + 'static) {
        lock(&self.inner).fail_rules.push(Box::new(rule));
    }

    /// Make every future call equal to `call` fail.
    pub fn fail_on(&self, call: KernelCall) {
        self.fail_if(move |c| *c == call);
    }

    pub fn clear_failures(&self) {
        lock(&self.inner).fail_rules.clear();
    }

    /// Every call attempted so far, in order.
    pub fn calls(&self) -> Vec<KernelCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.inner).calls.clear();
    }

    pub fn count(&self, predicate: impl Fn(&KernelCall) -> bool) -> usize {
        lock(&self.inner).calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn state(&self) -> KernelState {
        lock(&self.inner).state.clone()
    }

    fn apply(
        &self,
        call: KernelCall,
        effect: impl FnOnce(&mut KernelState),
    ) -> Result<(), KernelError> {
        record(&self.inner, call, |state| {
            effect(state);
            Ok(())
        })
    }

    /// Like [`apply`](Self::apply), but the effect may refuse the call.
    fn try_apply(
        &self,
        call: KernelCall,
        effect: impl FnOnce(&mut KernelState) -> Result<(), KernelError>,
    ) -> Result<(), KernelError> {
        record(&self.inner, call, effect)
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record(
    inner: &Mutex<Inner>,
    call: KernelCall,
    effect: impl FnOnce(&mut KernelState) -> Result<(), KernelError>,
) -> Result<(), KernelError> {
    let mut inner = lock(inner);
    let fails = inner.fail_rules.iter().any(|rule| rule(&call));
    let label = call.label();
    inner.calls.push(call);
    if fails {
        return Err(KernelError::new(label, "injected failure").with_code(-5));
    }
    effect(&mut inner.state)
}

const EEXIST: i32 = -17;
const ENOENT: i32 = -2;

impl KernelState {
    fn uid_rule_installed(&self, interface: &str, sub_priority: i32, range: UidRange) -> bool {
        self.uid_rules
            .get(&(interface.to_string(), sub_priority))
            .is_some_and(|held| held.contains_range(range))
    }

    /// Install one rule per range, refusing the whole call if any of them
    /// is already installed.
    fn install_uid_rules(
        &mut self,
        operation: &str,
        interface: &str,
        uid_ranges: &UidRangeMap,
    ) -> Result<(), KernelError> {
        for (p, ranges) in uid_ranges.iter() {
            if let Some(range) = ranges
                .iter()
                .find(|range| self.uid_rule_installed(interface, p, *range))
            {
                return Err(KernelError::new(
                    operation,
                    format!("uid rule {range} at sub-priority {p} on {interface}: File exists"),
                )
                .with_code(EEXIST));
            }
        }
        for (p, ranges) in uid_ranges.iter() {
            let entry = self.uid_rules.entry((interface.to_string(), p)).or_default();
            *entry = entry.union(ranges);
        }
        Ok(())
    }

    /// Delete one rule per range, refusing the whole call if any of them
    /// is not installed with exactly those bounds.
    fn delete_uid_rules(
        &mut self,
        operation: &str,
        interface: &str,
        uid_ranges: &UidRangeMap,
    ) -> Result<(), KernelError> {
        for (p, ranges) in uid_ranges.iter() {
            if let Some(range) = ranges
                .iter()
                .find(|range| !self.uid_rule_installed(interface, p, *range))
            {
                return Err(KernelError::new(
                    operation,
                    format!(
                        "uid rule {range} at sub-priority {p} on {interface}: No such file or directory"
                    ),
                )
                .with_code(ENOENT));
            }
        }
        for (p, ranges) in uid_ranges.iter() {
            let key = (interface.to_string(), p);
            if let Some(entry) = self.uid_rules.get_mut(&key) {
                *entry = entry.without(ranges);
                if entry.is_empty() {
                    self.uid_rules.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn describe(uid_ranges: &UidRangeMap) -> Vec<(i32, String)> {
    uid_ranges
        .iter()
        .map(|(p, ranges)| (p, ranges.to_string()))
        .collect()
}

impl RoutingPort for RecordingKernel {
    fn attach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let call = KernelCall::Attach {
            net_id,
            interface: interface.to_string(),
            permission,
            local,
        };
        self.try_apply(call, |state| {
            state.install_uid_rules("attach", interface, uid_ranges)?;
            state
                .attached
                .insert(interface.to_string(), (net_id, permission));
            Ok(())
        })
    }

    fn detach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let call = KernelCall::Detach {
            net_id,
            interface: interface.to_string(),
            permission,
            local,
        };
        self.try_apply(call, |state| {
            state.delete_uid_rules("detach", interface, uid_ranges)?;
            state.attached.remove(interface);
            Ok(())
        })
    }

    fn modify_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old: Permission,
        new: Permission,
        _local: bool,
    ) -> Result<(), KernelError> {
        let call = KernelCall::ModifyPermission {
            net_id,
            interface: interface.to_string(),
            old,
            new,
        };
        self.apply(call, |state| {
            if let Some(entry) = state.attached.get_mut(interface) {
                entry.1 = new;
            }
        })
    }

    fn add_to_default(&self, interface: &str, permission: Permission) -> Result<(), KernelError> {
        let call = KernelCall::AddToDefault {
            interface: interface.to_string(),
            permission,
        };
        self.apply(call, |state| {
            state.defaults.insert((interface.to_string(), permission));
        })
    }

    fn remove_from_default(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError> {
        let call = KernelCall::RemoveFromDefault {
            interface: interface.to_string(),
            permission,
        };
        self.apply(call, |state| {
            state.defaults.remove(&(interface.to_string(), permission));
        })
    }

    fn add_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        _local: bool,
    ) -> Result<(), KernelError> {
        let call = KernelCall::AddUsers {
            net_id,
            interface: interface.to_string(),
            policies: describe(uid_ranges),
        };
        self.try_apply(call, |state| {
            state.install_uid_rules("add_users", interface, uid_ranges)
        })
    }

    fn remove_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        _local: bool,
    ) -> Result<(), KernelError> {
        let call = KernelCall::RemoveUsers {
            net_id,
            interface: interface.to_string(),
            policies: describe(uid_ranges),
        };
        self.try_apply(call, |state| {
            state.delete_uid_rules("remove_users", interface, uid_ranges)
        })
    }

    fn add_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        let call = KernelCall::AddRoute {
            interface: interface.to_string(),
            destination: route.destination.clone(),
        };
        self.apply(call, |state| {
            state
                .routes
                .insert((interface.to_string(), route.destination.clone()));
        })
    }

    fn remove_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        let call = KernelCall::RemoveRoute {
            interface: interface.to_string(),
            destination: route.destination.clone(),
        };
        self.apply(call, |state| {
            state
                .routes
                .remove(&(interface.to_string(), route.destination.clone()));
        })
    }
}

impl FallthroughDelegate for RecordingKernel {
    fn add_fallthrough(&self, interface: &str, permission: Permission) -> Result<(), KernelError> {
        let call = KernelCall::AddFallthrough {
            interface: interface.to_string(),
            permission,
        };
        self.apply(call, |state| {
            state.fallthroughs.insert((interface.to_string(), permission));
        })
    }

    fn remove_fallthrough(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError> {
        let call = KernelCall::RemoveFallthrough {
            interface: interface.to_string(),
            permission,
        };
        self.apply(call, |state| {
            state
                .fallthroughs
                .remove(&(interface.to_string(), permission));
        })
    }
}

impl SocketDiagPort for RecordingKernel {
    fn open(&self) -> Result<Box<dyn SocketDiagSession>, KernelError> {
        self.apply(KernelCall::OpenSession, |_| {})?;
        Ok(Box::new(RecordingSession {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct RecordingSession {
    inner: Arc<Mutex<Inner>>,
}

impl SocketDiagSession for RecordingSession {
    fn destroy_sockets_lacking_permission(
        &mut self,
        net_id: NetId,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<usize, KernelError> {
        let call = KernelCall::DestroySockets {
            net_id,
            permission,
            exclude_loopback,
        };
        record(&self.inner, call, |_| Ok(())).map(|()| 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_models_state() {
        let kernel = RecordingKernel::new();
        let map = UidRangeMap::single(0, UidRanges::parse("10-20").unwrap());
        kernel
            .attach_interface(NetId(100), "eth0", Permission::None, &map, false)
            .unwrap();
        kernel.add_to_default("eth0", Permission::None).unwrap();

        let state = kernel.state();
        assert_eq!(state.attached["eth0"], (NetId(100), Permission::None));
        assert!(state.defaults.contains(&("eth0".to_string(), Permission::None)));
        assert_eq!(state.uid_rules[&("eth0".to_string(), 0)].to_string(), "10-20");
        assert_eq!(kernel.calls().len(), 2);
    }

    #[test]
    fn injected_failure_is_recorded_but_does_not_mutate_state() {
        let kernel = RecordingKernel::new();
        kernel.fail_if(|c| matches!(c, KernelCall::AddToDefault { .. }));
        let err = kernel.add_to_default("eth0", Permission::None).unwrap_err();
        assert_eq!(err.operation, "add_to_default");
        assert!(kernel.state().defaults.is_empty());
        assert_eq!(kernel.count(|c| c.label() == "add_to_default"), 1);
    }

    #[test]
    fn uid_rules_are_stored_per_range() {
        let kernel = RecordingKernel::new();
        let first = UidRangeMap::single(1, UidRanges::parse("100-199").unwrap());
        let second = UidRangeMap::single(1, UidRanges::parse("200-299").unwrap());
        kernel.add_users(NetId(100), "eth0", &first, false).unwrap();
        kernel.add_users(NetId(100), "eth0", &second, false).unwrap();
        assert_eq!(
            kernel.state().uid_rules[&("eth0".to_string(), 1)].to_string(),
            "100-199,200-299"
        );

        // Neither the merged interval nor a sub-range matches a rule.
        let merged = UidRangeMap::single(1, UidRanges::parse("100-299").unwrap());
        let err = kernel
            .remove_users(NetId(100), "eth0", &merged, false)
            .unwrap_err();
        assert_eq!(err.code, Some(ENOENT));
        let partial = UidRangeMap::single(1, UidRanges::parse("100-149").unwrap());
        assert!(kernel.remove_users(NetId(100), "eth0", &partial, false).is_err());

        kernel.remove_users(NetId(100), "eth0", &first, false).unwrap();
        assert_eq!(
            kernel.state().uid_rules[&("eth0".to_string(), 1)].to_string(),
            "200-299"
        );
    }

    #[test]
    fn duplicate_uid_rule_is_refused_without_side_effects() {
        let kernel = RecordingKernel::new();
        let map = UidRangeMap::single(1, UidRanges::parse("100-199").unwrap());
        kernel.add_users(NetId(100), "eth0", &map, false).unwrap();
        let both = UidRangeMap::single(1, UidRanges::parse("100-199,300").unwrap());
        let err = kernel.add_users(NetId(100), "eth0", &both, false).unwrap_err();
        assert_eq!(err.code, Some(EEXIST));
        assert_eq!(
            kernel.state().uid_rules[&("eth0".to_string(), 1)].to_string(),
            "100-199"
        );
    }

    #[test]
    fn detach_deletes_exactly_the_given_uid_rules() {
        let kernel = RecordingKernel::new();
        let installed = UidRangeMap::single(0, UidRanges::parse("10-20").unwrap());
        kernel
            .attach_interface(NetId(100), "eth0", Permission::None, &installed, false)
            .unwrap();

        let stale = UidRangeMap::single(0, UidRanges::parse("10-30").unwrap());
        assert!(kernel
            .detach_interface(NetId(100), "eth0", Permission::None, &stale, false)
            .is_err());
        assert!(kernel.state().attached.contains_key("eth0"));

        kernel
            .detach_interface(NetId(100), "eth0", Permission::None, &installed, false)
            .unwrap();
        let state = kernel.state();
        assert!(state.attached.is_empty());
        assert!(state.uid_rules.is_empty());
    }

    #[test]
    fn session_records_into_the_same_log() {
        let kernel = RecordingKernel::new();
        let mut session = kernel.open().unwrap();
        session
            .destroy_sockets_lacking_permission(NetId(100), Permission::System, true)
            .unwrap();
        assert_eq!(
            kernel.calls(),
            vec![
                KernelCall::OpenSession,
                KernelCall::DestroySockets {
                    net_id: NetId(100),
                    permission: Permission::System,
                    exclude_loopback: true,
                },
            ]
        );
    }
}
