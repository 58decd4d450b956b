use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;
use domain::network::route::{Route, RouteType, TableKind};
use domain::network::uid_range::UidRangeMap;
use ports::secondary::routing_port::RoutingPort;

use super::rules::{
    IpRule, LOCAL_NETWORK_TABLE, ROUTE_TABLE_OFFSET, default_network_rule, membership_rules,
    uid_rules,
};
use crate::command::CommandRunner;

/// Resolves an interface name to its kernel index.
pub trait InterfaceIndexLookup: Send + Sync {
    fn ifindex(&self, interface: &str) -> Result<u32, KernelError>;
}

/// Reads `<root>/<interface>/ifindex`, `/sys/class/net` by default.
pub struct SysfsIndexLookup {
    root: PathBuf,
}

impl SysfsIndexLookup {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsIndexLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceIndexLookup for SysfsIndexLookup {
    fn ifindex(&self, interface: &str) -> Result<u32, KernelError> {
        let path = self.root.join(interface).join("ifindex");
        let raw = fs::read_to_string(&path).map_err(|e| {
            KernelError::new("ifindex lookup", format!("{}: {e}", path.display()))
        })?;
        raw.trim().parse().map_err(|e| {
            KernelError::new(
                "ifindex lookup",
                format!("{}: invalid index '{}': {e}", path.display(), raw.trim()),
            )
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Family {
    V4,
    V6,
}

impl Family {
    const ALL: [Self; 2] = [Self::V4, Self::V6];

    fn flag(self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }
}

/// [`RoutingPort`] backed by the `ip` tool.
///
/// Every rule is installed for both address families. Interface tables are
/// resolved once and cached until the interface is detached.
pub struct IpRouteProgrammer {
    ip_binary: String,
    runner: Arc<dyn CommandRunner>,
    lookup: Arc<dyn InterfaceIndexLookup>,
    tables: Mutex<HashMap<String, u32>>,
}

impl IpRouteProgrammer {
    pub fn new(
        ip_binary: impl Into<String>,
        runner: Arc<dyn CommandRunner>,
        lookup: Arc<dyn InterfaceIndexLookup>,
    ) -> Self {
        Self {
            ip_binary: ip_binary.into(),
            runner,
            lookup,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Table currently cached for `interface`.
    pub fn cached_table(&self, interface: &str) -> Option<u32> {
        self.cache().get(interface).copied()
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_for(&self, interface: &str, local: bool) -> Result<u32, KernelError> {
        if local {
            return Ok(LOCAL_NETWORK_TABLE);
        }
        if let Some(table) = self.cached_table(interface) {
            return Ok(table);
        }
        let ifindex = self.lookup.ifindex(interface)?;
        let table = ifindex.checked_add(ROUTE_TABLE_OFFSET).ok_or_else(|| {
            KernelError::new("ifindex lookup", format!("index {ifindex} out of range"))
        })?;
        self.cache().insert(interface.to_string(), table);
        Ok(table)
    }

    fn ip(&self, family: Family, args: Vec<String>) -> Result<(), KernelError> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(family.flag().to_string());
        full.extend(args);
        self.runner.run(&self.ip_binary, &full).map(|_| ())
    }

    /// Install rules, stopping at the first failure.
    fn add_rules(&self, rules: &[IpRule]) -> Result<(), KernelError> {
        for rule in rules {
            for family in Family::ALL {
                self.ip(family, rule.args("add"))?;
            }
        }
        Ok(())
    }

    /// Delete rules, attempting all of them and returning the first failure.
    fn delete_rules(&self, rules: &[IpRule]) -> Result<(), KernelError> {
        let mut outcome = Ok(());
        for rule in rules {
            for family in Family::ALL {
                if let Err(e) = self.ip(family, rule.args("del")) {
                    tracing::debug!("ip rule del failed: {e}");
                    outcome = outcome.and(Err(e));
                }
            }
        }
        outcome
    }

    fn route(&self, action: &str, interface: &str, route: &Route) -> Result<(), KernelError> {
        let table = match route.table {
            TableKind::Interface => self.table_for(interface, false)?,
            TableKind::LocalNetwork => LOCAL_NETWORK_TABLE,
        };
        let family = if route.is_ipv6() { Family::V6 } else { Family::V4 };
        let mut args = vec![
            "route".to_string(),
            action.to_string(),
            route.route_type.as_str().to_string(),
            route.destination.clone(),
        ];
        if route.route_type == RouteType::Unicast {
            args.extend(["dev".to_string(), interface.to_string()]);
        }
        args.extend(["table".to_string(), table.to_string()]);
        if route.mtu > 0 {
            args.extend(["mtu".to_string(), route.mtu.to_string()]);
        }
        args.extend(["metric".to_string(), route.metric.to_string()]);
        self.ip(family, args)
    }
}

fn uid_rule_set(net_id: NetId, table: u32, uid_ranges: &UidRangeMap) -> Vec<IpRule> {
    uid_ranges
        .iter()
        .flat_map(|(sub_priority, ranges)| {
            ranges
                .iter()
                .flat_map(move |range| uid_rules(net_id, table, range, sub_priority))
        })
        .collect()
}

impl RoutingPort for IpRouteProgrammer {
    fn attach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let table = self.table_for(interface, local)?;
        let mut rules = membership_rules(net_id, interface, table, permission, local);
        rules.extend(uid_rule_set(net_id, table, uid_ranges));
        self.add_rules(&rules)
    }

    fn detach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let outcome = self.table_for(interface, local).and_then(|table| {
            let mut rules = membership_rules(net_id, interface, table, permission, local);
            rules.extend(uid_rule_set(net_id, table, uid_ranges));
            let mut outcome = self.delete_rules(&rules);
            if !local {
                for family in Family::ALL {
                    let flush = vec![
                        "route".to_string(),
                        "flush".to_string(),
                        "table".to_string(),
                        table.to_string(),
                    ];
                    if let Err(e) = self.ip(family, flush) {
                        outcome = outcome.and(Err(e));
                    }
                }
            }
            outcome
        });
        // The index may be reused by a different interface from now on.
        self.cache().remove(interface);
        outcome
    }

    fn modify_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old: Permission,
        new: Permission,
        local: bool,
    ) -> Result<(), KernelError> {
        if local {
            return Ok(());
        }
        let table = self.table_for(interface, local)?;
        self.add_rules(&membership_rules(net_id, interface, table, new, local))?;
        self.delete_rules(&membership_rules(net_id, interface, table, old, local))
    }

    fn add_to_default(&self, interface: &str, permission: Permission) -> Result<(), KernelError> {
        let table = self.table_for(interface, false)?;
        self.add_rules(&[default_network_rule(table, permission)])
    }

    fn remove_from_default(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError> {
        let table = self.table_for(interface, false)?;
        self.delete_rules(&[default_network_rule(table, permission)])
    }

    fn add_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let table = self.table_for(interface, local)?;
        self.add_rules(&uid_rule_set(net_id, table, uid_ranges))
    }

    fn remove_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        let table = self.table_for(interface, local)?;
        self.delete_rules(&uid_rule_set(net_id, table, uid_ranges))
    }

    fn add_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        self.route("add", interface, route)
    }

    fn remove_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        self.route("del", interface, route)
    }
}
