use std::collections::BTreeSet;

use domain::network::entity::{NetId, NetworkSpec, Permission, validate_interface_name};
use domain::network::uid_range::{UidRange, UidRangeMap, UidRanges, is_valid_sub_priority};
use serde::{Deserialize, Serialize};

use super::common::{ConfigError, check_limit, validation};
use crate::constants::{MAX_INTERFACES_PER_NETWORK, MAX_UID_POLICIES_PER_NETWORK};

/// Desired state of one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Required for physical networks; the local network always uses the
    /// reserved id and may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_id: Option<u32>,

    #[serde(default)]
    pub local: bool,

    #[serde(default)]
    pub permission: Permission,

    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub interfaces: Vec<String>,

    #[serde(default)]
    pub uid_policies: Vec<UidPolicyConfig>,
}

/// UIDs routed through a network at one sub-priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UidPolicyConfig {
    pub sub_priority: i32,
    /// Entries such as `"10000-10999"` or `"20000"`.
    pub uids: Vec<String>,
}

impl NetworkConfig {
    /// Effective network id.
    pub fn resolved_id(&self, idx: usize) -> Result<NetId, ConfigError> {
        match (self.local, self.net_id) {
            (true, None) => Ok(NetId::LOCAL),
            (true, Some(id)) if id == NetId::LOCAL.as_u32() => Ok(NetId::LOCAL),
            (true, Some(id)) => Err(validation(
                format!("networks[{idx}].net_id"),
                format!("the local network uses id {}, got {id}", NetId::LOCAL),
            )),
            (false, None) => Err(validation(
                format!("networks[{idx}].net_id"),
                "physical networks require a net_id",
            )),
            (false, Some(id)) => {
                let net_id = NetId(id);
                net_id
                    .validate_physical()
                    .map_err(|e| validation(format!("networks[{idx}].net_id"), e.to_string()))?;
                Ok(net_id)
            }
        }
    }

    /// Validate this entry on its own. Cross-network rules are checked by
    /// the top-level config.
    pub fn validate(&self, idx: usize) -> Result<(), ConfigError> {
        let prefix = format!("networks[{idx}]");
        self.resolved_id(idx)?;

        if self.local {
            if self.default {
                return Err(validation(
                    format!("{prefix}.default"),
                    "the local network cannot be the default network",
                ));
            }
            if self.permission != Permission::None {
                return Err(validation(
                    format!("{prefix}.permission"),
                    "the local network does not carry a permission",
                ));
            }
        }

        check_limit(
            &format!("{prefix}.interfaces"),
            self.interfaces.len(),
            MAX_INTERFACES_PER_NETWORK,
        )?;
        let mut seen = BTreeSet::new();
        for (i, interface) in self.interfaces.iter().enumerate() {
            let field = format!("{prefix}.interfaces[{i}]");
            validate_interface_name(interface).map_err(|e| validation(&field, e.to_string()))?;
            if !seen.insert(interface.as_str()) {
                return Err(validation(field, format!("'{interface}' is listed twice")));
            }
        }

        check_limit(
            &format!("{prefix}.uid_policies"),
            self.uid_policies.len(),
            MAX_UID_POLICIES_PER_NETWORK,
        )?;
        let mut priorities = BTreeSet::new();
        for (i, policy) in self.uid_policies.iter().enumerate() {
            let field = format!("{prefix}.uid_policies[{i}]");
            if !priorities.insert(policy.sub_priority) {
                return Err(validation(
                    format!("{field}.sub_priority"),
                    format!("sub-priority {} is listed twice", policy.sub_priority),
                ));
            }
            policy.parse(&field)?;
        }
        Ok(())
    }

    /// Convert to the domain desired-state type.
    pub fn to_domain(&self, idx: usize) -> Result<NetworkSpec, ConfigError> {
        let net_id = self.resolved_id(idx)?;
        let mut uid_policies = UidRangeMap::new();
        for (i, policy) in self.uid_policies.iter().enumerate() {
            let ranges = policy.parse(&format!("networks[{idx}].uid_policies[{i}]"))?;
            uid_policies.add(&ranges, policy.sub_priority);
        }
        Ok(NetworkSpec {
            net_id,
            local: self.local,
            permission: self.permission,
            default: self.default,
            interfaces: self.interfaces.iter().cloned().collect(),
            uid_policies,
        })
    }
}

impl UidPolicyConfig {
    fn parse(&self, field: &str) -> Result<UidRanges, ConfigError> {
        if !is_valid_sub_priority(self.sub_priority) {
            return Err(validation(
                format!("{field}.sub_priority"),
                format!("sub-priority {} is out of range", self.sub_priority),
            ));
        }
        if self.uids.is_empty() {
            return Err(validation(format!("{field}.uids"), "at least one uid range is required"));
        }
        let ranges = self
            .uids
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                raw.parse::<UidRange>()
                    .map_err(|e| validation(format!("{field}.uids[{i}]"), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        UidRanges::from_ranges(ranges).map_err(|e| validation(format!("{field}.uids"), e.to_string()))
    }
}
