use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use domain::network::entity::{NetId, Permission, validate_interface_name};
use domain::network::error::NetworkError;
use domain::network::uid_range::UidRanges;
use ports::secondary::fallthrough_port::FallthroughDelegate;

use crate::physical_network::{KernelPorts, PhysicalNetwork};

/// Owns every network of the daemon and enforces the cross-network rules
/// a single [`PhysicalNetwork`] cannot see: one owner per interface, at
/// most one default network, at most one local network.
pub struct NetworkRegistry {
    networks: BTreeMap<NetId, PhysicalNetwork>,
    owners: HashMap<String, NetId>,
    default_network: Option<NetId>,
    ports: KernelPorts,
    delegate: Arc<dyn FallthroughDelegate>,
}

impl NetworkRegistry {
    pub fn new(ports: KernelPorts, delegate: Arc<dyn FallthroughDelegate>) -> Self {
        Self {
            networks: BTreeMap::new(),
            owners: HashMap::new(),
            default_network: None,
            ports,
            delegate,
        }
    }

    // ── Lookup ─────────────────────────────────────────────────────

    pub fn network(&self, net_id: NetId) -> Option<&PhysicalNetwork> {
        self.networks.get(&net_id)
    }

    /// All networks in ascending id order.
    pub fn networks(&self) -> impl Iterator<Item = &PhysicalNetwork> + '_ {
        self.networks.values()
    }

    pub fn net_ids(&self) -> Vec<NetId> {
        self.networks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn default_network(&self) -> Option<NetId> {
        self.default_network
    }

    /// Network the interface is currently a member of.
    pub fn owner_of(&self, interface: &str) -> Option<NetId> {
        self.owners.get(interface).copied()
    }

    fn get_mut(&mut self, net_id: NetId) -> Result<&mut PhysicalNetwork, NetworkError> {
        self.networks
            .get_mut(&net_id)
            .ok_or(NetworkError::NetworkNotFound { net_id })
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    pub fn create_physical_network(
        &mut self,
        net_id: NetId,
        permission: Permission,
    ) -> Result<(), NetworkError> {
        net_id.validate_physical()?;
        self.insert_network(net_id, false, permission)
    }

    pub fn create_local_network(&mut self) -> Result<(), NetworkError> {
        self.insert_network(NetId::LOCAL, true, Permission::None)
    }

    fn insert_network(
        &mut self,
        net_id: NetId,
        local: bool,
        permission: Permission,
    ) -> Result<(), NetworkError> {
        if self.networks.contains_key(&net_id) {
            return Err(NetworkError::DuplicateNetwork { net_id });
        }
        let mut network =
            PhysicalNetwork::new(net_id, Arc::clone(&self.delegate), local, self.ports.clone());
        // No interfaces yet, so this only records the level.
        network.set_permission(permission)?;
        self.networks.insert(net_id, network);
        tracing::info!(%net_id, %permission, local, "network created");
        Ok(())
    }

    /// Drain and drop a network: leave the default table, remove every
    /// interface, then forget it. Stops at the first failure and keeps the
    /// network with whatever membership remains.
    pub fn destroy_network(&mut self, net_id: NetId) -> Result<(), NetworkError> {
        let network = self.get_mut(net_id)?;
        network.remove_as_default()?;
        if self.default_network == Some(net_id) {
            self.default_network = None;
        }

        let network = self.get_mut(net_id)?;
        let interfaces: Vec<String> = network.interfaces().map(str::to_string).collect();
        for interface in interfaces {
            self.get_mut(net_id)?.remove_interface(&interface)?;
            self.owners.remove(&interface);
        }

        self.networks.remove(&net_id);
        tracing::info!(%net_id, "network destroyed");
        Ok(())
    }

    /// Destroy every network, continuing past failures. Returns the
    /// networks that could not be fully drained.
    pub fn drain(&mut self) -> Vec<(NetId, NetworkError)> {
        let mut failures = Vec::new();
        for net_id in self.net_ids() {
            if let Err(e) = self.destroy_network(net_id) {
                tracing::warn!(%net_id, "failed to drain network: {e}");
                failures.push((net_id, e));
            }
        }
        failures
    }

    // ── Membership ─────────────────────────────────────────────────

    pub fn add_interface(&mut self, net_id: NetId, interface: &str) -> Result<(), NetworkError> {
        validate_interface_name(interface)?;
        if let Some(owner) = self.owner_of(interface)
            && owner != net_id
        {
            return Err(NetworkError::InterfaceInUse {
                interface: interface.to_string(),
                owner,
            });
        }
        self.get_mut(net_id)?.add_interface(interface)?;
        self.owners.insert(interface.to_string(), net_id);
        Ok(())
    }

    pub fn remove_interface(
        &mut self,
        net_id: NetId,
        interface: &str,
    ) -> Result<(), NetworkError> {
        self.get_mut(net_id)?.remove_interface(interface)?;
        if self.owner_of(interface) == Some(net_id) {
            self.owners.remove(interface);
        }
        Ok(())
    }

    // ── Policy ─────────────────────────────────────────────────────

    pub fn set_permission(
        &mut self,
        net_id: NetId,
        permission: Permission,
    ) -> Result<(), NetworkError> {
        self.get_mut(net_id)?.set_permission(permission)
    }

    pub fn add_users(
        &mut self,
        net_id: NetId,
        uid_ranges: &UidRanges,
        sub_priority: i32,
    ) -> Result<(), NetworkError> {
        self.get_mut(net_id)?.add_users(uid_ranges, sub_priority)
    }

    pub fn remove_users(
        &mut self,
        net_id: NetId,
        uid_ranges: &UidRanges,
        sub_priority: i32,
    ) -> Result<(), NetworkError> {
        self.get_mut(net_id)?.remove_users(uid_ranges, sub_priority)
    }

    /// Switch the default network.
    ///
    /// The new default is added before the old one is removed. If removing
    /// the old default fails, [`default_network`](Self::default_network)
    /// keeps reporting it so the same call can be retried.
    pub fn set_default_network(&mut self, net_id: Option<NetId>) -> Result<(), NetworkError> {
        if net_id == self.default_network {
            return Ok(());
        }

        if let Some(new) = net_id {
            let network = self.get_mut(new)?;
            if network.is_local() {
                return Err(NetworkError::InvalidArgument {
                    reason: format!("local network {new} cannot be the default network"),
                });
            }
            network.add_as_default()?;
        }

        if let Some(old) = self.default_network
            && let Some(network) = self.networks.get_mut(&old)
        {
            network.remove_as_default()?;
        }

        self.default_network = net_id;
        match net_id {
            Some(net_id) => tracing::info!(%net_id, "default network changed"),
            None => tracing::info!("default network cleared"),
        }
        Ok(())
    }
}
