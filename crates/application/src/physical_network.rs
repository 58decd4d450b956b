use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use domain::network::entity::{NetId, NetworkKind, Permission, validate_interface_name};
use domain::network::error::{KernelError, NetworkError, ProgrammingStep};
use domain::network::route::{DEFAULT_DESTINATIONS, Route};
use domain::network::uid_range::{UidRangeMap, UidRanges, is_valid_sub_priority};
use ports::secondary::fallthrough_port::FallthroughDelegate;
use ports::secondary::routing_port::RoutingPort;
use ports::secondary::socket_diag_port::SocketDiagPort;

/// Kernel-facing collaborators shared by every network of a registry.
#[derive(Clone)]
pub struct KernelPorts {
    pub routing: Arc<dyn RoutingPort>,
    pub sockets: Arc<dyn SocketDiagPort>,
}

/// Policy and membership controller for one physical network.
///
/// Owns the interface set, permission level, default status and UID
/// routing subscriptions of the network, and drives the routing programmer
/// and socket reaper in the order needed to keep the kernel consistent with
/// that state.
///
/// Multi-step operations stop at the first kernel failure and never roll
/// back earlier steps. The returned [`NetworkError::KernelProgramming`]
/// names the failing interface and step, and lists the interfaces that had
/// already committed the failing phase. In-memory state only changes once
/// every kernel step of an operation has succeeded.
///
/// Not internally synchronised: callers serialise mutations.
pub struct PhysicalNetwork {
    net_id: NetId,
    local: bool,
    permission: Permission,
    is_default: bool,
    interfaces: BTreeSet<String>,
    uid_policies: UidRangeMap,
    delegate: Arc<dyn FallthroughDelegate>,
    routing: Arc<dyn RoutingPort>,
    sockets: Arc<dyn SocketDiagPort>,
}

impl PhysicalNetwork {
    pub fn new(
        net_id: NetId,
        delegate: Arc<dyn FallthroughDelegate>,
        local: bool,
        ports: KernelPorts,
    ) -> Self {
        Self {
            net_id,
            local,
            permission: Permission::None,
            is_default: false,
            interfaces: BTreeSet::new(),
            uid_policies: UidRangeMap::new(),
            delegate,
            routing: ports.routing,
            sockets: ports.sockets,
        }
    }

    // ── Accessors ──────────────────────────────────────────────────

    pub fn net_id(&self) -> NetId {
        self.net_id
    }

    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn kind(&self) -> NetworkKind {
        if self.local {
            NetworkKind::Local
        } else {
            NetworkKind::Physical
        }
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interfaces.contains(interface)
    }

    /// Member interfaces in sorted order.
    pub fn interfaces(&self) -> impl Iterator<Item = &str> + '_ {
        self.interfaces.iter().map(String::as_str)
    }

    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    pub fn uid_range_map(&self) -> &UidRangeMap {
        &self.uid_policies
    }

    /// Most preferred sub-priority at which `uid` is subscribed, if any.
    pub fn applies_to_uid(&self, uid: u32) -> Option<i32> {
        self.uid_policies.applies_to_uid(uid)
    }

    // ── Permission ─────────────────────────────────────────────────

    /// Move the network to `permission`.
    ///
    /// Sockets lacking the new permission are destroyed before and after
    /// the rule changes. If a rule change fails part-way, interfaces listed
    /// in the error's `committed` set already carry the new permission
    /// while [`permission`](Self::permission) still reports the old one.
    ///
    /// On a default network each interface switches its default-table
    /// registration by adding the new one, then removing the old one. If
    /// the removal fails (step `RemoveFromDefault` or `RemoveFallthrough`)
    /// the failing interface holds both registrations; `committed` lists
    /// only the interfaces that switched fully.
    pub fn set_permission(&mut self, permission: Permission) -> Result<(), NetworkError> {
        if permission == self.permission {
            return Ok(());
        }
        if self.interfaces.is_empty() {
            self.permission = permission;
            return Ok(());
        }

        // Close sockets that would be orphaned by the rule change before
        // any rule is touched.
        self.destroy_sockets_best_effort(permission);

        let old = self.permission;
        let mut modified = Vec::new();
        for interface in &self.interfaces {
            if let Err(e) =
                self.routing
                    .modify_permission(self.net_id, interface, old, permission, self.local)
            {
                tracing::error!(
                    net_id = %self.net_id,
                    interface = %interface,
                    %old,
                    new = %permission,
                    "failed to change permission: {e}"
                );
                return Err(NetworkError::kernel(
                    self.net_id,
                    interface,
                    ProgrammingStep::ModifyPermission,
                    e,
                )
                .with_committed(modified));
            }
            modified.push(interface.clone());
            self.invalidate_route_cache(interface);
        }

        if self.is_default {
            let mut switched = Vec::new();
            for interface in &self.interfaces {
                // New rules go in before the old ones come out so the
                // interface never lacks a default route.
                if let Err(e) = self
                    .add_to_default(interface, permission)
                    .and_then(|()| self.remove_from_default(interface, old))
                {
                    return Err(e.with_committed(switched));
                }
                switched.push(interface.clone());
            }
        }

        // Sockets may have connected while the rules were changing.
        self.destroy_sockets_best_effort(permission);

        self.permission = permission;
        tracing::info!(net_id = %self.net_id, %old, new = %permission, "network permission changed");
        Ok(())
    }

    /// Destroy sockets bound to this network that lack `permission`.
    ///
    /// Every socket satisfies [`Permission::None`], so that case returns
    /// immediately. Returns the number of sockets closed.
    pub fn destroy_sockets_lacking_permission(
        &self,
        permission: Permission,
    ) -> Result<usize, NetworkError> {
        if permission == Permission::None {
            return Ok(0);
        }
        let mut session = self
            .sockets
            .open()
            .map_err(|e| NetworkError::ResourceUnavailable {
                reason: format!("socket diagnostics session: {e}"),
            })?;
        session
            .destroy_sockets_lacking_permission(self.net_id, permission, true)
            .map_err(|source| NetworkError::KernelProgramming {
                net_id: self.net_id,
                interface: None,
                step: ProgrammingStep::SocketTeardown,
                committed: Vec::new(),
                source,
            })
    }

    fn destroy_sockets_best_effort(&self, permission: Permission) {
        match self.destroy_sockets_lacking_permission(permission) {
            Ok(closed) => {
                tracing::debug!(net_id = %self.net_id, %permission, closed, "destroyed sockets lacking permission");
            }
            Err(e) => {
                tracing::warn!(net_id = %self.net_id, %permission, "failed to destroy sockets: {e}");
            }
        }
    }

    /// Create and immediately delete a low-priority throw route on both
    /// default destinations so the kernel drops routing decisions cached
    /// under the previous rules. Results are discarded: there is nothing to
    /// do if the flush fails.
    fn invalidate_route_cache(&self, interface: &str) {
        for destination in DEFAULT_DESTINATIONS {
            let route = Route::cache_flush(destination);
            let _ = self.routing.add_route(interface, &route);
            let _ = self.routing.remove_route(interface, &route);
        }
    }

    // ── Default network ────────────────────────────────────────────

    /// Make this the default network. On failure the network stays
    /// non-default and interfaces already registered stay registered.
    pub fn add_as_default(&mut self) -> Result<(), NetworkError> {
        if self.is_default {
            return Ok(());
        }
        let mut added = Vec::new();
        for interface in &self.interfaces {
            if let Err(e) = self.add_to_default(interface, self.permission) {
                return Err(e.with_committed(added));
            }
            added.push(interface.clone());
        }
        self.is_default = true;
        tracing::info!(net_id = %self.net_id, "network is now default");
        Ok(())
    }

    /// Stop being the default network. On failure the network stays
    /// default and interfaces already removed stay removed.
    pub fn remove_as_default(&mut self) -> Result<(), NetworkError> {
        if !self.is_default {
            return Ok(());
        }
        let mut removed = Vec::new();
        for interface in &self.interfaces {
            if let Err(e) = self.remove_from_default(interface, self.permission) {
                return Err(e.with_committed(removed));
            }
            removed.push(interface.clone());
        }
        self.is_default = false;
        tracing::info!(net_id = %self.net_id, "network is no longer default");
        Ok(())
    }

    fn add_to_default(&self, interface: &str, permission: Permission) -> Result<(), NetworkError> {
        self.routing
            .add_to_default(interface, permission)
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::AddToDefault, e))?;
        self.delegate
            .add_fallthrough(interface, permission)
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::AddFallthrough, e))
    }

    fn remove_from_default(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), NetworkError> {
        self.routing
            .remove_from_default(interface, permission)
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::RemoveFromDefault, e))?;
        self.delegate
            .remove_fallthrough(interface, permission)
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::RemoveFallthrough, e))
    }

    // ── UID policies ───────────────────────────────────────────────

    /// Route `uid_ranges` through this network at `sub_priority`.
    ///
    /// Ranges join any existing policy at the same sub-priority as separate
    /// rules; they must not overlap it.
    pub fn add_users(
        &mut self,
        uid_ranges: &UidRanges,
        sub_priority: i32,
    ) -> Result<(), NetworkError> {
        if !is_valid_sub_priority(sub_priority) {
            return Err(NetworkError::invalid_sub_priority(sub_priority));
        }
        self.can_add_uid_ranges(uid_ranges, sub_priority)?;
        if uid_ranges.is_empty() {
            return Ok(());
        }

        let policy = UidRangeMap::single(sub_priority, uid_ranges.clone());
        let mut added = Vec::new();
        for interface in &self.interfaces {
            if let Err(e) = self
                .routing
                .add_users(self.net_id, interface, &policy, self.local)
            {
                return Err(self
                    .kernel_failure(interface, ProgrammingStep::AddUsers, e)
                    .with_committed(added));
            }
            added.push(interface.clone());
        }
        self.uid_policies.add(uid_ranges, sub_priority);
        tracing::debug!(net_id = %self.net_id, sub_priority, uids = %uid_ranges, "uid policy added");
        Ok(())
    }

    /// Stop routing `uid_ranges` through this network at `sub_priority`.
    ///
    /// Each range must have been added with exactly these bounds: the
    /// kernel holds one rule per added range and cannot delete part of one.
    pub fn remove_users(
        &mut self,
        uid_ranges: &UidRanges,
        sub_priority: i32,
    ) -> Result<(), NetworkError> {
        if !is_valid_sub_priority(sub_priority) {
            return Err(NetworkError::invalid_sub_priority(sub_priority));
        }
        if uid_ranges.is_empty() {
            return Ok(());
        }
        if !self.uid_policies.holds(uid_ranges, sub_priority) {
            let held = self
                .uid_policies
                .get(sub_priority)
                .map_or_else(|| "nothing".to_string(), ToString::to_string);
            return Err(NetworkError::invalid_uid_ranges(format!(
                "uid ranges {uid_ranges} are not subscribed at sub-priority {sub_priority} (held: {held})"
            )));
        }

        let policy = UidRangeMap::single(sub_priority, uid_ranges.clone());
        let mut removed = Vec::new();
        for interface in &self.interfaces {
            if let Err(e) = self
                .routing
                .remove_users(self.net_id, interface, &policy, self.local)
            {
                return Err(self
                    .kernel_failure(interface, ProgrammingStep::RemoveUsers, e)
                    .with_committed(removed));
            }
            removed.push(interface.clone());
        }
        self.uid_policies.remove(uid_ranges, sub_priority);
        tracing::debug!(net_id = %self.net_id, sub_priority, uids = %uid_ranges, "uid policy removed");
        Ok(())
    }

    /// Ranges are already free of self-overlap once built; they must also
    /// stay disjoint from what is subscribed at the same sub-priority.
    fn can_add_uid_ranges(
        &self,
        uid_ranges: &UidRanges,
        sub_priority: i32,
    ) -> Result<(), NetworkError> {
        if let Some(existing) = self.uid_policies.get(sub_priority)
            && existing.overlaps(uid_ranges)
        {
            return Err(NetworkError::invalid_uid_ranges(format!(
                "uid ranges {uid_ranges} overlap {existing} already at sub-priority {sub_priority}"
            )));
        }
        Ok(())
    }

    // ── Interfaces ─────────────────────────────────────────────────

    /// Attach `interface` to the network.
    ///
    /// The interface inherits the current permission and every active UID
    /// policy. If the network is default and the default-table step fails,
    /// the interface stays attached in the kernel but is not a member.
    pub fn add_interface(&mut self, interface: &str) -> Result<(), NetworkError> {
        if self.has_interface(interface) {
            return Ok(());
        }
        validate_interface_name(interface)?;

        self.routing
            .attach_interface(
                self.net_id,
                interface,
                self.permission,
                &self.uid_policies,
                self.local,
            )
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::Attach, e))?;

        if self.is_default {
            self.add_to_default(interface, self.permission)?;
        }

        self.interfaces.insert(interface.to_string());
        tracing::info!(net_id = %self.net_id, interface, "interface added");
        Ok(())
    }

    /// Detach `interface` from the network, leaving the default table
    /// first when the network is default.
    pub fn remove_interface(&mut self, interface: &str) -> Result<(), NetworkError> {
        if !self.has_interface(interface) {
            return Ok(());
        }

        if self.is_default {
            self.remove_from_default(interface, self.permission)?;
        }

        // Detaching flushes the routing programmer's interface index cache,
        // so it must be the last kernel call made for this interface.
        self.routing
            .detach_interface(
                self.net_id,
                interface,
                self.permission,
                &self.uid_policies,
                self.local,
            )
            .map_err(|e| self.kernel_failure(interface, ProgrammingStep::Detach, e))?;

        self.interfaces.remove(interface);
        tracing::info!(net_id = %self.net_id, interface, "interface removed");
        Ok(())
    }

    fn kernel_failure(
        &self,
        interface: &str,
        step: ProgrammingStep,
        source: KernelError,
    ) -> NetworkError {
        tracing::error!(net_id = %self.net_id, interface, %step, "kernel programming failed: {source}");
        NetworkError::kernel(self.net_id, interface, step, source)
    }
}

impl fmt::Display for PhysicalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} network {} permission={} default={} interfaces=[",
            self.kind(),
            self.net_id,
            self.permission,
            self.is_default
        )?;
        for (i, interface) in self.interfaces.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(interface)?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for PhysicalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalNetwork")
            .field("net_id", &self.net_id)
            .field("local", &self.local)
            .field("permission", &self.permission)
            .field("is_default", &self.is_default)
            .field("interfaces", &self.interfaces)
            .field("uid_policies", &self.uid_policies)
            .finish_non_exhaustive()
    }
}
