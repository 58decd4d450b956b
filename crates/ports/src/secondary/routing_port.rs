use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;
use domain::network::route::Route;
use domain::network::uid_range::UidRangeMap;

/// Secondary port for kernel policy-routing configuration.
///
/// Every call is synchronous and treated as one atomic, non-cancelable
/// step. Implementations log their own failures; callers decide whether a
/// failure aborts the surrounding operation.
///
/// Implemented by `IpRouteProgrammer` and `LogRoutingPort` in the adapter
/// layer.
pub trait RoutingPort: Send + Sync {
    /// Register `interface` with the network's tables and rules, including
    /// every UID policy in `uid_ranges`. Not idempotent: callers must check
    /// membership first.
    fn attach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError>;

    /// Unregister `interface`. Invalidates any cached interface index, so
    /// it must be the last call made about this interface.
    fn detach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError>;

    /// Reprogram the permission of the interface's rules.
    fn modify_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old: Permission,
        new: Permission,
        local: bool,
    ) -> Result<(), KernelError>;

    fn add_to_default(&self, interface: &str, permission: Permission) -> Result<(), KernelError>;

    fn remove_from_default(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError>;

    fn add_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError>;

    fn remove_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError>;

    fn add_route(&self, interface: &str, route: &Route) -> Result<(), KernelError>;

    fn remove_route(&self, interface: &str, route: &Route) -> Result<(), KernelError>;
}
