use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;
use domain::network::route::Route;
use domain::network::uid_range::UidRangeMap;
use ports::secondary::routing_port::RoutingPort;
use ports::secondary::socket_diag_port::{SocketDiagPort, SocketDiagSession};

/// Routing programmer that only logs what it would do.
///
/// Each call is emitted at INFO level with `event_type = "dry_run"` and
/// always succeeds.
pub struct LogRoutingPort;

impl RoutingPort for LogRoutingPort {
    fn attach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        tracing::info!(
            event_type = "dry_run",
            %net_id,
            interface,
            %permission,
            uid_policies = uid_ranges.len(),
            local,
            "attach interface"
        );
        Ok(())
    }

    fn detach_interface(
        &self,
        net_id: NetId,
        interface: &str,
        permission: Permission,
        uid_ranges: &UidRangeMap,
        local: bool,
    ) -> Result<(), KernelError> {
        tracing::info!(
            event_type = "dry_run",
            %net_id,
            interface,
            %permission,
            uid_policies = uid_ranges.len(),
            local,
            "detach interface"
        );
        Ok(())
    }

    fn modify_permission(
        &self,
        net_id: NetId,
        interface: &str,
        old: Permission,
        new: Permission,
        local: bool,
    ) -> Result<(), KernelError> {
        tracing::info!(event_type = "dry_run", %net_id, interface, %old, %new, local, "modify permission");
        Ok(())
    }

    fn add_to_default(&self, interface: &str, permission: Permission) -> Result<(), KernelError> {
        tracing::info!(event_type = "dry_run", interface, %permission, "add to default network");
        Ok(())
    }

    fn remove_from_default(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError> {
        tracing::info!(event_type = "dry_run", interface, %permission, "remove from default network");
        Ok(())
    }

    fn add_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        _local: bool,
    ) -> Result<(), KernelError> {
        for (sub_priority, ranges) in uid_ranges.iter() {
            tracing::info!(event_type = "dry_run", %net_id, interface, sub_priority, uids = %ranges, "add users");
        }
        Ok(())
    }

    fn remove_users(
        &self,
        net_id: NetId,
        interface: &str,
        uid_ranges: &UidRangeMap,
        _local: bool,
    ) -> Result<(), KernelError> {
        for (sub_priority, ranges) in uid_ranges.iter() {
            tracing::info!(event_type = "dry_run", %net_id, interface, sub_priority, uids = %ranges, "remove users");
        }
        Ok(())
    }

    fn add_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        tracing::debug!(event_type = "dry_run", interface, destination = %route.destination, route_type = %route.route_type, "add route");
        Ok(())
    }

    fn remove_route(&self, interface: &str, route: &Route) -> Result<(), KernelError> {
        tracing::debug!(event_type = "dry_run", interface, destination = %route.destination, route_type = %route.route_type, "remove route");
        Ok(())
    }
}

/// Socket reaper that logs instead of closing anything.
pub struct LogSocketDiag;

impl SocketDiagPort for LogSocketDiag {
    fn open(&self) -> Result<Box<dyn SocketDiagSession>, KernelError> {
        Ok(Box::new(LogSocketDiag))
    }
}

impl SocketDiagSession for LogSocketDiag {
    fn destroy_sockets_lacking_permission(
        &mut self,
        net_id: NetId,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<usize, KernelError> {
        tracing::info!(event_type = "dry_run", %net_id, %permission, exclude_loopback, "destroy sockets lacking permission");
        Ok(0)
    }
}
