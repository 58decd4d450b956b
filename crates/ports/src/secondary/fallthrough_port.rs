use domain::network::error::KernelError;
use domain::network::entity::Permission;

/// Hook invoked when an interface enters or leaves default-network status,
/// letting the owner of the network install network-kind-specific extra
/// routing (e.g. fallthrough rules for virtual networks).
pub trait FallthroughDelegate: Send + Sync {
    fn add_fallthrough(&self, interface: &str, permission: Permission) -> Result<(), KernelError>;

    fn remove_fallthrough(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError>;
}
