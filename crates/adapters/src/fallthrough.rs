use domain::network::entity::Permission;
use domain::network::error::KernelError;
use ports::secondary::fallthrough_port::FallthroughDelegate;

/// Delegate for deployments without virtual networks: there is nothing to
/// fall through to, so default-network changes need no extra rules.
pub struct NoopFallthrough;

impl FallthroughDelegate for NoopFallthrough {
    fn add_fallthrough(&self, interface: &str, permission: Permission) -> Result<(), KernelError> {
        tracing::trace!(interface, %permission, "no fallthrough targets");
        Ok(())
    }

    fn remove_fallthrough(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<(), KernelError> {
        tracing::trace!(interface, %permission, "no fallthrough targets");
        Ok(())
    }
}
