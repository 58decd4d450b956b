use domain::network::entity::{NetId, Permission};
use domain::network::error::KernelError;

/// Secondary port for the socket-diagnostics facility used to enumerate
/// and forcibly close live sockets.
pub trait SocketDiagPort: Send + Sync {
    /// Acquire a transient diagnostic session.
    fn open(&self) -> Result<Box<dyn SocketDiagSession>, KernelError>;
}

/// An open diagnostic session.
pub trait SocketDiagSession {
    /// Close every socket on `net_id` whose owner lacks `permission`.
    ///
    /// Best-effort: keeps going after an individual close fails and
    /// reports the first failure. Returns the number of sockets closed.
    fn destroy_sockets_lacking_permission(
        &mut self,
        net_id: NetId,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<usize, KernelError>;
}
