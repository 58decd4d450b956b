use std::fmt;

use thiserror::Error;

use super::entity::NetId;

/// Kernel-facing step of a multi-step network operation.
///
/// Carried by [`NetworkError::KernelProgramming`] so callers can tell which
/// phase of an operation failed and which phases had already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgrammingStep {
    Attach,
    Detach,
    ModifyPermission,
    AddToDefault,
    RemoveFromDefault,
    AddFallthrough,
    RemoveFallthrough,
    AddUsers,
    RemoveUsers,
    SocketTeardown,
}

impl ProgrammingStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::ModifyPermission => "modify_permission",
            Self::AddToDefault => "add_to_default",
            Self::RemoveFromDefault => "remove_from_default",
            Self::AddFallthrough => "add_fallthrough",
            Self::RemoveFallthrough => "remove_fallthrough",
            Self::AddUsers => "add_users",
            Self::RemoveUsers => "remove_users",
            Self::SocketTeardown => "socket_teardown",
        }
    }
}

impl fmt::Display for ProgrammingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a kernel collaborator (routing programmer, socket
/// reaper or fallthrough delegate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {reason}")]
pub struct KernelError {
    /// Short label of the kernel operation, e.g. `"ip rule add"`.
    pub operation: String,
    /// Errno-style code or process exit status, when one is known.
    pub code: Option<i32>,
    pub reason: String,
}

impl KernelError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            code: None,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }
}

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("invalid network id {net_id}: {reason}")]
    InvalidNetId { net_id: u32, reason: String },

    #[error("netId {net_id}: {step} failed{}: {source}", interface_suffix(.interface))]
    KernelProgramming {
        net_id: NetId,
        interface: Option<String>,
        step: ProgrammingStep,
        /// Interfaces that completed the failing phase before the failure.
        /// Nothing listed here is rolled back. The failing interface is
        /// never listed, even when an earlier call of its own phase went
        /// through; `step` tells how far it got.
        committed: Vec<String>,
        #[source]
        source: KernelError,
    },

    #[error("resource unavailable: {reason}")]
    ResourceUnavailable { reason: String },

    #[error("network {net_id} not found")]
    NetworkNotFound { net_id: NetId },

    #[error("network {net_id} already exists")]
    DuplicateNetwork { net_id: NetId },

    #[error("interface '{interface}' already belongs to network {owner}")]
    InterfaceInUse { interface: String, owner: NetId },
}

fn interface_suffix(interface: &Option<String>) -> String {
    interface
        .as_deref()
        .map(|name| format!(" on interface {name}"))
        .unwrap_or_default()
}

impl NetworkError {
    pub fn invalid_sub_priority(sub_priority: i32) -> Self {
        Self::InvalidArgument {
            reason: format!("sub-priority {sub_priority} is out of range"),
        }
    }

    pub fn invalid_uid_ranges(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn kernel(
        net_id: NetId,
        interface: &str,
        step: ProgrammingStep,
        source: KernelError,
    ) -> Self {
        Self::KernelProgramming {
            net_id,
            interface: Some(interface.to_string()),
            step,
            committed: Vec::new(),
            source,
        }
    }

    /// Attach the list of interfaces that had already committed the failing
    /// phase. No effect on non-kernel errors.
    #[must_use]
    pub fn with_committed(mut self, interfaces: Vec<String>) -> Self {
        if let Self::KernelProgramming { committed, .. } = &mut self {
            *committed = interfaces;
        }
        self
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }

    pub fn step(&self) -> Option<ProgrammingStep> {
        match self {
            Self::KernelProgramming { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Interface whose kernel call failed, if the error names one.
    pub fn failed_interface(&self) -> Option<&str> {
        match self {
            Self::KernelProgramming { interface, .. } => interface.as_deref(),
            _ => None,
        }
    }

    pub fn committed_interfaces(&self) -> &[String] {
        match self {
            Self::KernelProgramming { committed, .. } => committed,
            _ => &[],
        }
    }
}
