use std::time::Duration;

// ── Paths ──────────────────────────────────────────────────────────

pub const DEFAULT_CONFIG_PATH: &str = "/etc/physnetd/config.yaml";
pub const DEFAULT_IP_BINARY: &str = "/sbin/ip";
pub const DEFAULT_SS_BINARY: &str = "/sbin/ss";

// ── Timing ─────────────────────────────────────────────────────────

/// Quiet period before a changed config file is re-read.
pub const CONFIG_RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

// ── Limits ─────────────────────────────────────────────────────────

pub const MAX_NETWORKS: usize = 256;
pub const MAX_INTERFACES_PER_NETWORK: usize = 64;
pub const MAX_UID_POLICIES_PER_NETWORK: usize = 1_000;
