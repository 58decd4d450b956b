use std::fmt;

/// Metric of the transient route used to flush cached routing decisions.
/// Must be numerically larger than any route installed for real traffic,
/// including routes learnt from IPv6 router advertisements.
pub const ROUTE_CACHE_FLUSH_METRIC: u32 = 100_000;

/// IPv4 and IPv6 default destinations.
pub const DEFAULT_DESTINATIONS: [&str; 2] = ["0.0.0.0/0", "::/0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteType {
    Unicast,
    Throw,
    Unreachable,
}

impl RouteType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unicast => "unicast",
            Self::Throw => "throw",
            Self::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which routing table a route belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// The per-interface table of the interface the route is attached to.
    Interface,
    /// The shared table of the local network.
    LocalNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix, e.g. `"0.0.0.0/0"` or `"2001:db8::/32"`.
    pub destination: String,
    pub route_type: RouteType,
    pub table: TableKind,
    /// Path MTU; 0 leaves it unset.
    pub mtu: u32,
    pub metric: u32,
}

impl Route {
    /// Low-priority throw route whose creation and removal forces the
    /// kernel to recompute cached routing decisions.
    pub fn cache_flush(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            route_type: RouteType::Throw,
            table: TableKind::Interface,
            mtu: 0,
            metric: ROUTE_CACHE_FLUSH_METRIC,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.destination.contains(':')
    }
}
