use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::NetworkError;
use super::uid_range::UidRangeMap;

/// Lowest network id a physical network may use.
pub const MIN_NET_ID: u32 = 100;
/// Highest network id a physical network may use (ids share the low 16
/// bits of the socket fwmark).
pub const MAX_NET_ID: u32 = 0xFFFF;
/// Reserved id of the local network.
pub const LOCAL_NET_ID: u32 = 99;

/// Kernel limit on interface name length, including the trailing NUL.
pub const IFNAMSIZ: usize = 16;

/// Immutable network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(pub u32);

impl NetId {
    pub const LOCAL: Self = Self(LOCAL_NET_ID);

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }

    /// Check that the id is usable by a physical (non-local) network.
    pub fn validate_physical(self) -> Result<(), NetworkError> {
        if (MIN_NET_ID..=MAX_NET_ID).contains(&self.0) {
            return Ok(());
        }
        Err(NetworkError::InvalidNetId {
            net_id: self.0,
            reason: format!("physical networks must use ids {MIN_NET_ID}..={MAX_NET_ID}"),
        })
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trust tier gating which UIDs may use a network.
///
/// Ordered from least to most restrictive. `System` implies `Network`,
/// which is reflected in the kernel fwmark encoding returned by [`bits`].
///
/// [`bits`]: Permission::bits
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    None,
    Network,
    System,
}

impl Permission {
    pub const ALL: [Self; 3] = [Self::None, Self::Network, Self::System];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Network => "network",
            Self::System => "system",
        }
    }

    /// Two-bit fwmark encoding.
    pub fn bits(self) -> u32 {
        match self {
            Self::None => 0b00,
            Self::Network => 0b01,
            Self::System => 0b11,
        }
    }

    /// Whether a holder of `self` is allowed on a network requiring `required`.
    pub fn satisfies(self, required: Self) -> bool {
        self.bits() & required.bits() == required.bits()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "network" => Ok(Self::Network),
            "system" => Ok(Self::System),
            _ => Err(format!(
                "invalid permission '{s}': expected none|network|system"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Physical,
    Local,
}

impl NetworkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Physical => "physical",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate a kernel interface name.
pub fn validate_interface_name(name: &str) -> Result<(), NetworkError> {
    let reason = if name.is_empty() {
        "interface name must not be empty".to_string()
    } else if name.len() >= IFNAMSIZ {
        format!("interface name '{name}' exceeds {} bytes", IFNAMSIZ - 1)
    } else if name == "." || name == ".." {
        format!("interface name '{name}' is reserved")
    } else if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        format!("interface name '{name}' contains an invalid character")
    } else {
        return Ok(());
    };
    Err(NetworkError::InvalidArgument { reason })
}

/// Desired state of one network, as produced from configuration and
/// consumed by the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub net_id: NetId,
    pub local: bool,
    pub permission: Permission,
    pub default: bool,
    pub interfaces: BTreeSet<String>,
    pub uid_policies: UidRangeMap,
}

impl NetworkSpec {
    pub fn kind(&self) -> NetworkKind {
        if self.local {
            NetworkKind::Local
        } else {
            NetworkKind::Physical
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_order_is_least_to_most_restrictive() {
        assert!(Permission::None < Permission::Network);
        assert!(Permission::Network < Permission::System);
        assert_eq!(Permission::default(), Permission::None);
    }

    #[test]
    fn permission_satisfies() {
        assert!(Permission::System.satisfies(Permission::Network));
        assert!(Permission::Network.satisfies(Permission::Network));
        assert!(Permission::None.satisfies(Permission::None));
        assert!(!Permission::None.satisfies(Permission::Network));
        assert!(!Permission::Network.satisfies(Permission::System));
    }

    #[test]
    fn permission_from_str() {
        assert_eq!("NETWORK".parse::<Permission>(), Ok(Permission::Network));
        assert_eq!("system".parse::<Permission>(), Ok(Permission::System));
        assert!("root".parse::<Permission>().is_err());
    }

    #[test]
    fn net_id_physical_range() {
        assert!(NetId(100).validate_physical().is_ok());
        assert!(NetId(65535).validate_physical().is_ok());
        assert!(NetId(99).validate_physical().is_err());
        assert!(NetId(65536).validate_physical().is_err());
        assert!(NetId::LOCAL.is_local());
    }

    #[test]
    fn interface_names() {
        assert!(validate_interface_name("wlan0").is_ok());
        assert!(validate_interface_name("rmnet_data0").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("this-name-is-too-long").is_err());
        assert!(validate_interface_name("eth0/1").is_err());
        assert!(validate_interface_name("eth 0").is_err());
        assert!(validate_interface_name("..").is_err());
    }
}
