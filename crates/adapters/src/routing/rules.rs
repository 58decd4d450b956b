//! Policy-routing layout shared by the iproute2 programmer and the socket
//! reaper: fwmark bit layout, routing table numbering and rule priorities.

use domain::network::entity::{NetId, Permission};
use domain::network::uid_range::{SUB_PRIORITY_NO_DEFAULT, UidRange};

// ── Fwmark layout ──────────────────────────────────────────────────

/// Bits 0-15: network id the socket is bound to.
pub const FWMARK_NET_ID_MASK: u32 = 0xFFFF;
/// Bit 16: the network was explicitly selected by the application.
pub const FWMARK_EXPLICIT: u32 = 1 << 16;
/// Bits 18-19: permission held by the socket owner.
pub const FWMARK_PERMISSION_SHIFT: u32 = 18;
pub const FWMARK_PERMISSION_MASK: u32 = 0b11 << FWMARK_PERMISSION_SHIFT;

// ── Tables ─────────────────────────────────────────────────────────

/// Per-interface tables are numbered `ifindex + ROUTE_TABLE_OFFSET`.
pub const ROUTE_TABLE_OFFSET: u32 = 1000;
/// Table shared by every interface of the local network.
pub const LOCAL_NETWORK_TABLE: u32 = 97;

// ── Rule priorities ────────────────────────────────────────────────

pub const RULE_PRIORITY_UID_EXPLICIT_NETWORK: u32 = 15_000;
pub const RULE_PRIORITY_EXPLICIT_NETWORK: u32 = 16_000;
pub const RULE_PRIORITY_OUTPUT_INTERFACE: u32 = 17_000;
pub const RULE_PRIORITY_LOCAL_NETWORK: u32 = 20_000;
pub const RULE_PRIORITY_UID_IMPLICIT_NETWORK: u32 = 22_000;
pub const RULE_PRIORITY_IMPLICIT_NETWORK: u32 = 23_000;
pub const RULE_PRIORITY_UID_DEFAULT_NETWORK: u32 = 27_000;
pub const RULE_PRIORITY_DEFAULT_NETWORK: u32 = 29_000;

/// Socket mark value and the mask of bits a rule compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fwmark {
    pub value: u32,
    pub mask: u32,
}

impl Fwmark {
    /// Match sockets bound to `net_id` whose owner holds `permission`.
    pub fn network(net_id: NetId, explicit: bool, permission: Option<Permission>) -> Self {
        let mut value = net_id.as_u32() & FWMARK_NET_ID_MASK;
        let mut mask = FWMARK_NET_ID_MASK;
        if explicit {
            value |= FWMARK_EXPLICIT;
            mask |= FWMARK_EXPLICIT;
        }
        if let Some(permission) = permission {
            value |= permission_bits(permission);
            mask |= FWMARK_PERMISSION_MASK;
        }
        Self { value, mask }
    }

    /// Match on permission bits only.
    pub fn permission(permission: Permission) -> Self {
        Self {
            value: permission_bits(permission),
            mask: FWMARK_PERMISSION_MASK,
        }
    }

    pub fn render(self) -> String {
        format!("{:#x}/{:#x}", self.value, self.mask)
    }
}

pub fn permission_bits(permission: Permission) -> u32 {
    permission.bits() << FWMARK_PERMISSION_SHIFT
}

/// One `ip rule` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRule {
    pub priority: u32,
    pub table: u32,
    pub fwmark: Option<Fwmark>,
    pub uid_range: Option<UidRange>,
    pub iif: Option<String>,
    pub oif: Option<String>,
}

impl IpRule {
    fn new(priority: u32, table: u32) -> Self {
        Self {
            priority,
            table,
            fwmark: None,
            uid_range: None,
            iif: None,
            oif: None,
        }
    }

    /// `ip rule` arguments after the family flag, e.g.
    /// `rule add priority 16000 fwmark 0x10064/0x1ffff iif lo table 1002`.
    pub fn args(&self, action: &str) -> Vec<String> {
        let mut args = vec![
            "rule".to_string(),
            action.to_string(),
            "priority".to_string(),
            self.priority.to_string(),
        ];
        if let Some(fwmark) = self.fwmark {
            args.extend(["fwmark".to_string(), fwmark.render()]);
        }
        if let Some(range) = self.uid_range {
            args.extend([
                "uidrange".to_string(),
                format!("{}-{}", range.start(), range.stop()),
            ]);
        }
        if let Some(iif) = &self.iif {
            args.extend(["iif".to_string(), iif.clone()]);
        }
        if let Some(oif) = &self.oif {
            args.extend(["oif".to_string(), oif.clone()]);
        }
        args.extend(["table".to_string(), self.table.to_string()]);
        args
    }
}

/// Rules that send an interface's traffic to its table. Permission-gated
/// for physical networks; the local network carries no permission bits.
pub fn membership_rules(
    net_id: NetId,
    interface: &str,
    table: u32,
    permission: Permission,
    local: bool,
) -> Vec<IpRule> {
    let gate = (!local).then_some(permission);

    let mut explicit = IpRule::new(RULE_PRIORITY_EXPLICIT_NETWORK, table);
    explicit.fwmark = Some(Fwmark::network(net_id, true, gate));
    explicit.iif = Some("lo".to_string());

    let mut output = IpRule::new(RULE_PRIORITY_OUTPUT_INTERFACE, table);
    output.fwmark = gate.map(Fwmark::permission);
    output.iif = Some("lo".to_string());
    output.oif = Some(interface.to_string());

    if local {
        let mut incoming = IpRule::new(RULE_PRIORITY_LOCAL_NETWORK, table);
        incoming.iif = Some(interface.to_string());
        return vec![explicit, output, incoming];
    }

    let mut implicit = IpRule::new(RULE_PRIORITY_IMPLICIT_NETWORK, table);
    implicit.fwmark = Some(Fwmark::network(net_id, false, gate));
    implicit.iif = Some("lo".to_string());

    vec![explicit, output, implicit]
}

/// Rules routing one UID range through a table at `sub_priority`.
pub fn uid_rules(net_id: NetId, table: u32, range: UidRange, sub_priority: i32) -> Vec<IpRule> {
    let offset = u32::try_from(sub_priority).unwrap_or_default();

    let mut explicit = IpRule::new(RULE_PRIORITY_UID_EXPLICIT_NETWORK + offset, table);
    explicit.fwmark = Some(Fwmark::network(net_id, true, None));
    explicit.uid_range = Some(range);
    explicit.iif = Some("lo".to_string());

    // Unmarked sockets: net id bits clear.
    let mut implicit = IpRule::new(RULE_PRIORITY_UID_IMPLICIT_NETWORK + offset, table);
    implicit.fwmark = Some(Fwmark {
        value: 0,
        mask: FWMARK_NET_ID_MASK,
    });
    implicit.uid_range = Some(range);
    implicit.iif = Some("lo".to_string());

    if sub_priority == SUB_PRIORITY_NO_DEFAULT {
        return vec![explicit, implicit];
    }

    let mut default = IpRule::new(RULE_PRIORITY_UID_DEFAULT_NETWORK + offset, table);
    default.uid_range = Some(range);
    default.iif = Some("lo".to_string());

    vec![explicit, implicit, default]
}

/// Default-network rule: unmarked sockets whose owner holds `permission`.
pub fn default_network_rule(table: u32, permission: Permission) -> IpRule {
    let mut rule = IpRule::new(RULE_PRIORITY_DEFAULT_NETWORK, table);
    rule.fwmark = Some(Fwmark {
        value: permission_bits(permission),
        mask: FWMARK_NET_ID_MASK | FWMARK_PERMISSION_MASK,
    });
    rule.iif = Some("lo".to_string());
    rule
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fwmark_layout() {
        let mark = Fwmark::network(NetId(100), true, Some(Permission::System));
        assert_eq!(mark.value, 100 | FWMARK_EXPLICIT | (0b11 << 18));
        assert_eq!(mark.mask, 0xFFFF | FWMARK_EXPLICIT | FWMARK_PERMISSION_MASK);
        assert_eq!(
            Fwmark::permission(Permission::Network).render(),
            "0x40000/0xc0000"
        );
        assert_eq!(Fwmark::network(NetId(100), false, None).render(), "0x64/0xffff");
    }

    #[test]
    fn physical_membership_rules() {
        let rules = membership_rules(NetId(100), "eth0", 1002, Permission::None, false);
        let priorities: Vec<u32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, [16_000, 17_000, 23_000]);
        assert_eq!(
            rules[0].args("add").join(" "),
            "rule add priority 16000 fwmark 0x10064/0xdffff iif lo table 1002"
        );
        assert_eq!(
            rules[1].args("add").join(" "),
            "rule add priority 17000 fwmark 0x0/0xc0000 iif lo oif eth0 table 1002"
        );
    }

    #[test]
    fn local_membership_rules_ignore_permission() {
        let rules = membership_rules(NetId::LOCAL, "rndis0", LOCAL_NETWORK_TABLE, Permission::System, true);
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].fwmark, Some(Fwmark::network(NetId::LOCAL, true, None)));
        assert_eq!(rules[1].fwmark, None);
        assert_eq!(
            rules[2].args("del").join(" "),
            "rule del priority 20000 iif rndis0 table 97"
        );
    }

    #[test]
    fn uid_rules_respect_no_default_sentinel() {
        let range = UidRange::new(10_000, 10_999).unwrap();
        let rules = uid_rules(NetId(100), 1002, range, 3);
        let priorities: Vec<u32> = rules.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, [15_003, 22_003, 27_003]);
        assert!(rules[0].args("add").join(" ").contains("uidrange 10000-10999"));

        let rules = uid_rules(NetId(100), 1002, range, SUB_PRIORITY_NO_DEFAULT);
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn default_rule_matches_unmarked_sockets_with_permission() {
        let rule = default_network_rule(1002, Permission::Network);
        assert_eq!(
            rule.args("add").join(" "),
            "rule add priority 29000 fwmark 0x40000/0xcffff iif lo table 1002"
        );
    }
}
