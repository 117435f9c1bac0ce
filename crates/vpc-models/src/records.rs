//! Record types for each orchestration resource kind.
//!
//! Fields marked `#[serde(skip)]` are join back-references. They hold keys
//! into the owning [`ModelSets`](crate::ModelSets) rather than pointers, are
//! filled in by the join pass, and are cleared by
//! [`Resource::copy_detached`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::resource::{Resource, ResourceMeta};

/// A tenant virtual network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vpc {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub cidr_block: String,

    #[serde(skip)]
    pub subnets: BTreeSet<String>,
    #[serde(skip)]
    pub route_table: Option<String>,
}

impl Resource for Vpc {
    const KIND: &'static str = "vpcs";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            cidr_block: self.cidr_block.clone(),
            ..Default::default()
        }
    }
}

/// An IP range inside a virtual network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub vpc_id: String,
    pub guest_ip_start: String,
    pub guest_ip_end: String,
    pub guest_ip_mask: u8,
    pub guest_gateway: String,
    pub guest_dns: String,
    pub guest_domain: String,
    pub mtu: Option<u32>,

    #[serde(skip)]
    pub nics: BTreeSet<String>,
    #[serde(skip)]
    pub floating_ips: BTreeSet<String>,
    #[serde(skip)]
    pub group_networks: BTreeSet<String>,
    #[serde(skip)]
    pub loadbalancer_networks: BTreeSet<String>,
}

impl Resource for Subnet {
    const KIND: &'static str = "networks";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        Self {
            nics: BTreeSet::new(),
            floating_ips: BTreeSet::new(),
            group_networks: BTreeSet::new(),
            loadbalancer_networks: BTreeSet::new(),
            ..self.clone()
        }
    }
}

impl Subnet {
    /// Network CIDR derived from the start address and mask,
    /// e.g. `10.1.0.0/24`.
    pub fn cidr(&self) -> Option<String> {
        let start: std::net::Ipv4Addr = self.guest_ip_start.parse().ok()?;
        let mask = u32::from(self.guest_ip_mask.min(32));
        let bits = if mask == 0 { 0 } else { u32::MAX << (32 - mask) };
        let network = std::net::Ipv4Addr::from(u32::from(start) & bits);
        Some(format!("{}/{}", network, mask))
    }
}

/// A virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub host_id: String,
    pub admin_secgrp_id: String,
    pub secgrp_id: String,
    /// Non-empty for instances managed by an external cloud.
    pub external_id: String,

    #[serde(skip)]
    pub nics: BTreeSet<String>,
    #[serde(skip)]
    pub secgroups: BTreeSet<String>,
    #[serde(skip)]
    pub admin_secgroup: Option<String>,
    #[serde(skip)]
    pub host: Option<String>,
    /// Instance groups the instance is a member of.
    #[serde(skip)]
    pub groups: BTreeSet<String>,
}

impl Resource for Instance {
    const KIND: &'static str = "servers";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        Self {
            nics: BTreeSet::new(),
            secgroups: BTreeSet::new(),
            admin_secgroup: None,
            host: None,
            groups: BTreeSet::new(),
            ..self.clone()
        }
    }
}

/// A hypervisor host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Address the host answers on inside every virtual network.
    pub ovn_mapped_ip_addr: String,
}

impl Resource for Host {
    const KIND: &'static str = "hosts";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// A security group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroup {
    #[serde(flatten)]
    pub meta: ResourceMeta,

    #[serde(skip)]
    pub rules: BTreeSet<String>,
}

impl Resource for SecurityGroup {
    const KIND: &'static str = "secgroups";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            rules: BTreeSet::new(),
        }
    }
}

/// One rule of a security group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupRule {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub secgroup_id: String,
    /// `in` or `out`.
    pub direction: String,
    /// `allow` or `deny`.
    pub action: String,
    /// `any`, `tcp`, `udp` or `icmp`.
    pub protocol: String,
    /// Comma-separated ports and ranges, e.g. `22,8000-8080`.
    pub ports: String,
    pub cidr: String,
    pub priority: i64,
}

impl Resource for SecurityGroupRule {
    const KIND: &'static str = "secgrouprules";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// Attachment of an instance interface to a subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceNic {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub guest_id: String,
    pub ifname: String,
    pub network_id: String,
    pub mac_addr: String,
    pub ip_addr: String,
    pub eip_id: String,
    /// Database row number; network addresses name their NIC by it.
    pub row_id: i64,

    #[serde(skip)]
    pub instance: Option<String>,
    #[serde(skip)]
    pub floating_ip: Option<String>,
    /// Keys of the NIC's secondary addresses.
    #[serde(skip)]
    pub sub_ips: BTreeSet<String>,
}

impl InstanceNic {
    /// Composite key `<instance-id>/<ifname>`.
    pub fn nic_key(guest_id: &str, ifname: &str) -> String {
        format!("{}/{}", guest_id, ifname)
    }
}

impl Resource for InstanceNic {
    const KIND: &'static str = "servernetworks";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn key(&self) -> String {
        if self.guest_id.is_empty() || self.ifname.is_empty() {
            return String::new();
        }
        Self::nic_key(&self.guest_id, &self.ifname)
    }

    fn copy_detached(&self) -> Self {
        Self {
            instance: None,
            floating_ip: None,
            sub_ips: BTreeSet::new(),
            ..self.clone()
        }
    }
}

/// Membership of an instance in a regular security group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSecgroup {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub guest_id: String,
    pub secgroup_id: String,
}

impl Resource for InstanceSecgroup {
    const KIND: &'static str = "serversecgroups";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn key(&self) -> String {
        if self.guest_id.is_empty() || self.secgroup_id.is_empty() {
            return String::new();
        }
        format!("{}/{}", self.guest_id, self.secgroup_id)
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// A floating (elastic) IP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloatingIp {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub ip_addr: String,
    pub network_id: String,

    #[serde(skip)]
    pub nic: Option<String>,
    #[serde(skip)]
    pub group_network: Option<String>,
}

impl Resource for FloatingIp {
    const KIND: &'static str = "eips";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    /// Floating IPs are created before an address is allocated.
    fn is_usable(&self) -> bool {
        !self.ip_addr.is_empty() && !self.network_id.is_empty()
    }

    fn copy_detached(&self) -> Self {
        Self {
            nic: None,
            group_network: None,
            ..self.clone()
        }
    }
}

/// A static DNS record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRecord {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    /// Record type, e.g. `A`.
    pub dns_type: String,
    pub dns_value: String,
    pub enabled: bool,
}

impl Resource for DnsRecord {
    const KIND: &'static str = "dnsrecords";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// Next-hop selector of a [`Route`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextHopType {
    /// `next_hop_id` is an IPv4 address.
    Ip,
    /// `next_hop_id` is an instance ID.
    Instance,
    /// Any type the agent does not handle.
    #[default]
    #[serde(other)]
    Unsupported,
}

/// One route of a route table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Route {
    pub cidr: String,
    pub next_hop_type: NextHopType,
    pub next_hop_id: String,
}

/// The route table of a virtual network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTable {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub vpc_id: String,
    pub routes: Vec<Route>,
}

impl Resource for RouteTable {
    const KIND: &'static str = "route_tables";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// Parent type of a [`NetworkAddress`] attached to an instance NIC.
pub const NETWORK_ADDRESS_PARENT_NIC: &str = "guestnetwork";

/// Type of a secondary [`NetworkAddress`].
pub const NETWORK_ADDRESS_SUB_IP: &str = "sub_ip";

/// An extra address allocated on a subnet, e.g. a NIC's secondary IP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAddress {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub parent_type: String,
    /// Row number of the parent, as a string.
    pub parent_id: String,
    #[serde(rename = "type")]
    pub address_type: String,
    pub network_id: String,
    pub ip_addr: String,
}

impl NetworkAddress {
    /// True for a secondary address of an instance NIC.
    pub fn is_nic_sub_ip(&self) -> bool {
        self.parent_type == NETWORK_ADDRESS_PARENT_NIC && self.address_type == NETWORK_ADDRESS_SUB_IP
    }
}

impl Resource for NetworkAddress {
    const KIND: &'static str = "networkaddresses";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn is_usable(&self) -> bool {
        !self.ip_addr.is_empty()
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// Membership of an instance in an instance group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupGuest {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub group_id: String,
    pub guest_id: String,
}

impl Resource for GroupGuest {
    const KIND: &'static str = "groupguests";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn key(&self) -> String {
        if self.group_id.is_empty() || self.guest_id.is_empty() {
            return String::new();
        }
        format!("{}/{}", self.group_id, self.guest_id)
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

/// A virtual IP shared by the members of an instance group on one subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupNetwork {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub group_id: String,
    pub network_id: String,
    pub ip_addr: String,
    pub eip_id: String,

    #[serde(skip)]
    pub floating_ip: Option<String>,
}

impl Resource for GroupNetwork {
    const KIND: &'static str = "groupnetworks";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    /// `<network-id>/<vip>`.
    fn key(&self) -> String {
        if self.network_id.is_empty() || self.ip_addr.is_empty() {
            return String::new();
        }
        format!("{}/{}", self.network_id, self.ip_addr)
    }

    fn copy_detached(&self) -> Self {
        Self {
            floating_ip: None,
            ..self.clone()
        }
    }
}

/// Address of a load balancer on a subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadbalancerNetwork {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub loadbalancer_id: String,
    pub network_id: String,
    pub ip_addr: String,
    pub mac_addr: String,

    #[serde(skip)]
    pub listeners: BTreeSet<String>,
}

impl Resource for LoadbalancerNetwork {
    const KIND: &'static str = "loadbalancernetworks";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    /// `<network-id>/<loadbalancer-id>`.
    fn key(&self) -> String {
        if self.network_id.is_empty() || self.loadbalancer_id.is_empty() {
            return String::new();
        }
        format!("{}/{}", self.network_id, self.loadbalancer_id)
    }

    fn is_usable(&self) -> bool {
        !self.ip_addr.is_empty()
    }

    fn copy_detached(&self) -> Self {
        Self {
            listeners: BTreeSet::new(),
            ..self.clone()
        }
    }
}

/// Value of [`LoadbalancerListener::acl_status`] enabling its policy.
pub const LISTENER_ACL_ON: &str = "on";

/// A load balancer listener.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadbalancerListener {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub loadbalancer_id: String,
    /// `tcp`, `udp`, `http` or `https`.
    pub listener_type: String,
    pub listener_port: u16,
    /// `on` or `off`.
    pub acl_status: String,
    /// `white` or `black`.
    pub acl_type: String,
    pub acl_id: String,

    #[serde(skip)]
    pub acl: Option<String>,
}

impl LoadbalancerListener {
    pub fn acl_enabled(&self) -> bool {
        self.acl_status == LISTENER_ACL_ON
    }
}

impl Resource for LoadbalancerListener {
    const KIND: &'static str = "loadbalancerlisteners";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        Self {
            acl: None,
            ..self.clone()
        }
    }
}

/// One entry of a [`LoadbalancerAcl`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadbalancerAclEntry {
    pub cidr: String,
    pub comment: String,
}

/// A named list of source CIDRs referenced by listeners.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadbalancerAcl {
    #[serde(flatten)]
    pub meta: ResourceMeta,
    pub acl_entries: Vec<LoadbalancerAclEntry>,
}

impl LoadbalancerAcl {
    /// Non-empty CIDRs in list order.
    pub fn cidrs(&self) -> Vec<String> {
        self.acl_entries
            .iter()
            .map(|e| e.cidr.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Resource for LoadbalancerAcl {
    const KIND: &'static str = "loadbalanceracls";

    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn copy_detached(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_subnet_cidr() {
        let subnet = Subnet {
            guest_ip_start: "10.1.2.10".to_string(),
            guest_ip_mask: 24,
            ..Default::default()
        };
        assert_eq!(subnet.cidr().as_deref(), Some("10.1.2.0/24"));

        let bad = Subnet {
            guest_ip_start: "nope".to_string(),
            ..Default::default()
        };
        assert_eq!(bad.cidr(), None);
    }

    #[test]
    fn test_copy_detached_clears_joins() {
        let mut vpc = Vpc {
            cidr_block: "10.0.0.0/8".to_string(),
            ..Default::default()
        };
        vpc.subnets.insert("n1".to_string());
        vpc.route_table = Some("rt1".to_string());
        let copy = vpc.copy_detached();
        assert!(copy.subnets.is_empty());
        assert_eq!(copy.route_table, None);
        assert_eq!(copy.cidr_block, vpc.cidr_block);
    }

    #[test]
    fn test_nic_key() {
        let nic: InstanceNic =
            serde_json::from_value(json!({"guest_id": "g1", "ifname": "eth0"})).unwrap();
        assert_eq!(nic.key(), "g1/eth0");
        assert_eq!(InstanceNic::default().key(), "");
    }

    #[test]
    fn test_network_address_kind() {
        let addr: NetworkAddress = serde_json::from_value(json!({
            "id": "a1",
            "parent_type": "guestnetwork",
            "parent_id": "7",
            "type": "sub_ip",
            "network_id": "n1",
            "ip_addr": "10.1.0.9"
        }))
        .unwrap();
        assert!(addr.is_nic_sub_ip());
        let other = NetworkAddress {
            address_type: "vip".to_string(),
            ..addr
        };
        assert!(!other.is_nic_sub_ip());
    }

    #[test]
    fn test_loadbalancer_acl_cidrs() {
        let acl: LoadbalancerAcl = serde_json::from_value(json!({
            "id": "acl1",
            "acl_entries": [
                {"cidr": "1.2.3.0/24", "comment": "office"},
                {"cidr": " "},
                {"cidr": "5.6.7.8"}
            ]
        }))
        .unwrap();
        assert_eq!(acl.cidrs(), vec!["1.2.3.0/24", "5.6.7.8"]);
    }

    #[test]
    fn test_composite_keys() {
        let gn: GroupNetwork =
            serde_json::from_value(json!({"group_id": "grp1", "network_id": "n1", "ip_addr": "10.1.0.50"}))
                .unwrap();
        assert_eq!(gn.key(), "n1/10.1.0.50");
        let lbn: LoadbalancerNetwork =
            serde_json::from_value(json!({"loadbalancer_id": "lb1", "network_id": "n1"})).unwrap();
        assert_eq!(lbn.key(), "n1/lb1");
        assert!(!lbn.is_usable());
        assert_eq!(GroupGuest::default().key(), "");
    }

    #[test]
    fn test_floating_ip_usable() {
        let eip: FloatingIp = serde_json::from_value(json!({"id": "e1"})).unwrap();
        assert!(!eip.is_usable());
    }

    #[test]
    fn test_route_next_hop_types() {
        let table: RouteTable = serde_json::from_value(json!({
            "id": "rt1",
            "vpc_id": "v1",
            "routes": [
                {"cidr": "0.0.0.0/0", "next_hop_type": "ip", "next_hop_id": "10.0.0.1"},
                {"cidr": "10.9.0.0/16", "next_hop_type": "instance", "next_hop_id": "g1"},
                {"cidr": "10.8.0.0/16", "next_hop_type": "peering", "next_hop_id": "p1"}
            ]
        }))
        .unwrap();
        let kinds: Vec<_> = table.routes.iter().map(|r| r.next_hop_type.clone()).collect();
        assert_eq!(
            kinds,
            vec![NextHopType::Ip, NextHopType::Instance, NextHopType::Unsupported]
        );
    }
}
