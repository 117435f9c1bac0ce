//! Northbound row names, external id keys and fixed addressing.

/// Version stamp of a claimed row.
pub const EXTERNAL_ID_VERSION: &str = "oc-version";

/// Owner of a row that lives in another row's reference column,
/// formatted by [`oc_ref`].
pub const EXTERNAL_ID_REF: &str = "oc-ref";

/// Subnet a DHCP_Options row was claimed for.
pub const EXTERNAL_ID_SUBNET: &str = "oc-subnet-id";

/// Virtual network a DNS row was claimed for.
pub const EXTERNAL_ID_VPC: &str = "oc-vpc-id";

/// Router address on every host switch.
pub const MAPPED_GATEWAY_CIDR: &str = "100.64.0.1/17";

/// Metadata service address answered by each subnet's localport.
pub const METADATA_IP: &str = "169.254.169.254";

/// Interface MTU handed out by DHCP when the subnet sets none.
pub const DEFAULT_MTU: u32 = 1442;

/// DHCP lease time in seconds.
pub const DHCP_LEASE_TIME: u32 = 86400;

/// Added to admin security group rule priorities.
pub const ADMIN_SECGROUP_PRIORITY_OFFSET: i64 = 1000;

pub fn vpc_router(vpc_id: &str) -> String {
    format!("vpc-r/{}", vpc_id)
}

/// Switch joining the router to the hosts' mapped addresses.
pub fn vpc_host_switch(vpc_id: &str) -> String {
    format!("vpc-h/{}", vpc_id)
}

/// Router side of the router/host-switch link.
pub fn vpc_router_host_port(vpc_id: &str) -> String {
    format!("vpc-rh/{}", vpc_id)
}

/// Switch side of the router/host-switch link.
pub fn vpc_host_router_port(vpc_id: &str) -> String {
    format!("vpc-hr/{}", vpc_id)
}

pub fn vpc_host_port(vpc_id: &str, host_id: &str) -> String {
    format!("vpc-h/{}/{}", vpc_id, host_id)
}

pub fn subnet_switch(subnet_id: &str) -> String {
    format!("subnet/{}", subnet_id)
}

/// Router side of the router/subnet link.
pub fn subnet_router_port(subnet_id: &str) -> String {
    format!("subnet-rn/{}", subnet_id)
}

/// Switch side of the router/subnet link.
pub fn subnet_switch_router_port(subnet_id: &str) -> String {
    format!("subnet-nr/{}", subnet_id)
}

pub fn subnet_metadata_port(subnet_id: &str) -> String {
    format!("subnet-md/{}", subnet_id)
}

pub fn nic_port(guest_id: &str, ifname: &str) -> String {
    format!("iface/{}/{}", guest_id, ifname)
}

/// Port the load balancer agent plugs its namespace into.
pub fn loadbalancer_port(loadbalancer_id: &str) -> String {
    format!("iface/lb/{}", loadbalancer_id)
}

/// `<table>/<name>` owner reference.
pub fn oc_ref(table: &str, name: &str) -> String {
    format!("{}/{}", table, name)
}

/// Splits an owner reference into table and row name.
pub fn parse_oc_ref(value: &str) -> Option<(&str, &str)> {
    value
        .split_once('/')
        .filter(|(table, name)| !table.is_empty() && !name.is_empty())
}

/// Locally administered unicast MAC derived from `seed` (FNV-1a).
pub fn hash_mac(seed: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in seed.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let b = hash.to_be_bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        (b[2] & 0xfc) | 0x02,
        b[3],
        b[4],
        b[5],
        b[6],
        b[7]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_mac() {
        let mac = hash_mac("host-1");
        assert_eq!(mac, hash_mac("host-1"));
        assert_ne!(mac, hash_mac("host-2"));
        assert_eq!(mac.len(), 17);
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x03, 0x02, "locally administered unicast");
    }

    #[test]
    fn test_oc_ref() {
        let value = oc_ref("Logical_Router", &vpc_router("v1"));
        assert_eq!(value, "Logical_Router/vpc-r/v1");
        assert_eq!(parse_oc_ref(&value), Some(("Logical_Router", "vpc-r/v1")));
        assert_eq!(parse_oc_ref("nope"), None);
        assert_eq!(parse_oc_ref("/x"), None);
    }
}
