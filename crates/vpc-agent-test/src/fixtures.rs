//! Record builders and a sample topology.
//!
//! Every builder takes a `version`: it becomes both `update_version` and
//! the `updated_at` offset in seconds from [`BASE_TIME`], so bumping it
//! produces a newer record.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use vpc_models::{
    DnsRecord, FloatingIp, GroupGuest, GroupNetwork, Host, Instance, InstanceNic,
    InstanceSecgroup, LoadbalancerAcl, LoadbalancerListener, LoadbalancerNetwork, ModelSets,
    NetworkAddress, Resource, RouteTable, SecurityGroup, SecurityGroupRule, Subnet, Vpc,
};

/// `updated_at` of version 0, as Unix seconds.
pub const BASE_TIME: i64 = 1_700_000_000;

/// Timestamp `secs` seconds after [`BASE_TIME`].
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(BASE_TIME, 0).unwrap_or_default() + Duration::seconds(secs)
}

fn meta(id: &str, version: i64) -> Value {
    json!({
        "id": id,
        "name": id,
        "updated_at": at(version).to_rfc3339(),
        "update_version": version,
        "deleted": false,
        "pending_deleted": false,
    })
}

fn with_meta(id: &str, version: i64, fields: Value) -> Value {
    let mut record = meta(id, version);
    if let (Some(record), Value::Object(fields)) = (record.as_object_mut(), fields) {
        record.extend(fields);
    }
    record
}

/// Marks `record` deleted at `version`.
pub fn deleted(record: Value, version: i64) -> Value {
    let mut record = touched(record, version);
    record["deleted"] = json!(true);
    record
}

/// Re-stamps `record` with a newer `version`.
pub fn touched(mut record: Value, version: i64) -> Value {
    record["updated_at"] = json!(at(version).to_rfc3339());
    record["update_version"] = json!(version);
    record
}

pub fn vpc(id: &str, version: i64) -> Value {
    with_meta(id, version, json!({ "cidr_block": "10.0.0.0/8" }))
}

/// Subnet `<prefix>.2 - <prefix>.254/24` with gateway `<prefix>.1`,
/// e.g. `subnet("n1", "v1", "10.1.0", 1)`.
pub fn subnet(id: &str, vpc_id: &str, prefix: &str, version: i64) -> Value {
    with_meta(
        id,
        version,
        json!({
            "vpc_id": vpc_id,
            "guest_ip_start": format!("{}.2", prefix),
            "guest_ip_end": format!("{}.254", prefix),
            "guest_ip_mask": 24,
            "guest_gateway": format!("{}.1", prefix),
            "guest_dns": "8.8.8.8",
            "guest_domain": "cloud.local",
        }),
    )
}

pub fn host(id: &str, mapped_ip: &str, version: i64) -> Value {
    with_meta(id, version, json!({ "ovn_mapped_ip_addr": mapped_ip }))
}

pub fn instance(
    id: &str,
    host_id: &str,
    secgrp_id: &str,
    admin_secgrp_id: &str,
    version: i64,
) -> Value {
    with_meta(
        id,
        version,
        json!({
            "host_id": host_id,
            "secgrp_id": secgrp_id,
            "admin_secgrp_id": admin_secgrp_id,
        }),
    )
}

pub fn secgroup(id: &str, version: i64) -> Value {
    with_meta(id, version, json!({}))
}

#[allow(clippy::too_many_arguments)]
pub fn secgroup_rule(
    id: &str,
    secgroup_id: &str,
    direction: &str,
    action: &str,
    protocol: &str,
    ports: &str,
    priority: i64,
    version: i64,
) -> Value {
    with_meta(
        id,
        version,
        json!({
            "secgroup_id": secgroup_id,
            "direction": direction,
            "action": action,
            "protocol": protocol,
            "ports": ports,
            "cidr": "",
            "priority": priority,
        }),
    )
}

pub fn instance_secgroup(id: &str, guest_id: &str, secgroup_id: &str, version: i64) -> Value {
    with_meta(
        id,
        version,
        json!({ "guest_id": guest_id, "secgroup_id": secgroup_id }),
    )
}

pub fn nic(
    id: &str,
    guest_id: &str,
    network_id: &str,
    mac: &str,
    ip: &str,
    eip_id: &str,
    version: i64,
) -> Value {
    with_meta(
        id,
        version,
        json!({
            "guest_id": guest_id,
            "ifname": "eth0",
            "network_id": network_id,
            "mac_addr": mac,
            "ip_addr": ip,
            "eip_id": eip_id,
        }),
    )
}

/// Sets the database row number of a [`nic`] record.
pub fn with_row_id(mut record: Value, row_id: i64) -> Value {
    record["row_id"] = json!(row_id);
    record
}

/// Secondary address of the NIC with row number `nic_row_id`.
pub fn sub_ip(id: &str, nic_row_id: i64, network_id: &str, ip: &str, version: i64) -> Value {
    with_meta(
        id,
        version,
        json!({
            "parent_type": "guestnetwork",
            "parent_id": nic_row_id.to_string(),
            "type": "sub_ip",
            "network_id": network_id,
            "ip_addr": ip,
        }),
    )
}

pub fn group_guest(id: &str, group_id: &str, guest_id: &str, version: i64) -> Value {
    with_meta(id, version, json!({ "group_id": group_id, "guest_id": guest_id }))
}

pub fn group_network(
    id: &str,
    group_id: &str,
    network_id: &str,
    ip: &str,
    eip_id: &str,
    version: i64,
) -> Value {
    with_meta(
        id,
        version,
        json!({
            "group_id": group_id,
            "network_id": network_id,
            "ip_addr": ip,
            "eip_id": eip_id,
        }),
    )
}

pub fn loadbalancer_network(
    id: &str,
    loadbalancer_id: &str,
    network_id: &str,
    ip: &str,
    version: i64,
) -> Value {
    with_meta(
        id,
        version,
        json!({
            "loadbalancer_id": loadbalancer_id,
            "network_id": network_id,
            "ip_addr": ip,
            "mac_addr": "",
        }),
    )
}

/// Listener with its ACL turned on when `acl_id` is non-empty.
pub fn loadbalancer_listener(
    id: &str,
    loadbalancer_id: &str,
    listener_type: &str,
    port: u16,
    acl_type: &str,
    acl_id: &str,
    version: i64,
) -> Value {
    let acl_status = if acl_id.is_empty() { "off" } else { "on" };
    with_meta(
        id,
        version,
        json!({
            "loadbalancer_id": loadbalancer_id,
            "listener_type": listener_type,
            "listener_port": port,
            "acl_status": acl_status,
            "acl_type": acl_type,
            "acl_id": acl_id,
        }),
    )
}

pub fn loadbalancer_acl(id: &str, cidrs: &[&str], version: i64) -> Value {
    let entries: Vec<Value> = cidrs.iter().map(|c| json!({ "cidr": c, "comment": "" })).collect();
    with_meta(id, version, json!({ "acl_entries": entries }))
}

pub fn floating_ip(id: &str, ip: &str, network_id: &str, version: i64) -> Value {
    with_meta(id, version, json!({ "ip_addr": ip, "network_id": network_id }))
}

pub fn dns_record(id: &str, name: &str, value: &str, version: i64) -> Value {
    let mut record = with_meta(
        id,
        version,
        json!({ "dns_type": "A", "dns_value": value, "enabled": true }),
    );
    record["name"] = json!(name);
    record
}

/// Route table; `routes` holds `(cidr, next_hop_type, next_hop_id)`.
pub fn route_table(id: &str, vpc_id: &str, routes: &[(&str, &str, &str)], version: i64) -> Value {
    let routes: Vec<Value> = routes
        .iter()
        .map(|(cidr, kind, next_hop)| {
            json!({ "cidr": cidr, "next_hop_type": kind, "next_hop_id": next_hop })
        })
        .collect();
    with_meta(id, version, json!({ "vpc_id": vpc_id, "routes": routes }))
}

/// One virtual network with two subnets, one host, one instance with a
/// floating IP, two security groups, a DNS record and a route table.
pub fn sample_topology() -> Vec<(&'static str, Value)> {
    vec![
        (Vpc::KIND, vpc("v1", 1)),
        (Subnet::KIND, subnet("n1", "v1", "10.1.0", 1)),
        (Subnet::KIND, subnet("n2", "v1", "10.2.0", 1)),
        (Host::KIND, host("h1", "100.64.0.11", 1)),
        (SecurityGroup::KIND, secgroup("sg1", 1)),
        (SecurityGroup::KIND, secgroup("sga", 1)),
        (
            SecurityGroupRule::KIND,
            secgroup_rule("r1", "sg1", "in", "allow", "tcp", "22,8000-8080", 10, 1),
        ),
        (
            SecurityGroupRule::KIND,
            secgroup_rule("r2", "sga", "in", "deny", "any", "", 1, 1),
        ),
        (
            SecurityGroupRule::KIND,
            secgroup_rule("r3", "sg1", "out", "allow", "any", "", 1, 1),
        ),
        (Instance::KIND, instance("g1", "h1", "sg1", "sga", 1)),
        (
            InstanceNic::KIND,
            nic("if1", "g1", "n1", "00:22:00:00:00:01", "10.1.0.5", "e1", 1),
        ),
        (FloatingIp::KIND, floating_ip("e1", "10.2.0.100", "n2", 1)),
        (DnsRecord::KIND, dns_record("d1", "www.cloud.local.", "10.1.0.5", 1)),
        (
            RouteTable::KIND,
            route_table(
                "rt1",
                "v1",
                &[
                    ("192.168.0.0/16", "ip", "10.1.0.254"),
                    ("172.16.0.0/12", "instance", "g1"),
                ],
                1,
            ),
        ),
    ]
}

/// Decodes `records` into a joined [`ModelSets`].
///
/// # Panics
///
/// Panics on an undecodable record or an incorrect join.
pub fn build_sets(records: &[(&'static str, Value)]) -> ModelSets {
    let mut sets = ModelSets::new();
    for (kind, record) in records {
        let result = match *kind {
            Vpc::KIND => sets.vpcs.add_record(record),
            Subnet::KIND => sets.subnets.add_record(record),
            Host::KIND => sets.hosts.add_record(record),
            Instance::KIND => sets.instances.add_record(record),
            SecurityGroup::KIND => sets.secgroups.add_record(record),
            SecurityGroupRule::KIND => sets.secgroup_rules.add_record(record),
            InstanceNic::KIND => sets.nics.add_record(record),
            InstanceSecgroup::KIND => sets.instance_secgroups.add_record(record),
            FloatingIp::KIND => sets.floating_ips.add_record(record),
            DnsRecord::KIND => sets.dns_records.add_record(record),
            RouteTable::KIND => sets.route_tables.add_record(record),
            NetworkAddress::KIND => sets.network_addresses.add_record(record),
            GroupGuest::KIND => sets.group_guests.add_record(record),
            GroupNetwork::KIND => sets.group_networks.add_record(record),
            LoadbalancerNetwork::KIND => sets.loadbalancer_networks.add_record(record),
            LoadbalancerListener::KIND => sets.loadbalancer_listeners.add_record(record),
            LoadbalancerAcl::KIND => sets.loadbalancer_acls.add_record(record),
            other => panic!("unknown resource kind {other}"),
        };
        if let Err(e) = result {
            panic!("fixture record of {kind} does not decode: {e}");
        }
    }
    let mut joined = sets.copy_detached();
    assert!(joined.join(None), "fixture topology does not join");
    joined
}
