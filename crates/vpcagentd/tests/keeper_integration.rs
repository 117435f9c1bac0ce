//! Keeper integration tests
//!
//! Runs full reconciliation passes against the in-memory northbound
//! database and checks the resulting tables and transaction log.

use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::Arc;
use vpc_agent_test::{build_sets, fixtures, sample_topology, MemoryNorthbound};
use vpc_models::{
    FloatingIp, GroupGuest, GroupNetwork, InstanceNic, LoadbalancerAcl, LoadbalancerListener,
    LoadbalancerNetwork, ModelSets, NetworkAddress, Resource, RouteTable,
};
use vpc_ovnutil::{
    Acl, DhcpOptions, Dns, LogicalRouter, LogicalRouterPort, LogicalRouterStaticRoute,
    LogicalSwitch, LogicalSwitchPort, Nat, NbDatabase, Row, Transaction,
};
use vpcagentd::keeper::names::{
    hash_mac, loadbalancer_port, oc_ref, EXTERNAL_ID_REF, EXTERNAL_ID_SUBNET, EXTERNAL_ID_VERSION,
};
use vpcagentd::reconcile;

fn memory_db() -> (MemoryNorthbound, Arc<dyn NbDatabase>) {
    let nb = MemoryNorthbound::new();
    let db: Arc<dyn NbDatabase> = Arc::new(nb.clone());
    (nb, db)
}

fn without(records: Vec<(&'static str, Value)>, ids: &[&str]) -> Vec<(&'static str, Value)> {
    records
        .into_iter()
        .filter(|(_, r)| !ids.iter().any(|id| r["id"] == *id))
        .collect()
}

fn replaced(
    mut records: Vec<(&'static str, Value)>,
    id: &str,
    f: impl FnOnce(Value) -> Value,
) -> Vec<(&'static str, Value)> {
    let i = records
        .iter()
        .position(|(_, r)| r["id"] == id)
        .expect("record in topology");
    records[i].1 = f(records[i].1.clone());
    records
}

fn sorted_routes(nb: &MemoryNorthbound) -> Vec<(String, String)> {
    let mut routes: Vec<(String, String)> = nb
        .rows::<LogicalRouterStaticRoute>()
        .into_iter()
        .map(|r| (r.ip_prefix, r.nexthop))
        .collect();
    routes.sort();
    routes
}

fn vpc_stamp(sets: &ModelSets) -> String {
    sets.vpcs
        .get("v1")
        .expect("v1 in topology")
        .meta()
        .version_stamp()
}

/// First pass over an empty database
///
/// Scenario:
/// 1. Reconcile the sample topology into an empty database
/// 2. Verify every scope produced its rows and links
#[tokio::test]
async fn test_initial_pass_builds_topology() {
    let (nb, db) = memory_db();
    let sets = build_sets(&sample_topology());

    let stats = reconcile(db, &sets).await.expect("reconcile failed");
    assert_eq!(stats.created, 24);
    assert_eq!(stats.swept, 0);
    // vpc, two subnets, dns, host port, nic, route table
    assert_eq!(stats.transactions, 7);
    assert_eq!(nb.snapshot().len(), 24);

    let lr = nb.get_by_name::<LogicalRouter>("vpc-r/v1").expect("router");
    assert_eq!(lr.ports.len(), 3);
    assert_eq!(lr.static_routes.len(), 3);
    assert_eq!(lr.nat.len(), 1);
    assert_eq!(lr.external_id(EXTERNAL_ID_VERSION), Some(vpc_stamp(&sets).as_str()));

    let host_switch = nb.get_by_name::<LogicalSwitch>("vpc-h/v1").expect("host switch");
    assert_eq!(host_switch.ports.len(), 2);
    let host_port = nb
        .get_by_name::<LogicalSwitchPort>("vpc-h/v1/h1")
        .expect("host port");
    assert_eq!(
        host_port.addresses,
        vec![format!("{} 100.64.0.11", hash_mac("h1"))]
    );

    let n1 = nb.get_by_name::<LogicalSwitch>("subnet/n1").expect("subnet switch");
    assert_eq!(n1.ports.len(), 3);
    assert_eq!(n1.acls.len(), 3);
    assert_eq!(n1.dns_records.len(), 1);
    let n2 = nb.get_by_name::<LogicalSwitch>("subnet/n2").expect("subnet switch");
    assert_eq!(n2.acls.len(), 0);
    assert_eq!(n2.dns_records, n1.dns_records);

    let lrp = nb
        .get_by_name::<LogicalRouterPort>("subnet-rn/n1")
        .expect("subnet router port");
    assert_eq!(lrp.networks, vec!["10.1.0.1/24".to_string()]);
    assert_eq!(lrp.mac, hash_mac("subnet-rn/n1"));
}

/// NIC port, DHCP, ACLs, floating IP and routes
#[tokio::test]
async fn test_nic_rows() {
    let (nb, db) = memory_db();
    let sets = build_sets(&sample_topology());
    reconcile(db, &sets).await.expect("reconcile failed");

    let port = nb
        .get_by_name::<LogicalSwitchPort>("iface/g1/eth0")
        .expect("nic port");
    assert_eq!(port.addresses, vec!["00:22:00:00:00:01 10.1.0.5".to_string()]);
    assert_eq!(
        port.port_security,
        vec!["00:22:00:00:00:01 10.1.0.5/24".to_string()]
    );

    let dhcp = nb
        .rows::<DhcpOptions>()
        .into_iter()
        .find(|d| d.external_id(EXTERNAL_ID_SUBNET) == Some("n1"))
        .expect("dhcp options of n1");
    assert_eq!(dhcp.cidr, "10.1.0.0/24");
    assert_eq!(port.dhcpv4_options.as_ref(), Some(&dhcp.uuid));

    let mut acls: Vec<(String, i64, String)> = nb
        .rows::<Acl>()
        .into_iter()
        .map(|a| (a.direction, a.priority, a.action))
        .collect();
    acls.sort();
    assert_eq!(
        acls,
        vec![
            ("from-lport".to_string(), 1, "allow-related".to_string()),
            ("to-lport".to_string(), 10, "allow-related".to_string()),
            ("to-lport".to_string(), 1001, "drop".to_string()),
        ]
    );

    let nats = nb.rows::<Nat>();
    assert_eq!(nats.len(), 1);
    assert_eq!(nats[0].kind, "dnat_and_snat");
    assert_eq!(nats[0].external_ip, "10.2.0.100");
    assert_eq!(nats[0].logical_ip, "10.1.0.5");
    assert_eq!(nats[0].logical_port.as_deref(), Some("iface/g1/eth0"));

    let mut routes: Vec<(String, String)> = nb
        .rows::<LogicalRouterStaticRoute>()
        .into_iter()
        .map(|r| (r.ip_prefix, r.nexthop))
        .collect();
    routes.sort();
    assert_eq!(
        routes,
        vec![
            ("10.1.0.5/32".to_string(), "100.64.0.11".to_string()),
            ("172.16.0.0/12".to_string(), "10.1.0.5".to_string()),
            ("192.168.0.0/16".to_string(), "10.1.0.254".to_string()),
        ]
    );

    let dns = nb.rows::<Dns>();
    assert_eq!(dns.len(), 1);
    assert_eq!(dns[0].records["www.cloud.local"], "10.1.0.5");
}

/// A second pass over an unchanged snapshot must not write anything
#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (nb, db) = memory_db();
    let sets = build_sets(&sample_topology());
    reconcile(db.clone(), &sets).await.expect("first pass failed");
    let before = nb.snapshot();
    nb.clear_log();

    let stats = reconcile(db, &sets).await.expect("second pass failed");
    assert_eq!(stats.created, 0);
    assert_eq!(stats.stamped, 0);
    assert_eq!(stats.swept, 0);
    assert_eq!(stats.transactions, 0);
    assert_eq!(nb.transaction_count(), 0);
    assert_eq!(nb.snapshot(), before);
}

/// Removed records are swept; retained rows keep their stamps
///
/// Scenario:
/// 1. Reconcile the full topology
/// 2. Drop the route table, the DNS record and one security group rule
/// 3. Verify exactly their rows are gone and nothing else changed
#[tokio::test]
async fn test_removed_records_are_swept() {
    let (nb, db) = memory_db();
    let full = build_sets(&sample_topology());
    reconcile(db.clone(), &full).await.expect("first pass failed");
    nb.clear_log();

    let reduced = build_sets(&without(sample_topology(), &["rt1", "d1", "r3"]));
    let stats = reconcile(db, &reduced).await.expect("second pass failed");
    assert_eq!(stats.swept, 4);
    assert_eq!(stats.created, 0);
    assert_eq!(stats.transactions, 1);
    assert_eq!(nb.snapshot().len(), 20);

    let lr = nb.get_by_name::<LogicalRouter>("vpc-r/v1").expect("router");
    assert_eq!(lr.static_routes.len(), 1);
    assert_eq!(lr.external_id(EXTERNAL_ID_VERSION), Some(vpc_stamp(&reduced).as_str()));

    let n1 = nb.get_by_name::<LogicalSwitch>("subnet/n1").expect("subnet switch");
    assert_eq!(n1.acls.len(), 2);
    assert!(n1.dns_records.is_empty());
    assert!(nb.rows::<Dns>().is_empty());
    assert!(nb.rows::<Acl>().iter().all(|a| a.direction == "to-lport"));

    let nic = reduced.nics.get("g1/eth0").expect("nic");
    let port = nb
        .get_by_name::<LogicalSwitchPort>("iface/g1/eth0")
        .expect("nic port");
    assert_eq!(
        port.external_id(EXTERNAL_ID_VERSION),
        Some(nic.meta().version_stamp().as_str())
    );
}

/// A newer record only rewrites stamps
#[tokio::test]
async fn test_updated_record_is_restamped() {
    let (nb, db) = memory_db();
    reconcile(db.clone(), &build_sets(&sample_topology()))
        .await
        .expect("first pass failed");
    nb.clear_log();

    let mut records = sample_topology();
    records[0].1 = fixtures::touched(records[0].1.clone(), 2);
    let sets = build_sets(&records);
    let stats = reconcile(db, &sets).await.expect("second pass failed");

    // Router, host switch, their port pair and the DNS row
    assert_eq!(stats.stamped, 5);
    assert_eq!(stats.created, 0);
    assert_eq!(stats.swept, 0);
    assert_eq!(nb.command_count("set"), 5);
    assert_eq!(nb.command_count("create"), 0);

    let stamp = vpc_stamp(&sets);
    let ls = nb.get_by_name::<LogicalSwitch>("vpc-h/v1").expect("host switch");
    assert_eq!(ls.external_id(EXTERNAL_ID_VERSION), Some(stamp.as_str()));
    assert_eq!(nb.rows::<Dns>()[0].external_id(EXTERNAL_ID_VERSION), Some(stamp.as_str()));
}

/// A row whose columns drifted is replaced under the same name
#[tokio::test]
async fn test_drifted_row_is_replaced() {
    let (nb, db) = memory_db();
    let sets = build_sets(&sample_topology());
    reconcile(db.clone(), &sets).await.expect("first pass failed");
    let old = nb
        .get_by_name::<LogicalRouterPort>("vpc-rh/v1")
        .expect("router host port");

    let mut drift = Transaction::new();
    drift.set(
        LogicalRouterPort::TABLE,
        "vpc-rh/v1",
        vec![r#"mac="02:00:00:00:00:99""#.to_string()],
    );
    db.transact(&drift).await.expect("drift");
    nb.clear_log();

    let stats = reconcile(db.clone(), &sets).await.expect("second pass failed");
    assert_eq!(stats.replaced, 1);
    assert_eq!(stats.created, 1);
    assert_eq!(nb.command_count("lrp-del"), 1);

    let new = nb
        .get_by_name::<LogicalRouterPort>("vpc-rh/v1")
        .expect("router host port");
    assert_ne!(new.uuid, old.uuid);
    assert_eq!(new.mac, hash_mac("vpc-rh/v1"));
    let lr = nb.get_by_name::<LogicalRouter>("vpc-r/v1").expect("router");
    assert!(lr.ports.contains(&new.uuid));
    assert!(!lr.ports.contains(&old.uuid));

    nb.clear_log();
    reconcile(db, &sets).await.expect("third pass failed");
    assert_eq!(nb.transaction_count(), 0);
}

/// Rows the agent never wrote are swept too
#[tokio::test]
async fn test_foreign_rows_are_swept() {
    let (nb, db) = memory_db();
    nb.insert(LogicalRouter {
        name: "leftover".to_string(),
        ..Default::default()
    });
    nb.insert(DhcpOptions {
        cidr: "192.0.2.0/24".to_string(),
        ..Default::default()
    });

    let stats = reconcile(db, &build_sets(&sample_topology()))
        .await
        .expect("reconcile failed");
    assert_eq!(stats.swept, 2);
    assert!(nb.get_by_name::<LogicalRouter>("leftover").is_none());
    assert_eq!(nb.rows::<DhcpOptions>().len(), 2);
}

/// A failed transaction aborts the pass; the next pass converges
#[tokio::test]
async fn test_failed_transaction_aborts_pass() {
    let (nb, db) = memory_db();
    let sets = build_sets(&sample_topology());

    nb.fail_next_transaction("ovsdb-server: connection refused");
    let err = reconcile(db.clone(), &sets).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(nb.snapshot().is_empty());

    let stats = reconcile(db, &sets).await.expect("retry failed");
    assert_eq!(stats.created, 24);
}

/// A route table naming an unsupported next hop contributes no routes
#[tokio::test]
async fn test_unsupported_route_table_yields_no_routes() {
    let (nb, db) = memory_db();
    let mut records = without(sample_topology(), &["rt1"]);
    records.push((
        RouteTable::KIND,
        fixtures::route_table(
            "rt1",
            "v1",
            &[
                ("192.168.0.0/16", "ip", "10.1.0.254"),
                ("0.0.0.0/0", "nat_gateway", "ngw1"),
            ],
            1,
        ),
    ));
    reconcile(db, &build_sets(&records))
        .await
        .expect("reconcile failed");

    let prefixes: Vec<String> = nb
        .rows::<LogicalRouterStaticRoute>()
        .into_iter()
        .map(|r| r.ip_prefix)
        .collect();
    assert_eq!(prefixes, vec!["10.1.0.5/32".to_string()]);
}

/// A subnet without a usable address range is skipped with its dependents
///
/// Scenario:
/// 1. Blank the start address of the subnet holding the NIC
/// 2. Verify the pass succeeds, the other subnet is built and nothing
///    references the missing switch
/// 3. Verify a second pass writes nothing
#[tokio::test]
async fn test_subnet_without_range_skips_dependents() {
    let (nb, db) = memory_db();
    let records = replaced(sample_topology(), "n1", |mut r| {
        r["guest_ip_start"] = Value::String(String::new());
        r
    });
    let sets = build_sets(&records);

    reconcile(db.clone(), &sets).await.expect("reconcile failed");
    assert!(nb.get_by_name::<LogicalSwitch>("subnet/n1").is_none());
    assert!(nb.get_by_name::<LogicalRouterPort>("subnet-rn/n1").is_none());
    assert!(nb.get_by_name::<LogicalSwitchPort>("iface/g1/eth0").is_none());
    assert!(nb.rows::<Acl>().is_empty());
    assert!(nb.rows::<Nat>().is_empty());

    let n2 = nb.get_by_name::<LogicalSwitch>("subnet/n2").expect("subnet switch");
    assert_eq!(n2.dns_records.len(), 1);
    let lr = nb.get_by_name::<LogicalRouter>("vpc-r/v1").expect("router");
    assert_eq!(lr.ports.len(), 2);

    nb.clear_log();
    let stats = reconcile(db, &sets).await.expect("second pass failed");
    assert_eq!(stats.transactions, 0);
}

/// A route table entry equal to a NIC host route is written once and
/// keeps the NIC's stamp
#[tokio::test]
async fn test_route_equal_to_host_route_is_stable() {
    let (nb, db) = memory_db();
    let mut records = without(sample_topology(), &["rt1"]);
    records.push((
        RouteTable::KIND,
        fixtures::route_table(
            "rt1",
            "v1",
            &[
                ("10.1.0.5/32", "ip", "100.64.0.11"),
                ("192.168.0.0/16", "ip", "10.1.0.254"),
            ],
            1,
        ),
    ));
    let sets = build_sets(&records);
    reconcile(db.clone(), &sets).await.expect("first pass failed");

    assert_eq!(
        sorted_routes(&nb),
        vec![
            ("10.1.0.5/32".to_string(), "100.64.0.11".to_string()),
            ("192.168.0.0/16".to_string(), "10.1.0.254".to_string()),
        ]
    );
    let nic = sets.nics.get("g1/eth0").expect("nic");
    let host_route = nb
        .rows::<LogicalRouterStaticRoute>()
        .into_iter()
        .find(|r| r.ip_prefix == "10.1.0.5/32")
        .expect("host route");
    assert_eq!(
        host_route.external_id(EXTERNAL_ID_VERSION),
        Some(nic.meta().version_stamp().as_str())
    );

    for _ in 0..2 {
        nb.clear_log();
        let stats = reconcile(db.clone(), &sets).await.expect("pass failed");
        assert_eq!(stats.stamped, 0);
        assert_eq!(stats.transactions, 0);
    }
}

/// Secondary addresses and group VIPs widen the NIC port
///
/// Scenario:
/// 1. Give the NIC a secondary address and put its instance in a group
///    owning a VIP with a floating IP on the same subnet
/// 2. Verify the port's addresses, port security, host routes and NATs
/// 3. Remove the VIP and verify its NAT goes and the port narrows
#[tokio::test]
async fn test_sub_ips_and_group_vips() {
    let (nb, db) = memory_db();
    let mut records = replaced(sample_topology(), "if1", |r| fixtures::with_row_id(r, 7));
    records.extend([
        (NetworkAddress::KIND, fixtures::sub_ip("a1", 7, "n1", "10.1.0.9", 1)),
        (GroupGuest::KIND, fixtures::group_guest("gg1", "grp1", "g1", 1)),
        (
            GroupNetwork::KIND,
            fixtures::group_network("gn1", "grp1", "n1", "10.1.0.50", "e2", 1),
        ),
        (GroupNetwork::KIND, fixtures::group_network("gn2", "grp2", "n1", "10.1.0.51", "", 1)),
        (FloatingIp::KIND, fixtures::floating_ip("e2", "10.2.0.101", "n2", 1)),
    ]);
    let sets = build_sets(&records);
    reconcile(db.clone(), &sets).await.expect("first pass failed");

    let port = nb
        .get_by_name::<LogicalSwitchPort>("iface/g1/eth0")
        .expect("nic port");
    assert_eq!(
        port.addresses,
        vec!["00:22:00:00:00:01 10.1.0.5 10.1.0.9".to_string()]
    );
    assert_eq!(
        port.port_security,
        vec!["00:22:00:00:00:01 10.1.0.5/24 10.1.0.9 10.1.0.50".to_string()]
    );
    assert!(sorted_routes(&nb).contains(&("10.1.0.9/32".to_string(), "100.64.0.11".to_string())));

    let vip_nat = nb
        .rows::<Nat>()
        .into_iter()
        .find(|n| n.logical_ip == "10.1.0.50")
        .expect("group vip nat");
    assert_eq!(vip_nat.external_ip, "10.2.0.101");
    assert_eq!(vip_nat.logical_port, None);
    assert_eq!(nb.rows::<Nat>().len(), 2);

    nb.clear_log();
    let stats = reconcile(db.clone(), &sets).await.expect("second pass failed");
    assert_eq!(stats.transactions, 0);

    let reduced = build_sets(&without(records, &["gn1", "e2"]));
    reconcile(db, &reduced).await.expect("third pass failed");
    assert_eq!(nb.rows::<Nat>().len(), 1);
    let port = nb
        .get_by_name::<LogicalSwitchPort>("iface/g1/eth0")
        .expect("nic port");
    assert_eq!(
        port.port_security,
        vec!["00:22:00:00:00:01 10.1.0.5/24 10.1.0.9".to_string()]
    );
    assert!(reduced
        .nics
        .get("g1/eth0")
        .is_some_and(|n: &InstanceNic| n.sub_ips.len() == 1));
}

/// Load balancer ports and listener policies
///
/// Scenario:
/// 1. Add a load balancer on n1 with a white-listed TCP listener and a
///    black-listed UDP listener sharing one ACL
/// 2. Verify its port and the three listener rules on the subnet switch
/// 3. Turn the TCP listener's policy off and verify its rules are swept
#[tokio::test]
async fn test_loadbalancer_listener_policies() {
    let (nb, db) = memory_db();
    let mut records = sample_topology();
    records.extend([
        (
            LoadbalancerNetwork::KIND,
            fixtures::loadbalancer_network("lbn1", "lb1", "n1", "10.1.0.100", 1),
        ),
        (
            LoadbalancerAcl::KIND,
            fixtures::loadbalancer_acl("acl1", &["192.0.2.0/24", "198.51.100.7"], 1),
        ),
        (
            LoadbalancerListener::KIND,
            fixtures::loadbalancer_listener("l1", "lb1", "tcp", 80, "white", "acl1", 1),
        ),
        (
            LoadbalancerListener::KIND,
            fixtures::loadbalancer_listener("l2", "lb1", "udp", 53, "black", "acl1", 1),
        ),
    ]);
    let sets = build_sets(&records);
    reconcile(db.clone(), &sets).await.expect("first pass failed");

    let port_name = loadbalancer_port("lb1");
    let port = nb
        .get_by_name::<LogicalSwitchPort>(&port_name)
        .expect("load balancer port");
    assert_eq!(
        port.addresses,
        vec![format!("{} 10.1.0.100", hash_mac(&port_name))]
    );
    let n1 = nb.get_by_name::<LogicalSwitch>("subnet/n1").expect("subnet switch");
    assert_eq!(n1.ports.len(), 4);
    assert_eq!(n1.acls.len(), 6);

    let owner = oc_ref(LogicalSwitch::TABLE, "subnet/n1");
    let mut listener_acls: Vec<(i64, String, String)> = nb
        .rows::<Acl>()
        .into_iter()
        .filter(|a| a.match_.contains("ip4.dst == 10.1.0.100"))
        .inspect(|a| assert_eq!(a.external_id(EXTERNAL_ID_REF), Some(owner.as_str())))
        .map(|a| (a.priority, a.action, a.match_))
        .collect();
    listener_acls.sort();
    assert_eq!(
        listener_acls,
        vec![
            (
                1000,
                "drop".to_string(),
                "ip4 && ip4.dst == 10.1.0.100 && tcp && tcp.dst == 80".to_string()
            ),
            (
                1000,
                "drop".to_string(),
                "ip4 && ip4.dst == 10.1.0.100 && udp && udp.dst == 53 && ip4.src == {192.0.2.0/24, 198.51.100.7}"
                    .to_string()
            ),
            (
                2000,
                "allow-related".to_string(),
                "ip4 && ip4.dst == 10.1.0.100 && tcp && tcp.dst == 80 && ip4.src == {192.0.2.0/24, 198.51.100.7}"
                    .to_string()
            ),
        ]
    );

    nb.clear_log();
    let stats = reconcile(db.clone(), &sets).await.expect("second pass failed");
    assert_eq!(stats.transactions, 0);

    let records = replaced(records, "l1", |mut r| {
        r["acl_status"] = Value::String("off".to_string());
        fixtures::touched(r, 2)
    });
    let stats = reconcile(db, &build_sets(&records))
        .await
        .expect("third pass failed");
    assert_eq!(stats.swept, 2);
    assert_eq!(nb.rows::<Acl>().len(), 4);
}

/// A rule with a zero priority lands at the lowest usable priority
#[tokio::test]
async fn test_zero_priority_rule_is_raised() {
    let (nb, db) = memory_db();
    let records = replaced(sample_topology(), "r3", |mut r| {
        r["priority"] = Value::from(0);
        r
    });
    reconcile(db, &build_sets(&records))
        .await
        .expect("reconcile failed");
    let egress: Vec<i64> = nb
        .rows::<Acl>()
        .into_iter()
        .filter(|a| a.direction == "from-lport")
        .map(|a| a.priority)
        .collect();
    assert_eq!(egress, vec![1]);
}
