//! Desired rows per scope.

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, warn};
use vpc_models::{
    FloatingIp, Host, InstanceNic, LoadbalancerNetwork, ModelSets, Resource, Subnet, Vpc,
};
use vpc_ovnutil::{
    Acl, DhcpOptions, Dns, LogicalRouter, LogicalRouterPort, LogicalRouterStaticRoute,
    LogicalSwitch, LogicalSwitchPort, Map, Nat, Row, Transaction,
};

use super::names::*;
use super::{
    router_nats, router_ports, router_routes, switch_acls, switch_dns, switch_ports, Keeper,
};
use crate::compiler::{
    compile_listener_acl, compile_rule, resolve_routes, CompiledAcl, ListenerAcl,
};
use crate::error::AgentResult;

fn map<const N: usize>(pairs: [(&str, String); N]) -> Map {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Router-type switch port peered with `router_port`.
fn router_type_port(name: String, router_port: String) -> LogicalSwitchPort {
    LogicalSwitchPort {
        name,
        kind: "router".to_string(),
        addresses: vec!["router".to_string()],
        options: map([("router-port", router_port)]),
        ..Default::default()
    }
}

/// DHCP options of a subnet; `server_mac` is the subnet router port MAC.
pub(super) fn subnet_dhcp_options(subnet: &Subnet, cidr: String, server_mac: &str) -> DhcpOptions {
    let gateway = subnet.guest_gateway.clone();
    let mut options = map([
        ("router", gateway.clone()),
        ("server_id", gateway.clone()),
        ("server_mac", server_mac.to_string()),
        ("lease_time", DHCP_LEASE_TIME.to_string()),
        ("mtu", subnet.mtu.unwrap_or(DEFAULT_MTU).to_string()),
        (
            "classless_static_route",
            format!("{{{}/32,0.0.0.0, 0.0.0.0/0,{}}}", METADATA_IP, gateway),
        ),
    ]);
    let dns: Vec<&str> = subnet
        .guest_dns
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if !dns.is_empty() {
        options.insert("dns_server".to_string(), format!("{{{}}}", dns.join(", ")));
    }
    if !subnet.guest_domain.is_empty() {
        options.insert(
            "domain_name".to_string(),
            format!("\"{}\"", subnet.guest_domain),
        );
    }
    DhcpOptions {
        cidr,
        options,
        external_ids: map([(EXTERNAL_ID_SUBNET, subnet.meta.id.clone())]),
        ..Default::default()
    }
}

impl Keeper {
    /// Claims every scope of the snapshot, owners before dependents.
    ///
    /// Dependents of a subnet whose switch was not claimed are skipped.
    pub async fn claim_all(&mut self, sets: &ModelSets) -> AgentResult<()> {
        for vpc in sets.vpcs.values() {
            self.claim_vpc(vpc).await?;
            let mut subnets = Vec::new();
            for subnet in sets.vpc_subnets(vpc) {
                if self.claim_subnet(vpc, subnet).await? {
                    subnets.push(subnet);
                }
            }
            self.claim_dns(sets, vpc, &subnets).await?;
            for host in sets.vpc_hosts(vpc) {
                self.claim_vpc_host(vpc, host).await?;
            }
            for subnet in &subnets {
                for nic in sets.subnet_nics(subnet) {
                    self.claim_nic(sets, vpc, subnet, nic).await?;
                }
                for lbnet in sets.subnet_loadbalancer_networks(subnet) {
                    self.claim_loadbalancer_network(sets, subnet, lbnet).await?;
                }
            }
            self.claim_group_networks(sets, vpc, &subnets).await?;
            self.claim_routes(sets, vpc).await?;
        }
        Ok(())
    }

    /// Router, host switch and the port pair linking them.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id))]
    pub async fn claim_vpc(&mut self, vpc: &Vpc) -> AgentResult<()> {
        let id = &vpc.meta.id;
        let stamp = vpc.meta.version_stamp();
        let mut txn = Transaction::new();

        let lrp_name = vpc_router_host_port(id);
        let lrp = self.claim(
            &mut txn,
            LogicalRouterPort {
                mac: hash_mac(&lrp_name),
                name: lrp_name.clone(),
                networks: vec![MAPPED_GATEWAY_CIDR.to_string()],
                ..Default::default()
            },
            &stamp,
            &[],
        )?;
        self.claim(
            &mut txn,
            LogicalRouter {
                name: vpc_router(id),
                ..Default::default()
            },
            &stamp,
            &[("ports", vec![lrp])],
        )?;

        let lsp = self.claim(
            &mut txn,
            router_type_port(vpc_host_router_port(id), lrp_name),
            &stamp,
            &[],
        )?;
        self.claim(
            &mut txn,
            LogicalSwitch {
                name: vpc_host_switch(id),
                ..Default::default()
            },
            &stamp,
            &[("ports", vec![lsp])],
        )?;

        self.commit(txn, "vpc", id).await
    }

    /// Subnet switch, its router link, metadata port and DHCP options.
    ///
    /// Returns false, claiming nothing, for a subnet without a usable
    /// address range.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id, subnet = %subnet.meta.id))]
    pub async fn claim_subnet(&mut self, vpc: &Vpc, subnet: &Subnet) -> AgentResult<bool> {
        let id = &subnet.meta.id;
        let Some(cidr) = subnet.cidr() else {
            warn!(start = %subnet.guest_ip_start, "Subnet has no usable address range, skipping");
            return Ok(false);
        };
        let stamp = subnet.meta.version_stamp();
        let mut txn = Transaction::new();

        let lrp_name = subnet_router_port(id);
        let lrp_mac = hash_mac(&lrp_name);
        let lrp = self.claim(
            &mut txn,
            LogicalRouterPort {
                name: lrp_name.clone(),
                mac: lrp_mac.clone(),
                networks: vec![format!("{}/{}", subnet.guest_gateway, subnet.guest_ip_mask)],
                ..Default::default()
            },
            &stamp,
            &[],
        )?;
        self.attach::<LogicalRouter>(&mut txn, &vpc_router(&vpc.meta.id), "ports", &lrp, router_ports);

        let router_port = self.claim(
            &mut txn,
            router_type_port(subnet_switch_router_port(id), lrp_name),
            &stamp,
            &[],
        )?;
        let md_name = subnet_metadata_port(id);
        let md_port = self.claim(
            &mut txn,
            LogicalSwitchPort {
                addresses: vec![format!("{} {}", hash_mac(&md_name), METADATA_IP)],
                name: md_name,
                kind: "localport".to_string(),
                ..Default::default()
            },
            &stamp,
            &[],
        )?;
        self.claim(
            &mut txn,
            LogicalSwitch {
                name: subnet_switch(id),
                ..Default::default()
            },
            &stamp,
            &[("ports", vec![router_port, md_port])],
        )?;

        let dhcp_want = subnet_dhcp_options(subnet, cidr, &lrp_mac);
        let dhcp = self.claim(&mut txn, dhcp_want.clone(), &stamp, &[])?;

        self.commit(txn, "subnet", id).await?;

        let dhcp = if dhcp.is_named() {
            self.resolve(&dhcp_want).await?
        } else {
            dhcp
        };
        self.subnet_dhcp.insert(id.clone(), dhcp);
        Ok(true)
    }

    /// One DNS row with the enabled A records, attached to the claimed
    /// subnet switches of the virtual network.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id))]
    pub async fn claim_dns(
        &mut self,
        sets: &ModelSets,
        vpc: &Vpc,
        subnets: &[&Subnet],
    ) -> AgentResult<()> {
        let mut records = Map::new();
        for record in sets.dns_records.values() {
            if !record.enabled || !record.dns_type.eq_ignore_ascii_case("A") {
                continue;
            }
            let name = record.meta.name.trim_end_matches('.').to_lowercase();
            if name.is_empty() || record.dns_value.is_empty() {
                continue;
            }
            let addrs = record.dns_value.replace(',', " ");
            records
                .entry(name)
                .and_modify(|v: &mut String| {
                    v.push(' ');
                    v.push_str(&addrs);
                })
                .or_insert(addrs);
        }
        if records.is_empty() || subnets.is_empty() {
            return Ok(());
        }

        let mut txn = Transaction::new();
        let dns = self.claim(
            &mut txn,
            Dns {
                records,
                external_ids: map([(EXTERNAL_ID_VPC, vpc.meta.id.clone())]),
                ..Default::default()
            },
            &vpc.meta.version_stamp(),
            &[],
        )?;
        for subnet in subnets {
            self.attach::<LogicalSwitch>(
                &mut txn,
                &subnet_switch(&subnet.meta.id),
                "dns_records",
                &dns,
                switch_dns,
            );
        }
        self.commit(txn, "dns", &vpc.meta.id).await
    }

    /// Host switch port answering on the host's mapped address.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id, host = %host.meta.id))]
    pub async fn claim_vpc_host(&mut self, vpc: &Vpc, host: &Host) -> AgentResult<()> {
        if host.ovn_mapped_ip_addr.is_empty() {
            debug!("Host has no mapped address, skipping");
            return Ok(());
        }
        let mut txn = Transaction::new();
        let port = self.claim(
            &mut txn,
            LogicalSwitchPort {
                name: vpc_host_port(&vpc.meta.id, &host.meta.id),
                addresses: vec![format!(
                    "{} {}",
                    hash_mac(&host.meta.id),
                    host.ovn_mapped_ip_addr
                )],
                ..Default::default()
            },
            &host.meta.version_stamp(),
            &[],
        )?;
        self.attach::<LogicalSwitch>(
            &mut txn,
            &vpc_host_switch(&vpc.meta.id),
            "ports",
            &port,
            switch_ports,
        );
        let scope_id = format!("{}/{}", vpc.meta.id, host.meta.id);
        self.commit(txn, "vpc-host", &scope_id).await
    }

    /// Switch port, host routes, ACLs and floating IP of one NIC.
    ///
    /// Secondary addresses join the port's addresses and port security;
    /// VIPs of the instance's groups on the same subnet join its port
    /// security only.
    #[instrument(skip_all, fields(nic = %nic.key()))]
    pub async fn claim_nic(
        &mut self,
        sets: &ModelSets,
        vpc: &Vpc,
        subnet: &Subnet,
        nic: &InstanceNic,
    ) -> AgentResult<()> {
        if nic.mac_addr.is_empty() || nic.ip_addr.is_empty() {
            warn!("NIC has no address yet, skipping");
            return Ok(());
        }
        let stamp = nic.meta.version_stamp();
        let port_name = nic_port(&nic.guest_id, &nic.ifname);
        let switch_name = subnet_switch(&subnet.meta.id);
        let router_name = vpc_router(&vpc.meta.id);
        let dhcp = self.subnet_dhcp.get(&subnet.meta.id).cloned();
        let instance = nic.instance.as_deref().and_then(|i| sets.instances.get(i));
        let mut txn = Transaction::new();

        let sub_ips: Vec<&str> = sets.nic_sub_ips(nic).map(|a| a.ip_addr.as_str()).collect();
        let vips: BTreeSet<&str> = instance
            .into_iter()
            .flat_map(|i| sets.instance_vips(i, subnet))
            .map(|vip| vip.ip_addr.as_str())
            .collect();
        let mut addresses = format!("{} {}", nic.mac_addr, nic.ip_addr);
        let mut security = format!("{} {}/{}", nic.mac_addr, nic.ip_addr, subnet.guest_ip_mask);
        for ip in &sub_ips {
            addresses.push(' ');
            addresses.push_str(ip);
            security.push(' ');
            security.push_str(ip);
        }
        for vip in &vips {
            security.push(' ');
            security.push_str(vip);
        }

        let port = self.claim(
            &mut txn,
            LogicalSwitchPort {
                name: port_name.clone(),
                addresses: vec![addresses],
                port_security: vec![security],
                dhcpv4_options: dhcp,
                ..Default::default()
            },
            &stamp,
            &[],
        )?;
        self.attach::<LogicalSwitch>(&mut txn, &switch_name, "ports", &port, switch_ports);

        let host = instance.and_then(|i| sets.instance_host(i));
        if let Some(host) = host.filter(|h| !h.ovn_mapped_ip_addr.is_empty()) {
            for ip in std::iter::once(nic.ip_addr.as_str()).chain(sub_ips.iter().copied()) {
                let ip_prefix = format!("{}/32", ip);
                self.host_routes
                    .insert((ip_prefix.clone(), host.ovn_mapped_ip_addr.clone()));
                let route = self.claim(
                    &mut txn,
                    LogicalRouterStaticRoute {
                        ip_prefix,
                        nexthop: host.ovn_mapped_ip_addr.clone(),
                        external_ids: map([(
                            EXTERNAL_ID_REF,
                            oc_ref(LogicalRouter::TABLE, &router_name),
                        )]),
                        ..Default::default()
                    },
                    &stamp,
                    &[],
                )?;
                self.attach::<LogicalRouter>(&mut txn, &router_name, "static_routes", &route, router_routes);
            }
        }

        if let Some(instance) = instance {
            let mut acls = BTreeSet::new();
            let admin = instance.admin_secgroup.iter().map(|sg| (sg, ADMIN_SECGROUP_PRIORITY_OFFSET));
            let regular = instance.secgroups.iter().map(|sg| (sg, 0));
            for (secgroup_id, offset) in admin.chain(regular) {
                let Some(secgroup) = sets.secgroups.get(secgroup_id) else {
                    continue;
                };
                for rule in sets.secgroup_rules_of(secgroup) {
                    match compile_rule(rule, &port_name) {
                        Ok(mut acl) => {
                            acl.priority += offset;
                            acls.insert(acl);
                        }
                        Err(e) => warn!(rule = %rule.meta.id, error = %e, "Skipping security group rule"),
                    }
                }
            }
            for acl in acls {
                self.claim_switch_acl(&mut txn, &switch_name, acl, &stamp)?;
            }
        }

        if let Some(eip) = nic.floating_ip.as_deref().and_then(|e| sets.floating_ips.get(e)) {
            self.claim_floating_ip(&mut txn, &router_name, Some(&port_name), &nic.ip_addr, eip, &stamp)?;
        }

        self.commit(txn, "nic", &nic.key()).await
    }

    /// ACL owned by `switch_name`.
    fn claim_switch_acl(
        &mut self,
        txn: &mut Transaction,
        switch_name: &str,
        acl: CompiledAcl,
        stamp: &str,
    ) -> AgentResult<()> {
        let CompiledAcl {
            direction,
            priority,
            match_,
            action,
        } = acl;
        let uuid = self.claim(
            txn,
            Acl {
                direction,
                priority,
                match_,
                action,
                external_ids: map([(EXTERNAL_ID_REF, oc_ref(LogicalSwitch::TABLE, switch_name))]),
                ..Default::default()
            },
            stamp,
            &[],
        )?;
        self.attach::<LogicalSwitch>(txn, switch_name, "acls", &uuid, switch_acls);
        Ok(())
    }

    /// Load balancer port plus the source-address policies of its
    /// listeners.
    #[instrument(skip_all, fields(lbnet = %lbnet.key()))]
    pub async fn claim_loadbalancer_network(
        &mut self,
        sets: &ModelSets,
        subnet: &Subnet,
        lbnet: &LoadbalancerNetwork,
    ) -> AgentResult<()> {
        let port_name = loadbalancer_port(&lbnet.loadbalancer_id);
        let switch_name = subnet_switch(&subnet.meta.id);
        let mac = if lbnet.mac_addr.is_empty() {
            hash_mac(&port_name)
        } else {
            lbnet.mac_addr.clone()
        };
        let mut txn = Transaction::new();

        let port = self.claim(
            &mut txn,
            LogicalSwitchPort {
                addresses: vec![format!("{} {}", mac, lbnet.ip_addr)],
                name: port_name,
                ..Default::default()
            },
            &lbnet.meta.version_stamp(),
            &[],
        )?;
        self.attach::<LogicalSwitch>(&mut txn, &switch_name, "ports", &port, switch_ports);

        let mut acls = BTreeMap::new();
        for listener in sets.loadbalancer_listeners_of(lbnet) {
            let Some(acl) = sets.listener_acl(listener) else {
                continue;
            };
            let policy = ListenerAcl {
                protocol: listener.listener_type.clone(),
                port: listener.listener_port,
                acl_type: listener.acl_type.clone(),
                cidrs: acl.cidrs(),
                vip: lbnet.ip_addr.clone(),
            };
            match compile_listener_acl(&policy) {
                Ok(compiled) => {
                    let stamp = listener.meta.version_stamp();
                    for rule in compiled {
                        acls.entry(rule).or_insert_with(|| stamp.clone());
                    }
                }
                Err(e) => warn!(listener = %listener.meta.id, error = %e, "Skipping listener policy"),
            }
        }
        for (acl, stamp) in acls {
            self.claim_switch_acl(&mut txn, &switch_name, acl, &stamp)?;
        }

        self.commit(txn, "loadbalancer", &lbnet.key()).await
    }

    /// Floating IPs of the instance group VIPs on the claimed subnets.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id))]
    pub async fn claim_group_networks(
        &mut self,
        sets: &ModelSets,
        vpc: &Vpc,
        subnets: &[&Subnet],
    ) -> AgentResult<()> {
        let router_name = vpc_router(&vpc.meta.id);
        let mut txn = Transaction::new();
        for subnet in subnets {
            for vip in sets.subnet_group_networks(subnet) {
                let Some(eip) = vip.floating_ip.as_deref().and_then(|e| sets.floating_ips.get(e)) else {
                    continue;
                };
                let stamp = vip.meta.version_stamp();
                self.claim_floating_ip(&mut txn, &router_name, None, &vip.ip_addr, eip, &stamp)?;
            }
        }
        self.commit(txn, "group-vips", &vpc.meta.id).await
    }

    /// One-to-one NAT of `eip` to `logical_ip`, distributed to the
    /// chassis of `port_name` when given.
    fn claim_floating_ip(
        &mut self,
        txn: &mut Transaction,
        router_name: &str,
        port_name: Option<&str>,
        logical_ip: &str,
        eip: &FloatingIp,
        stamp: &str,
    ) -> AgentResult<()> {
        let nat = self.claim(
            txn,
            Nat {
                kind: "dnat_and_snat".to_string(),
                external_ip: eip.ip_addr.clone(),
                logical_ip: logical_ip.to_string(),
                logical_port: port_name.map(str::to_string),
                external_mac: None,
                external_ids: map([(EXTERNAL_ID_REF, oc_ref(LogicalRouter::TABLE, router_name))]),
                ..Default::default()
            },
            stamp,
            &[],
        )?;
        self.attach::<LogicalRouter>(txn, router_name, "nat", &nat, router_nats);
        Ok(())
    }

    /// Static routes of the virtual network's route table.
    #[instrument(skip_all, fields(vpc = %vpc.meta.id))]
    pub async fn claim_routes(&mut self, sets: &ModelSets, vpc: &Vpc) -> AgentResult<()> {
        let Some(table) = sets.vpc_route_table(vpc) else {
            return Ok(());
        };
        let stamp = table.meta.version_stamp();
        let router_name = vpc_router(&vpc.meta.id);
        let routes: BTreeSet<_> = resolve_routes(sets, vpc).into_iter().collect();
        let mut txn = Transaction::new();
        for route in routes {
            if self
                .host_routes
                .contains(&(route.cidr.clone(), route.next_hop.clone()))
            {
                debug!(cidr = %route.cidr, next_hop = %route.next_hop, "Route already claimed as a host route");
                continue;
            }
            let uuid = self.claim(
                &mut txn,
                LogicalRouterStaticRoute {
                    ip_prefix: route.cidr,
                    nexthop: route.next_hop,
                    external_ids: map([(
                        EXTERNAL_ID_REF,
                        oc_ref(LogicalRouter::TABLE, &router_name),
                    )]),
                    ..Default::default()
                },
                &stamp,
                &[],
            )?;
            self.attach::<LogicalRouter>(&mut txn, &router_name, "static_routes", &uuid, router_routes);
        }
        self.commit(txn, "routes", &vpc.meta.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_subnet_dhcp_options() {
        let subnet = Subnet {
            meta: vpc_models::ResourceMeta {
                id: "n1".to_string(),
                ..Default::default()
            },
            guest_ip_start: "10.1.0.2".to_string(),
            guest_ip_mask: 24,
            guest_gateway: "10.1.0.1".to_string(),
            guest_dns: "8.8.8.8, 1.1.1.1".to_string(),
            guest_domain: "cloud.local".to_string(),
            mtu: Some(1400),
            ..Default::default()
        };
        let dhcp = subnet_dhcp_options(&subnet, "10.1.0.0/24".to_string(), "0a:00:00:00:00:01");
        assert_eq!(dhcp.cidr, "10.1.0.0/24");
        assert_eq!(dhcp.options["router"], "10.1.0.1");
        assert_eq!(dhcp.options["server_mac"], "0a:00:00:00:00:01");
        assert_eq!(dhcp.options["mtu"], "1400");
        assert_eq!(dhcp.options["dns_server"], "{8.8.8.8, 1.1.1.1}");
        assert_eq!(dhcp.options["domain_name"], "\"cloud.local\"");
        assert_eq!(
            dhcp.options["classless_static_route"],
            "{169.254.169.254/32,0.0.0.0, 0.0.0.0/0,10.1.0.1}"
        );
        assert_eq!(dhcp.external_id(EXTERNAL_ID_SUBNET), Some("n1"));
    }

    #[test]
    fn test_dhcp_defaults() {
        let subnet = Subnet {
            guest_gateway: "10.1.0.1".to_string(),
            ..Default::default()
        };
        let dhcp = subnet_dhcp_options(&subnet, "10.1.0.0/24".to_string(), "m");
        assert_eq!(dhcp.options["mtu"], DEFAULT_MTU.to_string());
        assert!(!dhcp.options.contains_key("dns_server"));
        assert!(!dhcp.options.contains_key("domain_name"));
    }
}
