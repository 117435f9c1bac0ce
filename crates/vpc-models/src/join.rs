//! The model graph snapshot and its join pass.
//!
//! Join functions resolve each dependent record's owner, register the
//! dependent under the owner and report whether every hard reference
//! resolved. A dangling hard reference is tolerated silently when the
//! previously published snapshot already held the same link: the owner is
//! then most likely being deleted remotely.

use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use crate::records::{
    DnsRecord, FloatingIp, GroupGuest, GroupNetwork, Host, Instance, InstanceNic,
    InstanceSecgroup, LoadbalancerAcl, LoadbalancerListener, LoadbalancerNetwork, NetworkAddress,
    RouteTable, SecurityGroup, SecurityGroupRule, Subnet, Vpc,
};
use crate::resource::{ModelSet, Resource, SetDiff};

/// One complete model graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSets {
    pub vpcs: ModelSet<Vpc>,
    pub subnets: ModelSet<Subnet>,
    pub hosts: ModelSet<Host>,
    pub instances: ModelSet<Instance>,
    pub secgroups: ModelSet<SecurityGroup>,
    pub secgroup_rules: ModelSet<SecurityGroupRule>,
    pub nics: ModelSet<InstanceNic>,
    pub instance_secgroups: ModelSet<InstanceSecgroup>,
    pub floating_ips: ModelSet<FloatingIp>,
    pub dns_records: ModelSet<DnsRecord>,
    pub route_tables: ModelSet<RouteTable>,
    pub network_addresses: ModelSet<NetworkAddress>,
    pub group_guests: ModelSet<GroupGuest>,
    pub group_networks: ModelSet<GroupNetwork>,
    pub loadbalancer_networks: ModelSet<LoadbalancerNetwork>,
    pub loadbalancer_listeners: ModelSet<LoadbalancerListener>,
    pub loadbalancer_acls: ModelSet<LoadbalancerAcl>,
}

/// Change counts per collection kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDiff {
    pub sets: BTreeMap<&'static str, SetDiff>,
}

impl ModelDiff {
    /// True if at least one collection differs.
    pub fn changed(&self) -> bool {
        self.sets.values().any(|d| !d.is_empty())
    }

    /// Sum over every collection.
    pub fn total(&self) -> SetDiff {
        let mut total = SetDiff::default();
        for d in self.sets.values() {
            total += *d;
        }
        total
    }
}

/// Outcome of a missing hard reference.
fn dangling(
    previous_link: bool,
    kind: &str,
    key: &str,
    owner_kind: &str,
    owner_id: &str,
) -> bool {
    if previous_link {
        debug!(kind, key, owner_kind, owner_id, "Owner gone, dropping previously joined record");
        true
    } else {
        warn!(kind, key, owner_kind, owner_id, "Owner not found");
        false
    }
}

impl ModelSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deep copy with every join reference cleared.
    pub fn copy_detached(&self) -> Self {
        Self {
            vpcs: self.vpcs.copy_detached(),
            subnets: self.subnets.copy_detached(),
            hosts: self.hosts.copy_detached(),
            instances: self.instances.copy_detached(),
            secgroups: self.secgroups.copy_detached(),
            secgroup_rules: self.secgroup_rules.copy_detached(),
            nics: self.nics.copy_detached(),
            instance_secgroups: self.instance_secgroups.copy_detached(),
            floating_ips: self.floating_ips.copy_detached(),
            dns_records: self.dns_records.copy_detached(),
            route_tables: self.route_tables.copy_detached(),
            network_addresses: self.network_addresses.copy_detached(),
            group_guests: self.group_guests.copy_detached(),
            group_networks: self.group_networks.copy_detached(),
            loadbalancer_networks: self.loadbalancer_networks.copy_detached(),
            loadbalancer_listeners: self.loadbalancer_listeners.copy_detached(),
            loadbalancer_acls: self.loadbalancer_acls.copy_detached(),
        }
    }

    /// Total number of records.
    pub fn len(&self) -> usize {
        self.vpcs.len()
            + self.subnets.len()
            + self.hosts.len()
            + self.instances.len()
            + self.secgroups.len()
            + self.secgroup_rules.len()
            + self.nics.len()
            + self.instance_secgroups.len()
            + self.floating_ips.len()
            + self.dns_records.len()
            + self.route_tables.len()
            + self.network_addresses.len()
            + self.group_guests.len()
            + self.group_networks.len()
            + self.loadbalancer_networks.len()
            + self.loadbalancer_listeners.len()
            + self.loadbalancer_acls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves every cross-reference.
    ///
    /// Must run on a detached copy. Records with unresolvable owners are
    /// removed; the return value is false if any newly required hard
    /// reference did not resolve. `previous` is the last published snapshot.
    pub fn join(&mut self, previous: Option<&ModelSets>) -> bool {
        // Order matters: dependents dropped by an earlier join must not be
        // registered by a later one.
        let results = [
            self.join_subnets(previous),
            self.join_route_tables(previous),
            self.join_instance_hosts(previous),
            self.join_instance_secgroups(previous),
            self.join_secgroup_rules(),
            self.join_memberships(),
            self.join_nics(),
            self.join_subnet_floating_ips(previous),
            self.join_nic_floating_ips(previous),
            self.join_network_addresses(),
            self.join_group_guests(),
            self.join_group_networks(previous),
            self.join_loadbalancer_networks(),
            self.join_loadbalancer_listeners(),
        ];
        let correct = results.iter().all(|c| *c);
        if correct {
            debug!(records = self.len(), "Join complete");
        } else {
            info!(records = self.len(), "Join found unresolved references");
        }
        correct
    }

    /// Subnet -> virtual network (hard).
    fn join_subnets(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        let mut dropped = Vec::new();
        for (key, subnet) in self.subnets.iter() {
            match self.vpcs.get_mut(&subnet.vpc_id) {
                Some(vpc) => {
                    vpc.subnets.insert(key.clone());
                }
                None => {
                    let was_linked = previous
                        .and_then(|p| p.subnets.get(key))
                        .is_some_and(|s| s.vpc_id == subnet.vpc_id);
                    correct &= dangling(was_linked, Subnet::KIND, key, Vpc::KIND, &subnet.vpc_id);
                    dropped.push(key.clone());
                }
            }
        }
        for key in dropped {
            self.subnets.remove(&key);
        }
        correct
    }

    /// Route table -> virtual network (hard, at most one per network).
    fn join_route_tables(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        let mut dropped = Vec::new();
        for (key, table) in self.route_tables.iter() {
            let Some(vpc) = self.vpcs.get_mut(&table.vpc_id) else {
                let was_linked = previous
                    .and_then(|p| p.route_tables.get(key))
                    .is_some_and(|t| t.vpc_id == table.vpc_id);
                correct &= dangling(was_linked, RouteTable::KIND, key, Vpc::KIND, &table.vpc_id);
                dropped.push(key.clone());
                continue;
            };
            if let Some(existing) = &vpc.route_table {
                warn!(
                    vpc = %table.vpc_id,
                    existing = %existing,
                    skipped = %key,
                    "Virtual network has more than one route table"
                );
                correct = false;
                dropped.push(key.clone());
                continue;
            }
            vpc.route_table = Some(key.clone());
        }
        for key in dropped {
            self.route_tables.remove(&key);
        }
        correct
    }

    /// Instance -> host (hard). Instances not yet scheduled or managed by
    /// an external cloud are skipped.
    fn join_instance_hosts(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        let mut dropped = Vec::new();
        for (key, instance) in self.instances.values_mut().map(|i| (i.meta.id.clone(), i)) {
            if instance.host_id.is_empty() || !instance.external_id.is_empty() {
                continue;
            }
            if self.hosts.contains(&instance.host_id) {
                instance.host = Some(instance.host_id.clone());
                continue;
            }
            let was_linked = previous
                .and_then(|p| p.instances.get(&key))
                .is_some_and(|i| i.host.as_deref() == Some(instance.host_id.as_str()));
            correct &= dangling(was_linked, Instance::KIND, &key, Host::KIND, &instance.host_id);
            dropped.push(key);
        }
        for key in dropped {
            self.instances.remove(&key);
        }
        correct
    }

    /// Instance -> admin and primary security groups (hard).
    fn join_instance_secgroups(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        for instance in self.instances.values_mut() {
            let key = instance.meta.id.clone();
            let prev = previous.and_then(|p| p.instances.get(&key));

            let admin_id = instance.admin_secgrp_id.clone();
            if !admin_id.is_empty() {
                if self.secgroups.contains(&admin_id) {
                    instance.admin_secgroup = Some(admin_id);
                } else {
                    let was_linked =
                        prev.is_some_and(|i| i.admin_secgroup.as_deref() == Some(admin_id.as_str()));
                    correct &= dangling(was_linked, Instance::KIND, &key, SecurityGroup::KIND, &admin_id);
                }
            }

            let secgroup_id = instance.secgrp_id.clone();
            if !secgroup_id.is_empty() {
                if self.secgroups.contains(&secgroup_id) {
                    instance.secgroups.insert(secgroup_id);
                } else {
                    let was_linked = prev.is_some_and(|i| i.secgroups.contains(&secgroup_id));
                    correct &=
                        dangling(was_linked, Instance::KIND, &key, SecurityGroup::KIND, &secgroup_id);
                }
            }
        }
        correct
    }

    /// Security group rule -> security group (soft). Groups may be filtered
    /// out remotely while their rules are still listed.
    fn join_secgroup_rules(&mut self) -> bool {
        for (key, rule) in self.secgroup_rules.iter() {
            if let Some(secgroup) = self.secgroups.get_mut(&rule.secgroup_id) {
                secgroup.rules.insert(key.clone());
            }
        }
        true
    }

    /// Regular security group memberships (soft).
    fn join_memberships(&mut self) -> bool {
        for membership in self.instance_secgroups.values() {
            if !self.secgroups.contains(&membership.secgroup_id) {
                debug!(
                    instance = %membership.guest_id,
                    secgroup = %membership.secgroup_id,
                    "Membership references unknown security group"
                );
                continue;
            }
            if let Some(instance) = self.instances.get_mut(&membership.guest_id) {
                instance.secgroups.insert(membership.secgroup_id.clone());
            }
        }
        true
    }

    /// NIC -> subnet and NIC -> instance (soft). NICs on subnets outside
    /// any virtual network are dropped; instance-less NICs stay.
    fn join_nics(&mut self) -> bool {
        let mut dropped = Vec::new();
        for nic in self.nics.values_mut() {
            let key = nic.key();
            let Some(subnet) = self.subnets.get_mut(&nic.network_id) else {
                dropped.push(key);
                continue;
            };
            subnet.nics.insert(key.clone());
            if let Some(instance) = self.instances.get_mut(&nic.guest_id) {
                instance.nics.insert(key);
                nic.instance = Some(nic.guest_id.clone());
            }
        }
        for key in dropped {
            self.nics.remove(&key);
        }
        true
    }

    /// Floating IP -> subnet (hard).
    fn join_subnet_floating_ips(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        let mut dropped = Vec::new();
        for (key, eip) in self.floating_ips.iter() {
            match self.subnets.get_mut(&eip.network_id) {
                Some(subnet) => {
                    subnet.floating_ips.insert(key.clone());
                }
                None => {
                    let was_linked = previous
                        .and_then(|p| p.floating_ips.get(key))
                        .is_some_and(|e| e.network_id == eip.network_id);
                    correct &= dangling(was_linked, FloatingIp::KIND, key, Subnet::KIND, &eip.network_id);
                    dropped.push(key.clone());
                }
            }
        }
        for key in dropped {
            self.floating_ips.remove(&key);
        }
        correct
    }

    /// NIC -> floating IP (hard, one NIC per floating IP).
    fn join_nic_floating_ips(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        for nic in self.nics.values_mut() {
            if nic.eip_id.is_empty() {
                continue;
            }
            let key = nic.key();
            let Some(eip) = self.floating_ips.get_mut(&nic.eip_id) else {
                let was_linked = previous
                    .and_then(|p| p.nics.get(&key))
                    .is_some_and(|n| n.floating_ip.as_deref() == Some(nic.eip_id.as_str()));
                correct &= dangling(was_linked, InstanceNic::KIND, &key, FloatingIp::KIND, &nic.eip_id);
                continue;
            };
            match eip.nic.clone() {
                Some(other) if other != key => {
                    warn!(eip = %nic.eip_id, first = %other, second = %key, "Floating IP associated with more than one NIC");
                    correct = false;
                }
                Some(_) => {}
                None => {
                    eip.nic = Some(key);
                    nic.floating_ip = Some(nic.eip_id.clone());
                }
            }
        }
        correct
    }

    /// Secondary NIC address -> NIC, by NIC row number (soft).
    fn join_network_addresses(&mut self) -> bool {
        let by_row: HashMap<String, String> = self
            .nics
            .iter()
            .filter(|(_, nic)| nic.row_id != 0)
            .map(|(key, nic)| (nic.row_id.to_string(), key.clone()))
            .collect();
        for (key, addr) in self.network_addresses.iter() {
            if !addr.is_nic_sub_ip() {
                continue;
            }
            let nic = by_row
                .get(&addr.parent_id)
                .and_then(|nic_key| self.nics.get_mut(nic_key));
            match nic {
                Some(nic) if nic.network_id == addr.network_id => {
                    nic.sub_ips.insert(key.clone());
                }
                Some(nic) => {
                    warn!(address = %key, nic = %nic.key(), network = %addr.network_id, "Secondary address on another subnet than its NIC");
                }
                None => {
                    debug!(address = %key, parent = %addr.parent_id, "Secondary address of unknown NIC");
                }
            }
        }
        true
    }

    /// Instance group memberships (soft).
    fn join_group_guests(&mut self) -> bool {
        for member in self.group_guests.values() {
            if let Some(instance) = self.instances.get_mut(&member.guest_id) {
                instance.groups.insert(member.group_id.clone());
            }
        }
        true
    }

    /// Group VIP -> subnet (hard) and group VIP -> floating IP (hard, not
    /// shared with a NIC or another VIP).
    fn join_group_networks(&mut self, previous: Option<&ModelSets>) -> bool {
        let mut correct = true;
        let mut dropped = Vec::new();
        for (key, vip) in self.group_networks.iter_mut() {
            let prev = previous.and_then(|p| p.group_networks.get(key));
            let Some(subnet) = self.subnets.get_mut(&vip.network_id) else {
                let was_linked = prev.is_some_and(|v| v.network_id == vip.network_id);
                correct &= dangling(was_linked, GroupNetwork::KIND, key, Subnet::KIND, &vip.network_id);
                dropped.push(key.clone());
                continue;
            };
            subnet.group_networks.insert(key.clone());

            if vip.eip_id.is_empty() {
                continue;
            }
            let Some(eip) = self.floating_ips.get_mut(&vip.eip_id) else {
                let was_linked =
                    prev.is_some_and(|v| v.floating_ip.as_deref() == Some(vip.eip_id.as_str()));
                correct &= dangling(was_linked, GroupNetwork::KIND, key, FloatingIp::KIND, &vip.eip_id);
                continue;
            };
            let holder = eip.nic.clone().or_else(|| eip.group_network.clone());
            match holder {
                Some(other) if other != *key => {
                    warn!(eip = %vip.eip_id, first = %other, second = %key, "Floating IP associated more than once");
                    correct = false;
                }
                Some(_) => {}
                None => {
                    eip.group_network = Some(key.clone());
                    vip.floating_ip = Some(vip.eip_id.clone());
                }
            }
        }
        for key in dropped {
            self.group_networks.remove(&key);
        }
        correct
    }

    /// Load balancer address -> subnet (soft). Addresses on networks
    /// outside any virtual network are dropped.
    fn join_loadbalancer_networks(&mut self) -> bool {
        let mut dropped = Vec::new();
        for (key, lbnet) in self.loadbalancer_networks.iter() {
            match self.subnets.get_mut(&lbnet.network_id) {
                Some(subnet) => {
                    subnet.loadbalancer_networks.insert(key.clone());
                }
                None => {
                    debug!(lbnet = %key, network = %lbnet.network_id, "Load balancer outside virtual networks");
                    dropped.push(key.clone());
                }
            }
        }
        for key in dropped {
            self.loadbalancer_networks.remove(&key);
        }
        true
    }

    /// Listener -> load balancer address (soft) and listener -> ACL (soft).
    /// A load balancer with addresses on several subnets is an error.
    fn join_loadbalancer_listeners(&mut self) -> bool {
        let mut correct = true;
        let mut by_lb: HashMap<String, String> = HashMap::new();
        for (key, lbnet) in self.loadbalancer_networks.iter() {
            if let Some(first) = by_lb.get(&lbnet.loadbalancer_id) {
                warn!(loadbalancer = %lbnet.loadbalancer_id, first = %first, second = %key, "Load balancer on more than one network");
                correct = false;
                continue;
            }
            by_lb.insert(lbnet.loadbalancer_id.clone(), key.clone());
        }

        for (key, listener) in self.loadbalancer_listeners.iter_mut() {
            let Some(lbnet) = by_lb
                .get(&listener.loadbalancer_id)
                .and_then(|k| self.loadbalancer_networks.get_mut(k))
            else {
                continue;
            };
            lbnet.listeners.insert(key.clone());

            if !listener.acl_enabled() || listener.acl_id.is_empty() {
                continue;
            }
            if self.loadbalancer_acls.contains(&listener.acl_id) {
                listener.acl = Some(listener.acl_id.clone());
            } else {
                debug!(listener = %key, acl = %listener.acl_id, "Listener references unknown ACL");
            }
        }
        correct
    }

    /// Per-collection differences against `previous`.
    pub fn diff(&self, previous: &ModelSets) -> ModelDiff {
        let mut sets = BTreeMap::new();
        sets.insert(Vpc::KIND, self.vpcs.diff(&previous.vpcs));
        sets.insert(Subnet::KIND, self.subnets.diff(&previous.subnets));
        sets.insert(Host::KIND, self.hosts.diff(&previous.hosts));
        sets.insert(Instance::KIND, self.instances.diff(&previous.instances));
        sets.insert(SecurityGroup::KIND, self.secgroups.diff(&previous.secgroups));
        sets.insert(SecurityGroupRule::KIND, self.secgroup_rules.diff(&previous.secgroup_rules));
        sets.insert(InstanceNic::KIND, self.nics.diff(&previous.nics));
        sets.insert(
            InstanceSecgroup::KIND,
            self.instance_secgroups.diff(&previous.instance_secgroups),
        );
        sets.insert(FloatingIp::KIND, self.floating_ips.diff(&previous.floating_ips));
        sets.insert(DnsRecord::KIND, self.dns_records.diff(&previous.dns_records));
        sets.insert(RouteTable::KIND, self.route_tables.diff(&previous.route_tables));
        sets.insert(
            NetworkAddress::KIND,
            self.network_addresses.diff(&previous.network_addresses),
        );
        sets.insert(GroupGuest::KIND, self.group_guests.diff(&previous.group_guests));
        sets.insert(GroupNetwork::KIND, self.group_networks.diff(&previous.group_networks));
        sets.insert(
            LoadbalancerNetwork::KIND,
            self.loadbalancer_networks.diff(&previous.loadbalancer_networks),
        );
        sets.insert(
            LoadbalancerListener::KIND,
            self.loadbalancer_listeners.diff(&previous.loadbalancer_listeners),
        );
        sets.insert(
            LoadbalancerAcl::KIND,
            self.loadbalancer_acls.diff(&previous.loadbalancer_acls),
        );
        ModelDiff { sets }
    }

    /// Subnets of a virtual network, in key order.
    pub fn vpc_subnets<'a>(&'a self, vpc: &'a Vpc) -> impl Iterator<Item = &'a Subnet> + 'a {
        vpc.subnets.iter().filter_map(move |k| self.subnets.get(k))
    }

    /// NICs on a subnet, in key order.
    pub fn subnet_nics<'a>(&'a self, subnet: &'a Subnet) -> impl Iterator<Item = &'a InstanceNic> + 'a {
        subnet.nics.iter().filter_map(move |k| self.nics.get(k))
    }

    /// NICs of an instance, in key order.
    pub fn instance_nics<'a>(
        &'a self,
        instance: &'a Instance,
    ) -> impl Iterator<Item = &'a InstanceNic> + 'a {
        instance.nics.iter().filter_map(move |k| self.nics.get(k))
    }

    /// Virtual network a NIC belongs to.
    pub fn nic_vpc(&self, nic: &InstanceNic) -> Option<&Vpc> {
        let subnet = self.subnets.get(&nic.network_id)?;
        self.vpcs.get(&subnet.vpc_id)
    }

    /// Host an instance runs on.
    pub fn instance_host(&self, instance: &Instance) -> Option<&Host> {
        instance.host.as_deref().and_then(|h| self.hosts.get(h))
    }

    /// Hosts running at least one NIC of the virtual network.
    pub fn vpc_hosts<'a>(&'a self, vpc: &'a Vpc) -> Vec<&'a Host> {
        let mut host_ids = std::collections::BTreeSet::new();
        for subnet in self.vpc_subnets(vpc) {
            for nic in self.subnet_nics(subnet) {
                let host = nic
                    .instance
                    .as_deref()
                    .and_then(|i| self.instances.get(i))
                    .and_then(|i| i.host.as_deref());
                if let Some(host) = host {
                    host_ids.insert(host);
                }
            }
        }
        host_ids
            .into_iter()
            .filter_map(|h| self.hosts.get(h))
            .collect()
    }

    /// Rules of a security group, in key order.
    pub fn secgroup_rules_of<'a>(
        &'a self,
        secgroup: &'a SecurityGroup,
    ) -> impl Iterator<Item = &'a SecurityGroupRule> + 'a {
        secgroup.rules.iter().filter_map(move |k| self.secgroup_rules.get(k))
    }

    /// Route table of a virtual network.
    pub fn vpc_route_table(&self, vpc: &Vpc) -> Option<&RouteTable> {
        vpc.route_table.as_deref().and_then(|k| self.route_tables.get(k))
    }

    /// Secondary addresses of a NIC, in key order.
    pub fn nic_sub_ips<'a>(
        &'a self,
        nic: &'a InstanceNic,
    ) -> impl Iterator<Item = &'a NetworkAddress> + 'a {
        nic.sub_ips.iter().filter_map(move |k| self.network_addresses.get(k))
    }

    /// Group VIPs on a subnet, in key order.
    pub fn subnet_group_networks<'a>(
        &'a self,
        subnet: &'a Subnet,
    ) -> impl Iterator<Item = &'a GroupNetwork> + 'a {
        subnet.group_networks.iter().filter_map(move |k| self.group_networks.get(k))
    }

    /// Group VIPs an instance may answer for on a subnet.
    pub fn instance_vips<'a>(
        &'a self,
        instance: &'a Instance,
        subnet: &'a Subnet,
    ) -> impl Iterator<Item = &'a GroupNetwork> + 'a {
        self.subnet_group_networks(subnet)
            .filter(move |vip| instance.groups.contains(&vip.group_id))
    }

    /// Load balancer addresses on a subnet, in key order.
    pub fn subnet_loadbalancer_networks<'a>(
        &'a self,
        subnet: &'a Subnet,
    ) -> impl Iterator<Item = &'a LoadbalancerNetwork> + 'a {
        subnet
            .loadbalancer_networks
            .iter()
            .filter_map(move |k| self.loadbalancer_networks.get(k))
    }

    /// Listeners of a load balancer address, in key order.
    pub fn loadbalancer_listeners_of<'a>(
        &'a self,
        lbnet: &'a LoadbalancerNetwork,
    ) -> impl Iterator<Item = &'a LoadbalancerListener> + 'a {
        lbnet
            .listeners
            .iter()
            .filter_map(move |k| self.loadbalancer_listeners.get(k))
    }

    /// ACL applied by a listener, if enabled and known.
    pub fn listener_acl(&self, listener: &LoadbalancerListener) -> Option<&LoadbalancerAcl> {
        listener.acl.as_deref().and_then(|k| self.loadbalancer_acls.get(k))
    }
}
