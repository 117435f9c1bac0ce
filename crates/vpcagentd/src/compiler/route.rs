//! Route table resolution.

use tracing::warn;
use vpc_models::{ModelSets, NextHopType, Vpc};

/// A route with a concrete next-hop address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedRoute {
    pub cidr: String,
    pub next_hop: String,
}

/// Resolves the routes of `vpc`'s route table.
///
/// `ip` next hops pass through. `instance` next hops expand to one route
/// per NIC of that instance inside `vpc`; an instance without such NICs
/// yields nothing. Any other next-hop type disables the whole table.
pub fn resolve_routes(sets: &ModelSets, vpc: &Vpc) -> Vec<ResolvedRoute> {
    let Some(table) = sets.vpc_route_table(vpc) else {
        return Vec::new();
    };

    let mut resolved = Vec::new();
    for route in &table.routes {
        match route.next_hop_type {
            NextHopType::Ip => resolved.push(ResolvedRoute {
                cidr: route.cidr.clone(),
                next_hop: route.next_hop_id.clone(),
            }),
            NextHopType::Instance => {
                let Some(instance) = sets.instances.get(&route.next_hop_id) else {
                    continue;
                };
                for nic in sets.instance_nics(instance) {
                    let same_vpc = sets
                        .nic_vpc(nic)
                        .is_some_and(|v| v.meta.id == vpc.meta.id);
                    if same_vpc && !nic.ip_addr.is_empty() {
                        resolved.push(ResolvedRoute {
                            cidr: route.cidr.clone(),
                            next_hop: nic.ip_addr.clone(),
                        });
                    }
                }
            }
            NextHopType::Unsupported => {
                warn!(
                    vpc = %vpc.meta.id,
                    route_table = %table.meta.id,
                    cidr = %route.cidr,
                    "Unsupported next hop type, skipping route table"
                );
                return Vec::new();
            }
        }
    }
    resolved
}
