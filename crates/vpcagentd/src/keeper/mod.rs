//! Northbound reconciliation.
//!
//! One pass over a published snapshot:
//!
//! 1. **Dump** every managed table.
//! 2. **Mark**: move each row's `oc-version` stamp into an in-memory tag
//!    map, leaving the dumped rows unstamped.
//! 3. **Claim** the desired rows scope by scope (virtual network, subnet,
//!    DNS, host port, NIC, load balancer, group VIPs, route table), one
//!    transaction per scope. A row
//!    that already exists with matching non-zero columns is kept and only
//!    re-stamped when its stamp changed; anything else is created.
//! 4. **Sweep** every dumped row that no claim touched, dependents first.

mod claim;
pub mod names;
mod sweep;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use vpc_models::ModelSets;
use vpc_ovnutil::schema::{from_listing, listing_columns, visit_table, TABLES};
use vpc_ovnutil::{
    Acl, Column, Dns, LogicalRouter, LogicalRouterPort, LogicalRouterStaticRoute, LogicalSwitch,
    LogicalSwitchPort, Nat, NbDatabase, OvnError, OvnNorthbound, Row, TableVisitor, Transaction,
    Uuid,
};

use crate::error::{AgentError, AgentResult};
use names::{parse_oc_ref, EXTERNAL_ID_REF, EXTERNAL_ID_VERSION};

/// Table name plus row UUID.
type RowKey = (&'static str, Uuid);

/// Counters of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeeperStats {
    /// Rows created by claims.
    pub created: usize,
    /// Existing rows whose stamp was rewritten.
    pub stamped: usize,
    /// Existing rows deleted by claims because they no longer matched.
    pub replaced: usize,
    /// Unclaimed rows deleted by the sweep.
    pub swept: usize,
    /// Non-empty transactions committed.
    pub transactions: usize,
}

/// State of one reconciliation pass.
pub struct Keeper {
    db: Arc<dyn NbDatabase>,
    /// Rows as dumped, minus their stamps after [`Keeper::mark`].
    nb: OvnNorthbound,
    /// Stamps found at mark time.
    tags: HashMap<RowKey, String>,
    claimed: HashSet<RowKey>,
    deleted: HashSet<RowKey>,
    /// DHCP_Options row per subnet ID, for the subnet's NIC ports.
    subnet_dhcp: HashMap<String, Uuid>,
    /// `(prefix, nexthop)` of every host route claimed for a NIC.
    host_routes: HashSet<(String, String)>,
    next_id: usize,
    stats: KeeperStats,
}

/// Moves the stamp of every row of one table into the tag map.
struct MarkTable<'a> {
    nb: &'a mut OvnNorthbound,
    tags: &'a mut HashMap<RowKey, String>,
}

impl TableVisitor for MarkTable<'_> {
    type Output = ();

    fn visit<R: Row>(self) {
        for row in R::table_mut(self.nb) {
            if let Some(stamp) = row.remove_external_id(EXTERNAL_ID_VERSION) {
                self.tags.insert((R::TABLE, row.uuid().clone()), stamp);
            }
        }
    }
}

fn router_ports(lr: &LogicalRouter) -> &Vec<Uuid> {
    &lr.ports
}

fn router_routes(lr: &LogicalRouter) -> &Vec<Uuid> {
    &lr.static_routes
}

fn router_nats(lr: &LogicalRouter) -> &Vec<Uuid> {
    &lr.nat
}

fn switch_ports(ls: &LogicalSwitch) -> &Vec<Uuid> {
    &ls.ports
}

fn switch_acls(ls: &LogicalSwitch) -> &Vec<Uuid> {
    &ls.acls
}

fn switch_dns(ls: &LogicalSwitch) -> &Vec<Uuid> {
    &ls.dns_records
}

impl Keeper {
    /// Dumps every managed table.
    pub async fn dump(db: Arc<dyn NbDatabase>) -> AgentResult<Self> {
        let nb = OvnNorthbound::dump(db.as_ref()).await?;
        debug!(rows = nb.len(), "Northbound dumped");
        Ok(Self {
            db,
            nb,
            tags: HashMap::new(),
            claimed: HashSet::new(),
            deleted: HashSet::new(),
            subnet_dhcp: HashMap::new(),
            host_routes: HashSet::new(),
            next_id: 0,
            stats: KeeperStats::default(),
        })
    }

    /// Strips every stamp from the dumped rows, remembering it.
    pub fn mark(&mut self) {
        self.tags.clear();
        for table in TABLES {
            visit_table(
                table,
                MarkTable {
                    nb: &mut self.nb,
                    tags: &mut self.tags,
                },
            );
        }
        debug!(stamped = self.tags.len(), "Marked northbound rows");
    }

    pub fn stats(&self) -> KeeperStats {
        self.stats
    }

    /// The dumped rows (unstamped once marked).
    pub fn northbound(&self) -> &OvnNorthbound {
        &self.nb
    }

    fn next_row_id(&mut self) -> String {
        self.next_id += 1;
        format!("row{}", self.next_id)
    }

    /// Ensures a row matching `want` exists and carries `stamp`.
    ///
    /// `relations` lists reference columns that must contain the given
    /// children; an existing row only gets the missing ones added. Returns
    /// the row's UUID, symbolic if it is created in `txn`.
    fn claim<R: Row>(
        &mut self,
        txn: &mut Transaction,
        want: R,
        stamp: &str,
        relations: &[(&'static str, Vec<Uuid>)],
    ) -> AgentResult<Uuid> {
        let existing = R::table(&self.nb)
            .iter()
            .find(|row| {
                want.match_non_zeros(row)
                    && !self.deleted.contains(&(R::TABLE, row.uuid().clone()))
            })
            .cloned();

        let Some(row) = existing else {
            self.delete_same_name::<R>(txn, &want, None);
            let mut row = want;
            for (column, children) in relations {
                for child in children {
                    row.add_value(column, child.as_str())
                        .map_err(|e| OvnError::decode(R::TABLE, *column, e))?;
                }
            }
            row.set_external_id(EXTERNAL_ID_VERSION, stamp);
            let id = self.next_row_id();
            let uuid = txn.create(&row, &id);
            self.stats.created += 1;
            return Ok(uuid);
        };

        let uuid = row.uuid().clone();
        let key = (R::TABLE, uuid.clone());
        self.claimed.insert(key.clone());

        for (column, children) in relations {
            let present = match row.column(column) {
                Some(value) => <Vec<Uuid> as Column>::decode(&value)
                    .map_err(|e| OvnError::decode(R::TABLE, *column, e))?,
                None => Vec::new(),
            };
            let missing: Vec<Uuid> = children
                .iter()
                .filter(|c| !present.contains(c))
                .cloned()
                .collect();
            txn.add(R::TABLE, uuid.as_str(), column, &missing);
        }

        if self.tags.get(&key).map(String::as_str) != Some(stamp) {
            txn.set_external_id(R::TABLE, uuid.as_str(), EXTERNAL_ID_VERSION, stamp);
            self.tags.insert(key, stamp.to_string());
            self.stats.stamped += 1;
        }

        self.delete_same_name::<R>(txn, &row, Some(&uuid));
        Ok(uuid)
    }

    /// Deletes unclaimed rows sharing `want`'s name, except `keep`.
    fn delete_same_name<R: Row>(&mut self, txn: &mut Transaction, want: &R, keep: Option<&Uuid>) {
        let Some(name) = want.index_name() else {
            return;
        };
        let stale: Vec<Uuid> = R::table(&self.nb)
            .iter()
            .filter(|row| row.index_name() == Some(name) && Some(row.uuid()) != keep)
            .filter(|row| !self.claimed.contains(&(R::TABLE, row.uuid().clone())))
            .map(|row| row.uuid().clone())
            .collect();
        for uuid in stale {
            if self.delete::<R>(txn, &uuid) {
                debug!(table = R::TABLE, name, uuid = %uuid, "Replacing stale row");
                self.stats.replaced += 1;
            }
        }
    }

    /// Deletes a dumped row in the way its table requires. Returns false if
    /// the row was already deleted in this pass.
    fn delete<R: Row>(&mut self, txn: &mut Transaction, uuid: &Uuid) -> bool {
        if !self.deleted.insert((R::TABLE, uuid.clone())) {
            return false;
        }
        let owner = self
            .nb
            .get::<R>(uuid)
            .and_then(|row| row.external_id(EXTERNAL_ID_REF))
            .map(str::to_string);
        match R::TABLE {
            LogicalSwitchPort::TABLE => txn.lsp_del(uuid.as_str()),
            LogicalRouterPort::TABLE => txn.lrp_del(uuid.as_str()),
            LogicalRouterStaticRoute::TABLE => self.detach::<LogicalRouter>(
                txn,
                "static_routes",
                uuid,
                owner.as_deref(),
                router_routes,
            ),
            Nat::TABLE => {
                self.detach::<LogicalRouter>(txn, "nat", uuid, owner.as_deref(), router_nats)
            }
            Acl::TABLE => {
                self.detach::<LogicalSwitch>(txn, "acls", uuid, owner.as_deref(), switch_acls)
            }
            Dns::TABLE => {
                self.detach::<LogicalSwitch>(txn, "dns_records", uuid, None, switch_dns);
                txn.destroy(R::TABLE, uuid.as_str());
            }
            _ => txn.destroy(R::TABLE, uuid.as_str()),
        }
        true
    }

    /// Removes `child` from `column` of its owner named by `owner_ref` and of
    /// every other dumped row of `P` that references it.
    fn detach<P: Row>(
        &self,
        txn: &mut Transaction,
        column: &str,
        child: &Uuid,
        owner_ref: Option<&str>,
        refs: fn(&P) -> &Vec<Uuid>,
    ) {
        let mut owners: Vec<Uuid> = P::table(&self.nb)
            .iter()
            .filter(|p| refs(p).contains(child))
            .map(|p| p.uuid().clone())
            .collect();
        let named = owner_ref
            .and_then(parse_oc_ref)
            .filter(|(table, _)| *table == P::TABLE)
            .and_then(|(_, name)| self.nb.get_by_name::<P>(name));
        if let Some(owner) = named {
            if !owners.contains(owner.uuid()) {
                owners.push(owner.uuid().clone());
            }
        }
        for owner in owners {
            txn.remove(P::TABLE, owner.as_str(), column, &[child.clone()]);
        }
    }

    /// Adds `child` to `column` of the row of `P` named `parent` unless the
    /// dump shows it already there.
    fn attach<P: Row>(
        &self,
        txn: &mut Transaction,
        parent: &str,
        column: &str,
        child: &Uuid,
        refs: fn(&P) -> &Vec<Uuid>,
    ) {
        if let Some(p) = self.nb.get_by_name::<P>(parent) {
            let live = !self.deleted.contains(&(P::TABLE, p.uuid().clone()));
            if live && refs(p).contains(child) {
                return;
            }
        }
        txn.add(P::TABLE, parent, column, &[child.clone()]);
    }

    /// Commits a scope's transaction.
    async fn commit(&mut self, txn: Transaction, scope: &str, id: &str) -> AgentResult<()> {
        if txn.is_empty() {
            return Ok(());
        }
        debug!(scope, id, commands = txn.len(), "Committing");
        self.db.transact(&txn).await?;
        self.stats.transactions += 1;
        Ok(())
    }

    /// Re-lists one table after a commit to learn created UUIDs.
    async fn relist<R: Row>(&self) -> AgentResult<Vec<R>> {
        let text = self.db.list(R::TABLE, &listing_columns::<R>()).await?;
        Ok(from_listing(&text)?)
    }

    /// UUID of the committed row matching `want`.
    async fn resolve<R: Row>(&self, want: &R) -> AgentResult<Uuid> {
        self.relist::<R>()
            .await?
            .into_iter()
            .find(|row| want.match_non_zeros(row))
            .map(|row| row.uuid().clone())
            .ok_or_else(|| AgentError::internal(format!("{} row vanished after commit", R::TABLE)))
    }
}

/// Runs one full dump, mark, claim and sweep pass.
#[instrument(skip_all, fields(records = sets.len()))]
pub async fn reconcile(db: Arc<dyn NbDatabase>, sets: &ModelSets) -> AgentResult<KeeperStats> {
    let mut keeper = Keeper::dump(db).await?;
    keeper.mark();
    keeper.claim_all(sets).await?;
    keeper.sweep().await?;
    let stats = keeper.stats();
    info!(
        created = stats.created,
        stamped = stats.stamped,
        replaced = stats.replaced,
        swept = stats.swept,
        transactions = stats.transactions,
        "Reconciled northbound"
    );
    Ok(stats)
}
