//! Deletion of every dumped row no claim touched.

use tracing::{debug, instrument};
use vpc_ovnutil::{
    Acl, DhcpOptions, Dns, LogicalRouter, LogicalRouterPort, LogicalRouterStaticRoute,
    LogicalSwitch, LogicalSwitchPort, Nat, Row, Transaction, Uuid,
};

use super::Keeper;
use crate::error::AgentResult;

impl Keeper {
    /// Deletes unclaimed rows in one transaction.
    ///
    /// Ports go first, then rows living in a router or switch reference
    /// column, then the root tables.
    #[instrument(skip_all)]
    pub async fn sweep(&mut self) -> AgentResult<()> {
        let mut txn = Transaction::new();
        self.sweep_table::<LogicalSwitchPort>(&mut txn);
        self.sweep_table::<LogicalRouterPort>(&mut txn);
        self.sweep_table::<LogicalRouterStaticRoute>(&mut txn);
        self.sweep_table::<Acl>(&mut txn);
        self.sweep_table::<Nat>(&mut txn);
        self.sweep_table::<LogicalRouter>(&mut txn);
        self.sweep_table::<LogicalSwitch>(&mut txn);
        self.sweep_table::<DhcpOptions>(&mut txn);
        self.sweep_table::<Dns>(&mut txn);
        self.commit(txn, "sweep", "all").await
    }

    fn sweep_table<R: Row>(&mut self, txn: &mut Transaction) {
        let stale: Vec<Uuid> = R::table(&self.nb)
            .iter()
            .map(|row| row.uuid().clone())
            .filter(|uuid| !self.claimed.contains(&(R::TABLE, uuid.clone())))
            .collect();
        for uuid in stale {
            if self.delete::<R>(txn, &uuid) {
                debug!(table = R::TABLE, uuid = %uuid, "Sweeping");
                self.stats.swept += 1;
            }
        }
    }
}
