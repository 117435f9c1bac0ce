//! In-memory snapshot of the managed northbound tables.

use crate::error::OvnResult;
use crate::nbctl::NbDatabase;
use crate::schema::{
    from_listing, listing_columns, Acl, DhcpOptions, Dns, LogicalRouter, LogicalRouterPort,
    LogicalRouterStaticRoute, LogicalSwitch, LogicalSwitchPort, Nat, Row,
};
use crate::value::Uuid;
use tracing::debug;

/// One dump of every managed northbound table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OvnNorthbound {
    pub logical_router: Vec<LogicalRouter>,
    pub logical_switch: Vec<LogicalSwitch>,
    pub logical_switch_port: Vec<LogicalSwitchPort>,
    pub logical_router_port: Vec<LogicalRouterPort>,
    pub logical_router_static_route: Vec<LogicalRouterStaticRoute>,
    pub dhcp_options: Vec<DhcpOptions>,
    pub acl: Vec<Acl>,
    pub nat: Vec<Nat>,
    pub dns: Vec<Dns>,
}

impl OvnNorthbound {
    /// Lists every managed table.
    ///
    /// Any listing or decode failure aborts the dump; callers treat the
    /// whole pass as failed.
    pub async fn dump(db: &dyn NbDatabase) -> OvnResult<Self> {
        let mut nb = Self::default();
        nb.logical_router = list_table(db).await?;
        nb.logical_switch = list_table(db).await?;
        nb.logical_switch_port = list_table(db).await?;
        nb.logical_router_port = list_table(db).await?;
        nb.logical_router_static_route = list_table(db).await?;
        nb.dhcp_options = list_table(db).await?;
        nb.acl = list_table(db).await?;
        nb.nat = list_table(db).await?;
        nb.dns = list_table(db).await?;
        debug!(
            routers = nb.logical_router.len(),
            switches = nb.logical_switch.len(),
            switch_ports = nb.logical_switch_port.len(),
            acls = nb.acl.len(),
            "Dumped northbound"
        );
        Ok(nb)
    }

    /// Finds a row by UUID.
    pub fn get<R: Row>(&self, uuid: &Uuid) -> Option<&R> {
        R::table(self).iter().find(|r| r.uuid() == uuid)
    }

    /// Finds a row by its indexed name.
    pub fn get_by_name<R: Row>(&self, name: &str) -> Option<&R> {
        R::table(self).iter().find(|r| r.index_name() == Some(name))
    }

    /// Total row count across all tables.
    pub fn len(&self) -> usize {
        self.logical_router.len()
            + self.logical_switch.len()
            + self.logical_switch_port.len()
            + self.logical_router_port.len()
            + self.logical_router_static_route.len()
            + self.dhcp_options.len()
            + self.acl.len()
            + self.nat.len()
            + self.dns.len()
    }

    /// Returns true if no table has rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn list_table<R: Row>(db: &dyn NbDatabase) -> OvnResult<Vec<R>> {
    let text = db.list(R::TABLE, &listing_columns::<R>()).await?;
    from_listing(&text)
}
