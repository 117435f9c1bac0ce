//! Typed access to the OVN northbound database.
//!
//! - [`value`]: extended-JSON column codec and argument encoding
//! - [`schema`]: row types for the managed tables
//! - [`northbound`]: full-table dumps and lookups
//! - [`txn`]: atomic multi-statement transactions
//! - [`nbctl`]: the `ovn-nbctl` runner behind [`NbDatabase`]
//!
//! # Example
//!
//! ```ignore
//! use vpc_ovnutil::{NbCtl, OvnNorthbound, Transaction, schema::LogicalRouter};
//!
//! let ctl = NbCtl::new("tcp:127.0.0.1:6641");
//! let nb = OvnNorthbound::dump(&ctl).await?;
//!
//! let mut txn = Transaction::new();
//! txn.create(&LogicalRouter { name: "vpc-r-v1".into(), ..Default::default() }, "lr");
//! ctl.transact(&txn).await?;
//! ```

pub mod error;
pub mod nbctl;
pub mod northbound;
pub mod schema;
pub mod txn;
pub mod value;

pub use error::{OvnError, OvnResult};
pub use nbctl::{NbCtl, NbDatabase, OVN_NBCTL_CMD};
pub use northbound::OvnNorthbound;
pub use schema::{
    Acl, DhcpOptions, Dns, LogicalRouter, LogicalRouterPort, LogicalRouterStaticRoute,
    LogicalSwitch, LogicalSwitchPort, Map, Nat, Row, TableVisitor,
};
pub use txn::Transaction;
pub use value::{Atom, Column, Uuid, ValueError};
