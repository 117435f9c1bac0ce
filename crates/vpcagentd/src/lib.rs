//! VPC agent daemon.
//!
//! Keeps the OVN northbound database in step with the virtual networks,
//! subnets, instances and security groups declared by the orchestration
//! API. Two loops cooperate through a watch channel:
//!
//! - [`apihelper::SyncEngine`] pulls the model graph and publishes
//!   immutable snapshots
//! - [`worker::Reconciler`] runs a [`keeper`] pass per snapshot and on a
//!   re-check timer

pub mod apihelper;
pub mod compiler;
pub mod config;
pub mod error;
pub mod keeper;
pub mod worker;

pub use apihelper::{ApiClient, ListPage, ListQuery, ResourceLister, SyncEngine, SyncOutcome};
pub use config::{AgentConfig, Cli};
pub use error::{AgentError, AgentResult};
pub use keeper::{reconcile, Keeper, KeeperStats};
pub use worker::{run_pass, Reconciler};
