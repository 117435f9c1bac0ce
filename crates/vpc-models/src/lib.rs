//! Resource model graph for the VPC agent.
//!
//! - [`resource`]: the [`Resource`] trait and generic [`ModelSet`] collection
//! - [`records`]: one record type per orchestration resource kind
//! - [`join`]: the [`ModelSets`] snapshot, its join pass and diff
//!
//! A snapshot is built from detached copies of the previous records plus
//! freshly fetched deltas, then joined from scratch. Join references are
//! keys into the snapshot, never owning pointers.

pub mod error;
pub mod join;
pub mod records;
pub mod resource;

pub use error::{ModelError, ModelResult};
pub use join::{ModelDiff, ModelSets};
pub use records::{
    DnsRecord, FloatingIp, GroupGuest, GroupNetwork, Host, Instance, InstanceNic,
    InstanceSecgroup, LoadbalancerAcl, LoadbalancerAclEntry, LoadbalancerListener,
    LoadbalancerNetwork, NetworkAddress, NextHopType, Route, RouteTable, SecurityGroup,
    SecurityGroupRule, Subnet, Vpc,
};
pub use resource::{ModelSet, Resource, ResourceMeta, SetDiff};
