//! Integration test infrastructure for the VPC agent
//!
//! Provides:
//! - An in-memory northbound database speaking the agent's transaction format
//! - A scripted, paginated orchestration API
//! - Record builders and a sample topology

pub mod fixtures;
mod lister;
mod memory_nb;

pub use fixtures::*;
pub use lister::StaticLister;
pub use memory_nb::{parse_commands, Command, MemoryNorthbound};
