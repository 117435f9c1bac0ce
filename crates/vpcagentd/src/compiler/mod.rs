//! Pure translation of model records into northbound expressions.

pub mod acl;
pub mod route;

use thiserror::Error;

pub use acl::{
    compile_listener_acl, compile_ports, compile_rule, CompiledAcl, ListenerAcl,
    LISTENER_ALLOW_PRIORITY, LISTENER_DENY_PRIORITY,
};
pub use route::{resolve_routes, ResolvedRoute};

/// Errors from rule and policy compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unknown rule direction {0:?}")]
    Direction(String),

    #[error("unknown rule action {0:?}")]
    Action(String),

    #[error("unknown rule protocol {0:?}")]
    Protocol(String),

    /// Every malformed token of one port list.
    #[error("invalid port tokens: {}", .0.join(", "))]
    InvalidPorts(Vec<String>),

    #[error("unknown listener protocol {0:?}")]
    ListenerProtocol(String),

    #[error("unknown listener acl type {0:?}")]
    ListenerAclType(String),

    #[error("{}", join_errors(.0))]
    Multiple(Vec<CompileError>),
}

fn join_errors(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
