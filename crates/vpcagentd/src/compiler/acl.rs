//! Security group rule and listener policy compilation.
//!
//! Matches use the northbound ACL expression language, e.g.
//! `outport == "iface/g1/eth0" && ip4 && tcp && tcp.dst == 22`.

use once_cell::sync::Lazy;
use regex::Regex;
use vpc_models::SecurityGroupRule;

use super::CompileError;

/// Single port or `low-high` range.
static PORT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*(?:-\s*(\d+)\s*)?$").expect("Invalid regex pattern"));

/// Priority of the allow rule of a white-listed listener.
pub const LISTENER_ALLOW_PRIORITY: i64 = 2000;

/// Priority of the catch-all drop rule of a listener policy.
pub const LISTENER_DENY_PRIORITY: i64 = 1000;

/// Lowest priority a compiled security group rule gets.
pub const MIN_RULE_PRIORITY: i64 = 1;

/// ACL row contents produced by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompiledAcl {
    /// `to-lport` or `from-lport`.
    pub direction: String,
    pub priority: i64,
    pub match_: String,
    /// `allow-related` or `drop`.
    pub action: String,
}

fn aggregate(mut errors: Vec<CompileError>) -> CompileError {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        CompileError::Multiple(errors)
    }
}

fn compile_action(action: &str) -> Result<&'static str, CompileError> {
    match action {
        "allow" => Ok("allow-related"),
        "deny" => Ok("drop"),
        other => Err(CompileError::Action(other.to_string())),
    }
}

fn is_any_cidr(cidr: &str) -> bool {
    let cidr = cidr.trim();
    cidr.is_empty() || cidr == "0.0.0.0/0"
}

/// Compiles one security group rule for the switch port `port`.
///
/// Ingress rules (`in`) guard traffic delivered to the port, egress rules
/// (`out`) traffic the port sends. Every malformed part of the rule is
/// reported, not just the first. Priorities below 1 are raised to 1: a zero
/// priority would read as an unset column when matching existing rows.
pub fn compile_rule(rule: &SecurityGroupRule, port: &str) -> Result<CompiledAcl, CompileError> {
    let mut errors = Vec::new();

    let (direction, port_match, cidr_field) = match rule.direction.as_str() {
        "in" => ("to-lport", format!("outport == \"{}\"", port), "ip4.src"),
        "out" => ("from-lport", format!("inport == \"{}\"", port), "ip4.dst"),
        other => {
            errors.push(CompileError::Direction(other.to_string()));
            ("", String::new(), "")
        }
    };

    let action = compile_action(&rule.action).unwrap_or_else(|e| {
        errors.push(e);
        ""
    });

    let mut parts = vec![port_match, "ip4".to_string()];
    if !is_any_cidr(&rule.cidr) {
        parts.push(format!("{} == {}", cidr_field, rule.cidr.trim()));
    }
    match rule.protocol.as_str() {
        "" | "any" => {}
        proto @ ("tcp" | "udp") => {
            parts.push(proto.to_string());
            match compile_ports(proto, &rule.ports) {
                Ok(ports) if !ports.is_empty() => parts.push(ports),
                Ok(_) => {}
                Err(e) => errors.push(e),
            }
        }
        "icmp" => parts.push("icmp4".to_string()),
        other => errors.push(CompileError::Protocol(other.to_string())),
    }

    if !errors.is_empty() {
        return Err(aggregate(errors));
    }
    Ok(CompiledAcl {
        direction: direction.to_string(),
        priority: rule.priority.max(MIN_RULE_PRIORITY),
        match_: parts.join(" && "),
        action: action.to_string(),
    })
}

/// Compiles a comma-separated port list into a destination-port match on
/// `proto`.
///
/// An empty list, `any` or `all` yields an empty expression. Descending
/// ranges are swapped; a range with equal ends is an exact match.
pub fn compile_ports(proto: &str, ports: &str) -> Result<String, CompileError> {
    let ports = ports.trim();
    if ports.is_empty() || ports.eq_ignore_ascii_case("any") || ports.eq_ignore_ascii_case("all")
    {
        return Ok(String::new());
    }

    let mut exprs = Vec::new();
    let mut bad = Vec::new();
    for token in ports.split(',') {
        if token.trim().is_empty() {
            continue;
        }
        match parse_port_token(token) {
            Some((low, high)) if low == high => exprs.push(format!("{}.dst == {}", proto, low)),
            Some((low, high)) => exprs.push(format!(
                "( {p}.dst >= {} && {p}.dst <= {} )",
                low,
                high,
                p = proto
            )),
            None => bad.push(token.trim().to_string()),
        }
    }
    if !bad.is_empty() {
        return Err(CompileError::InvalidPorts(bad));
    }

    Ok(match exprs.len() {
        0 => String::new(),
        1 => exprs.remove(0),
        _ => format!("( {} )", exprs.join(" || ")),
    })
}

fn parse_port_token(token: &str) -> Option<(u16, u16)> {
    let caps = PORT_TOKEN_RE.captures(token)?;
    let low = parse_port(caps.get(1)?.as_str())?;
    let high = match caps.get(2) {
        Some(m) => parse_port(m.as_str())?,
        None => low,
    };
    Some(if low > high { (high, low) } else { (low, high) })
}

fn parse_port(text: &str) -> Option<u16> {
    text.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Source-address policy of a load balancer listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerAcl {
    /// `tcp`, `udp`, `http` or `https`.
    pub protocol: String,
    pub port: u16,
    /// `white` or `black`.
    pub acl_type: String,
    pub cidrs: Vec<String>,
    /// Listener address.
    pub vip: String,
}

/// Compiles a listener's allow/deny list.
///
/// A black list without entries needs no rule. A white list gets an allow
/// rule for its entries plus a lower-priority drop for everything else; an
/// empty white list keeps only the drop.
pub fn compile_listener_acl(listener: &ListenerAcl) -> Result<Vec<CompiledAcl>, CompileError> {
    let mut errors = Vec::new();
    let l4 = match listener.protocol.as_str() {
        "tcp" | "http" | "https" => "tcp",
        "udp" => "udp",
        other => {
            errors.push(CompileError::ListenerProtocol(other.to_string()));
            ""
        }
    };
    let white = match listener.acl_type.as_str() {
        "white" => true,
        "black" => false,
        other => {
            errors.push(CompileError::ListenerAclType(other.to_string()));
            false
        }
    };
    if !errors.is_empty() {
        return Err(aggregate(errors));
    }

    let base = format!(
        "ip4 && ip4.dst == {} && {l4} && {l4}.dst == {}",
        listener.vip,
        listener.port,
        l4 = l4
    );
    let sources = format!("ip4.src == {{{}}}", listener.cidrs.join(", "));

    if white {
        let mut acls = Vec::with_capacity(2);
        if !listener.cidrs.is_empty() {
            acls.push(CompiledAcl {
                direction: "to-lport".to_string(),
                priority: LISTENER_ALLOW_PRIORITY,
                match_: format!("{} && {}", base, sources),
                action: "allow-related".to_string(),
            });
        }
        acls.push(CompiledAcl {
            direction: "to-lport".to_string(),
            priority: LISTENER_DENY_PRIORITY,
            match_: base,
            action: "drop".to_string(),
        });
        Ok(acls)
    } else if listener.cidrs.is_empty() {
        Ok(Vec::new())
    } else {
        Ok(vec![CompiledAcl {
            direction: "to-lport".to_string(),
            priority: LISTENER_DENY_PRIORITY,
            match_: format!("{} && {}", base, sources),
            action: "drop".to_string(),
        }])
    }
}
