//! Typed rows for the OVN northbound tables the agent manages.
//!
//! Each table is declared once with [`ovn_table!`], which generates the row
//! struct and its [`Row`] implementation. The declaration maps OVSDB column
//! names onto Rust fields; column names that are Rust keywords (`type`,
//! `match`) get a different field name.

use crate::error::{OvnError, OvnResult};
use crate::northbound::OvnNorthbound;
use crate::value::{split_assignment, Atom, Column, Uuid, ValueError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Map-valued column type.
pub type Map = BTreeMap<String, String>;

/// Common behaviour of every northbound row type.
pub trait Row: Clone + Default + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// OVSDB table name.
    const TABLE: &'static str;

    /// Root tables survive without being referenced; others are
    /// garbage-collected by the server once unreferenced.
    const IS_ROOT: bool;

    /// Column names in declaration order, excluding `_uuid`.
    const COLUMNS: &'static [&'static str];

    /// Row UUID (empty for rows not yet created).
    fn uuid(&self) -> &Uuid;

    /// Replaces the row UUID.
    fn set_uuid(&mut self, uuid: Uuid);

    /// Decodes `value` into the named column.
    fn set_column(&mut self, name: &str, value: &Value) -> Result<(), ValueError>;

    /// Encodes the named column.
    fn column(&self, name: &str) -> Option<Value>;

    /// Renders all non-empty columns as `create` tokens.
    fn to_args(&self) -> Vec<String>;

    /// Applies one `column=value` or `column:key=value` token.
    fn apply_arg(&mut self, token: &str) -> Result<(), ValueError>;

    /// Applies one value of `add <table> <row> <column> <value>`.
    fn add_value(&mut self, column: &str, text: &str) -> Result<(), ValueError>;

    /// Applies one value of `remove <table> <row> <column> <value>`.
    fn remove_value(&mut self, column: &str, text: &str) -> Result<(), ValueError>;

    /// True if every non-zero column of `self` equals the same column of
    /// `candidate`. Maps match as subsets.
    fn match_non_zeros(&self, candidate: &Self) -> bool;

    /// The `external_ids` column.
    fn external_ids(&self) -> &Map;

    /// Mutable `external_ids`.
    fn external_ids_mut(&mut self) -> &mut Map;

    /// UUIDs of rows referenced by this row.
    fn references(&self) -> Vec<&Uuid>;

    /// Mutable UUID references, used to resolve `@name` references.
    fn references_mut(&mut self) -> Vec<&mut Uuid>;

    /// Value of the indexed `name` column for tables that have one.
    fn index_name(&self) -> Option<&str> {
        None
    }

    /// Rows of this table inside a dump.
    fn table(db: &OvnNorthbound) -> &Vec<Self>;

    /// Mutable rows of this table inside a dump.
    fn table_mut(db: &mut OvnNorthbound) -> &mut Vec<Self>;

    /// Reads `external_ids:<key>`.
    fn external_id(&self, key: &str) -> Option<&str> {
        self.external_ids().get(key).map(String::as_str)
    }

    /// Writes `external_ids:<key>`.
    fn set_external_id(&mut self, key: &str, value: impl Into<String>) {
        self.external_ids_mut().insert(key.to_string(), value.into());
    }

    /// Removes `external_ids:<key>`, returning the old value.
    fn remove_external_id(&mut self, key: &str) -> Option<String> {
        self.external_ids_mut().remove(key)
    }

    /// Encodes the full row as a `{column: value}` JSON object.
    fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("_uuid".to_string(), self.uuid().to_json());
        for name in Self::COLUMNS {
            if let Some(v) = self.column(name) {
                obj.insert((*name).to_string(), v);
            }
        }
        Value::Object(obj)
    }
}

macro_rules! ovn_table {
    (
        $(#[$meta:meta])*
        $ty:ident => $table:literal, root = $root:literal, field = $dbfield:ident
        $(, index = $index:ident)?
        {
            $( $(#[$fmeta:meta])* $col:literal => $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $ty {
            /// Row UUID.
            pub uuid: Uuid,
            $( $(#[$fmeta])* pub $field: $fty, )*
        }

        impl Row for $ty {
            const TABLE: &'static str = $table;
            const IS_ROOT: bool = $root;
            const COLUMNS: &'static [&'static str] = &[$($col),*];

            fn uuid(&self) -> &Uuid {
                &self.uuid
            }

            fn set_uuid(&mut self, uuid: Uuid) {
                self.uuid = uuid;
            }

            fn set_column(&mut self, name: &str, value: &Value) -> Result<(), ValueError> {
                match name {
                    "_uuid" => self.uuid = <Uuid as Atom>::from_json(value)?,
                    "_version" => {}
                    $( $col => self.$field = <$fty as Column>::decode(value)?, )*
                    _ => return Err(ValueError::UnknownColumn(name.to_string())),
                }
                Ok(())
            }

            fn column(&self, name: &str) -> Option<Value> {
                match name {
                    "_uuid" => Some(self.uuid.to_json()),
                    $( $col => Some(self.$field.encode()), )*
                    _ => None,
                }
            }

            fn to_args(&self) -> Vec<String> {
                let mut args = Vec::new();
                $( args.extend(self.$field.to_args($col)); )*
                args
            }

            fn apply_arg(&mut self, token: &str) -> Result<(), ValueError> {
                let (lhs, rhs) = split_assignment(token)
                    .ok_or_else(|| ValueError::Argument(token.to_string()))?;
                let (name, key) = match lhs.split_once(':') {
                    Some((name, key)) => (name, Some(key)),
                    None => (lhs, None),
                };
                match (name, key) {
                    $(
                        ($col, Some(key)) => self.$field.set_key(key, rhs),
                        ($col, None) => {
                            self.$field = <$fty as Column>::parse_arg(rhs)?;
                            Ok(())
                        }
                    )*
                    _ => Err(ValueError::UnknownColumn(name.to_string())),
                }
            }

            fn add_value(&mut self, column: &str, text: &str) -> Result<(), ValueError> {
                match column {
                    $( $col => self.$field.add_arg(text), )*
                    _ => Err(ValueError::UnknownColumn(column.to_string())),
                }
            }

            fn remove_value(&mut self, column: &str, text: &str) -> Result<(), ValueError> {
                match column {
                    $( $col => self.$field.remove_arg(text), )*
                    _ => Err(ValueError::UnknownColumn(column.to_string())),
                }
            }

            fn match_non_zeros(&self, candidate: &Self) -> bool {
                (self.uuid.is_empty() || self.uuid == candidate.uuid)
                    $( && self.$field.matches_non_zero(&candidate.$field) )*
            }

            fn external_ids(&self) -> &Map {
                &self.external_ids
            }

            fn external_ids_mut(&mut self) -> &mut Map {
                &mut self.external_ids
            }

            fn references(&self) -> Vec<&Uuid> {
                let mut refs = Vec::new();
                $( refs.extend(self.$field.uuids()); )*
                refs
            }

            fn references_mut(&mut self) -> Vec<&mut Uuid> {
                let mut refs = Vec::new();
                $( refs.extend(self.$field.uuids_mut()); )*
                refs
            }

            $(
                fn index_name(&self) -> Option<&str> {
                    Some(self.$index.as_str())
                }
            )?

            fn table(db: &OvnNorthbound) -> &Vec<Self> {
                &db.$dbfield
            }

            fn table_mut(db: &mut OvnNorthbound) -> &mut Vec<Self> {
                &mut db.$dbfield
            }
        }
    };
}

ovn_table! {
    /// A distributed virtual router.
    LogicalRouter => "Logical_Router", root = true, field = logical_router, index = name {
        "name" => name: String,
        "ports" => ports: Vec<Uuid>,
        "static_routes" => static_routes: Vec<Uuid>,
        "nat" => nat: Vec<Uuid>,
        "enabled" => enabled: Option<bool>,
        "options" => options: Map,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// A distributed virtual switch.
    LogicalSwitch => "Logical_Switch", root = true, field = logical_switch, index = name {
        "name" => name: String,
        "ports" => ports: Vec<Uuid>,
        "acls" => acls: Vec<Uuid>,
        "dns_records" => dns_records: Vec<Uuid>,
        "other_config" => other_config: Map,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// A port on a logical switch.
    LogicalSwitchPort => "Logical_Switch_Port", root = false, field = logical_switch_port, index = name {
        "name" => name: String,
        /// Port type: empty for VIF ports, `router`, `localport`, ...
        "type" => kind: String,
        "options" => options: Map,
        "addresses" => addresses: Vec<String>,
        "port_security" => port_security: Vec<String>,
        "dhcpv4_options" => dhcpv4_options: Option<Uuid>,
        "enabled" => enabled: Option<bool>,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// A port on a logical router.
    LogicalRouterPort => "Logical_Router_Port", root = false, field = logical_router_port, index = name {
        "name" => name: String,
        "mac" => mac: String,
        "networks" => networks: Vec<String>,
        "peer" => peer: Option<String>,
        "options" => options: Map,
        "enabled" => enabled: Option<bool>,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// A static route owned by a logical router.
    LogicalRouterStaticRoute => "Logical_Router_Static_Route", root = false, field = logical_router_static_route {
        "ip_prefix" => ip_prefix: String,
        "nexthop" => nexthop: String,
        "policy" => policy: Option<String>,
        "output_port" => output_port: Option<String>,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// DHCPv4 options referenced by switch ports.
    DhcpOptions => "DHCP_Options", root = true, field = dhcp_options {
        "cidr" => cidr: String,
        "options" => options: Map,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// An access-control entry owned by a logical switch.
    Acl => "ACL", root = false, field = acl {
        "direction" => direction: String,
        "priority" => priority: i64,
        "match" => match_: String,
        "action" => action: String,
        "log" => log: bool,
        "name" => name: Option<String>,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// A NAT rule owned by a logical router.
    Nat => "NAT", root = false, field = nat {
        "type" => kind: String,
        "external_ip" => external_ip: String,
        "logical_ip" => logical_ip: String,
        "logical_port" => logical_port: Option<String>,
        "external_mac" => external_mac: Option<String>,
        "external_ids" => external_ids: Map,
    }
}

ovn_table! {
    /// Static DNS records served to the switches that reference this row.
    Dns => "DNS", root = true, field = dns {
        "records" => records: Map,
        "external_ids" => external_ids: Map,
    }
}

/// Decodes an `ovn-nbctl --format=json list` document into typed rows.
///
/// The document has the shape `{"headings": [...], "data": [[...], ...]}`.
pub fn from_listing<R: Row>(text: &str) -> OvnResult<Vec<R>> {
    let doc: Value =
        serde_json::from_str(text).map_err(|e| OvnError::listing(R::TABLE, e.to_string()))?;
    let headings = doc
        .get("headings")
        .and_then(Value::as_array)
        .ok_or_else(|| OvnError::listing(R::TABLE, "missing headings"))?;
    let data = doc
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| OvnError::listing(R::TABLE, "missing data"))?;

    let headings: Vec<&str> = headings
        .iter()
        .map(|h| {
            h.as_str()
                .ok_or_else(|| OvnError::listing(R::TABLE, "non-string heading"))
        })
        .collect::<OvnResult<_>>()?;

    let mut rows = Vec::with_capacity(data.len());
    for values in data {
        let values = values
            .as_array()
            .ok_or_else(|| OvnError::listing(R::TABLE, "row is not an array"))?;
        if values.len() != headings.len() {
            return Err(OvnError::listing(
                R::TABLE,
                format!("row has {} values for {} headings", values.len(), headings.len()),
            ));
        }
        let mut row = R::default();
        for (name, value) in headings.iter().zip(values) {
            row.set_column(name, value)
                .map_err(|e| OvnError::decode(R::TABLE, *name, e))?;
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Renders rows as an `ovn-nbctl --format=json list` document.
pub fn to_listing<R: Row>(rows: &[R], columns: &[&str]) -> Value {
    let data: Vec<Value> = rows
        .iter()
        .map(|row| {
            Value::Array(
                columns
                    .iter()
                    .map(|c| row.column(c).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .collect();
    serde_json::json!({ "headings": columns, "data": data })
}

/// Column list passed to `--columns=` when listing `R`.
pub fn listing_columns<R: Row>() -> Vec<&'static str> {
    let mut columns = vec!["_uuid"];
    columns.extend_from_slice(R::COLUMNS);
    columns
}

/// Generic operation dispatched on a table name.
pub trait TableVisitor {
    /// Result of the visit.
    type Output;

    /// Called with the row type matching the table name.
    fn visit<R: Row>(self) -> Self::Output;
}

/// Names of all managed tables.
pub const TABLES: &[&str] = &[
    LogicalRouter::TABLE,
    LogicalSwitch::TABLE,
    LogicalSwitchPort::TABLE,
    LogicalRouterPort::TABLE,
    LogicalRouterStaticRoute::TABLE,
    DhcpOptions::TABLE,
    Acl::TABLE,
    Nat::TABLE,
    Dns::TABLE,
];

/// Dispatches `visitor` on the row type of `table`.
pub fn visit_table<V: TableVisitor>(table: &str, visitor: V) -> Option<V::Output> {
    match table {
        LogicalRouter::TABLE => Some(visitor.visit::<LogicalRouter>()),
        LogicalSwitch::TABLE => Some(visitor.visit::<LogicalSwitch>()),
        LogicalSwitchPort::TABLE => Some(visitor.visit::<LogicalSwitchPort>()),
        LogicalRouterPort::TABLE => Some(visitor.visit::<LogicalRouterPort>()),
        LogicalRouterStaticRoute::TABLE => Some(visitor.visit::<LogicalRouterStaticRoute>()),
        DhcpOptions::TABLE => Some(visitor.visit::<DhcpOptions>()),
        Acl::TABLE => Some(visitor.visit::<Acl>()),
        Nat::TABLE => Some(visitor.visit::<Nat>()),
        Dns::TABLE => Some(visitor.visit::<Dns>()),
        _ => None,
    }
}
