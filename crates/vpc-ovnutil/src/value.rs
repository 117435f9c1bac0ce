//! Extended-JSON value codec for OVSDB columns.
//!
//! `ovn-nbctl --format=json` renders every column either as a bare scalar or
//! as a tagged pair:
//!
//! ```text
//! "name"                       string
//! 42 / true                    integer / boolean
//! ["uuid", "8f1c..."]          row reference
//! ["set", [a, b, ...]]         multi-valued column (also used for optionals)
//! ["map", [[k, v], ...]]       key/value column
//! ```
//!
//! The [`Column`] trait maps each of these onto a Rust type and provides the
//! mirror encoding used when building `ovn-nbctl` transactions
//! (`field=value`, `field=[a,b]`, `field:key=value`).

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding or parsing a single column value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The JSON value does not have the expected shape.
    #[error("expected {expected}, got {actual}")]
    Mismatch {
        /// Expected kind (e.g. "string", "uuid", "set").
        expected: &'static str,
        /// Compact rendering of the offending value.
        actual: String,
    },

    /// A command argument could not be parsed.
    #[error("malformed argument '{0}'")]
    Argument(String),

    /// The column is not part of the table schema.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    /// A `column:key=value` or `add`/`remove` was applied to a scalar column.
    #[error("column does not accept {0}")]
    Unsupported(&'static str),
}

impl ValueError {
    fn mismatch(expected: &'static str, actual: &Value) -> Self {
        Self::Mismatch {
            expected,
            actual: actual.to_string(),
        }
    }
}

/// Reference to a row, either committed (`8f1c...`) or symbolic (`@name`).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid(String);

impl Uuid {
    /// Wraps a committed row UUID.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self(uuid.into())
    }

    /// Symbolic reference to a row created earlier in the same transaction.
    pub fn named(name: &str) -> Self {
        Self(format!("@{}", name))
    }

    /// Returns true for `@name` references.
    pub fn is_named(&self) -> bool {
        self.0.starts_with('@')
    }

    /// Returns true if no UUID is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the UUID text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uuid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A single OVSDB atom: the element type of scalars, sets and maps.
pub trait Atom: Sized + Clone + PartialEq {
    /// Decodes the atom from its JSON form.
    fn from_json(value: &Value) -> Result<Self, ValueError>;

    /// Encodes the atom to its JSON form.
    fn to_json(&self) -> Value;

    /// Renders the atom as `ovn-nbctl` argument text.
    fn to_arg(&self) -> String;

    /// Parses the atom from `ovn-nbctl` argument text.
    fn from_arg(text: &str) -> Result<Self, ValueError>;

    /// Returns the row reference held by this atom, if any.
    fn as_uuid(&self) -> Option<&Uuid> {
        None
    }

    /// Mutable variant of [`Atom::as_uuid`].
    fn as_uuid_mut(&mut self) -> Option<&mut Uuid> {
        None
    }
}

/// Quotes a string the way OVSDB argument syntax expects.
pub fn quote(s: &str) -> String {
    // JSON string syntax is a strict subset of the OVSDB string syntax.
    Value::String(s.to_string()).to_string()
}

/// Removes one level of OVSDB quoting; bare words pass through unchanged.
pub fn unquote(text: &str) -> Result<String, ValueError> {
    let text = text.trim();
    if text.starts_with('"') {
        serde_json::from_str::<String>(text).map_err(|_| ValueError::Argument(text.to_string()))
    } else {
        Ok(text.to_string())
    }
}

impl Atom for String {
    fn from_json(value: &Value) -> Result<Self, ValueError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ValueError::mismatch("string", value))
    }

    fn to_json(&self) -> Value {
        Value::String(self.clone())
    }

    fn to_arg(&self) -> String {
        quote(self)
    }

    fn from_arg(text: &str) -> Result<Self, ValueError> {
        unquote(text)
    }
}

impl Atom for i64 {
    fn from_json(value: &Value) -> Result<Self, ValueError> {
        value
            .as_i64()
            .ok_or_else(|| ValueError::mismatch("integer", value))
    }

    fn to_json(&self) -> Value {
        Value::from(*self)
    }

    fn to_arg(&self) -> String {
        self.to_string()
    }

    fn from_arg(text: &str) -> Result<Self, ValueError> {
        unquote(text)?
            .parse()
            .map_err(|_| ValueError::Argument(text.to_string()))
    }
}

impl Atom for bool {
    fn from_json(value: &Value) -> Result<Self, ValueError> {
        value
            .as_bool()
            .ok_or_else(|| ValueError::mismatch("boolean", value))
    }

    fn to_json(&self) -> Value {
        Value::Bool(*self)
    }

    fn to_arg(&self) -> String {
        self.to_string()
    }

    fn from_arg(text: &str) -> Result<Self, ValueError> {
        match unquote(text)?.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ValueError::Argument(text.to_string())),
        }
    }
}

impl Atom for Uuid {
    fn from_json(value: &Value) -> Result<Self, ValueError> {
        match value.as_array().map(Vec::as_slice) {
            Some([tag, Value::String(id)]) if tag == "uuid" => Ok(Uuid::new(id.as_str())),
            Some([tag, Value::String(id)]) if tag == "named-uuid" => Ok(Uuid::named(id)),
            _ => Err(ValueError::mismatch("uuid", value)),
        }
    }

    fn to_json(&self) -> Value {
        match self.0.strip_prefix('@') {
            Some(name) => serde_json::json!(["named-uuid", name]),
            None => serde_json::json!(["uuid", self.0]),
        }
    }

    fn to_arg(&self) -> String {
        self.0.clone()
    }

    fn from_arg(text: &str) -> Result<Self, ValueError> {
        let text = unquote(text)?;
        if text.is_empty() {
            return Err(ValueError::Argument(text));
        }
        Ok(Uuid::new(text))
    }

    fn as_uuid(&self) -> Option<&Uuid> {
        Some(self)
    }

    fn as_uuid_mut(&mut self) -> Option<&mut Uuid> {
        Some(self)
    }
}

/// Splits `text` on `sep` outside of quotes, brackets and braces.
pub fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                current.push(c);
            }
            '[' | '{' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            c if c == sep && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Splits `key=value` at the first `=` outside quotes.
pub fn split_assignment(token: &str) -> Option<(&str, &str)> {
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in token.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '=' => return Some((&token[..i], &token[i + 1..])),
            _ => {}
        }
    }
    None
}

fn strip_delimiters<'a>(text: &'a str, open: char, close: char) -> Option<&'a str> {
    text.trim().strip_prefix(open)?.strip_suffix(close)
}

fn set_elements(value: &Value) -> Option<&Vec<Value>> {
    match value.as_array().map(Vec::as_slice) {
        Some([tag, Value::Array(items)]) if tag == "set" => Some(items),
        _ => None,
    }
}

/// A typed OVSDB column.
///
/// Zero values (empty string, 0, false, absent optional, empty set/map) act as
/// wildcards in [`Column::matches_non_zero`].
pub trait Column: Sized + Clone + PartialEq + Default {
    /// Decodes the column from its extended-JSON form.
    fn decode(value: &Value) -> Result<Self, ValueError>;

    /// Encodes the column to its extended-JSON form.
    fn encode(&self) -> Value;

    /// Renders the column as `ovn-nbctl` tokens for `create`/`set`.
    fn to_args(&self, name: &str) -> Vec<String>;

    /// Parses the right-hand side of a `name=value` token.
    fn parse_arg(text: &str) -> Result<Self, ValueError>;

    /// Applies a `name:key=value` token.
    fn set_key(&mut self, _key: &str, _text: &str) -> Result<(), ValueError> {
        Err(ValueError::Unsupported("key assignment"))
    }

    /// Applies one value of an `add` command.
    fn add_arg(&mut self, _text: &str) -> Result<(), ValueError> {
        Err(ValueError::Unsupported("add"))
    }

    /// Applies one value of a `remove` command.
    fn remove_arg(&mut self, _text: &str) -> Result<(), ValueError> {
        Err(ValueError::Unsupported("remove"))
    }

    /// Returns true for the column's zero value.
    fn is_zero(&self) -> bool;

    /// True if `self` is zero or equals `candidate`.
    fn matches_non_zero(&self, candidate: &Self) -> bool {
        self.is_zero() || self == candidate
    }

    /// Row references held by this column.
    fn uuids(&self) -> Vec<&Uuid> {
        Vec::new()
    }

    /// Mutable row references held by this column.
    fn uuids_mut(&mut self) -> Vec<&mut Uuid> {
        Vec::new()
    }
}

macro_rules! scalar_column {
    ($ty:ty, $zero:expr) => {
        impl Column for $ty {
            fn decode(value: &Value) -> Result<Self, ValueError> {
                <$ty as Atom>::from_json(value)
            }

            fn encode(&self) -> Value {
                self.to_json()
            }

            fn to_args(&self, name: &str) -> Vec<String> {
                vec![format!("{}={}", name, self.to_arg())]
            }

            fn parse_arg(text: &str) -> Result<Self, ValueError> {
                <$ty as Atom>::from_arg(text)
            }

            fn is_zero(&self) -> bool {
                let zero: fn(&$ty) -> bool = $zero;
                zero(self)
            }
        }
    };
}

scalar_column!(String, |s| s.is_empty());
scalar_column!(i64, |n| *n == 0);
scalar_column!(bool, |b| !*b);

impl<A: Atom> Column for Option<A> {
    fn decode(value: &Value) -> Result<Self, ValueError> {
        match set_elements(value) {
            Some(items) => match items.as_slice() {
                [] => Ok(None),
                [item] => A::from_json(item).map(Some),
                _ => Err(ValueError::mismatch("optional", value)),
            },
            None => A::from_json(value).map(Some),
        }
    }

    fn encode(&self) -> Value {
        match self {
            Some(atom) => atom.to_json(),
            None => serde_json::json!(["set", []]),
        }
    }

    fn to_args(&self, name: &str) -> Vec<String> {
        match self {
            Some(atom) => vec![format!("{}={}", name, atom.to_arg())],
            None => Vec::new(),
        }
    }

    fn parse_arg(text: &str) -> Result<Self, ValueError> {
        let text = text.trim();
        if text == "[]" {
            return Ok(None);
        }
        A::from_arg(text).map(Some)
    }

    fn is_zero(&self) -> bool {
        self.is_none()
    }

    fn uuids(&self) -> Vec<&Uuid> {
        self.iter().filter_map(Atom::as_uuid).collect()
    }

    fn uuids_mut(&mut self) -> Vec<&mut Uuid> {
        self.iter_mut().filter_map(Atom::as_uuid_mut).collect()
    }
}

impl<A: Atom> Column for Vec<A> {
    fn decode(value: &Value) -> Result<Self, ValueError> {
        match set_elements(value) {
            Some(items) => items.iter().map(A::from_json).collect(),
            // A one-element set is rendered as the bare atom.
            None => A::from_json(value).map(|atom| vec![atom]),
        }
    }

    fn encode(&self) -> Value {
        match self.as_slice() {
            [atom] => atom.to_json(),
            atoms => serde_json::json!(["set", atoms.iter().map(Atom::to_json).collect::<Vec<_>>()]),
        }
    }

    fn to_args(&self, name: &str) -> Vec<String> {
        if self.is_empty() {
            return Vec::new();
        }
        let items: Vec<String> = self.iter().map(Atom::to_arg).collect();
        vec![format!("{}=[{}]", name, items.join(","))]
    }

    fn parse_arg(text: &str) -> Result<Self, ValueError> {
        let inner = strip_delimiters(text, '[', ']').unwrap_or(text);
        split_top_level(inner, ',')
            .iter()
            .map(|item| A::from_arg(item))
            .collect()
    }

    fn add_arg(&mut self, text: &str) -> Result<(), ValueError> {
        for atom in Self::parse_arg(text)? {
            if !self.contains(&atom) {
                self.push(atom);
            }
        }
        Ok(())
    }

    fn remove_arg(&mut self, text: &str) -> Result<(), ValueError> {
        let atoms = Self::parse_arg(text)?;
        self.retain(|a| !atoms.contains(a));
        Ok(())
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn matches_non_zero(&self, candidate: &Self) -> bool {
        self.is_empty()
            || (self.len() == candidate.len() && self.iter().all(|a| candidate.contains(a)))
    }

    fn uuids(&self) -> Vec<&Uuid> {
        self.iter().filter_map(Atom::as_uuid).collect()
    }

    fn uuids_mut(&mut self) -> Vec<&mut Uuid> {
        self.iter_mut().filter_map(Atom::as_uuid_mut).collect()
    }
}

fn map_key_arg(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

impl Column for BTreeMap<String, String> {
    fn decode(value: &Value) -> Result<Self, ValueError> {
        let pairs = match value.as_array().map(Vec::as_slice) {
            Some([tag, Value::Array(pairs)]) if tag == "map" => pairs,
            _ => return Err(ValueError::mismatch("map", value)),
        };
        let mut map = BTreeMap::new();
        for pair in pairs {
            match pair.as_array().map(Vec::as_slice) {
                Some([k, v]) => {
                    map.insert(String::from_json(k)?, String::from_json(v)?);
                }
                _ => return Err(ValueError::mismatch("map pair", pair)),
            }
        }
        Ok(map)
    }

    fn encode(&self) -> Value {
        let pairs: Vec<Value> = self
            .iter()
            .map(|(k, v)| serde_json::json!([k, v]))
            .collect();
        serde_json::json!(["map", pairs])
    }

    fn to_args(&self, name: &str) -> Vec<String> {
        self.iter()
            .map(|(k, v)| format!("{}:{}={}", name, map_key_arg(k), quote(v)))
            .collect()
    }

    fn parse_arg(text: &str) -> Result<Self, ValueError> {
        let inner = strip_delimiters(text, '{', '}')
            .ok_or_else(|| ValueError::Argument(text.to_string()))?;
        let mut map = BTreeMap::new();
        for item in split_top_level(inner, ',') {
            let (k, v) =
                split_assignment(&item).ok_or_else(|| ValueError::Argument(item.clone()))?;
            map.insert(unquote(k)?, unquote(v)?);
        }
        Ok(map)
    }

    fn set_key(&mut self, key: &str, text: &str) -> Result<(), ValueError> {
        self.insert(unquote(key)?, unquote(text)?);
        Ok(())
    }

    fn add_arg(&mut self, text: &str) -> Result<(), ValueError> {
        let (k, v) = split_assignment(text).ok_or_else(|| ValueError::Argument(text.to_string()))?;
        // OVSDB `add` never overwrites an existing key.
        self.entry(unquote(k)?).or_insert(unquote(v)?);
        Ok(())
    }

    fn remove_arg(&mut self, text: &str) -> Result<(), ValueError> {
        match split_assignment(text) {
            Some((k, v)) => {
                let (k, v) = (unquote(k)?, unquote(v)?);
                if self.get(&k) == Some(&v) {
                    self.remove(&k);
                }
            }
            None => {
                self.remove(&unquote(text)?);
            }
        }
        Ok(())
    }

    fn is_zero(&self) -> bool {
        self.is_empty()
    }

    fn matches_non_zero(&self, candidate: &Self) -> bool {
        self.iter().all(|(k, v)| candidate.get(k) == Some(v))
    }
}
