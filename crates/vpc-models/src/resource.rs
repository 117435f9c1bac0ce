//! Generic resource collections.
//!
//! Every orchestration resource kind implements [`Resource`]; a
//! [`ModelSet`] holds the records of one kind keyed by resource ID (or a
//! composite key for join tables).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ModelError, ModelResult};

/// Fields shared by every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMeta {
    pub id: String,
    pub name: String,
    pub updated_at: DateTime<Utc>,
    pub update_version: i64,
    pub deleted: bool,
    pub pending_deleted: bool,
}

impl ResourceMeta {
    /// Logical clock of the record: modification time plus update counter.
    pub fn clock(&self) -> (DateTime<Utc>, i64) {
        (self.updated_at, self.update_version)
    }

    /// Version stamp written to `external_ids:oc-version`.
    pub fn version_stamp(&self) -> String {
        format!(
            "{}.{}",
            self.updated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.update_version
        )
    }

    /// True if the remote record is deleted or pending deletion.
    pub fn is_deleted(&self) -> bool {
        self.deleted || self.pending_deleted
    }
}

/// A remote resource kind.
pub trait Resource: Clone + PartialEq + fmt::Debug + DeserializeOwned + Send + Sync + 'static {
    /// Remote collection name, used as the list endpoint path.
    const KIND: &'static str;

    /// Shared fields.
    fn meta(&self) -> &ResourceMeta;

    /// Collection key.
    fn key(&self) -> String {
        self.meta().id.clone()
    }

    /// Whether the record belongs in the collection at all.
    fn is_usable(&self) -> bool {
        true
    }

    /// Copy of the record with every join reference cleared.
    fn copy_detached(&self) -> Self;
}

/// All live records of one resource kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSet<R> {
    items: BTreeMap<String, R>,
    watermark: Option<DateTime<Utc>>,
}

impl<R> Default for ModelSet<R> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
            watermark: None,
        }
    }
}

impl<R: Resource> ModelSet<R> {
    /// Remote collection name.
    pub const KIND: &'static str = R::KIND;

    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a fetched record and applies it.
    pub fn add_record(&mut self, value: &Value) -> ModelResult<()> {
        let record: R =
            serde_json::from_value(value.clone()).map_err(|e| ModelError::decode(R::KIND, e))?;
        if record.key().is_empty() {
            return Err(ModelError::EmptyKey { kind: R::KIND });
        }
        self.insert(record);
        Ok(())
    }

    /// Applies a record: deleted or unusable records remove the key,
    /// anything else replaces it. Advances the watermark either way.
    pub fn insert(&mut self, record: R) {
        let updated_at = record.meta().updated_at;
        if self.watermark.map_or(true, |w| updated_at > w) {
            self.watermark = Some(updated_at);
        }
        let key = record.key();
        if record.meta().is_deleted() || !record.is_usable() {
            self.items.remove(&key);
        } else {
            self.items.insert(key, record);
        }
    }

    /// Deep copy with all join references cleared.
    pub fn copy_detached(&self) -> Self {
        Self {
            items: self
                .items
                .iter()
                .map(|(k, v)| (k.clone(), v.copy_detached()))
                .collect(),
            watermark: self.watermark,
        }
    }

    /// Largest `updated_at` applied so far.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn get(&self, key: &str) -> Option<&R> {
        self.items.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut R> {
        self.items.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<R> {
        self.items.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &R)> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut R)> {
        self.items.iter_mut()
    }

    pub fn values(&self) -> impl Iterator<Item = &R> {
        self.items.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut R> {
        self.items.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.items.keys()
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut R) -> bool) {
        self.items.retain(f);
    }

    /// Counts records added, updated (by logical clock) and removed
    /// relative to `previous`.
    pub fn diff(&self, previous: &Self) -> SetDiff {
        let mut diff = SetDiff::default();
        for (key, record) in &self.items {
            match previous.items.get(key) {
                None => diff.added += 1,
                Some(old) if old.meta().clock() != record.meta().clock() => diff.updated += 1,
                Some(_) => {}
            }
        }
        diff.removed = previous
            .items
            .keys()
            .filter(|k| !self.items.contains_key(*k))
            .count();
        diff
    }
}

/// Per-collection change counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetDiff {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl SetDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

impl std::ops::AddAssign for SetDiff {
    fn add_assign(&mut self, rhs: Self) {
        self.added += rhs.added;
        self.updated += rhs.updated;
        self.removed += rhs.removed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Vpc;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn vpc(id: &str, at: &str, version: i64) -> Value {
        json!({"id": id, "name": id, "updated_at": at, "update_version": version, "cidr_block": "10.0.0.0/8"})
    }

    #[test]
    fn test_add_record_and_watermark() {
        let mut set = ModelSet::<Vpc>::new();
        set.add_record(&vpc("v1", "2024-01-01T00:00:00Z", 1)).unwrap();
        set.add_record(&vpc("v2", "2024-01-02T00:00:00Z", 1)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.watermark().map(|w| w.to_rfc3339()),
            Some("2024-01-02T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn test_deleted_record_removes_key() {
        let mut set = ModelSet::<Vpc>::new();
        set.add_record(&vpc("v1", "2024-01-01T00:00:00Z", 1)).unwrap();
        let mut gone = vpc("v1", "2024-01-03T00:00:00Z", 2);
        gone["pending_deleted"] = json!(true);
        set.add_record(&gone).unwrap();
        assert!(set.is_empty());
        assert!(set.watermark().is_some());
    }

    #[test]
    fn test_add_record_rejects_empty_key() {
        let mut set = ModelSet::<Vpc>::new();
        assert!(matches!(
            set.add_record(&json!({"name": "x"})),
            Err(ModelError::EmptyKey { kind: "vpcs" })
        ));
        assert!(matches!(
            set.add_record(&json!({"id": 5})),
            Err(ModelError::Decode { .. })
        ));
    }

    #[test]
    fn test_diff() {
        let mut old = ModelSet::<Vpc>::new();
        old.add_record(&vpc("v1", "2024-01-01T00:00:00Z", 1)).unwrap();
        old.add_record(&vpc("v2", "2024-01-01T00:00:00Z", 1)).unwrap();

        let mut new = old.copy_detached();
        new.add_record(&vpc("v1", "2024-01-01T00:00:00Z", 2)).unwrap();
        new.remove("v2");
        new.add_record(&vpc("v3", "2024-01-01T00:00:00Z", 1)).unwrap();

        assert_eq!(
            new.diff(&old),
            SetDiff {
                added: 1,
                updated: 1,
                removed: 1
            }
        );
        assert!(old.diff(&old).is_empty());
    }

    #[test]
    fn test_version_stamp() {
        let meta = ResourceMeta {
            updated_at: "2024-05-06T07:08:09Z".parse().unwrap(),
            update_version: 4,
            ..Default::default()
        };
        assert_eq!(meta.version_stamp(), "2024-05-06T07:08:09.000000Z.4");
    }
}
