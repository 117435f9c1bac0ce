//! Scripted orchestration API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use vpcagentd::{AgentError, AgentResult, ListPage, ListQuery, ResourceLister};

#[derive(Debug, Default)]
struct State {
    collections: BTreeMap<String, Vec<Value>>,
    requests: Vec<(String, ListQuery)>,
    failing: HashSet<String>,
}

/// Serves fixed collections page by page, the way the list endpoints do.
///
/// Without `since` only live records are returned; with `since`, every
/// record updated at or after it, deleted ones included.
#[derive(Debug)]
pub struct StaticLister {
    state: Mutex<State>,
    report_total: bool,
}

impl Default for StaticLister {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            report_total: true,
        }
    }
}

fn record_id(value: &Value) -> Option<&str> {
    value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn updated_at(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

fn is_deleted(value: &Value) -> bool {
    ["deleted", "pending_deleted"]
        .iter()
        .any(|f| value.get(f).and_then(Value::as_bool).unwrap_or(false))
}

impl StaticLister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Omits `total` from every page.
    pub fn without_total(mut self) -> Self {
        self.report_total = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a record to `kind`, replacing the record with the same `id`.
    pub fn put(&self, kind: &str, record: Value) {
        let mut state = self.lock();
        let records = state.collections.entry(kind.to_string()).or_default();
        let existing = record_id(&record)
            .and_then(|id| records.iter().position(|r| record_id(r) == Some(id)));
        match existing {
            Some(index) => records[index] = record,
            None => records.push(record),
        }
    }

    pub fn put_all(&self, records: impl IntoIterator<Item = (&'static str, Value)>) {
        for (kind, record) in records {
            self.put(kind, record);
        }
    }

    /// Every request served, oldest first.
    pub fn requests(&self) -> Vec<(String, ListQuery)> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self, kind: &str) -> usize {
        self.lock().requests.iter().filter(|(k, _)| k == kind).count()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Makes every list of `kind` fail until [`StaticLister::heal`].
    pub fn fail_kind(&self, kind: &str) {
        self.lock().failing.insert(kind.to_string());
    }

    pub fn heal(&self, kind: &str) {
        self.lock().failing.remove(kind);
    }
}

#[async_trait]
impl ResourceLister for StaticLister {
    async fn list(&self, kind: &str, query: &ListQuery) -> AgentResult<ListPage> {
        let mut state = self.lock();
        state.requests.push((kind.to_string(), query.clone()));
        if state.failing.contains(kind) {
            return Err(AgentError::api(
                format!("list {}", kind),
                "HTTP 503 Service Unavailable: maintenance",
            ));
        }

        let matching: Vec<&Value> = state
            .collections
            .get(kind)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| match query.since {
                        Some(since) => updated_at(r).is_some_and(|t| t >= since),
                        None => !is_deleted(r),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let data = matching
            .iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|r| (*r).clone())
            .collect();
        Ok(ListPage {
            data,
            total: self.report_total.then_some(matching.len()),
        })
    }
}
