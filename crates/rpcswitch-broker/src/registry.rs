//! The worker registry: which connections serve which backends.
//!
//! Backends are registered either as a flat list of announcements or, when
//! the policy declares a filter key for the backend, as buckets keyed by
//! the announced filter value.  A backend never uses both shapes at once.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::connection::Connection;
use crate::err::SwitchError;

/// One announcement: a backend served by one connection.
///
/// The owning connection's method table and the registry bucket hold the
/// same `Arc<WorkerMethod>`; the connection itself is referenced weakly so
/// teardown cannot revive it.
#[derive(Debug)]
pub(crate) struct WorkerMethod {
    /// The backend name that was announced.
    pub(crate) method: String,
    /// The connection serving it.
    pub(crate) conn: Weak<Connection>,
    /// Optional documentation from the announcement.
    pub(crate) doc: Option<String>,
    /// Filter key and canonical filter value, when the backend is filtered.
    pub(crate) filter: Option<(String, String)>,
}

/// A backend's entry in the registry.
#[derive(Debug)]
enum Bucket {
    /// Unfiltered backend: all announcements in one rotation list.
    Flat(VecDeque<Arc<WorkerMethod>>),
    /// Filtered backend: a rotation list per canonical filter value.
    Filtered(HashMap<String, VecDeque<Arc<WorkerMethod>>>),
}

/// Registry of all announced backends.
#[derive(Debug, Default)]
pub(crate) struct WorkerRegistry {
    /// Backend name to its bucket.
    buckets: HashMap<String, Bucket>,
}

/// Canonicalize a filter value for use as a bucket key.
///
/// Only defined scalars are usable as filter values.
pub(crate) fn canonical_filter_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

impl WorkerRegistry {
    /// Insert an announcement.
    ///
    /// The announcement's shape (filtered or not) must agree with whatever
    /// shape the backend already has in the registry.
    pub(crate) fn announce(&mut self, wm: Arc<WorkerMethod>) -> Result<(), SwitchError> {
        let filter_value = wm.filter.as_ref().map(|(_, value)| value.clone());
        let entry = self.buckets.entry(wm.method.clone());
        let bucket = match filter_value {
            None => entry.or_insert_with(|| Bucket::Flat(VecDeque::new())),
            Some(_) => entry.or_insert_with(|| Bucket::Filtered(HashMap::new())),
        };
        match (bucket, filter_value) {
            (Bucket::Flat(list), None) => list.push_back(wm),
            (Bucket::Filtered(map), Some(value)) => {
                map.entry(value).or_default().push_back(wm);
            }
            (Bucket::Filtered(_), None) => {
                return Err(SwitchError::BadParam(format!(
                    "backend {} is filtered",
                    wm.method
                )));
            }
            (Bucket::Flat(_), Some(_)) => {
                return Err(SwitchError::BadParam(format!(
                    "backend {} is not filtered",
                    wm.method
                )));
            }
        }
        Ok(())
    }

    /// Remove an announcement, dropping emptied buckets.
    ///
    /// Returns true if the announcement was present.
    pub(crate) fn withdraw(&mut self, wm: &Arc<WorkerMethod>) -> bool {
        let Some(bucket) = self.buckets.get_mut(&wm.method) else {
            return false;
        };
        let removed = match bucket {
            Bucket::Flat(list) => remove_entry(list, wm),
            Bucket::Filtered(map) => {
                let Some((_, value)) = &wm.filter else {
                    return false;
                };
                let Some(list) = map.get_mut(value) else {
                    return false;
                };
                let removed = remove_entry(list, wm);
                if list.is_empty() {
                    map.remove(value);
                }
                removed
            }
        };
        let empty = match self.buckets.get(&wm.method) {
            Some(Bucket::Flat(list)) => list.is_empty(),
            Some(Bucket::Filtered(map)) => map.is_empty(),
            None => false,
        };
        if empty {
            self.buckets.remove(&wm.method);
        }
        removed
    }

    /// Pick a worker for `backend`, optionally within a filter bucket.
    ///
    /// When more than one candidate exists, the list is rotated one place
    /// before picking the candidate whose connection has the smallest
    /// refcount; refcount ties keep post-rotation order.  The effect is
    /// round-robin with a least-loaded preference.
    pub(crate) fn select(
        &mut self,
        backend: &str,
        filter_value: Option<&str>,
    ) -> Option<Arc<WorkerMethod>> {
        let list = match (self.buckets.get_mut(backend)?, filter_value) {
            (Bucket::Flat(list), None) => list,
            (Bucket::Filtered(map), Some(value)) => map.get_mut(value)?,
            _ => return None,
        };
        if list.len() > 1 {
            list.rotate_left(1);
        }
        let mut best: Option<(Arc<WorkerMethod>, usize)> = None;
        for wm in list.iter() {
            let Some(conn) = wm.conn.upgrade() else {
                continue;
            };
            let rc = conn.refcount();
            if best.as_ref().is_none_or(|(_, b)| rc < *b) {
                best = Some((Arc::clone(wm), rc));
            }
        }
        best.map(|(wm, _)| wm)
    }

    /// All announcements for one backend, for introspection.
    pub(crate) fn workers_for(&self, backend: &str) -> Vec<&Arc<WorkerMethod>> {
        match self.buckets.get(backend) {
            Some(Bucket::Flat(list)) => list.iter().collect(),
            Some(Bucket::Filtered(map)) => map.values().flatten().collect(),
            None => Vec::new(),
        }
    }

    /// The backend names currently announced.
    pub(crate) fn backends(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }
}

/// Remove the entry holding exactly `wm` from a rotation list.
fn remove_entry(list: &mut VecDeque<Arc<WorkerMethod>>, wm: &Arc<WorkerMethod>) -> bool {
    let before = list.len();
    list.retain(|entry| !Arc::ptr_eq(entry, wm));
    list.len() != before
}
