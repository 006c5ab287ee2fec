//! The per-store cache: canonical string keys, three cache classes with
//! different memory pressure, and axis-dependency invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use indexmap::IndexSet;
use parking_lot::Mutex;

use crate::data::{MatrixData, ScalarValue, VectorData};

/// How a cached value is backed, which decides its eviction priority:
/// `MappedData` costs nothing beyond address space, `MemoryData` is heap
/// copies (relayout products and the like), `QueryData` is derived results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheClass {
    MappedData,
    MemoryData,
    QueryData,
}

/// A cached value, shared with every reader that hits the entry.
#[derive(Clone, Debug)]
pub enum CachedData {
    Scalar(ScalarValue),
    Axis(Arc<Vec<String>>),
    Vector(Arc<VectorData>),
    Matrix(Arc<MatrixData>),
    Names(Arc<IndexSet<String>>),
}

struct CacheEntry {
    class: CacheClass,
    data: CachedData,
}

/// Canonical key of a scalar property.
pub fn scalar_cache_key(name: &str) -> String {
    format!(": {}", name)
}

/// Canonical key of an axis.
pub fn axis_cache_key(axis: &str) -> String {
    format!("/ {}", axis)
}

/// Canonical key of a vector property.
pub fn vector_cache_key(axis: &str, name: &str) -> String {
    format!("/ {} : {}", axis, name)
}

/// Canonical key of a matrix property (one layout; the flipped layout is an
/// independent key).
pub fn matrix_cache_key(rows_axis: &str, columns_axis: &str, name: &str) -> String {
    format!("/ {} / {} : {}", rows_axis, columns_axis, name)
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    dependents: HashMap<String, IndexSet<String>>,
}

/// An in-store mapping keyed by the canonical strings above.
pub struct StorageCache {
    state: Mutex<CacheState>,
}

impl Default for StorageCache {
    fn default() -> StorageCache {
        StorageCache::new()
    }
}

impl StorageCache {
    pub fn new() -> StorageCache {
        StorageCache {
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<CachedData> {
        let state = self.state.lock();
        state.entries.get(key).map(|entry| entry.data.clone())
    }

    /// Insert an entry, recording which other keys it depends on; when any
    /// of those is invalidated, this entry goes with it.
    pub fn put(&self, key: &str, class: CacheClass, data: CachedData, depends_on: &[String]) {
        let mut state = self.state.lock();
        state
            .entries
            .insert(key.to_owned(), CacheEntry { class, data });
        for dependency in depends_on {
            state
                .dependents
                .entry(dependency.clone())
                .or_default()
                .insert(key.to_owned());
        }
    }

    /// Drop an entry and, transitively, everything depending on it.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock();
        let mut pending = vec![key.to_owned()];
        while let Some(key) = pending.pop() {
            state.entries.remove(&key);
            if let Some(dependents) = state.dependents.remove(&key) {
                pending.extend(dependents);
            }
        }
    }

    /// Bulk-forget entries by class: exactly one of `clear` (forget that
    /// class) or `keep` (forget everything else) must be given.
    pub fn empty(&self, clear: Option<CacheClass>, keep: Option<CacheClass>) -> Result<()> {
        let kept: Box<dyn Fn(CacheClass) -> bool> = match (clear, keep) {
            (Some(clear), None) => Box::new(move |class| class != clear),
            (None, Some(keep)) => Box::new(move |class| class == keep),
            _ => bail!("exactly one of clear and keep must be specified"),
        };
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| kept(entry.class));
        let remaining: IndexSet<String> = state.entries.keys().cloned().collect();
        for dependents in state.dependents.values_mut() {
            dependents.retain(|key| remaining.contains(key));
        }
        state.dependents.retain(|_, dependents| !dependents.is_empty());
        log::debug!(
            "forgot {} of {} cache entries ({})",
            before - state.entries.len(),
            before,
            match (clear, keep) {
                (Some(clear), _) => format!("clearing {:?}", clear),
                (_, Some(keep)) => format!("keeping {:?}", keep),
                _ => unreachable!("validated above"),
            },
        );
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.dependents.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DynVector;

    fn vector_entry() -> CachedData {
        CachedData::Vector(Arc::new(VectorData::Dense(DynVector::from(vec![1i32, 2]))))
    }

    #[test]
    fn axis_invalidation_cascades() {
        let cache = StorageCache::new();
        let axis = axis_cache_key("cell");
        cache.put(
            &axis,
            CacheClass::MappedData,
            CachedData::Axis(Arc::new(vec!["c1".to_owned()])),
            &[],
        );
        let vector = vector_cache_key("cell", "age");
        cache.put(
            &vector,
            CacheClass::MappedData,
            vector_entry(),
            &[axis.clone()],
        );
        assert!(cache.get(&vector).is_some());
        cache.invalidate(&axis);
        assert!(cache.get(&vector).is_none());
        assert!(cache.get(&axis).is_none());
    }

    #[test]
    fn empty_by_class() {
        let cache = StorageCache::new();
        cache.put("a", CacheClass::MappedData, vector_entry(), &[]);
        cache.put("b", CacheClass::MemoryData, vector_entry(), &[]);
        cache.put("c", CacheClass::QueryData, vector_entry(), &[]);
        assert!(cache.empty(None, None).is_err());
        assert!(cache
            .empty(Some(CacheClass::QueryData), Some(CacheClass::MappedData))
            .is_err());

        cache.empty(Some(CacheClass::QueryData), None).unwrap();
        assert_eq!(cache.len(), 2);
        cache.empty(None, Some(CacheClass::MappedData)).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("a").is_some());
    }
}
