//! Result cache.
//!
//! Configurations are canonicalized into a key so that reordered fields or
//! fields outside the parameter space never cause a second oracle call.
//! Entries are evicted least-recently-used first. The whole cache can be
//! snapshotted into a key-value store and restored by a later session.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::params::{Configuration, ParameterSpace};
use crate::scoring::ScoredResult;

pub const CACHE_NAMESPACE: &str = "config_optimizer.result_cache";

/// Canonical key of a configuration: known parameters only, every mapping
/// sorted at every level, serialized compactly.
pub fn cache_key(space: &ParameterSpace, cfg: &Configuration) -> String {
    let canonical = canonicalize(&space.canonical(cfg).to_value());
    serde_json::to_string(&canonical).unwrap_or_else(|_| "{}".to_string())
}

fn canonicalize(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub api_calls_saved: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    result: ScoredResult,
    tick: u64,
}

/// Persisted form of the cache, oldest entry first.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub entries: Vec<(String, ScoredResult)>,
    pub hits: u64,
    pub misses: u64,
    pub api_calls_saved: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// LRU map from canonical key to scored result. Hit and miss counters are
/// maintained by the caller, which alone knows whether the cache was consulted.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    next_tick: u64,
    stats: CacheStats,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Looks up `key` and marks it most recently used.
    pub fn get(&mut self, key: &str) -> Option<&ScoredResult> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.to_string());
        Some(&entry.result)
    }

    pub fn put(&mut self, key: String, result: ScoredResult) {
        let tick = self.bump();
        if let Some(old) = self.entries.get_mut(&key) {
            self.order.remove(&old.tick);
            old.tick = tick;
            old.result = result;
            self.order.insert(tick, key);
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(key = %oldest, "evicted cache entry");
        }
        self.order.insert(tick, key.clone());
        self.entries.insert(key, CacheEntry { result, tick });
    }

    pub fn record_hit(&mut self) {
        self.stats.hits += 1;
        self.stats.api_calls_saved += 1;
    }

    pub fn record_miss(&mut self) {
        self.stats.misses += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let entries = self
            .order
            .values()
            .filter_map(|k| self.entries.get(k).map(|e| (k.clone(), e.result.clone())))
            .collect();
        CacheSnapshot {
            entries,
            hits: self.stats.hits,
            misses: self.stats.misses,
            api_calls_saved: self.stats.api_calls_saved,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn from_snapshot(capacity: usize, snap: CacheSnapshot) -> Self {
        let mut cache = Self::new(capacity);
        for (k, v) in snap.entries {
            cache.put(k, v);
        }
        cache.stats = CacheStats {
            hits: snap.hits,
            misses: snap.misses,
            api_calls_saved: snap.api_calls_saved,
        };
        cache
    }

    /// Restores the cache persisted under [`CACHE_NAMESPACE`]. Anything
    /// missing, unreadable, or older than `max_age` yields an empty cache.
    pub fn restore(store: &dyn KvStore, capacity: usize, max_age: Duration) -> Self {
        let raw = match store.get(CACHE_NAMESPACE) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::new(capacity),
            Err(e) => {
                warn!(error = %e, "could not read persisted cache, starting empty");
                return Self::new(capacity);
            }
        };
        let snap: CacheSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "persisted cache is corrupt, starting empty");
                return Self::new(capacity);
            }
        };
        let age_ms = Utc::now().timestamp_millis() - snap.timestamp;
        if age_ms < 0 || age_ms > max_age.num_milliseconds() {
            info!(age_ms, "persisted cache is stale, starting empty");
            return Self::new(capacity);
        }
        let cache = Self::from_snapshot(capacity, snap);
        info!(entries = cache.len(), "restored result cache");
        cache
    }

    pub fn persist(&self, store: &dyn KvStore) -> Result<()> {
        let raw = serde_json::to_string(&self.snapshot())?;
        store.put(CACHE_NAMESPACE, &raw)?;
        debug!(entries = self.len(), "persisted result cache");
        Ok(())
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}

/// Durable string key-value store.
pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn })
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let v = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(v)
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: std::cell::RefCell<HashMap<String, String>>,
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.borrow().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.map.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
