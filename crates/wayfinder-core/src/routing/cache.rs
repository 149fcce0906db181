//! Response cache with TTL and LRU eviction
//!
//! Entries are keyed by a [`RequestFingerprint`]. The cache is a cost and
//! latency optimisation only: a hit may be stale and callers must not rely on
//! it for consistency.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::llm::GenerateRequest;

/// Cache settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the router consults the cache at all
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction
    pub capacity: usize,
    /// Default time-to-live in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 512,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// SHA-256 over the normalised request and the model it is sent to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    pub fn new(model_id: &str, request: &GenerateRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize(&request.prompt).as_bytes());
        hasher.update(b"\x00");
        hasher.update(normalize(request.system.as_deref().unwrap_or("")).as_bytes());
        hasher.update(b"\x00");
        hasher.update(model_id.as_bytes());
        hasher.update(b"\x00");
        if let Some(temperature) = request.temperature {
            hasher.update(temperature.to_bits().to_le_bytes());
        }
        hasher.update(b"\x00");
        if let Some(max_tokens) = request.max_tokens {
            hasher.update((max_tokens as u64).to_le_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16.min(self.0.len())])
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because they outlived their TTL
    pub expirations: u64,
    /// Current number of entries
    pub entries: usize,
}

impl CacheMetrics {
    /// Calculate hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    tick: u64,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<RequestFingerprint, CacheEntry<V>>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, RequestFingerprint>,
    next_tick: u64,
    metrics: CacheMetrics,
}

impl<V> CacheState<V> {
    fn touch(&mut self, key: &RequestFingerprint) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.clone());
        }
    }

    fn remove(&mut self, key: &RequestFingerprint) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }
}

/// Bounded TTL + LRU cache
#[derive(Debug)]
pub struct ResponseCache<V> {
    capacity: usize,
    default_ttl: Duration,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity,
            default_ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                metrics: CacheMetrics::default(),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.ttl())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState<V>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up an entry; an expired entry is a miss and is evicted
    pub fn get(&self, key: &RequestFingerprint) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();

        let expired = match state.entries.get(key) {
            None => {
                state.metrics.misses += 1;
                return None;
            }
            Some(entry) => now.saturating_duration_since(entry.inserted_at) > entry.ttl,
        };

        if expired {
            state.remove(key);
            state.metrics.expirations += 1;
            state.metrics.misses += 1;
            debug!(fingerprint = %key, "Cache entry expired");
            return None;
        }

        state.touch(key);
        state.metrics.hits += 1;
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Insert with an explicit TTL, evicting the least recently used entry at capacity
    pub fn put(&self, key: RequestFingerprint, value: V, ttl: Duration) {
        if self.capacity == 0 {
            return;
        }

        let mut state = self.lock();
        if state.remove(&key).is_none() {
            while state.entries.len() >= self.capacity {
                let Some((_, oldest)) = state.recency.pop_first() else {
                    break;
                };
                state.entries.remove(&oldest);
                state.metrics.evictions += 1;
                debug!(fingerprint = %oldest, "Cache entry evicted");
            }
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
                tick,
            },
        );
    }

    /// Insert with the default TTL
    pub fn insert(&self, key: RequestFingerprint, value: V) {
        self.put(key, value, self.default_ttl);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.lock();
        CacheMetrics {
            entries: state.entries.len(),
            ..state.metrics
        }
    }
}
