//! Semantic Cache
//!
//! Per-stage result store in front of expensive stages. A lookup first tries
//! the exact fingerprint of the normalised input, then scans the most
//! recently used entries of that stage for one whose term vector is at least
//! `similarity_threshold` similar.
//!
//! Entries are immutable once written. The LRU size limit and the TTL are
//! enforced lazily on insert; expired entries are ignored (and dropped) on
//! lookup. Each stage is a separate shard so stages never contend.

pub mod fingerprint;

pub use fingerprint::{TermVector, fingerprint, normalize};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};
use verity_kernel::config::CacheConfig;
use verity_kernel::stage::{StageId, StageOutput};

/// A stored stage result.
#[derive(Debug)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub stage: StageId,
    pub normalized: String,
    pub result: StageOutput,
    pub created_at: Instant,
    vector: TermVector,
}

impl CacheEntry {
    pub fn vector(&self) -> &TermVector {
        &self.vector
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }
}

/// Successful lookup.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: Arc<CacheEntry>,
    pub exact: bool,
    pub similarity: f32,
}

impl CacheHit {
    pub fn output(&self) -> &StageOutput {
        &self.entry.result
    }
}

#[derive(Debug)]
struct Slot {
    entry: Arc<CacheEntry>,
    last_access: Instant,
    tick: u64,
}

/// One stage's entries plus their recency order.
#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, Slot>,
    /// tick -> fingerprint, oldest first
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl Shard {
    fn touch(&mut self, fp: &str) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(slot) = self.entries.get_mut(fp) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            slot.last_access = Instant::now();
            self.recency.insert(tick, fp.to_string());
        }
    }

    fn remove(&mut self, fp: &str) -> Option<Slot> {
        let slot = self.entries.remove(fp)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }

    fn insert(&mut self, entry: Arc<CacheEntry>) {
        self.clock += 1;
        let tick = self.clock;
        let fp = entry.fingerprint.clone();
        self.remove(&fp);
        self.recency.insert(tick, fp.clone());
        self.entries.insert(
            fp,
            Slot {
                entry,
                last_access: Instant::now(),
                tick,
            },
        );
    }

    fn purge_expired(&mut self, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(ttl))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &expired {
            self.remove(fp);
        }
        expired.len()
    }

    fn evict_lru(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries {
            let Some((_, fp)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&fp);
            evicted += 1;
        }
        evicted
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub exact_hits: u64,
    pub similar_hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits + self.similar_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    exact_hits: AtomicU64,
    similar_hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Debug)]
pub struct SemanticCache {
    config: CacheConfig,
    shards: DashMap<StageId, Shard>,
    counters: Counters,
}

impl SemanticCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            shards: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_cacheable(&self, stage: StageId) -> bool {
        self.config.is_cacheable(stage)
    }

    pub fn lookup(&self, stage: StageId, input: &str) -> Option<CacheHit> {
        if !self.is_cacheable(stage) {
            return None;
        }
        let normalized = normalize(input);
        let fp = fingerprint(stage, &normalized);
        let ttl = self.config.ttl();

        let Some(mut shard) = self.shards.get_mut(&stage) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match shard.entries.get(&fp).map(|slot| slot.entry.clone()) {
            Some(entry) if !entry.is_expired(ttl) => {
                shard.touch(&fp);
                self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
                trace!(%stage, "exact cache hit");
                return Some(CacheHit {
                    entry,
                    exact: true,
                    similarity: 1.0,
                });
            }
            Some(_) => {
                shard.remove(&fp);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }

        let probe = TermVector::from_normalized(&normalized);
        let mut best: Option<(f32, Arc<CacheEntry>)> = None;
        if !probe.is_empty() {
            for candidate in shard.recency.values().rev().take(self.config.similarity_window) {
                let Some(slot) = shard.entries.get(candidate) else {
                    continue;
                };
                if slot.entry.is_expired(ttl) {
                    continue;
                }
                let similarity = probe.cosine(&slot.entry.vector);
                if similarity >= self.config.similarity_threshold
                    && best.as_ref().is_none_or(|(s, _)| similarity > *s)
                {
                    best = Some((similarity, slot.entry.clone()));
                }
            }
        }

        match best {
            Some((similarity, entry)) => {
                shard.touch(&entry.fingerprint);
                self.counters.similar_hits.fetch_add(1, Ordering::Relaxed);
                debug!(%stage, similarity, "similar cache hit");
                Some(CacheHit {
                    entry,
                    exact: false,
                    similarity,
                })
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `result` for `input` at `stage`. Returns `false` when the stage
    /// is not cacheable.
    pub fn store(&self, stage: StageId, input: &str, result: StageOutput) -> bool {
        if !self.is_cacheable(stage) || self.config.max_entries_per_stage == 0 {
            return false;
        }
        let normalized = normalize(input);
        let entry = Arc::new(CacheEntry {
            fingerprint: fingerprint(stage, &normalized),
            stage,
            vector: TermVector::from_normalized(&normalized),
            normalized,
            result,
            created_at: Instant::now(),
        });

        let mut shard = self.shards.entry(stage).or_default();
        shard.insert(entry);
        let expired = shard.purge_expired(self.config.ttl());
        let evicted = shard.evict_lru(self.config.max_entries_per_stage);
        drop(shard);

        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        self.counters
            .expirations
            .fetch_add(expired as u64, Ordering::Relaxed);
        self.counters
            .evictions
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            debug!(%stage, evicted, "cache entries evicted");
        }
        true
    }

    /// Entries across all stages, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_for(&self, stage: StageId) -> usize {
        self.shards.get(&stage).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.shards.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            similar_hits: self.counters.similar_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
