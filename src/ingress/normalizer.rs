//! Ingress normalizer
//!
//! Deduplicates, canonicalizes and hydrates observations. The dedup cache is
//! a fixed-shard LRU keyed by (chain, hash): lookups are cheap and concurrent
//! across shards while state transitions for one transaction serialize on its
//! shard lock. Eviction is by recency plus a per-chain TTL sweep; a duplicate
//! arriving after eviction becomes a new observation, which downstream
//! evaluators tolerate by being idempotent over fingerprints.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256};
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::{self, MonoTime};
use crate::error::MipResult;
use crate::metrics;
use crate::models::{ObservationPayload, PendingObservation, PendingTx};
use crate::registry::ChainRegistry;
use crate::rpc::RpcClient;

/// Fixed shard count for the dedup cache.
const SHARDS: usize = 16;

/// Hydration retry schedule: first retry after 500 ms, second after 1 s.
const HYDRATION_RETRIES: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(1)];

type DedupKey = (u32, B256);

#[derive(Debug, Default)]
pub struct NormalizerStats {
    pub ingested: AtomicU64,
    pub duplicates: AtomicU64,
    pub hydration_failures: AtomicU64,
    pub replaced: AtomicU64,
    pub confirmed: AtomicU64,
    pub pruned: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizerStatsSnapshot {
    pub ingested: u64,
    pub duplicates: u64,
    pub hydration_failures: u64,
    pub replaced: u64,
    pub confirmed: u64,
    pub pruned: u64,
    pub live: usize,
}

pub struct Normalizer {
    shards: Vec<Mutex<LruCache<DedupKey, PendingTx>>>,
    /// (chain, sender, nonce) -> live hash, for same-nonce replacement.
    by_sender_nonce: DashMap<(u32, Address, u64), B256>,
    /// Per-chain primary RPC for hydrating hash-only observations.
    hydrators: DashMap<u32, Arc<RpcClient>>,
    chains: Arc<ChainRegistry>,
    stats: NormalizerStats,
}

impl Normalizer {
    pub fn new(
        chains: Arc<ChainRegistry>,
        dedup_cap: usize,
        rpc_timeout: Duration,
    ) -> MipResult<Self> {
        let per_shard = (dedup_cap / SHARDS).max(1);
        let shards = (0..SHARDS)
            .map(|_| {
                Mutex::new(LruCache::new(
                    NonZeroUsize::new(per_shard).expect("per_shard >= 1"),
                ))
            })
            .collect();

        let hydrators = DashMap::new();
        for chain in chains.snapshot().iter() {
            if let Some(url) = chain.primary_endpoint() {
                hydrators.insert(chain.id, Arc::new(RpcClient::new(url, rpc_timeout)?));
            }
        }

        Ok(Self {
            shards,
            by_sender_nonce: DashMap::new(),
            hydrators,
            chains,
            stats: NormalizerStats::default(),
        })
    }

    fn shard(&self, key: &DedupKey) -> &Mutex<LruCache<DedupKey, PendingTx>> {
        // Hash bytes are uniform already; fold a few in.
        let h = key.1.as_slice();
        let idx = (key.0 as usize ^ h[0] as usize ^ ((h[1] as usize) << 8)) % SHARDS;
        &self.shards[idx]
    }

    /// Ingest one observation. Returns the canonical transaction on first
    /// sight, `None` on duplicate (or when hydration failed and the
    /// observation was dropped).
    pub async fn ingest(&self, obs: PendingObservation) -> Option<PendingTx> {
        let key = (obs.chain, obs.hash);

        // Fast duplicate path: touch last_seen and bail.
        {
            let mut shard = self.shard(&key).lock();
            if let Some(live) = shard.get_mut(&key) {
                live.observe_again(obs.seen_at);
                drop(shard);
                self.count_duplicate(obs.chain);
                return None;
            }
        }

        // First sight: canonicalize (possibly hydrating over the network,
        // without any shard lock held).
        let tx = match obs.payload {
            ObservationPayload::Canonical(tx) => *tx,
            ObservationPayload::Raw(raw) => {
                PendingTx::from_raw(*raw, obs.chain, obs.source, obs.seen_at)
            }
            ObservationPayload::HashOnly => {
                match self.hydrate(obs.chain, obs.hash).await {
                    Some(raw) => PendingTx::from_raw(raw, obs.chain, obs.source, obs.seen_at),
                    None => return None,
                }
            }
        };

        self.admit(key, tx, obs.seen_at)
    }

    /// Serialize the insert; a racing hydrator for the same hash loses here
    /// and counts as a duplicate.
    fn admit(&self, key: DedupKey, tx: PendingTx, seen_at: MonoTime) -> Option<PendingTx> {
        let replaced = {
            let mut shard = self.shard(&key).lock();
            if let Some(live) = shard.get_mut(&key) {
                live.observe_again(seen_at);
                drop(shard);
                self.count_duplicate(key.0);
                return None;
            }
            shard.push(key, tx.clone());
            // Same-nonce replacement: a different live hash for this
            // (chain, sender, nonce) is superseded.
            let idx_key = (tx.chain, tx.from, tx.nonce);
            match self.by_sender_nonce.insert(idx_key, tx.hash) {
                Some(old_hash) if old_hash != tx.hash => Some((tx.chain, old_hash)),
                _ => None,
            }
        };

        if let Some(old_key) = replaced {
            let mut shard = self.shard(&old_key).lock();
            if shard.pop(&old_key).is_some() {
                self.stats.replaced.fetch_add(1, Ordering::Relaxed);
                debug!(chain = old_key.0, hash = %old_key.1, "evicted replaced-by-nonce tx");
            }
        }

        self.stats.ingested.fetch_add(1, Ordering::Relaxed);
        Some(tx)
    }

    /// Transition a transaction out of the live window once confirmed.
    pub fn mark_confirmed(&self, chain: u32, hash: B256) {
        let key = (chain, hash);
        let popped = self.shard(&key).lock().pop(&key);
        if let Some(tx) = popped {
            self.by_sender_nonce
                .remove_if(&(tx.chain, tx.from, tx.nonce), |_, h| *h == hash);
            self.stats.confirmed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// TTL sweep. Entries older than their chain's pending TTL are dropped.
    pub fn prune(&self, now: MonoTime) {
        let chains = self.chains.snapshot();
        let mut pruned = 0u64;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let expired: Vec<DedupKey> = guard
                .iter()
                .filter(|(key, tx)| {
                    let ttl = chains
                        .get(key.0)
                        .map(|c| c.pending_ttl)
                        .unwrap_or(Duration::from_secs(300));
                    clock::add(tx.first_seen, ttl) <= now
                })
                .map(|(key, _)| *key)
                .collect();
            for key in expired {
                if let Some(tx) = guard.pop(&key) {
                    self.by_sender_nonce
                        .remove_if(&(tx.chain, tx.from, tx.nonce), |_, h| *h == key.1);
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            self.stats.pruned.fetch_add(pruned, Ordering::Relaxed);
            debug!(pruned, "ttl sweep");
        }
    }

    async fn hydrate(&self, chain: u32, hash: B256) -> Option<crate::models::RawTransaction> {
        let Some(rpc) = self.hydrators.get(&chain).map(|r| r.clone()) else {
            warn!(chain, "no hydration endpoint configured");
            self.count_hydration_failure(chain);
            return None;
        };

        let mut last_err = String::from("not found");
        for (attempt, delay) in std::iter::once(None)
            .chain(HYDRATION_RETRIES.iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = delay {
                tokio::time::sleep(*delay).await;
            }
            match rpc.get_transaction_by_hash(hash).await {
                Ok(Some(raw)) => return Some(raw),
                Ok(None) => {
                    // Provider hasn't seen it (yet); worth one more try.
                    last_err = "not found".to_string();
                }
                Err(e) => {
                    last_err = e.to_string();
                    debug!(chain, %hash, attempt, error = %last_err, "hydration attempt failed");
                }
            }
        }

        warn!(chain, %hash, error = %last_err, "dropping observation: hydration failed");
        self.count_hydration_failure(chain);
        None
    }

    fn count_duplicate(&self, chain: u32) {
        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        metrics::inc1(metrics::NORMALIZER_DUPLICATES, "chain", chain.to_string());
    }

    fn count_hydration_failure(&self, chain: u32) {
        self.stats.hydration_failures.fetch_add(1, Ordering::Relaxed);
        metrics::inc1(metrics::NORMALIZER_HYDRATION_FAILURES, "chain", chain.to_string());
    }

    pub fn live_len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn contains(&self, chain: u32, hash: B256) -> bool {
        let key = (chain, hash);
        self.shard(&key).lock().peek(&key).is_some()
    }

    pub fn stats(&self) -> NormalizerStatsSnapshot {
        NormalizerStatsSnapshot {
            ingested: self.stats.ingested.load(Ordering::Relaxed),
            duplicates: self.stats.duplicates.load(Ordering::Relaxed),
            hydration_failures: self.stats.hydration_failures.load(Ordering::Relaxed),
            replaced: self.stats.replaced.load(Ordering::Relaxed),
            confirmed: self.stats.confirmed.load(Ordering::Relaxed),
            pruned: self.stats.pruned.load(Ordering::Relaxed),
            live: self.live_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainCfg, ChainFeatures, EndpointCfg, EndpointRole};
    use crate::models::{ObservationPayload, RawTransaction, SourceId};
    use alloy_primitives::{Bytes, U256};

    fn test_chains() -> Arc<ChainRegistry> {
        let cfg = ChainCfg {
            id: 1,
            name: "testnet".into(),
            block_time_secs: 12.0,
            confirmations: 1,
            endpoints: vec![EndpointCfg {
                url: "https://rpc.invalid".into(),
                role: EndpointRole::Primary,
            }],
            features: ChainFeatures::default(),
            gas_unit: "wei".into(),
            wrapped_native: Address::repeat_byte(0xee),
            native_symbol: "ETH".into(),
            tokens: vec![],
            pending_ttl_secs: 300,
            max_priority_fee_gwei: 500,
        };
        Arc::new(ChainRegistry::from_config(&[cfg]).unwrap())
    }

    fn normalizer() -> Normalizer {
        Normalizer::new(test_chains(), 1 << 20, Duration::from_secs(2)).unwrap()
    }

    fn raw_obs(hash_byte: u8, nonce: u64) -> PendingObservation {
        let hash = B256::repeat_byte(hash_byte);
        let raw = RawTransaction {
            hash,
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(1u64),
            gas: U256::from(21_000u64),
            gas_price: Some(U256::from(5u64)),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
            nonce: U256::from(nonce),
            input: Bytes::new(),
        };
        PendingObservation {
            chain: 1,
            hash,
            payload: ObservationPayload::Raw(Box::new(raw)),
            source: SourceId::new("test"),
            seen_at: clock::now(),
        }
    }

    #[tokio::test]
    async fn dedup_under_burst_emits_exactly_one() {
        let n = normalizer();
        let mut emitted = 0;
        for _ in 0..10_000 {
            if n.ingest(raw_obs(0xaa, 0)).await.is_some() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        let stats = n.stats();
        assert_eq!(stats.duplicates, 9_999);
        assert_eq!(stats.live, 1);
    }

    #[tokio::test]
    async fn duplicate_advances_last_seen() {
        let n = normalizer();
        let first = n.ingest(raw_obs(0xaa, 0)).await.unwrap();
        assert!(n.ingest(raw_obs(0xaa, 0)).await.is_none());
        // Live entry's last_seen moved past the original first_seen.
        let key = (1u32, B256::repeat_byte(0xaa));
        let shard = n.shard(&key);
        let guard = shard.lock();
        let live = guard.peek(&key).unwrap();
        assert!(live.last_seen >= first.first_seen);
        assert!(live.first_seen <= live.last_seen);
    }

    #[tokio::test]
    async fn same_nonce_replacement_evicts_older() {
        let n = normalizer();
        assert!(n.ingest(raw_obs(0xaa, 7)).await.is_some());
        assert!(n.ingest(raw_obs(0xbb, 7)).await.is_some());
        assert!(!n.contains(1, B256::repeat_byte(0xaa)));
        assert!(n.contains(1, B256::repeat_byte(0xbb)));
        assert_eq!(n.stats().replaced, 1);
    }

    #[tokio::test]
    async fn mark_confirmed_removes_from_live_window() {
        let n = normalizer();
        n.ingest(raw_obs(0xaa, 0)).await.unwrap();
        n.mark_confirmed(1, B256::repeat_byte(0xaa));
        assert!(!n.contains(1, B256::repeat_byte(0xaa)));
        // Same hash arriving again is a fresh observation, not a duplicate.
        assert!(n.ingest(raw_obs(0xaa, 0)).await.is_some());
    }

    #[tokio::test]
    async fn prune_honors_ttl() {
        let n = normalizer();
        n.ingest(raw_obs(0xaa, 0)).await.unwrap();
        // Not yet expired.
        n.prune(clock::now());
        assert!(n.contains(1, B256::repeat_byte(0xaa)));
        // Far future: everything is stale.
        n.prune(clock::add(clock::now(), Duration::from_secs(3_600)));
        assert!(!n.contains(1, B256::repeat_byte(0xaa)));
        assert_eq!(n.stats().pruned, 1);
    }
}
