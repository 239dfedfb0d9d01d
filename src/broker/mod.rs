//! Opportunity broker
//!
//! Deduplicates, ranks and schedules opportunities ahead of execution.
//! Ranking is confidence x net profit with earliest deadline as the
//! tie-break; dominated and expired entries are dropped with counters. The
//! executor is the single poll consumer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::U256;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::clock::MonoTime;
use crate::metrics;
use crate::models::{Fingerprint, Opportunity, StrategyKind};

/// How many recently seen opportunities the control plane can page through.
const RECENT_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub outer_capacity: usize,
    pub global_inflight_cap: usize,
    pub per_strategy_caps: HashMap<StrategyKind, usize>,
    pub cooldowns: HashMap<StrategyKind, Duration>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            outer_capacity: 4_096,
            global_inflight_cap: 16,
            per_strategy_caps: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }
}

/// What happened to a submitted opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Informational,
    Expired,
    Dominated,
    CooldownRejected,
    CapacityRejected,
}

struct CooldownEntry {
    until: MonoTime,
    prior_estimated_net: U256,
}

#[derive(Default)]
struct BrokerInner {
    queue: Vec<Opportunity>,
    inflight: HashMap<Uuid, StrategyKind>,
    cooldowns: HashMap<Fingerprint, CooldownEntry>,
}

#[derive(Debug, Default)]
struct BrokerStats {
    submitted: AtomicU64,
    accepted: AtomicU64,
    informational: AtomicU64,
    dominated: AtomicU64,
    expired: AtomicU64,
    cooldown_rejects: AtomicU64,
    capacity_rejects: AtomicU64,
    served: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerStatsSnapshot {
    pub submitted: u64,
    pub accepted: u64,
    pub informational: u64,
    pub dominated: u64,
    pub expired: u64,
    pub cooldown_rejects: u64,
    pub capacity_rejects: u64,
    pub served: u64,
    pub pending: usize,
    pub in_flight: usize,
}

pub struct Broker {
    cfg: BrokerConfig,
    inner: Mutex<BrokerInner>,
    recent: Mutex<VecDeque<Opportunity>>,
    stats: BrokerStats,
}

impl Broker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(BrokerInner::default()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAP)),
            stats: BrokerStats::default(),
        }
    }

    fn remember(&self, opp: &Opportunity) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_CAP {
            recent.pop_front();
        }
        recent.push_back(opp.clone());
    }

    fn update_pending_gauge(&self, len: usize) {
        metrics::gauge(metrics::BROKER_PENDING, len as f64);
    }

    /// Insert one opportunity unless it is expired, dominated, cooling down
    /// or over the outer capacity. Informational opportunities are recorded
    /// for the control plane but never scheduled.
    pub fn submit(&self, opp: Opportunity, now: MonoTime) -> SubmitOutcome {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        if opp.is_expired(now) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            metrics::inc(metrics::BROKER_EXPIRED);
            return SubmitOutcome::Expired;
        }

        if opp.is_informational() {
            self.stats.informational.fetch_add(1, Ordering::Relaxed);
            self.remember(&opp);
            return SubmitOutcome::Informational;
        }

        let mut inner = self.inner.lock();

        // Fingerprint cooldown with the 2x-prior-profit override.
        for fp in &opp.fingerprints {
            if let Some(cd) = inner.cooldowns.get(fp) {
                if cd.until > now
                    && opp.net_profit <= cd.prior_estimated_net.saturating_mul(U256::from(2u64))
                {
                    self.stats.cooldown_rejects.fetch_add(1, Ordering::Relaxed);
                    metrics::inc(metrics::BROKER_COOLDOWN_REJECTS);
                    return SubmitOutcome::CooldownRejected;
                }
            }
        }

        // Domination in either direction.
        let mut dominated_existing: Vec<usize> = Vec::new();
        for (idx, existing) in inner.queue.iter().enumerate() {
            if existing.chain != opp.chain || existing.kind != opp.kind {
                continue;
            }
            let overlaps = existing
                .fingerprints
                .iter()
                .any(|fp| opp.fingerprints.contains(fp));
            if !overlaps {
                continue;
            }
            if existing.net_profit >= opp.net_profit && existing.confidence >= opp.confidence {
                self.stats.dominated.fetch_add(1, Ordering::Relaxed);
                metrics::inc(metrics::BROKER_DOMINATED);
                return SubmitOutcome::Dominated;
            }
            if opp.net_profit >= existing.net_profit && opp.confidence >= existing.confidence {
                dominated_existing.push(idx);
            }
        }
        for idx in dominated_existing.into_iter().rev() {
            inner.queue.swap_remove(idx);
            self.stats.dominated.fetch_add(1, Ordering::Relaxed);
            metrics::inc(metrics::BROKER_DOMINATED);
        }

        if inner.queue.len() >= self.cfg.outer_capacity {
            self.stats.capacity_rejects.fetch_add(1, Ordering::Relaxed);
            return SubmitOutcome::CapacityRejected;
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        self.remember(&opp);
        inner.queue.push(opp);
        self.update_pending_gauge(inner.queue.len());
        SubmitOutcome::Accepted
    }

    /// Next schedulable opportunity by rank, or `None` when capacity is
    /// exhausted or nothing is inside its deadline window.
    pub fn poll(&self, now: MonoTime) -> Option<Opportunity> {
        let mut inner = self.inner.lock();

        // Deadline sweep first so the pending gauge stays honest.
        let before = inner.queue.len();
        inner.queue.retain(|o| !o.is_expired(now));
        let swept = before - inner.queue.len();
        if swept > 0 {
            self.stats.expired.fetch_add(swept as u64, Ordering::Relaxed);
            for _ in 0..swept {
                metrics::inc(metrics::BROKER_EXPIRED);
            }
            self.update_pending_gauge(inner.queue.len());
        }

        if inner.inflight.len() >= self.cfg.global_inflight_cap {
            return None;
        }

        let mut per_kind: HashMap<StrategyKind, usize> = HashMap::new();
        for kind in inner.inflight.values() {
            *per_kind.entry(*kind).or_default() += 1;
        }

        let mut best: Option<usize> = None;
        for (idx, opp) in inner.queue.iter().enumerate() {
            if opp.discovered_at > now {
                continue;
            }
            if let Some(cap) = self.cfg.per_strategy_caps.get(&opp.kind) {
                if per_kind.get(&opp.kind).copied().unwrap_or(0) >= *cap {
                    continue;
                }
            }
            let better = match best {
                None => true,
                Some(best_idx) => {
                    let b = &inner.queue[best_idx];
                    let (s, bs) = (opp.score(), b.score());
                    s > bs || (s == bs && opp.deadline < b.deadline)
                }
            };
            if better {
                best = Some(idx);
            }
        }

        let idx = best?;
        let opp = inner.queue.swap_remove(idx);
        inner.inflight.insert(opp.id, opp.kind);
        self.stats.served.fetch_add(1, Ordering::Relaxed);
        self.update_pending_gauge(inner.queue.len());
        debug!(id = %opp.id, kind = %opp.kind, score = opp.score(), "opportunity scheduled");
        Some(opp)
    }

    /// Executor/tracker feedback: release the in-flight slot and update the
    /// fingerprint cooldowns.
    pub fn release(
        &self,
        id: Uuid,
        kind: StrategyKind,
        fingerprints: &[Fingerprint],
        estimated_net: U256,
        failed: bool,
        now: MonoTime,
    ) {
        let mut inner = self.inner.lock();
        inner.inflight.remove(&id);

        if failed {
            let cooldown = self
                .cfg
                .cooldowns
                .get(&kind)
                .copied()
                .unwrap_or(Duration::from_secs(30));
            let until = crate::clock::add(now, cooldown);
            for fp in fingerprints {
                inner.cooldowns.insert(
                    *fp,
                    CooldownEntry {
                        until,
                        prior_estimated_net: estimated_net,
                    },
                );
            }
        } else {
            for fp in fingerprints {
                inner.cooldowns.remove(fp);
            }
        }

        // Opportunistic cooldown GC.
        inner.cooldowns.retain(|_, cd| cd.until > now);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    pub fn recent(&self, limit: usize) -> Vec<Opportunity> {
        let recent = self.recent.lock();
        recent.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> BrokerStatsSnapshot {
        let inner = self.inner.lock();
        BrokerStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            informational: self.stats.informational.load(Ordering::Relaxed),
            dominated: self.stats.dominated.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            cooldown_rejects: self.stats.cooldown_rejects.load(Ordering::Relaxed),
            capacity_rejects: self.stats.capacity_rejects.load(Ordering::Relaxed),
            served: self.stats.served.load(Ordering::Relaxed),
            pending: inner.queue.len(),
            in_flight: inner.inflight.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::models::{ExecutionPlan, Action};
    use alloy_primitives::{Address, Bytes};

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new(vec![Action::Call {
            target: Address::repeat_byte(1),
            calldata: Bytes::new(),
            value: U256::ZERO,
        }])
    }

    fn opp(
        gross: u64,
        conf: f64,
        fp: Fingerprint,
        ttl: Duration,
        kind: StrategyKind,
    ) -> Opportunity {
        Opportunity::new(
            kind,
            1,
            vec![fp],
            U256::from(gross),
            U256::from(0u64),
            conf,
            U256::ZERO,
            plan(),
            clock::now(),
            ttl,
        )
    }

    fn fp(b: u8) -> Fingerprint {
        Fingerprint([b; 16])
    }

    #[test]
    fn domination_drops_weaker_duplicate() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let a = opp(1_000_000_000, 0.8, fp(1), Duration::from_secs(5), StrategyKind::FlashArb);
        let b = opp(900_000_000, 0.7, fp(1), Duration::from_secs(5), StrategyKind::FlashArb);
        let a_id = a.id;

        assert_eq!(broker.submit(a, now), SubmitOutcome::Accepted);
        assert_eq!(broker.submit(b, now), SubmitOutcome::Dominated);
        assert_eq!(broker.stats().dominated, 1);

        let served = broker.poll(clock::now()).expect("a is schedulable");
        assert_eq!(served.id, a_id);
        assert!(broker.poll(clock::now()).is_none());
    }

    #[test]
    fn stronger_late_arrival_replaces_weaker() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let weak = opp(500, 0.5, fp(2), Duration::from_secs(5), StrategyKind::FlashArb);
        let strong = opp(900, 0.9, fp(2), Duration::from_secs(5), StrategyKind::FlashArb);
        let strong_id = strong.id;

        broker.submit(weak, now);
        assert_eq!(broker.submit(strong, now), SubmitOutcome::Accepted);
        assert_eq!(broker.pending(), 1);
        assert_eq!(broker.poll(clock::now()).unwrap().id, strong_id);
    }

    #[test]
    fn deadline_drop_returns_none_and_shrinks_pending() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let short = opp(1_000, 0.9, fp(3), Duration::from_millis(100), StrategyKind::Sandwich);
        assert_eq!(broker.submit(short, now), SubmitOutcome::Accepted);
        assert_eq!(broker.pending(), 1);

        // Poll past the deadline.
        let late = crate::clock::add(now, Duration::from_millis(150));
        assert!(broker.poll(late).is_none());
        assert_eq!(broker.pending(), 0);
        assert_eq!(broker.stats().expired, 1);
    }

    #[test]
    fn ranking_is_score_then_deadline() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let low = opp(100, 0.9, fp(4), Duration::from_secs(5), StrategyKind::FlashArb);
        let high = opp(10_000, 0.9, fp(5), Duration::from_secs(5), StrategyKind::FlashArb);
        let high_id = high.id;
        broker.submit(low, now);
        broker.submit(high, now);
        assert_eq!(broker.poll(clock::now()).unwrap().id, high_id);
    }

    #[test]
    fn global_inflight_cap_gates_poll() {
        let cfg = BrokerConfig {
            global_inflight_cap: 1,
            ..Default::default()
        };
        let broker = Broker::new(cfg);
        let now = clock::now();
        broker.submit(opp(100, 0.9, fp(6), Duration::from_secs(5), StrategyKind::FlashArb), now);
        broker.submit(opp(200, 0.9, fp(7), Duration::from_secs(5), StrategyKind::FlashArb), now);

        let first = broker.poll(clock::now()).unwrap();
        // Cap reached: accepting continues, serving stops.
        assert!(broker.poll(clock::now()).is_none());
        assert_eq!(broker.pending(), 1);

        broker.release(first.id, first.kind, &first.fingerprints, first.net_profit, false, clock::now());
        assert!(broker.poll(clock::now()).is_some());
    }

    #[test]
    fn failed_execution_sets_cooldown_with_override() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let first = opp(1_000, 0.9, fp(8), Duration::from_secs(5), StrategyKind::FlashArb);
        let first_id = first.id;
        let first_net = first.net_profit;
        broker.submit(first, now);
        let served = broker.poll(clock::now()).unwrap();
        assert_eq!(served.id, first_id);
        broker.release(first_id, StrategyKind::FlashArb, &[fp(8)], first_net, true, clock::now());

        // Same fingerprint, similar profit: rejected by cooldown.
        let retry = opp(1_100, 0.9, fp(8), Duration::from_secs(5), StrategyKind::FlashArb);
        assert_eq!(broker.submit(retry, clock::now()), SubmitOutcome::CooldownRejected);

        // More than 2x prior estimate: allowed through.
        let big = opp(2_500, 0.9, fp(8), Duration::from_secs(5), StrategyKind::FlashArb);
        assert_eq!(broker.submit(big, clock::now()), SubmitOutcome::Accepted);
    }

    #[test]
    fn informational_is_recorded_not_scheduled() {
        let broker = Broker::new(BrokerConfig::default());
        let now = clock::now();
        let info = Opportunity::new(
            StrategyKind::Governance,
            1,
            vec![fp(9)],
            U256::ZERO,
            U256::ZERO,
            1.0,
            U256::ZERO,
            ExecutionPlan::default(),
            now,
            Duration::from_secs(60),
        );
        assert_eq!(broker.submit(info, now), SubmitOutcome::Informational);
        assert_eq!(broker.pending(), 0);
        assert_eq!(broker.recent(10).len(), 1);
        assert!(broker.poll(clock::now()).is_none());
    }

    #[test]
    fn outer_capacity_rejects_but_keeps_existing() {
        let cfg = BrokerConfig {
            outer_capacity: 2,
            ..Default::default()
        };
        let broker = Broker::new(cfg);
        let now = clock::now();
        for i in 0..2u8 {
            assert_eq!(
                broker.submit(
                    opp(100 + i as u64, 0.9, fp(10 + i), Duration::from_secs(5), StrategyKind::FlashArb),
                    now
                ),
                SubmitOutcome::Accepted
            );
        }
        assert_eq!(
            broker.submit(opp(999, 0.9, fp(20), Duration::from_secs(5), StrategyKind::FlashArb), now),
            SubmitOutcome::CapacityRejected
        );
        assert_eq!(broker.pending(), 2);
    }
}
