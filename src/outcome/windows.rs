//! Rolling per-strategy outcome windows
//!
//! Fixed-size lock-free rings: writers stamp slots round-robin, readers fold
//! whatever is there. Readers may observe a half-updated window and therefore
//! slightly stale stats, which is acceptable for feedback weighting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::models::{OutcomeRecord, StrategyKind};

/// Default window length (most recent executions per strategy).
pub const DEFAULT_WINDOW: usize = 200;

struct Slot {
    /// f64 bits of realized profit in base units.
    profit: AtomicU64,
    /// 0 = failure, 1 = success, 2 = empty.
    state: AtomicU64,
}

const SLOT_EMPTY: u64 = 2;

struct StrategyWindow {
    slots: Vec<Slot>,
    head: AtomicU64,
}

impl StrategyWindow {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len)
                .map(|_| Slot {
                    profit: AtomicU64::new(0f64.to_bits()),
                    state: AtomicU64::new(SLOT_EMPTY),
                })
                .collect(),
            head: AtomicU64::new(0),
        }
    }

    fn push(&self, profit: f64, success: bool) {
        let idx = (self.head.fetch_add(1, Ordering::Relaxed) as usize) % self.slots.len();
        let slot = &self.slots[idx];
        slot.profit.store(profit.to_bits(), Ordering::Relaxed);
        slot.state.store(success as u64, Ordering::Relaxed);
    }

    fn fold(&self) -> (usize, usize, f64) {
        let mut n = 0usize;
        let mut successes = 0usize;
        let mut total = 0f64;
        for slot in &self.slots {
            match slot.state.load(Ordering::Relaxed) {
                SLOT_EMPTY => {}
                s => {
                    n += 1;
                    successes += s as usize;
                    total += f64::from_bits(slot.profit.load(Ordering::Relaxed));
                }
            }
        }
        (n, successes, total)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyWindowSnapshot {
    pub strategy: StrategyKind,
    pub executions: usize,
    pub success_rate: f64,
    pub mean_realized_net: f64,
}

const KINDS: usize = StrategyKind::ALL.len();

/// All six windows, indexed by strategy kind.
pub struct RollingWindows {
    windows: [StrategyWindow; KINDS],
}

impl RollingWindows {
    pub fn new(len: usize) -> Self {
        Self {
            windows: std::array::from_fn(|_| StrategyWindow::new(len.max(1))),
        }
    }

    fn window(&self, kind: StrategyKind) -> &StrategyWindow {
        let idx = StrategyKind::ALL
            .iter()
            .position(|k| *k == kind)
            .expect("kind in ALL");
        &self.windows[idx]
    }

    pub fn record(&self, record: &OutcomeRecord) {
        self.window(record.strategy)
            .push(record.realized_profit as f64, record.succeeded());
    }

    /// Rolling success rate in [0, 1]. An empty window reads as a neutral
    /// 0.5 so new strategies are neither boosted nor buried.
    pub fn success_rate(&self, kind: StrategyKind) -> f64 {
        let (n, successes, _) = self.window(kind).fold();
        if n == 0 {
            0.5
        } else {
            successes as f64 / n as f64
        }
    }

    /// Mean realized net profit in base units over the window.
    pub fn mean_realized_net(&self, kind: StrategyKind) -> f64 {
        let (n, _, total) = self.window(kind).fold();
        if n == 0 {
            0.0
        } else {
            total / n as f64
        }
    }

    pub fn snapshot(&self) -> Vec<StrategyWindowSnapshot> {
        StrategyKind::ALL
            .iter()
            .map(|kind| {
                let (n, successes, total) = self.window(*kind).fold();
                StrategyWindowSnapshot {
                    strategy: *kind,
                    executions: n,
                    success_rate: if n == 0 {
                        0.5
                    } else {
                        successes as f64 / n as f64
                    },
                    mean_realized_net: if n == 0 { 0.0 } else { total / n as f64 },
                }
            })
            .collect()
    }
}

impl Default for RollingWindows {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(strategy: StrategyKind, profit: i128, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            bundle_id: Uuid::new_v4(),
            opportunity_id: Uuid::new_v4(),
            strategy,
            chain: 1,
            inclusion_block: success.then_some(100),
            gas_used: 21_000,
            realized_profit: profit,
            latency_ms: 40,
            failure: (!success).then_some(crate::models::FailureReason::Reverted),
            recorded_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn empty_window_is_neutral() {
        let w = RollingWindows::default();
        assert_eq!(w.success_rate(StrategyKind::FlashArb), 0.5);
        assert_eq!(w.mean_realized_net(StrategyKind::FlashArb), 0.0);
    }

    #[test]
    fn success_rate_tracks_records() {
        let w = RollingWindows::default();
        for i in 0..10 {
            w.record(&record(StrategyKind::Sandwich, 100, i % 2 == 0));
        }
        let rate = w.success_rate(StrategyKind::Sandwich);
        assert!((rate - 0.5).abs() < 1e-9);
        // Other strategies untouched.
        assert_eq!(w.success_rate(StrategyKind::Liquidation), 0.5);
    }

    #[test]
    fn window_keeps_only_last_n() {
        let w = RollingWindows::new(4);
        for _ in 0..100 {
            w.record(&record(StrategyKind::FlashArb, -50, false));
        }
        for _ in 0..4 {
            w.record(&record(StrategyKind::FlashArb, 100, true));
        }
        // All four live slots are the recent successes.
        assert_eq!(w.success_rate(StrategyKind::FlashArb), 1.0);
        assert_eq!(w.mean_realized_net(StrategyKind::FlashArb), 100.0);
    }
}
