//! Source adapters
//!
//! Each upstream feed becomes a uniform stream of `PendingObservation`s.
//! Adapters never deduplicate (the normalizer owns that) and never block the
//! pipeline: every observation goes through one bounded ingress channel.

mod polling;
mod push_feed;
mod websocket;

pub use polling::PollingAdapter;
pub use push_feed::PushFeedAdapter;
pub use websocket::WsAdapter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::{self, MonoTime};
use crate::metrics;
use crate::models::{PendingObservation, SourceId};

/// Receiving end of an adapter's observation stream. Dropping it cancels
/// nothing by itself; adapters stop via their shutdown token and `close()`.
pub struct ObservationStream {
    rx: mpsc::Receiver<PendingObservation>,
}

impl ObservationStream {
    pub fn new(rx: mpsc::Receiver<PendingObservation>) -> Self {
        Self { rx }
    }

    /// Next observation in local-arrival order; `None` once the adapter has
    /// fully shut down.
    pub async fn next(&mut self) -> Option<PendingObservation> {
        self.rx.recv().await
    }
}

/// Exponential backoff with full jitter: base 1 s, cap 30 s.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Next delay; the exponential envelope doubles per attempt and the
    /// actual sleep is a uniform draw from (0, envelope].
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let envelope = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let nanos = envelope.as_nanos().max(1) as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(1..=nanos))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Per-source token bucket. A cap of zero disables the gate.
#[derive(Debug)]
pub struct RateGate {
    cap_per_sec: u32,
    tokens: parking_lot::Mutex<(f64, MonoTime)>,
}

impl RateGate {
    pub fn new(cap_per_sec: u32) -> Self {
        Self {
            cap_per_sec,
            tokens: parking_lot::Mutex::new((cap_per_sec as f64, clock::now())),
        }
    }

    /// Take one token; returns false when the source is over its cap.
    pub fn admit(&self) -> bool {
        if self.cap_per_sec == 0 {
            return true;
        }
        let mut state = self.tokens.lock();
        let now = clock::now();
        let elapsed_secs = now.saturating_sub(state.1) as f64 / 1e9;
        state.0 = (state.0 + elapsed_secs * self.cap_per_sec as f64).min(self.cap_per_sec as f64);
        state.1 = now;
        if state.0 >= 1.0 {
            state.0 -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared per-adapter counters.
#[derive(Debug, Default)]
pub struct AdapterStats {
    pub observations: AtomicU64,
    pub invalid: AtomicU64,
    pub reconnects: AtomicU64,
    pub rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatsSnapshot {
    pub observations: u64,
    pub invalid: u64,
    pub reconnects: u64,
    pub rate_limited: u64,
}

impl AdapterStats {
    pub fn snapshot(&self) -> AdapterStatsSnapshot {
        AdapterStatsSnapshot {
            observations: self.observations.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Context shared by all adapter implementations.
pub(crate) struct AdapterShared {
    pub source: SourceId,
    pub stats: Arc<AdapterStats>,
    pub gate: RateGate,
    pub out: mpsc::Sender<PendingObservation>,
}

impl AdapterShared {
    pub fn new(
        source: SourceId,
        rate_cap: u32,
        out: mpsc::Sender<PendingObservation>,
    ) -> Self {
        Self {
            source,
            stats: Arc::new(AdapterStats::default()),
            gate: RateGate::new(rate_cap),
            out,
        }
    }

    /// Deliver one observation, honoring the per-source rate cap. Awaits
    /// channel capacity rather than dropping: backpressure belongs to the
    /// ingress queue, drop policy belongs to the dispatcher.
    pub async fn emit(&self, obs: PendingObservation) -> bool {
        if !self.gate.admit() {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let label = self.source.label().to_string();
        if self.out.send(obs).await.is_err() {
            return false; // pipeline shutting down
        }
        self.stats.observations.fetch_add(1, Ordering::Relaxed);
        metrics::inc1(metrics::ADAPTER_OBSERVATIONS, "source", label);
        true
    }

    pub fn count_reconnect(&self) {
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        let label = self.source.label().to_string();
        metrics::inc1(metrics::ADAPTER_RECONNECTS, "source", label);
    }

    pub fn count_invalid(&self) {
        self.stats.invalid.fetch_add(1, Ordering::Relaxed);
        let label = self.source.label().to_string();
        metrics::inc1(metrics::ADAPTER_INVALID, "source", label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_cap() {
        let mut b = Backoff::reconnect();
        for _ in 0..12 {
            let d = b.next_delay();
            assert!(d > Duration::ZERO);
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn backoff_reset_restarts_envelope() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..6 {
            b.next_delay();
        }
        b.reset();
        // After reset the envelope is back to the base second.
        assert!(b.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn rate_gate_zero_cap_admits_everything() {
        let gate = RateGate::new(0);
        for _ in 0..10_000 {
            assert!(gate.admit());
        }
    }

    #[test]
    fn rate_gate_caps_burst() {
        let gate = RateGate::new(5);
        let admitted = (0..100).filter(|_| gate.admit()).count();
        assert!(admitted <= 6, "burst admitted {admitted} > cap");
    }
}
