//! Dispatcher
//!
//! Multiplexes the normalized stream to strategy subscribers. Each
//! subscription owns a bounded ring with DROP_OLDEST overflow so a slow
//! evaluator can never stall the adapters. Delivery order within one
//! subscription equals arrival order at the dispatcher; nothing is claimed
//! across subscriptions.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use crate::metrics;
use crate::models::PendingTx;

/// Conjunction filter: a transaction is delivered iff it satisfies every
/// populated clause.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub min_value: Option<U256>,
    /// Matches sender or recipient.
    pub address_whitelist: Option<HashSet<Address>>,
    pub selector_whitelist: Option<HashSet<[u8; 4]>>,
    pub chain_whitelist: Option<HashSet<u32>>,
}

impl FilterSpec {
    pub fn matches(&self, tx: &PendingTx) -> bool {
        if let Some(min) = self.min_value {
            if tx.value < min {
                return false;
            }
        }
        if let Some(addrs) = &self.address_whitelist {
            let to_hit = tx.to.map(|t| addrs.contains(&t)).unwrap_or(false);
            if !to_hit && !addrs.contains(&tx.from) {
                return false;
            }
        }
        if let Some(selectors) = &self.selector_whitelist {
            match tx.selector() {
                Some(sel) if selectors.contains(&sel) => {}
                _ => return false,
            }
        }
        if let Some(chains) = &self.chain_whitelist {
            if !chains.contains(&tx.chain) {
                return false;
            }
        }
        true
    }
}

/// Bounded single-consumer ring with drop-oldest overflow.
struct Ring {
    buf: Mutex<VecDeque<Arc<PendingTx>>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
    drops: AtomicU64,
    delivered: AtomicU64,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            drops: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    /// Push without ever blocking; counts exactly one drop per displaced
    /// delivery.
    fn push(&self, tx: Arc<PendingTx>, label: &str) {
        {
            let mut buf = self.buf.lock();
            if buf.len() >= self.capacity {
                buf.pop_front();
                self.drops.fetch_add(1, Ordering::Relaxed);
                metrics::inc1(metrics::DISPATCHER_DROPS, "subscriber", label);
            }
            buf.push_back(tx);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

struct Subscriber {
    id: u64,
    label: String,
    filter: FilterSpec,
    ring: Arc<Ring>,
}

/// Receiving half handed to an evaluator task. Dropping it detaches the
/// subscriber and reclaims the ring.
pub struct SubscriptionHandle {
    id: u64,
    label: String,
    ring: Arc<Ring>,
    dispatcher: Arc<Dispatcher>,
}

impl SubscriptionHandle {
    /// Next transaction in arrival order, or `None` after close-and-drain.
    pub async fn recv(&mut self) -> Option<Arc<PendingTx>> {
        loop {
            if let Some(tx) = self.ring.buf.lock().pop_front() {
                self.ring.delivered.fetch_add(1, Ordering::Relaxed);
                return Some(tx);
            }
            if self.ring.closed.load(Ordering::Acquire) {
                return None;
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<PendingTx>> {
        let tx = self.ring.buf.lock().pop_front();
        if tx.is_some() {
            self.ring.delivered.fetch_add(1, Ordering::Relaxed);
        }
        tx
    }

    pub fn drops(&self) -> u64 {
        self.ring.drops.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub label: String,
    pub queued: usize,
    pub delivered: u64,
    pub drops: u64,
}

#[derive(Default)]
pub struct Dispatcher {
    subs: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(
        self: &Arc<Self>,
        label: impl Into<String>,
        filter: FilterSpec,
        capacity: usize,
    ) -> SubscriptionHandle {
        let label = label.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ring = Arc::new(Ring::new(capacity.max(1)));
        self.subs.write().push(Subscriber {
            id,
            label: label.clone(),
            filter,
            ring: ring.clone(),
        });
        debug!(subscriber = %label, capacity, "dispatcher subscription added");
        SubscriptionHandle {
            id,
            label,
            ring,
            dispatcher: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut subs = self.subs.write();
        if let Some(pos) = subs.iter().position(|s| s.id == id) {
            let sub = subs.swap_remove(pos);
            sub.ring.close();
        }
    }

    /// Fan one transaction out to every matching subscriber. Synchronous and
    /// non-blocking by construction.
    pub fn publish(&self, tx: PendingTx) {
        let tx = Arc::new(tx);
        self.published.fetch_add(1, Ordering::Relaxed);
        let subs = self.subs.read();
        for sub in subs.iter() {
            if sub.filter.matches(&tx) {
                sub.ring.push(tx.clone(), &sub.label);
            }
        }
    }

    /// Close every subscription; consumers drain their rings then see `None`.
    pub fn close_all(&self) {
        let subs = self.subs.read();
        for sub in subs.iter() {
            sub.ring.close();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.subs
            .read()
            .iter()
            .map(|s| SubscriberStats {
                label: s.label.clone(),
                queued: s.ring.buf.lock().len(),
                delivered: s.ring.delivered.load(Ordering::Relaxed),
                drops: s.ring.drops.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::models::{GasPricing, SourceId};
    use alloy_primitives::{Bytes, B256};

    fn tx(chain: u32, value: u64, nonce: u64, selector: Option<[u8; 4]>) -> PendingTx {
        let input = match selector {
            Some(sel) => Bytes::from(sel.to_vec()),
            None => Bytes::new(),
        };
        let now = clock::now();
        PendingTx {
            hash: B256::random(),
            chain,
            from: Address::repeat_byte(0x11),
            to: Some(Address::repeat_byte(0x22)),
            value: U256::from(value),
            gas_limit: 21_000,
            pricing: Some(GasPricing::Legacy { gas_price: 5 }),
            nonce,
            input,
            first_seen: now,
            last_seen: now,
            source: SourceId::new("test"),
        }
    }

    #[tokio::test]
    async fn delivery_preserves_arrival_order() {
        let d = Dispatcher::new();
        let mut sub = d.subscribe("order", FilterSpec::default(), 64);
        for nonce in 0..10u64 {
            d.publish(tx(1, 100, nonce, None));
        }
        for nonce in 0..10u64 {
            let got = sub.recv().await.unwrap();
            assert_eq!(got.nonce, nonce);
        }
    }

    #[tokio::test]
    async fn full_ring_drops_oldest_and_counts() {
        let d = Dispatcher::new();
        let mut sub = d.subscribe("tiny", FilterSpec::default(), 2);
        d.publish(tx(1, 1, 0, None));
        d.publish(tx(1, 1, 1, None));
        assert_eq!(sub.drops(), 0);
        d.publish(tx(1, 1, 2, None)); // displaces nonce 0
        assert_eq!(sub.drops(), 1);
        assert_eq!(sub.recv().await.unwrap().nonce, 1);
        assert_eq!(sub.recv().await.unwrap().nonce, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_starve_others() {
        let d = Dispatcher::new();
        let mut slow = d.subscribe("slow", FilterSpec::default(), 1);
        let mut fast = d.subscribe("fast", FilterSpec::default(), 64);
        for nonce in 0..5u64 {
            d.publish(tx(1, 1, nonce, None));
        }
        // Fast subscriber saw everything despite the slow ring overflowing.
        for nonce in 0..5u64 {
            assert_eq!(fast.recv().await.unwrap().nonce, nonce);
        }
        assert_eq!(slow.recv().await.unwrap().nonce, 4);
        assert_eq!(slow.drops(), 4);
    }

    #[tokio::test]
    async fn filters_are_a_conjunction() {
        let d = Dispatcher::new();
        let filter = FilterSpec {
            min_value: Some(U256::from(100u64)),
            chain_whitelist: Some(HashSet::from([1u32])),
            selector_whitelist: Some(HashSet::from([[0xa9, 0x05, 0x9c, 0xbb]])),
            address_whitelist: None,
        };
        let mut sub = d.subscribe("filtered", filter, 16);

        d.publish(tx(1, 50, 0, Some([0xa9, 0x05, 0x9c, 0xbb]))); // value too low
        d.publish(tx(2, 500, 1, Some([0xa9, 0x05, 0x9c, 0xbb]))); // wrong chain
        d.publish(tx(1, 500, 2, None)); // no selector
        d.publish(tx(1, 500, 3, Some([0xa9, 0x05, 0x9c, 0xbb]))); // passes

        let got = sub.recv().await.unwrap();
        assert_eq!(got.nonce, 3);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_handle_detaches_subscriber() {
        let d = Dispatcher::new();
        let sub = d.subscribe("gone", FilterSpec::default(), 4);
        assert_eq!(d.subscriber_count(), 1);
        drop(sub);
        assert_eq!(d.subscriber_count(), 0);
        // Publishing afterwards is a no-op rather than an error.
        d.publish(tx(1, 1, 0, None));
    }

    #[tokio::test]
    async fn close_all_lets_consumers_drain() {
        let d = Dispatcher::new();
        let mut sub = d.subscribe("drain", FilterSpec::default(), 8);
        d.publish(tx(1, 1, 0, None));
        d.close_all();
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }
}
