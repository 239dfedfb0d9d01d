//! EIP-1559 gas policy
//!
//! Priority fee is the max of the live mempool percentile and the
//! opportunity slack (net profit x alpha spread over the gas budget),
//! capped by the chain descriptor. Max fee rides two base fees above that.

use std::collections::VecDeque;

use alloy_primitives::U256;
use parking_lot::RwLock;

use crate::config::GasPolicyCfg;
use crate::models::{u256_to_f64, PendingTx};

/// Rolling sample of observed priority fees, fed from a dispatcher
/// subscription.
pub struct FeeObserver {
    samples: RwLock<VecDeque<u128>>,
    cap: usize,
}

impl FeeObserver {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: RwLock::new(VecDeque::with_capacity(cap)),
            cap: cap.max(1),
        }
    }

    pub fn record(&self, tx: &PendingTx) {
        let Some(pricing) = tx.pricing else { return };
        let fee = pricing
            .priority_fee()
            .unwrap_or_else(|| pricing.price_ceiling());
        let mut samples = self.samples.write();
        if samples.len() == self.cap {
            samples.pop_front();
        }
        samples.push_back(fee);
    }

    /// Fee at percentile p of the rolling sample; zero when empty.
    pub fn percentile(&self, p: f64) -> u128 {
        let samples = self.samples.read();
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u128> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
        sorted[idx]
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.read().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasQuote {
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

/// Compute the bid for one bundle transaction.
pub fn quote(
    policy: &GasPolicyCfg,
    recent_base_fee: u128,
    mempool_percentile_fee: u128,
    net_profit: U256,
    gas_limit: u64,
    priority_cap: u128,
) -> GasQuote {
    // Opportunity slack: alpha of the estimated profit, amortized per gas.
    let slack_total = u256_to_f64(net_profit) * policy.alpha;
    let slack_per_gas = if gas_limit == 0 {
        0
    } else {
        (slack_total / gas_limit as f64).max(0.0) as u128
    };

    let priority = mempool_percentile_fee
        .max(slack_per_gas)
        .min(priority_cap);
    let max_fee = recent_base_fee.saturating_mul(2).saturating_add(priority);

    GasQuote {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: priority,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::models::{GasPricing, SourceId};
    use alloy_primitives::{Address, Bytes, B256};

    fn tx_with_priority(fee: u128) -> PendingTx {
        let now = clock::now();
        PendingTx {
            hash: B256::random(),
            chain: 1,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::ZERO,
            gas_limit: 21_000,
            pricing: Some(GasPricing::Eip1559 {
                max_fee: fee * 3,
                priority_fee: fee,
            }),
            nonce: 0,
            input: Bytes::new(),
            first_seen: now,
            last_seen: now,
            source: SourceId::new("test"),
        }
    }

    #[test]
    fn percentile_tracks_distribution() {
        let obs = FeeObserver::new(512);
        for fee in 1..=100u128 {
            obs.record(&tx_with_priority(fee));
        }
        assert_eq!(obs.percentile(0.0), 1);
        assert_eq!(obs.percentile(1.0), 100);
        let median = obs.percentile(0.5);
        assert!((45..=55).contains(&(median as i64)));
    }

    #[test]
    fn observer_is_bounded() {
        let obs = FeeObserver::new(8);
        for fee in 1..=100u128 {
            obs.record(&tx_with_priority(fee));
        }
        assert_eq!(obs.len(), 8);
        // Only the newest eight remain.
        assert_eq!(obs.percentile(0.0), 93);
    }

    #[test]
    fn slack_lifts_priority_above_percentile() {
        let policy = GasPolicyCfg {
            alpha: 0.2,
            percentile: 0.5,
            base_fee_blocks: 5,
        };
        // 1 ETH net profit, 200k gas: slack = 0.2e18 / 2e5 = 1e12 per gas.
        let q = quote(
            &policy,
            30_000_000_000,
            2_000_000_000,
            U256::from(1_000_000_000_000_000_000u128),
            200_000,
            u128::MAX,
        );
        assert_eq!(q.max_priority_fee_per_gas, 1_000_000_000_000);
        assert_eq!(q.max_fee_per_gas, 60_000_000_000 + 1_000_000_000_000);
    }

    #[test]
    fn chain_cap_binds_priority() {
        let policy = GasPolicyCfg::default();
        let q = quote(
            &policy,
            30_000_000_000,
            2_000_000_000,
            U256::from(1_000_000_000_000_000_000u128),
            200_000,
            5_000_000_000,
        );
        assert_eq!(q.max_priority_fee_per_gas, 5_000_000_000);
    }

    #[test]
    fn zero_profit_falls_back_to_percentile() {
        let policy = GasPolicyCfg::default();
        let q = quote(&policy, 10, 7, U256::ZERO, 21_000, 1_000);
        assert_eq!(q.max_priority_fee_per_gas, 7);
        assert_eq!(q.max_fee_per_gas, 27);
    }
}
