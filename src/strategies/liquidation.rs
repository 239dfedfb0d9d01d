//! Liquidation evaluator
//!
//! Reads the lending health view for accounts under the liquidation
//! threshold and ranks candidates by bonus-weighted collateral minus gas.
//! Mempool activity is only the trigger to rescan; the health data itself
//! comes from the background poller.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bytes, U256};
use async_trait::async_trait;
use dashmap::DashMap;

use super::{confidence, default_tau, EvalContext, Evaluator};
use crate::clock::MonoTime;
use crate::models::{Action, ExecutionPlan, Opportunity, PendingTx, StrategyKind};

const GAS_LIQUIDATION: u64 = 450_000;
/// At most this many candidates per trigger.
const MAX_CANDIDATES: usize = 3;
/// Skip accounts we emitted for within this window.
const REEMIT_AFTER: Duration = Duration::from_secs(10);

pub struct LiquidationEvaluator {
    epsilon: f64,
    ttl: Duration,
    tau: Duration,
    recently_emitted: DashMap<(u32, Address), MonoTime>,
}

impl LiquidationEvaluator {
    pub fn new(epsilon: f64, ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::Liquidation)
        };
        Self {
            epsilon,
            ttl,
            tau,
            recently_emitted: DashMap::new(),
        }
    }

    fn liquidate_calldata(account: Address) -> Bytes {
        let sel = keccak256("liquidateAccount(address)".as_bytes());
        let mut data = sel[..4].to_vec();
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(account.as_slice());
        data.extend_from_slice(&word);
        Bytes::from(data)
    }
}

#[async_trait]
impl Evaluator for LiquidationEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Liquidation
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        let Some(chain) = ctx.chains.get(tx.chain) else {
            return Ok(Vec::new());
        };

        let gas_price = tx
            .pricing
            .map(|p| p.price_ceiling())
            .unwrap_or(30_000_000_000);
        let gas_cost_base = GAS_LIQUIDATION as f64 * gas_price as f64;

        let threshold = 1.0 - self.epsilon;
        let mut candidates: Vec<(f64, crate::strategies::AccountHealth)> = ctx
            .lending
            .positions(tx.chain)
            .into_iter()
            .filter(|p| p.health_factor < threshold && p.debt_value > 0.0)
            .map(|p| {
                let bonus = p.liq_bonus_bps as f64 / 10_000.0;
                let score = bonus * p.collateral_value * 1e18 - gas_cost_base;
                (score, p)
            })
            .filter(|(score, _)| *score > 0.0)
            .collect();

        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut out = Vec::new();
        for (score, position) in candidates.into_iter().take(MAX_CANDIDATES) {
            // Don't spam the broker with the same underwater account on
            // every mempool tick.
            let key = (tx.chain, position.account);
            let now = ctx.now;
            if let Some(last) = self.recently_emitted.get(&key) {
                if now.saturating_sub(*last) < REEMIT_AFTER.as_nanos() as u64 {
                    continue;
                }
            }
            self.recently_emitted.insert(key, now);

            let gross = U256::from((score + gas_cost_base).max(0.0) as u128);
            let gas_cost = U256::from(gas_cost_base as u128);
            let debt_units = U256::from((position.debt_value * 1e18).max(0.0) as u128);

            let plan = ExecutionPlan::new(vec![Action::FlashLoan {
                provider_id: 0,
                token: chain.wrapped_native,
                amount: debt_units,
                inner: vec![Action::Call {
                    target: position.market,
                    calldata: Self::liquidate_calldata(position.account),
                    value: U256::ZERO,
                }],
            }]);

            let age = ctx.now.saturating_sub(position.at);
            let conf = confidence(
                0.9,
                ctx.weights.success_rate(StrategyKind::Liquidation),
                age,
                self.tau,
            );

            out.push(Opportunity::new(
                StrategyKind::Liquidation,
                tx.chain,
                vec![tx.fingerprint()],
                gross,
                gas_cost,
                conf,
                debt_units,
                plan,
                ctx.now,
                self.ttl,
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::AccountHealth;

    #[test]
    fn calldata_embeds_account() {
        let account = Address::repeat_byte(0x5a);
        let data = LiquidationEvaluator::liquidate_calldata(account);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[16..36], account.as_slice());
    }

    #[test]
    fn health_threshold_uses_epsilon() {
        let eval = LiquidationEvaluator::new(0.01, Duration::from_secs(30), 0.0);
        let threshold = 1.0 - eval.epsilon;
        let healthy = AccountHealth {
            market: Address::repeat_byte(1),
            account: Address::repeat_byte(2),
            collateral_value: 10.0,
            debt_value: 9.0,
            health_factor: 0.995,
            liq_bonus_bps: 500,
            at: crate::clock::now(),
        };
        // 0.995 is above 0.99: not liquidatable yet.
        assert!(healthy.health_factor >= threshold);
        let underwater = AccountHealth {
            health_factor: 0.97,
            ..healthy
        };
        assert!(underwater.health_factor < threshold);
    }
}
