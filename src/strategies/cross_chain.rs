//! Cross-chain arbitrage evaluator
//!
//! Compares marginal prices of pair-labelled pools across chains connected
//! by a bridge protocol. Requires clear deviation flags on both legs and a
//! bridge plan whose latency estimate fits the configured budget.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;

use super::{confidence, default_tau, EvalContext, Evaluator};
use crate::config::ProtocolKind;
use crate::models::{u256_to_f64, Action, ExecutionPlan, Opportunity, PendingTx, StrategyKind};
use crate::registry::PoolRef;

const GAS_CROSSCHAIN: u64 = 600_000;
/// Fixed bridge machinery overhead on top of confirmation latency.
const BRIDGE_OVERHEAD: Duration = Duration::from_secs(60);
/// Minimum price gap worth bridging, in bps.
const MIN_GAP_BPS: f64 = 80.0;

pub struct CrossChainArbEvaluator {
    latency_budget: Duration,
    ttl: Duration,
    tau: Duration,
}

impl CrossChainArbEvaluator {
    pub fn new(latency_budget_secs: u64, ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::CrosschainArb)
        };
        Self {
            latency_budget: Duration::from_secs(latency_budget_secs),
            ttl,
            tau,
        }
    }

    /// Marginal price of token0 in token1 from cached reserves.
    fn pool_price(ctx: &EvalContext, chain: u32, pool: &PoolRef) -> Option<f64> {
        let state = ctx.pools.reserves(chain, pool.address)?;
        let r0 = u256_to_f64(state.reserve0);
        let r1 = u256_to_f64(state.reserve1);
        if r0 <= 0.0 || r1 <= 0.0 {
            return None;
        }
        Some(r1 / r0)
    }

    fn pair_symbols(pair: &str) -> Option<(String, String)> {
        let (a, b) = pair.split_once('/')?;
        Some((a.to_uppercase(), b.to_uppercase()))
    }
}

#[async_trait]
impl Evaluator for CrossChainArbEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CrosschainArb
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        // Only rescan when the trigger touched a known protocol.
        let Some(selector) = tx.selector() else {
            return Ok(Vec::new());
        };
        if ctx.protocols.decoder_for(selector).is_none() {
            return Ok(Vec::new());
        }

        // Chains reachable from the trigger chain over a configured bridge.
        let mut bridged: Vec<u32> = Vec::new();
        for bridge in ctx.protocols.of_kind(ProtocolKind::Bridge) {
            if bridge.on_chain(tx.chain).is_some() {
                bridged.extend(bridge.chains.keys().copied().filter(|c| *c != tx.chain));
            }
        }
        if bridged.is_empty() {
            return Ok(Vec::new());
        }

        let src_pools = ctx.protocols.pools_on_chain(tx.chain);
        let mut out = Vec::new();

        for dst_chain_id in bridged {
            if ctx.chains.get(dst_chain_id).is_none() {
                continue;
            }
            let Some(src_chain) = ctx.chains.get(tx.chain) else {
                continue;
            };

            // Bridge latency: source finality plus fixed overhead.
            let latency = src_chain.block_time * src_chain.confirmations + BRIDGE_OVERHEAD;
            if latency > self.latency_budget {
                continue;
            }

            let dst_pools = ctx.protocols.pools_on_chain(dst_chain_id);
            for src_pool in src_pools.iter().filter(|p| p.pair.is_some()) {
                let pair = src_pool.pair.as_deref().unwrap();
                let Some(dst_pool) = dst_pools.iter().find(|p| p.pair.as_deref() == Some(pair))
                else {
                    continue;
                };

                // Both legs must have clear deviation flags.
                if let Some((a, b)) = Self::pair_symbols(pair) {
                    if ctx.oracle.is_deviating(&a) || ctx.oracle.is_deviating(&b) {
                        continue;
                    }
                }

                let (Some(src_price), Some(dst_price)) = (
                    Self::pool_price(ctx, tx.chain, src_pool),
                    Self::pool_price(ctx, dst_chain_id, dst_pool),
                ) else {
                    continue;
                };

                let gap = (dst_price - src_price).abs() / src_price;
                if gap * 10_000.0 < MIN_GAP_BPS {
                    continue;
                }

                // Size the leg at 0.5% of the source pool's token0 side.
                let src_state = ctx.pools.reserves(tx.chain, src_pool.address).unwrap();
                let amount = src_state.reserve0 / U256::from(200u64);
                if amount.is_zero() {
                    continue;
                }

                let gross_f = u256_to_f64(amount) * gap;
                let gas_price = tx
                    .pricing
                    .map(|p| p.price_ceiling())
                    .unwrap_or(30_000_000_000);
                let gas_cost = U256::from(GAS_CROSSCHAIN as u128 * 2 * gas_price);
                let gross = U256::from(gross_f.max(0.0) as u128);
                if gross <= gas_cost {
                    continue;
                }

                let (buy_chain, sell_chain) = if dst_price > src_price {
                    (tx.chain, dst_chain_id)
                } else {
                    (dst_chain_id, tx.chain)
                };

                let plan = ExecutionPlan::new(vec![
                    Action::Swap {
                        pool: src_pool.address,
                        token_in: src_pool.token1,
                        token_out: src_pool.token0,
                        amount_in: amount,
                        min_out: U256::ZERO,
                    },
                    Action::Bridge {
                        src_chain: buy_chain,
                        dst_chain: sell_chain,
                        token: src_pool.token0,
                        amount,
                    },
                    Action::Swap {
                        pool: dst_pool.address,
                        token_in: dst_pool.token0,
                        token_out: dst_pool.token1,
                        amount_in: amount,
                        min_out: U256::ZERO,
                    },
                ]);

                let age = ctx.now.saturating_sub(tx.first_seen);
                let conf = confidence(
                    0.7,
                    ctx.weights.success_rate(StrategyKind::CrosschainArb),
                    age,
                    self.tau,
                );

                out.push(Opportunity::new(
                    StrategyKind::CrosschainArb,
                    tx.chain,
                    vec![tx.fingerprint()],
                    gross,
                    gas_cost,
                    conf,
                    amount,
                    plan,
                    ctx.now,
                    self.ttl.min(self.latency_budget),
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_symbols_split() {
        assert_eq!(
            CrossChainArbEvaluator::pair_symbols("weth/usdc"),
            Some(("WETH".into(), "USDC".into()))
        );
        assert_eq!(CrossChainArbEvaluator::pair_symbols("solo"), None);
    }

    #[test]
    fn latency_estimate_respects_budget() {
        let eval = CrossChainArbEvaluator::new(120, Duration::from_secs(60), 0.0);
        // 12s blocks x 2 confirmations + 60s overhead = 84s <= 120s budget.
        let latency = Duration::from_secs(12) * 2 + BRIDGE_OVERHEAD;
        assert!(latency <= eval.latency_budget);
        // A 10-confirmation chain blows the budget.
        let slow = Duration::from_secs(12) * 10 + BRIDGE_OVERHEAD;
        assert!(slow > eval.latency_budget);
    }
}
