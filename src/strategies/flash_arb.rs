//! Flash arbitrage evaluator
//!
//! Enumerates cyclic swap paths rooted at the chain's wrapped-native token
//! across every registered DEX pool, quotes them against cached reserves,
//! and emits the best net-positive cycle wrapped in a flash loan.
//! Tie-break: expected net profit first, then fewest hops.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;

use super::{amount_out, confidence, default_tau, EvalContext, Evaluator};
use crate::models::{
    Action, ExecutionPlan, Opportunity, PendingTx, StrategyKind,
};
use crate::registry::PoolRef;

/// Gas units budgeted per swap hop plus flash-loan overhead.
const GAS_PER_HOP: u64 = 150_000;
const GAS_FLASHLOAN_BASE: u64 = 220_000;

/// Probe sizes as fractions (bps) of the first pool's input-side reserve.
const PROBE_BPS: [u32; 3] = [10, 50, 200];

pub struct FlashArbEvaluator {
    max_hops: u32,
    ttl: Duration,
    tau: Duration,
    /// Flash-loan provider id on the operator aggregator.
    provider_id: u8,
}

impl FlashArbEvaluator {
    pub fn new(max_hops: u32, ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::FlashArb)
        };
        Self {
            max_hops: max_hops.clamp(1, 5),
            ttl,
            tau,
            provider_id: 0,
        }
    }

    /// Quote one cyclic path for a given input amount. Returns the final
    /// output in base token.
    fn quote_cycle(
        path: &[(PoolRef, Address, Address)],
        amount_in: U256,
        ctx: &EvalContext,
        chain: u32,
    ) -> Option<U256> {
        let mut amount = amount_in;
        for (pool, token_in, _token_out) in path {
            let state = ctx.pools.reserves(chain, pool.address)?;
            let (r_in, r_out) = if *token_in == pool.token0 {
                (state.reserve0, state.reserve1)
            } else {
                (state.reserve1, state.reserve0)
            };
            amount = amount_out(amount, r_in, r_out, pool.fee_bps);
            if amount.is_zero() {
                return None;
            }
        }
        Some(amount)
    }

    /// DFS over the pool graph collecting cycles that return to base.
    fn enumerate_cycles(
        pools: &[PoolRef],
        base: Address,
        max_hops: usize,
    ) -> Vec<Vec<(PoolRef, Address, Address)>> {
        let mut cycles = Vec::new();
        let mut stack: Vec<(PoolRef, Address, Address)> = Vec::new();

        fn dfs(
            pools: &[PoolRef],
            base: Address,
            here: Address,
            max_hops: usize,
            stack: &mut Vec<(PoolRef, Address, Address)>,
            cycles: &mut Vec<Vec<(PoolRef, Address, Address)>>,
        ) {
            if stack.len() >= max_hops {
                return;
            }
            for pool in pools {
                let next = if pool.token0 == here {
                    pool.token1
                } else if pool.token1 == here {
                    pool.token0
                } else {
                    continue;
                };
                // A pool may appear once per cycle.
                if stack.iter().any(|(used, _, _)| used.address == pool.address) {
                    continue;
                }
                stack.push((pool.clone(), here, next));
                if next == base && stack.len() >= 2 {
                    cycles.push(stack.clone());
                } else if next != base {
                    dfs(pools, base, next, max_hops, stack, cycles);
                }
                stack.pop();
            }
        }

        dfs(pools, base, base, max_hops, &mut stack, &mut cycles);
        cycles
    }

    fn plan_for(
        path: &[(PoolRef, Address, Address)],
        amount_in: U256,
        base: Address,
        provider_id: u8,
    ) -> ExecutionPlan {
        let swaps: Vec<Action> = path
            .iter()
            .map(|(pool, token_in, token_out)| Action::Swap {
                pool: pool.address,
                token_in: *token_in,
                token_out: *token_out,
                amount_in: U256::ZERO, // chained: filled from the previous hop output
                min_out: U256::ZERO,
            })
            .collect();
        // First hop carries the loan principal.
        let mut swaps = swaps;
        if let Some(Action::Swap { amount_in: a, .. }) = swaps.first_mut() {
            *a = amount_in;
        }
        ExecutionPlan::new(vec![Action::FlashLoan {
            provider_id,
            token: base,
            amount: amount_in,
            inner: swaps,
        }])
    }
}

#[async_trait]
impl Evaluator for FlashArbEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::FlashArb
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        // Only re-scan when the trigger touches a protocol we know how to
        // decode; anything else cannot have moved a registered pool.
        let Some(selector) = tx.selector() else {
            return Ok(Vec::new());
        };
        if ctx.protocols.decoder_for(selector).is_none() {
            return Ok(Vec::new());
        }
        let Some(chain) = ctx.chains.get(tx.chain) else {
            return Ok(Vec::new());
        };

        let base = chain.wrapped_native;
        let pools = ctx.protocols.pools_on_chain(tx.chain);
        if pools.len() < 2 {
            return Ok(Vec::new());
        }

        let cycles = Self::enumerate_cycles(&pools, base, self.max_hops as usize);

        let gas_price = tx
            .pricing
            .map(|p| p.price_ceiling())
            .unwrap_or(30_000_000_000);

        let mut best: Option<(U256, usize, U256, Vec<(PoolRef, Address, Address)>)> = None;
        for cycle in cycles {
            let first_pool = &cycle[0].0;
            let Some(state) = ctx.pools.reserves(tx.chain, first_pool.address) else {
                continue;
            };
            let entry_reserve = if cycle[0].1 == first_pool.token0 {
                state.reserve0
            } else {
                state.reserve1
            };
            let gas_cost = U256::from(
                (GAS_FLASHLOAN_BASE + GAS_PER_HOP * cycle.len() as u64) as u128 * gas_price,
            );

            for bps in PROBE_BPS {
                let amount_in = entry_reserve * U256::from(bps) / U256::from(10_000u64);
                if amount_in.is_zero() {
                    continue;
                }
                let Some(out) = Self::quote_cycle(&cycle, amount_in, ctx, tx.chain) else {
                    continue;
                };
                if out <= amount_in {
                    continue;
                }
                let gross = out - amount_in;
                if gross <= gas_cost {
                    continue;
                }
                let net = gross - gas_cost;
                let better = match &best {
                    None => true,
                    Some((best_net, best_hops, _, _)) => {
                        net > *best_net || (net == *best_net && cycle.len() < *best_hops)
                    }
                };
                if better {
                    best = Some((net, cycle.len(), amount_in, cycle.clone()));
                }
            }
        }

        let Some((net, hops, amount_in, cycle)) = best else {
            return Ok(Vec::new());
        };

        let gas_cost = U256::from((GAS_FLASHLOAN_BASE + GAS_PER_HOP * hops as u64) as u128 * gas_price);
        let gross = net + gas_cost;
        let age = ctx.now.saturating_sub(tx.first_seen);
        let conf = confidence(
            0.9,
            ctx.weights.success_rate(StrategyKind::FlashArb),
            age,
            self.tau,
        );

        let opp = Opportunity::new(
            StrategyKind::FlashArb,
            tx.chain,
            vec![tx.fingerprint()],
            gross,
            gas_cost,
            conf,
            amount_in,
            Self::plan_for(&cycle, amount_in, base, self.provider_id),
            ctx.now,
            self.ttl,
        );
        Ok(vec![opp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(addr: u8, t0: Address, t1: Address) -> PoolRef {
        PoolRef {
            protocol: "unified-v2".into(),
            address: Address::repeat_byte(addr),
            token0: t0,
            token1: t1,
            fee_bps: 30,
            pair: None,
        }
    }

    #[test]
    fn enumerates_two_hop_cycles() {
        let base = Address::repeat_byte(0xee);
        let t = Address::repeat_byte(0x01);
        // Two distinct pools over the same pair form one two-hop cycle in
        // each direction of pool order.
        let pools = vec![pool(0x10, base, t), pool(0x11, t, base)];
        let cycles = FlashArbEvaluator::enumerate_cycles(&pools, base, 3);
        assert_eq!(cycles.len(), 2);
        for cycle in &cycles {
            assert_eq!(cycle.len(), 2);
            assert_eq!(cycle.first().unwrap().1, base);
            assert_eq!(cycle.last().unwrap().2, base);
        }
    }

    #[test]
    fn max_hops_bounds_cycle_length() {
        let base = Address::repeat_byte(0xee);
        let a = Address::repeat_byte(0x01);
        let b = Address::repeat_byte(0x02);
        let pools = vec![
            pool(0x10, base, a),
            pool(0x11, a, b),
            pool(0x12, b, base),
        ];
        let three = FlashArbEvaluator::enumerate_cycles(&pools, base, 3);
        assert!(three.iter().any(|c| c.len() == 3));
        let two = FlashArbEvaluator::enumerate_cycles(&pools, base, 2);
        assert!(two.iter().all(|c| c.len() <= 2));
    }

    #[test]
    fn plan_wraps_cycle_in_flash_loan() {
        let base = Address::repeat_byte(0xee);
        let t = Address::repeat_byte(0x01);
        let path = vec![
            (pool(0x10, base, t), base, t),
            (pool(0x11, t, base), t, base),
        ];
        let plan = FlashArbEvaluator::plan_for(&path, U256::from(1_000u64), base, 0);
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            Action::FlashLoan { token, amount, inner, .. } => {
                assert_eq!(*token, base);
                assert_eq!(*amount, U256::from(1_000u64));
                assert_eq!(inner.len(), 2);
            }
            other => panic!("expected flash loan, got {other:?}"),
        }
    }
}
