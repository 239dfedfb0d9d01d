//! Sandwich evaluator
//!
//! Watches decoded router swaps, sizes a front-run against the victim's
//! slippage tolerance, and only emits when the tolerance clears the combined
//! front+back impact by the safety margin. The adverse-reordering guard
//! additionally bounds the loss of an unaccompanied front-run below the
//! expected profit, so a reordered bundle cannot flip the position's sign in
//! expectation.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;

use super::{amount_out, confidence, default_tau, price_impact_bps, EvalContext, Evaluator};
use crate::abi;
use crate::models::{Action, ExecutionPlan, Opportunity, PendingTx, StrategyKind};

/// Front-run size as a fraction of the victim's input, in bps.
const FRONT_RUN_BPS: u32 = 5_000;
/// Gas for front + back legs.
const GAS_SANDWICH: u64 = 380_000;

pub struct SandwichEvaluator {
    safety_margin_bps: u32,
    ttl: Duration,
    tau: Duration,
}

impl SandwichEvaluator {
    pub fn new(safety_margin_bps: u32, ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::Sandwich)
        };
        Self {
            safety_margin_bps,
            ttl,
            tau,
        }
    }
}

/// Everything the math needs for one candidate, pulled out for testability.
struct SandwichQuote {
    front_in: U256,
    gross_profit: U256,
    adverse_loss: U256,
    front_impact_bps: u32,
    back_impact_bps: u32,
    victim_tolerance_bps: u32,
}

fn quote_sandwich(
    victim_in: U256,
    victim_min_out: U256,
    reserve_in: U256,
    reserve_out: U256,
    fee_bps: u32,
) -> Option<SandwichQuote> {
    if reserve_in.is_zero() || reserve_out.is_zero() || victim_in.is_zero() {
        return None;
    }

    let front_in = victim_in * U256::from(FRONT_RUN_BPS) / U256::from(10_000u64);
    if front_in.is_zero() {
        return None;
    }

    // Victim's quoted output on the untouched pool sets their tolerance.
    let victim_quote = amount_out(victim_in, reserve_in, reserve_out, fee_bps);
    let call = abi::SwapCall {
        amount_in: victim_in,
        min_out: victim_min_out,
        path: Vec::new(),
    };
    let victim_tolerance_bps = call.slippage_tolerance_bps(victim_quote);

    // Front leg.
    let front_out = amount_out(front_in, reserve_in, reserve_out, fee_bps);
    if front_out.is_zero() {
        return None;
    }
    let (r_in_1, r_out_1) = (reserve_in + front_in, reserve_out - front_out);

    // Victim leg on the shifted pool; if their min_out fails here the
    // bundle reverts and there is nothing to capture.
    let victim_out = amount_out(victim_in, r_in_1, r_out_1, fee_bps);
    if victim_out < victim_min_out {
        return None;
    }
    let (r_in_2, r_out_2) = (r_in_1 + victim_in, r_out_1 - victim_out);

    // Back leg: sell the front position into the victim-shifted pool.
    let back_out = amount_out(front_out, r_out_2, r_in_2, fee_bps);
    let gross_profit = back_out.saturating_sub(front_in);
    if gross_profit.is_zero() {
        return None;
    }

    // Adverse reordering: the victim never lands, we unwind immediately.
    let unwind_out = amount_out(front_out, reserve_out - front_out, reserve_in + front_in, fee_bps);
    let adverse_loss = front_in.saturating_sub(unwind_out);

    Some(SandwichQuote {
        front_in,
        gross_profit,
        adverse_loss,
        front_impact_bps: price_impact_bps(front_in, reserve_in),
        back_impact_bps: price_impact_bps(victim_in, r_in_1),
        victim_tolerance_bps,
    })
}

#[async_trait]
impl Evaluator for SandwichEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Sandwich
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        let Some(selector) = tx.selector() else {
            return Ok(Vec::new());
        };
        // Only the swap shapes we can decode are sandwichable.
        match ctx.protocols.decoder_for(selector) {
            Some((_, "swap_exact_tokens")) => {}
            _ => return Ok(Vec::new()),
        }
        let Some(call) = abi::decode_swap_exact_tokens(&tx.input) else {
            return Ok(Vec::new());
        };
        if call.path.len() < 2 {
            return Ok(Vec::new());
        }
        let (token_in, token_out) = (call.path[0], call.path[1]);

        // First hop pool for the victim's pair.
        let pools = ctx.protocols.pools_on_chain(tx.chain);
        let Some(pool) = pools.iter().find(|p| {
            (p.token0 == token_in && p.token1 == token_out)
                || (p.token1 == token_in && p.token0 == token_out)
        }) else {
            return Ok(Vec::new());
        };
        let Some(state) = ctx.pools.reserves(tx.chain, pool.address) else {
            return Ok(Vec::new());
        };
        let (reserve_in, reserve_out) = if token_in == pool.token0 {
            (state.reserve0, state.reserve1)
        } else {
            (state.reserve1, state.reserve0)
        };

        let Some(quote) = quote_sandwich(
            call.amount_in,
            call.min_out,
            reserve_in,
            reserve_out,
            pool.fee_bps,
        ) else {
            return Ok(Vec::new());
        };

        // Tolerance must clear the combined impact by the safety margin.
        let needed = quote
            .front_impact_bps
            .saturating_add(quote.back_impact_bps)
            .saturating_add(self.safety_margin_bps);
        if quote.victim_tolerance_bps < needed {
            return Ok(Vec::new());
        }

        let gas_price = tx
            .pricing
            .map(|p| p.price_ceiling())
            .unwrap_or(30_000_000_000);
        let gas_cost = U256::from(GAS_SANDWICH as u128 * gas_price);
        if quote.gross_profit <= gas_cost {
            return Ok(Vec::new());
        }
        let net = quote.gross_profit - gas_cost;

        // Adverse-reordering guard: an unaccompanied front-run may not cost
        // more than the profit we expect when the victim lands.
        if quote.adverse_loss >= net {
            return Ok(Vec::new());
        }

        let age = ctx.now.saturating_sub(tx.first_seen);
        let conf = confidence(
            0.85,
            ctx.weights.success_rate(StrategyKind::Sandwich),
            age,
            self.tau,
        );

        let plan = ExecutionPlan::new(vec![
            Action::Swap {
                pool: pool.address,
                token_in,
                token_out,
                amount_in: quote.front_in,
                min_out: U256::ZERO,
            },
            Action::Swap {
                pool: pool.address,
                token_in: token_out,
                token_out: token_in,
                amount_in: U256::ZERO, // whatever the front leg bought
                min_out: quote.front_in,
            },
        ]);

        let opp = Opportunity::new(
            StrategyKind::Sandwich,
            tx.chain,
            vec![tx.fingerprint()],
            quote.gross_profit,
            gas_cost,
            conf,
            quote.front_in,
            plan,
            ctx.now,
            self.ttl,
        );
        Ok(vec![opp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const R: u64 = 1_000_000_000;

    #[test]
    fn tight_slippage_yields_nothing() {
        // Victim accepts no slippage at all: min_out == quote.
        let quote_out = amount_out(
            U256::from(10_000_000u64),
            U256::from(R),
            U256::from(R),
            30,
        );
        let q = quote_sandwich(
            U256::from(10_000_000u64),
            quote_out,
            U256::from(R),
            U256::from(R),
            30,
        );
        // The victim's leg fails once the pool is shifted.
        assert!(q.is_none());
    }

    #[test]
    fn loose_slippage_produces_profit() {
        let victim_in = U256::from(50_000_000u64);
        // Victim tolerates 10% below quote.
        let quote_out = amount_out(victim_in, U256::from(R), U256::from(R), 30);
        let min_out = quote_out * U256::from(9_000u64) / U256::from(10_000u64);
        let q = quote_sandwich(victim_in, min_out, U256::from(R), U256::from(R), 30)
            .expect("sandwichable");
        assert!(q.gross_profit > U256::ZERO);
        assert!(q.victim_tolerance_bps >= 990);
        assert!(q.front_impact_bps > 0);
        // Adverse unwind costs something but far less than the principal.
        assert!(q.adverse_loss > U256::ZERO);
        assert!(q.adverse_loss < q.front_in / U256::from(10u64));
    }

    #[test]
    fn empty_pool_is_skipped() {
        assert!(quote_sandwich(
            U256::from(1_000u64),
            U256::ZERO,
            U256::ZERO,
            U256::from(R),
            30
        )
        .is_none());
    }
}
