//! Oracle deviation evaluator
//!
//! A gate, not a money-maker: when an asset's on-chain and CEX prices
//! disagree past the threshold, it emits an informational opportunity so the
//! control plane and the other strategies see the regime change. It never
//! produces a bundle.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;

use super::{confidence, default_tau, EvalContext, Evaluator};
use crate::models::{ExecutionPlan, Opportunity, PendingTx, StrategyKind};

pub struct OracleDeviationEvaluator {
    ttl: Duration,
    tau: Duration,
}

impl OracleDeviationEvaluator {
    pub fn new(ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::OracleDeviation)
        };
        Self { ttl, tau }
    }
}

#[async_trait]
impl Evaluator for OracleDeviationEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OracleDeviation
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        // Activation requires a protocol-touching transaction AND at least
        // one deviating asset; otherwise this strategy stays silent.
        let Some(selector) = tx.selector() else {
            return Ok(Vec::new());
        };
        if ctx.protocols.decoder_for(selector).is_none() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for flag in ctx.oracle.flags() {
            if !flag.deviating {
                continue;
            }
            let spread = if flag.cex_price > 0.0 {
                ((flag.onchain_price - flag.cex_price) / flag.cex_price).abs()
            } else {
                0.0
            };

            let age = ctx.now.saturating_sub(tx.first_seen);
            let conf = confidence(
                spread.min(1.0).max(0.1),
                ctx.weights.success_rate(StrategyKind::OracleDeviation),
                age,
                self.tau,
            );

            out.push(
                Opportunity::new(
                    StrategyKind::OracleDeviation,
                    tx.chain,
                    vec![tx.fingerprint()],
                    U256::ZERO,
                    U256::ZERO,
                    conf,
                    U256::ZERO,
                    ExecutionPlan::default(),
                    ctx.now,
                    self.ttl,
                )
                .with_note(format!(
                    "asset={} onchain={:.4} cex={:.4}",
                    flag.asset, flag.onchain_price, flag.cex_price
                )),
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_gate_is_informational() {
        let opp = Opportunity::new(
            StrategyKind::OracleDeviation,
            1,
            vec![],
            U256::ZERO,
            U256::ZERO,
            0.4,
            U256::ZERO,
            ExecutionPlan::default(),
            crate::clock::now(),
            Duration::from_secs(10),
        )
        .with_note("asset=ETH");
        assert!(opp.is_informational());
        assert_eq!(opp.net_profit, U256::ZERO);
        assert_eq!(opp.note.as_deref(), Some("asset=ETH"));
    }
}
