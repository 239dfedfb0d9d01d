//! Governance watcher
//!
//! Scans pending calldata for registered governor selectors and emits
//! severity-tagged informational opportunities. Nothing here ever builds a
//! bundle; the value is the early warning.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;

use super::{confidence, default_tau, EvalContext, Evaluator};
use crate::models::{ExecutionPlan, Opportunity, PendingTx, StrategyKind};

pub struct GovernanceEvaluator {
    ttl: Duration,
    tau: Duration,
}

impl GovernanceEvaluator {
    pub fn new(ttl: Duration, tau_override: f64) -> Self {
        let tau = if tau_override > 0.0 {
            Duration::from_secs_f64(tau_override)
        } else {
            default_tau(StrategyKind::Governance)
        };
        Self { ttl, tau }
    }

    /// Execution-class actions rank above proposals and votes.
    fn severity(decoder: &str) -> &'static str {
        match decoder {
            d if d.contains("execute") || d.contains("queue") => "high",
            d if d.contains("propose") => "medium",
            _ => "low",
        }
    }
}

#[async_trait]
impl Evaluator for GovernanceEvaluator {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Governance
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>> {
        let Some(selector) = tx.selector() else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for (sel, protocol, decoder) in ctx.protocols.governor_selectors() {
            if sel != selector {
                continue;
            }
            // If the protocol pins a governor address, the call must target it.
            if let Some(entry) = ctx
                .protocols
                .get(&protocol)
                .and_then(|p| p.on_chain(tx.chain))
            {
                if let Some(governor) = entry.governor {
                    if tx.to != Some(governor) {
                        continue;
                    }
                }
            }

            let age = ctx.now.saturating_sub(tx.first_seen);
            let conf = confidence(
                1.0,
                ctx.weights.success_rate(StrategyKind::Governance),
                age,
                self.tau,
            );

            out.push(
                Opportunity::new(
                    StrategyKind::Governance,
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
                    "severity={} protocol={protocol} action={decoder}",
                    Self::severity(&decoder)
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
    fn severity_ranks_execution_highest() {
        assert_eq!(GovernanceEvaluator::severity("execute_proposal"), "high");
        assert_eq!(GovernanceEvaluator::severity("queue_proposal"), "high");
        assert_eq!(GovernanceEvaluator::severity("propose"), "medium");
        assert_eq!(GovernanceEvaluator::severity("cast_vote"), "low");
    }
}
