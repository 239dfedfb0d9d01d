//! Strategy runner
//!
//! One task per enabled strategy: pull from its dispatcher subscription,
//! evaluate inside the per-call budget, gate executable opportunities
//! through a simulation pass, and hand survivors to the broker. Evaluator
//! errors and deadline overruns are caught, logged with the fingerprint and
//! counted; they never take the task down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{amount_out, ContextBuilder, EvalContext, Evaluator};
use super::{
    CrossChainArbEvaluator, FlashArbEvaluator, GovernanceEvaluator, LiquidationEvaluator,
    OracleDeviationEvaluator, SandwichEvaluator,
};
use crate::broker::Broker;
use crate::config::MipConfig;
use crate::dispatch::Dispatcher;
use crate::metrics;
use crate::models::{Action, Opportunity, StrategyKind};
use crate::sandbox::{FsCapability, RuntimeKind, SandboxFailure, SandboxManifest, TrapReason};
use crate::shutdown::ShutdownToken;

#[derive(Debug)]
pub struct StrategyStatus {
    pub kind: StrategyKind,
    pub enabled: AtomicBool,
    pub evaluations: AtomicU64,
    pub opportunities: AtomicU64,
    pub failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub sim_rejects: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyStatusSnapshot {
    pub kind: StrategyKind,
    pub enabled: bool,
    pub evaluations: u64,
    pub opportunities: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub sim_rejects: u64,
}

impl StrategyStatus {
    fn new(kind: StrategyKind, enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(enabled),
            evaluations: AtomicU64::new(0),
            opportunities: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            sim_rejects: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> StrategyStatusSnapshot {
        StrategyStatusSnapshot {
            kind: self.kind,
            enabled: self.enabled.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            opportunities: self.opportunities.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            sim_rejects: self.sim_rejects.load(Ordering::Relaxed),
        }
    }
}

/// Handle for the control plane: list and toggle strategies.
#[derive(Clone, Default)]
pub struct StrategySet {
    statuses: Vec<Arc<StrategyStatus>>,
}

impl StrategySet {
    pub fn get(&self, kind: StrategyKind) -> Option<&Arc<StrategyStatus>> {
        self.statuses.iter().find(|s| s.kind == kind)
    }

    /// Returns false for unknown/unspawned kinds.
    pub fn toggle(&self, kind: StrategyKind, enabled: bool) -> bool {
        match self.get(kind) {
            Some(status) => {
                status.enabled.store(enabled, Ordering::Relaxed);
                info!(strategy = %kind, enabled, "strategy toggled");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<StrategyStatusSnapshot> {
        self.statuses.iter().map(|s| s.snapshot()).collect()
    }
}

/// Optional per-strategy sandboxed pre-submit simulation.
struct SimGate {
    manifest: Option<SandboxManifest>,
}

impl SimGate {
    fn from_config(cfg: &MipConfig, kind: StrategyKind) -> SimGate {
        let params = cfg.strategy(kind).params;
        let manifest = match (params.sim_artifact, params.sim_digest) {
            (Some(artifact), Some(digest_hex)) => {
                let digest: B256 = digest_hex
                    .trim_start_matches("0x")
                    .parse()
                    .unwrap_or(B256::ZERO);
                let path = cfg.sandbox.artifact_root.join(artifact);
                let runtime = if path.extension().and_then(|e| e.to_str()) == Some("wasm") {
                    RuntimeKind::Wasm
                } else {
                    RuntimeKind::NativeProcess
                };
                Some(SandboxManifest {
                    runtime,
                    artifact: path,
                    digest,
                    memory_cap_mib: cfg.sandbox.memory_cap_mib,
                    timeout: Duration::from_secs(cfg.sandbox.timeout_secs),
                    fuel_cap: cfg.sandbox.fuel_cap,
                    fs: FsCapability::None,
                    // Evaluator sandboxes never get the network.
                    allow_network: false,
                })
            }
            _ => None,
        };
        SimGate { manifest }
    }

    /// True when the opportunity survives simulation. Fuel exhaustion is a
    /// decisive "not profitable": no retry with a larger budget.
    async fn admit(&self, opp: &Opportunity, ctx: &EvalContext, status: &StrategyStatus) -> bool {
        let verdict = match &self.manifest {
            Some(manifest) => {
                let input = json!({
                    "chain": opp.chain,
                    "strategy": opp.kind,
                    "gross_profit": opp.gross_profit.to_string(),
                    "gas_cost": opp.gas_cost.to_string(),
                    "plan": opp.plan,
                });
                let payload = serde_json::to_vec(&input).unwrap_or_default();
                match ctx.sandbox.run(manifest, &payload).await {
                    Ok(output) => parse_sim_verdict(&output),
                    Err(SandboxFailure::Trap(TrapReason::Fuel)) => {
                        debug!(id = %opp.id, "simulation exhausted fuel: not profitable");
                        false
                    }
                    Err(e) => {
                        debug!(id = %opp.id, error = %e, "simulation failed");
                        false
                    }
                }
            }
            None => resimulate_locally(opp, ctx),
        };
        if !verdict {
            status.sim_rejects.fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }
}

fn parse_sim_verdict(output: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(output)
        .ok()
        .and_then(|v| v.get("profitable").and_then(|p| p.as_bool()))
        .unwrap_or(false)
}

/// Deterministic local re-check of a plan against the current pool view.
/// Swap legs must still clear their min_out on today's reserves.
fn resimulate_locally(opp: &Opportunity, ctx: &EvalContext) -> bool {
    fn check(actions: &[Action], chain: u32, ctx: &EvalContext) -> bool {
        for action in actions {
            match action {
                Action::Swap {
                    pool,
                    token_in: _,
                    token_out: _,
                    amount_in,
                    min_out,
                } => {
                    if amount_in.is_zero() {
                        continue; // chained hop, sized at execution time
                    }
                    let Some(state) = ctx.pools.reserves(chain, *pool) else {
                        return false;
                    };
                    let out = amount_out(*amount_in, state.reserve0, state.reserve1, 30);
                    let out_rev = amount_out(*amount_in, state.reserve1, state.reserve0, 30);
                    if out < *min_out && out_rev < *min_out {
                        return false;
                    }
                }
                Action::FlashLoan { inner, .. } => {
                    if !check(inner, chain, ctx) {
                        return false;
                    }
                }
                Action::Call { .. } | Action::Bridge { .. } => {}
            }
        }
        true
    }
    check(&opp.plan.actions, opp.chain, ctx)
}

fn build_evaluator(cfg: &MipConfig, kind: StrategyKind) -> Arc<dyn Evaluator> {
    let params = cfg.strategy(kind).params;
    let ttl = Duration::from_secs_f64(params.opportunity_ttl_secs);
    match kind {
        StrategyKind::FlashArb => Arc::new(FlashArbEvaluator::new(params.max_hops, ttl, params.tau_secs)),
        StrategyKind::Sandwich => Arc::new(SandwichEvaluator::new(
            params.safety_margin_bps,
            ttl,
            params.tau_secs,
        )),
        StrategyKind::Liquidation => Arc::new(LiquidationEvaluator::new(
            params.health_epsilon,
            ttl,
            params.tau_secs,
        )),
        StrategyKind::CrosschainArb => Arc::new(CrossChainArbEvaluator::new(
            params.bridge_latency_budget_secs,
            ttl,
            params.tau_secs,
        )),
        StrategyKind::OracleDeviation => {
            Arc::new(OracleDeviationEvaluator::new(ttl, params.tau_secs))
        }
        StrategyKind::Governance => Arc::new(GovernanceEvaluator::new(ttl, params.tau_secs)),
    }
}

/// Spawn every configured strategy. Returns the control handle and the task
/// handles for shutdown joining.
pub fn spawn_strategies(
    cfg: &MipConfig,
    dispatcher: &Arc<Dispatcher>,
    broker: Arc<Broker>,
    builder: Arc<ContextBuilder>,
    shutdown: &crate::shutdown::Shutdown,
) -> (StrategySet, Vec<JoinHandle<()>>) {
    let budget = Duration::from_millis(cfg.limits.evaluator_budget_ms);
    let capacity = cfg.limits.dispatcher_ring_capacity;

    let mut statuses = Vec::new();
    let mut handles = Vec::new();

    for kind in StrategyKind::ALL {
        let strategy_cfg = cfg.strategy(kind);
        let status = StrategyStatus::new(kind, strategy_cfg.enabled);
        statuses.push(status.clone());

        let evaluator = build_evaluator(cfg, kind);
        let gate = SimGate::from_config(cfg, kind);
        let sub = dispatcher.subscribe(kind.as_str(), evaluator.filter(), capacity);
        let broker = broker.clone();
        let builder = builder.clone();
        let token = shutdown.token();

        handles.push(tokio::spawn(run_strategy(
            evaluator, status, gate, sub, broker, builder, budget, token,
        )));
    }

    (StrategySet { statuses }, handles)
}

#[allow(clippy::too_many_arguments)]
async fn run_strategy(
    evaluator: Arc<dyn Evaluator>,
    status: Arc<StrategyStatus>,
    gate: SimGate,
    mut sub: crate::dispatch::SubscriptionHandle,
    broker: Arc<Broker>,
    builder: Arc<ContextBuilder>,
    budget: Duration,
    mut shutdown: ShutdownToken,
) {
    let kind = evaluator.kind();
    info!(strategy = %kind, "evaluator started");

    loop {
        let tx = tokio::select! {
            _ = shutdown.cancelled() => break,
            maybe = sub.recv() => match maybe {
                Some(tx) => tx,
                None => break,
            },
        };

        if !status.enabled.load(Ordering::Relaxed) {
            continue;
        }

        status.evaluations.fetch_add(1, Ordering::Relaxed);
        let ctx = builder.snapshot();
        let fingerprint = tx.fingerprint();

        let opportunities =
            match tokio::time::timeout(budget, evaluator.evaluate(tx.clone(), &ctx)).await {
                Ok(Ok(opps)) => opps,
                Ok(Err(e)) => {
                    status.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::inc2(metrics::EVALUATOR_FAILURES, "strategy", kind.as_str(), "reason", "error");
                    warn!(strategy = %kind, %fingerprint, error = %e, "evaluator failed");
                    continue;
                }
                Err(_) => {
                    status.timeouts.fetch_add(1, Ordering::Relaxed);
                    status.failures.fetch_add(1, Ordering::Relaxed);
                    metrics::inc2(metrics::EVALUATOR_FAILURES, "strategy", kind.as_str(), "reason", "deadline");
                    warn!(strategy = %kind, %fingerprint, budget_ms = budget.as_millis() as u64,
                          "evaluator exceeded budget; cancelled");
                    continue;
                }
            };

        for opp in opportunities {
            // Executable opportunities must survive a simulation pass
            // before the broker ever sees them.
            if !opp.is_informational() && !gate.admit(&opp, &ctx, &status).await {
                continue;
            }
            status.opportunities.fetch_add(1, Ordering::Relaxed);
            metrics::inc1(metrics::EVALUATOR_OPPORTUNITIES, "strategy", kind.as_str());
            broker.submit(opp, crate::clock::now());
        }
    }

    info!(strategy = %kind, "evaluator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_verdict_parses_strictly() {
        assert!(parse_sim_verdict(br#"{"profitable": true}"#));
        assert!(!parse_sim_verdict(br#"{"profitable": false}"#));
        assert!(!parse_sim_verdict(br#"{"something": 1}"#));
        assert!(!parse_sim_verdict(b"garbage"));
        assert!(!parse_sim_verdict(b""));
    }

    #[test]
    fn strategy_set_toggles_known_kinds() {
        let set = StrategySet {
            statuses: vec![StrategyStatus::new(StrategyKind::Sandwich, true)],
        };
        assert!(set.toggle(StrategyKind::Sandwich, false));
        assert!(!set.get(StrategyKind::Sandwich).unwrap().enabled.load(Ordering::Relaxed));
        assert!(!set.toggle(StrategyKind::FlashArb, true));
    }
}
