//! Strategy evaluators
//!
//! Six fixed strategy kinds behind one `Evaluator` contract. Evaluators are
//! pure with respect to the registry and oracle snapshots taken at entry;
//! the only shared state they may reach is read-only views refreshed by
//! background pollers.

mod cross_chain;
mod flash_arb;
mod governance;
mod liquidation;
mod oracle_deviation;
mod runner;
mod sandwich;
mod views;

pub use cross_chain::CrossChainArbEvaluator;
pub use flash_arb::FlashArbEvaluator;
pub use governance::GovernanceEvaluator;
pub use liquidation::LiquidationEvaluator;
pub use oracle_deviation::OracleDeviationEvaluator;
pub use runner::{spawn_strategies, StrategySet, StrategyStatus, StrategyStatusSnapshot};
pub use sandwich::SandwichEvaluator;
pub use views::{AccountHealth, LendingView, PoolState, PoolStateView};

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use async_trait::async_trait;

use crate::clock::MonoTime;
use crate::dispatch::FilterSpec;
use crate::models::{Opportunity, PendingTx, StrategyKind};
use crate::oracle::OracleMonitor;
use crate::outcome::RollingWindows;
use crate::registry::{ChainSet, ProtocolSet, Registry};
use crate::sandbox::Sandbox;

/// Read-only context handed to an evaluator for one transaction. The
/// registry snapshots are taken when the context is built and stay
/// consistent for the whole evaluation.
pub struct EvalContext {
    pub chains: Arc<ChainSet>,
    pub protocols: Arc<ProtocolSet>,
    pub oracle: Arc<OracleMonitor>,
    pub weights: Arc<RollingWindows>,
    pub sandbox: Arc<Sandbox>,
    pub pools: Arc<PoolStateView>,
    pub lending: Arc<LendingView>,
    pub now: MonoTime,
}

/// Builds a fresh snapshot context per evaluation.
pub struct ContextBuilder {
    pub registry: Arc<Registry>,
    pub oracle: Arc<OracleMonitor>,
    pub weights: Arc<RollingWindows>,
    pub sandbox: Arc<Sandbox>,
    pub pools: Arc<PoolStateView>,
    pub lending: Arc<LendingView>,
}

impl ContextBuilder {
    pub fn snapshot(&self) -> EvalContext {
        EvalContext {
            chains: self.registry.chains.snapshot(),
            protocols: self.registry.protocols.snapshot(),
            oracle: self.oracle.clone(),
            weights: self.weights.clone(),
            sandbox: self.sandbox.clone(),
            pools: self.pools.clone(),
            lending: self.lending.clone(),
            now: crate::clock::now(),
        }
    }
}

/// The evaluator contract. Implementations must not mutate shared state and
/// must stay within the per-call budget enforced by the runner.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Dispatcher-side filter; defaults to everything.
    fn filter(&self) -> FilterSpec {
        FilterSpec::default()
    }

    async fn evaluate(
        &self,
        tx: Arc<PendingTx>,
        ctx: &EvalContext,
    ) -> anyhow::Result<Vec<Opportunity>>;
}

/// Strategy-specific staleness time constants.
pub fn default_tau(kind: StrategyKind) -> Duration {
    match kind {
        StrategyKind::Sandwich => Duration::from_secs(2),
        StrategyKind::FlashArb => Duration::from_secs(5),
        StrategyKind::OracleDeviation => Duration::from_secs(10),
        StrategyKind::Liquidation => Duration::from_secs(30),
        StrategyKind::CrosschainArb => Duration::from_secs(60),
        StrategyKind::Governance => Duration::from_secs(300),
    }
}

/// Confidence = simulation likelihood x rolling success rate x staleness,
/// where staleness decays as exp(-age/tau).
pub fn confidence(sim_likelihood: f64, rolling_success: f64, age_ns: u64, tau: Duration) -> f64 {
    let tau_ns = tau.as_nanos().max(1) as f64;
    let staleness = (-(age_ns as f64) / tau_ns).exp();
    (sim_likelihood.clamp(0.0, 1.0) * rolling_success.clamp(0.0, 1.0) * staleness).clamp(0.0, 1.0)
}

/// Constant-product swap output with a basis-point fee on the input.
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }
    let fee_num = U256::from(10_000u64 - fee_bps as u64);
    let in_with_fee = amount_in * fee_num;
    let numerator = in_with_fee * reserve_out;
    let denominator = reserve_in * U256::from(10_000u64) + in_with_fee;
    numerator / denominator
}

/// Relative price impact of swapping `amount_in` into a pool, in basis
/// points of the pre-trade marginal price.
pub fn price_impact_bps(amount_in: U256, reserve_in: U256) -> u32 {
    if reserve_in.is_zero() {
        return 10_000;
    }
    let scaled = amount_in.saturating_mul(U256::from(10_000u64)) / (reserve_in + amount_in);
    scaled.saturating_to::<u64>().min(10_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_decays_with_age() {
        let tau = Duration::from_secs(2);
        let fresh = confidence(0.9, 0.8, 0, tau);
        let old = confidence(0.9, 0.8, Duration::from_secs(4).as_nanos() as u64, tau);
        assert!((fresh - 0.72).abs() < 1e-9);
        assert!(old < fresh);
        // Two taus of age is e^-2.
        assert!((old - 0.72 * (-2.0f64).exp()).abs() < 1e-9);
    }

    #[test]
    fn amount_out_matches_constant_product() {
        // 1 in on a 100/100 pool with no fee: out = 100*1/101.
        let out = amount_out(
            U256::from(1_000_000u64),
            U256::from(100_000_000u64),
            U256::from(100_000_000u64),
            0,
        );
        assert_eq!(out, U256::from(990_099u64));

        // The 30 bps fee strictly reduces output.
        let with_fee = amount_out(
            U256::from(1_000_000u64),
            U256::from(100_000_000u64),
            U256::from(100_000_000u64),
            30,
        );
        assert!(with_fee < out);
    }

    #[test]
    fn empty_pool_yields_nothing() {
        assert_eq!(
            amount_out(U256::from(5u64), U256::ZERO, U256::from(10u64), 30),
            U256::ZERO
        );
    }

    #[test]
    fn price_impact_grows_with_size() {
        let r = U256::from(1_000_000u64);
        let small = price_impact_bps(U256::from(1_000u64), r);
        let large = price_impact_bps(U256::from(500_000u64), r);
        assert!(small < large);
        assert!(large <= 10_000);
    }
}
