//! Bundle executor
//!
//! Polls the broker for ranked opportunities, compiles plans into signed
//! type-2 transactions, and races them across the configured private
//! relays. First accept wins; transport failures retry with backoff; a
//! nonce complaint invalidates the local nonce view and surfaces as a
//! retryable failure. Terminal outcomes flow to the tracker, which owns
//! the broker feedback.

mod gas;
mod nonce;
mod relay;
mod signer;

pub use gas::{quote as gas_quote, FeeObserver, GasQuote};
pub use nonce::{NonceSlot, NonceTracker};
pub use relay::RelayClient;
pub use signer::{OperatorSigner, TxRequest};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, U256};
use futures_util::future::select_ok;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::abi::{self, WireAction};
use crate::broker::Broker;
use crate::clock;
use crate::config::{ExecutorCfg, LimitsCfg};
use crate::error::{MipError, MipResult};
use crate::metrics;
use crate::models::{
    Action, BundleState, BundleSubmission, FailureReason, Opportunity, SignedRawTx,
};
use crate::registry::Registry;
use crate::rpc::RpcClient;
use crate::shutdown::ShutdownToken;

/// Terminal or transitional bundle news for the outcome tracker.
#[derive(Debug)]
pub enum ExecutorEvent {
    Submitted(BundleSubmission),
    Failed {
        bundle: BundleSubmission,
        reason: FailureReason,
    },
}

/// One compiled wire transaction before signing.
struct TxIntent {
    to: Address,
    value: U256,
    data: Bytes,
    gas_limit: u64,
}

#[derive(Debug, Default)]
struct ExecutorStats {
    compiled: AtomicU64,
    signed: AtomicU64,
    submitted: AtomicU64,
    rejected: AtomicU64,
    nonce_conflicts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStatsSnapshot {
    pub compiled: u64,
    pub signed: u64,
    pub submitted: u64,
    pub rejected: u64,
    pub nonce_conflicts: u64,
}

pub struct BundleExecutor {
    registry: Arc<Registry>,
    cfg: ExecutorCfg,
    aggregators: HashMap<u32, Address>,
    signer: Arc<OperatorSigner>,
    nonces: Arc<NonceTracker>,
    relays: Vec<Arc<RelayClient>>,
    rpcs: HashMap<u32, Arc<RpcClient>>,
    broker: Arc<Broker>,
    fees: Arc<FeeObserver>,
    events: mpsc::Sender<ExecutorEvent>,
    stats: ExecutorStats,
}

impl BundleExecutor {
    pub fn new(
        registry: Arc<Registry>,
        cfg: ExecutorCfg,
        limits: &LimitsCfg,
        signer: OperatorSigner,
        broker: Arc<Broker>,
        fees: Arc<FeeObserver>,
        events: mpsc::Sender<ExecutorEvent>,
    ) -> MipResult<Self> {
        let submit_timeout = Duration::from_millis(cfg.submit_timeout_ms);
        let relays = cfg
            .relays
            .iter()
            .map(|r| RelayClient::from_config(r, submit_timeout).map(Arc::new))
            .collect::<MipResult<Vec<_>>>()?;

        let mut aggregators = HashMap::new();
        for (chain_str, addr) in &cfg.aggregator {
            let chain: u32 = chain_str
                .parse()
                .map_err(|_| MipError::Config(format!("executor.aggregator: bad chain key {chain_str}")))?;
            aggregators.insert(chain, *addr);
        }

        let rpc_timeout = Duration::from_millis(limits.rpc_timeout_ms);
        let mut rpcs = HashMap::new();
        for chain in registry.chains.snapshot().iter() {
            if let Some(url) = chain.primary_endpoint() {
                rpcs.insert(chain.id, Arc::new(RpcClient::new(url, rpc_timeout)?));
            }
        }

        Ok(Self {
            registry,
            cfg,
            aggregators,
            signer: Arc::new(signer),
            nonces: Arc::new(NonceTracker::new()),
            relays,
            rpcs,
            broker,
            fees,
            events,
            stats: ExecutorStats::default(),
        })
    }

    /// Poll-and-execute loop. On shutdown, in-flight submissions get the
    /// configured flush deadline to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut tasks: JoinSet<()> = JoinSet::new();
        info!(relays = self.relays.len(), "bundle executor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {
                    while let Some(opp) = self.broker.poll(clock::now()) {
                        let exec = self.clone();
                        tasks.spawn(async move { exec.execute(opp).await });
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Flush pending submissions up to the deadline, then abort the rest.
        let deadline = Duration::from_secs(self.cfg.flush_deadline_secs);
        let flush = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(deadline, flush).await.is_err() {
            warn!("flush deadline reached; aborting remaining submissions");
            tasks.abort_all();
        }
        info!("bundle executor stopped");
    }

    async fn execute(&self, opp: Opportunity) {
        let bundle_skeleton = |txs: Vec<SignedRawTx>, start: u64, end: u64| BundleSubmission {
            id: uuid::Uuid::new_v4(),
            opportunity_id: opp.id,
            chain: opp.chain,
            strategy: opp.kind,
            fingerprints: opp.fingerprints.clone(),
            txs,
            target_block_start: start,
            target_block_end: end,
            relays: self.relays.iter().map(|r| r.name.clone()).collect(),
            discovered_at: opp.discovered_at,
            submitted_at: None,
            state: BundleState::Draft,
            estimated_net_profit: opp.net_profit,
        };

        match self.try_execute(&opp).await {
            Ok(bundle) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                metrics::inc1(metrics::EXECUTOR_SUBMISSIONS, "outcome", "submitted");
                let _ = self.events.send(ExecutorEvent::Submitted(bundle)).await;
            }
            Err((reason, err)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                if matches!(reason, FailureReason::NonceConflict) {
                    self.stats.nonce_conflicts.fetch_add(1, Ordering::Relaxed);
                }
                metrics::inc1(metrics::EXECUTOR_SUBMISSIONS, "outcome", reason.as_str());
                metrics::record_error(err.kind());
                warn!(opportunity = %opp.id, reason = reason.as_str(), error = %err, "bundle failed before inclusion");
                let bundle = bundle_skeleton(Vec::new(), 0, 0);
                let _ = self
                    .events
                    .send(ExecutorEvent::Failed { bundle, reason })
                    .await;
            }
        }
    }

    async fn try_execute(
        &self,
        opp: &Opportunity,
    ) -> Result<BundleSubmission, (FailureReason, MipError)> {
        let terminal = |e: MipError| -> (FailureReason, MipError) {
            let reason = match &e {
                MipError::NonceConflict(_) => FailureReason::NonceConflict,
                MipError::RelayRejected(_) => FailureReason::RelayRejected,
                MipError::EndpointUnreachable(_) => FailureReason::Transport,
                _ => FailureReason::Transport,
            };
            (reason, e)
        };

        let chain = self
            .registry
            .chains
            .get(opp.chain)
            .ok_or_else(|| terminal(MipError::Config(format!("unknown chain {}", opp.chain))))?;
        let rpc = self
            .rpcs
            .get(&opp.chain)
            .ok_or_else(|| terminal(MipError::Config(format!("no rpc for chain {}", opp.chain))))?;
        if self.relays.is_empty() {
            return Err(terminal(MipError::Config("no relays configured".into())));
        }

        let intents = self
            .compile_plan(opp)
            .map_err(|e| terminal(e))?;
        self.stats.compiled.fetch_add(1, Ordering::Relaxed);

        // Gas quote anchored on the latest base fee and the live mempool
        // percentile.
        let head_block = rpc.latest_block(false).await.map_err(|e| terminal(e))?;
        let (head, base_fee) = match head_block {
            Some(b) => (
                b.number.saturating_to::<u64>(),
                b.base_fee_per_gas
                    .map(|f| f.saturating_to::<u128>())
                    .unwrap_or(20_000_000_000),
            ),
            None => (0, 20_000_000_000),
        };
        let percentile_fee = self.fees.percentile(self.cfg.gas.percentile);

        // Sign under the per-(chain, sender) lock: the whole bundle takes
        // consecutive nonces with nothing interleaving.
        let mut txs = Vec::with_capacity(intents.len());
        {
            let mut slot = self.nonces.lock(opp.chain, self.signer.address()).await;
            slot.ensure(rpc, self.signer.address())
                .await
                .map_err(|e| terminal(e))?;
            for intent in &intents {
                let gq = gas::quote(
                    &self.cfg.gas,
                    base_fee,
                    percentile_fee,
                    opp.net_profit,
                    intent.gas_limit,
                    chain.max_priority_fee_wei,
                );
                let request = TxRequest {
                    chain_id: opp.chain as u64,
                    nonce: slot.take(),
                    max_priority_fee_per_gas: gq.max_priority_fee_per_gas,
                    max_fee_per_gas: gq.max_fee_per_gas,
                    gas_limit: intent.gas_limit,
                    to: Some(intent.to),
                    value: intent.value,
                    data: intent.data.clone(),
                };
                txs.push(self.signer.sign(&request).map_err(|e| terminal(e))?);
            }
        }
        self.stats.signed.fetch_add(1, Ordering::Relaxed);

        let target_start = head + 1;
        let target_end = head + self.cfg.target_block_window;

        let mut bundle = BundleSubmission {
            id: uuid::Uuid::new_v4(),
            opportunity_id: opp.id,
            chain: opp.chain,
            strategy: opp.kind,
            fingerprints: opp.fingerprints.clone(),
            txs,
            target_block_start: target_start,
            target_block_end: target_end,
            relays: self.relays.iter().map(|r| r.name.clone()).collect(),
            discovered_at: opp.discovered_at,
            submitted_at: None,
            state: BundleState::Signed,
            // estimated profit travels with the bundle for cooldown math
            estimated_net_profit: opp.net_profit,
        };

        self.submit_bundle(&bundle, target_end, opp.chain)
            .await
            .map_err(|e| {
                if matches!(e, MipError::NonceConflict(_)) {
                    // Refresh-from-chain happens on the next signing session.
                    let nonces = self.nonces.clone();
                    let chain_id = opp.chain;
                    let sender = self.signer.address();
                    tokio::spawn(async move {
                        nonces.lock(chain_id, sender).await.invalidate();
                    });
                }
                terminal(e)
            })?;

        bundle.state = BundleState::Submitted;
        bundle.submitted_at = Some(clock::now());
        Ok(bundle)
    }

    /// Race every tx across all relays; first accept wins per tx. Pure
    /// transport failures retry with linear backoff up to the cap.
    async fn submit_bundle(
        &self,
        bundle: &BundleSubmission,
        max_block: u64,
        chain: u32,
    ) -> MipResult<()> {
        for tx in &bundle.txs {
            let mut last_err =
                MipError::EndpointUnreachable("no submission attempted".into());
            let mut accepted = false;

            for attempt in 0..=self.cfg.submit_retries {
                if attempt > 0 {
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                let races: Vec<_> = self
                    .relays
                    .iter()
                    .map(|relay| {
                        let relay = relay.clone();
                        let raw = tx.raw.clone();
                        Box::pin(async move { relay.submit(&raw, max_block).await })
                    })
                    .collect();

                match select_ok(races).await {
                    Ok((hash, _rest)) => {
                        debug!(chain, tx = %tx.hash, relay_ack = %hash, "relay accepted");
                        accepted = true;
                        break;
                    }
                    Err(e) => {
                        // Terminal rejections do not get retried.
                        if !matches!(e, MipError::EndpointUnreachable(_)) {
                            return Err(e);
                        }
                        last_err = e;
                    }
                }
            }
            if !accepted {
                return Err(last_err);
            }
        }
        Ok(())
    }

    /// Compile a plan into wire transactions. Flash loans route through the
    /// operator aggregator; bare calls go straight to their target.
    fn compile_plan(&self, opp: &Opportunity) -> MipResult<Vec<TxIntent>> {
        let aggregator = self.aggregators.get(&opp.chain).copied();
        let need_aggregator = opp
            .plan
            .actions
            .iter()
            .any(|a| !matches!(a, Action::Call { .. }));
        let aggregator = match (need_aggregator, aggregator) {
            (true, None) => {
                return Err(MipError::Config(format!(
                    "no aggregator configured for chain {}",
                    opp.chain
                )))
            }
            (_, addr) => addr.unwrap_or(Address::ZERO),
        };

        let mut intents = Vec::new();
        for action in &opp.plan.actions {
            let intent = match action {
                Action::Call {
                    target,
                    calldata,
                    value,
                } => TxIntent {
                    to: *target,
                    value: *value,
                    data: calldata.clone(),
                    gas_limit: 150_000,
                },
                Action::FlashLoan {
                    provider_id,
                    token,
                    amount,
                    inner,
                } => {
                    let wire = wire_actions(inner)?;
                    TxIntent {
                        to: aggregator,
                        value: U256::ZERO,
                        data: abi::encode_execute_flash_loan(*provider_id, *token, *amount, &wire),
                        gas_limit: 220_000 + 150_000 * wire.len() as u64,
                    }
                }
                Action::Swap { .. } | Action::Bridge { .. } => {
                    let wire = wire_actions(std::slice::from_ref(action))?;
                    TxIntent {
                        to: aggregator,
                        value: U256::ZERO,
                        data: abi::encode_execute_flash_loan(
                            0,
                            Address::ZERO,
                            U256::ZERO,
                            &wire,
                        ),
                        gas_limit: 220_000 + 150_000,
                    }
                }
            };
            intents.push(intent);
        }
        if intents.is_empty() {
            return Err(MipError::InvariantViolation(
                "informational opportunity reached the executor".into(),
            ));
        }
        Ok(intents)
    }

    pub fn stats(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            compiled: self.stats.compiled.load(Ordering::Relaxed),
            signed: self.stats.signed.load(Ordering::Relaxed),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            nonce_conflicts: self.stats.nonce_conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Lower plan actions to aggregator wire actions. Nested flash loans are a
/// plan bug, not something to paper over.
fn wire_actions(actions: &[Action]) -> MipResult<Vec<WireAction>> {
    let mut out = Vec::with_capacity(actions.len());
    for action in actions {
        match action {
            Action::Swap {
                pool,
                token_in,
                token_out,
                amount_in,
                min_out,
            } => {
                let mut data = alloy_primitives::keccak256(
                    "performSwap(address,address,uint256,uint256)".as_bytes(),
                )[..4]
                    .to_vec();
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(token_in.as_slice());
                data.extend_from_slice(&word);
                word = [0u8; 32];
                word[12..].copy_from_slice(token_out.as_slice());
                data.extend_from_slice(&word);
                data.extend_from_slice(&amount_in.to_be_bytes::<32>());
                data.extend_from_slice(&min_out.to_be_bytes::<32>());
                out.push(WireAction {
                    target: *pool,
                    value: U256::ZERO,
                    data: Bytes::from(data),
                });
            }
            Action::Call {
                target,
                calldata,
                value,
            } => out.push(WireAction {
                target: *target,
                value: *value,
                data: calldata.clone(),
            }),
            Action::Bridge {
                src_chain: _,
                dst_chain,
                token,
                amount,
            } => {
                let mut data = alloy_primitives::keccak256(
                    "bridgeOut(uint32,address,uint256)".as_bytes(),
                )[..4]
                    .to_vec();
                data.extend_from_slice(&U256::from(*dst_chain).to_be_bytes::<32>());
                let mut word = [0u8; 32];
                word[12..].copy_from_slice(token.as_slice());
                data.extend_from_slice(&word);
                data.extend_from_slice(&amount.to_be_bytes::<32>());
                out.push(WireAction {
                    target: *token,
                    value: U256::ZERO,
                    data: Bytes::from(data),
                });
            }
            Action::FlashLoan { .. } => {
                return Err(MipError::ProtocolMismatch(
                    "nested flash loan in execution plan".into(),
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_flash_loans_are_rejected() {
        let nested = Action::FlashLoan {
            provider_id: 0,
            token: Address::ZERO,
            amount: U256::ZERO,
            inner: vec![],
        };
        assert!(wire_actions(&[nested]).is_err());
    }

    #[test]
    fn swap_wire_action_targets_pool() {
        let swap = Action::Swap {
            pool: Address::repeat_byte(0x10),
            token_in: Address::repeat_byte(0xaa),
            token_out: Address::repeat_byte(0xbb),
            amount_in: U256::from(7u64),
            min_out: U256::from(5u64),
        };
        let wire = wire_actions(&[swap]).unwrap();
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].target, Address::repeat_byte(0x10));
        // selector + 4 words
        assert_eq!(wire[0].data.len(), 4 + 32 * 4);
    }

    #[test]
    fn call_wire_action_passes_through() {
        let call = Action::Call {
            target: Address::repeat_byte(0x99),
            calldata: Bytes::from(vec![1, 2, 3]),
            value: U256::from(55u64),
        };
        let wire = wire_actions(&[call]).unwrap();
        assert_eq!(wire[0].value, U256::from(55u64));
        assert_eq!(wire[0].data.as_ref(), &[1, 2, 3]);
    }
}
