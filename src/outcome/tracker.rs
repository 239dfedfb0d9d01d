//! Outcome tracker
//!
//! Watches new block headers, matches submitted bundles against block
//! contents, realizes profit from `ProfitReported` logs, and feeds the
//! results back: cooldowns to the broker, rolling windows to the
//! evaluators, append-only records to the ledger. Also the component that
//! tells the normalizer which transactions confirmed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{OutcomeStore, RollingWindows};
use crate::abi;
use crate::broker::Broker;
use crate::clock;
use crate::error::MipResult;
use crate::executor::ExecutorEvent;
use crate::ingress::Normalizer;
use crate::metrics;
use crate::models::{
    u256_to_f64, BundleState, BundleSubmission, FailureReason, OutcomeRecord,
};
use crate::oracle::OracleMonitor;
use crate::registry::{ChainDescriptor, Registry};
use crate::rpc::{RpcClient, WsSubscription};
use crate::shutdown::ShutdownToken;

const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct OutcomeTracker {
    registry: Arc<Registry>,
    rpcs: HashMap<u32, Arc<RpcClient>>,
    windows: Arc<RollingWindows>,
    store: OutcomeStore,
    broker: Arc<Broker>,
    normalizer: Arc<Normalizer>,
    oracle: Arc<OracleMonitor>,
    pending: Mutex<Vec<BundleSubmission>>,
}

impl OutcomeTracker {
    pub fn new(
        registry: Arc<Registry>,
        windows: Arc<RollingWindows>,
        store: OutcomeStore,
        broker: Arc<Broker>,
        normalizer: Arc<Normalizer>,
        oracle: Arc<OracleMonitor>,
        rpc_timeout: Duration,
    ) -> MipResult<Arc<Self>> {
        let mut rpcs = HashMap::new();
        for chain in registry.chains.snapshot().iter() {
            if let Some(url) = chain.primary_endpoint() {
                rpcs.insert(chain.id, Arc::new(RpcClient::new(url, rpc_timeout)?));
            }
        }
        Ok(Arc::new(Self {
            registry,
            rpcs,
            windows,
            store,
            broker,
            normalizer,
            oracle,
            pending: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn one newHeads watcher per configured chain.
    pub fn spawn_head_watchers(self: &Arc<Self>, stage: &crate::shutdown::Shutdown) {
        for chain in self.registry.chains.snapshot().iter() {
            let tracker = self.clone();
            let chain = chain.clone();
            let token = stage.token();
            tokio::spawn(async move {
                tracker.watch_heads(chain, token).await;
            });
        }
    }

    /// Event loop over the executor stream. On shutdown the channel is
    /// drained for a final pass before exit.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ExecutorEvent>,
        mut shutdown: ShutdownToken,
    ) {
        info!("outcome tracker started");

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    // Final pass: drain whatever the executor flushed.
                    events.close();
                    while let Some(event) = events.recv().await {
                        self.handle_event(event).await;
                    }
                    break;
                }
            }
        }
        info!("outcome tracker stopped");
    }

    async fn handle_event(&self, event: ExecutorEvent) {
        match event {
            ExecutorEvent::Submitted(bundle) => {
                debug!(bundle = %bundle.id, chain = bundle.chain, "tracking submitted bundle");
                self.pending.lock().push(bundle);
            }
            ExecutorEvent::Failed { mut bundle, reason } => {
                bundle.state = BundleState::Rejected;
                self.finalize(bundle, None, 0, 0, Some(reason)).await;
            }
        }
    }

    /// Per-chain newHeads subscription with reconnect.
    async fn watch_heads(&self, chain: Arc<ChainDescriptor>, mut shutdown: ShutdownToken) {
        let Some(ws_url) = chain.websocket_endpoint().map(str::to_string) else {
            warn!(chain = chain.id, "no websocket endpoint; inclusion detection disabled");
            return;
        };
        let mut backoff = crate::adapters::Backoff::reconnect();

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let mut sub = match WsSubscription::open(&ws_url, "newHeads", WS_HANDSHAKE_TIMEOUT)
                .await
            {
                Ok(s) => {
                    backoff.reset();
                    s
                }
                Err(e) => {
                    warn!(chain = chain.id, error = %e, "newHeads subscribe failed");
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            loop {
                let head = tokio::select! {
                    _ = shutdown.cancelled() => {
                        sub.close().await;
                        return;
                    }
                    h = sub.next() => h,
                };
                match head {
                    Some(value) => {
                        if let Some(number) = parse_head_number(&value) {
                            self.process_block(&chain, number).await;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    async fn process_block(&self, chain: &ChainDescriptor, number: u64) {
        let Some(rpc) = self.rpcs.get(&chain.id) else {
            return;
        };
        let block = match rpc.get_block_by_number(number, true).await {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                debug!(chain = chain.id, number, error = %e, "block fetch failed");
                return;
            }
        };

        let hashes = block.transactions.hashes();
        for hash in &hashes {
            self.normalizer.mark_confirmed(chain.id, *hash);
        }

        // Pull out bundles resolved by this block.
        let resolved: Vec<BundleSubmission> = {
            let mut pending = self.pending.lock();
            let mut resolved = Vec::new();
            let mut keep = Vec::with_capacity(pending.len());
            for bundle in pending.drain(..) {
                if bundle.chain != chain.id {
                    keep.push(bundle);
                    continue;
                }
                let landed = bundle.txs.iter().any(|tx| hashes.contains(&tx.hash));
                if landed || number > bundle.target_block_end {
                    resolved.push(bundle);
                } else {
                    keep.push(bundle);
                }
            }
            *pending = keep;
            resolved
        };

        for mut bundle in resolved {
            let landed = bundle.txs.iter().any(|tx| hashes.contains(&tx.hash));
            if landed {
                self.realize_inclusion(chain, bundle, number).await;
            } else {
                debug!(bundle = %bundle.id, number, "bundle expired past target range");
                bundle.state = BundleState::Expired;
                metrics::inc1(metrics::EXECUTOR_SUBMISSIONS, "outcome", "expired");
                self.finalize(bundle, None, 0, 0, Some(FailureReason::Expired))
                    .await;
            }
        }
    }

    async fn realize_inclusion(
        &self,
        chain: &ChainDescriptor,
        mut bundle: BundleSubmission,
        block_number: u64,
    ) {
        let Some(rpc) = self.rpcs.get(&chain.id) else {
            return;
        };

        let mut gas_used = 0u64;
        let mut gas_paid: i128 = 0;
        let mut profit: i128 = 0;
        let mut reverted = false;

        for tx in &bundle.txs {
            match rpc.get_transaction_receipt(tx.hash).await {
                Ok(Some(receipt)) => {
                    let used: u64 = receipt.gas_used.saturating_to();
                    gas_used += used;
                    let price: u128 = receipt
                        .effective_gas_price
                        .map(|p| p.saturating_to())
                        .unwrap_or(0);
                    gas_paid += (used as u128 * price) as i128;
                    if !receipt.succeeded() {
                        reverted = true;
                    }
                    for log in &receipt.logs {
                        if let Some((token, amount)) = abi::decode_profit_reported(log) {
                            profit += self.profit_in_base(chain, token, amount);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    debug!(tx = %tx.hash, error = %e, "receipt fetch failed");
                }
            }
        }

        let realized = profit - gas_paid;
        if reverted {
            bundle.state = BundleState::Rejected;
            metrics::inc1(metrics::EXECUTOR_SUBMISSIONS, "outcome", "reverted");
            self.finalize(
                bundle,
                Some(block_number),
                gas_used,
                -gas_paid,
                Some(FailureReason::Reverted),
            )
            .await;
        } else {
            bundle.state = BundleState::Included;
            metrics::inc1(metrics::EXECUTOR_SUBMISSIONS, "outcome", "included");
            self.finalize(bundle, Some(block_number), gas_used, realized, None)
                .await;
        }
    }

    /// Convert a `ProfitReported` amount into base units using the current
    /// oracle snapshot. Amounts already denominated in the wrapped native
    /// pass through untouched.
    fn profit_in_base(
        &self,
        chain: &ChainDescriptor,
        token: Address,
        amount: alloy_primitives::U256,
    ) -> i128 {
        if token == chain.wrapped_native {
            return u256_to_f64(amount) as i128;
        }
        let Some((symbol, decimals)) = chain.tokens.get(&token) else {
            debug!(%token, "unmapped profit token; counting at face value");
            return u256_to_f64(amount) as i128;
        };
        let (Some(token_price), Some(base_price)) = (
            self.oracle.price(symbol),
            self.oracle.price(&chain.native_symbol),
        ) else {
            return u256_to_f64(amount) as i128;
        };
        if base_price <= 0.0 {
            return 0;
        }
        let tokens = u256_to_f64(amount) / 10f64.powi(*decimals as i32);
        (tokens * token_price / base_price * 1e18) as i128
    }

    async fn finalize(
        &self,
        bundle: BundleSubmission,
        inclusion_block: Option<u64>,
        gas_used: u64,
        realized_profit: i128,
        failure: Option<FailureReason>,
    ) {
        let latency_ms = bundle
            .submitted_at
            .map(|_| clock::elapsed_ms(bundle.discovered_at) as u64)
            .unwrap_or(0);

        let record = OutcomeRecord {
            bundle_id: bundle.id,
            opportunity_id: bundle.opportunity_id,
            strategy: bundle.strategy,
            chain: bundle.chain,
            inclusion_block,
            gas_used,
            realized_profit,
            latency_ms,
            failure,
            recorded_at: chrono::Utc::now(),
        };

        self.windows.record(&record);
        metrics::gauge(
            metrics::OUTCOME_REALIZED_PROFIT,
            self.windows.mean_realized_net(bundle.strategy),
        );

        self.broker.release(
            bundle.opportunity_id,
            bundle.strategy,
            &bundle.fingerprints,
            bundle.estimated_net_profit,
            failure.is_some(),
            clock::now(),
        );

        // Ledger writes stay off the async threads.
        let store = self.store.clone();
        let to_append = record.clone();
        let append = tokio::task::spawn_blocking(move || store.append(&to_append)).await;
        match append {
            Ok(Err(e)) => warn!(error = %e, "outcome ledger append failed"),
            Err(e) => warn!(error = %e, "outcome ledger task failed"),
            Ok(Ok(())) => {}
        }

        info!(
            bundle = %record.bundle_id,
            strategy = %record.strategy,
            realized = record.realized_profit,
            failure = ?record.failure,
            "outcome recorded"
        );
    }

    pub fn pending_bundles(&self) -> usize {
        self.pending.lock().len()
    }
}

fn parse_head_number(head: &Value) -> Option<u64> {
    let number = head.get("number")?.as_str()?;
    u64::from_str_radix(number.trim_start_matches("0x"), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_number_parses_from_hex() {
        let head = serde_json::json!({"number": "0x12d687", "hash": "0xabc"});
        assert_eq!(parse_head_number(&head), Some(1_234_567));
        assert_eq!(parse_head_number(&serde_json::json!({})), None);
        assert_eq!(
            parse_head_number(&serde_json::json!({"number": "not-hex"})),
            None
        );
    }
}
