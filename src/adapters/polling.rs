//! Polling adapter
//!
//! Installs a server-side pending-tx filter and drains it on an adaptive
//! interval. Servers without filter support fall back to head-block diffing.
//! The interval tightens while new transactions keep arriving and relaxes
//! when the feed goes quiet, floored at 100 ms.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{AdapterShared, ObservationStream};
use crate::clock;
use crate::error::{MipError, MipResult};
use crate::models::{ObservationPayload, PendingObservation, SourceId};
use crate::registry::ChainDescriptor;
use crate::rpc::{BlockTxs, RpcClient};
use crate::shutdown::ShutdownToken;

/// Hard floor on the poll interval.
const MIN_POLL: Duration = Duration::from_millis(100);
const MAX_POLL: Duration = Duration::from_secs(2);
const START_POLL: Duration = Duration::from_millis(500);

enum Mode {
    Filter { filter_id: String },
    HeadDiff { last_block: u64 },
}

pub struct PollingAdapter {
    chain: Arc<ChainDescriptor>,
    rpc: Arc<RpcClient>,
    shared: Arc<AdapterShared>,
}

impl PollingAdapter {
    pub async fn open(
        chain: Arc<ChainDescriptor>,
        rpc_timeout: Duration,
        rate_cap: u32,
        capacity: usize,
        mut shutdown: ShutdownToken,
    ) -> MipResult<ObservationStream> {
        let url = chain
            .primary_endpoint()
            .ok_or_else(|| MipError::Config(format!("chain {}: no primary endpoint", chain.id)))?
            .to_string();
        let rpc = Arc::new(RpcClient::new(url, rpc_timeout)?);

        // First contact doubles as the reachability probe.
        let head = rpc.block_number().await?;

        let mode = match rpc.new_pending_filter().await {
            Ok(filter_id) => {
                info!(chain = chain.id, filter = %filter_id, "pending-tx filter installed");
                Mode::Filter { filter_id }
            }
            Err(e) => {
                warn!(chain = chain.id, error = %e, "no filter support; falling back to head diffing");
                Mode::HeadDiff { last_block: head }
            }
        };

        let (tx, rx) = mpsc::channel(capacity);
        let source = SourceId::new(format!("poll:{}", chain.name));
        let shared = Arc::new(AdapterShared::new(source, rate_cap, tx));

        let adapter = Self { chain, rpc, shared };
        tokio::spawn(async move {
            adapter.run(mode, &mut shutdown).await;
        });

        Ok(ObservationStream::new(rx))
    }

    async fn run(self, mut mode: Mode, shutdown: &mut ShutdownToken) {
        let mut interval = START_POLL;
        // Recent per-poll yields drive the adaptive interval.
        let mut yields: VecDeque<usize> = VecDeque::with_capacity(8);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let mut reinstall_failed = false;
            let produced = match &mut mode {
                Mode::Filter { filter_id } => match self.poll_filter(filter_id).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(chain = self.chain.id, error = %e, "filter poll failed; reinstalling");
                        self.shared.count_reconnect();
                        match self.rpc.new_pending_filter().await {
                            Ok(id) => *filter_id = id,
                            Err(e2) => {
                                warn!(chain = self.chain.id, error = %e2, "reinstall failed; switching to head diffing");
                                reinstall_failed = true;
                            }
                        }
                        0
                    }
                },
                Mode::HeadDiff { last_block } => match self.poll_heads(last_block).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(chain = self.chain.id, error = %e, "head poll failed");
                        0
                    }
                },
            };
            if reinstall_failed {
                let head = self.rpc.block_number().await.unwrap_or(0);
                mode = Mode::HeadDiff { last_block: head };
            }

            if yields.len() == 8 {
                yields.pop_front();
            }
            yields.push_back(produced);
            interval = adapt_interval(interval, &yields);
        }
    }

    async fn poll_filter(&self, filter_id: &str) -> MipResult<usize> {
        let hashes = self.rpc.filter_changes(filter_id).await?;
        let count = hashes.len();
        for hash in hashes {
            let obs = PendingObservation {
                chain: self.chain.id,
                hash,
                payload: ObservationPayload::HashOnly,
                source: self.shared.source.clone(),
                seen_at: clock::now(),
            };
            if !self.shared.emit(obs).await {
                break;
            }
        }
        Ok(count)
    }

    /// Diff new head blocks and emit their transactions as observations.
    /// Late, but better than blind on filterless servers.
    async fn poll_heads(&self, last_block: &mut u64) -> MipResult<usize> {
        let head = self.rpc.block_number().await?;
        if head <= *last_block {
            return Ok(0);
        }

        let mut produced = 0;
        for number in (*last_block + 1)..=head {
            let Some(block) = self.rpc.get_block_by_number(number, true).await? else {
                continue;
            };
            if let BlockTxs::Full(txs) = block.transactions {
                for raw in txs {
                    let obs = PendingObservation {
                        chain: self.chain.id,
                        hash: raw.hash,
                        payload: ObservationPayload::Raw(Box::new(raw)),
                        source: self.shared.source.clone(),
                        seen_at: clock::now(),
                    };
                    if self.shared.emit(obs).await {
                        produced += 1;
                    }
                }
            }
        }
        *last_block = head;
        Ok(produced)
    }
}

/// Busy polls tighten toward the floor; quiet polls relax toward the cap.
fn adapt_interval(current: Duration, yields: &VecDeque<usize>) -> Duration {
    let recent: usize = yields.iter().sum();
    let next = if recent == 0 {
        current.saturating_mul(2)
    } else if *yields.back().unwrap_or(&0) > 10 {
        current / 2
    } else {
        current
    };
    next.clamp(MIN_POLL, MAX_POLL)
}
