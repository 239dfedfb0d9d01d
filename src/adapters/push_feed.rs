//! External push feed adapter
//!
//! Some upstreams (co-located listeners, paid mempool feeds) push
//! transactions that are already in canonical shape. We validate the schema,
//! stamp them with our own clock and source tag, and drop anything that
//! fails validation with a counter increment.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{AdapterShared, Backoff, ObservationStream};
use crate::clock;
use crate::config::FeedCfg;
use crate::error::MipResult;
use crate::models::{
    GasPricing, ObservationPayload, PendingObservation, PendingTx, SourceId,
};
use crate::rpc::WsSubscription;
use crate::shutdown::ShutdownToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Canonical wire schema the feed must speak. Anything missing or out of
/// range is a validation failure, not a parse-what-you-can.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct FeedMessage {
    chain: u32,
    hash: B256,
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
    gas_limit: u64,
    #[serde(default)]
    gas_price: Option<u128>,
    #[serde(default)]
    max_fee_per_gas: Option<u128>,
    #[serde(default)]
    max_priority_fee_per_gas: Option<u128>,
    nonce: u64,
    input: Bytes,
}

impl FeedMessage {
    /// Enforce the pricing exclusivity invariant at the boundary.
    fn into_pending(self, source: SourceId) -> Result<PendingTx, &'static str> {
        let pricing = match (self.gas_price, self.max_fee_per_gas) {
            (Some(_), Some(_)) => return Err("both legacy and eip1559 pricing set"),
            (Some(gas_price), None) => Some(GasPricing::Legacy { gas_price }),
            (None, Some(max_fee)) => Some(GasPricing::Eip1559 {
                max_fee,
                priority_fee: self.max_priority_fee_per_gas.unwrap_or(0),
            }),
            (None, None) => {
                if self.max_priority_fee_per_gas.is_some() {
                    return Err("priority fee without max fee");
                }
                None
            }
        };
        let now = clock::now();
        Ok(PendingTx {
            hash: self.hash,
            chain: self.chain,
            from: self.from,
            to: self.to,
            value: self.value,
            gas_limit: self.gas_limit,
            pricing,
            nonce: self.nonce,
            input: self.input,
            first_seen: now,
            last_seen: now,
            source,
        })
    }
}

pub struct PushFeedAdapter {
    cfg: FeedCfg,
    shared: Arc<AdapterShared>,
}

impl PushFeedAdapter {
    pub async fn open(
        cfg: FeedCfg,
        rate_cap: u32,
        capacity: usize,
        mut shutdown: ShutdownToken,
    ) -> MipResult<ObservationStream> {
        // Probe once so a dead feed URL fails loudly at startup.
        let first = WsSubscription::open(&cfg.url, "pendingFeed", HANDSHAKE_TIMEOUT).await?;
        info!(feed = %cfg.label, url = %cfg.url, "push feed connected");

        let (tx, rx) = mpsc::channel(capacity);
        let source = SourceId::new(format!("feed:{}", cfg.label));
        let shared = Arc::new(AdapterShared::new(source, rate_cap, tx));

        let adapter = Self { cfg, shared };
        tokio::spawn(async move {
            adapter.run(Some(first), &mut shutdown).await;
        });

        Ok(ObservationStream::new(rx))
    }

    async fn run(self, mut live: Option<WsSubscription>, shutdown: &mut ShutdownToken) {
        let mut backoff = Backoff::reconnect();

        loop {
            let mut sub = match live.take() {
                Some(s) => s,
                None => {
                    let delay = backoff.next_delay();
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.shared.count_reconnect();
                    match WsSubscription::open(&self.cfg.url, "pendingFeed", HANDSHAKE_TIMEOUT)
                        .await
                    {
                        Ok(s) => {
                            backoff.reset();
                            s
                        }
                        Err(e) => {
                            warn!(feed = %self.cfg.label, error = %e, "feed reconnect failed");
                            continue;
                        }
                    }
                }
            };

            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => {
                        sub.close().await;
                        return;
                    }
                    p = sub.next() => p,
                };
                match payload {
                    Some(value) => self.handle_message(value).await,
                    None => {
                        warn!(feed = %self.cfg.label, "feed dropped; reconnecting");
                        break;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, value: Value) {
        let msg: FeedMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                debug!(feed = %self.cfg.label, error = %e, "schema validation failed");
                self.shared.count_invalid();
                return;
            }
        };

        // The feed claims a chain; we only accept the one it is bound to.
        if msg.chain != self.cfg.chain {
            self.shared.count_invalid();
            return;
        }

        let tx = match msg.into_pending(self.shared.source.clone()) {
            Ok(tx) => tx,
            Err(why) => {
                debug!(feed = %self.cfg.label, why, "invalid feed message");
                self.shared.count_invalid();
                return;
            }
        };

        let obs = PendingObservation {
            chain: tx.chain,
            hash: tx.hash,
            payload: ObservationPayload::Canonical(Box::new(tx)),
            source: self.shared.source.clone(),
            seen_at: clock::now(),
        };
        self.shared.emit(obs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_message_rejects_dual_pricing() {
        let msg = FeedMessage {
            chain: 1,
            hash: B256::ZERO,
            from: Address::repeat_byte(1),
            to: None,
            value: U256::ZERO,
            gas_limit: 21_000,
            gas_price: Some(5),
            max_fee_per_gas: Some(10),
            max_priority_fee_per_gas: None,
            nonce: 0,
            input: Bytes::new(),
        };
        assert!(msg.into_pending(SourceId::new("t")).is_err());
    }

    #[test]
    fn feed_message_accepts_eip1559() {
        let msg = FeedMessage {
            chain: 1,
            hash: B256::ZERO,
            from: Address::repeat_byte(1),
            to: Some(Address::repeat_byte(2)),
            value: U256::from(7u64),
            gas_limit: 21_000,
            gas_price: None,
            max_fee_per_gas: Some(10),
            max_priority_fee_per_gas: Some(2),
            nonce: 3,
            input: Bytes::new(),
        };
        let tx = msg.into_pending(SourceId::new("t")).unwrap();
        assert_eq!(
            tx.pricing,
            Some(GasPricing::Eip1559 {
                max_fee: 10,
                priority_fee: 2
            })
        );
        assert!(tx.first_seen <= tx.last_seen);
    }

    #[test]
    fn unknown_fields_fail_schema_validation() {
        let v = serde_json::json!({
            "chain": 1,
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "from": "0x0101010101010101010101010101010101010101",
            "value": "0x0",
            "gasLimit": 21000,
            "nonce": 0,
            "input": "0x",
            "surprise": true,
        });
        assert!(serde_json::from_value::<FeedMessage>(v).is_err());
    }
}
