//! Streaming subscription adapter
//!
//! Subscribes to `newPendingTransactions` over WSS. Most providers emit
//! hash-only notifications; hydration is the normalizer's problem. On
//! disconnect the loop backs off exponentially (1 s base, 30 s cap, jitter)
//! and resubscribes.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::B256;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{AdapterShared, Backoff, ObservationStream};
use crate::clock;
use crate::error::{MipError, MipResult};
use crate::models::{ObservationPayload, PendingObservation, RawTransaction, SourceId};
use crate::registry::ChainDescriptor;
use crate::rpc::WsSubscription;
use crate::shutdown::ShutdownToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsAdapter {
    chain: Arc<ChainDescriptor>,
    url: String,
    shared: Arc<AdapterShared>,
}

impl WsAdapter {
    /// Open the subscription stream. The initial handshake must succeed or
    /// this fails with `EndpointUnreachable`; after that, reconnects are
    /// internal and invisible to the consumer.
    pub async fn open(
        chain: Arc<ChainDescriptor>,
        rate_cap: u32,
        capacity: usize,
        mut shutdown: ShutdownToken,
    ) -> MipResult<ObservationStream> {
        let url = chain
            .websocket_endpoint()
            .ok_or_else(|| {
                MipError::Config(format!("chain {}: no websocket endpoint", chain.id))
            })?
            .to_string();

        // Probe the endpoint up front so a dead URL fails loudly.
        let first = WsSubscription::open(&url, "newPendingTransactions", HANDSHAKE_TIMEOUT).await?;
        info!(chain = chain.id, url = %url, sub = %first.subscription_id, "pending-tx subscription open");

        let (tx, rx) = mpsc::channel(capacity);
        let source = SourceId::new(format!("ws:{}", chain.name));
        let shared = Arc::new(AdapterShared::new(source, rate_cap, tx));

        let adapter = Self { chain, url, shared };
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
                    match WsSubscription::open(&self.url, "newPendingTransactions", HANDSHAKE_TIMEOUT)
                        .await
                    {
                        Ok(s) => {
                            debug!(chain = self.chain.id, "resubscribed");
                            backoff.reset();
                            s
                        }
                        Err(e) => {
                            warn!(chain = self.chain.id, error = %e, "resubscribe failed");
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
                    Some(value) => self.handle_notification(value).await,
                    None => {
                        warn!(chain = self.chain.id, "subscription dropped; reconnecting");
                        break;
                    }
                }
            }
        }
    }

    /// Providers send either a bare hash string or a full tx object.
    async fn handle_notification(&self, value: Value) {
        let obs = match &value {
            Value::String(h) => match h.parse::<B256>() {
                Ok(hash) => PendingObservation {
                    chain: self.chain.id,
                    hash,
                    payload: ObservationPayload::HashOnly,
                    source: self.shared.source.clone(),
                    seen_at: clock::now(),
                },
                Err(_) => {
                    self.shared.count_invalid();
                    return;
                }
            },
            Value::Object(_) => match serde_json::from_value::<RawTransaction>(value.clone()) {
                Ok(raw) => PendingObservation {
                    chain: self.chain.id,
                    hash: raw.hash,
                    payload: ObservationPayload::Raw(Box::new(raw)),
                    source: self.shared.source.clone(),
                    seen_at: clock::now(),
                },
                Err(e) => {
                    debug!(error = %e, "unparseable pending-tx notification");
                    self.shared.count_invalid();
                    return;
                }
            },
            _ => {
                self.shared.count_invalid();
                return;
            }
        };
        self.shared.emit(obs).await;
    }
}
