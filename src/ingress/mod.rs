//! Ingress: observation intake and normalization

mod normalizer;

pub use normalizer::{Normalizer, NormalizerStats, NormalizerStatsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::info;

use crate::dispatch::Dispatcher;
use crate::models::PendingObservation;
use crate::shutdown::ShutdownToken;

/// Pump observations from the shared ingress channel through the normalizer
/// into the dispatcher, with a periodic TTL sweep.
///
/// Draining: once every adapter sender is gone `recv` returns `None`; the
/// loop then exits with the channel fully consumed, so stopping the adapters
/// first drains the normalizer for free.
pub async fn run_ingest_loop(
    normalizer: Arc<Normalizer>,
    mut rx: mpsc::Receiver<PendingObservation>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: ShutdownToken,
    prune_every: Duration,
) {
    let mut prune = tokio::time::interval(prune_every);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(obs) => {
                    if let Some(tx) = normalizer.ingest(obs).await {
                        dispatcher.publish(tx);
                    }
                }
                None => break,
            },
            _ = prune.tick() => normalizer.prune(crate::clock::now()),
            _ = shutdown.cancelled() => {
                // Stop accepting network work but drain what is buffered.
                rx.close();
                while let Some(obs) = rx.recv().await {
                    if let Some(tx) = normalizer.ingest(obs).await {
                        dispatcher.publish(tx);
                    }
                }
                break;
            }
        }
    }

    info!(stats = ?normalizer.stats(), "ingest loop drained");
}
