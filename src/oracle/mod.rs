//! Oracle deviation monitor
//!
//! Tracks on-chain feed prices against CEX volume-weighted prices per asset
//! and maintains a deviation flag each strategy consults before trading.
//! Prices older than the staleness threshold never set a flag; a stale pair
//! clears one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::{self, MonoTime};
use crate::config::{OracleAssetCfg, OracleCfg};
use crate::error::MipResult;
use crate::models::{u256_to_f64, DeviationFlag};
use crate::registry::ChainRegistry;
use crate::rpc::RpcClient;
use crate::shutdown::ShutdownToken;

#[derive(Debug, Clone, Copy, Default)]
struct PricePoint {
    price: f64,
    at: MonoTime,
}

#[derive(Debug, Clone, Default)]
struct AssetState {
    onchain: Option<PricePoint>,
    cex: Option<PricePoint>,
}

/// One venue row from the CEX ticker endpoint. Endpoints may return a
/// single object or an array of venues to be volume-weighted.
#[derive(Debug, Deserialize)]
struct VenueTicker {
    price: f64,
    #[serde(default)]
    volume: f64,
}

pub struct OracleMonitor {
    cfg: OracleCfg,
    assets: Vec<OracleAssetCfg>,
    state: DashMap<String, AssetState>,
    flags: DashMap<String, DeviationFlag>,
    rpcs: HashMap<u32, Arc<RpcClient>>,
    http: reqwest::Client,
    stale_after: Duration,
}

impl OracleMonitor {
    pub fn new(
        cfg: OracleCfg,
        chains: &ChainRegistry,
        rpc_timeout: Duration,
    ) -> MipResult<Self> {
        let mut rpcs = HashMap::new();
        for asset in &cfg.assets {
            if let Some(chain) = chains.get(asset.chain) {
                if let Some(url) = chain.primary_endpoint() {
                    rpcs.entry(asset.chain)
                        .or_insert(Arc::new(RpcClient::new(url, rpc_timeout)?));
                }
            }
        }
        let http = reqwest::Client::builder()
            .timeout(rpc_timeout)
            .build()
            .map_err(|e| crate::error::MipError::Config(format!("oracle http: {e}")))?;

        let stale_after = Duration::from_secs(cfg.stale_price_secs);
        let assets = cfg.assets.clone();
        Ok(Self {
            cfg,
            assets,
            state: DashMap::new(),
            flags: DashMap::new(),
            rpcs,
            http,
            stale_after,
        })
    }

    /// Poll loop. Each tick refreshes both price legs and recompares.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownToken) {
        if self.assets.is_empty() {
            info!("oracle monitor idle: no assets configured");
            return;
        }
        let mut tick = tokio::time::interval(Duration::from_secs(self.cfg.poll_secs.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(assets = self.assets.len(), "oracle monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.refresh_onchain().await;
            self.refresh_cex().await;
            self.compare_all();
        }
    }

    async fn refresh_onchain(&self) {
        for asset in &self.assets {
            let Some(rpc) = self.rpcs.get(&asset.chain) else {
                continue;
            };
            match rpc
                .get_storage_at(asset.feed, alloy_primitives::U256::from(asset.slot))
                .await
            {
                Ok(word) => {
                    let raw = alloy_primitives::U256::from_be_bytes(word.0);
                    let price = u256_to_f64(raw) / 10f64.powi(asset.decimals as i32);
                    if price > 0.0 {
                        self.record_onchain(&asset.symbol, price);
                    }
                }
                Err(e) => {
                    debug!(asset = %asset.symbol, error = %e, "on-chain price fetch failed");
                }
            }
        }
    }

    async fn refresh_cex(&self) {
        let Some(template) = &self.cfg.cex_ticker_url else {
            return;
        };
        for asset in &self.assets {
            let url = template.replace("{asset}", &asset.symbol);
            match self.fetch_cex_price(&url).await {
                Ok(Some(price)) => self.record_cex(&asset.symbol, price),
                Ok(None) => {}
                Err(e) => debug!(asset = %asset.symbol, error = %e, "cex price fetch failed"),
            }
        }
    }

    async fn fetch_cex_price(&self, url: &str) -> anyhow::Result<Option<f64>> {
        let body = self.http.get(url).send().await?.text().await?;
        // Single venue or an array to volume-weight.
        let venues: Vec<VenueTicker> = match serde_json::from_str::<Vec<VenueTicker>>(&body) {
            Ok(v) => v,
            Err(_) => vec![serde_json::from_str::<VenueTicker>(&body)?],
        };
        Ok(volume_weighted(&venues))
    }

    pub fn record_onchain(&self, asset: &str, price: f64) {
        let mut entry = self.state.entry(asset.to_uppercase()).or_default();
        entry.onchain = Some(PricePoint {
            price,
            at: clock::now(),
        });
    }

    pub fn record_cex(&self, asset: &str, price: f64) {
        let mut entry = self.state.entry(asset.to_uppercase()).or_default();
        entry.cex = Some(PricePoint {
            price,
            at: clock::now(),
        });
    }

    /// Recompute every flag from the freshest price pair.
    pub fn compare_all(&self) {
        let now = clock::now();
        let stale_ns = self.stale_after.as_nanos() as u64;

        for entry in self.state.iter() {
            let asset = entry.key().clone();
            let fresh = |p: &Option<PricePoint>| {
                p.filter(|p| now.saturating_sub(p.at) < stale_ns && p.price > 0.0)
            };
            let (onchain, cex) = (fresh(&entry.value().onchain), fresh(&entry.value().cex));

            let deviating = match (onchain, cex) {
                (Some(on), Some(off)) => {
                    (on.price - off.price).abs() / off.price > self.cfg.deviation_threshold
                }
                // A stale or missing leg can never justify a flag.
                _ => false,
            };

            let previous = self.flags.get(&asset).map(|f| f.deviating).unwrap_or(false);
            if deviating != previous {
                if deviating {
                    warn!(asset = %asset, onchain = onchain.map(|p| p.price).unwrap_or(0.0),
                          cex = cex.map(|p| p.price).unwrap_or(0.0), "oracle deviation detected");
                } else {
                    info!(asset = %asset, "oracle deviation cleared");
                }
            }

            self.flags.insert(
                asset.clone(),
                DeviationFlag {
                    asset,
                    deviating,
                    onchain_price: onchain.map(|p| p.price).unwrap_or(0.0),
                    cex_price: cex.map(|p| p.price).unwrap_or(0.0),
                    onchain_at: onchain.map(|p| p.at).unwrap_or(0),
                    cex_at: cex.map(|p| p.at).unwrap_or(0),
                },
            );
        }
    }

    pub fn is_deviating(&self, asset: &str) -> bool {
        self.flags
            .get(&asset.to_uppercase())
            .map(|f| f.deviating)
            .unwrap_or(false)
    }

    /// Any flag set across the whole watch list.
    pub fn any_deviating(&self) -> bool {
        self.flags.iter().any(|f| f.deviating)
    }

    pub fn flag(&self, asset: &str) -> Option<DeviationFlag> {
        self.flags.get(&asset.to_uppercase()).map(|f| f.clone())
    }

    pub fn flags(&self) -> Vec<DeviationFlag> {
        let mut out: Vec<DeviationFlag> = self.flags.iter().map(|f| f.clone()).collect();
        out.sort_by(|a, b| a.asset.cmp(&b.asset));
        out
    }

    /// Best current price for base-unit conversion: prefer the CEX leg,
    /// fall back to the feed.
    pub fn price(&self, asset: &str) -> Option<f64> {
        let state = self.state.get(&asset.to_uppercase())?;
        state
            .cex
            .or(state.onchain)
            .map(|p| p.price)
            .filter(|p| *p > 0.0)
    }
}

fn volume_weighted(venues: &[VenueTicker]) -> Option<f64> {
    let live: Vec<&VenueTicker> = venues.iter().filter(|v| v.price > 0.0).collect();
    if live.is_empty() {
        return None;
    }
    let total_volume: f64 = live.iter().map(|v| v.volume.max(0.0)).sum();
    if total_volume <= 0.0 {
        // No volume data: plain mean.
        return Some(live.iter().map(|v| v.price).sum::<f64>() / live.len() as f64);
    }
    Some(
        live.iter()
            .map(|v| v.price * v.volume.max(0.0))
            .sum::<f64>()
            / total_volume,
    )
}
