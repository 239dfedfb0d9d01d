//! Chain descriptors
//!
//! Immutable once loaded; `reload` swaps the full set atomically so readers
//! holding a snapshot keep a consistent view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use arc_swap::ArcSwap;

use crate::config::{ChainCfg, ChainFeatures, EndpointRole};
use crate::error::{MipError, MipResult};

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub role: EndpointRole,
}

/// Everything the pipeline needs to know about one chain.
#[derive(Debug, Clone)]
pub struct ChainDescriptor {
    pub id: u32,
    pub name: String,
    pub block_time: Duration,
    pub confirmations: u32,
    pub endpoints: Vec<Endpoint>,
    pub features: ChainFeatures,
    pub gas_unit: String,
    pub wrapped_native: Address,
    pub native_symbol: String,
    /// Known tokens: address -> (symbol, decimals).
    pub tokens: HashMap<Address, (String, u8)>,
    pub pending_ttl: Duration,
    /// Hard cap on the priority fee the executor may bid, in wei.
    pub max_priority_fee_wei: u128,
}

impl ChainDescriptor {
    fn from_cfg(cfg: &ChainCfg) -> Self {
        Self {
            id: cfg.id,
            name: cfg.name.clone(),
            block_time: Duration::from_secs_f64(cfg.block_time_secs),
            confirmations: cfg.confirmations,
            endpoints: cfg
                .endpoints
                .iter()
                .map(|e| Endpoint {
                    url: e.url.clone(),
                    role: e.role,
                })
                .collect(),
            features: cfg.features,
            gas_unit: cfg.gas_unit.clone(),
            wrapped_native: cfg.wrapped_native,
            native_symbol: cfg.native_symbol.clone(),
            tokens: cfg
                .tokens
                .iter()
                .map(|t| (t.address, (t.symbol.clone(), t.decimals)))
                .collect(),
            pending_ttl: Duration::from_secs(cfg.pending_ttl_secs),
            max_priority_fee_wei: cfg.max_priority_fee_gwei as u128 * 1_000_000_000,
        }
    }

    fn endpoint(&self, role: EndpointRole) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| e.role == role)
            .map(|e| e.url.as_str())
    }

    pub fn primary_endpoint(&self) -> Option<&str> {
        self.endpoint(EndpointRole::Primary)
    }

    pub fn websocket_endpoint(&self) -> Option<&str> {
        self.endpoint(EndpointRole::Websocket)
    }

    pub fn archive_endpoint(&self) -> Option<&str> {
        self.endpoint(EndpointRole::Archive)
    }
}

/// One immutable snapshot of all configured chains.
#[derive(Debug, Default)]
pub struct ChainSet {
    by_id: HashMap<u32, Arc<ChainDescriptor>>,
}

impl ChainSet {
    fn from_config(cfgs: &[ChainCfg]) -> MipResult<Self> {
        let mut by_id = HashMap::with_capacity(cfgs.len());
        for cfg in cfgs {
            let desc = Arc::new(ChainDescriptor::from_cfg(cfg));
            if by_id.insert(cfg.id, desc).is_some() {
                return Err(MipError::Config(format!("duplicate chain id {}", cfg.id)));
            }
        }
        Ok(Self { by_id })
    }

    pub fn get(&self, chain: u32) -> Option<Arc<ChainDescriptor>> {
        self.by_id.get(&chain).cloned()
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChainDescriptor>> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Copy-on-write registry handle.
#[derive(Debug)]
pub struct ChainRegistry {
    inner: ArcSwap<ChainSet>,
}

impl ChainRegistry {
    pub fn from_config(cfgs: &[ChainCfg]) -> MipResult<Self> {
        Ok(Self {
            inner: ArcSwap::from_pointee(ChainSet::from_config(cfgs)?),
        })
    }

    /// Wait-free read of the current snapshot.
    pub fn snapshot(&self) -> Arc<ChainSet> {
        self.inner.load_full()
    }

    pub fn get(&self, chain: u32) -> Option<Arc<ChainDescriptor>> {
        self.inner.load().get(chain)
    }

    pub fn reload(&self, cfgs: &[ChainCfg]) -> MipResult<()> {
        let next = ChainSet::from_config(cfgs)?;
        self.inner.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointCfg;

    fn cfg(id: u32) -> ChainCfg {
        ChainCfg {
            id,
            name: format!("chain-{id}"),
            block_time_secs: 12.0,
            confirmations: 2,
            endpoints: vec![
                EndpointCfg {
                    url: "https://rpc.example".into(),
                    role: EndpointRole::Primary,
                },
                EndpointCfg {
                    url: "wss://rpc.example/ws".into(),
                    role: EndpointRole::Websocket,
                },
            ],
            features: ChainFeatures::default(),
            gas_unit: "wei".into(),
            wrapped_native: Address::repeat_byte(0xee),
            native_symbol: "ETH".into(),
            tokens: vec![],
            pending_ttl_secs: 300,
            max_priority_fee_gwei: 500,
        }
    }

    #[test]
    fn snapshot_survives_reload() {
        let reg = ChainRegistry::from_config(&[cfg(1)]).unwrap();
        let old = reg.snapshot();
        reg.reload(&[cfg(1), cfg(10)]).unwrap();

        // Old snapshot is unchanged; new snapshot sees both chains.
        assert_eq!(old.len(), 1);
        assert_eq!(reg.snapshot().len(), 2);
        assert!(reg.get(10).is_some());
    }

    #[test]
    fn endpoint_roles_resolve() {
        let reg = ChainRegistry::from_config(&[cfg(1)]).unwrap();
        let chain = reg.get(1).unwrap();
        assert_eq!(chain.primary_endpoint(), Some("https://rpc.example"));
        assert_eq!(chain.websocket_endpoint(), Some("wss://rpc.example/ws"));
        assert_eq!(chain.archive_endpoint(), None);
        assert_eq!(chain.max_priority_fee_wei, 500_000_000_000);
    }
}
