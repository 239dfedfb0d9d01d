//! Protocol descriptors
//!
//! Named DeFi protocols with per-chain address books and 4-byte selector
//! decoders. Evaluators use these to recognize swaps, loans, liquidation
//! calls and governance actions in raw calldata.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use arc_swap::ArcSwap;

use crate::config::{PoolCfg, ProtocolCfg, ProtocolKind};
use crate::error::{MipError, MipResult};

/// Per-chain addresses for one protocol.
#[derive(Debug, Clone, Default)]
pub struct ProtocolChainEntry {
    pub router: Option<Address>,
    pub factory: Option<Address>,
    pub oracle: Option<Address>,
    pub pools: Vec<PoolCfg>,
    pub lending_market: Option<Address>,
    pub watch_accounts: Vec<Address>,
    pub collateral_slot: Option<u64>,
    pub debt_slot: Option<u64>,
    pub liq_threshold_bps: u32,
    pub liq_bonus_bps: u32,
    pub governor: Option<Address>,
}

#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub name: String,
    pub kind: ProtocolKind,
    pub chains: HashMap<u32, ProtocolChainEntry>,
    /// 4-byte selector -> decoder name.
    pub selectors: HashMap<[u8; 4], String>,
}

impl ProtocolDescriptor {
    fn from_cfg(cfg: &ProtocolCfg) -> MipResult<Self> {
        let mut selectors = HashMap::with_capacity(cfg.selectors.len());
        for (sel, decoder) in &cfg.selectors {
            let bytes = hex::decode(sel.trim_start_matches("0x"))
                .map_err(|e| MipError::Config(format!("protocol {}: selector {sel}: {e}", cfg.name)))?;
            let sel4: [u8; 4] = bytes
                .try_into()
                .map_err(|_| MipError::Config(format!("protocol {}: selector {sel} length", cfg.name)))?;
            selectors.insert(sel4, decoder.clone());
        }

        let mut chains = HashMap::with_capacity(cfg.chains.len());
        for entry in &cfg.chains {
            chains.insert(
                entry.chain,
                ProtocolChainEntry {
                    router: entry.router,
                    factory: entry.factory,
                    oracle: entry.oracle,
                    pools: entry.pools.clone(),
                    lending_market: entry.lending_market,
                    watch_accounts: entry.watch_accounts.clone(),
                    collateral_slot: entry.collateral_slot,
                    debt_slot: entry.debt_slot,
                    liq_threshold_bps: entry.liq_threshold_bps,
                    liq_bonus_bps: entry.liq_bonus_bps,
                    governor: entry.governor,
                },
            );
        }

        Ok(Self {
            name: cfg.name.clone(),
            kind: cfg.kind,
            chains,
            selectors,
        })
    }

    pub fn on_chain(&self, chain: u32) -> Option<&ProtocolChainEntry> {
        self.chains.get(&chain)
    }
}

/// A pool plus the protocol it belongs to, for path enumeration.
#[derive(Debug, Clone)]
pub struct PoolRef {
    pub protocol: String,
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee_bps: u32,
    pub pair: Option<String>,
}

/// One immutable snapshot of all configured protocols.
#[derive(Debug, Default)]
pub struct ProtocolSet {
    list: Vec<Arc<ProtocolDescriptor>>,
}

impl ProtocolSet {
    fn from_config(cfgs: &[ProtocolCfg]) -> MipResult<Self> {
        let mut list = Vec::with_capacity(cfgs.len());
        let mut names = std::collections::HashSet::new();
        for cfg in cfgs {
            if !names.insert(cfg.name.clone()) {
                return Err(MipError::Config(format!(
                    "duplicate protocol name {}",
                    cfg.name
                )));
            }
            list.push(Arc::new(ProtocolDescriptor::from_cfg(cfg)?));
        }
        Ok(Self { list })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProtocolDescriptor>> {
        self.list.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProtocolDescriptor>> {
        self.list.iter()
    }

    pub fn of_kind(&self, kind: ProtocolKind) -> impl Iterator<Item = &Arc<ProtocolDescriptor>> {
        self.list.iter().filter(move |p| p.kind == kind)
    }

    /// All DEX pools on a chain, tagged with their protocol.
    pub fn pools_on_chain(&self, chain: u32) -> Vec<PoolRef> {
        let mut out = Vec::new();
        for proto in self.of_kind(ProtocolKind::Dex) {
            if let Some(entry) = proto.on_chain(chain) {
                for pool in &entry.pools {
                    out.push(PoolRef {
                        protocol: proto.name.clone(),
                        address: pool.address,
                        token0: pool.token0,
                        token1: pool.token1,
                        fee_bps: pool.fee_bps,
                        pair: pool.pair.clone(),
                    });
                }
            }
        }
        out
    }

    /// Resolve a selector to (protocol, decoder name). First match wins;
    /// protocols are checked in config order.
    pub fn decoder_for(&self, selector: [u8; 4]) -> Option<(&str, &str)> {
        self.list.iter().find_map(|p| {
            p.selectors
                .get(&selector)
                .map(|d| (p.name.as_str(), d.as_str()))
        })
    }

    /// Selectors registered by governor-kind protocols.
    pub fn governor_selectors(&self) -> Vec<([u8; 4], String, String)> {
        let mut out = Vec::new();
        for proto in self.of_kind(ProtocolKind::Governor) {
            for (sel, decoder) in &proto.selectors {
                out.push((*sel, proto.name.clone(), decoder.clone()));
            }
        }
        out
    }
}

/// Copy-on-write registry handle.
#[derive(Debug)]
pub struct ProtocolRegistry {
    inner: ArcSwap<ProtocolSet>,
}

impl ProtocolRegistry {
    pub fn from_config(cfgs: &[ProtocolCfg]) -> MipResult<Self> {
        Ok(Self {
            inner: ArcSwap::from_pointee(ProtocolSet::from_config(cfgs)?),
        })
    }

    pub fn snapshot(&self) -> Arc<ProtocolSet> {
        self.inner.load_full()
    }

    pub fn reload(&self, cfgs: &[ProtocolCfg]) -> MipResult<()> {
        let next = ProtocolSet::from_config(cfgs)?;
        self.inner.store(Arc::new(next));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolChainCfg;

    fn dex_cfg() -> ProtocolCfg {
        ProtocolCfg {
            name: "unified-v2".into(),
            kind: ProtocolKind::Dex,
            chains: vec![ProtocolChainCfg {
                chain: 1,
                router: Some(Address::repeat_byte(0x01)),
                factory: None,
                oracle: None,
                pools: vec![PoolCfg {
                    address: Address::repeat_byte(0x10),
                    token0: Address::repeat_byte(0xaa),
                    token1: Address::repeat_byte(0xbb),
                    fee_bps: 30,
                    pair: Some("AAA/BBB".into()),
                }],
                lending_market: None,
                watch_accounts: vec![],
                collateral_slot: None,
                debt_slot: None,
                liq_threshold_bps: 8_000,
                liq_bonus_bps: 500,
                governor: None,
            }],
            selectors: HashMap::from([(
                "0x38ed1739".to_string(),
                "swap_exact_tokens".to_string(),
            )]),
        }
    }

    #[test]
    fn selector_lookup_resolves_decoder() {
        let reg = ProtocolRegistry::from_config(&[dex_cfg()]).unwrap();
        let snap = reg.snapshot();
        let (proto, decoder) = snap.decoder_for([0x38, 0xed, 0x17, 0x39]).unwrap();
        assert_eq!(proto, "unified-v2");
        assert_eq!(decoder, "swap_exact_tokens");
        assert!(snap.decoder_for([0, 0, 0, 0]).is_none());
    }

    #[test]
    fn pools_on_chain_are_tagged() {
        let reg = ProtocolRegistry::from_config(&[dex_cfg()]).unwrap();
        let pools = reg.snapshot().pools_on_chain(1);
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].protocol, "unified-v2");
        assert!(reg.snapshot().pools_on_chain(5).is_empty());
    }

    #[test]
    fn bad_selector_hex_is_config_error() {
        let mut cfg = dex_cfg();
        cfg.selectors.insert("0xzz".into(), "nope".into());
        assert!(ProtocolRegistry::from_config(&[cfg]).is_err());
    }
}
