//! Chain & protocol registries
//!
//! Read-mostly lookup tables behind copy-on-write snapshots. Readers grab an
//! `Arc` snapshot and never block; hot reload swaps the whole set atomically.

mod chains;
mod protocols;

pub use chains::{ChainDescriptor, ChainRegistry, ChainSet, Endpoint};
pub use protocols::{
    PoolRef, ProtocolChainEntry, ProtocolDescriptor, ProtocolRegistry, ProtocolSet,
};

use std::sync::Arc;

use crate::config::MipConfig;
use crate::error::MipResult;

/// Both registries, constructed together from one config document.
#[derive(Debug)]
pub struct Registry {
    pub chains: Arc<ChainRegistry>,
    pub protocols: Arc<ProtocolRegistry>,
}

impl Registry {
    pub fn from_config(cfg: &MipConfig) -> MipResult<Arc<Self>> {
        Ok(Arc::new(Self {
            chains: Arc::new(ChainRegistry::from_config(&cfg.chains)?),
            protocols: Arc::new(ProtocolRegistry::from_config(&cfg.protocols)?),
        }))
    }

    /// Atomically replace both snapshots from a fresh config document.
    pub fn reload(&self, cfg: &MipConfig) -> MipResult<()> {
        self.chains.reload(&cfg.chains)?;
        self.protocols.reload(&cfg.protocols)?;
        Ok(())
    }
}
