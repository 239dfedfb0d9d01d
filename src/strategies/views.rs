//! Shared read-only market views
//!
//! Background pollers refresh pool reserves and lending account health over
//! RPC; evaluators only ever read. Both views are sharded concurrent maps so
//! a refresh never blocks an evaluation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256, U256};
use dashmap::DashMap;
use tracing::{debug, info};

use crate::clock::{self, MonoTime};
use crate::error::MipResult;
use crate::registry::Registry;
use crate::rpc::RpcClient;
use crate::shutdown::ShutdownToken;

/// Storage slot of the packed v2-style reserve word
/// (uint112 reserve0 | uint112 reserve1 | uint32 ts).
const V2_RESERVES_SLOT: u64 = 8;

#[derive(Debug, Clone, Copy)]
pub struct PoolState {
    pub reserve0: U256,
    pub reserve1: U256,
    pub at: MonoTime,
}

/// Cached pool reserves keyed by (chain, pool address).
#[derive(Default)]
pub struct PoolStateView {
    pools: DashMap<(u32, Address), PoolState>,
}

impl PoolStateView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, chain: u32, pool: Address, reserve0: U256, reserve1: U256) {
        self.pools.insert(
            (chain, pool),
            PoolState {
                reserve0,
                reserve1,
                at: clock::now(),
            },
        );
    }

    pub fn reserves(&self, chain: u32, pool: Address) -> Option<PoolState> {
        self.pools.get(&(chain, pool)).map(|s| *s)
    }

    /// Decode the packed v2 reserve word.
    pub fn decode_reserves(word: B256) -> (U256, U256) {
        let value = U256::from_be_bytes(word.0);
        let mask = (U256::from(1u64) << 112) - U256::from(1u64);
        let reserve0 = value & mask;
        let reserve1 = (value >> 112) & mask;
        (reserve0, reserve1)
    }

    /// Poll loop refreshing every configured pool's reserves.
    pub async fn run_refresher(
        self: Arc<Self>,
        registry: Arc<Registry>,
        rpc_timeout: Duration,
        every: Duration,
        mut shutdown: ShutdownToken,
    ) -> MipResult<()> {
        let mut clients: HashMap<u32, Arc<RpcClient>> = HashMap::new();
        for chain in registry.chains.snapshot().iter() {
            if let Some(url) = chain.primary_endpoint() {
                clients.insert(chain.id, Arc::new(RpcClient::new(url, rpc_timeout)?));
            }
        }

        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("pool state refresher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let protocols = registry.protocols.snapshot();
            for (chain_id, rpc) in &clients {
                for pool in protocols.pools_on_chain(*chain_id) {
                    match rpc
                        .get_storage_at(pool.address, U256::from(V2_RESERVES_SLOT))
                        .await
                    {
                        Ok(word) => {
                            let (r0, r1) = Self::decode_reserves(word);
                            if !r0.is_zero() && !r1.is_zero() {
                                self.record(*chain_id, pool.address, r0, r1);
                            }
                        }
                        Err(e) => {
                            debug!(chain = chain_id, pool = %pool.address, error = %e, "reserve refresh failed")
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AccountHealth {
    pub market: Address,
    pub account: Address,
    /// Collateral value in base units.
    pub collateral_value: f64,
    pub debt_value: f64,
    /// collateral x liquidation-threshold / debt.
    pub health_factor: f64,
    pub liq_bonus_bps: u32,
    pub at: MonoTime,
}

/// Lending account health per chain, refreshed from watch lists.
#[derive(Default)]
pub struct LendingView {
    accounts: DashMap<(u32, Address, Address), AccountHealth>,
}

impl LendingView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, chain: u32, health: AccountHealth) {
        self.accounts
            .insert((chain, health.market, health.account), health);
    }

    pub fn positions(&self, chain: u32) -> Vec<AccountHealth> {
        self.accounts
            .iter()
            .filter(|e| e.key().0 == chain)
            .map(|e| *e.value())
            .collect()
    }

    /// Solidity mapping slot: keccak256(pad32(key) ++ pad32(base_slot)).
    fn mapping_slot(account: Address, base_slot: u64) -> U256 {
        let mut buf = [0u8; 64];
        buf[12..32].copy_from_slice(account.as_slice());
        buf[32..64].copy_from_slice(&U256::from(base_slot).to_be_bytes::<32>());
        U256::from_be_bytes(keccak256(buf).0)
    }

    /// Poll loop over every lending protocol's watch accounts.
    pub async fn run_refresher(
        self: Arc<Self>,
        registry: Arc<Registry>,
        rpc_timeout: Duration,
        every: Duration,
        mut shutdown: ShutdownToken,
    ) -> MipResult<()> {
        let mut clients: HashMap<u32, Arc<RpcClient>> = HashMap::new();
        for chain in registry.chains.snapshot().iter() {
            if let Some(url) = chain.primary_endpoint() {
                clients.insert(chain.id, Arc::new(RpcClient::new(url, rpc_timeout)?));
            }
        }

        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("lending health refresher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let protocols = registry.protocols.snapshot();
            for (chain_id, rpc) in &clients {
                for proto in protocols.iter() {
                    let Some(entry) = proto.on_chain(*chain_id) else {
                        continue;
                    };
                    let (Some(market), Some(coll_slot), Some(debt_slot)) =
                        (entry.lending_market, entry.collateral_slot, entry.debt_slot)
                    else {
                        continue;
                    };
                    for account in &entry.watch_accounts {
                        let coll = rpc
                            .get_storage_at(market, Self::mapping_slot(*account, coll_slot))
                            .await;
                        let debt = rpc
                            .get_storage_at(market, Self::mapping_slot(*account, debt_slot))
                            .await;
                        let (Ok(coll), Ok(debt)) = (coll, debt) else {
                            continue;
                        };
                        let collateral_value =
                            crate::models::u256_to_f64(U256::from_be_bytes(coll.0)) / 1e18;
                        let debt_value =
                            crate::models::u256_to_f64(U256::from_be_bytes(debt.0)) / 1e18;
                        let health_factor = if debt_value <= 0.0 {
                            f64::INFINITY
                        } else {
                            collateral_value * (entry.liq_threshold_bps as f64 / 10_000.0)
                                / debt_value
                        };
                        self.record(
                            *chain_id,
                            AccountHealth {
                                market,
                                account: *account,
                                collateral_value,
                                debt_value,
                                health_factor,
                                liq_bonus_bps: entry.liq_bonus_bps,
                                at: clock::now(),
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_word_decodes_both_halves() {
        // reserve0 = 7, reserve1 = 9 packed into one word.
        let value: U256 = (U256::from(9u64) << 112) | U256::from(7u64);
        let word = B256::from(value.to_be_bytes::<32>());
        let (r0, r1) = PoolStateView::decode_reserves(word);
        assert_eq!(r0, U256::from(7u64));
        assert_eq!(r1, U256::from(9u64));
    }

    #[test]
    fn pool_view_round_trips() {
        let view = PoolStateView::new();
        let pool = Address::repeat_byte(0x10);
        view.record(1, pool, U256::from(100u64), U256::from(200u64));
        let state = view.reserves(1, pool).unwrap();
        assert_eq!(state.reserve0, U256::from(100u64));
        assert_eq!(state.reserve1, U256::from(200u64));
        assert!(view.reserves(2, pool).is_none());
    }

    #[test]
    fn mapping_slot_is_account_sensitive() {
        let a = LendingView::mapping_slot(Address::repeat_byte(1), 3);
        let b = LendingView::mapping_slot(Address::repeat_byte(2), 3);
        let c = LendingView::mapping_slot(Address::repeat_byte(1), 4);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn lending_view_filters_by_chain() {
        let view = LendingView::new();
        let health = AccountHealth {
            market: Address::repeat_byte(0xaa),
            account: Address::repeat_byte(0xbb),
            collateral_value: 10.0,
            debt_value: 9.0,
            health_factor: 0.88,
            liq_bonus_bps: 500,
            at: clock::now(),
        };
        view.record(1, health);
        assert_eq!(view.positions(1).len(), 1);
        assert!(view.positions(2).is_empty());
    }
}
