//! Pipeline configuration
//!
//! One TOML document describes chains, protocols, strategies, sandbox caps,
//! executor wiring and global limits. Unknown keys are load errors, as are
//! out-of-range values; a config that loads is a config the pipeline can run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use alloy_primitives::Address;
use serde::Deserialize;

use crate::error::{MipError, MipResult};
use crate::models::StrategyKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MipConfig {
    pub chains: Vec<ChainCfg>,
    #[serde(default)]
    pub protocols: Vec<ProtocolCfg>,
    #[serde(default)]
    pub strategies: HashMap<String, StrategyCfg>,
    #[serde(default)]
    pub sandbox: SandboxCfg,
    #[serde(default)]
    pub executor: ExecutorCfg,
    #[serde(default)]
    pub limits: LimitsCfg,
    #[serde(default)]
    pub control: ControlCfg,
    #[serde(default)]
    pub feeds: Vec<FeedCfg>,
    #[serde(default)]
    pub oracle: OracleCfg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Primary,
    Archive,
    Websocket,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointCfg {
    pub url: String,
    pub role: EndpointRole,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainFeatures {
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub private_relay: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainCfg {
    pub id: u32,
    pub name: String,
    pub block_time_secs: f64,
    #[serde(default = "default_confirmations")]
    pub confirmations: u32,
    pub endpoints: Vec<EndpointCfg>,
    #[serde(default)]
    pub features: ChainFeatures,
    #[serde(default = "default_gas_unit")]
    pub gas_unit: String,
    pub wrapped_native: Address,
    /// Oracle symbol of the native/base token.
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    /// Known tokens for profit conversion.
    #[serde(default)]
    pub tokens: Vec<TokenCfg>,
    #[serde(default = "default_pending_ttl_secs")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_max_priority_fee_gwei")]
    pub max_priority_fee_gwei: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenCfg {
    pub address: Address,
    pub symbol: String,
    #[serde(default = "default_token_decimals")]
    pub decimals: u8,
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_token_decimals() -> u8 {
    18
}

fn default_confirmations() -> u32 {
    2
}

fn default_gas_unit() -> String {
    "wei".to_string()
}

fn default_pending_ttl_secs() -> u64 {
    300
}

fn default_max_priority_fee_gwei() -> u64 {
    500
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Dex,
    Lending,
    Bridge,
    Governor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolCfg {
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    #[serde(default = "default_pool_fee_bps")]
    pub fee_bps: u32,
    /// Symbolic pair label (e.g. "WETH/USDC") for cross-chain matching.
    #[serde(default)]
    pub pair: Option<String>,
}

fn default_pool_fee_bps() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolChainCfg {
    pub chain: u32,
    #[serde(default)]
    pub router: Option<Address>,
    #[serde(default)]
    pub factory: Option<Address>,
    #[serde(default)]
    pub oracle: Option<Address>,
    #[serde(default)]
    pub pools: Vec<PoolCfg>,
    #[serde(default)]
    pub lending_market: Option<Address>,
    #[serde(default)]
    pub watch_accounts: Vec<Address>,
    /// Storage mapping base slots for account collateral / debt values.
    #[serde(default)]
    pub collateral_slot: Option<u64>,
    #[serde(default)]
    pub debt_slot: Option<u64>,
    #[serde(default = "default_liq_threshold_bps")]
    pub liq_threshold_bps: u32,
    #[serde(default = "default_liq_bonus_bps")]
    pub liq_bonus_bps: u32,
    #[serde(default)]
    pub governor: Option<Address>,
}

fn default_liq_threshold_bps() -> u32 {
    8_000
}

fn default_liq_bonus_bps() -> u32 {
    500
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolCfg {
    pub name: String,
    pub kind: ProtocolKind,
    #[serde(default)]
    pub chains: Vec<ProtocolChainCfg>,
    /// 4-byte selector (0x-hex) -> decoder name.
    #[serde(default)]
    pub selectors: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyCfg {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub params: StrategyParams,
}

impl Default for StrategyCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            params: StrategyParams::default(),
        }
    }
}

/// Per-strategy tuning knobs. Strategies read only the knobs they care
/// about; defaults match the documented behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyParams {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_safety_margin_bps")]
    pub safety_margin_bps: u32,
    #[serde(default = "default_health_epsilon")]
    pub health_epsilon: f64,
    #[serde(default = "default_bridge_latency_budget_secs")]
    pub bridge_latency_budget_secs: u64,
    /// Staleness time constant. Zero means "use the strategy's builtin".
    #[serde(default)]
    pub tau_secs: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_strategy_inflight_cap")]
    pub in_flight_cap: usize,
    /// Opportunity time-to-live before the broker refuses to schedule it.
    #[serde(default = "default_opportunity_ttl_secs")]
    pub opportunity_ttl_secs: f64,
    /// Optional sandboxed pre-submit simulation plugin (path relative to
    /// the sandbox artifact root) and its expected SHA-256.
    #[serde(default)]
    pub sim_artifact: Option<String>,
    #[serde(default)]
    pub sim_digest: Option<String>,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            safety_margin_bps: default_safety_margin_bps(),
            health_epsilon: default_health_epsilon(),
            bridge_latency_budget_secs: default_bridge_latency_budget_secs(),
            tau_secs: 0.0,
            cooldown_secs: default_cooldown_secs(),
            in_flight_cap: default_strategy_inflight_cap(),
            opportunity_ttl_secs: default_opportunity_ttl_secs(),
            sim_artifact: None,
            sim_digest: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_hops() -> u32 {
    3
}

fn default_safety_margin_bps() -> u32 {
    15
}

fn default_health_epsilon() -> f64 {
    0.01
}

fn default_bridge_latency_budget_secs() -> u64 {
    300
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_strategy_inflight_cap() -> usize {
    4
}

fn default_opportunity_ttl_secs() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxCfg {
    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,
    #[serde(default = "default_memory_cap_mib")]
    pub memory_cap_mib: u64,
    #[serde(default = "default_sandbox_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_fuel_cap")]
    pub fuel_cap: u64,
    #[serde(default = "default_cache_entries")]
    pub cache_entries: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub enable_wasm: bool,
    #[serde(default = "default_true")]
    pub enable_native: bool,
}

impl Default for SandboxCfg {
    fn default() -> Self {
        Self {
            artifact_root: default_artifact_root(),
            memory_cap_mib: default_memory_cap_mib(),
            timeout_secs: default_sandbox_timeout_secs(),
            fuel_cap: default_fuel_cap(),
            cache_entries: default_cache_entries(),
            cache_ttl_secs: default_cache_ttl_secs(),
            enable_wasm: true,
            enable_native: true,
        }
    }
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("./artifacts")
}

fn default_memory_cap_mib() -> u64 {
    64
}

fn default_sandbox_timeout_secs() -> u64 {
    30
}

fn default_fuel_cap() -> u64 {
    10_000_000
}

fn default_cache_entries() -> usize {
    100_000
}

fn default_cache_ttl_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayCfg {
    pub name: String,
    pub url: String,
    /// Env var holding the bearer/auth value, if the relay wants one.
    #[serde(default)]
    pub auth_env: Option<String>,
    /// Env var holding the body-signing secret, if the relay wants one.
    #[serde(default)]
    pub signing_secret_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GasPolicyCfg {
    /// Fraction of estimated net profit spent as priority-fee slack.
    #[serde(default = "default_gas_alpha")]
    pub alpha: f64,
    /// Mempool priority-fee percentile to anchor on.
    #[serde(default = "default_gas_percentile")]
    pub percentile: f64,
    /// How many recent blocks feed the base-fee estimate.
    #[serde(default = "default_base_fee_blocks")]
    pub base_fee_blocks: u32,
}

impl Default for GasPolicyCfg {
    fn default() -> Self {
        Self {
            alpha: default_gas_alpha(),
            percentile: default_gas_percentile(),
            base_fee_blocks: default_base_fee_blocks(),
        }
    }
}

fn default_gas_alpha() -> f64 {
    0.2
}

fn default_gas_percentile() -> f64 {
    0.5
}

fn default_base_fee_blocks() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorCfg {
    #[serde(default = "default_operator_key_env")]
    pub operator_key_env: String,
    /// Operator aggregator contract per chain (chain id -> address).
    #[serde(default)]
    pub aggregator: HashMap<String, Address>,
    #[serde(default)]
    pub relays: Vec<RelayCfg>,
    #[serde(default = "default_flush_deadline_secs")]
    pub flush_deadline_secs: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_submit_retries")]
    pub submit_retries: u32,
    #[serde(default = "default_target_block_window")]
    pub target_block_window: u64,
    #[serde(default)]
    pub gas: GasPolicyCfg,
}

impl Default for ExecutorCfg {
    fn default() -> Self {
        Self {
            operator_key_env: default_operator_key_env(),
            aggregator: HashMap::new(),
            relays: Vec::new(),
            flush_deadline_secs: default_flush_deadline_secs(),
            submit_timeout_ms: default_submit_timeout_ms(),
            submit_retries: default_submit_retries(),
            target_block_window: default_target_block_window(),
            gas: GasPolicyCfg::default(),
        }
    }
}

fn default_operator_key_env() -> String {
    "OPERATOR_KEY".to_string()
}

fn default_flush_deadline_secs() -> u64 {
    5
}

fn default_submit_timeout_ms() -> u64 {
    3_000
}

fn default_submit_retries() -> u32 {
    3
}

fn default_target_block_window() -> u64 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsCfg {
    #[serde(default = "default_global_inflight_cap")]
    pub global_inflight_cap: usize,
    #[serde(default = "default_broker_capacity")]
    pub broker_capacity: usize,
    #[serde(default = "default_dedup_cache_cap")]
    pub dedup_cache_cap: usize,
    /// Observations per second per source; 0 disables the cap.
    #[serde(default)]
    pub per_source_rate_cap: u32,
    #[serde(default = "default_ring_capacity")]
    pub dispatcher_ring_capacity: usize,
    #[serde(default = "default_evaluator_budget_ms")]
    pub evaluator_budget_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for LimitsCfg {
    fn default() -> Self {
        Self {
            global_inflight_cap: default_global_inflight_cap(),
            broker_capacity: default_broker_capacity(),
            dedup_cache_cap: default_dedup_cache_cap(),
            per_source_rate_cap: 0,
            dispatcher_ring_capacity: default_ring_capacity(),
            evaluator_budget_ms: default_evaluator_budget_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

fn default_global_inflight_cap() -> usize {
    16
}

fn default_broker_capacity() -> usize {
    4_096
}

fn default_dedup_cache_cap() -> usize {
    1_048_576
}

fn default_ring_capacity() -> usize {
    1_024
}

fn default_evaluator_budget_ms() -> u64 {
    50
}

fn default_rpc_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlCfg {
    #[serde(default = "default_control_listen")]
    pub listen: String,
    /// Event stream period; must keep the stream at >= 0.5 Hz.
    #[serde(default = "default_event_period_ms")]
    pub event_period_ms: u64,
    #[serde(default = "default_outcome_db_path")]
    pub outcome_db_path: String,
}

impl Default for ControlCfg {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
            event_period_ms: default_event_period_ms(),
            outcome_db_path: default_outcome_db_path(),
        }
    }
}

fn default_control_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_event_period_ms() -> u64 {
    1_000
}

fn default_outcome_db_path() -> String {
    "./stingbot.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedCfg {
    pub url: String,
    pub label: String,
    pub chain: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleAssetCfg {
    pub symbol: String,
    pub chain: u32,
    /// On-chain price feed contract.
    pub feed: Address,
    /// Storage slot holding the latest answer.
    #[serde(default)]
    pub slot: u64,
    #[serde(default = "default_feed_decimals")]
    pub decimals: u8,
}

fn default_feed_decimals() -> u8 {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleCfg {
    /// Assets to watch.
    #[serde(default)]
    pub assets: Vec<OracleAssetCfg>,
    #[serde(default = "default_deviation_threshold")]
    pub deviation_threshold: f64,
    #[serde(default = "default_stale_price_secs")]
    pub stale_price_secs: u64,
    #[serde(default = "default_oracle_poll_secs")]
    pub poll_secs: u64,
    /// CEX ticker endpoint template; `{asset}` is substituted.
    #[serde(default)]
    pub cex_ticker_url: Option<String>,
}

impl Default for OracleCfg {
    fn default() -> Self {
        Self {
            assets: Vec::new(),
            deviation_threshold: default_deviation_threshold(),
            stale_price_secs: default_stale_price_secs(),
            poll_secs: default_oracle_poll_secs(),
            cex_ticker_url: None,
        }
    }
}

fn default_deviation_threshold() -> f64 {
    0.01
}

fn default_stale_price_secs() -> u64 {
    90
}

fn default_oracle_poll_secs() -> u64 {
    5
}

impl MipConfig {
    pub fn load(path: impl AsRef<Path>) -> MipResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| MipError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> MipResult<Self> {
        let cfg: Self =
            toml::from_str(contents).map_err(|e| MipError::Config(format!("parse: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Range and consistency checks. Every rejection names the offending key.
    pub fn validate(&self) -> MipResult<()> {
        fn bad(key: &str, why: impl std::fmt::Display) -> MipError {
            MipError::Config(format!("{key}: {why}"))
        }

        if self.chains.is_empty() {
            return Err(bad("chains", "at least one chain is required"));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for chain in &self.chains {
            let key = format!("chains[{}]", chain.id);
            if !seen_ids.insert(chain.id) {
                return Err(bad(&key, "duplicate chain id"));
            }
            if chain.block_time_secs <= 0.0 || !chain.block_time_secs.is_finite() {
                return Err(bad(&key, "block_time_secs must be positive"));
            }
            if chain.confirmations == 0 {
                return Err(bad(&key, "confirmations must be >= 1"));
            }
            if chain.endpoints.is_empty() {
                return Err(bad(&key, "endpoints must not be empty"));
            }
            if !chain
                .endpoints
                .iter()
                .any(|e| e.role == EndpointRole::Primary)
            {
                return Err(bad(&key, "a primary endpoint is required"));
            }
            if chain.pending_ttl_secs == 0 {
                return Err(bad(&key, "pending_ttl_secs must be positive"));
            }
        }

        for proto in &self.protocols {
            let key = format!("protocols[{}]", proto.name);
            for entry in &proto.chains {
                if !seen_ids.contains(&entry.chain) {
                    return Err(bad(&key, format!("references unknown chain {}", entry.chain)));
                }
            }
            for sel in proto.selectors.keys() {
                let trimmed = sel.trim_start_matches("0x");
                if trimmed.len() != 8 || hex::decode(trimmed).is_err() {
                    return Err(bad(&key, format!("selector `{sel}` is not 4 bytes of hex")));
                }
            }
        }

        for (name, strat) in &self.strategies {
            let key = format!("strategies.{name}");
            if StrategyKind::parse(name).is_none() {
                return Err(bad(&key, "unknown strategy kind"));
            }
            let p = &strat.params;
            if !(1..=5).contains(&p.max_hops) {
                return Err(bad(&key, "max_hops must be in 1..=5"));
            }
            if p.safety_margin_bps >= 10_000 {
                return Err(bad(&key, "safety_margin_bps must be < 10000"));
            }
            if !(p.health_epsilon > 0.0 && p.health_epsilon < 1.0) {
                return Err(bad(&key, "health_epsilon must be in (0, 1)"));
            }
            if p.opportunity_ttl_secs <= 0.0 {
                return Err(bad(&key, "opportunity_ttl_secs must be positive"));
            }
            if p.in_flight_cap == 0 {
                return Err(bad(&key, "in_flight_cap must be >= 1"));
            }
            if let Some(digest) = &p.sim_digest {
                let trimmed = digest.trim_start_matches("0x");
                if trimmed.len() != 64 || hex::decode(trimmed).is_err() {
                    return Err(bad(&key, "sim_digest must be 32 bytes of hex"));
                }
            }
            if p.sim_artifact.is_some() != p.sim_digest.is_some() {
                return Err(bad(&key, "sim_artifact and sim_digest come as a pair"));
            }
        }

        if self.sandbox.memory_cap_mib == 0 || self.sandbox.memory_cap_mib > 4_096 {
            return Err(bad("sandbox.memory_cap_mib", "must be in 1..=4096"));
        }
        if self.sandbox.timeout_secs > 300 {
            return Err(bad("sandbox.timeout_secs", "must be <= 300"));
        }
        if self.sandbox.cache_entries == 0 {
            return Err(bad("sandbox.cache_entries", "must be positive"));
        }

        if !(0.0..=1.0).contains(&self.executor.gas.alpha) {
            return Err(bad("executor.gas.alpha", "must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.executor.gas.percentile) {
            return Err(bad("executor.gas.percentile", "must be in [0, 1]"));
        }
        if self.executor.target_block_window == 0 {
            return Err(bad("executor.target_block_window", "must be >= 1"));
        }
        for relay in &self.executor.relays {
            if !relay.url.starts_with("http://") && !relay.url.starts_with("https://") {
                return Err(bad(
                    &format!("executor.relays[{}]", relay.name),
                    "url must be http(s)",
                ));
            }
        }

        if self.limits.global_inflight_cap == 0 {
            return Err(bad("limits.global_inflight_cap", "must be >= 1"));
        }
        if self.limits.broker_capacity == 0 {
            return Err(bad("limits.broker_capacity", "must be >= 1"));
        }
        if self.limits.dedup_cache_cap == 0 {
            return Err(bad("limits.dedup_cache_cap", "must be >= 1"));
        }
        if self.limits.dispatcher_ring_capacity == 0 {
            return Err(bad("limits.dispatcher_ring_capacity", "must be >= 1"));
        }
        if !(1..=10_000).contains(&self.limits.evaluator_budget_ms) {
            return Err(bad("limits.evaluator_budget_ms", "must be in 1..=10000"));
        }
        if self.limits.rpc_timeout_ms == 0 {
            return Err(bad("limits.rpc_timeout_ms", "must be positive"));
        }

        if self.control.event_period_ms == 0 || self.control.event_period_ms > 2_000 {
            return Err(bad(
                "control.event_period_ms",
                "must keep the event stream at >= 0.5 Hz",
            ));
        }

        for feed in &self.feeds {
            if !seen_ids.contains(&feed.chain) {
                return Err(bad(
                    &format!("feeds[{}]", feed.label),
                    format!("references unknown chain {}", feed.chain),
                ));
            }
        }

        if !(0.0..1.0).contains(&self.oracle.deviation_threshold)
            || self.oracle.deviation_threshold <= 0.0
        {
            return Err(bad("oracle.deviation_threshold", "must be in (0, 1)"));
        }
        for asset in &self.oracle.assets {
            if !seen_ids.contains(&asset.chain) {
                return Err(bad(
                    &format!("oracle.assets[{}]", asset.symbol),
                    format!("references unknown chain {}", asset.chain),
                ));
            }
        }

        Ok(())
    }

    /// Strategy config with defaults for kinds the document omits.
    pub fn strategy(&self, kind: StrategyKind) -> StrategyCfg {
        self.strategies
            .get(kind.as_str())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[chains]]
        id = 1
        name = "mainnet"
        block_time_secs = 12.0
        wrapped_native = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"

        [[chains.endpoints]]
        url = "https://rpc.example.com"
        role = "primary"

        [[chains.endpoints]]
        url = "wss://rpc.example.com/ws"
        role = "websocket"
    "#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let cfg = MipConfig::from_toml(MINIMAL).expect("minimal config should load");
        assert_eq!(cfg.chains.len(), 1);
        assert_eq!(cfg.limits.global_inflight_cap, 16);
        assert_eq!(cfg.limits.dedup_cache_cap, 1_048_576);
        assert_eq!(cfg.sandbox.cache_entries, 100_000);
        assert_eq!(cfg.executor.gas.alpha, 0.2);
        let flash = cfg.strategy(StrategyKind::FlashArb);
        assert!(flash.enabled);
        assert_eq!(flash.params.max_hops, 3);
    }

    #[test]
    fn unknown_key_fails_load() {
        let doc = format!("{MINIMAL}\nsurprise = true\n");
        let err = MipConfig::from_toml(&doc).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn unknown_strategy_kind_fails() {
        let doc = format!(
            "{MINIMAL}\n[strategies.time_travel]\nenabled = true\n"
        );
        assert!(MipConfig::from_toml(&doc).is_err());
    }

    #[test]
    fn out_of_range_values_fail() {
        let doc = format!(
            "{MINIMAL}\n[strategies.sandwich]\nenabled = true\n[strategies.sandwich.params]\nmax_hops = 9\n"
        );
        assert!(MipConfig::from_toml(&doc).is_err());

        let doc = format!("{MINIMAL}\n[control]\nevent_period_ms = 5000\n");
        assert!(MipConfig::from_toml(&doc).is_err());

        let doc = format!("{MINIMAL}\n[sandbox]\nmemory_cap_mib = 0\n");
        assert!(MipConfig::from_toml(&doc).is_err());
    }

    #[test]
    fn missing_primary_endpoint_fails() {
        let doc = r#"
            [[chains]]
            id = 1
            name = "mainnet"
            block_time_secs = 12.0
            wrapped_native = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2"

            [[chains.endpoints]]
            url = "wss://rpc.example.com/ws"
            role = "websocket"
        "#;
        assert!(MipConfig::from_toml(doc).is_err());
    }
}
