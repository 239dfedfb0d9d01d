//! End-to-end pipeline wiring tests, no network required: observations run
//! through the normalizer into the dispatcher, a crafted victim swap drives
//! the sandwich evaluator, and the broker schedules exactly one survivor.

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256};

use stingbot_backend::broker::{Broker, BrokerConfig, SubmitOutcome};
use stingbot_backend::clock;
use stingbot_backend::config::{MipConfig, OracleCfg, PoolCfg, SandboxCfg};
use stingbot_backend::dispatch::{Dispatcher, FilterSpec};
use stingbot_backend::ingress::Normalizer;
use stingbot_backend::models::{
    GasPricing, ObservationPayload, PendingObservation, PendingTx, RawTransaction, SourceId,
};
use stingbot_backend::oracle::OracleMonitor;
use stingbot_backend::outcome::RollingWindows;
use stingbot_backend::registry::Registry;
use stingbot_backend::sandbox::Sandbox;
use stingbot_backend::strategies::{
    ContextBuilder, EvalContext, Evaluator, LendingView, PoolStateView, SandwichEvaluator,
};

const CHAIN: u32 = 1;
const SWAP_SELECTOR: [u8; 4] = [0x38, 0xed, 0x17, 0x39];

fn base_token() -> Address {
    Address::repeat_byte(0xee)
}

fn other_token() -> Address {
    Address::repeat_byte(0xcc)
}

fn pool_address() -> Address {
    Address::repeat_byte(0x10)
}

/// ~1M tokens of liquidity per side, in 18-decimal base units.
fn deep_reserve() -> U256 {
    U256::from(10u64).pow(U256::from(24u64))
}

fn test_config() -> MipConfig {
    let doc = r#"
        [[chains]]
        id = 1
        name = "testnet"
        block_time_secs = 12.0
        wrapped_native = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"

        [[chains.endpoints]]
        url = "https://rpc.invalid"
        role = "primary"

        [[protocols]]
        name = "unified-v2"
        kind = "dex"

        [protocols.selectors]
        "0x38ed1739" = "swap_exact_tokens"

        [[protocols.chains]]
        chain = 1

        [[protocols.chains.pools]]
        address = "0x1010101010101010101010101010101010101010"
        token0 = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"
        token1 = "0xcccccccccccccccccccccccccccccccccccccccc"
        fee_bps = 30
    "#;
    MipConfig::from_toml(doc).expect("test config loads")
}

fn context_builder(registry: Arc<Registry>, pools: Arc<PoolStateView>) -> ContextBuilder {
    let oracle = Arc::new(
        OracleMonitor::new(OracleCfg::default(), &registry.chains, Duration::from_secs(2))
            .unwrap(),
    );
    ContextBuilder {
        registry,
        oracle,
        weights: Arc::new(RollingWindows::default()),
        sandbox: Arc::new(Sandbox::new(&SandboxCfg::default()).unwrap()),
        pools,
        lending: LendingView::new(),
    }
}

fn swap_calldata(amount_in: U256, min_out: U256) -> Bytes {
    let mut data = SWAP_SELECTOR.to_vec();
    let mut word = |v: U256| data.extend_from_slice(&v.to_be_bytes::<32>());
    word(amount_in);
    word(min_out);
    word(U256::from(5 * 32u64));
    word(U256::ZERO);
    word(U256::from(9_999_999_999u64));
    word(U256::from(2u64));
    let mut push_addr = |a: Address| {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(a.as_slice());
        data.extend_from_slice(&w);
    };
    push_addr(base_token());
    push_addr(other_token());
    Bytes::from(data)
}

fn victim_tx(amount_in: U256, min_out: U256, nonce: u64) -> PendingTx {
    let now = clock::now();
    PendingTx {
        hash: B256::random(),
        chain: CHAIN,
        from: Address::repeat_byte(0x77),
        to: Some(Address::repeat_byte(0x01)),
        value: U256::ZERO,
        gas_limit: 250_000,
        pricing: Some(GasPricing::Eip1559 {
            max_fee: 40_000_000_000,
            priority_fee: 2_000_000_000,
        }),
        nonce,
        input: swap_calldata(amount_in, min_out),
        first_seen: now,
        last_seen: now,
        source: SourceId::new("test"),
    }
}

/// Victim swaps 5% of the pool and tolerates ~16% slippage.
fn juicy_victim() -> PendingTx {
    let amount_in = deep_reserve() / U256::from(20u64);
    let min_out = amount_in * U256::from(80u64) / U256::from(100u64);
    victim_tx(amount_in, min_out, 7)
}

fn observation(hash: B256, nonce: u64) -> PendingObservation {
    let raw = RawTransaction {
        hash,
        from: Address::repeat_byte(0x11),
        to: Some(Address::repeat_byte(0x22)),
        value: U256::from(1_000u64),
        gas: U256::from(21_000u64),
        gas_price: Some(U256::from(30_000_000_000u64)),
        max_fee_per_gas: None,
        max_priority_fee_per_gas: None,
        nonce: U256::from(nonce),
        input: Bytes::new(),
    };
    PendingObservation {
        chain: CHAIN,
        hash,
        payload: ObservationPayload::Raw(Box::new(raw)),
        source: SourceId::new("burst"),
        seen_at: clock::now(),
    }
}

#[tokio::test]
async fn burst_of_duplicates_reaches_subscribers_once() {
    let cfg = test_config();
    let registry = Registry::from_config(&cfg).unwrap();
    let normalizer =
        Normalizer::new(registry.chains.clone(), 1 << 20, Duration::from_secs(2)).unwrap();
    let dispatcher = Dispatcher::new();
    let mut sub = dispatcher.subscribe("observer", FilterSpec::default(), 64);

    let hash = B256::repeat_byte(0xaa);
    for _ in 0..10_000 {
        if let Some(tx) = normalizer.ingest(observation(hash, 0)).await {
            dispatcher.publish(tx);
        }
    }

    assert_eq!(normalizer.stats().duplicates, 9_999);
    let delivered = sub.recv().await.expect("one delivery");
    assert_eq!(delivered.hash, hash);
    assert!(sub.try_recv().is_none(), "burst must collapse to one tx");
}

#[tokio::test]
async fn sandwich_flows_from_calldata_to_broker_schedule() {
    let cfg = test_config();
    let registry = Registry::from_config(&cfg).unwrap();
    let pools = PoolStateView::new();
    pools.record(CHAIN, pool_address(), deep_reserve(), deep_reserve());
    let builder = context_builder(registry, pools);
    let ctx: EvalContext = builder.snapshot();

    let victim = Arc::new(juicy_victim());
    let evaluator = SandwichEvaluator::new(15, Duration::from_secs(5), 0.0);
    let opportunities = evaluator.evaluate(victim.clone(), &ctx).await.unwrap();
    assert_eq!(opportunities.len(), 1, "one sandwich per victim");

    let opp = opportunities[0].clone();
    assert_eq!(opp.net_profit, opp.gross_profit - opp.gas_cost);
    assert!(opp.net_profit > U256::ZERO);
    assert!(!opp.is_informational());
    assert_eq!(opp.fingerprints, vec![victim.fingerprint()]);

    // Broker schedules it exactly once.
    let broker = Broker::new(BrokerConfig::default());
    assert_eq!(
        broker.submit(opp.clone(), clock::now()),
        SubmitOutcome::Accepted
    );
    let served = broker.poll(clock::now()).expect("ranked first");
    assert_eq!(served.id, opp.id);
    assert!(broker.poll(clock::now()).is_none());
}

#[tokio::test]
async fn replayed_tx_yields_at_most_one_scheduled_opportunity() {
    let cfg = test_config();
    let registry = Registry::from_config(&cfg).unwrap();
    let pools = PoolStateView::new();
    pools.record(CHAIN, pool_address(), deep_reserve(), deep_reserve());
    let builder = context_builder(registry, pools);
    let evaluator = SandwichEvaluator::new(15, Duration::from_secs(5), 0.0);
    let broker = Broker::new(BrokerConfig::default());

    let victim = Arc::new(juicy_victim());

    // The same transaction replayed through the evaluator: identical
    // fingerprints, monotonically staler confidence.
    for _ in 0..5 {
        let ctx = builder.snapshot();
        for opp in evaluator.evaluate(victim.clone(), &ctx).await.unwrap() {
            broker.submit(opp, clock::now());
        }
    }

    let first = broker.poll(clock::now()).expect("one winner");
    assert_eq!(first.fingerprints, vec![victim.fingerprint()]);
    assert!(
        broker.poll(clock::now()).is_none(),
        "replays must collapse to one scheduled opportunity per window"
    );
}

#[tokio::test]
async fn protocol_registry_reload_is_atomic_for_readers() {
    let cfg = test_config();
    let registry = Registry::from_config(&cfg).unwrap();
    let before = registry.protocols.snapshot();
    assert_eq!(before.pools_on_chain(CHAIN).len(), 1);

    // Reload with an extra pool; old snapshot stays untouched.
    let mut next = cfg.clone();
    next.protocols[0].chains[0].pools.push(PoolCfg {
        address: Address::repeat_byte(0x11),
        token0: base_token(),
        token1: Address::repeat_byte(0xdd),
        fee_bps: 30,
        pair: None,
    });
    registry.reload(&next).unwrap();

    assert_eq!(before.pools_on_chain(CHAIN).len(), 1);
    assert_eq!(registry.protocols.snapshot().pools_on_chain(CHAIN).len(), 2);
}
