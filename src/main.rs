//! Stingbot - Real-time Mempool Intelligence & MEV Opportunity Pipeline
//! Mission: see every pending transaction first, act only when the math says so
//!
//! Wiring order matches the data flow: source adapters feed the normalizer,
//! the dispatcher fans out to the strategy evaluators, the broker ranks
//! what they find, the executor ships bundles, and the outcome tracker
//! closes the loop. Shutdown drains in the same order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stingbot_backend::{
    adapters::{ObservationStream, PollingAdapter, PushFeedAdapter, WsAdapter},
    broker::{Broker, BrokerConfig},
    clock,
    config::MipConfig,
    control::{self, ControlState},
    dispatch::{Dispatcher, FilterSpec},
    error::{exit, MipError},
    executor::{BundleExecutor, FeeObserver, OperatorSigner},
    ingress::{run_ingest_loop, Normalizer},
    metrics,
    models::{PendingObservation, StrategyKind},
    oracle::OracleMonitor,
    outcome::{OutcomeStore, OutcomeTracker, RollingWindows},
    registry::Registry,
    sandbox::Sandbox,
    shutdown::Shutdown,
    strategies::{spawn_strategies, ContextBuilder, LendingView, PoolStateView},
};

#[derive(Debug, Parser)]
#[command(name = "stingbot", about = "Real-time mempool intelligence pipeline")]
struct Args {
    /// Path to the pipeline configuration document.
    #[arg(long, env = "STINGBOT_CONFIG", default_value = "stingbot.toml")]
    config: PathBuf,

    /// Override the control-plane listen address.
    #[arg(long)]
    control_listen: Option<String>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let code = match run(args).await {
        Ok(()) => exit::OK,
        Err(e) => {
            let code = match e.downcast_ref::<MipError>() {
                Some(MipError::Config(_)) => exit::CONFIG,
                Some(MipError::EndpointUnreachable(_)) => exit::UNREACHABLE,
                Some(MipError::InvariantViolation(msg)) => {
                    // The one path allowed to kill the process: dump and go.
                    error!(diagnostic = %msg, "invariant violation");
                    exit::INVARIANT
                }
                _ => exit::INVARIANT,
            };
            error!(error = %e, code, "stingbot exiting");
            code
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = MipConfig::load(&args.config)?;
    if let Some(listen) = args.control_listen {
        cfg.control.listen = listen;
    }
    info!(config = %args.config.display(), chains = cfg.chains.len(), "configuration loaded");

    let metrics_handle = metrics::install()?;
    let registry = Registry::from_config(&cfg)?;
    let rpc_timeout = Duration::from_millis(cfg.limits.rpc_timeout_ms);

    // Cross-cutting read views.
    let oracle = Arc::new(OracleMonitor::new(
        cfg.oracle.clone(),
        &registry.chains,
        rpc_timeout,
    )?);
    let windows = Arc::new(RollingWindows::default());
    let sandbox = Arc::new(Sandbox::new(&cfg.sandbox)?);
    let pools = PoolStateView::new();
    let lending = LendingView::new();
    let store = OutcomeStore::open(&cfg.control.outcome_db_path)
        .map_err(|e| MipError::Config(format!("outcome db: {e}")))?;

    // Shutdown stages, triggered in drain order.
    let adapters_stage = Shutdown::new();
    let pipeline_stage = Shutdown::new();
    let strategies_stage = Shutdown::new();
    let executor_stage = Shutdown::new();
    let tracker_stage = Shutdown::new();
    let background_stage = Shutdown::new();

    // Dispatcher + normalizer.
    let dispatcher = Dispatcher::new();
    let normalizer = Arc::new(Normalizer::new(
        registry.chains.clone(),
        cfg.limits.dedup_cache_cap,
        rpc_timeout,
    )?);

    // Source adapters: every chain must bring up at least one ingress.
    let (obs_tx, obs_rx) = mpsc::channel(8_192);
    let rate_cap = cfg.limits.per_source_rate_cap;
    let ring = cfg.limits.dispatcher_ring_capacity;
    for chain in registry.chains.snapshot().iter() {
        let mut opened = 0usize;

        if chain.websocket_endpoint().is_some() {
            match WsAdapter::open(chain.clone(), rate_cap, ring, adapters_stage.token()).await {
                Ok(stream) => {
                    opened += 1;
                    spawn_forwarder(stream, obs_tx.clone());
                }
                Err(e) => warn!(chain = chain.id, error = %e, "websocket adapter failed"),
            }
        }

        match PollingAdapter::open(
            chain.clone(),
            rpc_timeout,
            rate_cap,
            ring,
            adapters_stage.token(),
        )
        .await
        {
            Ok(stream) => {
                opened += 1;
                spawn_forwarder(stream, obs_tx.clone());
            }
            Err(e) => warn!(chain = chain.id, error = %e, "polling adapter failed"),
        }

        if opened == 0 {
            return Err(MipError::EndpointUnreachable(format!(
                "chain {}: no ingress endpoint reachable",
                chain.id
            ))
            .into());
        }
        info!(chain = chain.id, adapters = opened, "chain ingress online");
    }
    for feed in &cfg.feeds {
        match PushFeedAdapter::open(feed.clone(), rate_cap, ring, adapters_stage.token()).await {
            Ok(stream) => spawn_forwarder(stream, obs_tx.clone()),
            Err(e) => warn!(feed = %feed.label, error = %e, "push feed unavailable"),
        }
    }
    drop(obs_tx);

    // Normalize -> dispatch loop.
    let ingest_handle = tokio::spawn(run_ingest_loop(
        normalizer.clone(),
        obs_rx,
        dispatcher.clone(),
        pipeline_stage.token(),
        Duration::from_secs(30),
    ));

    // Gas fee observer rides its own subscription.
    let fees = Arc::new(FeeObserver::new(512));
    {
        let mut sub = dispatcher.subscribe("fee-observer", FilterSpec::default(), 2_048);
        let fees = fees.clone();
        tokio::spawn(async move {
            while let Some(tx) = sub.recv().await {
                fees.record(&tx);
            }
        });
    }

    // Broker, sized from config.
    let mut broker_cfg = BrokerConfig {
        outer_capacity: cfg.limits.broker_capacity,
        global_inflight_cap: cfg.limits.global_inflight_cap,
        ..Default::default()
    };
    for kind in StrategyKind::ALL {
        let params = cfg.strategy(kind).params;
        broker_cfg
            .per_strategy_caps
            .insert(kind, params.in_flight_cap);
        broker_cfg
            .cooldowns
            .insert(kind, Duration::from_secs(params.cooldown_secs));
    }
    let broker = Arc::new(Broker::new(broker_cfg));

    // Executor + outcome tracker.
    let signer = OperatorSigner::from_env(&cfg.executor.operator_key_env)?;
    info!(operator = %signer.address(), "operator key loaded");
    let (event_tx, event_rx) = mpsc::channel(256);
    let executor = Arc::new(BundleExecutor::new(
        registry.clone(),
        cfg.executor.clone(),
        &cfg.limits,
        signer,
        broker.clone(),
        fees.clone(),
        event_tx,
    )?);
    let executor_handle = tokio::spawn(executor.clone().run(executor_stage.token()));

    let tracker = OutcomeTracker::new(
        registry.clone(),
        windows.clone(),
        store.clone(),
        broker.clone(),
        normalizer.clone(),
        oracle.clone(),
        rpc_timeout,
    )?;
    tracker.spawn_head_watchers(&tracker_stage);
    let tracker_run = tokio::spawn(tracker.clone().run(event_rx, tracker_stage.token()));

    // Strategy evaluators.
    let builder = Arc::new(ContextBuilder {
        registry: registry.clone(),
        oracle: oracle.clone(),
        weights: windows.clone(),
        sandbox: sandbox.clone(),
        pools: pools.clone(),
        lending: lending.clone(),
    });
    let (strategy_set, strategy_handles) = spawn_strategies(
        &cfg,
        &dispatcher,
        broker.clone(),
        builder,
        &strategies_stage,
    );

    // Background pollers.
    tokio::spawn(oracle.clone().run(background_stage.token()));
    tokio::spawn(pools.clone().run_refresher(
        registry.clone(),
        rpc_timeout,
        Duration::from_secs(2),
        background_stage.token(),
    ));
    tokio::spawn(lending.clone().run_refresher(
        registry.clone(),
        rpc_timeout,
        Duration::from_secs(10),
        background_stage.token(),
    ));

    // Control plane.
    let control_state = ControlState {
        registry: registry.clone(),
        config_path: args.config.clone(),
        broker: broker.clone(),
        strategies: strategy_set,
        normalizer: normalizer.clone(),
        dispatcher: dispatcher.clone(),
        sandbox: sandbox.clone(),
        oracle: oracle.clone(),
        windows: windows.clone(),
        store: store.clone(),
        executor: executor.clone(),
        tracker: tracker.clone(),
        metrics: metrics_handle,
        started_at: clock::now(),
        event_period: Duration::from_millis(cfg.control.event_period_ms),
    };
    let listen = cfg.control.listen.clone();
    tokio::spawn(control::serve(
        listen,
        control_state,
        background_stage.token(),
    ));

    info!("🦂 stingbot pipeline online");
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested; draining");

    // Drain order: adapters -> normalizer -> dispatcher -> evaluators ->
    // executor flush -> tracker final pass -> background.
    adapters_stage.trigger();
    if tokio::time::timeout(Duration::from_secs(10), ingest_handle)
        .await
        .is_err()
    {
        warn!("normalizer drain timed out");
        pipeline_stage.trigger();
    }

    dispatcher.close_all();
    strategies_stage.trigger();
    for handle in strategy_handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }

    executor_stage.trigger();
    if let Err(e) = executor_handle.await {
        if e.is_panic() {
            return Err(MipError::InvariantViolation(format!("executor panicked: {e}")).into());
        }
    }

    tracker_stage.trigger();
    if let Err(e) = tracker_run.await {
        if e.is_panic() {
            return Err(MipError::InvariantViolation(format!("tracker panicked: {e}")).into());
        }
    }

    background_stage.trigger();
    info!("clean shutdown complete");
    Ok(())
}

fn spawn_forwarder(mut stream: ObservationStream, out: mpsc::Sender<PendingObservation>) {
    tokio::spawn(async move {
        while let Some(obs) = stream.next().await {
            if out.send(obs).await.is_err() {
                break;
            }
        }
    });
}
