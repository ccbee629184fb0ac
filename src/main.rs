//! Process entry point: boots the engine's components and runs the
//! orchestrator loop for one symbol.
//!
//! Spec §6 lists a CLI (`run` plus `reconcile-now`/`emergency-sync`/`pause`/
//! `resume` subcommands) under "External collaborator interfaces
//! (OUT-OF-SCOPE consumers)" alongside the dashboard and backtest REST API —
//! so this binary only wires up `run`; an operator reaches reconciliation
//! and pause/resume through the not-yet-built control surface, not this
//! process's argv.
//!
//! Grounded on the teacher's `main.rs` boot order (env load, tracing init,
//! `Config::from_env`, component construction, run) with the UI-specific
//! channel/dashboard wiring dropped — this engine has no dashboard.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tradecore::broker::alpaca::AlpacaAdapter;
use tradecore::broker::binance::BinanceAdapter;
use tradecore::broker::instant_conversion::InstantConversionAdapter;
use tradecore::broker::oanda::OandaAdapter;
use tradecore::broker::BrokerAdapter;
use tradecore::config::feature_flags::FeatureFlags;
use tradecore::config::{Config, Mode};
use tradecore::domain::drift::DriftThresholds;
use tradecore::domain::symbol::Symbol;
use tradecore::domain::timeframe::Timeframe;
use tradecore::indicators::IndicatorEngine;
use tradecore::metrics::Metrics;
use tradecore::orchestrator::{candle_feed, Orchestrator, OrchestratorConfig};
use tradecore::profit::ProfitManagerConfig;
use tradecore::reconciler::Reconciler;
use tradecore::signal::InMemoryPatternStats;
use tradecore::state::StateManager;
use tradecore::telemetry::DecisionLog;

const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default partial-exit tiers: 0.5%/1%/2% targets, exiting 30%/30%/40% of
/// the remaining size per spec §8's worked scenarios.
fn default_target_pcts() -> Vec<Decimal> {
    vec![dec!(0.005), dec!(0.01), dec!(0.02)]
}

fn default_exit_fractions() -> Vec<Decimal> {
    vec![dec!(0.3), dec!(0.3), dec!(0.4)]
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}

/// Selects and constructs the adapter named by `BROKER` (default
/// `instant-conversion`, the safest no-credentials-required default).
fn build_adapter() -> anyhow::Result<(Arc<dyn BrokerAdapter>, Symbol)> {
    let broker = std::env::var("BROKER").unwrap_or_else(|_| "instant-conversion".to_string());
    match broker.as_str() {
        "binance" => {
            let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
            let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
            Ok((Arc::new(BinanceAdapter::new(api_key, api_secret)), Symbol::new("BTC", "USD")))
        }
        "alpaca" => {
            let api_key = std::env::var("ALPACA_API_KEY").unwrap_or_default();
            let api_secret = std::env::var("ALPACA_API_SECRET").unwrap_or_default();
            Ok((Arc::new(AlpacaAdapter::new(api_key, api_secret)), Symbol::new("BTC", "USD")))
        }
        "oanda" => {
            let access_token = std::env::var("OANDA_ACCESS_TOKEN").unwrap_or_default();
            let refresh_token = std::env::var("OANDA_REFRESH_TOKEN").unwrap_or_default();
            Ok((Arc::new(OandaAdapter::new(access_token, refresh_token)), Symbol::new("EUR", "USD")))
        }
        "instant-conversion" => Ok((Arc::new(InstantConversionAdapter::new()), Symbol::new("BTC", "USD"))),
        other => anyhow::bail!("unknown BROKER '{other}'; expected binance, alpaca, oanda or instant-conversion"),
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Boot {
    config: Config,
    state: Arc<StateManager>,
    flags: Arc<FeatureFlags>,
    metrics: Arc<Metrics>,
    adapter: Arc<dyn BrokerAdapter>,
    symbol: Symbol,
    reconciler: Arc<Reconciler>,
}

fn boot() -> anyhow::Result<Boot> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    let state_path = (!config.mode.skips_persistence())
        .then(|| std::path::PathBuf::from(&config.data_dir).join("state.json"));
    let state = Arc::new(StateManager::new(config.mode, state_path));

    let flags_path = std::path::PathBuf::from(&config.config_dir).join("feature_flags.json");
    let flags = Arc::new(FeatureFlags::load(flags_path)?);

    let metrics = Arc::new(Metrics::new()?);

    let (adapter, symbol) = build_adapter()?;

    let thresholds = DriftThresholds { warning: dec!(0.001), pause: dec!(0.01) };
    let reconciler = Arc::new(Reconciler::new(state.clone(), adapter.clone(), symbol.clone(), config.mode, thresholds));

    Ok(Boot { config, state, flags, metrics, adapter, symbol, reconciler })
}

async fn run_engine(boot: Boot) -> anyhow::Result<()> {
    let decision_log = if matches!(boot.config.mode, Mode::Backtest) {
        None
    } else {
        let path = std::path::PathBuf::from(&boot.config.logs_dir).join("decisions.log");
        Some(Arc::new(DecisionLog::open(path)?))
    };

    let min_confidence = boot
        .flags
        .setting("SIGNAL_GATE", "minConfidence", serde_json::json!(20.0))
        .as_f64()
        .unwrap_or(20.0);

    let cfg = OrchestratorConfig {
        symbol: boot.symbol.clone(),
        mode: boot.config.mode,
        base_timeframe: Timeframe::M1,
        higher_timeframes: vec![Timeframe::M5, Timeframe::M15, Timeframe::H1],
        indicator_window: 200,
        base_size: dec!(0.01) * boot.config.tier.leverage(),
        min_confidence,
        tier: boot.config.tier,
        target_pcts: default_target_pcts(),
        exit_fractions: default_exit_fractions(),
        profit: ProfitManagerConfig::default(),
        reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
    };

    let orchestrator = Arc::new(Orchestrator::new(
        cfg,
        boot.state.clone(),
        boot.flags.clone(),
        Arc::new(IndicatorEngine::new()),
        boot.adapter.clone(),
        boot.reconciler.clone(),
        decision_log,
        Some(boot.metrics.clone()),
    ));

    orchestrator.bootstrap(now_ms()).await?;

    let candle_rx = candle_feed::spawn(boot.adapter.clone(), boot.symbol.clone(), Timeframe::M1, 0);
    let patterns = Arc::new(InMemoryPatternStats::default());

    info!("tradecore running in {:?} mode on {}", boot.config.mode, boot.symbol);
    orchestrator.run(candle_rx, patterns).await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let boot = boot()?;
    if let Err(e) = run_engine(boot).await {
        error!("tradecore exited with error: {e:#}");
        return Err(e);
    }
    Ok(())
}
