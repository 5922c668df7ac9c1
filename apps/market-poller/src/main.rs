//! Market Poller Binary
//!
//! Replays recorded market books through a market listener. Markets are
//! split between two poll intervals and swap intervals every flip period.
//!
//! # Usage
//!
//! ```bash
//! MARKET_POLLER_REPLAY_FILE=apps/market-poller/demos/replay.json cargo run --bin market-poller
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_POLLER_REPLAY_FILE`: JSON file of recorded market book frames
//!
//! ## Optional
//! - `MARKET_POLLER_DEFAULT_INTERVAL_SECS`: first interval (default: 1.0)
//! - `MARKET_POLLER_ALT_INTERVAL_SECS`: second interval (default: 2.5)
//! - `MARKET_POLLER_FLIP_SECS`: interval swap period (default: 20)
//! - `MARKET_POLLER_CHANNEL_CAPACITY`: per-market buffer (default: 64)
//! - `MARKET_POLLER_METRICS_PORT`: Prometheus port, 0 disables (default: 9090)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: false)
//! - `RUST_LOG`: Log level (default: `market_poller=info`)

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use market_poller::infrastructure::telemetry;
use market_poller::{
    ListenerError, MarketBook, MarketListener, PollerConfig, ReplayFeed, SubscriptionHandle,
    TracingFaultLogger, init_metrics,
};
use tokio::signal;
use tokio::sync::Notify;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Market Poller");

    let config = PollerConfig::from_env()?;
    log_config(&config);

    if config.metrics.is_enabled() {
        init_metrics(config.metrics.port)?;
        tracing::info!(port = config.metrics.port, "Prometheus exporter listening");
    }

    let feed = Arc::new(
        ReplayFeed::load(&config.replay_file)
            .with_context(|| format!("failed to load {}", config.replay_file.display()))?,
    );
    let markets = feed.market_ids();
    anyhow::ensure!(!markets.is_empty(), "replay file contains no markets");

    let listener = MarketListener::pluggable(
        {
            let feed = Arc::clone(&feed);
            move |ids: &[String]| feed.next_for(ids)
        },
        Arc::new(TracingFaultLogger),
        config.listener.multiplexer_config("replay"),
    )?;

    let remaining = Arc::new(AtomicUsize::new(markets.len()));
    let all_done = Arc::new(Notify::new());

    let intervals = [
        config.demo.default_interval_secs,
        config.demo.alt_interval_secs,
    ];
    let handles = markets
        .iter()
        .enumerate()
        .map(|(i, market)| {
            watch_market(
                &listener,
                market,
                intervals[i % 2],
                &remaining,
                &all_done,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(markets = handles.len(), "Market poller ready");

    let mut flips = IntervalStream::new(tokio::time::interval_at(
        tokio::time::Instant::now() + config.demo.flip_period,
        config.demo.flip_period,
    ));

    let flipper = async {
        let mut flipped = false;
        while flips.next().await.is_some() {
            flipped = !flipped;
            for (i, market) in markets.iter().enumerate() {
                let secs = intervals[(i + usize::from(flipped)) % 2];
                if let Err(e) = listener.update_poll_interval(market, secs) {
                    tracing::warn!(market = %market, error = %e, "Failed to move market");
                }
            }
            tracing::info!(buckets = ?listener.bucket_intervals(), "Swapped intervals");
        }
    };

    tokio::select! {
        () = await_shutdown() => {}
        () = all_done.notified() => {
            tracing::info!("All markets completed");
        }
        () = flipper => {}
    }

    drop(handles);
    listener.dispose();

    tracing::info!("Market poller stopped");
    Ok(())
}

/// Subscribe to one market and log its updates.
fn watch_market(
    listener: &MarketListener,
    market: &str,
    interval_secs: f64,
    remaining: &Arc<AtomicUsize>,
    all_done: &Arc<Notify>,
) -> anyhow::Result<SubscriptionHandle> {
    let on_completed = finish(market, remaining, all_done, "Market completed");
    let on_error = {
        let finish = finish(market, remaining, all_done, "Market subscription failed");
        move |error: ListenerError| {
            tracing::warn!(error = %error, "Subscription error");
            finish();
        }
    };

    let handle = listener.subscribe_with(
        market,
        interval_secs,
        |book: MarketBook| {
            tracing::info!(
                market = %book.market_id,
                status = ?book.status,
                version = book.version,
                inplay = book.inplay,
                "Market update"
            );
        },
        on_completed,
        on_error,
    )?;

    tracing::info!(market, interval_secs, "Watching market");
    Ok(handle)
}

/// Callback counting down the markets still running.
fn finish(
    market: &str,
    remaining: &Arc<AtomicUsize>,
    all_done: &Arc<Notify>,
    message: &'static str,
) -> impl FnOnce() + Send + 'static {
    let market = market.to_string();
    let remaining = Arc::clone(remaining);
    let all_done = Arc::clone(all_done);
    move || {
        tracing::info!(market = %market, "{message}");
        if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            all_done.notify_one();
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &PollerConfig) {
    tracing::info!(
        replay_file = %config.replay_file.display(),
        default_interval_secs = config.demo.default_interval_secs,
        alt_interval_secs = config.demo.alt_interval_secs,
        flip_secs = config.demo.flip_period.as_secs_f64(),
        channel_capacity = config.listener.channel_capacity,
        metrics_port = config.metrics.port,
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
