//! Quote Oracle Service
//!
//! Aggregates simulated oracles into a median quote stream, serves it through
//! a price authority registry, and broadcasts feed events over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! ORACLE_CONFIG=oracle.toml cargo run
//! ```

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use quote_oracle::{
    init_logging, make_notifier_kit, run_server, AggregatorConfig, Amount, Brand, FeedEvent,
    FluxConfig, FluxMonitor, InversePriceAuthority, MedianAggregator, Notifier, Oracle,
    OracleSource, PriceAuthority, PriceAuthorityRegistry, QuoteIssuer, QuoteView, RoundStart,
    ServiceConfig, SimulatedOracle, SystemTimer, TickSource, TimerService,
};

/// Move that re-arms the price alert, in basis points.
const ALERT_BAND_BPS: u128 = 100;

/// Publish a new round on every tick of the cron schedule.
fn spawn_rounds(ticks: TickSource) -> Notifier<RoundStart> {
    let (publisher, notifier) = make_notifier_kit(None);
    tokio::spawn(async move {
        let mut ticks = ticks.ticks();
        let mut round_id = 0;
        while let Some(tick) = ticks.next_tick().await {
            let started_at = match tick {
                Ok(started_at) => started_at,
                Err(e) => {
                    publisher.fail(e.to_string());
                    return;
                }
            };
            round_id += 1;
            info!("Starting round {}", round_id);
            if publisher
                .update_state(RoundStart {
                    round_id,
                    started_at,
                })
                .is_err()
            {
                return;
            }
        }
    });
    notifier
}

/// Log whenever the price leaves a band around the last alert level.
async fn price_alerts(
    authority: Arc<dyn PriceAuthority>,
    unit: Amount,
    brand_out: Brand,
) -> anyhow::Result<()> {
    loop {
        let base = authority.quote_given(&unit, &brand_out).await?;
        let level = base.amount_out().value;
        let band = (level.saturating_mul(ALERT_BAND_BPS) / 10_000).max(1);

        let above = authority.quote_when_gte(&unit, &Amount::make(&brand_out, level.saturating_add(band)))?;
        let below =
            authority.quote_when_lte(&unit, &Amount::make(&brand_out, level.saturating_sub(band)))?;

        let (direction, quote) = tokio::select! {
            quote = above => ("up", quote?),
            quote = below => ("down", quote?),
        };
        info!(
            "Price alert: {} {} moved {} from {} to {}",
            unit.value,
            unit.brand,
            direction,
            level,
            quote.amount_out().value
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let config = ServiceConfig::load()?;
    info!("Starting Quote Oracle Service");
    info!(
        "Pair {}/{} from oracles: {}",
        config.brand_in,
        config.brand_out,
        config
            .oracles
            .iter()
            .map(|o| o.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let timer: Arc<dyn TimerService> = Arc::new(SystemTimer::new("system"));
    let brand_in = Brand::new(config.brand_in.clone());
    let brand_out = Brand::new(config.brand_out.clone());
    let unit = Amount::make(&brand_in, u128::from(config.unit_amount_in));

    let aggregator = Arc::new(MedianAggregator::new(
        AggregatorConfig {
            brand_in: brand_in.clone(),
            brand_out: brand_out.clone(),
            unit_amount_in: unit.value,
            poll_interval: config.poll_interval_secs,
        },
        Arc::clone(&timer),
        Arc::new(QuoteIssuer::new(Brand::new("quote"))),
    )?);

    // Create broadcast channel for feed events (to WebSocket clients)
    let (broadcast_tx, _) = broadcast::channel::<FeedEvent>(256);

    // Start WebSocket server
    let server_rx = broadcast_tx.subscribe();
    let server_quotes = aggregator.authority().notifier();
    let addr = config.bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_server(&addr, server_quotes, server_rx).await {
            warn!("Feed server stopped: {:#}", e);
        }
    });

    // Register oracles
    let query = json!({ "pair": format!("{}/{}", brand_in, brand_out) });
    let mut oracles: Vec<Arc<dyn Oracle>> = Vec::new();
    for oracle_config in &config.oracles {
        let oracle: Arc<dyn Oracle> = Arc::new(SimulatedOracle::new(
            oracle_config.start,
            oracle_config.volatility,
            oracle_config.failure_rate,
        ));
        aggregator.add_oracle(
            oracle_config.name.clone(),
            OracleSource::polled(Arc::clone(&oracle), query.clone()),
        )?;
        let _ = broadcast_tx.send(FeedEvent::OracleAdded {
            oracle: oracle_config.name.clone(),
        });
        oracles.push(oracle);
    }

    // Price authorities for both directions
    let registry = PriceAuthorityRegistry::new();
    registry.register(aggregator.clone(), &brand_in, &brand_out, false)?;
    let inverse = InversePriceAuthority::spawn(
        &*aggregator,
        &brand_in,
        &brand_out,
        Arc::new(QuoteIssuer::new(Brand::new("inverse-quote"))),
    )?;
    registry.register(Arc::new(inverse), &brand_out, &brand_in, false)?;

    // Flux monitor over the first oracle
    let rounds = match &config.round_schedule {
        Some(expr) => Some(spawn_rounds(TickSource::cron(Arc::clone(&timer), expr)?)),
        None => None,
    };
    let flux = FluxMonitor::spawn(
        Arc::clone(&oracles[0]),
        rounds,
        FluxConfig {
            poll_interval: config.flux.poll_interval_secs,
            absolute_threshold: u128::from(config.flux.absolute_threshold),
            fractional_threshold: config.flux.fractional_threshold,
            idle_timer_ticks: config.flux.idle_timer_ticks,
            query,
        },
        Arc::clone(&timer),
    )?;
    let submissions = flux.submissions().updates();
    let submission_tx = broadcast_tx.clone();
    tokio::spawn(async move {
        futures_util::pin_mut!(submissions);
        while let Some(Ok(submission)) = submissions.next().await {
            let _ = submission_tx.send(FeedEvent::Submission(submission));
        }
    });

    let alert_authority = registry.lookup(&brand_in, &brand_out)?;
    let alert_unit = unit.clone();
    let alert_brand = brand_out.clone();
    tokio::spawn(async move {
        if let Err(e) = price_alerts(alert_authority, alert_unit, alert_brand).await {
            warn!("Price alerts stopped: {}", e);
        }
    });

    // Process quotes and broadcast to clients
    let quotes = registry.quote_notifier(&brand_in, &brand_out).updates();
    futures_util::pin_mut!(quotes);
    let mut last_price: Option<f64> = None;

    while let Some(update) = quotes.next().await {
        let quote = match update {
            Ok(quote) => quote,
            Err(e) => {
                warn!("Quote stream failed: {}", e);
                let _ = broadcast_tx.send(FeedEvent::Error {
                    message: e.to_string(),
                });
                break;
            }
        };
        let view = QuoteView::from(&quote);
        let _ = broadcast_tx.send(FeedEvent::Quote(view.clone()));

        // Log price changes (avoid spamming on every update)
        let price = view.amount_out as f64 / view.amount_in as f64;
        let should_log = match last_price {
            Some(last) => ((price - last) / last).abs() > 0.001, // Log if > 0.1% change
            None => true,
        };
        if should_log {
            info!(
                "{}/{}: {:.4} (t={}, oracles: {})",
                view.brand_in,
                view.brand_out,
                price,
                view.timestamp,
                aggregator.oracle_count()
            );
            last_price = Some(price);
        }
    }

    flux.shutdown();
    Ok(())
}
