//! Quote Oracle
//!
//! Combines independently operated price oracles into one authenticated
//! quote stream and serves it through price authorities.
//!
//! # Architecture
//!
//! - [`MedianAggregator`]: polls oracles on a shared timer and publishes the
//!   median of the valid samples
//! - [`authority`]: point queries and threshold triggers over a quote stream
//! - [`FluxMonitor`]: round and deviation driven submissions from one oracle
//! - [`PriceAuthorityRegistry`]: per-pair lookup with stable quote notifiers
//! - [`run_server`]: broadcasts feed events over WebSocket
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quote_oracle::{
//!     AggregatorConfig, Amount, Brand, MedianAggregator, OracleSource, PriceAuthority,
//!     QuoteIssuer, SimulatedOracle, SystemTimer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let atom = Brand::new("ATOM");
//!     let usd = Brand::new("USD");
//!     let aggregator = MedianAggregator::new(
//!         AggregatorConfig {
//!             brand_in: atom.clone(),
//!             brand_out: usd.clone(),
//!             unit_amount_in: 1,
//!             poll_interval: 5,
//!         },
//!         Arc::new(SystemTimer::default()),
//!         Arc::new(QuoteIssuer::new(Brand::new("quote"))),
//!     )?;
//!
//!     let oracle = Arc::new(SimulatedOracle::new(1200.0, 0.01, 0.0));
//!     aggregator
//!         .add_oracle("sim", OracleSource::polled(oracle, serde_json::json!({})))?;
//!
//!     let quote = aggregator.quote_given(&Amount::make(&atom, 10), &usd).await?;
//!     println!("10 ATOM = {} USD", quote.amount_out().value);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod authority;
pub mod config;
pub mod error;
pub mod flux;
pub mod issuer;
pub mod math;
pub mod oracle;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use aggregator::{AggregatorConfig, MedianAggregator, OracleAdmin, OracleSource};
pub use authority::{
    FungiblePriceAuthority, InversePriceAuthority, LinearPriceAuthority, LinearScale,
    MutableQuote, PendingQuote, PriceAuthority, QuoteAuthority, RateSample,
    SinglePriceAuthority, ValuePair,
};
pub use config::{FluxSettings, ServiceConfig, SimulatedOracleConfig};
pub use error::{
    AggregatorError, ConfigError, FluxError, OracleError, PriceAuthorityError,
    PriceAuthorityResult, QuoteError, RegistryError,
};
pub use flux::{FluxConfig, FluxMonitor, RoundStart};
pub use issuer::QuoteIssuer;
pub use oracle::{parse_sample, Oracle, OracleReply, ReplyObserver, ScriptedOracle, SimulatedOracle};
pub use registry::PriceAuthorityRegistry;
pub use server::{run_server, serve};
pub use telemetry::init_logging;

pub use quote_oracle_core::{
    make_notifier_kit, make_repeater, set_wakeup, ManualTimer, Notifier, Publisher,
    ReplaceableNotifiers, SystemTimer, TickSource, TimerService,
};
pub use quote_oracle_types::{
    Amount, Brand, Comparator, FeedEvent, NatValue, PriceQuote, QuoteView, Submission,
    SubmissionReason, Timestamp,
};
