//! Median aggregator scenarios with oracles that ramp linearly in time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use quote_oracle::{
    AggregatorConfig, Amount, Brand, ManualTimer, MedianAggregator, NatValue, Notifier, Oracle,
    OracleError, OracleReply, OracleSource, PriceAuthority, PriceQuote, QuoteIssuer, TimerService,
    Timestamp,
};

/// Reports `start + step * (now - origin)`.
struct RampOracle {
    timer: Arc<ManualTimer>,
    origin: Timestamp,
    start: u64,
    step: u64,
}

impl RampOracle {
    fn starting_now(timer: &Arc<ManualTimer>, start: u64, step: u64) -> Arc<dyn Oracle> {
        Arc::new(Self {
            timer: Arc::clone(timer),
            origin: timer.current_timestamp(),
            start,
            step,
        })
    }
}

#[async_trait]
impl Oracle for RampOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        let elapsed = self.timer.current_timestamp() - self.origin;
        Ok(OracleReply::free(json!(self.start + self.step * elapsed)))
    }
}

/// Answers `value` unless switched to failing.
struct SwitchOracle {
    value: u64,
    failing: AtomicBool,
}

impl SwitchOracle {
    fn new(value: u64) -> Arc<Self> {
        Arc::new(Self {
            value,
            failing: AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Oracle for SwitchOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable);
        }
        Ok(OracleReply::free(json!(self.value)))
    }
}

/// Answers its first query, then never answers again.
struct StallingOracle {
    first: u64,
    queries: AtomicU64,
}

#[async_trait]
impl Oracle for StallingOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        if self.queries.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(OracleReply::free(json!(self.first)));
        }
        futures_util::future::pending().await
    }
}

/// Holds every reply until it is released by query index.
#[derive(Default)]
struct HeldOracle {
    replies: Mutex<Vec<Option<oneshot::Sender<u64>>>>,
}

impl HeldOracle {
    fn issued(&self) -> usize {
        self.replies.lock().len()
    }

    fn release(&self, query: usize, value: u64) {
        if let Some(reply) = self.replies.lock()[query].take() {
            let _ = reply.send(value);
        }
    }
}

#[async_trait]
impl Oracle for HeldOracle {
    async fn on_query(&self, _query: &Value, _fee: Option<&Amount>) -> Result<OracleReply, OracleError> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push(Some(tx));
        let value = rx.await.map_err(|_| OracleError::Unavailable)?;
        Ok(OracleReply::free(json!(value)))
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

struct Fixture {
    timer: Arc<ManualTimer>,
    aggregator: MedianAggregator,
    quotes: Notifier<PriceQuote>,
    last_seen: Option<u64>,
    atom: Brand,
    usd: Brand,
}

impl Fixture {
    fn new() -> Self {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let atom = Brand::new("ATOM");
        let usd = Brand::new("USD");
        let aggregator = MedianAggregator::new(
            AggregatorConfig {
                brand_in: atom.clone(),
                brand_out: usd.clone(),
                unit_amount_in: 1,
                poll_interval: 1,
            },
            timer.clone(),
            Arc::new(QuoteIssuer::new(Brand::new("quote"))),
        )
        .unwrap();
        let quotes = aggregator.quote_notifier(&atom, &usd).unwrap();
        Self {
            timer,
            aggregator,
            quotes,
            last_seen: None,
            atom,
            usd,
        }
    }

    fn ramp(&self, start: u64, step: u64) -> Arc<dyn Oracle> {
        RampOracle::starting_now(&self.timer, start, step)
    }

    fn add(&self, name: &str, oracle: Arc<dyn Oracle>) {
        self.aggregator
            .add_oracle(name, OracleSource::polled(oracle, json!({"pair": "ATOM/USD"})))
            .unwrap();
    }

    /// Wait for the next published median.
    async fn next_median(&mut self) -> NatValue {
        let record = self.quotes.get_update_since(self.last_seen).await.unwrap();
        self.last_seen = record.update_count;
        assert_eq!(record.value.timestamp(), self.timer.current_timestamp());
        record.value.amount_out().value
    }

    /// Advance one poll interval and wait for its median.
    async fn tick(&mut self) -> NatValue {
        self.timer.tick();
        self.next_median().await
    }
}

#[tokio::test]
async fn test_median_sequence_across_add_and_drop() {
    let mut fx = Fixture::new();

    // Each oracle ramps from its creation; it joins two ticks later.
    let a = fx.ramp(1000, 10);
    fx.timer.tick();
    fx.timer.tick();
    fx.add("a", a);
    assert_eq!(fx.next_median().await, 1020);
    let b = fx.ramp(1300, 8);

    assert_eq!(fx.tick().await, 1030);

    assert_eq!(fx.tick().await, 1040);
    fx.add("b", b);
    assert_eq!(fx.next_median().await, 1178);
    let c = fx.ramp(800, 17);

    assert_eq!(fx.tick().await, 1187);

    assert_eq!(fx.tick().await, 1196);
    fx.add("c", c);
    assert_eq!(fx.next_median().await, 1060);

    assert_eq!(fx.tick().await, 1070);

    assert_eq!(fx.tick().await, 1080);
    fx.aggregator.drop_oracle("b").unwrap();
    assert_eq!(fx.next_median().await, 974);

    assert_eq!(fx.aggregator.oracle_ids(), vec!["a".to_string(), "c".to_string()]);
}

#[tokio::test]
async fn test_triggers_fire_on_expected_ticks() {
    let mut fx = Fixture::new();
    fx.add("a", fx.ramp(1000, 10));
    assert_eq!(fx.next_median().await, 1000);

    let atom_37 = Amount::make(&fx.atom, 37);
    let atom_29 = Amount::make(&fx.atom, 29);
    let mut above = fx
        .aggregator
        .quote_when_gte(&atom_37, &Amount::make(&fx.usd, 1183 * 37))
        .unwrap();
    let mut below = fx
        .aggregator
        .quote_when_lte(&atom_29, &Amount::make(&fx.usd, 974 * 29))
        .unwrap();

    assert_eq!(fx.tick().await, 1010);
    assert_eq!(fx.tick().await, 1020);
    fx.add("b", fx.ramp(1310, 8));
    assert_eq!(fx.next_median().await, 1165);

    assert_eq!(fx.tick().await, 1174);
    assert!((&mut above).now_or_never().is_none());

    // Tick 4
    assert_eq!(fx.tick().await, 1183);
    let quote = (&mut above).now_or_never().unwrap().unwrap();
    assert_eq!(quote.amount_in().value, 37);
    assert_eq!(quote.amount_out().value, 1183 * 37);
    assert_eq!(quote.timestamp(), 4);

    assert_eq!(fx.tick().await, 1192);
    fx.add("c", fx.ramp(816, 17));
    assert_eq!(fx.next_median().await, 1050);

    assert_eq!(fx.tick().await, 1060);
    assert_eq!(fx.tick().await, 1070);
    assert!((&mut below).now_or_never().is_none());

    // Tick 7
    fx.aggregator.drop_oracle("b").unwrap();
    assert_eq!(fx.next_median().await, 960);
    let quote = (&mut below).now_or_never().unwrap().unwrap();
    assert_eq!(quote.amount_in().value, 29);
    assert_eq!(quote.amount_out().value, 960 * 29);
    assert_eq!(quote.timestamp(), 7);

    assert_eq!(fx.aggregator.authority().pending_triggers(), 0);
}

#[tokio::test]
async fn test_quotes_verify_against_aggregator_issuer() {
    let mut fx = Fixture::new();
    fx.add("a", fx.ramp(500, 1));
    fx.next_median().await;

    let issuer = fx.aggregator.quote_issuer(&fx.atom, &fx.usd).unwrap();
    let quote = fx
        .aggregator
        .quote_wanted(&fx.atom, &Amount::make(&fx.usd, 1001))
        .await
        .unwrap();
    assert_eq!(quote.amount_in().value, 3);
    assert!(issuer.verify(&quote).is_ok());

    let foreign = QuoteIssuer::new(Brand::new("quote"));
    assert!(foreign.verify(&quote).is_err());
}

#[tokio::test]
async fn test_stalled_oracle_does_not_hold_back_others() {
    let mut fx = Fixture::new();
    fx.add("good", fx.ramp(1000, 10));
    fx.add(
        "stall",
        Arc::new(StallingOracle {
            first: 2000,
            queries: AtomicU64::new(0),
        }),
    );
    assert_eq!(fx.next_median().await, 1500);

    // The stalled oracle keeps its last sample while the other moves on.
    for step in 1..=6 {
        assert_eq!(fx.tick().await, 1500 + 5 * step);
    }
    assert_eq!(fx.aggregator.last_sample("good"), Some(1060));
    assert_eq!(fx.aggregator.last_sample("stall"), Some(2000));
    assert_eq!(fx.aggregator.pending_queries("good"), 0);
    assert!(fx.aggregator.pending_queries("stall") <= 4);

    fx.aggregator.drop_oracle("stall").unwrap();
    assert_eq!(fx.next_median().await, 1060);
    assert_eq!(fx.aggregator.pending_queries("stall"), 0);
}

#[tokio::test]
async fn test_failing_oracle_drops_out_of_median() {
    let mut fx = Fixture::new();
    let flaky = SwitchOracle::new(2000);
    fx.add("a", fx.ramp(1000, 10));
    fx.add("b", flaky.clone());
    assert_eq!(fx.next_median().await, 1500);

    flaky.set_failing(true);
    assert_eq!(fx.tick().await, 1010);
    assert_eq!(fx.aggregator.last_sample("b"), None);
    assert_eq!(fx.tick().await, 1020);

    flaky.set_failing(false);
    assert_eq!(fx.tick().await, 1515);
    assert_eq!(fx.aggregator.oracle_count(), 2);
}

#[tokio::test]
async fn test_late_reply_does_not_overwrite_newer_tick() {
    let mut fx = Fixture::new();
    let slow = Arc::new(HeldOracle::default());
    fx.add("slow", slow.clone());
    settle().await;
    slow.release(0, 1000);
    assert_eq!(fx.next_median().await, 1000);

    fx.timer.tick();
    settle().await;
    fx.timer.tick();
    settle().await;
    assert_eq!(slow.issued(), 3);

    // Tick 2 answers first.
    slow.release(2, 1200);
    assert_eq!(fx.next_median().await, 1200);

    // Tick 1 answers late and is dropped.
    slow.release(1, 1100);
    settle().await;
    assert_eq!(fx.aggregator.last_sample("slow"), Some(1200));
    let latest = fx.quotes.latest().unwrap();
    assert_eq!(latest.value.amount_out().value, 1200);
    assert_eq!(latest.value.timestamp(), 2);
}
