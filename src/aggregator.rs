//! Median aggregation over independently operated oracles.
//!
//! Polled oracles are queried once when added and then on every tick of a
//! shared repeater. Pushed oracles report through their [`OracleAdmin`].
//! Each query runs on its own task, so a slow oracle only delays its own
//! sample. Every applied result is folded into the median of the valid
//! samples and fed to the aggregator's [`QuoteAuthority`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use quote_oracle_core::{make_repeater, TimerService};
use quote_oracle_types::{Amount, Brand, NatValue, PriceQuote, RelativeTime, Timestamp};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::authority::{QuoteAuthority, RateSample};
use crate::error::{AggregatorError, OracleError};
use crate::issuer::QuoteIssuer;
use crate::math::median;
use crate::oracle::{parse_sample, Oracle, ReplyObserver};

/// Queries kept outstanding per oracle. Issuing another aborts the oldest.
const MAX_PENDING_QUERIES: usize = 4;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Brand quoted in.
    pub brand_in: Brand,
    /// Brand quoted out.
    pub brand_out: Brand,
    /// Samples are prices of this much of `brand_in`.
    pub unit_amount_in: NatValue,
    /// Seconds between polls.
    pub poll_interval: RelativeTime,
}

impl AggregatorConfig {
    fn validate(&self) -> Result<(), AggregatorError> {
        if self.unit_amount_in == 0 {
            return Err(AggregatorError::InvalidConfig(
                "unit_amount_in must be positive".to_string(),
            ));
        }
        if self.poll_interval == 0 {
            return Err(AggregatorError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if self.brand_in == self.brand_out {
            return Err(AggregatorError::InvalidConfig(format!(
                "brand_in and brand_out are both {}",
                self.brand_in
            )));
        }
        Ok(())
    }
}

/// How an oracle's samples reach the aggregator.
#[derive(Clone)]
pub enum OracleSource {
    /// Queried on add and on every poll tick.
    Polled {
        oracle: Arc<dyn Oracle>,
        /// Passed unchanged to every query.
        query: Value,
        /// Fee offered with every query.
        fee: Option<Amount>,
    },
    /// Reports on its own through [`OracleAdmin`].
    Pushed,
}

impl OracleSource {
    /// A polled source that offers no fee.
    pub fn polled(oracle: Arc<dyn Oracle>, query: Value) -> Self {
        OracleSource::Polled {
            oracle,
            query,
            fee: None,
        }
    }

    fn is_polled(&self) -> bool {
        matches!(self, OracleSource::Polled { .. })
    }
}

struct OracleRecord {
    generation: u64,
    source: OracleSource,
    last_sample: Option<NatValue>,
    /// Tick that produced `last_sample`.
    last_wake: Timestamp,
    /// Outstanding queries, oldest first.
    queries: VecDeque<JoinHandle<()>>,
}

impl OracleRecord {
    fn pending_queries(&self) -> usize {
        self.queries.iter().filter(|query| !query.is_finished()).count()
    }

    fn abort_queries(&mut self) {
        for query in self.queries.drain(..) {
            query.abort();
        }
    }
}

#[derive(Default)]
struct State {
    oracles: BTreeMap<String, OracleRecord>,
    next_generation: u64,
    last_published: Option<Timestamp>,
    poller: Option<JoinHandle<()>>,
}

struct Inner {
    config: AggregatorConfig,
    authority: QuoteAuthority,
    state: Mutex<State>,
}

/// Publishes the median of its oracles' latest valid samples.
pub struct MedianAggregator {
    inner: Arc<Inner>,
}

impl AsRef<QuoteAuthority> for MedianAggregator {
    fn as_ref(&self) -> &QuoteAuthority {
        &self.inner.authority
    }
}

impl Drop for MedianAggregator {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        for record in state.oracles.values_mut() {
            record.abort_queries();
        }
    }
}

impl MedianAggregator {
    /// An aggregator with no oracles. Nothing is published until the first
    /// valid sample arrives.
    pub fn new(
        config: AggregatorConfig,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> Result<Self, AggregatorError> {
        config.validate()?;
        let authority = QuoteAuthority::new(
            config.brand_in.clone(),
            config.brand_out.clone(),
            timer,
            issuer,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                authority,
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// The authority the medians are published through.
    pub fn authority(&self) -> &QuoteAuthority {
        &self.inner.authority
    }

    /// Configuration the aggregator was built with.
    pub fn config(&self) -> &AggregatorConfig {
        &self.inner.config
    }

    /// Registered oracle ids, in order.
    pub fn oracle_ids(&self) -> Vec<String> {
        self.inner.state.lock().oracles.keys().cloned().collect()
    }

    /// Number of registered oracles, valid sample or not.
    pub fn oracle_count(&self) -> usize {
        self.inner.state.lock().oracles.len()
    }

    /// Queries issued to `oracle_id` that have not answered yet.
    pub fn pending_queries(&self, oracle_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .oracles
            .get(oracle_id)
            .map_or(0, OracleRecord::pending_queries)
    }

    /// Last valid sample recorded for `oracle_id`.
    pub fn last_sample(&self, oracle_id: &str) -> Option<NatValue> {
        self.inner
            .state
            .lock()
            .oracles
            .get(oracle_id)
            .and_then(|record| record.last_sample)
    }

    /// Register an oracle. A polled oracle gets its first query right away
    /// and joins the poll rotation; its sample counts once the reply lands.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_oracle(
        &self,
        oracle_id: impl Into<String>,
        source: OracleSource,
    ) -> Result<OracleAdmin, AggregatorError> {
        let oracle_id = oracle_id.into();
        let now = self.inner.now();

        let generation = {
            let mut state = self.inner.state.lock();
            if state.oracles.contains_key(&oracle_id) {
                return Err(AggregatorError::DuplicateOracle(oracle_id));
            }
            let generation = state.next_generation;
            state.next_generation += 1;

            if source.is_polled() && state.poller.is_none() {
                let ticks = make_repeater(
                    Arc::clone(self.inner.authority.timer()),
                    self.inner.config.poll_interval,
                    self.inner.config.poll_interval,
                )?;
                let mut ticks = ticks.ticks();
                let weak = Arc::downgrade(&self.inner);
                state.poller = Some(tokio::spawn(async move {
                    while let Some(tick) = ticks.next_tick().await {
                        match tick {
                            Ok(tick) => {
                                let Some(inner) = weak.upgrade() else { return };
                                inner.poll_oracles(tick);
                            }
                            Err(err) => {
                                warn!("Aggregator poller stopped: {}", err);
                                return;
                            }
                        }
                    }
                }));
            }

            let mut record = OracleRecord {
                generation,
                source,
                last_sample: None,
                last_wake: now,
                queries: VecDeque::new(),
            };
            self.inner.spawn_query(&oracle_id, &mut record, now);
            state.oracles.insert(oracle_id.clone(), record);
            generation
        };
        info!("Oracle {} added (generation {})", oracle_id, generation);

        Ok(OracleAdmin {
            oracle_id,
            generation,
            aggregator: Arc::downgrade(&self.inner),
        })
    }

    /// Remove an oracle and republish from the ones left.
    pub fn drop_oracle(&self, oracle_id: &str) -> Result<(), AggregatorError> {
        self.inner.remove(oracle_id, None)
    }
}

impl Inner {
    fn now(&self) -> Timestamp {
        self.authority.timer().current_timestamp()
    }

    fn remove(&self, oracle_id: &str, generation: Option<u64>) -> Result<(), AggregatorError> {
        {
            let mut state = self.state.lock();
            match state.oracles.get(oracle_id) {
                Some(record) if generation.map_or(true, |g| g == record.generation) => {}
                _ => return Err(AggregatorError::UnknownOracle(oracle_id.to_string())),
            }
            if let Some(mut record) = state.oracles.remove(oracle_id) {
                record.abort_queries();
            }
            if !state.oracles.values().any(|r| r.source.is_polled()) {
                if let Some(poller) = state.poller.take() {
                    poller.abort();
                }
            }
        }
        info!("Oracle {} dropped", oracle_id);
        self.update_quote(self.now());
        Ok(())
    }

    /// Query every polled oracle for `tick`.
    fn poll_oracles(self: &Arc<Self>, tick: Timestamp) {
        let mut state = self.state.lock();
        for (oracle_id, record) in state.oracles.iter_mut() {
            self.spawn_query(oracle_id, record, tick);
        }
    }

    /// Query a polled oracle on its own task. The reply is applied and
    /// folded into the median as soon as it arrives.
    fn spawn_query(self: &Arc<Self>, oracle_id: &str, record: &mut OracleRecord, tick: Timestamp) {
        let OracleSource::Polled { oracle, query, fee } = &record.source else {
            return;
        };
        let (oracle, query, fee) = (Arc::clone(oracle), query.clone(), fee.clone());

        record.queries.retain(|handle| !handle.is_finished());
        while record.queries.len() >= MAX_PENDING_QUERIES {
            if let Some(oldest) = record.queries.pop_front() {
                warn!("Oracle {} has {} queries outstanding, abandoning the oldest", oracle_id, MAX_PENDING_QUERIES);
                oldest.abort();
            }
        }

        let oracle_id = oracle_id.to_string();
        let generation = record.generation;
        let aggregator = Arc::downgrade(self);
        record.queries.push_back(tokio::spawn(async move {
            let result = oracle.on_query(&query, fee.as_ref()).await;
            // Dropped while the query was out.
            let Some(inner) = aggregator.upgrade() else {
                return;
            };
            if inner.apply_result(&oracle_id, generation, tick, result.map(|reply| reply.reply)) {
                inner.update_quote(tick);
            }
        }));
    }

    /// Record a query outcome for the oracle. Results from a superseded
    /// registration or an older tick than the one already applied are
    /// ignored. Errors and unusable replies count as an invalid sample.
    fn apply_result(
        &self,
        oracle_id: &str,
        generation: u64,
        tick: Timestamp,
        result: Result<Value, OracleError>,
    ) -> bool {
        let sample = match &result {
            Ok(reply) => {
                let sample = parse_sample(reply);
                if sample.is_none() {
                    warn!("Unusable reply from oracle {}: {}", oracle_id, reply);
                }
                sample
            }
            Err(err) => {
                warn!("Oracle {} query failed: {}", oracle_id, err);
                None
            }
        };

        let mut state = self.state.lock();
        let Some(record) = state.oracles.get_mut(oracle_id) else {
            return false;
        };
        if record.generation != generation || tick < record.last_wake {
            debug!(
                "Discarding stale result from oracle {} (tick {}, last applied {})",
                oracle_id, tick, record.last_wake
            );
            return false;
        }
        record.last_sample = sample;
        record.last_wake = tick;
        true
    }

    /// Fold the current samples into a new rate. Triggers always see it;
    /// it is published only if `timestamp` does not go backwards.
    fn update_quote(&self, timestamp: Timestamp) -> Option<PriceQuote> {
        let mut state = self.state.lock();
        let median = median(state.oracles.values().filter_map(|r| r.last_sample))?;
        let publish = state.last_published.map_or(true, |last| timestamp >= last);
        let sample = RateSample {
            value_in: self.config.unit_amount_in,
            value_out: median,
            timestamp,
        };
        match self.authority.ingest(sample, publish) {
            Ok(quote) => {
                if publish {
                    state.last_published = Some(timestamp);
                    debug!("Published median {} at {} from {} oracles", median, timestamp, state.oracles.len());
                }
                quote
            }
            Err(err) => {
                warn!("Failed to ingest median: {}", err);
                None
            }
        }
    }
}

/// Handle for one registered oracle. Pushed oracles report through it.
#[derive(Clone)]
pub struct OracleAdmin {
    oracle_id: String,
    generation: u64,
    aggregator: Weak<Inner>,
}

impl std::fmt::Debug for OracleAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleAdmin")
            .field("oracle_id", &self.oracle_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl OracleAdmin {
    /// Id the oracle was registered under.
    pub fn oracle_id(&self) -> &str {
        &self.oracle_id
    }

    /// Record a pushed result and republish.
    pub fn push_result(&self, reply: &Value) -> Result<(), AggregatorError> {
        self.push(Ok(reply.clone()))
    }

    /// Record a failed report as an invalid sample.
    pub fn push_error(&self, error: OracleError) -> Result<(), AggregatorError> {
        self.push(Err(error))
    }

    /// Remove this oracle from the aggregator.
    pub fn delete(&self) -> Result<(), AggregatorError> {
        let inner = self.aggregator.upgrade().ok_or(AggregatorError::Shutdown)?;
        inner.remove(&self.oracle_id, Some(self.generation))
    }

    fn push(&self, result: Result<Value, OracleError>) -> Result<(), AggregatorError> {
        let inner = self.aggregator.upgrade().ok_or(AggregatorError::Shutdown)?;
        let now = inner.now();
        if !inner.apply_result(&self.oracle_id, self.generation, now, result) {
            return Err(AggregatorError::UnknownOracle(self.oracle_id.clone()));
        }
        inner.update_quote(now);
        Ok(())
    }
}

impl ReplyObserver for OracleAdmin {
    fn on_reply(&self, reply: &Value) {
        if let Err(err) = self.push_result(reply) {
            debug!("Ignored pushed reply for oracle {}: {}", self.oracle_id, err);
        }
    }

    fn on_error(&self, error: &OracleError) {
        if let Err(err) = self.push_error(error.clone()) {
            debug!("Ignored pushed error for oracle {}: {}", self.oracle_id, err);
        }
    }
}
