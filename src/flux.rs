//! Round- and deviation-driven monitoring of a single oracle.
//!
//! Three stimuli cause a query: a new round on the shared round notifier, a
//! local poll tick, and an idle watcher that fires when nothing was
//! submitted for a while. At most one query is out at a time; stimuli that
//! arrive while it is pending share its result.

use std::sync::{Arc, Weak};

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use quote_oracle_core::{
    make_notifier_kit, make_repeater, Notifier, NotifierResult, Publisher, TimerService, Ticks,
};
use quote_oracle_types::{NatValue, RelativeTime, Submission, SubmissionReason, Timestamp};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::FluxError;
use crate::oracle::{parse_sample, Oracle};

#[derive(Debug, Clone)]
pub struct FluxConfig {
    /// Seconds between local polls.
    pub poll_interval: RelativeTime,
    /// Smallest absolute move worth submitting.
    pub absolute_threshold: NatValue,
    /// Smallest move worth submitting, as a fraction of the last submission.
    pub fractional_threshold: f64,
    /// Poll intervals without a submission before starting a round. Zero
    /// disables the idle watcher.
    pub idle_timer_ticks: u64,
    pub query: Value,
}

impl FluxConfig {
    pub fn validate(&self) -> Result<(), FluxError> {
        if self.poll_interval == 0 {
            return Err(FluxError::InvalidConfig(
                "poll_interval must be positive".to_string(),
            ));
        }
        if !self.fractional_threshold.is_finite() || self.fractional_threshold < 0.0 {
            return Err(FluxError::InvalidConfig(format!(
                "fractional_threshold must be a non-negative number, got {}",
                self.fractional_threshold
            )));
        }
        Ok(())
    }

    fn deviates(&self, last: Option<NatValue>, value: NatValue) -> bool {
        let Some(last) = last else {
            return true;
        };
        let diff = value.abs_diff(last);
        if diff < self.absolute_threshold {
            return false;
        }
        if last > 0 && (diff as f64) < self.fractional_threshold * last as f64 {
            return false;
        }
        true
    }
}

/// An externally started round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundStart {
    pub round_id: u64,
    pub started_at: Timestamp,
}

type QueryFuture = Shared<BoxFuture<'static, Result<NatValue, FluxError>>>;

#[derive(Default)]
struct State {
    round_id: u64,
    last_submission: Option<NatValue>,
    in_flight: Option<(u64, QueryFuture)>,
    next_query: u64,
    idle: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    oracle: Arc<dyn Oracle>,
    config: FluxConfig,
    timer: Arc<dyn TimerService>,
    publisher: Publisher<Submission>,
    state: Mutex<State>,
}

pub struct FluxMonitor {
    inner: Arc<Inner>,
    driver: JoinHandle<()>,
}

impl Drop for FluxMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FluxMonitor {
    /// Start monitoring `oracle`. Rounds from `rounds` always lead to a
    /// submission; polls only when the value moved past the thresholds.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        oracle: Arc<dyn Oracle>,
        rounds: Option<Notifier<RoundStart>>,
        config: FluxConfig,
        timer: Arc<dyn TimerService>,
    ) -> Result<Self, FluxError> {
        config.validate()?;
        let ticks = make_repeater(Arc::clone(&timer), config.poll_interval, config.poll_interval)?;
        let (publisher, _) = make_notifier_kit(None);
        let inner = Arc::new(Inner {
            oracle,
            config,
            timer,
            publisher,
            state: Mutex::new(State::default()),
        });
        let driver = tokio::spawn(drive(Arc::downgrade(&inner), rounds, ticks.ticks()));
        Ok(Self { inner, driver })
    }

    pub fn submissions(&self) -> Notifier<Submission> {
        self.inner.publisher.notifier()
    }

    pub fn current_round(&self) -> u64 {
        self.inner.state.lock().round_id
    }

    pub fn last_submission(&self) -> Option<NatValue> {
        self.inner.state.lock().last_submission
    }

    /// Stop all stimuli. Queries already out complete without effect.
    pub fn shutdown(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.take()
        };
        if let Some(idle) = idle {
            idle.abort();
        }
        self.driver.abort();
        if self.inner.publisher.finish_latest().is_err() {
            self.inner.publisher.fail("flux monitor shut down");
        }
        info!("Flux monitor shut down");
    }
}

async fn drive(inner: Weak<Inner>, rounds: Option<Notifier<RoundStart>>, mut ticks: Ticks) {
    let mut rounds = rounds.map(|rounds| Box::pin(rounds.updates()));
    loop {
        tokio::select! {
            biased;

            round = next_round(&mut rounds) => {
                match round {
                    Some(Ok(round)) => {
                        let Some(inner) = inner.upgrade() else { return };
                        tokio::spawn(inner.on_round(round));
                    }
                    Some(Err(err)) => {
                        warn!("Round notifier failed: {}", err);
                        rounds = None;
                    }
                    None => {
                        debug!("Round notifier finished");
                        rounds = None;
                    }
                }
            }

            tick = ticks.next_tick() => {
                match tick {
                    Some(Ok(tick)) => {
                        let Some(inner) = inner.upgrade() else { return };
                        tokio::spawn(inner.on_poll(tick));
                    }
                    Some(Err(err)) => {
                        warn!("Flux poll timer stopped: {}", err);
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

async fn next_round<S>(rounds: &mut Option<S>) -> Option<NotifierResult<RoundStart>>
where
    S: Stream<Item = NotifierResult<RoundStart>> + Unpin,
{
    match rounds {
        Some(rounds) => rounds.next().await,
        None => std::future::pending().await,
    }
}

impl Inner {
    async fn on_round(self: Arc<Self>, round: RoundStart) {
        {
            let mut state = self.state.lock();
            if state.closed || round.round_id <= state.round_id {
                debug!("Ignoring round {} (current {})", round.round_id, state.round_id);
                return;
            }
            state.round_id = round.round_id;
        }
        debug!("Round {} started", round.round_id);

        let value = match self.query_once().await {
            Ok(value) => value,
            Err(err) => {
                warn!("Round {} query failed: {}", round.round_id, err);
                // The idle watcher was armed for the previous round.
                let mut state = self.state.lock();
                if !state.closed && state.round_id == round.round_id {
                    self.schedule_idle(&mut state, round.round_id);
                }
                return;
            }
        };
        let mut state = self.state.lock();
        if state.closed || state.round_id != round.round_id {
            return;
        }
        self.submit(&mut state, round.round_id, value, SubmissionReason::Round);
    }

    async fn on_poll(self: Arc<Self>, tick: Timestamp) {
        let value = match self.query_once().await {
            Ok(value) => value,
            Err(err) => {
                warn!("Poll query at {} failed: {}", tick, err);
                return;
            }
        };
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if !self.config.deviates(state.last_submission, value) {
            debug!("Poll at {}: {} within threshold of {:?}", tick, value, state.last_submission);
            return;
        }
        let round_id = state.round_id + 1;
        self.submit(&mut state, round_id, value, SubmissionReason::Deviation);
    }

    async fn on_idle(self: Arc<Self>, round_id: u64) {
        {
            let mut state = self.state.lock();
            if state.closed || state.round_id != round_id {
                return;
            }
            state.idle = None;
        }
        debug!("Idle since round {}, starting a new round", round_id);

        let result = self.query_once().await;
        let mut state = self.state.lock();
        // A round may have started while waiting.
        if state.closed || state.round_id != round_id {
            return;
        }
        match result {
            Ok(value) => self.submit(&mut state, round_id + 1, value, SubmissionReason::Idle),
            Err(err) => {
                warn!("Idle query after round {} failed: {}", round_id, err);
                self.schedule_idle(&mut state, round_id);
            }
        }
    }

    /// Join the outstanding query, or start one.
    async fn query_once(&self) -> Result<NatValue, FluxError> {
        let (seq, query) = {
            let mut state = self.state.lock();
            let pending = state
                .in_flight
                .as_ref()
                .map(|(seq, query)| (*seq, query.clone()));
            match pending {
                Some(pending) => pending,
                None => {
                    let seq = state.next_query;
                    state.next_query += 1;
                    let oracle = Arc::clone(&self.oracle);
                    let query = self.config.query.clone();
                    let future = async move {
                        let reply = oracle.on_query(&query, None).await?;
                        parse_sample(&reply.reply)
                            .ok_or_else(|| FluxError::InvalidReply(reply.reply.to_string()))
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some((seq, future.clone()));
                    (seq, future)
                }
            }
        };

        let result = query.await;
        let mut state = self.state.lock();
        if matches!(&state.in_flight, Some((current, _)) if *current == seq) {
            state.in_flight = None;
        }
        result
    }

    fn submit(self: &Arc<Self>, state: &mut State, round_id: u64, value: NatValue, reason: SubmissionReason) {
        state.round_id = round_id;
        state.last_submission = Some(value);
        let submission = Submission {
            round_id,
            value,
            timestamp: self.timer.current_timestamp(),
            reason,
        };
        if let Err(err) = self.publisher.update_state(submission) {
            warn!("Dropped submission: {}", err);
            return;
        }
        info!("Submitted {} for round {} ({:?})", value, round_id, reason);
        self.schedule_idle(state, round_id);
    }

    fn schedule_idle(self: &Arc<Self>, state: &mut State, round_id: u64) {
        if let Some(previous) = state.idle.take() {
            previous.abort();
        }
        if self.config.idle_timer_ticks == 0 {
            return;
        }
        let period = self
            .config
            .idle_timer_ticks
            .saturating_mul(self.config.poll_interval);
        let deadline = self.timer.current_timestamp().saturating_add(period);
        let timer = Arc::clone(&self.timer);
        let weak = Arc::downgrade(self);
        state.idle = Some(tokio::spawn(async move {
            if timer.wake_at(deadline).await.is_err() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_idle(round_id).await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;
    use quote_oracle_core::ManualTimer;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(absolute_threshold: NatValue, fractional_threshold: f64, idle_timer_ticks: u64) -> FluxConfig {
        FluxConfig {
            poll_interval: 1,
            absolute_threshold,
            fractional_threshold,
            idle_timer_ticks,
            query: json!({"jobId": "flux"}),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_deviation_thresholds() {
        let cfg = config(5, 0.1, 0);
        assert!(cfg.deviates(None, 1));
        assert!(!cfg.deviates(Some(1000), 1099));
        assert!(cfg.deviates(Some(1000), 1100));
        assert!(cfg.deviates(Some(1000), 900));
        // Absolute threshold applies on its own when the last value was zero.
        assert!(!cfg.deviates(Some(0), 4));
        assert!(cfg.deviates(Some(0), 5));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(config(0, -0.1, 0).validate().is_err());
        assert!(config(0, f64::NAN, 0).validate().is_err());
        let mut zero_poll = config(0, 0.1, 0);
        zero_poll.poll_interval = 0;
        assert!(zero_poll.validate().is_err());
    }

    #[tokio::test]
    async fn test_round_always_submits_poll_only_on_deviation() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let oracle = Arc::new(ScriptedOracle::new(1000, 0));
        let (rounds, round_notifier) = make_notifier_kit(None);
        let monitor =
            FluxMonitor::spawn(oracle.clone(), Some(round_notifier), config(0, 0.1, 0), timer.clone())
                .unwrap();
        let submissions = monitor.submissions();

        timer.tick();
        let first = submissions.get_update_since(None).await.unwrap();
        assert_eq!(first.value.value, 1000);
        assert_eq!(first.value.round_id, 1);
        assert_eq!(first.value.reason, SubmissionReason::Deviation);

        // 5% move: polled but not submitted.
        oracle.set(1050);
        timer.tick();
        settle().await;
        assert_eq!(oracle.queries(), 2);
        assert_eq!(monitor.last_submission(), Some(1000));

        // A round submits the same value regardless.
        rounds.update_state(RoundStart { round_id: 5, started_at: 2 }).unwrap();
        let second = submissions.get_update_since(first.update_count).await.unwrap();
        assert_eq!(second.value.value, 1050);
        assert_eq!(second.value.round_id, 5);
        assert_eq!(second.value.reason, SubmissionReason::Round);

        oracle.set(1200);
        timer.tick();
        let third = submissions.get_update_since(second.update_count).await.unwrap();
        assert_eq!(third.value.value, 1200);
        assert_eq!(third.value.round_id, 6);

        // Rounds at or below the tracked one are ignored.
        let queries = oracle.queries();
        rounds.update_state(RoundStart { round_id: 3, started_at: 3 }).unwrap();
        settle().await;
        assert_eq!(oracle.queries(), queries);
        assert_eq!(monitor.current_round(), 6);
    }

    #[tokio::test]
    async fn test_idle_watcher_starts_round() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let oracle = Arc::new(ScriptedOracle::new(1000, 0));
        let monitor =
            FluxMonitor::spawn(oracle.clone(), None, config(1_000_000, 0.0, 2), timer.clone()).unwrap();
        let submissions = monitor.submissions();

        timer.tick();
        let first = submissions.get_update_since(None).await.unwrap();
        assert_eq!(first.value.round_id, 1);

        timer.tick();
        settle().await;
        assert_eq!(monitor.current_round(), 1);

        timer.tick();
        let idle = submissions.get_update_since(first.update_count).await.unwrap();
        assert_eq!(idle.value.round_id, 2);
        assert_eq!(idle.value.reason, SubmissionReason::Idle);
        assert_eq!(idle.value.timestamp, 3);
    }

    #[tokio::test]
    async fn test_idle_watcher_survives_failed_round() {
        struct FlakyOracle {
            failing: AtomicBool,
            inner: ScriptedOracle,
        }

        #[async_trait::async_trait]
        impl Oracle for FlakyOracle {
            async fn on_query(
                &self,
                query: &Value,
                fee: Option<&quote_oracle_types::Amount>,
            ) -> Result<crate::oracle::OracleReply, crate::error::OracleError> {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(crate::error::OracleError::Unavailable);
                }
                self.inner.on_query(query, fee).await
            }
        }

        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let oracle = Arc::new(FlakyOracle {
            failing: AtomicBool::new(false),
            inner: ScriptedOracle::new(1000, 0),
        });
        let (rounds, round_notifier) = make_notifier_kit(None);
        let monitor = FluxMonitor::spawn(
            oracle.clone(),
            Some(round_notifier),
            config(1_000_000, 0.0, 2),
            timer.clone(),
        )
        .unwrap();
        let submissions = monitor.submissions();

        timer.tick();
        let first = submissions.get_update_since(None).await.unwrap();
        assert_eq!(first.value.round_id, 1);

        oracle.failing.store(true, Ordering::SeqCst);
        rounds.update_state(RoundStart { round_id: 2, started_at: 1 }).unwrap();
        settle().await;
        assert_eq!(monitor.current_round(), 2);
        assert_eq!(monitor.last_submission(), Some(1000));

        oracle.failing.store(false, Ordering::SeqCst);
        timer.tick();
        settle().await;
        timer.tick();
        let idle = submissions.get_update_since(first.update_count).await.unwrap();
        assert_eq!(idle.value.round_id, 3);
        assert_eq!(idle.value.reason, SubmissionReason::Idle);
        assert_eq!(idle.value.timestamp, 3);
    }

    #[tokio::test]
    async fn test_concurrent_stimuli_share_one_query() {
        struct GatedOracle {
            gate: tokio::sync::watch::Receiver<bool>,
            inner: ScriptedOracle,
        }

        #[async_trait::async_trait]
        impl Oracle for GatedOracle {
            async fn on_query(
                &self,
                query: &Value,
                fee: Option<&quote_oracle_types::Amount>,
            ) -> Result<crate::oracle::OracleReply, crate::error::OracleError> {
                let reply = self.inner.on_query(query, fee).await;
                let mut gate = self.gate.clone();
                let _ = gate.wait_for(|open| *open).await;
                reply
            }
        }

        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let (open, gate) = tokio::sync::watch::channel(false);
        let oracle = Arc::new(GatedOracle {
            gate,
            inner: ScriptedOracle::new(700, 1),
        });
        let monitor = FluxMonitor::spawn(oracle.clone(), None, config(0, 0.0, 0), timer).unwrap();

        let a = tokio::spawn(Arc::clone(&monitor.inner).query_once_owned());
        let b = tokio::spawn(Arc::clone(&monitor.inner).query_once_owned());
        settle().await;
        assert_eq!(oracle.inner.queries(), 1);

        open.send(true).unwrap();
        assert_eq!(a.await.unwrap(), Ok(700));
        assert_eq!(b.await.unwrap(), Ok(700));

        // The next query is a fresh one.
        assert_eq!(monitor.inner.query_once().await, Ok(701));
    }

    #[tokio::test]
    async fn test_shutdown_finishes_submissions() {
        let timer = Arc::new(ManualTimer::new("manual", 0, 1));
        let oracle = Arc::new(ScriptedOracle::new(10, 0));
        let monitor = FluxMonitor::spawn(oracle, None, config(0, 0.0, 0), timer.clone()).unwrap();
        let submissions = monitor.submissions();
        timer.tick();
        let first = submissions.get_update_since(None).await.unwrap();

        monitor.shutdown();
        let last = submissions.get_update_since(first.update_count).await.unwrap();
        assert!(last.is_final());
        assert_eq!(last.value.value, 10);
    }

    impl Inner {
        async fn query_once_owned(self: Arc<Self>) -> Result<NatValue, FluxError> {
            self.query_once().await
        }
    }
}
