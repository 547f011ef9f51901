//! Shared price authority machinery.
//!
//! A [`QuoteAuthority`] holds the latest rate sample for one brand pair,
//! answers point queries against it, and keeps the pending trigger list.
//! Every variant feeds samples into one of these and differs only in where
//! the samples come from.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_util::StreamExt;
use parking_lot::Mutex;
use quote_oracle_core::{make_notifier_kit, Notifier, Publisher, TimerService};
use quote_oracle_types::{
    Amount, Brand, Comparator, NatValue, PriceDescription, PriceQuote, Timestamp,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PriceAuthorityError, PriceAuthorityResult};
use crate::issuer::QuoteIssuer;
use crate::math::{ceil_scale, floor_scale};

/// `value_in` of the input brand buys `value_out` of the output brand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSample {
    pub value_in: NatValue,
    pub value_out: NatValue,
    pub timestamp: Timestamp,
}

impl RateSample {
    fn out_for(&self, amount_in: NatValue) -> PriceAuthorityResult<NatValue> {
        floor_scale(amount_in, self.value_out, self.value_in)
    }

    fn in_for(&self, amount_out: NatValue) -> PriceAuthorityResult<NatValue> {
        ceil_scale(amount_out, self.value_in, self.value_out)
    }
}

type Resolver = oneshot::Sender<PriceAuthorityResult<PriceQuote>>;

struct Trigger {
    id: u64,
    comparator: Comparator,
    amount_in: NatValue,
    limit: NatValue,
    resolver: Resolver,
}

#[derive(Debug, Clone)]
enum Closed {
    Finished,
    Failed(String),
}

impl Closed {
    fn error(&self) -> PriceAuthorityError {
        match self {
            Closed::Finished => PriceAuthorityError::SourceFinished,
            Closed::Failed(reason) => PriceAuthorityError::SourceFailed(reason.clone()),
        }
    }
}

#[derive(Default)]
struct State {
    latest: Option<RateSample>,
    closed: Option<Closed>,
    triggers: Vec<Trigger>,
    next_trigger: u64,
}

struct Inner {
    brand_in: Brand,
    brand_out: Brand,
    timer: Arc<dyn TimerService>,
    issuer: Arc<QuoteIssuer>,
    publisher: Publisher<PriceQuote>,
    notifier: Notifier<PriceQuote>,
    state: Mutex<State>,
}

/// Latest-sample state, queries and triggers for one brand pair.
#[derive(Clone)]
pub struct QuoteAuthority {
    inner: Arc<Inner>,
}

impl AsRef<QuoteAuthority> for QuoteAuthority {
    fn as_ref(&self) -> &QuoteAuthority {
        self
    }
}

impl QuoteAuthority {
    /// An authority for `brand_in`/`brand_out` with no quote yet.
    pub fn new(
        brand_in: Brand,
        brand_out: Brand,
        timer: Arc<dyn TimerService>,
        issuer: Arc<QuoteIssuer>,
    ) -> Self {
        let (publisher, notifier) = make_notifier_kit(None);
        Self {
            inner: Arc::new(Inner {
                brand_in,
                brand_out,
                timer,
                issuer,
                publisher,
                notifier,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Brand quoted in.
    pub fn brand_in(&self) -> &Brand {
        &self.inner.brand_in
    }

    /// Brand quoted out.
    pub fn brand_out(&self) -> &Brand {
        &self.inner.brand_out
    }

    /// Timer that stamps quotes and drives `quote_at_time`.
    pub fn timer(&self) -> &Arc<dyn TimerService> {
        &self.inner.timer
    }

    /// Issuer that mints and verifies this authority's quotes.
    pub fn issuer(&self) -> &Arc<QuoteIssuer> {
        &self.inner.issuer
    }

    /// Stream of published quotes for the unit sample.
    pub fn notifier(&self) -> Notifier<PriceQuote> {
        self.inner.notifier.clone()
    }

    /// Most recent sample ingested, published or not.
    pub fn latest_sample(&self) -> Option<RateSample> {
        self.inner.state.lock().latest
    }

    /// Triggers still waiting to fire.
    pub fn pending_triggers(&self) -> usize {
        self.inner.state.lock().triggers.len()
    }

    /// True once finished or failed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    /// Fail unless `brand_in`/`brand_out` is this authority's pair.
    pub fn check_pair(&self, brand_in: &Brand, brand_out: &Brand) -> PriceAuthorityResult<()> {
        if brand_in == self.brand_in() && brand_out == self.brand_out() {
            Ok(())
        } else {
            Err(PriceAuthorityError::UnsupportedPair {
                brand_in: brand_in.clone(),
                brand_out: brand_out.clone(),
            })
        }
    }

    /// Record a new sample and fire every trigger it satisfies, in
    /// registration order. With `publish`, also mint and publish the unit
    /// quote for the sample. Returns the published quote.
    pub fn ingest(
        &self,
        sample: RateSample,
        publish: bool,
    ) -> PriceAuthorityResult<Option<PriceQuote>> {
        if sample.value_in == 0 || sample.value_out == 0 {
            return Err(PriceAuthorityError::ZeroPrice);
        }

        let fired = {
            let mut state = self.inner.state.lock();
            if let Some(closed) = &state.closed {
                return Err(closed.error());
            }
            state.latest = Some(sample);

            let mut fired = Vec::new();
            let mut kept = Vec::with_capacity(state.triggers.len());
            for trigger in state.triggers.drain(..) {
                if trigger.resolver.is_closed() {
                    continue;
                }
                match sample.out_for(trigger.amount_in) {
                    Ok(out) if trigger.comparator.holds(out, trigger.limit) => {
                        fired.push((trigger, out));
                    }
                    Ok(_) => kept.push(trigger),
                    Err(err) => {
                        let _ = trigger.resolver.send(Err(err));
                    }
                }
            }
            state.triggers = kept;
            fired
        };

        for (trigger, out) in fired {
            debug!(
                "Trigger {} fired: {} in {} {} out",
                trigger.id, trigger.amount_in, trigger.comparator, out
            );
            let quote = self.mint(trigger.amount_in, out, sample.timestamp);
            let _ = trigger.resolver.send(quote);
        }

        if !publish {
            return Ok(None);
        }
        let quote = self.mint(sample.value_in, sample.value_out, sample.timestamp)?;
        self.inner.publisher.update_state(quote.clone())?;
        Ok(Some(quote))
    }

    /// Reject every pending and future request. Quotes already handed out
    /// stay valid.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.close(Closed::Failed(reason.clone())) {
            warn!(
                "Price authority {}/{} failed: {}",
                self.brand_in(),
                self.brand_out(),
                reason
            );
            self.inner.publisher.fail(reason);
        }
    }

    /// Stop taking samples. The last quote stays queryable; triggers reject.
    pub fn finish(&self) {
        if !self.close(Closed::Finished) {
            return;
        }
        debug!("Price authority {}/{} finished", self.brand_in(), self.brand_out());
        if self.inner.publisher.finish_latest().is_err() {
            self.inner.publisher.fail("finished before the first quote");
        }
    }

    fn close(&self, closed: Closed) -> bool {
        let triggers = {
            let mut state = self.inner.state.lock();
            if state.closed.is_some() {
                return false;
            }
            state.closed = Some(closed.clone());
            std::mem::take(&mut state.triggers)
        };
        for trigger in triggers {
            let _ = trigger.resolver.send(Err(closed.error()));
        }
        true
    }

    fn mint(
        &self,
        amount_in: NatValue,
        amount_out: NatValue,
        timestamp: Timestamp,
    ) -> PriceAuthorityResult<PriceQuote> {
        let description = PriceDescription {
            amount_in: Amount::make(self.brand_in(), amount_in),
            amount_out: Amount::make(self.brand_out(), amount_out),
            timer: self.inner.timer.label().to_string(),
            timestamp,
        };
        Ok(self.inner.issuer.mint(description)?)
    }

    /// The latest sample if there is one. A failed authority has none to
    /// offer; a finished one keeps its last.
    fn current_sample(&self) -> PriceAuthorityResult<Option<RateSample>> {
        let state = self.inner.state.lock();
        match (&state.closed, state.latest) {
            (Some(Closed::Failed(reason)), _) => {
                Err(PriceAuthorityError::SourceFailed(reason.clone()))
            }
            (_, Some(sample)) => Ok(Some(sample)),
            (Some(Closed::Finished), None) => Err(PriceAuthorityError::SourceFinished),
            (None, None) => Ok(None),
        }
    }

    /// Wait until a first sample exists.
    pub async fn base_sample(&self) -> PriceAuthorityResult<RateSample> {
        let mut last_seen = None;
        loop {
            if let Some(sample) = self.current_sample()? {
                return Ok(sample);
            }
            let record = self.inner.notifier.get_update_since(last_seen).await?;
            if record.is_final() {
                return self
                    .current_sample()?
                    .ok_or(PriceAuthorityError::SourceFinished);
            }
            last_seen = record.update_count;
        }
    }

    pub async fn quote_given(
        &self,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<PriceQuote> {
        amount_in.coerce(self.brand_in())?;
        self.check_pair(&amount_in.brand, brand_out)?;
        let sample = self.base_sample().await?;
        let out = sample.out_for(amount_in.value)?;
        self.mint(amount_in.value, out, sample.timestamp)
    }

    pub async fn quote_wanted(
        &self,
        brand_in: &Brand,
        amount_out: &Amount,
    ) -> PriceAuthorityResult<PriceQuote> {
        amount_out.coerce(self.brand_out())?;
        self.check_pair(brand_in, &amount_out.brand)?;
        let sample = self.base_sample().await?;
        let amount_in = sample.in_for(amount_out.value)?;
        self.mint(amount_in, amount_out.value, sample.timestamp)
    }

    /// Quote from whatever sample is latest once the timer reaches
    /// `deadline`, stamped with the wake-up time.
    pub async fn quote_at_time(
        &self,
        deadline: Timestamp,
        amount_in: &Amount,
        brand_out: &Brand,
    ) -> PriceAuthorityResult<PriceQuote> {
        amount_in.coerce(self.brand_in())?;
        self.check_pair(&amount_in.brand, brand_out)?;
        let woke = self.inner.timer.wake_at(deadline).await?;
        let sample = self.base_sample().await?;
        let out = sample.out_for(amount_in.value)?;
        self.mint(amount_in.value, out, woke)
    }

    /// Resolve the first time `amount_in` would buy an amount that
    /// satisfies `comparator` against `amount_out_limit`. Fires at once when
    /// the latest sample already does.
    pub fn quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<PendingQuote> {
        let (_, pending) = self.register(comparator, amount_in, amount_out_limit)?;
        Ok(pending)
    }

    /// Like [`QuoteAuthority::quote_when`], but the level can be moved or the
    /// request cancelled while it waits.
    pub fn mutable_quote_when(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<MutableQuote> {
        let (id, pending) = self.register(comparator, amount_in, amount_out_limit)?;
        Ok(MutableQuote {
            id,
            pending,
            authority: Arc::downgrade(&self.inner),
        })
    }

    fn register(
        &self,
        comparator: Comparator,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<(u64, PendingQuote)> {
        amount_in.coerce(self.brand_in())?;
        amount_out_limit.coerce(self.brand_out())?;

        let (resolver, rx) = oneshot::channel();
        let pending = PendingQuote { rx };
        let mut state = self.inner.state.lock();
        if let Some(closed) = &state.closed {
            return Err(closed.error());
        }
        let id = state.next_trigger;
        state.next_trigger += 1;

        if let Some(sample) = state.latest {
            let out = sample.out_for(amount_in.value)?;
            if comparator.holds(out, amount_out_limit.value) {
                drop(state);
                let quote = self.mint(amount_in.value, out, sample.timestamp);
                let _ = resolver.send(quote);
                return Ok((id, pending));
            }
        }

        state.triggers.push(Trigger {
            id,
            comparator,
            amount_in: amount_in.value,
            limit: amount_out_limit.value,
            resolver,
        });
        Ok((id, pending))
    }

    /// Feed samples derived from `source` until it ends. A failed source
    /// fails the authority; a finished one finishes it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn follow<T, F>(&self, source: Notifier<T>, to_sample: F) -> JoinHandle<()>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> PriceAuthorityResult<Option<RateSample>> + Send + 'static,
    {
        let authority = self.clone();
        let updates = source.updates();
        tokio::spawn(async move {
            futures_util::pin_mut!(updates);
            while let Some(update) = updates.next().await {
                let value = match update {
                    Ok(value) => value,
                    Err(err) => {
                        authority.fail(err.to_string());
                        return;
                    }
                };
                match to_sample(value) {
                    Ok(Some(sample)) => {
                        if let Err(err) = authority.ingest(sample, true) {
                            if authority.is_closed() {
                                return;
                            }
                            warn!("Dropped quote source sample: {}", err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        authority.fail(err.to_string());
                        return;
                    }
                }
            }
            authority.finish();
        })
    }
}

/// A triggered quote request. Resolves once; dropping it withdraws the
/// request.
pub struct PendingQuote {
    rx: oneshot::Receiver<PriceAuthorityResult<PriceQuote>>,
}

impl Future for PendingQuote {
    type Output = PriceAuthorityResult<PriceQuote>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PriceAuthorityError::Cancelled)))
    }
}

/// A triggered quote request whose level can be changed while pending.
pub struct MutableQuote {
    id: u64,
    pending: PendingQuote,
    authority: Weak<Inner>,
}

impl MutableQuote {
    /// Move the trigger to a new level. Fires at once if the latest sample
    /// already satisfies it.
    pub fn update_level(
        &self,
        amount_in: &Amount,
        amount_out_limit: &Amount,
    ) -> PriceAuthorityResult<()> {
        let inner = self
            .authority
            .upgrade()
            .ok_or(PriceAuthorityError::Cancelled)?;
        let authority = QuoteAuthority { inner };
        amount_in.coerce(authority.brand_in())?;
        amount_out_limit.coerce(authority.brand_out())?;

        let mut state = authority.inner.state.lock();
        let latest = state.latest;
        let Some(index) = state.triggers.iter().position(|t| t.id == self.id) else {
            // Already fired or cancelled.
            return Ok(());
        };
        let trigger = &mut state.triggers[index];
        trigger.amount_in = amount_in.value;
        trigger.limit = amount_out_limit.value;

        if let Some(sample) = latest {
            let out = sample.out_for(amount_in.value)?;
            if trigger.comparator.holds(out, amount_out_limit.value) {
                let trigger = state.triggers.remove(index);
                drop(state);
                let quote = authority.mint(trigger.amount_in, out, sample.timestamp);
                let _ = trigger.resolver.send(quote);
            }
        }
        Ok(())
    }

    /// Withdraw the request. The quote future resolves to `Cancelled`.
    pub fn cancel(&self) {
        if let Some(inner) = self.authority.upgrade() {
            inner.state.lock().triggers.retain(|t| t.id != self.id);
        }
    }
}

impl Future for MutableQuote {
    type Output = PriceAuthorityResult<PriceQuote>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.pending).poll(cx)
    }
}
