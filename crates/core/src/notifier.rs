//! Single-slot, versioned publish/subscribe cell.
//!
//! A [`Publisher`] replaces the current value in place and bumps the update
//! count; a [`Notifier`] hands out "the value since update N". Intermediate
//! values are never queued: a subscriber that asks infrequently only sees the
//! latest one. Finishing or failing is sticky and releases every waiter.

use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{NotifierError, NotifierResult};

/// Monotonic per-notifier update counter.
pub type UpdateCount = u64;

/// The value handed to a subscriber.
///
/// `update_count` is `None` once the notifier has finished; `value` is then
/// the final value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord<T> {
    pub value: T,
    pub update_count: Option<UpdateCount>,
}

impl<T> UpdateRecord<T> {
    pub fn is_final(&self) -> bool {
        self.update_count.is_none()
    }
}

#[derive(Debug, Clone)]
enum Terminal {
    Finished,
    Failed(String),
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    update_count: UpdateCount,
    terminal: Option<Terminal>,
}

struct Snapshot<T> {
    value: T,
    update_count: UpdateCount,
    finished: bool,
}

impl<T: Clone> Slot<T> {
    fn is_ready(&self, last_seen: Option<UpdateCount>) -> bool {
        self.terminal.is_some() || (self.value.is_some() && last_seen != Some(self.update_count))
    }

    fn snapshot(&self) -> NotifierResult<Snapshot<T>> {
        match (&self.terminal, &self.value) {
            (Some(Terminal::Failed(reason)), _) => Err(NotifierError::Failed(reason.clone())),
            (terminal, Some(value)) => Ok(Snapshot {
                value: value.clone(),
                update_count: self.update_count,
                finished: terminal.is_some(),
            }),
            (_, None) => Err(NotifierError::NoValue),
        }
    }
}

/// Create a publisher and its notifier, optionally seeded with a value.
pub fn make_notifier_kit<T>(initial: Option<T>) -> (Publisher<T>, Notifier<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let update_count = if initial.is_some() { 1 } else { 0 };
    let (tx, rx) = watch::channel(Slot {
        value: initial,
        update_count,
        terminal: None,
    });
    (Publisher { tx: Arc::new(tx) }, Notifier { rx })
}

/// Write side of a notifier.
pub struct Publisher<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Publisher<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Replace the current value. Returns the new update count.
    pub fn update_state(&self, value: T) -> NotifierResult<UpdateCount> {
        let mut result = Err(NotifierError::Terminated);
        self.tx.send_if_modified(|slot| {
            if slot.terminal.is_some() {
                return false;
            }
            slot.value = Some(value);
            slot.update_count += 1;
            result = Ok(slot.update_count);
            true
        });
        result
    }

    /// Publish a final value and stop accepting updates.
    pub fn finish(&self, value: T) -> NotifierResult<()> {
        let mut result = Err(NotifierError::Terminated);
        self.tx.send_if_modified(|slot| {
            if slot.terminal.is_some() {
                return false;
            }
            slot.value = Some(value);
            slot.update_count += 1;
            slot.terminal = Some(Terminal::Finished);
            result = Ok(());
            true
        });
        result
    }

    /// Finish with whatever value is current.
    pub fn finish_latest(&self) -> NotifierResult<()> {
        let mut result = Err(NotifierError::Terminated);
        self.tx.send_if_modified(|slot| {
            if slot.terminal.is_some() {
                return false;
            }
            if slot.value.is_none() {
                result = Err(NotifierError::NoValue);
                return false;
            }
            slot.terminal = Some(Terminal::Finished);
            result = Ok(());
            true
        });
        result
    }

    /// Fail the notifier. Returns false if it had already terminated.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let failed = self.tx.send_if_modified(|slot| {
            if slot.terminal.is_some() {
                return false;
            }
            slot.terminal = Some(Terminal::Failed(reason.clone()));
            true
        });
        if failed {
            debug!("Notifier failed: {}", reason);
        }
        failed
    }

    pub fn is_terminated(&self) -> bool {
        self.tx.borrow().terminal.is_some()
    }

    pub fn notifier(&self) -> Notifier<T> {
        Notifier {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of a notifier. Cheap to clone.
pub struct Notifier<T> {
    rx: watch::Receiver<Slot<T>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Notifier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish_non_exhaustive()
    }
}

impl<T> Notifier<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Resolve with the current value if it is newer than `last_seen` (or
    /// `last_seen` is `None`), otherwise wait for the next update or
    /// termination.
    pub async fn get_update_since(
        &self,
        last_seen: Option<UpdateCount>,
    ) -> NotifierResult<UpdateRecord<T>> {
        let snapshot = self.next_snapshot(last_seen).await?;
        Ok(UpdateRecord {
            value: snapshot.value,
            update_count: (!snapshot.finished).then_some(snapshot.update_count),
        })
    }

    /// The current record without waiting. `None` before the first update
    /// and after failure.
    pub fn latest(&self) -> Option<UpdateRecord<T>> {
        let snapshot = self.rx.borrow().snapshot().ok()?;
        Some(UpdateRecord {
            value: snapshot.value,
            update_count: (!snapshot.finished).then_some(snapshot.update_count),
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.rx.borrow().terminal.is_some()
    }

    /// Pull-based stream of values. Ends after the final value of a finished
    /// notifier; yields the error once and ends on failure.
    pub fn updates(&self) -> impl Stream<Item = NotifierResult<T>> + Send + 'static {
        struct Cursor<T> {
            notifier: Notifier<T>,
            last_seen: Option<UpdateCount>,
            done: bool,
        }

        let cursor = Cursor {
            notifier: self.clone(),
            last_seen: None,
            done: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            match cursor.notifier.next_snapshot(cursor.last_seen).await {
                Ok(snapshot) => {
                    if snapshot.finished {
                        cursor.done = true;
                        // Finished without a new value: nothing left to yield.
                        if cursor.last_seen == Some(snapshot.update_count) {
                            return None;
                        }
                    }
                    cursor.last_seen = Some(snapshot.update_count);
                    Some((Ok(snapshot.value), cursor))
                }
                Err(err) => {
                    cursor.done = true;
                    Some((Err(err), cursor))
                }
            }
        })
    }

    /// Derive a notifier whose values are `f` applied to this one's.
    ///
    /// Must be called from within a tokio runtime.
    pub fn map<U, F>(&self, f: F) -> Notifier<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + 'static,
    {
        let (publisher, notifier) = make_notifier_kit(None);
        let updates = self.updates();
        tokio::spawn(async move {
            futures_util::pin_mut!(updates);
            while let Some(update) = updates.next().await {
                match update {
                    Ok(value) => {
                        if publisher.update_state(f(value)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        publisher.fail(err.to_string());
                        return;
                    }
                }
            }
            if let Err(err) = publisher.finish_latest() {
                publisher.fail(err.to_string());
            }
        });
        notifier
    }

    async fn next_snapshot(&self, last_seen: Option<UpdateCount>) -> NotifierResult<Snapshot<T>> {
        let mut rx = self.rx.clone();
        let slot = rx
            .wait_for(|slot| slot.is_ready(last_seen))
            .await
            .map_err(|_| NotifierError::Abandoned)?;
        slot.snapshot()
    }
}
