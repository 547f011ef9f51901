//! Stable subscriptions over swappable sources.
//!
//! Each key path owns a "meta" notifier whose values are source notifiers, and
//! a stable output notifier. One follower task per key path forwards the
//! current source's updates into the stable notifier and switches as soon as
//! the meta notifier names a new source. Subscribers hold the stable notifier
//! and never notice the swap except through its values.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::notifier::{make_notifier_kit, Notifier, Publisher, UpdateCount};

/// Identity of one `replace` call on a key path.
pub type Generation = u64;

#[derive(Clone)]
struct Source<T> {
    generation: Generation,
    notifier: Notifier<T>,
}

struct Node<T> {
    active: Arc<AtomicU64>,
    meta: Publisher<Source<T>>,
    stable: Publisher<T>,
    stable_notifier: Notifier<T>,
}

/// Arena of replaceable notifiers keyed by ordered key paths.
pub struct ReplaceableNotifiers<K, T> {
    nodes: Mutex<BTreeMap<Vec<K>, Node<T>>>,
}

impl<K, T> Default for ReplaceableNotifiers<K, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> ReplaceableNotifiers<K, T>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// The stable notifier for `key_path`, creating the entry if needed.
    ///
    /// Entry creation spawns the follower task, so this must run inside a
    /// tokio runtime.
    pub fn notifier(&self, key_path: &[K]) -> Notifier<T> {
        let mut nodes = self.nodes.lock();
        Self::node(&mut nodes, key_path).stable_notifier.clone()
    }

    /// Make `source` the notifier feeding `key_path`. Returns the new
    /// generation.
    pub fn replace(&self, key_path: &[K], source: Notifier<T>) -> Generation {
        let mut nodes = self.nodes.lock();
        let node = Self::node(&mut nodes, key_path);
        let generation = node.active.fetch_add(1, Ordering::AcqRel) + 1;
        // The meta publisher lives as long as the node, which is only removed
        // by `delete`, so it cannot have terminated here.
        let _ = node.meta.update_state(Source {
            generation,
            notifier: source,
        });
        debug!("Replaced notifier source at {:?} (generation {})", key_path, generation);
        generation
    }

    /// Finish the stable notifier for `key_path` and drop the entry.
    pub fn delete(&self, key_path: &[K]) -> bool {
        let Some(node) = self.nodes.lock().remove(key_path) else {
            return false;
        };
        close_stable(&node.stable);
        if node.meta.finish_latest().is_err() {
            node.meta.fail("deleted");
        }
        debug!("Deleted replaceable notifier at {:?}", key_path);
        true
    }

    pub fn contains(&self, key_path: &[K]) -> bool {
        self.nodes.lock().contains_key(key_path)
    }

    /// Current source generation for `key_path`; 0 before the first replace.
    pub fn generation(&self, key_path: &[K]) -> Option<Generation> {
        self.nodes
            .lock()
            .get(key_path)
            .map(|node| node.active.load(Ordering::Acquire))
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    fn node<'a>(nodes: &'a mut BTreeMap<Vec<K>, Node<T>>, key_path: &[K]) -> &'a Node<T> {
        nodes.entry(key_path.to_vec()).or_insert_with(|| {
            let (meta, meta_notifier) = make_notifier_kit(None);
            let (stable, stable_notifier) = make_notifier_kit(None);
            let active = Arc::new(AtomicU64::new(0));
            tokio::spawn(follow(meta_notifier, stable.clone(), Arc::clone(&active)));
            Node {
                active,
                meta,
                stable,
                stable_notifier,
            }
        })
    }
}

/// Forward the active source into `stable` until the meta notifier ends.
async fn follow<T>(meta: Notifier<Source<T>>, stable: Publisher<T>, active: Arc<AtomicU64>)
where
    T: Clone + Send + Sync + 'static,
{
    let mut meta_seen: Option<UpdateCount> = None;
    let mut next: Option<Source<T>> = None;

    loop {
        let source = match next.take() {
            Some(source) => source,
            None => match meta.get_update_since(meta_seen).await {
                Ok(record) if !record.is_final() => {
                    meta_seen = record.update_count;
                    record.value
                }
                _ => {
                    close_stable(&stable);
                    return;
                }
            },
        };

        let generation = source.generation;
        let updates = source.notifier.updates();
        futures_util::pin_mut!(updates);

        next = loop {
            tokio::select! {
                biased;

                record = meta.get_update_since(meta_seen) => match record {
                    Ok(record) if !record.is_final() => {
                        meta_seen = record.update_count;
                        break Some(record.value);
                    }
                    _ => {
                        close_stable(&stable);
                        return;
                    }
                },

                update = updates.next() => {
                    if active.load(Ordering::Acquire) != generation {
                        break None;
                    }
                    match update {
                        Some(Ok(value)) => {
                            if stable.update_state(value).is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            warn!("Notifier source {} failed, awaiting replacement: {}", generation, err);
                            break None;
                        }
                        None => {
                            debug!("Notifier source {} finished, awaiting replacement", generation);
                            break None;
                        }
                    }
                }
            }
        };
    }
}

fn close_stable<T>(stable: &Publisher<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if stable.finish_latest().is_err() {
        stable.fail("deleted");
    }
}
