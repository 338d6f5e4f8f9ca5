//! Concurrent key/value map whose entries expire.
//!
//! Every entry carries a deadline of `now + timeout`. Reading an entry with
//! [`ExpiringMap::get`] slides the deadline forward; [`ExpiringMap::peek`] and
//! the purge scan never do. A background worker owned by the map runs
//! [`ExpiringMap::purge`] every `purge_interval` while the map is started.
//!
//! Purging is a two-pass operation:
//! 1. Expired entries are snapshotted, sorted by `(expire_at, key)` and offered
//!    to the [`EvictionListener`] one at a time, outside any table lock. The
//!    listener may veto by returning `false`, returning an error, or panicking.
//! 2. Approved keys are removed, but only if the stored entry is still expired.
//!    An entry refreshed or replaced while the listener ran survives.

use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::lifecycle::{ManagedService, RunGuard, ServiceController};
use crate::worker::{Housekeeping, HousekeepingTask};

/// Default interval between purge cycles.
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_millis(1000);

/// Horizon used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + timeout`, saturating at a far-future deadline instead of
/// overflowing.
#[must_use]
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// EvictionListener
// ---------------------------------------------------------------------------

/// Decides whether an expired entry may be evicted, and reacts to it.
///
/// Errors and panics from either method are logged and treated as a veto:
/// the entry stays in the map and is offered again on the next cycle.
pub trait EvictionListener<K, V>: Send + Sync {
    /// Checked before [`on_eviction`](Self::on_eviction). Returning `false`
    /// skips the entry for this cycle without notifying.
    fn is_valid_for_eviction(&self, _key: &K, _value: &V) -> bool {
        true
    }

    /// Called for each expired entry in ascending expiry order. Return
    /// `Ok(true)` to let the entry be removed.
    ///
    /// # Errors
    ///
    /// Any error vetoes the eviction.
    fn on_eviction(&self, key: &K, value: &V) -> anyhow::Result<bool>;
}

impl<K, V, F> EvictionListener<K, V> for F
where
    F: Fn(&K, &V) -> anyhow::Result<bool> + Send + Sync,
{
    fn on_eviction(&self, key: &K, value: &V) -> anyhow::Result<bool> {
        self(key, value)
    }
}

/// Listener that approves every eviction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvictionListener;

impl<K, V> EvictionListener<K, V> for NoopEvictionListener {
    fn on_eviction(&self, _key: &K, _value: &V) -> anyhow::Result<bool> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// TimeoutEntry
// ---------------------------------------------------------------------------

/// One stored value and its deadline. Never leaves the table.
struct TimeoutEntry<V> {
    value: V,
    timeout: Duration,
    expire_at: Instant,
}

impl<V> TimeoutEntry<V> {
    fn new(value: V, timeout: Duration, now: Instant) -> Self {
        Self {
            value,
            timeout,
            expire_at: deadline_after(now, timeout),
        }
    }

    fn refresh(&mut self, now: Instant) {
        self.expire_at = deadline_after(now, self.timeout);
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expire_at < now
    }
}

// ---------------------------------------------------------------------------
// Shared table
// ---------------------------------------------------------------------------

struct Table<K, V> {
    name: String,
    entries: DashMap<K, TimeoutEntry<V>>,
    listener: Arc<dyn EvictionListener<K, V>>,
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug,
    V: Clone,
{
    fn purge(&self) -> usize {
        let now = Instant::now();

        let mut expired: Vec<(K, V, Instant)> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| {
                let stored = entry.value();
                (entry.key().clone(), stored.value.clone(), stored.expire_at)
            })
            .collect();

        if expired.is_empty() {
            return 0;
        }

        expired.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let mut approved = Vec::with_capacity(expired.len());
        for (key, value, _) in &expired {
            if self.admit(key, value) {
                approved.push(key);
            }
        }

        let vetoed = expired.len() - approved.len();
        let mut evicted = 0;
        for key in approved {
            if self
                .entries
                .remove_if(key, |_, stored| stored.is_expired(now))
                .is_some()
            {
                evicted += 1;
            }
        }

        debug!(map = %self.name, evicted, vetoed, "purge cycle complete");
        metrics::counter!("replywire_expiring_map_evictions_total", "map" => self.name.clone())
            .increment(evicted as u64);
        if vetoed > 0 {
            metrics::counter!("replywire_expiring_map_vetoes_total", "map" => self.name.clone())
                .increment(vetoed as u64);
        }

        evicted
    }

    /// Runs the listener for one candidate, containing errors and panics.
    fn admit(&self, key: &K, value: &V) -> bool {
        let listener = &self.listener;
        let decision = catch_unwind(AssertUnwindSafe(|| {
            if !listener.is_valid_for_eviction(key, value) {
                return Ok(false);
            }
            listener.on_eviction(key, value)
        }));

        match decision {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                debug!(map = %self.name, ?key, "eviction vetoed");
                false
            }
            Ok(Err(err)) => {
                warn!(map = %self.name, ?key, error = %err, "eviction hook failed; entry retained");
                false
            }
            Err(_) => {
                error!(map = %self.name, ?key, "eviction hook panicked; entry retained");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Purge worker
// ---------------------------------------------------------------------------

/// On-demand purge request; the reply carries the number of evicted entries.
struct PurgeRequest {
    reply: oneshot::Sender<usize>,
}

struct PurgeRunnable<K, V> {
    table: Arc<Table<K, V>>,
    guard: RunGuard,
}

impl<K, V> PurgeRunnable<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug,
    V: Clone,
{
    fn purge_contained(&self) -> usize {
        // A single bad cycle must not take the worker down with it.
        match catch_unwind(AssertUnwindSafe(|| self.table.purge())) {
            Ok(evicted) => evicted,
            Err(_) => {
                error!(map = %self.table.name, "purge cycle panicked");
                0
            }
        }
    }
}

#[async_trait]
impl<K, V> Housekeeping for PurgeRunnable<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Request = PurgeRequest;

    async fn handle(&mut self, request: PurgeRequest) {
        // Suspension pauses on-demand purges as well as ticks.
        let evicted = if self.guard.is_run_allowed() {
            self.purge_contained()
        } else {
            debug!(map = %self.table.name, state = %self.guard.state(), "purge request skipped");
            0
        };
        let _ = request.reply.send(evicted);
    }

    async fn on_tick(&mut self) {
        self.purge_contained();
    }
}

// ---------------------------------------------------------------------------
// ExpiringMap
// ---------------------------------------------------------------------------

/// Concurrent map with per-entry timeouts and a lifecycle-managed purge task.
///
/// All single-key operations are atomic with respect to that key. Stopping the
/// map cancels the purge task and clears the table without notifying the
/// listener.
pub struct ExpiringMap<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    table: Arc<Table<K, V>>,
    purge_interval: Duration,
    worker: tokio::sync::Mutex<Option<HousekeepingTask<PurgeRunnable<K, V>>>>,
    controller: ServiceController,
}

impl<K, V> ExpiringMap<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a map whose expired entries are always evicted.
    #[must_use]
    pub fn new(name: impl Into<String>, purge_interval: Duration) -> Self {
        Self::with_listener(name, purge_interval, Arc::new(NoopEvictionListener))
    }

    /// Creates a map that consults `listener` before each eviction.
    #[must_use]
    pub fn with_listener(
        name: impl Into<String>,
        purge_interval: Duration,
        listener: Arc<dyn EvictionListener<K, V>>,
    ) -> Self {
        let name = name.into();
        Self {
            table: Arc::new(Table {
                name: name.clone(),
                entries: DashMap::new(),
                listener,
            }),
            purge_interval,
            worker: tokio::sync::Mutex::new(None),
            controller: ServiceController::new(name),
        }
    }

    #[must_use]
    pub fn purge_interval(&self) -> Duration {
        self.purge_interval
    }

    /// Inserts or replaces `key`, expiring `timeout` from now.
    pub fn put(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        let entry = TimeoutEntry::new(value, timeout, Instant::now());
        self.table.entries.insert(key, entry).map(|old| old.value)
    }

    /// Inserts only if `key` is absent; returns the existing value otherwise.
    ///
    /// The candidate's deadline is computed either way, same as `put`.
    pub fn put_if_absent(&self, key: K, value: V, timeout: Duration) -> Option<V> {
        let candidate = TimeoutEntry::new(value, timeout, Instant::now());
        match self.table.entries.entry(key) {
            Entry::Occupied(existing) => Some(existing.get().value.clone()),
            Entry::Vacant(slot) => {
                slot.insert(candidate);
                None
            }
        }
    }

    /// Returns the value and pushes its deadline to `now + timeout`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut entry = self.table.entries.get_mut(key)?;
        entry.refresh(Instant::now());
        Some(entry.value.clone())
    }

    /// Returns the value without touching its deadline.
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.table.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.entries.is_empty()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.table
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Runs one purge cycle on the calling thread and returns the number of
    /// entries evicted. Listener errors and panics are contained here.
    pub fn purge(&self) -> usize {
        self.table.purge()
    }

    /// Asks the background worker to run a purge cycle and waits for it.
    /// While the map is suspended nothing is purged and `Ok(0)` is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the map is not started.
    pub async fn purge_now(&self) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        {
            let worker = self.worker.lock().await;
            let Some(worker) = worker.as_ref() else {
                anyhow::bail!("expiring map `{}` is not running", self.table.name);
            };
            worker.request(PurgeRequest { reply }).await?;
        }
        Ok(rx.await?)
    }
}

#[async_trait]
impl<K, V> ManagedService for ExpiringMap<K, V>
where
    K: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn controller(&self) -> &ServiceController {
        &self.controller
    }

    async fn do_start(&self) -> anyhow::Result<()> {
        if self.purge_interval.is_zero() {
            anyhow::bail!("expiring map `{}` needs a non-zero purge interval", self.table.name);
        }
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            let runnable = PurgeRunnable {
                table: Arc::clone(&self.table),
                guard: self.controller.run_guard(),
            };
            *worker = Some(HousekeepingTask::spawn(
                runnable,
                self.purge_interval,
                self.controller.run_guard(),
            ));
        }
        Ok(())
    }

    async fn do_stop(&self) -> anyhow::Result<()> {
        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        let abandoned = self.table.entries.len();
        self.table.entries.clear();
        if abandoned > 0 {
            debug!(map = %self.table.name, abandoned, "cleared entries on stop");
        }
        Ok(())
    }

    // Suspension pauses purging: the worker's guard stops admitting ticks.
    fn supports_suspension(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
