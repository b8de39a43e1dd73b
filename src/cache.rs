//! The entity cache: one entry per query key, shared by every query and mutation.
//!
//! Entries are stored type-erased so a single cache can hold a list of
//! repositories next to a list of slides. Typed access goes through
//! [`EntityCache::get`] and [`EntityCache::set`], which downcast to
//! [`CacheEntry<T>`].
//!
//! Every change to an entry notifies two kinds of observers:
//!
//! - listeners registered with [`EntityCache::subscribe`], called synchronously
//!   with the updated entry before `set` returns
//! - receivers from [`EntityCache::events`], which get the changed key over a
//!   broadcast channel and are used by async watch streams
//!
//! Listeners are called after the entry lock is released, so a listener may
//! read or write the cache itself.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Fetch status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// A cached entry with timestamp and staleness information.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub data: Option<T>,
    pub status: Status,
    pub error: Option<QueryError>,
    pub last_fetched_at: Option<Instant>,
    pub stale_after: Duration,
    /// Set by [`EntityCache::invalidate`]; cleared by the next completed fetch.
    pub is_invalidated: bool,
}

impl<T> CacheEntry<T> {
    /// Creates an idle entry with no data.
    #[must_use]
    pub const fn new(key: QueryKey, stale_after: Duration) -> Self {
        Self {
            key,
            data: None,
            status: Status::Idle,
            error: None,
            last_fetched_at: None,
            stale_after,
            is_invalidated: false,
        }
    }

    /// Checks if this entry is stale: invalidated, never fetched, or older than `stale_after`.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_invalidated
            || self
                .last_fetched_at
                .is_none_or(|at| at.elapsed() > self.stale_after)
    }

    /// Marks this entry as stale.
    pub const fn mark_stale(&mut self) {
        self.is_invalidated = true;
    }

    /// Records a successful fetch, resetting timestamp and staleness.
    pub fn update(&mut self, data: T) {
        self.data = Some(data);
        self.status = Status::Success;
        self.error = None;
        self.last_fetched_at = Some(Instant::now());
        self.is_invalidated = false;
    }

    /// Records a failed fetch. The last good data and its timestamp stay in
    /// place, and an invalidated entry stays invalidated.
    pub fn fail(&mut self, error: QueryError) {
        self.status = Status::Error;
        self.error = Some(error);
    }
}

/// A partial update merged into a [`CacheEntry`] by [`EntityCache::set`].
///
/// Unset fields are left untouched.
pub struct EntryPatch<T> {
    data: Option<Option<T>>,
    status: Option<Status>,
    error: Option<Option<QueryError>>,
    last_fetched_at: Option<Option<Instant>>,
    stale_after: Option<Duration>,
    is_invalidated: Option<bool>,
}

impl<T> Default for EntryPatch<T> {
    fn default() -> Self {
        Self {
            data: None,
            status: None,
            error: None,
            last_fetched_at: None,
            stale_after: None,
            is_invalidated: None,
        }
    }
}

impl<T> EntryPatch<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn data(mut self, data: Option<T>) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn error(mut self, error: Option<QueryError>) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub const fn last_fetched_at(mut self, at: Option<Instant>) -> Self {
        self.last_fetched_at = Some(at);
        self
    }

    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    #[must_use]
    pub const fn invalidated(mut self, invalidated: bool) -> Self {
        self.is_invalidated = Some(invalidated);
        self
    }

    fn apply(self, entry: &mut CacheEntry<T>) {
        if let Some(data) = self.data {
            entry.data = data;
        }
        if let Some(status) = self.status {
            entry.status = status;
        }
        if let Some(error) = self.error {
            entry.error = error;
        }
        if let Some(at) = self.last_fetched_at {
            entry.last_fetched_at = at;
        }
        if let Some(stale_after) = self.stale_after {
            entry.stale_after = stale_after;
        }
        if let Some(invalidated) = self.is_invalidated {
            entry.is_invalidated = invalidated;
        }
    }
}

/// Type-erased view of a `CacheEntry<T>`, so untyped operations can still
/// update it in place.
trait Slot: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn clone_slot(&self) -> Box<dyn Slot>;
    fn mark_stale(&mut self);
    fn cancel_loading(&mut self) -> bool;
}

impl<T> Slot for CacheEntry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_slot(&self) -> Box<dyn Slot> {
        Box::new(self.clone())
    }

    fn mark_stale(&mut self) {
        CacheEntry::mark_stale(self);
    }

    fn cancel_loading(&mut self) -> bool {
        if self.status != Status::Loading {
            return false;
        }
        self.status = if self.data.is_some() {
            Status::Success
        } else {
            Status::Idle
        };
        true
    }
}

type Listener = Arc<dyn Fn(Option<&dyn Any>) + Send + Sync>;
type Listeners = DashMap<QueryKey, Vec<(u64, Listener)>>;

struct InFlight {
    id: u64,
    token: CancellationToken,
    operation: Box<dyn Any + Send + Sync>,
}

/// Process-wide store of query results.
///
/// Cloning is cheap and every clone shares the same entries, so one cache is
/// created at startup and handed to every coordinator. [`EntityCache::clear`]
/// resets it at session end.
#[derive(Clone)]
pub struct EntityCache {
    entries: Arc<DashMap<QueryKey, Box<dyn Slot>>>,
    listeners: Arc<Listeners>,
    in_flight: Arc<DashMap<QueryKey, InFlight>>,
    events: broadcast::Sender<QueryKey>,
    next_id: Arc<AtomicU64>,
    config: QueryConfig,
}

impl EntityCache {
    /// Creates an empty cache with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates an empty cache whose new entries use `config.stale_time`.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        let (events, _) = broadcast::channel(100);
        Self {
            entries: Arc::new(DashMap::new()),
            listeners: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Gets the query configuration.
    #[must_use]
    pub const fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Returns a copy of the entry for `key`, if one of type `T` exists.
    #[must_use]
    pub fn get<T>(&self, key: &QueryKey) -> Option<CacheEntry<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.entries
            .get(key)
            .and_then(|slot| slot.as_any().downcast_ref::<CacheEntry<T>>().cloned())
    }

    /// Returns `true` if an entry exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merges `patch` into the entry for `key`, creating it if absent, then
    /// notifies subscribers of that key.
    pub fn set<T>(&self, key: &QueryKey, patch: EntryPatch<T>)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.update(key, |entry: &mut CacheEntry<T>| patch.apply(entry));
    }

    /// Edits the entry for `key` in place, creating it if absent, then notifies
    /// subscribers of that key.
    pub fn update<T>(&self, key: &QueryKey, edit: impl FnOnce(&mut CacheEntry<T>))
    where
        T: Clone + Send + Sync + 'static,
    {
        let snapshot = {
            let mut slot = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| self.new_slot::<T>(key));

            if !slot.as_any().is::<CacheEntry<T>>() {
                warn!(key = %key, "replacing cache entry of a different type");
                *slot = self.new_slot::<T>(key);
            }
            if let Some(entry) = slot.as_any_mut().downcast_mut::<CacheEntry<T>>() {
                edit(entry);
            }
            slot.clone_slot()
        };
        self.notify(key, Some(snapshot.as_ref()));
    }

    /// Replaces the entry for `key` with `snapshot` exactly. `None` removes it.
    pub fn restore<T>(&self, key: &QueryKey, snapshot: Option<CacheEntry<T>>)
    where
        T: Clone + Send + Sync + 'static,
    {
        match snapshot {
            Some(entry) => {
                let slot: Box<dyn Slot> = Box::new(entry);
                let copy = slot.clone_slot();
                self.entries.insert(key.clone(), slot);
                self.notify(key, Some(copy.as_ref()));
            }
            None => {
                if self.entries.remove(key).is_some() {
                    self.notify(key, None);
                }
            }
        }
    }

    /// Marks the entry for `key` stale without clearing its data.
    ///
    /// The next read serves the old value and refetches in the background.
    pub fn invalidate(&self, key: &QueryKey) {
        let snapshot = self.entries.get_mut(key).map(|mut slot| {
            slot.mark_stale();
            slot.clone_slot()
        });
        debug!(key = %key, present = snapshot.is_some(), "invalidated cache entry");
        if let Some(snapshot) = snapshot {
            self.notify(key, Some(snapshot.as_ref()));
        }
    }

    /// Cancels the in-flight fetch for `key`, if any.
    ///
    /// The cancelled fetch never writes its result. A `Loading` status falls back
    /// to `Success` when data is present, else `Idle`.
    pub fn cancel_in_flight(&self, key: &QueryKey) {
        let Some((_, in_flight)) = self.in_flight.remove(key) else {
            return;
        };
        in_flight.token.cancel();
        debug!(key = %key, "cancelled in-flight fetch");

        let snapshot = self.entries.get_mut(key).and_then(|mut slot| {
            slot.cancel_loading().then(|| slot.clone_slot())
        });
        if let Some(snapshot) = snapshot {
            self.notify(key, Some(snapshot.as_ref()));
        }
    }

    /// Registers `listener` for changes to `key`.
    ///
    /// The listener runs synchronously on every change, with `None` when the
    /// entry is removed. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<T>(
        &self,
        key: &QueryKey,
        listener: impl Fn(Option<&CacheEntry<T>>) + Send + Sync + 'static,
    ) -> Subscription
    where
        T: Clone + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let erased: Listener = Arc::new(move |entry: Option<&dyn Any>| match entry {
            Some(any) => {
                if let Some(entry) = any.downcast_ref::<CacheEntry<T>>() {
                    listener(Some(entry));
                }
            }
            None => listener(None),
        });
        self.listeners
            .entry(key.clone())
            .or_default()
            .push((id, erased));

        Subscription {
            listeners: Arc::clone(&self.listeners),
            key: key.clone(),
            id,
        }
    }

    /// Returns a receiver of keys whose entries changed.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<QueryKey> {
        self.events.subscribe()
    }

    /// Drops every entry, cancels every in-flight fetch and detaches every listener.
    pub fn clear(&self) {
        for in_flight in self.in_flight.iter() {
            in_flight.token.cancel();
        }
        self.in_flight.clear();
        self.entries.clear();
        self.listeners.clear();
        debug!("cache cleared");
    }

    /// Joins the in-flight operation for `key`, or starts one with `start`.
    ///
    /// Returns the operation and whether this call started it. `start` gets the
    /// cancellation token and registration id for the new operation.
    pub(crate) fn join_or_start<F>(
        &self,
        key: &QueryKey,
        start: impl FnOnce(CancellationToken, u64) -> F,
    ) -> (F, bool)
    where
        F: Clone + Send + Sync + 'static,
    {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if let Some(operation) = occupied.get().operation.downcast_ref::<F>() {
                    return (operation.clone(), false);
                }
                let (operation, in_flight) = self.start_in_flight(start);
                occupied.insert(in_flight);
                (operation, true)
            }
            Entry::Vacant(vacant) => {
                let (operation, in_flight) = self.start_in_flight(start);
                vacant.insert(in_flight);
                (operation, true)
            }
        }
    }

    /// Unregisters the in-flight operation `id` for `key` if it is still current.
    pub(crate) fn finish_in_flight(&self, key: &QueryKey, id: u64) {
        self.in_flight.remove_if(key, |_, in_flight| in_flight.id == id);
    }

    /// Returns `true` if a fetch for `key` is in flight.
    #[must_use]
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.in_flight.contains_key(key)
    }

    fn start_in_flight<F>(&self, start: impl FnOnce(CancellationToken, u64) -> F) -> (F, InFlight)
    where
        F: Clone + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let operation = start(token.clone(), id);
        let in_flight = InFlight {
            id,
            token,
            operation: Box::new(operation.clone()),
        };
        (operation, in_flight)
    }

    fn new_slot<T>(&self, key: &QueryKey) -> Box<dyn Slot>
    where
        T: Clone + Send + Sync + 'static,
    {
        Box::new(CacheEntry::<T>::new(key.clone(), self.config.stale_time))
    }

    fn notify(&self, key: &QueryKey, entry: Option<&dyn Slot>) {
        let listeners: Vec<Listener> = self
            .listeners
            .get(key)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(entry.map(|slot| slot.as_any()));
        }
        // No receivers is fine; watch streams come and go.
        let _ = self.events.send(key.clone());
    }
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("entries", &self.entries.len())
            .field("in_flight", &self.in_flight.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Handle for a registered cache listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    listeners: Arc<Listeners>,
    key: QueryKey,
    id: u64,
}

impl Subscription {
    /// Removes the listener.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(mut list) = self.listeners.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
