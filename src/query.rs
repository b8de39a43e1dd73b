//! Query coordination: fetch-on-demand, fetch-on-stale, and request dedup.
//!
//! This module provides the [`Query`] handle and the [`QueryClient`] that owns
//! the shared [`EntityCache`], similar to SWR or TanStack Query.
//!
//! # Lifecycle of a key
//!
//! `Idle → Loading → Success | Error`, and back to `Loading` when the entry
//! goes stale (time-based or invalidated) and is read again. While a refetch
//! runs, readers keep getting the last good data.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slide_sync::prelude::*;
//! use slide_sync::transport::{fetch_json, Request, Transport};
//!
//! # async fn run(transport: Arc<dyn Transport>) {
//! let client = QueryClient::new();
//! let query = Query::new(query_key!["repositories"], client.clone(), move || {
//!     let transport = transport.clone();
//!     Box::pin(async move {
//!         fetch_json::<Vec<serde_json::Value>>(transport.as_ref(), Request::get("/repositories")).await
//!     })
//! });
//!
//! let result = query.fetch().await;
//! if let Some(items) = result.data() {
//!     println!("{} repositories", items.len());
//! }
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::cache::{CacheEntry, EntityCache, Status, Subscription};
use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::key::QueryKey;

/// Async function producing the data for a query.
pub type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, QueryError>>>;

/// A snapshot of one query's state, as seen by the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub status: Status,
    pub error: Option<QueryError>,
    /// Whether the data is stale and a refetch is due or running.
    pub is_stale: bool,
}

impl<T> QueryResult<T> {
    fn from_entry(entry: Option<CacheEntry<T>>) -> Self {
        match entry {
            Some(entry) => {
                let is_stale = entry.is_stale();
                Self {
                    data: entry.data,
                    status: entry.status,
                    error: entry.error,
                    is_stale,
                }
            }
            None => Self {
                data: None,
                status: Status::Idle,
                error: None,
                is_stale: true,
            },
        }
    }

    /// Returns the data if any has been fetched, otherwise `None`.
    ///
    /// Data survives a failed refetch, so this can be `Some` while [`is_error`](Self::is_error).
    pub const fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Returns `true` if the query is currently loading.
    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }

    /// Returns `true` if the query succeeded.
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Returns `true` if the last fetch failed.
    pub fn is_error(&self) -> bool {
        self.status == Status::Error
    }

    /// Returns `true` if the query data is stale.
    pub const fn is_stale(&self) -> bool {
        self.is_stale
    }
}

/// A client for managing the query cache, fetch dedup and mutation ordering.
///
/// The `QueryClient` is the central state manager for queries. It handles:
/// - Caching query results in the shared [`EntityCache`]
/// - Joining concurrent fetches for the same key
/// - Serializing mutations per key
///
/// Cloning shares all state.
///
/// # Example
///
/// ```rust
/// use slide_sync::config::QueryConfig;
/// use slide_sync::query::QueryClient;
/// use std::time::Duration;
///
/// let client = QueryClient::with_config(QueryConfig::new(Duration::from_secs(30)));
/// assert_eq!(client.config().stale_time, Duration::from_secs(30));
/// ```
#[derive(Clone)]
pub struct QueryClient {
    cache: EntityCache,
    mutation_locks: Arc<DashMap<QueryKey, Arc<Mutex<()>>>>,
    pending_mutations: Arc<DashMap<QueryKey, usize>>,
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryConfig::default())
    }

    /// Creates a new query client with the given configuration.
    #[must_use]
    pub fn with_config(config: QueryConfig) -> Self {
        Self::with_cache(EntityCache::with_config(config))
    }

    /// Creates a client over an existing cache.
    #[must_use]
    pub fn with_cache(cache: EntityCache) -> Self {
        Self {
            cache,
            mutation_locks: Arc::new(DashMap::new()),
            pending_mutations: Arc::new(DashMap::new()),
        }
    }

    /// Gets the shared cache.
    #[must_use]
    pub const fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// Gets the query configuration.
    #[must_use]
    pub const fn config(&self) -> &QueryConfig {
        self.cache.config()
    }

    /// Marks `key` stale so its next read refetches.
    pub fn invalidate(&self, key: &QueryKey) {
        self.cache.invalidate(key);
    }

    /// Returns `true` while a mutation on `key` is running or queued.
    #[must_use]
    pub fn is_mutating(&self, key: &QueryKey) -> bool {
        self.pending_mutations.get(key).is_some_and(|n| *n > 0)
    }

    /// Fetches `key`, joining an in-flight fetch for the same key if there is one.
    ///
    /// The result is written to the cache exactly once, by whichever caller's
    /// fetch completes, unless the fetch was cancelled first. Every joined
    /// caller receives the same outcome.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`QueryError::Cancelled`] if a mutation
    /// cancelled the fetch.
    pub async fn fetch<T>(
        &self,
        key: &QueryKey,
        fetcher: &Fetcher<T>,
        stale_after: Duration,
    ) -> Result<T, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.start_fetch(key, fetcher, stale_after).await
    }

    /// Registers (or joins) the fetch for `key` and marks the entry loading.
    ///
    /// Registration is synchronous, so a second caller in the same turn
    /// already sees the fetch in flight.
    fn start_fetch<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>, stale_after: Duration) -> SharedFetch<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let (operation, started) = self.cache.join_or_start(key, |token, id| -> SharedFetch<T> {
            let cache = self.cache.clone();
            let key = key.clone();
            let fetch = fetcher();

            async move {
                let result = tokio::select! {
                    biased;
                    () = token.cancelled() => Err(QueryError::Cancelled),
                    result = fetch => result,
                };
                if token.is_cancelled() {
                    debug!(key = %key, "discarding result of cancelled fetch");
                    return Err(QueryError::Cancelled);
                }

                cache.finish_in_flight(&key, id);
                match &result {
                    Ok(data) => {
                        let data = data.clone();
                        cache.update(&key, |entry: &mut CacheEntry<T>| entry.update(data));
                    }
                    Err(err) => {
                        debug!(key = %key, error = %err, "fetch failed");
                        let err = err.clone();
                        cache.update(&key, |entry: &mut CacheEntry<T>| entry.fail(err));
                    }
                }
                result
            }
            .boxed()
            .shared()
        });

        if started {
            debug!(key = %key, "fetch started");
            self.cache.update(key, |entry: &mut CacheEntry<T>| {
                entry.status = Status::Loading;
                entry.stale_after = stale_after;
            });
        }
        operation
    }

    /// Starts a fetch for `key` in the background without waiting for it.
    fn spawn_fetch<T>(&self, key: &QueryKey, fetcher: &Fetcher<T>, stale_after: Duration)
    where
        T: Clone + Send + Sync + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key = %key, "no runtime available, skipping background refetch");
            return;
        };
        let operation = self.start_fetch(key, fetcher, stale_after);
        runtime.spawn(async move {
            // The outcome is recorded on the cache entry.
            let _ = operation.await;
        });
    }

    pub(crate) fn mutation_lock(&self, key: &QueryKey) -> Arc<Mutex<()>> {
        Arc::clone(self.mutation_locks.entry(key.clone()).or_default().value())
    }

    pub(crate) fn begin_mutation(&self, key: &QueryKey) -> PendingMutation {
        *self.pending_mutations.entry(key.clone()).or_insert(0) += 1;
        PendingMutation {
            pending: Arc::clone(&self.pending_mutations),
            locks: Arc::clone(&self.mutation_locks),
            key: key.clone(),
        }
    }

    /// Drops every cache entry and every idle mutation lock.
    ///
    /// Mutations still running keep their lock and pending count, and release
    /// them when they settle.
    pub fn clear(&self) {
        self.cache.clear();
        self.mutation_locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Counts a mutation as pending on its key until dropped.
///
/// The last one out removes the key's counter, and its lock once no task
/// holds a handle to it.
pub(crate) struct PendingMutation {
    pending: Arc<DashMap<QueryKey, usize>>,
    locks: Arc<DashMap<QueryKey, Arc<Mutex<()>>>>,
    key: QueryKey,
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        let settled = self
            .pending
            .remove_if_mut(&self.key, |_, count| {
                *count = count.saturating_sub(1);
                *count == 0
            })
            .is_some();
        if settled {
            self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// A query bound to one key and fetcher.
///
/// `Query` is the handle the rendering layer holds for one remote resource:
///
/// 1. [`read`](Self::read) returns the cached state immediately and starts a
///    background fetch when the data is missing or stale
/// 2. [`fetch`](Self::fetch) waits for data when there is none yet
/// 3. [`watch`](Self::watch) streams every change to the entry
///
/// A query with different dependency values (e.g. another repository id) is a
/// different key and therefore a different `Query`.
pub struct Query<T> {
    key: QueryKey,
    fetcher: Fetcher<T>,
    client: QueryClient,
    stale_after: Duration,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            fetcher: Arc::clone(&self.fetcher),
            client: self.client.clone(),
            stale_after: self.stale_after,
        }
    }
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a new query with the given key, client, and fetcher.
    ///
    /// # Arguments
    ///
    /// * `key` - A unique identifier for this query (used for caching)
    /// * `client` - The query client for cache management
    /// * `fetcher` - An async function that fetches the data
    pub fn new<F>(key: QueryKey, client: QueryClient, fetcher: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync + 'static,
    {
        let stale_after = client.config().stale_time;
        Self {
            key,
            fetcher: Arc::new(fetcher),
            client,
            stale_after,
        }
    }

    /// Overrides how long fetched data stays fresh for this query.
    #[must_use]
    pub const fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    #[must_use]
    pub const fn key(&self) -> &QueryKey {
        &self.key
    }

    #[must_use]
    pub const fn client(&self) -> &QueryClient {
        &self.client
    }

    /// Returns the cached state without waiting.
    ///
    /// Starts a background fetch if one is due. Stale data is returned as-is
    /// while the refetch runs.
    #[must_use]
    pub fn read(&self) -> QueryResult<T> {
        let entry = self.entry();
        if self.needs_fetch(entry.as_ref()) {
            self.client.spawn_fetch(&self.key, &self.fetcher, self.stale_after);
            return QueryResult::from_entry(self.entry());
        }
        QueryResult::from_entry(entry)
    }

    /// Returns the query state, waiting for a fetch only when there is no data yet.
    ///
    /// Fresh data is returned from the cache. Stale data is returned immediately
    /// and refreshed in the background. A failed fetch leaves any previous data
    /// in place and reports the error on the result.
    pub async fn fetch(&self) -> QueryResult<T> {
        let entry = self.entry();
        let has_data = entry.as_ref().is_some_and(|e| e.data.is_some());
        let due = self.needs_fetch(entry.as_ref());

        if !has_data && (due || self.client.cache().is_fetching(&self.key)) {
            // Joins a fetch already in flight. Errors are recorded on the entry.
            let _ = self.client.fetch(&self.key, &self.fetcher, self.stale_after).await;
        } else if due {
            self.client.spawn_fetch(&self.key, &self.fetcher, self.stale_after);
        }
        QueryResult::from_entry(self.entry())
    }

    /// Fetches unconditionally, joining an in-flight fetch if there is one.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; it is also recorded on the cache entry.
    pub async fn refetch(&self) -> Result<T, QueryError> {
        self.client.fetch(&self.key, &self.fetcher, self.stale_after).await
    }

    /// Calls `listener` synchronously on every change to this query's entry.
    pub fn subscribe(
        &self,
        listener: impl Fn(Option<&CacheEntry<T>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.client.cache().subscribe(&self.key, listener)
    }

    /// Streams the query state: the current state first, then one item per change.
    ///
    /// Starting the stream triggers a fetch if one is due, like [`read`](Self::read).
    pub fn watch(&self) -> BoxStream<'static, QueryResult<T>> {
        let rx = self.client.cache().events();
        let initial = self.read();
        let cache = self.client.cache().clone();
        let key = self.key.clone();

        let changes = BroadcastStream::new(rx).filter_map(move |event| {
            // A lagged receiver may have missed our key, so re-read on lag too.
            let item = match event {
                Ok(changed) if changed != key => None,
                _ => Some(QueryResult::from_entry(cache.get::<T>(&key))),
            };
            futures::future::ready(item)
        });

        stream::once(futures::future::ready(initial))
            .chain(changes)
            .boxed()
    }

    fn entry(&self) -> Option<CacheEntry<T>> {
        self.client.cache().get::<T>(&self.key)
    }

    /// Missing, invalidated, or time-stale entries need a fetch.
    ///
    /// An errored entry is judged by its last successful fetch, so it is
    /// fetched again on the next read once that is stale. Nothing retries on
    /// its own between reads.
    fn needs_fetch(&self, entry: Option<&CacheEntry<T>>) -> bool {
        if self.client.cache().is_fetching(&self.key) {
            return false;
        }
        match entry {
            None => true,
            Some(entry) if entry.is_invalidated => true,
            Some(entry) => match entry.status {
                Status::Idle => true,
                Status::Success | Status::Error => entry
                    .last_fetched_at
                    .is_none_or(|at| at.elapsed() > self.stale_after),
                Status::Loading => false,
            },
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::query_key;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn counting_query(
        client: &QueryClient,
        calls: &Arc<AtomicUsize>,
        value: i32,
    ) -> Query<i32> {
        let calls = calls.clone();
        Query::new(query_key!["numbers"], client.clone(), move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(value) })
        })
    }

    fn server_error() -> QueryError {
        QueryError::Transport(TransportError::Status {
            status: 500,
            body: None,
        })
    }

    #[test]
    fn test_query_result_predicates() {
        let result = QueryResult::<i32>::from_entry(None);
        assert_eq!(result.data(), None);
        assert_eq!(result.status, Status::Idle);
        assert!(!result.is_loading());
        assert!(result.is_stale());

        let mut entry = CacheEntry::new(query_key!["n"], Duration::from_secs(60));
        entry.update(42);
        let result = QueryResult::from_entry(Some(entry.clone()));
        assert_eq!(result.data(), Some(&42));
        assert!(result.is_success());
        assert!(!result.is_stale());

        entry.fail(server_error());
        let result = QueryResult::from_entry(Some(entry));
        assert!(result.is_error());
        assert_eq!(result.data(), Some(&42));
    }

    #[test]
    fn test_query_client_new() {
        let client = QueryClient::new();
        assert!(client.cache().is_empty());
        assert_eq!(client.config().stale_time, Duration::from_secs(5 * 60));
    }

    #[tokio::test]
    async fn test_fetch_populates_cache() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&client, &calls, 7);

        let result = query.fetch().await;
        assert_eq!(result.data(), Some(&7));
        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let entry = client.cache().get::<i32>(query.key()).unwrap();
        assert_eq!(entry.status, Status::Success);
        assert!(entry.last_fetched_at.is_some());
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn test_fresh_data_is_not_refetched() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&client, &calls, 7);

        query.fetch().await;
        let result = query.fetch().await;
        assert_eq!(result.data(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_request() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<Result<i32, QueryError>>();
        let rx = Arc::new(std::sync::Mutex::new(Some(rx)));

        let query = Query::new(query_key!["numbers"], client.clone(), {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let rx = rx.lock().unwrap().take();
                Box::pin(async move {
                    match rx {
                        Some(rx) => rx.await.unwrap_or(Err(QueryError::Cancelled)),
                        None => Err(QueryError::Cancelled),
                    }
                })
            }
        });

        let first = tokio::spawn({
            let query = query.clone();
            async move { query.refetch().await }
        });
        let second = tokio::spawn({
            let query = query.clone();
            async move { query.refetch().await }
        });
        tokio::task::yield_now().await;
        tx.send(Ok(11)).unwrap();

        assert_eq!(first.await.unwrap(), Ok(11));
        assert_eq!(second.await.unwrap(), Ok(11));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_failure() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = Query::new(query_key!["numbers"], client.clone(), {
            let calls = calls.clone();
            move || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {
                    tokio::task::yield_now().await;
                    Err::<i32, _>(server_error())
                })
            }
        });

        let (a, b) = tokio::join!(query.refetch(), query.refetch());
        assert_eq!(a, Err(server_error()));
        assert_eq!(b, Err(server_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_last_good_data() {
        let client = QueryClient::new();
        let key = query_key!["numbers"];
        let outcomes = Arc::new(std::sync::Mutex::new(vec![Err(server_error()), Ok(1)]));
        let query = Query::new(key.clone(), client.clone(), move || {
            let next = outcomes.lock().unwrap().pop().unwrap_or(Ok(0));
            Box::pin(async move { next })
        });

        assert_eq!(query.refetch().await, Ok(1));
        assert_eq!(query.refetch().await, Err(server_error()));

        let result = query.read();
        assert!(result.is_error());
        assert_eq!(result.data(), Some(&1));
        assert_eq!(result.error, Some(server_error()));
    }

    fn scripted_query(
        client: &QueryClient,
        calls: &Arc<AtomicUsize>,
        outcomes: Vec<Result<i32, QueryError>>,
    ) -> Query<i32> {
        let calls = calls.clone();
        let outcomes = Arc::new(std::sync::Mutex::new(outcomes.into_iter().rev().collect::<Vec<_>>()));
        Query::new(query_key!["numbers"], client.clone(), move || {
            calls.fetch_add(1, Ordering::SeqCst);
            let next = outcomes.lock().unwrap().pop().unwrap_or(Ok(0));
            Box::pin(async move { next })
        })
    }

    #[tokio::test]
    async fn test_failed_first_fetch_is_retried_by_next_read() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = scripted_query(&client, &calls, vec![Err(server_error()), Ok(7)]);

        let failed = query.fetch().await;
        assert!(failed.is_error());
        assert_eq!(failed.data(), None);
        assert!(failed.is_stale());

        let recovered = query.fetch().await;
        assert!(recovered.is_success());
        assert_eq!(recovered.data(), Some(&7));
        assert_eq!(recovered.error, None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errored_entry_with_data_refetches_once_stale() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = scripted_query(&client, &calls, vec![Ok(1), Err(server_error()), Ok(2)])
            .stale_after(Duration::from_secs(10));

        query.fetch().await;
        assert_eq!(query.refetch().await, Err(server_error()));

        // Still fresh from the last success, so no new request yet.
        assert!(query.read().is_error());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        let result = query.read();
        assert!(result.is_loading());
        assert_eq!(result.data(), Some(&1));

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let result = query.read();
        assert!(result.is_success());
        assert_eq!(result.data(), Some(&2));
    }

    #[tokio::test]
    async fn test_failed_revalidation_is_retried_by_next_read() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = scripted_query(&client, &calls, vec![Ok(1), Err(server_error()), Ok(2)]);

        query.fetch().await;
        client.invalidate(query.key());
        assert_eq!(query.refetch().await, Err(server_error()));

        let result = query.read();
        assert!(result.is_loading());
        assert_eq!(result.data(), Some(&1));
        assert!(client.cache().is_fetching(query.key()));

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(query.read().data(), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_served_while_revalidating() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&client, &calls, 3).stale_after(Duration::from_secs(10));

        query.fetch().await;
        tokio::time::advance(Duration::from_secs(11)).await;

        let result = query.fetch().await;
        assert_eq!(result.data(), Some(&3));
        assert!(result.is_stale());

        // Let the background refetch run.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!query.read().is_stale());
    }

    #[tokio::test]
    async fn test_invalidate_triggers_refetch_on_read() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&client, &calls, 5);

        query.fetch().await;
        client.invalidate(query.key());

        let result = query.read();
        assert_eq!(result.data(), Some(&5));
        assert!(result.is_stale());
        assert!(client.cache().is_fetching(query.key()));

        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_write() {
        let client = QueryClient::new();
        let key = query_key!["numbers"];
        let (tx, rx) = oneshot::channel::<()>();
        let rx = Arc::new(std::sync::Mutex::new(Some(rx)));
        let query = Query::new(key.clone(), client.clone(), move || {
            let rx = rx.lock().unwrap().take();
            Box::pin(async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(99)
            })
        });

        let pending = tokio::spawn({
            let query = query.clone();
            async move { query.refetch().await }
        });
        tokio::task::yield_now().await;
        assert_eq!(client.cache().get::<i32>(&key).unwrap().status, Status::Loading);

        client.cache().cancel_in_flight(&key);
        let _ = tx.send(());

        assert_eq!(pending.await.unwrap(), Err(QueryError::Cancelled));
        let entry = client.cache().get::<i32>(&key).unwrap();
        assert_eq!(entry.data, None);
        assert_eq!(entry.status, Status::Idle);
    }

    #[tokio::test]
    async fn test_different_keys_are_independent() {
        let client = QueryClient::new();
        let a = Query::new(query_key!["slides", "r1"], client.clone(), || {
            Box::pin(async { Ok(vec!["s1".to_string()]) })
        });
        let b = Query::new(query_key!["slides", "r2"], client.clone(), || {
            Box::pin(async { Ok(vec!["s9".to_string()]) })
        });

        let (ra, rb) = tokio::join!(a.fetch(), b.fetch());
        assert_eq!(ra.data(), Some(&vec!["s1".to_string()]));
        assert_eq!(rb.data(), Some(&vec!["s9".to_string()]));
    }

    #[tokio::test]
    async fn test_settled_mutation_releases_its_key() {
        let client = QueryClient::new();
        let key = query_key!["numbers"];
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn({
            let client = client.clone();
            let key = key.clone();
            async move {
                crate::mutation::Mutation::<i32, ()>::new(key)
                    .execute(&client, move || async move { rx.await.map_err(|_| QueryError::Cancelled) })
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert!(client.is_mutating(&key));

        // A running mutation keeps its lock through a teardown.
        client.clear();
        assert_eq!(client.mutation_locks.len(), 1);
        assert!(client.is_mutating(&key));

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert!(!client.is_mutating(&key));
        assert!(client.pending_mutations.is_empty());
        assert!(client.mutation_locks.is_empty());
    }

    #[tokio::test]
    async fn test_watch_emits_current_then_changes() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query = counting_query(&client, &calls, 8);
        query.fetch().await;

        let mut stream = query.watch();
        let first = stream.next().await.unwrap();
        assert_eq!(first.data(), Some(&8));

        client.invalidate(query.key());
        let second = stream.next().await.unwrap();
        assert!(second.is_stale());
    }
}
