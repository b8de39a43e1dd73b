//! Mutation coordination: optimistic writes with rollback.
//!
//! A [`Mutation`] runs a remote write against one query key in a fixed order:
//!
//! 1. wait for any earlier mutation on the same key to settle
//! 2. cancel an in-flight fetch of the key
//! 3. snapshot the cache entry
//! 4. apply the optimistic patch, if any, before the remote call resolves
//! 5. run the remote call
//! 6. on failure, restore the snapshot exactly
//! 7. settle: invalidate the key (and any extra keys) so the server's answer
//!    replaces the prediction
//!
//! Steps 6 and 7 live in [`MutationContext`]'s `Drop`, so they also run when
//! the mutation future is dropped mid-flight.
//!
//! # Example
//!
//! ```rust,ignore
//! let updated = Mutation::new(query_key!["slides", repository_id])
//!     .optimistic(move |slides: Option<&Vec<Slide>>| {
//!         slides.map(|slides| patch_title(slides, "s1", "New Title"))
//!     })
//!     .execute(&client, || Box::pin(put_title("s1", "New Title")))
//!     .await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;

use tracing::{debug, warn};

use crate::cache::{CacheEntry, EntityCache};
use crate::error::{MutationError, QueryError};
use crate::key::QueryKey;
use crate::query::QueryClient;

type OptimisticPatch<T> = Box<dyn FnOnce(Option<&T>) -> Option<T> + Send>;
type SettleHook<R> = Box<dyn FnOnce(Result<&R, &MutationError>) + Send>;

/// Snapshot held for the duration of one mutation.
///
/// Dropping the context settles the mutation: an uncommitted snapshot is
/// restored, then every affected key is invalidated.
pub struct MutationContext<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: EntityCache,
    key: QueryKey,
    invalidates: Vec<QueryKey>,
    snapshot: Option<Option<CacheEntry<T>>>,
}

impl<T> MutationContext<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Records the current entry for `key`.
    #[must_use]
    pub fn begin(cache: EntityCache, key: QueryKey, invalidates: Vec<QueryKey>) -> Self {
        let snapshot = cache.get::<T>(&key);
        Self {
            cache,
            key,
            invalidates,
            snapshot: Some(snapshot),
        }
    }

    /// Returns the entry as it was when the mutation began.
    #[must_use]
    pub fn previous(&self) -> Option<&CacheEntry<T>> {
        self.snapshot.as_ref().and_then(Option::as_ref)
    }

    /// Replaces the entry's data with `patch(current)`. `None` leaves it unchanged.
    pub fn apply(&self, patch: impl FnOnce(Option<&T>) -> Option<T>) {
        let current = self.cache.get::<T>(&self.key);
        if let Some(data) = patch(current.as_ref().and_then(|e| e.data.as_ref())) {
            self.cache
                .update(&self.key, |entry: &mut CacheEntry<T>| entry.data = Some(data));
        }
    }

    /// Discards the snapshot and settles.
    pub fn commit(mut self) {
        self.snapshot = None;
    }

    /// Restores the snapshot and settles.
    pub fn rollback(self) {
        drop(self);
    }
}

impl<T> Drop for MutationContext<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            warn!(key = %self.key, "rolling back optimistic update");
            self.cache.restore(&self.key, snapshot);
        }
        self.cache.invalidate(&self.key);
        for key in &self.invalidates {
            self.cache.invalidate(key);
        }
    }
}

/// A remote write against the entity cached under one key.
///
/// `T` is the cached type of the key; `R` is what the remote call returns.
pub struct Mutation<T, R> {
    key: QueryKey,
    optimistic: Option<OptimisticPatch<T>>,
    invalidates: Vec<QueryKey>,
    on_settle: Option<SettleHook<R>>,
    _phantom: PhantomData<fn() -> R>,
}

impl<T, R> Mutation<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// Creates a mutation targeting `key`.
    #[must_use]
    pub fn new(key: QueryKey) -> Self {
        Self {
            key,
            optimistic: None,
            invalidates: Vec::new(),
            on_settle: None,
            _phantom: PhantomData,
        }
    }

    /// Sets the optimistic patch, applied to the cached data before the remote
    /// call resolves. Returning `None` leaves the data unchanged.
    #[must_use]
    pub fn optimistic(
        mut self,
        patch: impl FnOnce(Option<&T>) -> Option<T> + Send + 'static,
    ) -> Self {
        self.optimistic = Some(Box::new(patch));
        self
    }

    /// Also invalidates `key` when the mutation settles.
    #[must_use]
    pub fn invalidates(mut self, key: QueryKey) -> Self {
        self.invalidates.push(key);
        self
    }

    /// Runs `hook` after settlement with the outcome, success or failure.
    #[must_use]
    pub fn on_settle(mut self, hook: impl FnOnce(Result<&R, &MutationError>) + Send + 'static) -> Self {
        self.on_settle = Some(Box::new(hook));
        self
    }

    /// Runs the mutation.
    ///
    /// `mutator` is invoked only once this mutation holds the key, after the
    /// optimistic patch is visible.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError`] if the remote call fails. The cache entry has
    /// already been restored to its pre-mutation state by then.
    pub async fn execute<F, Fut>(self, client: &QueryClient, mutator: F) -> Result<R, MutationError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<R, QueryError>> + Send,
    {
        let Self {
            key,
            optimistic,
            invalidates,
            on_settle,
            ..
        } = self;

        let _pending = client.begin_mutation(&key);
        let lock = client.mutation_lock(&key);
        let _guard = lock.lock().await;
        debug!(key = %key, "mutation started");

        client.cache().cancel_in_flight(&key);
        let context = MutationContext::<T>::begin(client.cache().clone(), key.clone(), invalidates);
        if let Some(patch) = optimistic {
            context.apply(patch);
        }

        let outcome = mutator().await.map_err(|source| MutationError {
            key: key.clone(),
            source,
        });

        match &outcome {
            Ok(_) => context.commit(),
            Err(err) => {
                debug!(key = %key, error = %err, "mutation failed");
                context.rollback();
            }
        }

        if let Some(hook) = on_settle {
            hook(outcome.as_ref());
        }
        outcome
    }
}
