use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{CallError, KeyError};
use crate::key::CacheKey;
use crate::outcome::{CallResult, Outcome, Settle};
use crate::utils::defer::CallOnDrop;

/// A table record for one identifier.
struct Entry<T, E> {
    /// Distinguishes this entry from later entries for the same key.
    id: u64,
    outcome: Outcome<T, E>,
    /// Present until a window-deferred invocation has settled.
    timer: Option<CancellationToken>,
}

struct Table<T, E> {
    entries: HashMap<CacheKey, Entry<T, E>>,
    next_id: u64,
}

type SharedTable<T, E> = Arc<Mutex<Table<T, E>>>;

fn lock<T, E>(table: &Mutex<Table<T, E>>) -> MutexGuard<'_, Table<T, E>> {
    // nothing panics while holding the lock, so the table is consistent even if poisoned
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coalesces calls to an expensive asynchronous operation by key.
///
/// All calls for the same [`CacheKey`] share a single invocation of the operation and
/// observe the same [`Outcome`]. How long an entry lives depends on the configured window:
///
/// - **Unbounded** (no window): the operation is invoked right away and its outcome, success
///   or failure, is kept for the lifetime of the `Batcher`. Use
///   [`invalidate`](Self::invalidate) to drop a settled outcome explicitly.
/// - **Bounded** (a window of `N`): the operation is deferred by `N`, so every call for the key
///   within that time joins the same invocation. Once the invocation has settled the entry is
///   removed and the next call invokes the operation anew.
///
/// Dropping the `Batcher` cancels every window that has not elapsed yet. Operations that are
/// already running are never cancelled.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use std::sync::Arc;
/// use batcher::Batcher;
///
/// let batcher = Batcher::<String, std::io::Error>::unbounded();
///
/// let first = batcher.call(&["user", "42"], || async { Ok("Ferris".to_owned()) })?;
/// let second = batcher.call(&["user", "42"], || async { Ok("not invoked".to_owned()) })?;
///
/// let (first, second) = (first.await?, second.await?);
/// assert!(Arc::ptr_eq(&first, &second));
/// # Ok(())
/// # }
/// ```
pub struct Batcher<T, E> {
    name: Arc<str>,
    window: Option<Duration>,
    table: SharedTable<T, E>,
}

impl<T, E> fmt::Debug for Batcher<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .table
            .try_lock()
            .map(|table| table.entries.len())
            .unwrap_or_default();
        f.debug_struct("Batcher")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("entries", &entries)
            .finish()
    }
}

impl<T, E> Batcher<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates a new batcher, bounded if a `window` is given.
    pub fn new(window: Option<Duration>) -> Self {
        Self::named("default", window)
    }

    /// Creates a batcher that keeps every outcome for its whole lifetime.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Creates a batcher that defers each invocation by `window` and forgets it afterwards.
    pub fn with_window(window: Duration) -> Self {
        Self::new(Some(window))
    }

    /// Creates a batcher from its configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::named(config.name.as_str(), config.window)
    }

    fn named(name: impl Into<Arc<str>>, window: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            window,
            table: Arc::new(Mutex::new(Table {
                entries: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Returns the outcome of `operation` for `key`, invoking it only if no call for the same
    /// key is pending or cached.
    ///
    /// `key` can be anything that serializes to a sequence, see [`CacheKey::new`]. The returned
    /// [`Outcome`] can be awaited by any number of callers.
    ///
    /// # Errors
    ///
    /// Fails with a [`KeyError`] if `key` cannot be normalized. In that case nothing is
    /// inserted and `operation` is not invoked.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn call<K, F, Fut>(&self, key: &K, operation: F) -> Result<Outcome<T, E>, KeyError>
    where
        K: Serialize + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = CacheKey::new(key)?;
        Ok(self.call_with_key(key, operation))
    }

    /// Like [`call`](Self::call), for a key that has already been normalized.
    ///
    /// NOTE: This function itself is *not* `async`. It registers the entry and eagerly spawns
    /// the invocation, even if the returned outcome is never awaited.
    pub fn call_with_key<F, Fut>(&self, key: CacheKey, operation: F) -> Outcome<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name: &str = &self.name;
        metric!(counter("batcher.access") += 1, "batcher" => name);

        let mut table = lock(&self.table);
        if let Some(entry) = table.entries.get(&key) {
            metric!(counter("batcher.hit") += 1, "batcher" => name);
            tracing::trace!(batcher = name, key = %key.digest(), "Joining coalesced call");
            return entry.outcome.clone();
        }

        // The entry is registered before the operation is invoked or scheduled, so that
        // concurrent callers for the same key either find it or wait on the lock.
        let (settle, outcome) = Outcome::deferred();
        let id = table.next_id;
        table.next_id += 1;
        let timer = self
            .window
            .map(|window| (window, CancellationToken::new()));
        table.entries.insert(
            key.clone(),
            Entry {
                id,
                outcome: outcome.clone(),
                timer: timer.as_ref().map(|(_, token)| token.clone()),
            },
        );
        let entries = table.entries.len();
        drop(table);

        metric!(counter("batcher.miss") += 1, "batcher" => name);
        metric!(gauge("batcher.entries") = entries as u64, "batcher" => name);

        match timer {
            Some((window, token)) => self.schedule(key, id, window, token, operation, settle),
            None => self.invoke(key, operation, settle),
        }

        outcome
    }

    /// Invokes `operation` right away, keeping its outcome in the table.
    fn invoke<F, Fut>(&self, key: CacheKey, operation: F, settle: Settle<T, E>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        tracing::trace!(batcher = %self.name, key = %key.digest(), "Invoking coalesced call");

        let future = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
            Ok(future) => future,
            Err(_) => {
                settle.send(Err(CallError::Panicked)).ok();
                return;
            }
        };

        let name = Arc::clone(&self.name);
        let task = async move {
            let result = run_operation(name, key, future).await;
            // the entry may already have been invalidated, with nobody left waiting
            settle.send(result).ok();
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Spawns a task that invokes `operation` once `window` has elapsed, and removes the entry
    /// after it settled.
    fn schedule<F, Fut>(
        &self,
        key: CacheKey,
        id: u64,
        window: Duration,
        timer: CancellationToken,
        operation: F,
        settle: Settle<T, E>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        tracing::trace!(
            batcher = %self.name,
            key = %key.digest(),
            window = ?window,
            "Scheduling coalesced call"
        );

        let name = Arc::clone(&self.name);
        // Evicts explicitly once the outcome is known, and on drop if the task panics or is
        // dropped along with the runtime.
        let release = {
            let key = key.clone();
            let name = Arc::clone(&name);
            let table = Arc::clone(&self.table);
            CallOnDrop::new(move || {
                let mut table = lock(&table);
                // the entry may have been invalidated and replaced in the meantime
                if table.entries.get(&key).is_some_and(|entry| entry.id == id) {
                    table.entries.remove(&key);
                    metric!(counter("batcher.evicted") += 1, "batcher" => name.as_ref());
                    metric!(
                        gauge("batcher.entries") = table.entries.len() as u64,
                        "batcher" => name.as_ref()
                    );
                    tracing::trace!(batcher = %name, key = %key.digest(), "Evicted coalesced call");
                }
            })
        };

        let task = async move {
            tokio::select! {
                _ = timer.cancelled() => {
                    tracing::debug!(
                        batcher = %name,
                        key = %key.digest(),
                        "Coalesced call cancelled before its window elapsed"
                    );
                    drop(release);
                    drop(settle);
                    return;
                }
                _ = tokio::time::sleep(window) => {}
            }

            let result = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
                Ok(future) => run_operation(name, key, future).await,
                Err(_) => Err(CallError::Panicked),
            };

            // The entry is gone before any waiter wakes up, so a call made by a waiter
            // always starts a new invocation.
            drop(release);
            settle.send(result).ok();
        };

        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Removes the entry for `key` if its outcome has settled.
    ///
    /// Pending entries are left alone, so this can never cause a second concurrent invocation.
    /// Returns whether an entry was removed. This is the way to retry a key whose failure is
    /// cached by an unbounded batcher.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut table = lock(&self.table);
        match table.entries.get(key) {
            Some(entry) if entry.outcome.is_settled() => {
                table.entries.remove(key);
                let name: &str = &self.name;
                metric!(gauge("batcher.entries") = table.entries.len() as u64, "batcher" => name);
                tracing::trace!(batcher = name, key = %key.digest(), "Invalidated coalesced call");
                true
            }
            _ => false,
        }
    }
}

impl<T, E> Batcher<T, E> {
    /// The name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configured window, `None` for an unbounded batcher.
    pub fn window(&self) -> Option<Duration> {
        self.window
    }

    /// The number of pending and cached entries.
    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    /// Whether there are no entries at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether there is an entry for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        lock(&self.table).entries.contains_key(key)
    }

    /// The number of entries with a window-deferred invocation that has not settled yet.
    pub fn pending_timers(&self) -> usize {
        lock(&self.table)
            .entries
            .values()
            .filter(|entry| entry.timer.is_some())
            .count()
    }
}

impl<T, E> Drop for Batcher<T, E> {
    fn drop(&mut self) {
        let table = lock(&self.table);
        for entry in table.entries.values() {
            if let Some(timer) = &entry.timer {
                timer.cancel();
            }
        }
    }
}

/// Runs the operation's future to completion and turns its output into the shared result.
async fn run_operation<T, E, Fut>(name: Arc<str>, key: CacheKey, future: Fut) -> CallResult<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    metric!(counter("batcher.invocation") += 1, "batcher" => name.as_ref());
    let start = Instant::now();

    let result = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(Arc::new(value)),
        Ok(Err(err)) => Err(CallError::Operation(Arc::new(err))),
        Err(_) => Err(CallError::Panicked),
    };

    metric!(timer("batcher.operation.duration") = start.elapsed(), "batcher" => name.as_ref());
    if let Err(err) = &result {
        metric!(
            counter("batcher.failure") += 1,
            "batcher" => name.as_ref(),
            "kind" => err.kind(),
        );
        tracing::debug!(
            batcher = %name,
            key = %key.digest(),
            kind = err.kind(),
            "Coalesced call failed"
        );
    }

    result
}
