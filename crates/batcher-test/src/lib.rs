//! Helpers for testing the batcher.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use a [`Counter`] to build operations. It counts how often the batcher actually invoked
//!    an operation, which is what most assertions are about.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `batcher` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("batcher=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts invocations of the operations it creates.
///
/// Clones share the same count.
#[derive(Clone, Debug, Default)]
pub struct Counter {
    calls: Arc<AtomicUsize>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often one of the operations created by this counter has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// An operation that resolves to `value` immediately.
    pub fn returning<T, E>(&self, value: T) -> impl FnOnce() -> Ready<T, E> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value))
        }
    }

    /// An operation that fails with `error` immediately.
    pub fn failing<T, E>(&self, error: E) -> impl FnOnce() -> Ready<T, E> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err(error))
        }
    }

    /// An operation that resolves to `value` after `delay`.
    pub fn delayed<T, E>(
        &self,
        delay: Duration,
        value: T,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<T, E>> + Send>> + Send + 'static
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let calls = Arc::clone(&self.calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }
}

/// The future returned by [`Counter::returning`] and [`Counter::failing`].
pub type Ready<T, E> = std::future::Ready<Result<T, E>>;
