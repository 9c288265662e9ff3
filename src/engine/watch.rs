use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::observability::WATCHES_ACTIVE;
use crate::store::{Feed, Scope, StoreError};

/// A live subscription: re-derives a view after every change under its scope
/// and hands it to a callback.
///
/// `unsubscribe().await` returns only once the callback can no longer run.
/// Dropping a `Watch` stops it too, without waiting.
#[derive(Debug)]
pub struct Watch {
    scope: Scope,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Keeps the active-watches gauge honest even when the task is aborted.
struct ActiveWatch;

impl ActiveWatch {
    fn new() -> Self {
        metrics::gauge!(WATCHES_ACTIVE).increment(1.0);
        ActiveWatch
    }
}

impl Drop for ActiveWatch {
    fn drop(&mut self) {
        metrics::gauge!(WATCHES_ACTIVE).decrement(1.0);
    }
}

impl Watch {
    /// Drive `feed`: on every change, run `load` and pass the result to
    /// `on_update`. A failed load is logged and retried on the next change.
    pub(crate) fn spawn<T, L, Fut, F>(mut feed: Feed, load: L, mut on_update: F) -> Self
    where
        T: Send + 'static,
        L: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let scope = feed.scope();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let active = ActiveWatch::new();

        let task = tokio::spawn(async move {
            let _active = active;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = feed.changed() => {
                        if changed.is_err() {
                            debug!("watch on {scope}: feed closed");
                            break;
                        }
                    }
                }

                let loaded = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    loaded = load() => loaded,
                };
                match loaded {
                    Ok(view) => on_update(view),
                    Err(e) => warn!("watch on {scope}: refresh failed: {e}"),
                }
            }
        });

        Self {
            scope,
            cancel,
            task: Some(task),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Stop the watch and wait for its task to exit.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            // A cancelled or panicked task has stopped either way.
            let _ = task.await;
        }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
