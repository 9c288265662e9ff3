//! The store boundary: a path-addressed reservation tree with atomic
//! create-if-absent and change feeds.

mod local;

pub use local::LocalStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::keys::{date_path, ReservationKey, ROOT};
use crate::model::{Event, Reservation, ReservationTree};
use crate::notify::NotifyHub;

/// A watchable subtree: everything, or one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    All,
    Date(NaiveDate),
}

impl Scope {
    pub fn path(&self) -> String {
        match self {
            Scope::All => ROOT.to_string(),
            Scope::Date(date) => date_path(*date),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Somebody already holds the key; nothing was written.
    Exists(Reservation),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("change feed closed")]
pub struct FeedClosed;

#[async_trait]
pub trait ReservationStore: Send + Sync + 'static {
    async fn read(&self, key: &ReservationKey) -> Result<Option<Reservation>, StoreError>;

    /// Write `record` at `key` only if nothing is there. All-or-nothing, and
    /// serialized against every other writer of the same key.
    async fn create_if_absent(
        &self,
        key: &ReservationKey,
        record: Reservation,
    ) -> Result<CreateOutcome, StoreError>;

    /// Remove the record at `key`, returning it. Absent keys are `Ok(None)`.
    async fn delete(&self, key: &ReservationKey) -> Result<Option<Reservation>, StoreError>;

    /// Full current contents under `scope`. Empty subtrees are omitted.
    async fn snapshot(&self, scope: &Scope) -> Result<ReservationTree, StoreError>;

    /// Start receiving change notifications for `scope`.
    fn subscribe(&self, scope: &Scope) -> Result<Feed, StoreError>;
}

/// Live change notifications for one scope.
///
/// Dropping the feed gives the underlying channel back to the hub.
pub struct Feed {
    scope: Scope,
    rx: Option<broadcast::Receiver<Event>>,
    hub: Arc<NotifyHub>,
}

impl Feed {
    pub fn new(scope: Scope, hub: Arc<NotifyHub>) -> Self {
        let rx = hub.subscribe(scope);
        Self {
            scope,
            rx: Some(rx),
            hub,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Wait for at least one change under the scope, then swallow whatever
    /// else is already queued. Callers re-read the full snapshot afterwards,
    /// so individual events and lag both collapse into "changed".
    pub async fn changed(&mut self) -> Result<(), FeedClosed> {
        let rx = self.rx.as_mut().ok_or(FeedClosed)?;
        match rx.recv().await {
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err(FeedClosed),
        }
        loop {
            match rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        drop(self.rx.take());
        self.hub.release(&self.scope);
    }
}
