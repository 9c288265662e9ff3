use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

use crate::keys::ReservationKey;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use super::{CreateOutcome, Feed, ReservationStore, Scope, StoreError};

pub type SharedDateState = Arc<RwLock<SlotMap>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Flush current batch first, then handle the non-append command
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even after an append error, so buffered bytes of a
    // failed batch don't ride along with the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply an event to one date's subtree (caller holds the lock).
fn apply_event(slots: &mut SlotMap, event: &Event) {
    match event {
        Event::ReservationCreated { key, record } => {
            slots
                .entry(key.slot.clone())
                .or_default()
                .insert(key.table.clone(), record.clone());
        }
        Event::ReservationDeleted { key } => {
            if let Some(tables) = slots.get_mut(&key.slot) {
                tables.remove(&key.table);
                if tables.is_empty() {
                    slots.remove(&key.slot);
                }
            }
        }
    }
}

/// In-process reservation store persisted through a WAL.
///
/// Each date subtree sits behind its own `RwLock`; writers hold that lock
/// across WAL-append + apply + notify, which is what makes
/// `create_if_absent` atomic.
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    dates: DashMap<NaiveDate, SharedDateState>,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    /// Shared by writers, exclusive for compaction: no append may land
    /// between the state scan and the log rewrite.
    gate: RwLock<()>,
}

impl LocalStore {
    /// Recover state from `wal_path` and start the WAL writer. Must be
    /// called inside a Tokio runtime.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut tree = ReservationTree::new();
        for event in &events {
            apply_event(tree.entry(event.key().date).or_default(), event);
        }
        let dates = DashMap::new();
        for (date, slots) in tree {
            if !slots.is_empty() {
                dates.insert(date, Arc::new(RwLock::new(slots)));
            }
        }
        info!(
            "replayed {} WAL events from {} ({} dates)",
            events.len(),
            wal_path.display(),
            dates.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                dates,
                wal_tx,
                notify,
                gate: RwLock::new(()),
            }),
        })
    }

    /// Open `reservations.wal` inside `data_dir`.
    pub fn open_in(data_dir: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let path: PathBuf = data_dir.join("reservations.wal");
        Self::open(&path, notify)
    }

    pub fn notify_hub(&self) -> &Arc<NotifyHub> {
        &self.inner.notify
    }

    pub async fn reservation_count(&self) -> usize {
        let states: Vec<SharedDateState> =
            self.inner.dates.iter().map(|e| e.value().clone()).collect();
        let mut count = 0;
        for state in states {
            count += state.read().await.values().map(|t| t.len()).sum::<usize>();
        }
        count
    }

    /// Rewrite the WAL as one `ReservationCreated` per live record.
    /// Returns the number of records written.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.compact().await })
            .await
            .map_err(|e| StoreError::Unavailable(format!("compaction task failed: {e}")))?
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn existing_state(&self, date: &NaiveDate) -> Option<SharedDateState> {
        self.inner.dates.get(date).map(|e| e.value().clone())
    }
}

impl Inner {
    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    async fn persist_and_apply(&self, slots: &mut SlotMap, event: &Event) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_event(slots, event);
        self.notify.send(event);
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: ReservationKey,
        record: Reservation,
    ) -> Result<CreateOutcome, StoreError> {
        let _gate = self.gate.read().await;
        let state = self.dates.entry(key.date).or_default().value().clone();
        let mut slots = state.write().await;

        if let Some(existing) = slots.get(&key.slot).and_then(|t| t.get(&key.table)) {
            debug!("create {key}: already held by {}", existing.booked_by);
            return Ok(CreateOutcome::Exists(existing.clone()));
        }

        let event = Event::ReservationCreated { key, record };
        self.persist_and_apply(&mut slots, &event).await?;
        Ok(CreateOutcome::Created)
    }

    async fn delete(&self, key: ReservationKey) -> Result<Option<Reservation>, StoreError> {
        let _gate = self.gate.read().await;
        let Some(state) = self.dates.get(&key.date).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let mut slots = state.write().await;

        let Some(existing) = slots.get(&key.slot).and_then(|t| t.get(&key.table)).cloned() else {
            return Ok(None);
        };

        let event = Event::ReservationDeleted { key };
        self.persist_and_apply(&mut slots, &event).await?;
        Ok(Some(existing))
    }

    async fn compact(&self) -> Result<usize, StoreError> {
        let _gate = self.gate.write().await;

        let mut states: Vec<(NaiveDate, SharedDateState)> = self
            .dates
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_by_key(|(date, _)| *date);

        let mut events = Vec::new();
        for (date, state) in states {
            let slots = state.read().await;
            for (slot, tables) in slots.iter() {
                for (table, record) in tables {
                    events.push(Event::ReservationCreated {
                        key: ReservationKey::from_parts(date, slot, table),
                        record: record.clone(),
                    });
                }
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))?;
        Ok(count)
    }
}

#[async_trait]
impl ReservationStore for LocalStore {
    async fn read(&self, key: &ReservationKey) -> Result<Option<Reservation>, StoreError> {
        let Some(state) = self.existing_state(&key.date) else {
            return Ok(None);
        };
        let slots = state.read().await;
        Ok(slots.get(&key.slot).and_then(|t| t.get(&key.table)).cloned())
    }

    async fn create_if_absent(
        &self,
        key: &ReservationKey,
        record: Reservation,
    ) -> Result<CreateOutcome, StoreError> {
        // Detached, so a caller that gives up (timeout, disconnect) cannot
        // abandon the write between the WAL append and the in-memory apply.
        let inner = self.inner.clone();
        let key = key.clone();
        tokio::spawn(async move { inner.create_if_absent(key, record).await })
            .await
            .map_err(|e| StoreError::Unavailable(format!("writer task failed: {e}")))?
    }

    async fn delete(&self, key: &ReservationKey) -> Result<Option<Reservation>, StoreError> {
        let inner = self.inner.clone();
        let key = key.clone();
        tokio::spawn(async move { inner.delete(key).await })
            .await
            .map_err(|e| StoreError::Unavailable(format!("writer task failed: {e}")))?
    }

    async fn snapshot(&self, scope: &Scope) -> Result<ReservationTree, StoreError> {
        let states: Vec<(NaiveDate, SharedDateState)> = match scope {
            Scope::Date(date) => self
                .existing_state(date)
                .map(|state| vec![(*date, state)])
                .unwrap_or_default(),
            Scope::All => self
                .inner
                .dates
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };

        let mut tree = ReservationTree::new();
        for (date, state) in states {
            let slots = state.read().await;
            if !slots.is_empty() {
                tree.insert(date, slots.clone());
            }
        }
        Ok(tree)
    }

    fn subscribe(&self, scope: &Scope) -> Result<Feed, StoreError> {
        Ok(Feed::new(*scope, self.inner.notify.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::keys::sanitize_identity;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservo_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open(name: &str) -> LocalStore {
        LocalStore::open(&test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    fn key(d: u32, slot: &str, table: &str) -> ReservationKey {
        ReservationKey::from_parts(day(d), slot, table)
    }

    fn record(key: &ReservationKey, who: &str) -> Reservation {
        Reservation {
            booked_by: sanitize_identity(who),
            name: who.into(),
            contact: "5551234567".into(),
            guests: 2,
            table_number: key.table.clone(),
            date: key.date,
            slot: key.slot.clone(),
        }
    }

    #[tokio::test]
    async fn create_if_absent_refuses_second_writer() {
        let store = open("create_twice.wal");
        let k = key(10, "1:00 PM", "table1");

        let first = store.create_if_absent(&k, record(&k, "a@x.com")).await.unwrap();
        assert_eq!(first, CreateOutcome::Created);

        let second = store.create_if_absent(&k, record(&k, "b@x.com")).await.unwrap();
        assert_eq!(second, CreateOutcome::Exists(record(&k, "a@x.com")));
        assert_eq!(store.read(&k).await.unwrap(), Some(record(&k, "a@x.com")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_have_exactly_one_winner() {
        let store = open("create_race.wal");
        let k = key(10, "1:00 PM", "table1");

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                let who = format!("diner{i}@x.com");
                store.create_if_absent(&k, record(&k, &who)).await.unwrap()
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap() == CreateOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.reservation_count().await, 1);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = open("delete_idempotent.wal");
        let k = key(10, "1:00 PM", "table1");
        store.create_if_absent(&k, record(&k, "a@x.com")).await.unwrap();

        assert_eq!(store.delete(&k).await.unwrap(), Some(record(&k, "a@x.com")));
        assert_eq!(store.delete(&k).await.unwrap(), None);
        assert_eq!(store.delete(&key(11, "1:00 PM", "table1")).await.unwrap(), None);
        assert!(store.snapshot(&Scope::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_scopes() {
        let store = open("snapshot_scopes.wal");
        let a = key(10, "1:00 PM", "table1");
        let b = key(11, "2:00 PM", "table2");
        store.create_if_absent(&a, record(&a, "a@x.com")).await.unwrap();
        store.create_if_absent(&b, record(&b, "b@x.com")).await.unwrap();

        let all = store.snapshot(&Scope::All).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = store.snapshot(&Scope::Date(day(10))).await.unwrap();
        assert_eq!(one.len(), 1);
        assert!(one[&day(10)]["1:00 PM"].contains_key("table1"));

        assert!(store.snapshot(&Scope::Date(day(12))).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wal_replay_restores_tree() {
        let path = test_wal_path("replay.wal");
        let a = key(10, "1:00 PM", "table1");
        let b = key(10, "1:00 PM", "table2");
        {
            let store = LocalStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            store.create_if_absent(&a, record(&a, "a@x.com")).await.unwrap();
            store.create_if_absent(&b, record(&b, "b@x.com")).await.unwrap();
            store.delete(&a).await.unwrap();
        }

        let store = LocalStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.read(&a).await.unwrap(), None);
        assert_eq!(store.read(&b).await.unwrap(), Some(record(&b, "b@x.com")));
    }

    #[tokio::test]
    async fn compaction_preserves_live_records() {
        let path = test_wal_path("compact.wal");
        let keep = key(10, "3:00 PM", "table2");
        {
            let store = LocalStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
            for _ in 0..5 {
                let churn = key(10, "1:00 PM", "table1");
                store.create_if_absent(&churn, record(&churn, "c@x.com")).await.unwrap();
                store.delete(&churn).await.unwrap();
            }
            store.create_if_absent(&keep, record(&keep, "k@x.com")).await.unwrap();
            assert_eq!(store.wal_appends_since_compact().await, 11);

            assert_eq!(store.compact().await.unwrap(), 1);
            assert_eq!(store.wal_appends_since_compact().await, 0);
        }

        let store = LocalStore::open(&path, Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(store.reservation_count().await, 1);
        assert_eq!(store.read(&keep).await.unwrap(), Some(record(&keep, "k@x.com")));
    }

    #[tokio::test]
    async fn feed_wakes_on_change_under_scope_only() {
        let store = open("feed_scope.wal");
        let mut feed = store.subscribe(&Scope::Date(day(10))).unwrap();

        let elsewhere = key(11, "1:00 PM", "table1");
        store.create_if_absent(&elsewhere, record(&elsewhere, "a@x.com")).await.unwrap();
        let woke = tokio::time::timeout(Duration::from_millis(50), feed.changed()).await;
        assert!(woke.is_err(), "other dates must not wake the feed");

        let here = key(10, "1:00 PM", "table1");
        store.create_if_absent(&here, record(&here, "a@x.com")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), feed.changed())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_feed_releases_channel() {
        let store = open("feed_release.wal");
        let feed = store.subscribe(&Scope::All).unwrap();
        assert_eq!(store.notify_hub().channel_count(), 1);
        drop(feed);
        assert_eq!(store.notify_hub().channel_count(), 0);
    }

    #[tokio::test]
    async fn commit_that_outlives_its_deadline_still_lands() {
        use crate::config::EngineConfig;
        use crate::engine::{BookingError, BookingRequest, Engine, FixedClock};
        use crate::session::Session;

        let store = open("late_commit.wal");
        let config = EngineConfig {
            store_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        };
        let now = day(10).and_hms_opt(9, 0, 0).unwrap();
        let engine = Engine::with_clock(Arc::new(store.clone()), config, Arc::new(FixedClock(now)));
        let session = Session::with_identity("a@x.com");
        let req = BookingRequest {
            date: "2025-03-10".into(),
            slot: "1:00 PM".into(),
            table: Some("table1".into()),
            name: "Ada".into(),
            contact: "5551234567".into(),
            guests: 2u32.into(),
        };

        // Reads pass, writers queue behind the held gate.
        let gate = store.inner.gate.write().await;
        let err = engine.bookings().book(&session, &req).await.unwrap_err();
        let BookingError::StorageFailure(msg) = &err else {
            panic!("expected a storage failure, got {err:?}");
        };
        assert!(msg.contains("outcome unknown"), "{msg}");
        drop(gate);

        let k = key(10, "1:00 PM", "table1");
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.read(&k).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("detached commit never landed");

        let retry = engine.bookings().book(&session, &req).await.unwrap_err();
        assert_eq!(
            retry,
            BookingError::AlreadyBooked {
                table: "table1".into()
            }
        );
    }
}
