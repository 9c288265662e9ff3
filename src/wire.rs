//! Newline-delimited JSON protocol over TCP.
//!
//! Every request line gets exactly one reply line, either
//! `{"ok":true,...}` or `{"ok":false,"error":{"kind":...,"message":...}}`.
//! Watches push `{"event":"availability",...}` or `{"event":"bookings",...}`
//! lines in between, tagged with the watch id. A client that reads slowly
//! gets the latest snapshot per watch, not every intermediate one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::command::{parse_command, CancelTarget, Command};
use crate::engine::*;
use crate::keys::{build_key, parse_date, parse_path, KeyError};
use crate::limits::{MAX_IDENTITY_LEN, MAX_LINE_LEN, MAX_WATCHES_PER_CONNECTION};
use crate::observability::{
    command_label, PUSHES_COALESCED_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS,
};
use crate::session::Session;

/// A request that could not be served.
#[derive(Debug)]
struct Failure {
    kind: &'static str,
    message: String,
}

impl Failure {
    fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn reply(&self) -> Value {
        json!({
            "ok": false,
            "error": { "kind": self.kind, "message": self.message },
        })
    }
}

impl From<BookingError> for Failure {
    fn from(e: BookingError) -> Self {
        Failure::new(e.kind(), e.to_string())
    }
}

impl From<CancelError> for Failure {
    fn from(e: CancelError) -> Self {
        Failure::new("storage_failure", e.to_string())
    }
}

impl From<OwnershipError> for Failure {
    fn from(e: OwnershipError) -> Self {
        let kind = match e {
            OwnershipError::NotAuthenticated => "not_authenticated",
            OwnershipError::StorageFailure(_) => "storage_failure",
        };
        Failure::new(kind, e.to_string())
    }
}

impl From<AvailabilityError> for Failure {
    fn from(e: AvailabilityError) -> Self {
        let kind = match e {
            AvailabilityError::Key(_) => "invalid_key",
            AvailabilityError::StorageFailure(_) => "storage_failure",
        };
        Failure::new(kind, e.to_string())
    }
}

impl From<KeyError> for Failure {
    fn from(e: KeyError) -> Self {
        Failure::new("invalid_key", e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Availability,
    Bookings,
}

/// Undelivered pushes, at most one per watch. Every push is a full
/// snapshot, so a newer one replaces whatever the client has not read yet.
#[derive(Default)]
struct PushMailbox {
    pending: DashMap<Ulid, Value>,
    ready: Notify,
}

impl PushMailbox {
    fn post(&self, watch: Ulid, push: Value) {
        if self.pending.insert(watch, push).is_some() {
            metrics::counter!(PUSHES_COALESCED_TOTAL).increment(1);
        }
        self.ready.notify_one();
    }

    fn discard(&self, watch: &Ulid) {
        self.pending.remove(watch);
    }

    fn take_all(&self) -> Vec<Value> {
        let ids: Vec<Ulid> = self.pending.iter().map(|e| *e.key()).collect();
        ids.iter()
            .filter_map(|id| self.pending.remove(id).map(|(_, push)| push))
            .collect()
    }
}

/// Per-connection state: who is speaking and what they are watching.
struct Connection {
    engine: Arc<Engine>,
    session: Session,
    watches: HashMap<Ulid, (WatchKind, Watch)>,
    mailbox: Arc<PushMailbox>,
}

impl Connection {
    async fn handle_line(&mut self, line: &str) -> Value {
        let cmd = match parse_command(line) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => "invalid", "status" => "error").increment(1);
                return Failure::new("malformed", e.to_string()).reply();
            }
        };

        let op = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute(cmd).await;
        metrics::histogram!(REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(reply) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
                reply
            }
            Err(failure) => {
                metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "error").increment(1);
                debug!("{op} failed: {} ({})", failure.message, failure.kind);
                failure.reply()
            }
        }
    }

    async fn execute(&mut self, cmd: Command) -> Result<Value, Failure> {
        match cmd {
            Command::Login { identity } => {
                if identity.len() > MAX_IDENTITY_LEN {
                    return Err(Failure::new(
                        "limit_exceeded",
                        format!("identity is longer than {MAX_IDENTITY_LEN} bytes"),
                    ));
                }
                self.drop_booking_watches().await;
                self.session.login(&identity);
                Ok(json!({
                    "ok": true,
                    "owner": self.session.owner_token(),
                }))
            }
            Command::Logout => {
                self.drop_booking_watches().await;
                self.session.logout();
                Ok(json!({ "ok": true }))
            }
            Command::Availability { date, slot } => {
                let date = parse_date(&date)?;
                let tracker = self.engine.availability();
                match slot {
                    Some(slot) => {
                        let status = tracker.table_status(date, &slot).await?;
                        Ok(json!({ "ok": true, "slot": status }))
                    }
                    None => {
                        let snapshot = tracker.current(date).await?;
                        Ok(json!({ "ok": true, "availability": snapshot }))
                    }
                }
            }
            Command::Watch { date } => {
                let date = parse_date(&date)?;
                self.check_watch_limit()?;
                let id = Ulid::new();
                let mailbox = self.mailbox.clone();
                let watch = self
                    .engine
                    .availability()
                    .subscribe(date, move |snapshot| {
                        mailbox.post(
                            id,
                            json!({
                                "event": "availability",
                                "watch": id,
                                "availability": snapshot,
                            }),
                        );
                    })
                    .await?;
                self.watches.insert(id, (WatchKind::Availability, watch));
                Ok(json!({ "ok": true, "watch": id }))
            }
            Command::Unwatch { watch } => match self.watches.remove(&watch) {
                Some((_, w)) => {
                    w.unsubscribe().await;
                    self.mailbox.discard(&watch);
                    Ok(json!({ "ok": true }))
                }
                None => Err(Failure::new("unknown_watch", format!("no watch {watch}"))),
            },
            Command::Book(req) => {
                let receipt = self.engine.bookings().book(&self.session, &req).await?;
                Ok(json!({ "ok": true, "booking": receipt }))
            }
            Command::Cancel(target) => {
                let config = self.engine.config();
                let key = match target {
                    CancelTarget::Path { path } => parse_path(&path, config)?,
                    CancelTarget::Parts { date, slot, table } => build_key(&date, &slot, &table, config)?,
                };
                match self.engine.cancellations().cancel(&key).await? {
                    CancelOutcome::Removed(record) => {
                        if self.session.owner_token().as_ref() != Some(&record.booked_by) {
                            warn!(
                                "{key} cancelled by {:?}, booked by {}",
                                self.session.identity(),
                                record.booked_by
                            );
                        }
                        Ok(json!({ "ok": true, "removed": true, "booking": record }))
                    }
                    CancelOutcome::AlreadyAbsent => Ok(json!({ "ok": true, "removed": false })),
                }
            }
            Command::Mine => {
                let bookings = self.engine.ownership().find_bookings_for(&self.session).await?;
                Ok(json!({ "ok": true, "bookings": bookings }))
            }
            Command::WatchMine => {
                self.check_watch_limit()?;
                let id = Ulid::new();
                let mailbox = self.mailbox.clone();
                let watch = self
                    .engine
                    .ownership()
                    .subscribe(&self.session, move |bookings| {
                        mailbox.post(
                            id,
                            json!({
                                "event": "bookings",
                                "watch": id,
                                "bookings": bookings,
                            }),
                        );
                    })
                    .await?;
                self.watches.insert(id, (WatchKind::Bookings, watch));
                Ok(json!({ "ok": true, "watch": id }))
            }
        }
    }

    fn check_watch_limit(&self) -> Result<(), Failure> {
        if self.watches.len() >= MAX_WATCHES_PER_CONNECTION {
            return Err(Failure::new(
                "limit_exceeded",
                format!("at most {MAX_WATCHES_PER_CONNECTION} watches per connection"),
            ));
        }
        Ok(())
    }

    /// Ownership watches belong to the identity that opened them.
    async fn drop_booking_watches(&mut self) {
        let ids: Vec<Ulid> = self
            .watches
            .iter()
            .filter(|(_, (kind, _))| *kind == WatchKind::Bookings)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            if let Some((_, watch)) = self.watches.remove(&id) {
                watch.unsubscribe().await;
                self.mailbox.discard(&id);
            }
        }
    }

    async fn close(&mut self) {
        for (_, (_, watch)) in self.watches.drain() {
            watch.unsubscribe().await;
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (mut sink, mut lines) = framed.split();
    let mailbox = Arc::new(PushMailbox::default());
    let mut conn = Connection {
        engine,
        session: Session::anonymous(),
        watches: HashMap::new(),
        mailbox: mailbox.clone(),
    };

    let result = loop {
        tokio::select! {
            line = lines.next() => {
                let reply = match line {
                    None => break Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => conn.handle_line(&line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Failure::new("malformed", format!("line exceeds {MAX_LINE_LEN} bytes")).reply()
                    }
                    Some(Err(e)) => break Err(e),
                };
                if let Err(e) = sink.send(reply.to_string()).await {
                    break Err(e);
                }
            }
            _ = mailbox.ready.notified() => {
                let mut failed = None;
                for push in mailbox.take_all() {
                    if let Err(e) = sink.send(push.to_string()).await {
                        failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = failed {
                    break Err(e);
                }
            }
        }
    };

    conn.close().await;
    result
}
