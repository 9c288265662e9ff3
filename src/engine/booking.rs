use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::keys::{build_key, ReservationKey};
use crate::limits::{MAX_IDENTITY_LEN, MAX_NAME_LEN};
use crate::model::{BookingReceipt, Reservation};
use crate::observability::{BOOKINGS_TOTAL, BOOKING_DURATION_SECONDS};
use crate::session::Session;
use crate::store::{CreateOutcome, ReservationStore, StoreError};

use super::{bounded, BookingError, Clock, ValidationError};

/// What a diner fills in. Fields stay raw until validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BookingRequest {
    pub date: String,
    pub slot: String,
    #[serde(default)]
    pub table: Option<String>,
    pub name: String,
    pub contact: String,
    pub guests: GuestCount,
}

/// Party size as the diner sent it: a JSON number, a numeric string, or
/// anything else. Only validation decides whether it is acceptable.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum GuestCount {
    Number(serde_json::Number),
    Text(String),
    Other(serde_json::Value),
}

impl GuestCount {
    /// The count as a whole number, if it is one. `4`, `4.0` and `" 4 "` all qualify.
    pub fn whole(&self) -> Option<i64> {
        match self {
            GuestCount::Number(n) => n.as_i64().or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && f.abs() <= i64::MAX as f64)
                    .map(|f| f as i64)
            }),
            GuestCount::Text(s) => s.trim().parse().ok(),
            GuestCount::Other(_) => None,
        }
    }
}

impl From<u32> for GuestCount {
    fn from(n: u32) -> Self {
        GuestCount::Number(n.into())
    }
}

impl fmt::Display for GuestCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestCount::Number(n) => write!(f, "{n}"),
            GuestCount::Text(s) => write!(f, "{s:?}"),
            GuestCount::Other(v) => write!(f, "{v}"),
        }
    }
}

/// Where a single attempt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingPhase {
    Validating,
    Checking,
    Committing,
    Confirmed,
    Rejected,
}

impl fmt::Display for BookingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BookingPhase::Validating => "validating",
            BookingPhase::Checking => "checking",
            BookingPhase::Committing => "committing",
            BookingPhase::Confirmed => "confirmed",
            BookingPhase::Rejected => "rejected",
        })
    }
}

/// A request that passed validation: the key to claim and the record to put there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBooking {
    pub key: ReservationKey,
    pub record: Reservation,
}

/// Validates booking attempts and commits them with a single atomic
/// create-if-absent. Two diners racing for the same table get exactly one
/// success; the other sees `AlreadyBooked`.
#[derive(Clone)]
pub struct BookingCoordinator {
    store: Arc<dyn ReservationStore>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl BookingCoordinator {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    /// Local checks only; never touches the store.
    pub fn validate(
        &self,
        session: &Session,
        req: &BookingRequest,
    ) -> Result<PreparedBooking, BookingError> {
        let identity = session.identity().ok_or(BookingError::NotAuthenticated)?;
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(ValidationError::IdentityTooLong(MAX_IDENTITY_LEN).into());
        }

        let name = req.name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ValidationError::NameTooLong(MAX_NAME_LEN).into());
        }

        let digits = self.config.contact_digits;
        if req.contact.len() != digits || !req.contact.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::InvalidContact(digits).into());
        }

        let (min, max) = (self.config.min_guests, self.config.max_guests);
        let guests = req
            .guests
            .whole()
            .and_then(|g| u8::try_from(g).ok())
            .filter(|g| self.config.guest_range().contains(g))
            .ok_or_else(|| ValidationError::GuestsOutOfRange {
                min,
                max,
                got: req.guests.to_string(),
            })?;

        let table = req
            .table
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::NoTableSelected)?;

        let key = build_key(&req.date, &req.slot, table, &self.config).map_err(ValidationError::from)?;
        self.check_lead_time(&key)?;

        let record = Reservation {
            booked_by: session
                .owner_token()
                .ok_or(BookingError::NotAuthenticated)?,
            name: name.to_string(),
            contact: req.contact.clone(),
            guests,
            table_number: key.table.clone(),
            date: key.date,
            slot: key.slot.clone(),
        };
        Ok(PreparedBooking { key, record })
    }

    fn check_lead_time(&self, key: &ReservationKey) -> Result<(), ValidationError> {
        // build_key already checked the slot is configured, and configured
        // labels always parse.
        let Some(start_time) = self.config.slot_time(&key.slot) else {
            return Err(crate::keys::KeyError::UnknownSlot(key.slot.clone()).into());
        };
        let start = NaiveDateTime::new(key.date, start_time);
        let ahead = start - self.clock.now();
        // Negative lead (slot already started) does not convert.
        let too_soon = ahead
            .to_std()
            .map_or(true, |lead| lead < self.config.min_lead_time);
        if too_soon {
            return Err(ValidationError::TooSoon {
                minutes_ahead: ahead.num_minutes(),
                required_minutes: self.config.min_lead_time.as_secs() / 60,
            });
        }
        Ok(())
    }

    /// Validate, check, and atomically commit one booking.
    pub async fn book(
        &self,
        session: &Session,
        req: &BookingRequest,
    ) -> Result<BookingReceipt, BookingError> {
        let attempt = Ulid::new();
        let started = Instant::now();
        let result = self.run(attempt, session, req).await;

        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(e) => e.kind(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(BOOKING_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(
        &self,
        attempt: Ulid,
        session: &Session,
        req: &BookingRequest,
    ) -> Result<BookingReceipt, BookingError> {
        debug!(%attempt, phase = %BookingPhase::Validating, "booking {} {}", req.date, req.slot);
        let prepared = self
            .validate(session, req)
            .inspect_err(|e| reject(attempt, BookingPhase::Validating, e))?;
        let PreparedBooking { key, record } = prepared;
        let limit = self.config.store_timeout;

        debug!(%attempt, phase = %BookingPhase::Checking, "{key}");
        let existing = bounded(limit, "read", self.store.read(&key))
            .await
            .map_err(BookingError::from)
            .inspect_err(|e| reject(attempt, BookingPhase::Checking, e))?;
        if existing.is_some() {
            let err = BookingError::AlreadyBooked {
                table: key.table.clone(),
            };
            reject(attempt, BookingPhase::Checking, &err);
            return Err(err);
        }

        debug!(%attempt, phase = %BookingPhase::Committing, "{key}");
        let outcome = bounded(limit, "create", self.store.create_if_absent(&key, record.clone()))
            .await
            .map_err(|e| match e {
                // The store may still finish the write after we stop waiting.
                StoreError::Unavailable(msg) => {
                    BookingError::StorageFailure(format!("{msg}; outcome unknown, check before retrying"))
                }
                other => BookingError::from(other),
            })
            .inspect_err(|e| reject(attempt, BookingPhase::Committing, e))?;
        match outcome {
            CreateOutcome::Created => {
                info!(%attempt, phase = %BookingPhase::Confirmed, "booked {key} for {}", record.booked_by);
                Ok(BookingReceipt { key, record })
            }
            CreateOutcome::Exists(winner) => {
                let err = BookingError::AlreadyBooked {
                    table: key.table.clone(),
                };
                debug!(%attempt, "lost {key} to {}", winner.booked_by);
                reject(attempt, BookingPhase::Committing, &err);
                Err(err)
            }
        }
    }
}

fn reject(attempt: Ulid, during: BookingPhase, err: &BookingError) {
    match err {
        BookingError::StorageFailure(_) => {
            warn!(%attempt, phase = %BookingPhase::Rejected, %during, "{err}")
        }
        _ => debug!(%attempt, phase = %BookingPhase::Rejected, %during, "{err}"),
    }
}
