use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::keys::{OwnerToken, ReservationKey};

/// One occupied table at one date/slot. Created once, deleted once, never
/// mutated. Field names follow the persisted JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub booked_by: OwnerToken,
    pub name: String,
    pub contact: String,
    #[serde(deserialize_with = "lenient_number::deserialize")]
    pub guests: u8,
    pub table_number: String,
    pub date: NaiveDate,
    pub slot: String,
}

/// `table -> record` under one slot.
pub type TableMap = BTreeMap<String, Reservation>;

/// `slot -> table -> record` under one date.
pub type SlotMap = BTreeMap<String, TableMap>;

/// The whole `reservations` tree (or the part of it a scope covers).
pub type ReservationTree = BTreeMap<NaiveDate, SlotMap>;

/// The event types. This is the WAL record format and the change-feed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        key: ReservationKey,
        record: Reservation,
    },
    ReservationDeleted {
        key: ReservationKey,
    },
}

impl Event {
    pub fn key(&self) -> &ReservationKey {
        match self {
            Event::ReservationCreated { key, .. } | Event::ReservationDeleted { key } => key,
        }
    }
}

/// Counts that arrive as either a JSON number or a numeric string.
/// Binary formats always carry the plain number.
pub(crate) mod lenient_number {
    use std::str::FromStr;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + FromStr,
    {
        if !deserializer.is_human_readable() {
            return T::deserialize(deserializer);
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<T> {
            Number(T),
            Text(String),
        }

        match Raw::<T>::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("expected a number, got {s:?}"))),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: String,
    pub occupied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub slot: String,
    pub tables: Vec<TableStatus>,
    /// Every configured table under this slot holds a record.
    pub fully_booked: bool,
}

impl SlotStatus {
    pub fn is_occupied(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.table == table && t.occupied)
    }
}

/// Occupancy of every configured slot/table on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilitySnapshot {
    pub date: NaiveDate,
    pub slots: Vec<SlotStatus>,
}

impl AvailabilitySnapshot {
    pub fn slot(&self, label: &str) -> Option<&SlotStatus> {
        self.slots.iter().find(|s| s.slot == label)
    }

    pub fn is_fully_booked(&self, slot: &str) -> bool {
        self.slot(slot).is_some_and(|s| s.fully_booked)
    }

    pub fn is_occupied(&self, slot: &str, table: &str) -> bool {
        self.slot(slot).is_some_and(|s| s.is_occupied(table))
    }
}

/// A reservation attributed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnedBooking {
    pub key: ReservationKey,
    pub record: Reservation,
    /// Approximate un-sanitized owner, for display only.
    pub display_owner: String,
}

/// What a successful booking wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingReceipt {
    pub key: ReservationKey,
    pub record: Reservation,
}
