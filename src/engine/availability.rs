use std::sync::Arc;

use chrono::NaiveDate;

use crate::config::EngineConfig;
use crate::keys::KeyError;
use crate::model::*;
use crate::store::{ReservationStore, Scope, StoreError};

use super::watch::Watch;
use super::{bounded, AvailabilityError};

/// Occupancy of every configured slot and table on `date`, recomputed from
/// scratch. `None` means the date has no records at all.
///
/// Records under slots or tables that are no longer configured do not count.
pub fn derive_availability(
    config: &EngineConfig,
    date: NaiveDate,
    subtree: Option<&SlotMap>,
) -> AvailabilitySnapshot {
    let slots = config
        .slots
        .iter()
        .map(|slot| {
            let booked = subtree.and_then(|s| s.get(slot));
            let tables: Vec<TableStatus> = config
                .tables
                .iter()
                .map(|table| TableStatus {
                    table: table.clone(),
                    occupied: booked.is_some_and(|t| t.contains_key(table)),
                })
                .collect();
            let fully_booked = tables.iter().all(|t| t.occupied);
            SlotStatus {
                slot: slot.clone(),
                tables,
                fully_booked,
            }
        })
        .collect();
    AvailabilitySnapshot { date, slots }
}

/// Read-only view of which tables are taken. Never writes.
#[derive(Clone)]
pub struct AvailabilityTracker {
    store: Arc<dyn ReservationStore>,
    config: Arc<EngineConfig>,
}

impl AvailabilityTracker {
    pub fn new(store: Arc<dyn ReservationStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub async fn current(&self, date: NaiveDate) -> Result<AvailabilitySnapshot, AvailabilityError> {
        Ok(load(&self.store, &self.config, date).await?)
    }

    /// Status of every table in one slot.
    pub async fn table_status(
        &self,
        date: NaiveDate,
        slot: &str,
    ) -> Result<SlotStatus, AvailabilityError> {
        if !self.config.has_slot(slot) {
            return Err(KeyError::UnknownSlot(slot.to_string()).into());
        }
        let snapshot = self.current(date).await?;
        snapshot
            .slots
            .into_iter()
            .find(|s| s.slot == slot)
            .ok_or_else(|| KeyError::UnknownSlot(slot.to_string()).into())
    }

    /// Deliver the current snapshot for `date` to `on_update`, then a fresh
    /// one after every change under that date.
    ///
    /// The first callback runs before this returns.
    pub async fn subscribe<F>(
        &self,
        date: NaiveDate,
        mut on_update: F,
    ) -> Result<Watch, AvailabilityError>
    where
        F: FnMut(AvailabilitySnapshot) + Send + 'static,
    {
        // Subscribe before the initial read so no change can slip between them.
        let feed = self.store.subscribe(&Scope::Date(date))?;
        on_update(self.current(date).await?);

        let store = self.store.clone();
        let config = self.config.clone();
        Ok(Watch::spawn(
            feed,
            move || {
                let store = store.clone();
                let config = config.clone();
                async move { load(&store, &config, date).await }
            },
            on_update,
        ))
    }
}

async fn load(
    store: &Arc<dyn ReservationStore>,
    config: &EngineConfig,
    date: NaiveDate,
) -> Result<AvailabilitySnapshot, StoreError> {
    let tree = bounded(config.store_timeout, "snapshot", store.snapshot(&Scope::Date(date))).await?;
    Ok(derive_availability(config, date, tree.get(&date)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::sanitize_identity;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn record(slot: &str, table: &str) -> Reservation {
        Reservation {
            booked_by: sanitize_identity("a@x.com"),
            name: "Ada".into(),
            contact: "5551234567".into(),
            guests: 2,
            table_number: table.into(),
            date: day(),
            slot: slot.into(),
        }
    }

    fn subtree(entries: &[(&str, &str)]) -> SlotMap {
        let mut slots = SlotMap::new();
        for (slot, table) in entries {
            slots
                .entry(slot.to_string())
                .or_default()
                .insert(table.to_string(), record(slot, table));
        }
        slots
    }

    #[test]
    fn missing_date_is_all_free() {
        let config = EngineConfig::default();
        let snapshot = derive_availability(&config, day(), None);
        assert_eq!(snapshot.slots.len(), 4);
        for slot in &snapshot.slots {
            assert!(!slot.fully_booked);
            assert!(slot.tables.iter().all(|t| !t.occupied));
        }
    }

    #[test]
    fn one_table_marks_only_that_table() {
        let config = EngineConfig::default();
        let slots = subtree(&[("1:00 PM", "table1")]);
        let snapshot = derive_availability(&config, day(), Some(&slots));

        assert!(snapshot.is_occupied("1:00 PM", "table1"));
        assert!(!snapshot.is_occupied("1:00 PM", "table2"));
        assert!(!snapshot.is_fully_booked("1:00 PM"));
        assert!(!snapshot.is_occupied("2:00 PM", "table1"));
    }

    #[test]
    fn every_table_taken_is_fully_booked() {
        let config = EngineConfig::default();
        let slots = subtree(&[("1:00 PM", "table1"), ("1:00 PM", "table2")]);
        let snapshot = derive_availability(&config, day(), Some(&slots));
        assert!(snapshot.is_fully_booked("1:00 PM"));
        assert!(!snapshot.is_fully_booked("12:00 PM"));
    }

    #[test]
    fn unknown_slots_and_tables_are_ignored() {
        let config = EngineConfig::default();
        let slots = subtree(&[("9:00 PM", "table1"), ("1:00 PM", "patio")]);
        let snapshot = derive_availability(&config, day(), Some(&slots));
        assert!(snapshot.slot("9:00 PM").is_none());
        assert!(snapshot.slots.iter().all(|s| s.tables.iter().all(|t| !t.occupied)));
    }

    #[test]
    fn table_count_follows_configuration() {
        let config = EngineConfig {
            tables: vec!["a".into(), "b".into(), "c".into()],
            ..EngineConfig::default()
        };
        let slots = subtree(&[("1:00 PM", "a"), ("1:00 PM", "b")]);
        let snapshot = derive_availability(&config, day(), Some(&slots));
        let status = snapshot.slot("1:00 PM").unwrap();
        assert_eq!(status.tables.len(), 3);
        assert!(!status.fully_booked);
    }
}
