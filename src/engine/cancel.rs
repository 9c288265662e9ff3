use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::keys::ReservationKey;
use crate::model::Reservation;
use crate::observability::CANCELLATIONS_TOTAL;
use crate::store::ReservationStore;

use super::{bounded, CancelError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Removed(Reservation),
    /// Nothing was there; the store is unchanged.
    AlreadyAbsent,
}

/// Deletes reservations by full key. Any caller may cancel any key; this
/// layer does not look at who booked it.
#[derive(Clone)]
pub struct CancellationManager {
    store: Arc<dyn ReservationStore>,
    config: Arc<EngineConfig>,
}

impl CancellationManager {
    pub fn new(store: Arc<dyn ReservationStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    pub async fn cancel(&self, key: &ReservationKey) -> Result<CancelOutcome, CancelError> {
        let removed = bounded(self.config.store_timeout, "delete", self.store.delete(key)).await?;
        let outcome = match removed {
            Some(record) => {
                info!("cancelled {key} (booked by {})", record.booked_by);
                CancelOutcome::Removed(record)
            }
            None => {
                debug!("cancel {key}: already absent");
                CancelOutcome::AlreadyAbsent
            }
        };
        let label = match outcome {
            CancelOutcome::Removed(_) => "removed",
            CancelOutcome::AlreadyAbsent => "absent",
        };
        metrics::counter!(CANCELLATIONS_TOTAL, "outcome" => label).increment(1);
        Ok(outcome)
    }
}
