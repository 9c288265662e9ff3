//! The reservation consistency engine: availability, booking arbitration,
//! cancellation and ownership, all on top of a [`ReservationStore`].

mod availability;
mod booking;
mod cancel;
mod error;
mod ownership;
mod watch;

pub use availability::{derive_availability, AvailabilityTracker};
pub use booking::{BookingCoordinator, BookingPhase, BookingRequest, GuestCount, PreparedBooking};
pub use cancel::{CancelOutcome, CancellationManager};
pub use error::*;
pub use ownership::{collect_owned, OwnershipResolver};
pub use watch::Watch;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};

use crate::config::EngineConfig;
use crate::store::{ReservationStore, StoreError};

/// Source of local wall-clock time for the lead-time rule.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

/// The host's local timezone. Dates and slot times are local, never UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock stuck at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

/// One store, one configuration, and the components built on them.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ReservationStore>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<dyn ReservationStore>, config: EngineConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ReservationStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config: Arc::new(config),
            clock,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    pub fn availability(&self) -> AvailabilityTracker {
        AvailabilityTracker::new(self.store.clone(), self.config.clone())
    }

    pub fn bookings(&self) -> BookingCoordinator {
        BookingCoordinator::new(self.store.clone(), self.config.clone(), self.clock.clone())
    }

    pub fn cancellations(&self) -> CancellationManager {
        CancellationManager::new(self.store.clone(), self.config.clone())
    }

    pub fn ownership(&self) -> OwnershipResolver {
        OwnershipResolver::new(self.store.clone(), self.config.clone())
    }
}

/// Run one store round-trip with a deadline. Running out of time is a store
/// failure like any other.
pub(crate) async fn bounded<T>(
    limit: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Unavailable(format!(
            "{op} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
