use thiserror::Error;

use crate::keys::KeyError;
use crate::store::StoreError;

/// Why a booking request was refused before touching the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("name is required")]
    EmptyName,
    #[error("name is longer than {0} bytes")]
    NameTooLong(usize),
    #[error("identity is longer than {0} bytes")]
    IdentityTooLong(usize),
    #[error("contact must be exactly {0} digits")]
    InvalidContact(usize),
    #[error("guests must be between {min} and {max}, got {got}")]
    GuestsOutOfRange { min: u8, max: u8, got: String },
    #[error("no table selected")]
    NoTableSelected,
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("slot starts in {minutes_ahead} minutes; at least {required_minutes} minutes notice is required")]
    TooSoon {
        minutes_ahead: i64,
        required_minutes: u64,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BookingError {
    #[error("invalid booking: {0}")]
    Validation(#[from] ValidationError),
    #[error("{table} is already booked for this slot")]
    AlreadyBooked { table: String },
    #[error("sign in before booking")]
    NotAuthenticated,
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl BookingError {
    /// Stable machine-readable tag, also used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingError::Validation(_) => "validation",
            BookingError::AlreadyBooked { .. } => "already_booked",
            BookingError::NotAuthenticated => "not_authenticated",
            BookingError::StorageFailure(_) => "storage_failure",
        }
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        BookingError::StorageFailure(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CancelError {
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl From<StoreError> for CancelError {
    fn from(e: StoreError) -> Self {
        CancelError::StorageFailure(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OwnershipError {
    #[error("sign in to see your bookings")]
    NotAuthenticated,
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl From<StoreError> for OwnershipError {
    fn from(e: StoreError) -> Self {
        OwnershipError::StorageFailure(e.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AvailabilityError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl From<StoreError> for AvailabilityError {
    fn from(e: StoreError) -> Self {
        AvailabilityError::StorageFailure(e.to_string())
    }
}
