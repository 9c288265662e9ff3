use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;
use thiserror::Error;

use crate::keys::is_path_segment;
use crate::limits::*;

/// Slot labels of the reference deployment.
pub const DEFAULT_SLOTS: [&str; 4] = ["12:00 PM", "1:00 PM", "2:00 PM", "3:00 PM"];

/// Tables of the reference deployment.
pub const DEFAULT_TABLES: [&str; 2] = ["table1", "table2"];

/// How slot labels are read as a time of day.
pub const SLOT_LABEL_FORMAT: &str = "%I:%M %p";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no slots configured")]
    NoSlots,
    #[error("no tables configured")]
    NoTables,
    #[error("too many {0} configured")]
    TooMany(&'static str),
    #[error("duplicate slot label: {0}")]
    DuplicateSlot(String),
    #[error("duplicate table id: {0}")]
    DuplicateTable(String),
    #[error("slot label {0:?} is not a time of day like \"1:00 PM\"")]
    BadSlotLabel(String),
    #[error("{0:?} cannot be used as a path segment")]
    BadSegment(String),
    #[error("guest bound {min}..={max} is empty or admits zero guests")]
    BadGuestBound { min: u8, max: u8 },
    #[error("contact digit count must be positive")]
    BadContactDigits,
    #[error("store timeout must be positive")]
    BadStoreTimeout,
    #[error("{var}: cannot parse {value:?}")]
    BadEnv { var: &'static str, value: String },
}

/// Everything the engine needs to know about the restaurant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bookable slot labels, in display order.
    pub slots: Vec<String>,
    /// Bookable table ids, in display order.
    pub tables: Vec<String>,
    /// A slot must start at least this long after "now" to be bookable.
    pub min_lead_time: Duration,
    pub min_guests: u8,
    pub max_guests: u8,
    /// Exact number of digits in a contact number.
    pub contact_digits: usize,
    /// Upper bound on any single store round-trip.
    pub store_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS.iter().map(|s| s.to_string()).collect(),
            tables: DEFAULT_TABLES.iter().map(|s| s.to_string()).collect(),
            min_lead_time: Duration::from_secs(3600),
            min_guests: 1,
            max_guests: 6,
            contact_digits: 10,
            store_timeout: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Build from `RESERVO_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup over the defaults, then validate.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(slots) = lookup("RESERVO_SLOTS") {
            config.slots = split_list(&slots);
        }
        if let Some(tables) = lookup("RESERVO_TABLES") {
            config.tables = split_list(&tables);
        }
        if let Some(mins) = parse_var::<u64>(&lookup, "RESERVO_LEAD_TIME_MINS")? {
            config.min_lead_time = Duration::from_secs(mins * 60);
        }
        if let Some(min) = parse_var(&lookup, "RESERVO_MIN_GUESTS")? {
            config.min_guests = min;
        }
        if let Some(max) = parse_var(&lookup, "RESERVO_MAX_GUESTS")? {
            config.max_guests = max;
        }
        if let Some(digits) = parse_var(&lookup, "RESERVO_CONTACT_DIGITS")? {
            config.contact_digits = digits;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RESERVO_STORE_TIMEOUT_MS")? {
            config.store_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots.is_empty() {
            return Err(ConfigError::NoSlots);
        }
        if self.tables.is_empty() {
            return Err(ConfigError::NoTables);
        }
        if self.slots.len() > MAX_SLOTS {
            return Err(ConfigError::TooMany("slots"));
        }
        if self.tables.len() > MAX_TABLES {
            return Err(ConfigError::TooMany("tables"));
        }

        let mut seen = HashSet::new();
        for slot in &self.slots {
            if !is_path_segment(slot) {
                return Err(ConfigError::BadSegment(slot.clone()));
            }
            if parse_slot_label(slot).is_none() {
                return Err(ConfigError::BadSlotLabel(slot.clone()));
            }
            if !seen.insert(slot.as_str()) {
                return Err(ConfigError::DuplicateSlot(slot.clone()));
            }
        }

        seen.clear();
        for table in &self.tables {
            if !is_path_segment(table) {
                return Err(ConfigError::BadSegment(table.clone()));
            }
            if !seen.insert(table.as_str()) {
                return Err(ConfigError::DuplicateTable(table.clone()));
            }
        }

        if self.min_guests == 0 || self.min_guests > self.max_guests {
            return Err(ConfigError::BadGuestBound {
                min: self.min_guests,
                max: self.max_guests,
            });
        }
        if self.contact_digits == 0 {
            return Err(ConfigError::BadContactDigits);
        }
        if self.store_timeout.is_zero() {
            return Err(ConfigError::BadStoreTimeout);
        }
        Ok(())
    }

    pub fn has_slot(&self, slot: &str) -> bool {
        self.slots.iter().any(|s| s == slot)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    /// Start time of a configured slot.
    pub fn slot_time(&self, slot: &str) -> Option<NaiveTime> {
        if !self.has_slot(slot) {
            return None;
        }
        parse_slot_label(slot)
    }

    pub fn guest_range(&self) -> RangeInclusive<u8> {
        self.min_guests..=self.max_guests
    }
}

pub fn parse_slot_label(label: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(label.trim(), SLOT_LABEL_FORMAT).ok()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::BadEnv { var, value }),
    }
}
