//! Storage paths and identity tokens.
//!
//! Every reservation lives at `reservations/{date}/{slot}/{table}`; the
//! `(date, slot, table)` triple is the record's unique key. Identities are
//! stored alongside the record as an [`OwnerToken`], never as part of a path.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;

/// Root of the reservation tree.
pub const ROOT: &str = "reservations";

/// Canonical date form used in paths and records.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Characters that may never appear inside a path segment.
const ILLEGAL_SEGMENT_CHARS: [char; 6] = ['.', '#', '$', '[', ']', '/'];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("date {0:?} is not in YYYY-MM-DD form")]
    InvalidDate(String),
    #[error("unknown slot: {0}")]
    UnknownSlot(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("malformed reservation path: {0}")]
    MalformedPath(String),
}

/// Sanitized identity stored in `bookedBy`.
///
/// `.` becomes `_` and `#`, `$`, `[`, `]` are dropped. This is deterministic
/// but lossy: `a.b@x.com` and `a_b@x_com` share a token, so tokens must be
/// compared with tokens and never turned back into identities for matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Best-effort display form (`_` back to `.`). Not an inverse of
    /// [`sanitize_identity`]; an identity that already contained `_` comes
    /// back with a `.` in its place.
    pub fn display_identity(&self) -> String {
        self.0.replace('_', ".")
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn sanitize_identity(raw: &str) -> OwnerToken {
    let token = raw
        .chars()
        .filter_map(|c| match c {
            '.' => Some('_'),
            '#' | '$' | '[' | ']' => None,
            other => Some(other),
        })
        .collect();
    OwnerToken(token)
}

/// True if `s` can be used verbatim as one segment of a store path.
pub fn is_path_segment(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_control() || ILLEGAL_SEGMENT_CHARS.contains(&c))
}

/// Parse a strictly canonical `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, KeyError> {
    let date = NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|_| KeyError::InvalidDate(raw.to_string()))?;
    // chrono accepts unpadded fields; the path form must be exact.
    if date.format(DATE_FORMAT).to_string() != raw {
        return Err(KeyError::InvalidDate(raw.to_string()));
    }
    Ok(date)
}

/// Path of a whole date subtree.
pub fn date_path(date: NaiveDate) -> String {
    format!("{ROOT}/{}", date.format(DATE_FORMAT))
}

/// Unique key of one bookable unit of capacity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationKey {
    pub date: NaiveDate,
    pub slot: String,
    pub table: String,
}

impl ReservationKey {
    /// Build a key whose slot and table are checked against the configuration.
    pub fn new(
        date: NaiveDate,
        slot: &str,
        table: &str,
        config: &EngineConfig,
    ) -> Result<Self, KeyError> {
        if !config.has_slot(slot) {
            return Err(KeyError::UnknownSlot(slot.to_string()));
        }
        if !config.has_table(table) {
            return Err(KeyError::UnknownTable(table.to_string()));
        }
        Ok(Self::from_parts(date, slot, table))
    }

    /// Key for a record already present in the store, whatever the current
    /// configuration says.
    pub(crate) fn from_parts(date: NaiveDate, slot: &str, table: &str) -> Self {
        Self {
            date,
            slot: slot.to_string(),
            table: table.to_string(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}/{}", date_path(self.date), self.slot, self.table)
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

pub fn build_key(
    date: &str,
    slot: &str,
    table: &str,
    config: &EngineConfig,
) -> Result<ReservationKey, KeyError> {
    let date = parse_date(date)?;
    ReservationKey::new(date, slot, table, config)
}

/// Inverse of [`ReservationKey::path`].
pub fn parse_path(path: &str, config: &EngineConfig) -> Result<ReservationKey, KeyError> {
    let malformed = || KeyError::MalformedPath(path.to_string());
    let mut parts = path.trim_matches('/').split('/');
    if parts.next() != Some(ROOT) {
        return Err(malformed());
    }
    let (Some(date), Some(slot), Some(table), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };
    build_key(date, slot, table, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn sanitize_replaces_dots_and_drops_illegal() {
        assert_eq!(sanitize_identity("a.b@x.com").as_str(), "a_b@x_com");
        assert_eq!(sanitize_identity("we#ird$[name]").as_str(), "weirdname");
        assert_eq!(sanitize_identity("plain").as_str(), "plain");
    }

    #[test]
    fn sanitize_is_deterministic() {
        assert_eq!(sanitize_identity("x.y@z.org"), sanitize_identity("x.y@z.org"));
    }

    #[test]
    fn display_identity_is_only_approximate() {
        assert_eq!(sanitize_identity("a.b@x.com").display_identity(), "a.b@x.com");
        // An underscore in the original identity is not recoverable.
        assert_eq!(sanitize_identity("first_last@x.com").display_identity(), "first.last@x.com");
        // ...and it collides with the dotted spelling.
        assert_eq!(sanitize_identity("a_b@x.com"), sanitize_identity("a.b@x.com"));
    }

    #[test]
    fn build_key_renders_path() {
        let key = build_key("2025-03-10", "1:00 PM", "table1", &config()).unwrap();
        assert_eq!(key.path(), "reservations/2025-03-10/1:00 PM/table1");
        assert_eq!(key.to_string(), key.path());
    }

    #[test]
    fn build_key_rejects_non_canonical_dates() {
        for bad in ["2025-3-10", "10-03-2025", "2025/03/10", "2025-02-30", ""] {
            assert_eq!(
                build_key(bad, "1:00 PM", "table1", &config()),
                Err(KeyError::InvalidDate(bad.to_string())),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn build_key_rejects_unknown_slot_and_table() {
        assert_eq!(
            build_key("2025-03-10", "5:00 PM", "table1", &config()),
            Err(KeyError::UnknownSlot("5:00 PM".into()))
        );
        assert_eq!(
            build_key("2025-03-10", "1:00 PM", "table3", &config()),
            Err(KeyError::UnknownTable("table3".into()))
        );
    }

    #[test]
    fn parse_path_inverts_path() {
        let key = build_key("2025-03-10", "12:00 PM", "table2", &config()).unwrap();
        assert_eq!(parse_path(&key.path(), &config()).unwrap(), key);
    }

    #[test]
    fn parse_path_rejects_partial_and_foreign_paths() {
        for bad in [
            "reservations/2025-03-10/1:00 PM",
            "reservations/2025-03-10/1:00 PM/table1/extra",
            "bookings/2025-03-10/1:00 PM/table1",
        ] {
            assert!(matches!(
                parse_path(bad, &config()),
                Err(KeyError::MalformedPath(_))
            ));
        }
    }

    #[test]
    fn path_segments() {
        assert!(is_path_segment("1:00 PM"));
        assert!(is_path_segment("table1"));
        assert!(!is_path_segment(""));
        assert!(!is_path_segment("a/b"));
        assert!(!is_path_segment("a.b"));
        assert!(!is_path_segment("[x]"));
    }
}
