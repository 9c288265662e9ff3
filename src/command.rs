//! Client requests: one JSON object per line, selected by its `"op"` field.
//!
//! ```text
//! {"op":"login","identity":"a.b@x.com"}
//! {"op":"availability","date":"2025-03-10"}
//! {"op":"availability","date":"2025-03-10","slot":"1:00 PM"}
//! {"op":"watch","date":"2025-03-10"}
//! {"op":"unwatch","watch":"01J..."}
//! {"op":"book","date":"2025-03-10","slot":"1:00 PM","table":"table1",
//!  "name":"Ada","contact":"5551234567","guests":"2"}
//! {"op":"cancel","date":"2025-03-10","slot":"1:00 PM","table":"table1"}
//! {"op":"cancel","path":"reservations/2025-03-10/1:00 PM/table1"}
//! {"op":"mine"}
//! {"op":"watch_mine"}
//! {"op":"logout"}
//! ```

use serde::Deserialize;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::BookingRequest;
use crate::limits::MAX_LINE_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Login {
        identity: String,
    },
    Logout,
    Availability {
        date: String,
        #[serde(default)]
        slot: Option<String>,
    },
    Watch {
        date: String,
    },
    Unwatch {
        watch: Ulid,
    },
    Book(BookingRequest),
    Cancel(CancelTarget),
    Mine,
    WatchMine,
}

/// A reservation named either by its parts or by its full path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CancelTarget {
    Path {
        path: String,
    },
    Parts {
        date: String,
        slot: String,
        table: String,
    },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("request exceeds {} bytes", MAX_LINE_LEN)]
    TooLong,
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    if line.len() > MAX_LINE_LEN {
        return Err(CommandError::TooLong);
    }
    Ok(serde_json::from_str(line.trim())?)
}
