//! Row-level model of the framework tables.
//!
//! All identifiers are `SERIAL` integers. Change sets and data frames are
//! append-only; the ordering authority across change sets is
//! `(effective ASC, id ASC)`, which relies on the database never reusing ids.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio_postgres::Row;

/// A named, versioned view binding a set of entity versions together for
/// consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub id: i32,
    pub name: String,
    pub version: i32,
}

impl Projection {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            version: row.get("version"),
        }
    }
}

/// A versioned schema for a category of reference rows (e.g. VAT Rate v1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i32,
    pub name: String,
    pub version: i32,
}

impl Entity {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            name: row.get("name"),
            version: row.get("version"),
        }
    }
}

/// An atomic, effective-dated revision boundary.
///
/// `entity_tag` is assigned by a database trigger on insert: 20 random hex
/// characters, usable as a weak ETag. It is opaque and not a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: i32,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub effective: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub entity_tag: String,
}

impl ChangeSet {
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            id: row.get("id"),
            description: row.get("description"),
            effective: row.get("effective"),
            last_modified: row.get("last_modified"),
            entity_tag: row.get("entity_tag"),
        }
    }
}

/// Whether a data frame asserts or retracts the identified row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFrameAction {
    Post,
    Delete,
}

impl DataFrameAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for DataFrameAction {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for DataFrameAction {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

/// A subscription tying an event to a projection, or to all projections when
/// `projection_id` is `NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    pub id: i32,
    pub name: String,
    pub event: String,
    pub projection_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Ok,
}

/// A durable unit of work: fire one hook for one projection.
///
/// At most one `PENDING` and one `OK` row exist per `(hook, projection)` at
/// any instant; the unique index on `(hook_id, projection_id, status)`
/// collapses duplicate scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i32,
    pub hook_id: i32,
    pub projection_id: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
    pub attempts: i32,
    pub status: NotificationStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempted: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_action_round_trips_through_sql_text() {
        assert_eq!(DataFrameAction::Post.as_str(), "POST");
        assert_eq!(DataFrameAction::Delete.as_str(), "DELETE");
        assert_eq!("POST".parse(), Ok(DataFrameAction::Post));
        assert_eq!("DELETE".parse(), Ok(DataFrameAction::Delete));
        assert!("PATCH".parse::<DataFrameAction>().is_err());
    }
}
