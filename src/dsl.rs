//! The declarative migration language.
//!
//! A YAML document is a mapping from instruction name to instruction list;
//! four instructions are recognised: `define_entities`, `add_projections`,
//! `add_change_set`, and `add_hooks`. Documents are validated structurally
//! before any SQL is emitted and compile into relational state plus one
//! generated aggregate function per entity version.

pub mod document;

mod apply;
mod compile;
pub(crate) mod names;
mod validate;

use core::fmt;
use std::error::Error;

use error_stack::Report;

pub use self::document::Document;

/// A structural violation in a DSL document.
///
/// The message is deterministic and machine-matchable:
/// `/<instruction>/<index>[/<path>] must …`, e.g.
/// `/add_change_set/0 must have required property 'effective'`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ValidationError {
    pointer: String,
    detail: String,
}

impl ValidationError {
    pub(crate) fn new(pointer: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            detail: detail.into(),
        }
    }

    /// The `/<instruction>/<index>[/<path>]` pointer into the document.
    #[must_use]
    pub fn pointer(&self) -> &str {
        &self.pointer
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pointer.is_empty() {
            fmt.write_str(&self.detail)
        } else {
            write!(fmt, "{} {}", self.pointer, self.detail)
        }
    }
}

impl Error for ValidationError {}

/// Parses and validates a DSL document.
///
/// # Errors
///
/// - [`ValidationError`] carrying the first violation as context; any further
///   violations are attached to the report.
pub fn parse(source: &str) -> Result<Document, Report<ValidationError>> {
    let value: serde_yaml::Value = serde_yaml::from_str(source).map_err(|error| {
        Report::new(ValidationError::new("", format!("must be valid YAML ({error})")))
    })?;

    validate::validate(&value)?;

    serde_yaml::from_value(value).map_err(|error| {
        Report::new(ValidationError::new("", format!("must be a valid document ({error})")))
    })
}
