//! SQL object naming for DSL-declared entities.
//!
//! Entity names are free-form in the catalogue (`VAT Rate`) but become SQL
//! identifiers when they name side tables and aggregate functions
//! (`vat_rate_v1`, `get_vat_rate_v1_aggregate`). Anything that survives the
//! snake-case conversion still has to match the identifier grammar before it
//! is embedded in generated SQL.

use core::fmt;
use std::{error::Error, sync::OnceLock};

use convert_case::{Case, Casing};
use error_stack::Report;
use regex::Regex;

/// A name could not be rendered as a SQL identifier.
#[derive(Debug)]
#[must_use]
pub struct InvalidIdentifier;

impl fmt::Display for InvalidIdentifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("name is not representable as a SQL identifier")
    }
}

impl Error for InvalidIdentifier {}

pub(crate) const IDENTIFIER_PATTERN: &str = "^[a-z][a-z0-9_]*$";

pub(crate) fn identifier_regex() -> &'static Regex {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER.get_or_init(|| Regex::new(IDENTIFIER_PATTERN).expect("hardcoded pattern is valid"))
}

fn checked_snake(name: &str) -> Result<String, Report<InvalidIdentifier>> {
    let snake = name.to_case(Case::Snake);
    if identifier_regex().is_match(&snake) {
        Ok(snake)
    } else {
        Err(Report::new(InvalidIdentifier).attach_printable(name.to_owned()))
    }
}

/// The side table holding an entity version's rows, e.g. `vat_rate_v1`.
pub(crate) fn entity_table_name(
    name: &str,
    version: i32,
) -> Result<String, Report<InvalidIdentifier>> {
    Ok(format!("{}_v{version}", checked_snake(name)?))
}

/// The generated point-in-time aggregate function, e.g.
/// `get_vat_rate_v1_aggregate`.
pub(crate) fn aggregate_function_name(
    name: &str,
    version: i32,
) -> Result<String, Report<InvalidIdentifier>> {
    Ok(format!("get_{}_v{version}_aggregate", checked_snake(name)?))
}

/// Double-quotes a field for use in generated SQL. Only call with names that
/// already match [`IDENTIFIER_PATTERN`].
pub(crate) fn quote_field(field: &str) -> String {
    format!("\"{field}\"")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn free_form_names_become_sql_identifiers() {
        assert_eq!(entity_table_name("VAT Rate", 1).expect("valid"), "vat_rate_v1");
        assert_eq!(
            aggregate_function_name("VAT Rate", 2).expect("valid"),
            "get_vat_rate_v2_aggregate"
        );
        assert_eq!(entity_table_name("park", 1).expect("valid"), "park_v1");
    }

    #[test]
    fn hostile_names_are_rejected_or_sanitised() {
        assert!(entity_table_name("1st", 1).is_err());
        assert!(entity_table_name("", 1).is_err());
        // Punctuation never survives the conversion, so nothing hostile can
        // reach generated SQL.
        assert_eq!(
            entity_table_name("drop table; --", 1).expect("sanitised"),
            "drop_table_v1"
        );
    }
}
