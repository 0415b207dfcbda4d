use core::fmt;

use std::error::Error;

/// The store could not be reached or a connection-level operation failed.
///
/// Raised by pool construction and transaction control; a `StoreError` out of
/// `connect` or `init` is fatal for the caller.
#[derive(Debug)]
pub struct StoreError;

impl fmt::Display for StoreError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("the reference data store connection failed")
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone)]
#[must_use]
pub struct QueryError;

impl fmt::Display for QueryError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("failed to read from the reference data store")
    }
}

impl Error for QueryError {}

/// A write was rejected by the database.
///
/// Constraint violations keep the originating [`tokio_postgres::Error`] in the
/// report chain, so callers can discriminate on its [`SqlState`] code.
///
/// [`SqlState`]: tokio_postgres::error::SqlState
#[derive(Debug)]
#[must_use]
pub struct InsertionError;

impl fmt::Display for InsertionError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("the reference data write was rejected")
    }
}

impl Error for InsertionError {}

/// A migration could not be applied: checksum mismatch, ordering conflict, or
/// a failure while executing the file. The migration transaction rolls back.
#[derive(Debug)]
pub struct MigrationError;

impl fmt::Display for MigrationError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("could not bring the reference data schema up to date")
    }
}

impl Error for MigrationError {}
