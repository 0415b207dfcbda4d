//! The Postgres-backed storage layer.
//!
//! [`PostgresStorePool`] hands out [`PostgresStore`]s generic over
//! [`AsClient`], so the same query code runs on a pooled connection, a plain
//! client, or inside a transaction.

pub mod error;

mod pool;
mod postgres;

pub use self::{
    error::{InsertionError, MigrationError, QueryError, StoreError},
    pool::{AsClient, PostgresStorePool},
    postgres::PostgresStore,
};
