//! `fby` manages slowly-changing reference data (tax rates, country tables,
//! park catalogues, …) as an append-only, temporally-versioned history in
//! PostgreSQL.
//!
//! Administrators author migrations (raw SQL or declarative YAML documents)
//! which compile into entities, projections, change sets, and per-entity
//! aggregate functions. Consumers ask "what did the world look like,
//! according to projection P, at change set C?" and always get a stable,
//! content-addressable answer; hooks notify them when a projection's
//! underlying data changes.
//!
//! ```no_run
//! use fby::{Fby, FbyConfig};
//!
//! # async fn run() {
//! let config: FbyConfig = serde_yaml::from_str(
//!     "
//!     database:
//!       host: localhost
//!       database: reference
//!     migrations: ./migrations
//!     ",
//! )
//! .expect("valid configuration");
//!
//! let framework = Fby::connect(config).await.expect("database reachable");
//! framework.init().await.expect("migrations apply");
//! framework.subscribe("VAT Rate Changed", |event| async move {
//!     println!("projection {} changed", event.projection.name);
//!     Ok(())
//! });
//! framework.start().await;
//!
//! let projection = framework
//!     .projection("VAT Rates", 1)
//!     .await
//!     .expect("query succeeds")
//!     .expect("projection is defined by the migrations");
//! if let Some(change_set) = framework
//!     .current_change_set(&projection)
//!     .await
//!     .expect("query succeeds")
//! {
//!     let rates = framework
//!         .aggregate("VAT Rate", 1, change_set.id)
//!         .await
//!         .expect("aggregate function exists");
//!     println!("{rates:?}");
//! }
//! # }
//! ```

pub mod config;
pub mod dsl;
pub mod event_bus;
pub mod migration;
pub mod model;
pub mod notification;
pub mod store;

mod fby;

pub use self::{
    config::{DatabaseConnectionInfo, DatabasePoolConfig, FbyConfig, NotificationConfig},
    dsl::ValidationError,
    event_bus::{EventBus, HookEvent, SubscriberError},
    fby::{Fby, NukeHook},
    model::{
        ChangeSet, DataFrameAction, Entity, Hook, Notification, NotificationStatus, Projection,
    },
    notification::NotificationError,
    store::{
        AsClient, InsertionError, MigrationError, PostgresStore, PostgresStorePool, QueryError,
        StoreError,
    },
};
