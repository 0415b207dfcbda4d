//! The framework facade: lifecycle, subscriptions, and the read API.

use core::time::Duration;
use std::sync::Arc;

use deadpool_postgres::Object;
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_postgres::{NoTls, Transaction};

use crate::{
    config::FbyConfig,
    event_bus::{EventBus, HookEvent, SubscriberError},
    migration,
    model::{ChangeSet, Projection},
    notification::Dispatcher,
    store::{MigrationError, PostgresStore, PostgresStorePool, QueryError, StoreError},
};

/// How long `stop` waits for the dispatcher to finish its current poll before
/// abandoning it. Abandoned work stays PENDING and is redelivered later.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Caller-supplied routine invoked by [`Fby::reset`] to drop objects the
/// framework cannot discover on its own (e.g. enums created from raw SQL
/// migrations). Runs inside the reset transaction.
pub type NukeHook = Box<
    dyn for<'c, 't> Fn(&'t Transaction<'c>) -> BoxFuture<'t, Result<(), Report<StoreError>>>
        + Send
        + Sync,
>;

struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A handle to the reference data framework.
///
/// Owns the connection pool, the in-process event bus, and (after
/// [`start`](Self::start)) the notification dispatcher task.
pub struct Fby {
    config: FbyConfig,
    pool: Arc<PostgresStorePool>,
    bus: Arc<EventBus>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    nuke_custom_objects: Option<NukeHook>,
}

impl Fby {
    /// Builds the connection pool and verifies the database is reachable.
    ///
    /// # Errors
    ///
    /// - [`StoreError`] if the pool cannot be built or no connection can be
    ///   acquired. This is fatal; nothing else works without a pool.
    pub async fn connect(config: FbyConfig) -> Result<Self, Report<StoreError>> {
        let pool = PostgresStorePool::new(&config.database, &config.pool, NoTls).await?;
        pool.acquire()
            .await
            .attach_printable("database unreachable")?;

        Ok(Self {
            config,
            pool: Arc::new(pool),
            bus: Arc::new(EventBus::new()),
            dispatcher: Mutex::new(None),
            nuke_custom_objects: None,
        })
    }

    /// Registers the routine [`reset`](Self::reset) uses to drop custom
    /// objects before the framework tables go.
    #[must_use]
    pub fn with_nuke_hook<F>(mut self, hook: F) -> Self
    where
        F: for<'c, 't> Fn(&'t Transaction<'c>) -> BoxFuture<'t, Result<(), Report<StoreError>>>
            + Send
            + Sync
            + 'static,
    {
        self.nuke_custom_objects = Some(Box::new(hook));
        self
    }

    /// Bootstraps the framework schema and applies pending migrations.
    ///
    /// Idempotent: re-running over an unchanged migration set is a no-op.
    ///
    /// # Errors
    ///
    /// - [`MigrationError`] on discovery or apply failure; the failing file's
    ///   transaction rolls back.
    #[tracing::instrument(skip(self))]
    pub async fn init(&self) -> Result<(), Report<MigrationError>> {
        let mut store = self.pool.acquire().await.change_context(MigrationError)?;

        let transaction = store.transaction().await.change_context(MigrationError)?;
        transaction
            .bootstrap()
            .await
            .change_context(MigrationError)?;
        transaction.commit().await.change_context(MigrationError)?;

        let files = migration::discover(&self.config.migrations).await?;
        let applied = store.migrate(&files).await?;
        tracing::info!(total = files.len(), applied, "migrations up to date");
        Ok(())
    }

    /// Launches the notification dispatcher. Optional for read-only
    /// consumers. Idempotent; a second call is a no-op.
    pub async fn start(&self) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            tracing::warn!("notification dispatcher is already running");
            return;
        }

        let (shutdown, receiver) = watch::channel(false);
        let task = Dispatcher::spawn(
            Arc::clone(&self.pool),
            Arc::clone(&self.bus),
            self.config.notifications.clone(),
            receiver,
        );
        *dispatcher = Some(DispatcherHandle { shutdown, task });
        tracing::info!("notification dispatcher started");
    }

    /// Signals the dispatcher, waits for the current poll to settle, and
    /// closes the pool. In-flight subscriber work outliving the grace period
    /// is abandoned; its notification stays PENDING.
    pub async fn stop(&self) {
        let handle = self.dispatcher.lock().await.take();
        if let Some(DispatcherHandle { shutdown, task }) = handle {
            let _ = shutdown.send(true);
            let mut task = task;
            tokio::select! {
                result = &mut task => {
                    if let Err(join_error) = result {
                        tracing::error!(?join_error, "notification dispatcher panicked");
                    }
                }
                () = tokio::time::sleep(SHUTDOWN_GRACE) => {
                    tracing::warn!("dispatcher did not drain in time, abandoning in-flight work");
                    task.abort();
                }
            }
        }
        self.pool.close();
    }

    /// Drops everything the framework and its migrations created, then
    /// re-runs `init`. Test-only by design.
    ///
    /// # Errors
    ///
    /// - [`MigrationError`] if the teardown or the re-migration fails.
    #[tracing::instrument(skip(self))]
    pub async fn reset(&self) -> Result<(), Report<MigrationError>> {
        let mut store = self.pool.acquire().await.change_context(MigrationError)?;
        let transaction = store.transaction().await.change_context(MigrationError)?;
        transaction
            .acquire_cluster_lock()
            .await
            .change_context(MigrationError)?;

        if transaction
            .framework_installed()
            .await
            .change_context(MigrationError)?
        {
            transaction
                .drop_entity_objects()
                .await
                .change_context(MigrationError)?;
            if let Some(nuke) = &self.nuke_custom_objects {
                nuke(&transaction.client)
                    .await
                    .change_context(MigrationError)
                    .attach_printable("nuke hook failed")?;
            }
            transaction
                .drop_framework()
                .await
                .change_context(MigrationError)?;
        }
        transaction.commit().await.change_context(MigrationError)?;

        self.init().await
    }

    /// Registers a handler for hook-driven events.
    pub fn subscribe<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
        Fut: core::future::Future<Output = Result<(), Report<SubscriberError>>> + Send + 'static,
    {
        self.bus.subscribe(event, handler);
    }

    /// Acquires a store from the pool for ad-hoc queries.
    ///
    /// # Errors
    ///
    /// - [`StoreError`] if no connection can be acquired.
    pub async fn store(&self) -> Result<PostgresStore<Object>, Report<StoreError>> {
        self.pool.acquire().await
    }

    /// Runs `f` inside a transaction: `BEGIN`, the body, then `COMMIT` on
    /// success or `ROLLBACK` on any error before re-raising.
    ///
    /// # Errors
    ///
    /// - whatever `f` raises, or [`StoreError`] on transaction control
    ///   failure.
    pub async fn with_transaction<T, F>(&self, f: F) -> Result<T, Report<StoreError>>
    where
        T: Send,
        F: for<'c, 't> FnOnce(
                &'t PostgresStore<Transaction<'c>>,
            ) -> BoxFuture<'t, Result<T, Report<StoreError>>>
            + Send,
    {
        self.transaction_scope(false, f).await
    }

    /// Like [`with_transaction`](Self::with_transaction), but serialises
    /// against every other exclusive transaction in the cluster by taking an
    /// advisory lock before the body runs. Used by tests and admin scripts.
    ///
    /// # Errors
    ///
    /// - whatever `f` raises, or [`StoreError`] on transaction control
    ///   failure.
    pub async fn with_exclusive_transaction<T, F>(&self, f: F) -> Result<T, Report<StoreError>>
    where
        T: Send,
        F: for<'c, 't> FnOnce(
                &'t PostgresStore<Transaction<'c>>,
            ) -> BoxFuture<'t, Result<T, Report<StoreError>>>
            + Send,
    {
        self.transaction_scope(true, f).await
    }

    async fn transaction_scope<T, F>(&self, exclusive: bool, f: F) -> Result<T, Report<StoreError>>
    where
        T: Send,
        F: for<'c, 't> FnOnce(
                &'t PostgresStore<Transaction<'c>>,
            ) -> BoxFuture<'t, Result<T, Report<StoreError>>>
            + Send,
    {
        let mut store = self.pool.acquire().await?;
        let transaction = store.transaction().await?;
        if exclusive {
            transaction.acquire_cluster_lock().await?;
        }

        match f(&transaction).await {
            Ok(value) => {
                transaction.commit().await?;
                Ok(value)
            }
            Err(report) => {
                if let Err(rollback_error) = transaction.rollback().await {
                    tracing::error!(?rollback_error, "failed to roll back transaction");
                }
                Err(report)
            }
        }
    }

    /// All projections, ordered by `(name, version)`.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn projections(&self) -> Result<Vec<Projection>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .projections()
            .await
    }

    /// Looks up a projection version.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn projection(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<Projection>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .projection(name, version)
            .await
    }

    /// The projection's change log in `(effective ASC, id ASC)` order.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn change_log(
        &self,
        projection: &Projection,
    ) -> Result<Vec<ChangeSet>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .change_log(projection)
            .await
    }

    /// Looks up a change set by id.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn change_set(&self, id: i32) -> Result<Option<ChangeSet>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .change_set(id)
            .await
    }

    /// The last change set of the projection whose `effective` is not in the
    /// future.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn current_change_set(
        &self,
        projection: &Projection,
    ) -> Result<Option<ChangeSet>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .current_change_set(projection)
            .await
    }

    /// Reads an entity's aggregate at a change set via its generated
    /// aggregate function.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn aggregate(
        &self,
        entity_name: &str,
        entity_version: i32,
        change_set_id: i32,
    ) -> Result<Vec<serde_json::Value>, Report<QueryError>> {
        self.store()
            .await
            .change_context(QueryError)?
            .aggregate(entity_name, entity_version, change_set_id)
            .await
    }
}
