use error_stack::{Report, ResultExt};
use tokio_postgres::{Client, GenericClient, Transaction};

use crate::{
    dsl::names,
    model::{ChangeSet, Entity, Projection},
    store::{AsClient, QueryError, StoreError},
};

/// Framework DDL, applied idempotently at `init` before user migrations run.
const BOOTSTRAP: &str = include_str!("schema/bootstrap.sql");
const ROUTINES: &str = include_str!("schema/routines.sql");
const TEARDOWN: &str = include_str!("schema/teardown.sql");

/// Advisory lock key taken by exclusive transactions ("fby" in ASCII).
const EXCLUSIVE_LOCK_KEY: i64 = 0x0066_6279;

/// A Postgres-backed reference data store.
pub struct PostgresStore<C> {
    pub(crate) client: C,
}

impl<C> PostgresStore<C> {
    #[must_use]
    pub const fn new(client: C) -> Self {
        Self { client }
    }
}

impl<C> PostgresStore<C>
where
    C: AsClient,
{
    /// The underlying database client, for queries outside the framework's
    /// own surface.
    #[must_use]
    pub fn as_client(&self) -> &C::Client {
        self.client.as_client()
    }

    /// Mutable access to the underlying client.
    #[must_use]
    pub fn as_mut_client(&mut self) -> &mut C::Client {
        self.client.as_mut_client()
    }

    /// Returns all projections, ordered by `(name, version)`.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn projections(&self) -> Result<Vec<Projection>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query(
                "
                SELECT id, name, version
                FROM fby_projection
                ORDER BY name ASC, version ASC;
                ",
                &[],
            )
            .await
            .change_context(QueryError)?
            .iter()
            .map(Projection::from_row)
            .collect())
    }

    /// Looks up a single projection version.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn projection(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<Projection>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "
                SELECT id, name, version
                FROM fby_projection
                WHERE name = $1 AND version = $2;
                ",
                &[&name, &version],
            )
            .await
            .change_context(QueryError)
            .attach_printable_lazy(|| format!("{name} v{version}"))?
            .as_ref()
            .map(Projection::from_row))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn projection_by_id(
        &self,
        id: i32,
    ) -> Result<Option<Projection>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "
                SELECT id, name, version
                FROM fby_projection
                WHERE id = $1;
                ",
                &[&id],
            )
            .await
            .change_context(QueryError)?
            .as_ref()
            .map(Projection::from_row))
    }

    /// Looks up a single entity version.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn entity(
        &self,
        name: &str,
        version: i32,
    ) -> Result<Option<Entity>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "
                SELECT id, name, version
                FROM fby_entity
                WHERE name = $1 AND version = $2;
                ",
                &[&name, &version],
            )
            .await
            .change_context(QueryError)
            .attach_printable_lazy(|| format!("{name} v{version}"))?
            .as_ref()
            .map(Entity::from_row))
    }

    /// Returns all entity versions, ordered by `(name, version)`.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn entities(&self) -> Result<Vec<Entity>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query(
                "
                SELECT id, name, version
                FROM fby_entity
                ORDER BY name ASC, version ASC;
                ",
                &[],
            )
            .await
            .change_context(QueryError)?
            .iter()
            .map(Entity::from_row)
            .collect())
    }

    /// Returns every change set containing at least one data frame for any
    /// entity the projection depends on, in `(effective ASC, id ASC)` order,
    /// de-duplicated by change-set id.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self, projection), fields(projection = %projection.name))]
    pub async fn change_log(
        &self,
        projection: &Projection,
    ) -> Result<Vec<ChangeSet>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query(
                "
                SELECT c.id, c.description, c.effective, c.last_modified, c.entity_tag
                FROM fby_change_set c
                WHERE EXISTS (
                    SELECT 1
                    FROM fby_data_frame f
                    INNER JOIN fby_projection_entity pe ON pe.entity_id = f.entity_id
                    WHERE f.change_set_id = c.id AND pe.projection_id = $1
                )
                ORDER BY c.effective ASC, c.id ASC;
                ",
                &[&projection.id],
            )
            .await
            .change_context(QueryError)
            .attach_printable_lazy(|| projection.name.clone())?
            .iter()
            .map(ChangeSet::from_row)
            .collect())
    }

    /// Looks up a change set by id.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_set(&self, id: i32) -> Result<Option<ChangeSet>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "
                SELECT id, description, effective, last_modified, entity_tag
                FROM fby_change_set
                WHERE id = $1;
                ",
                &[&id],
            )
            .await
            .change_context(QueryError)?
            .as_ref()
            .map(ChangeSet::from_row))
    }

    /// The last entry of the projection's change log whose `effective` is not
    /// in the future.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    #[tracing::instrument(level = "debug", skip(self, projection), fields(projection = %projection.name))]
    pub async fn current_change_set(
        &self,
        projection: &Projection,
    ) -> Result<Option<ChangeSet>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "
                SELECT c.id, c.description, c.effective, c.last_modified, c.entity_tag
                FROM fby_change_set c
                WHERE c.effective <= now()
                  AND EXISTS (
                    SELECT 1
                    FROM fby_data_frame f
                    INNER JOIN fby_projection_entity pe ON pe.entity_id = f.entity_id
                    WHERE f.change_set_id = c.id AND pe.projection_id = $1
                )
                ORDER BY c.effective DESC, c.id DESC
                LIMIT 1;
                ",
                &[&projection.id],
            )
            .await
            .change_context(QueryError)
            .attach_printable_lazy(|| projection.name.clone())?
            .as_ref()
            .map(ChangeSet::from_row))
    }

    /// Reads the aggregate of an entity at a change set through the generated
    /// `get_<entity>_v<version>_aggregate` function. Rows come back as JSON
    /// objects keyed by the entity's declared fields.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the entity name is not a valid identifier or the
    ///   aggregate function does not exist.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn aggregate(
        &self,
        entity_name: &str,
        entity_version: i32,
        change_set_id: i32,
    ) -> Result<Vec<serde_json::Value>, Report<QueryError>> {
        let function = names::aggregate_function_name(entity_name, entity_version)
            .change_context(QueryError)?;
        let statement = format!("SELECT to_jsonb(t) AS row FROM {function}($1) t;");

        Ok(self
            .as_client()
            .query(statement.as_str(), &[&change_set_id])
            .await
            .change_context(QueryError)
            .attach_printable_lazy(|| function.clone())?
            .iter()
            .map(|row| row.get("row"))
            .collect())
    }
}

impl<C> PostgresStore<C>
where
    C: AsClient<Client = Client>,
{
    /// Starts a transaction scoped to this connection.
    ///
    /// Dropping the returned store without [`commit`]ing rolls the
    /// transaction back.
    ///
    /// # Errors
    ///
    /// - if the underlying client cannot start a transaction.
    ///
    /// [`commit`]: PostgresStore::commit
    pub async fn transaction(
        &mut self,
    ) -> Result<PostgresStore<Transaction<'_>>, Report<StoreError>> {
        Ok(PostgresStore::new(
            self.client
                .as_mut_client()
                .transaction()
                .await
                .change_context(StoreError)?,
        ))
    }
}

impl PostgresStore<Transaction<'_>> {
    /// # Errors
    ///
    /// - if the underlying client cannot commit the transaction.
    pub async fn commit(self) -> Result<(), Report<StoreError>> {
        self.client.commit().await.change_context(StoreError)
    }

    /// # Errors
    ///
    /// - if the underlying client cannot roll back the transaction.
    pub async fn rollback(self) -> Result<(), Report<StoreError>> {
        self.client.rollback().await.change_context(StoreError)
    }

    /// Serialises this transaction against every other exclusive transaction
    /// in the cluster. The lock is released at commit or rollback.
    ///
    /// # Errors
    ///
    /// - if the lock cannot be taken.
    pub async fn acquire_cluster_lock(&self) -> Result<(), Report<StoreError>> {
        self.client
            .execute("SELECT pg_advisory_xact_lock($1);", &[&EXCLUSIVE_LOCK_KEY])
            .await
            .change_context(StoreError)?;
        Ok(())
    }

    /// Creates the framework tables, triggers, and notification routines.
    /// Safe to re-run; everything is `IF NOT EXISTS` / `OR REPLACE`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn bootstrap(&self) -> Result<(), Report<StoreError>> {
        self.client
            .batch_execute(BOOTSTRAP)
            .await
            .change_context(StoreError)
            .attach_printable("failed to create framework tables")?;
        self.client
            .batch_execute(ROUTINES)
            .await
            .change_context(StoreError)
            .attach_printable("failed to create framework routines")?;
        Ok(())
    }

    /// Whether the framework tables exist in this database.
    pub(crate) async fn framework_installed(&self) -> Result<bool, Report<StoreError>> {
        Ok(self
            .client
            .query_one("SELECT to_regclass('fby_entity')::TEXT;", &[])
            .await
            .change_context(StoreError)?
            .get::<_, Option<String>>(0)
            .is_some())
    }

    /// Drops the side table and aggregate function of every known entity.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn drop_entity_objects(&self) -> Result<(), Report<StoreError>> {
        for entity in self.entities().await.change_context(StoreError)? {
            let table = names::entity_table_name(&entity.name, entity.version)
                .change_context(StoreError)?;
            let function = names::aggregate_function_name(&entity.name, entity.version)
                .change_context(StoreError)?;
            self.client
                .batch_execute(&format!(
                    "DROP FUNCTION IF EXISTS {function}(INT); DROP TABLE IF EXISTS {table} CASCADE;"
                ))
                .await
                .change_context(StoreError)
                .attach_printable_lazy(|| table.clone())?;
        }
        Ok(())
    }

    /// Drops the framework tables, routines, and migration bookkeeping.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn drop_framework(&self) -> Result<(), Report<StoreError>> {
        self.client
            .batch_execute(TEARDOWN)
            .await
            .change_context(StoreError)
            .attach_printable("failed to drop framework tables")
    }
}
