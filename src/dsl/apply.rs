//! Executes a validated [`Document`] inside a migration transaction.
//!
//! Either every instruction in the document commits or none does; the caller
//! owns the transaction and rolls back on any error.

use error_stack::{Report, ResultExt};
use tokio_postgres::{error::SqlState, Transaction};

use crate::{
    dsl::{
        compile,
        document::{ChangeSetDef, Document, EntityDef, FrameDef, HookDef, ProjectionDef},
        names,
    },
    store::{InsertionError, PostgresStore},
};

fn insertion_report(error: tokio_postgres::Error) -> Report<InsertionError> {
    Report::new(error).change_context(InsertionError)
}

impl PostgresStore<Transaction<'_>> {
    /// Applies every instruction of the document: entities, projections,
    /// hooks, then change sets.
    ///
    /// # Errors
    ///
    /// - [`InsertionError`] on the first failing instruction. Constraint
    ///   violations keep the database error (and its [`SqlState`]) in the
    ///   report chain.
    #[tracing::instrument(level = "debug", skip_all)]
    pub(crate) async fn apply_document(
        &self,
        document: &Document,
    ) -> Result<(), Report<InsertionError>> {
        for entity in &document.define_entities {
            self.define_entity(entity).await?;
        }
        for projection in &document.add_projections {
            self.add_projection(projection).await?;
        }
        // Hooks go in before any frames so the notify trigger sees them.
        for hook in &document.add_hooks {
            self.add_hook(hook).await?;
        }
        for change_set in &document.add_change_set {
            self.add_change_set(change_set).await?;
        }
        Ok(())
    }

    async fn define_entity(&self, entity: &EntityDef) -> Result<(), Report<InsertionError>> {
        let inserted = self
            .client
            .execute(
                "
                INSERT INTO fby_entity (name, version)
                VALUES ($1, $2)
                ON CONFLICT (name, version) DO NOTHING;
                ",
                &[&entity.name, &entity.version],
            )
            .await
            .map_err(insertion_report)?;

        if inserted == 0 {
            tracing::debug!(name = %entity.name, version = entity.version, "entity already defined");
            return Ok(());
        }

        let table = compile::side_table_ddl(entity).change_context(InsertionError)?;
        self.client
            .batch_execute(&table)
            .await
            .map_err(insertion_report)
            .attach_printable_lazy(|| format!("{} v{}", entity.name, entity.version))?;

        let aggregate = compile::aggregate_function_ddl(entity).change_context(InsertionError)?;
        self.client
            .batch_execute(&aggregate)
            .await
            .map_err(insertion_report)
            .attach_printable_lazy(|| format!("{} v{}", entity.name, entity.version))?;

        Ok(())
    }

    async fn add_projection(
        &self,
        projection: &ProjectionDef,
    ) -> Result<(), Report<InsertionError>> {
        let row = self
            .client
            .query_one(
                "
                INSERT INTO fby_projection (name, version)
                VALUES ($1, $2)
                RETURNING id;
                ",
                &[&projection.name, &projection.version],
            )
            .await
            .map_err(|error| {
                if matches!(error.code(), Some(&SqlState::UNIQUE_VIOLATION)) {
                    Report::new(error)
                        .attach_printable(format!(
                            "projection '{}' v{} is already defined",
                            projection.name, projection.version
                        ))
                        .change_context(InsertionError)
                } else {
                    insertion_report(error)
                }
            })?;
        let projection_id: i32 = row.get(0);

        for dependency in &projection.dependencies {
            let entity = self
                .entity(&dependency.entity, dependency.version)
                .await
                .change_context(InsertionError)?
                .ok_or_else(|| {
                    Report::new(InsertionError).attach_printable(format!(
                        "projection '{}' v{} depends on unknown entity '{}' v{}",
                        projection.name, projection.version, dependency.entity, dependency.version
                    ))
                })?;

            self.client
                .execute(
                    "
                    INSERT INTO fby_projection_entity (projection_id, entity_id)
                    VALUES ($1, $2)
                    ON CONFLICT DO NOTHING;
                    ",
                    &[&projection_id, &entity.id],
                )
                .await
                .map_err(insertion_report)?;
        }

        Ok(())
    }

    async fn add_change_set(
        &self,
        change_set: &ChangeSetDef,
    ) -> Result<(), Report<InsertionError>> {
        let effective = change_set
            .effective_timestamp()
            .change_context(InsertionError)?;

        let row = self
            .client
            .query_one(
                "
                INSERT INTO fby_change_set (description, effective)
                VALUES ($1, $2)
                RETURNING id;
                ",
                &[&change_set.description, &effective],
            )
            .await
            .map_err(insertion_report)?;
        let change_set_id: i32 = row.get(0);

        for frame in &change_set.frames {
            self.add_frame(change_set_id, frame).await?;
        }

        Ok(())
    }

    async fn add_frame(
        &self,
        change_set_id: i32,
        frame: &FrameDef,
    ) -> Result<(), Report<InsertionError>> {
        let entity = self
            .entity(&frame.entity, frame.version)
            .await
            .change_context(InsertionError)?
            .ok_or_else(|| {
                Report::new(InsertionError).attach_printable(format!(
                    "data frame references unknown entity '{}' v{}",
                    frame.entity, frame.version
                ))
            })?;
        let table =
            names::entity_table_name(&frame.entity, frame.version).change_context(InsertionError)?;
        let action = frame.action.as_str();

        for row in &frame.data {
            let frame_row = self
                .client
                .query_one(
                    "
                    INSERT INTO fby_data_frame (change_set_id, entity_id, action)
                    VALUES ($1, $2, $3)
                    RETURNING id;
                    ",
                    &[&change_set_id, &entity.id, &action],
                )
                .await
                .map_err(insertion_report)?;
            let frame_id: i32 = frame_row.get(0);

            let insert =
                compile::frame_row_insert(&table, frame_id, row).change_context(InsertionError)?;
            self.client
                .batch_execute(&insert)
                .await
                .map_err(insertion_report)
                .attach_printable_lazy(|| table.clone())?;
        }

        Ok(())
    }

    async fn add_hook(&self, hook: &HookDef) -> Result<(), Report<InsertionError>> {
        let projection_id = match (&hook.projection, hook.version) {
            (Some(name), Some(version)) => Some(
                self.projection(name, version)
                    .await
                    .change_context(InsertionError)?
                    .ok_or_else(|| {
                        Report::new(InsertionError).attach_printable(format!(
                            "hook '{}' references unknown projection '{name}' v{version}",
                            hook.name
                        ))
                    })?
                    .id,
            ),
            (None, None) => None,
            _ => {
                return Err(Report::new(InsertionError).attach_printable(format!(
                    "hook '{}' must name both projection and version, or neither",
                    hook.name
                )));
            }
        };

        self.client
            .execute(
                "
                INSERT INTO fby_hook (name, event, projection_id)
                VALUES ($1, $2, $3);
                ",
                &[&hook.name, &hook.event, &projection_id],
            )
            .await
            .map_err(|error| {
                if matches!(error.code(), Some(&SqlState::UNIQUE_VIOLATION)) {
                    Report::new(error)
                        .attach_printable(format!("hook '{}' is already registered", hook.name))
                        .change_context(InsertionError)
                } else {
                    insertion_report(error)
                }
            })?;

        Ok(())
    }
}
