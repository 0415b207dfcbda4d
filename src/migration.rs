//! The ordered, idempotent migration applier.
//!
//! Scans a directory for `NNN.<slug>.sql` and `NNN.<slug>.yaml` files, applies
//! each exactly once in ascending numeric order, and records provenance in
//! `fby_migration`. SQL files execute verbatim; YAML files go through the DSL
//! compiler. Each file applies inside one transaction, so partial application
//! is impossible.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use error_stack::{Report, ResultExt};
use regex::Regex;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio_postgres::{Client, GenericClient, Transaction};

use crate::{
    dsl,
    store::{AsClient, MigrationError, PostgresStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Raw SQL, executed verbatim.
    Sql,
    /// A YAML DSL document.
    Dsl,
}

/// A migration file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub number: i32,
    pub name: String,
    pub kind: MigrationKind,
    pub path: PathBuf,
    pub checksum: String,
    contents: String,
}

/// A bookkeeping row from `fby_migration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub number: i32,
    pub name: String,
    pub checksum: String,
    pub applied_at: OffsetDateTime,
}

fn file_name_regex() -> &'static Regex {
    static FILE_NAME: OnceLock<Regex> = OnceLock::new();
    FILE_NAME.get_or_init(|| {
        Regex::new(r"^(\d+)\.(.+)\.(sql|ya?ml)$").expect("hardcoded pattern is valid")
    })
}

fn parse_file_name(file_name: &str) -> Option<(i32, String, MigrationKind)> {
    let captures = file_name_regex().captures(file_name)?;
    let number = captures.get(1)?.as_str().parse().ok()?;
    let name = captures.get(2)?.as_str().to_owned();
    let kind = match captures.get(3)?.as_str() {
        "sql" => MigrationKind::Sql,
        _ => MigrationKind::Dsl,
    };
    Some((number, name, kind))
}

pub(crate) fn checksum(contents: &str) -> String {
    format!("{:x}", Sha256::digest(contents.as_bytes()))
}

/// Discovers migration files in `directory`, ordered by number.
///
/// Files that do not match `NNN.<slug>.{sql,yaml}` are ignored. Two files
/// sharing a number is a fatal error.
///
/// # Errors
///
/// - [`MigrationError`] if the directory cannot be read or the order is
///   ambiguous.
#[tracing::instrument]
pub async fn discover(directory: &Path) -> Result<Vec<MigrationFile>, Report<MigrationError>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(directory)
        .await
        .change_context(MigrationError)
        .attach_printable_lazy(|| directory.display().to_string())?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .change_context(MigrationError)?
    {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some((number, name, kind)) = parse_file_name(file_name) else {
            tracing::debug!(file = file_name, "ignoring non-migration file");
            continue;
        };

        let contents = tokio::fs::read_to_string(entry.path())
            .await
            .change_context(MigrationError)
            .attach_printable_lazy(|| entry.path().display().to_string())?;

        files.push(MigrationFile {
            number,
            name,
            kind,
            path: entry.path(),
            checksum: checksum(&contents),
            contents,
        });
    }

    files.sort_by(|left, right| left.number.cmp(&right.number));
    for window in files.windows(2) {
        if window[0].number == window[1].number {
            return Err(Report::new(MigrationError).attach_printable(format!(
                "migrations '{}' and '{}' share number {}",
                window[0].path.display(),
                window[1].path.display(),
                window[0].number,
            )));
        }
    }

    Ok(files)
}

impl<C> PostgresStore<C>
where
    C: AsClient,
{
    /// Returns the recorded provenance of every applied migration.
    ///
    /// # Errors
    ///
    /// - [`MigrationError`] if the bookkeeping table cannot be read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn applied_migrations(
        &self,
    ) -> Result<Vec<AppliedMigration>, Report<MigrationError>> {
        Ok(self
            .as_client()
            .query(
                "
                SELECT number, name, checksum, applied_at
                FROM fby_migration
                ORDER BY number ASC;
                ",
                &[],
            )
            .await
            .change_context(MigrationError)?
            .iter()
            .map(|row| AppliedMigration {
                number: row.get("number"),
                name: row.get("name"),
                checksum: row.get("checksum"),
                applied_at: row.get("applied_at"),
            })
            .collect())
    }

    async fn recorded_checksum(
        &self,
        number: i32,
    ) -> Result<Option<String>, Report<MigrationError>> {
        Ok(self
            .as_client()
            .query_opt("SELECT checksum FROM fby_migration WHERE number = $1;", &[&number])
            .await
            .change_context(MigrationError)?
            .map(|row| row.get(0)))
    }
}

impl<C> PostgresStore<C>
where
    C: AsClient<Client = Client>,
{
    /// Applies each not-yet-recorded file in order, one transaction per file.
    ///
    /// Already-recorded files with a matching checksum are skipped; a
    /// checksum mismatch is fatal.
    ///
    /// # Errors
    ///
    /// - [`MigrationError`] on mismatch or on any failure while applying; the
    ///   failing file's transaction is rolled back.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(
        &mut self,
        files: &[MigrationFile],
    ) -> Result<usize, Report<MigrationError>> {
        let mut applied = 0;

        for file in files {
            match self.recorded_checksum(file.number).await? {
                Some(ref recorded) if *recorded == file.checksum => {
                    tracing::debug!(number = file.number, name = %file.name, "already applied");
                    continue;
                }
                Some(recorded) => {
                    return Err(Report::new(MigrationError).attach_printable(format!(
                        "checksum of '{}' changed since it was applied (recorded {recorded}, \
                         found {})",
                        file.path.display(),
                        file.checksum,
                    )));
                }
                None => {}
            }

            let transaction = self.transaction().await.change_context(MigrationError)?;
            match transaction.apply_migration(file).await {
                Ok(()) => transaction.commit().await.change_context(MigrationError)?,
                Err(report) => {
                    if let Err(rollback_error) = transaction.rollback().await {
                        tracing::error!(?rollback_error, "failed to roll back migration");
                    }
                    return Err(report.attach_printable(file.path.display().to_string()));
                }
            }
            applied += 1;
        }

        Ok(applied)
    }
}

impl PostgresStore<Transaction<'_>> {
    async fn apply_migration(&self, file: &MigrationFile) -> Result<(), Report<MigrationError>> {
        tracing::info!(number = file.number, name = %file.name, "applying migration");

        match file.kind {
            MigrationKind::Sql => self
                .client
                .batch_execute(&file.contents)
                .await
                .change_context(MigrationError)?,
            MigrationKind::Dsl => {
                let document = dsl::parse(&file.contents).change_context(MigrationError)?;
                self.apply_document(&document)
                    .await
                    .change_context(MigrationError)?;
            }
        }

        self.client
            .execute(
                "INSERT INTO fby_migration (number, name, checksum) VALUES ($1, $2, $3);",
                &[&file.number, &file.name, &file.checksum],
            )
            .await
            .change_context(MigrationError)?;

        Ok(())
    }
}
