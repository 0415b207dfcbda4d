//! The notification dispatcher.
//!
//! A persistent, at-least-once worker loop: poll `fby_get_next_notification`
//! inside a transaction, fire the matching event on the in-process bus, and
//! mark the notification passed or reschedule it with exponential full-jitter
//! backoff. Multiple dispatcher processes are safe; the dequeue function uses
//! `FOR UPDATE SKIP LOCKED` and rows are handled one per transaction.

use core::{fmt, time::Duration};
use std::{error::Error, sync::Arc};

use error_stack::{Report, ResultExt};
use rand::Rng;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinHandle};
use tokio_postgres::{GenericClient, Transaction};

use crate::{
    config::NotificationConfig,
    event_bus::{EventBus, HookEvent},
    model::{Notification, NotificationStatus},
    store::{AsClient, PostgresStore, PostgresStorePool, QueryError},
};

/// Base of the exponential backoff: retry `n` waits up to `2^n` times this.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(1_000);

/// A notification could not be dispatched. Never fatal: the row stays
/// PENDING and is retried with backoff until it poisons out.
#[derive(Debug)]
#[must_use]
pub struct NotificationError;

impl fmt::Display for NotificationError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("could not dispatch notification")
    }
}

impl Error for NotificationError {}

/// One unit of work handed out by `fby_get_next_notification`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingNotification {
    pub id: i32,
    pub hook_id: i32,
    pub projection_id: i32,
    pub attempts: i32,
}

enum Polled {
    Dispatched,
    Idle,
}

pub(crate) struct Dispatcher {
    pool: Arc<PostgresStorePool>,
    bus: Arc<EventBus>,
    config: NotificationConfig,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        pool: Arc<PostgresStorePool>,
        bus: Arc<EventBus>,
        config: NotificationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(
            Self {
                pool,
                bus,
                config,
                shutdown,
            }
            .run(),
        )
    }

    async fn run(mut self) {
        if !self.sleep(self.config.initial_delay()).await {
            return;
        }

        loop {
            match self.poll_once().await {
                Ok(Polled::Dispatched) => {
                    // Drain eagerly; only idle polls wait for the interval.
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                Ok(Polled::Idle) => {
                    if !self.sleep(self.config.interval()).await {
                        break;
                    }
                }
                Err(report) => {
                    tracing::error!(?report, "notification poll failed");
                    if !self.sleep(self.config.interval()).await {
                        break;
                    }
                }
            }
        }

        tracing::debug!("notification dispatcher stopped");
    }

    /// Returns `false` when shutdown was signalled during the wait.
    async fn sleep(&mut self, duration: Duration) -> bool {
        if *self.shutdown.borrow() {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }

    async fn poll_once(&self) -> Result<Polled, Report<NotificationError>> {
        let mut store = self.pool.acquire().await.change_context(NotificationError)?;
        let transaction = store.transaction().await.change_context(NotificationError)?;

        let next = transaction
            .next_notification(self.config.max_attempts.try_into().unwrap_or(i32::MAX))
            .await
            .change_context(NotificationError)?;
        let Some(task) = next else {
            transaction.commit().await.change_context(NotificationError)?;
            return Ok(Polled::Idle);
        };

        match self.dispatch(&transaction, task).await {
            Ok(()) => {
                transaction
                    .pass_notification(task.id)
                    .await
                    .change_context(NotificationError)?;
            }
            Err(report) => {
                let delay = reschedule_delay(task.attempts, self.config.max_reschedule_delay());
                tracing::warn!(
                    notification = task.id,
                    attempts = task.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "delivery failed, rescheduling"
                );
                transaction
                    .fail_notification(
                        task.id,
                        OffsetDateTime::now_utc() + delay,
                        &report.to_string(),
                    )
                    .await
                    .change_context(NotificationError)?;
            }
        }

        transaction.commit().await.change_context(NotificationError)?;
        Ok(Polled::Dispatched)
    }

    async fn dispatch(
        &self,
        store: &PostgresStore<Transaction<'_>>,
        task: PendingNotification,
    ) -> Result<(), Report<NotificationError>> {
        let event = store
            .hook_event(task.hook_id)
            .await
            .change_context(NotificationError)?
            .ok_or_else(|| {
                Report::new(NotificationError)
                    .attach_printable(format!("hook {} no longer exists", task.hook_id))
            })?;
        let projection = store
            .projection_by_id(task.projection_id)
            .await
            .change_context(NotificationError)?
            .ok_or_else(|| {
                Report::new(NotificationError)
                    .attach_printable(format!("projection {} no longer exists", task.projection_id))
            })?;

        self.bus
            .emit(
                &event,
                &HookEvent {
                    event: event.clone(),
                    projection,
                    notification_id: task.id,
                    attempts: task.attempts,
                },
            )
            .await
            .change_context(NotificationError)
    }
}

/// Exponential backoff with full jitter: uniform in
/// `[0, min(cap, 2^attempts × base))`.
fn reschedule_delay(attempts: i32, cap: Duration) -> Duration {
    let exponent = u32::try_from(attempts).unwrap_or(0).min(32);
    let base_ms = u64::try_from(RETRY_BASE_DELAY.as_millis()).unwrap_or(u64::MAX);
    let ceiling_ms = base_ms.checked_shl(exponent).unwrap_or(u64::MAX);
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let upper = ceiling_ms.min(cap_ms).max(1);

    Duration::from_millis(rand::thread_rng().gen_range(0..upper))
}

impl<C> PostgresStore<C>
where
    C: AsClient,
{
    pub(crate) async fn next_notification(
        &self,
        max_attempts: i32,
    ) -> Result<Option<PendingNotification>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt(
                "SELECT id, hook_id, projection_id, attempts FROM fby_get_next_notification($1);",
                &[&max_attempts],
            )
            .await
            .change_context(QueryError)?
            .map(|row| PendingNotification {
                id: row.get("id"),
                hook_id: row.get("hook_id"),
                projection_id: row.get("projection_id"),
                attempts: row.get("attempts"),
            }))
    }

    pub(crate) async fn hook_event(
        &self,
        hook_id: i32,
    ) -> Result<Option<String>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query_opt("SELECT event FROM fby_hook WHERE id = $1;", &[&hook_id])
            .await
            .change_context(QueryError)?
            .map(|row| row.get(0)))
    }

    pub(crate) async fn pass_notification(&self, id: i32) -> Result<(), Report<QueryError>> {
        self.as_client()
            .execute("SELECT fby_pass_notification($1);", &[&id])
            .await
            .change_context(QueryError)?;
        Ok(())
    }

    pub(crate) async fn fail_notification(
        &self,
        id: i32,
        scheduled_for: OffsetDateTime,
        error: &str,
    ) -> Result<(), Report<QueryError>> {
        self.as_client()
            .execute(
                "SELECT fby_fail_notification($1, $2, $3);",
                &[&id, &scheduled_for, &error],
            )
            .await
            .change_context(QueryError)?;
        Ok(())
    }

    /// Returns every notification row, oldest first. Mostly useful for tests
    /// and operational inspection.
    ///
    /// # Errors
    ///
    /// - [`QueryError`] if the query fails.
    pub async fn notifications(&self) -> Result<Vec<Notification>, Report<QueryError>> {
        Ok(self
            .as_client()
            .query(
                "
                SELECT id, hook_id, projection_id, scheduled_for, attempts, status,
                       last_attempted, last_error
                FROM fby_notification
                ORDER BY id ASC;
                ",
                &[],
            )
            .await
            .change_context(QueryError)?
            .iter()
            .map(|row| Notification {
                id: row.get("id"),
                hook_id: row.get("hook_id"),
                projection_id: row.get("projection_id"),
                scheduled_for: row.get("scheduled_for"),
                attempts: row.get("attempts"),
                status: match row.get::<_, &str>("status") {
                    "OK" => NotificationStatus::Ok,
                    _ => NotificationStatus::Pending,
                },
                last_attempted: row.get("last_attempted"),
                last_error: row.get("last_error"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_the_exponential_ceiling() {
        for _ in 0..200 {
            let delay = reschedule_delay(0, Duration::from_millis(60_000));
            assert!(delay < Duration::from_millis(1_000));

            let delay = reschedule_delay(3, Duration::from_millis(60_000));
            assert!(delay < Duration::from_millis(8_000));
        }
    }

    #[test]
    fn backoff_is_capped_by_the_configured_maximum() {
        for _ in 0..200 {
            let delay = reschedule_delay(30, Duration::from_millis(5_000));
            assert!(delay < Duration::from_millis(5_000));
        }
    }

    #[test]
    fn backoff_survives_extreme_attempt_counts() {
        let delay = reschedule_delay(i32::MAX, Duration::from_millis(60_000));
        assert!(delay < Duration::from_millis(60_000));
        let delay = reschedule_delay(-1, Duration::from_millis(60_000));
        assert!(delay < Duration::from_millis(1_000));
    }
}
