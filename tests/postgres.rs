//! Database-backed tests for the full pipeline: migrations, the DSL
//! compiler, aggregation, and the notification dispatcher.
//!
//! These need a running Postgres instance (connection via `FBY_PG_*`
//! environment variables) and reset the database they run against, so they
//! are `#[ignore]`d by default. Run them single-threaded:
//!
//! ```sh
//! cargo test --test postgres -- --ignored --test-threads=1
//! ```

use std::time::{Duration, Instant};

use error_stack::{Report, ResultExt};
use fby::{
    DatabaseConnectionInfo, DatabasePoolConfig, Fby, FbyConfig, NotificationConfig,
    NotificationStatus, StoreError, SubscriberError,
};
use indoc::indoc;
use pretty_assertions::assert_eq;
use tokio_postgres::error::SqlState;

const DEFINE_VAT_RATES: &str = indoc! {"
    define_entities:
      - name: VAT Rate
        version: 1
        fields:
          - name: type
            type: TEXT
          - name: rate
            type: NUMERIC
        identified_by:
          - type
    add_projections:
      - name: VAT Rates
        version: 1
        dependencies:
          - entity: VAT Rate
            version: 1
"};

const THREE_CHANGE_SETS: &str = indoc! {"
    add_change_set:
      - description: 2020 rates
        effective: 2020-04-05T00:00:00Z
        frames:
          - entity: VAT Rate
            version: 1
            action: POST
            data:
              - type: standard
                rate: 0.10
              - type: reduced
                rate: 0.05
              - type: zero
                rate: 0
      - description: 2021 rates
        effective: 2021-04-05T00:00:00Z
        frames:
          - entity: VAT Rate
            version: 1
            action: POST
            data:
              - type: standard
                rate: 0.125
              - type: reduced
                rate: 0.07
              - type: zero
                rate: 0
      - description: 2022 rates
        effective: 2022-04-05T00:00:00Z
        frames:
          - entity: VAT Rate
            version: 1
            action: POST
            data:
              - type: standard
                rate: 0.15
              - type: reduced
                rate: 0.10
              - type: zero
                rate: 0
"};

fn init_logging() {
    // A second initialization attempt in the same process is fine to ignore.
    let _: Result<_, _> = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn connection_info_from_env() -> DatabaseConnectionInfo {
    DatabaseConnectionInfo::new(
        std::env::var("FBY_PG_USER").unwrap_or_else(|_| "postgres".to_owned()),
        std::env::var("FBY_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_owned()),
        std::env::var("FBY_PG_HOST").unwrap_or_else(|_| "localhost".to_owned()),
        std::env::var("FBY_PG_PORT").map_or(5432, |port| port.parse().expect("valid port")),
        std::env::var("FBY_PG_DATABASE").unwrap_or_else(|_| "fby".to_owned()),
    )
}

struct TestFramework {
    framework: Fby,
    _migrations: tempfile::TempDir,
}

/// Writes the given migrations to a scratch directory, connects, and resets
/// the database so every test starts from a clean slate.
async fn framework_with(migrations: &[(&str, &str)]) -> TestFramework {
    init_logging();

    let directory = tempfile::tempdir().expect("temp dir");
    for (name, contents) in migrations {
        std::fs::write(directory.path().join(name), contents).expect("write migration");
    }

    let config = FbyConfig {
        database: connection_info_from_env(),
        pool: DatabasePoolConfig::default(),
        migrations: directory.path().to_owned(),
        notifications: NotificationConfig {
            initial_delay: 0,
            interval: 50,
            max_attempts: 3,
            max_reschedule_delay: 200,
        },
    };

    let framework = Fby::connect(config).await.expect("database reachable");
    framework.reset().await.expect("reset succeeds");

    TestFramework {
        framework,
        _migrations: directory,
    }
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: core::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn rate_of(rows: &[serde_json::Value], rate_type: &str) -> Option<f64> {
    rows.iter()
        .find(|row| row["type"] == rate_type)
        .and_then(|row| row["rate"].as_f64())
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn aggregates_fold_change_sets_in_effective_order() {
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    let projection = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    let change_log = framework.change_log(&projection).await.expect("change log");
    assert_eq!(change_log.len(), 3);

    // The change log is ordered by (effective ASC, id ASC).
    for window in change_log.windows(2) {
        assert!(window[0].effective <= window[1].effective);
        if window[0].effective == window[1].effective {
            assert!(window[0].id < window[1].id);
        }
    }

    let latest = change_log.last().expect("three change sets");
    let rows = framework
        .aggregate("VAT Rate", 1, latest.id)
        .await
        .expect("aggregate");
    assert_eq!(rows.len(), 3);
    assert_eq!(rate_of(&rows, "standard"), Some(0.15));
    assert_eq!(rate_of(&rows, "reduced"), Some(0.10));
    assert_eq!(rate_of(&rows, "zero"), Some(0.0));

    // At the first change set the 2020 rates are still in force.
    let first = &change_log[0];
    let rows = framework
        .aggregate("VAT Rate", 1, first.id)
        .await
        .expect("aggregate");
    assert_eq!(rate_of(&rows, "standard"), Some(0.10));
    assert_eq!(rate_of(&rows, "reduced"), Some(0.05));
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn a_delete_frame_removes_the_identified_row() {
    let delete_zero = indoc! {"
        add_change_set:
          - description: zero rate abolished
            effective: 2023-04-05T00:00:00Z
            frames:
              - entity: VAT Rate
                version: 1
                action: DELETE
                data:
                  - type: zero
    "};
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
        ("003.abolish-zero-rate.yaml", delete_zero),
    ])
    .await;
    let framework = &harness.framework;

    let projection = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    let change_log = framework.change_log(&projection).await.expect("change log");
    assert_eq!(change_log.len(), 4);

    let latest = change_log.last().expect("four change sets");
    let rows = framework
        .aggregate("VAT Rate", 1, latest.id)
        .await
        .expect("aggregate");
    assert_eq!(rows.len(), 2);
    assert_eq!(rate_of(&rows, "zero"), None);

    // History is immutable: the zero rate is still visible at earlier points.
    let first = &change_log[0];
    let rows = framework
        .aggregate("VAT Rate", 1, first.id)
        .await
        .expect("aggregate");
    assert_eq!(rows.len(), 3);
    assert_eq!(rate_of(&rows, "zero"), Some(0.0));
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn change_set_metadata_is_stable() {
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    let projection = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    let change_log = framework.change_log(&projection).await.expect("change log");

    for change_set in &change_log {
        assert_eq!(change_set.entity_tag.len(), 20);
        assert!(change_set
            .entity_tag
            .chars()
            .all(|character| character.is_ascii_hexdigit() && !character.is_ascii_uppercase()));

        let reread = framework
            .change_set(change_set.id)
            .await
            .expect("query succeeds")
            .expect("change set exists");
        assert_eq!(reread.entity_tag, change_set.entity_tag);
    }

    // All three change sets are effective in the past, so the current change
    // set is the last one.
    let current = framework
        .current_change_set(&projection)
        .await
        .expect("query succeeds")
        .expect("a change set is in force");
    assert_eq!(Some(&current), change_log.last());
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn future_dated_change_sets_are_not_current() {
    let future = indoc! {"
        add_change_set:
          - description: rates of the distant future
            effective: 2999-01-01T00:00:00Z
            frames:
              - entity: VAT Rate
                version: 1
                action: POST
                data:
                  - type: standard
                    rate: 0.99
    "};
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
        ("003.future-rates.yaml", future),
    ])
    .await;
    let framework = &harness.framework;

    let projection = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    let change_log = framework.change_log(&projection).await.expect("change log");
    assert_eq!(change_log.len(), 4);

    let current = framework
        .current_change_set(&projection)
        .await
        .expect("query succeeds")
        .expect("a change set is in force");
    assert_eq!(current.description.as_deref(), Some("2022 rates"));
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn init_is_idempotent_over_an_unchanged_migration_set() {
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    let store = framework.store().await.expect("store");
    let applied = store.applied_migrations().await.expect("bookkeeping");
    assert_eq!(applied.len(), 2);

    framework.init().await.expect("second init is a no-op");

    let reapplied = store.applied_migrations().await.expect("bookkeeping");
    assert_eq!(applied, reapplied);

    let projection = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    assert_eq!(
        framework.change_log(&projection).await.expect("change log").len(),
        3
    );
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn a_modified_migration_is_fatal() {
    let harness = framework_with(&[("001.define-vat-rates.yaml", DEFINE_VAT_RATES)]).await;
    let framework = &harness.framework;

    std::fs::write(
        harness._migrations.path().join("001.define-vat-rates.yaml"),
        DEFINE_VAT_RATES.replace("VAT Rate", "Sales Tax"),
    )
    .expect("rewrite migration");

    let report = framework
        .init()
        .await
        .expect_err("checksum mismatch is fatal");
    assert!(format!("{report:?}").contains("changed since it was applied"));
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn invalid_documents_fail_validation_without_writing() {
    let missing_effective = indoc! {"
        add_change_set:
          - description: no effective date
            frames:
              - entity: VAT Rate
                version: 1
                action: POST
                data:
                  - type: standard
                    rate: 0.10
    "};
    let harness = framework_with(&[("001.define-vat-rates.yaml", DEFINE_VAT_RATES)]).await;
    let framework = &harness.framework;

    std::fs::write(
        harness._migrations.path().join("002.broken.yaml"),
        missing_effective,
    )
    .expect("write migration");

    let report = framework.init().await.expect_err("validation fails");
    assert!(format!("{report:?}")
        .contains("/add_change_set/0 must have required property 'effective'"));

    // The failing file rolled back: no change set was written.
    assert_eq!(
        framework.change_set(1).await.expect("query succeeds"),
        None
    );
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn constraint_violations_preserve_the_database_error_code() {
    let duplicate_hooks = indoc! {"
        add_hooks:
          - name: everything
            event: Any Change
          - name: everything
            event: Any Change
    "};
    let harness = framework_with(&[("001.define-vat-rates.yaml", DEFINE_VAT_RATES)]).await;
    let framework = &harness.framework;

    std::fs::write(
        harness._migrations.path().join("002.duplicate-hooks.yaml"),
        duplicate_hooks,
    )
    .expect("write migration");

    let report = framework.init().await.expect_err("unique violation");
    let code = report
        .downcast_ref::<tokio_postgres::Error>()
        .and_then(tokio_postgres::Error::code);
    assert_eq!(code, Some(&SqlState::UNIQUE_VIOLATION));
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn committed_frames_schedule_one_notification_per_affected_projection() {
    let with_hooks = indoc! {"
        define_entities:
          - name: VAT Rate
            version: 1
            fields:
              - name: type
                type: TEXT
              - name: rate
                type: NUMERIC
            identified_by:
              - type
          - name: Park
            version: 1
            fields:
              - name: code
                type: TEXT
            identified_by:
              - code
        add_projections:
          - name: VAT Rates
            version: 1
            dependencies:
              - entity: VAT Rate
                version: 1
          - name: Parks
            version: 1
            dependencies:
              - entity: Park
                version: 1
        add_hooks:
          - name: everything
            event: Any Change
    "};
    let harness = framework_with(&[
        ("001.schema.yaml", with_hooks),
        ("002.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    let store = framework.store().await.expect("store");
    let notifications = store.notifications().await.expect("notifications");

    // Three change sets touched only the VAT Rate entity: the wildcard hook
    // collapses to a single PENDING row for the one affected projection.
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, NotificationStatus::Pending);
    assert_eq!(notifications[0].attempts, 0);

    let vat_rates = framework
        .projection("VAT Rates", 1)
        .await
        .expect("query succeeds")
        .expect("projection defined");
    assert_eq!(notifications[0].projection_id, vat_rates.id);
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn notifications_are_delivered_and_garbage_collected() {
    let hooked = indoc! {"
        add_hooks:
          - name: vat-watch
            event: VAT Rate Changed
            projection: VAT Rates
            version: 1
    "};
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.add-hooks.yaml", hooked),
        ("003.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    framework.subscribe("VAT Rate Changed", move |event| {
        let sender = sender.clone();
        async move {
            sender.send(event).ok();
            Ok(())
        }
    });
    framework.start().await;

    let event = tokio::time::timeout(Duration::from_secs(10), receiver.recv())
        .await
        .expect("event arrives")
        .expect("channel open");
    assert_eq!(event.event, "VAT Rate Changed");
    assert_eq!(event.projection.name, "VAT Rates");

    wait_until("the notification to pass", || async {
        let store = framework.store().await.expect("store");
        let notifications = store.notifications().await.expect("notifications");
        notifications.len() == 1 && notifications[0].status == NotificationStatus::Ok
    })
    .await;

    framework.stop().await;
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn failing_subscribers_are_retried_with_backoff_until_poisoned() {
    let hooked = indoc! {"
        add_hooks:
          - name: vat-watch
            event: VAT Rate Changed
            projection: VAT Rates
            version: 1
    "};
    let harness = framework_with(&[
        ("001.define-vat-rates.yaml", DEFINE_VAT_RATES),
        ("002.add-hooks.yaml", hooked),
        ("003.vat-rate-history.yaml", THREE_CHANGE_SETS),
    ])
    .await;
    let framework = &harness.framework;

    framework.subscribe("VAT Rate Changed", |_| async {
        Err(Report::new(SubscriberError).attach_printable("downstream unavailable"))
    });
    framework.start().await;

    // max_attempts is 3: the notification is retried, accumulates an error
    // message, and then poisons out while staying PENDING.
    wait_until("the notification to poison", || async {
        let store = framework.store().await.expect("store");
        let notifications = store.notifications().await.expect("notifications");
        notifications.len() == 1 && notifications[0].attempts == 3
    })
    .await;

    let store = framework.store().await.expect("store");
    let poisoned = &store.notifications().await.expect("notifications")[0];
    assert_eq!(poisoned.status, NotificationStatus::Pending);
    assert!(poisoned.last_error.is_some());
    assert!(poisoned.last_attempted.is_some());

    // Give the dispatcher a little more time: attempts must not move past
    // the cap.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let store = framework.store().await.expect("store");
    assert_eq!(store.notifications().await.expect("notifications")[0].attempts, 3);

    framework.stop().await;
}

#[tokio::test]
#[ignore = "requires a running Postgres instance"]
async fn with_transaction_rolls_back_on_error() {
    let harness = framework_with(&[("001.define-vat-rates.yaml", DEFINE_VAT_RATES)]).await;
    let framework = &harness.framework;

    let projections = framework
        .with_transaction(|store| {
            Box::pin(async move { store.projections().await.change_context(StoreError) })
        })
        .await
        .expect("transaction commits");
    assert_eq!(projections.len(), 1);

    let report: Result<(), _> = framework
        .with_exclusive_transaction(|store| {
            Box::pin(async move {
                let _ = store.projections().await.change_context(StoreError)?;
                Err(Report::new(StoreError).attach_printable("boom"))
            })
        })
        .await;
    report.expect_err("body error propagates after rollback");

    // The failed transaction left no trace.
    assert_eq!(
        framework.projections().await.expect("query succeeds").len(),
        1
    );
}
