//! Execution-table lifecycle against a live Postgres.
//!
//! Requires DATABASE_URL; skips itself otherwise. Covers the terminal
//! write invariants, result-kind tagging, admin redaction, dense log
//! sequences with level filtering, and the stuck-execution sweep.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use bfr_db::executions::{
    create_execution, get_execution, update_execution, ExecutionFilter, NewExecution, Principal,
    TerminalUpdate, REDACTED_ERROR,
};
use bfr_db::logs::{fetch_execution_logs, insert_execution_logs, NewLogEntry};
use bfr_schemas::{ExecutionStatus, LogLevel};

async fn db() -> Option<sqlx::PgPool> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("skipping: DATABASE_URL not set");
        return None;
    }
    bfr_db::test_pool_from_env().await.ok()
}

fn new_running(execution_id: Uuid, user_id: Uuid) -> NewExecution {
    NewExecution {
        execution_id,
        workflow_name: "echo".to_string(),
        parameters: json!({"x": "hi"}),
        org_id: None,
        user_id,
        user_name: "Test User".to_string(),
        form_id: None,
        api_key_id: None,
        status: ExecutionStatus::Running,
    }
}

fn admin() -> Principal {
    Principal {
        user_id: Uuid::new_v4(),
        is_admin: true,
    }
}

#[tokio::test]
async fn terminal_write_sets_result_kind_and_completion() {
    let Some(pool) = db().await else { return };
    let execution_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();

    create_execution(&pool, &new_running(execution_id, user_id))
        .await
        .unwrap();
    update_execution(
        &pool,
        execution_id,
        ExecutionStatus::Success,
        &TerminalUpdate {
            result: Some(json!({"echo": "hi"})),
            duration_ms: Some(8),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let row = get_execution(&pool, execution_id, &admin())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Success);
    assert_eq!(row.result, Some(json!({"echo": "hi"})));
    assert_eq!(row.result_type.as_deref(), Some("json"));
    assert_eq!(row.duration_ms, Some(8));

    let started = row.started_at.expect("started_at set at create");
    let completed = row.completed_at.expect("completed_at set with duration");
    assert!(started <= completed);
}

#[tokio::test]
async fn html_and_text_results_are_tagged() {
    let Some(pool) = db().await else { return };
    let admin = admin();

    for (result, expected) in [
        (json!("plain words"), "text"),
        (json!("  <h1>report</h1>"), "html"),
        (json!([1, 2, 3]), "json"),
    ] {
        let execution_id = Uuid::new_v4();
        create_execution(&pool, &new_running(execution_id, Uuid::new_v4()))
            .await
            .unwrap();
        update_execution(
            &pool,
            execution_id,
            ExecutionStatus::Success,
            &TerminalUpdate {
                result: Some(result),
                duration_ms: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let row = get_execution(&pool, execution_id, &admin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.result_type.as_deref(), Some(expected));
    }
}

#[tokio::test]
async fn non_admin_sees_user_errors_but_not_internal_detail() {
    let Some(pool) = db().await else { return };
    let user_id = Uuid::new_v4();
    let principal = Principal {
        user_id,
        is_admin: false,
    };

    // UserError passes through.
    let user_err_id = Uuid::new_v4();
    create_execution(&pool, &new_running(user_err_id, user_id))
        .await
        .unwrap();
    update_execution(
        &pool,
        user_err_id,
        ExecutionStatus::Failed,
        &TerminalUpdate {
            error_message: Some("bad input".to_string()),
            error_type: Some("UserError".to_string()),
            duration_ms: Some(42),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let row = get_execution(&pool, user_err_id, &principal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.error_message.as_deref(), Some("bad input"));

    // Everything else is redacted, and admin-only fields are stripped.
    let internal_id = Uuid::new_v4();
    create_execution(&pool, &new_running(internal_id, user_id))
        .await
        .unwrap();
    update_execution(
        &pool,
        internal_id,
        ExecutionStatus::Failed,
        &TerminalUpdate {
            error_message: Some("connection refused at 10.0.0.7".to_string()),
            error_type: Some("InternalError".to_string()),
            duration_ms: Some(10),
            variables: Some(json!({"secret": "s3cr3t"})),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let row = get_execution(&pool, internal_id, &principal)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.error_message.as_deref(), Some(REDACTED_ERROR));
    assert!(row.variables.is_none());

    // The admin still gets the raw message and the variables.
    let row = get_execution(&pool, internal_id, &admin())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.error_message.as_deref(),
        Some("connection refused at 10.0.0.7")
    );
    assert!(row.variables.is_some());
}

#[tokio::test]
async fn foreign_execution_is_forbidden_for_non_admin() {
    let Some(pool) = db().await else { return };
    let execution_id = Uuid::new_v4();
    create_execution(&pool, &new_running(execution_id, Uuid::new_v4()))
        .await
        .unwrap();

    let stranger = Principal {
        user_id: Uuid::new_v4(),
        is_admin: false,
    };
    let err = get_execution(&pool, execution_id, &stranger)
        .await
        .expect_err("foreign read must be rejected");
    assert_eq!(err.to_string(), "Forbidden");
}

#[tokio::test]
async fn log_sequences_are_dense_and_filtered_by_level() {
    let Some(pool) = db().await else { return };
    let execution_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    create_execution(&pool, &new_running(execution_id, user_id))
        .await
        .unwrap();

    let now = Utc::now().naive_utc();
    let entries: Vec<NewLogEntry> = [
        (LogLevel::Info, "starting"),
        (LogLevel::Debug, "resolver detail"),
        (LogLevel::Warning, "retrying"),
        (LogLevel::Traceback, "Traceback (most recent call last)"),
        (LogLevel::Error, "gave up"),
    ]
    .into_iter()
    .map(|(level, message)| NewLogEntry {
        timestamp: now,
        level,
        message: message.to_string(),
        metadata: None,
    })
    .collect();
    insert_execution_logs(&pool, execution_id, &entries)
        .await
        .unwrap();

    // Admin sees everything, sequences dense from 0.
    let logs = fetch_execution_logs(&pool, execution_id, &admin())
        .await
        .unwrap();
    let sequences: Vec<i32> = logs.iter().map(|l| l.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    // Non-admin: debug and traceback are stripped.
    let non_admin = Principal {
        user_id,
        is_admin: false,
    };
    let logs = fetch_execution_logs(&pool, execution_id, &non_admin)
        .await
        .unwrap();
    let levels: Vec<&str> = logs.iter().map(|l| l.level.as_str()).collect();
    assert_eq!(levels, vec!["info", "warning", "error"]);
}

#[tokio::test]
async fn second_flush_continues_the_sequence() {
    let Some(pool) = db().await else { return };
    let execution_id = Uuid::new_v4();
    create_execution(&pool, &new_running(execution_id, Uuid::new_v4()))
        .await
        .unwrap();

    let now = Utc::now().naive_utc();
    let entry = |msg: &str| NewLogEntry {
        timestamp: now,
        level: LogLevel::Info,
        message: msg.to_string(),
        metadata: None,
    };
    insert_execution_logs(&pool, execution_id, &[entry("a"), entry("b")])
        .await
        .unwrap();
    insert_execution_logs(&pool, execution_id, &[entry("c")])
        .await
        .unwrap();

    let logs = fetch_execution_logs(&pool, execution_id, &admin())
        .await
        .unwrap();
    let sequences: Vec<i32> = logs.iter().map(|l| l.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2], "no gaps across flushes");
}

#[tokio::test]
async fn stuck_running_rows_are_failed_by_the_sweeper() {
    let Some(pool) = db().await else { return };
    let execution_id = Uuid::new_v4();
    create_execution(&pool, &new_running(execution_id, Uuid::new_v4()))
        .await
        .unwrap();

    // Backdate started_at far beyond any timeout.
    sqlx::query(
        "update executions set started_at = (now() at time zone 'utc') - interval '3 hours' where id = $1",
    )
    .bind(execution_id)
    .execute(&pool)
    .await
    .unwrap();

    let swept = bfr_db::executions::fail_stuck_executions(&pool, 300)
        .await
        .unwrap();
    assert!(swept.contains(&execution_id));

    let row = get_execution(&pool, execution_id, &admin())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
    assert_eq!(row.error_type.as_deref(), Some("StuckExecution"));

    // The sweep is a terminal write like any other: both timestamps and a
    // duration consistent with them (3h backdate, one-second tolerance).
    let duration_ms = row.duration_ms.expect("sweeper must set duration_ms");
    let started = row.started_at.expect("started_at set at create");
    let completed = row.completed_at.expect("completed_at set by sweep");
    let gap_ms = (completed - started).num_milliseconds();
    assert!((duration_ms - gap_ms).abs() <= 1000);
}

#[tokio::test]
async fn list_filters_and_paginates() {
    let Some(pool) = db().await else { return };
    let user_id = Uuid::new_v4();
    let marker = format!("list-test-{}", Uuid::new_v4());

    for _ in 0..3 {
        let mut new = new_running(Uuid::new_v4(), user_id);
        new.workflow_name = marker.clone();
        create_execution(&pool, &new).await.unwrap();
    }

    let principal = Principal {
        user_id,
        is_admin: false,
    };
    let (page, next) = bfr_db::executions::list_executions(
        &pool,
        &principal,
        &ExecutionFilter {
            workflow_name: Some(marker.clone()),
            limit: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(page.len(), 2);
    let next = next.expect("a third row remains");

    let (rest, done) = bfr_db::executions::list_executions(
        &pool,
        &principal,
        &ExecutionFilter {
            workflow_name: Some(marker),
            limit: 2,
            offset: next,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(rest.len(), 1);
    assert!(done.is_none());
}
