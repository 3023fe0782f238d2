mod common;

use bytes::Bytes;
use common::{upload_payload, TestContext, PNG};
use mediaflow_db::NewMedia;
use mediaflow_jobs::{EnqueueOptions, JobState, JobStatus};
use mediaflow_server::{AppContext, ObjectStore, BACKUP_QUEUE, IMAGE_QUEUE, MIGRATION_QUEUE};
use serde_json::{json, Value};
use std::time::Duration;

fn row(key: &str) -> NewMedia {
    NewMedia {
        filename: format!("{key}.png"),
        storage_key: format!("uploads/{key}.png"),
        storage_backend: "memory".to_string(),
        content_type: "image/png".to_string(),
        size_bytes: 100,
        width: Some(10),
        height: Some(10),
        created_at: None,
    }
}

async fn run(ctx: &AppContext, queue: &str, job_type: &str, payload: Value) -> JobStatus {
    let submission = ctx
        .manager()
        .submit(queue, job_type, payload, EnqueueOptions::new())
        .await
        .unwrap();
    ctx.manager()
        .queue(queue)
        .await
        .unwrap()
        .wait_for(&submission.job_id, Some(Duration::from_secs(10)))
        .await
        .unwrap()
}

fn completed(status: JobStatus) -> Value {
    assert_eq!(status.state, Some(JobState::Completed), "{status:?}");
    status.result.unwrap()
}

#[tokio::test]
async fn backup_then_restore_round_trip() {
    let app = TestContext::start().await;
    let db = &app.ctx.services().db;
    let ids = db.batch_insert(&[row("a"), row("b"), row("c")]).await.unwrap();

    let backup = completed(run(&app.ctx, BACKUP_QUEUE, "backup", json!({ "label": "nightly" })).await);
    assert_eq!(backup["storageKey"], "backups/nightly.json");
    assert_eq!(backup["records"], 3);

    assert_eq!(db.batch_delete(&ids).await.unwrap(), 3);
    let restore = completed(
        run(
            &app.ctx,
            BACKUP_QUEUE,
            "restore",
            json!({ "storageKey": "backups/nightly.json" }),
        )
        .await,
    );
    assert_eq!(restore["total"], 3);
    assert_eq!(restore["skipped"], 0);
    assert_eq!(restore["inserted"], 3);
    assert_eq!(db.count().await.unwrap(), 3);

    // Nothing left to restore the second time
    let again = completed(
        run(
            &app.ctx,
            BACKUP_QUEUE,
            "restore",
            json!({ "storageKey": "backups/nightly.json" }),
        )
        .await,
    );
    assert_eq!(again["skipped"], 3);
    assert_eq!(again["inserted"], 0);
    assert_eq!(db.count().await.unwrap(), 3);

    app.stop().await;
}

#[tokio::test]
async fn malformed_snapshot_is_not_retried() {
    let app = TestContext::start().await;
    app.memory
        .put("backups/bad.json", Bytes::from_static(b"{ nope"), "application/json")
        .await
        .unwrap();

    let status = run(
        &app.ctx,
        BACKUP_QUEUE,
        "restore",
        json!({ "storageKey": "backups/bad.json" }),
    )
    .await;
    assert_eq!(status.state, Some(JobState::Failed));
    assert_eq!(status.attempts_made, 1);
    assert!(status.failure_reason.unwrap().contains("malformed snapshot"));

    app.stop().await;
}

#[tokio::test]
async fn migration_moves_objects_to_local_disk() {
    let app = TestContext::start().await;

    let upload = completed(run(&app.ctx, IMAGE_QUEUE, "upload", upload_payload("cat.png", PNG)).await);
    let key = upload["storageKey"].as_str().unwrap().to_string();
    let id = upload["id"].as_i64().unwrap();

    let migrated = completed(
        run(
            &app.ctx,
            MIGRATION_QUEUE,
            "migrate",
            json!({ "from": "memory", "to": "local", "deleteSource": true }),
        )
        .await,
    );
    assert_eq!(migrated, json!({ "total": 1, "migrated": 1, "failed": 0, "errors": [] }));

    assert_eq!(std::fs::read(app.root.join(&key)).unwrap(), PNG);
    assert!(app.memory.is_empty());
    let record = app.ctx.services().db.get(id).await.unwrap().unwrap();
    assert_eq!(record.storage_backend, "local");

    app.stop().await;
}

#[tokio::test]
async fn migration_to_unknown_backend_fails_once() {
    let app = TestContext::start().await;

    let status = run(
        &app.ctx,
        MIGRATION_QUEUE,
        "migrate",
        json!({ "from": "memory", "to": "s3" }),
    )
    .await;
    assert_eq!(status.state, Some(JobState::Failed));
    assert_eq!(status.attempts_made, 1);

    app.stop().await;
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let app = TestContext::start().await;
    app.ctx.initialize().await.unwrap();
    assert!(app.ctx.is_initialized());

    let mut names = app.ctx.manager().queue_names().await;
    names.sort();
    assert_eq!(names, vec![BACKUP_QUEUE, IMAGE_QUEUE, MIGRATION_QUEUE]);

    app.stop().await;
}
