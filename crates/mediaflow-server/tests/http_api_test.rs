mod common;

use common::{fast_polling, upload_payload, TestServer, PNG};
use http::StatusCode;
use mediaflow_db::NewMedia;
use mediaflow_jobs::{PollError, StatusPoller};
use mediaflow_server::{ClientError, MediaflowClient, SubmitOptions, IMAGE_QUEUE};
use serde_json::{json, Value};

fn row(key: &str) -> NewMedia {
    NewMedia {
        filename: format!("{key}.png"),
        storage_key: key.to_string(),
        storage_backend: "memory".to_string(),
        content_type: "image/png".to_string(),
        size_bytes: 10,
        width: None,
        height: None,
        created_at: None,
    }
}

#[tokio::test]
async fn upload_is_accepted_then_completes() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();

    let resp = http
        .post(format!("{}/api/jobs/{}/upload", server.base_url(), IMAGE_QUEUE))
        .json(&json!({ "payload": upload_payload("cat.png", PNG) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let accepted: Value = resp.json().await.unwrap();
    assert_eq!(accepted["success"], true);
    assert_eq!(accepted["async"], true);
    assert_eq!(accepted["queue"], IMAGE_QUEUE);
    let job_id = accepted["jobId"].as_str().unwrap().to_string();
    assert_eq!(
        accepted["statusUrl"],
        format!("/api/jobs/{IMAGE_QUEUE}/{job_id}")
    );

    let client = MediaflowClient::new(server.base_url()).unwrap();
    let result = StatusPoller::with_config(&client, fast_polling())
        .wait_with_progress(&job_id, accepted["statusUrl"].as_str().unwrap(), |_| {})
        .await
        .unwrap();
    assert!(result["url"].as_str().unwrap().starts_with("memory://memory/uploads/"));
    assert_eq!(result["sizeBytes"], PNG.len());

    // Terminal status reads are stable
    let url = format!("{}/api/jobs/{}/{}", server.base_url(), IMAGE_QUEUE, job_id);
    let first: Value = http.get(&url).send().await.unwrap().json().await.unwrap();
    let second: Value = http.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first["state"], "completed");
    assert_eq!(first["progress"], 100);
    assert_eq!(first["attemptsMade"], 1);

    let media: Value = http
        .get(format!("{}/api/media?page=1&pageSize=30", server.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(media["pagination"]["total"], 1);
    assert_eq!(media["data"][0]["filename"], "cat.png");

    server.stop().await;
}

#[tokio::test]
async fn invalid_upload_fails_without_retry() {
    let server = TestServer::start().await;
    let client = MediaflowClient::new(server.base_url()).unwrap();

    let err = client
        .submit_and_wait(
            IMAGE_QUEUE,
            "upload",
            &json!({ "filename": "a.png", "data": "%%%" }),
            &SubmitOptions::default(),
            fast_polling(),
            |_| {},
        )
        .await
        .unwrap_err();

    match err {
        ClientError::Poll(PollError::JobFailed {
            reason,
            attempts_made,
        }) => {
            assert!(reason.contains("base64"), "{reason}");
            assert_eq!(attempts_made, 1);
        }
        other => panic!("unexpected error: {other}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn batch_with_one_bad_item_still_completes() {
    let server = TestServer::start().await;
    let client = MediaflowClient::new(server.base_url()).unwrap();

    let items: Vec<Value> = (0..10)
        .map(|i| {
            if i == 4 {
                upload_payload("broken.png", b"definitely not an image")
            } else {
                upload_payload(&format!("img-{i}.png"), PNG)
            }
        })
        .collect();

    let mut seen = Vec::new();
    let result = client
        .submit_and_wait(
            IMAGE_QUEUE,
            "batch-upload",
            &json!({ "items": items }),
            &SubmitOptions::default(),
            fast_polling(),
            |p| seen.push(p),
        )
        .await
        .unwrap();

    assert_eq!(result["total"], 10);
    assert_eq!(result["successCount"], 9);
    assert_eq!(result["failCount"], 1);
    assert_eq!(result["errors"][0]["index"], 4);
    assert_eq!(result["results"].as_array().unwrap().len(), 9);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");

    assert_eq!(server.app.ctx.services().db.count().await.unwrap(), 9);
    server.stop().await;
}

#[tokio::test]
async fn unknown_queue_and_type_are_rejected() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();
    let body = json!({ "payload": {} });

    let resp = http
        .post(format!("{}/api/jobs/no-such-queue/upload", server.base_url()))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["success"], false);
    assert_eq!(err["error"]["type"], "not_found");

    let resp = http
        .post(format!("{}/api/jobs/{}/resize", server.base_url(), IMAGE_QUEUE))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = http
        .post(format!("{}/api/jobs/{}/upload", server.base_url(), IMAGE_QUEUE))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn unknown_job_reports_missing() {
    let server = TestServer::start().await;

    let status: Value = reqwest::get(format!(
        "{}/api/jobs/{}/does-not-exist",
        server.base_url(),
        IMAGE_QUEUE
    ))
    .await
    .unwrap()
    .json()
    .await
    .unwrap();
    assert_eq!(status, json!({ "success": true, "exists": false, "progress": 0 }));

    let client = MediaflowClient::new(server.base_url()).unwrap();
    let err = StatusPoller::with_config(&client, fast_polling())
        .wait_with_progress(
            "does-not-exist",
            &format!("/api/jobs/{IMAGE_QUEUE}/does-not-exist"),
            |_| {},
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PollError::JobNotFound(_)));

    server.stop().await;
}

#[tokio::test]
async fn routing_errors() {
    let server = TestServer::start().await;
    let http = reqwest::Client::new();

    let resp = http
        .delete(format!("{}/api/jobs/{}/x", server.base_url(), IMAGE_QUEUE))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.headers()["allow"], "GET, POST");

    let resp = http
        .get(format!("{}/nowhere", server.base_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = TestServer::with_body_limit(1024).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/jobs/{}/upload", server.base_url(), IMAGE_QUEUE))
        .json(&json!({ "payload": upload_payload("big.png", &vec![0u8; 4096]) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    server.stop().await;
}

#[tokio::test]
async fn batch_delete_counts_only_existing_rows() {
    let server = TestServer::start().await;
    let ids = server
        .app
        .ctx
        .services()
        .db
        .batch_insert(&[row("a"), row("b"), row("c")])
        .await
        .unwrap();

    let mut request: Vec<i64> = ids.clone();
    request.extend([ids[2] + 100, ids[2] + 101]);
    let resp = reqwest::Client::new()
        .delete(format!("{}/api/media", server.base_url()))
        .json(&json!({ "ids": request }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "success": true, "requested": 5, "deleted": 3 }));

    let stats: Value = reqwest::get(format!("{}/api/media/stats", server.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["stats"]["count"], 0);
    assert_eq!(stats["stats"]["totalBytes"], 0);

    server.stop().await;
}

#[tokio::test]
async fn health_and_queue_stats() {
    let server = TestServer::start().await;
    let client = MediaflowClient::new(server.base_url()).unwrap();

    let health = reqwest::get(format!("{}/health", server.base_url())).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let health: Value = health.json().await.unwrap();
    assert_eq!(health["status"], "ok");

    client
        .submit_and_wait(
            IMAGE_QUEUE,
            "upload",
            &upload_payload("one.png", PNG),
            &SubmitOptions::default(),
            fast_polling(),
            |_| {},
        )
        .await
        .unwrap();

    let stats: Value = reqwest::get(format!("{}/api/queues/{}/stats", server.base_url(), IMAGE_QUEUE))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["stats"]["queue"], IMAGE_QUEUE);
    assert_eq!(stats["stats"]["completed"], 1);
    assert_eq!(stats["stats"]["metrics"]["processed"], 1);

    server.stop().await;
}
