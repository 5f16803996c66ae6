mod common;

use std::sync::Arc;

use reqwest::{header, Client, StatusCode};
use serde_json::Value;

use file_node::auth::{Claims, Role, TokenVerifier};
use file_node::wal::WAL_FILE_NAME;

use common::{open_state, payload, serve, NoPeers, Registry, TestNode};

async fn upload(client: &Client, base: &str, query: &str, mime: &str, data: &[u8]) -> Value {
    let response = client
        .post(format!("{base}/files?{query}"))
        .header(header::CONTENT_TYPE, mime)
        .body(data.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "success");
    body["data"].clone()
}

async fn status(client: &Client, base: &str) -> Value {
    let body: Value = client
        .get(format!("{base}/_internal/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["data"].clone()
}

async fn search(client: &Client, base: &str, query: &str) -> Value {
    let response = client
        .get(format!("{base}/search?{query}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    body["data"].clone()
}

#[tokio::test]
async fn test_invoice_scenario_over_http() {
    let node = TestNode::start(&[]).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();
    let data = payload(10 * 1024 * 1024);

    let file = upload(
        &client,
        &base,
        "filename=march.pdf&tags[type]=invoice",
        "application/pdf",
        &data,
    )
    .await;
    let id = file["id"].as_str().unwrap().to_string();
    assert_eq!(file["size_bytes"], data.len() as u64);
    assert_eq!(file["tags"]["type"], "invoice");

    let usage = status(&client, &base).await;
    assert_eq!(usage["used_bytes"], data.len() as u64);
    assert_eq!(usage["file_count"], 1);

    let found = search(&client, &base, "q=invoice").await;
    assert_eq!(found["items"][0]["id"], id.as_str());
    assert_eq!(found["pagination"]["total"], 1);

    let response = client
        .get(format!("{base}/files/{id}/content"))
        .header(header::RANGE, "bytes=0-99")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()[header::CONTENT_RANGE],
        format!("bytes 0-99/{}", data.len()).as_str()
    );
    let head = response.bytes().await.unwrap();
    assert_eq!(head.as_ref(), &data[..100]);

    let response = client
        .delete(format!("{base}/files/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let found = search(&client, &base, "q=invoice").await;
    assert_eq!(found["pagination"]["total"], 0);
    let usage = status(&client, &base).await;
    assert_eq!(usage["used_bytes"], 0);
    assert_eq!(usage["file_count"], 0);

    let response = client
        .get(format!("{base}/files/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "fail");
}

#[tokio::test]
async fn test_range_responses() {
    let node = TestNode::start(&[]).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();
    let data = payload(1000);
    let file = upload(&client, &base, "filename=blob.bin", "application/octet-stream", &data).await;
    let url = format!("{base}/files/{}/content", file["id"].as_str().unwrap());

    // Whole file
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "1000");
    assert!(response.headers().contains_key(header::ETAG));
    assert_eq!(response.bytes().await.unwrap().as_ref(), data.as_slice());

    // Past the end
    let response = client
        .get(&url)
        .header(header::RANGE, "bytes=1000-1100")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");

    // Malformed ranges are ignored
    let response = client
        .get(&url)
        .header(header::RANGE, "items=0-5")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Two ranges make a multipart body whose parts concatenate to the file
    let response = client
        .get(&url)
        .header(header::RANGE, "bytes=500-999,0-499")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let content_type = response.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .to_string();
    let boundary = content_type
        .strip_prefix("multipart/byteranges; boundary=")
        .unwrap()
        .to_string();
    let declared_len: usize = response.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), declared_len);

    let mut expected = Vec::new();
    for (start, end) in [(0usize, 499usize), (500, 999)] {
        expected.extend_from_slice(
            format!(
                "\r\n--{boundary}\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes {start}-{end}/1000\r\n\r\n"
            )
            .as_bytes(),
        );
        expected.extend_from_slice(&data[start..=end]);
    }
    expected.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    assert_eq!(body.as_ref(), expected.as_slice());
}

#[tokio::test]
async fn test_conditional_requests() {
    let node = TestNode::start(&[]).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();
    let data = payload(300);
    let file = upload(&client, &base, "filename=c.txt", "text/plain", &data).await;
    let url = format!("{base}/files/{}/content", file["id"].as_str().unwrap());
    let etag = format!("\"{}\"", file["checksum"].as_str().unwrap());

    let response = client
        .get(&url)
        .header(header::IF_NONE_MATCH, format!("W/{etag}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers()[header::ETAG], etag.as_str());

    let response = client
        .get(&url)
        .header(header::RANGE, "bytes=0-9")
        .header(header::IF_RANGE, etag.as_str())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    // A stale validator turns the range request into a full response
    let response = client
        .get(&url)
        .header(header::RANGE, "bytes=0-9")
        .header(header::IF_RANGE, "\"stale\"")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().len(), 300);
}

#[tokio::test]
async fn test_patch_and_similar() {
    let node = TestNode::start(&[]).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();

    let file = upload(
        &client,
        &base,
        "filename=tax-report-2024.pdf&description=draft",
        "application/pdf",
        b"2024",
    )
    .await;
    let other = upload(&client, &base, "filename=tax-report-2023.pdf", "application/pdf", b"2023").await;
    let id = file["id"].as_str().unwrap();

    let response = client
        .patch(format!("{base}/files/{id}"))
        .json(&serde_json::json!({"description": null, "retention_days": 90}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert!(body["data"]["description"].is_null());
    assert_eq!(body["data"]["retention_days"], 90);

    let response = client
        .patch(format!("{base}/files/{id}"))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = client
        .get(format!("{base}/files/{id}/similar"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["data"]["items"][0]["id"], other["id"]);
    assert_eq!(body["data"]["pagination"]["total"], 1);

    let found = search(&client, &base, "q=tax&max_size=3&limit=5").await;
    assert_eq!(found["pagination"]["total"], 0);
    assert_eq!(found["pagination"]["limit"], 5);

    let response = client
        .get(format!("{base}/search?limit=abc"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_authentication_and_roles() {
    let registry = Registry::new();
    let node = TestNode::with(&[], Arc::new(NoPeers), registry.verifier()).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();
    let writer = registry.token("alice", Role::Writer);
    let reader = registry.token("bob", Role::Reader);

    let response = client
        .post(format!("{base}/files?filename=a.txt"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .post(format!("{base}/files?filename=a.txt"))
        .bearer_auth(&reader)
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .post(format!("{base}/files?filename=a.txt"))
        .bearer_auth(&writer)
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["uploader"], "alice");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let response = client
        .get(format!("{base}/files/{id}/content"))
        .bearer_auth(&reader)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello");

    let response = client
        .delete(format!("{base}/files/{id}"))
        .bearer_auth(&reader)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let expired = registry.sign(&Claims {
        sub: "alice".into(),
        role: Role::Admin,
        exp: chrono::Utc::now().timestamp() - 3600,
        iat: None,
    });
    let response = client
        .get(format!("{base}/files/{id}"))
        .bearer_auth(&expired)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Internal endpoints are for the registry and need no token
    let response = client
        .get(format!("{base}/_internal/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["status"], "online");
}

#[tokio::test]
async fn test_error_status_mapping() {
    let node = TestNode::start(&[("CAPACITY_BYTES", "1000"), ("MAX_UPLOAD_SIZE", "5000")]).await;
    let base = serve(Arc::clone(&node.state)).await;
    let client = Client::new();

    let response = client
        .post(format!("{base}/files?filename=huge.bin"))
        .body(payload(2000))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");

    let response = client
        .post(format!("{base}/files"))
        .body("no name")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let status = status(&client, &base).await;
    assert_eq!(status["used_bytes"], 0);
    assert_eq!(status["mode"], "edit");
    assert_eq!(status["node_id"], "node-test");
}

#[tokio::test]
async fn test_read_only_node_rejects_uploads() {
    let node = TestNode::start(&[("NODE_MODE", "ro")]).await;
    let base = serve(Arc::clone(&node.state)).await;

    let response = Client::new()
        .post(format!("{base}/files?filename=a.txt"))
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "fail");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_wal_failure_is_retryable_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::os::unix::fs::symlink("/dev/full", data_dir.join(WAL_FILE_NAME)).unwrap();
    let (state, _) = open_state(dir.path(), &[], Arc::new(NoPeers), TokenVerifier::disabled()).await;
    let base = serve(Arc::new(state)).await;
    let client = Client::new();

    let response = client
        .post(format!("{base}/files?filename=a.txt"))
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "error");

    let status = status(&client, &base).await;
    assert_eq!(status["status"], "degraded");
    assert_eq!(status["wal_healthy"], false);
}
