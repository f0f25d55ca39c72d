//! HTTP surface tests, driven through the router without a socket.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use memory_harness::cancel::{cancel_pair, CancelHandle};
use memory_harness::config::Config;
use memory_harness::embedding::EmbeddingProvider;
use memory_harness::error::MemoryError;
use memory_harness::server::router;
use memory_harness::service::MemoryService;

const DIMS: usize = 32;

struct WordEmbedder;

#[async_trait]
impl EmbeddingProvider for WordEmbedder {
    fn model_name(&self) -> &str {
        "word"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for word in t
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let bucket = word
                        .bytes()
                        .fold(0usize, |a, b| a.wrapping_mul(31).wrapping_add(b as usize))
                        % DIMS;
                    v[bucket] += 1.0;
                }
                v
            })
            .collect())
    }
}

fn test_app() -> (Router, CancelHandle) {
    let mut config = Config::default();
    config.artifacts.backend = "memory".to_string();
    config.queue.backend = "memory".to_string();
    config.queue.poll_interval_ms = 5;
    config.pipeline.workers = 2;
    config.pipeline.retry_base_ms = 5;
    config.pipeline.retry_cap_ms = 40;

    let (handle, token) = cancel_pair();
    let service = Arc::new(
        MemoryService::builder(config)
            .embedder(Arc::new(WordEmbedder))
            .cancel(token)
            .build()
            .unwrap(),
    );
    service.start_workers();
    (router(service), handle)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn multipart_upload(index: &str, document_id: &str, file_name: &str, content: &str) -> Request<Body> {
    let boundary = "test-boundary-7f3a";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"index\"\r\n\r\n\
         {index}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"documentId\"\r\n\r\n\
         {document_id}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"tags\"\r\n\r\n\
         {{\"user\":\"alice\"}}\r\n\
         --{boundary}\r\n\
         Content-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         {content}\r\n\
         --{boundary}--\r\n"
    );
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_ready(app: &Router, index: &str, document_id: &str) {
    let start = Instant::now();
    loop {
        let response = app
            .clone()
            .oneshot(get(&format!(
                "/upload-status?index={index}&documentId={document_id}"
            )))
            .await
            .unwrap();
        if response.status() == StatusCode::OK {
            let status = body_json(response).await;
            if status["ready"] == serde_json::Value::Bool(true) {
                return;
            }
        }
        assert!(
            start.elapsed() < Duration::from_secs(20),
            "document '{document_id}' never became ready"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn health_reports_version() {
    let (app, _cancel) = test_app();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_process_search_delete_roundtrip() {
    let (app, _cancel) = test_app();

    let response = app
        .clone()
        .oneshot(multipart_upload("docs", "d1", "moon.txt", "The moon orbits the earth."))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let receipt = body_json(response).await;
    assert_eq!(receipt["documentId"], "d1");
    assert_eq!(receipt["index"], "docs");

    wait_ready(&app, "docs", "d1").await;

    let response = app
        .clone()
        .oneshot(json_post(
            "/search",
            serde_json::json!({
                "index": "docs",
                "query": "moon",
                "minRelevance": 0.05,
                "limit": -1
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["text"].as_str().unwrap().contains("moon orbits"));
    assert_eq!(results[0]["tags"]["__document_id"][0], "d1");
    assert_eq!(results[0]["tags"]["user"][0], "alice");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/documents?index=docs&documentId=d1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(json_post(
            "/search",
            serde_json::json!({ "index": "docs", "query": "moon", "minRelevance": 0.05 }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert!(body["results"].as_array().unwrap().is_empty());

    // deletion is idempotent
    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/documents?index=docs&documentId=d1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_document_status_is_404() {
    let (app, _cancel) = test_app();
    let response = app
        .oneshot(get("/upload-status?index=docs&documentId=ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload_without_files_is_rejected() {
    let (app, _cancel) = test_app();
    let boundary = "test-boundary-7f3a";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"index\"\r\n\r\n\
         docs\r\n\
         --{boundary}--\r\n"
    );
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ask_returns_answer_and_citations() {
    let (app, _cancel) = test_app();

    app.clone()
        .oneshot(multipart_upload("docs", "d1", "moon.txt", "The moon orbits the earth."))
        .await
        .unwrap();
    wait_ready(&app, "docs", "d1").await;

    let response = app
        .oneshot(json_post(
            "/ask",
            serde_json::json!({
                "index": "docs",
                "question": "What does the moon orbit?",
                "minRelevance": 0.05
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["answer"].as_str().unwrap().contains("orbits the earth"));
    assert_eq!(body["citations"][0]["documentId"], "d1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn indexes_are_listed_and_metrics_exposed() {
    let (app, _cancel) = test_app();

    app.clone()
        .oneshot(multipart_upload("alpha", "d1", "a.txt", "Alpha content."))
        .await
        .unwrap();
    wait_ready(&app, "alpha", "d1").await;

    let response = app.clone().oneshot(get("/indexes")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["indexes"], serde_json::json!(["alpha"]));

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["documentsAccepted"], 1);
    assert_eq!(body["documentsCompleted"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/indexes?index=alpha")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/indexes")).await.unwrap();
    let body = body_json(response).await;
    assert!(body["indexes"].as_array().unwrap().is_empty());
}
