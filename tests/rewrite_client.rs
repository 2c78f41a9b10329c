//! Integration tests for the rewrite client.
//!
//! Each test spins up an Axum stub of the prediction endpoint on a random
//! port and points a real `RewriteClient` at it.

use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::post;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use channel_relay::rewrite::{RewriteClient, RewriteResult, Rewriter};

/// Start the stub server, return its base URL.
async fn start_stub() -> String {
    let app = Router::new()
        .route(
            "/echo",
            post(|Json(body): Json<Value>| async move {
                let question = body["question"].as_str().unwrap_or_default().to_string();
                let streaming = body["streaming"].as_bool().unwrap_or(true);
                let has_override = body["overrideConfig"].is_object();
                Json(json!({ "text": format!("{question}|{streaming}|{has_override}") }))
            }),
        )
        .route(
            "/data",
            post(|| async { Json(json!({ "text": "", "data": "  from data  " })) }),
        )
        .route("/blank", post(|| async { Json(json!({ "text": "   " })) }))
        .route(
            "/error",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        )
        .route("/html", post(|| async { "<html>not json</html>" }))
        .route(
            "/slow",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Json(json!({ "text": "too late" }))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{port}")
}

#[tokio::test]
async fn sends_question_without_streaming() {
    let base = start_stub().await;
    let client = RewriteClient::new(format!("{base}/echo"));

    let result = client.rewrite("original post").await;
    assert_eq!(
        result,
        RewriteResult::Rewritten("original post|false|true".into())
    );
}

#[tokio::test]
async fn falls_back_to_data_field() {
    let base = start_stub().await;
    let client = RewriteClient::new(format!("{base}/data"));

    assert_eq!(
        client.rewrite("x").await,
        RewriteResult::Rewritten("from data".into())
    );
}

#[tokio::test]
async fn blank_result_is_unavailable() {
    let base = start_stub().await;
    let client = RewriteClient::new(format!("{base}/blank"));

    assert_eq!(client.rewrite("x").await, RewriteResult::Unavailable);
}

#[tokio::test]
async fn server_error_is_unavailable() {
    let base = start_stub().await;
    let client = RewriteClient::new(format!("{base}/error"));

    let result = client.rewrite("keep me").await;
    assert_eq!(result, RewriteResult::Unavailable);
    assert_eq!(result.or_original("keep me"), "keep me");
}

#[tokio::test]
async fn non_json_body_is_unavailable() {
    let base = start_stub().await;
    let client = RewriteClient::new(format!("{base}/html"));

    assert_eq!(client.rewrite("x").await, RewriteResult::Unavailable);
}

#[tokio::test]
async fn slow_endpoint_times_out_to_unavailable() {
    let base = start_stub().await;
    let client = RewriteClient::with_timeout(format!("{base}/slow"), Duration::from_millis(200));

    let started = std::time::Instant::now();
    assert_eq!(client.rewrite("x").await, RewriteResult::Unavailable);
    assert!(started.elapsed() < Duration::from_secs(2));
}
