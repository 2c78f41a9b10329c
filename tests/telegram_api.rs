//! Integration tests for the Telegram adapter against a stub Bot API.
//!
//! The stub records every method call with its JSON body and answers the
//! way the Bot API does, including error envelopes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use channel_relay::channels::{ChannelSink, ChannelSource, MediaKind, MediaRef, TelegramChannel};
use channel_relay::error::SendError;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Calls = Arc<Mutex<Vec<(String, Value)>>>;

fn ok(result: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "result": result })))
}

fn fail(code: u16, description: &str, extra: Value) -> (StatusCode, Json<Value>) {
    let mut body = json!({ "ok": false, "error_code": code, "description": description });
    if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        obj.extend(extra.clone());
    }
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_REQUEST),
        Json(body),
    )
}

async fn bot_api(
    State(calls): State<Calls>,
    Path(path): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let method = path.rsplit('/').next().unwrap_or_default().to_string();
    let previous = {
        let mut calls = calls.lock().unwrap();
        let previous = calls.iter().filter(|(m, _)| *m == method).count();
        calls.push((method.clone(), body.clone()));
        previous
    };

    match method.as_str() {
        "getMe" => ok(json!({ "id": 1, "username": "relay_bot" })),
        "getUpdates" if previous == 0 => ok(json!([
            {
                "update_id": 500,
                "channel_post": {
                    "message_id": 10,
                    "chat": { "id": -1001, "username": "news", "type": "channel" },
                    "date": 1_700_000_000,
                    "text": "breaking"
                }
            },
            {
                "update_id": 501,
                "channel_post": {
                    "message_id": 3,
                    "chat": { "id": -1009, "username": "elsewhere", "type": "channel" },
                    "date": 1_700_000_001,
                    "text": "not monitored"
                }
            },
            {
                "update_id": 502,
                "channel_post": {
                    "message_id": 11,
                    "chat": { "id": -1001, "username": "news", "type": "channel" },
                    "date": 1_700_000_002,
                    "caption": "album",
                    "media_group_id": "g1",
                    "photo": [{ "file_id": "small" }, { "file_id": "large" }]
                }
            }
        ])),
        "getUpdates" => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ok(json!([]))
        }
        "sendMessage" => {
            let text = body["text"].as_str().unwrap_or_default();
            if body.get("parse_mode").is_some() && text.contains('*') {
                fail(400, "Bad Request: can't parse entities: unclosed bold", json!({}))
            } else {
                ok(json!({ "message_id": 100 }))
            }
        }
        "sendPhoto" => match body["chat_id"].as_str() {
            Some("@limited") => fail(
                429,
                "Too Many Requests: retry after 7",
                json!({ "parameters": { "retry_after": 7 } }),
            ),
            Some("@forbidden") => fail(403, "Forbidden: bot is not a member", json!({})),
            _ => ok(json!({ "message_id": 101 })),
        },
        "sendMediaGroup" => ok(json!([{ "message_id": 200 }, { "message_id": 201 }])),
        "copyMessages" => ok(json!([{ "message_id": 300 }])),
        "editMessageCaption" | "editMessageText" => ok(json!(true)),
        _ => fail(404, "Not Found", json!({})),
    }
}

async fn start_stub() -> (TelegramChannel, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route("/{*path}", post(bot_api))
        .with_state(Arc::clone(&calls));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let channel = TelegramChannel::new(SecretString::from("TEST"))
        .with_api_base(format!("http://127.0.0.1:{port}"));
    (channel, calls)
}

fn calls_to(calls: &Calls, method: &str) -> Vec<Value> {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(m, _)| m == method)
        .map(|(_, body)| body.clone())
        .collect()
}

#[tokio::test]
async fn send_text_uses_markdown() {
    let (channel, calls) = start_stub().await;

    let id = channel.send_text("@target", "plain words").await.unwrap();
    assert_eq!(id, 100);

    let sent = calls_to(&calls, "sendMessage");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["chat_id"], "@target");
    assert_eq!(sent[0]["parse_mode"], "Markdown");
}

#[tokio::test]
async fn send_text_retries_without_markdown_on_parse_error() {
    let (channel, calls) = start_stub().await;

    let id = channel.send_text("@target", "*unclosed").await.unwrap();
    assert_eq!(id, 100);

    let sent = calls_to(&calls, "sendMessage");
    assert_eq!(sent.len(), 2);
    assert!(sent[1].get("parse_mode").is_none());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let (channel, _calls) = start_stub().await;
    let photo = MediaRef::new(MediaKind::Photo, "p");

    let err = channel.send_media("@limited", &photo, None).await.unwrap_err();
    assert_eq!(
        err,
        SendError::RateLimited {
            retry_after: Duration::from_secs(7)
        }
    );
}

#[tokio::test]
async fn forbidden_is_permission_denied() {
    let (channel, _calls) = start_stub().await;
    let photo = MediaRef::new(MediaKind::Photo, "p");

    let err = channel.send_media("@forbidden", &photo, Some("cap")).await.unwrap_err();
    assert!(matches!(err, SendError::PermissionDenied(_)));
}

#[tokio::test]
async fn album_puts_caption_on_first_item() {
    let (channel, calls) = start_stub().await;
    let media = vec![
        MediaRef::new(MediaKind::Photo, "a"),
        MediaRef::new(MediaKind::Video, "b"),
    ];

    let ids = channel.send_album("@target", &media, Some("caption")).await.unwrap();
    assert_eq!(ids, vec![200, 201]);

    let sent = calls_to(&calls, "sendMediaGroup");
    let items = sent[0]["media"].as_array().unwrap();
    assert_eq!(items[0]["type"], "photo");
    assert_eq!(items[0]["caption"], "caption");
    assert_eq!(items[0]["parse_mode"], "Markdown");
    assert_eq!(items[1]["type"], "video");
    assert!(items[1].get("caption").is_none());
}

#[tokio::test]
async fn album_with_animation_is_rejected_locally() {
    let (channel, calls) = start_stub().await;
    let media = vec![
        MediaRef::new(MediaKind::Photo, "a"),
        MediaRef::new(MediaKind::Animation, "gif"),
    ];

    let err = channel.send_album("@target", &media, None).await.unwrap_err();
    assert!(matches!(err, SendError::Rejected(_)));
    assert!(calls_to(&calls, "sendMediaGroup").is_empty());
}

#[tokio::test]
async fn forward_copies_then_edit_targets_copy() {
    let (channel, calls) = start_stub().await;

    let ids = channel.forward("@target", "@news", &[11, 12]).await.unwrap();
    assert_eq!(ids, vec![300]);
    channel.edit("@target", 300, "new caption", true).await.unwrap();

    let copied = calls_to(&calls, "copyMessages");
    assert_eq!(copied[0]["from_chat_id"], "@news");
    assert_eq!(copied[0]["message_ids"], json!([11, 12]));
    let edited = calls_to(&calls, "editMessageCaption");
    assert_eq!(edited[0]["message_id"], 300);
    assert_eq!(edited[0]["caption"], "new caption");
}

#[tokio::test]
async fn subscribe_delivers_posts_from_monitored_channels() {
    let (channel, calls) = start_stub().await;

    let mut stream = channel.subscribe(&["@news".to_string()]).await.unwrap();

    let first = timeout(TEST_TIMEOUT, stream.next()).await.unwrap().unwrap();
    assert_eq!(first.channel, "@news");
    assert_eq!(first.id, 10);
    assert_eq!(first.text.as_deref(), Some("breaking"));

    let second = timeout(TEST_TIMEOUT, stream.next()).await.unwrap().unwrap();
    assert_eq!(second.id, 11);
    assert_eq!(second.group_id.as_deref(), Some("g1"));
    assert_eq!(second.media.unwrap().file_id, "large");

    // The next long poll acknowledges everything seen so far.
    timeout(TEST_TIMEOUT, async {
        while calls_to(&calls, "getUpdates").len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let polls = calls_to(&calls, "getUpdates");
    assert_eq!(polls[0]["allowed_updates"], json!(["channel_post"]));
    assert_eq!(polls[1]["offset"], 503);
}
