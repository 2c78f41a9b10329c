//! Telegram channel: Bot API source and sink for the relay.
//!
//! As a source it long-polls `getUpdates` for `channel_post` updates from the
//! monitored channels (the bot must be an administrator there). As a sink it
//! publishes by file id with `sendPhoto`/`sendVideo`/`sendAnimation`/
//! `sendDocument`/`sendMediaGroup`, copies with `copyMessages`, and edits with
//! `editMessageText`/`editMessageCaption`.
//!
//! The Bot API cannot read channel history, so `fetch_recent` is unsupported.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::channels::{
    ChannelSink, ChannelSource, MediaKind, MediaRef, PostId, PostStream, SourcePost,
};
use crate::error::{ChannelError, SendError};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: u64 = 30;
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
/// Used when a 429 carries no `retry_after`.
const TELEGRAM_DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Telegram channel. Connects to the Bot API over HTTPS.
pub struct TelegramChannel {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the client at another Bot API server (local server or test stub).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Call a Bot API method and decode its `result`.
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> Result<T, SendError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("{method}: {e}")))?;

        let status = resp.status().as_u16();
        let parsed: ApiResponse<T> = resp.json().await.map_err(|e| {
            if status >= 500 {
                SendError::Transient(format!("{method}: HTTP {status}"))
            } else {
                SendError::Rejected(format!("{method}: unreadable response ({e})"))
            }
        })?;

        match (parsed.ok, parsed.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err(SendError::Rejected(format!("{method}: missing result"))),
            (false, _) => Err(classify_api_error(
                parsed.error_code.unwrap_or(status),
                parsed.description.as_deref().unwrap_or("unknown error"),
                parsed.parameters.and_then(|p| p.retry_after),
            )),
        }
    }

    /// Send with Markdown first, retrying as plain text if entities don't parse.
    async fn call_markdown<T: DeserializeOwned>(
        &self,
        method: &str,
        mut body: Value,
    ) -> Result<T, SendError> {
        set_parse_mode(&mut body, Some("Markdown"));
        match self.call(method, &body).await {
            Err(SendError::Rejected(reason)) if reason.contains("can't parse entities") => {
                tracing::warn!(method, "Telegram Markdown rejected; retrying without parse_mode");
                set_parse_mode(&mut body, None);
                self.call(method, &body).await
            }
            other => other,
        }
    }
}

// ── ChannelSink ─────────────────────────────────────────────────────

#[async_trait]
impl ChannelSink for TelegramChannel {
    async fn send_text(&self, target: &str, text: &str) -> Result<PostId, SendError> {
        let body = json!({ "chat_id": target, "text": text });
        let sent: MessageId = self.call_markdown("sendMessage", body).await?;
        Ok(sent.message_id)
    }

    async fn send_media(
        &self,
        target: &str,
        media: &MediaRef,
        caption: Option<&str>,
    ) -> Result<PostId, SendError> {
        let (method, field) = send_method(media).ok_or_else(|| {
            SendError::Rejected(format!("cannot send {} media", media.kind.label()))
        })?;

        let mut body = json!({ "chat_id": target, field: media.file_id });
        if let Some(cap) = caption {
            body["caption"] = Value::String(cap.to_string());
        }
        let sent: MessageId = if caption.is_some() {
            self.call_markdown(method, body).await?
        } else {
            self.call(method, &body).await?
        };
        Ok(sent.message_id)
    }

    async fn send_album(
        &self,
        target: &str,
        media: &[MediaRef],
        caption: Option<&str>,
    ) -> Result<Vec<PostId>, SendError> {
        let mut items = Vec::with_capacity(media.len());
        for (i, m) in media.iter().enumerate() {
            let kind = album_type(m).ok_or_else(|| {
                SendError::Rejected(format!("{} cannot be part of an album", m.kind.label()))
            })?;
            let mut item = json!({ "type": kind, "media": m.file_id });
            if let (0, Some(cap)) = (i, caption) {
                item["caption"] = Value::String(cap.to_string());
            }
            items.push(item);
        }

        let body = json!({ "chat_id": target, "media": items });
        let sent: Vec<MessageId> = if caption.is_some() {
            self.call_markdown("sendMediaGroup", body).await?
        } else {
            self.call("sendMediaGroup", &body).await?
        };
        Ok(sent.into_iter().map(|m| m.message_id).collect())
    }

    async fn forward(
        &self,
        target: &str,
        from_channel: &str,
        item_ids: &[i64],
    ) -> Result<Vec<PostId>, SendError> {
        let body = json!({
            "chat_id": target,
            "from_chat_id": from_channel,
            "message_ids": item_ids,
        });
        let copied: Vec<MessageId> = self.call("copyMessages", &body).await?;
        Ok(copied.into_iter().map(|m| m.message_id).collect())
    }

    async fn edit(
        &self,
        target: &str,
        post_id: PostId,
        text: &str,
        is_caption: bool,
    ) -> Result<(), SendError> {
        let (method, field) = if is_caption {
            ("editMessageCaption", "caption")
        } else {
            ("editMessageText", "text")
        };
        let body = json!({ "chat_id": target, "message_id": post_id, field: text });
        let _: IgnoredAny = self.call_markdown(method, body).await?;
        Ok(())
    }
}

// ── ChannelSource ───────────────────────────────────────────────────

#[async_trait]
impl ChannelSource for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn subscribe(&self, channels: &[String]) -> Result<PostStream, ChannelError> {
        let me: Value = self
            .call("getMe", &json!({}))
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;
        let bot = me
            .get("username")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        tracing::info!(bot, "Telegram channel listening for channel posts...");

        let (tx, rx) = mpsc::unbounded_channel();
        let poller = TelegramChannel {
            bot_token: self.bot_token.clone(),
            api_base: self.api_base.clone(),
            client: self.client.clone(),
        };
        let channels = channels.to_vec();

        tokio::spawn(async move {
            poller.run_poll_loop(channels, tx).await;
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|post| (post, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn fetch_recent(
        &self,
        _channel: &str,
        _limit: usize,
        _since: Option<i64>,
    ) -> Result<Vec<SourcePost>, ChannelError> {
        Err(ChannelError::Unsupported {
            name: "telegram".into(),
            operation: "fetch_recent".into(),
        })
    }
}

impl TelegramChannel {
    async fn run_poll_loop(&self, channels: Vec<String>, tx: mpsc::UnboundedSender<SourcePost>) {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        while !tx.is_closed() {
            let body = json!({
                "offset": offset,
                "timeout": TELEGRAM_LONG_POLL_TIMEOUT_SECS,
                "allowed_updates": ["channel_post"],
            });

            let updates: Vec<Update> = match self.call("getUpdates", &body).await {
                Ok(updates) => {
                    consecutive_failures = 0;
                    updates
                }
                Err(SendError::RateLimited { retry_after }) => {
                    tracing::warn!(?retry_after, "Telegram getUpdates rate limited");
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        ?delay,
                        "Telegram getUpdates failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.channel_post else {
                    continue;
                };
                let Some(channel) = match_channel(&channels, &message.chat) else {
                    tracing::debug!(chat_id = message.chat.id, "Ignoring post from unmonitored chat");
                    continue;
                };
                let post = message.into_source_post(channel);
                if tx.send(post).is_err() {
                    tracing::info!("Telegram listener channel closed");
                    return;
                }
            }
        }
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<u16>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageId {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    channel_post: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    date: i64,
    text: Option<String>,
    caption: Option<String>,
    media_group_id: Option<String>,
    photo: Option<Vec<FileRef>>,
    animation: Option<FileRef>,
    video: Option<FileRef>,
    document: Option<FileRef>,
    audio: Option<FileRef>,
    voice: Option<FileRef>,
    sticker: Option<FileRef>,
    video_note: Option<FileRef>,
    poll: Option<IgnoredAny>,
    location: Option<IgnoredAny>,
    contact: Option<IgnoredAny>,
    dice: Option<IgnoredAny>,
}

impl Message {
    fn media(&self) -> Option<MediaRef> {
        let to_media = |kind: MediaKind, f: &FileRef| {
            let media = MediaRef::new(kind, f.file_id.clone());
            match &f.mime_type {
                Some(mime) => media.with_mime_type(mime.clone()),
                None => media,
            }
        };

        // The largest photo size is listed last. Animations also carry a
        // `document`, so they are checked first.
        if let Some(largest) = self.photo.as_ref().and_then(|sizes| sizes.last()) {
            return Some(to_media(MediaKind::Photo, largest));
        }
        let typed = [
            (MediaKind::Animation, &self.animation),
            (MediaKind::Video, &self.video),
            (MediaKind::Document, &self.document),
            (MediaKind::Audio, &self.audio),
            (MediaKind::Voice, &self.voice),
            (MediaKind::Sticker, &self.sticker),
            (MediaKind::Other, &self.video_note),
        ];
        if let Some((kind, file)) = typed
            .into_iter()
            .find_map(|(kind, f)| f.as_ref().map(|f| (kind, f)))
        {
            return Some(to_media(kind, file));
        }

        let other = self.poll.is_some()
            || self.location.is_some()
            || self.contact.is_some()
            || self.dice.is_some();
        other.then(|| MediaRef::new(MediaKind::Other, ""))
    }

    fn into_source_post(self, channel: String) -> SourcePost {
        let media = self.media();
        let posted_at = DateTime::from_timestamp(self.date, 0).unwrap_or_else(Utc::now);
        SourcePost {
            channel,
            id: self.message_id,
            text: self.text.or(self.caption),
            media,
            group_id: self.media_group_id,
            posted_at,
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a Bot API error onto the dispatcher's failure classes.
fn classify_api_error(code: u16, description: &str, retry_after: Option<u64>) -> SendError {
    match code {
        429 => SendError::RateLimited {
            retry_after: retry_after
                .map(Duration::from_secs)
                .unwrap_or(TELEGRAM_DEFAULT_RETRY_AFTER),
        },
        401 | 403 => SendError::PermissionDenied(description.to_string()),
        408 | 500..=599 => SendError::Transient(description.to_string()),
        _ => SendError::Rejected(description.to_string()),
    }
}

/// Configured identifier matching `chat`: `@username` (case-insensitive) or
/// the numeric chat id.
fn match_channel(channels: &[String], chat: &Chat) -> Option<String> {
    let id = chat.id.to_string();
    channels
        .iter()
        .find(|configured| {
            let configured = configured.as_str();
            configured == id
                || chat.username.as_deref().is_some_and(|name| {
                    configured
                        .trim_start_matches('@')
                        .eq_ignore_ascii_case(name)
                })
        })
        .cloned()
}

fn send_method(media: &MediaRef) -> Option<(&'static str, &'static str)> {
    match media.kind {
        MediaKind::Photo => Some(("sendPhoto", "photo")),
        MediaKind::Video => Some(("sendVideo", "video")),
        MediaKind::Animation => Some(("sendAnimation", "animation")),
        MediaKind::Document => Some(("sendDocument", "document")),
        _ => None,
    }
}

fn album_type(media: &MediaRef) -> Option<&'static str> {
    match media.kind {
        MediaKind::Photo => Some("photo"),
        MediaKind::Video => Some("video"),
        MediaKind::Document => Some("document"),
        _ => None,
    }
}

/// Set or clear `parse_mode` on a request body and on album items.
fn set_parse_mode(body: &mut Value, mode: Option<&str>) {
    fn apply(obj: &mut Value, mode: Option<&str>) {
        let Some(map) = obj.as_object_mut() else {
            return;
        };
        match mode {
            Some(mode) if map.contains_key("text") || map.contains_key("caption") => {
                map.insert("parse_mode".into(), Value::String(mode.into()));
            }
            _ => {
                map.remove("parse_mode");
            }
        }
    }

    apply(body, mode);
    if let Some(items) = body.get_mut("media").and_then(Value::as_array_mut) {
        for item in items {
            apply(item, mode);
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> TelegramChannel {
        TelegramChannel::new(SecretString::from("123:ABC"))
    }

    fn parse(raw: Value) -> Message {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            channel().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn telegram_api_url_custom_base() {
        let ch = channel().with_api_base("http://127.0.0.1:8081/");
        assert_eq!(ch.api_url("sendPhoto"), "http://127.0.0.1:8081/bot123:ABC/sendPhoto");
    }

    // ── Error classification ────────────────────────────────────────

    #[test]
    fn classify_rate_limit_uses_retry_after() {
        assert_eq!(
            classify_api_error(429, "Too Many Requests: retry after 7", Some(7)),
            SendError::RateLimited {
                retry_after: Duration::from_secs(7)
            }
        );
        assert_eq!(
            classify_api_error(429, "Too Many Requests", None),
            SendError::RateLimited {
                retry_after: TELEGRAM_DEFAULT_RETRY_AFTER
            }
        );
    }

    #[test]
    fn classify_forbidden_as_permission_denied() {
        assert!(matches!(
            classify_api_error(403, "Forbidden: bot is not a member of the channel chat", None),
            SendError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_api_error(401, "Unauthorized", None),
            SendError::PermissionDenied(_)
        ));
    }

    #[test]
    fn classify_server_errors_as_transient() {
        assert!(matches!(classify_api_error(502, "Bad Gateway", None), SendError::Transient(_)));
        assert!(matches!(classify_api_error(408, "Timeout", None), SendError::Transient(_)));
    }

    #[test]
    fn classify_bad_request_as_rejected() {
        assert!(matches!(
            classify_api_error(400, "Bad Request: wrong file identifier", None),
            SendError::Rejected(_)
        ));
    }

    // ── Channel matching ────────────────────────────────────────────

    #[test]
    fn match_channel_by_username_case_insensitive() {
        let chat = Chat {
            id: -1001,
            username: Some("NewsFeed".into()),
        };
        let channels = vec!["@newsfeed".to_string(), "-1002".to_string()];
        assert_eq!(match_channel(&channels, &chat), Some("@newsfeed".into()));
    }

    #[test]
    fn match_channel_by_numeric_id() {
        let chat = Chat {
            id: -1002,
            username: None,
        };
        let channels = vec!["@newsfeed".to_string(), "-1002".to_string()];
        assert_eq!(match_channel(&channels, &chat), Some("-1002".into()));
    }

    #[test]
    fn match_channel_rejects_unknown_chat() {
        let chat = Chat {
            id: -1003,
            username: Some("elsewhere".into()),
        };
        assert_eq!(match_channel(&["@newsfeed".to_string()], &chat), None);
    }

    // ── Message parsing ─────────────────────────────────────────────

    #[test]
    fn parse_text_post() {
        let msg = parse(json!({
            "message_id": 10,
            "chat": {"id": -1001, "username": "news"},
            "date": 1_700_000_000,
            "text": "hello"
        }));
        let post = msg.into_source_post("@news".into());
        assert_eq!(post.id, 10);
        assert_eq!(post.text.as_deref(), Some("hello"));
        assert!(post.media.is_none());
        assert_eq!(post.posted_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn parse_photo_picks_largest_size_and_caption() {
        let msg = parse(json!({
            "message_id": 11,
            "chat": {"id": -1001},
            "date": 1_700_000_000,
            "caption": "look",
            "media_group_id": "g1",
            "photo": [{"file_id": "small"}, {"file_id": "large"}]
        }));
        let post = msg.into_source_post("@news".into());
        let media = post.media.unwrap();
        assert_eq!(media.kind, MediaKind::Photo);
        assert_eq!(media.file_id, "large");
        assert_eq!(post.text.as_deref(), Some("look"));
        assert_eq!(post.group_id.as_deref(), Some("g1"));
    }

    #[test]
    fn parse_animation_wins_over_document() {
        let msg = parse(json!({
            "message_id": 12,
            "chat": {"id": -1001},
            "date": 0,
            "animation": {"file_id": "anim", "mime_type": "video/mp4"},
            "document": {"file_id": "anim", "mime_type": "video/mp4"}
        }));
        let media = msg.media().unwrap();
        assert_eq!(media.kind, MediaKind::Animation);
    }

    #[test]
    fn parse_audio_keeps_mime() {
        let msg = parse(json!({
            "message_id": 13,
            "chat": {"id": -1001},
            "date": 0,
            "audio": {"file_id": "song", "mime_type": "audio/mpeg"}
        }));
        let media = msg.media().unwrap();
        assert_eq!(media.kind, MediaKind::Audio);
        assert_eq!(media.mime_type.as_deref(), Some("audio/mpeg"));
        assert!(!media.is_groupable());
    }

    #[test]
    fn parse_poll_as_other_media() {
        let msg = parse(json!({
            "message_id": 14,
            "chat": {"id": -1001},
            "date": 0,
            "poll": {"id": "p", "question": "?"}
        }));
        assert_eq!(msg.media().unwrap().kind, MediaKind::Other);
    }

    // ── Request shaping ─────────────────────────────────────────────

    #[test]
    fn parse_mode_applies_to_captioned_album_items_only() {
        let mut body = json!({
            "chat_id": "@t",
            "media": [
                {"type": "photo", "media": "a", "caption": "cap"},
                {"type": "photo", "media": "b"}
            ]
        });
        set_parse_mode(&mut body, Some("Markdown"));
        assert_eq!(body["media"][0]["parse_mode"], "Markdown");
        assert!(body["media"][1].get("parse_mode").is_none());
        assert!(body.get("parse_mode").is_none());

        set_parse_mode(&mut body, None);
        assert!(body["media"][0].get("parse_mode").is_none());
    }

    #[test]
    fn send_method_per_kind() {
        assert_eq!(
            send_method(&MediaRef::new(MediaKind::Animation, "a")),
            Some(("sendAnimation", "animation"))
        );
        assert_eq!(send_method(&MediaRef::new(MediaKind::Audio, "a")), None);
        assert_eq!(album_type(&MediaRef::new(MediaKind::Animation, "a")), None);
    }

    #[tokio::test]
    async fn fetch_recent_is_unsupported() {
        let result = channel().fetch_recent("@news", 50, None).await;
        assert!(matches!(result, Err(ChannelError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn unreachable_api_is_transient() {
        let ch = channel().with_api_base("http://127.0.0.1:9");
        let result = ch.send_text("@target", "hello").await;
        assert!(matches!(result, Err(SendError::Transient(_))));
    }

    #[test]
    fn retry_delay_caps() {
        assert_eq!(transient_retry_delay(1), Duration::from_millis(250));
        assert_eq!(transient_retry_delay(2), Duration::from_millis(500));
        assert_eq!(transient_retry_delay(30), Duration::from_millis(30_000));
    }
}
