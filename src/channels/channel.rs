//! Source and sink traits plus the post types that flow between them.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, SendError};

/// Identifier of a post published on the destination channel.
pub type PostId = i64;

/// Kind of media attached to a source post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    /// Animated image (GIF or silent MP4 loop).
    Animation,
    Video,
    /// Generic document; admissibility depends on its mime type.
    Document,
    Audio,
    Voice,
    Sticker,
    Other,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Animation => "animation",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Sticker => "sticker",
            MediaKind::Other => "other",
        }
    }
}

/// Reference to media already hosted by the transport (re-sendable by id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub file_id: String,
    pub mime_type: Option<String>,
}

impl MediaRef {
    pub fn new(kind: MediaKind, file_id: impl Into<String>) -> Self {
        Self {
            kind,
            file_id: file_id.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn mime(&self) -> &str {
        self.mime_type.as_deref().unwrap_or("")
    }

    /// Photos, animated images, and video-mime documents can be grouped.
    pub fn is_groupable(&self) -> bool {
        match self.kind {
            MediaKind::Photo | MediaKind::Animation | MediaKind::Video => true,
            MediaKind::Document => {
                let mime = self.mime();
                mime.contains("video") || mime.contains("image/gif")
            }
            _ => false,
        }
    }

    /// Animated media cannot share an album with photos and videos.
    pub fn is_animated(&self) -> bool {
        self.kind == MediaKind::Animation
            || (self.kind == MediaKind::Document && self.mime().contains("image/gif"))
    }
}

/// A post observed on a source channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePost {
    /// Configured identifier of the source channel.
    pub channel: String,
    /// Channel-local item id (monotonic per channel).
    pub id: i64,
    /// Text body, or the caption when media is attached.
    pub text: Option<String>,
    pub media: Option<MediaRef>,
    /// Album id shared by items published together.
    pub group_id: Option<String>,
    pub posted_at: DateTime<Utc>,
}

impl SourcePost {
    pub fn text(channel: impl Into<String>, id: i64, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            id,
            text: Some(text.into()),
            media: None,
            group_id: None,
            posted_at: Utc::now(),
        }
    }

    pub fn media(channel: impl Into<String>, id: i64, media: MediaRef) -> Self {
        Self {
            channel: channel.into(),
            id,
            text: None,
            media: Some(media),
            group_id: None,
            posted_at: Utc::now(),
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.text = Some(caption.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_posted_at(mut self, posted_at: DateTime<Utc>) -> Self {
        self.posted_at = posted_at;
        self
    }

    /// Trimmed, non-empty text or caption.
    pub fn trimmed_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

impl fmt::Display for SourcePost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.channel, self.id)
    }
}

/// Stream of incoming source posts.
pub type PostStream = Pin<Box<dyn Stream<Item = SourcePost> + Send>>;

/// Where relayed posts come from.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &str;

    /// Subscribe to new posts on `channels`. The stream ends when the source
    /// shuts down.
    async fn subscribe(&self, channels: &[String]) -> Result<PostStream, ChannelError>;

    /// Fetch up to `limit` of the most recent posts newer than `since`,
    /// oldest first.
    async fn fetch_recent(
        &self,
        channel: &str,
        limit: usize,
        since: Option<i64>,
    ) -> Result<Vec<SourcePost>, ChannelError>;
}

/// Where relayed posts are published.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_text(&self, target: &str, text: &str) -> Result<PostId, SendError>;

    async fn send_media(
        &self,
        target: &str,
        media: &MediaRef,
        caption: Option<&str>,
    ) -> Result<PostId, SendError>;

    /// Publish several media items as one grouped post. The caption goes on
    /// the first item.
    async fn send_album(
        &self,
        target: &str,
        media: &[MediaRef],
        caption: Option<&str>,
    ) -> Result<Vec<PostId>, SendError>;

    /// Copy posts from a source channel verbatim, preserving albums.
    async fn forward(
        &self,
        target: &str,
        from_channel: &str,
        item_ids: &[i64],
    ) -> Result<Vec<PostId>, SendError>;

    /// Replace the text (or caption, when `is_caption`) of a published post.
    async fn edit(
        &self,
        target: &str,
        post_id: PostId,
        text: &str,
        is_caption: bool,
    ) -> Result<(), SendError>;
}
