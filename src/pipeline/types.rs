//! Shared types for the forward pipeline.

use std::time::Duration;

use crate::channels::{MediaRef, SourcePost};
use crate::store::ProcessedKey;

// ── Classification ──────────────────────────────────────────────────

/// How a source post enters the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Text-only post; published directly.
    Text(String),
    /// Media that can be grouped into an album.
    GroupableMedia {
        media: MediaRef,
        caption: Option<String>,
    },
    /// Media the destination never receives (audio, files, stickers, ...).
    UnsupportedMedia { kind: &'static str },
    /// Neither text nor media.
    Empty,
}

impl Item {
    /// Classify a source post by its payload.
    pub fn classify(post: &SourcePost) -> Self {
        let text = post.trimmed_text().map(str::to_string);
        match (&post.media, text) {
            (Some(media), caption) if media.is_groupable() => Item::GroupableMedia {
                media: media.clone(),
                caption,
            },
            (Some(media), _) => Item::UnsupportedMedia {
                kind: media.kind.label(),
            },
            (None, Some(text)) => Item::Text(text),
            (None, None) => Item::Empty,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Item::Text(_) => "text",
            Item::GroupableMedia { .. } => "groupable_media",
            Item::UnsupportedMedia { .. } => "unsupported_media",
            Item::Empty => "empty",
        }
    }
}

// ── Batches ─────────────────────────────────────────────────────────

/// Logical group a buffered item belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Album id supplied by the source.
    Explicit(String),
    /// Standalone media; coalesces with other standalone media in the window.
    Ungrouped,
    /// Standalone media that never shares a batch.
    Standalone(i64),
}

impl GroupKey {
    /// Group of `post`. With `coalesce_ungrouped` off, media without an album
    /// id stays on its own.
    pub fn of(post: &SourcePost, coalesce_ungrouped: bool) -> Self {
        match &post.group_id {
            Some(id) => GroupKey::Explicit(id.clone()),
            None if coalesce_ungrouped => GroupKey::Ungrouped,
            None => GroupKey::Standalone(post.id),
        }
    }
}

/// A finalized group of media, ready to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub channel: String,
    pub group: GroupKey,
    /// Media in arrival order.
    pub media: Vec<MediaRef>,
    /// First non-empty caption in the group.
    pub caption: Option<String>,
    /// Contributing source item ids, in arrival order.
    pub item_ids: Vec<i64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.media.len()
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = ProcessedKey> + '_ {
        self.item_ids
            .iter()
            .map(|id| ProcessedKey::new(self.channel.clone(), *id))
    }
}

// ── Dispatch ────────────────────────────────────────────────────────

/// What to publish on the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text,
    Single(MediaRef),
    Album(Vec<MediaRef>),
}

/// A unit of outbound work for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub source_channel: String,
    /// Source items the delivery represents (used by copy-and-edit).
    pub item_ids: Vec<i64>,
    pub content: Content,
    /// Rewritten (or original) text; the body for text posts, the caption
    /// otherwise.
    pub text: Option<String>,
}

impl Delivery {
    pub fn text(source_channel: impl Into<String>, item_id: i64, text: impl Into<String>) -> Self {
        Self {
            source_channel: source_channel.into(),
            item_ids: vec![item_id],
            content: Content::Text,
            text: Some(text.into()),
        }
    }

    /// Build a delivery from a batch, with the caption already rewritten.
    pub fn from_batch(batch: Batch, caption: Option<String>) -> Self {
        let content = if batch.media.len() == 1 {
            match batch.media.into_iter().next() {
                Some(media) => Content::Single(media),
                None => Content::Album(Vec::new()),
            }
        } else {
            Content::Album(batch.media)
        };
        Self {
            source_channel: batch.channel,
            item_ids: batch.item_ids,
            content,
            text: caption,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.content {
            Content::Text => "text",
            Content::Single(_) => "single",
            Content::Album(_) => "album",
        }
    }
}

/// Result of dispatching one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    RateLimited(Duration),
    PermissionDenied,
    Failed(String),
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered => "delivered",
            DispatchOutcome::RateLimited(_) => "rate_limited",
            DispatchOutcome::PermissionDenied => "permission_denied",
            DispatchOutcome::Failed(_) => "failed",
        }
    }
}
