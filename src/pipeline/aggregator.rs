//! Per-channel album aggregation with a debounce deadline.
//!
//! State is either `NoActiveBatch` or `ActiveBatch { batch, deadline }`.
//! Transitions happen only through [`BatchAggregator::offer`],
//! [`BatchAggregator::poll_expired`] and [`BatchAggregator::force_flush`];
//! the caller owns the clock and decides when to poll. Flushing moves the
//! batch out and resets the state in one step, so a batch can only ever be
//! handed out once.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::types::{Batch, GroupKey, Item};
use crate::channels::SourcePost;

/// Default debounce window.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

/// Largest album the destination accepts.
pub const DEFAULT_MAX_ALBUM_ITEMS: usize = 10;

#[derive(Debug)]
enum State {
    NoActiveBatch,
    ActiveBatch { batch: Batch, deadline: Instant },
}

/// Result of offering an item.
#[derive(Debug, PartialEq, Eq)]
pub enum Offer {
    /// Item was buffered. `ready` holds batches that had to be finalized by
    /// this offer (group change or full album), oldest first.
    Buffered { ready: Vec<Batch> },
    /// Item does not take part in grouping; the caller handles it.
    Bypass(Item),
}

/// Buffers groupable media for one source channel.
#[derive(Debug)]
pub struct BatchAggregator {
    channel: String,
    window: Duration,
    max_items: usize,
    coalesce_ungrouped: bool,
    state: State,
}

impl BatchAggregator {
    pub fn new(channel: impl Into<String>) -> Self {
        Self::with_window(channel, DEFAULT_DEBOUNCE, DEFAULT_MAX_ALBUM_ITEMS)
    }

    pub fn with_window(channel: impl Into<String>, window: Duration, max_items: usize) -> Self {
        Self {
            channel: channel.into(),
            window,
            max_items: max_items.max(1),
            coalesce_ungrouped: true,
            state: State::NoActiveBatch,
        }
    }

    /// Keep media without an album id in batches of its own.
    pub fn without_coalescing(mut self) -> Self {
        self.coalesce_ungrouped = false;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Deadline of the live batch, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::NoActiveBatch => None,
            State::ActiveBatch { deadline, .. } => Some(*deadline),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::NoActiveBatch)
    }

    /// Number of items in the live batch.
    pub fn pending_len(&self) -> usize {
        match &self.state {
            State::NoActiveBatch => 0,
            State::ActiveBatch { batch, .. } => batch.len(),
        }
    }

    /// Whether `item_id` is already buffered.
    pub fn contains(&self, item_id: i64) -> bool {
        match &self.state {
            State::NoActiveBatch => false,
            State::ActiveBatch { batch, .. } => batch.item_ids.contains(&item_id),
        }
    }

    /// Smallest item id in the live batch.
    pub fn lowest_pending(&self) -> Option<i64> {
        match &self.state {
            State::NoActiveBatch => None,
            State::ActiveBatch { batch, .. } => batch.item_ids.iter().copied().min(),
        }
    }

    /// Offer a classified post. Every buffered offer restarts the deadline.
    pub fn offer(&mut self, post: &SourcePost, item: Item, now: Instant) -> Offer {
        let (media, caption) = match item {
            Item::GroupableMedia { media, caption } => (media, caption),
            other => return Offer::Bypass(other),
        };

        let group = GroupKey::of(post, self.coalesce_ungrouped);
        let mut ready = Vec::new();

        let state = std::mem::replace(&mut self.state, State::NoActiveBatch);
        let mut batch = match state {
            State::ActiveBatch { batch, .. } if batch.group == group => batch,
            State::ActiveBatch { batch, .. } => {
                debug!(
                    channel = %self.channel,
                    items = batch.len(),
                    "Group changed; flushing previous batch"
                );
                ready.push(batch);
                self.new_batch(group)
            }
            State::NoActiveBatch => self.new_batch(group),
        };

        batch.media.push(media);
        batch.item_ids.push(post.id);
        if batch.caption.is_none() {
            batch.caption = caption;
        }

        if batch.len() >= self.max_items {
            debug!(channel = %self.channel, items = batch.len(), "Album full; flushing");
            ready.push(batch);
        } else {
            self.state = State::ActiveBatch {
                batch,
                deadline: now + self.window,
            };
        }

        Offer::Buffered { ready }
    }

    /// Finalize the live batch if its deadline has passed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.force_flush(),
            _ => None,
        }
    }

    /// Finalize the live batch regardless of its deadline.
    pub fn force_flush(&mut self) -> Option<Batch> {
        match std::mem::replace(&mut self.state, State::NoActiveBatch) {
            State::ActiveBatch { batch, .. } => Some(batch),
            State::NoActiveBatch => None,
        }
    }

    fn new_batch(&self, group: GroupKey) -> Batch {
        Batch {
            channel: self.channel.clone(),
            group,
            media: Vec::new(),
            caption: None,
            item_ids: Vec::new(),
        }
    }
}
