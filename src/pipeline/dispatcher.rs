//! Outbound delivery with retry, cooldown and degradation.
//!
//! Policy, in order:
//! 1. `Transient` sink errors are retried with exponential backoff, bounded.
//! 2. `RateLimited` suspends every dispatch (all channels) for the requested
//!    time, then the delivery is attempted exactly once more.
//! 3. `PermissionDenied` is returned as-is; the controller aborts the run.
//! 4. Anything else falls back to a text-only post of the caption (if there
//!    is one) and reports `Failed`.
//!
//! Album rejection is handled before any of that: the first item is sent
//! with the caption and the rest are dropped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::types::{Content, Delivery, DispatchOutcome};
use crate::channels::{ChannelSink, MediaRef, PostId};
use crate::error::SendError;

/// Maximum length of a text post.
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum length of a media caption.
pub const MAX_CAPTION_LEN: usize = 1024;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_MAX_MS: u64 = 30_000;

/// How media posts are reproduced on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryStrategy {
    /// Re-send the media by reference with the rewritten caption attached.
    #[default]
    Rebuild,
    /// Copy the original posts verbatim, then edit the caption.
    CopyAndEdit,
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Destination channel identifier.
    pub target: String,
    pub strategy: DeliveryStrategy,
    /// Attempts per sink call for transient failures (including the first).
    pub max_transient_attempts: u32,
    /// Minimum spacing between consecutive sink calls.
    pub send_interval: Duration,
}

impl DispatcherConfig {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            strategy: DeliveryStrategy::default(),
            max_transient_attempts: 3,
            send_interval: Duration::ZERO,
        }
    }
}

/// Sends deliveries to the destination channel.
pub struct Dispatcher {
    sink: Arc<dyn ChannelSink>,
    config: DispatcherConfig,
    /// No sink call starts before this instant (rate-limit cooldown).
    cooldown_until: Mutex<Option<Instant>>,
    /// Earliest start of the next sink call (pacing).
    next_slot: Mutex<Option<Instant>>,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn ChannelSink>, config: DispatcherConfig) -> Self {
        Self {
            sink,
            config,
            cooldown_until: Mutex::new(None),
            next_slot: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    /// Deliver with the full rate-limit and degradation policy.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        // Text chunks already posted are not posted again by the retry.
        let mut sent_chunks = 0;
        let outcome = match self.attempt(delivery, &mut sent_chunks).await {
            DispatchOutcome::RateLimited(wait) => {
                warn!(
                    channel = %delivery.source_channel,
                    wait_secs = wait.as_secs_f64(),
                    "Rate limited; pausing all dispatches before one retry"
                );
                self.cool_down(wait).await;
                match self.attempt(delivery, &mut sent_chunks).await {
                    DispatchOutcome::RateLimited(again) => {
                        // Still limited: the cooldown applies to everyone, but
                        // this delivery is not retried again.
                        warn!(
                            channel = %delivery.source_channel,
                            wait_secs = again.as_secs_f64(),
                            "Rate limited again after cooldown; giving up on delivery"
                        );
                        self.cool_down(again).await;
                        return DispatchOutcome::Failed(format!(
                            "still rate limited after cooldown (retry after {again:?})"
                        ));
                    }
                    other => other,
                }
            }
            other => other,
        };

        match &outcome {
            DispatchOutcome::Delivered => {
                info!(
                    channel = %delivery.source_channel,
                    items = delivery.item_ids.len(),
                    kind = delivery.kind(),
                    "Delivered"
                );
            }
            DispatchOutcome::PermissionDenied => {
                error!(
                    channel = %delivery.source_channel,
                    target = %self.config.target,
                    "Permission denied by destination"
                );
            }
            DispatchOutcome::Failed(reason) => {
                warn!(
                    channel = %delivery.source_channel,
                    kind = delivery.kind(),
                    reason = %reason,
                    "Delivery failed"
                );
                self.degrade(delivery).await;
            }
            DispatchOutcome::RateLimited(_) => {}
        }

        outcome
    }

    /// One delivery attempt: transient retries only, no rate-limit handling.
    async fn attempt(&self, delivery: &Delivery, sent_chunks: &mut usize) -> DispatchOutcome {
        let result = match self.config.strategy {
            DeliveryStrategy::Rebuild => self.send_rebuilt(delivery, sent_chunks).await,
            DeliveryStrategy::CopyAndEdit => self.send_copied(delivery).await,
        };

        match result {
            Ok(()) => DispatchOutcome::Delivered,
            Err(SendError::RateLimited { retry_after }) => DispatchOutcome::RateLimited(retry_after),
            Err(SendError::PermissionDenied(_)) => DispatchOutcome::PermissionDenied,
            Err(e) => DispatchOutcome::Failed(e.to_string()),
        }
    }

    async fn send_rebuilt(
        &self,
        delivery: &Delivery,
        sent_chunks: &mut usize,
    ) -> Result<(), SendError> {
        let target = self.config.target.as_str();
        let caption = delivery.text.as_deref().map(truncate_caption);

        match &delivery.content {
            Content::Text => {
                self.send_text_chunks(delivery.text.as_deref(), sent_chunks)
                    .await
            }
            Content::Single(media) => {
                self.call(|| self.sink.send_media(target, media, caption))
                    .await?;
                Ok(())
            }
            Content::Album(media) => match self
                .call(|| self.sink.send_album(target, media, caption))
                .await
            {
                Ok(_) => Ok(()),
                Err(SendError::Rejected(reason)) => {
                    self.send_first_of_album(delivery, media, caption, &reason)
                        .await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn send_first_of_album(
        &self,
        delivery: &Delivery,
        media: &[MediaRef],
        caption: Option<&str>,
        reason: &str,
    ) -> Result<(), SendError> {
        let Some(first) = media.first() else {
            return Err(SendError::Rejected("empty album".into()));
        };
        warn!(
            channel = %delivery.source_channel,
            dropped = media.len() - 1,
            reason = %reason,
            "Album rejected; sending first item only"
        );
        self.call(|| self.sink.send_media(&self.config.target, first, caption))
            .await?;
        Ok(())
    }

    async fn send_copied(&self, delivery: &Delivery) -> Result<(), SendError> {
        let target = self.config.target.as_str();
        let posted = self
            .call(|| {
                self.sink
                    .forward(target, &delivery.source_channel, &delivery.item_ids)
            })
            .await?;

        let (Some(text), Some(&post_id)) = (delivery.text.as_deref(), posted.first()) else {
            return Ok(());
        };

        let is_caption = delivery.content != Content::Text;
        let text = if is_caption {
            truncate_caption(text)
        } else {
            truncate_chars(text, MAX_TEXT_LEN)
        };
        if let Err(e) = self.edit(post_id, text, is_caption).await {
            warn!(
                channel = %delivery.source_channel,
                post_id,
                error = %e,
                "Copied post but editing its text failed; keeping original text"
            );
        }
        Ok(())
    }

    async fn edit(&self, post_id: PostId, text: &str, is_caption: bool) -> Result<(), SendError> {
        self.call(|| self.sink.edit(&self.config.target, post_id, text, is_caption))
            .await
    }

    /// Send `text` in destination-sized chunks, starting after the first
    /// `sent` chunks and counting each one that goes out.
    async fn send_text_chunks(&self, text: Option<&str>, sent: &mut usize) -> Result<(), SendError> {
        let text = text.map(str::trim).filter(|t| !t.is_empty()).ok_or_else(|| {
            SendError::Rejected("text post without text".into())
        })?;
        for chunk in split_message(text, MAX_TEXT_LEN).into_iter().skip(*sent) {
            self.call(|| self.sink.send_text(&self.config.target, &chunk))
                .await?;
            *sent += 1;
        }
        Ok(())
    }

    /// Best-effort text-only post after a media delivery failed.
    async fn degrade(&self, delivery: &Delivery) {
        if delivery.content == Content::Text {
            return;
        }
        let Some(text) = delivery.text.as_deref().filter(|t| !t.trim().is_empty()) else {
            return;
        };
        match self.send_text_chunks(Some(text), &mut 0).await {
            Ok(()) => info!(
                channel = %delivery.source_channel,
                "Sent text-only fallback for failed media delivery"
            ),
            Err(e) => warn!(
                channel = %delivery.source_channel,
                error = %e,
                "Text-only fallback failed"
            ),
        }
    }

    /// Run one sink call: wait out cooldown and pacing, retry transient errors.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T, SendError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, SendError>>,
    {
        let max_attempts = self.config.max_transient_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.wait_for_slot().await;
            match op().await {
                Err(SendError::Transient(reason)) if attempt < max_attempts => {
                    let delay = transient_retry_delay(attempt);
                    debug!(attempt, ?delay, reason = %reason, "Transient send failure; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Extend the shared cooldown to at least `wait` from now, then wait it out.
    async fn cool_down(&self, wait: Duration) {
        let until = Instant::now() + wait;
        {
            let mut cooldown = self.cooldown_until.lock().await;
            if cooldown.is_none_or(|current| current < until) {
                *cooldown = Some(until);
            }
        }
        tokio::time::sleep_until(until).await;
    }

    async fn wait_for_slot(&self) {
        let cooldown = *self.cooldown_until.lock().await;
        if let Some(until) = cooldown {
            tokio::time::sleep_until(until).await;
        }

        if self.config.send_interval.is_zero() {
            return;
        }
        let start = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let start = next.map_or(now, |slot| slot.max(now));
            *next = Some(start + self.config.send_interval);
            start
        };
        tokio::time::sleep_until(start).await;
    }
}

/// Exponential backoff with up to 10% jitter.
fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    let base = (BACKOFF_BASE_MS * multiplier).min(BACKOFF_MAX_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 10);
    Duration::from_millis(base + jitter)
}

fn truncate_caption(text: &str) -> &str {
    truncate_chars(text, MAX_CAPTION_LEN)
}

/// Longest prefix of `text` with at most `max_chars` characters.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split a message into chunks of at most `max_len` characters.
/// Tries to split on newlines, then spaces, then hard-cuts.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let head = truncate_chars(remaining, max_len);
        if head.len() == remaining.len() {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(head.len());

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
