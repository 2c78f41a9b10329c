//! Per-channel worker: dedup, classification, aggregation, delivery.
//!
//! One worker owns one channel's [`BatchAggregator`]. Its inbox and its
//! debounce deadline are awaited in the same `select!`, so offers for the
//! channel are serialized and a batch is finalized by exactly one branch.
//! The worker runs until its inbox closes, then force-flushes whatever is
//! still pending.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::{BatchAggregator, Offer};
use super::dispatcher::Dispatcher;
use super::types::{Batch, Delivery, DispatchOutcome, Item};
use crate::channels::SourcePost;
use crate::rewrite::Rewriter;
use crate::store::{ProcessedKey, StateStore};

/// Collaborators shared by every channel worker.
#[derive(Clone)]
pub struct PipelineDeps {
    pub store: Arc<StateStore>,
    pub rewriter: Arc<dyn Rewriter>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Run-wide counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub forwarded: AtomicUsize,
    pub failed: AtomicUsize,
    pub skipped: AtomicUsize,
    pub duplicates: AtomicUsize,
}

impl Counters {
    fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

pub(crate) struct ChannelWorker {
    deps: PipelineDeps,
    aggregator: BatchAggregator,
    counters: Arc<Counters>,
    /// Cancelled when the destination denies permission; stops all workers.
    abort: CancellationToken,
}

impl ChannelWorker {
    pub(crate) fn new(
        deps: PipelineDeps,
        aggregator: BatchAggregator,
        counters: Arc<Counters>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            deps,
            aggregator,
            counters,
            abort,
        }
    }

    pub(crate) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SourcePost>) {
        let channel = self.aggregator.channel().to_string();
        debug!(channel = %channel, "Channel worker started");

        loop {
            let deadline = self.aggregator.deadline();
            tokio::select! {
                biased;
                () = self.abort.cancelled() => {
                    if let Some(batch) = self.aggregator.force_flush() {
                        warn!(
                            channel = %channel,
                            items = batch.len(),
                            "Run aborted; leaving pending batch for the next run"
                        );
                    }
                    return;
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.aggregator.poll_expired(Instant::now()) {
                        self.flush(batch).await;
                    }
                }
                post = inbox.recv() => match post {
                    Some(post) => self.handle(post).await,
                    None => break,
                },
            }
        }

        if let Some(batch) = self.aggregator.force_flush() {
            debug!(channel = %channel, items = batch.len(), "Draining pending batch");
            self.flush(batch).await;
        }
        debug!(channel = %channel, "Channel worker stopped");
    }

    async fn handle(&mut self, post: SourcePost) {
        let key = ProcessedKey::new(post.channel.clone(), post.id);
        if self.deps.store.is_processed(&key).await || self.aggregator.contains(post.id) {
            debug!(key = %key, "Already processed; skipping");
            Counters::add(&self.counters.duplicates, 1);
            return;
        }

        // A post that arrives after the deadline passed must not join the
        // expired batch.
        if let Some(batch) = self.aggregator.poll_expired(Instant::now()) {
            self.flush(batch).await;
        }

        let item = Item::classify(&post);
        match self.aggregator.offer(&post, item, Instant::now()) {
            Offer::Buffered { ready } => {
                debug!(key = %key, pending = self.aggregator.pending_len(), "Buffered media");
                for batch in ready {
                    self.flush(batch).await;
                }
            }
            Offer::Bypass(Item::Text(text)) => {
                // Keep destination order: anything buffered was posted first.
                if let Some(batch) = self.aggregator.force_flush() {
                    self.flush(batch).await;
                }
                self.deliver_text(&post, text).await;
            }
            Offer::Bypass(other) => {
                info!(key = %key, kind = other.label(), "Skipping post that cannot be relayed");
                self.record(std::iter::once(key)).await;
                Counters::add(&self.counters.skipped, 1);
            }
        }
    }

    async fn deliver_text(&self, post: &SourcePost, text: String) {
        if self.abort.is_cancelled() {
            return;
        }
        let body = self.deps.rewriter.rewrite(&text).await.or_original(&text);
        let delivery = Delivery::text(post.channel.clone(), post.id, body);
        let outcome = self.deps.dispatcher.dispatch(&delivery).await;
        self.settle(outcome, vec![ProcessedKey::new(post.channel.clone(), post.id)])
            .await;
    }

    async fn flush(&self, batch: Batch) {
        if self.abort.is_cancelled() {
            return;
        }
        let caption = match batch.caption.as_deref() {
            Some(original) => Some(self.deps.rewriter.rewrite(original).await.or_original(original)),
            None => None,
        };
        let keys: Vec<ProcessedKey> = batch.keys().collect();
        let delivery = Delivery::from_batch(batch, caption);
        let outcome = self.deps.dispatcher.dispatch(&delivery).await;
        self.settle(outcome, keys).await;
    }

    /// Record the attempt. Everything except a permission failure counts as
    /// attempted, so unsendable items are not retried forever.
    async fn settle(&self, outcome: DispatchOutcome, keys: Vec<ProcessedKey>) {
        let n = keys.len();
        match outcome {
            DispatchOutcome::Delivered => {
                self.record(keys).await;
                Counters::add(&self.counters.forwarded, n);
            }
            DispatchOutcome::PermissionDenied => {
                self.abort.cancel();
            }
            DispatchOutcome::Failed(_) | DispatchOutcome::RateLimited(_) => {
                self.record(keys).await;
                Counters::add(&self.counters.failed, n);
            }
        }
    }

    /// Mark keys processed. The high-water mark never moves past an item
    /// that is still buffered, so a batch dropped by an abort or a crash is
    /// fetched again by the next poll pass.
    async fn record(&self, keys: impl IntoIterator<Item = ProcessedKey>) {
        let store = &self.deps.store;
        let ceiling = self.aggregator.lowest_pending();
        for key in keys {
            store.mark_processed(&key).await;
            if ceiling.is_none_or(|low| key.item_id < low) {
                store.observe(&key.channel, key.item_id).await;
            }
        }
        store.flush().await;
    }
}
