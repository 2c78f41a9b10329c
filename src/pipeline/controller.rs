//! Pipeline controller: owns one relay run from start to final flush.
//!
//! ```text
//!  Starting ──► Listening | Polling ──► Draining ──► Stopped
//! ```
//!
//! The controller routes source posts to one [`ChannelWorker`] per source
//! channel. Ingestion ends on external cancellation, when the run budget
//! elapses, when the destination denies permission, or (poll mode) after one
//! pass over every channel. Workers then drain their pending batches before
//! the state store is flushed for the last time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::aggregator::{BatchAggregator, DEFAULT_DEBOUNCE, DEFAULT_MAX_ALBUM_ITEMS};
use super::worker::{ChannelWorker, Counters, PipelineDeps};
use crate::channels::{ChannelSource, PostStream, SourcePost};
use crate::error::{ChannelError, PipelineError};

/// Default run budget.
pub const DEFAULT_MAX_RUN: Duration = Duration::from_secs(3600);

/// Default number of recent posts fetched per channel in poll mode.
pub const DEFAULT_POLL_LIMIT: usize = 50;

/// How posts are ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Long-lived subscription.
    #[default]
    Listen,
    /// One pass of `fetch_recent` over every channel.
    Poll,
}

impl RunMode {
    pub fn label(&self) -> &'static str {
        match self {
            RunMode::Listen => "listen",
            RunMode::Poll => "poll",
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Listening,
    Polling,
    Draining,
    Stopped,
}

/// Why ingestion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineReached,
    PassComplete,
    SourceClosed,
    PermissionDenied,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Cancelled => "cancelled",
            StopReason::DeadlineReached => "deadline reached",
            StopReason::PassComplete => "pass complete",
            StopReason::SourceClosed => "source closed",
            StopReason::PermissionDenied => "permission denied",
        };
        f.write_str(s)
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Source channel identifiers, as the source reports them on posts.
    pub channels: Vec<String>,
    pub mode: RunMode,
    pub max_run: Duration,
    pub debounce: Duration,
    pub max_album_items: usize,
    pub poll_limit: usize,
}

impl ControllerConfig {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            mode: RunMode::default(),
            max_run: DEFAULT_MAX_RUN,
            debounce: DEFAULT_DEBOUNCE,
            max_album_items: DEFAULT_MAX_ALBUM_ITEMS,
            poll_limit: DEFAULT_POLL_LIMIT,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: Uuid,
    /// Source items delivered (including degraded album deliveries).
    pub forwarded: usize,
    /// Source items whose delivery was attempted and failed.
    pub failed: usize,
    /// Source items skipped by classification.
    pub skipped: usize,
    /// Source items seen again after being processed.
    pub duplicates: usize,
    pub stop_reason: StopReason,
}

impl RunReport {
    pub fn aborted(&self) -> bool {
        self.stop_reason == StopReason::PermissionDenied
    }
}

/// Runs the forward pipeline.
pub struct PipelineController {
    source: Arc<dyn ChannelSource>,
    deps: PipelineDeps,
    config: ControllerConfig,
    state_tx: watch::Sender<RunState>,
}

impl PipelineController {
    pub fn new(source: Arc<dyn ChannelSource>, deps: PipelineDeps, config: ControllerConfig) -> Self {
        let (state_tx, _) = watch::channel(RunState::Starting);
        Self {
            source,
            deps,
            config,
            state_tx,
        }
    }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "Run state");
        self.state_tx.send_replace(state);
    }

    /// Execute one run. Returns once every pending batch has been dispatched
    /// and the state store has been flushed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("relay_run", %run_id, mode = self.config.mode.label());
        self.run_inner(run_id, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        self.set_state(RunState::Starting);
        if self.config.channels.is_empty() {
            self.set_state(RunState::Stopped);
            return Err(PipelineError::NoSources);
        }

        info!(
            source = self.source.name(),
            channels = ?self.config.channels,
            target = self.deps.dispatcher.target(),
            max_run_secs = self.config.max_run.as_secs(),
            "Starting relay run"
        );

        let stream = match self.config.mode {
            RunMode::Listen => match self.source.subscribe(&self.config.channels).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    self.set_state(RunState::Stopped);
                    return Err(e.into());
                }
            },
            RunMode::Poll => None,
        };

        let counters = Arc::new(Counters::default());
        let abort = CancellationToken::new();
        let mut workers = JoinSet::new();
        let mut inboxes = HashMap::with_capacity(self.config.channels.len());

        for channel in &self.config.channels {
            let (tx, rx) = mpsc::unbounded_channel();
            let mut aggregator = BatchAggregator::with_window(
                channel.clone(),
                self.config.debounce,
                self.config.max_album_items,
            );
            if self.config.mode == RunMode::Poll {
                aggregator = aggregator.without_coalescing();
            }
            let worker = ChannelWorker::new(
                self.deps.clone(),
                aggregator,
                Arc::clone(&counters),
                abort.clone(),
            );
            workers.spawn(worker.run(rx).instrument(info_span!("channel", channel = %channel)));
            inboxes.insert(channel.clone(), tx);
        }

        let ingest = async {
            match stream {
                Some(stream) => {
                    self.set_state(RunState::Listening);
                    Ok(self.listen(stream, &inboxes).await)
                }
                None => {
                    self.set_state(RunState::Polling);
                    self.poll_pass(&inboxes, &abort).await
                }
            }
        };

        let ingested = tokio::select! {
            ingested = ingest => ingested,
            () = cancel.cancelled() => Ok(StopReason::Cancelled),
            () = abort.cancelled() => Ok(StopReason::PermissionDenied),
            () = tokio::time::sleep(self.config.max_run) => Ok(StopReason::DeadlineReached),
        };
        let (stop_reason, fatal) = match ingested {
            Ok(reason) => (reason, None),
            Err(e) => {
                error!(error = %e, "Ingestion failed");
                (StopReason::SourceClosed, Some(e))
            }
        };
        info!(reason = %stop_reason, "Ingestion stopped");

        self.set_state(RunState::Draining);
        drop(inboxes);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Channel worker panicked");
            }
        }

        self.deps.store.flush().await;
        if let Some(e) = fatal {
            self.set_state(RunState::Stopped);
            return Err(e);
        }

        let stop_reason = if abort.is_cancelled() {
            StopReason::PermissionDenied
        } else {
            stop_reason
        };
        let report = RunReport {
            run_id,
            forwarded: counters.forwarded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            skipped: counters.skipped.load(Ordering::Relaxed),
            duplicates: counters.duplicates.load(Ordering::Relaxed),
            stop_reason,
        };

        let tracked = self.deps.store.len().await;
        info!(
            forwarded = report.forwarded,
            failed = report.failed,
            skipped = report.skipped,
            duplicates = report.duplicates,
            tracked,
            reason = %report.stop_reason,
            "Relay run complete"
        );
        self.set_state(RunState::Stopped);
        Ok(report)
    }

    async fn listen(
        &self,
        mut stream: PostStream,
        inboxes: &HashMap<String, mpsc::UnboundedSender<SourcePost>>,
    ) -> StopReason {
        while let Some(post) = stream.next().await {
            route(inboxes, post);
        }
        warn!("Source stream ended");
        StopReason::SourceClosed
    }

    /// Fetch and route every channel's recent posts once. A source that
    /// cannot read history at all ends the run with an error; a failed fetch
    /// only skips that channel.
    async fn poll_pass(
        &self,
        inboxes: &HashMap<String, mpsc::UnboundedSender<SourcePost>>,
        abort: &CancellationToken,
    ) -> Result<StopReason, PipelineError> {
        for channel in &self.config.channels {
            if abort.is_cancelled() {
                return Ok(StopReason::PermissionDenied);
            }

            let since = self.deps.store.high_water_mark(channel).await;
            let mut posts = match self
                .source
                .fetch_recent(channel, self.config.poll_limit, since)
                .await
            {
                Ok(posts) => posts,
                Err(source @ ChannelError::Unsupported { .. }) => {
                    return Err(PipelineError::HistoryUnsupported {
                        channel: channel.clone(),
                        source,
                    });
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to fetch channel history");
                    continue;
                }
            };

            posts.sort_by_key(|p| p.id);
            posts.retain(|p| since.is_none_or(|hw| p.id > hw));
            info!(channel = %channel, count = posts.len(), ?since, "Fetched recent posts");

            for post in posts {
                route(inboxes, post);
            }
        }
        Ok(StopReason::PassComplete)
    }
}

fn route(inboxes: &HashMap<String, mpsc::UnboundedSender<SourcePost>>, post: SourcePost) {
    match inboxes.get(&post.channel) {
        Some(tx) => {
            if tx.send(post).is_err() {
                warn!("Channel worker inbox closed; dropping post");
            }
        }
        None => debug!(channel = %post.channel, "Ignoring post from unmonitored channel"),
    }
}
