use std::sync::Arc;

use channel_relay::channels::TelegramChannel;
use channel_relay::config::RelayConfig;
use channel_relay::pipeline::{Dispatcher, PipelineController, PipelineDeps};
use channel_relay::rewrite::{PassthroughRewriter, RewriteClient, Rewriter};
use channel_relay::store::StateStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage. Fails only if a
    // provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let _ = dotenvy::dotenv();

    let config = RelayConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    eprintln!("📡 Channel relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Sources: {}", config.source_channels.join(", "));
    eprintln!("   Target: {}", config.target_channel);
    eprintln!("   Mode: {}", config.mode.label());
    eprintln!("   State: {}", config.state_file.display());

    // ── Rewriting ───────────────────────────────────────────────────────
    let rewriter: Arc<dyn Rewriter> = match &config.rewrite_url {
        Some(url) => {
            eprintln!("   Rewrite: {url}");
            Arc::new(RewriteClient::with_timeout(url.clone(), config.rewrite_timeout))
        }
        None => {
            eprintln!("   Rewrite: disabled");
            Arc::new(PassthroughRewriter)
        }
    };

    // ── Channels ────────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramChannel::new(config.bot_token.clone()));
    let store = Arc::new(StateStore::load(config.state_file.clone()).await);
    let dispatcher = Arc::new(Dispatcher::new(telegram.clone(), config.dispatcher_config()));

    let deps = PipelineDeps {
        store,
        rewriter,
        dispatcher,
    };
    let controller = PipelineController::new(telegram, deps, config.controller_config());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received; draining");
                cancel.cancel();
            }
        });
    }

    let report = controller.run(cancel).await?;
    eprintln!(
        "   Done ({}): {} forwarded, {} failed, {} skipped, {} duplicates",
        report.stop_reason, report.forwarded, report.failed, report.skipped, report.duplicates
    );

    if report.aborted() {
        anyhow::bail!("destination denied permission; run aborted");
    }
    Ok(())
}

/// Log to stderr, plus a daily-rolling file when a log directory is set.
fn init_tracing(config: &RelayConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "channel-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .init();
            None
        }
    }
}
