use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rfp_engine::analysis::{AnalysisQueue, LlmProposalAnalyzer, spawn_analysis_workers};
use rfp_engine::config::EngineConfig;
use rfp_engine::llm::create_provider;
use rfp_engine::mailbox::{ImapMailbox, IngestProcessor, MailboxPoller};
use rfp_engine::proposals::ProposalManager;
use rfp_engine::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = EngineConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "RFP engine starting");

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("Failed to open database at {}", config.database_path.display())
            })?,
    );

    // ── Analysis ─────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm).context("Failed to create LLM provider")?;
    info!(backend = %config.llm.backend, model = %config.llm.model, "LLM provider ready");
    let analyzer = Arc::new(LlmProposalAnalyzer::new(llm, &config.analysis));

    let (queue, receiver) = AnalysisQueue::bounded(config.analysis.queue_capacity);
    let manager = Arc::new(ProposalManager::new(Arc::clone(&db), analyzer).with_queue(queue));
    let workers = spawn_analysis_workers(Arc::clone(&manager), receiver, config.analysis.workers);

    // ── Mailbox ──────────────────────────────────────────────────────────
    let poller = match &config.mailbox {
        Some(mailbox) => {
            let client = Arc::new(ImapMailbox::new(mailbox.clone()));
            let processor = Arc::new(IngestProcessor::new(Arc::clone(&db), Arc::clone(&manager)));
            Some(MailboxPoller::spawn(mailbox, client, processor))
        }
        None => {
            warn!("IMAP configuration missing, mailbox poller not started");
            None
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    if let Some(poller) = poller {
        poller.stop().await;
    }
    workers.shutdown().await;

    info!("RFP engine stopped");
    Ok(())
}

/// Console logging always; daily-rotated files when a log directory is set.
fn init_tracing(config: &EngineConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "rfp-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
