use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use support_responder::config::AppConfig;
use support_responder::llm::{LlmConfig, create_provider, verify_model};
use support_responder::mail::{ImapMailSource, MailSource, SmtpReplySender};
use support_responder::pipeline::{
    AutoApprove, Confirmer, LlmDrafter, Poller, PollerConfig, PollerDeps, TerminalConfirmer,
    TokioPacer,
};
use support_responder::store::DedupStore;

#[derive(Debug, Parser)]
#[command(version, about = "Answers support mail with LLM-drafted replies")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
}

/// Console logging, plus a daily rolling file when `log_dir` is set.
/// The returned guard must outlive the program for file output to flush.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("support-responder")
                .filename_suffix("log")
                .build(dir)
                .with_context(|| format!("cannot open log directory {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = AppConfig::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  config file: {}", cli.config.display());
        std::process::exit(1);
    });

    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    eprintln!("📬 Support Responder v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   IMAP: {}:{}",
        config.email.imap_host, config.email.imap_port
    );
    eprintln!(
        "   SMTP: {}:{}",
        config.email.smtp_host, config.email.smtp_port
    );
    eprintln!("   Account: {}", config.email.address);
    eprintln!("   Folders: {}", config.folder_names().join(", "));
    eprintln!("   Interval: {}s", config.check_interval.as_secs());
    eprintln!("   Model: {}", config.model);
    eprintln!("   Company: {}", config.branding.company_name);
    eprintln!(
        "   Confirm before send: {}",
        if config.confirm_before_send { "yes" } else { "no" }
    );
    eprintln!("   State: {}", config.state_file.display());

    // ── LLM ─────────────────────────────────────────────────────────────
    let llm_config = LlmConfig {
        api_key: config.openai_api_key.clone(),
        model: config.model.clone(),
    };
    verify_model(&llm_config)
        .await
        .with_context(|| format!("model '{}' is not usable", config.model))?;
    let llm = create_provider(&llm_config)?;

    // ── Dedup store ─────────────────────────────────────────────────────
    let folders = config.folder_names();
    let store = DedupStore::load(&config.state_file, &folders)?;
    let already: usize = store.folders().map(|f| store.handled(f).len()).sum();
    eprintln!("   Already handled: {already} message(s)\n");

    // ── Mail ────────────────────────────────────────────────────────────
    let source: Arc<dyn MailSource> = Arc::new(ImapMailSource::new(config.email.clone()));
    let mut sender = SmtpReplySender::new(config.email.clone());
    if config.save_replies {
        sender = sender.with_archive(Arc::clone(&source));
    }

    let confirmer: Arc<dyn Confirmer> = if config.confirm_before_send {
        Arc::new(TerminalConfirmer::terminal())
    } else {
        Arc::new(AutoApprove)
    };

    let deps = PollerDeps {
        source,
        drafter: Arc::new(LlmDrafter::from_config(llm, &config)),
        confirmer,
        sender: Arc::new(sender),
        pacer: Arc::new(TokioPacer),
    };

    // ── Shutdown ────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut poller = Poller::new(PollerConfig::from_app(&config), deps, store, shutdown_rx);
    poller.run().await;

    eprintln!("\nMonitoring stopped by user.");
    Ok(())
}
