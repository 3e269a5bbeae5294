use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use coach_core::affinity::SessionAffinity;
use coach_core::channels::TelegramChannel;
use coach_core::config::CoreConfig;
use coach_core::dispatch::Dispatcher;
use coach_core::llm::create_provider_chain;
use coach_core::routes::api_routes;
use coach_core::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Console always; a daily rolling file too when COACH_LOG_DIR is set.
    let (file_layer, _log_guard) = match std::env::var("COACH_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "coach.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let config = CoreConfig::from_env().context("invalid configuration")?;

    eprintln!("🏋️ Coach Core v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Providers: {}", config.providers.len());
    eprintln!("   HTTP: http://0.0.0.0:{}/api/messages", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path))?,
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Core ─────────────────────────────────────────────────────────────
    let llm = create_provider_chain(&config.providers, config.generation_timeout);
    let affinity = Arc::new(SessionAffinity::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&db), llm, affinity, &config));

    // ── Telegram ─────────────────────────────────────────────────────────
    if let Some(token) = config.telegram_bot_token.clone() {
        let telegram = Arc::new(TelegramChannel::new(token, Arc::clone(&dispatcher)));
        match telegram.verify().await {
            Ok(()) => {
                eprintln!("   Telegram: enabled");
                tokio::spawn(telegram.run());
            }
            Err(e) => tracing::error!(error = %e, "Telegram disabled"),
        }
    }

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(dispatcher, db);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
