use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use ledermail_api::app::{self, services};
use ledermail_api::cli::{self, Cli, Command};
use ledermail_core::EmailAddress;
use ledermail_infra::{AppConfig, PostgresEmailQueueStore, QueueRunner, SmtpMailTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    ledermail_observability::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { listen, no_runner } => serve(listen, no_runner).await,
        Command::Run => run().await,
        Command::Once => once().await,
        Command::SmtpTest { to } => smtp_test(&to).await,
        Command::Migrate => migrate().await,
    }
}

async fn serve(listen: Option<std::net::SocketAddr>, no_runner: bool) -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let services = Arc::new(services::build_services(&config).await?);

    let runner = (!no_runner)
        .then(|| QueueRunner::new(services.worker(), config.runner.clone()).spawn());

    let addr = listen.unwrap_or(config.listen_addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app::build_app(services.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    services.wait_for_cycles().await;
    if let Some(runner) = runner {
        runner.shutdown().await;
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let services = services::build_services(&config).await?;

    let stats = QueueRunner::new(services.worker(), config.runner.clone())
        .run_until(shutdown_signal())
        .await;
    info!(
        cycles = stats.cycles,
        failed_cycles = stats.failed_cycles,
        emails_sent = stats.emails_sent,
        "runner stopped"
    );
    Ok(())
}

async fn once() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let services = services::build_services(&config).await?;

    let report = services.process_queue().await?;
    info!(
        fetched = report.fetched,
        sent = report.sent,
        failed = report.failed,
        skipped = report.skipped,
        store_errors = report.store_errors,
        "Email queue processed successfully."
    );
    Ok(())
}

async fn smtp_test(to: &str) -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let to = EmailAddress::parse(to)?;
    let transport = SmtpMailTransport::new(config.smtp.clone());

    info!(
        host = %config.smtp.host,
        port = config.smtp.port,
        tls = ?config.smtp.tls,
        "testing smtp relay"
    );
    match cli::send_test_message(&transport, to, &config.smtp.from_name).await {
        Ok(receipt) => {
            info!(message_id = %receipt.message_id, response = %receipt.response, "test email sent");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "smtp test failed");
            Err(e.into())
        }
    }
}

async fn migrate() -> anyhow::Result<()> {
    let url = AppConfig::database_url_from_env()?;
    let store = PostgresEmailQueueStore::connect(&url).await?;
    store.migrate().await?;
    info!("email_queue schema is up to date");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
