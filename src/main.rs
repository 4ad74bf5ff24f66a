use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mapae::auth::Service;
use mapae::config::Settings;
use mapae::smtp::SmtpServer;
use mapae::storage::{MemoryStore, RedisStore, Store};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let settings = Arc::new(Settings::from_env());

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if settings.debug {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Starting mapae");

    let store: Arc<dyn Store> = if settings.use_in_memory_store || settings.redis_url.trim().is_empty()
    {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        match RedisStore::connect(settings.redis_url.trim()).await {
            Ok(store) => {
                info!("Using Redis store");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to initialize Redis client: {}", e);
                return ExitCode::FAILURE;
            }
        }
    };

    let service = match Service::new(store, settings.clone()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to initialize verification service: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();

    let smtp_server = SmtpServer::new(settings.clone(), service.clone());
    let smtp_shutdown = shutdown.clone();
    let smtp_task = tokio::spawn(async move {
        if let Err(e) = smtp_server.run(smtp_shutdown).await {
            error!("SMTP server stopped: {}", e);
        }
    });

    let http_shutdown = shutdown.clone();
    let http_settings = settings.clone();
    let http_service = service.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = mapae::http::run(http_settings, http_service, http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_signal().await;
    info!("Shutting down...");
    shutdown.cancel();

    // Give the HTTP server a bounded window to drain in-flight requests.
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, http_task).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, smtp_task).await;

    ExitCode::SUCCESS
}

async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
