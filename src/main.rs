//! Level Up Billing Server
//!
//! Stripe webhook reconciliation with asynchronous email dispatch.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use uuid::Uuid;

use levelup_billing::config::AppConfig;
use levelup_billing::handlers::AppState;
use levelup_billing::mailer::{LogTransport, MailTransport, Mailer, ResendTransport};
use levelup_billing::stripe::{InMemorySubscriptionGateway, UserRecord, WebhookState, WEBHOOK_PATH};

/// Level Up Billing Server
#[derive(Parser, Debug)]
#[command(name = "levelup-server")]
#[command(author = "Level Up Backend Team <team@levelup.dev>")]
#[command(version)]
#[command(about = "Stripe webhook reconciliation and email dispatch")]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Seed the in-memory store with a user (`email` or `email:name`)
    #[arg(long = "seed-user", value_name = "EMAIL[:NAME]")]
    seed_users: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_filter = if args.verbose {
        "levelup_billing=debug,levelup_server=debug,tower_http=debug"
    } else {
        "levelup_billing=info,levelup_server=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::from_env().context("failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let transport: Arc<dyn MailTransport> = match &config.mailer.resend_api_key {
        Some(key) => {
            info!("Mail transport: Resend API");
            Arc::new(ResendTransport::new(key.clone()))
        }
        None => {
            info!("Mail transport: log only (RESEND_API_KEY not set)");
            Arc::new(LogTransport)
        }
    };
    let mailer = Mailer::spawn(
        config.mailer.queue_capacity,
        config.mailer.workers,
        transport,
        config.mailer.from.clone(),
    );

    let gateway = Arc::new(InMemorySubscriptionGateway::new());
    for seed in &args.seed_users {
        let (email, name) = seed.split_once(':').unwrap_or((seed.as_str(), ""));
        let user = UserRecord::new(Uuid::new_v4(), email, name);
        info!(user_id = %user.user_id, email = %user.email, "Seeded user");
        gateway.insert_user(user);
    }

    let webhook = Arc::new(WebhookState::from_config(
        &config.webhook,
        gateway,
        mailer.clone(),
    ));
    let app = levelup_billing::app(Arc::new(AppState::new(webhook)));

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        "{} v{} listening on {} (webhook: {})",
        levelup_billing::NAME,
        levelup_billing::VERSION,
        addr,
        WEBHOOK_PATH
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // HTTP is drained first so no handler can enqueue after close
    info!("HTTP server stopped, draining mail queue");
    mailer.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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
    info!("Shutdown signal received, stopping server...");
}
