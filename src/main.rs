use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use dotenvy::dotenv;
use log::info;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use trackify_server::api_router::configure_api_routes;
use trackify_server::config::AppConfig;
use trackify_server::directory::PgDirectory;
use trackify_server::maintenance::MaintenanceJob;
use trackify_server::notify::PgNotifier;
use trackify_server::shared::state::AppState;
use trackify_server::shared::utils::create_conn;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env()?;
    let pool = create_conn().context("failed to create database pool")?;

    {
        let mut conn = pool.get().context("failed to check out a connection")?;
        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("failed to run migrations: {}", e))?;
        if !applied.is_empty() {
            info!("applied {} pending migrations", applied.len());
        }
    }

    let directory = Arc::new(PgDirectory::new(pool.clone()));
    let notifier = Arc::new(PgNotifier::new(
        pool.clone(),
        config.smtp.clone(),
        config.slack_webhook.clone(),
    ));
    let state = Arc::new(AppState::new(
        pool.clone(),
        config.clone(),
        directory,
        notifier,
    ));

    Arc::new(MaintenanceJob::from_state(&state)).start();

    let app = configure_api_routes()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid server address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let handle = axum_server::Handle::new();
    let handle_clone = handle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutting down HTTP server");
        handle_clone.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    info!("HTTP server listening on {}", addr);
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
