use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cloudbox_core::build::{ArtifactBuilder, LocalArtifactBuilder};
use cloudbox_core::sandbox::container::ContainerSandbox;
use cloudbox_core::sandbox::process::ProcessSandbox;
use cloudbox_core::sandbox::{SandboxMode, SandboxProvider, SandboxRegistry};
use cloudbox_db::store::{
    MemoryExecutionStore, MemoryFunctionStore, PgExecutionStore, PgFunctionStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudbox_api::config::{EngineConfig, ServerConfig, StoreBackend};
use cloudbox_api::router::build_app_router;
use cloudbox_api::services::{self, Stores};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "cloudbox_api=debug,cloudbox_core=info,tower_http=debug".into());
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    if config.gateway_token.is_none() {
        tracing::warn!("GATEWAY_TOKEN is not set; management routes accept any caller");
    }

    // --- Storage ---
    let (stores, pool) = match engine_config.store_backend {
        StoreBackend::Postgres => {
            let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

            let pool = cloudbox_db::create_pool(&database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            cloudbox_db::health_check(&pool)
                .await
                .expect("Database health check failed");
            tracing::info!("Database health check passed");

            cloudbox_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            let stores = Stores {
                functions: Arc::new(PgFunctionStore::new(pool.clone())),
                executions: Arc::new(PgExecutionStore::new(pool.clone())),
            };
            (stores, Some(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; functions and history are lost on restart");
            let stores = Stores {
                functions: Arc::new(MemoryFunctionStore::new()),
                executions: Arc::new(MemoryExecutionStore::new()),
            };
            (stores, None)
        }
    };

    // --- Sandboxes ---
    let mode = engine_config.sandbox_mode.resolve().await;
    let provider: Arc<dyn SandboxProvider> = match mode {
        SandboxMode::Container => Arc::new(ContainerSandbox::new(&engine_config.work_dir)),
        _ => Arc::new(ProcessSandbox::new(&engine_config.work_dir)),
    };
    let sandboxes = SandboxRegistry::uniform(provider);
    tracing::info!(
        mode = ?mode,
        work_dir = %engine_config.work_dir.display(),
        providers = ?sandboxes.describe(),
        "Sandbox providers ready"
    );

    // --- Builder ---
    let builder: Arc<dyn ArtifactBuilder> = Arc::new(LocalArtifactBuilder::new(
        &engine_config.artifacts_dir,
        engine_config.build_timeout(),
    ));

    // --- Services ---
    let (state, services) = services::start(
        config.clone(),
        &engine_config,
        stores,
        sandboxes,
        builder,
        pool,
    );

    // --- Router ---
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    services
        .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
        .await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
