//! RoleGate API - Role Governance Service
//!
//! Maker-checker approval for every change to the role graph: a role's own
//! definition, the functions granted to it and the child roles composed into
//! it. Changes are held as proposals and reach the live graph only once enough
//! distinct principals have approved them.

mod auth;
mod config;
mod error;
mod governance;
mod models;
mod routes;
mod state;
mod store;

use crate::config::{DatabaseConfig, Settings};
use crate::routes::create_router;
use crate::state::AppState;
use crate::store::{create_governance_tables, MemoryStore, PgStore, StorageBackend};
use deadpool_postgres::{Config, ManagerConfig, PoolConfig, RecyclingMethod, Runtime};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting RoleGate - Role Governance Service...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let app = match settings.storage.backend {
        StorageBackend::PostgreSQL => {
            let pool = init_database_pool(&settings.database).await?;
            info!("✅ Database pool created successfully");

            create_governance_tables(&pool).await?;

            let state = Arc::new(AppState::new(PgStore::new(pool), &settings.auth.jwt_secret));
            create_router(state, &settings)
        }
        StorageBackend::InMemory => {
            warn!("⚠️  Using in-memory storage; all roles and proposals are lost on shutdown");
            let state = Arc::new(AppState::new(MemoryStore::new(), &settings.auth.jwt_secret));
            create_router(state, &settings)
        }
    };

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   GET    /health                       - Health check");
    info!("   GET    /api/roles                    - List live roles");
    info!("   GET    /api/roles/{{id}}               - Get a live role");
    info!("   POST   /api/roles                    - Propose a new role");
    info!("   PUT    /api/roles/{{id}}               - Propose role changes");
    info!("   DELETE /api/roles/{{id}}               - Propose role removal");
    info!("   POST   /api/roles/{{id}}/approve       - Approve pending proposals");
    info!("   POST   /api/roles/{{id}}/decline       - Decline pending proposals");
    info!("   GET    /api/roles/{{id}}/transients    - Current review wave");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rolegate_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Initialize the database pool, with TLS when the host requires it
async fn init_database_pool(database: &DatabaseConfig) -> anyhow::Result<deadpool_postgres::Pool> {
    let use_tls = database.requires_tls();

    let mut cfg = Config::new();
    cfg.host = Some(database.host.clone());
    cfg.port = Some(database.port);
    cfg.user = Some(database.user.clone());
    cfg.password = Some(database.password.clone());
    cfg.dbname = Some(database.database.clone());
    cfg.pool = Some(PoolConfig::new(database.max_pool_size));
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = if use_tls {
        let certs = rustls_native_certs::load_native_certs();
        for e in &certs.errors {
            warn!("⚠️  Skipping unreadable native certificate: {}", e);
        }
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

        cfg.create_pool(Some(Runtime::Tokio1), tls)
            .map_err(|e| anyhow::anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow::anyhow!("Failed to create pool: {}", e))?
    };

    // Test the connection
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow::anyhow!("Failed to verify database connection: {}", e))?;

    info!(
        "✅ Database connection successful ({}:{}/{}, TLS: {})",
        database.host, database.port, database.database, use_tls
    );
    Ok(pool)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
