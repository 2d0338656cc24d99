use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Method, header};
use sqlx::postgres::PgPoolOptions;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use catwalk_gateway::config::GatewayConfig;
use catwalk_gateway::directory::postgres::PgDirectory;
use catwalk_gateway::directory::{DeploymentDirectory, MemoryDirectory};
use catwalk_gateway::jsonrpc::{PROTOCOL_VERSION_HEADER, SESSION_ID_HEADER};
use catwalk_gateway::state::AppState;
use catwalk_gateway::{MAX_BODY_BYTES, watchdog};

async fn build_directory(config: &GatewayConfig) -> anyhow::Result<Arc<dyn DeploymentDirectory>> {
    if let Some(database_url) = &config.database_url {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(3))
            .idle_timeout(std::time::Duration::from_secs(600))
            .max_lifetime(std::time::Duration::from_secs(1800))
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;
        tracing::info!("directory: reading deployments from Postgres");
        return Ok(Arc::new(PgDirectory::new(pool)));
    }

    if let Some(path) = &config.deployments_file {
        return Ok(Arc::new(MemoryDirectory::from_file(path).await?));
    }

    tracing::warn!("directory: neither DATABASE_URL nor DEPLOYMENTS_FILE set, serving no deployments");
    Ok(Arc::new(MemoryDirectory::new()))
}

async fn build_app(config: GatewayConfig) -> anyhow::Result<(axum::Router, AppState)> {
    let directory = build_directory(&config).await?;
    let state = AppState::new(config, directory)?;

    // CORS: any origin, the deployment token is the gate.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(PROTOCOL_VERSION_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
        ])
        .max_age(std::time::Duration::from_secs(86_400));

    // Security headers
    let nosniff: SetResponseHeaderLayer<HeaderValue> = SetResponseHeaderLayer::overriding(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );

    // Rate limiting: 30 req burst, replenish 2 per second, per IP
    let governor_conf = GovernorConfigBuilder::default()
        .per_second(2)
        .burst_size(30)
        .finish()
        .context("invalid rate limiter configuration")?;

    // No compression layer: it would buffer event streams.
    let app = catwalk_gateway::create_router(state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(nosniff)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri().path(),
                )
            }),
        );

    Ok((app, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    let config = GatewayConfig::from_env()?;
    let port = config.port;
    let (app, state) = build_app(config).await?;

    // ── Spawn background watchdog ──
    let _watchdog = watchdog::spawn(state.clone());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("catwalk gateway listening on http://{}", addr);
    state.mark_ready();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
    .await?;

    state.processes.stop_all().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    tracing::info!("Shutdown signal received, starting graceful shutdown");
    shutdown.cancel();
}
