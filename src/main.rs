use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketflow_backend::api::create_router;
use marketflow_backend::config::AppConfig;
use marketflow_backend::context::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    info!("🚀 Marketflow ingestion backend starting");

    let config = AppConfig::from_env();
    let port = config.port;

    let ctx = AppContext::build(config).await?;
    ctx.start().await?;

    let app = create_router(ctx.clone())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            marketflow_backend::middleware::request_logging,
        ));

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    let shutdown_ctx = ctx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            shutdown_ctx.stop().await;
        })
        .await
        .context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-filter overrides.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marketflow_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
