// Server bootstrap and shared middleware.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::AppConfig;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
};
use crate::slack::HttpSlackApi;
use crate::store::pool::{check_pool_health, create_pg_pool, run_migrations, PoolConfig};
use crate::store::UserStore;

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env().context("configuration is incomplete")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter)),
        )
        .init();

    let store = build_store(&config).await?;
    let slack = Arc::new(HttpSlackApi::new(
        config.slack_api_base.clone(),
        config.slack_client_id.clone(),
        config.slack_client_secret.clone(),
    ));

    let listen_addr = config.listen_addr;
    let state = ApiState::new(config, slack, store).context("failed to build api state")?;
    let app = build_router(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {listen_addr}"))?;

    info!(listen_addr = %listen_addr, "starting kagiban server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")
}

async fn build_store(config: &AppConfig) -> Result<UserStore> {
    match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize PostgreSQL pool")?;
            check_pool_health(&pool).await?;
            run_migrations(&pool).await?;
            Ok(UserStore::postgres(pool))
        }
        None => {
            warn!("KAGIBAN_DATABASE_URL is not set; using the in-memory store (state is lost on restart)");
            Ok(UserStore::memory())
        }
    }
}

pub fn build_router(state: ApiState) -> Router {
    apply_middleware(Router::new().route("/healthz", get(healthz)).merge(api::router(state)))
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response =
        with_request_id_scope(request_id.clone(), async move { next.run(request).await }).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
