use axum::{Router, Server, http::StatusCode, routing::get};
use gae_request_log::{AppError, AppResult, Config, RequestLoggerLayer, init_tracing};
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> AppResult<()> {
    let config = Config::from_env()?;
    init_tracing(&config);

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(index))
        .route("/warn", get(warn_twice))
        .route("/fail", get(fail))
        .layer(cors)
        .layer(RequestLoggerLayer::new(config.request_logger()));

    let addr: SocketAddr = config
        .server_address()
        .parse()
        .map_err(|e| AppError::config(format!("Invalid server address: {}", e)))?;

    info!(
        %addr,
        project = config.google_cloud_project.as_deref().unwrap_or("-"),
        service = config.gae_service.as_deref().unwrap_or("-"),
        "Server running"
    );

    Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| AppError::Io(std::io::Error::other(e)))
}

async fn index() -> &'static str {
    info!("rendering index");
    "ok"
}

async fn warn_twice() -> &'static str {
    warn!(remaining = 3, "quota running low");
    error!("upstream returned garbage, using cached value");
    "served from cache"
}

async fn fail() -> (StatusCode, &'static str) {
    error!(code = "E_DB", "database unavailable");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
