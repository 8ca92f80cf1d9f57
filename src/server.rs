//! Collector process: HTTP catalog view plus the ingestion listeners.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Catalog view (see [`crate::query`] for parameters) |
//! | `GET`  | `/health` | Liveness check, returns `ok` |
//!
//! Unknown paths return the JSON error body:
//!
//! ```json
//! { "error": { "code": "not_found", "message": "no route for /foo" } }
//! ```
//!
//! Query failures never surface as HTTP errors; they degrade to an empty
//! view and are logged.

use axum::{
    extract::{Query, State},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};
use tower_http::cors::{Any, CorsLayer};

use crate::collector;
use crate::config::Config;
use crate::query::{self, CatalogView};
use crate::store::Catalog;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    catalog: Catalog,
}

/// Builds the HTTP router over `catalog`.
pub fn router(catalog: Catalog) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_catalog))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(cors)
        .with_state(AppState { catalog })
}

/// Runs the stream receiver, the datagram receiver (if enabled) and the
/// HTTP server until one of them fails.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let config = Arc::new(config.clone());
    let catalog = Catalog::open(&config).await?;
    tokio::fs::create_dir_all(&config.receiver.staging_dir).await?;

    let transfer_listener = TcpListener::bind(&config.receiver.bind).await?;
    let http_listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %config.server.bind, "catalog server listening");

    let streams = collector::run_stream_listener(transfer_listener, catalog.clone(), config.clone());
    let http = async {
        axum::serve(http_listener, router(catalog.clone())).await?;
        Ok::<_, anyhow::Error>(())
    };

    if config.datagram.enabled {
        let socket = UdpSocket::bind(&config.datagram.bind).await?;
        let datagrams = collector::run_datagram_listener(socket, catalog.clone());
        tokio::try_join!(streams, datagrams, http)?;
    } else {
        tokio::try_join!(streams, http)?;
    }

    catalog.close().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

async fn handle_not_found(uri: Uri) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: format!("no route for {}", uri.path()),
    }
}

// ============ GET /health ============

async fn handle_health() -> &'static str {
    "ok"
}

// ============ GET / ============

/// Handler for `GET /`. Raw parameters go straight to the query engine,
/// which sanitizes them.
async fn handle_catalog(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<CatalogView> {
    Json(query::run_query(&state.catalog, &params).await)
}
