use axum::Router;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use log::{info, warn};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::routes;
use super::ws;
use super::{AppState, ServerError};

/// `*` allows any origin; anything else is an explicit allow-list.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {origin}");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/api/models", get(routes::list_models))
        .route("/api/health", get(routes::health))
        .route("/api/models/status", get(routes::models_status))
        .route("/api/models/refresh", post(routes::refresh_models))
        .route("/ws/chat", get(ws::chat_socket))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Binds `host:port` and serves until Ctrl-C.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    cors_origins: &[String],
) -> Result<(), ServerError> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!("Konexion listening on http://{addr} (CORS origins: {cors_origins:?})");

    let app = build_router(state, cors_origins);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await
        .map_err(ServerError::Serve)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_accepts_wildcard_and_lists() {
        // Building the layer must not panic for any of these shapes.
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&[]);
        let _ = cors_layer(&[
            "http://localhost:3000".to_string(),
            "bad\norigin".to_string(),
        ]);
    }
}
