use axum::Json;
use axum::extract::State;
use log::info;
use serde::Serialize;

use super::AppState;
use crate::core::registry::{CacheStatus, ModelCounts};
use crate::inference::Model;

#[derive(Serialize, Debug)]
pub struct ModelsResponse {
    pub models: Vec<Model>,
}

#[derive(Serialize, Debug)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub cors_enabled: bool,
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state.registry.get_all_models().await;
    info!("Serving {} models", models.len());
    Json(ModelsResponse { models })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        message: "Konexion backend is running",
        cors_enabled: true,
    })
}

pub async fn models_status(State(state): State<AppState>) -> Json<CacheStatus> {
    Json(state.registry.cache_status().await)
}

pub async fn refresh_models(State(state): State<AppState>) -> Json<ModelCounts> {
    info!("Refreshing model caches on request");
    state.registry.refresh().await;
    Json(state.registry.preload().await)
}
