//! API HTTP de consulta e controle (JSON).
//!
//! Os handlers só traduzem HTTP ↔ [`QueryService`]; chamadas ao banco e ao
//! link serial são bloqueantes e rodam no pool de `spawn_blocking`.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sentinela_core::health::HealthCounters;
use sentinela_core::query::{QueryError, QueryService};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

/// Estado compartilhado pelos handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: QueryService,
    pub health: Arc<HealthCounters>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/history", get(get_history))
        .route("/api/reset", post(post_reset))
        .route("/api/threshold", get(get_threshold).post(post_threshold))
        .route("/api/health", get(get_health))
        .with_state(state)
}

// ──────────────────────────────────────────────
// Erros
// ──────────────────────────────────────────────

/// Erro de handler: classe + mensagem genérica, nunca o detalhe interno.
pub enum ApiError {
    Query(QueryError),
    Internal,
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        Self::Query(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, class, message) = match &self {
            Self::Query(e) => {
                let status = match e.class() {
                    "ValidationError" => StatusCode::BAD_REQUEST,
                    "DeviceBusy" => StatusCode::SERVICE_UNAVAILABLE,
                    "LinkLost" => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status != StatusCode::BAD_REQUEST {
                    error!("Falha na API ({}): {e}", e.class());
                }
                (status, e.class(), e.public_message())
            }
            Self::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                "Falha interna".to_string(),
            ),
        };
        (
            status,
            Json(json!({ "status": "error", "error": class, "message": message })),
        )
            .into_response()
    }
}

/// Roda uma operação bloqueante do serviço fora do runtime async.
async fn blocking<T, F>(state: &ApiState, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&QueryService) -> Result<T, QueryError> + Send + 'static,
{
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || op(&service)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!("Task bloqueante abortada: {e}");
            Err(ApiError::Internal)
        }
    }
}

// ──────────────────────────────────────────────
// Handlers
// ──────────────────────────────────────────────

async fn get_status(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let status = blocking(&state, |s| s.status()).await?;
    Ok(Json(status).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<String>,
}

impl HistoryParams {
    /// `limit` que não é inteiro não-negativo cai no padrão do serviço.
    fn limit(&self) -> Option<usize> {
        self.limit.as_deref().and_then(|raw| raw.trim().parse().ok())
    }
}

async fn get_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Result<Response, ApiError> {
    let limit = params.limit();
    let history = blocking(&state, move |s| s.history(limit)).await?;
    Ok(Json(history).into_response())
}

async fn post_reset(State(state): State<ApiState>) -> Result<Response, ApiError> {
    blocking(&state, |s| s.reset()).await?;
    Ok(Json(json!({ "status": "success", "message": "Comando de reset enviado" })).into_response())
}

async fn get_threshold(State(state): State<ApiState>) -> Result<Response, ApiError> {
    let threshold = blocking(&state, |s| s.threshold()).await?;
    Ok(Json(threshold).into_response())
}

async fn post_threshold(State(state): State<ApiState>, body: Bytes) -> Result<Response, ApiError> {
    let value = blocking(&state, move |s| s.update_threshold(&body)).await?;
    Ok(Json(json!({
        "status": "success",
        "message": format!("Limite de temperatura atualizado para {value}°C"),
        "threshold": value,
    }))
    .into_response())
}

async fn get_health(State(state): State<ApiState>) -> Response {
    Json(state.health.snapshot()).into_response()
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
