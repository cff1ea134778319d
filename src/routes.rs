use axum::{
    Router,
    extract::{State, rejection::JsonRejection},
    response::Json,
    routing::{get, post},
};
use metrics::counter;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::model_loader::ModelState;
use crate::types::{
    HealthResponse, InfoResponse, ModelInfoBody, PredictionRequest, PredictionResponse,
};

pub const GREETING: &str = "Sentiment Analysis API is running!";

#[derive(Clone)]
pub struct AppState {
    model: Arc<ModelState>,
}

impl AppState {
    pub fn new(model: ModelState) -> Self {
        Self {
            model: Arc::new(model),
        }
    }

    fn unavailable(&self) -> ApiError {
        ApiError::ModelNotLoaded {
            reason: self
                .model
                .degraded_reason()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    // Open policy: any origin, method and header.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .layer(cors)
        .with_state(state)
}

async fn root_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    let model_info = match state.model.handle() {
        Some(handle) => ModelInfoBody::Loaded(handle.info.clone()),
        None => ModelInfoBody::Empty {},
    };

    Json(InfoResponse {
        message: GREETING,
        model_loaded: state.model.is_loaded(),
        model_info,
    })
}

async fn health_handler(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    if !state.model.is_loaded() {
        return Err(state.unavailable());
    }
    Ok(Json(HealthResponse {
        status: "healthy",
        model_loaded: true,
    }))
}

#[tracing::instrument(skip(state, payload), fields(request_id = %uuid::Uuid::new_v4().simple()))]
async fn predict_handler(
    State(state): State<AppState>,
    payload: Result<Json<PredictionRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, ApiError> {
    counter!("prediction_requests_total").increment(1);

    let Json(request) = payload.inspect_err(|rejection| {
        tracing::debug!(error = %rejection, "Rejected prediction request body");
    })?;
    let handle = state.model.handle().ok_or_else(|| state.unavailable())?;

    tracing::info!(text_len = request.text.len(), "Processing prediction request");

    let prediction = async {
        let probs = handle.engine.classify(request.text.clone()).await?;
        PredictionResponse::from_probabilities(request.text, &handle.info.labels, &probs)
    }
    .await
    .map_err(|e| {
        counter!("prediction_errors_total").increment(1);
        tracing::error!("Error during prediction: {e:#}");
        ApiError::Prediction(format!("{e:#}"))
    })?;

    tracing::info!(
        label = %prediction.label,
        score = prediction.score,
        "Prediction completed successfully"
    );
    Ok(Json(prediction))
}
