use std::sync::Arc;

use axum::{
    Router, debug_handler,
    extract::{Extension, Json, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use brokerline_bus::{Envelope, QueueError, SharedQueueService};
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{Instrument, info, warn};

pub const PUBLISHED_MESSAGE: &str = "Message published to queue successfully";

#[derive(Clone)]
pub struct GatewayState {
    pub queue: SharedQueueService,
}

impl GatewayState {
    pub fn new(queue: SharedQueueService) -> Self {
        Self { queue }
    }
}

#[derive(Serialize, Debug)]
pub struct PublishResponse {
    success: bool,
    message: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    status: String,
    timestamp: String,
    queue_provider: String,
}

#[derive(Serialize, Debug)]
pub struct ApiError {
    error: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/messages", post(publish_message))
        .route("/health", get(health))
        .layer(Extension(Arc::new(state)))
}

#[debug_handler]
async fn publish_message(
    Extension(state): Extension<Arc<GatewayState>>,
    payload: Result<Json<Envelope>, JsonRejection>,
) -> ApiResult<PublishResponse> {
    let Json(envelope) =
        payload.map_err(|rejection| reject(StatusCode::BAD_REQUEST, rejection.body_text()))?;
    handle_publish(state.as_ref(), envelope).await
}

/// Validates and publishes one envelope through the configured adapter.
pub async fn handle_publish(state: &GatewayState, envelope: Envelope) -> ApiResult<PublishResponse> {
    let span = tracing::info_span!(
        "publish",
        message_type = %envelope.kind,
        provider = %state.queue.provider()
    );
    async move {
        envelope
            .validate()
            .map_err(|err| reject(StatusCode::BAD_REQUEST, err.to_string()))?;

        state.queue.publish(&envelope).await.map_err(|err| {
            let status = status_for(&err);
            warn!(error = %err, status = status.as_u16(), "publish rejected");
            reject(status, err.to_string())
        })?;

        info!("message accepted");
        Ok(Json(PublishResponse {
            success: true,
            message: PUBLISHED_MESSAGE.into(),
        }))
    }
    .instrument(span)
    .await
}

#[debug_handler]
async fn health(Extension(state): Extension<Arc<GatewayState>>) -> Json<HealthResponse> {
    let now = OffsetDateTime::now_utc();
    let timestamp = now
        .format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string());
    Json(HealthResponse {
        status: "ok".into(),
        timestamp,
        queue_provider: state.queue.provider().to_string(),
    })
}

fn status_for(err: &QueueError) -> StatusCode {
    match err {
        QueueError::InvalidEnvelope(_) => StatusCode::BAD_REQUEST,
        err if err.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn reject(status: StatusCode, error: String) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError { error }))
}
