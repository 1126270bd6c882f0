//! REST notification ingress.
//!
//! `POST /api/notifications/send` delivers to one user's connections,
//! `POST /api/notifications/broadcast` publishes on the notification topic.
//! Both reply with the stamped notification.

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use courier_core::{DispatchError, NotificationDraft};
use courier_protocol::{Notification, Severity};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Notification request body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub severity: Severity,
    #[serde(default)]
    pub recipient: Option<String>,
}

/// REST errors, all reported as 400.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Body is not valid JSON for a notification.
    #[error("Invalid request body: {0}")]
    Body(#[from] JsonRejection),

    /// Targeted send without a recipient.
    #[error("recipient is required")]
    MissingRecipient,

    /// Notification rejected by the dispatcher.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// REST routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/notifications/send", post(send_notification))
        .route("/api/notifications/broadcast", post(broadcast_notification))
}

async fn send_notification(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<Json<Notification>, ApiError> {
    let Json(request) = body?;
    if request.recipient.is_none() {
        return Err(ApiError::MissingRecipient);
    }
    deliver(&state, request).map(Json)
}

async fn broadcast_notification(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NotificationRequest>, JsonRejection>,
) -> Result<Json<Notification>, ApiError> {
    let Json(request) = body?;
    deliver(
        &state,
        NotificationRequest {
            recipient: None,
            ..request
        },
    )
    .map(Json)
}

fn deliver(state: &AppState, request: NotificationRequest) -> Result<Notification, ApiError> {
    let (notification, report) = state.hub.notify(NotificationDraft {
        title: request.title,
        message: request.message,
        severity: request.severity,
        recipient: request.recipient,
    })?;
    metrics::record_delivery(report);

    info!(
        recipient = notification.recipient.as_deref().unwrap_or("*"),
        delivered = report.delivered,
        "REST notification sent"
    );
    Ok(notification)
}
