use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use radportal_notifications::{
    ConsentPreference, ConsentUpdate, DeliveryLogEntry, DomainEvent, NotificationRequest,
    NotificationService, NotificationStats, ProviderCallback, SendOutcome,
};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Serialize)]
struct HealthResponse<'a> {
    status: &'a str,
    storage: &'a str,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match &state.pool {
        None => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                storage: "memory",
            }),
        ),
        Some(pool) => match radportal_db_postgres::ping(pool).await {
            Ok(()) => (
                StatusCode::OK,
                Json(HealthResponse {
                    status: "ok",
                    storage: "postgres",
                }),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "health check: database unreachable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(HealthResponse {
                        status: "unavailable",
                        storage: "postgres",
                    }),
                )
            }
        },
    }
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.as_ref().map(|handle| handle.render()) {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics exporter not installed".to_string(),
        ),
    }
}

// ---- Provider webhooks ----

/// Delivery status callback. Unknown message ids are acknowledged so the
/// provider stops redelivering them.
pub async fn sms_status(
    State(state): State<AppState>,
    Json(callback): Json<ProviderCallback>,
) -> Result<impl IntoResponse, ApiError> {
    state.system.tracker.handle(&callback).await?;
    Ok(Json(json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
pub struct InboundSms {
    pub from: String,
    pub body: String,
}

pub async fn sms_inbound(
    State(state): State<AppState>,
    Json(inbound): Json<InboundSms>,
) -> Result<impl IntoResponse, ApiError> {
    let opted_out = state
        .system
        .consent
        .process_opt_out_keyword(&inbound.from, &inbound.body)
        .await?;
    Ok(Json(json!({ "optedOut": opted_out })))
}

// ---- Automation triggers ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTrigger {
    pub event: String,
    pub entity_id: String,
}

#[derive(Serialize)]
struct EventResponse {
    event: &'static str,
    outcomes: Vec<SendOutcome>,
}

pub async fn automation_event(
    State(state): State<AppState>,
    Json(trigger): Json<EventTrigger>,
) -> Result<impl IntoResponse, ApiError> {
    let event = DomainEvent::parse(&trigger.event, trigger.entity_id)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown event '{}'", trigger.event)))?;
    let outcomes = state.system.orchestrator.handle(&event).await?;
    Ok(Json(EventResponse {
        event: event.name(),
        outcomes,
    }))
}

// ---- Consent management ----

pub async fn get_preferences(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Result<Json<ConsentPreference>, ApiError> {
    Ok(Json(state.system.consent.get_preferences(&patient_id).await?))
}

pub async fn update_preferences(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    Json(update): Json<ConsentUpdate>,
) -> Result<Json<ConsentPreference>, ApiError> {
    Ok(Json(
        state
            .system
            .consent
            .update_preferences(&patient_id, &update)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct OptOutBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn opt_out(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
    body: Option<Json<OptOutBody>>,
) -> Result<Json<ConsentPreference>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Patient request".to_string());
    Ok(Json(
        state
            .system
            .consent
            .opt_out_completely(&patient_id, &reason)
            .await?,
    ))
}

pub async fn resubscribe(
    State(state): State<AppState>,
    Path(patient_id): Path<String>,
) -> Result<Json<ConsentPreference>, ApiError> {
    Ok(Json(state.system.consent.resubscribe(&patient_id).await?))
}

// ---- Notification inspection ----

#[derive(Serialize)]
struct NotificationDetail {
    notification: NotificationRequest,
    history: Vec<DeliveryLogEntry>,
}

pub async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = &state.system.engine;
    let notification = engine
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("notification {id}")))?;
    let history = engine.history(&id).await?;
    Ok(Json(NotificationDetail {
        notification,
        history,
    }))
}

pub async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let engine = &state.system.engine;
    let Some(existing) = engine.get(&id).await? else {
        return Err(ApiError::NotFound(format!("notification {id}")));
    };
    if engine.cancel(&id).await? {
        return Ok((StatusCode::OK, Json(json!({ "cancelled": true }))));
    }
    Ok((
        StatusCode::CONFLICT,
        Json(json!({
            "cancelled": false,
            "status": existing.status.as_str(),
        })),
    ))
}

pub async fn notification_stats(
    State(state): State<AppState>,
) -> Result<Json<NotificationStats>, ApiError> {
    Ok(Json(state.system.engine.stats().await?))
}

// ---- Runtime administration ----

#[derive(Debug, Deserialize)]
pub struct LogLevelBody {
    pub level: String,
}

pub async fn set_log_level(Json(body): Json<LogLevelBody>) -> Result<impl IntoResponse, ApiError> {
    if !crate::observability::apply_logging_level(&body.level) {
        return Err(ApiError::BadRequest(format!(
            "cannot apply log level '{}'",
            body.level
        )));
    }
    tracing::info!(level = %body.level, "log level changed");
    Ok(Json(json!({ "level": body.level })))
}
