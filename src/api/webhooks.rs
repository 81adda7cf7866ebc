//! Webhook ingress — asynchronous provider callbacks.
//!
//! Handlers are idempotent: events are deduped on (provider, event_id)
//! and duplicates are accepted and silently discarded.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::engine::Clock;
use crate::model::{EnrollmentStatus, LogEntry, LogOutcome};
use crate::store::Store;

pub fn webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/email", post(email_webhook))
        .route("/webhooks/voice", post(voice_webhook))
}

// ── Email events ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct EmailEvent {
    pub provider: String,
    pub event_id: String,
    /// delivered | opened | bounced | replied
    pub event: String,
    /// Provider message reference from the original send.
    pub external_ref: Option<String>,
}

/// POST /webhooks/email
pub async fn email_webhook(
    State(state): State<AppState>,
    Json(event): Json<EmailEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = match event.event.as_str() {
        "delivered" => LogOutcome::Delivered,
        "open" | "opened" => LogOutcome::Opened,
        "bounce" | "bounced" => LogOutcome::Bounced,
        "reply" | "replied" => LogOutcome::Replied,
        other => {
            return Err(ApiError::validation(format!(
                "unknown email event '{other}'"
            )));
        }
    };

    let now = state.ctx.clock.now();
    if !state
        .ctx
        .store
        .try_mark_webhook_event(&event.provider, &event.event_id, now)
        .await?
    {
        debug!(provider = %event.provider, event_id = %event.event_id, "Duplicate email webhook");
        return Ok(Json(json!({ "status": "duplicate" })));
    }

    let Some(external_ref) = event.external_ref.as_deref() else {
        return Ok(Json(json!({ "status": "ignored" })));
    };
    let Some(original) = state.ctx.store.find_log_by_external_ref(external_ref).await? else {
        debug!(external_ref, "Email webhook references an unknown send");
        return Ok(Json(json!({ "status": "ignored" })));
    };

    let entry = linked_entry(&original, outcome, now);
    state.ctx.store.append_log(&entry).await?;
    info!(
        external_ref,
        event = %event.event,
        "Email event recorded"
    );
    Ok(Json(json!({ "status": "recorded" })))
}

// ── Voice events ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct VoiceEvent {
    pub provider: String,
    pub event_id: String,
    pub call_id: String,
    /// call.started | call.completed | call.failed
    pub event: String,
}

/// POST /webhooks/voice
///
/// A completed call also pulls the enrollment's due time forward so the
/// next step runs immediately instead of waiting out its pre-delay.
pub async fn voice_webhook(
    State(state): State<AppState>,
    Json(event): Json<VoiceEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = match event.event.as_str() {
        "call.started" => LogOutcome::CallStarted,
        "call.completed" => LogOutcome::CallCompleted,
        "call.failed" => LogOutcome::CallFailed,
        other => {
            return Err(ApiError::validation(format!(
                "unknown voice event '{other}'"
            )));
        }
    };

    let now = state.ctx.clock.now();
    if !state
        .ctx
        .store
        .try_mark_webhook_event(&event.provider, &event.event_id, now)
        .await?
    {
        debug!(provider = %event.provider, event_id = %event.event_id, "Duplicate voice webhook");
        return Ok(Json(json!({ "status": "duplicate" })));
    }

    let Some(original) = state
        .ctx
        .store
        .find_log_by_external_ref(&event.call_id)
        .await?
    else {
        debug!(call_id = %event.call_id, "Voice webhook references an unknown call");
        return Ok(Json(json!({ "status": "ignored" })));
    };

    let entry = linked_entry(&original, outcome, now);
    state.ctx.store.append_log(&entry).await?;

    if outcome == LogOutcome::CallCompleted {
        if let Some(enrollment_id) = original.enrollment_id {
            advance_enrollment(&state, enrollment_id).await?;
        }
    }

    info!(call_id = %event.call_id, event = %event.event, "Voice event recorded");
    Ok(Json(json!({ "status": "recorded" })))
}

/// Pull a waiting enrollment's due time forward to now.
async fn advance_enrollment(state: &AppState, enrollment_id: Uuid) -> Result<(), ApiError> {
    let Some(mut enrollment) = state.ctx.store.get_enrollment(enrollment_id).await? else {
        return Ok(());
    };
    if !matches!(
        enrollment.status,
        EnrollmentStatus::Waiting | EnrollmentStatus::Pending
    ) {
        return Ok(());
    }

    let now = state.ctx.clock.now();
    if enrollment.due_at <= now {
        return Ok(());
    }
    enrollment.due_at = now;
    enrollment.status = EnrollmentStatus::Pending;
    enrollment.updated_at = now;

    match state.ctx.store.update_enrollment(&enrollment, None).await {
        Ok(()) => {
            info!(enrollment = %enrollment_id, "Enrollment advanced by call completion");
            Ok(())
        }
        // A worker holds the row right now; it will reschedule itself.
        Err(crate::error::DatabaseError::ConcurrencyConflict { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn linked_entry(
    original: &LogEntry,
    outcome: LogOutcome,
    now: chrono::DateTime<chrono::Utc>,
) -> LogEntry {
    LogEntry {
        id: Uuid::new_v4(),
        enrollment_id: original.enrollment_id,
        step_index: original.step_index,
        channel: original.channel,
        sender_email: original.sender_email.clone(),
        recipient_id: original.recipient_id.clone(),
        outcome,
        external_ref: original.external_ref.clone(),
        subject: None,
        timestamp: now,
        variant_tags: Vec::new(),
    }
}
