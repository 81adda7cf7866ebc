//! Control API — sequence CRUD, enrollment, holds, preview, test send.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::api::{ApiError, AppState};
use crate::channels::{ChannelAdapter, DispatchStatus, OutboundMessage};
use crate::engine::executor::{plan_position, NextState};
use crate::engine::Clock;
use crate::model::{
    validate_steps, Channel, Enrollment, EnrollmentStatus, LogEntry, LogOutcome, Sequence, Step,
};
use crate::store::Store;

pub fn control_routes() -> Router<AppState> {
    Router::new()
        .route("/sequences", post(create_sequence))
        .route("/sequences/{id}", put(replace_sequence_steps))
        .route("/sequences/{id}/enrollments", post(enroll_recipients))
        .route("/sequences/{id}/status", get(sequence_status))
        .route(
            "/senders/{email}/hold",
            post(hold_sender).delete(release_sender),
        )
        .route("/render/preview", post(render_preview))
        .route("/send/test", post(send_test))
        .route("/enrollments/{id}/retry", post(retry_enrollment))
}

// ── Sequences ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateSequenceRequest {
    campaign_id: String,
    name: String,
    sender_email: String,
    steps: Vec<Step>,
}

/// POST /sequences
async fn create_sequence(
    State(state): State<AppState>,
    Json(body): Json<CreateSequenceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_steps(&body.steps).map_err(|e| ApiError::validation(e.to_string()))?;

    let sequence = Sequence {
        id: Uuid::new_v4(),
        campaign_id: body.campaign_id,
        name: body.name,
        sender_email: body.sender_email,
        steps: body.steps,
        created_at: state.ctx.clock.now(),
    };
    state.ctx.store.create_sequence(&sequence).await?;
    info!(sequence = %sequence.id, name = %sequence.name, "Sequence created");
    Ok((StatusCode::CREATED, Json(sequence)))
}

#[derive(Deserialize)]
struct ReplaceStepsRequest {
    steps: Vec<Step>,
}

/// PUT /sequences/{id} — forbidden while any enrollment is in flight.
async fn replace_sequence_steps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ReplaceStepsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_steps(&body.steps).map_err(|e| ApiError::validation(e.to_string()))?;

    if state.ctx.store.get_sequence(id).await?.is_none() {
        return Err(ApiError::not_found(format!("sequence {id} not found")));
    }
    if state.ctx.store.sequence_has_in_flight(id).await? {
        return Err(ApiError::conflict(
            "sequence has in-flight enrollments; retry when they settle",
        ));
    }

    state.ctx.store.replace_sequence_steps(id, &body.steps).await?;
    let sequence = state
        .ctx
        .store
        .get_sequence(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sequence {id} not found")))?;
    Ok(Json(sequence))
}

// ── Enrollments ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EnrollRequest {
    recipient_ids: Vec<String>,
}

/// POST /sequences/{id}/enrollments — enroll a batch of recipients.
///
/// Recipients with a live enrollment on this sequence (or no contact
/// record at all) are skipped, not errors; the response reports how many
/// rows were actually created.
async fn enroll_recipients(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EnrollRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sequence = state
        .ctx
        .store
        .get_sequence(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sequence {id} not found")))?;

    let now = state.ctx.clock.now();
    let mut created = 0usize;
    let mut skipped = 0usize;

    for recipient_id in &body.recipient_ids {
        if state.ctx.store.get_recipient(recipient_id).await?.is_none() {
            skipped += 1;
            continue;
        }
        let NextState::Scheduled { step_index, due_at } = plan_position(&sequence, 0, now) else {
            // Nothing actionable in the sequence.
            skipped += 1;
            continue;
        };

        let mut enrollment = Enrollment::new(recipient_id, sequence.id, due_at);
        enrollment.step_index = step_index;
        enrollment.status = if due_at > now {
            EnrollmentStatus::Waiting
        } else {
            EnrollmentStatus::Pending
        };
        enrollment.updated_at = now;

        if state.ctx.store.create_enrollment(&enrollment).await? {
            created += 1;
        } else {
            skipped += 1;
        }
    }

    info!(sequence = %id, created, skipped, "Enrollment batch processed");
    Ok(Json(json!({ "created": created, "skipped": skipped })))
}

/// GET /sequences/{id}/status — counts per status plus last errors.
async fn sequence_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if state.ctx.store.get_sequence(id).await?.is_none() {
        return Err(ApiError::not_found(format!("sequence {id} not found")));
    }

    let counts = state.ctx.store.enrollment_status_counts(id).await?;
    let failed = state.ctx.store.list_failed_enrollments(id).await?;
    let failures: Vec<_> = failed
        .iter()
        .map(|e| {
            json!({
                "enrollment_id": e.id,
                "recipient_id": e.recipient_id,
                "step_index": e.step_index,
                "last_error_kind": e.last_error_kind,
                "last_error_message": e.last_error_message,
            })
        })
        .collect();

    Ok(Json(json!({ "counts": counts, "failed": failures })))
}

/// POST /enrollments/{id}/retry — manual reset of a failed enrollment.
async fn retry_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let enrollment = state
        .ctx
        .store
        .get_enrollment(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("enrollment {id} not found")))?;

    if enrollment.status != EnrollmentStatus::Failed {
        return Err(ApiError::conflict(format!(
            "enrollment is {}, only failed enrollments can be retried",
            enrollment.status.as_str()
        )));
    }

    let now = state.ctx.clock.now();
    state.ctx.store.reset_failed_enrollment(id, now).await?;
    info!(enrollment = %id, "Failed enrollment reset for retry");
    Ok(Json(json!({ "status": "pending", "due_at": now })))
}

// ── Sender holds ────────────────────────────────────────────────────

/// POST /senders/{email}/hold
async fn hold_sender(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_hold(&state, &email, true).await
}

/// DELETE /senders/{email}/hold
async fn release_sender(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    set_hold(&state, &email, false).await
}

async fn set_hold(
    state: &AppState,
    email: &str,
    on_hold: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.ctx.store.set_sender_hold(email, on_hold).await? {
        return Err(ApiError::not_found(format!("sender {email} not found")));
    }
    info!(sender = email, on_hold, "Sender hold toggled");
    Ok(Json(json!({ "email": email, "on_hold": on_hold })))
}

// ── Preview & test send ─────────────────────────────────────────────

#[derive(Deserialize)]
struct PreviewRequest {
    sequence_id: Uuid,
    step_index: usize,
    recipient_id: String,
}

/// POST /render/preview — render an email step without sending.
async fn render_preview(
    State(state): State<AppState>,
    Json(body): Json<PreviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sequence = state
        .ctx
        .store
        .get_sequence(body.sequence_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sequence {} not found", body.sequence_id)))?;
    let recipient = state
        .ctx
        .store
        .get_recipient(&body.recipient_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("recipient {} not found", body.recipient_id)))?;

    let rendered = state
        .executor
        .render_email(&sequence, body.step_index, &recipient)
        .await?;
    Ok(Json(rendered))
}

#[derive(Deserialize)]
struct TestSendRequest {
    sequence_id: Uuid,
    step_index: usize,
    recipient_id: String,
    /// Where the rendered email actually goes.
    to: String,
}

/// POST /send/test — send a rendered preview to a test address.
///
/// Bypasses the Rate Governor entirely (no slot, no warmup count) but
/// appends a marked log entry.
async fn send_test(
    State(state): State<AppState>,
    Json(body): Json<TestSendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sequence = state
        .ctx
        .store
        .get_sequence(body.sequence_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sequence {} not found", body.sequence_id)))?;
    let recipient = state
        .ctx
        .store
        .get_recipient(&body.recipient_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("recipient {} not found", body.recipient_id)))?;
    let sender = state
        .ctx
        .store
        .get_sender(&sequence.sender_email)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("sender {} not found", sequence.sender_email)))?;

    let rendered = state
        .executor
        .render_email(&sequence, body.step_index, &recipient)
        .await?;

    let adapter = state
        .ctx
        .channels
        .get(Channel::Email)
        .ok_or_else(|| ApiError::unavailable("email channel not configured"))?;

    let message = OutboundMessage::Email {
        to: body.to.clone(),
        subject: rendered.subject.clone(),
        rich_body: rendered.rich_body.clone(),
        plain_body: rendered.plain_body.clone(),
    };
    let result = adapter.dispatch(&message, &sender).await;

    let now = state.ctx.clock.now();
    let entry = LogEntry {
        id: Uuid::new_v4(),
        enrollment_id: None,
        step_index: body.step_index as u32,
        channel: Channel::Email,
        sender_email: sender.email.clone(),
        recipient_id: recipient.id.clone(),
        outcome: LogOutcome::Test,
        external_ref: result.external_ref.clone(),
        subject: Some(rendered.subject.clone()),
        timestamp: now,
        variant_tags: vec!["test".to_string()],
    };
    state.ctx.store.append_log(&entry).await?;

    match result.status {
        DispatchStatus::Sent => Ok(Json(json!({ "status": "sent", "to": body.to }))),
        _ => Err(ApiError::unavailable(
            result
                .detail
                .unwrap_or_else(|| "test send failed".to_string()),
        )),
    }
}
