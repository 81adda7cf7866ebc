//! Step executor — turns one due enrollment into one dispatch.
//!
//! Resolves the step's payload, asks the Rate Governor for a slot, calls
//! the channel adapter, records the outcome, and computes the next due
//! time. Retry pauses are never in-process sleeps: every reschedule goes
//! back to the store as a new `due_at`, so restarts lose nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::{ChannelAdapter, DispatchResult, DispatchStatus, OutboundMessage};
use crate::config::EngineConfig;
use crate::engine::{Clock, EngineContext};
use crate::error::{DatabaseError, Error, Result, ValidationError};
use crate::governor::SlotDecision;
use crate::model::{
    Channel, Enrollment, EnrollmentStatus, LogEntry, LogOutcome, Recipient, Sender, Sequence, Step,
};
use crate::store::Store;
use crate::template;
use crate::util::jitter_factor;

/// Where an enrollment lands after the current position resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextState {
    Completed,
    Scheduled {
        step_index: u32,
        due_at: DateTime<Utc>,
    },
}

/// Walk the sequence from `from_index`, folding consecutive wait steps
/// (and the next actionable step's pre-delay) into one due time.
///
/// The returned index always points at an actionable step, so enrollments
/// never sit on a wait.
pub fn plan_position(sequence: &Sequence, from_index: usize, now: DateTime<Utc>) -> NextState {
    let mut index = from_index;
    let mut delay_days: i64 = 0;
    while let Some(step) = sequence.steps.get(index) {
        delay_days += i64::from(step.delay_days());
        if step.is_wait() {
            index += 1;
        } else {
            return NextState::Scheduled {
                step_index: index as u32,
                due_at: now + Duration::days(delay_days),
            };
        }
    }
    NextState::Completed
}

/// Move an enrollment to its planned position. Due times only ever move
/// forward: `plan_position` schedules relative to `now`, and `now` is at
/// or past the due time that got us here.
fn apply_plan(enrollment: &mut Enrollment, plan: NextState, now: DateTime<Utc>) {
    match plan {
        NextState::Completed => {
            enrollment.status = EnrollmentStatus::Completed;
        }
        NextState::Scheduled { step_index, due_at } => {
            enrollment.step_index = step_index;
            enrollment.due_at = due_at;
            enrollment.status = if due_at > now {
                EnrollmentStatus::Waiting
            } else {
                EnrollmentStatus::Pending
            };
        }
    }
    enrollment.updated_at = now;
}

/// Retry delay for the nth attempt: base 5 min doubling, ±20% jitter,
/// capped at 6 h. Jitter is keyed on (enrollment, attempt) so the
/// schedule is stable across restarts and monotone across attempts.
pub fn backoff_delay(config: &EngineConfig, enrollment_id: Uuid, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = config.backoff_base.as_secs_f64() * 2f64.powi(exponent as i32);
    let jittered = base * jitter_factor(&format!("{enrollment_id}:{attempt}"), 0.2);
    let capped = jittered.min(config.backoff_cap.as_secs_f64());
    Duration::milliseconds((capped * 1000.0) as i64)
}

/// A rendered email preview — what `POST /render/preview` returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RenderedEmail {
    pub to: String,
    pub subject: String,
    pub rich_body: String,
    pub plain_body: String,
    /// Template names the variable bag couldn't satisfy, surfaced so the
    /// operator catches typos before a send renders them empty.
    pub unknown_variables: Vec<String>,
}

enum Payload {
    Ready {
        message: OutboundMessage,
        subject: Option<String>,
        tags: Vec<String>,
    },
    /// Required recipient field missing — record and move on.
    Skip { reason: &'static str },
    /// Unrecoverable for this step.
    Fail { detail: String },
}

/// Executes one claimed enrollment at a time.
pub struct StepExecutor {
    ctx: Arc<EngineContext>,
}

impl StepExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Run the enrollment's current step. The enrollment must already be
    /// claimed (`in_flight`, version current).
    pub async fn execute(&self, mut enrollment: Enrollment, sequence: &Sequence) -> Result<()> {
        let now = self.ctx.clock.now();
        let index = enrollment.step_index as usize;

        // Wait steps (or an index past the snapshot end) only move the
        // pointer; no slot, no dispatch, no log entry.
        let actionable = sequence
            .steps
            .get(index)
            .and_then(|step| step.channel().map(|channel| (step.clone(), channel)));
        let Some((step, channel)) = actionable else {
            let plan = plan_position(sequence, index, now);
            apply_plan(&mut enrollment, plan, now);
            return self.persist(&enrollment, None).await;
        };

        let recipient = match self.ctx.store.get_recipient(&enrollment.recipient_id).await? {
            Some(recipient) => recipient,
            None => {
                return self
                    .fail_permanent(
                        enrollment,
                        channel,
                        &sequence.sender_email,
                        None,
                        "recipient record missing",
                        now,
                    )
                    .await;
            }
        };
        let sender = match self.ctx.store.get_sender(&sequence.sender_email).await? {
            Some(sender) => sender,
            None => {
                return self
                    .fail_permanent(
                        enrollment,
                        channel,
                        &sequence.sender_email,
                        None,
                        "sender not configured",
                        now,
                    )
                    .await;
            }
        };

        let payload = self
            .resolve_payload(&step, &recipient, &sender, sequence, now)
            .await?;
        let (message, subject, tags) = match payload {
            Payload::Ready {
                message,
                subject,
                tags,
            } => (message, subject, tags),
            Payload::Skip { reason } => {
                debug!(
                    enrollment = %enrollment.id,
                    step = index,
                    reason,
                    "Skipping step"
                );
                let log = LogEntry::new(
                    &enrollment,
                    channel,
                    &sequence.sender_email,
                    LogOutcome::Skipped,
                    now,
                )
                .with_tag(reason);
                let plan = plan_position(sequence, index + 1, now);
                apply_plan(&mut enrollment, plan, now);
                return self.persist(&enrollment, Some(&log)).await;
            }
            Payload::Fail { detail } => {
                return self
                    .fail_permanent(
                        enrollment,
                        channel,
                        &sequence.sender_email,
                        None,
                        &detail,
                        now,
                    )
                    .await;
            }
        };

        // The browser channels carry their own hard daily cap, checked
        // before the Rate Governor and independent of it.
        if matches!(channel, Channel::NetworkConnect | Channel::NetworkMessage) {
            if let Some(pool) = &self.ctx.sessions {
                if let Err(next_at) = pool.check_budget(&sender.email, now).await {
                    enrollment.status = EnrollmentStatus::Pending;
                    enrollment.due_at = next_at;
                    enrollment.updated_at = now;
                    return self.persist(&enrollment, None).await;
                }
            }
        }

        let grant = match self.ctx.governor.request_slot(&sender, now).await? {
            SlotDecision::Granted(grant) => grant,
            SlotDecision::Denied(denied) => {
                debug!(
                    enrollment = %enrollment.id,
                    sender = %sender.email,
                    reason = denied.reason.as_str(),
                    next_eligible_at = %denied.next_eligible_at,
                    "Slot denied; rescheduling"
                );
                enrollment.status = EnrollmentStatus::Pending;
                enrollment.due_at = denied.next_eligible_at;
                enrollment.updated_at = now;
                return self.persist(&enrollment, None).await;
            }
        };

        let Some(adapter) = self.ctx.channels.get(channel) else {
            self.ctx.governor.release(&grant).await;
            return self
                .fail_permanent(
                    enrollment,
                    channel,
                    &sequence.sender_email,
                    subject,
                    "no adapter configured for channel",
                    now,
                )
                .await;
        };

        let result = match tokio::time::timeout(
            self.channel_timeout(channel),
            adapter.dispatch(&message, &sender),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => DispatchResult::transient("dispatch deadline expired"),
        };

        match result.status {
            DispatchStatus::Sent => {
                self.ctx.governor.commit(&grant).await?;
                let mut log = LogEntry::new(
                    &enrollment,
                    channel,
                    &sequence.sender_email,
                    LogOutcome::Sent,
                    now,
                )
                .with_subject(subject)
                .with_external_ref(result.external_ref);
                for tag in &tags {
                    log = log.with_tag(tag);
                }
                enrollment.attempts = 0;
                enrollment.last_error_kind = None;
                enrollment.last_error_message = None;
                let plan = plan_position(sequence, index + 1, now);
                apply_plan(&mut enrollment, plan, now);
                self.persist(&enrollment, Some(&log)).await
            }
            DispatchStatus::TransientFailure => {
                self.ctx.governor.release(&grant).await;
                enrollment.attempts += 1;
                let detail = result
                    .detail
                    .unwrap_or_else(|| "transient failure".to_string());

                if enrollment.attempts >= self.ctx.config.max_attempts {
                    warn!(
                        enrollment = %enrollment.id,
                        attempts = enrollment.attempts,
                        detail,
                        "Retries exhausted; escalating to permanent"
                    );
                    return self
                        .fail_permanent(
                            enrollment,
                            channel,
                            &sequence.sender_email,
                            subject,
                            &format!("retries exhausted: {detail}"),
                            now,
                        )
                        .await;
                }

                let delay = backoff_delay(&self.ctx.config, enrollment.id, enrollment.attempts);
                debug!(
                    enrollment = %enrollment.id,
                    attempt = enrollment.attempts,
                    retry_in_secs = delay.num_seconds(),
                    detail,
                    "Transient failure; backing off"
                );
                let log = LogEntry::new(
                    &enrollment,
                    channel,
                    &sequence.sender_email,
                    LogOutcome::TransientFailure,
                    now,
                )
                .with_subject(subject);
                enrollment.status = EnrollmentStatus::Pending;
                enrollment.due_at = now + delay;
                enrollment.last_error_kind = Some("transient_failure".into());
                enrollment.last_error_message = Some(detail);
                enrollment.updated_at = now;
                self.persist(&enrollment, Some(&log)).await
            }
            DispatchStatus::PermanentFailure => {
                self.ctx.governor.release(&grant).await;
                let detail = result
                    .detail
                    .unwrap_or_else(|| "permanent failure".to_string());
                self.fail_permanent(
                    enrollment,
                    channel,
                    &sequence.sender_email,
                    subject,
                    &detail,
                    now,
                )
                .await
            }
        }
    }

    /// Render an email step without sending — the preview/test-send path.
    pub async fn render_email(
        &self,
        sequence: &Sequence,
        step_index: usize,
        recipient: &Recipient,
    ) -> Result<RenderedEmail> {
        let Some(Step::Email {
            template_key,
            subject,
            body,
            personalization_mode,
            ..
        }) = sequence.steps.get(step_index)
        else {
            return Err(ValidationError::InvalidField {
                field: "step_index".into(),
                message: "step is not an email step".into(),
            }
            .into());
        };

        let sender = self
            .ctx
            .store
            .get_sender(&sequence.sender_email)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "sender".into(),
                id: sequence.sender_email.clone(),
            })?;

        let (subject_template, body_template) =
            self.email_content(template_key, subject, body).await?;

        let persona = self
            .ctx
            .personalizer
            .personalize(recipient, *personalization_mode)
            .await;
        let body_template = persona.replacement_body.unwrap_or(body_template);

        let now = self.ctx.clock.now();
        let mut vars = base_vars(recipient, &sender, sequence, now);
        vars.extend(persona.vars);

        let mut unknown = template::unknown_variables(&subject_template, &vars);
        for name in template::unknown_variables(&body_template, &vars) {
            if !unknown.contains(&name) {
                unknown.push(name);
            }
        }

        let rendered_subject = template::render(&subject_template, &vars)?;
        let rendered_body = template::render(&body_template, &vars)?;
        let composed = self
            .ctx
            .composer
            .compose(&sender, &rendered_subject, &rendered_body);

        Ok(RenderedEmail {
            to: recipient.email.clone(),
            subject: composed.subject,
            rich_body: composed.rich_body,
            plain_body: composed.plain_body,
            unknown_variables: unknown,
        })
    }

    async fn email_content(
        &self,
        template_key: &Option<String>,
        subject: &Option<String>,
        body: &Option<String>,
    ) -> Result<(String, String)> {
        if let Some(key) = template_key {
            let stored = self.ctx.store.get_template(key).await?;
            return match stored {
                Some(t) => Ok((t.subject, t.body)),
                None => Err(DatabaseError::NotFound {
                    entity: "email_template".into(),
                    id: key.clone(),
                }
                .into()),
            };
        }
        Ok((
            subject.clone().unwrap_or_default(),
            body.clone().unwrap_or_default(),
        ))
    }

    async fn resolve_payload(
        &self,
        step: &Step,
        recipient: &Recipient,
        sender: &Sender,
        sequence: &Sequence,
        now: DateTime<Utc>,
    ) -> Result<Payload> {
        let mut vars = base_vars(recipient, sender, sequence, now);

        match step {
            Step::Email {
                template_key,
                subject,
                body,
                personalization_mode,
                ..
            } => {
                let (subject_template, body_template) =
                    match self.email_content(template_key, subject, body).await {
                        Ok(content) => content,
                        Err(Error::Database(DatabaseError::NotFound { id, .. })) => {
                            return Ok(Payload::Fail {
                                detail: format!("unknown template key '{id}'"),
                            });
                        }
                        Err(e) => return Err(e),
                    };

                let persona = self
                    .ctx
                    .personalizer
                    .personalize(recipient, *personalization_mode)
                    .await;
                let mut tags = Vec::new();
                if persona.degraded {
                    tags.push("personalization_fallback".to_string());
                }
                if let Some(key) = template_key {
                    tags.push(format!("template:{key}"));
                }
                let body_template = persona.replacement_body.unwrap_or(body_template);
                vars.extend(persona.vars);

                let rendered_subject = match template::render(&subject_template, &vars) {
                    Ok(text) => text,
                    Err(e) => return Ok(Payload::Fail { detail: e.to_string() }),
                };
                let rendered_body = match template::render(&body_template, &vars) {
                    Ok(text) => text,
                    Err(e) => return Ok(Payload::Fail { detail: e.to_string() }),
                };

                let composed = self
                    .ctx
                    .composer
                    .compose(sender, &rendered_subject, &rendered_body);
                Ok(Payload::Ready {
                    subject: Some(composed.subject.clone()),
                    message: OutboundMessage::Email {
                        to: recipient.email.clone(),
                        subject: composed.subject,
                        rich_body: composed.rich_body,
                        plain_body: composed.plain_body,
                    },
                    tags,
                })
            }
            Step::Call { script, .. } => {
                let Some(phone) = recipient.phone.clone() else {
                    return Ok(Payload::Skip { reason: "no_phone" });
                };
                let script = match template::render(script, &vars) {
                    Ok(text) => text,
                    Err(e) => return Ok(Payload::Fail { detail: e.to_string() }),
                };
                let voicemail_message = format!(
                    "Hi {}, this is {}. I'll follow up over email shortly.",
                    recipient.first_name, sender.name
                );
                Ok(Payload::Ready {
                    subject: None,
                    message: OutboundMessage::Call {
                        phone,
                        script,
                        voicemail_message,
                    },
                    tags: Vec::new(),
                })
            }
            Step::NetworkConnect { message, .. } => {
                let Some(profile_url) = recipient.network_url.clone() else {
                    return Ok(Payload::Skip { reason: "no_network_url" });
                };
                match template::render(message, &vars) {
                    Ok(message) => Ok(Payload::Ready {
                        subject: None,
                        message: OutboundMessage::NetworkConnect {
                            profile_url,
                            message,
                        },
                        tags: Vec::new(),
                    }),
                    Err(e) => Ok(Payload::Fail { detail: e.to_string() }),
                }
            }
            Step::NetworkMessage { message, .. } => {
                let Some(profile_url) = recipient.network_url.clone() else {
                    return Ok(Payload::Skip { reason: "no_network_url" });
                };
                match template::render(message, &vars) {
                    Ok(message) => Ok(Payload::Ready {
                        subject: None,
                        message: OutboundMessage::NetworkMessage {
                            profile_url,
                            message,
                        },
                        tags: Vec::new(),
                    }),
                    Err(e) => Ok(Payload::Fail { detail: e.to_string() }),
                }
            }
            Step::Wait { .. } => Ok(Payload::Fail {
                detail: "wait step reached dispatch".into(),
            }),
        }
    }

    fn channel_timeout(&self, channel: Channel) -> StdDuration {
        match channel {
            Channel::Email => self.ctx.config.email_timeout,
            Channel::Call => self.ctx.config.voice_timeout,
            // The pacing pause sits inside the session lock, ahead of the
            // browser action itself.
            Channel::NetworkConnect | Channel::NetworkMessage => {
                self.ctx.config.browser_timeout
                    + self
                        .ctx
                        .sessions
                        .as_ref()
                        .map(|p| p.config().max_action_interval)
                        .unwrap_or_default()
            }
        }
    }

    async fn fail_permanent(
        &self,
        mut enrollment: Enrollment,
        channel: Channel,
        sender_email: &str,
        subject: Option<String>,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        warn!(
            enrollment = %enrollment.id,
            step = enrollment.step_index,
            channel = channel.as_str(),
            detail,
            "Permanent failure; halting enrollment"
        );
        let log = LogEntry::new(
            &enrollment,
            channel,
            sender_email,
            LogOutcome::PermanentFailure,
            now,
        )
        .with_subject(subject);
        enrollment.status = EnrollmentStatus::Failed;
        enrollment.last_error_kind = Some("permanent_failure".into());
        enrollment.last_error_message = Some(detail.to_string());
        enrollment.updated_at = now;
        self.persist(&enrollment, Some(&log)).await
    }

    async fn persist(&self, enrollment: &Enrollment, log: Option<&LogEntry>) -> Result<()> {
        match self.ctx.store.update_enrollment(enrollment, log).await {
            Ok(()) => Ok(()),
            // Someone else (another worker, a webhook) won the row.
            Err(DatabaseError::ConcurrencyConflict { id, .. }) => {
                debug!(enrollment = %id, "Concurrent update won; abandoning claim");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Recipient, sender, and constant fields for the template bag.
/// Enrichment attributes go in first so canonical fields win collisions.
fn base_vars(
    recipient: &Recipient,
    sender: &Sender,
    sequence: &Sequence,
    now: DateTime<Utc>,
) -> HashMap<String, String> {
    let mut vars = recipient.attributes.clone();

    vars.insert("first_name".into(), recipient.first_name.clone());
    vars.insert("last_name".into(), recipient.last_name.clone());
    vars.insert("email".into(), recipient.email.clone());
    vars.insert("title".into(), recipient.title.clone());
    vars.insert(
        "phone".into(),
        recipient.phone.clone().unwrap_or_default(),
    );
    vars.insert(
        "linkedin_url".into(),
        recipient.network_url.clone().unwrap_or_default(),
    );
    vars.insert("company_name".into(), recipient.company.clone());
    vars.insert("industry".into(), recipient.industry.clone());

    vars.insert("sender_name".into(), sender.name.clone());
    vars.insert("sender_email".into(), sender.email.clone());
    vars.insert("sender_title".into(), sender.title.clone());
    vars.insert("sender_phone".into(), sender.phone.clone());
    vars.insert("signature".into(), sender.signature_plain.clone());

    vars.insert("current_date".into(), now.format("%Y-%m-%d").to_string());
    vars.insert("campaign_name".into(), sequence.name.clone());

    vars
}
