//! Core domain types — sequences, steps, enrollments, senders, log entries.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

// ── Steps ───────────────────────────────────────────────────────────

/// How the personalizer derives variables for an email step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PersonalizationMode {
    /// Deterministic selection from the signal library. No AI call.
    #[default]
    SignalBased,
    /// AI call produces a complete replacement body.
    FullyPersonalized,
    /// AI call produces a 1–2 sentence opener only.
    OpenerOnly,
}

/// A single element of a sequence — an action or a wait.
///
/// Non-wait steps carry an optional `delay_days` pre-step pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Email {
        #[serde(default)]
        delay_days: u32,
        /// Key into the stored template library; alternative to inline content.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default)]
        personalization_mode: PersonalizationMode,
    },
    Wait {
        delay_days: u32,
    },
    Call {
        #[serde(default)]
        delay_days: u32,
        script: String,
    },
    NetworkConnect {
        #[serde(default)]
        delay_days: u32,
        message: String,
    },
    NetworkMessage {
        #[serde(default)]
        delay_days: u32,
        message: String,
    },
}

impl Step {
    /// Pre-step pause in days (the full delay for `wait` steps).
    pub fn delay_days(&self) -> u32 {
        match self {
            Self::Email { delay_days, .. }
            | Self::Wait { delay_days }
            | Self::Call { delay_days, .. }
            | Self::NetworkConnect { delay_days, .. }
            | Self::NetworkMessage { delay_days, .. } => *delay_days,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait { .. })
    }

    /// Outbound channel for a non-wait step.
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Self::Email { .. } => Some(Channel::Email),
            Self::Call { .. } => Some(Channel::Call),
            Self::NetworkConnect { .. } => Some(Channel::NetworkConnect),
            Self::NetworkMessage { .. } => Some(Channel::NetworkMessage),
            Self::Wait { .. } => None,
        }
    }

    /// Validate a step at the API boundary.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        match self {
            Self::Email {
                template_key,
                subject,
                body,
                ..
            } => {
                let inline = subject.is_some() && body.is_some();
                if template_key.is_none() && !inline {
                    return Err(ValidationError::InvalidStep {
                        index,
                        message: "email step needs template_key or inline subject and body".into(),
                    });
                }
                Ok(())
            }
            Self::Call { script, .. } => {
                if script.trim().is_empty() {
                    return Err(ValidationError::InvalidStep {
                        index,
                        message: "call step needs a non-empty script".into(),
                    });
                }
                Ok(())
            }
            Self::NetworkConnect { message, .. } | Self::NetworkMessage { message, .. } => {
                if message.trim().is_empty() {
                    return Err(ValidationError::InvalidStep {
                        index,
                        message: "network step needs a non-empty message".into(),
                    });
                }
                Ok(())
            }
            Self::Wait { .. } => Ok(()),
        }
    }
}

/// Validate a full step list for sequence create/replace.
pub fn validate_steps(steps: &[Step]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::EmptySequence);
    }
    for (index, step) in steps.iter().enumerate() {
        step.validate(index)?;
    }
    Ok(())
}

// ── Sequence ────────────────────────────────────────────────────────

/// A named plan of steps attached to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub campaign_id: String,
    pub name: String,
    pub sender_email: String,
    pub steps: Vec<Step>,
    pub created_at: DateTime<Utc>,
}

// ── Enrollment ──────────────────────────────────────────────────────

/// Lifecycle status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    InFlight,
    Waiting,
    Completed,
    Paused,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "waiting" => Self::Waiting,
            "completed" => Self::Completed,
            "paused" => Self::Paused,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Live enrollments are the ones the at-most-one-per-(recipient, sequence)
    /// invariant counts.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::InFlight | Self::Waiting)
    }
}

/// One recipient's live position in one sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub recipient_id: String,
    pub sequence_id: Uuid,
    pub step_index: u32,
    pub due_at: DateTime<Utc>,
    pub status: EnrollmentStatus,
    pub attempts: u32,
    /// Optimistic-concurrency guard; bumped on every update.
    pub version: i64,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(recipient_id: &str, sequence_id: Uuid, due_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.to_string(),
            sequence_id,
            step_index: 0,
            due_at,
            status: EnrollmentStatus::Pending,
            attempts: 0,
            version: 0,
            last_error_kind: None,
            last_error_message: None,
            updated_at: due_at,
        }
    }
}

// ── Recipient ───────────────────────────────────────────────────────

/// Contact record. Read-only for the engine — owned by the lead importer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_url: Option<String>,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub industry: String,
    /// Enrichment bag — signals, technologies, counts, anything the
    /// importer attaches. Merged verbatim into the template variable bag.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

// ── Sender ──────────────────────────────────────────────────────────

/// Days-of-week plus a clock interval in a fixed timezone, outside of
/// which a sender may not send.
///
/// An interval with `end <= start` spans midnight: each listed day
/// admits its pre-midnight tail and its post-midnight head. Unlisted
/// days are fully closed, so Fri–Sat 22:00–02:00 ends Sat 02:00 and
/// never reaches Sun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub timezone: Tz,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self {
            days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
        }
    }
}

/// Warmup ramp state for a sender.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarmupState {
    pub enabled: bool,
    pub start_date: Option<NaiveDate>,
    /// Key into the ramp-curve tables (`conservative`, `moderate`, `aggressive`).
    #[serde(default)]
    pub ramp_key: String,
}

/// A configured sending identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub signature_rich: String,
    #[serde(default)]
    pub signature_plain: String,
    #[serde(default)]
    pub warmup: WarmupState,
    pub daily_cap: u32,
    #[serde(default)]
    pub on_hold: bool,
    #[serde(default)]
    pub window: SendWindow,
}

// ── Email templates ─────────────────────────────────────────────────

/// A stored email template addressable by `template_key` on email steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub key: String,
    pub subject: String,
    pub body: String,
}

// ── Channels & log ──────────────────────────────────────────────────

/// Outbound channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Call,
    NetworkConnect,
    NetworkMessage,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Call => "call",
            Self::NetworkConnect => "network_connect",
            Self::NetworkMessage => "network_message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Self::Email),
            "call" => Some(Self::Call),
            "network_connect" => Some(Self::NetworkConnect),
            "network_message" => Some(Self::NetworkMessage),
            _ => None,
        }
    }
}

/// Outcome kind recorded on a log entry. Dispatch outcomes come from the
/// executor; the rest arrive through the webhook ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Sent,
    Skipped,
    TransientFailure,
    PermanentFailure,
    Test,
    Delivered,
    Opened,
    Bounced,
    Replied,
    CallStarted,
    CallCompleted,
    CallFailed,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::TransientFailure => "transient_failure",
            Self::PermanentFailure => "permanent_failure",
            Self::Test => "test",
            Self::Delivered => "delivered",
            Self::Opened => "opened",
            Self::Bounced => "bounced",
            Self::Replied => "replied",
            Self::CallStarted => "call_started",
            Self::CallCompleted => "call_completed",
            Self::CallFailed => "call_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Self::Sent),
            "skipped" => Some(Self::Skipped),
            "transient_failure" => Some(Self::TransientFailure),
            "permanent_failure" => Some(Self::PermanentFailure),
            "test" => Some(Self::Test),
            "delivered" => Some(Self::Delivered),
            "opened" => Some(Self::Opened),
            "bounced" => Some(Self::Bounced),
            "replied" => Some(Self::Replied),
            "call_started" => Some(Self::CallStarted),
            "call_completed" => Some(Self::CallCompleted),
            "call_failed" => Some(Self::CallFailed),
            _ => None,
        }
    }
}

/// Immutable record of one attempt (or one provider callback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    /// Absent for test sends, which are not tied to an enrollment.
    pub enrollment_id: Option<Uuid>,
    pub step_index: u32,
    pub channel: Channel,
    pub sender_email: String,
    pub recipient_id: String,
    pub outcome: LogOutcome,
    /// Opaque provider identifier (e.g. call id) correlating webhooks.
    pub external_ref: Option<String>,
    pub subject: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub variant_tags: Vec<String>,
}

impl LogEntry {
    pub fn new(
        enrollment: &Enrollment,
        channel: Channel,
        sender_email: &str,
        outcome: LogOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            enrollment_id: Some(enrollment.id),
            step_index: enrollment.step_index,
            channel,
            sender_email: sender_email.to_string(),
            recipient_id: enrollment.recipient_id.clone(),
            outcome,
            external_ref: None,
            subject: None,
            timestamp,
            variant_tags: Vec::new(),
        }
    }

    pub fn with_external_ref(mut self, external_ref: Option<String>) -> Self {
        self.external_ref = external_ref;
        self
    }

    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.variant_tags.push(tag.to_string());
        self
    }
}
