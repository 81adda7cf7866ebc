//! Error types for the outreach engine.

use chrono::{DateTime, Utc};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Personalization error: {0}")]
    Personalize(#[from] PersonalizeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Optimistic-concurrency guard failed — another worker holds the row.
    /// Workers abandon the claim silently on this variant.
    #[error("Concurrency conflict on {entity} {id}")]
    ConcurrencyConflict { entity: String, id: String },
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// An opening `{{` with no closing `}}` on the same line.
    #[error("Unclosed template token at line {line}: {snippet}")]
    UnclosedToken { line: usize, snippet: String },
}

/// Channel dispatch errors. Adapters classify provider responses into
/// transient vs permanent; the executor decides retry policy.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {channel} transient failure: {reason}")]
    Transient { channel: String, reason: String },

    #[error("Channel {channel} permanent failure: {reason}")]
    Permanent { channel: String, reason: String },

    #[error("Channel {channel} misconfigured: {reason}")]
    Misconfigured { channel: String, reason: String },
}

/// Personalization / AI-client errors. These never abort a step — the
/// personalizer degrades to an empty-variable fallback and logs a marker.
#[derive(Debug, thiserror::Error)]
pub enum PersonalizeError {
    #[error("AI provider request failed: {0}")]
    RequestFailed(String),

    #[error("AI provider returned an unusable response: {0}")]
    InvalidResponse(String),

    #[error("AI client not configured")]
    NotConfigured,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Malformed input rejected at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid step at index {index}: {message}")]
    InvalidStep { index: usize, message: String },

    #[error("Sequence has no steps")]
    EmptySequence,

    #[error("Invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
}

/// A rate-governor denial. Not an error — a scheduling directive telling
/// the executor when the enrollment next becomes eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDenied {
    pub reason: DenyReason,
    pub next_eligible_at: DateTime<Utc>,
}

/// Why a send slot was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Sender is on hold.
    Paused,
    /// Outside the sender's send window.
    Window,
    /// Daily (or warmup) cap reached.
    Quota,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Window => "window",
            Self::Quota => "quota",
        }
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
