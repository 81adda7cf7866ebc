//! Configuration types.

use std::time::Duration;

/// Engine configuration — scheduler, retry, and timeout knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size for the scheduler loop.
    pub global_concurrency: usize,
    /// Enrollments claimed per scheduler iteration.
    pub claim_batch_size: usize,
    /// Sleep between iterations when no work was found.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight dispatches.
    pub drain_timeout: Duration,
    /// `in_flight` rows older than this are reverted to `pending` at startup.
    pub stale_threshold: Duration,
    /// Transient-failure retries before escalating to permanent.
    pub max_attempts: u32,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_cap: Duration,
    /// Deadline for an email dispatch.
    pub email_timeout: Duration,
    /// Deadline for a voice call submission.
    pub voice_timeout: Duration,
    /// Deadline for a single browser action.
    pub browser_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 8,
            claim_batch_size: 32,
            poll_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(600), // 10 minutes
            max_attempts: 5,
            backoff_base: Duration::from_secs(300), // 5 minutes
            backoff_cap: Duration::from_secs(6 * 3600),
            email_timeout: Duration::from_secs(30),
            voice_timeout: Duration::from_secs(30),
            browser_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Build EngineConfig from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            global_concurrency: env_parse("OUTREACH_CONCURRENCY", defaults.global_concurrency),
            claim_batch_size: env_parse("OUTREACH_CLAIM_BATCH", defaults.claim_batch_size),
            poll_interval: env_secs("OUTREACH_POLL_INTERVAL_SECS", defaults.poll_interval),
            drain_timeout: env_secs("OUTREACH_DRAIN_TIMEOUT_SECS", defaults.drain_timeout),
            stale_threshold: env_secs("OUTREACH_STALE_THRESHOLD_SECS", defaults.stale_threshold),
            max_attempts: env_parse("OUTREACH_MAX_ATTEMPTS", defaults.max_attempts),
            backoff_base: env_secs("OUTREACH_BACKOFF_BASE_SECS", defaults.backoff_base),
            backoff_cap: env_secs("OUTREACH_BACKOFF_CAP_SECS", defaults.backoff_cap),
            email_timeout: env_secs("OUTREACH_EMAIL_TIMEOUT_SECS", defaults.email_timeout),
            voice_timeout: env_secs("OUTREACH_VOICE_TIMEOUT_SECS", defaults.voice_timeout),
            browser_timeout: env_secs("OUTREACH_BROWSER_TIMEOUT_SECS", defaults.browser_timeout),
        }
    }
}

/// SMTP transport configuration for the email channel.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OUTREACH_SMTP_HOST").ok()?;
        let port: u16 = std::env::var("OUTREACH_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = std::env::var("OUTREACH_SMTP_USERNAME").unwrap_or_default();
        let password = std::env::var("OUTREACH_SMTP_PASSWORD").unwrap_or_default();

        Some(Self {
            host,
            port,
            username,
            password,
        })
    }
}

/// Voice call provider configuration.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub api_url: String,
    pub api_key: String,
    /// Base URL the provider calls back on (`{base}/webhooks/voice`).
    pub callback_base: String,
    /// Maximum call length in minutes.
    pub max_duration_mins: u32,
}

impl VoiceConfig {
    /// Returns `None` if `OUTREACH_VOICE_API_KEY` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OUTREACH_VOICE_API_KEY").ok()?;
        Some(Self {
            api_url: std::env::var("OUTREACH_VOICE_API_URL")
                .unwrap_or_else(|_| "https://api.bland.ai/v1/calls".to_string()),
            api_key,
            callback_base: std::env::var("OUTREACH_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:7000".to_string()),
            max_duration_mins: env_parse("OUTREACH_VOICE_MAX_DURATION_MINS", 5),
        })
    }
}

/// Browser-driven network channel configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Endpoint of the browser automation bridge.
    pub automation_url: String,
    /// Minimum pause between actions on one account.
    pub min_action_interval: Duration,
    /// Maximum pause between actions on one account (jitter upper bound).
    pub max_action_interval: Duration,
    /// Hard per-account daily action cap, enforced before the Rate Governor.
    pub daily_action_cap: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            automation_url: "http://localhost:9500".to_string(),
            min_action_interval: Duration::from_secs(120),
            max_action_interval: Duration::from_secs(300),
            daily_action_cap: 30,
        }
    }
}

impl NetworkConfig {
    /// Returns `None` if `OUTREACH_AUTOMATION_URL` is not set (channels disabled).
    pub fn from_env() -> Option<Self> {
        let automation_url = std::env::var("OUTREACH_AUTOMATION_URL").ok()?;
        let defaults = Self::default();
        Some(Self {
            automation_url,
            min_action_interval: env_secs(
                "OUTREACH_NETWORK_MIN_INTERVAL_SECS",
                defaults.min_action_interval,
            ),
            max_action_interval: env_secs(
                "OUTREACH_NETWORK_MAX_INTERVAL_SECS",
                defaults.max_action_interval,
            ),
            daily_action_cap: env_parse("OUTREACH_NETWORK_DAILY_CAP", defaults.daily_action_cap),
        })
    }
}

/// AI provider configuration for the personalizer.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

impl AiConfig {
    /// Returns `None` if `OUTREACH_AI_API_KEY` is not set (AI modes degrade).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OUTREACH_AI_API_KEY").ok()?;
        Some(Self {
            api_key,
            model: std::env::var("OUTREACH_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            base_url: std::env::var("OUTREACH_AI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            max_tokens: env_parse("OUTREACH_AI_MAX_TOKENS", 120),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_engine_config_matches_policy() {
        let config = EngineConfig::default();
        assert_eq!(config.global_concurrency, 8);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_base, Duration::from_secs(300));
        assert_eq!(config.backoff_cap, Duration::from_secs(21600));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn network_defaults_match_account_safety_limits() {
        let config = NetworkConfig::default();
        assert_eq!(config.min_action_interval, Duration::from_secs(120));
        assert_eq!(config.max_action_interval, Duration::from_secs(300));
        assert_eq!(config.daily_action_cap, 30);
    }
}
