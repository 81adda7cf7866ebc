//! Network channels — connection requests and messages driven through a
//! browser automation bridge.
//!
//! All actions for one account funnel through a single serialized session
//! with a jittered minimum interval between actions, plus a hard daily
//! action cap enforced in front of the Rate Governor. Accounts never act
//! in parallel; the interval makes the cadence look like a person.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channels::{ChannelAdapter, DispatchResult, OutboundMessage};
use crate::config::NetworkConfig;
use crate::model::{Channel, Sender};
use crate::util::jitter_factor;

/// Per-account browser session state.
struct AccountSession {
    last_action_at: Option<Instant>,
    actions_today: u32,
    /// UTC date `actions_today` counts against.
    date: NaiveDate,
}

impl AccountSession {
    fn new(today: NaiveDate) -> Self {
        Self {
            last_action_at: None,
            actions_today: 0,
            date: today,
        }
    }

    fn roll_date(&mut self, today: NaiveDate) {
        if self.date != today {
            self.date = today;
            self.actions_today = 0;
        }
    }
}

/// Pool of serialized per-account sessions.
///
/// Session state is process-local, like the Rate Governor's pending
/// reservations: one process owns each account.
pub struct SessionPool {
    config: NetworkConfig,
    accounts: Mutex<HashMap<String, Arc<Mutex<AccountSession>>>>,
}

impl SessionPool {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    async fn session(&self, account: &str) -> Arc<Mutex<AccountSession>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountSession::new(Utc::now().date_naive())))
            })
            .clone()
    }

    /// Daily-cap check, consulted by the executor before the Rate
    /// Governor. `Err` carries when the account becomes eligible again
    /// (next UTC midnight).
    pub async fn check_budget(
        &self,
        account: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DateTime<Utc>> {
        let session = self.session(account).await;
        let mut session = session.lock().await;
        session.roll_date(now.date_naive());

        if session.actions_today >= self.config.daily_action_cap {
            let tomorrow = now.date_naive() + chrono::Duration::days(1);
            let next = Utc
                .from_utc_datetime(&tomorrow.and_time(NaiveTime::MIN));
            debug!(account, cap = self.config.daily_action_cap, "Network daily cap reached");
            return Err(next);
        }
        Ok(())
    }

    /// Jittered spacing for the account's next action. Deterministic per
    /// (account, action index) so restarts keep the same cadence.
    fn action_interval(&self, account: &str, action_index: u32) -> Duration {
        let min = self.config.min_action_interval.as_secs_f64();
        let max = self.config.max_action_interval.as_secs_f64();
        let unit = (jitter_factor(&format!("{account}:{action_index}"), 0.5) - 0.5).clamp(0.0, 1.0);
        Duration::from_secs_f64(min + unit * (max - min))
    }
}

#[derive(Deserialize)]
struct BridgeResponse {
    success: bool,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    action_id: Option<String>,
}

/// Adapter for one of the two network step kinds. Both share a
/// [`SessionPool`], so connects and messages on the same account are
/// serialized together.
pub struct NetworkAdapter {
    kind: Channel,
    pool: Arc<SessionPool>,
    http: reqwest::Client,
}

impl NetworkAdapter {
    pub fn connect(pool: Arc<SessionPool>) -> Self {
        Self {
            kind: Channel::NetworkConnect,
            pool,
            http: reqwest::Client::new(),
        }
    }

    pub fn message(pool: Arc<SessionPool>) -> Self {
        Self {
            kind: Channel::NetworkMessage,
            pool,
            http: reqwest::Client::new(),
        }
    }

    async fn drive_action(
        &self,
        account: &str,
        action: &str,
        profile_url: &str,
        message: &str,
    ) -> DispatchResult {
        let session = self.pool.session(account).await;
        // Holding the session lock for the whole action serializes the
        // account; parallel workers on other accounts are unaffected.
        let mut session = session.lock().await;
        session.roll_date(Utc::now().date_naive());

        if let Some(last) = session.last_action_at {
            let interval = self.pool.action_interval(account, session.actions_today);
            let elapsed = last.elapsed();
            if elapsed < interval {
                let pause = interval - elapsed;
                debug!(account, pause_secs = pause.as_secs(), "Pacing network action");
                tokio::time::sleep(pause).await;
            }
        }

        let response = self
            .http
            .post(format!("{}/actions", self.pool.config().automation_url))
            .json(&json!({
                "account": account,
                "action": action,
                "profile_url": profile_url,
                "message": message,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return DispatchResult::transient(format!("automation bridge: {e}")),
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return DispatchResult::transient(format!("automation bridge returned {status}"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return DispatchResult::permanent(format!("automation bridge rejected: {status} {body}"));
        }

        match response.json::<BridgeResponse>().await {
            Ok(bridge) if bridge.success => {
                session.last_action_at = Some(Instant::now());
                session.actions_today += 1;
                info!(account, action, "Network action completed");
                DispatchResult::sent(bridge.action_id)
            }
            Ok(bridge) => DispatchResult::permanent(
                bridge
                    .detail
                    .unwrap_or_else(|| "automation action failed".to_string()),
            ),
            Err(e) => DispatchResult::transient(format!("unreadable bridge response: {e}")),
        }
    }
}

#[async_trait]
impl ChannelAdapter for NetworkAdapter {
    fn channel(&self) -> Channel {
        self.kind
    }

    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchResult {
        match (self.kind, message) {
            (
                Channel::NetworkConnect,
                OutboundMessage::NetworkConnect {
                    profile_url,
                    message,
                },
            ) => {
                self.drive_action(&sender.email, "connect", profile_url, message)
                    .await
            }
            (
                Channel::NetworkMessage,
                OutboundMessage::NetworkMessage {
                    profile_url,
                    message,
                },
            ) => {
                self.drive_action(&sender.email, "message", profile_url, message)
                    .await
            }
            _ => DispatchResult::permanent("network adapter received a mismatched payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cap: u32) -> SessionPool {
        SessionPool::new(NetworkConfig {
            automation_url: "http://localhost:9500".into(),
            min_action_interval: Duration::from_secs(120),
            max_action_interval: Duration::from_secs(300),
            daily_action_cap: cap,
        })
    }

    #[tokio::test]
    async fn budget_allows_until_cap() {
        let pool = pool(2);
        let now = Utc::now();

        assert!(pool.check_budget("a@b.c", now).await.is_ok());

        // Simulate two recorded actions.
        let session = pool.session("a@b.c").await;
        session.lock().await.actions_today = 2;

        let next = pool.check_budget("a@b.c", now).await.unwrap_err();
        assert!(next > now);
        assert_eq!(next.time(), NaiveTime::MIN);
    }

    #[tokio::test]
    async fn budget_resets_on_new_day() {
        let pool = pool(1);
        let session = pool.session("a@b.c").await;
        {
            let mut s = session.lock().await;
            s.actions_today = 1;
            s.date = Utc::now().date_naive() - chrono::Duration::days(1);
        }
        assert!(pool.check_budget("a@b.c", Utc::now()).await.is_ok());
    }

    #[test]
    fn action_interval_within_configured_bounds() {
        let pool = pool(30);
        for i in 0..20 {
            let interval = pool.action_interval("a@b.c", i);
            assert!(interval >= Duration::from_secs(120), "{interval:?}");
            assert!(interval <= Duration::from_secs(300), "{interval:?}");
        }
    }

    #[test]
    fn action_interval_is_deterministic() {
        let pool = pool(30);
        assert_eq!(
            pool.action_interval("a@b.c", 3),
            pool.action_interval("a@b.c", 3)
        );
    }
}
