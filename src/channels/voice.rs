//! Voice channel — submits AI call requests to the provider.
//!
//! A successful submission only means the call is queued: the call's
//! final outcome arrives later on the voice webhook, correlated by the
//! returned call id.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::channels::{ChannelAdapter, DispatchResult, OutboundMessage};
use crate::config::VoiceConfig;
use crate::model::{Channel, Sender};

/// Voice call adapter.
pub struct VoiceAdapter {
    config: VoiceConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct CallResponse {
    call_id: Option<String>,
}

impl VoiceAdapter {
    pub fn new(config: VoiceConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for VoiceAdapter {
    fn channel(&self) -> Channel {
        Channel::Call
    }

    async fn dispatch(&self, message: &OutboundMessage, _sender: &Sender) -> DispatchResult {
        let OutboundMessage::Call {
            phone,
            script,
            voicemail_message,
        } = message
        else {
            return DispatchResult::permanent("voice adapter received a non-call payload");
        };

        let response = self
            .http
            .post(&self.config.api_url)
            .header("Authorization", &self.config.api_key)
            .json(&json!({
                "phone_number": phone,
                "task": script,
                "voice": "nat",
                "wait_for_greeting": true,
                "record": true,
                "webhook": format!("{}/webhooks/voice", self.config.callback_base),
                "max_duration": self.config.max_duration_mins,
                "language": "en",
                "voicemail_action": "leave_message",
                "voicemail_message": voicemail_message,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            // Connection errors and deadline expiry are retryable.
            Err(e) => return DispatchResult::transient(format!("voice request failed: {e}")),
        };

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return DispatchResult::transient(format!("voice provider returned {status}"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return DispatchResult::permanent(format!("voice provider rejected: {status} {body}"));
        }

        match response.json::<CallResponse>().await {
            Ok(CallResponse {
                call_id: Some(call_id),
            }) => {
                info!(call_id = %call_id, "Call submitted");
                DispatchResult::sent(Some(call_id))
            }
            Ok(CallResponse { call_id: None }) => {
                DispatchResult::transient("voice provider accepted without a call id")
            }
            Err(e) => DispatchResult::transient(format!("unreadable voice response: {e}")),
        }
    }
}
