//! Channel adapters — uniform dispatch over email, voice, and the
//! browser-driven network channels.
//!
//! Adapters classify provider responses into terminal statuses and never
//! retry internally; retry policy belongs to the scheduler.

pub mod email;
pub mod network;
pub mod voice;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use email::EmailAdapter;
pub use network::{NetworkAdapter, SessionPool};
pub use voice::VoiceAdapter;

use crate::model::{Channel, Sender};

/// Resolved payload handed to an adapter.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Email {
        to: String,
        subject: String,
        rich_body: String,
        plain_body: String,
    },
    Call {
        phone: String,
        script: String,
        voicemail_message: String,
    },
    NetworkConnect {
        profile_url: String,
        message: String,
    },
    NetworkMessage {
        profile_url: String,
        message: String,
    },
}

/// Terminal classification of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    TransientFailure,
    PermanentFailure,
}

/// What an adapter reports back. `external_ref` is the provider's opaque
/// identifier (e.g. a call id) used to correlate later webhooks.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    pub external_ref: Option<String>,
    pub detail: Option<String>,
}

impl DispatchResult {
    pub fn sent(external_ref: Option<String>) -> Self {
        Self {
            status: DispatchStatus::Sent,
            external_ref,
            detail: None,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::TransientFailure,
            external_ref: None,
            detail: Some(detail.into()),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::PermanentFailure,
            external_ref: None,
            detail: Some(detail.into()),
        }
    }
}

/// Shared adapter contract. One implementation per channel; the executor
/// looks adapters up in the [`ChannelRegistry`].
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchResult;
}

/// Channel → adapter lookup.
#[derive(Default)]
pub struct ChannelRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullAdapter(Channel);

    #[async_trait]
    impl ChannelAdapter for NullAdapter {
        fn channel(&self) -> Channel {
            self.0
        }

        async fn dispatch(&self, _message: &OutboundMessage, _sender: &Sender) -> DispatchResult {
            DispatchResult::sent(None)
        }
    }

    #[test]
    fn registry_lookup() {
        let mut registry = ChannelRegistry::new();
        registry.register(Arc::new(NullAdapter(Channel::Email)));
        registry.register(Arc::new(NullAdapter(Channel::Call)));

        assert!(registry.get(Channel::Email).is_some());
        assert!(registry.get(Channel::Call).is_some());
        assert!(registry.get(Channel::NetworkConnect).is_none());
    }
}
