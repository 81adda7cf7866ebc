//! Email channel — SMTP via lettre.
//!
//! Builds a multipart (rich + plain) message and reports the relay's
//! verdict. Never retries; the provider's accept is final here and
//! anything else is classified for the scheduler.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

use crate::channels::{ChannelAdapter, DispatchResult, OutboundMessage};
use crate::config::SmtpConfig;
use crate::model::{Channel, Sender};

/// SMTP email adapter.
pub struct EmailAdapter {
    config: SmtpConfig,
}

impl EmailAdapter {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(
        &self,
        sender: &Sender,
        to: &str,
        subject: &str,
        rich_body: &str,
        plain_body: &str,
    ) -> Result<Message, DispatchResult> {
        let from: Mailbox = format!("{} <{}>", sender.name, sender.email)
            .parse()
            .map_err(|e| DispatchResult::permanent(format!("invalid from address: {e}")))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| DispatchResult::permanent(format!("invalid to address: {e}")))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(
                plain_body.to_string(),
                rich_body.to_string(),
            ))
            .map_err(|e| DispatchResult::permanent(format!("failed to build email: {e}")))
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchResult {
        let OutboundMessage::Email {
            to,
            subject,
            rich_body,
            plain_body,
        } = message
        else {
            return DispatchResult::permanent("email adapter received a non-email payload");
        };

        let email = match self.build_message(sender, to, subject, rich_body, plain_body) {
            Ok(email) => email,
            Err(result) => return result,
        };

        let config = self.config.clone();
        let to = to.clone();

        // SMTP transport is blocking; keep it off the async workers.
        let outcome = tokio::task::spawn_blocking(move || {
            let transport = SmtpTransport::relay(&config.host)
                .map_err(|e| DispatchResult::permanent(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .credentials(Credentials::new(config.username, config.password))
                .build();

            transport.send(&email).map_err(|e| {
                if e.is_permanent() {
                    DispatchResult::permanent(format!("SMTP rejected: {e}"))
                } else {
                    DispatchResult::transient(format!("SMTP send failed: {e}"))
                }
            })
        })
        .await;

        match outcome {
            Ok(Ok(response)) if response.is_positive() => {
                info!(to = %to, "Email accepted by relay");
                DispatchResult::sent(None)
            }
            // A completed exchange without a positive code is the relay
            // telling us to back off.
            Ok(Ok(response)) => {
                DispatchResult::transient(format!("SMTP non-positive response: {:?}", response.code()))
            }
            Ok(Err(result)) => result,
            Err(e) => DispatchResult::transient(format!("send task failed: {e}")),
        }
    }
}
