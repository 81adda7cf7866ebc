//! Personalizer — derives the generated template variables for a
//! recipient in one of three modes.
//!
//! `signal_based` never touches the network. The two AI modes degrade to
//! empty-string variables when the provider fails; a step is never
//! aborted over personalization.

pub mod ai;
pub mod library;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

pub use ai::{AiClient, HttpAiClient};

use crate::model::{PersonalizationMode, Recipient};

/// Phrases that make generated openers read like scraped outreach.
/// Violations are logged for operator review, not rejected.
const BANNED_PHRASES: &[&str] = &[
    "i noticed",
    "i saw",
    "i came across",
    "your team",
    "your operation",
    "your company",
    "after researching",
];

/// Derived variables plus an optional replacement body
/// (`fully_personalized` only).
#[derive(Debug, Clone, Default)]
pub struct PersonaOutput {
    pub vars: HashMap<String, String>,
    pub replacement_body: Option<String>,
    /// True when an AI mode fell back to empty variables. The executor
    /// tags the log entry so the fallback is visible downstream.
    pub degraded: bool,
}

/// Produces `personalization_sentence`, `pain_statement`, and
/// `credibility_anchor` for the variable bag.
pub struct Personalizer {
    ai: Option<Arc<dyn AiClient>>,
}

impl Personalizer {
    pub fn new(ai: Option<Arc<dyn AiClient>>) -> Self {
        Self { ai }
    }

    pub async fn personalize(
        &self,
        recipient: &Recipient,
        mode: PersonalizationMode,
    ) -> PersonaOutput {
        match mode {
            PersonalizationMode::SignalBased => self.signal_based(recipient),
            PersonalizationMode::OpenerOnly => self.opener_only(recipient).await,
            PersonalizationMode::FullyPersonalized => self.fully_personalized(recipient).await,
        }
    }

    fn signal_based(&self, recipient: &Recipient) -> PersonaOutput {
        let (opener, pain, credibility) = library::derive(recipient);
        PersonaOutput {
            vars: derived_vars(opener, pain, credibility),
            replacement_body: None,
            degraded: false,
        }
    }

    async fn opener_only(&self, recipient: &Recipient) -> PersonaOutput {
        let prompt = opener_prompt(recipient);
        match self.ai_complete(&prompt, 80).await {
            Ok(opener) => {
                for issue in validate_opener(&opener) {
                    warn!(
                        recipient = %recipient.id,
                        issue,
                        "Generated opener failed a quality check"
                    );
                }
                // Pain and credibility still come from the signal library.
                let (_, pain, credibility) = library::derive(recipient);
                PersonaOutput {
                    vars: derived_vars(opener, pain, credibility),
                    replacement_body: None,
                    degraded: false,
                }
            }
            Err(e) => self.degrade(recipient, "opener_only", &e),
        }
    }

    async fn fully_personalized(&self, recipient: &Recipient) -> PersonaOutput {
        let prompt = full_body_prompt(recipient);
        match self.ai_complete(&prompt, 400).await {
            Ok(body) => {
                let (opener, pain, credibility) = library::derive(recipient);
                PersonaOutput {
                    vars: derived_vars(opener, pain, credibility),
                    replacement_body: Some(body),
                    degraded: false,
                }
            }
            Err(e) => self.degrade(recipient, "fully_personalized", &e),
        }
    }

    async fn ai_complete(
        &self,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, crate::error::PersonalizeError> {
        match &self.ai {
            Some(client) => client.complete(prompt, max_tokens).await,
            None => Err(crate::error::PersonalizeError::NotConfigured),
        }
    }

    fn degrade(
        &self,
        recipient: &Recipient,
        mode: &str,
        error: &crate::error::PersonalizeError,
    ) -> PersonaOutput {
        warn!(
            recipient = %recipient.id,
            mode,
            error = %error,
            "Personalization degraded to empty variables"
        );
        PersonaOutput {
            vars: derived_vars(String::new(), String::new(), String::new()),
            replacement_body: None,
            degraded: true,
        }
    }
}

fn derived_vars(opener: String, pain: String, credibility: String) -> HashMap<String, String> {
    HashMap::from([
        ("personalization_sentence".to_string(), opener),
        ("pain_statement".to_string(), pain),
        ("credibility_anchor".to_string(), credibility),
    ])
}

fn opener_prompt(recipient: &Recipient) -> String {
    format!(
        "Write a 1-2 sentence cold email opener for {first} {last}, {title} at {company} \
         ({industry}). Reference their context without sounding researched. \
         Signals: {signals}. No greeting, no 'I noticed', 10-30 words.",
        first = recipient.first_name,
        last = recipient.last_name,
        title = recipient.title,
        company = recipient.company,
        industry = recipient.industry,
        signals = recipient
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn full_body_prompt(recipient: &Recipient) -> String {
    format!(
        "Write a short cold outreach email body (under 120 words, plain text, no subject, \
         no signature) to {first} {last}, {title} at {company} in {industry}. \
         Focus on one concrete operational pain and one credibility point. \
         You may use {{{{first_name}}}} and {{{{company_name}}}} placeholders.",
        first = recipient.first_name,
        last = recipient.last_name,
        title = recipient.title,
        company = recipient.company,
        industry = recipient.industry,
    )
}

/// Quality checks on a generated opener. Returns issues; empty means clean.
fn validate_opener(sentence: &str) -> Vec<String> {
    let mut issues = Vec::new();

    let word_count = sentence.split_whitespace().count();
    if word_count < 10 {
        issues.push(format!("too short ({word_count} words)"));
    } else if word_count > 30 {
        issues.push(format!("too long ({word_count} words)"));
    }

    let lower = sentence.to_lowercase();
    for phrase in BANNED_PHRASES {
        if lower.contains(phrase) {
            issues.push(format!("contains banned phrase '{phrase}'"));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;

    struct FailingAi;

    #[async_trait]
    impl AiClient for FailingAi {
        async fn complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<String, crate::error::PersonalizeError> {
            Err(crate::error::PersonalizeError::RequestFailed(
                "provider down".into(),
            ))
        }
    }

    struct CannedAi(String);

    #[async_trait]
    impl AiClient for CannedAi {
        async fn complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<String, crate::error::PersonalizeError> {
            Ok(self.0.clone())
        }
    }

    fn recipient() -> Recipient {
        Recipient {
            id: "r-7".into(),
            first_name: "Mia".into(),
            last_name: "Chen".into(),
            email: "mia@acme.test".into(),
            title: "Director of Operations".into(),
            phone: None,
            network_url: None,
            company: "Acme Fulfillment".into(),
            industry: "Logistics".into(),
            attributes: StdHashMap::from([(
                "job_postings_count".to_string(),
                "3".to_string(),
            )]),
        }
    }

    #[tokio::test]
    async fn signal_based_needs_no_client() {
        let personalizer = Personalizer::new(None);
        let out = personalizer
            .personalize(&recipient(), PersonalizationMode::SignalBased)
            .await;
        assert!(!out.degraded);
        assert!(out.replacement_body.is_none());
        assert!(!out.vars["personalization_sentence"].is_empty());
        assert!(!out.vars["pain_statement"].is_empty());
        assert!(!out.vars["credibility_anchor"].is_empty());
    }

    #[tokio::test]
    async fn ai_failure_degrades_to_empty_vars() {
        let personalizer = Personalizer::new(Some(Arc::new(FailingAi)));
        let out = personalizer
            .personalize(&recipient(), PersonalizationMode::OpenerOnly)
            .await;
        assert!(out.degraded);
        assert_eq!(out.vars["personalization_sentence"], "");
        assert_eq!(out.vars["pain_statement"], "");
        assert_eq!(out.vars["credibility_anchor"], "");
        assert!(out.replacement_body.is_none());
    }

    #[tokio::test]
    async fn missing_client_degrades_instead_of_erroring() {
        let personalizer = Personalizer::new(None);
        let out = personalizer
            .personalize(&recipient(), PersonalizationMode::FullyPersonalized)
            .await;
        assert!(out.degraded);
    }

    #[tokio::test]
    async fn opener_only_fills_sentence_from_ai() {
        let opener = "Teams scaling fulfillment this quarter usually feel pick-path drag first.";
        let personalizer = Personalizer::new(Some(Arc::new(CannedAi(opener.into()))));
        let out = personalizer
            .personalize(&recipient(), PersonalizationMode::OpenerOnly)
            .await;
        assert_eq!(out.vars["personalization_sentence"], opener);
        assert!(!out.vars["pain_statement"].is_empty());
        assert!(out.replacement_body.is_none());
    }

    #[tokio::test]
    async fn fully_personalized_returns_replacement_body() {
        let body = "Hi {{first_name}}, quick thought on dock throughput.";
        let personalizer = Personalizer::new(Some(Arc::new(CannedAi(body.into()))));
        let out = personalizer
            .personalize(&recipient(), PersonalizationMode::FullyPersonalized)
            .await;
        assert_eq!(out.replacement_body.as_deref(), Some(body));
    }

    #[test]
    fn opener_validation_flags_banned_phrases_and_length() {
        let issues = validate_opener("I noticed your team is growing.");
        assert!(issues.iter().any(|i| i.contains("banned")));
        assert!(issues.iter().any(|i| i.contains("too short")));
        assert!(validate_opener(
            "Operations teams balancing storage density against pick rates usually find travel time is the hidden ceiling."
        )
        .is_empty());
    }
}
