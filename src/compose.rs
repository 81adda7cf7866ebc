//! Signature composer — appends sender signatures and derives the
//! plain-text alternative from rich content.

use regex::Regex;

use crate::model::Sender;

/// Final rendered email bodies with signature attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedEmail {
    pub subject: String,
    pub rich_body: String,
    pub plain_body: String,
}

/// Attaches sender signatures and converts rich content to plain text.
///
/// The plain-text conversion is conservative: strip markup, normalize
/// whitespace, keep one blank line between paragraphs. Round-tripping
/// back to HTML is not a goal.
pub struct SignatureComposer {
    line_break: Regex,
    paragraph_break: Regex,
    tag: Regex,
    spaces: Regex,
    blank_runs: Regex,
}

impl SignatureComposer {
    pub fn new() -> Self {
        Self {
            line_break: Regex::new(r"(?i)<br\s*/?>").unwrap(),
            paragraph_break: Regex::new(r"(?i)</(p|div|h[1-6]|li|tr)>").unwrap(),
            tag: Regex::new(r"<[^>]+>").unwrap(),
            spaces: Regex::new(r"[ \t]+").unwrap(),
            blank_runs: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    /// Append the sender's stored signature to a rendered email.
    ///
    /// The rich body gets the rich signature; the plain alternative is
    /// derived from the rich body and gets the plain signature. When the
    /// sender has no stored plain signature, it is derived from the rich one.
    pub fn compose(&self, sender: &Sender, subject: &str, rich_body: &str) -> ComposedEmail {
        let rich = if sender.signature_rich.is_empty() {
            rich_body.to_string()
        } else {
            format!("{rich_body}<br><br>{}", sender.signature_rich)
        };

        let plain_sig = if sender.signature_plain.is_empty() {
            self.html_to_plain(&sender.signature_rich)
        } else {
            sender.signature_plain.clone()
        };
        let mut plain = self.html_to_plain(rich_body);
        if !plain_sig.is_empty() {
            plain = format!("{plain}\n\n{plain_sig}");
        }

        ComposedEmail {
            subject: subject.to_string(),
            rich_body: rich,
            plain_body: plain,
        }
    }

    /// Strip markup, collapse whitespace runs, one blank line between
    /// paragraphs.
    pub fn html_to_plain(&self, html: &str) -> String {
        let text = self.line_break.replace_all(html, "\n");
        let text = self.paragraph_break.replace_all(&text, "\n\n");
        let text = self.tag.replace_all(&text, "");
        let text = decode_entities(&text);
        let text = self.spaces.replace_all(&text, " ");

        // Trim trailing space per line, then cap blank runs.
        let trimmed: String = text
            .lines()
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join("\n");
        self.blank_runs.replace_all(&trimmed, "\n\n").trim().to_string()
    }
}

impl Default for SignatureComposer {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
