//! Resolve an inbound email to the vendor who sent it and the RFP it answers.
//!
//! Vendor: exact case-insensitive sender lookup. RFP, first hit wins:
//! 1. an `RFP-<id>` reference in the cleaned subject,
//! 2. title containment against `sent` RFPs, most recently updated first,
//! 3. the title's distinctive words, as whole words, in the subject,
//! 4. the only `sent` RFP, if there is exactly one.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::mailbox::parse::InboundEmail;
use crate::model::{Rfp, RfpStatus, Vendor};
use crate::store::Database;

static REPLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:(?:re|fwd|fw)\s*:\s*)+").expect("reply prefix pattern is valid")
});

static RFP_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RFP[-_]?([a-zA-Z0-9-]+)").expect("RFP reference pattern is valid")
});

/// Words that say "this is a procurement" without saying what is procured.
const GENERIC_TITLE_WORDS: &[&str] = &[
    "rfp",
    "rfq",
    "request",
    "for",
    "of",
    "proposal",
    "proposals",
    "quote",
    "quotation",
    "procurement",
    "purchase",
    "tender",
    "bid",
];

/// How the RFP was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMethod {
    SubjectReference,
    TitleContainment,
    CoreTitle,
    SingleSentFallback,
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SubjectReference => "subject_reference",
            Self::TitleContainment => "title_containment",
            Self::CoreTitle => "core_title",
            Self::SingleSentFallback => "single_sent_fallback",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub enum MatchOutcome {
    Matched {
        vendor: Vendor,
        rfp: Rfp,
        via: MatchMethod,
    },
    NoVendorMatch,
    NoRfpMatch,
}

/// Strip any run of `Re:` / `Fwd:` / `Fw:` prefixes.
pub fn clean_subject(subject: &str) -> String {
    REPLY_PREFIX.replace(subject.trim(), "").trim().to_string()
}

/// The id following an `RFP` marker, e.g. `abc123` in `"RFP-abc123 quote"`.
pub fn extract_rfp_reference(subject: &str) -> Option<String> {
    RFP_REFERENCE
        .captures(subject)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Case-insensitive containment in either direction.
pub fn title_matches(cleaned_subject: &str, title: &str) -> bool {
    let subject = cleaned_subject.trim().to_lowercase();
    let title = title.trim().to_lowercase();
    if subject.is_empty() || title.is_empty() {
        return false;
    }
    subject.contains(&title) || title.contains(&subject)
}

/// The title's words minus generic procurement words appear, in order and
/// adjacent, as whole words of the subject.
pub fn core_title_matches(cleaned_subject: &str, title: &str) -> bool {
    let title_words = words(title);
    let core: Vec<&str> = title_words
        .iter()
        .map(String::as_str)
        .filter(|w| !GENERIC_TITLE_WORDS.contains(w))
        .collect();
    if core.is_empty() {
        return false;
    }
    let subject = words(cleaned_subject);
    subject
        .windows(core.len())
        .any(|window| window.iter().zip(&core).all(|(s, c)| s == c))
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Store-backed resolver.
pub struct Matcher {
    db: Arc<dyn Database>,
}

impl Matcher {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub async fn resolve(&self, email: &InboundEmail) -> Result<MatchOutcome, DatabaseError> {
        let Some(vendor) = self.db.find_vendor_by_email(&email.sender).await? else {
            return Ok(MatchOutcome::NoVendorMatch);
        };

        match self.resolve_rfp(email).await? {
            Some((rfp, via)) => {
                info!(vendor_id = %vendor.id, rfp_id = %rfp.id, via = %via, "Email matched");
                Ok(MatchOutcome::Matched { vendor, rfp, via })
            }
            None => Ok(MatchOutcome::NoRfpMatch),
        }
    }

    async fn resolve_rfp(
        &self,
        email: &InboundEmail,
    ) -> Result<Option<(Rfp, MatchMethod)>, DatabaseError> {
        let cleaned = clean_subject(&email.subject);

        if let Some(reference) = extract_rfp_reference(&cleaned) {
            match Uuid::parse_str(&reference) {
                Ok(id) => {
                    if let Some(rfp) = self.db.get_rfp(id).await? {
                        return Ok(Some((rfp, MatchMethod::SubjectReference)));
                    }
                    debug!(reference = %reference, "RFP reference does not exist");
                }
                Err(_) => debug!(reference = %reference, "RFP reference is not an id"),
            }
        }

        let mut sent = self.db.list_rfps_by_status(RfpStatus::Sent).await?;

        if let Some(pos) = sent.iter().position(|rfp| title_matches(&cleaned, &rfp.title)) {
            return Ok(Some((sent.swap_remove(pos), MatchMethod::TitleContainment)));
        }
        if let Some(pos) = sent.iter().position(|rfp| core_title_matches(&cleaned, &rfp.title)) {
            return Ok(Some((sent.swap_remove(pos), MatchMethod::CoreTitle)));
        }

        if sent.len() == 1
            && let Some(rfp) = sent.pop()
        {
            warn!(
                sender = %email.sender,
                subject = %email.subject,
                rfp_id = %rfp.id,
                "Matched email to the only sent RFP"
            );
            return Ok(Some((rfp, MatchMethod::SingleSentFallback)));
        }

        Ok(None)
    }
}
