//! Domain records: RFPs, vendors, proposals and their statuses.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Lifecycle of an RFP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RfpStatus {
    /// Created, not yet distributed.
    Draft,
    /// Sent to vendors, accepting replies.
    Sent,
    /// No longer accepting replies.
    Closed,
}

impl std::fmt::Display for RfpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Sent => write!(f, "sent"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for RfpStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "sent" => Ok(Self::Sent),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown RFP status: {}", s)),
        }
    }
}

/// Lifecycle of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Stored, waiting for analysis.
    Pending,
    /// Analysis fields populated.
    Analyzed,
    /// Operator accepted the proposal.
    Accepted,
    /// Operator rejected the proposal.
    Rejected,
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Analyzed => write!(f, "analyzed"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "analyzed" => Ok(Self::Analyzed),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown proposal status: {}", s)),
        }
    }
}

/// A line item requested by an RFP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RfpItem {
    pub id: Uuid,
    pub name: String,
    /// Always >= 1.
    pub quantity: u32,
    #[serde(default)]
    pub specifications: serde_json::Map<String, serde_json::Value>,
}

/// A structured request for proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rfp {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub raw_input: String,
    pub budget: Option<Decimal>,
    pub delivery_deadline: Option<NaiveDate>,
    pub payment_terms: Option<String>,
    pub warranty: Option<String>,
    pub additional_requirements: Vec<String>,
    pub status: RfpStatus,
    /// Ordered as entered.
    pub items: Vec<RfpItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Grouping for vendors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorCategory {
    pub id: Uuid,
    pub name: String,
}

/// A supplier that can reply to RFPs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: Uuid,
    pub name: String,
    /// Unique, compared case-insensitively.
    pub email: String,
    pub phone: Option<String>,
    pub is_active: bool,
    pub category_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Price quoted for a single item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemPrice {
    #[serde(alias = "itemName", alias = "item_name")]
    pub name: String,
    pub price: f64,
}

/// A vendor's reply to an RFP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub raw_content: String,
    pub email_subject: Option<String>,
    pub status: ProposalStatus,
    pub proposed_price: Option<f64>,
    pub delivery_days: Option<u32>,
    pub warranty: Option<String>,
    pub payment_terms: Option<String>,
    pub item_pricing: Vec<ItemPrice>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    /// In [0, 100] once analyzed.
    pub score: Option<f64>,
    pub recommendation: Option<String>,
    pub is_recommended: bool,
    /// Set on the first successful analysis and kept across re-analyses.
    pub analyzed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured terms extracted from a proposal's raw text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalAnalysis {
    pub proposed_price: Option<f64>,
    pub delivery_days: Option<u32>,
    pub warranty: Option<String>,
    pub payment_terms: Option<String>,
    pub item_pricing: Vec<ItemPrice>,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub score: f64,
    pub recommendation: String,
}

impl ProposalAnalysis {
    /// Lowest accepted score.
    pub const MIN_SCORE: f64 = 0.0;
    /// Highest accepted score.
    pub const MAX_SCORE: f64 = 100.0;

    /// Truncate the score into [0, 100].
    pub fn clamped(mut self) -> Self {
        self.score = self.score.clamp(Self::MIN_SCORE, Self::MAX_SCORE);
        self
    }
}

/// Input for creating an RFP item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRfpItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default)]
    pub specifications: serde_json::Map<String, serde_json::Value>,
}

/// Input for creating an RFP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRfp {
    pub title: String,
    pub description: String,
    pub raw_input: String,
    pub budget: Option<Decimal>,
    pub delivery_deadline: Option<NaiveDate>,
    pub payment_terms: Option<String>,
    pub warranty: Option<String>,
    #[serde(default)]
    pub additional_requirements: Vec<String>,
    #[serde(default)]
    pub items: Vec<NewRfpItem>,
}

impl NewRfp {
    /// Set the delivery deadline from free text (see [`parse_delivery_deadline`]).
    pub fn with_deadline_text(mut self, text: &str) -> Self {
        self.delivery_deadline = parse_delivery_deadline(text, Utc::now().date_naive());
        self
    }
}

/// Input for creating a vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVendor {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub category_id: Uuid,
}

/// Partial vendor update. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VendorUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub category_id: Option<Uuid>,
    pub is_active: Option<bool>,
}

/// Input for storing a new proposal.
#[derive(Debug, Clone)]
pub struct NewProposal {
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub raw_content: String,
    pub email_subject: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl NewProposal {
    pub fn new(rfp_id: Uuid, vendor_id: Uuid, raw_content: impl Into<String>) -> Self {
        Self {
            rfp_id,
            vendor_id,
            raw_content: raw_content.into(),
            email_subject: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.email_subject = Some(subject.into());
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Operator override of a proposal's status and recommendation flag.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Option<ProposalStatus>,
    pub is_recommended: Option<bool>,
}

/// Parse a delivery deadline given either as a date or as a relative
/// `"<N> days"` offset from `today`.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps, `"30"`, `"30 days"`, `"1 day"`.
/// Anything else yields `None`.
pub fn parse_delivery_deadline(input: &str, today: NaiveDate) -> Option<NaiveDate> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }

    let lower = trimmed.to_lowercase();
    let number = lower
        .strip_suffix("days")
        .or_else(|| lower.strip_suffix("day"))
        .unwrap_or(lower.as_str())
        .trim();
    if let Ok(days) = number.parse::<u32>() {
        return today.checked_add_signed(Duration::days(i64::from(days)));
    }

    warn!(input = trimmed, "Could not parse delivery deadline");
    None
}
