//! Proposal analysis: turns a vendor's free-text reply into structured terms
//! and a score through an LLM.
//!
//! The analyzer is treated as untrusted. Its output is parsed strictly and
//! any reply that is not the expected JSON shape is an error. Score clamping
//! is left to the caller.

pub mod queue;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, FinishReason, LlmProvider};
use crate::model::{ItemPrice, ProposalAnalysis, Rfp};

pub use queue::{AnalysisJob, AnalysisQueue, AnalysisReceiver, AnalysisWorkers, spawn_analysis_workers};

/// Normalized view of an RFP handed to the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct RfpSummary {
    pub title: String,
    pub description: String,
    pub budget: Option<Decimal>,
    pub delivery_deadline: Option<NaiveDate>,
    pub payment_terms: Option<String>,
    pub warranty: Option<String>,
    pub items: Vec<SummaryItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryItem {
    pub name: String,
    pub quantity: u32,
    /// Rendered `key: value` pairs.
    pub specifications: Vec<String>,
}

impl RfpSummary {
    pub fn from_rfp(rfp: &Rfp) -> Self {
        Self {
            title: rfp.title.clone(),
            description: rfp.description.clone(),
            budget: rfp.budget,
            delivery_deadline: rfp.delivery_deadline,
            payment_terms: rfp.payment_terms.clone(),
            warranty: rfp.warranty.clone(),
            items: rfp
                .items
                .iter()
                .map(|item| SummaryItem {
                    name: item.name.clone(),
                    quantity: item.quantity,
                    specifications: item
                        .specifications
                        .iter()
                        .map(|(k, v)| match v {
                            serde_json::Value::String(s) => format!("{k}: {s}"),
                            other => format!("{k}: {other}"),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

fn or_not_specified(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.trim().is_empty() => v,
        _ => "Not specified",
    }
}

impl fmt::Display for RfpSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = if self.description.trim().is_empty() {
            "N/A"
        } else {
            self.description.as_str()
        };
        writeln!(f, "Title: {}", self.title)?;
        writeln!(f, "Description: {description}")?;
        match self.budget {
            Some(budget) => writeln!(f, "Budget: ${budget}")?,
            None => writeln!(f, "Budget: Not specified")?,
        }
        match self.delivery_deadline {
            Some(date) => writeln!(f, "Delivery Deadline: {}", date.format("%Y-%m-%d"))?,
            None => writeln!(f, "Delivery Deadline: Not specified")?,
        }
        writeln!(f, "Payment Terms: {}", or_not_specified(self.payment_terms.as_deref()))?;
        writeln!(f, "Warranty Required: {}", or_not_specified(self.warranty.as_deref()))?;
        write!(f, "Items:")?;
        if self.items.is_empty() {
            write!(f, " none listed")?;
        }
        for (i, item) in self.items.iter().enumerate() {
            write!(f, "\n  {}. {} - Quantity: {}", i + 1, item.name, item.quantity)?;
            if !item.specifications.is_empty() {
                write!(f, " ({})", item.specifications.join(", "))?;
            }
        }
        Ok(())
    }
}

/// Extracts structured terms and a score from a proposal's raw text.
#[async_trait]
pub trait ProposalAnalyzer: Send + Sync {
    async fn analyze(&self, rfp: &RfpSummary, raw_content: &str) -> Result<ProposalAnalysis, LlmError>;
}

/// `ProposalAnalyzer` backed by an `LlmProvider`.
pub struct LlmProposalAnalyzer {
    llm: Arc<dyn LlmProvider>,
    max_tokens: u32,
    temperature: f32,
}

impl LlmProposalAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &AnalysisConfig) -> Self {
        Self {
            llm,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

#[async_trait]
impl ProposalAnalyzer for LlmProposalAnalyzer {
    async fn analyze(&self, rfp: &RfpSummary, raw_content: &str) -> Result<ProposalAnalysis, LlmError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(build_analysis_system_prompt()),
            ChatMessage::user(build_analysis_user_prompt(rfp, raw_content)),
        ])
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost = %response.cost(self.llm.cost_per_token()),
            "Analysis completion received"
        );
        if response.finish_reason == FinishReason::Length {
            warn!(model = self.llm.model_name(), "Analysis response hit the token limit");
        }

        parse_analysis_response(&response.content).map_err(|reason| {
            warn!(raw_response = %response.content, error = %reason, "Unparseable analysis response");
            LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason,
            }
        })
    }
}

fn build_analysis_system_prompt() -> String {
    "You are a procurement analyst. You read a vendor's reply to a request for proposal \
     and extract its commercial terms, then score it against the request.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"proposedPrice\": number|null, \"deliveryDays\": number|null, \"warranty\": string|null, \
     \"paymentTerms\": string|null, \"itemPricing\": [{\"name\": string, \"price\": number}], \
     \"strengths\": [string], \"weaknesses\": [string], \"score\": number, \"recommendation\": string}\n\n\
     Rules:\n\
     - proposedPrice is the total quoted price in the RFP's currency, null if not stated\n\
     - deliveryDays is the promised delivery time in days, null if not stated\n\
     - score is 0-100, weighted: price 40%, delivery time 25%, payment terms 20%, quality/warranty 15%\n\
     - recommendation is one or two sentences for the buyer\n\
     - Do not invent terms the vendor did not state"
        .to_string()
}

fn build_analysis_user_prompt(rfp: &RfpSummary, raw_content: &str) -> String {
    format!(
        "RFP Requirements:\n{rfp}\n\nVendor Proposal:\n{}\n\nAnalyze this proposal and respond with the JSON object.",
        raw_content.trim()
    )
}

// ── Response parsing ────────────────────────────────────────────────

/// Accept numbers, numeric strings (`"$1,200.50"`), or null.
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct RawItemPrice {
    #[serde(alias = "itemName", alias = "item_name", default)]
    name: String,
    #[serde(default, deserialize_with = "lenient_number")]
    price: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    #[serde(default, alias = "proposed_price", deserialize_with = "lenient_number")]
    proposed_price: Option<f64>,
    #[serde(default, alias = "delivery_days", deserialize_with = "lenient_number")]
    delivery_days: Option<f64>,
    #[serde(default)]
    warranty: Option<String>,
    #[serde(default, alias = "payment_terms")]
    payment_terms: Option<String>,
    #[serde(default, alias = "item_pricing")]
    item_pricing: Option<Vec<RawItemPrice>>,
    #[serde(default)]
    strengths: Option<Vec<String>>,
    #[serde(default)]
    weaknesses: Option<Vec<String>>,
    #[serde(default, deserialize_with = "lenient_number")]
    score: Option<f64>,
    #[serde(default)]
    recommendation: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Parse an analyzer reply. The score is returned unclamped.
pub fn parse_analysis_response(raw: &str) -> Result<ProposalAnalysis, String> {
    let json_str = extract_json_object(raw);
    let parsed: RawAnalysis =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;

    let score = match parsed.score {
        Some(score) if score.is_finite() => score,
        Some(_) => return Err("score is not a finite number".to_string()),
        None => return Err("missing score".to_string()),
    };

    let delivery_days = parsed
        .delivery_days
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round().min(f64::from(u32::MAX)) as u32);

    let item_pricing = parsed
        .item_pricing
        .unwrap_or_default()
        .into_iter()
        .filter_map(|item| {
            let price = item.price.filter(|p| p.is_finite())?;
            let name = item.name.trim().to_string();
            (!name.is_empty()).then_some(ItemPrice { name, price })
        })
        .collect();

    Ok(ProposalAnalysis {
        proposed_price: parsed.proposed_price.filter(|p| p.is_finite()),
        delivery_days,
        warranty: non_blank(parsed.warranty),
        payment_terms: non_blank(parsed.payment_terms),
        item_pricing,
        strengths: parsed.strengths.unwrap_or_default(),
        weaknesses: parsed.weaknesses.unwrap_or_default(),
        score,
        recommendation: parsed.recommendation.unwrap_or_default().trim().to_string(),
    })
}

/// Extract a JSON object from text that may have markdown wrapping.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return inner.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
