//! Provider-agnostic completion types and the `LlmProvider` trait.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A plain text completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// All system messages joined, used as the preamble.
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: FinishReason,
}

impl CompletionResponse {
    /// Dollar cost of this response at the given per-token rates.
    pub fn cost(&self, rates: (Decimal, Decimal)) -> Decimal {
        let (input_rate, output_rate) = rates;
        input_rate * Decimal::from(self.input_tokens) + output_rate * Decimal::from(self.output_tokens)
    }
}

/// A text completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn model_name(&self) -> &str;

    /// (input, output) cost per token in dollars.
    fn cost_per_token(&self) -> (Decimal, Decimal);

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Known per-token prices, in dollars. Unknown models cost zero.
pub fn model_rates(model: &str) -> (Decimal, Decimal) {
    let model = model.to_lowercase();
    // Dollars per million tokens.
    let (input, output) = if model.contains("opus") {
        (15, 75)
    } else if model.contains("sonnet") {
        (3, 15)
    } else if model.contains("haiku") {
        (1, 5)
    } else if model.contains("gpt-4o-mini") {
        return (Decimal::new(15, 8), Decimal::new(6, 7));
    } else if model.contains("gpt-4o") {
        return (Decimal::new(25, 7), Decimal::new(1, 5));
    } else {
        return (Decimal::ZERO, Decimal::ZERO);
    };
    (Decimal::new(input, 6), Decimal::new(output, 6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn system_prompt_joins_system_messages() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("one"),
            ChatMessage::user("hello"),
            ChatMessage::system("two"),
        ]);
        assert_eq!(request.system_prompt().as_deref(), Some("one\n\ntwo"));

        let bare = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        assert!(bare.system_prompt().is_none());
    }

    #[test]
    fn builder_sets_limits() {
        let request = CompletionRequest::new(vec![])
            .with_max_tokens(2000)
            .with_temperature(0.2);
        assert_eq!(request.max_tokens, Some(2000));
        assert_eq!(request.temperature, Some(0.2));
    }

    #[test]
    fn sonnet_rates_and_cost() {
        let rates = model_rates("claude-sonnet-4-20250514");
        assert_eq!(rates, (dec!(0.000003), dec!(0.000015)));

        let response = CompletionResponse {
            content: String::new(),
            input_tokens: 1000,
            output_tokens: 100,
            finish_reason: FinishReason::Stop,
        };
        assert_eq!(response.cost(rates), dec!(0.0045));
    }

    #[test]
    fn unknown_model_is_free() {
        assert_eq!(model_rates("local-llama"), (Decimal::ZERO, Decimal::ZERO));
    }
}
