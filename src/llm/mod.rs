//! Completion backends for proposal analysis.
//!
//! The analyzer only sees `LlmProvider`. Concrete backends are rig-core
//! completion models wrapped in `RigAdapter`, selected by `LlmBackend`.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::{LlmBackend, LlmConfig};
use crate::error::LlmError;

/// Build the provider named by `config.backend`.
///
/// No request is made here; a bad key surfaces on the first completion.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let key = config.api_key.expose_secret();
    let provider: Arc<dyn LlmProvider> = match config.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
                "anthropic",
            ))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(key).map_err(|e| client_error(config.backend, e))?;
            Arc::new(RigAdapter::new(
                client.completion_model(&config.model),
                &config.model,
                "openai",
            ))
        }
    };

    info!(backend = %config.backend, model = %config.model, "Completion backend configured");
    Ok(provider)
}

fn client_error(backend: LlmBackend, err: impl std::fmt::Display) -> LlmError {
    LlmError::RequestFailed {
        provider: backend.to_string(),
        reason: format!("client construction failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;
    use crate::config::DEFAULT_MODEL;

    fn config(backend: LlmBackend, model: &str) -> LlmConfig {
        LlmConfig {
            backend,
            api_key: SecretString::from("sk-test"),
            model: model.to_string(),
        }
    }

    #[test]
    fn anthropic_backend_prices_the_default_model() {
        let provider = create_provider(&config(LlmBackend::Anthropic, DEFAULT_MODEL)).unwrap();
        assert_eq!(provider.model_name(), DEFAULT_MODEL);
        assert!(provider.cost_per_token().0 > rust_decimal::Decimal::ZERO);
    }

    #[test]
    fn openai_backend_keeps_the_requested_model() {
        let provider = create_provider(&config(LlmBackend::OpenAi, "gpt-4o")).unwrap();
        assert_eq!(provider.model_name(), "gpt-4o");
    }
}
