pub mod providers;
pub mod retry;

use refinery_core::config::AppConfig;
use refinery_core::config::ModelConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::GenerationOracle;

pub use providers::openai::OpenAiClient;
pub use retry::RetryingOracle;

/// Create a generation oracle based on the provider name.
pub fn create_oracle(config: &ModelConfig) -> Result<Box<dyn GenerationOracle>> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Err(RefineryError::UnsupportedProvider(config.provider.clone())),
        // Everything else speaks the OpenAI-compatible protocol
        _ => Ok(Box::new(OpenAiClient::new(config.clone())?)),
    }
}

/// Primary model wrapped with retries and the configured fallback models.
pub fn oracle_from_config(config: &AppConfig) -> Result<RetryingOracle> {
    let primary = create_oracle(&config.model)?;
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| Ok((fb.model_id.clone(), create_oracle(fb)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(RetryingOracle::new(primary, fallbacks, config.retry.clone()))
}
