use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use refinery_core::config::RetryConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::GenerationOracle;
use refinery_core::types::*;

/// An oracle that retries transient failures and falls back to alternative models.
///
/// Only transport-level failures are retried here. Schema and sandbox
/// failures go back to the caller, whose artifact loop asks for a fresh
/// candidate instead of replaying the same request.
pub struct RetryingOracle {
    primary: Box<dyn GenerationOracle>,
    fallbacks: Vec<(String, Box<dyn GenerationOracle>)>,
    retry_config: RetryConfig,
}

impl RetryingOracle {
    pub fn new(
        primary: Box<dyn GenerationOracle>,
        fallbacks: Vec<(String, Box<dyn GenerationOracle>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl GenerationOracle for RetryingOracle {
    fn generate<'a>(
        &'a self,
        messages: Vec<ChatMessage>,
        schema: Option<&'a OutputSchema>,
    ) -> BoxFuture<'a, Result<Generation>> {
        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut last_err = None;
            for attempt in 0..=max_retries {
                match self.primary.generate(messages.clone(), schema).await {
                    Ok(generation) => return Ok(generation),
                    Err(e) => {
                        if e.is_transient() && attempt < max_retries {
                            let backoff = calculate_backoff(attempt, &self.retry_config);
                            warn!(
                                attempt = attempt + 1,
                                max_retries,
                                backoff_ms = backoff.as_millis() as u64,
                                error = %e,
                                "Retrying oracle request"
                            );
                            tokio::time::sleep(backoff).await;
                            last_err = Some(e);
                            continue;
                        }
                        last_err = Some(e);
                        break;
                    }
                }
            }

            if !self.fallbacks.is_empty() {
                info!("Primary oracle exhausted, trying fallback models");
            }
            for (label, fallback) in &self.fallbacks {
                match fallback.generate(messages.clone(), schema).await {
                    Ok(generation) => {
                        info!(model = %label, "Fell back to alternative model");
                        return Ok(generation);
                    }
                    Err(e) => {
                        warn!(model = %label, error = %e, "Fallback model also failed");
                    }
                }
            }

            Err(last_err
                .unwrap_or_else(|| RefineryError::OracleRequest("All providers failed".into())))
        })
    }
}
