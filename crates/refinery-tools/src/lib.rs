pub mod sandbox;
pub mod search;

use refinery_core::config::{SandboxConfig, WebSearchConfig};
use refinery_core::traits::{SandboxExecutor, SearchOracle};

pub use sandbox::{DockerSandbox, ProcessSandbox};
pub use search::TavilySearch;

/// Build the sandbox selected by `sandbox.mode`.
pub fn sandbox_from_config(config: &SandboxConfig) -> Box<dyn SandboxExecutor> {
    match config.mode.as_str() {
        "docker" => Box::new(DockerSandbox::from_config(config)),
        _ => Box::new(ProcessSandbox::from_config(config)),
    }
}

/// Build the keyword-search client, if one is configured.
pub fn search_from_config(config: Option<&WebSearchConfig>) -> Option<Box<dyn SearchOracle>> {
    config.map(|c| Box::new(TavilySearch::from_config(c)) as Box<dyn SearchOracle>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_selection() {
        let mut config = SandboxConfig::default();
        config.timeout_secs = 7;
        assert_eq!(sandbox_from_config(&config).timeout_secs(), 7);
        config.mode = "docker".into();
        assert_eq!(sandbox_from_config(&config).timeout_secs(), 7);
    }

    #[test]
    fn test_search_is_optional() {
        assert!(search_from_config(None).is_none());
    }
}
