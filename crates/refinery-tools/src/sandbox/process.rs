use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use refinery_core::config::SandboxConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::SandboxExecutor;
use refinery_core::types::Bindings;

use super::{collect_bindings, diagnostic_tail, stage_files, HARNESS_FILE};

/// Runs artifacts with a local interpreter in a throwaway directory.
pub struct ProcessSandbox {
    interpreter: String,
    timeout_secs: u64,
}

impl ProcessSandbox {
    pub fn new(interpreter: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.interpreter.clone(), config.timeout_secs)
    }
}

impl SandboxExecutor for ProcessSandbox {
    fn execute<'a>(
        &'a self,
        artifact: &'a str,
        bindings: Bindings,
    ) -> BoxFuture<'a, Result<Bindings>> {
        Box::pin(async move {
            let dir = tempfile::tempdir()?;
            stage_files(dir.path(), artifact, &bindings)?;

            debug!(
                interpreter = %self.interpreter,
                bindings = bindings.len(),
                "Executing artifact"
            );

            let timeout = Duration::from_secs(self.timeout_secs);
            let result = tokio::time::timeout(
                timeout,
                tokio::process::Command::new(&self.interpreter)
                    .arg(HARNESS_FILE)
                    .current_dir(dir.path())
                    .kill_on_drop(true)
                    .output(),
            )
            .await;

            match result {
                Ok(Ok(output)) if output.status.success() => collect_bindings(dir.path()),
                Ok(Ok(output)) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let code = output.status.code().unwrap_or(-1);
                    Err(RefineryError::SandboxExecution(format!(
                        "Exit code {}\n{}",
                        code,
                        diagnostic_tail(&stderr, 4000)
                    )))
                }
                Ok(Err(e)) => Err(RefineryError::SandboxExecution(format!(
                    "failed to start {}: {}",
                    self.interpreter, e
                ))),
                Err(_) => Err(RefineryError::SandboxTimeout {
                    timeout_secs: self.timeout_secs,
                }),
            }
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}
