use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, warn};

use refinery_core::config::SandboxConfig;
use refinery_core::error::{RefineryError, Result};
use refinery_core::traits::SandboxExecutor;
use refinery_core::types::Bindings;

use super::{collect_bindings, diagnostic_tail, stage_files, HARNESS_FILE};

const MOUNT_POINT: &str = "/sandbox";

/// Runs artifacts inside a network-less container.
pub struct DockerSandbox {
    image: String,
    memory_mb: u64,
    timeout_secs: u64,
}

impl DockerSandbox {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            image: config.image.clone(),
            memory_mb: config.memory_mb,
            timeout_secs: config.timeout_secs,
        }
    }

    async fn run_container(&self, artifact: &str, bindings: &Bindings) -> Result<Bindings> {
        let dir = tempfile::tempdir()?;
        stage_files(dir.path(), artifact, bindings)?;

        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            RefineryError::SandboxExecution(format!("Docker connect failed: {}", e))
        })?;

        let container_config = bollard::container::Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["python".to_string(), HARNESS_FILE.to_string()]),
            working_dir: Some(MOUNT_POINT.to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some((self.memory_mb as i64) * 1024 * 1024),
                binds: Some(vec![format!("{}:{}", dir.path().display(), MOUNT_POINT)]),
                network_mode: Some("none".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = docker
            .create_container::<&str, String>(None, container_config)
            .await
            .map_err(|e| RefineryError::SandboxExecution(format!("Docker create failed: {}", e)))?;

        debug!(image = %self.image, container = %container.id, "Sandbox container created");

        if let Err(e) = docker.start_container::<String>(&container.id, None).await {
            remove(&docker, &container.id).await;
            return Err(RefineryError::SandboxExecution(format!(
                "Docker start failed: {}",
                e
            )));
        }

        let timeout = Duration::from_secs(self.timeout_secs);
        let wait_result = tokio::time::timeout(timeout, async {
            let mut stream = docker.wait_container::<String>(
                &container.id,
                None::<bollard::container::WaitContainerOptions<String>>,
            );
            stream.next().await
        })
        .await;

        if wait_result.is_err() {
            docker
                .kill_container::<String>(&container.id, None)
                .await
                .ok();
        }

        let log_options = bollard::container::LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut log_stream = docker.logs(&container.id, Some(log_options));
        let mut output = String::new();
        while let Some(Ok(log)) = log_stream.next().await {
            output.push_str(&log.to_string());
        }

        remove(&docker, &container.id).await;

        match wait_result {
            Ok(Some(Ok(exit))) if exit.status_code == 0 => collect_bindings(dir.path()),
            Ok(Some(Ok(exit))) => Err(RefineryError::SandboxExecution(format!(
                "Exit code {}\n{}",
                exit.status_code,
                diagnostic_tail(&output, 4000)
            ))),
            // bollard reports non-zero exits as an error on the wait stream
            Ok(Some(Err(e))) => Err(RefineryError::SandboxExecution(format!(
                "{}\n{}",
                e,
                diagnostic_tail(&output, 4000)
            ))),
            Ok(None) => collect_bindings(dir.path()),
            Err(_) => Err(RefineryError::SandboxTimeout {
                timeout_secs: self.timeout_secs,
            }),
        }
    }
}

async fn remove(docker: &bollard::Docker, id: &str) {
    let remove_options = bollard::container::RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(remove_options)).await {
        warn!(container = %id, error = %e, "Failed to remove sandbox container");
    }
}

impl SandboxExecutor for DockerSandbox {
    fn execute<'a>(
        &'a self,
        artifact: &'a str,
        bindings: Bindings,
    ) -> BoxFuture<'a, Result<Bindings>> {
        Box::pin(async move { self.run_container(artifact, &bindings).await })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn docker_available() -> bool {
        match bollard::Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    fn sandbox() -> DockerSandbox {
        DockerSandbox::from_config(&SandboxConfig {
            timeout_secs: 120,
            ..SandboxConfig::default()
        })
    }

    #[tokio::test]
    #[ignore = "needs a Docker daemon with the sandbox image pulled"]
    async fn test_artifact_round_trip_in_container() {
        if !docker_available().await {
            return;
        }
        let mut input = Bindings::new();
        input.insert("rows".into(), json!([1, 2, 3]));

        let out = sandbox()
            .execute("rows = [r * 2 for r in rows]\ntotal = sum(rows)", input.clone())
            .await
            .unwrap();
        assert_eq!(out["rows"], json!([2, 4, 6]));
        assert_eq!(out["total"], json!(12));
        assert_eq!(input["rows"], json!([1, 2, 3]));
    }

    #[tokio::test]
    #[ignore = "needs a Docker daemon with the sandbox image pulled"]
    async fn test_container_exception_becomes_diagnostic() {
        if !docker_available().await {
            return;
        }
        let err = sandbox()
            .execute("raise ValueError('bad column')", Bindings::new())
            .await
            .unwrap_err();
        match err {
            RefineryError::SandboxExecution(msg) => assert!(msg.contains("bad column")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_config_copies_limits() {
        let s = sandbox();
        assert_eq!(s.timeout_secs(), 120);
        assert_eq!(s.memory_mb, 512);
        assert_eq!(s.image, "python:3.12-slim");
    }
}
