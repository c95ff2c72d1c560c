//! Abstracts the container runtime: build image, run container with port and
//! memory limits, stop, fetch stats/logs. The production implementation wraps
//! `bollard` against the local Docker daemon; `FakeRuntime` backs scheduler
//! unit tests so they don't require a live daemon.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("build failed for {challenge}: {source}")]
    BuildFailed { challenge: String, source: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

impl From<RuntimeError> for broker_common::BrokerError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::BuildFailed { challenge, source } => {
                broker_common::BrokerError::BuildError {
                    challenge,
                    source,
                }
            }
            RuntimeError::NotFound(id) => broker_common::BrokerError::NotFound(id),
            RuntimeError::Unavailable(msg) => broker_common::BrokerError::RuntimeUnavailable(msg),
        }
    }
}

fn classify(err: BollardError) -> RuntimeError {
    if let BollardError::DockerResponseServerError { status_code, .. } = &err {
        if *status_code == 404 {
            return RuntimeError::NotFound(err.to_string());
        }
    }
    RuntimeError::Unavailable(err.to_string())
}

/// A live container, identified by its runtime id and the name it is running
/// under (used by the `reset` CLI command to spare infrastructure containers).
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, challenge_name: &str, context_path: &Path) -> Result<()>;

    async fn run(
        &self,
        image: &str,
        internal_port: u16,
        external_port: u16,
        mem_limit_bytes: i64,
    ) -> Result<String>;

    async fn stop(&self, container_id: &str, grace_seconds: i64) -> Result<()>;

    async fn stats(&self, container_id: &str) -> Result<serde_json::Value>;

    async fn logs(&self, container_id: &str) -> Result<Vec<u8>>;

    async fn list_containers(&self) -> Result<Vec<RunningContainer>>;
}

/// Production implementation, wrapping `bollard::Docker` directly.
pub struct DockerRuntime {
    docker: Arc<Docker>,
}

impl DockerRuntime {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self { docker }
    }

    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self::new(Arc::new(docker)))
    }

    fn build_context_tar(context_path: &Path) -> Result<Vec<u8>> {
        let mut archive = tar::Builder::new(Vec::new());
        archive
            .append_dir_all(".", context_path)
            .map_err(|e| RuntimeError::Unavailable(format!("failed to tar build context: {e}")))?;
        archive
            .into_inner()
            .map_err(|e| RuntimeError::Unavailable(format!("failed to finish tar: {e}")))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, context_path), fields(challenge = %challenge_name))]
    async fn build_image(&self, challenge_name: &str, context_path: &Path) -> Result<()> {
        let tar_bytes = Self::build_context_tar(context_path).map_err(|e| RuntimeError::BuildFailed {
            challenge: challenge_name.to_string(),
            source: e.to_string(),
        })?;

        let options = BuildImageOptions {
            t: challenge_name.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(hyper::Body::from(tar_bytes)));

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(detail) = info.error_detail {
                        return Err(RuntimeError::BuildFailed {
                            challenge: challenge_name.to_string(),
                            source: detail.message.unwrap_or_default(),
                        });
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::BuildFailed {
                        challenge: challenge_name.to_string(),
                        source: e.to_string(),
                    })
                }
            }
        }

        info!(challenge = %challenge_name, "built challenge image");
        Ok(())
    }

    #[instrument(skip(self), fields(%image, %internal_port, %external_port))]
    async fn run(
        &self,
        image: &str,
        internal_port: u16,
        external_port: u16,
        mem_limit_bytes: i64,
    ) -> Result<String> {
        let port_key = format!("{internal_port}/tcp");
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(external_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            memory: Some(mem_limit_bytes),
            memory_swap: Some(mem_limit_bytes),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = Some(CreateContainerOptions {
            name: format!("broker-{}-{}", image.replace([':', '/'], "-"), external_port),
            platform: None,
        });

        let created = self
            .docker
            .create_container(create_options, config)
            .await
            .map_err(classify)?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)?;

        info!(container_id = %created.id, "started instance container");
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn stop(&self, container_id: &str, grace_seconds: i64) -> Result<()> {
        let options = Some(StopContainerOptions { t: grace_seconds });
        match self.docker.stop_container(container_id, options).await {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                warn!(%container_id, "stop: container already gone");
            }
            Err(e) => return Err(classify(e)),
        }

        let remove_options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(container_id, remove_options).await {
            warn!(%container_id, error = %e, "failed to remove stopped container");
        }
        Ok(())
    }

    async fn stats(&self, container_id: &str) -> Result<serde_json::Value> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: true,
        });
        let mut stream = self.docker.stats(container_id, options);
        let stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::NotFound(container_id.to_string()))?
            .map_err(classify)?;
        serde_json::to_value(stats).map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn logs(&self, container_id: &str) -> Result<Vec<u8>> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        });
        let mut stream = self.docker.logs(container_id, options);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.extend_from_slice(&log.into_bytes()),
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(out)
    }

    async fn list_containers(&self) -> Result<Vec<RunningContainer>> {
        let summaries = self
            .docker
            .list_containers::<String>(None)
            .await
            .map_err(classify)?;

        Ok(summaries
            .into_iter()
            .map(|c| RunningContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default()
                    .trim_start_matches('/')
                    .to_string(),
            })
            .collect())
    }
}

/// Deterministic in-memory runtime, exported (not `#[cfg(test)]`-gated) so
/// downstream crates' own test suites — broker-catalog's and
/// broker-scheduler's — can depend on it without a live Docker daemon.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Deterministic in-memory runtime for scheduler tests.
    pub struct FakeRuntime {
        next_id: Mutex<u64>,
        pub fail_builds: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<String>>,
    }

    impl Default for FakeRuntime {
        fn default() -> Self {
            Self {
                next_id: Mutex::new(0),
                fail_builds: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
            }
        }
    }

    impl FakeRuntime {
        pub fn fail_build_for(&self, challenge: &str) {
            self.fail_builds.lock().unwrap().push(challenge.to_string());
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn build_image(&self, challenge_name: &str, _context_path: &Path) -> Result<()> {
            if self
                .fail_builds
                .lock()
                .unwrap()
                .iter()
                .any(|c| c == challenge_name)
            {
                return Err(RuntimeError::BuildFailed {
                    challenge: challenge_name.to_string(),
                    source: "simulated build failure".to_string(),
                });
            }
            Ok(())
        }

        async fn run(
            &self,
            _image: &str,
            _internal_port: u16,
            _external_port: u16,
            _mem_limit_bytes: i64,
        ) -> Result<String> {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            Ok(format!("fake-container-{}", *guard))
        }

        async fn stop(&self, container_id: &str, _grace_seconds: i64) -> Result<()> {
            self.stopped.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn stats(&self, _container_id: &str) -> Result<serde_json::Value> {
            Ok(serde_json::json!({}))
        }

        async fn logs(&self, _container_id: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn list_containers(&self) -> Result<Vec<RunningContainer>> {
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRuntime;
    use super::*;

    #[tokio::test]
    async fn fake_build_failure_is_reported_per_challenge() {
        let runtime = FakeRuntime::default();
        runtime.fail_build_for("broken");

        assert!(runtime.build_image("broken", Path::new(".")).await.is_err());
        assert!(runtime.build_image("fine", Path::new(".")).await.is_ok());
    }

    #[tokio::test]
    async fn fake_run_assigns_distinct_ids() {
        let runtime = FakeRuntime::default();
        let a = runtime.run("img", 80, 9001, 64 * 1_048_576).await.unwrap();
        let b = runtime.run("img", 80, 9002, 64 * 1_048_576).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn fake_stop_records_container_id() {
        let runtime = FakeRuntime::default();
        let id = runtime.run("img", 80, 9001, 64 * 1_048_576).await.unwrap();
        runtime.stop(&id, 5).await.unwrap();
        assert_eq!(runtime.stopped.lock().unwrap().as_slice(), [id]);
    }
}
