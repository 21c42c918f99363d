//! Docker-backed [`ContainerEngine`] built on `bollard`.

use super::{ContainerEngine, ContainerSpec, ContainerStatus, CpuCounters, EngineError, ExecOutput};
use async_trait::async_trait;
use bollard::{
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptionsBuilder, CreateImageOptionsBuilder, InspectContainerOptions,
        RestartContainerOptions, StartContainerOptions, StatsOptionsBuilder,
        StopContainerOptionsBuilder,
    },
    Docker,
};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

/// Seconds the daemon waits for a graceful stop before killing.
const STOP_GRACE_SECS: i32 = 5;

#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the local defaults (`DOCKER_HOST` or the unix socket).
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults().map_err(|source| EngineError::Api {
            op: "connect",
            container: String::new(),
            message: source.to_string(),
        })?;
        Ok(Self { docker })
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

fn engine_error(op: &'static str, container: &str, source: BollardError) -> EngineError {
    if is_not_found_error(&source) {
        EngineError::NotFound(container.to_string())
    } else {
        EngineError::Api {
            op,
            container: container.to_string(),
            message: source.to_string(),
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(image, "Pulling image");
        let (from_image, tag) = match image.rsplit_once(':') {
            // `host:port/name` carries no tag
            Some((img, tag)) if !tag.contains('/') => (img, tag),
            _ => (image, "latest"),
        };
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| engine_error("pull_image", image, source))?;
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), EngineError> {
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            tty: Some(spec.tty),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    spec.bind_dir,
                    super::CONTAINER_WORKSPACE
                )]),
                memory: Some(spec.memory_bytes),
                network_mode: spec.network.clone(),
                auto_remove: Some(spec.auto_remove),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                config,
            )
            .await
            .map_err(|source| engine_error("create_container", &spec.name, source))?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        let response = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|source| engine_error("inspect_container", name, source))?;
        let running = response
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        Ok(if running {
            ContainerStatus::Running
        } else {
            ContainerStatus::Stopped
        })
    }

    async fn start(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|source| engine_error("start_container", name, source))
    }

    async fn stop(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build()),
            )
            .await
            .map_err(|source| engine_error("stop_container", name, source))
    }

    async fn restart(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .restart_container(name, None::<RestartContainerOptions>)
            .await
            .map_err(|source| engine_error("restart_container", name, source))
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<ExecOutput, EngineError> {
        debug!(container = name, command = ?command, "exec");
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|source| engine_error("create_exec", name, source))?;

        let mut buffer = Vec::new();
        match self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|source| engine_error("start_exec", name, source))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|source| engine_error("exec_output", name, source))?;
                    buffer.extend_from_slice(&chunk.into_bytes());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|source| engine_error("inspect_exec", name, source))?;

        Ok(ExecOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&buffer).into_owned(),
        })
    }

    async fn stats(&self, name: &str) -> Result<CpuCounters, EngineError> {
        let mut stream = Box::pin(self.docker.stats(
            name,
            Some(StatsOptionsBuilder::new().stream(false).one_shot(true).build()),
        ));
        let sample = stream
            .next()
            .await
            .ok_or_else(|| EngineError::Api {
                op: "stats",
                container: name.to_string(),
                message: "empty stats stream".to_string(),
            })?
            .map_err(|source| engine_error("stats", name, source))?;

        let cpu = sample.cpu_stats.unwrap_or_default();
        Ok(CpuCounters {
            container_usage: cpu
                .cpu_usage
                .and_then(|usage| usage.total_usage)
                .unwrap_or(0),
            system_usage: cpu.system_cpu_usage.unwrap_or(0),
            online_cpus: cpu.online_cpus.unwrap_or(1),
        })
    }
}
