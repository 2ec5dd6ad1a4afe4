//! Docker backend for [`ContainerEngine`].

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use super::{ContainerEngine, ContainerSpec, ContainerStatus, EngineError, OutputStream};

/// Container engine backed by the local Docker daemon.
///
/// API calls go through `bollard`; image builds shell out to `docker build`
/// so the daemon's regular build output and caching apply.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the local defaults (`DOCKER_HOST` or the platform socket).
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_error(e: bollard::errors::Error) -> EngineError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::Conflict(message),
        other => EngineError::Api(other.to_string()),
    }
}

fn map_status(status: Option<ContainerStateStatusEnum>) -> ContainerStatus {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
        Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
        Some(ContainerStateStatusEnum::PAUSED) => ContainerStatus::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => ContainerStatus::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => ContainerStatus::Removing,
        Some(ContainerStateStatusEnum::EXITED) => ContainerStatus::Exited,
        Some(ContainerStateStatusEnum::DEAD) => ContainerStatus::Dead,
        _ => ContainerStatus::Dead,
    }
}

/// Wait condition for a container that has not exited yet.
///
/// Auto-removed containers are waited on until removal, which fires even if
/// the exit happened before the wait was registered.
fn wait_condition(auto_remove: bool, status: ContainerStatus) -> &'static str {
    if auto_remove {
        "removed"
    } else if status == ContainerStatus::Created {
        "next-exit"
    } else {
        "not-running"
    }
}

/// `docker run` arguments for an interactive container.
fn docker_run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "-it".to_string()];
    if spec.auto_remove {
        args.push("--rm".to_string());
    }
    if !spec.name.is_empty() {
        args.extend(["--name".to_string(), spec.name.clone()]);
    }
    if let Some(network) = &spec.network {
        args.extend(["--network".to_string(), network.clone()]);
    }
    for mount in &spec.mounts {
        args.extend(["-v".to_string(), mount.to_bind_string()]);
    }
    for env in spec.env_list() {
        args.extend(["-e".to_string(), env]);
    }
    if let Some(user) = &spec.user {
        args.extend(["-u".to_string(), user.clone()]);
    }
    if let Some(workdir) = &spec.working_dir {
        args.extend(["-w".to_string(), workdir.clone()]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn removed_before_wait(name: &str, e: bollard::errors::Error) -> EngineError {
    match map_error(e) {
        EngineError::NotFound(_) => EngineError::NotFound(format!(
            "container {} was removed before its exit code could be read",
            name
        )),
        other => other,
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, tag: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) => match map_error(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn build_image(
        &self,
        dockerfile: &Path,
        context: &Path,
        tag: &str,
    ) -> Result<(), EngineError> {
        tracing::info!(image = %tag, dockerfile = %dockerfile.display(), "Building image");

        let output = tokio::process::Command::new("docker")
            .arg("build")
            .arg("-f")
            .arg(dockerfile)
            .arg("-t")
            .arg(tag)
            .arg(context)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Build {
                image: tag.to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(EngineError::Build {
                image: tag.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<(), EngineError> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) => match map_error(e) {
                EngineError::NotFound(_) => {}
                other => return Err(other),
            },
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                tracing::info!(network = %name, "Created network");
                Ok(())
            }
            // Another session created it concurrently
            Err(e) => match map_error(e) {
                EngineError::Conflict(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn remove_network(&self, name: &str) -> Result<(), EngineError> {
        self.docker.remove_network(name).await.map_err(map_error)
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), EngineError> {
        if self.docker.inspect_volume(name).await.is_ok() {
            return Ok(());
        }
        let options = CreateVolumeOptions {
            name: name.to_string(),
            ..Default::default()
        };
        self.docker.create_volume(options).await.map_err(map_error)?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let binds: Vec<String> = spec.mounts.iter().map(|m| m.to_bind_string()).collect();
        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            network_mode: spec.network.clone(),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        let env = spec.env_list();
        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: spec.working_dir.clone(),
            user: spec.user.clone(),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_error)?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker.start_container::<String>(name, None).await.map_err(map_error)
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus, EngineError> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(map_status(info.state.and_then(|s| s.status))),
            Err(e) => match map_error(e) {
                EngineError::NotFound(_) => Ok(ContainerStatus::NotFound),
                other => Err(other),
            },
        }
    }

    fn output_stream(&self, name: &str) -> OutputStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(name, Some(options))
            .map(|chunk| chunk.map(|output| output.into_bytes().to_vec()).map_err(map_error))
            .boxed()
    }

    async fn container_output(&self, name: &str) -> Result<String, EngineError> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            output.extend_from_slice(&chunk.map_err(map_error)?.into_bytes());
        }
        Ok(String::from_utf8_lossy(&output).into_owned())
    }

    async fn wait_container(&self, name: &str) -> Result<i64, EngineError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| removed_before_wait(name, e))?;
        let state = info.state.unwrap_or_default();
        let status = map_status(state.status);
        if status == ContainerStatus::Exited {
            return Ok(state.exit_code.unwrap_or_default());
        }

        let auto_remove = info
            .host_config
            .and_then(|config| config.auto_remove)
            .unwrap_or(false);
        let options = WaitContainerOptions {
            condition: wait_condition(auto_remove, status),
        };
        let mut stream = self.docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits are reported as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(removed_before_wait(name, e)),
            None => Err(EngineError::Api(format!(
                "Wait stream for container {} ended without a status",
                name
            ))),
        }
    }

    async fn run_interactive(&self, spec: &ContainerSpec) -> Result<i64, EngineError> {
        let status = tokio::process::Command::new("docker")
            .args(docker_run_args(spec))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| EngineError::Unavailable(format!("Failed to run docker: {}", e)))?;
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn stop_container(&self, name: &str, timeout_secs: i64) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)
    }

    async fn list_containers_by_image(&self, image: &str) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("ancestor".to_string(), vec![image.to_string()]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(c.id)
            })
            .collect())
    }
}
