//! Container driver: build an image from a working tree, run it with
//! engine-assigned host ports, stop it, and exec scripts inside it.
//!
//! The engine is behind the [`ContainerDriver`] trait so the bisection engine
//! never talks to Docker directly; [`DockerDriver`] is the bollard-backed
//! implementation and tests script their own driver.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};

use crate::errors::DriverError;

/// A started container together with the host ports the engine assigned.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    /// Container port → host port.
    pub ports: HashMap<u16, u16>,
}

/// Contract between the bisection engine and the container runtime.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Build `image_ref` from the working tree at `workdir`, using
    /// `dockerfile` as the Dockerfile source. Implementations may skip the
    /// build when `image_ref` already exists, so identical builds share an
    /// image. Returns the image id.
    async fn build(
        &self,
        workdir: &Path,
        dockerfile: &str,
        image_ref: &str,
    ) -> Result<String, DriverError>;

    /// Run a container from `image`, binding each requested container port to
    /// a free host port of the engine's choosing.
    async fn run(&self, image: &str, ports: &[u16]) -> Result<RunningContainer, DriverError>;

    /// Stop and remove a container. Idempotent: an exited or already-removed
    /// container is not an error.
    async fn stop(&self, container_id: &str) -> Result<(), DriverError>;

    /// Run `script` through `/bin/sh -c` inside the container and return its
    /// exit code.
    async fn exec(&self, container_id: &str, script: &str) -> Result<i64, DriverError>;
}

/// Deterministic image reference for one commit and build recipe. The tag is
/// derived from the Dockerfile text and the port set, so rebuilding the same
/// commit with the same recipe reuses the cached image.
pub fn image_ref(commit: &str, dockerfile: &str, ports: &[u16]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dockerfile.as_bytes());
    for port in ports {
        hasher.update(port.to_be_bytes());
    }
    format!("culprit-{}:{:x}", commit, hasher.finalize())
}

/// Tar up `workdir` as a build context, with `dockerfile` injected as
/// `Dockerfile`. The injected entry comes last, so it shadows any checked-in
/// Dockerfile.
fn build_context(workdir: &Path, dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", workdir)
        .with_context(|| format!("Failed to tar build context at {}", workdir.display()))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "Dockerfile", dockerfile.as_bytes())
        .context("Failed to append Dockerfile to build context")?;

    builder.into_inner().context("Failed to finish build context tar")
}

/// Map a bollard error to the driver error taxonomy: responses the daemon
/// produced are commit-specific, anything transport-level means the engine
/// itself is gone.
fn classify(err: BollardError, commit_specific: impl FnOnce(String) -> DriverError) -> DriverError {
    match err {
        BollardError::DockerResponseServerError { message, .. } => commit_specific(message),
        other => DriverError::EngineUnavailable(other.into()),
    }
}

/// Docker implementation of the driver, via the local daemon socket.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect to the Docker daemon and verify it responds.
    pub async fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_socket_defaults()
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?;
        docker
            .ping()
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn build(
        &self,
        workdir: &Path,
        dockerfile: &str,
        image_ref: &str,
    ) -> Result<String, DriverError> {
        // Identical (dockerfile, ports, commit) builds share an image.
        if self.docker.inspect_image(image_ref).await.is_ok() {
            return Ok(image_ref.to_string());
        }

        let context = build_context(workdir, dockerfile)?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image_ref.to_string(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(DriverError::BuildFailed(error));
                    }
                }
                Err(e) => return Err(classify(e, DriverError::BuildFailed)),
            }
        }

        Ok(image_ref.to_string())
    }

    async fn run(&self, image: &str, ports: &[u16]) -> Result<RunningContainer, DriverError> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            // An empty host port makes the engine pick a free one.
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let name = format!("culprit-{}", uuid::Uuid::new_v4().simple());
        let config = Config {
            image: Some(image.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let id = self
            .docker
            .create_container(
                Some(CreateContainerOptions { name, platform: None }),
                config,
            )
            .await
            .map_err(|e| classify(e, DriverError::StartFailed))?
            .id;

        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            // Release the created container before reporting the failure.
            let _ = self
                .docker
                .remove_container(&id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
            return Err(classify(e, DriverError::StartFailed));
        }

        match self.host_ports(&id, ports).await {
            Ok(host_ports) => Ok(RunningContainer { id, ports: host_ports }),
            Err(e) => {
                let _ = self.stop(&id).await;
                Err(e)
            }
        }
    }

    async fn stop(&self, container_id: &str) -> Result<(), DriverError> {
        match self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 1 }))
            .await
        {
            Ok(()) => {}
            // 304: already stopped, 404: already gone.
            Err(BollardError::DockerResponseServerError { .. }) => {}
            Err(e) => return Err(DriverError::EngineUnavailable(e.into())),
        }

        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { .. }) => Ok(()),
            Err(e) => Err(DriverError::EngineUnavailable(e.into())),
        }
    }

    async fn exec(&self, container_id: &str, script: &str) -> Result<i64, DriverError> {
        let exec = self
            .docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(vec![
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        script.to_string(),
                    ]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?
        {
            // Drain until the exec finishes; the output itself is irrelevant.
            while output.next().await.is_some() {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?;

        inspect
            .exit_code
            .ok_or_else(|| DriverError::Other(anyhow::anyhow!("exec finished without an exit code")))
    }
}

impl DockerDriver {
    /// Read back the host ports the engine assigned when the container
    /// started.
    async fn host_ports(
        &self,
        container_id: &str,
        ports: &[u16],
    ) -> Result<HashMap<u16, u16>, DriverError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DriverError::EngineUnavailable(e.into()))?;

        let bindings = inspect
            .network_settings
            .and_then(|n| n.ports)
            .unwrap_or_default();

        let mut mapped = HashMap::new();
        for port in ports {
            let host_port = bindings
                .get(&format!("{}/tcp", port))
                .and_then(|b| b.as_ref())
                .and_then(|b| b.first())
                .and_then(|b| b.host_port.as_ref())
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| {
                    DriverError::StartFailed(format!("no host port bound for container port {}", port))
                })?;
            mapped.insert(*port, host_port);
        }
        Ok(mapped)
    }
}
