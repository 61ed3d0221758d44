use crate::errors::RunnerError;
use crate::manifest::Bx;
use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;

/// A bind mount from a host path to a container path.
pub struct Bind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Abstraction over the container engine, matching §6's small surface:
/// list/pull images, create, start. Kept as a trait so the driver can be
/// exercised against a fake engine in tests.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_image_tags(&self) -> Result<Vec<Vec<String>>, RunnerError>;
    async fn pull_image(&self, reference: &str) -> Result<(), RunnerError>;
    async fn create_container(
        &self,
        image: &str,
        name: &str,
        binds: &[Bind],
    ) -> Result<String, RunnerError>;
    async fn start_container(&self, container_id: &str) -> Result<(), RunnerError>;
    async fn stop_container(&self, container_id: &str) -> Result<(), RunnerError>;
}

pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn connect() -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::Container(format!("failed to connect to Docker: {}", e)))?;
        Ok(DockerEngine { docker })
    }

    /// Exposes the attach socket for the session layer (C5); not part of
    /// [`ContainerEngine`] since it returns a bidirectional stream rather
    /// than a simple RPC result.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_image_tags(&self) -> Result<Vec<Vec<String>>, RunnerError> {
        let images = self
            .docker
            .list_images::<String>(None)
            .await
            .map_err(|e| RunnerError::Image(format!("failed to list images: {}", e)))?;
        Ok(images.into_iter().map(|i| i.repo_tags).collect())
    }

    async fn pull_image(&self, reference: &str) -> Result<(), RunnerError> {
        let options = bollard::image::CreateImageOptions {
            from_image: reference,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RunnerError::Image(format!("failed to pull {}: {}", reference, e)))?;
        }
        Ok(())
    }

    async fn create_container(
        &self,
        image: &str,
        name: &str,
        binds: &[Bind],
    ) -> Result<String, RunnerError> {
        let volumes: HashMap<String, HashMap<(), ()>> = binds
            .iter()
            .map(|b| (b.container_path.clone(), HashMap::new()))
            .collect();

        let bind_strs: Vec<String> = binds
            .iter()
            .map(|b| {
                format!(
                    "{}:{}:{}",
                    b.host_path,
                    b.container_path,
                    if b.read_only { "ro" } else { "rw" }
                )
            })
            .collect();

        let host_config = HostConfig {
            binds: Some(bind_strs),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec!["/bin/bash".to_string()]),
            tty: Some(false),
            open_stdin: Some(true),
            volumes: Some(volumes),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RunnerError::Container(format!("failed to create container: {}", e)))?;
        Ok(container.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<(), RunnerError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| RunnerError::Container(format!("failed to start container: {}", e)))
    }

    async fn stop_container(&self, container_id: &str) -> Result<(), RunnerError> {
        let _ = self.docker.stop_container(container_id, None).await;
        let _ = self.docker.remove_container(container_id, None).await;
        Ok(())
    }
}

/// `EnsureImage`: returns without pulling if a local image already carries
/// `box.name` or `box.name:latest` in its repo tags; otherwise pulls it.
pub async fn ensure_image(bx: &Bx, engine: &dyn ContainerEngine) -> Result<String, RunnerError> {
    let latest_tag = format!("{}:latest", bx.name);
    let tag_sets = engine.list_image_tags().await?;
    for tags in &tag_sets {
        if tags.iter().any(|t| t == &bx.name || t == &latest_tag) {
            return Ok(bx.name.clone());
        }
    }
    engine.pull_image(&bx.name).await?;
    Ok(bx.name.clone())
}

/// `CreateContainer`: starts a stdin-open, non-tty `/bin/bash` container
/// bind-mounting the workspace read-only under `/mnt/<entry>`.
pub async fn create_and_start_container(
    image: &str,
    workspace_entries: &[(String, std::path::PathBuf)],
    engine: &dyn ContainerEngine,
) -> Result<String, RunnerError> {
    let binds: Vec<Bind> = workspace_entries
        .iter()
        .map(|(entry, host_path)| Bind {
            host_path: host_path.to_string_lossy().to_string(),
            container_path: format!("/mnt/{}", entry),
            read_only: true,
        })
        .collect();

    let name = format!("wercker-build-{}", uuid::Uuid::new_v4().simple());
    let container_id = engine.create_container(image, &name, &binds).await?;
    engine.start_container(&container_id).await?;
    Ok(container_id)
}
