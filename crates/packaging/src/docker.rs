use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bollard::image::{CreateImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use lambda_build_models::{BuildError, DockerConfig};
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, instrument};

use crate::backend::{ImageBackend, ImageMetadata, StepRequest};
use crate::redact::Redactor;

/// Environment variable the `docker build` child reads the secret from.
/// Set on that child only.
const SECRET_ENV: &str = "LAMBDA_BUILD_SECRET";

/// Lines of build output kept in error messages.
const ERROR_TAIL_LINES: usize = 30;

/// Steps run through the `docker build` CLI so BuildKit secret mounts are
/// available; everything else goes through the Engine API.
pub struct DockerBackend {
    docker: Docker,
    binary: String,
    host: Option<String>,
    platform: Option<String>,
}

impl DockerBackend {
    pub fn new(config: &DockerConfig) -> Result<Self, BuildError> {
        let host = if config.host.is_empty() {
            std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty())
        } else {
            Some(config.host.clone())
        };

        let docker = match host.as_deref() {
            Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
                Docker::connect_with_http(h, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                    BuildError::DockerError {
                        message: format!("Failed to connect to Docker at {h}: {e}"),
                    }
                })?
            }
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_socket(h, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                    BuildError::DockerError {
                        message: format!("Failed to connect to Docker at {h}: {e}"),
                    }
                })?
            }
            _ => Docker::connect_with_socket_defaults().map_err(|e| BuildError::DockerError {
                message: e.to_string(),
            })?,
        };

        Ok(Self {
            docker,
            binary: config.binary.clone(),
            host,
            platform: config.platform.clone(),
        })
    }

    async fn write_context(dir: &Path, request: &StepRequest<'_>) -> anyhow::Result<()> {
        for file in request.context {
            let path = dir.join(&file.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &file.data).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(file.mode)).await?;
            }
        }
        Ok(())
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

/// Splits `repo[:tag]` at the tag colon, ignoring a registry port.
fn split_reference(reference: &str) -> (&str, &str) {
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => (&reference[..name_start + i], &reference[name_start + i + 1..]),
        None => (reference, "latest"),
    }
}

#[async_trait]
impl ImageBackend for DockerBackend {
    #[instrument(skip(self))]
    async fn resolve_base(&self, reference: &str) -> anyhow::Result<String> {
        if let Some(meta) = self.inspect(reference).await? {
            debug!("Base image {} present locally as {}", reference, meta.id);
            return Ok(meta.id);
        }

        info!("Pulling base image: {}", reference);
        let options = CreateImageOptions {
            from_image: reference,
            platform: self.platform.as_deref().unwrap_or_default(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.with_context(|| format!("pull {reference}"))?;
            if let Some(status) = progress.status {
                debug!("{}", status);
            }
        }

        self.inspect(reference)
            .await?
            .map(|meta| meta.id)
            .ok_or_else(|| anyhow!("base image {reference} missing after pull"))
    }

    #[instrument(skip(self, request), fields(stage = %request.stage, parent = %request.parent))]
    async fn build_step(&self, request: StepRequest<'_>) -> anyhow::Result<String> {
        let temp_dir = tempfile::tempdir()?;
        let context_dir = temp_dir.path().join("context");
        tokio::fs::create_dir_all(&context_dir).await?;
        Self::write_context(&context_dir, &request).await?;

        let dockerfile_path = temp_dir.path().join("Dockerfile");
        tokio::fs::write(&dockerfile_path, request.dockerfile).await?;
        let iid_path = temp_dir.path().join("iid");

        let mut cmd = Command::new(&self.binary);
        cmd.arg("build")
            .arg("--progress=plain")
            .arg("--iidfile")
            .arg(&iid_path)
            .arg("-f")
            .arg(&dockerfile_path)
            .env("DOCKER_BUILDKIT", "1")
            .env_remove(SECRET_ENV)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(host) = &self.host {
            cmd.env("DOCKER_HOST", host);
        }
        if let Some(platform) = &self.platform {
            cmd.arg("--platform").arg(platform);
        }
        let mut redactor = Redactor::new();
        if let Some(mount) = request.secret {
            cmd.arg("--secret")
                .arg(format!("id={},env={SECRET_ENV}", mount.id))
                .env(SECRET_ENV, mount.secret.expose());
            redactor = redactor.with_literal(mount.secret.expose());
        }
        cmd.arg(&context_dir);

        info!("Building stage {} on {}", request.stage, request.parent);
        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.binary))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("docker build stdout: {}", redactor.redact(&stdout));
        debug!("docker build stderr: {}", redactor.redact(&stderr));

        if !output.status.success() {
            let tail = redactor.redact_tail(&stderr, ERROR_TAIL_LINES);
            error!("Docker build failed for stage {}: {}", request.stage, tail);
            return Err(anyhow!("docker build exited with {}: {}", output.status, tail));
        }

        let image_id = tokio::fs::read_to_string(&iid_path)
            .await
            .context("docker build wrote no image id")?
            .trim()
            .to_string();
        info!("Stage {} committed {}", request.stage, image_id);
        Ok(image_id)
    }

    #[instrument(skip(self))]
    async fn inspect(&self, image: &str) -> anyhow::Result<Option<ImageMetadata>> {
        let inspect = match self.docker.inspect_image(image).await {
            Ok(inspect) => inspect,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = inspect.config.unwrap_or_default();
        Ok(Some(ImageMetadata {
            id: inspect.id.unwrap_or_else(|| image.to_string()),
            cmd: config.cmd.unwrap_or_default(),
            labels: config.labels.unwrap_or_default(),
            tags: inspect
                .repo_tags
                .unwrap_or_default()
                .into_iter()
                .filter(|t| t != "<none>:<none>")
                .collect(),
        }))
    }

    #[instrument(skip(self))]
    async fn tag(&self, image_id: &str, reference: &str) -> anyhow::Result<()> {
        let (repo, tag) = split_reference(reference);
        self.docker
            .tag_image(image_id, Some(TagImageOptions { repo, tag }))
            .await?;
        info!("Tagged {} as {}", image_id, reference);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove(&self, reference: &str) -> anyhow::Result<()> {
        let options = RemoveImageOptions {
            force: false,
            noprune: false,
        };
        match self.docker.remove_image(reference, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn export(&self, image_id: &str, dest: &Path) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = self.docker.export_image(image_id);
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
