use async_trait::async_trait;
use lambda_build_models::{BuildSecret, Stage};
use std::collections::HashMap;
use std::path::Path;

use crate::source::ContextFile;

/// A secret exposed to one step as a BuildKit `type=secret` mount.
#[derive(Clone, Copy)]
pub struct SecretMount<'a> {
    pub id: &'a str,
    pub secret: &'a BuildSecret,
}

impl std::fmt::Debug for SecretMount<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMount")
            .field("id", &self.id)
            .field("secret", self.secret)
            .finish()
    }
}

/// Everything needed to commit one layer on top of `parent`.
#[derive(Debug, Clone, Copy)]
pub struct StepRequest<'a> {
    pub stage: Stage,
    /// Local tag of the parent layer; the Dockerfile builds `FROM` it.
    pub parent: &'a str,
    pub dockerfile: &'a str,
    pub context: &'a [ContextFile],
    pub secret: Option<SecretMount<'a>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    pub id: String,
    pub cmd: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Repository tags pointing at the image.
    pub tags: Vec<String>,
}

#[async_trait]
pub trait ImageBackend: Send + Sync + 'static {
    /// Makes the base image available locally and returns its id.
    async fn resolve_base(&self, reference: &str) -> anyhow::Result<String>;
    /// Builds one step and returns the new image id.
    async fn build_step(&self, request: StepRequest<'_>) -> anyhow::Result<String>;
    async fn inspect(&self, image: &str) -> anyhow::Result<Option<ImageMetadata>>;
    async fn tag(&self, image_id: &str, reference: &str) -> anyhow::Result<()>;
    /// Removes `reference` without forcing. A tag is dropped; the image
    /// itself goes only once nothing else references it. Unknown references
    /// are not an error.
    async fn remove(&self, reference: &str) -> anyhow::Result<()>;
    /// Writes the image in `docker save` format to `dest`.
    async fn export(&self, image_id: &str, dest: &Path) -> anyhow::Result<()>;
}
