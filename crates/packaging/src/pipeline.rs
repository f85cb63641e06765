//! One build session: runs a [`Recipe`] stage by stage on an
//! [`ImageBackend`], holding the session-scoped [`FetchConfig`].

use lambda_build_models::{
    BuildError, BuildLayer, BuildSecret, EntrypointDescriptor, LayerChain, OutputConfig, Stage,
    VcsConfig, ENTRYPOINT_LABEL,
};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::audit::{AuditReport, LeakAuditor};
use crate::backend::{ImageBackend, StepRequest};
use crate::preflight::GitProbe;
use crate::recipe::Recipe;
use crate::rewrite::{install_rewrite, FetchConfig};

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub image_id: String,
    pub tag: String,
    pub layers: Vec<BuildLayer>,
    pub entrypoint: EntrypointDescriptor,
    pub audit: Option<AuditReport>,
    pub cached: bool,
}

/// Repository the session tags its layers under so each step can build
/// `FROM` a name BuildKit resolves locally.
pub const SESSION_REPO_PREFIX: &str = "lambda-build-session/";

pub struct BuildSession<'b> {
    backend: &'b dyn ImageBackend,
    fetch: FetchConfig,
    probe: Option<GitProbe>,
    chain: LayerChain,
    /// Session tag of each committed layer, by layer index.
    refs: Vec<String>,
    repo: String,
}

impl<'b> BuildSession<'b> {
    /// Installs the rewrite rule for this session. With `vcs.auth` on, a
    /// missing secret fails here, before any layer exists.
    pub fn open(
        backend: &'b dyn ImageBackend,
        secret: Option<BuildSecret>,
        vcs: &VcsConfig,
    ) -> Result<Self, BuildError> {
        let fetch = if vcs.auth {
            let secret = secret.ok_or_else(|| BuildError::MissingSecret {
                source_name: format!("env:{}", vcs.secret_env),
            })?;
            info!(
                "Credential rewrite for {} using secret from {}",
                vcs.public_prefix,
                secret.source_name()
            );
            FetchConfig::with_rule(install_rewrite(secret, &vcs.public_prefix)?)
        } else {
            if secret.is_some() {
                warn!("vcs.auth is off; ignoring the supplied build secret");
            }
            FetchConfig::anonymous()
        };

        Ok(Self {
            backend,
            fetch,
            probe: vcs.preflight.then(|| GitProbe::new(&vcs.git_binary)),
            chain: LayerChain::new(),
            refs: Vec::new(),
            repo: String::new(),
        })
    }

    pub fn fetch_config(&self) -> &FetchConfig {
        &self.fetch
    }

    /// Runs every stage. On failure the committed layers are removed,
    /// except those another tag still points at, and nothing is tagged.
    #[instrument(skip(self, recipe), fields(base = %recipe.base_image(), tag = %output.tag))]
    pub async fn run(mut self, recipe: &Recipe, output: &OutputConfig) -> Result<BuildOutcome, BuildError> {
        self.repo = format!(
            "{SESSION_REPO_PREFIX}{}-{}",
            &recipe.digest()[..12],
            std::process::id()
        );
        match self.execute(recipe, output).await {
            Ok(outcome) => {
                self.release_refs().await;
                Ok(outcome)
            }
            Err(e) => {
                warn!("Build failed: {}", e);
                self.discard().await;
                Err(e)
            }
        }
    }

    /// Ships an image a previous build produced for the same recipe. It
    /// passes the same entrypoint check and leak audit as a fresh build
    /// before it is tagged.
    #[instrument(skip(self, recipe), fields(tag = %output.tag))]
    pub async fn reuse(self, image_id: &str, recipe: &Recipe, output: &OutputConfig) -> Result<BuildOutcome, BuildError> {
        self.verify_entrypoint(image_id, recipe.entrypoint()).await?;
        let audit = self.audit_if_required(image_id, output).await?;
        self.tag_output(image_id, output).await?;
        info!("Reused cached image {} as {}", image_id, output.tag);

        Ok(BuildOutcome {
            image_id: image_id.to_string(),
            tag: output.tag.clone(),
            layers: Vec::new(),
            entrypoint: recipe.entrypoint().clone(),
            audit,
            cached: true,
        })
    }

    fn stage_error(&self, stage: Stage, err: anyhow::Error) -> BuildError {
        BuildError::StageFailed {
            stage,
            reason: self.fetch.redactor().redact(&format!("{err:#}")).into_owned(),
        }
    }

    async fn execute(&mut self, recipe: &Recipe, output: &OutputConfig) -> Result<BuildOutcome, BuildError> {
        if !recipe.base_is_pinned() {
            warn!(
                "Base image {} is not pinned by digest; rebuilds may differ",
                recipe.base_image()
            );
        }

        recipe.manifest().check_consistency()?;

        if let Some(probe) = &self.probe {
            probe.check_manifest(recipe.manifest(), &self.fetch).await?;
        }

        let stages = recipe.stages();
        let total = stages.len();
        let mut position = 1;

        info!("Stage {} ({}/{})", Stage::BaseImage, position, total);
        let base_id = self
            .backend
            .resolve_base(recipe.base_image())
            .await
            .map_err(|e| self.stage_error(Stage::BaseImage, e))?;
        let mut parent = self.commit(Stage::BaseImage, base_id).await?;

        for step in recipe.steps() {
            if step.stage == Stage::DependencyInstall {
                if let Some(rewrite) = recipe.rewrite() {
                    position += 1;
                    info!(
                        "Stage {} ({}/{}): {} via secret mount '{}'",
                        Stage::CredentialRewrite,
                        position,
                        total,
                        rewrite.prefix,
                        rewrite.secret_id
                    );
                }
            }
            position += 1;
            info!("Stage {} ({}/{})", step.stage, position, total);

            let secret = match step.secret_id() {
                Some(id) => Some(self.fetch.secret_mount(id).ok_or_else(|| {
                    BuildError::MissingSecret {
                        source_name: format!("secret mount {id}"),
                    }
                })?),
                None => None,
            };

            let dockerfile = step.dockerfile(&parent);
            let request = StepRequest {
                stage: step.stage,
                parent: &parent,
                dockerfile: &dockerfile,
                context: &step.context,
                secret,
            };
            let image_id = self
                .backend
                .build_step(request)
                .await
                .map_err(|e| self.stage_error(step.stage, e))?;
            parent = self.commit(step.stage, image_id).await?;
        }

        let image_id = self.head_id()?;
        self.verify_entrypoint(&image_id, recipe.entrypoint()).await?;
        let audit = self.audit_if_required(&image_id, output).await?;
        self.tag_output(&image_id, output).await?;
        info!("Built {} as {}", image_id, output.tag);

        Ok(BuildOutcome {
            image_id,
            tag: output.tag.clone(),
            layers: self.chain.layers().to_vec(),
            entrypoint: recipe.entrypoint().clone(),
            audit,
            cached: false,
        })
    }

    /// Records the layer and tags it under the session repository. Returns
    /// the tag the next step builds from.
    async fn commit(&mut self, stage: Stage, image_id: String) -> Result<String, BuildError> {
        let index = self.chain.commit(stage, image_id.clone())?.index;
        let reference = format!("{}:{index}", self.repo);
        self.backend
            .tag(&image_id, &reference)
            .await
            .map_err(|e| self.stage_error(stage, e))?;
        self.refs.push(reference.clone());
        Ok(reference)
    }

    async fn tag_output(&self, image_id: &str, output: &OutputConfig) -> Result<(), BuildError> {
        self.backend
            .tag(image_id, &output.tag)
            .await
            .map_err(|e| BuildError::DockerError {
                message: self.fetch.redactor().redact(&format!("tag failed: {e:#}")).into_owned(),
            })
    }

    fn head_id(&self) -> Result<String, BuildError> {
        self.chain
            .head_id()
            .map(str::to_string)
            .ok_or_else(|| BuildError::InternalError {
                reason: "no layer committed".to_string(),
            })
    }

    async fn verify_entrypoint(&self, image_id: &str, expected: &EntrypointDescriptor) -> Result<(), BuildError> {
        let meta = self
            .backend
            .inspect(image_id)
            .await
            .map_err(|e| self.stage_error(Stage::Entrypoint, e))?
            .ok_or_else(|| BuildError::InternalError {
                reason: format!("image {image_id} vanished after build"),
            })?;

        if !expected.matches_cmd(&meta.cmd) {
            return Err(BuildError::EntrypointMismatch {
                expected: expected.to_string(),
                found: format!("{:?}", meta.cmd),
            });
        }
        match meta.labels.get(ENTRYPOINT_LABEL) {
            Some(label) if label == expected.as_str() => Ok(()),
            other => Err(BuildError::EntrypointMismatch {
                expected: expected.to_string(),
                found: format!("label {ENTRYPOINT_LABEL}={}", other.map(String::as_str).unwrap_or("<unset>")),
            }),
        }
    }

    async fn audit_if_required(&self, image_id: &str, output: &OutputConfig) -> Result<Option<AuditReport>, BuildError> {
        match self.fetch.secret() {
            Some(secret) if output.audit => self.audit(image_id, secret).await.map(Some),
            _ => Ok(None),
        }
    }

    async fn audit(&self, image_id: &str, secret: &BuildSecret) -> Result<AuditReport, BuildError> {
        let temp_dir = tempfile::tempdir()?;
        let archive = temp_dir.path().join("image.tar");
        self.backend
            .export(image_id, &archive)
            .await
            .map_err(|e| BuildError::DockerError {
                message: self.fetch.redactor().redact(&format!("export failed: {e:#}")).into_owned(),
            })?;

        LeakAuditor::new(secret.expose())
            .scan_archive(&archive)?
            .into_result()
    }

    /// Drops the session tags once the output tag holds the image.
    async fn release_refs(&mut self) {
        for reference in std::mem::take(&mut self.refs).iter().rev() {
            self.drop_reference(reference).await;
        }
    }

    /// Removes the images this session committed, newest first. The base
    /// image and any image that carries a tag this session did not create
    /// only lose their session tag.
    async fn discard(&mut self) {
        let refs = std::mem::take(&mut self.refs);
        for layer in self.chain.drain_newest_first() {
            let reference = refs.get(layer.index);
            let keep = if layer.stage == Stage::BaseImage {
                true
            } else {
                match self.backend.inspect(&layer.image_id).await {
                    Ok(Some(meta)) => {
                        let foreign: Vec<String> = meta.tags.into_iter().filter(|t| !refs.contains(t)).collect();
                        if !foreign.is_empty() {
                            info!("Keeping {}: also tagged {}", layer.image_id, foreign.join(", "));
                        }
                        !foreign.is_empty()
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Cannot inspect {}; keeping it: {}", layer.image_id, e);
                        true
                    }
                }
            };

            match (keep, reference) {
                (false, reference) => self.drop_reference(reference.unwrap_or(&layer.image_id)).await,
                (true, Some(reference)) => self.drop_reference(reference).await,
                (true, None) => {}
            }
        }
    }

    /// Non-forced removal: an image still referenced elsewhere only loses
    /// `reference`.
    async fn drop_reference(&self, reference: &str) {
        if let Err(e) = self.backend.remove(reference).await {
            warn!("Failed to remove {}: {}", reference, e);
        }
    }
}
