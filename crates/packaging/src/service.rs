use lambda_build_models::{BuildError, BuildSecret, Config, EntrypointDescriptor, Stage, ENTRYPOINT_LABEL};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::backend::ImageBackend;
use crate::cache::BuildCache;
use crate::manifest::DependencyManifest;
use crate::pipeline::{BuildOutcome, BuildSession};
use crate::recipe::Recipe;
use crate::source::{SourceBundle, SourceLoader};

/// Result of `check`: what a build would do, without building.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub stages: Vec<Stage>,
    pub packages: usize,
    pub vcs_packages: usize,
    pub references_prefix: bool,
    pub base_pinned: bool,
    pub digest: String,
}

/// Reads the manifest and source a config points at and turns them into a
/// [`Recipe`]. Needs no image backend.
pub struct ProjectLoader<'c> {
    config: &'c Config,
    root: PathBuf,
}

impl<'c> ProjectLoader<'c> {
    pub fn new(config: &'c Config) -> Self {
        Self {
            config,
            root: PathBuf::from("."),
        }
    }

    /// Directory relative manifest, source and cache paths resolve against.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn load_source(&self) -> Result<Option<SourceBundle>, BuildError> {
        let path = self.resolve(&self.config.source.path);
        if !path.exists() {
            warn!("Source path {} does not exist; no source will be copied", path.display());
            return Ok(None);
        }
        let loader = SourceLoader::new(self.config.max_source_bytes(), self.config.source.exclude.clone());
        loader.load(&path).map(Some)
    }

    pub fn load_recipe(&self) -> Result<Recipe, BuildError> {
        let manifest = DependencyManifest::load(&self.resolve(&self.config.dependencies.manifest))?;
        let source = self.load_source()?;
        Recipe::from_config(self.config, manifest, source.as_ref())
    }

    pub fn render(&self) -> Result<String, BuildError> {
        Ok(self.load_recipe()?.render_dockerfile())
    }

    pub fn check(&self) -> Result<CheckReport, BuildError> {
        let recipe = self.load_recipe()?;
        recipe.manifest().check_consistency()?;

        let manifest = recipe.manifest();
        Ok(CheckReport {
            stages: recipe.stages(),
            packages: manifest.len(),
            vcs_packages: manifest.vcs_entries().count(),
            references_prefix: recipe
                .rewrite()
                .map(|r| manifest.references(&r.prefix))
                .unwrap_or(false),
            base_pinned: recipe.base_is_pinned(),
            digest: recipe.digest(),
        })
    }
}

pub struct BuildService<B: ImageBackend> {
    config: Config,
    backend: B,
    root: PathBuf,
}

impl<B: ImageBackend> BuildService<B> {
    pub fn new(config: Config, backend: B) -> Self {
        Self {
            config,
            backend,
            root: PathBuf::from("."),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn loader(&self) -> ProjectLoader<'_> {
        ProjectLoader::new(&self.config).with_root(self.root.clone())
    }

    #[instrument(skip(self, secret))]
    pub async fn build(&self, secret: Option<BuildSecret>) -> Result<BuildOutcome, BuildError> {
        let loader = self.loader();
        let recipe = loader.load_recipe()?;
        let session = BuildSession::open(&self.backend, secret, &self.config.vcs)?;

        let mut cache = if self.config.cache.enabled {
            let mut cache = BuildCache::new(loader.resolve(&self.config.cache.dir))?;
            if cache.cleanup_old_entries(i64::from(self.config.cache.max_age_days)) > 0 {
                cache.save_cache()?;
            }
            Some(cache)
        } else {
            None
        };
        let digest = recipe.digest();

        if let Some(cache) = cache.as_mut() {
            if let Some(image_id) = self.cached_image(cache, &digest).await? {
                return match session.reuse(&image_id, &recipe, &self.config.output).await {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => {
                        warn!("Cached image {} rejected: {}", image_id, e);
                        cache.invalidate(&digest);
                        cache.save_cache()?;
                        Err(e)
                    }
                };
            }
        }

        let outcome = session.run(&recipe, &self.config.output).await?;

        if let Some(cache) = cache.as_mut() {
            cache.insert(&digest, outcome.image_id.clone());
            cache.save_cache()?;
        }
        Ok(outcome)
    }

    /// Image cached for `digest`, if it still exists.
    async fn cached_image(&self, cache: &mut BuildCache, digest: &str) -> Result<Option<String>, BuildError> {
        let Some(hit) = cache.get(digest).cloned() else {
            return Ok(None);
        };

        let present = self
            .backend
            .inspect(&hit.image_id)
            .await
            .map_err(|e| BuildError::DockerError { message: e.to_string() })?
            .is_some();
        if !present {
            info!("Cached image {} is gone; rebuilding", hit.image_id);
            cache.invalidate(digest);
            return Ok(None);
        }
        Ok(Some(hit.image_id))
    }

    /// Entrypoint recorded on `image`, if any.
    pub async fn inspect(&self, image: &str) -> Result<Option<EntrypointDescriptor>, BuildError> {
        let meta = self
            .backend
            .inspect(image)
            .await
            .map_err(|e| BuildError::DockerError { message: e.to_string() })?
            .ok_or_else(|| BuildError::DockerError {
                message: format!("image not found: {image}"),
            })?;
        Ok(meta.labels.get(ENTRYPOINT_LABEL).map(EntrypointDescriptor::new))
    }
}
