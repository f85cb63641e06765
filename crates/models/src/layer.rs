use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::BuildError;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    BaseImage,
    SystemUpdate,
    VcsClient,
    CredentialRewrite,
    DependencyInstall,
    SourceCopy,
    Entrypoint,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::BaseImage => "base-image",
            Stage::SystemUpdate => "system-update",
            Stage::VcsClient => "vcs-client",
            Stage::CredentialRewrite => "credential-rewrite",
            Stage::DependencyInstall => "dependency-install",
            Stage::SourceCopy => "source-copy",
            Stage::Entrypoint => "entrypoint",
        }
    }

    /// The credential rewrite only configures the build session; it never
    /// produces filesystem state.
    pub fn commits_layer(&self) -> bool {
        !matches!(self, Stage::CredentialRewrite)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildLayer {
    pub index: usize,
    pub stage: Stage,
    pub image_id: String,
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Totally ordered sequence of committed layers. Each layer must name the
/// previous layer's image as its parent.
#[derive(Debug, Clone, Default)]
pub struct LayerChain {
    layers: Vec<BuildLayer>,
}

impl LayerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<&BuildLayer> {
        self.layers.last()
    }

    pub fn head_id(&self) -> Option<&str> {
        self.layers.last().map(|l| l.image_id.as_str())
    }

    pub fn layers(&self) -> &[BuildLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn commit(&mut self, stage: Stage, image_id: String) -> Result<&BuildLayer, BuildError> {
        if !stage.commits_layer() {
            return Err(BuildError::InternalError {
                reason: format!("stage {stage} does not commit layers"),
            });
        }
        if let Some(head) = self.head() {
            if stage < head.stage {
                return Err(BuildError::InternalError {
                    reason: format!("stage {stage} cannot follow {}", head.stage),
                });
            }
        } else if stage != Stage::BaseImage {
            return Err(BuildError::InternalError {
                reason: format!("first layer must come from {}, got {stage}", Stage::BaseImage),
            });
        }

        let layer = BuildLayer {
            index: self.layers.len(),
            stage,
            parent: self.head_id().map(str::to_string),
            image_id,
            created_at: Utc::now(),
        };
        self.layers.push(layer);
        Ok(&self.layers[self.layers.len() - 1])
    }

    /// Layers in reverse commit order, for discarding a failed build.
    pub fn drain_newest_first(&mut self) -> Vec<BuildLayer> {
        self.layers.drain(..).rev().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_parents() {
        let mut chain = LayerChain::new();
        chain.commit(Stage::BaseImage, "sha256:base".into()).unwrap();
        chain.commit(Stage::SystemUpdate, "sha256:sys".into()).unwrap();
        let layer = chain.commit(Stage::VcsClient, "sha256:git".into()).unwrap();

        assert_eq!(layer.index, 2);
        assert_eq!(layer.parent.as_deref(), Some("sha256:sys"));
        assert_eq!(chain.head_id(), Some("sha256:git"));
    }

    #[test]
    fn test_chain_rejects_out_of_order_stage() {
        let mut chain = LayerChain::new();
        chain.commit(Stage::BaseImage, "a".into()).unwrap();
        chain.commit(Stage::DependencyInstall, "b".into()).unwrap();
        assert!(chain.commit(Stage::SystemUpdate, "c".into()).is_err());
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_chain_must_start_at_base() {
        let mut chain = LayerChain::new();
        assert!(chain.commit(Stage::SystemUpdate, "a".into()).is_err());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_credential_rewrite_commits_nothing() {
        let mut chain = LayerChain::new();
        chain.commit(Stage::BaseImage, "a".into()).unwrap();
        assert!(chain.commit(Stage::CredentialRewrite, "b".into()).is_err());
    }

    #[test]
    fn test_drain_newest_first() {
        let mut chain = LayerChain::new();
        chain.commit(Stage::BaseImage, "a".into()).unwrap();
        chain.commit(Stage::SystemUpdate, "b".into()).unwrap();
        let drained: Vec<String> = chain.drain_newest_first().into_iter().map(|l| l.image_id).collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::DependencyInstall.to_string(), "dependency-install");
        let json = serde_json::to_string(&Stage::CredentialRewrite).unwrap();
        assert_eq!(json, "\"credential-rewrite\"");
    }
}
