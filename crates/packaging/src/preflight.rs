//! Optional reachability check for VCS dependencies before anything is
//! built.

use lambda_build_models::{BuildError, Stage};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::manifest::DependencyManifest;
use crate::rewrite::FetchConfig;

pub struct GitProbe {
    binary: String,
}

impl Default for GitProbe {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitProbe {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// `git ls-remote` against the public URL. The credential reaches git
    /// only through the child's environment.
    pub fn command(&self, url: &str, fetch: &FetchConfig) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("ls-remote")
            .arg("--exit-code")
            .arg(url)
            .arg("HEAD")
            .envs(fetch.git_env())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        cmd
    }

    #[instrument(skip(self, fetch))]
    pub async fn check(&self, url: &str, fetch: &FetchConfig) -> Result<(), BuildError> {
        let output = self
            .command(url, fetch)
            .output()
            .await
            .map_err(|e| BuildError::StageFailed {
                stage: Stage::CredentialRewrite,
                reason: format!("failed to run {}: {e}", self.binary),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::StageFailed {
                stage: Stage::CredentialRewrite,
                reason: format!(
                    "{url} is not reachable: {}",
                    fetch.redactor().redact_tail(&stderr, 5)
                ),
            });
        }
        Ok(())
    }

    /// Probes each VCS entry under the rewrite prefix. Returns how many were
    /// checked.
    pub async fn check_manifest(
        &self,
        manifest: &DependencyManifest,
        fetch: &FetchConfig,
    ) -> Result<usize, BuildError> {
        let Some(rule) = fetch.rule() else {
            return Ok(0);
        };
        let mut checked = 0;
        for url in manifest.vcs_entries().filter_map(|r| r.fetch_url()) {
            if !rule.matches(&url) {
                continue;
            }
            self.check(&url, fetch).await?;
            checked += 1;
        }
        info!("Preflight reached {} VCS dependencies", checked);
        Ok(checked)
    }
}
