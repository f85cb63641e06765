use anyhow::Result;
use lambda_build_models::{BuildSecret, Config};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Token used wherever a test needs a credential.
pub const TEST_SECRET: &str = "abc123";

pub fn test_secret() -> BuildSecret {
    BuildSecret::new(TEST_SECRET, "test").expect("non-empty test secret")
}

pub const HANDLER_SOURCE: &str = "def lambda_handler(event, context):\n    return {\"statusCode\": 200}\n";

/// A function project in a scratch directory.
#[derive(Debug)]
pub struct TestProject {
    pub dir: TempDir,
}

impl TestProject {
    pub fn new(requirements: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("function"))?;
        std::fs::write(dir.path().join("function/main.py"), HANDLER_SOURCE)?;
        std::fs::write(dir.path().join("requirements.txt"), requirements)?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Defaults with the manifest, source and cache pointed into the project.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.dependencies.manifest = self.path("requirements.txt");
        config.source.path = self.path("function");
        config.cache.dir = self.path(".lambda-build/cache");
        config
    }

    /// Writes `config` as `lambda-build.toml` and returns its path.
    pub fn write_config(&self, config: &Config) -> Result<PathBuf> {
        let path = self.path("lambda-build.toml");
        std::fs::write(&path, toml::to_string(config)?)?;
        Ok(path)
    }

    /// Writes a stand-in `git` that logs `<GIT_CONFIG_KEY_0> <args>` to
    /// `git-calls.log` and exits with `exit_code`. On failure it echoes the
    /// rewrite key to stderr, as git does with credential URLs.
    #[cfg(unix)]
    pub fn stub_git(&self, exit_code: i32) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.path("bin/git");
        let log = self.path("git-calls.log");
        self.write(
            "bin/git",
            &format!(
                "#!/bin/sh\n\
                 echo \"$GIT_CONFIG_KEY_0 $*\" >> '{}'\n\
                 [ {exit_code} -eq 0 ] || echo \"fatal: unable to access '$3' via $GIT_CONFIG_KEY_0\" >&2\n\
                 exit {exit_code}\n",
                log.display()
            ),
        )?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    /// Lines the stub from [`TestProject::stub_git`] logged.
    pub fn git_calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.path("git-calls.log"))
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Zips the function directory into `function.zip`.
    pub fn zip_source(&self) -> Result<PathBuf> {
        let path = self.path("function.zip");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&path)?);
        zip.start_file("main.py", zip::write::FileOptions::default())?;
        zip.write_all(HANDLER_SOURCE.as_bytes())?;
        zip.finish()?;
        Ok(path)
    }
}
