use lambda_build_models::BuildError;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Component, Path};
use tracing::{info, instrument};
use walkdir::WalkDir;
use zip::ZipArchive;

/// A file placed in the build context of a single step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: String,
    pub data: Vec<u8>,
    pub mode: u32,
}

impl ContextFile {
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
            mode: 0o644,
        }
    }
}

/// Function source, read fully into memory so its digest is stable for the
/// build cache.
#[derive(Debug, Clone)]
pub struct SourceBundle {
    pub sha256: String,
    pub files: Vec<ContextFile>,
    pub total_size: u64,
}

impl SourceBundle {
    fn from_files(mut files: Vec<ContextFile>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let mut hasher = Sha256::new();
        let mut total_size = 0u64;
        for file in &files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update((file.data.len() as u64).to_le_bytes());
            hasher.update(&file.data);
            total_size += file.data.len() as u64;
        }
        Self {
            sha256: format!("{:x}", hasher.finalize()),
            files,
            total_size,
        }
    }

    /// Same files under `prefix/` in the build context.
    pub fn context_files(&self, prefix: &str) -> Vec<ContextFile> {
        self.files
            .iter()
            .map(|f| ContextFile {
                path: format!("{prefix}/{}", f.path),
                data: f.data.clone(),
                mode: f.mode,
            })
            .collect()
    }
}

pub struct SourceLoader {
    max_size: u64,
    exclude: Vec<String>,
}

impl SourceLoader {
    pub fn new(max_size: u64, exclude: Vec<String>) -> Self {
        Self { max_size, exclude }
    }

    /// Loads a directory tree, or a `.zip` deployment package.
    pub fn load(&self, path: &Path) -> Result<SourceBundle, BuildError> {
        if path.is_dir() {
            return self.from_dir(path);
        }
        let is_zip = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("zip"))
            .unwrap_or(false);
        if is_zip {
            let data = std::fs::read(path)?;
            return self.from_zip(&data);
        }
        Err(BuildError::InvalidSource {
            reason: format!("{} is neither a directory nor a .zip archive", path.display()),
        })
    }

    fn is_excluded(&self, relative: &Path) -> bool {
        relative.components().any(|c| match c {
            Component::Normal(name) => self.exclude.iter().any(|ex| name == ex.as_str()),
            _ => false,
        })
    }

    fn check_size(&self, size: u64) -> Result<(), BuildError> {
        if size > self.max_size {
            return Err(BuildError::SourceTooLarge {
                size,
                max_size: self.max_size,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn from_dir(&self, dir: &Path) -> Result<SourceBundle, BuildError> {
        let mut files = Vec::new();
        let mut total = 0u64;

        let walker = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.path()
                    .strip_prefix(dir)
                    .map(|rel| !self.is_excluded(rel))
                    .unwrap_or(true)
            });

        for entry in walker {
            let entry = entry.map_err(|e| BuildError::InvalidSource {
                reason: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| BuildError::InternalError {
                    reason: e.to_string(),
                })?;
            let data = std::fs::read(entry.path())?;
            total += data.len() as u64;
            self.check_size(total)?;

            files.push(ContextFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                mode: file_mode(&entry),
                data,
            });
        }

        let bundle = SourceBundle::from_files(files);
        info!(
            "Loaded source directory {} with {} files, total size: {} bytes, SHA256: {}",
            dir.display(),
            bundle.files.len(),
            bundle.total_size,
            bundle.sha256
        );
        Ok(bundle)
    }

    #[instrument(skip(self, zip_data))]
    pub fn from_zip(&self, zip_data: &[u8]) -> Result<SourceBundle, BuildError> {
        self.check_size(zip_data.len() as u64)?;

        let mut archive = ZipArchive::new(std::io::Cursor::new(zip_data)).map_err(|e| {
            BuildError::InvalidSource {
                reason: e.to_string(),
            }
        })?;

        let mut files = Vec::new();
        let mut total = 0u64;

        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(|e| BuildError::InvalidSource {
                reason: e.to_string(),
            })?;
            if file.is_dir() {
                continue;
            }
            let Some(relative) = file.enclosed_name().map(Path::to_path_buf) else {
                return Err(BuildError::InvalidSource {
                    reason: format!("unsafe path in archive: {}", file.name()),
                });
            };
            if self.is_excluded(&relative) {
                continue;
            }

            total += file.size();
            self.check_size(total)?;

            let mut data = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut data)
                .map_err(|e| BuildError::InvalidSource {
                    reason: e.to_string(),
                })?;

            files.push(ContextFile {
                path: relative.to_string_lossy().replace('\\', "/"),
                mode: file.unix_mode().map(|m| m & 0o777).unwrap_or(0o644),
                data,
            });
        }

        let bundle = SourceBundle::from_files(files);
        info!(
            "Processed source archive with {} files, total size: {} bytes, SHA256: {}",
            bundle.files.len(),
            bundle.total_size,
            bundle.sha256
        );
        Ok(bundle)
    }
}

#[cfg(unix)]
fn file_mode(entry: &walkdir::DirEntry) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    entry
        .metadata()
        .map(|m| m.permissions().mode() & 0o777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_entry: &walkdir::DirEntry) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader() -> SourceLoader {
        SourceLoader::new(1024 * 1024, vec![".git".into(), "__pycache__".into(), ".env".into()])
    }

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip_data = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_data));
            for (name, data) in entries {
                zip.start_file(*name, zip::write::FileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        zip_data
    }

    #[test]
    fn test_dir_and_zip_digests_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app/services")).unwrap();
        std::fs::write(dir.path().join("main.py"), b"def lambda_handler(e, c): pass\n").unwrap();
        std::fs::write(dir.path().join("app/services/sync.py"), b"def sync(): pass\n").unwrap();

        let from_dir = loader().from_dir(dir.path()).unwrap();
        let from_zip = loader()
            .from_zip(&zip_of(&[
                ("app/services/sync.py", b"def sync(): pass\n"),
                ("main.py", b"def lambda_handler(e, c): pass\n"),
            ]))
            .unwrap();

        assert_eq!(from_dir.files.len(), 2);
        assert_eq!(from_dir.sha256, from_zip.sha256);
        assert_eq!(from_dir.files[0].path, "app/services/sync.py");
    }

    #[test]
    fn test_excluded_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("app/__pycache__")).unwrap();
        std::fs::write(dir.path().join(".git/config"), b"[core]").unwrap();
        std::fs::write(dir.path().join(".env"), b"GITHUB_TOKEN=abc").unwrap();
        std::fs::write(dir.path().join("app/__pycache__/x.pyc"), b"\0").unwrap();
        std::fs::write(dir.path().join("main.py"), b"x = 1\n").unwrap();

        let bundle = loader().from_dir(dir.path()).unwrap();
        let paths: Vec<&str> = bundle.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["main.py"]);
    }

    #[test]
    fn test_size_limit() {
        let small = SourceLoader::new(4, vec![]);
        let err = small.from_zip(&zip_of(&[("main.py", b"0123456789")])).unwrap_err();
        assert!(matches!(err, BuildError::SourceTooLarge { .. }));
    }

    #[test]
    fn test_zip_path_traversal_rejected() {
        let err = loader().from_zip(&zip_of(&[("../escape.py", b"x")])).unwrap_err();
        assert!(matches!(err, BuildError::InvalidSource { .. }));
    }

    #[test]
    fn test_context_prefix() {
        let bundle = loader().from_zip(&zip_of(&[("main.py", b"x")])).unwrap();
        let files = bundle.context_files("src");
        assert_eq!(files[0].path, "src/main.py");
    }
}
