use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::path::Path;

use crate::BuildError;

/// Bearer token supplied once per build invocation.
///
/// The value is only reachable through [`BuildSecret::expose`]; the type is
/// neither `Clone` nor `Serialize`, and its `Debug` output is redacted, so the
/// token cannot be copied into configuration, logs or persisted state by
/// accident. The backing buffer is zeroized on drop.
pub struct BuildSecret {
    value: SecretString,
    source_name: String,
}

impl BuildSecret {
    pub fn new(value: impl Into<String>, source_name: impl Into<String>) -> Result<Self, BuildError> {
        let source_name = source_name.into();
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(BuildError::MissingSecret { source_name });
        }
        Ok(Self {
            value: SecretString::from(trimmed.to_string()),
            source_name,
        })
    }

    /// Reads the secret from an environment variable. An unset or empty
    /// variable is reported as a missing secret.
    pub fn from_env(var: &str) -> Result<Self, BuildError> {
        match std::env::var(var) {
            Ok(value) => Self::new(value, format!("env:{var}")),
            Err(_) => Err(BuildError::MissingSecret {
                source_name: format!("env:{var}"),
            }),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, BuildError> {
        let source_name = format!("file:{}", path.display());
        let value = std::fs::read_to_string(path).map_err(|_| BuildError::MissingSecret {
            source_name: source_name.clone(),
        })?;
        Self::new(value, source_name)
    }

    /// Where the secret came from (env var or file name), never the value.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }
}

impl fmt::Debug for BuildSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildSecret")
            .field("source", &self.source_name)
            .field("value", &"[REDACTED]")
            .finish()
    }
}
