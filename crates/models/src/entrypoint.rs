use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Image label carrying the handler identifier next to `Cmd`.
pub const ENTRYPOINT_LABEL: &str = "lambda-build.entrypoint";

/// Fully-qualified handler identifier (`<module-path>.<callable>`) recorded as
/// image metadata. Stored verbatim; whether it resolves is up to the
/// invocation runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntrypointDescriptor(String);

impl EntrypointDescriptor {
    pub fn new(handler: impl Into<String>) -> Self {
        Self(handler.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn module_path(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(module, _)| module)
    }

    pub fn callable(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(_, callable)| callable)
    }

    /// `Cmd` value as the platform expects it.
    pub fn cmd(&self) -> Vec<String> {
        vec![self.0.clone()]
    }

    /// Matches recorded image metadata against this descriptor.
    pub fn matches_cmd(&self, cmd: &[String]) -> bool {
        cmd.len() == 1 && cmd[0] == self.0
    }
}

impl FromStr for EntrypointDescriptor {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Display for EntrypointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
