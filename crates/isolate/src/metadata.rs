use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::module::Manifest;

/// Environment variable carrying [`StartupMetadata`] as JSON into a child.
pub const METADATA_ENV: &str = "ISOLATE_METADATA";
/// Environment variable carrying the port a child must listen on.
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StartupError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid startup metadata: {0}")]
    Metadata(String),
    #[error("invalid port {0:?}")]
    Port(String),
    #[error("failed to bind isolate host: {0}")]
    Bind(String),
}

/// Everything an isolate needs to boot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupMetadata {
    /// Source path of the function to import, relative to the source root.
    pub import: String,
    /// Canonical route pattern this isolate serves.
    pub pattern: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub manifest: Option<Manifest>,
}

impl StartupMetadata {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Reads the metadata and port a parent passed through the environment.
    pub fn from_env() -> Result<(Self, u16), StartupError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, u16), StartupError> {
        let raw = lookup(METADATA_ENV).ok_or(StartupError::Missing(METADATA_ENV))?;
        let metadata = serde_json::from_str(&raw)
            .map_err(|err| StartupError::Metadata(err.to_string()))?;
        let port = lookup(PORT_ENV).ok_or(StartupError::Missing(PORT_ENV))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| StartupError::Port(port.clone()))?;
        Ok((metadata, port))
    }

    /// The manifest to load: the explicit one, or just the import target.
    pub fn manifest(&self) -> Manifest {
        self.manifest.clone().unwrap_or_else(|| Manifest {
            target: self.import.clone(),
            ..Manifest::default()
        })
    }
}
