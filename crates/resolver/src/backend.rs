use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_file: bool,
    pub is_directory: bool,
}

impl DirEntry {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_file: true,
            is_directory: false,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_file: false,
            is_directory: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    /// Environment variables the file source attaches to its functions.
    pub variables: BTreeMap<String, String>,
}

/// A source of function files. Paths are `/`-separated and relative to the
/// backend root; the empty path is the root itself.
#[async_trait]
pub trait FileBackend: Send + Sync {
    /// Whether `path` is a regular file. `None` means the backend has no
    /// cheap answer and the resolver should try reading instead.
    async fn file_exists(&self, _path: &str) -> Result<Option<bool>, ResolveError> {
        Ok(None)
    }

    async fn read_text_file(&self, path: &str) -> Result<FileContent, ResolveError>;

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ResolveError>;
}

pub(crate) fn join_path(base: &str, rest: &str) -> String {
    let base = base.trim_matches('/');
    let rest = rest.trim_matches('/');
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rest),
    }
}
