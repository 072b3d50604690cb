use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::backend::{DirEntry, FileBackend, FileContent};
use crate::error::{ResolveError, is_missing};

/// Functions on local disk under `root`.
pub struct LocalBackend {
    root: PathBuf,
    variables: BTreeMap<String, String>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, ResolveError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileBackend for LocalBackend {
    async fn file_exists(&self, path: &str) -> Result<Option<bool>, ResolveError> {
        let full = self.full_path(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(metadata) => Ok(Some(metadata.is_file())),
            Err(err) if is_missing(&err) => Ok(Some(false)),
            Err(err) => Err(ResolveError::from_io(path, err)),
        }
    }

    async fn read_text_file(&self, path: &str) -> Result<FileContent, ResolveError> {
        let full = self.full_path(path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|err| ResolveError::from_io(path, err))?;
        Ok(FileContent {
            content,
            variables: self.variables.clone(),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ResolveError> {
        let full = self.full_path(path)?;
        let mut reader = tokio::fs::read_dir(&full)
            .await
            .map_err(|err| ResolveError::from_io(path, err))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| ResolveError::from_io(path, err))?
        {
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    tracing::warn!("Skipping {}: {}", entry.path().display(), err);
                    continue;
                }
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_file: file_type.is_file(),
                is_directory: file_type.is_dir(),
            });
        }
        Ok(entries)
    }
}
