use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::backend::{DirEntry, FileBackend, FileContent, join_path};
use crate::error::ResolveError;

/// In-memory file tree keyed by relative path.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    files: BTreeMap<String, String>,
    variables: BTreeMap<String, String>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn insert(&mut self, path: &str, content: impl Into<String>) {
        self.files.insert(join_path("", path), content.into());
    }
}

#[async_trait]
impl FileBackend for MemoryBackend {
    async fn file_exists(&self, path: &str) -> Result<Option<bool>, ResolveError> {
        Ok(Some(self.files.contains_key(&join_path("", path))))
    }

    async fn read_text_file(&self, path: &str) -> Result<FileContent, ResolveError> {
        self.files
            .get(&join_path("", path))
            .map(|content| FileContent {
                content: content.clone(),
                variables: self.variables.clone(),
            })
            .ok_or_else(|| ResolveError::NotFound(path.to_string()))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ResolveError> {
        let dir = join_path("", path);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };

        let mut entries: BTreeMap<String, DirEntry> = BTreeMap::new();
        for key in self.files.keys() {
            let Some(rest) = key.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    entries
                        .entry(child.to_string())
                        .or_insert_with(|| DirEntry::directory(child));
                }
                None => {
                    entries.insert(rest.to_string(), DirEntry::file(rest));
                }
            }
        }

        if entries.is_empty() && !dir.is_empty() {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        Ok(entries.into_values().collect())
    }
}
