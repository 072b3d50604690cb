//! Maps request paths onto function files.
//!
//! Function trees use file-system routing: `users/[id].ts` captures one
//! segment as `id`, `docs/[...slug].ts` captures every remaining segment,
//! and a directory answers through its entrypoint file (`index.ts`).
//!
//! At each level the resolver prefers, in order:
//!
//! 1. the exact remaining path as a file, or as a directory with an entrypoint
//! 2. a static file or directory whose name equals the next segment
//! 3. a `[param]` file or directory
//! 4. a `[...param]` catch-all file
//!
//! Non-terminal segments backtrack: when a static directory matches the
//! segment but nothing below it does, the dynamic candidates are tried next.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::backend::{DirEntry, FileBackend, FileContent, join_path};
use crate::error::ResolveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    /// File name, without extension, that answers for a directory.
    pub entrypoint: String,
    /// Extensions, without the dot, that count as function sources.
    pub extensions: Vec<String>,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            entrypoint: "index".to_string(),
            extensions: ["ts", "tsx", "js", "jsx", "mjs"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

/// A resolved function file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMatch {
    pub content: String,
    /// Matched file path without its extension, with a leading slash
    /// (`/users/[id]`).
    pub match_path: String,
    /// Matched file path relative to the backend root (`users/[id].ts`).
    pub path: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Set when the request path differs from the matched file path, so the
    /// match was reached through a dynamic or index rewrite.
    #[serde(default)]
    pub redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Dynamic {
    Param(String),
    CatchAll(String),
}

fn dynamic_name(name: &str) -> Option<Dynamic> {
    let inner = name.strip_prefix('[')?.strip_suffix(']')?;
    match inner.strip_prefix("...") {
        Some(rest) if !rest.is_empty() => Some(Dynamic::CatchAll(rest.to_string())),
        Some(_) => None,
        None if !inner.is_empty() => Some(Dynamic::Param(inner.to_string())),
        None => None,
    }
}

pub struct FileResolver {
    backend: Arc<dyn FileBackend>,
    options: ResolverOptions,
}

impl FileResolver {
    pub fn new(backend: Arc<dyn FileBackend>, options: ResolverOptions) -> Self {
        Self { backend, options }
    }

    pub fn backend(&self) -> &Arc<dyn FileBackend> {
        &self.backend
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolves a request path from the backend root.
    pub async fn resolve_path(&self, path: &str) -> Result<FileMatch, ResolveError> {
        self.resolve(path, "", BTreeMap::new(), path)
            .await?
            .ok_or_else(|| ResolveError::NotFound(normalize(path)))
    }

    /// Resolves `path` below `current_path`, carrying parameters captured by
    /// earlier levels. `full_path` is the original request path and decides
    /// the redirect flag. `Ok(None)` means no file matched.
    pub async fn resolve(
        &self,
        path: &str,
        current_path: &str,
        params: BTreeMap<String, String>,
        full_path: &str,
    ) -> Result<Option<FileMatch>, ResolveError> {
        let segments: Vec<String> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect();
        let full_path = normalize(full_path);
        self.resolve_segments(&segments, join_path("", current_path), params, &full_path)
            .await
    }

    fn resolve_segments<'a>(
        &'a self,
        segments: &'a [String],
        current: String,
        params: BTreeMap<String, String>,
        full_path: &'a str,
    ) -> BoxFuture<'a, Result<Option<FileMatch>, ResolveError>> {
        async move {
            let target = join_path(&current, &segments.join("/"));
            if let Some(found) = self.direct_hit(&target, &params).await? {
                return Ok(Some(found));
            }
            let Some((segment, rest)) = segments.split_first() else {
                return Ok(None);
            };

            let mut entries = match self.backend.read_dir(&current).await {
                Ok(entries) => entries,
                Err(ResolveError::NotFound(_)) => return Ok(None),
                Err(err) => return Err(err),
            };
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            if rest.is_empty() {
                self.resolve_terminal(&entries, segment, &current, params, full_path)
                    .await
            } else {
                self.resolve_nested(&entries, segments, &current, params, full_path)
                    .await
            }
        }
        .boxed()
    }

    async fn resolve_terminal(
        &self,
        entries: &[DirEntry],
        segment: &str,
        current: &str,
        params: BTreeMap<String, String>,
        full_path: &str,
    ) -> Result<Option<FileMatch>, ResolveError> {
        let static_file = entries
            .iter()
            .filter(|entry| entry.is_file)
            .find(|entry| self.source_stem(&entry.name) == Some(segment));
        if let Some(entry) = static_file {
            let path = join_path(current, &entry.name);
            if let Some(content) = self.try_read(&path).await? {
                let mut found = self.build_match(path, content, params);
                found.redirect = found.match_path != full_path;
                return Ok(Some(found));
            }
        }

        for entry in entries {
            let Some(Dynamic::Param(name)) = self.dynamic_of(entry) else {
                continue;
            };
            let mut params = params.clone();
            params.insert(name, segment.to_string());
            let path = join_path(current, &entry.name);

            let found = if entry.is_file {
                self.try_read(&path)
                    .await?
                    .map(|content| self.build_match(path, content, params))
            } else {
                self.direct_hit(&path, &params).await?
            };
            if let Some(mut found) = found {
                found.redirect = true;
                return Ok(Some(found));
            }
        }

        let remaining = [segment.to_string()];
        self.resolve_catch_all(entries, &remaining, current, params)
            .await
    }

    async fn resolve_nested(
        &self,
        entries: &[DirEntry],
        segments: &[String],
        current: &str,
        params: BTreeMap<String, String>,
        full_path: &str,
    ) -> Result<Option<FileMatch>, ResolveError> {
        let (segment, rest) = (&segments[0], &segments[1..]);

        let static_dirs = entries
            .iter()
            .filter(|entry| entry.is_directory && entry.name == *segment);
        for entry in static_dirs {
            let next = join_path(current, &entry.name);
            if let Some(found) = self
                .resolve_segments(rest, next, params.clone(), full_path)
                .await?
            {
                return Ok(Some(found));
            }
        }

        for entry in entries.iter().filter(|entry| entry.is_directory) {
            let Some(Dynamic::Param(name)) = self.dynamic_of(entry) else {
                continue;
            };
            let mut params = params.clone();
            params.insert(name, segment.clone());
            let next = join_path(current, &entry.name);
            if let Some(mut found) = self.resolve_segments(rest, next, params, full_path).await? {
                found.redirect = true;
                return Ok(Some(found));
            }
        }

        self.resolve_catch_all(entries, segments, current, params).await
    }

    async fn resolve_catch_all(
        &self,
        entries: &[DirEntry],
        segments: &[String],
        current: &str,
        params: BTreeMap<String, String>,
    ) -> Result<Option<FileMatch>, ResolveError> {
        for entry in entries.iter().filter(|entry| entry.is_file) {
            let Some(Dynamic::CatchAll(name)) = self.dynamic_of(entry) else {
                continue;
            };
            let path = join_path(current, &entry.name);
            if let Some(content) = self.try_read(&path).await? {
                let mut params = params.clone();
                params.insert(name, segments.join("/"));
                let mut found = self.build_match(path, content, params);
                found.redirect = true;
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// The exact path as a file, or as a directory holding an entrypoint.
    async fn direct_hit(
        &self,
        target: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Option<FileMatch>, ResolveError> {
        if !target.is_empty() {
            if let Some(content) = self.try_read(target).await? {
                return Ok(Some(self.build_match(target.to_string(), content, params.clone())));
            }
        }
        for ext in &self.options.extensions {
            let index = join_path(target, &format!("{}.{}", self.options.entrypoint, ext));
            if let Some(content) = self.try_read(&index).await? {
                return Ok(Some(self.build_match(index, content, params.clone())));
            }
        }
        Ok(None)
    }

    async fn try_read(&self, path: &str) -> Result<Option<FileContent>, ResolveError> {
        match self.backend.file_exists(path).await? {
            Some(false) => return Ok(None),
            Some(true) | None => {}
        }
        match self.backend.read_text_file(path).await {
            Ok(content) => Ok(Some(content)),
            Err(ResolveError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn build_match(
        &self,
        path: String,
        content: FileContent,
        params: BTreeMap<String, String>,
    ) -> FileMatch {
        let stem = match path.rsplit_once('/') {
            Some((dir, name)) => join_path(dir, self.source_stem(name).unwrap_or(name)),
            None => self.source_stem(&path).unwrap_or(&path).to_string(),
        };
        FileMatch {
            content: content.content,
            match_path: format!("/{}", stem),
            path,
            params,
            variables: content.variables,
            redirect: false,
        }
    }

    /// File name without a recognised source extension.
    fn source_stem<'n>(&self, name: &'n str) -> Option<&'n str> {
        let (stem, ext) = name.rsplit_once('.')?;
        self.options
            .extensions
            .iter()
            .any(|known| known == ext)
            .then_some(stem)
    }

    fn dynamic_of(&self, entry: &DirEntry) -> Option<Dynamic> {
        if entry.is_file {
            dynamic_name(self.source_stem(&entry.name)?)
        } else if entry.is_directory {
            dynamic_name(&entry.name)
        } else {
            None
        }
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", join_path("", path))
}
