use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};

use crate::backend::{DirEntry, FileBackend, FileContent, join_path};
use crate::error::ResolveError;

const DEFAULT_API_BASE: &str = "https://api.github.com";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";
const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";

/// Functions stored in a GitHub repository, read through the contents API.
pub struct GitHubBackend {
    client: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    reference: Option<String>,
    token: Option<String>,
    root: String,
    variables: BTreeMap<String, String>,
}

impl GitHubBackend {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            owner: owner.into(),
            repo: repo.into(),
            reference: None,
            token: None,
            root: String::new(),
            variables: BTreeMap::new(),
        }
    }

    /// Parses `owner/repo` or `owner/repo@ref`.
    pub fn from_slug(slug: &str) -> Option<Self> {
        let (repo_part, reference) = match slug.split_once('@') {
            Some((repo_part, reference)) => (repo_part, Some(reference)),
            None => (slug, None),
        };
        let (owner, repo) = repo_part.split_once('/')?;
        if owner.is_empty() || repo.is_empty() {
            return None;
        }
        let mut backend = Self::new(owner, repo);
        if let Some(reference) = reference.filter(|value| !value.is_empty()) {
            backend = backend.with_reference(reference);
        }
        Some(backend)
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = join_path("", &root.into());
        self
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    fn contents_url(&self, path: &str) -> String {
        let mut url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.owner,
            self.repo,
            join_path(&self.root, path)
        );
        if let Some(reference) = &self.reference {
            url.push_str("?ref=");
            url.push_str(&urlencoding::encode(reference));
        }
        url
    }

    async fn get(&self, path: &str, accept: &str) -> Result<reqwest::Response, ResolveError> {
        let mut request = self
            .client
            .get(self.contents_url(path))
            .header(ACCEPT, accept)
            .header(USER_AGENT, "isolate-proxy");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|err| ResolveError::Backend {
            status: 502,
            message: err.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolveError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!("GitHub returned {} for {}", status, path);
            return Err(ResolveError::Backend {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl FileBackend for GitHubBackend {
    /// The contents API answers a directory path with its listing, so a
    /// path only counts as a file when its metadata says so.
    async fn file_exists(&self, path: &str) -> Result<Option<bool>, ResolveError> {
        let response = match self.get(path, JSON_MEDIA_TYPE).await {
            Ok(response) => response,
            Err(ResolveError::NotFound(_)) => return Ok(Some(false)),
            Err(err) => return Err(err),
        };
        let metadata: serde_json::Value =
            response.json().await.map_err(|err| ResolveError::Backend {
                status: 502,
                message: err.to_string(),
            })?;
        Ok(Some(metadata.get("type").and_then(|kind| kind.as_str()) == Some("file")))
    }

    async fn read_text_file(&self, path: &str) -> Result<FileContent, ResolveError> {
        let response = self.get(path, RAW_MEDIA_TYPE).await?;
        let content = response.text().await.map_err(|err| ResolveError::Backend {
            status: 502,
            message: err.to_string(),
        })?;
        Ok(FileContent {
            content,
            variables: self.variables.clone(),
        })
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ResolveError> {
        let response = self.get(path, JSON_MEDIA_TYPE).await?;
        let listing: serde_json::Value =
            response.json().await.map_err(|err| ResolveError::Backend {
                status: 502,
                message: err.to_string(),
            })?;

        // A file path answers with an object instead of an array.
        let Some(items) = listing.as_array() else {
            return Err(ResolveError::NotFound(path.to_string()));
        };

        Ok(items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?;
                let kind = item.get("type")?.as_str()?;
                Some(DirEntry {
                    name: name.to_string(),
                    is_file: kind == "file",
                    is_directory: kind == "dir",
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;

    use crate::{FileResolver, ResolverOptions};

    /// Raw content when asked for it, file metadata otherwise.
    fn file(headers: &HeaderMap, name: &str, content: &'static str) -> Response {
        let raw = headers
            .get(ACCEPT)
            .and_then(|value| value.to_str().ok())
            == Some(RAW_MEDIA_TYPE);
        if raw {
            content.into_response()
        } else {
            axum::Json(serde_json::json!({ "name": name, "type": "file" })).into_response()
        }
    }

    async fn contents(Path(path): Path<String>, headers: HeaderMap) -> Response {
        match path.as_str() {
            "fns" => axum::Json(serde_json::json!([
                { "name": "index.ts", "type": "file" },
                { "name": "users", "type": "dir" },
            ]))
            .into_response(),
            "fns/index.ts" => file(&headers, "index.ts", "export default () => 'hi'"),
            "fns/users" => axum::Json(serde_json::json!([
                { "name": "index.ts", "type": "file" },
            ]))
            .into_response(),
            "fns/users/index.ts" => file(&headers, "index.ts", "export default () => 'users'"),
            "fns/broken" => (StatusCode::FORBIDDEN, "rate limited").into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn start() -> String {
        let app = axum::Router::new().route("/repos/acme/site/contents/*path", get(contents));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn reads_contents_api() {
        let base = start().await;
        let backend = GitHubBackend::new("acme", "site")
            .with_api_base(base)
            .with_root("fns");

        let entries = backend.read_dir("").await.expect("listing");
        assert_eq!(
            entries,
            vec![DirEntry::file("index.ts"), DirEntry::directory("users")]
        );

        let file = backend.read_text_file("index.ts").await.expect("file");
        assert_eq!(file.content, "export default () => 'hi'");

        let missing = backend.read_text_file("nope.ts").await.expect_err("missing");
        assert!(missing.is_not_found());

        let broken = backend.read_dir("broken").await.expect_err("forbidden");
        assert_eq!(broken.status(), 403);
    }

    #[tokio::test]
    async fn directories_resolve_to_their_entrypoint() {
        let base = start().await;
        let backend = GitHubBackend::new("acme", "site")
            .with_api_base(base)
            .with_root("fns");
        assert_eq!(backend.file_exists("users").await, Ok(Some(false)));
        assert_eq!(backend.file_exists("users/index.ts").await, Ok(Some(true)));
        assert_eq!(backend.file_exists("users/nope.ts").await, Ok(Some(false)));

        let resolver = FileResolver::new(std::sync::Arc::new(backend), ResolverOptions::default());
        let found = resolver.resolve_path("/users").await.expect("entrypoint");
        assert_eq!(found.path, "users/index.ts");
        assert_eq!(found.content, "export default () => 'users'");
        assert!(found.params.is_empty());
    }

    #[test]
    fn encodes_the_reference() {
        let backend = GitHubBackend::new("acme", "site").with_reference("feature/a&b");
        assert_eq!(
            backend.contents_url("a.ts"),
            "https://api.github.com/repos/acme/site/contents/a.ts?ref=feature%2Fa%26b"
        );
    }

    #[test]
    fn parses_slug() {
        let backend = GitHubBackend::from_slug("acme/site@main").expect("slug");
        assert_eq!(
            backend.contents_url("a.ts"),
            "https://api.github.com/repos/acme/site/contents/a.ts?ref=main"
        );
        assert!(GitHubBackend::from_slug("acme").is_none());
    }
}
