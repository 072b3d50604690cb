use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_ENTRYPOINT: &str = "index";
pub const DEFAULT_EXTENSIONS: [&str; 5] = ["ts", "tsx", "js", "jsx", "mjs"];

/// How the proxy reaches an isolate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Worker,
    PubSub,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Http => write!(f, "http"),
            TransportKind::Worker => write!(f, "worker"),
            TransportKind::PubSub => write!(f, "pubsub"),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct RuntimeConfig {
    pub source: Option<SourceConfig>,
    pub pool: Option<PoolSection>,
    pub proxy: Option<ProxyConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SourceConfig {
    pub root: Option<String>,
    pub functions_dir: Option<String>,
    pub entrypoint: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub origin: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PoolSection {
    pub transport: Option<TransportKind>,
    pub port_start: Option<u16>,
    pub port_end: Option<u16>,
    pub health_timeout_ms: Option<u64>,
    pub health_interval_ms: Option<u64>,
    pub spawn_attempts: Option<u32>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ProxyConfig {
    pub port: Option<u16>,
    pub listeners: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub shared_allowlist: Vec<String>,
    pub metadata_endpoint: Option<String>,
    pub bundler: Option<Vec<String>>,
    pub watch: Option<bool>,
}

impl RuntimeConfig {
    pub fn load() -> Self {
        let path = match Self::find_config_path() {
            Some(path) => path,
            None => return Self::default(),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                tracing::warn!("Failed to read {}: {}", path.display(), err);
                return Self::default();
            }
        };

        match Self::from_toml(&contents) {
            Ok(config) => {
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(err) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn source_root(&self) -> PathBuf {
        self.source
            .as_ref()
            .and_then(|source| source.root.as_ref())
            .map(|root| expand_home_path(root))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory inside the source root that holds the functions, without
    /// surrounding slashes. Empty when functions live at the root.
    pub fn functions_dir(&self) -> String {
        self.source
            .as_ref()
            .and_then(|source| source.functions_dir.as_deref())
            .unwrap_or("")
            .trim_matches('/')
            .to_string()
    }

    pub fn entrypoint(&self) -> String {
        self.source
            .as_ref()
            .and_then(|source| source.entrypoint.clone())
            .unwrap_or_else(|| DEFAULT_ENTRYPOINT.to_string())
    }

    pub fn extensions(&self) -> Vec<String> {
        self.source
            .as_ref()
            .and_then(|source| source.extensions.clone())
            .unwrap_or_else(|| DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect())
    }

    pub fn origin(&self) -> String {
        self.source
            .as_ref()
            .and_then(|source| source.origin.clone())
            .unwrap_or_else(|| "local".to_string())
    }

    pub fn variables(&self) -> BTreeMap<String, String> {
        self.source
            .as_ref()
            .map(|source| source.variables.clone())
            .unwrap_or_default()
    }

    pub fn listen_port(&self) -> u16 {
        self.proxy
            .as_ref()
            .and_then(|proxy| proxy.port)
            .unwrap_or(8000)
    }

    pub fn listeners(&self) -> usize {
        self.proxy
            .as_ref()
            .and_then(|proxy| proxy.listeners)
            .unwrap_or(1)
            .max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        let ms = self
            .proxy
            .as_ref()
            .and_then(|proxy| proxy.request_timeout_ms)
            .unwrap_or(30_000);
        Duration::from_millis(ms)
    }

    pub fn shared_allowlist(&self) -> Vec<String> {
        self.proxy
            .as_ref()
            .map(|proxy| proxy.shared_allowlist.clone())
            .unwrap_or_default()
    }

    pub fn metadata_endpoint(&self) -> Option<String> {
        self.proxy.as_ref()?.metadata_endpoint.clone()
    }

    pub fn bundler_command(&self) -> Option<Vec<String>> {
        self.proxy
            .as_ref()?
            .bundler
            .clone()
            .filter(|command| !command.is_empty())
    }

    pub fn watch_enabled(&self) -> bool {
        self.proxy
            .as_ref()
            .and_then(|proxy| proxy.watch)
            .unwrap_or(false)
    }

    fn find_config_path() -> Option<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(path) = std::env::var("ISOLATE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("ISOLATE_CONFIG set but file not found: {}", path.display());
        }

        candidates.push(PathBuf::from("isolate.toml"));
        candidates.push(PathBuf::from("runtime.toml"));

        if let Some(path) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(path.join("isolate").join("config.toml"));
        }

        candidates.push(PathBuf::from("/etc/isolate/config.toml"));

        candidates.into_iter().find(|path| path.exists())
    }
}

fn expand_home_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }

    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_sections() {
        let config = RuntimeConfig::default();
        assert_eq!(config.source_root(), PathBuf::from("."));
        assert_eq!(config.functions_dir(), "");
        assert_eq!(config.entrypoint(), "index");
        assert_eq!(config.extensions().len(), DEFAULT_EXTENSIONS.len());
        assert_eq!(config.listen_port(), 8000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.metadata_endpoint().is_none());
    }

    #[test]
    fn parses_all_sections() {
        let config = RuntimeConfig::from_toml(
            r#"
            [source]
            root = "/srv/app"
            functions_dir = "/functions/"
            extensions = ["ts"]

            [source.variables]
            API_KEY = "secret"

            [pool]
            transport = "pubsub"
            port_start = 9100
            port_end = 9199
            command = "deno"
            args = ["run", "isolate.ts"]

            [proxy]
            port = 8080
            listeners = 4
            shared_allowlist = ["react"]
            bundler = ["esbuild", "--bundle"]
            "#,
        )
        .expect("parse");

        assert_eq!(config.source_root(), PathBuf::from("/srv/app"));
        assert_eq!(config.functions_dir(), "functions");
        assert_eq!(config.extensions(), vec!["ts".to_string()]);
        assert_eq!(config.variables().get("API_KEY").map(String::as_str), Some("secret"));
        let pool = config.pool.as_ref().expect("pool section");
        assert_eq!(pool.transport, Some(TransportKind::PubSub));
        assert_eq!(pool.args, vec!["run", "isolate.ts"]);
        assert_eq!(config.listen_port(), 8080);
        assert_eq!(config.listeners(), 4);
        assert_eq!(config.shared_allowlist(), vec!["react".to_string()]);
        assert_eq!(
            config.bundler_command(),
            Some(vec!["esbuild".to_string(), "--bundle".to_string()])
        );
    }
}
