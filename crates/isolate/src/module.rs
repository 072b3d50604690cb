//! Module loading inside an isolate.
//!
//! A [`ModuleSource`] turns a module name into its code and exports. A
//! [`Manifest`] names the target module, the shared modules it expects and
//! the middleware wrapped around it; [`ModuleLoader::load`] resolves all of
//! them up front and composes one [`Handler`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use engine::{Handler, HandlerError, RequestEnvelope, ResponseSink};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::metadata::StartupMetadata;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to load module {module}: {message}")]
pub struct ModuleLoadError {
    pub module: String,
    pub message: String,
    pub status: Option<u16>,
}

impl ModuleLoadError {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status(&self) -> u16 {
        self.status.unwrap_or(500)
    }
}

impl From<ModuleLoadError> for HandlerError {
    fn from(err: ModuleLoadError) -> Self {
        HandlerError::new(err.to_string()).with_status(err.status())
    }
}

/// Runs around the target handler. Call `next.run` to continue the chain or
/// answer through `response` directly.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, request: RequestEnvelope, response: ResponseSink, next: Next);
}

/// Remaining middleware plus the target handler.
#[derive(Clone)]
pub struct Next {
    middleware: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    pub async fn run(self, request: RequestEnvelope, response: ResponseSink) {
        match self.middleware.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    middleware: self.middleware.clone(),
                    index: self.index + 1,
                    handler: self.handler.clone(),
                };
                middleware.call(request, response, next).await
            }
            None => self.handler.call(request, response).await,
        }
    }
}

/// A resolved module and whatever it exports.
#[derive(Clone, Default)]
pub struct Module {
    pub name: String,
    pub code: String,
    pub handler: Option<Arc<dyn Handler>>,
    pub middleware: Option<Arc<dyn Middleware>>,
}

impl Module {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware = Some(middleware);
        self
    }
}

#[async_trait]
pub trait ModuleSource: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Module, ModuleLoadError>;
}

/// Modules registered ahead of time by name.
#[derive(Default)]
pub struct StaticModuleSource {
    modules: RwLock<HashMap<String, Module>>,
}

impl StaticModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, module: Module) {
        self.modules.write().insert(module.name.clone(), module);
    }

    pub fn with_module(self, module: Module) -> Self {
        self.insert(module);
        self
    }
}

#[async_trait]
impl ModuleSource for StaticModuleSource {
    async fn resolve(&self, name: &str) -> Result<Module, ModuleLoadError> {
        self.modules
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleLoadError::new(name, "module not found").with_status(404))
    }
}

/// What an isolate loads: one target, the shared modules it imports, and
/// the middleware chain, outermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub target: String,
    #[serde(default)]
    pub shared: Vec<String>,
    #[serde(default)]
    pub middleware: Vec<String>,
}

/// A manifest with every module resolved.
pub struct LoadedManifest {
    pub handler: Arc<dyn Handler>,
    pub target: Module,
    pub shared: BTreeMap<String, Module>,
}

pub struct ModuleLoader {
    source: Arc<dyn ModuleSource>,
}

impl ModuleLoader {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self { source }
    }

    pub async fn load(&self, manifest: &Manifest) -> Result<LoadedManifest, ModuleLoadError> {
        let target = self.source.resolve(&manifest.target).await?;
        let Some(target_handler) = target.handler.clone() else {
            return Err(ModuleLoadError::new(
                &manifest.target,
                "module does not export a handler",
            ));
        };

        let mut shared = BTreeMap::new();
        for name in &manifest.shared {
            shared.insert(name.clone(), self.source.resolve(name).await?);
        }

        let mut chain: Vec<Arc<dyn Middleware>> = Vec::with_capacity(manifest.middleware.len());
        for name in &manifest.middleware {
            let module = self.source.resolve(name).await?;
            let Some(middleware) = module.middleware else {
                return Err(ModuleLoadError::new(name, "module does not export middleware"));
            };
            chain.push(middleware);
        }

        let handler: Arc<dyn Handler> = if chain.is_empty() {
            target_handler
        } else {
            Arc::new(Composed {
                entry: Next {
                    middleware: chain.into(),
                    index: 0,
                    handler: target_handler,
                },
            })
        };

        tracing::debug!(
            "Loaded {} with {} shared and {} middleware modules",
            manifest.target,
            shared.len(),
            manifest.middleware.len()
        );
        Ok(LoadedManifest {
            handler,
            target,
            shared,
        })
    }
}

impl ModuleLoader {
    /// The handler an isolate booted with `metadata` serves. A load failure
    /// becomes a handler answering every request with that failure.
    pub async fn handler_for(&self, metadata: &StartupMetadata) -> Arc<dyn Handler> {
        match self.load(&metadata.manifest()).await {
            Ok(loaded) => loaded.handler,
            Err(err) => {
                tracing::warn!("Isolate for {} failed to load: {}", metadata.pattern, err);
                failed_load_handler(err)
            }
        }
    }
}

struct Composed {
    entry: Next,
}

#[async_trait]
impl Handler for Composed {
    async fn call(&self, request: RequestEnvelope, response: ResponseSink) {
        self.entry.clone().run(request, response).await
    }
}

/// Answers every request with the load failure, using its status.
pub fn failed_load_handler(err: ModuleLoadError) -> Arc<dyn Handler> {
    Arc::new(FailedLoad(err))
}

struct FailedLoad(ModuleLoadError);

#[async_trait]
impl Handler for FailedLoad {
    async fn call(&self, _request: RequestEnvelope, response: ResponseSink) {
        response.error(self.0.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{dispatch, handler_fn};
    use futures_util::StreamExt;

    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        async fn call(&self, mut request: RequestEnvelope, mut response: ResponseSink, next: Next) {
            if request.query_value("deny").is_some() {
                response.status(403);
                response.send("denied");
                return;
            }
            response.header(&format!("x-{}", self.0), "1");
            request.headers.push(("x-seen".to_string(), self.0.to_string()));
            next.run(request, response).await
        }
    }

    fn source() -> Arc<StaticModuleSource> {
        let target = handler_fn(|request: RequestEnvelope, response: ResponseSink| async move {
            let seen: Vec<&str> = request
                .headers
                .iter()
                .filter(|(key, _)| key == "x-seen")
                .map(|(_, value)| value.as_str())
                .collect();
            response.send(seen.join(","));
        });
        Arc::new(
            StaticModuleSource::new()
                .with_module(Module::new("api/hello", "export default h").with_handler(target))
                .with_module(Module::new("shared/db", "export const db = {}"))
                .with_module(Module::new("mw/auth", "").with_middleware(Arc::new(Tag("auth"))))
                .with_module(Module::new("mw/log", "").with_middleware(Arc::new(Tag("log")))),
        )
    }

    async fn run(handler: Arc<dyn Handler>, request: RequestEnvelope) -> (u16, String) {
        let (head, mut body) = dispatch(handler, request).into_parts().await;
        let mut out = Vec::new();
        while let Some(Ok(bytes)) = body.next().await {
            out.extend_from_slice(&bytes);
        }
        (head.status, String::from_utf8_lossy(&out).to_string())
    }

    #[tokio::test]
    async fn composes_middleware_in_manifest_order() {
        let loader = ModuleLoader::new(source());
        let manifest = Manifest {
            target: "api/hello".to_string(),
            shared: vec!["shared/db".to_string()],
            middleware: vec!["mw/auth".to_string(), "mw/log".to_string()],
        };
        let loaded = loader.load(&manifest).await.expect("load");
        assert_eq!(loaded.target.code, "export default h");
        assert!(loaded.shared.contains_key("shared/db"));

        let (status, body) = run(loaded.handler.clone(), RequestEnvelope::new("GET", "/")).await;
        assert_eq!(status, 200);
        assert_eq!(body, "auth,log");

        let mut denied = RequestEnvelope::new("GET", "/");
        denied.query.push(("deny".to_string(), "1".to_string()));
        let (status, body) = run(loaded.handler, denied).await;
        assert_eq!(status, 403);
        assert_eq!(body, "denied");
    }

    #[tokio::test]
    async fn missing_modules_fail_with_their_status() {
        let loader = ModuleLoader::new(source());
        let manifest = Manifest {
            target: "api/hello".to_string(),
            shared: vec!["shared/missing".to_string()],
            middleware: Vec::new(),
        };
        let err = loader.load(&manifest).await.err().expect("missing shared");
        assert_eq!(err.module, "shared/missing");
        assert_eq!(err.status(), 404);

        let (status, body) = run(failed_load_handler(err), RequestEnvelope::new("GET", "/")).await;
        assert_eq!(status, 404);
        assert!(body.contains("shared/missing"));
    }

    #[tokio::test]
    async fn target_without_handler_is_a_load_error() {
        let loader = ModuleLoader::new(source());
        let manifest = Manifest {
            target: "shared/db".to_string(),
            ..Manifest::default()
        };
        let err = loader.load(&manifest).await.err().expect("no handler");
        assert_eq!(err.status(), 500);
    }
}
