use std::sync::Arc;

use anyhow::{Context, bail};
use engine::{Bundler, CommandBundler, RuntimeConfig, SourceBundler, TransportKind};
use http::{HttpMetadataSource, MetadataSource, ProxyOptions, RequestProxy, ResolverSource};
use pool::{IsolateManager, PoolConfig, ProcessLauncher};
use resolver::{FileBackend, FileResolver, GitHubBackend, LocalBackend, ResolverOptions};
use transport::HttpTransport;

use crate::watch;

const GITHUB_ORIGIN: &str = "github:";

pub async fn run(config: RuntimeConfig) -> anyhow::Result<()> {
    let proxy = build_proxy(&config)?;

    let _watcher = if config.watch_enabled() {
        let root = config.source_root();
        let watcher = watch::start_watch(&root, Arc::clone(&proxy))
            .with_context(|| format!("failed to watch {}", root.display()))?;
        tracing::info!("Watching {} for changes", root.display());
        Some(watcher)
    } else {
        None
    };

    let result = http::serve_http(
        Arc::clone(&proxy),
        config.listen_port(),
        config.listeners(),
        shutdown_signal(),
    )
    .await
    .context("proxy server failed");

    proxy.shutdown();
    tracing::info!("Pool metrics: {}", proxy.manager().metrics().to_json());
    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Wires resolver, pool and transport from the runtime config.
pub fn build_proxy(config: &RuntimeConfig) -> anyhow::Result<Arc<RequestProxy>> {
    let pool_config = PoolConfig::from_runtime(config);
    if pool_config.transport != TransportKind::Http {
        bail!(
            "transport `{}` needs an embedding host; the proxy binary serves isolates over http",
            pool_config.transport
        );
    }
    let Some(command) = pool_config.command.clone() else {
        bail!("[pool] command is required to start isolates");
    };
    let launcher = ProcessLauncher::new(command, pool_config.args.clone())
        .with_cwd(config.source_root());
    let manager = IsolateManager::new(
        pool_config,
        Arc::new(HttpTransport::new()),
        Arc::new(launcher),
    );

    let proxy = RequestProxy::new(
        ProxyOptions::from_runtime(config),
        metadata_source(config)?,
        manager,
        bundler(config),
    );
    Ok(Arc::new(proxy))
}

fn metadata_source(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn MetadataSource>> {
    if let Some(endpoint) = config.metadata_endpoint() {
        tracing::info!("Resolving functions through {}", endpoint);
        return Ok(Arc::new(HttpMetadataSource::new(endpoint)));
    }
    let options = ResolverOptions {
        entrypoint: config.entrypoint(),
        extensions: config.extensions(),
    };
    let resolver = FileResolver::new(file_backend(config)?, options);
    Ok(Arc::new(ResolverSource::new(resolver)))
}

fn file_backend(config: &RuntimeConfig) -> anyhow::Result<Arc<dyn FileBackend>> {
    let origin = config.origin();
    if let Some(slug) = origin.strip_prefix(GITHUB_ORIGIN) {
        let mut backend = GitHubBackend::from_slug(slug)
            .with_context(|| format!("invalid GitHub origin `{}`, expected owner/repo[@ref]", slug))?
            .with_variables(config.variables());
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            backend = backend.with_token(token);
        }
        return Ok(Arc::new(backend));
    }
    let root = config.source_root();
    Ok(Arc::new(LocalBackend::new(root).with_variables(config.variables())))
}

fn bundler(config: &RuntimeConfig) -> Arc<dyn Bundler> {
    match config.bundler_command() {
        Some(command) => {
            let mut parts = command.into_iter();
            let program = parts.next().unwrap_or_default();
            Arc::new(CommandBundler::new(program, parts.collect()))
        }
        None => Arc::new(SourceBundler),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> RuntimeConfig {
        RuntimeConfig::from_toml(toml).expect("toml")
    }

    #[test]
    fn requires_an_isolate_command() {
        let err = build_proxy(&config("")).err().expect("no command");
        assert!(err.to_string().contains("[pool] command"));
    }

    #[test]
    fn rejects_in_process_transports() {
        let err = build_proxy(&config(
            r#"
            [pool]
            transport = "worker"
            command = "deno"
            "#,
        ))
        .err()
        .expect("worker");
        assert!(err.to_string().contains("transport `worker`"));
    }

    #[test]
    fn builds_a_local_proxy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proxy = build_proxy(&config(&format!(
            r#"
            [source]
            root = "{}"
            functions_dir = "/functions/"

            [pool]
            command = "deno"
            args = ["run", "-A", "{{import}}"]

            [proxy]
            shared_allowlist = ["react"]
            "#,
            dir.path().display()
        )))
        .expect("proxy");
        assert_eq!(proxy.options().functions_dir, "functions");
        assert_eq!(proxy.options().shared_allowlist, vec!["react".to_string()]);
        assert!(proxy.routes().is_empty());
    }

    #[test]
    fn github_origins_need_a_slug() {
        let err = file_backend(&config(
            r#"
            [source]
            origin = "github:not-a-slug"
            "#,
        ))
        .err()
        .expect("bad slug");
        assert!(err.to_string().contains("invalid GitHub origin"));
    }
}
