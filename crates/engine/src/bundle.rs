use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const BUNDLE_CONTENT_TYPE: &str = "text/javascript";

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    /// Module names left external to the bundle.
    pub shared: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to start bundler {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bundler exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("bundler produced invalid UTF-8 output")]
    InvalidOutput,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Compiles a resolved module into a load-ready artifact.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(
        &self,
        path: &str,
        source: &str,
        options: &BundleOptions,
    ) -> Result<String, BundleError>;
}

/// Serves the resolved source unchanged.
pub struct SourceBundler;

#[async_trait]
impl Bundler for SourceBundler {
    async fn bundle(
        &self,
        _path: &str,
        source: &str,
        _options: &BundleOptions,
    ) -> Result<String, BundleError> {
        Ok(source.to_string())
    }
}

/// Pipes the source through an external command (e.g. `esbuild`). `{path}`
/// in an argument is replaced with the module path; each shared module is
/// passed as `--external:<name>`.
pub struct CommandBundler {
    program: String,
    args: Vec<String>,
}

impl CommandBundler {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_args(&self, path: &str, options: &BundleOptions) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{path}", path))
            .collect();
        args.extend(options.shared.iter().map(|name| format!("--external:{}", name)));
        args
    }
}

#[async_trait]
impl Bundler for CommandBundler {
    async fn bundle(
        &self,
        path: &str,
        source: &str,
        options: &BundleOptions,
    ) -> Result<String, BundleError> {
        let mut child = Command::new(&self.program)
            .args(self.command_args(path, options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BundleError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(source.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BundleError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        String::from_utf8(output.stdout).map_err(|_| BundleError::InvalidOutput)
    }
}
