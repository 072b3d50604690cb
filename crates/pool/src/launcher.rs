//! Ways to start an isolate for a route pattern.
//!
//! Every launcher returns an owned [`IsolateHandle`]; the manager calls
//! `terminate()` on it when the isolate is replaced or evicted.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use isolate::{HostHandle, METADATA_ENV, ModuleLoader, ModuleSource, PORT_ENV, StartupMetadata};
use parking_lot::Mutex;
use resolver::RoutePattern;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use transport::{Broker, IsolateAddress, Target, WorkerHub};

use crate::error::PoolError;

/// What to start and where it must listen.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub pattern: RoutePattern,
    pub address: IsolateAddress,
    pub metadata: StartupMetadata,
}

pub trait IsolateHandle: Send + Sync {
    fn id(&self) -> String;

    fn has_exited(&self) -> bool;

    /// Best-effort; failures are logged.
    fn terminate(&self);
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError>;
}

// ========== Child processes ==========

/// Starts one OS process per isolate. The child receives its port in `PORT`
/// and its startup metadata as JSON in `ISOLATE_METADATA`.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command_for(&self, spec: &LaunchSpec) -> Result<Command, PoolError> {
        let metadata = spec.metadata.to_json().map_err(|err| PoolError::Spawn {
            pattern: spec.pattern.to_string(),
            message: err.to_string(),
        })?;

        let mut cmd = Command::new(&self.command);
        cmd.args(self.args.iter().map(|arg| arg.replace("{import}", &spec.metadata.import)));
        cmd.args(&spec.metadata.permissions);
        cmd.envs(&spec.metadata.variables);
        cmd.env(METADATA_ENV, metadata);
        if let Some(port) = spec.address.port() {
            cmd.env(PORT_ENV, port.to_string());
        }
        if let Some(cwd) = spec.metadata.cwd.as_ref().map(PathBuf::from).or_else(|| self.cwd.clone()) {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        Ok(cmd)
    }
}

struct ChildHandle {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl IsolateHandle for ChildHandle {
    fn id(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid {}", pid),
            None => "pid ?".to_string(),
        }
    }

    fn has_exited(&self) -> bool {
        !matches!(self.child.lock().try_wait(), Ok(None))
    }

    fn terminate(&self) {
        if let Err(err) = self.child.lock().start_kill() {
            tracing::warn!("Failed to kill isolate {}: {}", self.id(), err);
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
        let mut cmd = self.command_for(spec)?;
        let child = cmd.spawn().map_err(|err| PoolError::Spawn {
            pattern: spec.pattern.to_string(),
            message: format!("{}: {}", self.command, err),
        })?;
        let pid = child.id();
        tracing::info!(
            "Spawned isolate for {} (pid {:?}) at {}",
            spec.pattern,
            pid,
            spec.address
        );
        Ok(Box::new(ChildHandle {
            pid,
            child: Mutex::new(child),
        }))
    }
}

// ========== In-process isolates ==========

/// Runs the isolate HTTP host inside this process on the chosen port.
/// Reachable through the loopback HTTP transport exactly like a child.
pub struct HostLauncher {
    loader: ModuleLoader,
}

impl HostLauncher {
    pub fn new(source: Arc<dyn ModuleSource>) -> Self {
        Self {
            loader: ModuleLoader::new(source),
        }
    }
}

struct HostIsolate {
    host: Mutex<HostHandle>,
}

impl IsolateHandle for HostIsolate {
    fn id(&self) -> String {
        format!("host:{}", self.host.lock().port())
    }

    fn has_exited(&self) -> bool {
        self.host.lock().is_finished()
    }

    fn terminate(&self) {
        self.host.lock().shutdown();
    }
}

#[async_trait]
impl Launcher for HostLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
        let Some(port) = spec.address.port() else {
            return Err(PoolError::Spawn {
                pattern: spec.pattern.to_string(),
                message: format!("{} is not a loopback address", spec.address),
            });
        };
        let handler = self.loader.handler_for(&spec.metadata).await;
        let host = isolate::spawn_host(port, handler)
            .await
            .map_err(|err| PoolError::Bind {
                pattern: spec.pattern.to_string(),
                port,
                message: err.to_string(),
            })?;
        tracing::info!("Started in-process isolate for {} at {}", spec.pattern, spec.address);
        Ok(Box::new(HostIsolate {
            host: Mutex::new(host),
        }))
    }
}

struct TaskIsolate {
    id: String,
    task: JoinHandle<()>,
    on_terminate: Option<Box<dyn Fn() + Send + Sync>>,
}

impl IsolateHandle for TaskIsolate {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn has_exited(&self) -> bool {
        self.task.is_finished()
    }

    fn terminate(&self) {
        if let Some(cleanup) = &self.on_terminate {
            cleanup();
        }
        self.task.abort();
    }
}

/// Serves each isolate on an in-process worker registered with `hub`.
pub struct WorkerLauncher {
    hub: Arc<WorkerHub>,
    loader: ModuleLoader,
}

impl WorkerLauncher {
    pub fn new(hub: Arc<WorkerHub>, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            hub,
            loader: ModuleLoader::new(source),
        }
    }
}

#[async_trait]
impl Launcher for WorkerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
        let Target::Worker(id) = &spec.address.target else {
            return Err(PoolError::Spawn {
                pattern: spec.pattern.to_string(),
                message: format!("{} is not a worker address", spec.address),
            });
        };
        let handler = self.loader.handler_for(&spec.metadata).await;
        let endpoint = self.hub.register(id);
        let task = tokio::spawn(isolate::serve_worker(endpoint, handler));

        let hub = self.hub.clone();
        let worker_id = id.clone();
        Ok(Box::new(TaskIsolate {
            id: format!("worker:{}", id),
            task,
            on_terminate: Some(Box::new(move || {
                hub.remove(&worker_id);
            })),
        }))
    }
}

/// Serves each isolate on its own broker subject.
pub struct SubjectLauncher {
    broker: Arc<dyn Broker>,
    loader: ModuleLoader,
}

impl SubjectLauncher {
    pub fn new(broker: Arc<dyn Broker>, source: Arc<dyn ModuleSource>) -> Self {
        Self {
            broker,
            loader: ModuleLoader::new(source),
        }
    }
}

#[async_trait]
impl Launcher for SubjectLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn IsolateHandle>, PoolError> {
        let Target::Subject(subject) = spec.address.target.clone() else {
            return Err(PoolError::Spawn {
                pattern: spec.pattern.to_string(),
                message: format!("{} is not a subject address", spec.address),
            });
        };
        let handler = self.loader.handler_for(&spec.metadata).await;
        let broker = self.broker.clone();
        let id = format!("subject:{}", subject);
        let task = tokio::spawn(async move {
            if let Err(err) = isolate::serve_subject(broker, &subject, handler).await {
                tracing::warn!("Subject isolate {} stopped: {}", subject, err);
            }
        });
        Ok(Box::new(TaskIsolate {
            id,
            task,
            on_terminate: None,
        }))
    }
}
