pub mod config;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod port;
pub mod registry;

pub use config::PoolConfig;
pub use error::PoolError;
pub use launcher::{
    HostLauncher, IsolateHandle, LaunchSpec, Launcher, ProcessLauncher, SubjectLauncher,
    WorkerLauncher,
};
pub use manager::{IsolateManager, PoolMetrics, SpawnSpec};
pub use port::find_free_port;
pub use registry::{IsolateRecord, IsolateRegistry};
