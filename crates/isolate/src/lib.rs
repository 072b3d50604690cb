pub mod channel;
pub mod host;
pub mod metadata;
pub mod module;

pub use channel::{serve_subject, serve_worker};
pub use host::{HostHandle, bind, host_router, serve_from_env, serve_startup, spawn_host};
pub use metadata::{METADATA_ENV, PORT_ENV, StartupError, StartupMetadata};
pub use module::{
    LoadedManifest, Manifest, Middleware, Module, ModuleLoadError, ModuleLoader, ModuleSource,
    Next, StaticModuleSource, failed_load_handler,
};
