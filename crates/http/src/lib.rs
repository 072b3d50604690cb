mod listener;
mod server;

pub mod error;
pub mod metadata;
pub mod proxy;
pub mod router;
pub mod routes;

pub use error::ProxyError;
pub use listener::bind_reuseport;
pub use metadata::{HttpMetadataSource, MetadataSource, ResolverSource};
pub use proxy::{ProxyOptions, RequestProxy};
pub use router::{RESOLVE_PATH, app_router};
pub use routes::{RouteHit, RouteTable};
pub use server::serve_http;
