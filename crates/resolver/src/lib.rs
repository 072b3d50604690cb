pub mod backend;
pub mod error;
pub mod github;
pub mod local;
pub mod memory;
pub mod pattern;
pub mod resolve;

pub use backend::{DirEntry, FileBackend, FileContent};
pub use error::ResolveError;
pub use github::GitHubBackend;
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use pattern::{RoutePattern, Segment, best_match};
pub use resolve::{FileMatch, FileResolver, ResolverOptions};
