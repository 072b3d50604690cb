pub mod bundle;
pub mod config;
pub mod envelope;
pub mod handler;
pub mod stream;

pub use bundle::{BUNDLE_CONTENT_TYPE, BundleError, BundleOptions, Bundler, CommandBundler, SourceBundler};
pub use config::{RuntimeConfig, TransportKind};
pub use envelope::{
    REQUEST_ID_HEADER, RequestEnvelope, ResponseChunk, ResponseHead, ResponseOptions,
    next_request_id,
};
pub use handler::{Handler, dispatch, handler_fn};
pub use stream::{Chunk, HandlerError, Outcome, ResponseBody, ResponseSink, ResponseStream, StreamError};
