use engine::TransportKind;

/// Failure to reach an isolate. An isolate answering with a 4xx or 5xx is a
/// normal response, never one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request to isolate at {address} failed: {message}")]
    Request { address: String, message: String },
    #[error("timed out waiting for isolate at {0}")]
    NotReady(String),
    #[error("request to isolate at {0} timed out")]
    Timeout(String),
    #[error("isolate at {0} closed the connection")]
    Closed(String),
    #[error("no isolate is listening at {0}")]
    NoResponders(String),
    #[error("{kind} transport cannot address {detail}")]
    Address { kind: TransportKind, detail: String },
    #[error("malformed message from isolate at {address}: {message}")]
    Protocol { address: String, message: String },
}

impl TransportError {
    pub fn request(address: &str, err: impl std::fmt::Display) -> Self {
        TransportError::Request {
            address: address.to_string(),
            message: err.to_string(),
        }
    }
}
