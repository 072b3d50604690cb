#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("no function matches {0}")]
    NotFound(String),
    #[error("file source returned {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("file source I/O error: {0}")]
    Io(String),
}

impl ResolveError {
    pub fn status(&self) -> u16 {
        match self {
            ResolveError::NotFound(_) => 404,
            ResolveError::Backend { status, .. } => *status,
            ResolveError::Io(_) => 500,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ResolveError::NotFound(_))
    }

    pub(crate) fn from_io(path: &str, err: std::io::Error) -> Self {
        if is_missing(&err) {
            ResolveError::NotFound(path.to_string())
        } else {
            ResolveError::Io(format!("{}: {}", path, err))
        }
    }
}

/// A path that does not exist, or that runs through a regular file.
pub(crate) fn is_missing(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
    )
}
