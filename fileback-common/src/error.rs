use std::fmt;

/// Which half of an operation a path or stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Every failure a back-end can surface, regardless of the storage medium.
#[derive(Debug, thiserror::Error)]
pub enum FileBackError {
    #[error("file key must not be empty")]
    InvalidKey,
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("token length must be positive, got {0}")]
    InvalidTokenLength(usize),
    #[error("buffer size must be positive")]
    InvalidBufferSize,
    #[error("no file operation set")]
    MissingOperation,
    #[error("unsupported file operation: {0}")]
    UnsupportedOperation(String),
    #[error("no {0} path or key supplied")]
    NoPathLocated(Side),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("no {0} supplied")]
    MissingStream(&'static str),
    #[error("target path equals source path: {0}")]
    SourceEqualsTarget(String),
    #[error("failed to create directory: {0}")]
    DirectoryCreationFailed(String),
    #[error("transfer of {0} was not confirmed by the server")]
    CommandNotCompleted(String),
    #[error("transport lock poisoned by an earlier panic")]
    TransportUnavailable,
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileBackError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FileBackError::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<std::io::Error> for FileBackError {
    fn from(source: std::io::Error) -> Self {
        FileBackError::Io {
            context: "I/O error".to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, FileBackError>;

/// Attach a description to an `io::Result`, mirroring `anyhow::Context`.
pub trait IoContext<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| FileBackError::io(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_wraps_source() {
        let res: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = res.io_context(|| "Failed to open a/b".to_string()).unwrap_err();
        assert_eq!(err.to_string(), "Failed to open a/b: denied");
        match err {
            FileBackError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_side_display() {
        assert_eq!(
            FileBackError::NoPathLocated(Side::Target).to_string(),
            "no target path or key supplied"
        );
    }
}
