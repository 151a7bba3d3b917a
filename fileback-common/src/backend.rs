use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, error};

use crate::context::FileContext;
use crate::error::{FileBackError, Result};
use crate::path::{PathDeriver, DEFAULT_DELIMITER, DEFAULT_DIGEST_ALGORITHM, DEFAULT_TOKEN_LENGTH};
use crate::transfer::DEFAULT_BUFFER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileOperation {
    Copy,
    Delete,
    Read,
    Write,
}

impl FromStr for FileOperation {
    type Err = FileBackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "copy" => Ok(FileOperation::Copy),
            "delete" => Ok(FileOperation::Delete),
            "read" => Ok(FileOperation::Read),
            "write" => Ok(FileOperation::Write),
            _ => Err(FileBackError::UnsupportedOperation(s.to_string())),
        }
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileOperation::Copy => "COPY",
            FileOperation::Delete => "DELETE",
            FileOperation::Read => "READ",
            FileOperation::Write => "WRITE",
        };
        f.write_str(name)
    }
}

/// Derivation and transfer parameters a back-end is built with.
///
/// These must not change for the lifetime of a storage root: a different
/// algorithm, token length or delimiter resolves every key somewhere else.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub digest_algorithm: String,
    pub token_length: usize,
    pub delimiter: String,
    pub buffer_size: usize,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            digest_algorithm: DEFAULT_DIGEST_ALGORITHM.to_string(),
            token_length: DEFAULT_TOKEN_LENGTH,
            delimiter: DEFAULT_DELIMITER.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl DerivationConfig {
    pub fn validate(&self) -> Result<()> {
        self.deriver().map(|_| ())
    }

    pub fn deriver(&self) -> Result<PathDeriver> {
        if self.buffer_size == 0 {
            return Err(FileBackError::InvalidBufferSize);
        }
        PathDeriver::new(
            self.digest_algorithm.parse()?,
            self.token_length,
            self.delimiter.clone(),
        )
    }
}

/// Trait implemented by every storage back-end.
///
/// A back-end is long lived and shared; everything specific to one call
/// travels in the [`FileContext`]. `operate` runs to completion on the
/// calling thread, including every provider and receiver callback.
pub trait StorageBackend: Send + Sync {
    /// Run the operation selected in `context`.
    fn operate(&self, context: &mut FileContext<'_>) -> Result<()> {
        let operation = context.operation().ok_or_else(|| {
            error!("No file operation set in context");
            FileBackError::MissingOperation
        })?;
        debug!(%operation, ?context, "Dispatching file operation");
        let result = match operation {
            FileOperation::Copy => self.copy(context),
            FileOperation::Delete => self.delete(context),
            FileOperation::Read => self.read(context),
            FileOperation::Write => self.write(context),
        };
        if let Err(e) = &result {
            error!(%operation, error = %e, "File operation failed");
        }
        result
    }

    fn copy(&self, context: &mut FileContext<'_>) -> Result<()>;

    fn delete(&self, context: &mut FileContext<'_>) -> Result<()>;

    fn read(&self, context: &mut FileContext<'_>) -> Result<()>;

    fn write(&self, context: &mut FileContext<'_>) -> Result<()>;
}

/// Reject a COPY whose source and target resolve to the same object.
pub fn ensure_distinct(source: &str, target: &str) -> Result<()> {
    if source == target {
        error!(path = %source, "Copy source equals target");
        return Err(FileBackError::SourceEqualsTarget(source.to_string()));
    }
    Ok(())
}
