//! Key to path derivation.
//!
//! A file key is hashed, the digest is hex encoded, and the hex string is cut
//! into fixed-width tokens joined by a delimiter. With the defaults (SHA-1,
//! three characters, `/`) every directory level holds at most 4096 children
//! and a key lands at a path like `a99/93e/364/.../d89/d`.
//!
//! Changing any derivation parameter moves every object, so the parameters
//! of a storage root must stay fixed for its lifetime.

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{FileBackError, Result};

pub const DEFAULT_DIGEST_ALGORITHM: &str = "SHA-1";
pub const DEFAULT_TOKEN_LENGTH: usize = 3;
pub const DEFAULT_DELIMITER: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Digest length in bytes.
    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Md5 => Md5::digest(data).to_vec(),
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha224 => Sha224::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = FileBackError;

    /// Accepts the usual spellings: `SHA-1`, `sha1`, `Sha256`, `MD5`, ...
    fn from_str(name: &str) -> Result<Self> {
        let normalized: String = name
            .trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha224" => Ok(DigestAlgorithm::Sha224),
            "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(FileBackError::UnsupportedAlgorithm(name.to_string())),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

/// Derive the sharded path for `key`.
///
/// Fails with `InvalidKey` for an empty key, `UnsupportedAlgorithm` for an
/// unknown digest name and `InvalidTokenLength` for a zero token length.
pub fn derive(key: &[u8], algorithm: &str, token_length: usize, delimiter: &str) -> Result<String> {
    PathDeriver::new(algorithm.parse()?, token_length, delimiter)?.derive(key)
}

/// A validated set of derivation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDeriver {
    algorithm: DigestAlgorithm,
    token_length: usize,
    delimiter: String,
}

impl PathDeriver {
    pub fn new(
        algorithm: DigestAlgorithm,
        token_length: usize,
        delimiter: impl Into<String>,
    ) -> Result<Self> {
        if token_length == 0 {
            return Err(FileBackError::InvalidTokenLength(token_length));
        }
        Ok(Self {
            algorithm,
            token_length,
            delimiter: delimiter.into(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn token_length(&self) -> usize {
        self.token_length
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Number of path segments every derived path has.
    pub fn segment_count(&self) -> usize {
        (self.algorithm.output_len() * 2).div_ceil(self.token_length)
    }

    pub fn derive(&self, key: &[u8]) -> Result<String> {
        if key.is_empty() {
            return Err(FileBackError::InvalidKey);
        }
        let hexed = hex::encode(self.algorithm.digest(key));
        let chars: Vec<char> = hexed.chars().collect();
        let tokens: Vec<String> = chars
            .chunks(self.token_length)
            .map(|token| token.iter().collect())
            .collect();
        Ok(tokens.join(&self.delimiter))
    }

    /// Split a derived or literal path back into its segments.
    pub fn segments<'p>(&self, path: &'p str) -> Vec<&'p str> {
        if self.delimiter.is_empty() {
            return vec![path];
        }
        path.split(self.delimiter.as_str())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl Default for PathDeriver {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha1,
            token_length: DEFAULT_TOKEN_LENGTH,
            delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}
