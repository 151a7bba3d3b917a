//! Storage back-ends for fileback: a local directory tree and an FTP server.

pub mod backend;
pub mod config;

pub use backend::{from_config, FtpTransport, LocalBackend, RemoteBackend};
pub use config::{BackendConfig, StoreConfig};
