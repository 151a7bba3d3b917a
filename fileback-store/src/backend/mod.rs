pub mod ftp;
#[cfg(feature = "ftp-client")]
pub mod ftp_client;
pub mod local;

use fileback_common::StorageBackend;

use crate::config::{BackendConfig, StoreConfig};

pub use self::ftp::{FtpTransport, RemoteBackend};
pub use self::local::LocalBackend;

/// Construct the back-end described by a store configuration.
///
/// For FTP this connects and logs in; the password falls back to the
/// environment when the file leaves it out.
pub fn from_config(config: &StoreConfig) -> anyhow::Result<Box<dyn StorageBackend>> {
    match &config.backend {
        BackendConfig::Local { root } => {
            let backend = LocalBackend::new(root, &config.derivation)?;
            Ok(Box::new(backend))
        }
        #[cfg(feature = "ftp-client")]
        BackendConfig::Ftp {
            host,
            port,
            user,
            password,
            root,
        } => {
            let password = crate::config::ftp_password(password.as_deref())?;
            let stream = ftp_client::connect(host, *port, user, &password)?;
            let backend = RemoteBackend::new(stream, root.clone(), &config.derivation)?;
            Ok(Box::new(backend))
        }
        #[cfg(not(feature = "ftp-client"))]
        BackendConfig::Ftp { host, .. } => {
            anyhow::bail!(
                "backend for {} is ftp, but this build lacks the ftp-client feature",
                host
            )
        }
    }
}
