use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use fileback_common::DerivationConfig;

pub const FTP_PASSWORD_ENV: &str = "FILEBACK_FTP_PASSWORD";

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub derivation: DerivationConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        user: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_ftp_root")]
        root: String,
    },
}

fn default_ftp_port() -> u16 {
    21
}

fn default_ftp_root() -> String {
    "/".to_string()
}

impl StoreConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: StoreConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.derivation
            .validate()
            .context("Invalid [derivation] section")?;
        match &self.backend {
            BackendConfig::Local { root } => {
                if !root.is_absolute() {
                    anyhow::bail!("local root must be absolute: {}", root.display());
                }
            }
            BackendConfig::Ftp { host, user, .. } => {
                if host.trim().is_empty() {
                    anyhow::bail!("ftp host must not be empty");
                }
                if user.trim().is_empty() {
                    anyhow::bail!("ftp user must not be empty");
                }
            }
        }
        Ok(())
    }
}

/// The configured FTP password, falling back to the environment.
pub fn ftp_password(configured: Option<&str>) -> anyhow::Result<String> {
    if let Some(password) = configured {
        return Ok(password.to_string());
    }
    std::env::var(FTP_PASSWORD_ENV)
        .with_context(|| format!("ftp password not configured and {FTP_PASSWORD_ENV} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_local_config() {
        let toml = r#"
[backend]
kind = "local"
root = "/var/lib/fileback"
"#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.derivation, DerivationConfig::default());
        assert_eq!(
            config.backend,
            BackendConfig::Local {
                root: PathBuf::from("/var/lib/fileback")
            }
        );
    }

    #[test]
    fn test_parse_ftp_config_with_derivation() {
        let toml = r#"
[derivation]
digest_algorithm = "SHA-256"
token_length = 4

[backend]
kind = "ftp"
host = "ftp.example.com"
user = "archive"
"#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.derivation.token_length, 4);
        assert_eq!(config.derivation.delimiter, "/");
        match config.backend {
            BackendConfig::Ftp {
                port,
                password,
                root,
                ..
            } => {
                assert_eq!(port, 21);
                assert_eq!(password, None);
                assert_eq!(root, "/");
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_relative_local_root_rejected() {
        let toml = r#"
[backend]
kind = "local"
root = "data"
"#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_ftp_user_rejected() {
        let toml = r#"
[backend]
kind = "ftp"
host = "ftp.example.com"
user = ""
"#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_derivation_rejected() {
        let toml = r#"
[derivation]
digest_algorithm = "CRC32"

[backend]
kind = "local"
root = "/srv"
"#;
        let config: StoreConfig = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid [derivation] section");
        let chain = format!("{err:#}");
        assert!(chain.contains("CRC32"), "{chain}");
    }

    #[test]
    fn test_unknown_backend_kind() {
        let toml = r#"
[backend]
kind = "s3"
"#;
        assert!(toml::from_str::<StoreConfig>(toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "[backend]\nkind = \"local\"\nroot = \"/srv/fileback\"\n").unwrap();
        let config = StoreConfig::load(&path).unwrap();
        assert!(matches!(config.backend, BackendConfig::Local { .. }));
        assert!(StoreConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_load_errors_keep_their_cause() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let err = StoreConfig::load(&missing).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read"));
        assert!(err.downcast_ref::<std::io::Error>().is_some());

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[backend\nkind = ").unwrap();
        let err = StoreConfig::load(&broken).unwrap_err();
        assert!(err.to_string().starts_with("Failed to parse"));
        assert!(err.downcast_ref::<toml::de::Error>().is_some());
    }

    #[test]
    fn test_configured_password_wins() {
        assert_eq!(ftp_password(Some("secret")).unwrap(), "secret");
    }
}
