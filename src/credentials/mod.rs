//! Saved VPN credentials.
//!
//! The OS secret store is preferred; an encrypted directory is used where no
//! keyring is reachable (Android, headless Linux without Secret Service).

mod file;
mod os_keyring;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

pub use self::file::FileStore;
pub use self::os_keyring::KeyringStore;
use crate::config::CredentialBackend;
use crate::config::CredentialsConfig;
use crate::platform::Platform;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid credentials: {0}")]
    Invalid(String),
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed credential record: {0}")]
    Format(#[from] serde_json::Error),
    #[error("credential decryption failed for {0}")]
    Decrypt(String),
    #[error("credential key error: {0}")]
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            extra: BTreeMap::new(),
        }
    }
}

fn check(service: &str, creds: &Credentials) -> Result<(), CredentialError> {
    if service.trim().is_empty() {
        return Err(CredentialError::Invalid("empty service name".into()));
    }
    if creds.username.is_empty() || creds.password.is_empty() {
        return Err(CredentialError::Invalid(
            "username and password are required".into(),
        ));
    }
    Ok(())
}

pub trait CredentialStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn store(&self, service: &str, creds: &Credentials) -> Result<(), CredentialError>;

    fn retrieve(&self, service: &str) -> Result<Option<Credentials>, CredentialError>;

    /// Returns false when nothing was stored under `service`.
    fn delete(&self, service: &str) -> Result<bool, CredentialError>;
}

/// `~/.vpnclient`, the fallback location for encrypted credentials.
pub fn default_file_store_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vpnclient")
}

fn file_store(config: &CredentialsConfig) -> Box<dyn CredentialStore> {
    let dir = config.dir.clone().unwrap_or_else(default_file_store_dir);
    Box::new(FileStore::new(dir))
}

pub fn open_store(config: &CredentialsConfig) -> Box<dyn CredentialStore> {
    match config.backend {
        CredentialBackend::File => file_store(config),
        CredentialBackend::Keyring => Box::new(KeyringStore::default()),
        CredentialBackend::Auto => {
            if Platform::current() == Platform::Android {
                return file_store(config);
            }

            let keyring = KeyringStore::default();
            match keyring.probe() {
                Ok(()) => Box::new(keyring),
                Err(e) => {
                    warn!(
                        "System keyring unavailable ({}), using encrypted file store",
                        e
                    );
                    file_store(config)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_rejects_empty_fields() {
        let creds = Credentials::new("user", "pass");
        assert!(check("office", &creds).is_ok());
        assert!(matches!(
            check("  ", &creds),
            Err(CredentialError::Invalid(_))
        ));
        assert!(check("office", &Credentials::new("", "pass")).is_err());
        assert!(check("office", &Credentials::new("user", "")).is_err());
    }

    #[test]
    fn test_credentials_json_shape() {
        let mut creds = Credentials::new("alice", "s3cret");
        let json = serde_json::to_string(&creds).unwrap();
        assert_eq!(json, r#"{"username":"alice","password":"s3cret"}"#);

        creds.extra.insert("psk".into(), "shared".into());
        let json = serde_json::to_string(&creds).unwrap();
        let back: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(back.extra.get("psk").map(String::as_str), Some("shared"));
    }

    #[test]
    fn test_open_store_forced_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = CredentialsConfig {
            backend: CredentialBackend::File,
            dir: Some(temp.path().to_path_buf()),
        };
        let store = open_store(&config);
        assert_eq!(store.name(), "file");

        store
            .store("office", &Credentials::new("alice", "pw"))
            .unwrap();
        assert_eq!(
            store.retrieve("office").unwrap(),
            Some(Credentials::new("alice", "pw"))
        );
    }

    #[test]
    fn test_open_store_forced_keyring() {
        let config = CredentialsConfig {
            backend: CredentialBackend::Keyring,
            dir: None,
        };
        assert_eq!(open_store(&config).name(), "keyring");
    }
}
