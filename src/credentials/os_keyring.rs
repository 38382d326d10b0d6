use super::CredentialError;
use super::CredentialStore;
use super::Credentials;
use super::check;

const SERVICE: &str = "VPNClient";
const PROBE_ACCOUNT: &str = "__vpnclient_probe__";

/// Windows Credential Manager, macOS Keychain or the Secret Service, via `keyring`.
/// Each VPN service name is an account under the `VPNClient` service.
pub struct KeyringStore {
    service: String,
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE)
    }
}

fn backend(e: keyring::Error) -> CredentialError {
    CredentialError::Keyring(e.to_string())
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(&self.service, account).map_err(backend)
    }

    /// Succeeds when the platform store answers a lookup.
    pub fn probe(&self) -> Result<(), CredentialError> {
        match self.entry(PROBE_ACCOUNT)?.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(backend(e)),
        }
    }
}

impl CredentialStore for KeyringStore {
    fn name(&self) -> &'static str {
        "keyring"
    }

    fn store(&self, service: &str, creds: &Credentials) -> Result<(), CredentialError> {
        check(service, creds)?;
        let blob = serde_json::to_string(creds)?;
        self.entry(service)?.set_password(&blob).map_err(backend)
    }

    fn retrieve(&self, service: &str) -> Result<Option<Credentials>, CredentialError> {
        match self.entry(service)?.get_password() {
            Ok(blob) => Ok(Some(serde_json::from_str(&blob)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(backend(e)),
        }
    }

    fn delete(&self, service: &str) -> Result<bool, CredentialError> {
        match self.entry(service)?.delete_credential() {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(backend(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_validates_before_touching_keyring() {
        let store = KeyringStore::default();
        let err = store
            .store("", &Credentials::new("alice", "pw"))
            .unwrap_err();
        assert!(matches!(err, CredentialError::Invalid(_)));
    }

    #[test]
    fn test_keyring_error_mapping() {
        let err = backend(keyring::Error::NoEntry);
        assert!(matches!(err, CredentialError::Keyring(_)));
    }
}
