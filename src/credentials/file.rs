use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::Key;
use chacha20poly1305::Nonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::AeadCore;
use chacha20poly1305::aead::KeyInit;
use chacha20poly1305::aead::OsRng;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;

use super::CredentialError;
use super::CredentialStore;
use super::Credentials;
use super::check;

const KEY_FILE: &str = ".key";
const NONCE_LEN: usize = 12;

/// Credentials encrypted with ChaCha20-Poly1305 under a per-directory key.
pub struct FileStore {
    dir: PathBuf,
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, service: &str) -> PathBuf {
        let digest = Sha256::digest(service.as_bytes());
        self.dir.join(hex::encode(digest))
    }

    fn read_key(&self) -> Result<Option<ChaCha20Poly1305>, CredentialError> {
        let key_path = self.dir.join(KEY_FILE);
        if !key_path.exists() {
            return Ok(None);
        }

        let encoded = fs::read_to_string(&key_path)?;
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CredentialError::Key(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CredentialError::Key(format!(
                "expected 32 bytes, found {}",
                bytes.len()
            )));
        }
        Ok(Some(ChaCha20Poly1305::new(Key::from_slice(&bytes))))
    }

    /// Only the first store creates the key; reads never do.
    fn read_or_create_key(&self) -> Result<ChaCha20Poly1305, CredentialError> {
        if let Some(cipher) = self.read_key()? {
            return Ok(cipher);
        }

        crate::platform::ensure_dir(&self.dir)?;
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        write_private(&self.dir.join(KEY_FILE), STANDARD.encode(key).as_bytes())?;
        debug!("Created credential key in {}", self.dir.display());
        Ok(ChaCha20Poly1305::new(&key))
    }
}

impl CredentialStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn store(&self, service: &str, creds: &Credentials) -> Result<(), CredentialError> {
        check(service, creds)?;
        let cipher = self.read_or_create_key()?;

        let plaintext = serde_json::to_vec(creds)?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CredentialError::Decrypt(service.to_string()))?;

        let mut record = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&nonce);
        record.extend_from_slice(&ciphertext);
        write_private(&self.entry_path(service), &record)?;
        Ok(())
    }

    fn retrieve(&self, service: &str) -> Result<Option<Credentials>, CredentialError> {
        let path = self.entry_path(service);
        if !path.exists() {
            return Ok(None);
        }

        let record = fs::read(&path)?;
        if record.len() <= NONCE_LEN {
            return Err(CredentialError::Decrypt(service.to_string()));
        }
        let (nonce, ciphertext) = record.split_at(NONCE_LEN);

        let cipher = self.read_key()?.ok_or_else(|| {
            CredentialError::Key(format!(
                "{} is missing, stored credentials cannot be read",
                self.dir.join(KEY_FILE).display()
            ))
        })?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt(service.to_string()))?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn delete(&self, service: &str) -> Result<bool, CredentialError> {
        let path = self.entry_path(service);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}
