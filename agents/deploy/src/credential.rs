//! Saved SSH passwords: OS keyring first, encrypted file as fallback.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto;

pub const KEYRING_SERVICE: &str = "deploy-agent";
const APP_DIR: &str = "deploy-agent";
const FILE_NAME: &str = "credentials.json";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no saved password for {0}")]
    NotFound(String),
    #[error("keyring: {keyring}; file: {file}")]
    AllBackendsFailed { keyring: String, file: String },
}

/// A place a password can be kept under an account key.
pub trait SecretBackend: Send + Sync {
    fn get(&self, account: &str) -> Result<String>;
    fn set(&self, account: &str, password: &str) -> Result<()>;
}

pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, account: &str) -> Result<String> {
        let entry = keyring::Entry::new(&self.service, account)?;
        Ok(entry.get_password()?)
    }

    fn set(&self, account: &str, password: &str) -> Result<()> {
        let entry = keyring::Entry::new(&self.service, account)?;
        entry.set_password(password)?;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    /// account -> hex(nonce || ciphertext)
    #[serde(default)]
    credentials: BTreeMap<String, String>,
}

/// JSON file of encrypted passwords.
pub struct FileBackend {
    path: PathBuf,
    key: [u8; 32],
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            key: crypto::derive_key(),
        }
    }

    /// `%APPDATA%\deploy-agent\credentials.json` on Windows,
    /// `~/.config/deploy-agent/credentials.json` elsewhere.
    pub fn default_path() -> Result<PathBuf> {
        let base = if cfg!(windows) {
            dirs::config_dir()
        } else {
            dirs::home_dir().map(|home| home.join(".config"))
        };
        let base = base.context("cannot locate the user config directory")?;
        Ok(base.join(APP_DIR).join(FILE_NAME))
    }

    fn read(&self) -> Result<CredentialFile> {
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read credential file {}", self.path.display()))?;
        serde_json::from_str(&data).context("parse credential file")
    }

    /// Current contents, or an empty file when there is nothing usable.
    fn read_or_empty(&self) -> CredentialFile {
        match self.read() {
            Ok(file) => file,
            Err(e) if is_not_found(&e) => CredentialFile::default(),
            Err(e) => {
                warn!(path = %self.path.display(), "replacing unreadable credential file: {:#}", e);
                CredentialFile::default()
            }
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

impl SecretBackend for FileBackend {
    fn get(&self, account: &str) -> Result<String> {
        let file = self.read()?;
        let Some(sealed) = file.credentials.get(account) else {
            bail!("account {:?} not found", account);
        };
        let sealed = hex::decode(sealed).context("decode")?;
        let plain = crypto::decrypt(&sealed, &self.key).context("decrypt")?;
        String::from_utf8(plain).context("password is not UTF-8")
    }

    fn set(&self, account: &str, password: &str) -> Result<()> {
        let mut file = self.read_or_empty();
        let sealed = crypto::encrypt(password.as_bytes(), &self.key).context("encrypt")?;
        file.credentials
            .insert(account.to_string(), hex::encode(sealed));

        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)?;
        }
        let data = serde_json::to_string_pretty(&file)?;
        write_private_file(&self.path, data.as_bytes())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("mkdir {}", dir.display()))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("mkdir {}", dir.display()))
}

/// Write through a temp file in the same directory, then rename over
/// `path`, so readers see either the old file or the new one.
fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Reads try the keyring, then the file. Writes go to both and succeed
/// when either one accepts.
pub struct CredentialStore {
    keyring: Box<dyn SecretBackend>,
    file: Box<dyn SecretBackend>,
}

impl CredentialStore {
    pub fn new(keyring: Box<dyn SecretBackend>, file: Box<dyn SecretBackend>) -> Self {
        Self { keyring, file }
    }

    /// Keyring under the `deploy-agent` service plus the per-user file.
    pub fn system() -> Result<Self> {
        Ok(Self::new(
            Box::new(KeyringBackend::new(KEYRING_SERVICE)),
            Box::new(FileBackend::new(FileBackend::default_path()?)),
        ))
    }

    pub fn get(&self, account: &str) -> Result<String, CredentialError> {
        match self.keyring.get(account) {
            Ok(pw) if !pw.is_empty() => return Ok(pw),
            Ok(_) => debug!(%account, "keyring entry empty"),
            Err(e) => debug!(%account, "keyring lookup failed: {:#}", e),
        }
        match self.file.get(account) {
            Ok(pw) if !pw.is_empty() => Ok(pw),
            Ok(_) => Err(CredentialError::NotFound(account.to_string())),
            Err(e) => {
                debug!(%account, "credential file lookup failed: {:#}", e);
                Err(CredentialError::NotFound(account.to_string()))
            }
        }
    }

    pub fn set(&self, account: &str, password: &str) -> Result<(), CredentialError> {
        let keyring = self.keyring.set(account, password);
        let file = self.file.set(account, password);
        match (keyring, file) {
            (Err(k), Err(f)) => Err(CredentialError::AllBackendsFailed {
                keyring: format!("{:#}", k),
                file: format!("{:#}", f),
            }),
            (k, f) => {
                if let Err(e) = k {
                    debug!(%account, "keyring write failed: {:#}", e);
                }
                if let Err(e) = f {
                    debug!(%account, "credential file write failed: {:#}", e);
                }
                Ok(())
            }
        }
    }
}
