//! Login/secret authentication for encrypted connections.
//!
//! Credentials are looked up on every call so that secrets rotated in the
//! underlying source take effect without a restart.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthenticationOutcome {
    Ok,
    NoSuchUser,
    BadSecret,
    UnknownError,
}

impl AuthenticationOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AuthenticationOutcome::Ok)
    }
}

/// Snapshot of one login's expected secret.
pub struct Credential {
    pub login: String,
    pub secret: Zeroizing<String>,
}

/// Where credentials come from.
pub trait CredentialSource: Send + Sync + 'static {
    fn lookup(&self, login: &str) -> Result<Option<Credential>>;

    /// Human readable location for diagnostics.
    fn describe(&self) -> String;
}

/// `login=secret` file, re-read on every lookup. Blank lines and lines
/// starting with `#` are ignored.
pub struct PasswordFile {
    path: PathBuf,
}

impl PasswordFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl CredentialSource for PasswordFile {
    fn lookup(&self, login: &str) -> Result<Option<Credential>> {
        let content = Zeroizing::new(fs::read_to_string(&self.path)?);

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (user, secret) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!(
                    "Malformed entry at {}:{}",
                    self.path.display(),
                    number + 1
                ))
            })?;
            if user.trim() == login {
                return Ok(Some(Credential {
                    login: login.to_string(),
                    secret: Zeroizing::new(secret.trim().to_string()),
                }));
            }
        }
        Ok(None)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory credentials; entries may be replaced at any time.
#[derive(Default)]
pub struct StaticCredentials {
    entries: RwLock<HashMap<String, String>>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, login: &str, secret: &str) -> Self {
        self.set(login, secret);
        self
    }

    pub fn set(&self, login: &str, secret: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(login.to_string(), secret.to_string());
        }
    }

    pub fn remove(&self, login: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(login);
        }
    }
}

impl CredentialSource for StaticCredentials {
    fn lookup(&self, login: &str) -> Result<Option<Credential>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| Error::Config("credential map lock poisoned".to_string()))?;
        Ok(entries.get(login).map(|secret| Credential {
            login: login.to_string(),
            secret: Zeroizing::new(secret.clone()),
        }))
    }

    fn describe(&self) -> String {
        "in-memory credentials".to_string()
    }
}

pub struct CredentialStore {
    source: Box<dyn CredentialSource>,
}

impl CredentialStore {
    pub fn new(source: impl CredentialSource) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub fn from_password_file(path: impl AsRef<Path>) -> Self {
        Self::new(PasswordFile::new(path))
    }

    pub fn source(&self) -> String {
        self.source.describe()
    }

    /// Checks `secret` against the current value stored for `login`.
    /// Lookup failures are reported as [`AuthenticationOutcome::UnknownError`].
    pub fn authenticate(&self, login: &str, secret: &str) -> AuthenticationOutcome {
        let credential = match self.source.lookup(login) {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!(login, "Authentication failed: no such user");
                return AuthenticationOutcome::NoSuchUser;
            }
            Err(e) => {
                warn!(
                    login,
                    source = %self.source.describe(),
                    error = %e,
                    "Unable to retrieve secret for THL login"
                );
                return AuthenticationOutcome::UnknownError;
            }
        };

        if bool::from(credential.secret.as_bytes().ct_eq(secret.as_bytes())) {
            AuthenticationOutcome::Ok
        } else {
            debug!(login = %credential.login, "Authentication failed: bad secret");
            AuthenticationOutcome::BadSecret
        }
    }
}
