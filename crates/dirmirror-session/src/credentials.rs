//! Opaque credentials for the remote endpoint
//!
//! Credentials are handed to the session once and only read by
//! `RemoteTransport::connect`. They never show up in `Debug` output, and the
//! secret material is wiped when the value is dropped.

use dirmirror_types::{Error, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Environment variable holding the remote user name
pub const USERNAME_VAR: &str = "DIRMIRROR_USERNAME";
/// Environment variable holding the remote password
pub const PASSWORD_VAR: &str = "DIRMIRROR_PASSWORD";
/// Environment variable holding the private key path
pub const IDENTITY_FILE_VAR: &str = "DIRMIRROR_IDENTITY_FILE";

/// Authentication material for one remote endpoint
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
    #[zeroize(skip)]
    identity_file: Option<PathBuf>,
}

impl Credentials {
    /// Credentials carrying nothing, for transports that need none
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Credentials for `username`
    pub fn for_user<S: Into<String>>(username: S) -> Self {
        Self {
            username: Some(username.into()),
            password: None,
            identity_file: None,
        }
    }

    /// Attach a password
    pub fn with_password<S: Into<String>>(mut self, password: S) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Attach a private key file
    pub fn with_identity_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// The user name, if any
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The password, if any
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// The private key file, if any
    pub fn identity_file(&self) -> Option<&Path> {
        self.identity_file.as_deref()
    }

    /// Whether no authentication material is present
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none() && self.password.is_none() && self.identity_file.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// Source of credentials for the session
pub trait CredentialProvider: Send + Sync {
    /// Produce the credentials to connect with
    fn credentials(&self) -> Result<Credentials>;
}

/// Provider returning a fixed set of credentials
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    /// Wrap `credentials`
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Provider reading `DIRMIRROR_USERNAME`, `DIRMIRROR_PASSWORD` and
/// `DIRMIRROR_IDENTITY_FILE`, falling back to configured defaults
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider {
    default_username: Option<String>,
    default_identity_file: Option<PathBuf>,
}

impl EnvCredentialProvider {
    /// Create a provider with no fallbacks
    pub fn new() -> Self {
        Self::default()
    }

    /// User name used when the environment does not supply one
    pub fn with_default_username<S: Into<String>>(mut self, username: Option<S>) -> Self {
        self.default_username = username.map(Into::into);
        self
    }

    /// Key file used when the environment does not supply one
    pub fn with_default_identity_file<P: Into<PathBuf>>(mut self, path: Option<P>) -> Self {
        self.default_identity_file = path.map(Into::into);
        self
    }

    fn var(name: &str) -> Result<Option<String>> {
        match std::env::var(name) {
            Ok(value) if value.is_empty() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(std::env::VarError::NotUnicode(_)) => {
                Err(Error::config(format!("{} is not valid UTF-8", name)))
            }
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Result<Credentials> {
        let mut credentials = Credentials::anonymous();
        credentials.username = Self::var(USERNAME_VAR)?.or_else(|| self.default_username.clone());
        credentials.password = Self::var(PASSWORD_VAR)?;
        credentials.identity_file = Self::var(IDENTITY_FILE_VAR)?
            .map(PathBuf::from)
            .or_else(|| self.default_identity_file.clone());
        Ok(credentials)
    }
}
