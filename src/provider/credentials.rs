//! Credential store keyed by host
//!
//! [`NetrcCredentials`] reads the standard `.netrc` format:
//!
//! ```text
//! machine dataspace.copernicus.eu login alice password s3cret
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Credential lookup errors
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// No entry for the host
    #[error("no credentials for host '{host}' in {source_name}")]
    Missing {
        /// Host looked up
        host: String,
        /// Where we looked
        source_name: String,
    },

    /// Store exists but cannot be read
    #[error("cannot read credential store {path}: {message}")]
    Unreadable {
        /// Store path
        path: String,
        /// Reason
        message: String,
    },
}

/// User name and secret for one host
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login
    pub user: String,
    /// Password, token or API key
    pub secret: String,
}

impl Credentials {
    /// Build a pair
    pub fn new(user: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("secret", &"***")
            .finish()
    }
}

/// Source of credentials keyed by host
pub trait CredentialProvider: Send + Sync {
    /// Credentials stored for `host`
    fn credentials(&self, host: &str) -> Result<Credentials, CredentialError>;
}

/// `.netrc` backed store
#[derive(Debug, Clone, Default)]
pub struct NetrcCredentials {
    path: PathBuf,
    machines: HashMap<String, Credentials>,
    fallback: Option<Credentials>,
}

impl NetrcCredentials {
    /// Load `$NETRC`, or `~/.netrc`; a missing file yields an empty store
    pub fn from_env() -> Result<Self, CredentialError> {
        match netrc_path(std::env::var_os("NETRC"), dirs::home_dir()) {
            Some(path) => Self::from_path(&path),
            None => {
                warn!("NETRC is unset and no home directory was found, credential store is empty");
                Ok(Self::default())
            }
        }
    }

    /// Load a specific file; a missing file yields an empty store
    pub fn from_path(path: &Path) -> Result<Self, CredentialError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let mut store = Self::parse(&content);
                store.path = path.to_path_buf();
                debug!(path = %path.display(), machines = store.machines.len(), "Loaded netrc");
                Ok(store)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self {
                path: path.to_path_buf(),
                ..Self::default()
            }),
            Err(e) => Err(CredentialError::Unreadable {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Parse netrc content
    pub fn parse(content: &str) -> Self {
        let mut store = Self::default();
        let mut tokens = content.split_whitespace().peekable();
        let mut current: Option<Option<String>> = None;
        let mut login = None;
        let mut password = None;

        let flush = |store: &mut Self,
                     current: &mut Option<Option<String>>,
                     login: &mut Option<String>,
                     password: &mut Option<String>| {
            if let Some(machine) = current.take() {
                let credentials =
                    Credentials::new(login.take().unwrap_or_default(), password.take().unwrap_or_default());
                match machine {
                    Some(host) => {
                        store.machines.insert(host, credentials);
                    }
                    None => store.fallback = Some(credentials),
                }
            }
            *login = None;
            *password = None;
        };

        while let Some(token) = tokens.next() {
            match token {
                "machine" => {
                    flush(&mut store, &mut current, &mut login, &mut password);
                    current = Some(tokens.next().map(str::to_string));
                }
                "default" => {
                    flush(&mut store, &mut current, &mut login, &mut password);
                    current = Some(None);
                }
                "login" => login = tokens.next().map(str::to_string),
                "password" => password = tokens.next().map(str::to_string),
                "account" => {
                    tokens.next();
                }
                "macdef" => {
                    // Macro bodies run to the end of the file in whitespace-split form.
                    flush(&mut store, &mut current, &mut login, &mut password);
                    break;
                }
                _ => {}
            }
        }
        flush(&mut store, &mut current, &mut login, &mut password);
        store
    }

    /// Hosts with an entry
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.machines.keys().map(String::as_str)
    }
}

impl CredentialProvider for NetrcCredentials {
    fn credentials(&self, host: &str) -> Result<Credentials, CredentialError> {
        self.machines
            .get(host)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                host: host.to_string(),
                source_name: self.path.display().to_string(),
            })
    }
}

/// In-memory store, for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, Credentials>,
}

impl StaticCredentials {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry
    pub fn with(mut self, host: impl Into<String>, user: impl Into<String>, secret: impl Into<String>) -> Self {
        self.entries.insert(host.into(), Credentials::new(user, secret));
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, host: &str) -> Result<Credentials, CredentialError> {
        self.entries
            .get(host)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                host: host.to_string(),
                source_name: "static credentials".to_string(),
            })
    }
}

/// `$NETRC` when set, else `.netrc` in the home directory
fn netrc_path(netrc: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    netrc
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .or_else(|| home.map(|home| home.join(".netrc")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netrc_path_resolution() {
        let home = Some(PathBuf::from("/home/alice"));
        assert_eq!(
            netrc_path(Some(OsString::from("/etc/eo.netrc")), home.clone()),
            Some(PathBuf::from("/etc/eo.netrc"))
        );
        assert_eq!(netrc_path(None, home.clone()), Some(PathBuf::from("/home/alice/.netrc")));
        assert_eq!(netrc_path(Some(OsString::new()), home), Some(PathBuf::from("/home/alice/.netrc")));
        // Never falls back to the working directory
        assert_eq!(netrc_path(None, None), None);
    }

    #[test]
    fn test_parse_netrc() {
        let store = NetrcCredentials::parse(
            "machine dataspace.copernicus.eu login alice password s3cret\n\
             machine usgs.gov\n  login bob\n  password tok3n\n",
        );
        let cdse = store.credentials("dataspace.copernicus.eu").unwrap();
        assert_eq!(cdse, Credentials::new("alice", "s3cret"));
        assert_eq!(store.credentials("usgs.gov").unwrap().secret, "tok3n");
        assert!(matches!(
            store.credentials("theia.cnes.fr"),
            Err(CredentialError::Missing { .. })
        ));
    }

    #[test]
    fn test_default_entry_and_account() {
        let store = NetrcCredentials::parse(
            "machine a login u password p account acct\ndefault login anon password guest",
        );
        assert_eq!(store.credentials("a").unwrap().user, "u");
        assert_eq!(store.credentials("anything").unwrap().user, "anon");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = NetrcCredentials::from_path(&dir.path().join("absent")).unwrap();
        assert_eq!(store.hosts().count(), 0);
        let err = store.credentials("usgs.gov").unwrap_err();
        assert!(err.to_string().contains("usgs.gov"));
    }

    #[test]
    fn test_debug_hides_secret() {
        let rendered = format!("{:?}", Credentials::new("alice", "s3cret"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn test_static_credentials() {
        let store = StaticCredentials::new().with("geodes.cnes.fr", "", "api-key");
        assert_eq!(store.credentials("geodes.cnes.fr").unwrap().secret, "api-key");
        assert!(store.credentials("other").is_err());
    }
}
