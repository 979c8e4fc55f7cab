//! Transfer request description

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Compression suffixes recognised in provider file names, longest first.
const COMPRESSION_SUFFIXES: &[&str] = &[".tar.gz", ".tgz", ".zip", ".tar", ".gz", ".bz2", ".rar", ".Z"];

/// What to do when the final target already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExistsPolicy {
    /// Keep the existing file, fetch nothing
    #[default]
    Skip,
    /// Fetch again and replace
    Overwrite,
    /// Move the existing file aside, then fetch
    Backup,
    /// Fail without touching the network
    Error,
}

impl fmt::Display for ExistsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExistsPolicy::Skip => "skip",
            ExistsPolicy::Overwrite => "overwrite",
            ExistsPolicy::Backup => "backup",
            ExistsPolicy::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for ExistsPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ExistsPolicy::Skip),
            "overwrite" => Ok(ExistsPolicy::Overwrite),
            "backup" => Ok(ExistsPolicy::Backup),
            "error" => Ok(ExistsPolicy::Error),
            other => Err(format!(
                "Invalid exists policy '{other}'. Valid: skip, overwrite, backup, error"
            )),
        }
    }
}

/// Credential attached to every request of a transfer, redirects included
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Anonymous
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// HTTP basic auth
    Basic {
        /// User name
        user: String,
        /// Password
        password: String,
    },
    /// Arbitrary header such as `X-API-Key` or `X-Auth-Token`
    Header {
        /// Header name
        name: String,
        /// Header value
        value: String,
    },
}

impl Credential {
    /// Attach the credential to an outgoing request
    pub fn apply(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credential::None => builder,
            Credential::Bearer(token) => builder.bearer_auth(token),
            Credential::Basic { user, password } => builder.basic_auth(user, Some(password)),
            Credential::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Bearer(_) => f.write_str("Bearer(***)"),
            Credential::Basic { user, .. } => write!(f, "Basic({user}:***)"),
            Credential::Header { name, .. } => write!(f, "Header({name}: ***)"),
        }
    }
}

/// Where the bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocator {
    url: String,
    credential: Credential,
    headers: Vec<(String, String)>,
}

impl SourceLocator {
    /// Anonymous source
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credential: Credential::None,
            headers: Vec::new(),
        }
    }

    /// Attach a credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Attach an extra header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Initial URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current credential
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Extra headers
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn replace_credential(&mut self, credential: Credential) {
        self.credential = credential;
    }
}

/// One file to fetch; consumed by [`super::TransferEngine::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    target_path: PathBuf,
    source: SourceLocator,
    compression: Option<String>,
    exists_policy: ExistsPolicy,
    expected_name: Option<String>,
    expected_size: Option<u64>,
    expected_sha256: Option<String>,
    label: String,
}

impl TransferRequest {
    /// Fetch `source` into `target_path`
    pub fn new(target_path: impl Into<PathBuf>, source: SourceLocator) -> Self {
        Self {
            target_path: target_path.into(),
            source,
            compression: None,
            exists_policy: ExistsPolicy::default(),
            expected_name: None,
            expected_size: None,
            expected_sha256: None,
            label: String::new(),
        }
    }

    /// The body is an archive with this extension (".zip", ".tar.gz", ...)
    pub fn with_compression(mut self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        self.compression = Some(if suffix.starts_with('.') { suffix } else { format!(".{suffix}") });
        self
    }

    /// Existing-target policy
    pub fn with_exists_policy(mut self, policy: ExistsPolicy) -> Self {
        self.exists_policy = policy;
        self
    }

    /// Name the unpacked product should carry
    pub fn with_expected_name(mut self, name: impl Into<String>) -> Self {
        self.expected_name = Some(name.into());
        self
    }

    /// Byte length the streamed body must have
    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Hex SHA-256 the streamed body must have
    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into().to_lowercase());
        self
    }

    /// Tag used in logs and metrics, usually the provider name
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Final path of the product
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// Source locator
    pub fn source(&self) -> &SourceLocator {
        &self.source
    }

    /// Expected compression extension
    pub fn compression(&self) -> Option<&str> {
        self.compression.as_deref()
    }

    /// Existing-target policy
    pub fn exists_policy(&self) -> ExistsPolicy {
        self.exists_policy
    }

    /// Name expected after unpacking; defaults to the target file name
    pub fn expected_name(&self) -> Option<String> {
        self.expected_name.clone().or_else(|| {
            self.target_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
    }

    /// Expected body size
    pub fn expected_size(&self) -> Option<u64> {
        self.expected_size
    }

    /// Expected body digest
    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }

    /// Log/metrics label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Where the streamed body lands before unpacking
    pub fn download_path(&self) -> PathBuf {
        match &self.compression {
            Some(suffix) => append_to_file_name(&self.target_path, suffix),
            None => self.target_path.clone(),
        }
    }

    pub(crate) fn source_mut(&mut self) -> &mut SourceLocator {
        &mut self.source
    }
}

/// Append `suffix` to the last path component
pub fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Compression suffix of a file name, if it has a known one
pub fn compression_suffix(name: &str) -> Option<&'static str> {
    COMPRESSION_SUFFIXES.iter().copied().find(|suffix| name.ends_with(suffix))
}

/// File name without its compression suffix
pub fn strip_compression_suffix(name: &str) -> &str {
    match compression_suffix(name) {
        Some(suffix) => &name[..name.len() - suffix.len()],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exists_policy_parse() {
        assert_eq!("skip".parse::<ExistsPolicy>().unwrap(), ExistsPolicy::Skip);
        assert_eq!("Backup".parse::<ExistsPolicy>().unwrap(), ExistsPolicy::Backup);
        assert!("replace".parse::<ExistsPolicy>().is_err());
        assert_eq!(ExistsPolicy::Overwrite.to_string(), "overwrite");
    }

    #[test]
    fn test_compression_suffix() {
        assert_eq!(compression_suffix("a.tar.gz"), Some(".tar.gz"));
        assert_eq!(compression_suffix("a.tgz"), Some(".tgz"));
        assert_eq!(compression_suffix("S2A.zip"), Some(".zip"));
        assert_eq!(compression_suffix("data.nc"), None);
        assert_eq!(strip_compression_suffix("LC08_L1TP.tar"), "LC08_L1TP");
        assert_eq!(strip_compression_suffix("plain"), "plain");
    }

    #[test]
    fn test_download_path_and_expected_name() {
        let request = TransferRequest::new("/data/S2A_MSIL1C", SourceLocator::new("http://x"))
            .with_compression("zip");
        assert_eq!(request.compression(), Some(".zip"));
        assert_eq!(request.download_path(), PathBuf::from("/data/S2A_MSIL1C.zip"));
        assert_eq!(request.expected_name().as_deref(), Some("S2A_MSIL1C"));

        let plain = TransferRequest::new("/data/file.nc", SourceLocator::new("http://x"));
        assert_eq!(plain.download_path(), PathBuf::from("/data/file.nc"));
    }

    #[test]
    fn test_credential_debug_hides_secrets() {
        let credential = Credential::Basic {
            user: "alice".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
