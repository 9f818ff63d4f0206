//! SSH known_hosts support (OpenSSH format).
//!
//! A [`KnownHosts`] store classifies a server's host key as trusted,
//! revoked, accepted once, or unknown. Only [`HostKeyStatus::Trusted`] and
//! [`HostKeyStatus::AcceptOnce`] let a connection proceed.
//!
//! # Format
//!
//! Each line in a known_hosts file has the format:
//! ```text
//! [@revoked] hostnames keytype base64-key [comment]
//! ```
//!
//! Hostnames can be:
//! - Standard: `example.com` or `[example.com]:2222`
//! - Hashed: `|1|salt|hash` (HMAC-SHA1 hashed hostname)
//! - Wildcard: `*.example.com`
//! - Multiple: `host1,host2,host3`
//! - Negated: `*.example.com,!bad.example.com`
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::known_hosts::{HostKeyStatus, KnownHosts};
//! use keygate_proto::ssh::privatekey::PrivateKey;
//!
//! let key = PrivateKey::generate("host").public_key();
//! let known_hosts = KnownHosts::parse(&format!("example.com {}", key.to_openssh())).unwrap();
//!
//! assert_eq!(known_hosts.classify("example.com", 22, &key), HostKeyStatus::Trusted);
//! assert_eq!(known_hosts.classify("other.com", 22, &key), HostKeyStatus::Unknown);
//! ```

use crate::ssh::privatekey::PublicKey;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use keygate_platform::{KeygateError, KeygateResult};
use sha1::Sha1;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

const REVOKED_MARKER: &str = "@revoked";

/// Host key verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Host key is listed as trusted for this host.
    Trusted,
    /// Host key is revoked. Always fails closed.
    Revoked,
    /// Host key is not trusted long term but may be used for this connection.
    AcceptOnce,
    /// No entry vouches for this key.
    Unknown,
}

/// A single known_hosts entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHost {
    /// Hostname patterns. `None` matches every host.
    patterns: Option<String>,
    key: PublicKey,
    comment: String,
}

impl KnownHost {
    /// Creates an entry for the given patterns.
    pub fn new(patterns: impl Into<String>, key: PublicKey) -> Self {
        Self {
            patterns: Some(patterns.into()),
            key,
            comment: String::new(),
        }
    }

    /// Creates an entry that matches every host.
    pub fn any_host(key: PublicKey) -> Self {
        Self {
            patterns: None,
            key,
            comment: String::new(),
        }
    }

    /// Returns the hostname patterns, if any.
    pub fn patterns(&self) -> Option<&str> {
        self.patterns.as_deref()
    }

    /// Returns the host key.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this entry matches a hostname and port.
    ///
    /// A negated pattern that matches excludes the host even when another
    /// pattern on the same line matches it.
    pub fn matches(&self, hostname: &str, port: u16) -> bool {
        let patterns = match &self.patterns {
            Some(p) => p,
            None => return true,
        };
        let full_host = host_token(hostname, port);

        let mut matched = false;
        for pattern in patterns.split(',') {
            let pattern = pattern.trim();
            if let Some(negated) = pattern.strip_prefix('!') {
                if matches_pattern(negated, &full_host) {
                    return false;
                }
            } else if matches_pattern(pattern, &full_host) {
                matched = true;
            }
        }
        matched
    }

    /// Parses a single known_hosts line.
    ///
    /// Returns the entry and whether it carries the `@revoked` marker.
    pub fn parse_line(line: &str) -> KeygateResult<(Self, bool)> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(KeygateError::Config("Empty or comment line".to_string()));
        }

        let mut parts: Vec<&str> = line.split_whitespace().collect();
        let revoked = match parts.first() {
            Some(&marker) if marker == REVOKED_MARKER => {
                parts.remove(0);
                true
            }
            Some(marker) if marker.starts_with('@') => {
                return Err(KeygateError::Config(format!(
                    "Unsupported known_hosts marker: {}",
                    marker
                )))
            }
            _ => false,
        };

        if parts.len() < 3 {
            return Err(KeygateError::Config(
                "Invalid known_hosts line: too few fields (need at least 3)".to_string(),
            ));
        }

        let key = PublicKey::parse_openssh(&format!("{} {}", parts[1], parts[2]))?;
        Ok((
            Self {
                patterns: Some(parts[0].to_string()),
                key,
                comment: parts[3..].join(" "),
            },
            revoked,
        ))
    }
}

/// Formats a host the way known_hosts stores it.
fn host_token(hostname: &str, port: u16) -> String {
    if port == 22 {
        hostname.to_string()
    } else {
        format!("[{}]:{}", hostname, port)
    }
}

/// Matches a single pattern against a hostname.
fn matches_pattern(pattern: &str, hostname: &str) -> bool {
    if pattern.starts_with("|1|") {
        return verify_hashed_hostname(pattern, hostname);
    }
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(pattern, hostname);
    }
    pattern.eq_ignore_ascii_case(hostname)
}

/// Verifies a hashed hostname `|1|salt|hash`, where
/// hash = Base64(HMAC-SHA1(salt, hostname)).
fn verify_hashed_hostname(hashed: &str, hostname: &str) -> bool {
    let parts: Vec<&str> = hashed.split('|').collect();
    if parts.len() != 4 || !parts[0].is_empty() || parts[1] != "1" {
        return false;
    }

    let (salt, expected) = match (STANDARD.decode(parts[2]), STANDARD.decode(parts[3])) {
        (Ok(salt), Ok(expected)) => (salt, expected),
        _ => return false,
    };

    let mut hmac = match HmacSha1::new_from_slice(&salt) {
        Ok(h) => h,
        Err(_) => return false,
    };
    hmac.update(hostname.as_bytes());
    let computed = hmac.finalize().into_bytes();

    computed.as_slice().ct_eq(&expected).into()
}

/// Wildcard matching: `*` matches any run of characters, `?` exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p].eq_ignore_ascii_case(&text[t])) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// A host key given either as an OpenSSH public key line or as a parsed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeySpec {
    /// `ssh-ed25519 AAAA... [comment]`
    Bytes(Vec<u8>),
    /// Parsed key
    Key(PublicKey),
}

impl HostKeySpec {
    /// Resolves the spec into a key. Unparseable bytes are a config error.
    pub fn load(&self) -> KeygateResult<PublicKey> {
        match self {
            HostKeySpec::Key(key) => Ok(*key),
            HostKeySpec::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    KeygateError::Config("Host key is not valid UTF-8".to_string())
                })?;
                PublicKey::parse_openssh(text)
            }
        }
    }
}

impl From<PublicKey> for HostKeySpec {
    fn from(key: PublicKey) -> Self {
        HostKeySpec::Key(key)
    }
}

impl From<Vec<u8>> for HostKeySpec {
    fn from(bytes: Vec<u8>) -> Self {
        HostKeySpec::Bytes(bytes)
    }
}

impl From<&str> for HostKeySpec {
    fn from(line: &str) -> Self {
        HostKeySpec::Bytes(line.as_bytes().to_vec())
    }
}

/// Where the client gets its known hosts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnownHostsSource {
    /// Skip host key verification entirely.
    Disabled,
    /// An OpenSSH known_hosts file. A missing file is an empty store.
    Path(PathBuf),
    /// The contents of a known_hosts file.
    Bytes(Vec<u8>),
    /// Keys trusted for any host.
    Keys(Vec<HostKeySpec>),
    /// Explicit trusted, revoked and accept-once sets.
    Triple {
        /// Trusted keys
        trusted: Vec<HostKeySpec>,
        /// Revoked keys
        revoked: Vec<HostKeySpec>,
        /// Keys accepted for this connection only
        accept_once: Vec<HostKeySpec>,
    },
}

impl KnownHostsSource {
    /// Builds the store. `Ok(None)` means verification is disabled.
    pub fn load(&self) -> KeygateResult<Option<Arc<KnownHosts>>> {
        let load_all = |specs: &[HostKeySpec]| -> KeygateResult<Vec<PublicKey>> {
            specs.iter().map(HostKeySpec::load).collect()
        };

        let store = match self {
            KnownHostsSource::Disabled => return Ok(None),
            KnownHostsSource::Path(path) => KnownHosts::from_file(path)?,
            KnownHostsSource::Bytes(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| {
                    KeygateError::Config("known_hosts data is not valid UTF-8".to_string())
                })?;
                KnownHosts::parse(text)?
            }
            KnownHostsSource::Keys(keys) => KnownHosts::from_keys(load_all(keys)?),
            KnownHostsSource::Triple {
                trusted,
                revoked,
                accept_once,
            } => KnownHosts::from_triple(
                load_all(trusted)?,
                load_all(revoked)?,
                load_all(accept_once)?,
            ),
        };
        Ok(Some(Arc::new(store)))
    }
}

impl Default for KnownHostsSource {
    /// `~/.ssh/known_hosts`, or an empty store when there is no home directory.
    fn default() -> Self {
        match dirs::home_dir() {
            Some(home) => KnownHostsSource::Path(home.join(".ssh").join("known_hosts")),
            None => KnownHostsSource::Keys(Vec::new()),
        }
    }
}

/// Collection of known hosts.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    trusted: Vec<KnownHost>,
    revoked: Vec<KnownHost>,
    accept_once: Vec<KnownHost>,
}

impl KnownHosts {
    /// Creates an empty store. Every key is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads known_hosts from a file. A missing file yields an empty store.
    pub fn from_file<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("known_hosts file {} not found", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parses known_hosts content. Bad lines are skipped with a warning.
    pub fn parse(content: &str) -> KeygateResult<Self> {
        let mut store = Self::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match KnownHost::parse_line(line) {
                Ok((entry, true)) => store.revoked.push(entry),
                Ok((entry, false)) => store.trusted.push(entry),
                Err(e) => warn!("Skipping known_hosts line {}: {}", line_num + 1, e),
            }
        }

        Ok(store)
    }

    /// Trusts `keys` for every host.
    pub fn from_keys(keys: Vec<PublicKey>) -> Self {
        Self::from_triple(keys, Vec::new(), Vec::new())
    }

    /// Builds a store from explicit trusted, revoked and accept-once sets.
    pub fn from_triple(
        trusted: Vec<PublicKey>,
        revoked: Vec<PublicKey>,
        accept_once: Vec<PublicKey>,
    ) -> Self {
        let any = |keys: Vec<PublicKey>| keys.into_iter().map(KnownHost::any_host).collect();
        Self {
            trusted: any(trusted),
            revoked: any(revoked),
            accept_once: any(accept_once),
        }
    }

    /// Trusted entries.
    pub fn trusted(&self) -> &[KnownHost] {
        &self.trusted
    }

    /// Revoked entries.
    pub fn revoked(&self) -> &[KnownHost] {
        &self.revoked
    }

    /// Classifies `key` presented by `hostname:port`.
    ///
    /// A revoked match wins over everything else.
    pub fn classify(&self, hostname: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let listed = |entries: &[KnownHost]| {
            entries
                .iter()
                .any(|e| e.key() == key && e.matches(hostname, port))
        };

        if listed(&self.revoked) {
            HostKeyStatus::Revoked
        } else if listed(&self.trusted) {
            HostKeyStatus::Trusted
        } else if listed(&self.accept_once) {
            HostKeyStatus::AcceptOnce
        } else {
            HostKeyStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;

    fn key() -> PublicKey {
        PrivateKey::generate("").public_key()
    }

    fn hash_hostname(hostname: &str, port: u16, salt: &[u8]) -> String {
        let mut hmac = HmacSha1::new_from_slice(salt).unwrap();
        hmac.update(host_token(hostname, port).as_bytes());
        format!(
            "|1|{}|{}",
            STANDARD.encode(salt),
            STANDARD.encode(hmac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_parse_standard_format() {
        let k = key();
        let (entry, revoked) =
            KnownHost::parse_line(&format!("example.com {} user@host", k.to_openssh())).unwrap();
        assert!(!revoked);
        assert_eq!(entry.patterns(), Some("example.com"));
        assert_eq!(entry.key(), &k);
        assert_eq!(entry.comment(), "user@host");
    }

    #[test]
    fn test_parse_revoked_marker() {
        let k = key();
        let (_, revoked) =
            KnownHost::parse_line(&format!("@revoked * {}", k.to_openssh())).unwrap();
        assert!(revoked);

        assert!(KnownHost::parse_line(&format!("@cert-authority * {}", k.to_openssh())).is_err());
    }

    #[test]
    fn test_parse_comment_and_empty_line() {
        assert!(KnownHost::parse_line("# comment").is_err());
        assert!(KnownHost::parse_line("   ").is_err());
        assert!(KnownHost::parse_line("host ssh-ed25519").is_err());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("*.example.com", "host.example.com"));
        assert!(wildcard_match("host?.example.com", "host1.example.com"));
        assert!(!wildcard_match("*.example.com", "example.com"));
        assert!(!wildcard_match("host?.example.com", "host12.example.com"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
    }

    #[test]
    fn test_port_and_negation() {
        let k = key();
        let entry = KnownHost::new("[example.com]:2222", k);
        assert!(entry.matches("example.com", 2222));
        assert!(!entry.matches("example.com", 22));

        let entry = KnownHost::new("*.example.com,!bad.example.com", k);
        assert!(entry.matches("good.example.com", 22));
        assert!(!entry.matches("bad.example.com", 22));

        let entry = KnownHost::new("bad.example.com,!bad.example.com", k);
        assert!(!entry.matches("bad.example.com", 22));
    }

    #[test]
    fn test_hashed_hostname() {
        let k = key();
        let hashed = hash_hostname("127.0.0.1", 2200, b"01234567890123456789");
        let store = KnownHosts::parse(&format!("{} {}", hashed, k.to_openssh())).unwrap();

        assert_eq!(store.classify("127.0.0.1", 2200, &k), HostKeyStatus::Trusted);
        assert_eq!(store.classify("127.0.0.1", 22, &k), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_classify() {
        let (trusted, revoked, once, other) = (key(), key(), key(), key());
        let content = format!(
            "# header\nexample.com {}\n@revoked * {}\nnot a valid line\n",
            trusted.to_openssh(),
            revoked.to_openssh()
        );
        let mut store = KnownHosts::parse(&content).unwrap();
        store.accept_once.push(KnownHost::any_host(once));

        assert_eq!(store.classify("example.com", 22, &trusted), HostKeyStatus::Trusted);
        assert_eq!(store.classify("other.com", 22, &trusted), HostKeyStatus::Unknown);
        assert_eq!(store.classify("example.com", 22, &revoked), HostKeyStatus::Revoked);
        assert_eq!(store.classify("example.com", 22, &once), HostKeyStatus::AcceptOnce);
        assert_eq!(store.classify("example.com", 22, &other), HostKeyStatus::Unknown);
    }

    #[test]
    fn test_revoked_wins() {
        let k = key();
        let store = KnownHosts::from_triple(vec![k], vec![k], vec![k]);
        assert_eq!(store.classify("h", 22, &k), HostKeyStatus::Revoked);
    }

    #[test]
    fn test_empty_triple_is_unknown() {
        let store = KnownHosts::from_triple(vec![], vec![], vec![]);
        let status = store.classify("localhost", 22, &key());
        assert_eq!(status, HostKeyStatus::Unknown);
    }

    #[test]
    fn test_source_load() {
        let k = key();
        assert!(KnownHostsSource::Disabled.load().unwrap().is_none());

        let source = KnownHostsSource::Keys(vec![HostKeySpec::from(k.to_openssh().as_str())]);
        let store = source.load().unwrap().unwrap();
        assert_eq!(store.classify("any", 1, &k), HostKeyStatus::Trusted);

        let bad = KnownHostsSource::Triple {
            trusted: vec![HostKeySpec::Bytes(b"garbage".to_vec())],
            revoked: vec![],
            accept_once: vec![],
        };
        assert!(bad.load().unwrap_err().is_config());

        let bad = KnownHostsSource::Bytes(vec![0xff, 0xfe]);
        assert!(bad.load().unwrap_err().is_config());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHosts::from_file(dir.path().join("missing")).unwrap();
        assert!(store.trusted().is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let (a, b) = (key(), key());
        let content = format!(
            "@revoked * {}\nexample.com {}\n[example.com]:2222 {}\n",
            b.to_openssh(),
            a.to_openssh(),
            b.to_openssh()
        );
        std::fs::write(&path, content).unwrap();

        let loaded = KnownHosts::from_file(&path).unwrap();
        assert_eq!(loaded.trusted().len(), 2);
        assert_eq!(loaded.revoked().len(), 1);
        assert_eq!(loaded.classify("example.com", 22, &a), HostKeyStatus::Trusted);
        assert_eq!(loaded.classify("example.com", 2222, &b), HostKeyStatus::Revoked);
    }
}
