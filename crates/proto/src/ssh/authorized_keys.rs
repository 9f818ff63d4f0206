//! SSH authorized_keys file parsing (OpenSSH format).
//!
//! The server side uses this to decide which user keys, and which
//! certificate authorities, may log in.
//!
//! # Format
//!
//! Each line in an authorized_keys file has the format:
//! ```text
//! [options] keytype base64-key [comment]
//! ```
//!
//! Options are comma separated and may contain quoted values, for example
//! `cert-authority,principals="alice,bob"`.
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::authorized_keys::AuthorizedKeys;
//! use keygate_proto::ssh::privatekey::PrivateKey;
//!
//! let user = PrivateKey::generate("user").public_key();
//! let ca = PrivateKey::generate("ca").public_key();
//! let content = format!(
//!     "{}\ncert-authority {}\n",
//!     user.to_openssh(),
//!     ca.to_openssh()
//! );
//!
//! let keys = AuthorizedKeys::parse(&content);
//! assert!(keys.is_authorized(&user));
//! assert!(keys.is_trusted_ca(&ca));
//! assert!(!keys.is_authorized(&ca));
//! ```

use crate::ssh::certificate::CERT_ED25519;
use crate::ssh::privatekey::{PublicKey, SSH_ED25519};
use keygate_platform::{KeygateError, KeygateResult};
use std::path::Path;
use tracing::warn;

const CERT_AUTHORITY: &str = "cert-authority";

/// A single authorized key entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key options (e.g., "no-port-forwarding", "command=\"...\"")
    options: Vec<String>,
    key: PublicKey,
    comment: String,
}

impl AuthorizedKey {
    /// Creates an entry without options.
    pub fn new(key: PublicKey) -> Self {
        Self {
            options: Vec::new(),
            key,
            comment: String::new(),
        }
    }

    /// Creates a `cert-authority` entry.
    pub fn cert_authority(key: PublicKey) -> Self {
        Self {
            options: vec![CERT_AUTHORITY.to_string()],
            key,
            comment: String::new(),
        }
    }

    /// Returns the key options.
    pub fn options(&self) -> &[String] {
        &self.options
    }

    /// Returns the public key.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Returns the comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Checks if this key has a specific option.
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|opt| opt == option)
    }

    /// Returns the value of `name="value"`, unquoted.
    pub fn option_value(&self, name: &str) -> Option<&str> {
        self.options.iter().find_map(|opt| {
            let (key, value) = opt.split_once('=')?;
            (key == name).then(|| value.trim_matches('"'))
        })
    }

    /// True if this entry trusts certificates signed by the key.
    pub fn is_cert_authority(&self) -> bool {
        self.has_option(CERT_AUTHORITY)
    }

    /// Parses a single line from an authorized_keys file.
    pub fn parse_line(line: &str) -> KeygateResult<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Err(KeygateError::Config("Empty or comment line".to_string()));
        }

        let (options, rest) = if is_key_type(line.split_whitespace().next().unwrap_or("")) {
            (Vec::new(), line)
        } else {
            let (raw, rest) = split_options(line)?;
            (raw, rest.trim_start())
        };

        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() < 2 {
            return Err(KeygateError::Config(
                "Missing key data in authorized_keys line".to_string(),
            ));
        }
        if !is_key_type(parts[0]) {
            return Err(KeygateError::Config(format!(
                "Unsupported key type in authorized_keys: {}",
                parts[0]
            )));
        }

        let key = PublicKey::parse_openssh(&format!("{} {}", parts[0], parts[1]))?;
        Ok(Self {
            options,
            key,
            comment: parts[2..].join(" "),
        })
    }
}

fn is_key_type(s: &str) -> bool {
    s == SSH_ED25519
}

/// Splits the leading options field, honouring double quotes.
fn split_options(line: &str) -> KeygateResult<(Vec<String>, &str)> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for (idx, ch) in line.char_indices() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => options.push(std::mem::take(&mut current)),
            c if c.is_whitespace() && !in_quotes => {
                options.push(current);
                return Ok((options, &line[idx..]));
            }
            c => current.push(c),
        }
    }

    Err(KeygateError::Config(
        "No key type found in authorized_keys line".to_string(),
    ))
}

/// Collection of authorized keys.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

impl AuthorizedKeys {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads authorized keys from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parses authorized keys. Bad lines are skipped with a warning.
    pub fn parse(content: &str) -> Self {
        let mut keys = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match AuthorizedKey::parse_line(line) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Skipping authorized_keys line {}: {}", line_num + 1, e),
            }
        }

        Self { keys }
    }

    /// Returns the list of authorized keys.
    pub fn keys(&self) -> &[AuthorizedKey] {
        &self.keys
    }

    /// Adds a key to the collection.
    pub fn add_key(&mut self, key: AuthorizedKey) {
        self.keys.push(key);
    }

    /// True if `key` may log in directly.
    pub fn is_authorized(&self, key: &PublicKey) -> bool {
        self.keys
            .iter()
            .any(|k| !k.is_cert_authority() && k.key() == key)
    }

    /// Finds the `cert-authority` entry for `ca`.
    pub fn find_ca(&self, ca: &PublicKey) -> Option<&AuthorizedKey> {
        self.keys
            .iter()
            .find(|k| k.is_cert_authority() && k.key() == ca)
    }

    /// True if certificates signed by `ca` are trusted.
    pub fn is_trusted_ca(&self, ca: &PublicKey) -> bool {
        self.find_ca(ca).is_some()
    }
}

/// Algorithm names accepted in publickey requests.
pub fn is_supported_user_key_algorithm(name: &str) -> bool {
    name == SSH_ED25519 || name == CERT_ED25519
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::privatekey::PrivateKey;

    fn key() -> PublicKey {
        PrivateKey::generate("").public_key()
    }

    #[test]
    fn test_parse_simple_key() {
        let k = key();
        let entry = AuthorizedKey::parse_line(&format!("{} user@host", k.to_openssh())).unwrap();
        assert_eq!(entry.key(), &k);
        assert_eq!(entry.comment(), "user@host");
        assert!(entry.options().is_empty());
    }

    #[test]
    fn test_parse_key_with_options() {
        let k = key();
        let line = format!(
            "no-pty,command=\"echo a, b\",cert-authority {} ca",
            k.to_openssh()
        );
        let entry = AuthorizedKey::parse_line(&line).unwrap();
        assert_eq!(entry.options().len(), 3);
        assert!(entry.has_option("no-pty"));
        assert!(entry.is_cert_authority());
        assert_eq!(entry.option_value("command"), Some("echo a, b"));
        assert_eq!(entry.comment(), "ca");
    }

    #[test]
    fn test_parse_invalid_lines() {
        assert!(AuthorizedKey::parse_line("# comment").is_err());
        assert!(AuthorizedKey::parse_line("").is_err());
        assert!(AuthorizedKey::parse_line("no-pty").is_err());
        assert!(AuthorizedKey::parse_line("ssh-rsa AAAA").is_err());
    }

    #[test]
    fn test_authorized_and_ca() {
        let (user, ca) = (key(), key());
        let content = format!(
            "# keys\n{}\ncert-authority {}\nbroken line\n",
            user.to_openssh(),
            ca.to_openssh()
        );
        let keys = AuthorizedKeys::parse(&content);

        assert_eq!(keys.keys().len(), 2);
        assert!(keys.is_authorized(&user));
        assert!(!keys.is_authorized(&ca));
        assert!(keys.is_trusted_ca(&ca));
        assert!(!keys.is_trusted_ca(&user));
        assert!(!keys.is_authorized(&key()));
    }

    #[test]
    fn test_supported_algorithms() {
        assert!(is_supported_user_key_algorithm("ssh-ed25519"));
        assert!(is_supported_user_key_algorithm(CERT_ED25519));
        assert!(!is_supported_user_key_algorithm("ssh-rsa"));
    }
}
