//! Algorithm registry.
//!
//! The registry is the static, read-only catalog of algorithm names this crate
//! implements, per negotiation category. Every connection resolves the caller's
//! preferences against it before any socket is opened, so an empty or unknown
//! selection is always reported as a configuration error and never reaches the
//! network.
//!
//! # Example
//!
//! ```rust
//! use keygate_proto::ssh::algorithms::{resolve, supported, AlgorithmChoice, Category};
//!
//! assert!(supported(Category::Kex).contains(&"curve25519-sha256"));
//!
//! let prefs = resolve(Category::Encryption, &AlgorithmChoice::only(["aes128-gcm@openssh.com"]))
//!     .unwrap();
//! assert_eq!(prefs, vec!["aes128-gcm@openssh.com".to_string()]);
//!
//! assert!(resolve(Category::Mac, &AlgorithmChoice::only(["xxx"])).is_err());
//! ```

use keygate_platform::{KeygateError, KeygateResult};

/// Key exchange algorithms, in default preference order.
pub const KEX_ALGORITHMS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group14-sha1",
];

/// Host key algorithms.
pub const HOST_KEY_ALGORITHMS: &[&str] = &["ssh-ed25519"];

/// Encryption algorithms, in default preference order.
pub const ENCRYPTION_ALGORITHMS: &[&str] = &[
    "chacha20-poly1305@openssh.com",
    "aes256-gcm@openssh.com",
    "aes128-gcm@openssh.com",
    "aes256-cbc",
    "aes128-cbc",
];

/// MAC algorithms, in default preference order.
pub const MAC_ALGORITHMS: &[&str] = &["hmac-sha2-256", "hmac-sha2-512", "hmac-sha1"];

/// Compression algorithms, in default preference order.
pub const COMPRESSION_ALGORITHMS: &[&str] = &["zlib@openssh.com", "zlib", "none"];

/// Name negotiated when compression is disabled.
pub const COMPRESSION_NONE: &str = "none";

/// Negotiation category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Key exchange.
    Kex,
    /// Symmetric encryption.
    Encryption,
    /// Message authentication.
    Mac,
    /// Compression.
    Compression,
}

impl Category {
    /// Human-readable category name, used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Category::Kex => "key exchange",
            Category::Encryption => "encryption",
            Category::Mac => "MAC",
            Category::Compression => "compression",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller's selection for one category.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AlgorithmChoice {
    /// Use the full default preference order.
    #[default]
    Default,
    /// Use exactly these names, in this order.
    Only(Vec<String>),
    /// Compression only: never compress, regardless of the peer's list.
    Disabled,
}

impl AlgorithmChoice {
    /// Builds an explicit list.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AlgorithmChoice::Only(names.into_iter().map(Into::into).collect())
    }
}

/// Returns the supported names for a category, in default preference order.
pub fn supported(category: Category) -> &'static [&'static str] {
    match category {
        Category::Kex => KEX_ALGORITHMS,
        Category::Encryption => ENCRYPTION_ALGORITHMS,
        Category::Mac => MAC_ALGORITHMS,
        Category::Compression => COMPRESSION_ALGORITHMS,
    }
}

/// Returns true if `name` is registered in `category`.
pub fn is_supported(category: Category, name: &str) -> bool {
    supported(category).contains(&name)
}

/// Resolves a caller selection into the preference list sent in KEXINIT.
///
/// # Errors
///
/// Returns [`KeygateError::Config`] if the list is empty, names an algorithm
/// outside the registry, or uses [`AlgorithmChoice::Disabled`] outside the
/// compression category.
pub fn resolve(category: Category, choice: &AlgorithmChoice) -> KeygateResult<Vec<String>> {
    match choice {
        AlgorithmChoice::Default => Ok(supported(category)
            .iter()
            .map(|name| name.to_string())
            .collect()),
        AlgorithmChoice::Disabled => {
            if category == Category::Compression {
                Ok(vec![COMPRESSION_NONE.to_string()])
            } else {
                Err(KeygateError::Config(format!(
                    "{} algorithms cannot be disabled",
                    category
                )))
            }
        }
        AlgorithmChoice::Only(names) => {
            if names.is_empty() {
                return Err(KeygateError::Config(format!(
                    "No {} algorithms specified",
                    category
                )));
            }
            if let Some(bad) = names.iter().find(|name| !is_supported(category, name)) {
                return Err(KeygateError::Config(format!(
                    "Invalid {} algorithm: {}",
                    category, bad
                )));
            }
            let mut out: Vec<String> = Vec::with_capacity(names.len());
            for name in names {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Ok(out)
        }
    }
}

/// Fully resolved client preferences for all categories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmPreferences {
    /// Key exchange preference list.
    pub kex: Vec<String>,
    /// Host key preference list.
    pub host_key: Vec<String>,
    /// Encryption preference list (both directions).
    pub encryption: Vec<String>,
    /// MAC preference list (both directions).
    pub mac: Vec<String>,
    /// Compression preference list (both directions).
    pub compression: Vec<String>,
    /// When set, compression negotiates to "none" without matching.
    pub compression_disabled: bool,
}

impl AlgorithmPreferences {
    /// Resolves all four categories.
    pub fn resolve(
        kex: &AlgorithmChoice,
        encryption: &AlgorithmChoice,
        mac: &AlgorithmChoice,
        compression: &AlgorithmChoice,
    ) -> KeygateResult<Self> {
        Ok(Self {
            kex: resolve(Category::Kex, kex)?,
            host_key: HOST_KEY_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            encryption: resolve(Category::Encryption, encryption)?,
            mac: resolve(Category::Mac, mac)?,
            compression: resolve(Category::Compression, compression)?,
            compression_disabled: matches!(compression, AlgorithmChoice::Disabled),
        })
    }

    /// Every registered algorithm, in default order.
    pub fn all() -> Self {
        Self {
            kex: KEX_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            host_key: HOST_KEY_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            encryption: ENCRYPTION_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            mac: MAC_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            compression: COMPRESSION_ALGORITHMS.iter().map(|s| s.to_string()).collect(),
            compression_disabled: false,
        }
    }
}

impl Default for AlgorithmPreferences {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Category; 4] = [
        Category::Kex,
        Category::Encryption,
        Category::Mac,
        Category::Compression,
    ];

    #[test]
    fn test_every_category_non_empty() {
        for category in ALL {
            assert!(!supported(category).is_empty(), "{} empty", category);
        }
    }

    #[test]
    fn test_default_uses_full_order() {
        for category in ALL {
            let resolved = resolve(category, &AlgorithmChoice::Default).unwrap();
            assert_eq!(resolved, supported(category));
        }
    }

    #[test]
    fn test_every_single_name_resolves() {
        for category in ALL {
            for name in supported(category) {
                let resolved = resolve(category, &AlgorithmChoice::only([*name])).unwrap();
                assert_eq!(resolved, vec![name.to_string()]);
            }
        }
    }

    #[test]
    fn test_empty_list_is_config_error() {
        for category in ALL {
            let err = resolve(category, &AlgorithmChoice::Only(vec![])).unwrap_err();
            assert!(err.is_config());
            assert!(err.to_string().contains(category.name()));
        }
    }

    #[test]
    fn test_unknown_name_is_config_error() {
        for category in ALL {
            let err = resolve(category, &AlgorithmChoice::only(["xxx"])).unwrap_err();
            assert!(err.is_config());
            assert!(err.to_string().contains("xxx"));
        }
    }

    #[test]
    fn test_unknown_name_among_valid_ones() {
        let choice = AlgorithmChoice::only(["hmac-sha2-256", "hmac-md5"]);
        let err = resolve(Category::Mac, &choice).unwrap_err();
        assert!(err.to_string().contains("hmac-md5"));
    }

    #[test]
    fn test_disabled_only_for_compression() {
        assert_eq!(
            resolve(Category::Compression, &AlgorithmChoice::Disabled).unwrap(),
            vec!["none".to_string()]
        );
        assert!(resolve(Category::Kex, &AlgorithmChoice::Disabled)
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn test_duplicates_collapsed() {
        let choice = AlgorithmChoice::only(["zlib", "none", "zlib"]);
        assert_eq!(
            resolve(Category::Compression, &choice).unwrap(),
            vec!["zlib".to_string(), "none".to_string()]
        );
    }

    #[test]
    fn test_preferences_resolve() {
        let prefs = AlgorithmPreferences::resolve(
            &AlgorithmChoice::Default,
            &AlgorithmChoice::only(["aes128-cbc"]),
            &AlgorithmChoice::Default,
            &AlgorithmChoice::Disabled,
        )
        .unwrap();
        assert_eq!(prefs.encryption, vec!["aes128-cbc".to_string()]);
        assert!(prefs.compression_disabled);
        assert_eq!(prefs.host_key, vec!["ssh-ed25519".to_string()]);
    }
}
