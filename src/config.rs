//! Kernel configuration.
//!
//! Feature toggles are carried as an explicit [`KernelConfig`] value that is
//! handed to the lifecycle, cascade and bundle layers at construction time.
//!
//! ## Environment
//!
//! [`KernelConfig::from_env`] reads:
//! - `CHECKSUMS_TOGGLE`: compute and store checksums (default: true)
//! - `PREVENT_DUPLICATE_VERSION_TOGGLE`: reject versions identical to the latest (default: true)
//! - `CHECKSUM_DIGEST`: `md5` or `sha256` (default: md5)
//! - `MAX_LOCALES_LIMIT`: max names/descriptions per concept (default: 500)
//! - `CASCADE_MAX_RESULTS`: stop starting new cascade levels past this many results (default: unset)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Default cap on names and descriptions per concept.
pub const DEFAULT_MAX_LOCALES: usize = 500;

/// Digest used for resource checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// MD5, hex encoded. Matches checksums produced by other OCL tooling.
    #[default]
    Md5,
    /// SHA-256, hex encoded.
    Sha256,
}

impl FromStr for DigestAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(format!("unknown digest algorithm: {other}")),
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => write!(f, "md5"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}

/// Capability flags and limits for the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Compute and cache checksums. When false every checksum is absent.
    pub checksums_enabled: bool,
    /// Reject a new version whose standard checksum equals the latest version's.
    pub prevent_duplicate_versions: bool,
    /// Digest algorithm for checksums.
    pub digest: DigestAlgorithm,
    /// Max names and max descriptions on a concept version.
    pub max_locales: usize,
    /// Result cap checked before each cascade level.
    pub cascade_max_results: Option<usize>,
}

impl KernelConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            checksums_enabled: env_flag("CHECKSUMS_TOGGLE").unwrap_or(true),
            prevent_duplicate_versions: env_flag("PREVENT_DUPLICATE_VERSION_TOGGLE").unwrap_or(true),
            digest: env_parse("CHECKSUM_DIGEST").unwrap_or_default(),
            max_locales: env_parse("MAX_LOCALES_LIMIT").unwrap_or(DEFAULT_MAX_LOCALES),
            cascade_max_results: env_parse("CASCADE_MAX_RESULTS"),
        }
    }

    /// Config with checksums (and therefore duplicate prevention) switched off.
    pub fn without_checksums() -> Self {
        Self {
            checksums_enabled: false,
            ..Self::default()
        }
    }

    /// Set the duplicate-version toggle.
    pub fn with_duplicate_prevention(mut self, enabled: bool) -> Self {
        self.prevent_duplicate_versions = enabled;
        self
    }

    /// Set the digest algorithm.
    pub fn with_digest(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = digest;
        self
    }

    /// Set the locale limit.
    pub fn with_max_locales(mut self, max_locales: usize) -> Self {
        self.max_locales = max_locales;
        self
    }

    /// Set the cascade result cap.
    pub fn with_cascade_max_results(mut self, max_results: Option<usize>) -> Self {
        self.cascade_max_results = max_results;
        self
    }

    /// Duplicate prevention only applies when checksums exist.
    pub fn duplicate_prevention_active(&self) -> bool {
        self.checksums_enabled && self.prevent_duplicate_versions
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            checksums_enabled: true,
            prevent_duplicate_versions: true,
            digest: DigestAlgorithm::Md5,
            max_locales: DEFAULT_MAX_LOCALES,
            cascade_max_results: None,
        }
    }
}

/// Parse an environment variable; unset or malformed yields `None`.
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
