//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! authentication listener. All types derive Serde traits for
//! deserialization from config files.

use serde::Deserialize;

use crate::auth::spn::ExtendedProtectionPolicy;
use crate::auth::SchemeSet;

/// Root configuration for the authentication listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Allowed authentication schemes by name: "negotiate", "ntlm",
    /// "digest", "basic", "anonymous".
    pub schemes: Vec<String>,

    /// Realm advertised in Basic and Digest challenges.
    pub realm: String,

    /// Reuse a completed NTLM identity for header-less requests on the same
    /// connection. Non-cryptographic convenience; off by default.
    pub unsafe_connection_ntlm_auth: bool,

    /// Extended-protection policy applied to every request unless a
    /// per-request selector overrides it.
    pub extended_protection: ExtendedProtectionPolicy,

    /// Listener-wide SPN allow list.
    pub service_names: Vec<String>,

    /// Digest context retention settings.
    pub digest_cache: DigestCacheConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            schemes: vec!["anonymous".to_string()],
            realm: String::new(),
            unsafe_connection_ntlm_auth: false,
            extended_protection: ExtendedProtectionPolicy::default(),
            service_names: Vec::new(),
            digest_cache: DigestCacheConfig::default(),
        }
    }
}

impl AuthConfig {
    /// Resolve the configured scheme names into a set. Unknown names are
    /// skipped here; validation reports them before this is ever used.
    pub fn scheme_set(&self) -> SchemeSet {
        self.schemes
            .iter()
            .filter_map(|name| SchemeSet::parse_name(name))
            .fold(SchemeSet::NONE, SchemeSet::with)
    }
}

/// Digest context cache sizing and lifetimes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestCacheConfig {
    /// Ring capacity; must be a power of two.
    pub capacity: usize,

    /// Seconds a retired context stays retrievable.
    pub lifetime_secs: u64,

    /// Survival floor in seconds for contexts displaced under ring pressure.
    pub minimum_lifetime_secs: u64,
}

impl Default for DigestCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            lifetime_secs: 300,
            minimum_lifetime_secs: 10,
        }
    }
}
