//! Authentication schemes and the handshake machinery built on top of them.
//!
//! # Responsibilities
//! - Define the scheme vocabulary ([`AuthScheme`], [`SchemeSet`])
//! - Wrap one handshake in an owned [`context::SecurityContext`]
//! - Retain retired Digest contexts ([`digest_cache::DigestContextCache`])
//! - Decide accept/challenge/reject per request ([`orchestrator::Orchestrator`])

pub mod context;
pub mod digest_cache;
pub mod orchestrator;
pub mod provider;
pub mod spn;

use std::fmt;

/// One concrete authentication scheme driven through a handshake.
///
/// `Anonymous` is not listed here: it is a member of [`SchemeSet`] but never has a
/// security context of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthScheme {
    Negotiate,
    Ntlm,
    Digest,
    Basic,
}

impl AuthScheme {
    /// Canonical scheme token as it appears in `Authorization` and
    /// `WWW-Authenticate` headers.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            AuthScheme::Negotiate => "Negotiate",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Digest => "Digest",
            AuthScheme::Basic => "Basic",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            AuthScheme::Negotiate => SchemeSet::NEGOTIATE.0,
            AuthScheme::Ntlm => SchemeSet::NTLM.0,
            AuthScheme::Digest => SchemeSet::DIGEST.0,
            AuthScheme::Basic => SchemeSet::BASIC.0,
        }
    }

    /// Schemes in header-matching priority order.
    pub const MATCH_ORDER: [AuthScheme; 4] = [
        AuthScheme::Negotiate,
        AuthScheme::Ntlm,
        AuthScheme::Digest,
        AuthScheme::Basic,
    ];
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

/// Compact set of allowed authentication schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SchemeSet(u8);

impl SchemeSet {
    pub const NONE: SchemeSet = SchemeSet(0);
    pub const NEGOTIATE: SchemeSet = SchemeSet(1);
    pub const NTLM: SchemeSet = SchemeSet(1 << 1);
    pub const DIGEST: SchemeSet = SchemeSet(1 << 2);
    pub const BASIC: SchemeSet = SchemeSet(1 << 3);
    pub const ANONYMOUS: SchemeSet = SchemeSet(1 << 4);

    /// Union of this set and `other`.
    pub const fn with(self, other: SchemeSet) -> SchemeSet {
        SchemeSet(self.0 | other.0)
    }

    pub fn contains(&self, other: SchemeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn allows(&self, scheme: AuthScheme) -> bool {
        self.0 & scheme.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if any scheme other than `Anonymous` is allowed.
    pub fn has_handshake_scheme(&self) -> bool {
        self.0 & !SchemeSet::ANONYMOUS.0 != 0
    }

    /// Parse one scheme name as it appears in configuration.
    pub fn parse_name(name: &str) -> Option<SchemeSet> {
        if name.eq_ignore_ascii_case("negotiate") {
            Some(SchemeSet::NEGOTIATE)
        } else if name.eq_ignore_ascii_case("ntlm") {
            Some(SchemeSet::NTLM)
        } else if name.eq_ignore_ascii_case("digest") {
            Some(SchemeSet::DIGEST)
        } else if name.eq_ignore_ascii_case("basic") {
            Some(SchemeSet::BASIC)
        } else if name.eq_ignore_ascii_case("anonymous") {
            Some(SchemeSet::ANONYMOUS)
        } else {
            None
        }
    }
}
