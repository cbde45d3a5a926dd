//! Security provider seam.
//!
//! The native security package layer (SSPI-style) is an external collaborator.
//! This module defines the interface the authentication core consumes: context
//! creation, token acceptance, identity resolution, and context release. The
//! production implementation binds to the platform provider; tests script one.

use thiserror::Error;

/// Opaque handle to native handshake state owned by the provider.
pub type ContextHandle = u64;

/// Security package names as requested from the provider.
pub const PACKAGE_NEGOTIATE: &str = "Negotiate";
pub const PACKAGE_NTLM: &str = "NTLM";
pub const PACKAGE_DIGEST: &str = "WDigest";

/// Protocol name reported for a Negotiate handshake that resolved to Kerberos.
pub const PROTOCOL_KERBEROS: &str = "Kerberos";
/// Protocol name reported for an NTLM handshake (direct or via Negotiate).
pub const PROTOCOL_NTLM: &str = "NTLM";

/// Outcome classification for one provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStatus {
    /// Call succeeded; for token processing this means the handshake finished.
    Ok,
    /// Handshake needs another round trip.
    ContinueNeeded,
    /// The client's token was malformed or unacceptable.
    InvalidToken,
    /// The context handle was rejected by the provider.
    InvalidHandle,
    /// The client's credentials were refused.
    LogonDenied,
    /// No authority was available to validate the credentials.
    NoAuthenticatingAuthority,
    /// The presented credentials have expired.
    CredentialsExpired,
    /// The provider could not produce an impersonation token.
    NoImpersonation,
    /// The requested mechanism is not supported by the provider.
    UnsupportedMechanism,
    /// Unclassified provider failure.
    InternalError,
}

impl SecurityStatus {
    pub fn is_error(&self) -> bool {
        !matches!(self, SecurityStatus::Ok | SecurityStatus::ContinueNeeded)
    }

    /// Failures caused by bad or stale credentials; the client should retry
    /// with new credentials (401).
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            SecurityStatus::LogonDenied
                | SecurityStatus::NoAuthenticatingAuthority
                | SecurityStatus::CredentialsExpired
                | SecurityStatus::NoImpersonation
        )
    }

    /// Failures caused by the client sending something unacceptable (400).
    pub fn is_client_fault(&self) -> bool {
        matches!(
            self,
            SecurityStatus::InvalidToken | SecurityStatus::UnsupportedMechanism
        )
    }
}

/// Flags applied when a context is created, derived from extended-protection
/// policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    /// Accept clients that did not supply a channel binding (WhenSupported).
    pub allow_missing_bindings: bool,
    /// Validate bindings under trusted-proxy rules.
    pub proxy_bindings: bool,
}

/// Channel-binding token tying the handshake to the underlying secure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBinding(pub Vec<u8>);

/// Result of feeding one raw (Negotiate/NTLM) token to a context.
#[derive(Debug, Clone)]
pub struct TokenStep {
    /// Continuation token to return to the client, if any.
    pub output: Option<Vec<u8>>,
    pub status: SecurityStatus,
    /// True once the handshake has finished.
    pub complete: bool,
}

/// Result of feeding one Digest challenge string to a context.
#[derive(Debug, Clone)]
pub struct DigestStep {
    pub output: Option<String>,
    pub status: SecurityStatus,
    pub complete: bool,
}

/// Resolved client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User name as resolved by the provider (or supplied by Basic).
    pub name: String,
    /// Authentication type the identity was established with ("NTLM",
    /// "Kerberos", "WDigest", "Basic").
    pub auth_type: String,
    /// Password, only populated for Basic identities.
    pub password: Option<String>,
}

impl Principal {
    pub fn basic(name: String, password: String) -> Self {
        Principal {
            name,
            auth_type: AUTH_TYPE_BASIC.to_string(),
            password: Some(password),
        }
    }
}

/// Authentication type recorded on Basic principals.
pub const AUTH_TYPE_BASIC: &str = "Basic";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("security package '{0}' is unavailable")]
    PackageUnavailable(String),
    #[error("provider call failed: {0:?}")]
    Failed(SecurityStatus),
}

/// Interface to the native security package layer.
///
/// Implementations must be thread-safe; the core never shares one
/// [`ContextHandle`] between threads, but distinct handles are used
/// concurrently.
pub trait SecurityProvider: Send + Sync {
    /// Allocate native handshake state for one scheme.
    fn create_context(
        &self,
        package: &str,
        flags: ContextFlags,
        binding: Option<&ChannelBinding>,
    ) -> Result<ContextHandle, ProviderError>;

    /// Advance a Negotiate/NTLM handshake by one client token. An empty input
    /// produces the initial challenge.
    fn accept_token(&self, ctx: ContextHandle, input: &[u8]) -> TokenStep;

    /// Advance a Digest handshake. `input` is `None` when computing a fresh
    /// initial challenge.
    fn accept_digest_token(
        &self,
        ctx: ContextHandle,
        verb: &str,
        realm: &str,
        input: Option<&str>,
    ) -> DigestStep;

    /// Resolve the identity behind a completed handshake.
    fn query_identity(&self, ctx: ContextHandle) -> Result<Principal, SecurityStatus>;

    /// Protocol the handshake actually negotiated (e.g. Negotiate resolving to
    /// Kerberos or NTLM). Only meaningful once the handshake completed.
    fn negotiated_protocol(&self, ctx: ContextHandle) -> String;

    /// Service principal name the client claimed to be talking to, if any.
    fn client_target_name(&self, ctx: ContextHandle) -> Option<String>;

    /// Whether the platform provider supports extended protection at all.
    fn supports_extended_protection(&self) -> bool {
        true
    }

    /// Release the native state behind `ctx`. Called exactly once per handle by
    /// [`crate::auth::context::SecurityContext`].
    fn release_context(&self, ctx: ContextHandle);
}
