//! Extended-protection policy and service-principal-name validation.
//!
//! # Responsibilities
//! - Model the three enforcement levels and two protection scenarios
//! - Decide when channel-binding checks already cover a handshake
//! - Validate the client-claimed SPN against the configured service names
//!
//! Kerberos self-validates the target name inside the handshake, so the SPN
//! ladder only applies to the other package-based schemes.

use serde::Deserialize;
use thiserror::Error;

use crate::auth::provider::ContextFlags;

/// Loopback target that always passes, whatever the configured names.
const LOOPBACK_SERVICE_NAME: &str = "HTTP/localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEnforcement {
    /// Skip every extended-protection check.
    #[default]
    Never,
    /// Enforce when the client supplied protection data; a missing SPN passes.
    WhenSupported,
    /// Enforce unconditionally; a missing SPN fails.
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionScenario {
    /// The secure channel terminates at this server; channel binding on a
    /// secure connection already proves the target.
    #[default]
    TransportSelected,
    /// A trusted proxy terminates the secure channel; bindings are the
    /// proxy's, so the SPN must still be checked here.
    TrustedProxy,
}

/// Extended-protection configuration, static or chosen per request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtendedProtectionPolicy {
    pub enforcement: PolicyEnforcement,
    pub scenario: ProtectionScenario,
    /// When present, fully replaces the listener-wide service-name list.
    pub custom_service_names: Option<Vec<String>>,
}

/// Validation is required but no acceptable service names exist. A policy
/// that demands the check cannot soundly skip it, so this is a server-side
/// configuration fault.
#[derive(Debug, Error)]
#[error("extended protection requires SPN validation but no service names are configured")]
pub struct NoServiceNamesError;

/// True when a secure connection's channel binding already covers what the
/// SPN check would prove.
pub fn scenario_covers_binding(secure_connection: bool, policy: &ExtendedProtectionPolicy) -> bool {
    secure_connection && policy.scenario == ProtectionScenario::TransportSelected
}

/// Context flags a new handshake needs under `policy`.
pub fn context_flags(policy: &ExtendedProtectionPolicy) -> ContextFlags {
    let mut flags = ContextFlags::default();
    if policy.enforcement != PolicyEnforcement::Never {
        if policy.enforcement == PolicyEnforcement::WhenSupported {
            flags.allow_missing_bindings = true;
        }
        if policy.scenario == ProtectionScenario::TrustedProxy {
            flags.proxy_bindings = true;
        }
    }
    flags
}

/// Whether a channel-binding token should be fetched for a new handshake.
pub fn wants_channel_binding(secure_connection: bool, policy: &ExtendedProtectionPolicy) -> bool {
    policy.enforcement != PolicyEnforcement::Never && secure_connection
}

/// Validate the client-claimed SPN for a completed handshake.
///
/// Returns `Ok(false)` when the claim does not match (deny with 401) and an
/// error when the policy requires names that were never configured.
pub fn check_spn(
    is_kerberos: bool,
    client_spn: Option<&str>,
    secure_connection: bool,
    policy: &ExtendedProtectionPolicy,
    platform_supports_extended_protection: bool,
    default_service_names: &[String],
) -> Result<bool, NoServiceNamesError> {
    if is_kerberos {
        return Ok(true);
    }
    if policy.enforcement == PolicyEnforcement::Never {
        return Ok(true);
    }
    if scenario_covers_binding(secure_connection, policy) {
        return Ok(true);
    }
    if !platform_supports_extended_protection {
        return Ok(true);
    }

    let client_spn = client_spn.unwrap_or("");
    if client_spn.is_empty() {
        return Ok(policy.enforcement == PolicyEnforcement::WhenSupported);
    }
    if client_spn.eq_ignore_ascii_case(LOOPBACK_SERVICE_NAME) {
        return Ok(true);
    }

    let service_names: &[String] = match &policy.custom_service_names {
        Some(custom) => custom,
        None => default_service_names,
    };
    if service_names.is_empty() {
        return Err(NoServiceNamesError);
    }

    let matched = service_names
        .iter()
        .any(|name| name.eq_ignore_ascii_case(client_spn));
    if !matched {
        tracing::debug!(client_spn, "client SPN matched no configured service name");
    }
    Ok(matched)
}
