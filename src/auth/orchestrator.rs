//! Per-request authentication decision procedure.
//!
//! # Responsibilities
//! - Pick the scheme for each request and drive its handshake
//! - Decide accept / challenge / reject and assemble `WWW-Authenticate` values
//! - Hand sessions and principals between the disconnect tracker and the
//!   digest cache so nothing outlives its connection
//!
//! # Data Flow
//! ```text
//! RequestDescriptor
//!     → unsafe-NTLM reuse fast path
//!     → scheme / policy selection (static or per-request selector)
//!     → Authorization header match → scheme handshake
//!     → SPN validation → identity extraction
//!     → AuthOutcome {Accepted | ChallengeRequired | Rejected}
//! ```

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::StatusCode;

use crate::auth::context::SecurityContext;
use crate::auth::digest_cache::DigestContextCache;
use crate::auth::provider::{
    Principal, SecurityProvider, SecurityStatus, PACKAGE_NEGOTIATE, PACKAGE_NTLM, PROTOCOL_NTLM,
};
use crate::auth::spn::{self, ExtendedProtectionPolicy};
use crate::auth::{AuthScheme, SchemeSet};
use crate::net::{DisconnectTracker, OwnedDisconnect};
use crate::queue::{RequestDescriptor, RequestQueueTransport};

/// Per-request override of the allowed scheme set. Treated as untrusted: a
/// returned error rejects the request with 500 instead of unwinding.
pub type SchemeSelector = Box<
    dyn Fn(&RequestDescriptor) -> Result<SchemeSet, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Per-request override of the extended-protection policy. `Ok(None)`
/// normalizes to no enforcement.
pub type PolicySelector = Box<
    dyn Fn(
            &RequestDescriptor,
        )
            -> Result<Option<ExtendedProtectionPolicy>, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Result of one authentication pass.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Hand the request to the application.
    Accepted(AuthenticatedRequest),
    /// Send `status` with one `WWW-Authenticate` header per challenge and do
    /// not surface the request.
    ChallengeRequired {
        status: StatusCode,
        challenges: Vec<String>,
    },
    /// Terminal error; send `status` with no challenge.
    Rejected { status: StatusCode },
}

/// An accepted request, ready for application handoff.
#[derive(Debug)]
pub struct AuthenticatedRequest {
    pub request_id: u64,
    /// Resolved identity; `None` means the request was accepted anonymously.
    pub principal: Option<Arc<Principal>>,
    /// Mutual-authentication header value to attach to the success response.
    pub mutual_challenge: Option<String>,
}

/// Static authentication settings, normally produced from configuration.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub schemes: SchemeSet,
    pub realm: String,
    /// Reuse a completed NTLM identity for later header-less requests on the
    /// same connection. Non-cryptographic; off by default.
    pub unsafe_connection_ntlm_auth: bool,
    pub extended_protection: ExtendedProtectionPolicy,
    /// Listener-wide SPN allow list, overridden by the policy's custom list.
    pub default_service_names: Vec<String>,
}

/// How one handshake attempt ended, before session bookkeeping.
enum HandshakeOutcome {
    Accepted {
        principal: Principal,
        mutual: Option<String>,
        retain: Option<SecurityContext>,
        completed_ntlm: bool,
    },
    Continue {
        challenge: Option<String>,
        retain: SecurityContext,
    },
    Failed {
        status: StatusCode,
        retain: Option<SecurityContext>,
    },
}

pub struct Orchestrator {
    provider: Arc<dyn SecurityProvider>,
    transport: Arc<dyn RequestQueueTransport>,
    digest_cache: Arc<DigestContextCache>,
    tracker: DisconnectTracker,
    settings: AuthSettings,
    scheme_selector: Option<SchemeSelector>,
    policy_selector: Option<PolicySelector>,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn SecurityProvider>,
        transport: Arc<dyn RequestQueueTransport>,
        digest_cache: Arc<DigestContextCache>,
        tracker: DisconnectTracker,
        settings: AuthSettings,
    ) -> Self {
        Orchestrator {
            provider,
            transport,
            digest_cache,
            tracker,
            settings,
            scheme_selector: None,
            policy_selector: None,
        }
    }

    pub fn set_scheme_selector(&mut self, selector: SchemeSelector) {
        self.scheme_selector = Some(selector);
    }

    pub fn set_policy_selector(&mut self, selector: PolicySelector) {
        self.policy_selector = Some(selector);
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    /// Run the full decision procedure for one request.
    pub fn authenticate(&self, request: &RequestDescriptor) -> AuthOutcome {
        let header = request
            .authorization
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());

        // Identity reuse across requests on an already-authenticated
        // connection. A request that carries credentials is explicitly
        // re-authenticating, so any cached identity is dropped first.
        if self.settings.unsafe_connection_ntlm_auth {
            if let Some(record) = self.tracker.lookup(request.connection_id) {
                match header {
                    None => {
                        if let Some(principal) = record.principal() {
                            tracing::debug!(
                                connection_id = request.connection_id,
                                user = %principal.name,
                                "reusing connection NTLM identity"
                            );
                            return AuthOutcome::Accepted(AuthenticatedRequest {
                                request_id: request.request_id,
                                principal: Some(principal),
                                mutual_challenge: None,
                            });
                        }
                    }
                    Some(_) => record.clear_principal(),
                }
            }
        }

        let schemes = match &self.scheme_selector {
            Some(selector) => match selector(request) {
                Ok(schemes) => schemes,
                Err(error) => {
                    tracing::warn!(request_id = request.request_id, %error, "scheme selector failed");
                    return AuthOutcome::Rejected {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                    };
                }
            },
            None => self.settings.schemes,
        };
        let policy = match &self.policy_selector {
            Some(selector) => match selector(request) {
                Ok(Some(policy)) => policy,
                Ok(None) => ExtendedProtectionPolicy::default(),
                Err(error) => {
                    tracing::warn!(request_id = request.request_id, %error, "extended protection selector failed");
                    return AuthOutcome::Rejected {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                    };
                }
            },
            None => self.settings.extended_protection.clone(),
        };

        let record = self.tracker.lookup(request.connection_id);
        let mut owned = record.and_then(|record| self.tracker.start_owning(&record));
        let mut old_session: Option<SecurityContext> = None;

        let outcome = self.decide(request, header, schemes, &policy, &mut owned, &mut old_session);

        // Retire whatever is left of the previous session. Digest contexts
        // stay reachable for the nonce-reuse window; everything else closes.
        if let Some(previous) = old_session.take() {
            self.retire(previous);
        }
        outcome
    }

    /// Build initial challenges for all allowed schemes outside a handshake,
    /// e.g. when the application asks for a 401 on an already-delivered
    /// request. The Digest context backing its challenge goes straight to the
    /// cache since no handler will pick it up as a session.
    pub fn initial_challenges(&self, request: &RequestDescriptor) -> Vec<String> {
        let mut challenges = Vec::new();
        let schemes = self.settings.schemes;
        if schemes.allows(AuthScheme::Negotiate) {
            challenges.push(AuthScheme::Negotiate.canonical_name().to_string());
        }
        if schemes.allows(AuthScheme::Ntlm) {
            challenges.push(AuthScheme::Ntlm.canonical_name().to_string());
        }
        if schemes.allows(AuthScheme::Digest) {
            if let Some((challenge, context)) =
                self.digest_challenge(request, &self.settings.extended_protection)
            {
                challenges.push(challenge);
                self.digest_cache.save(context);
            }
        }
        if schemes.allows(AuthScheme::Basic) {
            challenges.push(format!("Basic realm=\"{}\"", self.settings.realm));
        }
        challenges
    }

    fn decide(
        &self,
        request: &RequestDescriptor,
        header: Option<&str>,
        schemes: SchemeSet,
        policy: &ExtendedProtectionPolicy,
        owned: &mut Option<OwnedDisconnect>,
        old_session: &mut Option<SecurityContext>,
    ) -> AuthOutcome {
        let matched = header.and_then(|h| {
            if !schemes.has_handshake_scheme() {
                return None;
            }
            let (token, blob) = split_authorization_header(h);
            let scheme = AuthScheme::MATCH_ORDER
                .iter()
                .copied()
                .find(|s| schemes.allows(*s) && token.eq_ignore_ascii_case(s.canonical_name()));
            if scheme.is_none() {
                tracing::debug!(
                    request_id = request.request_id,
                    scheme = token,
                    "authorization scheme not allowed or not recognized"
                );
            }
            scheme.map(|s| (s, blob))
        });

        let Some((scheme, blob)) = matched else {
            if schemes.contains(SchemeSet::ANONYMOUS) {
                return AuthOutcome::Accepted(AuthenticatedRequest {
                    request_id: request.request_id,
                    principal: None,
                    mutual_challenge: None,
                });
            }
            return self.challenge(request, schemes, policy, owned, false);
        };

        // The previous session only comes into play once a handshake scheme
        // matched; an anonymous or unrecognized request leaves it untouched.
        *old_session = owned.as_ref().and_then(|o| o.take_session());

        let result = match scheme {
            AuthScheme::Negotiate | AuthScheme::Ntlm => {
                self.handshake_negotiate(request, scheme, blob, old_session, policy)
            }
            AuthScheme::Digest => self.handshake_digest(request, blob, policy),
            AuthScheme::Basic => self.handshake_basic(blob),
        };

        match result {
            HandshakeOutcome::Accepted {
                principal,
                mutual,
                retain,
                completed_ntlm,
            } => {
                if let Some(session) = retain {
                    if !self.ensure_registered(owned, request.connection_id) {
                        session.close();
                        return AuthOutcome::Rejected {
                            status: StatusCode::INTERNAL_SERVER_ERROR,
                        };
                    }
                    self.install_session(owned.as_ref().expect("registered above"), session);
                }
                let principal = Arc::new(principal);
                if self.settings.unsafe_connection_ntlm_auth && completed_ntlm {
                    // Best effort: a missing registration here only loses the
                    // reuse optimization, not correctness.
                    if self.ensure_registered(owned, request.connection_id) {
                        owned
                            .as_ref()
                            .expect("registered above")
                            .record()
                            .set_principal(Arc::clone(&principal));
                    } else {
                        tracing::debug!(
                            connection_id = request.connection_id,
                            "NTLM identity not cached, disconnect registration unavailable"
                        );
                    }
                }
                tracing::debug!(
                    request_id = request.request_id,
                    user = %principal.name,
                    auth_type = %principal.auth_type,
                    "request authenticated"
                );
                AuthOutcome::Accepted(AuthenticatedRequest {
                    request_id: request.request_id,
                    principal: Some(principal),
                    mutual_challenge: mutual,
                })
            }
            HandshakeOutcome::Continue { challenge, retain } => {
                if !self.ensure_registered(owned, request.connection_id) {
                    retain.close();
                    return AuthOutcome::Rejected {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                    };
                }
                self.install_session(owned.as_ref().expect("registered above"), retain);
                match challenge {
                    Some(challenge) => AuthOutcome::ChallengeRequired {
                        status: StatusCode::UNAUTHORIZED,
                        challenges: vec![challenge],
                    },
                    None => self.challenge(request, schemes, policy, owned, true),
                }
            }
            HandshakeOutcome::Failed { status, retain } => {
                // A denied context may still serve a later nonce reuse, but
                // the 401 going back must carry fresh challenge state, so the
                // context retires instead of staying the connection's session.
                if let Some(session) = retain {
                    self.retire(session);
                }
                if status == StatusCode::UNAUTHORIZED {
                    self.challenge(request, schemes, policy, owned, false)
                } else {
                    AuthOutcome::Rejected { status }
                }
            }
        }
    }

    /// One Negotiate or NTLM handshake round.
    fn handshake_negotiate(
        &self,
        request: &RequestDescriptor,
        scheme: AuthScheme,
        blob: &str,
        old_session: &mut Option<SecurityContext>,
        policy: &ExtendedProtectionPolicy,
    ) -> HandshakeOutcome {
        let bytes = match STANDARD.decode(blob) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::debug!(request_id = request.request_id, %error, "authorization blob is not valid base64");
                return HandshakeOutcome::Failed {
                    status: StatusCode::BAD_REQUEST,
                    retain: None,
                };
            }
        };

        let expected_package = match scheme {
            AuthScheme::Negotiate => PACKAGE_NEGOTIATE,
            _ => PACKAGE_NTLM,
        };
        let first_token_on_connection = old_session.is_none();
        let mut context = match old_session.take() {
            Some(previous) if previous.package() == expected_package => previous,
            other => {
                // A session for a different package is retired later, not
                // resumed.
                *old_session = other;
                let binding = if spn::wants_channel_binding(request.secure_connection, policy) {
                    self.transport.channel_binding_token(request.connection_id)
                } else {
                    None
                };
                match SecurityContext::create(
                    Arc::clone(&self.provider),
                    scheme,
                    spn::context_flags(policy),
                    binding.as_ref(),
                ) {
                    Ok(context) => context,
                    Err(error) => {
                        tracing::warn!(request_id = request.request_id, %error, "security context creation failed");
                        return HandshakeOutcome::Failed {
                            status: StatusCode::INTERNAL_SERVER_ERROR,
                            retain: None,
                        };
                    }
                }
            }
        };

        let step = context.process_token(&bytes);
        let mut status = step.status;
        // Provider quirk: the very first token on a connection can surface an
        // ambiguous invalid-handle status for what is really a bad token.
        if status == SecurityStatus::InvalidHandle
            && first_token_on_connection
            && !bytes.is_empty()
        {
            status = SecurityStatus::InvalidToken;
        }

        if status.is_error() {
            tracing::debug!(
                request_id = request.request_id,
                scheme = %scheme,
                status = ?status,
                "handshake step failed"
            );
            return HandshakeOutcome::Failed {
                status: status_to_http(status),
                retain: None,
            };
        }

        if !step.complete {
            let mut challenge = scheme.canonical_name().to_string();
            if let Some(output) = &step.output {
                challenge.push(' ');
                challenge.push_str(&STANDARD.encode(output));
            }
            return HandshakeOutcome::Continue {
                challenge: Some(challenge),
                retain: context,
            };
        }

        let mutual = step.output.map(|output| {
            format!("{} {}", scheme.canonical_name(), STANDARD.encode(output))
        });

        match spn::check_spn(
            context.is_kerberos(),
            context.client_target_name().as_deref(),
            request.secure_connection,
            policy,
            self.provider.supports_extended_protection(),
            &self.settings.default_service_names,
        ) {
            Ok(true) => {}
            Ok(false) => {
                return HandshakeOutcome::Failed {
                    status: StatusCode::UNAUTHORIZED,
                    retain: None,
                }
            }
            Err(error) => {
                tracing::error!(request_id = request.request_id, %error);
                return HandshakeOutcome::Failed {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    retain: None,
                };
            }
        }

        match context.extract_identity() {
            Ok(principal) => {
                let completed_ntlm = context.negotiated_protocol() == PROTOCOL_NTLM;
                HandshakeOutcome::Accepted {
                    principal,
                    mutual,
                    retain: None,
                    completed_ntlm,
                }
            }
            Err(status) => {
                tracing::debug!(
                    request_id = request.request_id,
                    status = ?status,
                    "identity extraction failed"
                );
                HandshakeOutcome::Failed {
                    status: status_to_http(status),
                    retain: None,
                }
            }
        }
    }

    /// One Digest round. Always a fresh context; resubmitting the prior
    /// context for a higher nonce count is not allowed by the provider.
    fn handshake_digest(
        &self,
        request: &RequestDescriptor,
        blob: &str,
        policy: &ExtendedProtectionPolicy,
    ) -> HandshakeOutcome {
        let mut context = match SecurityContext::create(
            Arc::clone(&self.provider),
            AuthScheme::Digest,
            spn::context_flags(policy),
            None,
        ) {
            Ok(context) => context,
            Err(error) => {
                tracing::warn!(request_id = request.request_id, %error, "digest context creation failed");
                return HandshakeOutcome::Failed {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    retain: None,
                };
            }
        };

        let step = context.process_digest_token(&request.verb, &self.settings.realm, Some(blob));
        if step.status.is_error() {
            tracing::debug!(
                request_id = request.request_id,
                status = ?step.status,
                "digest step failed"
            );
            return HandshakeOutcome::Failed {
                status: status_to_http(step.status),
                retain: None,
            };
        }

        if !step.complete {
            let challenge = step
                .output
                .filter(|output| !output.is_empty())
                .map(|output| format!("Digest {output}"));
            return HandshakeOutcome::Continue {
                challenge,
                retain: context,
            };
        }

        // The provider sometimes returns a populated output buffer alongside
        // success; the status is authoritative and the buffer is dropped.

        match spn::check_spn(
            false,
            context.client_target_name().as_deref(),
            request.secure_connection,
            policy,
            self.provider.supports_extended_protection(),
            &self.settings.default_service_names,
        ) {
            Ok(true) => {}
            Ok(false) => {
                // The handshake itself is fine, so the context stays usable
                // for a later nonce reuse even though this request is denied.
                return HandshakeOutcome::Failed {
                    status: StatusCode::UNAUTHORIZED,
                    retain: Some(context),
                };
            }
            Err(error) => {
                tracing::error!(request_id = request.request_id, %error);
                return HandshakeOutcome::Failed {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    retain: Some(context),
                };
            }
        }

        match context.extract_identity() {
            Ok(principal) => HandshakeOutcome::Accepted {
                principal,
                mutual: None,
                retain: Some(context),
                completed_ntlm: false,
            },
            Err(status) => {
                let retain = context.is_valid().then_some(context);
                HandshakeOutcome::Failed {
                    status: status_to_http(status),
                    retain,
                }
            }
        }
    }

    /// Basic credentials: single round, no provider involvement.
    fn handshake_basic(&self, blob: &str) -> HandshakeOutcome {
        let bytes = match STANDARD.decode(blob) {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::debug!(%error, "basic credentials are not valid base64");
                return HandshakeOutcome::Failed {
                    status: StatusCode::BAD_REQUEST,
                    retain: None,
                };
            }
        };
        // Header bytes decode as Latin-1, byte for byte.
        let text: String = bytes.iter().map(|&b| b as char).collect();
        match text.find(':') {
            Some(index) => {
                let (user, password) = text.split_at(index);
                HandshakeOutcome::Accepted {
                    principal: Principal::basic(user.to_string(), password[1..].to_string()),
                    mutual: None,
                    retain: None,
                    completed_ntlm: false,
                }
            }
            None => {
                tracing::debug!("basic credentials missing ':' delimiter");
                HandshakeOutcome::Failed {
                    status: StatusCode::BAD_REQUEST,
                    retain: None,
                }
            }
        }
    }

    /// Assemble the challenge list for every allowed scheme and pick the
    /// response status: 401 when there is something to offer, 403 otherwise.
    fn challenge(
        &self,
        request: &RequestDescriptor,
        schemes: SchemeSet,
        policy: &ExtendedProtectionPolicy,
        owned: &mut Option<OwnedDisconnect>,
        session_retained: bool,
    ) -> AuthOutcome {
        let mut challenges = Vec::new();
        if schemes.allows(AuthScheme::Negotiate) {
            challenges.push(AuthScheme::Negotiate.canonical_name().to_string());
        }
        if schemes.allows(AuthScheme::Ntlm) {
            challenges.push(AuthScheme::Ntlm.canonical_name().to_string());
        }
        // A Digest challenge carries provider state that must live on as the
        // connection's session, which only works when no session was retained
        // by this pass already.
        if schemes.allows(AuthScheme::Digest) && !session_retained {
            if let Some((challenge, context)) = self.digest_challenge(request, policy) {
                if self.ensure_registered(owned, request.connection_id) {
                    self.install_session(owned.as_ref().expect("registered above"), context);
                    challenges.push(challenge);
                } else {
                    context.close();
                    return AuthOutcome::Rejected {
                        status: StatusCode::INTERNAL_SERVER_ERROR,
                    };
                }
            }
        }
        if schemes.allows(AuthScheme::Basic) {
            challenges.push(format!("Basic realm=\"{}\"", self.settings.realm));
        }

        let status = if challenges.is_empty() {
            StatusCode::FORBIDDEN
        } else {
            StatusCode::UNAUTHORIZED
        };
        AuthOutcome::ChallengeRequired { status, challenges }
    }

    /// Compute a fresh initial Digest challenge and the context behind it.
    fn digest_challenge(
        &self,
        request: &RequestDescriptor,
        policy: &ExtendedProtectionPolicy,
    ) -> Option<(String, SecurityContext)> {
        let mut context = match SecurityContext::create(
            Arc::clone(&self.provider),
            AuthScheme::Digest,
            spn::context_flags(policy),
            None,
        ) {
            Ok(context) => context,
            Err(error) => {
                tracing::warn!(request_id = request.request_id, %error, "digest challenge creation failed");
                return None;
            }
        };
        let step = context.process_digest_token(&request.verb, &self.settings.realm, None);
        if step.status.is_error() {
            tracing::warn!(
                request_id = request.request_id,
                status = ?step.status,
                "digest challenge computation failed"
            );
            return None;
        }
        let output = step.output.filter(|output| !output.is_empty())?;
        Some((format!("Digest {output}"), context))
    }

    fn ensure_registered(
        &self,
        owned: &mut Option<OwnedDisconnect>,
        connection_id: u64,
    ) -> bool {
        if owned.is_some() {
            return true;
        }
        match self.tracker.register(self.transport.as_ref(), connection_id) {
            Some(registration) => {
                *owned = Some(registration);
                true
            }
            None => false,
        }
    }

    /// Attach `session` to the connection, retiring whatever it replaces.
    fn install_session(&self, owned: &OwnedDisconnect, session: SecurityContext) {
        if let Some(previous) = owned.take_session() {
            self.retire(previous);
        }
        owned.set_session(session);
    }

    /// Dispose of a context that is no longer the live session.
    fn retire(&self, context: SecurityContext) {
        if context.scheme() == AuthScheme::Digest {
            self.digest_cache.save(context);
        } else {
            context.close();
        }
    }
}

/// Split `Authorization` into its scheme token and the remainder.
fn split_authorization_header(header: &str) -> (&str, &str) {
    const SEPARATORS: [char; 4] = [' ', '\t', '\r', '\n'];
    match header.find(SEPARATORS) {
        Some(index) => (
            &header[..index],
            header[index + 1..].trim_matches(SEPARATORS),
        ),
        None => (header, ""),
    }
}

/// Map a provider failure to the response status class.
fn status_to_http(status: SecurityStatus) -> StatusCode {
    if status.is_credential_failure() {
        StatusCode::UNAUTHORIZED
    } else if status.is_client_fault() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}
