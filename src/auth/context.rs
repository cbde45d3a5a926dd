//! Owned wrapper around one handshake's native security context.
//!
//! # Responsibilities
//! - Drive one scheme's handshake through the provider
//! - Track completion and validity without mutating provider state
//! - Release the native handle exactly once, on every exit path
//!
//! Release discipline: [`SecurityContext::close`] consumes the value, so a second
//! close cannot compile. `Drop` is the backstop for panics and forgotten paths; a
//! `released` flag keeps the two from ever double-freeing.

use std::sync::Arc;

use crate::auth::provider::{
    ChannelBinding, ContextFlags, ContextHandle, DigestStep, ProviderError, Principal,
    SecurityProvider, SecurityStatus, TokenStep, PACKAGE_DIGEST, PACKAGE_NEGOTIATE,
    PACKAGE_NTLM, PROTOCOL_KERBEROS,
};
use crate::auth::AuthScheme;

/// One in-progress or completed authentication handshake.
///
/// Not thread-safe by design: ownership is handed between the orchestrator, the
/// digest cache, and the disconnect tracker, never shared.
pub struct SecurityContext {
    provider: Arc<dyn SecurityProvider>,
    handle: ContextHandle,
    scheme: AuthScheme,
    package: &'static str,
    complete: bool,
    valid: bool,
    released: bool,
}

impl SecurityContext {
    /// Allocate native handshake state for `scheme`.
    pub fn create(
        provider: Arc<dyn SecurityProvider>,
        scheme: AuthScheme,
        flags: ContextFlags,
        binding: Option<&ChannelBinding>,
    ) -> Result<SecurityContext, ProviderError> {
        let package = match scheme {
            AuthScheme::Negotiate => PACKAGE_NEGOTIATE,
            AuthScheme::Ntlm => PACKAGE_NTLM,
            AuthScheme::Digest => PACKAGE_DIGEST,
            AuthScheme::Basic => {
                // Basic never has provider-side state.
                return Err(ProviderError::PackageUnavailable("Basic".to_string()));
            }
        };
        let handle = provider.create_context(package, flags, binding)?;
        tracing::trace!(handle, package, "security context created");
        Ok(SecurityContext {
            provider,
            handle,
            scheme,
            package,
            complete: false,
            valid: true,
            released: false,
        })
    }

    /// Feed one client token (raw bytes) into a Negotiate/NTLM handshake.
    /// An empty token produces the initial challenge.
    pub fn process_token(&mut self, input: &[u8]) -> TokenStep {
        let step = self.provider.accept_token(self.handle, input);
        if step.status.is_error() {
            self.valid = false;
        }
        if step.complete {
            self.complete = true;
        }
        step
    }

    /// Feed one Digest challenge string into the handshake. `input` is `None`
    /// when computing a fresh initial challenge.
    pub fn process_digest_token(
        &mut self,
        verb: &str,
        realm: &str,
        input: Option<&str>,
    ) -> DigestStep {
        let step = self
            .provider
            .accept_digest_token(self.handle, verb, realm, input);
        if step.status.is_error() {
            self.valid = false;
        }
        if step.complete {
            self.complete = true;
        }
        step
    }

    /// Resolve the identity behind the handshake. Fails with `InvalidHandle`
    /// if the handshake has not completed.
    pub fn extract_identity(&self) -> Result<Principal, SecurityStatus> {
        if !self.complete {
            return Err(SecurityStatus::InvalidHandle);
        }
        self.provider.query_identity(self.handle)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// False once the provider reported a fatal status for this context.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    /// Security package this context was created for.
    pub fn package(&self) -> &'static str {
        self.package
    }

    /// Protocol the handshake actually negotiated.
    pub fn negotiated_protocol(&self) -> String {
        self.provider.negotiated_protocol(self.handle)
    }

    /// True if a Negotiate handshake resolved to Kerberos.
    pub fn is_kerberos(&self) -> bool {
        self.negotiated_protocol() == PROTOCOL_KERBEROS
    }

    /// SPN the client claimed to be authenticating to, if it sent one.
    pub fn client_target_name(&self) -> Option<String> {
        self.provider.client_target_name(self.handle)
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }

    /// Release the native context. Consuming `self` makes a second close
    /// unrepresentable.
    pub fn close(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        debug_assert!(!self.released, "security context released twice");
        if !self.released {
            self.released = true;
            tracing::trace!(handle = self.handle, package = self.package, "security context released");
            self.provider.release_context(self.handle);
        }
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.provider.release_context(self.handle);
        }
    }
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("handle", &self.handle)
            .field("package", &self.package)
            .field("complete", &self.complete)
            .field("valid", &self.valid)
            .finish()
    }
}
