//! Listener façade: lifecycle and the per-request entry point.
//!
//! # Responsibilities
//! - Validate configuration and wire up cache, tracker, and orchestrator
//! - Track listener lifecycle (stopped / started / closed)
//! - Run one authentication pass per request and send challenge or error
//!   responses back through the request queue
//!
//! Byte-level queue setup and prefix registration against the kernel engine
//! happen in the transport; this type only keeps the prefix list and the
//! lifecycle gates around it.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::auth::digest_cache::DigestContextCache;
use crate::auth::orchestrator::{
    AuthOutcome, AuthSettings, AuthenticatedRequest, Orchestrator, PolicySelector, SchemeSelector,
};
use crate::auth::provider::SecurityProvider;
use crate::config::validation::{validate_config, ValidationError};
use crate::config::AuthConfig;
use crate::net::DisconnectTracker;
use crate::queue::{QueueError, RequestDescriptor, RequestQueueTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed or stopped; can be started again.
    Stopped,
    /// Accepting requests.
    Started,
    /// Torn down for good.
    Closed,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid configuration: {0:?}")]
    InvalidConfig(Vec<ValidationError>),

    #[error("listener is {0:?}")]
    InvalidState(ListenerState),

    #[error("invalid prefix '{0}': must start with http:// or https:// and end with '/'")]
    InvalidPrefix(String),

    #[error("failed to send response: {0}")]
    Send(#[from] QueueError),
}

/// External-facing entry point for the authentication core.
pub struct AuthListener {
    transport: Arc<dyn RequestQueueTransport>,
    orchestrator: Orchestrator,
    digest_cache: Arc<DigestContextCache>,
    tracker: DisconnectTracker,
    state: Mutex<ListenerState>,
    prefixes: Mutex<Vec<String>>,
}

impl AuthListener {
    /// Build a listener from validated configuration. The listener starts in
    /// [`ListenerState::Stopped`]; contexts saved before `start` are closed
    /// rather than cached.
    pub fn new(
        config: AuthConfig,
        provider: Arc<dyn SecurityProvider>,
        transport: Arc<dyn RequestQueueTransport>,
    ) -> Result<Self, ListenerError> {
        validate_config(&config).map_err(ListenerError::InvalidConfig)?;

        let cache_config = &config.digest_cache;
        let digest_cache = Arc::new(DigestContextCache::new(
            cache_config.capacity,
            cache_config.lifetime_secs,
            cache_config.minimum_lifetime_secs,
        ));
        digest_cache.set_active(false);
        let tracker = DisconnectTracker::new(Arc::clone(&digest_cache));

        let settings = AuthSettings {
            schemes: config.scheme_set(),
            realm: config.realm.clone(),
            unsafe_connection_ntlm_auth: config.unsafe_connection_ntlm_auth,
            extended_protection: config.extended_protection.clone(),
            default_service_names: config.service_names.clone(),
        };
        let orchestrator = Orchestrator::new(
            provider,
            Arc::clone(&transport),
            Arc::clone(&digest_cache),
            tracker.clone(),
            settings,
        );

        Ok(AuthListener {
            transport,
            orchestrator,
            digest_cache,
            tracker,
            state: Mutex::new(ListenerState::Stopped),
            prefixes: Mutex::new(Vec::new()),
        })
    }

    /// Override the allowed scheme set per request.
    pub fn set_scheme_selector(&mut self, selector: SchemeSelector) {
        self.orchestrator.set_scheme_selector(selector);
    }

    /// Override the extended-protection policy per request.
    pub fn set_policy_selector(&mut self, selector: PolicySelector) {
        self.orchestrator.set_policy_selector(selector);
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().expect("listener state mutex poisoned")
    }

    /// Register a URL prefix this listener answers for.
    pub fn add_prefix(&self, prefix: &str) -> Result<(), ListenerError> {
        if self.state() == ListenerState::Closed {
            return Err(ListenerError::InvalidState(ListenerState::Closed));
        }
        let well_formed = (prefix.starts_with("http://") || prefix.starts_with("https://"))
            && prefix.ends_with('/');
        if !well_formed {
            return Err(ListenerError::InvalidPrefix(prefix.to_string()));
        }
        let mut prefixes = self.prefixes.lock().expect("prefix mutex poisoned");
        if !prefixes.iter().any(|p| p == prefix) {
            prefixes.push(prefix.to_string());
        }
        Ok(())
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes.lock().expect("prefix mutex poisoned").clone()
    }

    /// Begin accepting requests. Idempotent while not closed.
    pub fn start(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().expect("listener state mutex poisoned");
        match *state {
            ListenerState::Closed => Err(ListenerError::InvalidState(ListenerState::Closed)),
            ListenerState::Started => Ok(()),
            ListenerState::Stopped => {
                *state = ListenerState::Started;
                self.digest_cache.set_active(true);
                tracing::info!("listener started");
                Ok(())
            }
        }
    }

    /// Stop accepting requests and drop all per-connection state. The
    /// listener can be started again afterwards.
    pub fn stop(&self) -> Result<(), ListenerError> {
        let mut state = self.state.lock().expect("listener state mutex poisoned");
        match *state {
            ListenerState::Closed => Err(ListenerError::InvalidState(ListenerState::Closed)),
            ListenerState::Stopped => Ok(()),
            ListenerState::Started => {
                *state = ListenerState::Stopped;
                drop(state);
                self.teardown();
                tracing::info!("listener stopped");
                Ok(())
            }
        }
    }

    /// Tear down permanently. Safe to call more than once.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("listener state mutex poisoned");
        if *state == ListenerState::Closed {
            return;
        }
        *state = ListenerState::Closed;
        drop(state);
        self.teardown();
        tracing::info!("listener closed");
    }

    /// Abortive variant of [`close`](Self::close); state teardown is the
    /// same, the transport-level distinction lives outside this crate.
    pub fn abort(&self) {
        self.close();
    }

    fn teardown(&self) {
        self.digest_cache.set_active(false);
        self.digest_cache.clear();
        self.tracker.shutdown();
    }

    /// Authenticate one request. Returns the accepted request for
    /// application handoff, or `None` after a challenge or error response
    /// was sent back over the queue.
    pub fn handle_request(
        &self,
        request: &RequestDescriptor,
    ) -> Result<Option<AuthenticatedRequest>, ListenerError> {
        if self.state() != ListenerState::Started {
            return Err(ListenerError::InvalidState(self.state()));
        }

        match self.orchestrator.authenticate(request) {
            AuthOutcome::Accepted(accepted) => Ok(Some(accepted)),
            AuthOutcome::ChallengeRequired { status, challenges } => {
                self.send_or_cancel(request, status, &challenges);
                Ok(None)
            }
            AuthOutcome::Rejected { status } => {
                self.send_or_cancel(request, status, &[]);
                Ok(None)
            }
        }
    }

    /// Challenge headers for an already-delivered request, e.g. when the
    /// application decides on a 401 itself. Digest state behind the returned
    /// challenge is cached, not attached to the connection.
    pub fn challenge_headers_for(&self, request: &RequestDescriptor) -> Vec<String> {
        self.orchestrator.initial_challenges(request)
    }

    fn send_or_cancel(
        &self,
        request: &RequestDescriptor,
        status: http::StatusCode,
        challenges: &[String],
    ) {
        if let Err(error) = self
            .transport
            .send_auth_response(request.request_id, status, challenges)
        {
            tracing::warn!(
                request_id = request.request_id,
                %status,
                %error,
                "failed to send auth response, canceling request"
            );
            self.transport.cancel_request(request.request_id);
        }
    }
}
