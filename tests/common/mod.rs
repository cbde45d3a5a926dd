//! Shared utilities for integration testing: a scriptable security provider
//! and a recording request-queue transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

use http::StatusCode;

use authq::auth::provider::{
    ChannelBinding, ContextFlags, ContextHandle, DigestStep, Principal, ProviderError,
    SecurityProvider, SecurityStatus, TokenStep,
};
use authq::queue::{DisconnectNotify, QueueError, RequestDescriptor, RequestQueueTransport};

/// Initialize tracing once for the whole test binary. Verbosity follows
/// `RUST_LOG`; silent by default.
#[allow(dead_code)]
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Security provider whose handshake results are scripted by the test.
///
/// Token and digest steps are consumed front to back; when the script runs
/// dry the provider answers with a continuation round.
pub struct ScriptedProvider {
    next_handle: AtomicU64,
    created: Mutex<Vec<(ContextHandle, String)>>,
    releases: Mutex<Vec<ContextHandle>>,
    token_steps: Mutex<VecDeque<TokenStep>>,
    digest_steps: Mutex<VecDeque<DigestStep>>,
    accept_calls: AtomicUsize,
    identity: Mutex<Option<Principal>>,
    protocol: Mutex<String>,
    target_name: Mutex<Option<String>>,
}

#[allow(dead_code)]
impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedProvider {
            next_handle: AtomicU64::new(1),
            created: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            token_steps: Mutex::new(VecDeque::new()),
            digest_steps: Mutex::new(VecDeque::new()),
            accept_calls: AtomicUsize::new(0),
            identity: Mutex::new(None),
            protocol: Mutex::new("NTLM".to_string()),
            target_name: Mutex::new(None),
        })
    }

    pub fn push_token_step(&self, step: TokenStep) {
        self.token_steps.lock().unwrap().push_back(step);
    }

    pub fn push_digest_step(&self, step: DigestStep) {
        self.digest_steps.lock().unwrap().push_back(step);
    }

    pub fn set_identity(&self, principal: Principal) {
        *self.identity.lock().unwrap() = Some(principal);
    }

    pub fn set_protocol(&self, protocol: &str) {
        *self.protocol.lock().unwrap() = protocol.to_string();
    }

    pub fn set_target_name(&self, name: Option<&str>) {
        *self.target_name.lock().unwrap() = name.map(str::to_string);
    }

    /// Handles created so far, in creation order.
    pub fn created_handles(&self) -> Vec<ContextHandle> {
        self.created.lock().unwrap().iter().map(|(h, _)| *h).collect()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn release_count(&self, handle: ContextHandle) -> usize {
        self.releases
            .lock()
            .unwrap()
            .iter()
            .filter(|h| **h == handle)
            .count()
    }

    /// True when every created context was released exactly once.
    pub fn all_released_once(&self) -> bool {
        let created = self.created.lock().unwrap();
        created
            .iter()
            .all(|(handle, _)| self.release_count(*handle) == 1)
    }

    pub fn accept_calls(&self) -> usize {
        self.accept_calls.load(Ordering::SeqCst)
    }
}

impl SecurityProvider for ScriptedProvider {
    fn create_context(
        &self,
        package: &str,
        _flags: ContextFlags,
        _binding: Option<&ChannelBinding>,
    ) -> Result<ContextHandle, ProviderError> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.created
            .lock()
            .unwrap()
            .push((handle, package.to_string()));
        Ok(handle)
    }

    fn accept_token(&self, _ctx: ContextHandle, _input: &[u8]) -> TokenStep {
        self.accept_calls.fetch_add(1, Ordering::SeqCst);
        self.token_steps.lock().unwrap().pop_front().unwrap_or(TokenStep {
            output: Some(b"continue".to_vec()),
            status: SecurityStatus::ContinueNeeded,
            complete: false,
        })
    }

    fn accept_digest_token(
        &self,
        _ctx: ContextHandle,
        _verb: &str,
        _realm: &str,
        _input: Option<&str>,
    ) -> DigestStep {
        self.digest_steps.lock().unwrap().pop_front().unwrap_or(DigestStep {
            output: Some("qop=\"auth\", nonce=\"fresh\"".to_string()),
            status: SecurityStatus::ContinueNeeded,
            complete: false,
        })
    }

    fn query_identity(&self, _ctx: ContextHandle) -> Result<Principal, SecurityStatus> {
        self.identity
            .lock()
            .unwrap()
            .clone()
            .ok_or(SecurityStatus::NoImpersonation)
    }

    fn negotiated_protocol(&self, _ctx: ContextHandle) -> String {
        self.protocol.lock().unwrap().clone()
    }

    fn client_target_name(&self, _ctx: ContextHandle) -> Option<String> {
        self.target_name.lock().unwrap().clone()
    }

    fn release_context(&self, ctx: ContextHandle) {
        self.releases.lock().unwrap().push(ctx);
    }
}

/// Transport that records every response and holds disconnect callbacks
/// until the test fires them.
pub struct RecordingTransport {
    responses: Mutex<Vec<(u64, StatusCode, Vec<String>)>>,
    canceled: Mutex<Vec<u64>>,
    pending: Mutex<Vec<(u64, DisconnectNotify)>>,
    fail_registration: AtomicBool,
    fail_send: AtomicBool,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingTransport {
            responses: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            fail_registration: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
        })
    }

    pub fn set_fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn responses(&self) -> Vec<(u64, StatusCode, Vec<String>)> {
        self.responses.lock().unwrap().clone()
    }

    pub fn last_response(&self) -> Option<(u64, StatusCode, Vec<String>)> {
        self.responses.lock().unwrap().last().cloned()
    }

    pub fn canceled(&self) -> Vec<u64> {
        self.canceled.lock().unwrap().clone()
    }

    pub fn pending_disconnects(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Deliver the disconnect notification for `connection_id`.
    pub fn fire_disconnect(&self, connection_id: u64) {
        let notify = {
            let mut pending = self.pending.lock().unwrap();
            let index = pending
                .iter()
                .position(|(id, _)| *id == connection_id)
                .expect("no pending disconnect wait for connection");
            pending.remove(index).1
        };
        notify();
    }
}

impl RequestQueueTransport for RecordingTransport {
    fn send_auth_response(
        &self,
        request_id: u64,
        status: StatusCode,
        challenges: &[String],
    ) -> Result<(), QueueError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("send refused".to_string()));
        }
        self.responses
            .lock()
            .unwrap()
            .push((request_id, status, challenges.to_vec()));
        Ok(())
    }

    fn cancel_request(&self, request_id: u64) {
        self.canceled.lock().unwrap().push(request_id);
    }

    fn wait_for_disconnect(
        &self,
        connection_id: u64,
        notify: DisconnectNotify,
    ) -> Result<(), QueueError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("wait refused".to_string()));
        }
        self.pending.lock().unwrap().push((connection_id, notify));
        Ok(())
    }

    fn channel_binding_token(&self, _connection_id: u64) -> Option<ChannelBinding> {
        None
    }
}

/// Request descriptor with test defaults.
#[allow(dead_code)]
pub fn request(connection_id: u64, request_id: u64, authorization: Option<&str>) -> RequestDescriptor {
    RequestDescriptor {
        connection_id,
        request_id,
        verb: "GET".to_string(),
        authorization: authorization.map(str::to_string),
        secure_connection: false,
        remote_addr: None,
    }
}
