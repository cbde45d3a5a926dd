//! Interface to the kernel request-queue collaborator.
//!
//! # Responsibilities
//! - Describe one parsed inbound request ([`RequestDescriptor`])
//! - Define what the core needs back from the queue: error/challenge responses,
//!   request cancellation, disconnect waits, and channel-binding lookup
//!
//! The byte-level queue I/O and request parsing live outside this crate; the
//! engine hands the core already-extracted fields.

use std::net::SocketAddr;

use http::StatusCode;
use thiserror::Error;

use crate::auth::provider::ChannelBinding;

/// One parsed inbound request, as delivered by the kernel HTTP engine.
///
/// Immutable once produced; consumed by one authentication pass and not
/// retained.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    /// Kernel connection handle. Stable across requests and retries on the
    /// same connection.
    pub connection_id: u64,
    /// Kernel request handle; reused when the client retries after a 401.
    pub request_id: u64,
    /// HTTP verb, as parsed by the engine.
    pub verb: String,
    /// Raw `Authorization` header value, if the request carried one.
    pub authorization: Option<String>,
    /// True when the request arrived over the engine's secure channel.
    pub secure_connection: bool,
    /// Remote endpoint, for logging and SPN diagnostics.
    pub remote_addr: Option<SocketAddr>,
}

/// Callback invoked by the transport when a connection closes. Fires at most
/// once per registration, on an arbitrary thread.
pub type DisconnectNotify = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue is shut down")]
    Closed,
    #[error("request queue transport failure: {0}")]
    Transport(String),
}

/// Operations the authentication core performs against the request queue.
pub trait RequestQueueTransport: Send + Sync {
    /// Send a zero-length response with the given status and one
    /// `WWW-Authenticate` header per challenge, over the still-pending request.
    fn send_auth_response(
        &self,
        request_id: u64,
        status: StatusCode,
        challenges: &[String],
    ) -> Result<(), QueueError>;

    /// Abort a request whose error response could not be sent.
    fn cancel_request(&self, request_id: u64);

    /// Register an asynchronous disconnect wait for a connection. `notify` is
    /// invoked once, later, when the kernel signals the disconnect; it may fire
    /// before this call's own stack frame returns.
    fn wait_for_disconnect(
        &self,
        connection_id: u64,
        notify: DisconnectNotify,
    ) -> Result<(), QueueError>;

    /// Fetch the channel-binding token negotiated on the connection's secure
    /// channel, if the transport has one.
    fn channel_binding_token(&self, connection_id: u64) -> Option<ChannelBinding>;
}
