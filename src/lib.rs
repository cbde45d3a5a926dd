//! Connection-oriented HTTP authentication over a kernel request queue.
//!
//! The kernel HTTP engine parses requests and hands them to this crate as
//! [`queue::RequestDescriptor`]s. The crate layers Negotiate/NTLM/Digest/Basic
//! authentication on top: it matches requests to in-progress security contexts,
//! drives multi-round handshakes, keeps retired Digest contexts alive in a bounded
//! cache, and coordinates with asynchronous disconnect notifications so that
//! per-connection state is released exactly once.

pub mod auth;
pub mod config;
pub mod listener;
pub mod net;
pub mod queue;

pub use auth::orchestrator::{AuthOutcome, AuthenticatedRequest};
pub use config::schema::AuthConfig;
pub use listener::AuthListener;
