//! Per-connection lifecycle tracking.
//!
//! # Data Flow
//! ```text
//! Kernel disconnect wait registered (per connection)
//!     → disconnect.rs (ownership state machine, cleanup)
//!     → retired sessions routed to the digest cache or closed
//!
//! Ownership States:
//!     Idle → InUse → (Idle | Disconnected) → CleanedUp
//! ```

pub mod disconnect;

pub use disconnect::{DisconnectRecord, DisconnectTracker, OwnedDisconnect};
