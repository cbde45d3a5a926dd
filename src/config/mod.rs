//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AuthConfig (validated, immutable)
//!     → consumed by the listener at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a listener restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::AuthConfig;
pub use schema::DigestCacheConfig;
