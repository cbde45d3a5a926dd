//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (cache capacity, lifetime ordering)
//! - Catch scheme/realm combinations that can only fail at runtime
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AuthConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::auth::spn::PolicyEnforcement;
use crate::auth::SchemeSet;
use crate::config::schema::AuthConfig;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown authentication scheme '{0}'")]
    UnknownScheme(String),

    #[error("no authentication schemes configured")]
    NoSchemes,

    #[error("digest cache capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),

    #[error("digest cache lifetime {lifetime_secs}s is below the minimum floor {minimum_secs}s")]
    LifetimeBelowFloor { lifetime_secs: u64, minimum_secs: u64 },

    #[error("realm must be set when the '{0}' scheme is allowed")]
    RealmRequired(&'static str),

    #[error("extended protection 'always' needs service names or a custom list")]
    ServiceNamesRequired,
}

/// Check everything serde cannot. Collects every problem found.
pub fn validate_config(config: &AuthConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.schemes.is_empty() {
        errors.push(ValidationError::NoSchemes);
    }
    for name in &config.schemes {
        if SchemeSet::parse_name(name).is_none() {
            errors.push(ValidationError::UnknownScheme(name.clone()));
        }
    }

    let cache = &config.digest_cache;
    if cache.capacity == 0 || !cache.capacity.is_power_of_two() {
        errors.push(ValidationError::CapacityNotPowerOfTwo(cache.capacity));
    }
    if cache.lifetime_secs < cache.minimum_lifetime_secs {
        errors.push(ValidationError::LifetimeBelowFloor {
            lifetime_secs: cache.lifetime_secs,
            minimum_secs: cache.minimum_lifetime_secs,
        });
    }

    let schemes = config.scheme_set();
    if config.realm.is_empty() {
        if schemes.contains(SchemeSet::BASIC) {
            errors.push(ValidationError::RealmRequired("basic"));
        }
        if schemes.contains(SchemeSet::DIGEST) {
            errors.push(ValidationError::RealmRequired("digest"));
        }
    }

    if config.extended_protection.enforcement == PolicyEnforcement::Always
        && config.service_names.is_empty()
        && config.extended_protection.custom_service_names.is_none()
    {
        errors.push(ValidationError::ServiceNamesRequired);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
