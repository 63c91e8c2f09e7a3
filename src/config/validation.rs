//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ceiling, timeouts, body limit)
//! - Validate addresses parse before anything binds
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::security::limits::MAX_CONNECTIONS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address '{0}' is not a socket address")]
    BindAddress(String),

    #[error("listener.max_connections must be between 1 and {max}, got {0}", max = MAX_CONNECTIONS)]
    MaxConnections(usize),

    #[error("tls.cert_file must not be empty")]
    CertFile,

    #[error("limits.body_limit_mb must be greater than zero")]
    BodyLimit,

    #[error("timeouts.{0} must be greater than zero")]
    Timeout(&'static str),

    #[error("observability.metrics_address '{0}' is not a socket address")]
    MetricsAddress(String),
}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    let max = config.listener.max_connections;
    if max == 0 || max > MAX_CONNECTIONS {
        errors.push(ValidationError::MaxConnections(max));
    }
    if config.listener.tls && config.tls.cert_file.trim().is_empty() {
        errors.push(ValidationError::CertFile);
    }
    if config.limits.body_limit_mb == 0 {
        errors.push(ValidationError::BodyLimit);
    }
    if config.timeouts.response_secs == 0 {
        errors.push(ValidationError::Timeout("response_secs"));
    }
    if config.timeouts.drain_secs == 0 {
        errors.push(ValidationError::Timeout("drain_secs"));
    }
    if let Some(addr) = &config.observability.metrics_address {
        if addr.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::MetricsAddress(addr.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
