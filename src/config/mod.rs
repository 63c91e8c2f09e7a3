//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → ConnectionSettings / listener / TLS provider built from it
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only certificates reload at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_or_default, ConfigError};
pub use schema::{
    AuthConfig, LimitsConfig, ListenerConfig, ObservabilityConfig, ServerConfig, TimeoutConfig,
    TlsConfig,
};
