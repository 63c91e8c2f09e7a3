//! Network core of a BMC web server: connection state machine, TLS, limits,
//! upgrades and the accept loop.

pub mod config;
pub mod fs;
pub mod handler;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;

pub use config::schema::ServerConfig;
pub use handler::{RequestHandler, UpgradeOutcome};
pub use http::{ConnectionContext, ConnectionSettings, HttpServer};
pub use lifecycle::Shutdown;
