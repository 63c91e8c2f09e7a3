//! bmcweb network core.
//!
//! # Architecture Overview
//!
//! ```text
//!                      ┌───────────────────────────────────────────────────┐
//!                      │                      bmcweb                        │
//!                      │                                                    │
//!   Client ────────────┼─▶ net::listener ─▶ http::server ─▶ http::connection│
//!                      │                        │               │           │
//!                      │              cert watch│      TLS / ALPN / limits  │
//!                      │                 (fs)   │               │           │
//!                      │                        ▼               ▼           │
//!                      │                  net::tls        RequestHandler    │
//!                      │                                  (axum router)     │
//!                      │                                        │           │
//!   Client ◀───────────┼──────────── http::response ◀───────────┘           │
//!                      │                                                    │
//!                      │   config · security · lifecycle · observability    │
//!                      └───────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bmcweb_core::config::{load_or_default, validation::validate_config, ConfigError};
use bmcweb_core::handler::router::{service_root, RouterHandler};
use bmcweb_core::http::{ConnectionContext, ConnectionSettings, DateCache, Http2Handoff, HttpServer, HyperHttp2};
use bmcweb_core::net::connection::ConnectionTracker;
use bmcweb_core::net::listener::Listener;
use bmcweb_core::net::tls::PemCertificateProvider;
use bmcweb_core::observability::{logging, metrics};
use bmcweb_core::security::auth::{common_name, Authenticator, SessionAuthenticator};
use bmcweb_core::security::session::{MemorySessionStore, SessionStore};

#[derive(Parser)]
#[command(name = "bmcweb")]
#[command(about = "BMC web server", long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it does not exist.
    #[arg(short, long, default_value = "/etc/bmcweb/bmcweb.toml")]
    config: PathBuf,

    /// Override `listener.bind_address`.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_or_default(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    logging::init(&config.observability)?;
    tracing::info!("bmcweb v{} starting", env!("CARGO_PKG_VERSION"));

    if let Some(address) = &config.observability.metrics_address {
        let addr: SocketAddr = address.parse()?;
        metrics::init_metrics(addr)?;
        tracing::info!(address = %addr, "Metrics exporter listening");
    }

    let settings = ConnectionSettings::from_config(&config);
    let body_limit = usize::try_from(settings.body_limit).unwrap_or(usize::MAX);

    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let auth: Arc<dyn Authenticator> = Arc::new(
        SessionAuthenticator::new(Arc::clone(&sessions), config.auth.enabled)
            .with_allowlist(config.auth.allowlist.clone())
            .with_mtls_mapper(common_name),
    );
    let http2: Option<Arc<dyn Http2Handoff>> = if config.listener.tls && config.tls.http2 {
        Some(Arc::new(HyperHttp2::new(Arc::clone(&auth), body_limit)))
    } else {
        None
    };

    let ctx = ConnectionContext {
        handler: Arc::new(RouterHandler::new(service_root(), body_limit)),
        auth,
        sessions,
        http2,
        settings: Arc::new(settings),
        tracker: ConnectionTracker::new(config.listener.max_connections),
        date: DateCache::new(),
    };

    tracing::info!(
        bind_address = %config.listener.bind_address,
        tls = config.listener.tls,
        max_connections = config.listener.max_connections,
        response_timeout_secs = config.timeouts.response_secs,
        body_limit_mb = config.limits.body_limit_mb,
        "Configuration loaded"
    );

    let inherited = if config.listener.inherit_socket {
        Listener::inherited()?
    } else {
        None
    };
    let listener = match inherited {
        Some(listener) => {
            tracing::info!("Using socket from service manager");
            listener
        }
        None => Listener::bind(&config.listener.bind_address).await?,
    };

    let mut server = HttpServer::new(listener, ctx)
        .with_drain_timeout(Duration::from_secs(config.timeouts.drain_secs));
    if config.listener.tls {
        let provider = PemCertificateProvider::new(
            Some(config.tls.trust_store.clone()),
            config.tls.http2,
            config.tls.mutual_tls,
        );
        server = server.with_tls(Arc::new(provider), config.tls.cert_path());
    }

    server.run().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
