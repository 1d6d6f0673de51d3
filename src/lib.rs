/// mygate - transparent MySQL proxy with read/write splitting
///
/// Clients log in to the proxy with one configured account. Each command is
/// classified and forwarded over a warm pool of backend connections: reads
/// go to slaves, writes and transactions to masters, and replies are relayed
/// back untouched.
pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod utils;

pub use config::{Config, ConfigError, Registry};
pub use error::{ProxyError, ProxyResult};
pub use server::Server;

use tracing::info;

/// A configured proxy instance
pub struct Mygate {
    server: Server,
    listener: Option<std::net::TcpListener>,
}

impl Mygate {
    pub fn new(config: Config, registry: Registry) -> Self {
        Self {
            server: Server::new(config, registry),
            listener: None,
        }
    }

    pub fn config(&self) -> &Config {
        self.server.config()
    }

    /// Bind the listening socket
    pub fn initialize(&mut self) -> ProxyResult<()> {
        self.listener = Some(self.server.bind()?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.listener.is_some()
    }

    /// Address actually bound, once initialized
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serve until every worker stops
    pub fn run(self) -> ProxyResult<()> {
        let listener = self
            .listener
            .ok_or_else(|| ProxyError::internal("Server not initialized. Call initialize() first."))?;
        info!(
            "Starting mygate v{} with {} workers",
            env!("CARGO_PKG_VERSION"),
            self.server.config().worker
        );
        self.server.serve(listener)
    }
}
