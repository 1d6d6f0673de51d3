/// Process-level server: the shared listening socket, the audit log writer
/// and the worker threads
pub mod context;
pub mod worker;

pub use context::WorkerContext;
pub use worker::{SharedContext, Worker};

use crate::config::{Config, Registry};
use crate::core::connection::bind_listener;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::sqllog::{self, SqlLogSender};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Server {
    config: Arc<Config>,
    registry: Registry,
}

impl Server {
    pub fn new(config: Config, registry: Registry) -> Self {
        Self {
            config: Arc::new(config),
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the socket all workers accept on
    pub fn bind(&self) -> ProxyResult<std::net::TcpListener> {
        let addr = self.config.listen_addr()?;
        let listener = bind_listener(addr)?;
        info!("listening on {}", addr);
        Ok(listener)
    }

    /// Start the workers on `listener` and wait for them to stop
    pub fn serve(self, listener: std::net::TcpListener) -> ProxyResult<()> {
        let (sqllog, writer) = match sqllog::start(&self.config.sqllog) {
            Ok((sender, handle)) => (sender, Some(handle)),
            Err(e) => {
                warn!("sql log {} disabled: {}", self.config.sqllog.display(), e);
                (SqlLogSender::disabled(), None)
            }
        };

        let mut handles = Vec::with_capacity(self.config.worker);
        for id in 0..self.config.worker {
            let worker = Worker::new(id, Arc::clone(&self.config), self.registry.clone(), sqllog.clone());
            handles.push(worker.spawn(listener.try_clone()?)?);
        }
        info!("{} workers started", handles.len());
        drop(sqllog);

        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("worker stopped: {}", e);
                    result = Err(e);
                }
                Err(_) => result = Err(ProxyError::internal("worker thread panicked")),
            }
        }

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        result
    }

    pub fn run(self) -> ProxyResult<()> {
        let listener = self.bind()?;
        self.serve(listener)
    }
}
