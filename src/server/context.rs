/// Per-worker shared state
///
/// Every task of a worker holds an `Rc<RefCell<WorkerContext>>`. Borrows
/// are short and never span an `.await`.
use crate::config::{Config, Registry};
use crate::core::{Credentials, SessionId, SessionTable};
use crate::error::ProxyResult;
use crate::pool::{BackendLease, ConnId, ConnState, NodePool};
use crate::proxy::route::{acquire_backend, RoutingDecision};
use crate::proxy::sqllog::SqlLogSender;
use fnv::FnvHashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

pub struct WorkerContext {
    pub worker_id: usize,
    pub config: Arc<Config>,
    pub credentials: Credentials,
    pub pool: NodePool<TcpStream>,
    pub sessions: SessionTable,
    /// Registry the pool was last built from
    pub registry: Registry,
    /// Handshake and keepalive tasks driving connections outside the pool
    pub tasks: FnvHashMap<ConnId, AbortHandle>,
    pub sqllog: SqlLogSender,
    avail: Rc<Notify>,
}

impl WorkerContext {
    pub fn new(worker_id: usize, config: Arc<Config>, registry: Registry, sqllog: SqlLogSender) -> Self {
        Self {
            worker_id,
            credentials: Credentials::new(config.user.clone(), config.passwd.clone()),
            pool: NodePool::new(config.role_limits(), config.max_connections),
            sessions: SessionTable::new(config.max_connections),
            registry,
            tasks: FnvHashMap::default(),
            sqllog,
            avail: Rc::new(Notify::new()),
            config,
        }
    }

    /// Signalled whenever a connection may have become available
    pub fn avail_signal(&self) -> Rc<Notify> {
        Rc::clone(&self.avail)
    }

    /// Wake the accept loop if anything is selectable
    pub fn wake_acceptor(&self) {
        if self.pool.have_available() {
            self.avail.notify_one();
        }
    }

    /// Route a session's next command onto a suitable backend
    pub fn acquire(
        &mut self,
        slot: &mut Option<BackendLease<TcpStream>>,
        decision: RoutingDecision,
        client: &SocketAddr,
        session: SessionId,
        now: Instant,
    ) -> ProxyResult<()> {
        let before = slot.as_ref().map(|lease| lease.id);
        let result = acquire_backend(&mut self.pool, slot, decision, client, session, now);
        let after = slot.as_ref().map(|lease| lease.id);
        if before != after {
            self.sessions.bind(session, after);
            if before.is_some() {
                self.wake_acceptor();
            }
        }
        result
    }

    /// Hand a session's backend back to the pool
    pub fn release(&mut self, lease: BackendLease<TcpStream>, now: Instant) {
        if self.pool.release(lease, now) == Some(ConnState::Avail) {
            self.avail.notify_one();
        }
    }

    /// Close a session's backend after an error
    pub fn discard(&mut self, lease: BackendLease<TcpStream>, now: Instant) {
        self.pool.discard(lease, now);
    }

    /// Stop the task driving `conn`, if any
    pub fn abort_task(&mut self, conn: ConnId) {
        if let Some(handle) = self.tasks.remove(&conn) {
            handle.abort();
        }
    }
}
