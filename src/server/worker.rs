/// Worker threads
///
/// A worker is one OS thread running a current-thread runtime with a
/// `LocalSet`. It owns a full context (pool, sessions, timers) and shares
/// only the listening socket with its siblings. Besides client sessions it
/// runs three kinds of local tasks: backend handshakes, keepalive probes,
/// and the once-a-second maintenance tick.
use super::context::WorkerContext;
use crate::config::{Config, NodeSpec, Registry};
use crate::core::backend::handshake;
use crate::core::connection::configure_stream;
use crate::error::ProxyResult;
use crate::health::{probe, HealthChecker, MysqlPingChecker};
use crate::pool::{ConnId, ConnectTarget};
use crate::proxy::{run_session, SqlLogSender};
use crate::utils::format_duration;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{spawn_local, LocalSet};
use tracing::{debug, error, info, warn};

pub type SharedContext = Rc<RefCell<WorkerContext>>;

const TICK: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Expired sessions closed per state and tick
const SWEEP_CAP: usize = 30;
/// Keepalive probes started per node and tick
const PING_BATCH: usize = 3;
/// Failed connections retried per node and tick
const RETRY_BATCH: usize = 1;
/// Dead connections reconnected per node and tick
const DEAD_BATCH: usize = 8;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Register a node and start its handshakes
pub fn register_node(ctx: &SharedContext, spec: NodeSpec) -> ProxyResult<()> {
    let key = spec.key();
    let targets = ctx.borrow_mut().pool.register(spec, Instant::now())?;
    info!("registered {} with {} connections", key, targets.len());
    for target in targets {
        spawn_handshake(ctx, target);
    }
    Ok(())
}

/// Log a Raw connection into its backend in the background
pub fn spawn_handshake(ctx: &SharedContext, target: ConnectTarget) {
    let id = target.id;
    let limit = ctx.borrow().config.ping_timeout();
    let task_ctx = Rc::clone(ctx);

    let task = spawn_local(async move {
        let result = handshake(&target, limit).await;
        let mut ctx = task_ctx.borrow_mut();
        ctx.tasks.remove(&target.id);
        let now = Instant::now();
        match result {
            Ok((link, info)) => {
                if ctx.pool.connect_ok(target.id, link, info, now) {
                    ctx.wake_acceptor();
                }
            }
            Err(e) if e.is_recoverable() => {
                debug!("handshake with {} failed: {}", target.addr, e);
                ctx.pool.connect_failed(target.id, now);
            }
            Err(e) => {
                warn!("handshake with {} failed: {}", target.addr, e);
                ctx.pool.connect_failed(target.id, now);
            }
        }
    });
    ctx.borrow_mut().tasks.insert(id, task.abort_handle());
}

/// Probe an idle connection the pool handed out for keepalive
pub fn spawn_ping(ctx: &SharedContext, checker: Arc<dyn HealthChecker>, id: ConnId, link: TcpStream) {
    let task_ctx = Rc::clone(ctx);

    let task = spawn_local(async move {
        let status = probe(checker.as_ref(), &link).await;
        let mut ctx = task_ctx.borrow_mut();
        ctx.tasks.remove(&id);
        let now = Instant::now();
        if status.is_healthy() {
            if ctx.pool.ping_ok(id, link, now) {
                ctx.wake_acceptor();
            }
        } else {
            debug!("keepalive on {} failed: {}", id, status);
            ctx.pool.ping_failed(id, now);
        }
    });
    ctx.borrow_mut().tasks.insert(id, task.abort_handle());
}

/// One maintenance pass: expire sessions and probes, tear down closing
/// nodes and reconnect broken connections
pub fn tick(ctx: &SharedContext, now: Instant) {
    let targets = {
        let mut guard = ctx.borrow_mut();
        let ctx = &mut *guard;
        let timeouts = ctx.config.session_timeouts();
        ctx.sessions.sweep(now, &timeouts, SWEEP_CAP);

        for id in ctx.pool.expire_pings(now, ctx.config.ping_timeout(), PING_BATCH) {
            debug!("keepalive on {} timed out", id);
            ctx.abort_task(id);
        }

        for closed in ctx.pool.sweep_closing(now, ctx.config.closing_delay()) {
            for session in closed.sessions {
                ctx.sessions.cancel(session);
            }
            for conn in closed.conns {
                ctx.abort_task(conn);
            }
        }

        let mut targets = ctx.pool.take_dead(DEAD_BATCH, now);
        targets.extend(ctx.pool.take_failed(RETRY_BATCH, now));
        targets
    };

    for target in targets {
        spawn_handshake(ctx, target);
    }
}

/// Start a keepalive probe on a bounded batch of idle connections per node
pub fn start_keepalives(ctx: &SharedContext, checker: &Arc<dyn HealthChecker>, now: Instant) {
    let probes = ctx.borrow_mut().pool.take_for_ping(PING_BATCH, now);
    for (id, link) in probes {
        spawn_ping(ctx, Arc::clone(checker), id, link);
    }
}

/// Paces keepalive rounds to the checker's interval
struct Keepalive {
    checker: Arc<dyn HealthChecker>,
    last: Option<Instant>,
}

impl Keepalive {
    fn new(checker: Arc<dyn HealthChecker>) -> Self {
        Self { checker, last: None }
    }

    fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.checker.check_interval() => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Log the bucket sizes of every node
pub fn report_status(ctx: &SharedContext) {
    let ctx = ctx.borrow();
    let states: Vec<String> = ctx
        .sessions
        .counts()
        .into_iter()
        .filter(|(_, n)| *n > 0)
        .map(|(state, n)| format!("{}:{}", state, n))
        .collect();
    info!(
        "worker {}: {} sessions in {} slots [{}]",
        ctx.worker_id,
        ctx.sessions.len(),
        ctx.sessions.allocated(),
        states.join(" ")
    );
    for status in ctx.pool.status() {
        info!("worker {}: {}", ctx.worker_id, status);
    }
}

async fn tick_loop(ctx: SharedContext, checker: Arc<dyn HealthChecker>) {
    let mut interval = tokio::time::interval(TICK);
    let mut keepalive = Keepalive::new(checker);
    let mut last_report = Instant::now();
    loop {
        interval.tick().await;
        let now = Instant::now();
        tick(&ctx, now);
        if keepalive.due(now) {
            start_keepalives(&ctx, &keepalive.checker, now);
        }
        if now.duration_since(last_report) >= STATUS_INTERVAL {
            report_status(&ctx);
            last_report = now;
        }
    }
}

/// Move the pool to `next`: removed nodes are unregistered gracefully,
/// added ones registered. Running sessions are left alone.
pub fn apply_registry(ctx: &SharedContext, next: Registry) {
    let diff = ctx.borrow().registry.diff(&next);
    if diff.is_empty() {
        info!("registry unchanged");
        return;
    }

    let now = Instant::now();
    let delay = format_duration(ctx.borrow().config.closing_delay());
    for key in &diff.removed {
        if ctx.borrow_mut().pool.unregister(key, now) {
            info!("unregistered {}, closing in {}", key, delay);
        }
    }
    for spec in diff.added {
        let key = spec.key();
        if let Err(e) = register_node(ctx, spec) {
            warn!("cannot register {}: {}", key, e);
        }
    }
    for key in &diff.changed {
        warn!("{} changed in place, skipped; remove it and reload, then add it back", key);
    }

    let mut ctx = ctx.borrow_mut();
    let recorded = next.keep_running(&ctx.registry, &diff.changed);
    ctx.registry = recorded;
}

/// Re-read the registry file and apply it
pub fn reload(ctx: &SharedContext) -> ProxyResult<()> {
    let config = Arc::clone(&ctx.borrow().config);
    let next = config.load_registry()?;
    apply_registry(ctx, next);
    Ok(())
}

#[cfg(unix)]
async fn reload_loop(ctx: SharedContext) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot listen for SIGUSR1: {}", e);
            return;
        }
    };
    while usr1.recv().await.is_some() {
        info!("worker {}: reloading registry", ctx.borrow().worker_id);
        if let Err(e) = reload(&ctx) {
            error!("registry reload failed: {}", e);
        }
    }
}

/// Accept clients while the pool has something to offer
pub async fn accept_loop(ctx: SharedContext, listener: TcpListener) {
    let avail = ctx.borrow().avail_signal();
    loop {
        while !ctx.borrow().pool.have_available() {
            avail.notified().await;
        }

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        configure_stream(&stream);

        let opened = ctx.borrow_mut().sessions.open(peer, Instant::now());
        match opened {
            Ok(ticket) => {
                debug!("conn:{} accepted {}", ticket.conn_id, peer);
                spawn_local(run_session(Rc::clone(&ctx), stream, peer, ticket));
            }
            Err(e) => warn!("rejecting {}: {}", peer, e),
        }
    }
}

/// One worker thread's configuration
pub struct Worker {
    id: usize,
    config: Arc<Config>,
    registry: Registry,
    sqllog: SqlLogSender,
}

impl Worker {
    pub fn new(id: usize, config: Arc<Config>, registry: Registry, sqllog: SqlLogSender) -> Self {
        Self {
            id,
            config,
            registry,
            sqllog,
        }
    }

    /// Run the worker on its own thread
    pub fn spawn(self, listener: std::net::TcpListener) -> io::Result<thread::JoinHandle<ProxyResult<()>>> {
        thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || self.run(listener))
    }

    /// Run the worker on the calling thread until the accept loop stops
    pub fn run(self, listener: std::net::TcpListener) -> ProxyResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = LocalSet::new();
        local.block_on(&runtime, self.serve(listener))
    }

    async fn serve(self, listener: std::net::TcpListener) -> ProxyResult<()> {
        let listener = TcpListener::from_std(listener)?;
        let specs = self.registry.nodes().to_vec();
        let checker: Arc<dyn HealthChecker> = Arc::new(MysqlPingChecker::new(self.config.ping_timeout()));
        let ctx: SharedContext = Rc::new(RefCell::new(WorkerContext::new(
            self.id,
            self.config,
            self.registry,
            self.sqllog,
        )));

        for spec in specs {
            register_node(&ctx, spec)?;
        }

        spawn_local(tick_loop(Rc::clone(&ctx), checker));
        #[cfg(unix)]
        spawn_local(reload_loop(Rc::clone(&ctx)));

        info!("worker {} accepting on {}", self.id, listener.local_addr()?);
        accept_loop(ctx, listener).await;
        Ok(())
    }
}
