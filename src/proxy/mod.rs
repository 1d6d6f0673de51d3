/// Client sessions
///
/// One task per accepted client runs the session state machine: greeting
/// and login, then a loop of reading a command, answering it locally or
/// forwarding it to a master or slave, and relaying the backend's reply.
/// Replies are relayed as opaque bytes; the proxy never parses result sets.
pub mod route;
pub mod sqllog;

pub use route::{classify, Requirement, RoutingDecision};
pub use sqllog::{SqlLogSender, SqlRecord};

use crate::core::backend::init_db;
use crate::core::connection::{interrupted, is_quiet, read_available, read_packet, write_buffer};
use crate::core::frontend::{read_login, send_error, send_greeting, send_ok};
use crate::core::{SessionId, SessionState, SessionTicket};
use crate::error::{ErrorSeverity, ProxyError, ProxyResult};
use crate::pool::BackendLease;
use crate::protocol::{AuthResult, Buffer, Command, CommandPacket, ErrorPacket, Progress};
use crate::server::WorkerContext;
use chrono::{DateTime, Local};
use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// What woke an idle session
enum Wake {
    /// Client bytes are buffered
    Client,
    /// Backend bytes are buffered for relay
    Backend,
}

enum Ready {
    Client,
    Backend,
    BackendFailed(io::Error),
}

/// Audit entry of the command in progress
struct PendingLog {
    at: DateTime<Local>,
    started: Instant,
    text: String,
}

pub struct ProxySession {
    ctx: Rc<RefCell<WorkerContext>>,
    id: SessionId,
    conn_id: u32,
    peer: SocketAddr,
    client: TcpStream,
    /// Client packets in, proxy replies out
    buf: Buffer,
    /// Backend bytes on their way to the client
    relay: Buffer,
    backend: Option<BackendLease<TcpStream>>,
    /// Database the client asked for, applied lazily per backend
    database: String,
    state: SessionState,
    pending: Option<PendingLog>,
}

/// Drive one client session until it closes or is cancelled
pub async fn run_session(ctx: Rc<RefCell<WorkerContext>>, client: TcpStream, peer: SocketAddr, ticket: SessionTicket) {
    let cancel = ticket.cancel.clone();
    let mut session = ProxySession::new(ctx, client, peer, &ticket);
    let result = tokio::select! {
        r = session.serve() => r,
        _ = cancel.cancelled() => Err(ProxyError::timeout("session cancelled")),
    };
    session.finish(result);
}

fn bound(backend: &Option<BackendLease<TcpStream>>) -> ProxyResult<&BackendLease<TcpStream>> {
    backend
        .as_ref()
        .ok_or_else(|| ProxyError::internal("no backend bound"))
}

async fn backend_readable(link: Option<&TcpStream>) -> io::Result<()> {
    match link {
        Some(link) => link.readable().await,
        None => std::future::pending().await,
    }
}

/// Run a backend operation while making sure the client stays silent.
/// The outer error ends the session from the client side.
async fn guard<T>(client: &TcpStream, op: impl Future<Output = ProxyResult<T>>) -> ProxyResult<ProxyResult<T>> {
    tokio::select! {
        r = op => Ok(r),
        e = interrupted(client) => Err(e),
    }
}

impl ProxySession {
    fn new(ctx: Rc<RefCell<WorkerContext>>, client: TcpStream, peer: SocketAddr, ticket: &SessionTicket) -> Self {
        Self {
            ctx,
            id: ticket.id,
            conn_id: ticket.conn_id,
            peer,
            client,
            buf: Buffer::new(),
            relay: Buffer::new(),
            backend: None,
            database: String::new(),
            state: SessionState::Unavailable,
            pending: None,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.ctx
            .borrow_mut()
            .sessions
            .set_state(self.id, state, Instant::now());
    }

    async fn serve(&mut self) -> ProxyResult<()> {
        self.authenticate().await?;

        loop {
            match self.wait_idle().await? {
                Wake::Client => {
                    self.set_state(SessionState::ReadingClient);
                    self.flush_log();
                    read_packet(&self.client, &mut self.buf).await?;
                    if !self.dispatch().await? {
                        return Ok(());
                    }
                }
                Wake::Backend => self.write_client().await?,
            }
        }
    }

    async fn authenticate(&mut self) -> ProxyResult<()> {
        let info = self.ctx.borrow().pool.server_info();
        let challenge = send_greeting(&self.client, &mut self.buf, &info, self.conn_id).await?;
        let login = read_login(&self.client, &mut self.buf).await?;

        let accepted = self.ctx.borrow().credentials.accepts(&challenge, &login);
        if !accepted {
            self.set_state(SessionState::AuthFail);
            warn!("conn:{} {} access denied for user '{}'", self.conn_id, self.peer, login.user);
            send_error(&self.client, &mut self.buf, 2, &ErrorPacket::access_denied()).await?;
            return Err(ProxyError::auth(format!("access denied for user '{}'", login.user)));
        }

        self.set_state(SessionState::AuthSuccess);
        self.database = login.database;
        send_ok(&self.client, &mut self.buf, 2).await?;
        info!(
            "conn:{} {} logged in as '{}' db '{}'",
            self.conn_id, self.peer, login.user, self.database
        );
        Ok(())
    }

    /// Wait in Idle until the client starts a command or the backend has
    /// more reply bytes. Readiness alone is not trusted: something must
    /// actually have been read.
    async fn wait_idle(&mut self) -> ProxyResult<Wake> {
        self.set_state(SessionState::Idle);
        self.buf.reset();
        self.relay.reset();

        loop {
            let link = self.backend.as_ref().map(|lease| &lease.link);
            let ready = tokio::select! {
                r = self.client.readable() => {
                    r?;
                    Ready::Client
                }
                r = backend_readable(link) => match r {
                    Ok(()) => Ready::Backend,
                    Err(e) => Ready::BackendFailed(e),
                },
            };

            match ready {
                Ready::Client => match self.buf.read_packet(&self.client)? {
                    Progress::Done => return Ok(Wake::Client),
                    Progress::Pending if self.buf.used() > 0 => return Ok(Wake::Client),
                    Progress::Pending => {}
                },
                Ready::Backend => {
                    let Some(lease) = self.backend.as_ref() else { continue };
                    match self.relay.read_available(&lease.link) {
                        Ok(Progress::Done) => return Ok(Wake::Backend),
                        Ok(Progress::Pending) => {}
                        Err(e) => return Err(self.backend_failed(e)),
                    }
                }
                Ready::BackendFailed(e) => return Err(self.backend_failed(e.into())),
            }
        }
    }

    /// Handle one complete client packet. Returns false when the session
    /// must close.
    async fn dispatch(&mut self) -> ProxyResult<bool> {
        let (command, opcode, decision, text, arg) = {
            let cmd = CommandPacket::decode(self.buf.payload())?;
            (
                cmd.command(),
                cmd.opcode,
                classify(&cmd),
                sqllog::describe(&cmd),
                cmd.arg_text(),
            )
        };
        debug!("conn:{} {:?} {}", self.conn_id, command, text);
        self.pending = Some(PendingLog {
            at: Local::now(),
            started: Instant::now(),
            text,
        });

        match command {
            Command::Quit | Command::Shutdown => {
                // The client may already be gone.
                let _ = send_ok(&self.client, &mut self.buf, 1).await;
                Ok(false)
            }
            Command::Refresh | Command::ProcessKill | Command::Debug => {
                send_ok(&self.client, &mut self.buf, 1).await?;
                Ok(true)
            }
            Command::InitDb => {
                self.database = arg;
                send_ok(&self.client, &mut self.buf, 1).await?;
                Ok(true)
            }
            Command::BinlogDump | Command::TableDump | Command::RegisterSlave | Command::ChangeUser => {
                warn!("conn:{} {} unsupported command {:?}", self.conn_id, self.peer, command);
                send_error(&self.client, &mut self.buf, 1, &ErrorPacket::unsupported(opcode)).await?;
                Ok(false)
            }
            _ => {
                self.forward(decision).await?;
                Ok(true)
            }
        }
    }

    /// Send the buffered command to a suitable backend and relay the first
    /// bytes of its reply
    async fn forward(&mut self, decision: RoutingDecision) -> ProxyResult<()> {
        self.ctx
            .borrow_mut()
            .acquire(&mut self.backend, decision, &self.peer, self.id, Instant::now())?;

        if self.needs_init_db() {
            self.set_state(SessionState::PrepareMysql);
            if !self.prepare().await? {
                return Ok(());
            }
        }

        self.set_state(SessionState::WritingMysql);
        self.buf.rewind();
        let lease = bound(&self.backend)?;
        let result = guard(&self.client, write_buffer(&lease.link, &mut self.buf)).await?;
        self.check_backend(result)?;

        self.set_state(SessionState::ReadMysqlWriteClient);
        self.relay.reset();
        let lease = bound(&self.backend)?;
        let result = read_available(&lease.link, &mut self.relay).await;
        self.check_backend(result)?;

        self.write_client().await
    }

    fn needs_init_db(&self) -> bool {
        match &self.backend {
            Some(lease) => !self.database.is_empty() && lease.ctx.current_db != self.database,
            None => false,
        }
    }

    /// Switch the backend to the session's database. A refusal is relayed
    /// to the client in place of the command's reply; returns whether the
    /// command should still be forwarded.
    async fn prepare(&mut self) -> ProxyResult<bool> {
        let lease = bound(&self.backend)?;
        let result = guard(&self.client, init_db(&lease.link, &mut self.relay, &self.database)).await?;

        match self.check_backend(result)? {
            AuthResult::Ok => {
                if let Some(lease) = self.backend.as_mut() {
                    lease.ctx.current_db = self.database.clone();
                }
                Ok(true)
            }
            AuthResult::Err(err) => {
                debug!(
                    "conn:{} backend refused database '{}': {} {}",
                    self.conn_id, self.database, err.code, err.message
                );
                send_error(&self.client, &mut self.relay, 1, &err).await?;
                Ok(false)
            }
        }
    }

    /// Relay the buffered backend bytes to the client
    async fn write_client(&mut self) -> ProxyResult<()> {
        self.set_state(SessionState::ReadMysqlWriteClient);
        self.relay.rewind();
        write_buffer(&self.client, &mut self.relay).await?;
        self.relay.reset();
        Ok(())
    }

    fn check_backend<T>(&mut self, result: ProxyResult<T>) -> ProxyResult<T> {
        result.map_err(|e| self.backend_failed(e))
    }

    /// The backend connection broke; it goes back to the pool as Dead
    fn backend_failed(&mut self, err: ProxyError) -> ProxyError {
        if let Some(lease) = self.backend.take() {
            warn!("conn:{} backend {} failed: {}", self.conn_id, lease.addr, err);
            self.ctx.borrow_mut().discard(lease, Instant::now());
            self.ctx.borrow_mut().sessions.bind(self.id, None);
        }
        err
    }

    fn flush_log(&mut self) {
        if let Some(pending) = self.pending.take() {
            let record = SqlRecord {
                at: pending.at,
                conn_id: self.conn_id,
                client: self.peer,
                backend: self.backend.as_ref().map(|lease| lease.addr.clone()),
                elapsed: pending.started.elapsed(),
                text: pending.text,
            };
            self.ctx.borrow().sqllog.record(record);
        }
    }

    /// Tear down: audit the last command, return or close the backend and
    /// drop the supervisor entry
    fn finish(mut self, result: ProxyResult<()>) {
        self.flush_log();

        let now = Instant::now();
        let mut ctx = self.ctx.borrow_mut();
        ctx.sessions.close(self.id);

        if let Some(lease) = self.backend.take() {
            let clean = matches!(self.state, SessionState::Idle | SessionState::ReadingClient);
            if clean && is_quiet(&lease.link) {
                ctx.release(lease, now);
            } else {
                ctx.discard(lease, now);
            }
        }
        drop(ctx);

        let Err(e) = result else {
            debug!("conn:{} {} closed", self.conn_id, self.peer);
            return;
        };
        match e.severity() {
            ErrorSeverity::Info => debug!("conn:{} {} closed in {}: {}", self.conn_id, self.peer, self.state, e),
            ErrorSeverity::Warning => info!("conn:{} {} closed in {}: {}", self.conn_id, self.peer, self.state, e),
            _ => warn!("conn:{} {} closed in {}: {}", self.conn_id, self.peer, self.state, e),
        }
    }
}
