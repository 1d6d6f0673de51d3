/// Backend connection records and session leases
use super::{ConnId, ConnState, NodeId, Role};
use crate::core::session::SessionId;
use std::time::Instant;

/// Per-connection protocol context
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// Pinned to its session by a transaction-altering statement
    pub dirty: bool,
    /// Database last selected on the backend
    pub current_db: String,
}

/// Pool-side record of one backend connection.
///
/// The socket is held here only while nobody drives the connection (Avail);
/// a session lease or a probe task owns it otherwise.
#[derive(Debug)]
pub struct BackendConn<S> {
    pub(super) node: NodeId,
    pub(super) state: ConnState,
    pub(super) state_time: Instant,
    pub(super) ctx: Context,
    pub(super) session: Option<SessionId>,
    pub(super) link: Option<S>,
}

impl<S> BackendConn<S> {
    pub(super) fn new(node: NodeId, now: Instant) -> Self {
        Self {
            node,
            state: ConnState::Raw,
            state_time: now,
            ctx: Context::default(),
            session: None,
            link: None,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn state_time(&self) -> Instant {
        self.state_time
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    /// Close the socket and forget the session context
    pub(super) fn close(&mut self) {
        self.link = None;
        self.session = None;
        self.ctx = Context::default();
    }
}

/// A backend connection checked out by a session.
///
/// The session drives I/O on `link` and edits `ctx`; both go back to the
/// pool on release.
#[derive(Debug)]
pub struct BackendLease<S> {
    pub id: ConnId,
    pub node: NodeId,
    pub role: Role,
    pub addr: String,
    pub ctx: Context,
    pub link: S,
}

impl<S> BackendLease<S> {
    pub fn is_dirty(&self) -> bool {
        self.ctx.dirty
    }

    pub fn set_dirty(&mut self) {
        self.ctx.dirty = true;
    }
}

/// Everything a handshake task needs to (re)open a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub id: ConnId,
    pub addr: String,
    pub user: String,
    pub password: String,
}
