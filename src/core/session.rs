/// Session bookkeeping and the timeout supervisor
///
/// Every accepted client gets an entry here for as long as its task runs.
/// The entry carries the session's protocol state and the time it entered
/// that state; entries are filed in per-state lists ordered by transition
/// time so the once-a-second sweep only looks at list heads.
use crate::arena_key;
use crate::config::SessionTimeouts;
use crate::pool::ConnId;
use crate::utils::{Arena, ArenaFull, ArenaLimits, StateLists};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

arena_key!(
    /// Handle of a live client session
    SessionId
);

/// Protocol state of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Greeting sent, waiting for the login packet
    Unavailable,
    /// Login accepted, OK being written
    AuthSuccess,
    /// Login rejected, error being written
    AuthFail,
    ReadingClient,
    /// Switching the backend's database before forwarding
    PrepareMysql,
    WritingMysql,
    ReadMysqlWriteClient,
    Idle,
}

impl SessionState {
    pub const ALL: [SessionState; 8] = [
        SessionState::Unavailable,
        SessionState::AuthSuccess,
        SessionState::AuthFail,
        SessionState::ReadingClient,
        SessionState::PrepareMysql,
        SessionState::WritingMysql,
        SessionState::ReadMysqlWriteClient,
        SessionState::Idle,
    ];

    /// How long a session may stay in this state
    pub fn timeout(&self, timeouts: &SessionTimeouts) -> Duration {
        match self {
            SessionState::Unavailable
            | SessionState::AuthSuccess
            | SessionState::AuthFail
            | SessionState::ReadingClient => timeouts.read_client,
            SessionState::PrepareMysql => timeouts.prepare_mysql,
            SessionState::WritingMysql => timeouts.write_mysql,
            SessionState::ReadMysqlWriteClient => timeouts.read_mysql_write_client,
            SessionState::Idle => timeouts.idle,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unavailable => "unavailable",
            SessionState::AuthSuccess => "auth_success",
            SessionState::AuthFail => "auth_fail",
            SessionState::ReadingClient => "reading_client",
            SessionState::PrepareMysql => "prepare_mysql",
            SessionState::WritingMysql => "writing_mysql",
            SessionState::ReadMysqlWriteClient => "read_mysql_write_client",
            SessionState::Idle => "idle",
        };
        write!(f, "{}", name)
    }
}

/// Supervisor view of one session
#[derive(Debug)]
pub struct SessionEntry {
    /// Connection id shown to the client and in the audit log
    pub conn_id: u32,
    pub peer: SocketAddr,
    pub state: SessionState,
    pub state_time: Instant,
    pub backend: Option<ConnId>,
    cancel: CancellationToken,
}

/// What `open` hands to a new session task
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub id: SessionId,
    pub conn_id: u32,
    pub cancel: CancellationToken,
}

/// Live sessions of one worker
#[derive(Debug)]
pub struct SessionTable {
    entries: Arena<SessionId, SessionEntry>,
    lists: StateLists<SessionState, SessionId>,
    next_conn_id: u32,
}

impl SessionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: Arena::new(ArenaLimits::with_capacity(max_connections)),
            lists: StateLists::new(),
            next_conn_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Session slots currently backed by storage
    pub fn allocated(&self) -> usize {
        self.entries.allocated()
    }

    /// Admit a client. Fails only when the table is at capacity.
    pub fn open(&mut self, peer: SocketAddr, now: Instant) -> Result<SessionTicket, ArenaFull> {
        self.next_conn_id = self.next_conn_id.wrapping_add(1).max(1);
        let cancel = CancellationToken::new();
        let id = self.entries.insert(SessionEntry {
            conn_id: self.next_conn_id,
            peer,
            state: SessionState::Unavailable,
            state_time: now,
            backend: None,
            cancel: cancel.clone(),
        })?;
        self.lists.move_to_tail(id, SessionState::Unavailable);

        Ok(SessionTicket {
            id,
            conn_id: self.next_conn_id,
            cancel,
        })
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.entries.contains(id)
    }

    /// Record a state transition; re-entering a state restarts its timer
    pub fn set_state(&mut self, id: SessionId, state: SessionState, now: Instant) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.state = state;
                entry.state_time = now;
                self.lists.move_to_tail(id, state);
                true
            }
            None => false,
        }
    }

    /// Record which backend connection the session holds
    pub fn bind(&mut self, id: SessionId, backend: Option<ConnId>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.backend = backend;
        }
    }

    /// Forget a session that finished on its own
    pub fn close(&mut self, id: SessionId) -> Option<SessionEntry> {
        self.lists.remove(id);
        self.entries.remove(id)
    }

    /// Forget a session and tell its task to stop
    pub fn cancel(&mut self, id: SessionId) -> bool {
        match self.close(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel sessions that overstayed their state's timeout, at most `cap`
    /// per state. Each list is walked from its oldest entry and the walk
    /// stops at the first one still within its limit.
    pub fn sweep(&mut self, now: Instant, timeouts: &SessionTimeouts, cap: usize) -> Vec<SessionId> {
        let mut expired = Vec::new();
        for state in SessionState::ALL {
            let limit = state.timeout(timeouts);
            for id in self.lists.iter(state).take(cap) {
                let Some(entry) = self.entries.get(id) else { continue };
                if now.saturating_duration_since(entry.state_time) > limit {
                    expired.push(id);
                } else {
                    break;
                }
            }
        }

        for id in &expired {
            if let Some(entry) = self.entries.get(*id) {
                debug!(
                    "conn:{} {} timed out in {}",
                    entry.conn_id, entry.peer, entry.state
                );
            }
            self.cancel(*id);
        }
        expired
    }

    /// Session count per state
    pub fn counts(&self) -> Vec<(SessionState, usize)> {
        SessionState::ALL
            .iter()
            .map(|state| (*state, self.lists.len(*state)))
            .collect()
    }
}
