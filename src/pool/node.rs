/// Backend nodes and their connection buckets
use super::ConnId;
use crate::config::{NodeKey, NodeSpec};
use crate::protocol::{capabilities, Greeting, DEFAULT_CHARSET};
use crate::utils::StateLists;
use std::fmt;
use std::time::Instant;

/// Role a node plays in replication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Health bucket of a backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Bound to a client session
    Used,
    /// Idle and selectable
    Avail,
    /// Closed, waiting for the reconnect timer
    Dead,
    /// Handshake in progress
    Raw,
    /// Handshake or keepalive failed, retried at a limited rate
    Fail,
    /// Keepalive probe in flight
    Ping,
}

impl ConnState {
    pub const ALL: [ConnState; 6] = [
        ConnState::Used,
        ConnState::Avail,
        ConnState::Dead,
        ConnState::Raw,
        ConnState::Fail,
        ConnState::Ping,
    ];
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::Used => "used",
            ConnState::Avail => "avail",
            ConnState::Dead => "dead",
            ConnState::Raw => "raw",
            ConnState::Fail => "fail",
            ConnState::Ping => "ping",
        };
        write!(f, "{}", name)
    }
}

/// Server identity learned from a backend greeting and replayed to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub protocol_version: u8,
    pub server_version: String,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            protocol_version: 10,
            server_version: format!("5.1.0-mygate-{}", env!("CARGO_PKG_VERSION")),
            capabilities: capabilities::DEFAULT_CAPABILITIES,
            charset: DEFAULT_CHARSET,
            status: 0x0002,
        }
    }
}

impl From<&Greeting> for ServerInfo {
    fn from(greeting: &Greeting) -> Self {
        Self {
            protocol_version: greeting.protocol_version,
            server_version: greeting.server_version.clone(),
            capabilities: greeting.capabilities,
            charset: greeting.charset,
            status: greeting.status,
        }
    }
}

/// A registered master or slave endpoint
#[derive(Debug)]
pub struct Node {
    spec: NodeSpec,
    buckets: StateLists<ConnState, ConnId>,
    avail: usize,
    closing_since: Option<Instant>,
}

impl Node {
    pub fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            buckets: StateLists::new(),
            avail: 0,
            closing_since: None,
        }
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn key(&self) -> NodeKey {
        self.spec.key()
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn addr(&self) -> String {
        self.spec.addr()
    }

    pub fn avail_count(&self) -> usize {
        self.avail
    }

    pub fn is_closing(&self) -> bool {
        self.closing_since.is_some()
    }

    pub fn closing_since(&self) -> Option<Instant> {
        self.closing_since
    }

    pub(super) fn set_closing(&mut self, now: Instant) {
        if self.closing_since.is_none() {
            self.closing_since = Some(now);
        }
    }

    /// Selectable right now
    pub fn is_selectable(&self) -> bool {
        !self.is_closing() && self.avail > 0
    }

    pub fn bucket_len(&self, state: ConnState) -> usize {
        self.buckets.len(state)
    }

    /// Connections in `state`, oldest transition first
    pub fn bucket(&self, state: ConnState) -> impl Iterator<Item = ConnId> + '_ {
        self.buckets.iter(state)
    }

    pub fn state_of(&self, conn: ConnId) -> Option<ConnState> {
        self.buckets.state_of(conn)
    }

    pub fn conn_count(&self) -> usize {
        self.buckets.total()
    }

    /// Put `conn` at the tail of `state`, keeping the Avail count in step
    pub(super) fn place(&mut self, conn: ConnId, state: ConnState) {
        if self.buckets.move_to_tail(conn, state) == Some(ConnState::Avail) {
            self.avail -= 1;
        }
        if state == ConnState::Avail {
            self.avail += 1;
        }
    }

    pub fn status(&self) -> NodeStatus {
        let mut counts = [0usize; 6];
        for (slot, state) in counts.iter_mut().zip(ConnState::ALL) {
            *slot = self.bucket_len(state);
        }
        NodeStatus {
            role: self.role(),
            addr: self.addr(),
            closing: self.is_closing(),
            counts,
        }
    }
}

/// Bucket sizes of one node, for the periodic status report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: Role,
    pub addr: String,
    pub closing: bool,
    pub counts: [usize; 6],
}

impl NodeStatus {
    pub fn count(&self, state: ConnState) -> usize {
        ConnState::ALL
            .iter()
            .position(|s| *s == state)
            .map_or(0, |i| self.counts[i])
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.addr)?;
        if self.closing {
            write!(f, " (closing)")?;
        }
        for (state, count) in ConnState::ALL.iter().zip(self.counts) {
            write!(f, " {}:{}", state, count)?;
        }
        Ok(())
    }
}
