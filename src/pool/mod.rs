/// Backend node pool
///
/// Nodes are registered per role; each node owns its backend connections
/// through six health buckets (Used, Avail, Dead, Raw, Fail, Ping). The pool
/// is pure bookkeeping: sockets travel in and out of it, while the worker
/// drives every handshake, probe and session.
pub mod conn;
pub mod node;

pub use conn::{BackendConn, BackendLease, ConnectTarget, Context};
pub use node::{ConnState, Node, NodeStatus, Role, ServerInfo};

use crate::arena_key;
use crate::config::{NodeKey, NodeSpec, RoleLimits};
use crate::core::session::SessionId;
use crate::error::{ProxyError, ProxyResult};
use crate::utils::{addr_weight, Arena, ArenaLimits};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

arena_key!(
    /// Handle of a registered node
    NodeId
);
arena_key!(
    /// Handle of a backend connection
    ConnId
);

/// A node torn down by the closing sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedNode {
    pub key: NodeKey,
    /// Sessions that were still using one of its connections
    pub sessions: Vec<SessionId>,
    /// Every connection that belonged to it
    pub conns: Vec<ConnId>,
}

/// Master/slave registry with per-node connection buckets
#[derive(Debug)]
pub struct NodePool<S> {
    nodes: Arena<NodeId, Node>,
    masters: Vec<NodeId>,
    slaves: Vec<NodeId>,
    conns: Arena<ConnId, BackendConn<S>>,
    limits: RoleLimits,
    server_info: Option<ServerInfo>,
}

impl<S> NodePool<S> {
    pub fn new(limits: RoleLimits, max_conns: usize) -> Self {
        Self {
            nodes: Arena::new(ArenaLimits::with_capacity((limits.masters + limits.slaves).max(1) * 2)),
            masters: Vec::new(),
            slaves: Vec::new(),
            conns: Arena::new(ArenaLimits::with_capacity(max_conns)),
            limits,
            server_info: None,
        }
    }

    fn role_list(&self, role: Role) -> &[NodeId] {
        match role {
            Role::Master => &self.masters,
            Role::Slave => &self.slaves,
        }
    }

    fn role_list_mut(&mut self, role: Role) -> &mut Vec<NodeId> {
        match role {
            Role::Master => &mut self.masters,
            Role::Slave => &mut self.slaves,
        }
    }

    /// Reserve a slot for `spec` and create its connections in Raw.
    ///
    /// Returns the handshakes the caller has to run.
    pub fn register(&mut self, spec: NodeSpec, now: Instant) -> ProxyResult<Vec<ConnectTarget>> {
        let key = spec.key();
        if self.find(&key).is_some() {
            return Err(ProxyError::backend(format!("{} already registered", key)));
        }

        let limit = self.limits.for_role(spec.role);
        if self.role_list(spec.role).len() >= limit {
            return Err(ProxyError::capacity(format!(
                "{} number exceeds limit [{}]",
                spec.role, limit
            )));
        }
        if self.conns.remaining() < spec.connections {
            return Err(ProxyError::capacity(format!(
                "backend connections for {}",
                key
            )));
        }

        let role = spec.role;
        let count = spec.connections;
        let node_id = self
            .nodes
            .insert(Node::new(spec))
            .map_err(|e| ProxyError::capacity(e.to_string()))?;
        self.role_list_mut(role).push(node_id);

        let mut targets = Vec::with_capacity(count);
        for _ in 0..count {
            let id = self
                .conns
                .insert(BackendConn::new(node_id, now))
                .map_err(|e| ProxyError::capacity(e.to_string()))?;
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.place(id, ConnState::Raw);
            }
            if let Some(target) = self.target(id) {
                targets.push(target);
            }
        }

        info!("registered {} with {} connections", key, count);
        Ok(targets)
    }

    /// Mark the node closing; the closing sweep tears it down later
    pub fn unregister(&mut self, key: &NodeKey, now: Instant) -> bool {
        match self.find(key).and_then(|id| self.nodes.get_mut(id)) {
            Some(node) => {
                node.set_closing(now);
                info!("unregistered {}, closing", key);
                true
            }
            None => {
                warn!("unregister {}: no such node", key);
                false
            }
        }
    }

    /// Live (non-closing) node registered under `key`
    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.role_list(key.role).iter().copied().find(|id| {
            self.nodes
                .get(*id)
                .map_or(false, |n| !n.is_closing() && n.key() == *key)
        })
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes of `role` in selection order
    pub fn nodes(&self, role: Role) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.role_list(role)
            .iter()
            .filter_map(move |id| self.nodes.get(*id).map(|n| (*id, n)))
    }

    pub fn node_count(&self, role: Role) -> usize {
        self.role_list(role).len()
    }

    pub fn conn(&self, id: ConnId) -> Option<&BackendConn<S>> {
        self.conns.get(id)
    }

    pub fn conn_state(&self, id: ConnId) -> Option<ConnState> {
        self.conns.get(id).map(BackendConn::state)
    }

    /// Server identity from the most recent backend greeting
    pub fn server_info(&self) -> ServerInfo {
        self.server_info.clone().unwrap_or_default()
    }

    /// Any node has a selectable connection
    pub fn have_available(&self) -> bool {
        self.masters
            .iter()
            .chain(self.slaves.iter())
            .filter_map(|id| self.nodes.get(*id))
            .any(Node::is_selectable)
    }

    fn target(&self, id: ConnId) -> Option<ConnectTarget> {
        let conn = self.conns.get(id)?;
        let spec = self.nodes.get(conn.node)?.spec();
        Some(ConnectTarget {
            id,
            addr: spec.addr(),
            user: spec.user.clone(),
            password: spec.password.clone(),
        })
    }

    /// Move a connection to `state`, stamping the transition time
    fn transition(&mut self, id: ConnId, state: ConnState, now: Instant) -> Option<&mut BackendConn<S>> {
        let conn = self.conns.get_mut(id)?;
        conn.state = state;
        conn.state_time = now;
        if let Some(node) = self.nodes.get_mut(conn.node) {
            node.place(id, state);
        }
        Some(conn)
    }

    fn close_to(&mut self, id: ConnId, state: ConnState, now: Instant) {
        if let Some(conn) = self.transition(id, state, now) {
            conn.close();
        }
    }

    /// Check out an Avail connection of `role` for `session`.
    ///
    /// Nodes are probed starting at `(client ip + client port) mod n` so
    /// clients spread over same-role nodes without shared counters.
    pub fn acquire(
        &mut self,
        role: Role,
        client: &SocketAddr,
        session: SessionId,
        now: Instant,
    ) -> Option<BackendLease<S>> {
        let n = self.role_list(role).len();
        if n == 0 {
            debug!("no {} registered", role);
            return None;
        }

        let weight = addr_weight(client);
        for probe in 0..n as u64 {
            let node_id = self.role_list(role)[((weight.wrapping_add(probe)) % n as u64) as usize];
            loop {
                let node = self.nodes.get(node_id)?;
                if !node.is_selectable() {
                    break;
                }
                let id = node.bucket(ConnState::Avail).next()?;
                let addr = node.addr();

                let conn = self.transition(id, ConnState::Used, now)?;
                match conn.link.take() {
                    Some(link) => {
                        conn.session = Some(session);
                        let ctx = std::mem::take(&mut conn.ctx);
                        debug!("{} {} conn {} bound to session {}", role, addr, id, session);
                        return Some(BackendLease {
                            id,
                            node: node_id,
                            role,
                            addr,
                            ctx,
                            link,
                        });
                    }
                    None => {
                        warn!("{} conn {} was avail without a socket", addr, id);
                        self.close_to(id, ConnState::Dead, now);
                    }
                }
            }
        }

        debug!("no {} available", role);
        None
    }

    /// Return a leased connection: clean ones go back to Avail, dirty ones
    /// are closed. Returns the resulting state, or `None` when the
    /// connection no longer belongs to the pool.
    pub fn release(&mut self, lease: BackendLease<S>, now: Instant) -> Option<ConnState> {
        if self.conn_state(lease.id) != Some(ConnState::Used) {
            debug!("conn {} released after reclaim, dropping socket", lease.id);
            return None;
        }

        if lease.ctx.dirty {
            self.close_to(lease.id, ConnState::Dead, now);
            return Some(ConnState::Dead);
        }

        let conn = self.transition(lease.id, ConnState::Avail, now)?;
        conn.link = Some(lease.link);
        conn.ctx = lease.ctx;
        conn.session = None;
        Some(ConnState::Avail)
    }

    /// Close a leased connection after an I/O error
    pub fn discard(&mut self, lease: BackendLease<S>, now: Instant) -> Option<ConnState> {
        if self.conn_state(lease.id) != Some(ConnState::Used) {
            return None;
        }
        self.close_to(lease.id, ConnState::Dead, now);
        Some(ConnState::Dead)
    }

    /// Handshake finished: Raw -> Avail
    pub fn connect_ok(&mut self, id: ConnId, link: S, info: ServerInfo, now: Instant) -> bool {
        if self.conn_state(id) != Some(ConnState::Raw) {
            return false;
        }
        self.server_info = Some(info);
        match self.transition(id, ConnState::Avail, now) {
            Some(conn) => {
                conn.ctx = Context::default();
                conn.link = Some(link);
                true
            }
            None => false,
        }
    }

    /// Handshake failed: Raw -> Fail
    pub fn connect_failed(&mut self, id: ConnId, now: Instant) -> bool {
        if self.conn_state(id) != Some(ConnState::Raw) {
            return false;
        }
        self.close_to(id, ConnState::Fail, now);
        true
    }

    /// Reconnect up to `batch` Dead connections per live node: Dead -> Raw
    pub fn take_dead(&mut self, batch: usize, now: Instant) -> Vec<ConnectTarget> {
        self.take_bucket(ConnState::Dead, batch, now)
    }

    /// Retry up to `batch` Fail connections per live node: Fail -> Raw
    pub fn take_failed(&mut self, batch: usize, now: Instant) -> Vec<ConnectTarget> {
        self.take_bucket(ConnState::Fail, batch, now)
    }

    fn take_bucket(&mut self, from: ConnState, batch: usize, now: Instant) -> Vec<ConnectTarget> {
        let picked: Vec<ConnId> = self
            .live_nodes()
            .flat_map(|node| node.bucket(from).take(batch).collect::<Vec<_>>())
            .collect();

        picked
            .into_iter()
            .filter_map(|id| {
                self.close_to(id, ConnState::Raw, now);
                self.target(id)
            })
            .collect()
    }

    fn live_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.masters
            .iter()
            .chain(self.slaves.iter())
            .filter_map(|id| self.nodes.get(*id))
            .filter(|node| !node.is_closing())
    }

    /// Pick up to `batch` idle connections per live node for a keepalive
    /// probe: Avail -> Ping. The caller owns the sockets until
    /// `ping_ok`/`ping_failed`.
    pub fn take_for_ping(&mut self, batch: usize, now: Instant) -> Vec<(ConnId, S)> {
        let picked: Vec<ConnId> = self
            .live_nodes()
            .flat_map(|node| node.bucket(ConnState::Avail).take(batch).collect::<Vec<_>>())
            .collect();

        let mut probes = Vec::with_capacity(picked.len());
        for id in picked {
            let link = match self.transition(id, ConnState::Ping, now) {
                Some(conn) => conn.link.take(),
                None => continue,
            };
            match link {
                Some(link) => probes.push((id, link)),
                None => self.close_to(id, ConnState::Dead, now),
            }
        }
        probes
    }

    /// Keepalive answered: Ping -> Avail
    pub fn ping_ok(&mut self, id: ConnId, link: S, now: Instant) -> bool {
        if self.conn_state(id) != Some(ConnState::Ping) {
            return false;
        }
        match self.transition(id, ConnState::Avail, now) {
            Some(conn) => {
                conn.link = Some(link);
                true
            }
            None => false,
        }
    }

    /// Keepalive failed: Ping -> Fail
    pub fn ping_failed(&mut self, id: ConnId, now: Instant) -> bool {
        if self.conn_state(id) != Some(ConnState::Ping) {
            return false;
        }
        self.close_to(id, ConnState::Fail, now);
        true
    }

    /// Fail probes older than `timeout`, at most `batch` per node, oldest
    /// first. Returns the connections whose probe tasks must be stopped.
    pub fn expire_pings(&mut self, now: Instant, timeout: Duration, batch: usize) -> Vec<ConnId> {
        let mut expired = Vec::new();
        for node in self.live_nodes() {
            for id in node.bucket(ConnState::Ping).take(batch) {
                let Some(conn) = self.conns.get(id) else { continue };
                if now.saturating_duration_since(conn.state_time) > timeout {
                    expired.push(id);
                } else {
                    break;
                }
            }
        }

        for id in &expired {
            self.close_to(*id, ConnState::Fail, now);
        }
        expired
    }

    /// Tear down nodes that have been closing for longer than `delay`
    pub fn sweep_closing(&mut self, now: Instant, delay: Duration) -> Vec<ClosedNode> {
        let due: Vec<NodeId> = self
            .masters
            .iter()
            .chain(self.slaves.iter())
            .copied()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .and_then(Node::closing_since)
                    .map_or(false, |since| now.saturating_duration_since(since) > delay)
            })
            .collect();

        let mut closed = Vec::with_capacity(due.len());
        for node_id in due {
            let Some(node) = self.nodes.remove(node_id) else { continue };
            let role = node.role();
            self.role_list_mut(role).retain(|id| *id != node_id);

            let mut sessions = Vec::new();
            let mut conns = Vec::with_capacity(node.conn_count());
            for state in ConnState::ALL {
                for id in node.bucket(state) {
                    if let Some(conn) = self.conns.remove(id) {
                        if let Some(session) = conn.session {
                            sessions.push(session);
                        }
                    }
                    conns.push(id);
                }
            }

            info!(
                "closing cleanup {}: {} connections, {} sessions",
                node.key(),
                conns.len(),
                sessions.len()
            );
            closed.push(ClosedNode {
                key: node.key(),
                sessions,
                conns,
            });
        }
        closed
    }

    /// Bucket sizes of every node
    pub fn status(&self) -> Vec<crate::pool::NodeStatus> {
        self.masters
            .iter()
            .chain(self.slaves.iter())
            .filter_map(|id| self.nodes.get(*id))
            .map(Node::status)
            .collect()
    }

    /// Each connection sits in exactly one bucket of its own node, matching
    /// its recorded state, and Avail counters agree with bucket sizes.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut members = 0;
        for (node_id, node) in self.nodes.iter() {
            let mut avail = 0;
            for state in ConnState::ALL {
                for id in node.bucket(state) {
                    members += 1;
                    let conn = self
                        .conns
                        .get(id)
                        .ok_or_else(|| format!("conn {} in {} bucket is gone", id, state))?;
                    if conn.node != node_id {
                        return Err(format!("conn {} filed under the wrong node", id));
                    }
                    if conn.state != state {
                        return Err(format!(
                            "conn {} recorded {} but filed under {}",
                            id, conn.state, state
                        ));
                    }
                    if state == ConnState::Avail {
                        avail += 1;
                    }
                }
            }
            if avail != node.avail_count() {
                return Err(format!("{} avail count {} != {}", node.addr(), node.avail_count(), avail));
            }
        }
        if members != self.conns.len() {
            return Err(format!("{} conns but {} bucket members", self.conns.len(), members));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::tests::session_id;

    fn spec(role: Role, host: &str, count: usize) -> NodeSpec {
        NodeSpec {
            role,
            host: host.to_string(),
            port: 3306,
            user: "root".to_string(),
            password: "pw".to_string(),
            connections: count,
        }
    }

    fn client() -> SocketAddr {
        "192.168.1.10:40000".parse().unwrap()
    }

    /// Register and complete every handshake, with `u32` standing in for
    /// the socket
    fn warm(pool: &mut NodePool<u32>, spec: NodeSpec, now: Instant) -> Vec<ConnId> {
        let targets = pool.register(spec, now).unwrap();
        for (i, t) in targets.iter().enumerate() {
            assert!(pool.connect_ok(t.id, i as u32, ServerInfo::default(), now));
        }
        targets.into_iter().map(|t| t.id).collect()
    }

    fn pool() -> NodePool<u32> {
        NodePool::new(RoleLimits { masters: 2, slaves: 4 }, 1024)
    }

    #[test]
    fn test_register_starts_raw() {
        let mut pool = pool();
        let now = Instant::now();
        let targets = pool.register(spec(Role::Master, "m1", 3), now).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].addr, "m1:3306");
        assert!(targets.iter().all(|t| pool.conn_state(t.id) == Some(ConnState::Raw)));
        assert!(!pool.have_available());
        let node = pool.conn(targets[0].id).unwrap().node();
        assert_eq!(pool.node(node).unwrap().conn_count(), 3);
        pool.check_invariants().unwrap();

        assert!(pool.register(spec(Role::Master, "m1", 1), now).is_err());
    }

    #[test]
    fn test_role_limit() {
        let mut pool: NodePool<u32> = NodePool::new(RoleLimits { masters: 1, slaves: 0 }, 16);
        let now = Instant::now();
        pool.register(spec(Role::Master, "m1", 1), now).unwrap();
        let err = pool.register(spec(Role::Master, "m2", 1), now).unwrap_err();
        assert!(matches!(err, ProxyError::Capacity { .. }));
        assert!(pool.register(spec(Role::Slave, "s1", 1), now).is_err());
    }

    #[test]
    fn test_connection_capacity() {
        let mut pool: NodePool<u32> = NodePool::new(RoleLimits::default(), 4);
        let now = Instant::now();
        pool.register(spec(Role::Slave, "s1", 3), now).unwrap();
        assert!(pool.register(spec(Role::Slave, "s2", 2), now).is_err());
        pool.register(spec(Role::Slave, "s3", 1), now).unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 2), now);
        assert!(pool.have_available());

        let lease = pool.acquire(Role::Slave, &client(), session_id(1), now).unwrap();
        assert_eq!(pool.conn_state(lease.id), Some(ConnState::Used));
        assert_eq!(pool.conn(lease.id).unwrap().session(), Some(session_id(1)));
        pool.check_invariants().unwrap();

        assert!(pool.acquire(Role::Master, &client(), session_id(1), now).is_none());

        let id = lease.id;
        assert_eq!(pool.release(lease, now), Some(ConnState::Avail));
        assert_eq!(pool.conn_state(id), Some(ConnState::Avail));
        assert!(pool.conn(id).unwrap().session().is_none());
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_release_keeps_database_context() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 1), now);

        let mut lease = pool.acquire(Role::Slave, &client(), session_id(1), now).unwrap();
        lease.ctx.current_db = "orders".to_string();
        pool.release(lease, now);

        let lease = pool.acquire(Role::Slave, &client(), session_id(2), now).unwrap();
        assert_eq!(lease.ctx.current_db, "orders");
        assert!(!lease.is_dirty());
    }

    #[test]
    fn test_dirty_release_closes() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Master, "m1", 1), now);

        let mut lease = pool.acquire(Role::Master, &client(), session_id(1), now).unwrap();
        lease.set_dirty();
        let id = lease.id;
        assert_eq!(pool.release(lease, now), Some(ConnState::Dead));
        assert!(pool.conn(id).unwrap().context().current_db.is_empty());
        assert!(!pool.have_available());
        pool.check_invariants().unwrap();

        // The reconnect timer brings it back through a handshake.
        let targets = pool.take_dead(4, now);
        assert_eq!(targets.len(), 1);
        assert_eq!(pool.conn_state(id), Some(ConnState::Raw));
        assert!(pool.connect_ok(id, 9, ServerInfo::default(), now));
        assert!(!pool.conn(id).unwrap().context().dirty);
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_discard_marks_dead() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 1), now);
        let lease = pool.acquire(Role::Slave, &client(), session_id(1), now).unwrap();
        let id = lease.id;
        assert_eq!(pool.discard(lease, now), Some(ConnState::Dead));
        assert_eq!(pool.conn_state(id), Some(ConnState::Dead));
    }

    #[test]
    fn test_selection_spreads_by_client() {
        let mut pool = pool();
        let now = Instant::now();
        for host in ["s1", "s2", "s3"] {
            warm(&mut pool, spec(Role::Slave, host, 4), now);
        }

        let base: SocketAddr = "10.0.0.1:3000".parse().unwrap();
        let next: SocketAddr = "10.0.0.1:3001".parse().unwrap();
        let a = pool.acquire(Role::Slave, &base, session_id(1), now).unwrap();
        let b = pool.acquire(Role::Slave, &next, session_id(2), now).unwrap();
        assert_ne!(a.node, b.node);

        let expected = pool.role_list(Role::Slave)[(addr_weight(&base) % 3) as usize];
        assert_eq!(a.node, expected);
    }

    #[test]
    fn test_selection_skips_empty_and_closing_nodes() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 1), now);
        warm(&mut pool, spec(Role::Slave, "s2", 1), now);

        let first = pool.acquire(Role::Slave, &client(), session_id(1), now).unwrap();
        let second = pool.acquire(Role::Slave, &client(), session_id(2), now).unwrap();
        assert_ne!(first.node, second.node);
        assert!(pool.acquire(Role::Slave, &client(), session_id(3), now).is_none());

        pool.release(first, now);
        pool.release(second, now);
        let key = pool.node(pool.role_list(Role::Slave)[0]).unwrap().key();
        pool.unregister(&key, now);
        for i in 0..3 {
            let lease = pool.acquire(Role::Slave, &client(), session_id(i), now).unwrap();
            assert_eq!(pool.node(lease.node).unwrap().addr(), "s2:3306");
            pool.release(lease, now);
        }
    }

    #[test]
    fn test_handshake_failure_and_retry() {
        let mut pool = pool();
        let now = Instant::now();
        let targets = pool.register(spec(Role::Slave, "s1", 3), now).unwrap();
        for t in &targets {
            assert!(pool.connect_failed(t.id, now));
        }
        assert_eq!(pool.status()[0].count(ConnState::Fail), 3);

        // Rate limited: one per node per tick.
        let retry = pool.take_failed(1, now);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].id, targets[0].id);
        assert_eq!(pool.conn_state(retry[0].id), Some(ConnState::Raw));
        assert!(!pool.connect_failed(targets[1].id, now));
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_ping_cycle() {
        let mut pool = pool();
        let now = Instant::now();
        let ids = warm(&mut pool, spec(Role::Slave, "s1", 4), now);

        let probes = pool.take_for_ping(3, now);
        assert_eq!(probes.len(), 3);
        assert_eq!(probes[0].0, ids[0]);
        assert_eq!(pool.node(pool.conn(ids[0]).unwrap().node()).unwrap().avail_count(), 1);
        pool.check_invariants().unwrap();

        let (ok_id, link) = probes[0];
        assert!(pool.ping_ok(ok_id, link, now));
        assert!(pool.ping_failed(probes[1].0, now));
        assert_eq!(pool.conn_state(probes[1].0), Some(ConnState::Fail));

        // The third probe never answers.
        let later = now + Duration::from_secs(11);
        let expired = pool.expire_pings(later, Duration::from_secs(10), 3);
        assert_eq!(expired, vec![probes[2].0]);
        assert_eq!(pool.conn_state(probes[2].0), Some(ConnState::Fail));
        assert!(!pool.ping_ok(probes[2].0, 0, later));
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_expire_pings_stops_at_fresh_probe() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 2), now);
        let first = pool.take_for_ping(1, now);
        let second = pool.take_for_ping(1, now + Duration::from_secs(8));
        let expired = pool.expire_pings(now + Duration::from_secs(12), Duration::from_secs(10), 3);
        assert_eq!(expired, vec![first[0].0]);
        assert_eq!(pool.conn_state(second[0].0), Some(ConnState::Ping));
    }

    #[test]
    fn test_graceful_unregister() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 2), now);
        let lease = pool.acquire(Role::Slave, &client(), session_id(7), now).unwrap();
        let key = pool.node(lease.node).unwrap().key();

        assert!(pool.unregister(&key, now));
        assert!(!pool.have_available());
        assert!(pool.find(&key).is_none());

        // Within the grace delay nothing is torn down.
        let delay = Duration::from_secs(60);
        assert!(pool.sweep_closing(now + Duration::from_secs(30), delay).is_empty());
        assert_eq!(pool.conn_state(lease.id), Some(ConnState::Used));

        let closed = pool.sweep_closing(now + Duration::from_secs(61), delay);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].key, key);
        assert_eq!(closed[0].sessions, vec![session_id(7)]);
        assert_eq!(closed[0].conns.len(), 2);
        assert_eq!(pool.node_count(Role::Slave), 0);
        assert!(pool.conn(lease.id).is_none());
        pool.check_invariants().unwrap();

        // A late release of the reclaimed connection is a no-op.
        assert_eq!(pool.release(lease, now + Duration::from_secs(62)), None);

        // The slot is free again.
        warm(&mut pool, spec(Role::Slave, "s1", 1), now);
        assert!(pool.have_available());
    }

    #[test]
    fn test_reconnect_skips_closing_nodes() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 1), now);
        let lease = pool.acquire(Role::Slave, &client(), session_id(1), now).unwrap();
        let key = pool.node(lease.node).unwrap().key();
        pool.discard(lease, now);
        pool.unregister(&key, now);
        assert!(pool.take_dead(4, now).is_empty());
    }

    #[test]
    fn test_reconnect_batch_per_node() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Slave, "s1", 5), now);
        warm(&mut pool, spec(Role::Slave, "s2", 1), now);

        // Every connection breaks at once.
        for i in 0..6 {
            let lease = pool.acquire(Role::Slave, &client(), session_id(i), now).unwrap();
            pool.discard(lease, now);
        }
        assert!(!pool.have_available());

        let first = pool.take_dead(2, now);
        assert_eq!(first.len(), 3);
        assert_eq!(first.iter().filter(|t| t.addr == "s1:3306").count(), 2);
        assert_eq!(first.iter().filter(|t| t.addr == "s2:3306").count(), 1);
        for target in &first {
            assert_eq!(pool.conn_state(target.id), Some(ConnState::Raw));
        }
        pool.check_invariants().unwrap();

        assert_eq!(pool.take_dead(2, now).len(), 2);
        assert_eq!(pool.take_dead(2, now).len(), 1);
        assert!(pool.take_dead(2, now).is_empty());
        pool.check_invariants().unwrap();
    }

    #[test]
    fn test_status_report() {
        let mut pool = pool();
        let now = Instant::now();
        warm(&mut pool, spec(Role::Master, "m1", 2), now);
        let status = pool.status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].count(ConnState::Avail), 2);
        let line = status[0].to_string();
        assert!(line.starts_with("master m1:3306"));
        assert!(line.contains("avail:2"));
    }
}
