/// Read/write splitting
///
/// Commands are classified by opcode and a literal, case-insensitive prefix
/// of their argument. Classification decides which role the session's
/// backend must have and whether the backend gets pinned to the session.
use crate::core::SessionId;
use crate::error::{ProxyError, ProxyResult};
use crate::pool::{BackendLease, NodePool, Role};
use crate::protocol::{Command, CommandPacket};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::debug;

/// Statements that change session state on the backend
const PINNING_PREFIXES: [&[u8]; 4] = [b"begin", b"start", b"set", b"lock"];

/// Backend role a command needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    NeedMaster,
    NeedSlave,
    NeedMasterOrSlave,
}

/// Routing decision for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingDecision {
    pub need: Requirement,
    /// Pin the backend to the session until it is released
    pub dirty: bool,
}

fn has_prefix(arg: &[u8], prefix: &[u8]) -> bool {
    arg.len() >= prefix.len() && arg[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Classify a command. Opcode rules are applied after the pinning
/// prefixes, so a QUERY's role is decided by whether it is a SELECT.
pub fn classify(cmd: &CommandPacket<'_>) -> RoutingDecision {
    let mut decision = RoutingDecision {
        need: Requirement::NeedMasterOrSlave,
        dirty: false,
    };

    if PINNING_PREFIXES.iter().any(|p| has_prefix(cmd.arg, p)) {
        decision.need = Requirement::NeedMaster;
        decision.dirty = true;
    }

    match cmd.command() {
        Command::CreateDb | Command::DropDb => decision.need = Requirement::NeedMaster,
        Command::Query => {
            decision.need = if has_prefix(cmd.arg, b"select") {
                Requirement::NeedSlave
            } else {
                Requirement::NeedMaster
            };
        }
        _ => {}
    }

    decision
}

/// Make `slot` hold a backend satisfying `decision`.
///
/// A dirty backend is kept whatever the command needs. Without a backend,
/// masters serve NeedMaster and slaves serve everything else, falling back
/// to a master. A bound master gives way to a slave for NeedSlave when one
/// is free; a bound slave must give way to a master for NeedMaster. On
/// failure `slot` keeps whatever it held.
pub fn acquire_backend<S>(
    pool: &mut NodePool<S>,
    slot: &mut Option<BackendLease<S>>,
    decision: RoutingDecision,
    client: &SocketAddr,
    session: SessionId,
    now: Instant,
) -> ProxyResult<()> {
    match slot.take() {
        Some(bound) if bound.is_dirty() => *slot = Some(bound),
        None => {
            let lease = match decision.need {
                Requirement::NeedMaster => pool.acquire(Role::Master, client, session, now),
                Requirement::NeedSlave | Requirement::NeedMasterOrSlave => pool
                    .acquire(Role::Slave, client, session, now)
                    .or_else(|| pool.acquire(Role::Master, client, session, now)),
            };
            match lease {
                Some(lease) => *slot = Some(lease),
                None => return Err(ProxyError::unavailable(format!("{:?}", decision.need))),
            }
        }
        Some(bound) => match (bound.role, decision.need) {
            (Role::Master, Requirement::NeedSlave) => {
                match pool.acquire(Role::Slave, client, session, now) {
                    Some(slave) => {
                        debug!("session {} moves from master {} to slave {}", session, bound.addr, slave.addr);
                        pool.release(bound, now);
                        *slot = Some(slave);
                    }
                    None => *slot = Some(bound),
                }
            }
            (Role::Slave, Requirement::NeedMaster) => {
                match pool.acquire(Role::Master, client, session, now) {
                    Some(master) => {
                        debug!("session {} moves from slave {} to master {}", session, bound.addr, master.addr);
                        pool.release(bound, now);
                        *slot = Some(master);
                    }
                    None => {
                        *slot = Some(bound);
                        return Err(ProxyError::unavailable("NeedMaster"));
                    }
                }
            }
            _ => *slot = Some(bound),
        },
    }

    if decision.dirty {
        if let Some(lease) = slot.as_mut() {
            lease.set_dirty();
        }
    }
    Ok(())
}
