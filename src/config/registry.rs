/// Backend registry file
///
/// One node per line: `role host port user pass connection_count`, where
/// role is `master` or `slave`. Blank lines and lines starting with `#` are
/// skipped; a password of `-` means the empty password.
use super::ConfigError;
use crate::pool::Role;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

/// Maximum node slots per role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleLimits {
    pub masters: usize,
    pub slaves: usize,
}

impl RoleLimits {
    pub fn for_role(&self, role: Role) -> usize {
        match role {
            Role::Master => self.masters,
            Role::Slave => self.slaves,
        }
    }
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            masters: 1,
            slaves: 64,
        }
    }
}

/// One backend node as declared in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connections: usize,
}

/// Identity of a node across reloads
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub role: Role,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.role, self.host, self.port)
    }
}

impl NodeSpec {
    pub fn key(&self) -> NodeKey {
        NodeKey {
            role: self.role,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parsed registry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    nodes: Vec<NodeSpec>,
}

/// Nodes to register and unregister when moving between two registries.
/// `changed` lists nodes kept under the same key whose user, password or
/// connection count differ; a running node is not rebuilt in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<NodeSpec>,
    pub removed: Vec<NodeKey>,
    pub changed: Vec<NodeKey>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

impl Registry {
    pub fn load_from_file<P: AsRef<Path>>(path: P, limits: RoleLimits) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content, limits)
    }

    pub fn parse(content: &str, limits: RoleLimits) -> Result<Self, ConfigError> {
        let mut nodes: Vec<NodeSpec> = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in content.lines().enumerate() {
            let lineno = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let spec = parse_line(line).map_err(|reason| {
                ConfigError::ParseError(format!("registry line {}: {}", lineno, reason))
            })?;

            if !seen.insert(spec.key()) {
                return Err(ConfigError::ValidationError(format!(
                    "registry line {}: duplicate node {}",
                    lineno,
                    spec.key()
                )));
            }

            let count = nodes.iter().filter(|n| n.role == spec.role).count();
            if count >= limits.for_role(spec.role) {
                return Err(ConfigError::ValidationError(format!(
                    "registry line {}: {} number exceeds limit [{}]",
                    lineno,
                    spec.role,
                    limits.for_role(spec.role)
                )));
            }

            nodes.push(spec);
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// What has to change to go from `self` to `next`
    pub fn diff(&self, next: &Registry) -> RegistryDiff {
        let old: HashMap<NodeKey, &NodeSpec> = self.nodes.iter().map(|n| (n.key(), n)).collect();
        let new: HashSet<NodeKey> = next.nodes.iter().map(NodeSpec::key).collect();

        let mut diff = RegistryDiff::default();
        for spec in &next.nodes {
            match old.get(&spec.key()) {
                None => diff.added.push(spec.clone()),
                Some(current) if *current != spec => diff.changed.push(spec.key()),
                Some(_) => {}
            }
        }
        diff.removed = self
            .nodes
            .iter()
            .map(NodeSpec::key)
            .filter(|k| !new.contains(k))
            .collect();
        diff
    }

    /// `self` with the nodes named in `keys` taken back from `running`, so
    /// the recorded registry matches what the pool actually runs
    pub fn keep_running(mut self, running: &Registry, keys: &[NodeKey]) -> Registry {
        for spec in self.nodes.iter_mut() {
            let key = spec.key();
            if !keys.contains(&key) {
                continue;
            }
            if let Some(current) = running.nodes.iter().find(|n| n.key() == key) {
                *spec = current.clone();
            }
        }
        self
    }
}

fn parse_line(line: &str) -> Result<NodeSpec, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(format!("expected 6 fields, found {}", fields.len()));
    }

    let role = match fields[0] {
        "master" => Role::Master,
        "slave" => Role::Slave,
        other => return Err(format!("unknown role '{}'", other)),
    };
    let port: u16 = fields[2]
        .parse()
        .map_err(|_| format!("invalid port '{}'", fields[2]))?;
    if port == 0 {
        return Err("port must be greater than 0".to_string());
    }
    let connections: usize = fields[5]
        .parse()
        .map_err(|_| format!("invalid connection count '{}'", fields[5]))?;
    if connections == 0 {
        return Err("connection count must be greater than 0".to_string());
    }
    let password = match fields[4] {
        "-" => String::new(),
        p => p.to_string(),
    };

    Ok(NodeSpec {
        role,
        host: fields[1].to_string(),
        port,
        user: fields[3].to_string(),
        password,
        connections,
    })
}
