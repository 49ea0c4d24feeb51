//! Name declarations and their deterministic integer keys.
//!
//! Keys are computed at load time by hashing each declared name and probing
//! linearly on collision, so every process that reads the same file in the
//! same order agrees on every key without compiled-in enumerations. Note
//! that reordering the file can change the keys of names involved in a
//! collision; the probe order is file order.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::error;
use sha2::{Digest, Sha256};

/// Identifies one queue endpoint.
pub type AgentKey = u32;
/// Identifies one resource (field name).
pub type ResourceKey = u32;

/// Exclusive upper bound of the hashed key space; everything at or above it
/// is a sentinel.
pub const MAX_KEY: u32 = u32::MAX - 128;

pub const NOT_AN_AGENT: AgentKey = MAX_KEY;
pub const NOT_A_RESOURCE: ResourceKey = MAX_KEY;

pub const RESOURCE_AGENT_NAME: ResourceKey = MAX_KEY + 1;
pub const RESOURCE_AGENT_KEY: ResourceKey = MAX_KEY + 2;
pub const RESOURCE_RESOURCE_NAME: ResourceKey = MAX_KEY + 3;
pub const RESOURCE_RESOURCE_KEY: ResourceKey = MAX_KEY + 4;
/// Zero-length row terminator inside message bodies.
pub const RESOURCE_BANG: ResourceKey = MAX_KEY + 5;
/// Returned by body walks that have run past the last field.
pub const NO_MORE_RESOURCES: ResourceKey = MAX_KEY + 100;

/// Semantic type attached to a declared resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    OctetStr,
    Boolean,
    Integer,
    Unsigned,
    ObjectId,
    Counter64,
    Counter,
    UInteger,
    IpAddress,
    TimeTicks,
    Gauge,
    Opaque,
    ResourceKey,
    UnknownType,
}

impl ResourceType {
    /// Parses a config-file type token, case-insensitively. `None` for
    /// anything outside the closed set.
    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token.to_ascii_uppercase().as_str() {
            "OCTET_STR" => Self::OctetStr,
            "BOOLEAN" => Self::Boolean,
            "INTEGER" => Self::Integer,
            "UNSIGNED" => Self::Unsigned,
            "OBJECT_ID" => Self::ObjectId,
            "COUNTER64" => Self::Counter64,
            "COUNTER" => Self::Counter,
            "UINTEGER" => Self::UInteger,
            "IPADDRESS" => Self::IpAddress,
            "TIMETICKS" => Self::TimeTicks,
            "GAUGE" => Self::Gauge,
            "OPAQUE" => Self::Opaque,
            "RESOURCE_KEY" => Self::ResourceKey,
            _ => return None,
        })
    }
}

/// Deterministic key for a name: the leading Sha-256 word reduced into the
/// non-sentinel key space.
pub fn hash_key(name: &str) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let word = u32::from_be_bytes(digest[0..4].try_into().unwrap());
    word % MAX_KEY
}

/// The process-wide name tables: agents and resources, each with a forward
/// (key to name) and reverse (name to key) map, plus the resource types.
#[derive(Default)]
pub struct Registry {
    agent_names: BTreeMap<AgentKey, String>,
    agent_keys: BTreeMap<String, AgentKey>,
    resource_names: BTreeMap<ResourceKey, String>,
    resource_keys: BTreeMap<String, ResourceKey>,
    resource_types: BTreeMap<ResourceKey, ResourceType>,
}

impl Registry {
    /// Loads the declaration file. Lines whose first token starts with `/`
    /// declare an agent path; other non-empty lines declare a resource as
    /// `<name> <TYPE>`. A missing file is logged and yields an empty
    /// registry whose lookups all return sentinels.
    pub fn load(path: &Path) -> Registry {
        let mut registry = Registry::default();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                error!("cannot open {}: {}", path.display(), err);
                return registry;
            }
        };
        for line in text.lines() {
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            if name.starts_with('/') {
                registry.assign_agent_key(name);
            } else {
                let ty = match tokens.next().and_then(ResourceType::from_token) {
                    Some(ty) => ty,
                    None => {
                        error!("unrecognized type for resource {:?}; using OPAQUE", name);
                        ResourceType::Opaque
                    }
                };
                let key = registry.assign_resource_key(name);
                registry.resource_types.insert(key, ty);
            }
        }
        registry
    }

    /// Probes from the name's hash slot until the name itself or an empty
    /// slot is found.
    fn probe(names: &BTreeMap<u32, String>, name: &str) -> u32 {
        let mut key = hash_key(name);
        loop {
            match names.get(&key) {
                None => return key,
                Some(occupant) if occupant == name => return key,
                Some(_) => key = (key + 1) % MAX_KEY,
            }
        }
    }

    /// Key for an agent path, assigning one if the path has none yet.
    /// Idempotent for already-known paths.
    pub fn assign_agent_key(&mut self, path: &str) -> AgentKey {
        let key = Self::probe(&self.agent_names, path);
        self.agent_names.insert(key, path.to_string());
        self.agent_keys.insert(path.to_string(), key);
        key
    }

    /// Records an externally chosen key for a path (used by the synthetic
    /// keys of solipsism mode).
    pub(crate) fn bind_agent(&mut self, path: &str, key: AgentKey) {
        self.agent_names.insert(key, path.to_string());
        self.agent_keys.insert(path.to_string(), key);
    }

    pub(crate) fn remove_agent(&mut self, key: AgentKey) {
        if let Some(path) = self.agent_names.remove(&key) {
            self.agent_keys.remove(&path);
        }
    }

    /// Previously assigned key for a path, or [`NOT_AN_AGENT`].
    pub fn agent_key(&self, path: &str) -> AgentKey {
        self.agent_keys.get(path).copied().unwrap_or(NOT_AN_AGENT)
    }

    pub fn agent_name(&self, key: AgentKey) -> Option<&str> {
        self.agent_names.get(&key).map(String::as_str)
    }

    /// Key for a resource name, assigning one if the name has none yet.
    /// Two names bypass hashing and map to fixed sentinels.
    pub fn assign_resource_key(&mut self, name: &str) -> ResourceKey {
        let key = match name {
            "resourceName" => MAX_KEY + 1,
            "noMoreResources" => MAX_KEY + 2,
            _ => Self::probe(&self.resource_names, name),
        };
        self.resource_names.insert(key, name.to_string());
        self.resource_keys.insert(name.to_string(), key);
        key
    }

    /// Previously assigned key for a resource name, or [`NOT_A_RESOURCE`].
    pub fn resource_key(&self, name: &str) -> ResourceKey {
        self.resource_keys
            .get(name)
            .copied()
            .unwrap_or(NOT_A_RESOURCE)
    }

    pub fn resource_name(&self, key: ResourceKey) -> Option<&str> {
        self.resource_names.get(&key).map(String::as_str)
    }

    /// Declared type of a resource, [`ResourceType::UnknownType`] when the
    /// key carries none.
    pub fn resource_type(&self, key: ResourceKey) -> ResourceType {
        self.resource_types
            .get(&key)
            .copied()
            .unwrap_or(ResourceType::UnknownType)
    }
}
