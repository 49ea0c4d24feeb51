//! The process context tying the registry, the agents, and the transport
//! together, plus a convenience global for callers that do not want to
//! thread a context around.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{error, info};
use nix::errno::Errno;

use crate::agent::{self, Agent, QueueAttrs};
use crate::error::{Error, Result};
use crate::message::{Message, BODY_CAPACITY};
use crate::registry::{AgentKey, Registry, ResourceKey, ResourceType};
use crate::represent::{self, Dialect};
use crate::transport::{PosixQueue, QueueHandle, RECEIVE_TIMEOUT};

/// How a bus is opened.
pub struct BusConfig {
    /// Name declaration file consulted at startup.
    pub config_path: PathBuf,
    /// Enables the per-peer representation transforms.
    pub representation: bool,
    /// Replaces the kernel queues with direct in-process delivery.
    pub solipsism: bool,
}

impl Default for BusConfig {
    fn default() -> BusConfig {
        BusConfig {
            config_path: PathBuf::from(crate::DEFAULT_CONFIG_PATH),
            representation: false,
            solipsism: cfg!(feature = "solipsism"),
        }
    }
}

/// One messaging context: the name registry, the per-agent caches, the
/// registered dialects, and the transport mode.
pub struct Bus {
    registry: Registry,
    agents: BTreeMap<AgentKey, Agent>,
    dialects: BTreeMap<String, Box<dyn Dialect>>,
    representation: bool,
    solipsism: bool,
    next_synthetic: AgentKey,
}

impl Bus {
    /// Opens a bus, loading the name registry from the configured path. A
    /// missing config file only logs; the bus still works, with every
    /// lookup answering sentinels until names are created explicitly.
    pub fn open(config: BusConfig) -> Bus {
        Bus {
            registry: Registry::load(&config.config_path),
            agents: BTreeMap::new(),
            dialects: represent::stock_dialects(),
            representation: config.representation,
            solipsism: config.solipsism,
            next_synthetic: 0,
        }
    }

    // --- agents -----------------------------------------------------------

    /// Creates an agent with the kernel-discovered queue limits, clamped to
    /// the message buffer capacity.
    pub fn create_agent(&mut self, path: &str) -> Result<AgentKey> {
        let (max_count, max_size) = agent::system_limits();
        self.create_agent_with(path, max_count, max_size.min(BODY_CAPACITY as i64), true)
    }

    /// Creates an agent with explicit limits; `blocking` false opens the
    /// queue non-blocking. The requested limits must fit both the message
    /// buffer and the kernel-imposed maxima.
    pub fn create_agent_with(
        &mut self,
        path: &str,
        max_count: i64,
        max_size: i64,
        blocking: bool,
    ) -> Result<AgentKey> {
        if max_size > BODY_CAPACITY as i64 {
            error!(
                "argued body size ({}) is larger than the static allocation ({})",
                max_size, BODY_CAPACITY
            );
            return Err(Error::AgentLimitExceeded {
                requested: max_size,
                limit: BODY_CAPACITY as i64,
            });
        }
        let (count_limit, size_limit) = agent::system_limits();
        if max_count > count_limit {
            error!("argued message count ({}) larger than soft-maximum ({})", max_count, count_limit);
            return Err(Error::AgentLimitExceeded {
                requested: max_count,
                limit: count_limit,
            });
        }
        if max_size > size_limit {
            error!("argued message size ({}) larger than soft-maximum ({})", max_size, size_limit);
            return Err(Error::AgentLimitExceeded {
                requested: max_size,
                limit: size_limit,
            });
        }

        let mut attrs = QueueAttrs {
            max_count,
            max_size,
            flags: 0,
        };
        if !blocking {
            attrs.flags |= i64::from(libc::O_NONBLOCK);
        }

        info!(
            "allocating message queue at {} ({} messages of up to {} bytes)",
            path, max_count, max_size
        );

        let (key, handle) = if self.solipsism {
            let key = self.next_synthetic;
            self.next_synthetic += 1;
            self.registry.bind_agent(path, key);
            (key, QueueHandle::Solipsist)
        } else {
            let queue = PosixQueue::open(path, &attrs)?;
            (self.registry.assign_agent_key(path), QueueHandle::Posix(queue))
        };

        self.agents.insert(key, Agent::new(path, attrs, handle));
        Ok(key)
    }

    /// Tears an agent down: closes the descriptor, unlinks the queue, and
    /// drops every cache entry for the key. The caches go away even when
    /// the unlink fails, since the descriptor is already gone by then.
    pub fn destroy_agent(&mut self, path: &str) -> Result<()> {
        let key = self.registry.agent_key(path);
        let Some(agent) = self.agents.remove(&key) else {
            error!("{} does not name a live agent", path);
            return Err(Error::Transport(Errno::ENOENT));
        };
        self.registry.remove_agent(key);
        match agent.handle {
            QueueHandle::Posix(queue) => queue.destroy().map_err(|err| {
                error!("cannot unlink {}: {}", path, err);
                Error::Transport(err)
            }),
            QueueHandle::Solipsist => Ok(()),
        }
    }

    // --- lookups ----------------------------------------------------------

    /// Previously assigned key for an agent path, or the not-an-agent
    /// sentinel.
    pub fn agent_key(&self, path: &str) -> AgentKey {
        self.registry.agent_key(path)
    }

    /// Canonical path of an agent key.
    pub fn path_of(&self, key: AgentKey) -> Option<&str> {
        self.registry.agent_name(key)
    }

    /// Key for a resource name, assigning one when the name is new.
    pub fn create_resource(&mut self, name: &str) -> ResourceKey {
        self.registry.assign_resource_key(name)
    }

    /// Previously assigned key for a resource name, or the not-a-resource
    /// sentinel.
    pub fn resource_key(&self, name: &str) -> ResourceKey {
        self.registry.resource_key(name)
    }

    pub fn resource_name(&self, key: ResourceKey) -> Option<&str> {
        self.registry.resource_name(key)
    }

    pub fn resource_type(&self, key: ResourceKey) -> ResourceType {
        self.registry.resource_type(key)
    }

    /// Body cap enforced for messages addressed to `key`: the agent's
    /// queue message size, or the physical buffer bound when the key is
    /// unknown.
    pub fn max_body_size(&self, key: AgentKey) -> usize {
        self.agents
            .get(&key)
            .map_or(BODY_CAPACITY, |agent| agent.attrs.max_size as usize)
    }

    /// Application-level flag word of an agent.
    pub fn special_flags(&self, key: AgentKey) -> i32 {
        self.agents.get(&key).map_or(0, |agent| agent.special_flags)
    }

    // --- attributes -------------------------------------------------------

    /// ORs `flags` into the agent's queue flags and `special` into its
    /// application flag word. The kernel is only told when the one settable
    /// bit (non-blocking) actually flips.
    pub fn set_attributes(&mut self, key: AgentKey, flags: i64, special: i32) {
        let Some(agent) = self.agents.get_mut(&key) else {
            return;
        };
        let updated = agent.attrs.flags | flags;
        let flipped = settable_bits(agent.attrs.flags) != settable_bits(updated);
        agent.attrs.flags = updated;
        if flipped {
            push_flags(agent);
        }
        agent.special_flags |= special;
    }

    /// Clears `flags` and `special` bits, pushing to the kernel on a
    /// non-blocking-bit flip just like [`set_attributes`].
    ///
    /// [`set_attributes`]: Bus::set_attributes
    pub fn unset_attributes(&mut self, key: AgentKey, flags: i64, special: i32) {
        let Some(agent) = self.agents.get_mut(&key) else {
            return;
        };
        let updated = agent.attrs.flags & !flags;
        let flipped = settable_bits(agent.attrs.flags) != settable_bits(updated);
        agent.attrs.flags = updated;
        if flipped {
            push_flags(agent);
        }
        agent.special_flags &= !special;
    }

    // --- representation ---------------------------------------------------

    pub fn representation_enabled(&self) -> bool {
        self.representation
    }

    /// Installs (or replaces) the dialect applied for a peer path.
    pub fn register_dialect(&mut self, path: &str, dialect: Box<dyn Dialect>) {
        self.dialects.insert(path.to_string(), dialect);
    }

    /// Runs an integer through the peer's dialect; identity when
    /// representation is off or the peer has no dialect.
    pub(crate) fn represent_integer(&self, peer: AgentKey, key: ResourceKey, value: i64) -> i64 {
        if !self.representation {
            return value;
        }
        match self.dialect_for(peer) {
            Some(dialect) => dialect.represent_integer(value, self.registry.resource_type(key)),
            None => value,
        }
    }

    /// Runs a value through the peer's dialect; a bounded copy when
    /// representation is off or the peer has no dialect.
    pub(crate) fn represent_value(
        &self,
        peer: AgentKey,
        key: ResourceKey,
        dst: &mut [u8],
        src: &[u8],
    ) -> usize {
        if self.representation {
            if let Some(dialect) = self.dialect_for(peer) {
                return dialect.represent_value(dst, src, self.registry.resource_type(key));
            }
        }
        represent::copy_verbatim(dst, src)
    }

    fn dialect_for(&self, peer: AgentKey) -> Option<&dyn Dialect> {
        let path = self.registry.agent_name(peer)?;
        self.dialects.get(path).map(|dialect| &**dialect)
    }

    // --- transport --------------------------------------------------------

    /// Queues `message` for its recipient at fixed priority.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        if !self.agents.contains_key(&message.sender()) {
            error!("invalid sender key {}", message.sender());
            return Err(Error::UnknownSender(message.sender()));
        }
        let recipient = message.recipient();
        let Some(agent) = self.agents.get_mut(&recipient) else {
            error!("invalid recipient key {}", recipient);
            return Err(Error::UnknownRecipient(recipient));
        };
        info!("sending message to {}", agent.path);
        match &agent.handle {
            QueueHandle::Posix(queue) => queue.send(message.frame()).map_err(|err| {
                error!("cannot queue message for {}: {}", agent.path, err);
                Error::Transport(err)
            }),
            QueueHandle::Solipsist => {
                // sender and receiver are one in the mind of a solipsist
                agent.received.push_back(*message);
                Ok(())
            }
        }
    }

    /// Non-blocking receive bounded by the built-in poll window. Absent
    /// when nothing is waiting.
    pub fn receive(&mut self, key: AgentKey) -> Option<Message> {
        self.receive_with(key, Some(RECEIVE_TIMEOUT))
    }

    /// Blocks until a message arrives for `key` (or returns absent at once
    /// in solipsism mode with an empty inbox, where blocking could never
    /// end).
    pub fn blocking_receive(&mut self, key: AgentKey) -> Option<Message> {
        self.receive_with(key, None)
    }

    fn receive_with(&mut self, key: AgentKey, timeout: Option<Duration>) -> Option<Message> {
        let Some(agent) = self.agents.get_mut(&key) else {
            error!("invalid key {}", key);
            return None;
        };
        match &agent.handle {
            QueueHandle::Solipsist => agent.received.pop_front(),
            QueueHandle::Posix(queue) => {
                let mut message = Message::new();
                match queue.receive(&mut message, timeout) {
                    Ok(frame_len) => {
                        if !message.wire_consistent(frame_len) {
                            error!(
                                "discarding inconsistent {} byte frame for {}",
                                frame_len, agent.path
                            );
                            return None;
                        }
                        info!("received message for {}", agent.path);
                        agent.received.push_back(message);
                        Some(message)
                    }
                    Err(Errno::EAGAIN) | Err(Errno::EINTR) | Err(Errno::ETIMEDOUT) => None,
                    Err(err) => {
                        error!("receive for {} failed: {}", agent.path, err);
                        None
                    }
                }
            }
        }
    }

    /// Depth of the kernel queue for `key`, refreshing the cached
    /// attributes on the way. Zero for unknown keys and in solipsism mode.
    pub fn received_count(&mut self, key: AgentKey) -> usize {
        let Some(agent) = self.agents.get_mut(&key) else {
            return 0;
        };
        match &agent.handle {
            QueueHandle::Solipsist => 0,
            QueueHandle::Posix(queue) => match queue.attributes() {
                Ok(attr) => {
                    agent.attrs.max_count = attr.maxmsg() as i64;
                    agent.attrs.max_size = attr.msgsize() as i64;
                    agent.attrs.flags = attr.flags() as i64;
                    attr.curmsgs().max(0) as usize
                }
                Err(err) => {
                    error!("cannot read attributes of {}: {}", agent.path, err);
                    0
                }
            },
        }
    }

    /// Number of messages parked in the local received list for `key`.
    pub fn local_queue_size(&self, key: AgentKey) -> usize {
        self.agents.get(&key).map_or(0, |agent| agent.received.len())
    }

    /// Removes every message held for `key`: drains the kernel queue
    /// without blocking, clears the received list, and reports the total
    /// removed.
    pub fn flush(&mut self, key: AgentKey) -> usize {
        let Some(agent) = self.agents.get_mut(&key) else {
            error!("invalid key {}", key);
            return 0;
        };
        let mut flushed = 0;
        if let QueueHandle::Posix(queue) = &agent.handle {
            let mut scratch = Message::new();
            while queue.receive(&mut scratch, Some(Duration::ZERO)).is_ok() {
                flushed += 1;
            }
        }
        flushed += agent.received.len();
        agent.received.clear();
        info!("flushed {} messages for {}", flushed, agent.path);
        flushed
    }
}

/// The only queue flag the kernel accepts after creation.
fn settable_bits(flags: i64) -> i64 {
    flags & i64::from(libc::O_NONBLOCK)
}

fn push_flags(agent: &Agent) {
    if let QueueHandle::Posix(queue) = &agent.handle {
        if let Err(err) = queue.set_flags(&agent.attrs) {
            error!("cannot update attributes of {}: {}", agent.path, err);
        }
    }
}

lazy_static! {
    static ref PROCESS_BUS: Mutex<Option<Bus>> = Mutex::new(None);
}

/// Process-wide convenience instance.
///
/// [`initialize`] opens it once; later calls are no-ops. Everything else
/// goes through [`with`], which hands the locked bus to a closure.
///
/// [`initialize`]: global::initialize
/// [`with`]: global::with
pub mod global {
    use super::*;

    /// Opens the process bus if it is not open yet. Idempotent: a second
    /// call has no effect, whatever its arguments.
    pub fn initialize(config_path: Option<&Path>, representation: bool) {
        let mut slot = PROCESS_BUS.lock().expect("process bus poisoned");
        if slot.is_none() {
            let mut config = BusConfig {
                representation,
                ..BusConfig::default()
            };
            if let Some(path) = config_path {
                config.config_path = path.to_path_buf();
            }
            *slot = Some(Bus::open(config));
        }
    }

    /// Runs `operate` against the process bus. `None` before
    /// [`initialize`].
    pub fn with<R>(operate: impl FnOnce(&mut Bus) -> R) -> Option<R> {
        PROCESS_BUS
            .lock()
            .expect("process bus poisoned")
            .as_mut()
            .map(operate)
    }
}
