use std::path::PathBuf;
use std::sync::Arc;

use relay_spec::{AgentId, AgentRegistry, SharedSecret};

use crate::{CommandQueue, MemoryQueue, PersistentQueue, QueueError};

/// Agent that receives commands produced by webhook ingestion unless overridden.
pub const DEFAULT_WEBHOOK_AGENT: &str = "suna";

/// How FetchNext hands out commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Return the head pending command without touching it. Concurrent pollers for
    /// the same agent may both receive it.
    #[default]
    Peek,
    /// Select and claim the head pending command atomically; an agent never
    /// receives the same command twice.
    ///
    /// Claims do not expire and survive restarts. Until the agent reports a
    /// result for the claimed id, later commands for that agent are held back,
    /// so a poll response lost in transit stalls the agent. Reporting a result
    /// for the id (it is visible in `relayd list`) releases the queue.
    Claim,
}

/// Where commands are stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageLocation {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// Directory for the persistent queue.
    Directory(PathBuf),
}

/// Immutable process configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Secret for the agent protocol. `None` rejects every signed request.
    pub agent_secret: Option<SharedSecret>,
    /// Secret for webhook ingestion. `None` disables the webhook route.
    pub webhook_secret: Option<SharedSecret>,
    /// Agents allowed to use the signed protocol.
    pub agents: AgentRegistry,
    /// Queue storage.
    pub storage: StorageLocation,
    /// FetchNext dispatch strategy.
    pub dispatch: DispatchMode,
    /// Recipient of webhook-derived commands.
    pub webhook_agent: AgentId,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent_secret: None,
            webhook_secret: None,
            agents: AgentRegistry::new(),
            storage: StorageLocation::Memory,
            dispatch: DispatchMode::Peek,
            webhook_agent: DEFAULT_WEBHOOK_AGENT.into(),
        }
    }
}

impl RelayConfig {
    /// Configuration problems worth reporting at startup. None of them are fatal.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.agent_secret.is_none() {
            out.push("agent secret not configured; all signed requests will be rejected".into());
        }
        if self.agents.is_empty() {
            out.push("agent allow-list is empty; all signed requests will be rejected".into());
        }
        if self.webhook_secret.is_none() {
            out.push("webhook secret not configured; webhook ingestion disabled".into());
        }
        if !self.agents.contains(&self.webhook_agent) {
            out.push(format!(
                "webhook agent {} is not in the allow-list and cannot poll",
                self.webhook_agent
            ));
        }
        out
    }
}

/// Open the queue described by `location`.
pub fn open_queue(location: &StorageLocation) -> Result<Arc<dyn CommandQueue>, QueueError> {
    match location {
        StorageLocation::Memory => Ok(Arc::new(MemoryQueue::new())),
        StorageLocation::Directory(dir) => Ok(Arc::new(PersistentQueue::open(dir)?)),
    }
}
