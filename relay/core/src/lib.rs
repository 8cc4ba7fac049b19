//! Relay core library: command queue storage (in-memory and persistent),
//! runtime configuration, and the relay service that composes signature
//! verification with the queue.
#![deny(missing_docs)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use relay_spec::{AgentId, Command, CommandId, Timestamp};

/// Runtime configuration and queue construction.
pub mod config;
/// Disk-backed queue with checksummed WAL and snapshot compaction.
pub mod persistent;
/// Submit / fetch-next / report-result / webhook orchestration.
pub mod service;

pub use config::{open_queue, DispatchMode, RelayConfig, StorageLocation};
pub use persistent::PersistentQueue;
pub use service::{
    FetchOutcome, FetchRequest, RelayError, RelayService, ReportOutcome, ReportRequest,
    SubmitRequest, WebhookDelivery, WebhookReceipt,
};

/// Errors emitted by command queues.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Storage or I/O failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Ordered command store shared by all relay operations.
///
/// Every method is atomic with respect to itself.
pub trait CommandQueue: Send + Sync {
    /// Append a pending command and return its id.
    fn enqueue(
        &self,
        agent: &str,
        action: &str,
        payload: &str,
        submitted_at: Timestamp,
        signature: &str,
    ) -> Result<CommandId, QueueError>;
    /// Lowest-id pending command for `agent`, without changing it.
    fn peek_next(&self, agent: &str) -> Result<Option<Command>, QueueError>;
    /// Select and claim the lowest-id pending command for `agent` in one step.
    ///
    /// Returns `None` when the agent has no pending work or when its head command
    /// is already claimed and still awaiting a result. A claim is only released
    /// by a result for that id.
    fn claim_next(&self, agent: &str) -> Result<Option<Command>, QueueError>;
    /// Mark `id` executed with `result`. Returns `false` if `id` is unknown.
    fn record_result(&self, id: CommandId, result: &str) -> Result<bool, QueueError>;
    /// Look up a command by id.
    fn get(&self, id: CommandId) -> Option<Command>;
    /// Read commands in id order.
    fn read(&self, offset: usize, limit: usize) -> Vec<Command>;
    /// Total number of commands ever enqueued.
    fn len(&self) -> usize;
    /// Whether the queue holds no commands.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Commands still awaiting a result, across all agents.
    fn pending_count(&self) -> usize;
    /// Optional storage usage hint (in bytes) for health reporting.
    fn storage_usage_bytes(&self) -> Option<u64> {
        None
    }
}

/// A single durable queue mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum QueueRecord {
    /// New command (or a snapshot of one, during compaction).
    Enqueued {
        /// Command as stored.
        command: Command,
    },
    /// Command handed out under claim dispatch.
    Claimed {
        /// Claimed command.
        id: CommandId,
    },
    /// Result recorded.
    Resolved {
        /// Resolved command.
        id: CommandId,
        /// Truncated result.
        result: String,
    },
}

impl QueueRecord {
    /// Command this record touches.
    pub fn command_id(&self) -> CommandId {
        match self {
            QueueRecord::Enqueued { command } => command.id,
            QueueRecord::Claimed { id } | QueueRecord::Resolved { id, .. } => *id,
        }
    }
}

/// Folded queue contents plus the per-agent pending index.
#[derive(Debug, Clone)]
pub(crate) struct QueueState {
    commands: BTreeMap<CommandId, Command>,
    pending: HashMap<AgentId, BTreeSet<CommandId>>,
    next_id: CommandId,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            pending: HashMap::new(),
            next_id: 1,
        }
    }
}

impl QueueState {
    pub(crate) fn from_records(records: impl IntoIterator<Item = QueueRecord>) -> Self {
        let mut state = Self::default();
        for record in records {
            state.apply(record);
        }
        state
    }

    /// Apply a record. Replaying an already-folded record leaves the state unchanged.
    pub(crate) fn apply(&mut self, record: QueueRecord) {
        match record {
            QueueRecord::Enqueued { command } => {
                if self.commands.contains_key(&command.id) {
                    return;
                }
                self.next_id = self.next_id.max(command.id + 1);
                if command.is_pending() {
                    self.pending
                        .entry(command.agent.clone())
                        .or_default()
                        .insert(command.id);
                }
                self.commands.insert(command.id, command);
            }
            QueueRecord::Claimed { id } => {
                if let Some(cmd) = self.commands.get_mut(&id) {
                    if cmd.is_pending() {
                        cmd.claimed = true;
                    }
                }
            }
            QueueRecord::Resolved { id, result } => {
                if let Some(cmd) = self.commands.get_mut(&id) {
                    cmd.resolve(&result);
                    if let Some(ids) = self.pending.get_mut(&cmd.agent) {
                        ids.remove(&id);
                        if ids.is_empty() {
                            self.pending.remove(&cmd.agent);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn plan_enqueue(
        &self,
        agent: &str,
        action: &str,
        payload: &str,
        submitted_at: Timestamp,
        signature: &str,
    ) -> QueueRecord {
        QueueRecord::Enqueued {
            command: Command::pending(
                self.next_id,
                agent,
                action,
                payload,
                submitted_at,
                signature,
            ),
        }
    }

    pub(crate) fn head_pending(&self, agent: &str) -> Option<&Command> {
        self.pending
            .get(agent)
            .and_then(|ids| ids.first())
            .and_then(|id| self.commands.get(id))
    }

    pub(crate) fn plan_claim(&self, agent: &str) -> Option<QueueRecord> {
        match self.head_pending(agent) {
            Some(head) if !head.claimed => Some(QueueRecord::Claimed { id: head.id }),
            _ => None,
        }
    }

    pub(crate) fn plan_resolve(&self, id: CommandId, result: &str) -> Option<QueueRecord> {
        self.commands.contains_key(&id).then(|| QueueRecord::Resolved {
            id,
            result: relay_spec::truncate_result(result).to_owned(),
        })
    }

    pub(crate) fn get(&self, id: CommandId) -> Option<&Command> {
        self.commands.get(&id)
    }

    pub(crate) fn read(&self, offset: usize, limit: usize) -> Vec<Command> {
        self.commands
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn next_id(&self) -> CommandId {
        self.next_id
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(BTreeSet::len).sum()
    }

    pub(crate) fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }
}

/// In-memory command queue.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Arc<RwLock<QueueState>>,
}

impl MemoryQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: QueueState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }
}

impl CommandQueue for MemoryQueue {
    fn enqueue(
        &self,
        agent: &str,
        action: &str,
        payload: &str,
        submitted_at: Timestamp,
        signature: &str,
    ) -> Result<CommandId, QueueError> {
        let span = tracing::debug_span!("queue_enqueue", agent, id = tracing::field::Empty);
        let _guard = span.enter();
        let mut state = self.state.write();
        let record = state.plan_enqueue(agent, action, payload, submitted_at, signature);
        let id = state.next_id();
        state.apply(record);
        span.record("id", &id);
        Ok(id)
    }

    fn peek_next(&self, agent: &str) -> Result<Option<Command>, QueueError> {
        Ok(self.state.read().head_pending(agent).cloned())
    }

    fn claim_next(&self, agent: &str) -> Result<Option<Command>, QueueError> {
        let mut state = self.state.write();
        let Some(record) = state.plan_claim(agent) else {
            return Ok(None);
        };
        state.apply(record);
        Ok(state.head_pending(agent).cloned())
    }

    fn record_result(&self, id: CommandId, result: &str) -> Result<bool, QueueError> {
        let mut state = self.state.write();
        match state.plan_resolve(id, result) {
            Some(record) => {
                state.apply(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn get(&self, id: CommandId) -> Option<Command> {
        self.state.read().get(id).cloned()
    }

    fn read(&self, offset: usize, limit: usize) -> Vec<Command> {
        self.state.read().read(offset, limit)
    }

    fn len(&self) -> usize {
        self.state.read().len()
    }

    fn pending_count(&self) -> usize {
        self.state.read().pending_count()
    }

    fn storage_usage_bytes(&self) -> Option<u64> {
        Some(0)
    }
}
