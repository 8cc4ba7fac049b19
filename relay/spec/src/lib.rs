//! Relay protocol types and signature primitives.
//!
//! This crate defines the command record, the agent allow-list, the canonical
//! message rules used for HMAC signing, and the webhook signature scheme.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Agent-protocol signature verification and canonical messages.
pub mod signature;
/// Externally signed webhook events and their summaries.
pub mod webhook;

pub use signature::{canonical_message, sign_message, SignatureVerifier, SignedOperation};
pub use webhook::{summarize_event, WebhookKind, WebhookVerifier};

/// Queue-assigned command identifier.
pub type CommandId = u64;

/// Agent identifier.
pub type AgentId = String;

/// Unix timestamp in seconds, as supplied by the caller.
pub type Timestamp = i64;

/// Maximum stored result length, in characters.
pub const MAX_RESULT_CHARS: usize = 8000;

/// Accepted clock skew between caller and relay, in seconds.
pub const REPLAY_WINDOW_SECS: u64 = 300;

/// Action token signed by pollers asking for their next command.
pub const FETCH_NEXT_ACTION: &str = "next";

/// Action token signed by agents reporting a result.
pub const RESULT_ACTION: &str = "result";

/// Execution state of a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Waiting for an agent to execute it.
    Pending,
    /// Result has been reported. Terminal.
    Executed,
}

/// A queued unit of work addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    /// Sequential id assigned on insertion.
    pub id: CommandId,
    /// Recipient agent.
    pub agent: AgentId,
    /// Operation the agent should perform.
    pub action: String,
    /// Argument to the action; may be empty.
    pub payload: String,
    /// Caller-supplied submission timestamp.
    pub submitted_at: Timestamp,
    /// Hex signature presented at submission, kept for audit.
    pub signature: String,
    /// Execution state.
    pub state: CommandState,
    /// Reported result; set iff `state` is `Executed`.
    pub result: Option<String>,
    /// Whether a poller has claimed this command.
    #[serde(default)]
    pub claimed: bool,
}

impl Command {
    /// Build a fresh pending command.
    pub fn pending(
        id: CommandId,
        agent: impl Into<AgentId>,
        action: impl Into<String>,
        payload: impl Into<String>,
        submitted_at: Timestamp,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            id,
            agent: agent.into(),
            action: action.into(),
            payload: payload.into(),
            submitted_at,
            signature: signature.into(),
            state: CommandState::Pending,
            result: None,
            claimed: false,
        }
    }

    /// Whether the command still awaits a result.
    pub fn is_pending(&self) -> bool {
        self.state == CommandState::Pending
    }

    /// Move to `Executed` with the given (truncated) result.
    ///
    /// Calling this again keeps the state and replaces the stored result.
    pub fn resolve(&mut self, result: &str) {
        self.state = CommandState::Executed;
        self.result = Some(truncate_result(result).to_owned());
    }
}

/// Cut a result down to [`MAX_RESULT_CHARS`] characters.
pub fn truncate_result(result: &str) -> &str {
    match result.char_indices().nth(MAX_RESULT_CHARS) {
        Some((byte_idx, _)) => &result[..byte_idx],
        None => result,
    }
}

/// Static allow-list of agents permitted to use the signed protocol.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistry {
    agents: BTreeSet<AgentId>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent identifier. Blank identifiers are ignored.
    pub fn insert(&mut self, agent: impl Into<AgentId>) {
        let agent = agent.into();
        let agent = agent.trim();
        if !agent.is_empty() {
            self.agents.insert(agent.to_owned());
        }
    }

    /// Whether `agent` is allowed.
    pub fn contains(&self, agent: &str) -> bool {
        self.agents.contains(agent)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Iterate registered agents in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(String::as_str)
    }
}

impl<S: Into<AgentId>> FromIterator<S> for AgentRegistry {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut registry = Self::new();
        for agent in iter {
            registry.insert(agent);
        }
        registry
    }
}

/// HMAC key material. Zeroed on drop and never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: Vec<u8>,
}

impl SharedSecret {
    /// Wrap a secret. Returns `None` for empty input so callers fail closed.
    pub fn new(secret: impl AsRef<[u8]>) -> Option<Self> {
        let bytes = secret.as_ref();
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Raw key bytes.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Reasons a signed request is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// No shared secret configured.
    #[error("shared secret not configured")]
    SecretUnset,
    /// Agent is not in the allow-list.
    #[error("unknown agent")]
    UnknownAgent,
    /// Timestamp is not an integer.
    #[error("malformed timestamp")]
    MalformedTimestamp,
    /// Timestamp outside the replay window.
    #[error("timestamp outside replay window (skew {skew}s)")]
    Expired {
        /// Absolute distance from the relay clock, in seconds.
        skew: u64,
    },
    /// Signature header missing or empty.
    #[error("missing signature")]
    MissingSignature,
    /// Signature did not match.
    #[error("signature mismatch")]
    SignatureMismatch,
}

/// Current Unix time in seconds.
pub fn unix_now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as Timestamp)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_to_max_chars() {
        let long = "x".repeat(9000);
        assert_eq!(truncate_result(&long).len(), MAX_RESULT_CHARS);
        assert_eq!(truncate_result("short"), "short");
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let long = "é".repeat(MAX_RESULT_CHARS + 10);
        let cut = truncate_result(&long);
        assert_eq!(cut.chars().count(), MAX_RESULT_CHARS);
        assert_eq!(cut.len(), MAX_RESULT_CHARS * 2);
    }

    #[test]
    fn resolve_sets_result_and_state() {
        let mut cmd = Command::pending(1, "suna", "say", "hi", 10, "ab");
        assert!(cmd.is_pending());
        assert!(cmd.result.is_none());
        cmd.resolve("done");
        assert_eq!(cmd.state, CommandState::Executed);
        assert_eq!(cmd.result.as_deref(), Some("done"));
        cmd.resolve("again");
        assert_eq!(cmd.state, CommandState::Executed);
        assert_eq!(cmd.result.as_deref(), Some("again"));
    }

    #[test]
    fn registry_ignores_blank_agents() {
        let registry: AgentRegistry = ["suna", " ", "", " atlas "].into_iter().collect();
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("atlas"));
        assert!(!registry.contains(""));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(SharedSecret::new("").is_none());
        let secret = SharedSecret::new("k").unwrap();
        assert_eq!(format!("{secret:?}"), "SharedSecret(<redacted>)");
    }
}
