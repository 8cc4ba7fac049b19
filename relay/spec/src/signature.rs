use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::{
    unix_now, AgentRegistry, CommandId, SharedSecret, Timestamp, VerifyError, FETCH_NEXT_ACTION,
    REPLAY_WINDOW_SECS, RESULT_ACTION,
};

type HmacSha256 = Hmac<Sha256>;

/// Shape of the message signed for each relay operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignedOperation<'a> {
    /// `{agent}.{action}.{payload}.{ts}`.
    Submit {
        /// Requested action.
        action: &'a str,
        /// Action argument; may be empty.
        payload: &'a str,
    },
    /// `{agent}.next..{ts}`.
    FetchNext,
    /// `{agent}.result.{id}.{ts}`.
    ReportResult {
        /// Command the result belongs to.
        id: CommandId,
    },
}

impl SignedOperation<'_> {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SignedOperation::Submit { .. } => "submit",
            SignedOperation::FetchNext => "next",
            SignedOperation::ReportResult { .. } => "result",
        }
    }
}

/// Build the canonical message for `op`.
///
/// Fields are joined with `.` and empty fields keep their separator, so an empty
/// payload produces `{agent}.{action}..{ts}`.
pub fn canonical_message(agent: &str, op: &SignedOperation<'_>, timestamp: Timestamp) -> String {
    match op {
        SignedOperation::Submit { action, payload } => {
            join_fields(agent, action, payload, timestamp)
        }
        SignedOperation::FetchNext => join_fields(agent, FETCH_NEXT_ACTION, "", timestamp),
        SignedOperation::ReportResult { id } => {
            join_fields(agent, RESULT_ACTION, &id.to_string(), timestamp)
        }
    }
}

fn join_fields(agent: &str, action: &str, payload: &str, timestamp: Timestamp) -> String {
    format!("{agent}.{action}.{payload}.{timestamp}")
}

/// Lowercase hex HMAC-SHA256 of `message` under `secret`.
pub fn sign_message(secret: &SharedSecret, message: &str) -> String {
    hmac_sha256_hex(secret.expose(), message.as_bytes())
}

pub(crate) fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key should be valid");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn constant_time_eq(expected: &str, presented: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Validates agent-protocol signatures against the shared secret and allow-list.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: Option<SharedSecret>,
    agents: AgentRegistry,
    window_secs: u64,
}

impl SignatureVerifier {
    /// Create a verifier. A `None` secret rejects every request.
    pub fn new(secret: Option<SharedSecret>, agents: AgentRegistry) -> Self {
        Self {
            secret,
            agents,
            window_secs: REPLAY_WINDOW_SECS,
        }
    }

    /// Allow-list consulted by this verifier.
    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Whether a shared secret is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Generic contract: verify a signature over `{agent}.{action}.{payload}.{ts}`.
    pub fn verify(
        &self,
        agent: &str,
        action: &str,
        payload: &str,
        timestamp: &str,
        signature: &str,
    ) -> bool {
        self.check(
            agent,
            &SignedOperation::Submit { action, payload },
            timestamp,
            signature,
        )
        .is_ok()
    }

    /// Verify against the current clock, returning the parsed timestamp.
    pub fn check(
        &self,
        agent: &str,
        op: &SignedOperation<'_>,
        timestamp: &str,
        signature: &str,
    ) -> Result<Timestamp, VerifyError> {
        self.check_at(unix_now(), agent, op, timestamp, signature)
    }

    /// Verify against an explicit `now`.
    pub fn check_at(
        &self,
        now: Timestamp,
        agent: &str,
        op: &SignedOperation<'_>,
        timestamp: &str,
        signature: &str,
    ) -> Result<Timestamp, VerifyError> {
        if !self.agents.contains(agent) {
            return Err(VerifyError::UnknownAgent);
        }
        let ts: Timestamp = timestamp
            .parse()
            .map_err(|_| VerifyError::MalformedTimestamp)?;
        let skew = now.abs_diff(ts);
        if skew > self.window_secs {
            return Err(VerifyError::Expired { skew });
        }
        let secret = self.secret.as_ref().ok_or(VerifyError::SecretUnset)?;
        if signature.is_empty() {
            return Err(VerifyError::MissingSignature);
        }
        let expected = sign_message(secret, &canonical_message(agent, op, ts));
        if !constant_time_eq(&expected, signature) {
            return Err(VerifyError::SignatureMismatch);
        }
        Ok(ts)
    }
}
