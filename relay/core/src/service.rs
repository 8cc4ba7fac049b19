use std::sync::Arc;

use relay_spec::{
    summarize_event, unix_now, AgentId, CommandId, SignatureVerifier, SignedOperation, VerifyError,
    WebhookKind, WebhookVerifier,
};

use crate::{CommandQueue, DispatchMode, QueueError, RelayConfig};

/// Action attached to webhook-derived commands.
pub const WEBHOOK_ACTION: &str = "notify";

/// Signature stored on webhook-derived commands. The webhook's own signature
/// authenticates them; no agent-protocol signature is derived.
pub const WEBHOOK_SIGNATURE_PLACEHOLDER: &str = "webhook";

/// Relay operation failures.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Bad, missing or expired signature, unknown agent, or unset secret.
    #[error("authentication failed: {0}")]
    Authentication(VerifyError),
    /// Missing or malformed request field.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Webhook secret not configured.
    #[error("webhook secret not configured")]
    WebhookUnconfigured,
    /// Queue storage failure.
    #[error(transparent)]
    Storage(#[from] QueueError),
}

/// Submit a command for an agent.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    /// Recipient agent.
    pub agent: String,
    /// Action name.
    pub action: String,
    /// Action argument.
    pub payload: String,
    /// Caller timestamp, as received.
    pub timestamp: String,
    /// Hex HMAC over `{agent}.{action}.{payload}.{ts}`.
    pub signature: String,
}

/// Poll for the next command.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// Polling agent.
    pub agent: String,
    /// Caller timestamp, as received.
    pub timestamp: String,
    /// Hex HMAC over `{agent}.next..{ts}`.
    pub signature: String,
}

/// Report the result of a command.
#[derive(Debug, Clone, Default)]
pub struct ReportRequest {
    /// Reporting agent; resolved from the stored command when omitted.
    pub agent: Option<String>,
    /// Command id.
    pub id: Option<CommandId>,
    /// Result text; truncated before storage.
    pub result: String,
    /// Caller timestamp, as received.
    pub timestamp: String,
    /// Hex HMAC over `{agent}.result.{id}.{ts}`.
    pub signature: String,
}

/// Raw webhook delivery.
#[derive(Debug, Clone, Default)]
pub struct WebhookDelivery {
    /// Raw request body, exactly as signed.
    pub body: Vec<u8>,
    /// Signature header value (`sha256=<hex>`).
    pub signature: Option<String>,
    /// Event-kind header value.
    pub event_kind: Option<String>,
}

/// Result of FetchNext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Next command for the agent.
    Command {
        /// Command id, used when reporting the result.
        id: CommandId,
        /// Action name.
        action: String,
        /// Action argument.
        payload: String,
    },
    /// Nothing to do.
    NoPending,
}

/// Result of ReportResult. Both variants are reported to callers as saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Result stored.
    Saved,
    /// No such command for this agent; nothing changed.
    UnknownCommand,
}

/// Command enqueued from a webhook event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookReceipt {
    /// Assigned command id.
    pub id: CommandId,
    /// Recipient agent.
    pub agent: AgentId,
    /// Command action.
    pub action: String,
    /// Derived summary, stored as the payload.
    pub message: String,
}

/// Composes signature verification with the command queue.
#[derive(Clone)]
pub struct RelayService {
    verifier: SignatureVerifier,
    webhook: WebhookVerifier,
    queue: Arc<dyn CommandQueue>,
    dispatch: DispatchMode,
    webhook_agent: AgentId,
}

impl RelayService {
    /// Build a service from startup configuration and an opened queue.
    pub fn new(config: &RelayConfig, queue: Arc<dyn CommandQueue>) -> Self {
        Self {
            verifier: SignatureVerifier::new(config.agent_secret.clone(), config.agents.clone()),
            webhook: WebhookVerifier::new(config.webhook_secret.clone()),
            queue,
            dispatch: config.dispatch,
            webhook_agent: config.webhook_agent.clone(),
        }
    }

    /// Underlying queue.
    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    /// Whether webhook ingestion is configured.
    pub fn webhook_configured(&self) -> bool {
        self.webhook.is_configured()
    }

    fn authenticate(
        &self,
        agent: &str,
        op: &SignedOperation<'_>,
        timestamp: &str,
        signature: &str,
    ) -> Result<i64, RelayError> {
        self.verifier
            .check(agent, op, timestamp, signature)
            .map_err(|reason| {
                tracing::warn!(agent, op = op.label(), %reason, "signature rejected");
                RelayError::Authentication(reason)
            })
    }

    /// Verify and enqueue a command. Nothing is enqueued on failure.
    pub fn submit(&self, req: &SubmitRequest) -> Result<CommandId, RelayError> {
        let span = tracing::info_span!(
            "relay_submit",
            agent = %req.agent,
            action = %req.action,
            id = tracing::field::Empty
        );
        let _guard = span.enter();
        let op = SignedOperation::Submit {
            action: &req.action,
            payload: &req.payload,
        };
        let ts = self.authenticate(&req.agent, &op, &req.timestamp, &req.signature)?;
        let id = self
            .queue
            .enqueue(&req.agent, &req.action, &req.payload, ts, &req.signature)?;
        span.record("id", &id);
        tracing::info!("command queued");
        Ok(id)
    }

    /// Verify a poll and return the agent's next command.
    pub fn fetch_next(&self, req: &FetchRequest) -> Result<FetchOutcome, RelayError> {
        let span = tracing::debug_span!("relay_fetch_next", agent = %req.agent);
        let _guard = span.enter();
        self.authenticate(
            &req.agent,
            &SignedOperation::FetchNext,
            &req.timestamp,
            &req.signature,
        )?;
        let next = match self.dispatch {
            DispatchMode::Peek => self.queue.peek_next(&req.agent)?,
            DispatchMode::Claim => self.queue.claim_next(&req.agent)?,
        };
        Ok(match next {
            Some(cmd) => {
                tracing::debug!(id = cmd.id, "dispatching command");
                FetchOutcome::Command {
                    id: cmd.id,
                    action: cmd.action,
                    payload: cmd.payload,
                }
            }
            None => FetchOutcome::NoPending,
        })
    }

    /// Verify and record a result.
    ///
    /// Reports for unknown ids, or ids owned by another agent, succeed without
    /// changing anything. When the request omits the agent it is taken from the
    /// stored command; an unknown id then cannot be authenticated and is rejected.
    pub fn report_result(&self, req: &ReportRequest) -> Result<ReportOutcome, RelayError> {
        let id = match req.id {
            Some(id) if id > 0 => id,
            _ => return Err(RelayError::Validation("Missing id".into())),
        };
        let span = tracing::info_span!("relay_report_result", id, agent = tracing::field::Empty);
        let _guard = span.enter();
        let stored = self.queue.get(id);
        let agent = match (&req.agent, &stored) {
            (Some(agent), _) => agent.clone(),
            (None, Some(cmd)) => cmd.agent.clone(),
            (None, None) => {
                tracing::warn!("result for unknown id without agent");
                return Err(RelayError::Authentication(VerifyError::UnknownAgent));
            }
        };
        span.record("agent", &agent.as_str());
        self.authenticate(
            &agent,
            &SignedOperation::ReportResult { id },
            &req.timestamp,
            &req.signature,
        )?;
        match stored {
            Some(cmd) if cmd.agent == agent => {
                self.queue.record_result(id, &req.result)?;
                tracing::info!("result recorded");
                Ok(ReportOutcome::Saved)
            }
            Some(_) => {
                tracing::warn!("result for command owned by another agent ignored");
                Ok(ReportOutcome::UnknownCommand)
            }
            None => {
                tracing::info!("result for unknown id ignored");
                Ok(ReportOutcome::UnknownCommand)
            }
        }
    }

    /// Verify a webhook delivery and enqueue its summary for the webhook agent.
    pub fn ingest_webhook(&self, delivery: &WebhookDelivery) -> Result<WebhookReceipt, RelayError> {
        let kind = WebhookKind::from_header(delivery.event_kind.as_deref().unwrap_or_default());
        let span = tracing::info_span!(
            "relay_webhook_ingest",
            kind = ?kind,
            id = tracing::field::Empty
        );
        let _guard = span.enter();
        if !self.webhook.is_configured() {
            tracing::error!("webhook delivery received but no webhook secret is configured");
            return Err(RelayError::WebhookUnconfigured);
        }
        self.webhook
            .check(&delivery.body, delivery.signature.as_deref())
            .map_err(|reason| {
                tracing::warn!(%reason, "webhook signature rejected");
                RelayError::Authentication(reason)
            })?;
        let message = summarize_event(&kind, &delivery.body);
        let id = self.queue.enqueue(
            &self.webhook_agent,
            WEBHOOK_ACTION,
            &message,
            unix_now(),
            WEBHOOK_SIGNATURE_PLACEHOLDER,
        )?;
        span.record("id", &id);
        tracing::info!(%message, "webhook event queued");
        Ok(WebhookReceipt {
            id,
            agent: self.webhook_agent.clone(),
            action: WEBHOOK_ACTION.into(),
            message,
        })
    }
}
