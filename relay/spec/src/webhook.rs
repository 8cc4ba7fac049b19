use serde_json::Value;

use crate::signature::{constant_time_eq, hmac_sha256_hex};
use crate::{SharedSecret, VerifyError};

/// Prefix carried by the webhook signature header.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Event kinds with a dedicated summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
    /// Commits pushed to a branch.
    Push,
    /// Pull request opened, closed, edited, ...
    PullRequest,
    /// Issue opened, closed, edited, ...
    Issues,
    /// Delivery test sent when a hook is created.
    Ping,
    /// Anything else, named by the event header.
    Other(String),
}

impl WebhookKind {
    /// Classify the value of the event-kind header.
    pub fn from_header(kind: &str) -> Self {
        match kind.trim() {
            "push" => WebhookKind::Push,
            "pull_request" => WebhookKind::PullRequest,
            "issues" => WebhookKind::Issues,
            "ping" => WebhookKind::Ping,
            "" => WebhookKind::Other("unknown".into()),
            other => WebhookKind::Other(other.to_owned()),
        }
    }
}

/// Checks `sha256=<hex>` body signatures with the webhook secret.
#[derive(Debug, Clone)]
pub struct WebhookVerifier {
    secret: Option<SharedSecret>,
}

impl WebhookVerifier {
    /// Create a verifier; `None` means webhook ingestion is not configured.
    pub fn new(secret: Option<SharedSecret>) -> Self {
        Self { secret }
    }

    /// Whether a webhook secret is configured.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Expected header value for `body`, if configured.
    pub fn expected_header(&self, body: &[u8]) -> Option<String> {
        self.secret
            .as_ref()
            .map(|secret| format!("{SIGNATURE_PREFIX}{}", hmac_sha256_hex(secret.expose(), body)))
    }

    /// Verify the raw body against the presented header value.
    pub fn check(&self, body: &[u8], header: Option<&str>) -> Result<(), VerifyError> {
        let expected = self.expected_header(body).ok_or(VerifyError::SecretUnset)?;
        let presented = match header {
            Some(value) if !value.is_empty() => value,
            _ => return Err(VerifyError::MissingSignature),
        };
        if constant_time_eq(&expected, presented) {
            Ok(())
        } else {
            Err(VerifyError::SignatureMismatch)
        }
    }
}

/// One-line human readable summary of a webhook event.
///
/// Never fails: missing fields render as `?` and unparsable bodies fall back to a
/// generic line.
pub fn summarize_event(kind: &WebhookKind, body: &[u8]) -> String {
    let event: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
    let repo = text(&event, &["repository", "full_name"]);
    match kind {
        WebhookKind::Push => {
            let branch = text(&event, &["ref"]);
            let branch = branch.strip_prefix("refs/heads/").unwrap_or(&branch);
            let pusher = text(&event, &["pusher", "name"]);
            let commits = event
                .get("commits")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            format!("push to {repo}@{branch} by {pusher}: {commits} commit(s)")
        }
        WebhookKind::PullRequest => {
            let action = text(&event, &["action"]);
            let number = number(&event, &["pull_request", "number"]);
            let title = text(&event, &["pull_request", "title"]);
            format!("pull request #{number} {action} in {repo}: {title}")
        }
        WebhookKind::Issues => {
            let action = text(&event, &["action"]);
            let number = number(&event, &["issue", "number"]);
            let title = text(&event, &["issue", "title"]);
            format!("issue #{number} {action} in {repo}: {title}")
        }
        WebhookKind::Ping => format!("webhook ping from {repo}"),
        WebhookKind::Other(name) => format!("{name} event from {repo}"),
    }
}

fn lookup<'a>(event: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(event, |value, key| value.get(*key))
}

fn text(event: &Value, path: &[&str]) -> String {
    lookup(event, path)
        .and_then(Value::as_str)
        .unwrap_or("?")
        .to_owned()
}

fn number(event: &Value, path: &[&str]) -> String {
    lookup(event, path)
        .and_then(Value::as_u64)
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new(SharedSecret::new("hook-secret"))
    }

    #[test]
    fn accepts_prefixed_hmac_of_raw_body() {
        let v = verifier();
        let body = br#"{"zen":"keep it simple"}"#;
        let header = v.expected_header(body).unwrap();
        assert!(header.starts_with(SIGNATURE_PREFIX));
        assert_eq!(v.check(body, Some(&header)), Ok(()));
        let bare = header.trim_start_matches(SIGNATURE_PREFIX);
        assert_eq!(
            v.check(body, Some(bare)),
            Err(VerifyError::SignatureMismatch)
        );
        assert_eq!(
            v.check(b"{}", Some(&header)),
            Err(VerifyError::SignatureMismatch)
        );
    }

    #[test]
    fn missing_header_or_secret() {
        assert_eq!(
            verifier().check(b"{}", None),
            Err(VerifyError::MissingSignature)
        );
        let unset = WebhookVerifier::new(None);
        assert!(!unset.is_configured());
        assert_eq!(
            unset.check(b"{}", Some("sha256=00")),
            Err(VerifyError::SecretUnset)
        );
    }

    #[test]
    fn summarizes_known_kinds() {
        let push = br#"{"ref":"refs/heads/main","repository":{"full_name":"acme/api"},
            "pusher":{"name":"dana"},"commits":[{},{}]}"#;
        assert_eq!(
            summarize_event(&WebhookKind::Push, push),
            "push to acme/api@main by dana: 2 commit(s)"
        );
        let pr = br#"{"action":"opened","repository":{"full_name":"acme/api"},
            "pull_request":{"number":12,"title":"Fix login"}}"#;
        assert_eq!(
            summarize_event(&WebhookKind::from_header("pull_request"), pr),
            "pull request #12 opened in acme/api: Fix login"
        );
        let issue = br#"{"action":"closed","repository":{"full_name":"acme/api"},
            "issue":{"number":3,"title":"Crash"}}"#;
        assert_eq!(
            summarize_event(&WebhookKind::Issues, issue),
            "issue #3 closed in acme/api: Crash"
        );
    }

    #[test]
    fn unknown_shapes_still_summarize() {
        assert_eq!(
            summarize_event(&WebhookKind::from_header("release"), b"not json"),
            "release event from ?"
        );
        assert_eq!(
            summarize_event(&WebhookKind::from_header(""), b"{}"),
            "unknown event from ?"
        );
        assert_eq!(
            summarize_event(&WebhookKind::Ping, br#"{"repository":{"full_name":"a/b"}}"#),
            "webhook ping from a/b"
        );
    }
}
