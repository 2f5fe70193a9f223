//! Should-respond decision: ask the oracle whether to reply, retrying with
//! bounded exponential backoff until it gives a parseable answer.

use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::oracle::{extract_json, Oracle, OracleRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShouldRespond {
    Respond,
    Ignore,
    Stop,
}

impl ShouldRespond {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShouldRespond::Respond => "RESPOND",
            ShouldRespond::Ignore => "IGNORE",
            ShouldRespond::Stop => "STOP",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        let cleaned = token
            .trim()
            .trim_matches(|c: char| c == '[' || c == ']' || c == '"' || c == '\'' || c == '.')
            .to_ascii_uppercase();
        match cleaned.as_str() {
            "RESPOND" => Some(ShouldRespond::Respond),
            "IGNORE" => Some(ShouldRespond::Ignore),
            "STOP" => Some(ShouldRespond::Stop),
            _ => None,
        }
    }
}

/// Parse an oracle answer. Accepts a JSON block with an `action` field, a
/// bare token on the first line, or text containing exactly one token.
pub fn parse_should_respond(text: &str) -> Option<ShouldRespond> {
    if let Ok(value) = serde_json::from_str::<Value>(extract_json(text)) {
        if let Some(action) = value.get("action").and_then(Value::as_str) {
            return ShouldRespond::from_token(action);
        }
    }

    if let Some(first) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
        if let Some(parsed) = ShouldRespond::from_token(first) {
            return Some(parsed);
        }
    }

    let upper = text.to_ascii_uppercase();
    let found: Vec<ShouldRespond> = [
        ShouldRespond::Respond,
        ShouldRespond::Ignore,
        ShouldRespond::Stop,
    ]
    .into_iter()
    .filter(|candidate| upper.contains(candidate.as_str()))
    .collect();

    match found.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
    pub call_timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_attempts: config.max_attempts.max(1),
            deadline: Duration::from_millis(config.deadline_ms),
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Decided(ShouldRespond),
    /// The round closed or was dropped while waiting
    Cancelled,
    /// Attempts or deadline exhausted without a usable answer
    GaveUp {
        attempts: u32,
        last_error: Option<String>,
    },
}

/// Run the should-respond query under `policy`. `cancelled` resolving at any
/// point aborts the loop, including mid-call and mid-backoff.
pub async fn decide_should_respond<F>(
    oracle: &dyn Oracle,
    request: OracleRequest,
    policy: &RetryPolicy,
    cancelled: F,
) -> Verdict
where
    F: Future<Output = ()>,
{
    tokio::pin!(cancelled);
    let deadline = Instant::now() + policy.deadline;
    let mut delay = policy.initial_delay;
    let mut attempts = 0;
    let mut last_error = None;

    while attempts < policy.max_attempts {
        attempts += 1;

        let call = timeout(policy.call_timeout, oracle.generate_text(request.clone()));
        let result = tokio::select! {
            biased;
            _ = &mut cancelled => return Verdict::Cancelled,
            _ = sleep_until(deadline) => {
                last_error = Some("deadline exceeded".to_string());
                break;
            }
            result = call => result,
        };

        match result {
            Ok(Ok(text)) => match parse_should_respond(&text) {
                Some(answer) => {
                    debug!(attempts, answer = answer.as_str(), "Should-respond decided");
                    return Verdict::Decided(answer);
                }
                None => last_error = Some(format!("unparseable answer: {}", text)),
            },
            Ok(Err(e)) => last_error = Some(e.to_string()),
            Err(_) => last_error = Some(format!("call timed out after {:?}", policy.call_timeout)),
        }

        if attempts >= policy.max_attempts {
            break;
        }

        warn!(
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = last_error.as_deref().unwrap_or(""),
            "Should-respond attempt failed"
        );

        tokio::select! {
            biased;
            _ = &mut cancelled => return Verdict::Cancelled,
            _ = sleep_until(deadline) => {
                last_error = Some("deadline exceeded".to_string());
                break;
            }
            _ = sleep(delay) => {}
        }
        delay = delay.saturating_mul(2);
    }

    Verdict::GaveUp {
        attempts,
        last_error,
    }
}
