//! vtx ops: long-running operation polling.
//!
//! Mutating calls return an operation handle instead of the finished resource. [`OperationWaiter`]
//! refreshes that handle with exponential backoff until it is done or the deadline passes.

#![forbid(unsafe_code)]

use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vtx_hub::{Method, Request, Transport, TransportError};

/// Remote-reported failure of an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Handle to an in-flight asynchronous action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Json>,
}

impl Operation {
    pub fn from_json(v: &Json) -> Result<Self, PollError> {
        serde_json::from_value(v.clone()).map_err(|e| PollError::Malformed { reason: e.to_string() })
    }

    /// Resource the operation acts on: the name prefix before `/operations/`.
    pub fn resource_name(&self) -> Option<&str> {
        self.name.split_once("/operations/").map(|(res, _)| res).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The remote accepted the action and later reported that it failed.
    #[error("{activity}: operation {operation} failed with code {code}: {message}")]
    OperationFailed { activity: String, operation: String, code: i64, message: String },
    /// We stopped waiting. The remote action may still complete or fail on its own.
    #[error("{activity}: gave up waiting for operation {operation} after {waited:?}{}", last_error_suffix(.last_error))]
    DeadlineExceeded { activity: String, operation: String, waited: Duration, last_error: Option<TransportError> },
    #[error("{activity}: polling operation {operation}: {source}")]
    Transport { activity: String, operation: String, #[source] source: TransportError },
    #[error("malformed operation: {reason}")]
    Malformed { reason: String },
}

fn last_error_suffix(e: &Option<TransportError>) -> String {
    e.as_ref().map(|e| format!(" (last error: {})", e)).unwrap_or_default()
}

/// Floor for the delay between status checks.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff between status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { initial: Duration::from_secs(1), max: Duration::from_secs(10), multiplier: 2 }
    }
}

impl PollPolicy {
    /// `VTX_POLL_INITIAL_MS` / `VTX_POLL_MAX_MS` override the defaults.
    pub fn from_env() -> Self {
        let initial = std::env::var("VTX_POLL_INITIAL_MS").ok().and_then(|s| s.parse::<u64>().ok());
        let max = std::env::var("VTX_POLL_MAX_MS").ok().and_then(|s| s.parse::<u64>().ok());
        Self::from_millis(initial, max)
    }

    /// Defaults for unset values; the initial delay never drops below [`MIN_POLL_INTERVAL`].
    pub fn from_millis(initial_ms: Option<u64>, max_ms: Option<u64>) -> Self {
        let d = Self::default();
        let initial = initial_ms.map(Duration::from_millis).unwrap_or(d.initial).max(MIN_POLL_INTERVAL);
        let max = max_ms.map(Duration::from_millis).unwrap_or(d.max);
        Self { initial, max: max.max(initial), multiplier: d.multiplier }
    }

    fn next(&self, cur: Duration) -> Duration {
        cur.saturating_mul(self.multiplier.max(1)).min(self.max)
    }
}

// About thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Earliest of `now + timeout` and the caller's overall deadline. Timeouts too large to
/// represent are capped at [`FAR_FUTURE`] from now.
pub fn deadline_for(timeout: Duration, overall: Option<Instant>) -> Instant {
    let now = Instant::now();
    let own = now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now);
    match overall {
        Some(d) if d < own => d,
        _ => own,
    }
}

/// Polls operations through a transport. Borrowed, cheap to build per call.
pub struct OperationWaiter<'a, T: ?Sized> {
    transport: &'a T,
    base_path: &'a str,
    project: &'a str,
    policy: PollPolicy,
}

impl<'a, T: Transport + ?Sized> OperationWaiter<'a, T> {
    pub fn new(transport: &'a T, base_path: &'a str, project: &'a str, policy: PollPolicy) -> Self {
        Self { transport, base_path, project, policy }
    }

    /// Wait for `op` to finish, then return the embedded resource. When the operation embeds
    /// none and `fallback` names a URL, that URL is read instead.
    ///
    /// No status check starts at or after `deadline`.
    pub async fn wait(&self, mut op: Operation, activity: &str, deadline: Instant, fallback: Option<&str>) -> Result<Option<Json>, PollError> {
        let started = Instant::now();
        let mut delay = self.policy.initial;
        let mut checks = 0u64;
        let mut last_error: Option<TransportError> = None;
        loop {
            if op.done {
                histogram!("operation_wait_ms", started.elapsed().as_secs_f64() * 1000.0);
                counter!("operation_checks_total", checks);
                if let Some(status) = op.error.take() {
                    counter!("operation_failed_total", 1u64);
                    warn!(op = %op.name, code = status.code, message = %status.message, "{}: operation failed", activity);
                    return Err(PollError::OperationFailed { activity: activity.to_string(), operation: op.name, code: status.code, message: status.message });
                }
                info!(op = %op.name, checks, took_ms = %started.elapsed().as_millis(), "{}: operation done", activity);
                return match (op.response.take(), fallback) {
                    (Some(res), _) => Ok(Some(res)),
                    (None, Some(url)) => self.fetch(url, &op.name, activity, deadline).await.map(Some),
                    (None, None) => Ok(None),
                };
            }
            if op.name.is_empty() {
                return Err(PollError::Malformed { reason: format!("{}: pending operation has no name", activity) });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.deadline_exceeded(activity, op, started, last_error));
            }
            tokio::time::sleep_until((now + delay).min(deadline)).await;
            if Instant::now() >= deadline {
                return Err(self.deadline_exceeded(activity, op, started, last_error));
            }

            checks += 1;
            let url = format!("{}{}", self.base_path, op.name);
            debug!(op = %op.name, check = checks, delay_ms = %delay.as_millis(), "{}: checking operation", activity);
            match self.send(Method::Get, &url, deadline).await {
                None => return Err(self.deadline_exceeded(activity, op, started, last_error)),
                Some(Ok(v)) => {
                    let mut next = Operation::from_json(&v)?;
                    if next.name.is_empty() { next.name = op.name.clone(); }
                    op = next;
                    last_error = None;
                }
                Some(Err(e)) if e.is_retryable() || e.is_not_found() => {
                    warn!(op = %op.name, error = %e, "{}: operation check failed; will retry", activity);
                    last_error = Some(e);
                }
                Some(Err(e)) => {
                    return Err(PollError::Transport { activity: activity.to_string(), operation: op.name, source: e });
                }
            }
            delay = self.policy.next(delay);
        }
    }

    async fn fetch(&self, url: &str, operation: &str, activity: &str, deadline: Instant) -> Result<Json, PollError> {
        match self.send(Method::Get, url, deadline).await {
            Some(Ok(v)) => Ok(v),
            Some(Err(e)) => Err(PollError::Transport { activity: activity.to_string(), operation: operation.to_string(), source: e }),
            None => Err(PollError::DeadlineExceeded {
                activity: activity.to_string(),
                operation: operation.to_string(),
                waited: Duration::ZERO,
                last_error: None,
            }),
        }
    }

    /// `None` when the deadline fires before the transport answers.
    async fn send(&self, method: Method, url: &str, deadline: Instant) -> Option<Result<Json, TransportError>> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        let req = Request { method, project: self.project, url, body: None, timeout };
        tokio::time::timeout_at(deadline, self.transport.send(req)).await.ok()
    }

    fn deadline_exceeded(&self, activity: &str, op: Operation, started: Instant, last_error: Option<TransportError>) -> PollError {
        counter!("operation_deadline_total", 1u64);
        let waited = started.elapsed();
        warn!(op = %op.name, waited_ms = %waited.as_millis(), "{}: deadline exceeded while waiting", activity);
        PollError::DeadlineExceeded { activity: activity.to_string(), operation: op.name, waited, last_error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vtx_hub::MockTransport;

    const BASE: &str = "https://us-central1-aiplatform.googleapis.com/v1/";
    const OP: &str = "projects/p/locations/us-central1/endpoints/42/operations/7";

    fn pending() -> Operation { Operation { name: OP.into(), ..Default::default() } }

    fn policy() -> PollPolicy {
        PollPolicy { initial: Duration::from_secs(1), max: Duration::from_secs(4), multiplier: 2 }
    }

    #[test]
    fn operation_parses_and_derives_resource() {
        let op = Operation::from_json(&json!({
            "name": OP,
            "done": true,
            "response": { "name": "projects/p/locations/us-central1/endpoints/42" }
        }))
        .unwrap();
        assert!(op.done);
        assert_eq!(op.resource_name(), Some("projects/p/locations/us-central1/endpoints/42"));
        assert!(Operation::from_json(&json!({ "done": "yes" })).is_err());
        assert_eq!(Operation::default().resource_name(), None);
    }

    #[test]
    fn deadline_for_picks_earliest() {
        let far = Instant::now() + Duration::from_secs(3600);
        let near = Instant::now() + Duration::from_secs(1);
        assert!(deadline_for(Duration::from_secs(60), Some(near)) == near);
        assert!(deadline_for(Duration::from_secs(60), Some(far)) < far);
    }

    #[test]
    fn huge_timeout_is_capped() {
        let d = deadline_for(Duration::from_secs(u64::MAX), None);
        assert!(d > Instant::now() + Duration::from_secs(86_400 * 365));
        let near = Instant::now() + Duration::from_secs(5);
        assert!(deadline_for(Duration::MAX, Some(near)) == near);
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let p = PollPolicy::from_millis(Some(0), Some(0));
        assert_eq!(p.initial, MIN_POLL_INTERVAL);
        assert_eq!(p.max, MIN_POLL_INTERVAL);
        assert_eq!(p.next(p.initial), MIN_POLL_INTERVAL);
        let d = PollPolicy::from_millis(None, Some(30_000));
        assert_eq!(d.initial, Duration::from_secs(1));
        assert_eq!(d.max, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn done_handle_returns_without_polling() {
        let mock = MockTransport::new(|_| panic!("no request expected"));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let op = Operation { done: true, response: Some(json!({ "name": "x" })), ..pending() };
        let got = w.wait(op, "Creating Endpoint", Instant::now() + Duration::from_secs(60), None).await.unwrap();
        assert_eq!(got, Some(json!({ "name": "x" })));
        assert!(mock.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_done_with_backoff() {
        let n = Arc::new(AtomicUsize::new(0));
        let seen = n.clone();
        let mock = MockTransport::new(move |r| {
            assert_eq!(r.url, format!("{}{}", BASE, OP));
            if seen.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(json!({ "name": OP }))
            } else {
                Ok(json!({ "name": OP, "done": true, "response": { "displayName": "svc-a" } }))
            }
        });
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let t0 = Instant::now();
        let got = w.wait(pending(), "Updating Endpoint", t0 + Duration::from_secs(120), None).await.unwrap();
        assert_eq!(got, Some(json!({ "displayName": "svc-a" })));
        let at: Vec<u64> = mock.requests().iter().map(|r| (r.at - t0).as_secs()).collect();
        // 1s, +2s, +4s, +4s (capped)
        assert_eq!(at, vec![1, 3, 7, 11]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_not_reported_as_deadline() {
        let mock = MockTransport::new(|_| Ok(json!({ "name": OP, "done": true, "error": { "code": 9, "message": "quota exhausted" } })));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let err = w.wait(pending(), "Creating Endpoint", Instant::now() + Duration::from_secs(30), None).await.unwrap_err();
        match err {
            PollError::OperationFailed { code, message, operation, .. } => {
                assert_eq!(code, 9);
                assert_eq!(message, "quota exhausted");
                assert_eq!(operation, OP);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_done_hits_deadline_and_stops_checking() {
        let mock = MockTransport::new(|_| Ok(json!({ "name": OP, "done": false })));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let t0 = Instant::now();
        let deadline = t0 + Duration::from_secs(20);
        let err = w.wait(pending(), "Deleting Endpoint", deadline, None).await.unwrap_err();
        assert!(matches!(err, PollError::DeadlineExceeded { .. }), "err={err:?}");
        assert!(Instant::now() >= deadline);
        assert!(Instant::now() - t0 < Duration::from_secs(21));
        let reqs = mock.requests();
        assert!(!reqs.is_empty());
        assert!(reqs.iter().all(|r| r.at < deadline));
        // Nothing more happens once we gave up.
        let before = reqs.len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.requests().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let n = Arc::new(AtomicUsize::new(0));
        let seen = n.clone();
        let mock = MockTransport::new(move |_| match seen.fetch_add(1, Ordering::SeqCst) {
            0 => Err(TransportError::Remote { status: 503, message: "unavailable".into() }),
            1 => Err(TransportError::Connection("reset".into())),
            _ => Ok(json!({ "name": OP, "done": true })),
        });
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let got = w.wait(pending(), "Updating Endpoint", Instant::now() + Duration::from_secs(60), None).await.unwrap();
        assert_eq!(got, None);
        assert_eq!(n.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_last_transient_error() {
        let mock = MockTransport::new(|_| Err(TransportError::Remote { status: 502, message: "bad gateway".into() }));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let err = w.wait(pending(), "Creating Endpoint", Instant::now() + Duration::from_secs(5), None).await.unwrap_err();
        assert!(err.to_string().contains("bad gateway"), "err={}", err);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_aborts_wait() {
        let mock = MockTransport::new(|_| Err(TransportError::Remote { status: 403, message: "denied".into() }));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let err = w.wait(pending(), "Creating Endpoint", Instant::now() + Duration::from_secs(60), None).await.unwrap_err();
        assert!(matches!(err, PollError::Transport { .. }), "err={err:?}");
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_response_falls_back_to_direct_read() {
        let mock = MockTransport::new(|r| {
            if r.url.ends_with("/operations/7") {
                Ok(json!({ "name": OP, "done": true }))
            } else {
                Ok(json!({ "name": "projects/p/locations/us-central1/endpoints/42", "displayName": "svc-a" }))
            }
        });
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let fallback = format!("{}projects/p/locations/us-central1/endpoints/42", BASE);
        let got = w.wait(pending(), "Updating Endpoint", Instant::now() + Duration::from_secs(60), Some(&fallback)).await.unwrap();
        assert_eq!(got.unwrap()["displayName"], "svc-a");
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_without_name_is_malformed() {
        let mock = MockTransport::new(|_| panic!("no request expected"));
        let w = OperationWaiter::new(&mock, BASE, "p", policy());
        let err = w.wait(Operation::default(), "Creating Endpoint", Instant::now() + Duration::from_secs(60), None).await.unwrap_err();
        assert!(matches!(err, PollError::Malformed { .. }));
    }
}
