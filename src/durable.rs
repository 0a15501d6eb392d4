//! Facade over the durable-execution substrate. Three concerns cross this
//! boundary: retried execution of infrastructure steps, durable delivery of
//! completion callbacks to the run that owns them, and a journal of
//! dispatched/acknowledged correlation keys so a resumed run does not
//! re-dispatch work that already completed. A dedicated orchestration
//! engine can stand behind the same seams; the in-process implementations
//! here carry the same contract without the durability.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::model::{CompletionCallback, CorrelationKey, RunId};

#[derive(Debug, Error)]
pub enum DurableError {
    #[error("step {step} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        message: String,
    },
    #[error("signal channel closed for run {0}")]
    ChannelClosed(RunId),
}

pub type DurableResult<T> = Result<T, DurableError>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            backoff_multiplier: 2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            backoff_multiplier: config.backoff_multiplier.max(1),
        }
    }
}

/// Run one fallible infrastructure step under the retry budget. Exhausting
/// the budget surfaces the last error; the caller decides whether that
/// fails the whole run.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, step: &str, mut op: F) -> DurableResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = policy.initial_backoff;
    let mut last_error = String::new();
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                warn!(step, attempt, error = %error, "step attempt failed");
                last_error = error.to_string();
                if attempt < policy.max_attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= policy.backoff_multiplier;
                }
            }
        }
    }
    Err(DurableError::RetriesExhausted {
        step: step.to_string(),
        attempts: policy.max_attempts,
        message: last_error,
    })
}

/// Routes inbound completion callbacks to the run that dispatched the
/// request. Delivery is at-least-once and unordered; a callback for a run
/// that is no longer registered is dropped with a log line, which is the
/// correct treatment for late arrivals after a run has terminated.
pub struct SignalRouter {
    runs: DashMap<RunId, mpsc::Sender<CompletionCallback>>,
    capacity: usize,
}

impl SignalRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            runs: DashMap::new(),
            capacity,
        }
    }

    pub fn register(&self, run_id: RunId) -> mpsc::Receiver<CompletionCallback> {
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.runs.insert(run_id, sender);
        receiver
    }

    pub fn deregister(&self, run_id: RunId) {
        self.runs.remove(&run_id);
    }

    pub async fn route(&self, callback: CompletionCallback) -> DurableResult<()> {
        let run_id = callback.run_id;
        // Clone the sender out so no map guard is held across the send.
        let sender = match self.runs.get(&run_id) {
            Some(entry) => entry.clone(),
            None => {
                warn!(%run_id, "callback for unknown or finished run, dropping");
                return Ok(());
            }
        };
        sender
            .send(callback)
            .await
            .map_err(|_| DurableError::ChannelClosed(run_id))
    }
}

/// Durable record of what a run has dispatched and which correlation keys
/// have been acknowledged, per frontier level. On resume the orchestrator
/// only awaits the unacknowledged remainder of a level.
#[async_trait]
#[mockall::automock]
pub trait RunJournal: Send + Sync {
    async fn record_dispatch(
        &self,
        run_id: RunId,
        level: &str,
        keys: Vec<CorrelationKey>,
    ) -> DurableResult<()>;

    async fn record_ack(
        &self,
        run_id: RunId,
        level: &str,
        key: CorrelationKey,
    ) -> DurableResult<()>;

    async fn acked(&self, run_id: RunId, level: &str) -> DurableResult<HashSet<CorrelationKey>>;
}

#[derive(Default)]
pub struct InMemoryJournal {
    dispatched: DashMap<(RunId, String), HashSet<CorrelationKey>>,
    acks: DashMap<(RunId, String), HashSet<CorrelationKey>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunJournal for InMemoryJournal {
    async fn record_dispatch(
        &self,
        run_id: RunId,
        level: &str,
        keys: Vec<CorrelationKey>,
    ) -> DurableResult<()> {
        debug!(%run_id, level, count = keys.len(), "journaling dispatch");
        self.dispatched
            .entry((run_id, level.to_string()))
            .or_default()
            .extend(keys);
        Ok(())
    }

    async fn record_ack(
        &self,
        run_id: RunId,
        level: &str,
        key: CorrelationKey,
    ) -> DurableResult<()> {
        self.acks
            .entry((run_id, level.to_string()))
            .or_default()
            .insert(key);
        Ok(())
    }

    async fn acked(&self, run_id: RunId, level: &str) -> DurableResult<HashSet<CorrelationKey>> {
        Ok(self
            .acks
            .get(&(run_id, level.to_string()))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{CallbackStatus, ContentUnitId, EvaluationId};

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let value = retry(&policy, "transient", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("not yet")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_with_the_last_error() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            backoff_multiplier: 1,
        };
        let result: DurableResult<()> =
            retry(&policy, "doomed", || async { Err("store unreachable") }).await;
        match result {
            Err(DurableError::RetriesExhausted {
                attempts, message, ..
            }) => {
                assert_eq!(attempts, 2);
                assert_eq!(message, "store unreachable");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    fn callback(run_id: RunId) -> CompletionCallback {
        CompletionCallback {
            run_id,
            content_unit_id: ContentUnitId::new(),
            evaluation_id: EvaluationId::new(),
            status: CallbackStatus::Completed,
            response: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn router_delivers_to_the_registered_run() {
        let router = SignalRouter::new(4);
        let run_id = RunId::new();
        let mut receiver = router.register(run_id);

        router.route(callback(run_id)).await.unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.run_id, run_id);
    }

    #[tokio::test]
    async fn router_drops_callbacks_for_unknown_runs() {
        let router = SignalRouter::new(4);
        // No registration: must be a logged no-op, not an error.
        router.route(callback(RunId::new())).await.unwrap();
    }

    #[tokio::test]
    async fn journal_tracks_acks_per_level() {
        let journal = InMemoryJournal::new();
        let run_id = RunId::new();
        let key = (ContentUnitId::new(), EvaluationId::new());

        journal
            .record_dispatch(run_id, "root", vec![key])
            .await
            .unwrap();
        assert!(journal.acked(run_id, "root").await.unwrap().is_empty());

        journal.record_ack(run_id, "root", key).await.unwrap();
        let acked = journal.acked(run_id, "root").await.unwrap();
        assert!(acked.contains(&key));
        assert!(journal.acked(run_id, "other").await.unwrap().is_empty());
    }
}
