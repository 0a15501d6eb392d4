//! The frontier orchestrator: drives one evaluation run over one file. Per
//! frontier level it selects the eligible evaluations, dispatches the
//! (content unit x evaluation) cross product as one batch, awaits the
//! out-of-order completion callbacks, decodes and persists every answer,
//! then recurses into the child frontiers the decoded values unlock. A
//! child frontier only covers the content units whose answer satisfied its
//! trigger. A visited memo over (evaluation id, value) keys keeps the
//! recursion finite and prevents a child frontier from being dispatched
//! once per contributing content unit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_recursion::async_recursion;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::catalog::{CatalogError, ContentCatalog, EvaluationCatalog, FileCatalog};
use crate::config::EvaluationConfig;
use crate::decoder::decode_answer;
use crate::dispatch::{BatchDispatcher, DispatchError};
use crate::durable::{retry, DurableError, RetryPolicy, RunJournal, SignalRouter};
use crate::model::{
    CompletionCallback, ContentUnit, ContentUnitId, CorrelationKey, EvaluationDefinition,
    EvaluationId, EvaluationResultRecord, FileId, FrontierKey, ProjectId, ResultStatus, RunId,
};
use crate::store::{ResultStore, StoreError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run cancelled before dispatch")]
    Cancelled,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Durable(#[from] DurableError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Lifecycle of one run. `Pending` through `Expanding` cycle once per
/// frontier level; `Completed`/`Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunPhase {
    Pending,
    Dispatched,
    Awaiting,
    Decoding,
    Expanding,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub file_id: FileId,
    pub status: RunStatus,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub visited: usize,
    pub last_error: Option<String>,
}

/// Which frontier level to process next.
enum Level {
    /// Project roots, or a single explicitly requested evaluation. Covers
    /// every content unit of the file.
    Root { seed: Option<EvaluationId> },
    /// Children gated on a (parent evaluation, trigger value) key. Covers
    /// only the content units whose parent answer satisfied the trigger;
    /// the eligible evaluations were selected while expanding the parent.
    Child {
        key: FrontierKey,
        units: Vec<ContentUnitId>,
        evaluations: Vec<EvaluationDefinition>,
    },
}

impl Level {
    fn label(&self) -> String {
        match self {
            Level::Root { seed: None } => "root".to_string(),
            Level::Root { seed: Some(id) } => format!("root-{}", id),
            Level::Child { key, .. } => key.to_string(),
        }
    }
}

struct RunState {
    run_id: RunId,
    file_id: FileId,
    project_id: ProjectId,
    units: Arc<Vec<ContentUnit>>,
    visited: HashSet<FrontierKey>,
    phase: RunPhase,
    dispatched: usize,
    completed: usize,
    failed: usize,
    timed_out: bool,
    last_error: Option<String>,
}

impl RunState {
    fn new(run_id: RunId, file_id: FileId, project_id: ProjectId, units: Vec<ContentUnit>) -> Self {
        Self {
            run_id,
            file_id,
            project_id,
            units: Arc::new(units),
            visited: HashSet::new(),
            phase: RunPhase::Pending,
            dispatched: 0,
            completed: 0,
            failed: 0,
            timed_out: false,
            last_error: None,
        }
    }

    fn advance(&mut self, phase: RunPhase) {
        debug!(run_id = %self.run_id, from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
    }
}

pub struct FrontierOrchestrator {
    catalog: Arc<dyn EvaluationCatalog>,
    content: Arc<dyn ContentCatalog>,
    files: Arc<dyn FileCatalog>,
    store: Arc<dyn ResultStore>,
    dispatcher: Arc<BatchDispatcher>,
    router: Arc<SignalRouter>,
    journal: Arc<dyn RunJournal>,
    retry_policy: RetryPolicy,
    level_timeout: Duration,
}

impl FrontierOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &EvaluationConfig,
        catalog: Arc<dyn EvaluationCatalog>,
        content: Arc<dyn ContentCatalog>,
        files: Arc<dyn FileCatalog>,
        store: Arc<dyn ResultStore>,
        dispatcher: Arc<BatchDispatcher>,
        router: Arc<SignalRouter>,
        journal: Arc<dyn RunJournal>,
    ) -> Self {
        Self {
            catalog,
            content,
            files,
            store,
            dispatcher,
            router,
            journal,
            retry_policy: RetryPolicy::from(&config.retry),
            level_timeout: config.level_timeout,
        }
    }

    /// Run a full evaluation pass over the file with a fresh run id.
    pub async fn evaluate(
        &self,
        file_id: FileId,
        seed: Option<EvaluationId>,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<RunReport> {
        self.evaluate_run(RunId::new(), file_id, seed, cancel).await
    }

    /// Run (or resume) the evaluation pass identified by `run_id`. With a
    /// `seed`, the root frontier is exactly that evaluation; otherwise it is
    /// every root evaluation of the file's project.
    #[tracing::instrument(skip(self, cancel), fields(%run_id, %file_id))]
    pub async fn evaluate_run(
        &self,
        run_id: RunId,
        file_id: FileId,
        seed: Option<EvaluationId>,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<RunReport> {
        let file = retry(&self.retry_policy, "get_file", || {
            self.files.get_file(file_id)
        })
        .await?;
        let units = retry(&self.retry_policy, "units_for_file", || {
            self.content.units_for_file(file_id)
        })
        .await?;
        info!(units = units.len(), "starting evaluation run");

        let mut receiver = self.router.register(run_id);
        let mut run = RunState::new(run_id, file_id, file.project_id, units);
        let outcome = self
            .process_level(&mut run, &mut receiver, Level::Root { seed }, &cancel)
            .await;
        self.router.deregister(run_id);

        let report = match outcome {
            Ok(()) => {
                let status = if run.timed_out {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                };
                run.advance(match status {
                    RunStatus::Completed => RunPhase::Completed,
                    RunStatus::Failed => RunPhase::Failed,
                });
                self.report(&run, status)
            }
            Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(err) => {
                error!(error = %err, "evaluation run failed");
                run.advance(RunPhase::Failed);
                run.last_error = Some(err.to_string());
                self.report(&run, RunStatus::Failed)
            }
        };
        info!(
            status = %report.status,
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            "evaluation run finished"
        );
        Ok(report)
    }

    fn report(&self, run: &RunState, status: RunStatus) -> RunReport {
        RunReport {
            run_id: run.run_id,
            file_id: run.file_id,
            status,
            dispatched: run.dispatched,
            completed: run.completed,
            failed: run.failed,
            visited: run.visited.len(),
            last_error: run.last_error.clone(),
        }
    }

    /// Process one frontier level, then recurse into the child frontiers it
    /// unlocks. One suspension point only: the callback await loop.
    #[async_recursion]
    async fn process_level(
        &self,
        run: &mut RunState,
        receiver: &mut mpsc::Receiver<CompletionCallback>,
        level: Level,
        cancel: &watch::Receiver<bool>,
    ) -> OrchestratorResult<()> {
        // Cancellation is cooperative: checked before each dispatch, never
        // mid-batch.
        if *cancel.borrow() {
            return Err(OrchestratorError::Cancelled);
        }
        run.advance(RunPhase::Pending);

        // 1. Select the evaluations eligible at this level.
        let evaluations = match &level {
            Level::Root { seed: Some(id) } => {
                let id = *id;
                vec![
                    retry(&self.retry_policy, "get_evaluation", || {
                        self.catalog.get_evaluation(id)
                    })
                    .await?,
                ]
            }
            Level::Root { seed: None } => {
                let project_id = run.project_id;
                retry(&self.retry_policy, "root_evaluations", || {
                    self.catalog.root_evaluations(project_id)
                })
                .await?
            }
            Level::Child { evaluations, .. } => evaluations.clone(),
        };
        let label = level.label();
        debug!(level = %label, evaluations = evaluations.len(), "selected level");
        if evaluations.is_empty() || run.units.is_empty() {
            // Empty request set: this branch terminates, no error.
            return Ok(());
        }

        // 2. Build the request set over this level's content units, minus
        // keys a previous incarnation of this run already acknowledged.
        let all_units = Arc::clone(&run.units);
        let units: Vec<&ContentUnit> = match &level {
            Level::Root { .. } => all_units.iter().collect(),
            Level::Child { units, .. } => all_units
                .iter()
                .filter(|unit| units.contains(&unit.id))
                .collect(),
        };
        let acked = self.journal.acked(run.run_id, &label).await?;
        let mut pairs: Vec<(&ContentUnit, &EvaluationDefinition)> = Vec::new();
        let mut resumed: Vec<CorrelationKey> = Vec::new();
        for unit in &units {
            for definition in &evaluations {
                let key = (unit.id, definition.id);
                if acked.contains(&key) {
                    resumed.push(key);
                } else {
                    pairs.push((*unit, definition));
                }
            }
        }

        // Decoded values that will feed expansion: previously acknowledged
        // answers come back from the store, fresh ones from the callbacks.
        let mut decoded: Vec<(ContentUnitId, EvaluationId, String)> = Vec::new();
        for (unit_id, evaluation_id) in resumed {
            let record = retry(&self.retry_policy, "get_result", || {
                self.store.get(unit_id, evaluation_id)
            })
            .await?;
            if let Some(record) = record {
                if record.status == ResultStatus::Completed {
                    if let Some(value) = record.value {
                        decoded.push((unit_id, evaluation_id, value));
                    }
                }
            }
        }

        if !pairs.is_empty() {
            let parent = match &level {
                Level::Child { key, .. } => Some(key),
                Level::Root { .. } => None,
            };

            // 3. Dispatch the whole level as one batch.
            run.advance(RunPhase::Dispatched);
            let output = self.dispatcher.dispatch(run.run_id, &pairs, parent).await?;
            let mut pending: HashMap<CorrelationKey, &EvaluationDefinition> = pairs
                .iter()
                .map(|(unit, definition)| ((unit.id, definition.id), *definition))
                .collect();
            self.journal
                .record_dispatch(run.run_id, &label, pending.keys().copied().collect())
                .await?;
            run.dispatched += output.expected;

            // 4. Await callbacks until the level is satisfied or the level
            // deadline passes. Arrival order carries no meaning.
            run.advance(RunPhase::Awaiting);
            let deadline = Instant::now() + self.level_timeout;
            let mut received: Vec<(&EvaluationDefinition, CompletionCallback)> = Vec::new();
            while !pending.is_empty() {
                let callback = match timeout_at(deadline, receiver.recv()).await {
                    Ok(Some(callback)) => callback,
                    Ok(None) => {
                        return Err(OrchestratorError::Durable(DurableError::ChannelClosed(
                            run.run_id,
                        )))
                    }
                    Err(_) => {
                        warn!(level = %label, missing = pending.len(), "level timed out");
                        break;
                    }
                };
                let key = (callback.content_unit_id, callback.evaluation_id);
                match pending.remove(&key) {
                    Some(definition) => received.push((definition, callback)),
                    None => {
                        warn!(
                            unit = %key.0,
                            evaluation = %key.1,
                            "unknown or already satisfied correlation key, dropping callback"
                        );
                    }
                }
            }

            // 5. Decode and persist every received callback. A decode
            // failure records a failed result and moves on; it never stops
            // the level.
            run.advance(RunPhase::Decoding);
            for (definition, callback) in received {
                let key = (callback.content_unit_id, callback.evaluation_id);
                let record = match decode_answer(definition, &callback) {
                    Ok(value) => {
                        decoded.push((callback.content_unit_id, definition.id, value.clone()));
                        run.completed += 1;
                        EvaluationResultRecord::completed(
                            run.file_id,
                            callback.content_unit_id,
                            definition.id,
                            value,
                        )
                    }
                    Err(decode_error) => {
                        warn!(
                            unit = %key.0,
                            evaluation = %key.1,
                            error = %decode_error,
                            "answer failed to decode"
                        );
                        run.failed += 1;
                        EvaluationResultRecord::failed(
                            run.file_id,
                            callback.content_unit_id,
                            definition.id,
                            decode_error.to_string(),
                        )
                    }
                };
                retry(&self.retry_policy, "upsert_result", || {
                    self.store.upsert(record.clone())
                })
                .await?;
                self.journal.record_ack(run.run_id, &label, key).await?;
            }

            // Keys the provider never answered: record the timeout, do not
            // expand them. An unanswered parent cannot satisfy any trigger.
            for ((unit_id, evaluation_id), _) in pending {
                run.timed_out = true;
                run.failed += 1;
                run.last_error = Some(format!(
                    "no callback received within {:?}",
                    self.level_timeout
                ));
                let record = EvaluationResultRecord::failed(
                    run.file_id,
                    unit_id,
                    evaluation_id,
                    format!("no callback received within {:?}", self.level_timeout),
                );
                retry(&self.retry_policy, "upsert_result", || {
                    self.store.upsert(record.clone())
                })
                .await?;
            }
        }

        // 6. Expand: group completed answers into frontier keys, each
        // carrying the content units that produced that value, and recurse
        // into each unvisited key that gates at least one child. Ten units
        // answering "true" produce one child dispatch covering ten units,
        // not ten dispatches. Keys without children terminate without
        // entering the memo.
        run.advance(RunPhase::Expanding);
        let mut grouped: HashMap<FrontierKey, Vec<ContentUnitId>> = HashMap::new();
        for (unit_id, evaluation_id, value) in decoded {
            grouped
                .entry(FrontierKey::new(evaluation_id, value))
                .or_default()
                .push(unit_id);
        }
        let mut candidates: Vec<(FrontierKey, Vec<ContentUnitId>)> = grouped.into_iter().collect();
        candidates.sort_by(|(a, _), (b, _)| a.to_string().cmp(&b.to_string()));
        for (key, units) in candidates {
            if run.visited.contains(&key) {
                continue;
            }
            let evaluations = retry(&self.retry_policy, "child_evaluations", || {
                self.catalog.child_evaluations(key.evaluation_id, &key.trigger)
            })
            .await?;
            if evaluations.is_empty() {
                continue;
            }
            run.visited.insert(key.clone());
            debug!(frontier = %key, units = units.len(), "expanding child frontier");
            self.process_level(
                run,
                receiver,
                Level::Child {
                    key,
                    units,
                    evaluations,
                },
                cancel,
            )
            .await?;
        }
        Ok(())
    }
}
