//! Wiring and trigger surface. `EvaluationSystem` owns the collaborators
//! and exposes the three entry points the outside world drives: a file
//! finished ingesting, an evaluation definition changed, and an inbound
//! provider callback.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::catalog::{ContentCatalog, EvaluationCatalog, FileCatalog};
use crate::config::EvaluationConfig;
use crate::dispatch::{BatchDispatcher, InferenceClient};
use crate::durable::{RetryPolicy, RunJournal, SignalRouter};
use crate::frontier::{FrontierOrchestrator, OrchestratorError, RunReport, RunStatus};
use crate::model::{
    CompletionCallback, EvaluationChange, EvaluationId, FileId, FileStatus,
};
use crate::selector::AffectedFileSelector;
use crate::store::ResultStore;
use crate::{Error, SaitenResult};

pub struct EvaluationSystem {
    orchestrator: Arc<FrontierOrchestrator>,
    selector: AffectedFileSelector,
    files: Arc<dyn FileCatalog>,
    router: Arc<SignalRouter>,
    // One cancel handle per in-flight file run; cancellation is cooperative.
    cancellations: DashMap<FileId, watch::Sender<bool>>,
}

impl EvaluationSystem {
    pub fn new(
        config: &EvaluationConfig,
        catalog: Arc<dyn EvaluationCatalog>,
        content: Arc<dyn ContentCatalog>,
        files: Arc<dyn FileCatalog>,
        store: Arc<dyn ResultStore>,
        client: Arc<dyn InferenceClient>,
        journal: Arc<dyn RunJournal>,
    ) -> Self {
        let router = Arc::new(SignalRouter::new(config.callback_capacity));
        let dispatcher = Arc::new(BatchDispatcher::new(client, &config.provider));
        let retry_policy = RetryPolicy::from(&config.retry);
        let orchestrator = Arc::new(FrontierOrchestrator::new(
            config,
            catalog,
            content,
            files.clone(),
            store.clone(),
            dispatcher,
            router.clone(),
            journal,
        ));
        let selector = AffectedFileSelector::new(store, files.clone(), retry_policy);
        Self {
            orchestrator,
            selector,
            files,
            router,
            cancellations: DashMap::new(),
        }
    }

    pub fn router(&self) -> Arc<SignalRouter> {
        self.router.clone()
    }

    /// Inbound provider callback entry; routes to the owning run by run id.
    pub async fn ingest_callback(&self, callback: CompletionCallback) -> SaitenResult<()> {
        self.router.route(callback).await.map_err(Error::from)
    }

    /// Trigger: a file finished ingesting. Runs the full evaluation forest
    /// over it and settles the file status.
    #[tracing::instrument(skip(self))]
    pub async fn handle_file_ingested(&self, file_id: FileId) -> SaitenResult<RunReport> {
        self.run_file(file_id, None).await
    }

    /// Trigger: an evaluation definition was created, updated or deleted.
    /// Every affected file is re-run seeded with the changed evaluation;
    /// its subtree re-expands through normal frontier recursion. Files are
    /// independent runs and proceed concurrently.
    #[tracing::instrument(skip(self, change))]
    pub async fn handle_evaluation_changed(
        &self,
        change: EvaluationChange,
    ) -> SaitenResult<Vec<RunReport>> {
        let affected = self.selector.files_to_reevaluate(&change).await?;
        if affected.is_empty() {
            return Ok(Vec::new());
        }
        let seed = match &change {
            EvaluationChange::Created(definition)
            | EvaluationChange::Updated {
                new: definition, ..
            } => Some(definition.id),
            EvaluationChange::Deleted(_) => None,
        };
        info!(files = affected.len(), "re-evaluating affected files");
        let outcomes = join_all(
            affected
                .into_iter()
                .map(|file_id| self.run_file(file_id, seed)),
        )
        .await;
        outcomes.into_iter().collect()
    }

    /// Cancel the in-flight run for a file (e.g. the file was deleted).
    /// Takes effect before the next dispatch; the in-flight batch drains.
    pub fn cancel_file(&self, file_id: FileId) {
        if let Some((_, sender)) = self.cancellations.remove(&file_id) {
            let _ = sender.send(true);
            info!(%file_id, "cancellation requested");
        }
    }

    async fn run_file(
        &self,
        file_id: FileId,
        seed: Option<EvaluationId>,
    ) -> SaitenResult<RunReport> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancellations.insert(file_id, cancel_tx);
        self.files
            .update_status(file_id, FileStatus::Evaluating)
            .await?;

        let outcome = self.orchestrator.evaluate(file_id, seed, cancel_rx).await;
        self.cancellations.remove(&file_id);

        match outcome {
            Ok(report) => {
                let status = match report.status {
                    RunStatus::Completed => FileStatus::Completed,
                    RunStatus::Failed => FileStatus::Failed,
                };
                self.files.update_status(file_id, status).await?;
                Ok(report)
            }
            Err(OrchestratorError::Cancelled) => {
                // The file is usually gone by now; leave its status alone.
                info!(%file_id, "evaluation run cancelled");
                Err(Error::Orchestrator(OrchestratorError::Cancelled))
            }
            Err(error) => {
                warn!(%file_id, error = %error, "marking file failed");
                self.files.update_status(file_id, FileStatus::Failed).await?;
                Err(error.into())
            }
        }
    }
}
