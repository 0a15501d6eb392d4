//! Affected-file selection: when an evaluation definition is created,
//! updated or deleted, compute which already-ingested files must be
//! re-evaluated.

use std::sync::Arc;

use tracing::debug;

use crate::catalog::FileCatalog;
use crate::durable::{retry, RetryPolicy};
use crate::model::{EvaluationChange, EvaluationDefinition, FileId, FileStatus};
use crate::store::ResultStore;
use crate::SaitenResult;

pub struct AffectedFileSelector {
    store: Arc<dyn ResultStore>,
    files: Arc<dyn FileCatalog>,
    retry_policy: RetryPolicy,
}

impl AffectedFileSelector {
    pub fn new(
        store: Arc<dyn ResultStore>,
        files: Arc<dyn FileCatalog>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            files,
            retry_policy,
        }
    }

    /// Ordered union of three rules, deduplicated by file id:
    ///
    /// 1. For a gated definition whose trigger is newly created or changed,
    ///    files holding a matching result for the *parent* evaluation —
    ///    the old trigger value on update, the new one on first creation.
    /// 2. On update, every file that already holds a result for *this*
    ///    evaluation (it must re-run with the new prompt/type).
    /// 3. On first creation of a root definition, every fully ingested
    ///    file in the project.
    ///
    /// Deletion selects nothing: results are retained, children are simply
    /// never dispatched again.
    pub async fn files_to_reevaluate(
        &self,
        change: &EvaluationChange,
    ) -> SaitenResult<Vec<FileId>> {
        let (new, old): (&EvaluationDefinition, Option<&EvaluationDefinition>) = match change {
            EvaluationChange::Created(definition) => (definition, None),
            EvaluationChange::Updated { new, old } => (new, Some(old)),
            EvaluationChange::Deleted(_) => return Ok(Vec::new()),
        };

        let mut selected: Vec<FileId> = Vec::new();

        // Rule 1: the branch condition is (newly) satisfiable.
        if let (Some(parent_id), Some(trigger)) = (new.parent_id, new.parent_trigger.as_deref()) {
            let lookup = match old {
                None => Some(trigger),
                Some(previous) if previous.parent_trigger.as_deref() != Some(trigger) => {
                    previous.parent_trigger.as_deref()
                }
                // Unchanged trigger: rule 1 is skipped. Files this child has
                // already touched are selected by rule 2; a file where only
                // the parent matched stays out of scope until its next full
                // run.
                Some(_) => None,
            };
            if let Some(value) = lookup {
                let rows = retry(&self.retry_policy, "results_for_parent", || {
                    self.store.results_for_evaluation(parent_id, Some(value))
                })
                .await?;
                for row in rows {
                    push_unique(&mut selected, row.file_id);
                }
            }
        }

        if let Some(previous) = old {
            // Rule 2: prior results for this evaluation go stale on update.
            let evaluation_id = previous.id;
            let rows = retry(&self.retry_policy, "results_for_evaluation", || {
                self.store.results_for_evaluation(evaluation_id, None)
            })
            .await?;
            for row in rows {
                push_unique(&mut selected, row.file_id);
            }
        } else if new.parent_id.is_none() {
            // Rule 3: a brand-new root question applies to every file whose
            // ingestion already completed.
            let project_id = new.project_id;
            let files = retry(&self.retry_policy, "files_for_project", || {
                self.files.files_for_project(project_id)
            })
            .await?;
            for file in files {
                if file.status == FileStatus::Completed {
                    push_unique(&mut selected, file.id);
                }
            }
        }

        debug!(evaluation = %new.id, files = selected.len(), "affected files selected");
        Ok(selected)
    }
}

fn push_unique(selected: &mut Vec<FileId>, file_id: FileId) {
    if !selected.contains(&file_id) {
        selected.push(file_id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::model::{
        ContentUnitId, EvaluationId, EvaluationResultRecord, EvaluationType, FileRecord,
        ProjectId,
    };
    use crate::store::InMemoryResultStore;

    fn definition(
        project_id: ProjectId,
        parent: Option<(EvaluationId, &str)>,
    ) -> EvaluationDefinition {
        EvaluationDefinition {
            id: EvaluationId::new(),
            project_id,
            title: "q".to_string(),
            description: String::new(),
            evaluation_type: EvaluationType::Boolean,
            options: None,
            prompt: "?".to_string(),
            system_prompt: None,
            parent_id: parent.map(|(id, _)| id),
            parent_trigger: parent.map(|(_, trigger)| trigger.to_string()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Fixture {
        selector: AffectedFileSelector,
        store: Arc<InMemoryResultStore>,
        catalog: Arc<InMemoryCatalog>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryResultStore::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let selector = AffectedFileSelector::new(
            store.clone(),
            catalog.clone(),
            RetryPolicy::default(),
        );
        Fixture {
            selector,
            store,
            catalog,
        }
    }

    #[tokio::test]
    async fn creating_a_child_selects_only_files_matching_the_trigger() {
        let fixture = fixture();
        let project_id = ProjectId::new();
        let parent = definition(project_id, None);
        let file_true = FileId::new();
        let file_false = FileId::new();

        fixture
            .store
            .upsert(EvaluationResultRecord::completed(
                file_true,
                ContentUnitId::new(),
                parent.id,
                "true".to_string(),
            ))
            .await
            .unwrap();
        fixture
            .store
            .upsert(EvaluationResultRecord::completed(
                file_false,
                ContentUnitId::new(),
                parent.id,
                "false".to_string(),
            ))
            .await
            .unwrap();

        let child = definition(project_id, Some((parent.id, "true")));
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Created(child))
            .await
            .unwrap();
        assert_eq!(selected, vec![file_true]);
    }

    #[tokio::test]
    async fn updating_selects_files_with_prior_results_for_this_evaluation() {
        let fixture = fixture();
        let project_id = ProjectId::new();
        let old = definition(project_id, None);
        let file_id = FileId::new();

        fixture
            .store
            .upsert(EvaluationResultRecord::completed(
                file_id,
                ContentUnitId::new(),
                old.id,
                "true".to_string(),
            ))
            .await
            .unwrap();

        let mut new = old.clone();
        new.prompt = "Rephrased question?".to_string();
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Updated { new, old })
            .await
            .unwrap();
        assert_eq!(selected, vec![file_id]);
    }

    #[tokio::test]
    async fn changed_trigger_selects_files_matching_the_old_value() {
        let fixture = fixture();
        let project_id = ProjectId::new();
        let parent_id = EvaluationId::new();
        let file_old_value = FileId::new();

        fixture
            .store
            .upsert(EvaluationResultRecord::completed(
                file_old_value,
                ContentUnitId::new(),
                parent_id,
                "false".to_string(),
            ))
            .await
            .unwrap();

        let old = definition(project_id, Some((parent_id, "false")));
        let mut new = old.clone();
        new.parent_trigger = Some("true".to_string());
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Updated { new, old })
            .await
            .unwrap();
        // Rule 1 (old trigger) and rule 2 (prior results) both hit this
        // file; dedup keeps it once.
        assert_eq!(selected, vec![file_old_value]);
    }

    #[tokio::test]
    async fn unchanged_trigger_update_does_not_consult_parent_results() {
        let fixture = fixture();
        let project_id = ProjectId::new();
        let parent_id = EvaluationId::new();
        let file_parent_only = FileId::new();

        // The parent matched on this file but the child never produced a
        // row, so an update that keeps the trigger selects nothing here.
        fixture
            .store
            .upsert(EvaluationResultRecord::completed(
                file_parent_only,
                ContentUnitId::new(),
                parent_id,
                "true".to_string(),
            ))
            .await
            .unwrap();

        let old = definition(project_id, Some((parent_id, "true")));
        let mut new = old.clone();
        new.prompt = "Rephrased question?".to_string();
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Updated { new, old })
            .await
            .unwrap();
        assert!(selected.is_empty());
    }

    #[tokio::test]
    async fn creating_a_root_selects_every_completed_file() {
        let fixture = fixture();
        let project_id = ProjectId::new();
        let done = FileId::new();
        let still_ingesting = FileId::new();
        fixture.catalog.insert_file(FileRecord {
            id: done,
            project_id,
            status: FileStatus::Completed,
        });
        fixture.catalog.insert_file(FileRecord {
            id: still_ingesting,
            project_id,
            status: FileStatus::Ingesting,
        });

        let root = definition(project_id, None);
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Created(root))
            .await
            .unwrap();
        assert_eq!(selected, vec![done]);
    }

    #[tokio::test]
    async fn deletion_selects_nothing() {
        let fixture = fixture();
        let definition = definition(ProjectId::new(), None);
        let selected = fixture
            .selector
            .files_to_reevaluate(&EvaluationChange::Deleted(definition))
            .await
            .unwrap();
        assert!(selected.is_empty());
    }
}
