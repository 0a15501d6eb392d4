//! Read access to the evaluation forest, a file's content units and file
//! records. The relational layer behind these traits is an external
//! collaborator; the orchestrator only ever reads through them (file status
//! updates excepted). A `DashMap`-backed implementation is provided for
//! tests and light in-process deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::{
    ContentUnit, EvaluationDefinition, EvaluationId, FileId, FileRecord, FileStatus, ModelError,
    ProjectId,
};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("evaluation {0} not found")]
    EvaluationNotFound(EvaluationId),
    #[error("file {0} not found")]
    FileNotFound(FileId),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

#[async_trait]
#[mockall::automock]
pub trait EvaluationCatalog: Send + Sync {
    /// Evaluations of the project with no parent, in creation order.
    async fn root_evaluations(
        &self,
        project_id: ProjectId,
    ) -> CatalogResult<Vec<EvaluationDefinition>>;

    /// Evaluations gated on (parent id, trigger value), in creation order.
    async fn child_evaluations(
        &self,
        parent_id: EvaluationId,
        trigger: &str,
    ) -> CatalogResult<Vec<EvaluationDefinition>>;

    async fn get_evaluation(&self, id: EvaluationId) -> CatalogResult<EvaluationDefinition>;
}

#[async_trait]
#[mockall::automock]
pub trait ContentCatalog: Send + Sync {
    /// Content units of a file in ordinal order. Immutable after ingestion.
    async fn units_for_file(&self, file_id: FileId) -> CatalogResult<Vec<ContentUnit>>;
}

#[async_trait]
#[mockall::automock]
pub trait FileCatalog: Send + Sync {
    async fn get_file(&self, file_id: FileId) -> CatalogResult<FileRecord>;

    async fn files_for_project(&self, project_id: ProjectId) -> CatalogResult<Vec<FileRecord>>;

    async fn update_status(&self, file_id: FileId, status: FileStatus) -> CatalogResult<()>;
}

#[derive(Default)]
pub struct InMemoryCatalog {
    evaluations: DashMap<EvaluationId, EvaluationDefinition>,
    units: DashMap<FileId, Vec<ContentUnit>>,
    files: DashMap<FileId, FileRecord>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_evaluation(&self, definition: EvaluationDefinition) -> Result<(), ModelError> {
        definition.validate()?;
        self.evaluations.insert(definition.id, definition);
        Ok(())
    }

    pub fn remove_evaluation(&self, id: EvaluationId) {
        self.evaluations.remove(&id);
    }

    pub fn insert_file(&self, file: FileRecord) {
        self.files.insert(file.id, file);
    }

    pub fn insert_units(&self, file_id: FileId, mut units: Vec<ContentUnit>) {
        units.sort_by_key(|unit| unit.ordinal);
        self.units.insert(file_id, units);
    }

    fn sorted(mut evaluations: Vec<EvaluationDefinition>) -> Vec<EvaluationDefinition> {
        evaluations.sort_by_key(|definition| definition.created_at);
        evaluations
    }
}

#[async_trait]
impl EvaluationCatalog for InMemoryCatalog {
    async fn root_evaluations(
        &self,
        project_id: ProjectId,
    ) -> CatalogResult<Vec<EvaluationDefinition>> {
        let matches = self
            .evaluations
            .iter()
            .filter(|entry| entry.project_id == project_id && entry.is_root())
            .map(|entry| entry.clone())
            .collect();
        Ok(Self::sorted(matches))
    }

    async fn child_evaluations(
        &self,
        parent_id: EvaluationId,
        trigger: &str,
    ) -> CatalogResult<Vec<EvaluationDefinition>> {
        let matches = self
            .evaluations
            .iter()
            .filter(|entry| {
                entry.parent_id == Some(parent_id)
                    && entry.parent_trigger.as_deref() == Some(trigger)
            })
            .map(|entry| entry.clone())
            .collect();
        Ok(Self::sorted(matches))
    }

    async fn get_evaluation(&self, id: EvaluationId) -> CatalogResult<EvaluationDefinition> {
        self.evaluations
            .get(&id)
            .map(|entry| entry.clone())
            .ok_or(CatalogError::EvaluationNotFound(id))
    }
}

#[async_trait]
impl ContentCatalog for InMemoryCatalog {
    async fn units_for_file(&self, file_id: FileId) -> CatalogResult<Vec<ContentUnit>> {
        Ok(self
            .units
            .get(&file_id)
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl FileCatalog for InMemoryCatalog {
    async fn get_file(&self, file_id: FileId) -> CatalogResult<FileRecord> {
        self.files
            .get(&file_id)
            .map(|entry| entry.clone())
            .ok_or(CatalogError::FileNotFound(file_id))
    }

    async fn files_for_project(&self, project_id: ProjectId) -> CatalogResult<Vec<FileRecord>> {
        Ok(self
            .files
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .map(|entry| entry.clone())
            .collect())
    }

    async fn update_status(&self, file_id: FileId, status: FileStatus) -> CatalogResult<()> {
        let mut file = self
            .files
            .get_mut(&file_id)
            .ok_or(CatalogError::FileNotFound(file_id))?;
        file.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::EvaluationType;

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

    #[tokio::test]
    async fn roots_and_children_are_selected_by_parent_filter() {
        let catalog = InMemoryCatalog::new();
        let project_id = ProjectId::new();
        let root = definition(project_id, None);
        let root_id = root.id;
        let child_true = definition(project_id, Some((root_id, "true")));
        let child_false = definition(project_id, Some((root_id, "false")));
        catalog.insert_evaluation(root).unwrap();
        catalog.insert_evaluation(child_true.clone()).unwrap();
        catalog.insert_evaluation(child_false).unwrap();

        let roots = catalog.root_evaluations(project_id).await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].id, root_id);

        let children = catalog.child_evaluations(root_id, "true").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child_true.id);

        let none = catalog.child_evaluations(root_id, "maybe").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn insert_rejects_invalid_definitions() {
        let catalog = InMemoryCatalog::new();
        let mut bad = definition(ProjectId::new(), None);
        bad.parent_id = Some(EvaluationId::new());
        assert!(catalog.insert_evaluation(bad).is_err());
    }

    #[tokio::test]
    async fn update_status_on_missing_file_fails() {
        let catalog = InMemoryCatalog::new();
        let result = catalog
            .update_status(FileId::new(), FileStatus::Completed)
            .await;
        assert!(matches!(result, Err(CatalogError::FileNotFound(_))));
    }
}
