//! Result persistence. One row per (content unit, evaluation) pair,
//! idempotently upserted: the first answer creates it, a re-evaluation
//! overwrites it, nothing here ever deletes it. The read surface feeds the
//! affected-file selector.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::model::{
    ContentUnitId, CorrelationKey, EvaluationId, EvaluationResultRecord, ResultStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
#[mockall::automock]
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite the record keyed by (content unit, evaluation).
    async fn upsert(&self, record: EvaluationResultRecord) -> StoreResult<()>;

    async fn get(
        &self,
        content_unit_id: ContentUnitId,
        evaluation_id: EvaluationId,
    ) -> StoreResult<Option<EvaluationResultRecord>>;

    /// All records for one evaluation; with `trigger` set, only completed
    /// records whose decoded value equals it.
    async fn results_for_evaluation(
        &self,
        evaluation_id: EvaluationId,
        trigger: Option<&str>,
    ) -> StoreResult<Vec<EvaluationResultRecord>>;
}

#[derive(Default)]
pub struct InMemoryResultStore {
    rows: DashMap<CorrelationKey, EvaluationResultRecord>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, record: EvaluationResultRecord) -> StoreResult<()> {
        self.rows.insert(record.key(), record);
        Ok(())
    }

    async fn get(
        &self,
        content_unit_id: ContentUnitId,
        evaluation_id: EvaluationId,
    ) -> StoreResult<Option<EvaluationResultRecord>> {
        Ok(self
            .rows
            .get(&(content_unit_id, evaluation_id))
            .map(|entry| entry.clone()))
    }

    async fn results_for_evaluation(
        &self,
        evaluation_id: EvaluationId,
        trigger: Option<&str>,
    ) -> StoreResult<Vec<EvaluationResultRecord>> {
        Ok(self
            .rows
            .iter()
            .filter(|entry| entry.evaluation_id == evaluation_id)
            .filter(|entry| match trigger {
                Some(value) => {
                    entry.status == ResultStatus::Completed
                        && entry.value.as_deref() == Some(value)
                }
                None => true,
            })
            .map(|entry| entry.clone())
            .collect())
    }
}
