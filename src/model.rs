//! Core data model: evaluation definitions, content units, persisted
//! results and the wire types exchanged with the inference provider.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ProjectId);
define_id!(FileId);
define_id!(EvaluationId);
define_id!(ContentUnitId);
define_id!(RunId);

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("evaluation {0}: parent_id and parent_trigger must both be set or both be null")]
    ParentTriggerMismatch(EvaluationId),
    #[error("evaluation {0}: enum_choice requires a non-empty option list")]
    MissingOptions(EvaluationId),
    #[error("evaluation {0}: options are only valid on enum_choice evaluations")]
    UnexpectedOptions(EvaluationId),
}

/// The answer shape an evaluation expects. Closed set: decoding and request
/// constraint building both match exhaustively on this, so adding a variant
/// is a compile-time-visible change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvaluationType {
    Boolean,
    EnumChoice,
    Text,
}

/// One question node in a project's evaluation forest. Evaluations with no
/// parent are roots; a child only runs on content units whose parent
/// evaluation decoded to `parent_trigger`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationDefinition {
    pub id: EvaluationId,
    pub project_id: ProjectId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub evaluation_type: EvaluationType,
    /// Required iff `evaluation_type` is `EnumChoice`.
    #[serde(default)]
    pub options: Option<Vec<String>>,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub parent_id: Option<EvaluationId>,
    #[serde(default)]
    pub parent_trigger: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl EvaluationDefinition {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.parent_id.is_some() != self.parent_trigger.is_some() {
            return Err(ModelError::ParentTriggerMismatch(self.id));
        }
        match self.evaluation_type {
            EvaluationType::EnumChoice => match &self.options {
                Some(options) if !options.is_empty() => Ok(()),
                _ => Err(ModelError::MissingOptions(self.id)),
            },
            EvaluationType::Boolean | EvaluationType::Text => {
                if self.options.is_some() {
                    return Err(ModelError::UnexpectedOptions(self.id));
                }
                Ok(())
            }
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Ingestion status of a file; the orchestrator moves it to `Evaluating`
/// while a run is in flight and to `Completed`/`Failed` at the end.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FileStatus {
    Ingesting,
    Evaluating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub project_id: ProjectId,
    pub status: FileStatus,
}

/// One indexable slice of a file (e.g. one page). Created during ingestion
/// and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUnit {
    pub id: ContentUnitId,
    pub file_id: FileId,
    pub ordinal: u32,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Matches an asynchronous callback to its originating request. Unique
/// within one dispatched batch.
pub type CorrelationKey = (ContentUnitId, EvaluationId);

/// Ephemeral pairing of a content unit with an evaluation for one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub content_unit_id: ContentUnitId,
    pub evaluation_id: EvaluationId,
    pub run_id: RunId,
    #[serde(default)]
    pub parent_evaluation_id: Option<EvaluationId>,
    #[serde(default)]
    pub parent_trigger: Option<String>,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Persisted answer for one (content unit, evaluation) pair. Upserted on
/// that key: created on first answer, overwritten on re-evaluation, never
/// deleted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResultRecord {
    pub content_unit_id: ContentUnitId,
    pub evaluation_id: EvaluationId,
    pub file_id: FileId,
    /// Decoded answer. Booleans are normalized to `"true"`/`"false"`.
    pub value: Option<String>,
    pub status: ResultStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl EvaluationResultRecord {
    pub fn completed(
        file_id: FileId,
        content_unit_id: ContentUnitId,
        evaluation_id: EvaluationId,
        value: String,
    ) -> Self {
        Self {
            content_unit_id,
            evaluation_id,
            file_id,
            value: Some(value),
            status: ResultStatus::Completed,
            error: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(
        file_id: FileId,
        content_unit_id: ContentUnitId,
        evaluation_id: EvaluationId,
        error: String,
    ) -> Self {
        Self {
            content_unit_id,
            evaluation_id,
            file_id,
            value: None,
            status: ResultStatus::Failed,
            error: Some(error),
            recorded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CorrelationKey {
        (self.content_unit_id, self.evaluation_id)
    }
}

/// (evaluation id, decoded value) pair identifying a child frontier. The
/// visited memo over these keys is what keeps recursion finite within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrontierKey {
    pub evaluation_id: EvaluationId,
    pub trigger: String,
}

impl FrontierKey {
    pub fn new(evaluation_id: EvaluationId, trigger: impl Into<String>) -> Self {
        Self {
            evaluation_id,
            trigger: trigger.into(),
        }
    }
}

impl std::fmt::Display for FrontierKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.evaluation_id, self.trigger)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallbackStatus {
    Completed,
    Failed,
}

/// Inbound completion callback delivered by the provider, one per submitted
/// request, carrying the correlation metadata echoed back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionCallback {
    pub run_id: RunId,
    pub content_unit_id: ContentUnitId,
    pub evaluation_id: EvaluationId,
    pub status: CallbackStatus,
    #[serde(default)]
    pub response: Option<InferenceResponse>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// JSON-encoded argument object, as the provider emits it.
    pub arguments: String,
}

/// Definition-change event from the catalog's CRUD surface.
#[derive(Debug, Clone)]
pub enum EvaluationChange {
    Created(EvaluationDefinition),
    Updated {
        new: EvaluationDefinition,
        old: EvaluationDefinition,
    },
    Deleted(EvaluationDefinition),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boolean_definition() -> EvaluationDefinition {
        EvaluationDefinition {
            id: EvaluationId::new(),
            project_id: ProjectId::new(),
            title: "IsContract".to_string(),
            description: String::new(),
            evaluation_type: EvaluationType::Boolean,
            options: None,
            prompt: "Does this page contain a contract?".to_string(),
            system_prompt: None,
            parent_id: None,
            parent_trigger: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn validate_accepts_root_boolean() {
        assert!(boolean_definition().validate().is_ok());
    }

    #[test]
    fn validate_rejects_parent_without_trigger() {
        let mut definition = boolean_definition();
        definition.parent_id = Some(EvaluationId::new());
        assert!(matches!(
            definition.validate(),
            Err(ModelError::ParentTriggerMismatch(_))
        ));
    }

    #[test]
    fn validate_rejects_enum_without_options() {
        let mut definition = boolean_definition();
        definition.evaluation_type = EvaluationType::EnumChoice;
        assert!(matches!(
            definition.validate(),
            Err(ModelError::MissingOptions(_))
        ));
    }

    #[test]
    fn validate_rejects_options_on_boolean() {
        let mut definition = boolean_definition();
        definition.options = Some(vec!["lease".to_string()]);
        assert!(matches!(
            definition.validate(),
            Err(ModelError::UnexpectedOptions(_))
        ));
    }

    #[test]
    fn evaluation_type_round_trips_as_snake_case() {
        assert_eq!(EvaluationType::EnumChoice.to_string(), "enum_choice");
        assert_eq!(
            "boolean".parse::<EvaluationType>().unwrap(),
            EvaluationType::Boolean
        );
    }

    #[test]
    fn callback_deserializes_wire_payload() {
        let payload = serde_json::json!({
            "run_id": Uuid::new_v4(),
            "content_unit_id": Uuid::new_v4(),
            "evaluation_id": Uuid::new_v4(),
            "status": "completed",
            "response": {
                "tool_calls": [
                    {"function": {"name": "boolean_answer", "arguments": "{\"answer\": true}"}}
                ]
            }
        });
        let callback: CompletionCallback = serde_json::from_value(payload).unwrap();
        assert_eq!(callback.status, CallbackStatus::Completed);
        let response = callback.response.unwrap();
        assert_eq!(response.tool_calls[0].function.name, "boolean_answer");
    }
}
