//! Batch dispatch: turns (content unit, evaluation) pairs into provider
//! requests, constrains the answer shape by evaluation type, attaches the
//! correlation metadata the provider echoes back, and submits the whole set
//! as one batch call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::{ProviderEndpointConfig, SecretConfig};
use crate::decoder::{BOOLEAN_TOOL_NAME, ENUM_TOOL_NAME};
use crate::model::{
    ContentUnit, ContentUnitId, CorrelationKey, EvaluationDefinition, EvaluationId,
    EvaluationRequest, EvaluationType, FrontierKey, RunId,
};

pub const METADATA_EVALUATION_ID: &str = "evaluation_id";
pub const METADATA_FILE_ID: &str = "file_id";
pub const METADATA_CONTENT_UNIT_ID: &str = "content_unit_id";
pub const METADATA_RUN_ID: &str = "run_id";
pub const METADATA_PARENT_EVALUATION_ID: &str = "parent_evaluation_id";
pub const METADATA_PARENT_TRIGGER: &str = "parent_trigger";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("provider rejected batch: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("duplicate correlation key in batch: unit {unit} evaluation {evaluation}")]
    DuplicateKey {
        unit: ContentUnitId,
        evaluation: EvaluationId,
    },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    pub content: String,
}

impl RequestMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoice {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: ToolChoiceFunction,
}

/// One outbound completion request of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<RequestMessage>,
    pub resource: String,
    /// Echoed back unmodified on the completion callback.
    pub metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<RequestTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackOptions {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: Uuid,
    pub item_ids: Vec<Uuid>,
}

/// Submits one batch of completion requests and registers the callback
/// channel. All-or-nothing per batch: on rejection no callbacks will ever
/// arrive and the caller must rely on its timeout path.
#[async_trait]
#[mockall::automock]
pub trait InferenceClient: Send + Sync {
    async fn submit_batch(
        &self,
        requests: Vec<CompletionRequest>,
        callback: CallbackOptions,
    ) -> DispatchResult<BatchHandle>;
}

pub fn boolean_tool() -> RequestTool {
    RequestTool {
        tool_type: "function".to_string(),
        function: ToolFunction {
            name: BOOLEAN_TOOL_NAME.to_string(),
            description: "Answer a boolean question".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "boolean",
                        "description": "The answer to the question",
                    },
                },
                "required": ["answer"],
            }),
        },
    }
}

pub fn enum_tool(options: &[String]) -> RequestTool {
    RequestTool {
        tool_type: "function".to_string(),
        function: ToolFunction {
            name: ENUM_TOOL_NAME.to_string(),
            description: "Answer an enum question".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "The answer to the question",
                        "enum": options,
                    },
                },
                "required": ["answer"],
            }),
        },
    }
}

fn forced_choice(name: &str) -> ToolChoice {
    ToolChoice {
        tool_type: "function".to_string(),
        function: ToolChoiceFunction {
            name: name.to_string(),
        },
    }
}

#[derive(Debug)]
pub struct DispatchOutput {
    pub handle: Option<BatchHandle>,
    pub expected: usize,
}

pub struct BatchDispatcher {
    client: Arc<dyn InferenceClient>,
    resource: String,
    callback_url: String,
}

impl BatchDispatcher {
    pub fn new(client: Arc<dyn InferenceClient>, config: &ProviderEndpointConfig) -> Self {
        Self {
            client,
            resource: config.resource.clone(),
            callback_url: config.callback_url.clone(),
        }
    }

    /// Build the provider request for one (content unit, evaluation) pair.
    ///
    /// Message order: optional system prompt, the rendered content-unit
    /// block, then the evaluation's user prompt.
    pub fn build_request(
        &self,
        run_id: RunId,
        unit: &ContentUnit,
        definition: &EvaluationDefinition,
        parent: Option<&FrontierKey>,
    ) -> CompletionRequest {
        let mut messages = Vec::with_capacity(3);
        if let Some(system_prompt) = &definition.system_prompt {
            messages.push(RequestMessage::system(system_prompt.clone()));
        }
        let rendered_metadata = serde_json::to_string(&unit.metadata).unwrap_or_default();
        messages.push(RequestMessage::system(format!(
            "Document Page: {}\n\nMetadata: {}",
            unit.content, rendered_metadata
        )));
        messages.push(RequestMessage::user(definition.prompt.clone()));

        let request = EvaluationRequest {
            content_unit_id: unit.id,
            evaluation_id: definition.id,
            run_id,
            parent_evaluation_id: parent.map(|key| key.evaluation_id),
            parent_trigger: parent.map(|key| key.trigger.clone()),
        };
        let mut metadata = HashMap::new();
        metadata.insert(
            METADATA_EVALUATION_ID.to_string(),
            request.evaluation_id.to_string(),
        );
        metadata.insert(METADATA_FILE_ID.to_string(), unit.file_id.to_string());
        metadata.insert(
            METADATA_CONTENT_UNIT_ID.to_string(),
            request.content_unit_id.to_string(),
        );
        metadata.insert(METADATA_RUN_ID.to_string(), request.run_id.to_string());
        if let Some(parent_id) = request.parent_evaluation_id {
            metadata.insert(
                METADATA_PARENT_EVALUATION_ID.to_string(),
                parent_id.to_string(),
            );
        }
        if let Some(trigger) = &request.parent_trigger {
            metadata.insert(METADATA_PARENT_TRIGGER.to_string(), trigger.clone());
        }

        let (tools, tool_choice) = match definition.evaluation_type {
            EvaluationType::Boolean => (
                Some(vec![boolean_tool()]),
                Some(forced_choice(BOOLEAN_TOOL_NAME)),
            ),
            EvaluationType::EnumChoice => (
                Some(vec![enum_tool(definition.options.as_deref().unwrap_or_default())]),
                Some(forced_choice(ENUM_TOOL_NAME)),
            ),
            EvaluationType::Text => (None, None),
        };

        CompletionRequest {
            messages,
            resource: self.resource.clone(),
            metadata,
            tools,
            tool_choice,
        }
    }

    /// Submit one frontier level's request set as a single batch. Returns
    /// the expected completion count; the correlation key of every request
    /// must be unique within the batch.
    #[tracing::instrument(skip(self, pairs, parent), fields(%run_id, requests = pairs.len()))]
    pub async fn dispatch(
        &self,
        run_id: RunId,
        pairs: &[(&ContentUnit, &EvaluationDefinition)],
        parent: Option<&FrontierKey>,
    ) -> DispatchResult<DispatchOutput> {
        if pairs.is_empty() {
            return Ok(DispatchOutput {
                handle: None,
                expected: 0,
            });
        }

        let mut seen: HashSet<CorrelationKey> = HashSet::with_capacity(pairs.len());
        let mut requests = Vec::with_capacity(pairs.len());
        for (unit, definition) in pairs {
            if !seen.insert((unit.id, definition.id)) {
                return Err(DispatchError::DuplicateKey {
                    unit: unit.id,
                    evaluation: definition.id,
                });
            }
            requests.push(self.build_request(run_id, unit, definition, parent));
        }

        let callback = CallbackOptions {
            url: format!("{}?run_id={}", self.callback_url, run_id),
            headers: HashMap::new(),
            events: vec!["ITEM_UPDATE".to_string()],
        };

        let expected = requests.len();
        debug!(expected, "submitting completion batch");
        let handle = self.client.submit_batch(requests, callback).await?;

        Ok(DispatchOutput {
            handle: Some(handle),
            expected,
        })
    }
}

/// HTTP implementation of [`InferenceClient`] against the provider's
/// batch-callback endpoint.
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    requests: &'a [CompletionRequest],
    callback_options: &'a CallbackOptions,
}

#[derive(Deserialize)]
struct BatchResponse {
    batch_id: Uuid,
    #[serde(default)]
    items: Vec<BatchResponseItem>,
}

#[derive(Deserialize)]
struct BatchResponseItem {
    item_id: Uuid,
}

impl HttpInferenceClient {
    pub fn new(config: &ProviderEndpointConfig, secret: &SecretConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.clone(),
            api_key: SecretString::from(secret.api_key.clone()),
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn submit_batch(
        &self,
        requests: Vec<CompletionRequest>,
        callback: CallbackOptions,
    ) -> DispatchResult<BatchHandle> {
        let body = BatchBody {
            requests: &requests,
            callback_options: &callback,
        };
        let response = self
            .client
            .post(format!("{}/completion/batch", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected(format!("{}: {}", status, detail)));
        }

        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;
        Ok(BatchHandle {
            batch_id: batch.batch_id,
            item_ids: batch.items.into_iter().map(|item| item.item_id).collect(),
        })
    }
}
