//! Pure answer decoding: maps a raw inference response to the normalized
//! string value an evaluation's type expects. No side effects; the caller
//! persists the outcome either way.

use serde::Deserialize;
use thiserror::Error;

use crate::model::{
    CallbackStatus, CompletionCallback, EvaluationDefinition, EvaluationType, InferenceResponse,
    ToolCall,
};

pub const BOOLEAN_TOOL_NAME: &str = "boolean_answer";
pub const ENUM_TOOL_NAME: &str = "enum_answer";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("provider reported failure: {0}")]
    ProviderFailed(String),
    #[error("response payload missing")]
    MissingResponse,
    #[error("no tool call in response, expected {expected}")]
    MissingToolCall { expected: &'static str },
    #[error("unexpected tool call {got}, expected {expected}")]
    UnexpectedTool {
        expected: &'static str,
        got: String,
    },
    #[error("malformed tool arguments: {0}")]
    MalformedArguments(String),
    #[error("answer {value:?} is not one of the declared options")]
    OutOfDomain { value: String },
    #[error("empty text response")]
    EmptyMessage,
}

pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Deserialize)]
struct BooleanArguments {
    answer: bool,
}

#[derive(Debug, Deserialize)]
struct EnumArguments {
    answer: String,
}

/// Decode one callback against the evaluation that produced the request.
///
/// The match over [`EvaluationType`] is exhaustive on purpose: adding a new
/// evaluation type must not silently fall into a default arm.
pub fn decode_answer(
    definition: &EvaluationDefinition,
    callback: &CompletionCallback,
) -> DecodeResult<String> {
    if callback.status == CallbackStatus::Failed {
        return Err(DecodeError::ProviderFailed(
            callback
                .error
                .clone()
                .unwrap_or_else(|| "unknown provider error".to_string()),
        ));
    }
    let response = callback
        .response
        .as_ref()
        .ok_or(DecodeError::MissingResponse)?;

    match definition.evaluation_type {
        EvaluationType::Boolean => {
            let call = expect_tool_call(response, BOOLEAN_TOOL_NAME)?;
            let arguments: BooleanArguments = serde_json::from_str(&call.function.arguments)
                .map_err(|e| DecodeError::MalformedArguments(e.to_string()))?;
            Ok(arguments.answer.to_string())
        }
        EvaluationType::EnumChoice => {
            let call = expect_tool_call(response, ENUM_TOOL_NAME)?;
            let arguments: EnumArguments = serde_json::from_str(&call.function.arguments)
                .map_err(|e| DecodeError::MalformedArguments(e.to_string()))?;
            let options = definition.options.as_deref().unwrap_or_default();
            if !options.iter().any(|option| option == &arguments.answer) {
                return Err(DecodeError::OutOfDomain {
                    value: arguments.answer,
                });
            }
            Ok(arguments.answer)
        }
        EvaluationType::Text => match response.message.as_deref() {
            Some(message) if !message.trim().is_empty() => Ok(message.to_string()),
            _ => Err(DecodeError::EmptyMessage),
        },
    }
}

fn expect_tool_call<'a>(
    response: &'a InferenceResponse,
    expected: &'static str,
) -> DecodeResult<&'a ToolCall> {
    let call = response
        .tool_calls
        .first()
        .ok_or(DecodeError::MissingToolCall { expected })?;
    if call.function.name != expected {
        return Err(DecodeError::UnexpectedTool {
            expected,
            got: call.function.name.clone(),
        });
    }
    Ok(call)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{
        ContentUnitId, EvaluationId, ProjectId, RunId, ToolCallFunction,
    };

    fn definition(evaluation_type: EvaluationType, options: Option<Vec<String>>) -> EvaluationDefinition {
        EvaluationDefinition {
            id: EvaluationId::new(),
            project_id: ProjectId::new(),
            title: "test".to_string(),
            description: String::new(),
            evaluation_type,
            options,
            prompt: "prompt".to_string(),
            system_prompt: None,
            parent_id: None,
            parent_trigger: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn callback(response: Option<InferenceResponse>) -> CompletionCallback {
        CompletionCallback {
            run_id: RunId::new(),
            content_unit_id: ContentUnitId::new(),
            evaluation_id: EvaluationId::new(),
            status: CallbackStatus::Completed,
            response,
            error: None,
        }
    }

    fn tool_response(name: &str, arguments: &str) -> InferenceResponse {
        InferenceResponse {
            message: None,
            tool_calls: vec![ToolCall {
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            }],
        }
    }

    #[test]
    fn boolean_decodes_to_lowercase_string() {
        let definition = definition(EvaluationType::Boolean, None);
        let affirmative = callback(Some(tool_response(BOOLEAN_TOOL_NAME, r#"{"answer": true}"#)));
        assert_eq!(decode_answer(&definition, &affirmative).unwrap(), "true");

        let negative = callback(Some(tool_response(BOOLEAN_TOOL_NAME, r#"{"answer": false}"#)));
        assert_eq!(decode_answer(&definition, &negative).unwrap(), "false");
    }

    #[test]
    fn boolean_without_tool_call_is_an_error() {
        let definition = definition(EvaluationType::Boolean, None);
        let callback = callback(Some(InferenceResponse {
            message: Some("yes".to_string()),
            tool_calls: vec![],
        }));
        assert_eq!(
            decode_answer(&definition, &callback),
            Err(DecodeError::MissingToolCall {
                expected: BOOLEAN_TOOL_NAME
            })
        );
    }

    #[test]
    fn boolean_with_wrong_tool_is_an_error() {
        let definition = definition(EvaluationType::Boolean, None);
        let callback = callback(Some(tool_response(ENUM_TOOL_NAME, r#"{"answer": "x"}"#)));
        assert!(matches!(
            decode_answer(&definition, &callback),
            Err(DecodeError::UnexpectedTool { .. })
        ));
    }

    #[test]
    fn enum_value_must_be_in_declared_options() {
        let definition = definition(
            EvaluationType::EnumChoice,
            Some(vec!["lease".to_string(), "sale".to_string()]),
        );
        let in_domain = callback(Some(tool_response(ENUM_TOOL_NAME, r#"{"answer": "lease"}"#)));
        assert_eq!(decode_answer(&definition, &in_domain).unwrap(), "lease");

        let out_of_domain = callback(Some(tool_response(ENUM_TOOL_NAME, r#"{"answer": "loan"}"#)));
        assert_eq!(
            decode_answer(&definition, &out_of_domain),
            Err(DecodeError::OutOfDomain {
                value: "loan".to_string()
            })
        );
    }

    #[test]
    fn malformed_arguments_are_an_error_not_a_default() {
        let definition = definition(EvaluationType::Boolean, None);
        let callback = callback(Some(tool_response(BOOLEAN_TOOL_NAME, "not json")));
        assert!(matches!(
            decode_answer(&definition, &callback),
            Err(DecodeError::MalformedArguments(_))
        ));
    }

    #[test]
    fn text_requires_non_empty_message() {
        let definition = definition(EvaluationType::Text, None);
        let answered = callback(Some(InferenceResponse {
            message: Some("A lease agreement.".to_string()),
            tool_calls: vec![],
        }));
        assert_eq!(
            decode_answer(&definition, &answered).unwrap(),
            "A lease agreement."
        );

        let blank = callback(Some(InferenceResponse {
            message: Some("   ".to_string()),
            tool_calls: vec![],
        }));
        assert_eq!(
            decode_answer(&definition, &blank),
            Err(DecodeError::EmptyMessage)
        );
    }

    #[test]
    fn failed_callback_carries_provider_error() {
        let definition = definition(EvaluationType::Text, None);
        let mut callback = callback(None);
        callback.status = CallbackStatus::Failed;
        callback.error = Some("rate limited".to_string());
        assert_eq!(
            decode_answer(&definition, &callback),
            Err(DecodeError::ProviderFailed("rate limited".to_string()))
        );
    }

    #[test]
    fn missing_response_is_an_error() {
        let definition = definition(EvaluationType::Text, None);
        let callback = callback(None);
        assert_eq!(
            decode_answer(&definition, &callback),
            Err(DecodeError::MissingResponse)
        );
    }
}
