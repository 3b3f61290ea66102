/// Function-calling boundary to the LLM provider.
///
/// Every request carries a system persona, one user prompt and exactly one function
/// definition, with `tool_choice` pinned to that function. The provider's reply is only
/// ever read from the function-call arguments; free-text content is ignored.
use async_trait::async_trait;
use schemars::generate::SchemaSettings;
use schemars::JsonSchema;
use tracing::debug;

use analysis_common::openai::{
    ChatCompletionRequest, Message, OpenAiClient, ToolChoice, ToolDefinition,
};

use crate::error::AnalysisError;

#[derive(Debug, Clone)]
pub struct FunctionCall {
    pub system: String,
    pub prompt: String,
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
    pub max_tokens: Option<u32>,
}

#[async_trait]
pub trait FunctionCaller: Send + Sync {
    /// Raw JSON arguments of the pinned function call.
    async fn call_function(&self, call: &FunctionCall) -> Result<String, AnalysisError>;
}

pub struct OpenAiFunctionCaller {
    client: OpenAiClient,
    model: String,
    temperature: f32,
}

impl OpenAiFunctionCaller {
    pub fn new(client: OpenAiClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            temperature: 0.1,
        }
    }
}

#[async_trait]
impl FunctionCaller for OpenAiFunctionCaller {
    async fn call_function(&self, call: &FunctionCall) -> Result<String, AnalysisError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(call.system.clone()),
                Message::user(call.prompt.clone()),
            ],
            temperature: Some(self.temperature),
            max_tokens: call.max_tokens,
            tools: vec![ToolDefinition::function(
                call.name,
                call.description,
                call.parameters.clone(),
            )],
            tool_choice: Some(ToolChoice::function(call.name)),
        };

        let response = self.client.chat_completions(request, None).await?;
        if let Some(usage) = &response.usage {
            debug!(
                function = call.name,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "provider usage"
            );
        }
        response
            .function_arguments(call.name)
            .map(str::to_string)
            .ok_or_else(|| {
                AnalysisError::MalformedProviderResponse(format!(
                    "response did not call function {}",
                    call.name
                ))
            })
    }
}

/// JSON schema for a function's parameters, with subschemas inlined and the
/// `$schema`/`title` keys removed.
pub fn parameters_schema<T: JsonSchema>() -> serde_json::Value {
    let schema = SchemaSettings::draft07()
        .with(|s| s.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<T>();
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// Rough token estimate for budget accounting: 4 chars per token plus the output cap.
pub fn estimate_tokens(call: &FunctionCall) -> u64 {
    let chars = call.system.len() + call.prompt.len() + call.parameters.to_string().len();
    (chars / 4) as u64 + u64::from(call.max_tokens.unwrap_or(0))
}
