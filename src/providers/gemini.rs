use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::send_with_retry;
use super::{
    InlineImage, Message, MessagePart, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec, format_error_parts, system_text, user_messages,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub(crate) const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone)]
pub struct Gemini {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Gemini {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model: DEFAULT_MODEL.to_string(),
            messages: Vec::new(),
            tools: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    fn request_body(&self, tool: &ToolSpec) -> Value {
        let system = system_text(&self.messages);
        let contents = user_messages(&self.messages)
            .map(|message| {
                let parts = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"text": text}),
                        MessagePart::Image(image) => json!({
                            "inline_data": {
                                "mime_type": image.mime,
                                "data": image.base64
                            }
                        }),
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "parts": parts})
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "contents": contents,
            "tools": [{
                "function_declarations": [{
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }]
            }],
            "tool_config": {
                "function_calling_config": {
                    "mode": "ANY",
                    "allowed_function_names": [tool.name]
                }
            }
        });
        if !system.trim().is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        body
    }
}

fn base_url() -> String {
    std::env::var("GEMINI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

impl Provider for Gemini {
    fn append_system_input(mut self, input: String) -> Self {
        self.messages.push(Message::system(input));
        self
    }

    fn append_user_input(mut self, input: String) -> Self {
        self.messages.push(Message::user(input));
        self
    }

    fn append_user_image(mut self, image: InlineImage) -> Self {
        self.messages.push(Message::user_image(image));
        self
    }

    fn register_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        let tool_name = tool_name.to_string();
        Box::pin(async move {
            let tool = self
                .tools
                .iter()
                .find(|tool| tool.name == tool_name)
                .ok_or_else(|| anyhow!("tool '{}' not registered", tool_name))?;
            let body = self.request_body(tool);
            let url = format!("{}/{}:generateContent", base_url(), self.model);
            let client = reqwest::Client::new();
            let text = send_with_retry(
                "Gemini",
                || {
                    client
                        .post(&url)
                        .header("x-goog-api-key", &self.key)
                        .json(&body)
                },
                extract_gemini_error,
            )
            .await?;
            extract_tool_response(&text, &tool_name, &self.model)
        })
    }
}

fn extract_tool_response(
    text: &str,
    tool_name: &str,
    fallback_model: &str,
) -> Result<ProviderResponse> {
    let payload: GeminiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse Gemini response JSON")?;
    let candidate = payload
        .candidates
        .first()
        .ok_or_else(|| anyhow!("no candidate returned from Gemini"))?;
    let function_call = candidate
        .content
        .as_ref()
        .and_then(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.function_call.as_ref())
                .find(|call| call.name == tool_name)
        })
        .ok_or_else(|| match candidate.finish_reason.as_deref() {
            Some(reason) if reason != "STOP" => {
                anyhow!("Gemini stopped without a tool call (finish reason: {})", reason)
            }
            _ => anyhow!("no tool call returned from Gemini"),
        })?;

    let model = payload
        .model_version
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage_metadata.map(|usage| ProviderUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    });
    Ok(ProviderResponse {
        args: function_call.args.clone(),
        model,
        usage,
    })
}

fn extract_gemini_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<GeminiError>,
    }

    #[derive(Deserialize)]
    struct GeminiError {
        message: Option<String>,
        status: Option<String>,
        code: Option<i32>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(
        error.message,
        error.status,
        error.code.map(|value| value.to_string()),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}
