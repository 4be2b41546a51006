use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::send_with_retry;
use super::{
    InlineImage, Message, MessagePart, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec, format_error_parts, system_text, user_messages,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl OpenAI {
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

    fn find_tool(&self, name: &str) -> Result<&ToolSpec> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| anyhow!("tool '{}' not registered", name))
    }

    /// Page images travel as `input_image` data URLs on the responses API.
    fn request_body(&self, tool: &ToolSpec) -> Value {
        let input = user_messages(&self.messages)
            .map(|message| {
                let content = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"type": "input_text", "text": text}),
                        MessagePart::Image(image) => {
                            json!({"type": "input_image", "image_url": image.data_url()})
                        }
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "content": content})
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": self.model,
            "input": input,
            "tools": [{
                "type": "function",
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters
            }],
            "tool_choice": {"type": "function", "name": tool.name}
        });
        let system = system_text(&self.messages);
        if !system.trim().is_empty() {
            body["instructions"] = json!(system);
        }
        body
    }
}

fn base_url() -> String {
    std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

impl Provider for OpenAI {
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
            let body = self.request_body(self.find_tool(&tool_name)?);
            let url = format!("{}/responses", base_url());
            let client = reqwest::Client::new();
            let text = send_with_retry(
                "OpenAI",
                || client.post(&url).bearer_auth(&self.key).json(&body),
                extract_openai_error,
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
    let payload: ResponseApiResponse =
        serde_json::from_str(text).with_context(|| "failed to parse OpenAI response JSON")?;
    let arguments = payload
        .output
        .iter()
        .find_map(|item| match item {
            ResponseOutputItem::FunctionCall { name, arguments } if name == tool_name => {
                Some(arguments)
            }
            _ => None,
        })
        .ok_or_else(|| anyhow!("no tool call returned from OpenAI"))?;

    let args: Value =
        serde_json::from_str(arguments).with_context(|| "failed to parse OpenAI tool arguments")?;
    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.total_tokens,
    });
    Ok(ProviderResponse { args, model, usage })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, error.code))
}

#[derive(Debug, Deserialize)]
struct ResponseApiResponse {
    model: Option<String>,
    #[serde(default)]
    output: Vec<ResponseOutputItem>,
    usage: Option<ResponseApiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseOutputItem {
    #[serde(rename = "function_call")]
    FunctionCall { name: String, arguments: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponseApiUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_function_call_from_output_items() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/openai_tool_response.json"
        ));
        let response =
            extract_tool_response(payload, "deliver_page_blocks", DEFAULT_MODEL).unwrap();
        assert_eq!(response.model.as_deref(), Some("gpt-4o-mini-2024-07-18"));
        let blocks = response.args["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "table_cell");
        assert_eq!(response.usage.unwrap().total_tokens, Some(1025));
    }

    #[test]
    fn missing_tool_call_is_an_error() {
        let payload = r#"{"model":"gpt-4o-mini","output":[{"type":"message","content":[]}]}"#;
        assert!(extract_tool_response(payload, "deliver_page_blocks", DEFAULT_MODEL).is_err());
    }

    #[test]
    fn formats_api_errors() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        assert_eq!(
            extract_openai_error(body).unwrap(),
            "Incorrect API key provided | type: invalid_request_error | code: invalid_api_key"
        );
        assert_eq!(extract_openai_error("<html>"), None);
    }

    #[test]
    fn images_are_sent_as_data_urls() {
        let provider = OpenAI::new("key")
            .append_system_input("rules".to_string())
            .append_user_image(InlineImage {
                mime: "image/jpeg".to_string(),
                base64: "QUJD".to_string(),
            });
        let tool = ToolSpec {
            name: "deliver_page_blocks".to_string(),
            description: "d".to_string(),
            parameters: json!({"type": "object"}),
        };
        let body = provider.request_body(&tool);
        assert_eq!(body["instructions"], "rules");
        assert_eq!(
            body["input"][0]["content"][0]["image_url"],
            "data:image/jpeg;base64,QUJD"
        );
        assert_eq!(body["tool_choice"]["name"], "deliver_page_blocks");
    }
}
