use anyhow::{Result, anyhow};
use serde::Deserialize;
use serde_json::{Value, json};

use super::retry::send_with_retry;
use super::{
    InlineImage, Message, MessagePart, Provider, ProviderFuture, ProviderResponse, ProviderUsage,
    ToolSpec, format_error_parts, system_text, user_messages,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;
pub(crate) const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[derive(Debug, Clone)]
pub struct Claude {
    key: String,
    model: String,
    messages: Vec<Message>,
    tools: Vec<ToolSpec>,
}

impl Claude {
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

    fn find_tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    fn request_body(&self, tool: &ToolSpec) -> Value {
        let messages = user_messages(&self.messages)
            .map(|message| {
                let content = message
                    .parts
                    .iter()
                    .map(|part| match part {
                        MessagePart::Text(text) => json!({"type": "text", "text": text}),
                        MessagePart::Image(image) => json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.mime,
                                "data": image.base64
                            }
                        }),
                    })
                    .collect::<Vec<_>>();
                json!({"role": "user", "content": content})
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": messages,
            "tools": [{
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.parameters
            }],
            "tool_choice": {"type": "tool", "name": tool.name}
        });
        let system = system_text(&self.messages);
        if !system.trim().is_empty() {
            body["system"] = json!(system);
        }
        body
    }
}

fn base_url() -> String {
    std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

impl Provider for Claude {
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
                .find_tool(&tool_name)
                .ok_or_else(|| anyhow!("tool '{}' not registered", tool_name))?;
            let body = self.request_body(tool);
            let url = base_url();
            let client = reqwest::Client::new();
            let text = send_with_retry(
                "Claude",
                || {
                    client
                        .post(&url)
                        .header("x-api-key", &self.key)
                        .header("anthropic-version", ANTHROPIC_VERSION)
                        .json(&body)
                },
                extract_claude_error,
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
    let payload: ClaudeResponse = serde_json::from_str(text)
        .map_err(|err| anyhow!("failed to parse Claude response JSON: {}", err))?;
    let block = payload
        .content
        .into_iter()
        .find(|block| block.kind == "tool_use" && block.name.as_deref() == Some(tool_name))
        .ok_or_else(|| match payload.stop_reason.as_deref() {
            Some("max_tokens") => anyhow!("Claude response truncated at max_tokens"),
            _ => anyhow!("no tool call returned from Claude"),
        })?;
    let input = block
        .input
        .ok_or_else(|| anyhow!("Claude tool_use missing input"))?;

    let model = payload
        .model
        .filter(|value| !value.trim().is_empty())
        .or_else(|| Some(fallback_model.to_string()));
    let usage = payload.usage.map(|usage| ProviderUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage
            .input_tokens
            .zip(usage.output_tokens)
            .map(|(input, output)| input + output),
    });
    Ok(ProviderResponse {
        args: input,
        model,
        usage,
    })
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ClaudeError>,
    }

    #[derive(Deserialize)]
    struct ClaudeError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, None))
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    #[serde(default)]
    content: Vec<ClaudeContent>,
    model: Option<String>,
    stop_reason: Option<String>,
    usage: Option<ClaudeUsage>,
}

#[derive(Debug, Deserialize)]
struct ClaudeUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    input: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tool_use_input() {
        let payload = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tests/fixtures/claude_tool_response.json"
        ));
        let response =
            extract_tool_response(payload, "deliver_page_blocks", DEFAULT_MODEL).unwrap();
        assert_eq!(response.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(response.args["blocks"][0]["translatedText"], "Chapter 1");
        assert_eq!(response.usage.unwrap().total_tokens, Some(1560));
    }

    #[test]
    fn reports_truncated_responses() {
        let payload = r#"{"content":[{"type":"text","text":"..."}],"stop_reason":"max_tokens"}"#;
        let err = extract_tool_response(payload, "deliver_page_blocks", DEFAULT_MODEL).unwrap_err();
        assert!(err.to_string().contains("max_tokens"));
    }

    #[test]
    fn image_parts_use_base64_sources() {
        let provider = Claude::new("key").append_user_image(InlineImage {
            mime: "image/png".to_string(),
            base64: "AAAA".to_string(),
        });
        let tool = ToolSpec {
            name: "deliver_page_blocks".to_string(),
            description: "d".to_string(),
            parameters: json!({"type": "object"}),
        };
        let body = provider.request_body(&tool);
        let source = &body["messages"][0]["content"][0]["source"];
        assert_eq!(source["type"], "base64");
        assert_eq!(source["media_type"], "image/png");
        assert!(body.get("system").is_none());
        assert_eq!(body["max_tokens"], MAX_TOKENS);
    }
}
