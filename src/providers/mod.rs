use anyhow::{Result, anyhow};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;

mod claude;
mod gemini;
mod openai;
mod retry;

pub use claude::Claude;
pub use gemini::Gemini;
pub use openai::OpenAI;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Gemini,
    Claude,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Claude => "claude",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderResponse {
    pub args: serde_json::Value,
    pub model: Option<String>,
    pub usage: Option<ProviderUsage>,
}

/// A page image already encoded for transport.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub mime: String,
    pub base64: String,
}

impl InlineImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MessageRole {
    System,
    User,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Clone)]
pub enum MessagePart {
    Text(String),
    Image(InlineImage),
}

impl Message {
    pub fn system(content: String) -> Self {
        Self {
            role: MessageRole::System,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Text(content)],
        }
    }

    pub fn user_image(image: InlineImage) -> Self {
        Self {
            role: MessageRole::User,
            parts: vec![MessagePart::Image(image)],
        }
    }
}

/// Joins the text parts of every system message.
pub(crate) fn system_text(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::System))
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            MessagePart::Image(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub(crate) fn user_messages(messages: &[Message]) -> impl Iterator<Item = &Message> {
    messages
        .iter()
        .filter(|message| matches!(message.role, MessageRole::User))
}

pub(crate) fn format_error_parts(
    message: Option<String>,
    kind: Option<String>,
    code: Option<String>,
) -> String {
    let mut parts = Vec::new();
    if let Some(message) = message.filter(|value| !value.trim().is_empty()) {
        parts.push(message);
    }
    if let Some(kind) = kind.filter(|value| !value.trim().is_empty()) {
        parts.push(format!("type: {}", kind));
    }
    if let Some(code) = code.filter(|value| !value.trim().is_empty()) {
        parts.push(format!("code: {}", code));
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(" | ")
    }
}

pub type ProviderFuture = Pin<Box<dyn Future<Output = Result<ProviderResponse>> + Send>>;

pub trait Provider: Clone + Send + Sync {
    fn append_system_input(self, input: String) -> Self;
    fn append_user_input(self, input: String) -> Self;
    fn append_user_image(self, image: InlineImage) -> Self;
    fn register_tool(self, tool: ToolSpec) -> Self;
    fn call_tool(self, tool_name: &str) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Gemini(Gemini),
    Claude(Claude),
}

macro_rules! dispatch {
    ($self:ident, $provider:ident => $body:expr) => {
        match $self {
            ProviderImpl::OpenAI($provider) => ProviderImpl::OpenAI($body),
            ProviderImpl::Gemini($provider) => ProviderImpl::Gemini($body),
            ProviderImpl::Claude($provider) => ProviderImpl::Claude($body),
        }
    };
}

impl Provider for ProviderImpl {
    fn append_system_input(self, input: String) -> Self {
        dispatch!(self, provider => provider.append_system_input(input))
    }

    fn append_user_input(self, input: String) -> Self {
        dispatch!(self, provider => provider.append_user_input(input))
    }

    fn append_user_image(self, image: InlineImage) -> Self {
        dispatch!(self, provider => provider.append_user_image(image))
    }

    fn register_tool(self, tool: ToolSpec) -> Self {
        dispatch!(self, provider => provider.register_tool(tool))
    }

    fn call_tool(self, tool_name: &str) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.call_tool(tool_name),
            ProviderImpl::Gemini(provider) => provider.call_tool(tool_name),
            ProviderImpl::Claude(provider) => provider.call_tool(tool_name),
        }
    }
}

pub fn build_provider(selection: &ProviderSelection, key: String) -> ProviderImpl {
    let model = selection.requested_model.clone().unwrap_or_default();
    match selection.provider {
        ProviderKind::OpenAI => ProviderImpl::OpenAI(OpenAI::new(key).with_model(model)),
        ProviderKind::Gemini => ProviderImpl::Gemini(Gemini::new(key).with_model(model)),
        ProviderKind::Claude => ProviderImpl::Claude(Claude::new(key).with_model(model)),
    }
}

pub fn resolve_provider_selection(
    model_arg: Option<&str>,
    override_key: Option<&str>,
) -> Result<ProviderSelection> {
    match model_arg {
        Some(model) => parse_model_arg(model),
        None => default_provider_selection(override_key),
    }
}

pub fn resolve_key(provider: ProviderKind, override_key: Option<&str>) -> Result<String> {
    if let Some(key) = override_key {
        return Ok(key.to_string());
    }

    match provider {
        ProviderKind::OpenAI => get_env("OPENAI_API_KEY"),
        ProviderKind::Gemini => get_env("GEMINI_API_KEY").or_else(|| get_env("GOOGLE_API_KEY")),
        ProviderKind::Claude => get_env("ANTHROPIC_API_KEY"),
    }
    .ok_or_else(|| anyhow!("API key not found for provider {}", provider.as_str()))
}

/// Vision-capable Gemini is preferred; other providers are picked by which
/// key is present.
fn default_provider_selection(override_key: Option<&str>) -> Result<ProviderSelection> {
    let candidates: [(ProviderKind, &[&str]); 3] = [
        (ProviderKind::Gemini, &["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
        (ProviderKind::OpenAI, &["OPENAI_API_KEY"]),
        (ProviderKind::Claude, &["ANTHROPIC_API_KEY"]),
    ];
    for (provider, vars) in candidates {
        if vars.iter().any(|var| get_env(var).is_some()) {
            return Ok(ProviderSelection {
                provider,
                requested_model: None,
            });
        }
    }

    if override_key.is_some() {
        return Ok(ProviderSelection {
            provider: ProviderKind::Gemini,
            requested_model: None,
        });
    }

    Err(anyhow!(
        "no API keys found (checked GEMINI_API_KEY/GOOGLE_API_KEY, OPENAI_API_KEY, ANTHROPIC_API_KEY)"
    ))
}

fn parse_model_arg(model_arg: &str) -> Result<ProviderSelection> {
    let raw = model_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("model argument is empty"));
    }

    if let Some(provider) = provider_from_name(&raw.to_lowercase()) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider_part, model_part)) = raw.split_once(':')
        && let Some(provider) = provider_from_name(&provider_part.to_lowercase())
    {
        let model = model_part.trim();
        return Ok(ProviderSelection {
            provider,
            requested_model: (!model.is_empty()).then(|| model.to_string()),
        });
    }

    Err(anyhow!(
        "unable to infer provider from model '{}'. Use provider:model (gemini:, openai:, claude:)",
        raw
    ))
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" => Some(ProviderKind::OpenAI),
        "gemini" | "google" => Some(ProviderKind::Gemini),
        "claude" | "anthropic" => Some(ProviderKind::Claude),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provider_model_pairs() {
        let selection = resolve_provider_selection(Some("gemini:gemini-2.5-pro"), None).unwrap();
        assert_eq!(selection.provider, ProviderKind::Gemini);
        assert_eq!(selection.requested_model.as_deref(), Some("gemini-2.5-pro"));

        let selection = resolve_provider_selection(Some("Anthropic"), None).unwrap();
        assert_eq!(selection.provider, ProviderKind::Claude);
        assert_eq!(selection.requested_model, None);

        let selection = resolve_provider_selection(Some("openai:"), None).unwrap();
        assert_eq!(selection.requested_model, None);

        assert!(resolve_provider_selection(Some("llama-3"), None).is_err());
        assert!(resolve_provider_selection(Some("  "), None).is_err());
    }

    #[test]
    fn override_key_wins() {
        let key = resolve_key(ProviderKind::Claude, Some("sk-test")).unwrap();
        assert_eq!(key, "sk-test");
    }

    #[test]
    fn system_text_skips_user_messages() {
        let messages = vec![
            Message::system("one".to_string()),
            Message::user("ignored".to_string()),
            Message::system("two".to_string()),
        ];
        assert_eq!(system_text(&messages), "one\n\ntwo");
        assert_eq!(user_messages(&messages).count(), 1);
    }

    #[test]
    fn error_parts_are_joined() {
        assert_eq!(
            format_error_parts(
                Some("bad key".to_string()),
                Some("invalid_request_error".to_string()),
                None
            ),
            "bad key | type: invalid_request_error"
        );
        assert_eq!(format_error_parts(None, None, None), "unknown error");
    }
}
