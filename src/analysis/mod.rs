use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use tera::{Context as TeraContext, Tera};
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::providers::{InlineImage, Provider, ProviderResponse, ToolSpec};

pub const TOOL_NAME: &str = "deliver_page_blocks";

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.tera");
const BLOCK_TYPES: [&str; 3] = ["text", "heading", "table_cell"];
const USER_INSTRUCTION: &str = "Analyze this page and return its text blocks.";

/// One page sent to the analysis service.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub image_base64: String,
    pub mime: String,
    /// Human label such as "Japanese", not the ISO code.
    pub target_language: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResponse {
    /// `None` when the service answered without a block list at all.
    pub blocks: Option<Vec<RawBlock>>,
}

/// A block as the service reports it, before validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBlock {
    #[serde(default)]
    pub text: String,
    #[serde(default, alias = "translated_text")]
    pub translated_text: String,
    /// `[ymin, xmin, ymax, xmax]` in percent of the page.
    #[serde(rename = "box", alias = "bbox")]
    pub bbox: [f32; 4],
    #[serde(default, alias = "is_bold")]
    pub is_bold: Option<bool>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl AnalysisResponse {
    /// Reads the tool arguments. A missing or null `blocks` field yields
    /// `blocks: None`; entries that do not parse are dropped.
    pub fn from_tool_args(args: &Value) -> Self {
        let Some(entries) = args.get("blocks").and_then(Value::as_array) else {
            return Self { blocks: None };
        };
        let blocks = entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                match serde_json::from_value::<RawBlock>(entry.clone()) {
                    Ok(block) => Some(block),
                    Err(err) => {
                        warn!("dropping unreadable block #{}: {}", index, err);
                        None
                    }
                }
            })
            .collect();
        Self {
            blocks: Some(blocks),
        }
    }
}

pub type AnalysisFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AnalysisResponse, ServiceError>> + Send + 'a>>;

/// The OCR + translation boundary used by the scheduler.
pub trait AnalysisClient: Send + Sync {
    fn analyze(&self, request: AnalysisRequest) -> AnalysisFuture<'_>;
}

pub fn tool_spec(tool_name: &str) -> ToolSpec {
    let block = json!({
        "type": "object",
        "properties": {
            "text": {"type": "string", "description": "Original text exactly as printed."},
            "translatedText": {"type": "string", "description": "Translation of the text."},
            "box": {
                "type": "array",
                "items": {"type": "number"},
                "description": "[ymin, xmin, ymax, xmax] as percentages (0-100) of the page."
            },
            "isBold": {"type": "boolean"},
            "type": {"type": "string", "enum": BLOCK_TYPES}
        },
        "required": ["text", "translatedText", "box", "type"]
    });

    ToolSpec {
        name: tool_name.to_string(),
        description: "Return every text block on the page with its translation and position."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "blocks": {"type": "array", "items": block}
            },
            "required": ["blocks"]
        }),
    }
}

pub fn render_system_prompt(target_language: &str, tool_name: &str) -> Result<String> {
    let mut context = TeraContext::new();
    context.insert("target_language", target_language);
    context.insert("tool_name", tool_name);
    context.insert("block_types", &BLOCK_TYPES);
    Tera::one_off(SYSTEM_PROMPT_TEMPLATE, &context, false)
        .with_context(|| "failed to render system prompt")
}

/// Analysis client backed by an LLM provider tool call.
#[derive(Debug, Clone)]
pub struct ProviderAnalysisClient<P> {
    provider: P,
}

impl<P: Provider + 'static> ProviderAnalysisClient<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

impl<P: Provider + 'static> AnalysisClient for ProviderAnalysisClient<P> {
    fn analyze(&self, request: AnalysisRequest) -> AnalysisFuture<'_> {
        Box::pin(async move {
            let prompt = render_system_prompt(&request.target_language, TOOL_NAME)?;
            let response = self
                .provider
                .clone()
                .append_system_input(prompt)
                .append_user_image(InlineImage {
                    mime: request.mime,
                    base64: request.image_base64,
                })
                .append_user_input(USER_INSTRUCTION.to_string())
                .register_tool(tool_spec(TOOL_NAME))
                .call_tool(TOOL_NAME)
                .await?;
            debug!("analysis answered by {}", answer_summary(&response));
            Ok(AnalysisResponse::from_tool_args(&response.args))
        })
    }
}

fn answer_summary(response: &ProviderResponse) -> String {
    let model = response.model.as_deref().unwrap_or("unknown model");
    let Some(usage) = &response.usage else {
        return model.to_string();
    };
    let count = |tokens: Option<u64>| tokens.map_or_else(|| "?".to_string(), |n| n.to_string());
    format!(
        "{} (tokens: {} prompt, {} completion, {} total)",
        model,
        count(usage.prompt_tokens),
        count(usage.completion_tokens),
        count(usage.total_tokens)
    )
}
