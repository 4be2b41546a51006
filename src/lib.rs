use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::info;

pub mod analysis;
pub mod data;
pub mod error;
pub mod languages;
pub mod layout;
pub mod logging;
pub mod preview;
mod providers;
pub mod scheduler;
pub mod settings;
pub mod task;
#[cfg(test)]
mod test_util;

pub use analysis::{AnalysisClient, ProviderAnalysisClient};
pub use layout::{LayoutHints, PageSize};
pub use preview::{CommandRasterizer, PreviewRenderer};
pub use providers::{
    Claude, Gemini, InlineImage, OpenAI, Provider, ProviderKind, ProviderUsage, ToolSpec,
};
pub use scheduler::{PipelineOptions, Scheduler, SchedulerHandle};
pub use task::{Task, TaskEvent, TaskId, TaskStatus, TaskStore, TaskSummary, TranslatedBlock};

#[derive(Debug, Clone)]
pub struct Config {
    pub files: Vec<PathBuf>,
    pub lang: String,
    pub model: Option<String>,
    pub key: Option<String>,
    pub settings_path: Option<String>,
    pub zoom: f32,
    pub json: bool,
    pub show_progress: bool,
    pub timeout_secs: Option<u64>,
    pub block_delay_ms: Option<u64>,
}

/// Rendered batch output plus the number of tasks that failed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: String,
    pub failed: usize,
}

pub async fn run(config: Config) -> Result<RunReport> {
    if config.files.is_empty() {
        return Err(anyhow!("no input files"));
    }
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    if let Some(secs) = config.timeout_secs {
        settings.analysis_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = config.block_delay_ms {
        settings.block_delay = Duration::from_millis(ms);
    }

    let registry = languages::LanguageRegistry::load()?;
    if !registry.is_valid_code(&config.lang) {
        return Err(anyhow!(
            "unsupported target language code '{}'",
            config.lang
        ));
    }

    let model_arg = config.model.as_deref().or(settings.model.as_deref());
    let selection = providers::resolve_provider_selection(model_arg, config.key.as_deref())?;
    let key = providers::resolve_key(selection.provider, config.key.as_deref())
        .with_context(|| "no API key found for selected provider")?;
    info!("using provider {}", selection.provider.as_str());
    let provider = providers::build_provider(&selection, key);

    let store = TaskStore::new(settings.event_capacity);
    let handle = Scheduler::new(
        store.clone(),
        Arc::new(ProviderAnalysisClient::new(provider)),
        Arc::new(CommandRasterizer::new(settings.pdf_scale, settings.jpeg_quality)),
        registry,
        PipelineOptions::from_settings(&settings),
    )
    .spawn();

    let mut events = store.subscribe();
    let files = config
        .files
        .iter()
        .map(task::SourceFile::from_path)
        .collect::<Vec<_>>();
    let ids = store.create_tasks(files, &config.lang);

    while !store.is_idle() {
        match events.recv().await {
            Ok(event) => report_progress(&event, config.show_progress),
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
    loop {
        match events.try_recv() {
            Ok(event) => report_progress(&event, config.show_progress),
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    handle.shutdown().await;

    let tasks = ids
        .iter()
        .filter_map(|id| store.get_task(*id))
        .collect::<Vec<_>>();
    let failed = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .count();
    let output = if config.json {
        format_json(&tasks, config.zoom, settings.page)?
    } else {
        format_text(&tasks, config.zoom, settings.page)
    };
    Ok(RunReport { output, failed })
}

fn report_progress(event: &TaskEvent, show: bool) {
    if !show {
        return;
    }
    if let TaskEvent::Updated(summary) = event {
        eprintln!(
            "[{}] {:>3}% {}",
            summary.name, summary.progress, summary.detailed_status
        );
    }
}

#[derive(Debug, Serialize)]
struct TaskReport<'a> {
    id: TaskId,
    name: &'a str,
    status: TaskStatus,
    detailed_status: &'a str,
    progress: u8,
    target_language: &'a str,
    warnings: &'a [String],
    blocks: Vec<BlockReport<'a>>,
}

#[derive(Debug, Serialize)]
struct BlockReport<'a> {
    #[serde(flatten)]
    block: &'a TranslatedBlock,
    layout: LayoutHints,
}

fn task_report(task: &Task, zoom: f32, page: PageSize) -> TaskReport<'_> {
    TaskReport {
        id: task.id,
        name: &task.name,
        status: task.status,
        detailed_status: &task.detailed_status,
        progress: task.progress,
        target_language: &task.target_language,
        warnings: &task.warnings,
        blocks: layout::render_order(&task.translated_blocks)
            .into_iter()
            .map(|block| BlockReport {
                block,
                layout: layout::block_layout(block, zoom, page),
            })
            .collect(),
    }
}

fn format_json(tasks: &[Task], zoom: f32, page: PageSize) -> Result<String> {
    let reports = tasks
        .iter()
        .map(|task| task_report(task, zoom, page))
        .collect::<Vec<_>>();
    serde_json::to_string_pretty(&reports).with_context(|| "failed to serialize results")
}

fn format_text(tasks: &[Task], zoom: f32, page: PageSize) -> String {
    let mut out = Vec::new();
    for task in tasks {
        out.push(format!(
            "== {} [{}] {} blocks",
            task.name,
            task.status.as_str(),
            task.translated_blocks.len()
        ));
        for warning in &task.warnings {
            out.push(format!("warning: {}", warning));
        }
        // Reading order, not paint order.
        for block in &task.translated_blocks {
            let hints = layout::block_layout(block, zoom, page);
            let mut tags = vec![format!("{:.0}px", hints.font_size_px)];
            if hints.is_header_layout {
                tags.push("header".to_string());
            }
            if hints.is_table_layout {
                tags.push("cell".to_string());
            }
            if hints.bold {
                tags.push("bold".to_string());
            }
            out.push(format!(
                "[{}] {} => {}",
                tags.join(" "),
                block.original_text.trim(),
                block.translated_text.trim()
            ));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{BlockKind, BoundingBox, SourceFile};
    use uuid::Uuid;

    fn finished_task() -> Task {
        let store = TaskStore::default();
        let id = store.create_tasks(vec![SourceFile::from_path("/tmp/memo.png")], "de")[0];
        let mut task = store.get_task(id).unwrap();
        task.status = TaskStatus::Completed;
        task.progress = 100;
        for (text, bbox, kind) in [
            ("Body text that runs long", [20.0, 5.0, 40.0, 95.0], BlockKind::Text),
            ("Title", [5.0, 5.0, 10.0, 95.0], BlockKind::Heading),
        ] {
            task.translated_blocks.push(TranslatedBlock {
                id: Uuid::new_v4(),
                page_index: 0,
                original_text: text.to_string(),
                translated_text: format!("{} (de)", text),
                bbox: BoundingBox::from_ymin_xmin(bbox).unwrap(),
                is_bold: None,
                kind,
            });
        }
        task
    }

    #[test]
    fn json_output_paints_largest_first_with_hints() {
        let output = format_json(&[finished_task()], 1.0, PageSize::A4).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        let blocks = value[0]["blocks"].as_array().unwrap();
        assert_eq!(value[0]["status"], "completed");
        assert_eq!(blocks[0]["original_text"], "Body text that runs long");
        assert_eq!(blocks[1]["type"], "heading");
        assert_eq!(blocks[1]["layout"]["is_header_layout"], true);
        assert_eq!(blocks[1]["layout"]["bold"], true);
        assert!(blocks[0]["box"]["top"].is_number());
    }

    #[test]
    fn text_output_keeps_reading_order() {
        let output = format_text(&[finished_task()], 1.0, PageSize::A4);
        let lines = output.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "== memo.png [completed] 2 blocks");
        assert!(lines[1].ends_with("Body text that runs long => Body text that runs long (de)"));
        assert!(lines[2].contains("header"));
    }

    #[tokio::test]
    async fn run_rejects_empty_input() {
        let config = Config {
            files: Vec::new(),
            lang: "en".to_string(),
            model: None,
            key: None,
            settings_path: None,
            zoom: 1.0,
            json: false,
            show_progress: false,
            timeout_secs: None,
            block_delay_ms: None,
        };
        let err = run(config).await.unwrap_err();
        assert_eq!(err.to_string(), "no input files");
    }
}
