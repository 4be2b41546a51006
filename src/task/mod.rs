use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;

mod store;

pub use store::{DEFAULT_EVENT_CAPACITY, TaskEvent, TaskStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Analyzing,
    Streaming,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Streaming => "streaming",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Holds the admission slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Analyzing | TaskStatus::Streaming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (from, to) if *from == to => !from.is_terminal(),
            (Queued, Analyzing) => true,
            (Analyzing, Streaming) | (Analyzing, Failed) => true,
            (Streaming, Completed) | (Streaming, Failed) => true,
            _ => false,
        }
    }
}

/// A document handed to the pipeline. Bytes are read lazily by the preview renderer.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
}

impl SourceFile {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(|value| value.to_string())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, name }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PagePreview {
    #[serde(skip)]
    pub bytes: Arc<Vec<u8>>,
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl PagePreview {
    pub fn new(bytes: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            bytes: Arc::new(bytes),
            mime: mime.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Text,
    Heading,
    TableCell,
}

impl BlockKind {
    /// Lenient mapping of the service's type tag; anything unknown is plain text.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|raw| raw.trim().to_lowercase()).as_deref() {
            Some("heading" | "header" | "title") => BlockKind::Heading,
            Some("table_cell" | "table-cell" | "tablecell" | "cell") => BlockKind::TableCell,
            _ => BlockKind::Text,
        }
    }
}

/// Percent-of-page box, `0 <= top < bottom <= 100` and `0 <= left < right <= 100`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
}

impl BoundingBox {
    /// Builds a box from the service's `[ymin, xmin, ymax, xmax]`.
    ///
    /// Coordinates are clamped into the page and swapped when inverted. Boxes
    /// that collapse to zero width or height are rejected.
    pub fn from_ymin_xmin(raw: [f32; 4]) -> Option<Self> {
        if raw.iter().any(|value| !value.is_finite()) {
            return None;
        }
        let [y1, x1, y2, x2] = raw.map(|value| value.clamp(0.0, 100.0));
        let (top, bottom) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        let (left, right) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        if bottom - top <= f32::EPSILON || right - left <= f32::EPSILON {
            return None;
        }
        Some(Self {
            top,
            left,
            bottom,
            right,
        })
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranslatedBlock {
    pub id: Uuid,
    pub page_index: u32,
    pub original_text: String,
    pub translated_text: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_bold: Option<bool>,
    #[serde(rename = "type")]
    pub kind: BlockKind,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub source: SourceFile,
    pub name: String,
    pub preview: Option<PagePreview>,
    pub status: TaskStatus,
    pub detailed_status: String,
    pub progress: u8,
    pub total_pages: u32,
    pub processed_pages: u32,
    pub warnings: Vec<String>,
    pub translated_blocks: Vec<TranslatedBlock>,
    pub target_language: String,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub detailed_status: Option<String>,
    pub progress: Option<u8>,
    pub total_pages: Option<u32>,
    pub processed_pages: Option<u32>,
    pub preview: Option<PagePreview>,
}

impl TaskPatch {
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn detail(mut self, detailed_status: impl Into<String>) -> Self {
        self.detailed_status = Some(detailed_status.into());
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn total_pages(mut self, pages: u32) -> Self {
        self.total_pages = Some(pages);
        self
    }

    pub fn processed_pages(mut self, pages: u32) -> Self {
        self.processed_pages = Some(pages);
        self
    }

    pub fn preview(mut self, preview: PagePreview) -> Self {
        self.preview = Some(preview);
        self
    }
}

/// Lightweight projection carried by store events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub detailed_status: String,
    pub progress: u8,
    pub block_count: usize,
    pub warnings: Vec<String>,
}

impl Task {
    pub(crate) fn new(source: SourceFile, target_language: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: source.name.clone(),
            source,
            preview: None,
            status: TaskStatus::Queued,
            detailed_status: "Waiting in queue".to_string(),
            progress: 0,
            total_pages: 0,
            processed_pages: 0,
            warnings: Vec::new(),
            translated_blocks: Vec::new(),
            target_language: target_language.to_string(),
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id,
            name: self.name.clone(),
            status: self.status,
            detailed_status: self.detailed_status.clone(),
            progress: self.progress,
            block_count: self.translated_blocks.len(),
            warnings: self.warnings.clone(),
        }
    }

    fn ensure_transition(&self, next: TaskStatus) -> Result<(), StoreError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            })
        }
    }

    /// Validates the transition before touching any field, so a rejected patch
    /// leaves the task unchanged.
    fn apply(&mut self, patch: TaskPatch) -> Result<(), StoreError> {
        let next = patch.status.unwrap_or(self.status);
        self.ensure_transition(next)?;
        self.status = next;
        if let Some(detail) = patch.detailed_status {
            self.detailed_status = detail;
        }
        if let Some(progress) = patch.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(total) = patch.total_pages {
            self.total_pages = total;
        }
        if let Some(processed) = patch.processed_pages {
            self.processed_pages = processed;
        }
        if let Some(preview) = patch.preview {
            self.preview = Some(preview);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_order_is_strict() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Completed));
        assert!(Analyzing.can_transition_to(Failed));
        assert!(Streaming.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Streaming));
        assert!(!Analyzing.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Queued));
    }

    #[test]
    fn box_is_normalized_from_service_order() {
        let bbox = BoundingBox::from_ymin_xmin([40.0, 80.0, 10.0, 120.0]).unwrap();
        assert_eq!(bbox.top, 10.0);
        assert_eq!(bbox.bottom, 40.0);
        assert_eq!(bbox.left, 80.0);
        assert_eq!(bbox.right, 100.0);
        assert!(BoundingBox::from_ymin_xmin([5.0, 5.0, 5.0, 20.0]).is_none());
        assert!(BoundingBox::from_ymin_xmin([f32::NAN, 0.0, 1.0, 1.0]).is_none());
    }

    #[test]
    fn block_kind_parsing_is_lenient() {
        assert_eq!(BlockKind::parse(Some("table_cell")), BlockKind::TableCell);
        assert_eq!(BlockKind::parse(Some(" Heading ")), BlockKind::Heading);
        assert_eq!(BlockKind::parse(Some("caption")), BlockKind::Text);
        assert_eq!(BlockKind::parse(None), BlockKind::Text);
    }

    #[test]
    fn patch_keeps_progress_monotonic() {
        let mut task = Task::new(SourceFile::from_path("scan.png"), "en");
        task.status = TaskStatus::Analyzing;
        task.apply(TaskPatch::default().progress(40)).unwrap();
        task.apply(TaskPatch::default().progress(20).detail("still going"))
            .unwrap();
        assert_eq!(task.progress, 40);
        assert_eq!(task.detailed_status, "still going");
    }

    #[test]
    fn terminal_tasks_reject_patches() {
        let mut task = Task::new(SourceFile::from_path("scan.png"), "en");
        task.status = TaskStatus::Completed;
        let err = task.apply(TaskPatch::default().progress(100)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }
}
