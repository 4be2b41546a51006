use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisClient, AnalysisRequest, RawBlock};
use crate::error::{StoreError, TaskError};
use crate::languages::LanguageRegistry;
use crate::preview::PreviewRenderer;
use crate::settings::Settings;
use crate::task::{
    BlockKind, BoundingBox, Task, TaskEvent, TaskId, TaskPatch, TaskStatus, TaskStore,
    TranslatedBlock,
};

const PROGRESS_PREVIEW_READY: u8 = 15;
const PROGRESS_STREAMING: u8 = 30;
const PROGRESS_STREAM_SPAN: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineOptions {
    pub analysis_timeout: Duration,
    pub block_delay: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            analysis_timeout: Duration::from_secs(120),
            block_delay: Duration::ZERO,
        }
    }
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            analysis_timeout: settings.analysis_timeout,
            block_delay: settings.block_delay,
        }
    }
}

/// Drains queued tasks one at a time through preview, analysis and streaming.
pub struct Scheduler {
    store: TaskStore,
    client: Arc<dyn AnalysisClient>,
    renderer: Arc<dyn PreviewRenderer>,
    languages: LanguageRegistry,
    options: PipelineOptions,
}

impl Scheduler {
    pub fn new(
        store: TaskStore,
        client: Arc<dyn AnalysisClient>,
        renderer: Arc<dyn PreviewRenderer>,
        languages: LanguageRegistry,
        options: PipelineOptions,
    ) -> Self {
        Self {
            store,
            client,
            renderer,
            languages,
            options,
        }
    }

    /// Starts the driver on the current tokio runtime.
    pub fn spawn(self) -> SchedulerHandle {
        let events = self.store.subscribe();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let store = self.store.clone();
        let driver = tokio::spawn(Driver::new(self).run(events, shutdown_rx));
        SchedulerHandle {
            store,
            shutdown: Some(shutdown_tx),
            driver,
        }
    }
}

pub struct SchedulerHandle {
    store: TaskStore,
    shutdown: Option<oneshot::Sender<()>>,
    driver: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Resolves once no task is queued or in flight. Never resolves after
    /// `shutdown` while queued tasks remain.
    pub async fn wait_idle(&self) {
        let mut events = self.store.subscribe();
        loop {
            if self.store.is_idle() {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Stops the driver and aborts the in-flight job, if any.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(err) = (&mut self.driver).await
            && err.is_panic()
        {
            error!("scheduler driver panicked");
        }
    }
}

struct Driver {
    pipeline: Arc<Pipeline>,
    active: Option<(TaskId, AbortHandle)>,
}

struct Pipeline {
    store: TaskStore,
    client: Arc<dyn AnalysisClient>,
    renderer: Arc<dyn PreviewRenderer>,
    languages: LanguageRegistry,
    options: PipelineOptions,
}

impl Driver {
    fn new(scheduler: Scheduler) -> Self {
        Self {
            pipeline: Arc::new(Pipeline {
                store: scheduler.store,
                client: scheduler.client,
                renderer: scheduler.renderer,
                languages: scheduler.languages,
                options: scheduler.options,
            }),
            active: None,
        }
    }

    async fn run(
        mut self,
        mut events: broadcast::Receiver<TaskEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        self.dispatch();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(TaskEvent::Removed(id)) => self.cancel_if_active(id),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("scheduler lagged behind {} task events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            self.dispatch();
        }
        if let Some((id, job)) = self.active.take() {
            debug!("aborting task {} on shutdown", id);
            job.abort();
        }
    }

    fn cancel_if_active(&mut self, id: TaskId) {
        if let Some((active_id, job)) = self.active.take() {
            if active_id == id {
                info!("task {} removed while in flight; aborting", id);
                job.abort();
            } else {
                self.active = Some((active_id, job));
            }
        }
    }

    /// Aborts the tracked job once its task is no longer active in the store.
    /// Covers `Removed` events lost to a lagging receiver.
    fn reap_stale_job(&mut self) {
        let Some(&(id, _)) = self.active.as_ref() else {
            return;
        };
        if self.pipeline.store.active_task() == Some(id) {
            return;
        }
        if let Some((id, job)) = self.active.take() {
            if !job.is_finished() {
                info!("task {} no longer active; aborting its job", id);
            }
            job.abort();
        }
    }

    /// Claims at most one task; the store refuses while another is active.
    fn dispatch(&mut self) {
        self.reap_stale_job();
        let Some(task) = self.pipeline.store.claim_next_queued() else {
            return;
        };
        info!("starting task {} ({})", task.id, task.name);
        let id = task.id;
        let job = tokio::spawn(Arc::clone(&self.pipeline).run_task(task));
        self.active = Some((id, job.abort_handle()));
        tokio::spawn(supervise(self.pipeline.store.clone(), id, job));
    }
}

/// Marks the task Failed if its job panicked so the admission slot frees up.
async fn supervise(store: TaskStore, id: TaskId, job: JoinHandle<()>) {
    match job.await {
        Err(err) if err.is_panic() => {
            error!("task {} pipeline panicked", id);
            if let Err(err) = store.fail_task(id, "Processing crashed unexpectedly".to_string()) {
                debug!("could not mark crashed task {}: {}", id, err);
            }
        }
        Err(_) => debug!("task {} job cancelled", id),
        Ok(()) => {}
    }
}

#[derive(Debug, Error)]
enum JobError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Pipeline {
    async fn run_task(self: Arc<Self>, task: Task) {
        let id = task.id;
        match self.process(&task).await {
            Ok(count) => info!("task {} completed with {} blocks", id, count),
            Err(JobError::Task(err)) => {
                warn!("task {} failed ({}): {}", id, err.kind(), err);
                match self.store.fail_task(id, err.warning()) {
                    Ok(_) => {}
                    Err(StoreError::NotFound(_)) => debug!("task {} removed before failure", id),
                    Err(err) => warn!("could not mark task {} failed: {}", id, err),
                }
            }
            Err(JobError::Store(StoreError::NotFound(_))) => {
                debug!("task {} removed; dropping late result", id);
            }
            Err(JobError::Store(err)) => warn!("task {} stopped: {}", id, err),
        }
    }

    async fn process(&self, task: &Task) -> Result<usize, JobError> {
        let id = task.id;
        let preview = self
            .renderer
            .render(&task.source)
            .await
            .map_err(|err| TaskError::Read(format!("{:#}", err)))?;
        let request = AnalysisRequest {
            image_base64: BASE64.encode(preview.bytes.as_slice()),
            mime: preview.mime.clone(),
            target_language: self.languages.label(&task.target_language),
        };
        self.store.update_task(
            id,
            TaskPatch::default()
                .detail("Analyzing page layout and text")
                .progress(PROGRESS_PREVIEW_READY)
                .total_pages(1)
                .preview(preview),
        )?;

        let timeout = self.options.analysis_timeout;
        let response = tokio::time::timeout(timeout, self.client.analyze(request))
            .await
            .map_err(|_| TaskError::Timeout(timeout))?
            .map_err(TaskError::from)?;
        let raw_blocks = response.blocks.ok_or(TaskError::MalformedResponse)?;
        let blocks = translated_blocks(raw_blocks);
        let total = blocks.len();

        self.store.update_task(
            id,
            TaskPatch::default()
                .status(TaskStatus::Streaming)
                .detail(format!("Rendering {} blocks", total))
                .progress(PROGRESS_STREAMING),
        )?;
        for (index, block) in blocks.into_iter().enumerate() {
            if index > 0 && !self.options.block_delay.is_zero() {
                tokio::time::sleep(self.options.block_delay).await;
            }
            let done = index + 1;
            debug!("task {} block {}/{}", id, done, total);
            self.store.append_block(
                id,
                block,
                streaming_progress(done, total),
                format!("Rendering block {} of {}", done, total),
            )?;
        }

        self.store.update_task(
            id,
            TaskPatch::default()
                .status(TaskStatus::Completed)
                .detail("Translation complete")
                .progress(100)
                .processed_pages(1),
        )?;
        Ok(total)
    }
}

/// `30 + floor(60 * done / total)`.
fn streaming_progress(done: usize, total: usize) -> u8 {
    if total == 0 {
        return PROGRESS_STREAMING + PROGRESS_STREAM_SPAN as u8;
    }
    let step = PROGRESS_STREAM_SPAN * done.min(total) / total;
    PROGRESS_STREAMING + step as u8
}

/// Converts service blocks in order, skipping any whose box collapses.
fn translated_blocks(raw: Vec<RawBlock>) -> Vec<TranslatedBlock> {
    raw.into_iter()
        .enumerate()
        .filter_map(|(index, block)| {
            let Some(bbox) = BoundingBox::from_ymin_xmin(block.bbox) else {
                warn!("skipping block #{} with unusable box {:?}", index, block.bbox);
                return None;
            };
            Some(TranslatedBlock {
                id: Uuid::new_v4(),
                page_index: 0,
                original_text: block.text,
                translated_text: block.translated_text,
                bbox,
                is_bold: block.is_bold,
                kind: BlockKind::parse(block.kind.as_deref()),
            })
        })
        .collect()
}
