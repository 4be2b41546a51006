use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{
    SourceFile, Task, TaskId, TaskPatch, TaskStatus, TaskSummary, TranslatedBlock,
};
use crate::error::StoreError;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Created(TaskSummary),
    Updated(TaskSummary),
    Removed(TaskId),
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Created(summary) | TaskEvent::Updated(summary) => summary.id,
            TaskEvent::Removed(id) => *id,
        }
    }
}

/// Ordered, shared task collection.
///
/// Every mutation takes the write lock once and publishes its event while the
/// lock is held, so subscribers see events in mutation order and readers never
/// observe half-applied patches.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks: Arc<RwLock<Vec<Task>>>,
    events: broadcast::Sender<TaskEvent>,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl TaskStore {
    pub fn new(event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn create_tasks(&self, files: Vec<SourceFile>, target_language: &str) -> Vec<TaskId> {
        let mut tasks = self.tasks.write();
        files
            .into_iter()
            .map(|file| {
                let task = Task::new(file, target_language);
                let id = task.id;
                self.publish(TaskEvent::Created(task.summary()));
                tasks.push(task);
                id
            })
            .collect()
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.read().iter().find(|task| task.id == id).cloned()
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().clone()
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks.read().iter().map(Task::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    pub fn active_task(&self) -> Option<TaskId> {
        self.tasks
            .read()
            .iter()
            .find(|task| task.status.is_active())
            .map(|task| task.id)
    }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks
            .read()
            .iter()
            .all(|task| task.status.is_terminal())
    }

    pub fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<TaskSummary, StoreError> {
        self.mutate(id, |task| task.apply(patch))
    }

    pub fn append_block(
        &self,
        id: TaskId,
        block: TranslatedBlock,
        progress: u8,
        detailed_status: String,
    ) -> Result<TaskSummary, StoreError> {
        self.mutate(id, |task| {
            if task.status != TaskStatus::Streaming {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: task.status,
                    to: TaskStatus::Streaming,
                });
            }
            task.translated_blocks.push(block);
            task.apply(TaskPatch::default().progress(progress).detail(detailed_status))
        })
    }

    /// Moves an in-flight task to Failed with exactly one warning.
    pub fn fail_task(&self, id: TaskId, warning: String) -> Result<TaskSummary, StoreError> {
        self.mutate(id, |task| {
            task.apply(
                TaskPatch::default()
                    .status(TaskStatus::Failed)
                    .detail(format!("Failed: {}", warning)),
            )?;
            task.warnings.push(warning);
            Ok(())
        })
    }

    pub fn remove_task(&self, id: TaskId) -> Option<Task> {
        let mut tasks = self.tasks.write();
        let index = tasks.iter().position(|task| task.id == id)?;
        let removed = tasks.remove(index);
        self.publish(TaskEvent::Removed(id));
        Some(removed)
    }

    /// Admission control: claims the oldest queued task only while no other
    /// task is Analyzing or Streaming.
    pub fn claim_next_queued(&self) -> Option<Task> {
        let mut tasks = self.tasks.write();
        if tasks.iter().any(|task| task.status.is_active()) {
            return None;
        }
        let task = tasks
            .iter_mut()
            .find(|task| task.status == TaskStatus::Queued)?;
        task.apply(
            TaskPatch::default()
                .status(TaskStatus::Analyzing)
                .detail("Starting analysis")
                .progress(5),
        )
        .ok()?;
        self.publish(TaskEvent::Updated(task.summary()));
        Some(task.clone())
    }

    fn mutate<F>(&self, id: TaskId, apply: F) -> Result<TaskSummary, StoreError>
    where
        F: FnOnce(&mut Task) -> Result<(), StoreError>,
    {
        let mut tasks = self.tasks.write();
        let task = tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(StoreError::NotFound(id))?;
        apply(task)?;
        let summary = task.summary();
        self.publish(TaskEvent::Updated(summary.clone()));
        Ok(summary)
    }
}
