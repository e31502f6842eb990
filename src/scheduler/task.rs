use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Producer-supplied discriminator on task messages.
pub const ACTION_ADD_TASK: &str = "ADD_TASK";
/// Worker-supplied discriminator on completion messages.
pub const ACTION_COMPLETE_TASK: &str = "COMPLETE_TASK";

/// Scheduling metadata carried on every task message.
///
/// Fields the scheduler does not interpret (retry policy, producer payload)
/// are carried through untouched and handed back to persistence and the
/// executing worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub max_retry: u32,
    /// Dispatch delay in minutes; 0 means dispatch immediately.
    #[serde(default)]
    pub delay: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A work request flowing through the scheduler.
///
/// `id` is empty on ingress and assigned by persistence before the task is
/// ever delayed or dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    pub meta: TaskMeta,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Task {
    pub fn with_id(id: String, meta: TaskMeta) -> Self {
        Self {
            id,
            meta,
            payload: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteMeta {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub server_id: String,
}

/// Worker-origin notification that a dispatched task finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTask {
    pub id: String,
    pub meta: CompleteMeta,
}

/// Fleet membership event; `status == 1` means join, anything else leave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinEvent {
    pub server_id: String,
    pub status: i32,
}

impl JoinEvent {
    pub fn is_join(&self) -> bool {
        self.status == 1
    }
}

/// One row of the task-weight catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskWeight {
    #[serde(rename = "type")]
    pub task_type: String,
    pub weight: i64,
}

/// A fleet row as persisted; extra columns are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMember {
    pub server_id: String,
}

/// A persisted task still awaiting dispatch, as returned on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: String,
    pub meta: TaskMeta,
}

/// The scheduler-to-worker message instructing execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatch {
    pub task_id: String,
    pub server_id: String,
}
