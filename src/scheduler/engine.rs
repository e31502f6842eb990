use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::BusProducer;
use crate::scheduler::catalog::TaskCatalog;
use crate::scheduler::registry::WorkerRegistry;
use crate::scheduler::task::Task;

/// Places tasks on the least-loaded eligible worker.
///
/// Placement is greedy: the worker minimizing `load + weight` wins, which
/// approximates makespan-minimal placement and keeps the decision O(n) in
/// fleet size. The weight is reserved on the worker *before* the dispatch
/// message goes out; a failed publish keeps the reservation, and completion
/// events reconcile the accounting.
pub struct AssignmentEngine {
    catalog: Arc<TaskCatalog>,
    registry: Arc<Mutex<WorkerRegistry>>,
    producer: Arc<dyn BusProducer>,
}

impl AssignmentEngine {
    pub fn new(
        catalog: Arc<TaskCatalog>,
        registry: Arc<Mutex<WorkerRegistry>>,
        producer: Arc<dyn BusProducer>,
    ) -> Self {
        Self {
            catalog,
            registry,
            producer,
        }
    }

    /// Assign a persisted task to a worker and publish the dispatch.
    ///
    /// Tasks with no catalog entry and tasks arriving while the fleet is
    /// empty are not dispatched; they stay pending in persistence and are
    /// picked up again on the next restart.
    pub async fn assign(&self, task: &Task, task_id: &str) {
        let Some(weight) = self.catalog.weight(&task.meta.task_type) else {
            tracing::warn!(
                task_id,
                task_type = %task.meta.task_type,
                "No catalog entry for task type, not dispatching"
            );
            return;
        };

        let target = self.registry.lock().await.select_and_reserve(weight);
        let Some(server_id) = target else {
            tracing::warn!(task_id, "No workers available, task stays pending");
            return;
        };

        tracing::info!(task_id, server_id = %server_id, weight, "Task assigned");

        if let Err(e) = self.producer.send_dispatch(task_id, &server_id).await {
            // The reservation is intentionally kept; see module docs.
            tracing::error!(
                task_id,
                server_id = %server_id,
                error = %e,
                "Dispatch publish failed"
            );
        }
    }
}
