use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::bus::{BusConsumer, BusProducer};
use crate::config::SchedulerConfig;
use crate::error::{DispatchError, Result};
use crate::persist::PersistenceClient;
use crate::scheduler::catalog::TaskCatalog;
use crate::scheduler::delay::{release_at, DelayQueue};
use crate::scheduler::engine::AssignmentEngine;
use crate::scheduler::registry::WorkerRegistry;
use crate::scheduler::task::{
    CompleteTask, FleetMember, JoinEvent, PendingTask, Task, ACTION_ADD_TASK, ACTION_COMPLETE_TASK,
};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const CHANNEL_CAPACITY: usize = 64;

/// Orchestrates the scheduling core: funnels the four ingress streams (new
/// tasks, completions, membership, delay ticks) into one consistent state,
/// runs recovery, and exposes the embedding surface (`start`, `add_task`).
///
/// All mutable state lives in the worker registry and the delay queue, each
/// behind its own mutex. Assignments run on a small pool of workers fed by
/// an mpsc queue, so a burst of arrivals dispatches in parallel without
/// unbounded task spawning.
pub struct TaskManager {
    config: SchedulerConfig,
    catalog: Arc<TaskCatalog>,
    registry: Arc<Mutex<WorkerRegistry>>,
    delay_queue: Arc<Mutex<DelayQueue>>,
    engine: Arc<AssignmentEngine>,
    consumer: Arc<dyn BusConsumer>,
    persistence: Arc<dyn PersistenceClient>,
    assign_tx: mpsc::Sender<Task>,
    assign_rx: Mutex<Option<mpsc::Receiver<Task>>>,
    shutdown: CancellationToken,
}

impl TaskManager {
    /// Build the manager: loads the task-weight catalog from persistence
    /// and wires the assignment engine. No loops run until [`start`].
    ///
    /// [`start`]: TaskManager::start
    pub async fn init(
        config: SchedulerConfig,
        consumer: Arc<dyn BusConsumer>,
        producer: Arc<dyn BusProducer>,
        persistence: Arc<dyn PersistenceClient>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let catalog_bytes = persistence.get_task_catalog().await?;
        let catalog = Arc::new(TaskCatalog::from_slice(&catalog_bytes)?);
        if catalog.is_empty() {
            tracing::warn!("Task-weight catalog is empty; no task can be dispatched");
        } else {
            tracing::info!(entries = catalog.len(), "Loaded task-weight catalog");
        }

        let registry = Arc::new(Mutex::new(WorkerRegistry::new()));
        let delay_queue = Arc::new(Mutex::new(DelayQueue::new()));
        let engine = Arc::new(AssignmentEngine::new(
            catalog.clone(),
            registry.clone(),
            producer,
        ));
        let (assign_tx, assign_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Ok(Self {
            config,
            catalog,
            registry,
            delay_queue,
            engine,
            consumer,
            persistence,
            assign_tx,
            assign_rx: Mutex::new(Some(assign_rx)),
            shutdown,
        })
    }

    /// Spin up every subsystem and return immediately:
    ///
    /// 1. Bridges from the bus consumer into per-stream channels
    /// 2. The new-task, completion, and membership loops
    /// 3. The 1-second delay-queue tick loop
    /// 4. The assignment worker pool
    /// 5. Recovery (fleet seed + pending-task resubmission), concurrent
    ///    with the ingress streams
    ///
    /// Calling `start` a second time is a logged no-op.
    pub fn start(&self) {
        // The receiver slot is filled once in `init` and taken here; a
        // contended lock can only mean another `start` is mid-flight.
        let Ok(mut slot) = self.assign_rx.try_lock() else {
            tracing::warn!("TaskManager::start called concurrently, ignoring");
            return;
        };
        let Some(assign_rx) = slot.take() else {
            tracing::warn!("TaskManager::start called twice, ignoring");
            return;
        };
        drop(slot);

        let bus = &self.config.bus;

        let (task_tx, task_rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let consumer = self.consumer.clone();
            let queue = bus.task_queue.clone();
            let key = bus.task_routing_key.clone();
            let tag = bus.task_tag.clone();
            tokio::spawn(async move { consumer.handle_tasks(task_tx, &queue, &key, &tag).await });
        }

        let (complete_tx, complete_rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let consumer = self.consumer.clone();
            let queue = bus.completion_queue.clone();
            let key = bus.completion_routing_key.clone();
            let tag = bus.complete_tag.clone();
            tokio::spawn(
                async move { consumer.handle_completions(complete_tx, &queue, &key, &tag).await },
            );
        }

        let (join_tx, join_rx) = mpsc::channel(CHANNEL_CAPACITY);
        {
            let consumer = self.consumer.clone();
            let tag = bus.join_tag.clone();
            tokio::spawn(async move { consumer.handle_joins(join_tx, &tag).await });
        }

        tokio::spawn(Self::new_task_loop(
            self.persistence.clone(),
            self.delay_queue.clone(),
            self.assign_tx.clone(),
            self.shutdown.clone(),
            task_rx,
        ));
        tokio::spawn(Self::completion_loop(
            self.catalog.clone(),
            self.registry.clone(),
            self.persistence.clone(),
            self.shutdown.clone(),
            complete_rx,
        ));
        tokio::spawn(Self::membership_loop(
            self.registry.clone(),
            self.shutdown.clone(),
            join_rx,
        ));
        tokio::spawn(Self::tick_loop(
            self.delay_queue.clone(),
            self.assign_tx.clone(),
            self.shutdown.clone(),
        ));

        let assign_rx = Arc::new(Mutex::new(assign_rx));
        for worker in 0..self.config.assign_workers.max(1) {
            tokio::spawn(Self::assign_worker(
                worker,
                self.engine.clone(),
                assign_rx.clone(),
                self.shutdown.clone(),
            ));
        }

        tokio::spawn(Self::recover(
            self.persistence.clone(),
            self.registry.clone(),
            self.assign_tx.clone(),
        ));

        tracing::info!(
            assign_workers = self.config.assign_workers.max(1),
            "Task manager started"
        );
    }

    /// Decode a task and inject it directly into the new-task path,
    /// bypassing the bus. Follows the same persist-then-delay-or-assign
    /// flow as bus ingress; tasks whose action is not `ADD_TASK` are
    /// ignored.
    pub async fn add_task(&self, body: &[u8]) -> Result<()> {
        let task: Task = serde_json::from_slice(body)?;
        if task.meta.action != ACTION_ADD_TASK {
            tracing::debug!(action = %task.meta.action, "Ignoring injected task with unhandled action");
            return Ok(());
        }
        Self::ingest(
            self.persistence.as_ref(),
            &self.delay_queue,
            &self.assign_tx,
            task,
        )
        .await?;
        Ok(())
    }

    /// Current accounted load of a worker, if known.
    pub async fn worker_load(&self, server_id: &str) -> Option<i64> {
        self.registry.lock().await.load(server_id)
    }

    /// Number of workers currently in the fleet.
    pub async fn worker_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Number of tasks parked on the delay queue.
    pub async fn delayed_count(&self) -> usize {
        self.delay_queue.lock().await.len()
    }

    /// Persist a new task, then either park it on the delay queue or hand
    /// it to the assignment pool. Returns the persisted id. The id is
    /// always assigned before the task is delayed or dispatched.
    async fn ingest(
        persistence: &dyn PersistenceClient,
        delay_queue: &Mutex<DelayQueue>,
        assign_tx: &mpsc::Sender<Task>,
        mut task: Task,
    ) -> Result<String> {
        let id = persistence.save_task(&task.meta).await?;
        task.id = id.clone();

        if task.meta.delay > 0 {
            let release = release_at(Utc::now().timestamp(), task.meta.delay);
            tracing::debug!(task_id = %id, release_at = release, "Task parked on delay queue");
            delay_queue.lock().await.push(task, release);
        } else if assign_tx.send(task).await.is_err() {
            return Err(DispatchError::Internal(
                "assignment pool is not running".to_string(),
            ));
        }

        Ok(id)
    }

    /// New-task stream: decode, filter on `ADD_TASK`, persist, then delay
    /// or assign. Malformed messages are logged and skipped.
    async fn new_task_loop(
        persistence: Arc<dyn PersistenceClient>,
        delay_queue: Arc<Mutex<DelayQueue>>,
        assign_tx: mpsc::Sender<Task>,
        shutdown: CancellationToken,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            let body = tokio::select! {
                _ = shutdown.cancelled() => break,
                body = rx.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };

            let task: Task = match serde_json::from_slice(&body) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed task message, skipping");
                    continue;
                }
            };
            if task.meta.action != ACTION_ADD_TASK {
                tracing::debug!(action = %task.meta.action, "Ignoring task message with unhandled action");
                continue;
            }

            if let Err(e) =
                Self::ingest(persistence.as_ref(), &delay_queue, &assign_tx, task).await
            {
                tracing::error!(error = %e, "Failed to persist task, dropping");
            }
        }
        tracing::debug!("New-task loop terminated");
    }

    /// Completion stream: decode, filter on `COMPLETE_TASK`, reverse the
    /// task-type weight on the reporting worker, and mark the task complete
    /// in persistence.
    async fn completion_loop(
        catalog: Arc<TaskCatalog>,
        registry: Arc<Mutex<WorkerRegistry>>,
        persistence: Arc<dyn PersistenceClient>,
        shutdown: CancellationToken,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            let body = tokio::select! {
                _ = shutdown.cancelled() => break,
                body = rx.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };

            let done: CompleteTask = match serde_json::from_slice(&body) {
                Ok(done) => done,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed completion message, skipping");
                    continue;
                }
            };
            if done.meta.action != ACTION_COMPLETE_TASK {
                tracing::debug!(action = %done.meta.action, "Ignoring completion with unhandled action");
                continue;
            }

            if let Some(weight) = catalog.weight(&done.meta.task_type) {
                registry.lock().await.adjust(&done.meta.server_id, -weight);
                tracing::debug!(
                    task_id = %done.id,
                    server_id = %done.meta.server_id,
                    weight,
                    "Worker load released"
                );
            } else {
                tracing::warn!(
                    task_id = %done.id,
                    task_type = %done.meta.task_type,
                    "Completion for unknown task type; load not adjusted"
                );
            }

            if let Err(e) = persistence.mark_complete(&done.id).await {
                tracing::error!(
                    task_id = %done.id,
                    error = %e,
                    "Failed to mark task complete; accounting already adjusted"
                );
            }
        }
        tracing::debug!("Completion loop terminated");
    }

    /// Membership stream: status 1 registers the worker (resetting its
    /// accounting on re-join), anything else removes it.
    async fn membership_loop(
        registry: Arc<Mutex<WorkerRegistry>>,
        shutdown: CancellationToken,
        mut rx: mpsc::Receiver<Vec<u8>>,
    ) {
        loop {
            let body = tokio::select! {
                _ = shutdown.cancelled() => break,
                body = rx.recv() => match body {
                    Some(body) => body,
                    None => break,
                },
            };

            let event: JoinEvent = match serde_json::from_slice(&body) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed join message, skipping");
                    continue;
                }
            };

            let mut registry = registry.lock().await;
            if event.is_join() {
                registry.add(&event.server_id);
            } else {
                registry.remove(&event.server_id);
            }
        }
        tracing::debug!("Membership loop terminated");
    }

    /// Delay-queue ticker: every second, drain *all* due tasks in heap
    /// order and hand them to the assignment pool.
    async fn tick_loop(
        delay_queue: Arc<Mutex<DelayQueue>>,
        assign_tx: mpsc::Sender<Task>,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let due = delay_queue.lock().await.pop_due(Utc::now().timestamp());
                    for task in due {
                        tracing::debug!(task_id = %task.id, "Delayed task released");
                        if assign_tx.send(task).await.is_err() {
                            tracing::debug!("Assignment pool gone, stopping ticker");
                            return;
                        }
                    }
                }
            }
        }
        tracing::debug!("Tick loop terminated");
    }

    /// One assignment pool worker. The receiver lock is held only while
    /// waiting for a task, so assignments themselves run in parallel
    /// across the pool.
    async fn assign_worker(
        worker: usize,
        engine: Arc<AssignmentEngine>,
        rx: Arc<Mutex<mpsc::Receiver<Task>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => None,
                    task = rx.recv() => task,
                }
            };
            let Some(task) = task else { break };
            engine.assign(&task, &task.id).await;
        }
        tracing::debug!(worker, "Assignment worker terminated");
    }

    /// Startup reconciliation: seed the registry from the persisted fleet
    /// (all workers at load 0) and re-submit every pending task with its
    /// existing id. Recovered tasks dispatch immediately, never re-delayed.
    async fn recover(
        persistence: Arc<dyn PersistenceClient>,
        registry: Arc<Mutex<WorkerRegistry>>,
        assign_tx: mpsc::Sender<Task>,
    ) {
        match persistence.get_fleet().await {
            Ok(bytes) => match serde_json::from_slice::<Vec<FleetMember>>(&bytes) {
                Ok(members) => {
                    let mut reg = registry.lock().await;
                    for member in &members {
                        reg.add(&member.server_id);
                    }
                    drop(reg);
                    tracing::info!(servers = members.len(), "Seeded worker registry from persistence");
                }
                Err(e) => tracing::error!(error = %e, "Malformed fleet list from persistence"),
            },
            Err(e) => tracing::error!(error = %e, "Failed to fetch fleet from persistence"),
        }

        match persistence.get_pending_tasks().await {
            Ok(bytes) => match serde_json::from_slice::<Vec<PendingTask>>(&bytes) {
                Ok(pending) => {
                    if !pending.is_empty() {
                        tracing::info!(tasks = pending.len(), "Re-submitting pending tasks");
                    }
                    for entry in pending {
                        let task = Task::with_id(entry.id, entry.meta);
                        if assign_tx.send(task).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::error!(error = %e, "Malformed pending-task list from persistence"),
            },
            Err(e) => tracing::error!(error = %e, "Failed to fetch pending tasks from persistence"),
        }
    }
}
