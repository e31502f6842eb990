use std::collections::HashMap;

/// Accounted state for one worker in the fleet.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: String,
    /// Outstanding reserved weight. Signed: duplicate or unmatched
    /// completions can drive it negative, which is tolerated.
    pub load: i64,
}

/// Mapping worker-id → accounted load.
///
/// The registry itself is not synchronized; callers share it behind a
/// single mutex and keep every scan-then-mutate pair inside one guard.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a worker at load 0. A re-join overwrites the existing entry,
    /// resetting its accounting.
    pub fn add(&mut self, id: &str) {
        self.workers.insert(
            id.to_string(),
            Worker {
                id: id.to_string(),
                load: 0,
            },
        );
        tracing::info!(server_id = id, "Worker registered");
    }

    /// Remove a worker if present.
    pub fn remove(&mut self, id: &str) {
        if self.workers.remove(id).is_some() {
            tracing::info!(server_id = id, "Worker removed");
        }
    }

    /// Id of the worker minimizing `load + weight`, or `None` when the
    /// fleet is empty. Ties go to whichever worker the map iterates first;
    /// the order is arbitrary.
    pub fn select_min(&self, weight: i64) -> Option<String> {
        self.workers
            .values()
            .min_by_key(|w| w.load + weight)
            .map(|w| w.id.clone())
    }

    /// Add `delta` (may be negative) to the named worker's load. Unknown
    /// ids are a no-op.
    pub fn adjust(&mut self, id: &str, delta: i64) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.load += delta;
            if worker.load < 0 {
                tracing::warn!(
                    server_id = id,
                    load = worker.load,
                    "Worker load went negative; duplicate or unmatched completion"
                );
            }
        }
    }

    /// Pick the least-loaded worker for `weight` and reserve the weight on
    /// it in one step. Callers must hold the registry lock across the whole
    /// call so the scan and the reservation are atomic.
    pub fn select_and_reserve(&mut self, weight: i64) -> Option<String> {
        let id = self.select_min(weight)?;
        self.adjust(&id, weight);
        Some(id)
    }

    pub fn load(&self, id: &str) -> Option<i64> {
        self.workers.get(id).map(|w| w.load)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Sum of all accounted loads, mainly for diagnostics and tests.
    pub fn total_load(&self) -> i64 {
        self.workers.values().map(|w| w.load).sum()
    }
}
