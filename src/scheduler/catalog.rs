use std::collections::HashMap;

use crate::error::Result;
use crate::scheduler::task::TaskWeight;

/// Task-type → weight mapping, built once at startup and immutable after.
///
/// A task whose type has no catalog entry is never dispatched.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    weights: HashMap<String, i64>,
}

impl TaskCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the catalog from a persisted JSON array of `{type, weight}`
    /// rows. Duplicate types keep the last row.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let rows: Vec<TaskWeight> = serde_json::from_slice(bytes)?;
        Ok(Self::from_weights(rows))
    }

    pub fn from_weights(rows: impl IntoIterator<Item = TaskWeight>) -> Self {
        let weights = rows
            .into_iter()
            .map(|row| (row.task_type, row.weight))
            .collect();
        Self { weights }
    }

    pub fn weight(&self, task_type: &str) -> Option<i64> {
        self.weights.get(task_type).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
