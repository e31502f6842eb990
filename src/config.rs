use std::env;

use crate::error::{DispatchError, Result};

/// Message-bus settings: connection, exchange, and the queue/routing-key
/// bindings for each ingress stream.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub url: String,
    pub exchange: String,
    pub exchange_type: String,
    pub task_queue: String,
    pub task_routing_key: String,
    pub completion_queue: String,
    pub completion_routing_key: String,
    /// Base name for per-worker dispatch queues; the worker id is appended.
    pub dispatch_queue: String,
    /// Fanout exchange carrying worker join/leave events.
    pub join_exchange: String,
    pub join_tag: String,
    pub task_tag: String,
    pub complete_tag: String,
}

/// Persistence endpoint settings (PostgREST-style API).
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    pub base_url: String,
    pub auth: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub bus: BusConfig,
    pub persistence: PersistenceConfig,
    /// Number of pool workers draining the assignment queue.
    pub assign_workers: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            exchange: "tasks".to_string(),
            exchange_type: "direct".to_string(),
            task_queue: "task.new".to_string(),
            task_routing_key: "task.new".to_string(),
            completion_queue: "task.complete".to_string(),
            completion_routing_key: "task.complete".to_string(),
            dispatch_queue: "task.dispatch".to_string(),
            join_exchange: "server.join".to_string(),
            join_tag: "server-join-consumer".to_string(),
            task_tag: "task-consumer".to_string(),
            complete_tag: "complete-task-consumer".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            persistence: PersistenceConfig {
                base_url: "http://127.0.0.1:3000".to_string(),
                auth: String::new(),
                key: String::new(),
            },
            assign_workers: 4,
        }
    }
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| DispatchError::Config(name.to_string()))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl SchedulerConfig {
    /// Build the configuration from environment variables.
    ///
    /// Connection endpoints are required; queue names, routing keys, and
    /// consumer tags fall back to the crate defaults so a bare deployment
    /// only has to provide `BUS_URL` and the persistence credentials.
    pub fn from_env() -> Result<Self> {
        let defaults = BusConfig::default();
        let bus = BusConfig {
            url: required("BUS_URL")?,
            exchange: optional("BUS_EXCHANGE", &defaults.exchange),
            exchange_type: optional("BUS_EXCHANGE_TYPE", &defaults.exchange_type),
            task_queue: optional("BUS_TASK_QUEUE", &defaults.task_queue),
            task_routing_key: optional("BUS_TASK_ROUTING_KEY", &defaults.task_routing_key),
            completion_queue: optional("BUS_COMPLETION_QUEUE", &defaults.completion_queue),
            completion_routing_key: optional(
                "BUS_COMPLETION_ROUTING_KEY",
                &defaults.completion_routing_key,
            ),
            dispatch_queue: optional("BUS_DISPATCH_QUEUE", &defaults.dispatch_queue),
            join_exchange: optional("BUS_JOIN_EXCHANGE", &defaults.join_exchange),
            join_tag: optional("BUS_JOIN_TAG", &defaults.join_tag),
            task_tag: optional("BUS_TASK_TAG", &defaults.task_tag),
            complete_tag: optional("BUS_COMPLETE_TAG", &defaults.complete_tag),
        };

        let persistence = PersistenceConfig {
            base_url: required("PERSISTENCE_BASE_URL")?,
            auth: required("PERSISTENCE_AUTH")?,
            key: required("PERSISTENCE_KEY")?,
        };

        Ok(Self {
            bus,
            persistence,
            assign_workers: 4,
        })
    }
}
