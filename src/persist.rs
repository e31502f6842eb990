use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::PersistenceConfig;
use crate::error::{DispatchError, Result};
use crate::scheduler::task::TaskMeta;

/// Durable store of record for task state and fleet membership.
///
/// The list calls return raw JSON bytes; decoding happens at the call site
/// so a persistence backend can be swapped without touching the scheduler
/// core.
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// JSON array of `{type, weight}` catalog rows.
    async fn get_task_catalog(&self) -> Result<Vec<u8>>;

    /// JSON array of `{serverId, ...}` fleet rows.
    async fn get_fleet(&self) -> Result<Vec<u8>>;

    /// JSON array of `{id, meta}` rows for tasks still pending dispatch.
    async fn get_pending_tasks(&self) -> Result<Vec<u8>>;

    /// Insert a new task and return the id assigned by the store.
    async fn save_task(&self, meta: &TaskMeta) -> Result<String>;

    /// Move the task to the complete state.
    async fn mark_complete(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct InsertedRow {
    id: Value,
}

/// PostgREST-style persistence client.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    auth: String,
    key: String,
}

impl RestClient {
    pub fn new(config: &PersistenceConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth.clone(),
            key: config.key.clone(),
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, path_and_query)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.key)
            .bearer_auth(&self.auth)
            .header("Content-Type", "application/json")
    }

    async fn fetch(&self, path_and_query: &str) -> Result<Vec<u8>> {
        let response = self
            .request(self.http.get(self.url(path_and_query)))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Persistence(format!(
                "GET {path_and_query}: HTTP {status}: {body}"
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PersistenceClient for RestClient {
    async fn get_task_catalog(&self) -> Result<Vec<u8>> {
        self.fetch("task_weight?select=type,weight").await
    }

    async fn get_fleet(&self) -> Result<Vec<u8>> {
        self.fetch("used_server?select=serverId").await
    }

    async fn get_pending_tasks(&self) -> Result<Vec<u8>> {
        self.fetch("task?select=id,meta&status=eq.pending").await
    }

    async fn save_task(&self, meta: &TaskMeta) -> Result<String> {
        let response = self
            .request(self.http.post(self.url("task")))
            .header("Prefer", "return=representation")
            .json(&json!({ "meta": meta, "status": "pending" }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Persistence(format!(
                "save_task: HTTP {status}: {body}"
            )));
        }

        let rows: Vec<InsertedRow> = response.json().await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DispatchError::Persistence("save_task returned no rows".to_string()))?;

        // Numeric and string primary keys both occur in the wild.
        Ok(match row.id {
            Value::String(id) => id,
            other => other.to_string(),
        })
    }

    async fn mark_complete(&self, id: &str) -> Result<()> {
        let response = self
            .request(self.http.patch(self.url(&format!("task?id=eq.{id}"))))
            .json(&json!({ "status": "complete" }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Persistence(format!(
                "mark_complete({id}): HTTP {status}: {body}"
            )));
        }
        Ok(())
    }
}
