//! HTTP client for the control plane REST API.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use waypoint_core::{Checkpoint, Task, TaskFilters, TaskId, TaskState, Worker, WorkerId};

use crate::error::ClientError;

/// One page of `GET /v1/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub next_cursor: Option<TaskId>,
}

/// Reply of `GET /v1/tasks/:id/progress`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: TaskId,
    pub state: TaskState,
    pub percent: u8,
    pub attempt: u32,
    pub max_attempts: u32,

    #[serde(default)]
    pub latest_checkpoint: Option<Checkpoint>,

    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
}

#[derive(Deserialize)]
struct Deleted {
    deleted: usize,
}

/// HTTP client for the control plane.
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client.
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if the control plane is healthy.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let url = self.url("/health");
        debug!(url = %url, "Checking health");

        let response = self
            .inner
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(response.status().is_success())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn create_task(
        &self,
        task_type: &str,
        owner: &str,
        payload: Value,
        max_attempts: Option<u32>,
        dependencies: &[TaskId],
    ) -> Result<Task, ClientError> {
        let mut body = json!({"type": task_type, "owner": owner, "payload": payload});
        if let Some(max_attempts) = max_attempts {
            body["max_attempts"] = json!(max_attempts);
        }
        if !dependencies.is_empty() {
            body["dependencies"] = json!(dependencies);
        }
        self.post_json("/v1/tasks", &body).await
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}")).await
    }

    pub async fn list_tasks(&self, filters: &TaskFilters) -> Result<TaskPage, ClientError> {
        let url = self.url("/v1/tasks");
        debug!(url = %url, ?filters, "GET request");

        let response = self.inner.get(&url).query(filters).send().await?;
        Self::decode(response).await
    }

    /// Follow `next_cursor` until the listing is exhausted.
    pub async fn list_all_tasks(&self, mut filters: TaskFilters) -> Result<Vec<Task>, ClientError> {
        let mut tasks = Vec::new();
        loop {
            let page = self.list_tasks(&filters).await?;
            tasks.extend(page.tasks);
            match page.next_cursor {
                Some(cursor) => filters.after = Some(cursor),
                None => return Ok(tasks),
            }
        }
    }

    pub async fn task_progress(&self, id: &TaskId) -> Result<TaskProgress, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}/progress")).await
    }

    /// Dependencies of a task that have not completed.
    pub async fn blocking_dependencies(&self, id: &TaskId) -> Result<Vec<Task>, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}/blocking")).await
    }

    pub async fn cancel_task(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.post_json(&format!("/v1/tasks/{id}/cancel"), &json!({})).await
    }

    pub async fn pause_task(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.post_json(&format!("/v1/tasks/{id}/pause"), &json!({})).await
    }

    pub async fn resume_task(&self, id: &TaskId) -> Result<Task, ClientError> {
        self.post_json(&format!("/v1/tasks/{id}/resume"), &json!({})).await
    }

    pub async fn assign_task(&self, id: &TaskId, worker_id: &WorkerId) -> Result<Task, ClientError> {
        self.post_json(
            &format!("/v1/tasks/{id}/assign"),
            &json!({"worker_id": worker_id}),
        )
        .await
    }

    pub async fn checkpoints(&self, id: &TaskId) -> Result<Vec<Checkpoint>, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}/checkpoints")).await
    }

    pub async fn latest_checkpoint(&self, id: &TaskId) -> Result<Checkpoint, ClientError> {
        self.get_json(&format!("/v1/tasks/{id}/checkpoints/latest")).await
    }

    pub async fn delete_checkpoint(&self, id: &TaskId, sequence: u64) -> Result<(), ClientError> {
        let response = self
            .send_delete(&format!("/v1/tasks/{id}/checkpoints/{sequence}"))
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Drop a task's checkpoint history; returns how many were removed.
    pub async fn delete_all_checkpoints(&self, id: &TaskId) -> Result<usize, ClientError> {
        let response = self.send_delete(&format!("/v1/tasks/{id}/checkpoints")).await?;
        let reply: Deleted = Self::decode(response).await?;
        Ok(reply.deleted)
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    pub async fn list_workers(&self) -> Result<Vec<Worker>, ClientError> {
        self.get_json("/v1/workers").await
    }

    pub async fn get_worker(&self, id: &WorkerId) -> Result<Worker, ClientError> {
        self.get_json(&format!("/v1/workers/{id}")).await
    }

    pub async fn drain_worker(&self, id: &WorkerId) -> Result<Worker, ClientError> {
        self.post_json(&format!("/v1/workers/{id}/drain"), &json!({})).await
    }

    /// Remove an idle worker; returns its final record.
    pub async fn deregister_worker(&self, id: &WorkerId) -> Result<Worker, ClientError> {
        let response = self.send_delete(&format!("/v1/workers/{id}")).await?;
        Self::decode(response).await
    }

    /// Worker counts by status, as reported by the server.
    pub async fn worker_stats(&self) -> Result<Value, ClientError> {
        self.get_json("/v1/workers/stats").await
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Get JSON from an endpoint.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "GET request");

        let response = self.inner.get(&url).send().await?;
        Self::decode(response).await
    }

    /// Post a JSON body and decode the JSON reply.
    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "POST request");

        let response = self.inner.post(&url).json(body).send().await?;
        Self::decode(response).await
    }

    async fn send_delete(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "DELETE request");

        Ok(self.inner.delete(&url).send().await?)
    }

    /// Turn a non-success status into a `ClientError`.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_response(status, &body));
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let response = Self::check(response).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = HttpClient::new("http://localhost:50052///");
        assert_eq!(client.base_url(), "http://localhost:50052");
        assert_eq!(client.url("/v1/tasks"), "http://localhost:50052/v1/tasks");
    }

    #[test]
    fn test_task_page_without_cursor() {
        let page: TaskPage = serde_json::from_str(r#"{"tasks": []}"#).unwrap();
        assert!(page.tasks.is_empty());
        assert!(page.next_cursor.is_none());
    }
}
