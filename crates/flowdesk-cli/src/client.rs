// HTTP client wrapper for the Flowdesk API
//
// `Client` is a thin reqwest wrapper (get/post/patch/delete with uniform
// error mapping). It implements the sync core's WorkflowApi and
// ExecutionApi so the CLI can drive a SaveController / ExecutionStateMachine
// against a live server.
//
// Wire contract:
//   GET    /api/workflows/{id}                        -> workflow
//   POST   /api/workflows/                            {name, configuration}
//   PATCH  /api/workflows/{id}                        {configuration, lock_version} | {name}
//   POST   /api/orchestration/execute                 {workflow_id, input_data} -> {task_id}
//   POST   /api/orchestration/tasks/{id}/cancel
//   GET    /api/orchestration/workflows/{id}/history  ?limit&offset
//   DELETE /api/tasks/{id}

use async_trait::async_trait;
use flowdesk_core::{
    CancelAck, ExecutionApi, HistoryPage, LockVersion, RemoteError, SavedWorkflow, TaskId,
    WorkflowApi, WorkflowGraph, WorkflowId, WorkflowRecord,
};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found")]
    NotFound,
}

impl From<ClientError> for RemoteError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Http(e) if e.is_decode() => RemoteError::Protocol(e.to_string()),
            ClientError::Http(e) => RemoteError::network(e.to_string()),
            ClientError::Api { status, message } => RemoteError::server(status, message),
            ClientError::Conflict(message) => RemoteError::server(409, message),
            ClientError::NotFound => RemoteError::NotFound("resource".into()),
        }
    }
}

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await?;
        self.handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await?;
        self.handle_response(response).await
    }

    pub async fn patch<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.patch(&url).json(body).send().await?;
        self.handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.delete(&url).send().await?;

        if response.status() == StatusCode::NO_CONTENT || response.status() == StatusCode::OK {
            return Ok(());
        }

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }

        let status = response.status().as_u16();
        let message = error_detail(response.text().await.unwrap_or_default());
        Err(ClientError::Api { status, message })
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }

        if !status.is_success() {
            let message = error_detail(response.text().await.unwrap_or_default());
            if status == StatusCode::CONFLICT {
                return Err(ClientError::Conflict(message));
            }
            return Err(ClientError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}

/// Error bodies are `{"detail": "..."}`; fall back to the raw text
fn error_detail(body: String) -> String {
    #[derive(Deserialize)]
    struct Detail {
        detail: String,
    }
    serde_json::from_str::<Detail>(&body)
        .map(|d| d.detail)
        .unwrap_or(body)
}

/// Current version named in a 409 message ("... current version: 4.")
fn current_version_from(message: &str) -> Option<LockVersion> {
    let (_, tail) = message.rsplit_once("current version:")?;
    let digits: String = tail
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().map(LockVersion)
}

#[derive(Debug, Serialize)]
struct CreateWorkflowRequest<'a> {
    name: &'a str,
    configuration: &'a WorkflowGraph,
}

#[derive(Debug, Serialize)]
struct UpdateWorkflowRequest<'a> {
    configuration: &'a WorkflowGraph,
    lock_version: LockVersion,
}

#[derive(Debug, Serialize)]
struct RenameWorkflowRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    workflow_id: WorkflowId,
    input_data: &'a serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    task_id: TaskId,
}

#[async_trait]
impl WorkflowApi for Client {
    async fn get_workflow(&self, id: WorkflowId) -> Result<WorkflowRecord, RemoteError> {
        self.get(&format!("/api/workflows/{}", id))
            .await
            .map_err(|e| match e {
                ClientError::NotFound => RemoteError::workflow_not_found(id),
                e => e.into(),
            })
    }

    async fn create_workflow(
        &self,
        name: &str,
        graph: &WorkflowGraph,
    ) -> Result<WorkflowRecord, RemoteError> {
        let request = CreateWorkflowRequest {
            name,
            configuration: graph,
        };
        Ok(self.post("/api/workflows/", &request).await?)
    }

    async fn update_workflow(
        &self,
        id: WorkflowId,
        graph: &WorkflowGraph,
        lock_version: LockVersion,
    ) -> Result<SavedWorkflow, RemoteError> {
        let request = UpdateWorkflowRequest {
            configuration: graph,
            lock_version,
        };
        self.patch(&format!("/api/workflows/{}", id), &request)
            .await
            .map_err(|e| match e {
                ClientError::Conflict(message) => {
                    debug!(workflow_id = %id, %message, "version conflict");
                    RemoteError::VersionConflict {
                        submitted: lock_version,
                        current: current_version_from(&message),
                    }
                }
                ClientError::NotFound => RemoteError::workflow_not_found(id),
                e => e.into(),
            })
    }

    async fn rename_workflow(&self, id: WorkflowId, name: &str) -> Result<(), RemoteError> {
        let _: serde_json::Value = self
            .patch(
                &format!("/api/workflows/{}", id),
                &RenameWorkflowRequest { name },
            )
            .await
            .map_err(|e| match e {
                ClientError::NotFound => RemoteError::workflow_not_found(id),
                e => e.into(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionApi for Client {
    async fn execute(
        &self,
        workflow_id: WorkflowId,
        inputs: &serde_json::Value,
    ) -> Result<TaskId, RemoteError> {
        let request = ExecuteRequest {
            workflow_id,
            input_data: inputs,
        };
        let response: ExecuteResponse = self
            .post("/api/orchestration/execute", &request)
            .await
            .map_err(|e| match e {
                ClientError::NotFound => RemoteError::workflow_not_found(workflow_id),
                e => e.into(),
            })?;
        Ok(response.task_id)
    }

    async fn cancel(&self, task_id: TaskId) -> Result<CancelAck, RemoteError> {
        let result: Result<serde_json::Value, ClientError> = self
            .post(
                &format!("/api/orchestration/tasks/{}/cancel", task_id),
                &serde_json::json!({}),
            )
            .await;
        match result {
            Ok(_) => Ok(CancelAck::Requested),
            // Finished (400) or unknown (404) tasks need no cancelling
            Err(ClientError::NotFound) | Err(ClientError::Api { status: 400, .. }) => {
                debug!(task_id = %task_id, "task already finished");
                Ok(CancelAck::AlreadyFinished)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn history(
        &self,
        workflow_id: WorkflowId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage, RemoteError> {
        Ok(self
            .get(&format!(
                "/api/orchestration/workflows/{}/history?limit={}&offset={}",
                workflow_id, limit, offset
            ))
            .await?)
    }

    async fn delete_task(&self, task_id: TaskId) -> Result<(), RemoteError> {
        self.delete(&format!("/api/tasks/{}", task_id))
            .await
            .map_err(|e| match e {
                ClientError::NotFound => RemoteError::NotFound(format!("task {task_id}")),
                e => e.into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowdesk_core::{GraphNode, TaskStatus};
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn graph() -> WorkflowGraph {
        WorkflowGraph::new()
            .with_node(GraphNode::new("a", "agent"))
            .with_node(GraphNode::new("b", "tool"))
            .with_edge("a", "b")
    }

    #[test]
    fn test_current_version_from_conflict_message() {
        let msg = "Workflow 7 was modified by another user. Your version: 3, current version: 4.";
        assert_eq!(current_version_from(msg), Some(LockVersion(4)));
        assert_eq!(current_version_from("stale write"), None);
    }

    #[tokio::test]
    async fn test_update_conflict_maps_to_version_conflict() {
        let server = MockServer::start().await;
        let id = WorkflowId::new();
        Mock::given(method("PATCH"))
            .and(path(format!("/api/workflows/{id}")))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "detail": format!("Workflow {id} was modified by another user. Your version: 3, current version: 4.")
            })))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let err = client
            .update_workflow(id, &graph(), LockVersion(3))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RemoteError::VersionConflict {
                submitted: LockVersion(3),
                current: Some(LockVersion(4)),
            }
        );
    }

    #[tokio::test]
    async fn test_update_sends_graph_and_version() {
        let server = MockServer::start().await;
        let id = WorkflowId::new();
        let g = graph();
        Mock::given(method("PATCH"))
            .and(path(format!("/api/workflows/{id}")))
            .and(body_json(json!({
                "configuration": serde_json::to_value(&g).unwrap(),
                "lock_version": 3
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": id,
                "name": "wf",
                "configuration": serde_json::to_value(&g).unwrap(),
                "lock_version": 4
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let saved = client
            .update_workflow(id, &g, LockVersion(3))
            .await
            .unwrap();

        assert_eq!(saved.lock_version, LockVersion(4));
        assert_eq!(saved.graph, g);
    }

    #[tokio::test]
    async fn test_cancel_finished_or_unknown_is_acknowledged() {
        let server = MockServer::start().await;
        let finished = TaskId::new();
        let unknown = TaskId::new();
        let running = TaskId::new();
        Mock::given(method("POST"))
            .and(path(format!("/api/orchestration/tasks/{finished}/cancel")))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(json!({"detail": "Task cannot be cancelled"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/orchestration/tasks/{unknown}/cancel")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Task not found"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/api/orchestration/tasks/{running}/cancel")))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"message": "cancellation requested", "status": "pending"}),
            ))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        assert_eq!(client.cancel(finished).await.unwrap(), CancelAck::AlreadyFinished);
        assert_eq!(client.cancel(unknown).await.unwrap(), CancelAck::AlreadyFinished);
        assert_eq!(client.cancel(running).await.unwrap(), CancelAck::Requested);
    }

    #[tokio::test]
    async fn test_cancel_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let err = client.cancel(TaskId::new()).await.unwrap_err();
        assert_eq!(err, RemoteError::server(500, "boom"));
    }

    #[tokio::test]
    async fn test_history_parses_legacy_payload() {
        let server = MockServer::start().await;
        let workflow_id = WorkflowId::new();
        let task_id = TaskId::new();
        Mock::given(method("GET"))
            .and(path(format!("/api/orchestration/workflows/{workflow_id}/history")))
            .and(query_param("limit", "10"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workflow_id": workflow_id,
                "total_count": 1,
                "limit": 10,
                "offset": 0,
                "tasks": [{
                    "id": task_id,
                    "user_input": "summarize the news",
                    "status": "in_progress",
                    "created_at": "2025-03-01T09:30:00Z",
                    "updated_at": "2025-03-01T09:31:00Z",
                    "completed_at": null,
                    "error_message": null,
                    "result": null
                }]
            })))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let page = client.history(workflow_id, 10, 0).await.unwrap();

        assert_eq!(page.total_count, 1);
        assert_eq!(page.tasks[0].id, task_id);
        assert_eq!(page.tasks[0].status, TaskStatus::Running);
        assert_eq!(page.tasks[0].user_input.as_deref(), Some("summarize the news"));
    }

    #[tokio::test]
    async fn test_backend_payloads_with_integer_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/workflows/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 7,
                "name": "research",
                "description": null,
                "project_id": null,
                "configuration": {
                    "nodes": [{"id": "a", "type": "agent"}, {"id": "b", "type": "tool"}],
                    "edges": [{"source": "a", "target": "b"}]
                },
                "lock_version": 3,
                "created_at": "2025-03-01T09:30:00.123456",
                "updated_at": "2025-03-01T09:35:00.654321"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/orchestration/execute"))
            .and(body_json(json!({"workflow_id": 7, "input_data": {"query": "hi"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_id": 42,
                "status": "pending",
                "message": "Workflow execution started"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/orchestration/workflows/7/history"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workflow_id": 7,
                "total_count": 1,
                "limit": 20,
                "offset": 0,
                "tasks": [{
                    "id": 42,
                    "user_input": "hi",
                    "status": "completed",
                    "created_at": "2025-03-01T09:40:00.000001",
                    "updated_at": "2025-03-01T09:41:00",
                    "completed_at": "2025-03-01T09:41:00",
                    "error_message": null,
                    "result": {"answer": "hello"},
                    "duration_seconds": 59.999999
                }]
            })))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let record = client.get_workflow(WorkflowId(7)).await.unwrap();
        assert_eq!(record.id, WorkflowId(7));
        assert_eq!(record.lock_version, LockVersion(3));
        assert_eq!(record.graph.node_count(), 2);

        let task_id = client
            .execute(WorkflowId(7), &json!({"query": "hi"}))
            .await
            .unwrap();
        assert_eq!(task_id, TaskId(42));

        let page = client.history(WorkflowId(7), 20, 0).await.unwrap();
        assert_eq!(page.tasks[0].id, TaskId(42));
        assert_eq!(page.tasks[0].status, TaskStatus::Completed);
        assert!(page.tasks[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_node_ids_are_a_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/workflows/8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": 8,
                "name": "dupes",
                "configuration": {
                    "nodes": [{"id": "a", "type": "agent"}, {"id": "a", "type": "tool"}],
                    "edges": []
                },
                "lock_version": 1
            })))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let err = client.get_workflow(WorkflowId(8)).await.unwrap_err();
        assert!(matches!(err, RemoteError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_missing_workflow_is_not_found() {
        let server = MockServer::start().await;
        let id = WorkflowId::new();
        Mock::given(method("GET"))
            .and(path(format!("/api/workflows/{id}")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Workflow not found"})))
            .mount(&server)
            .await;

        let client = Client::new(&server.uri());
        let err = client.get_workflow(id).await.unwrap_err();
        assert_eq!(err, RemoteError::workflow_not_found(id));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let client = Client::new("http://127.0.0.1:9");
        let err = client.get_workflow(WorkflowId::new()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));
    }
}
