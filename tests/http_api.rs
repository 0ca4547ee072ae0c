//! Integration tests for the REST task API client.
//!
//! Each test spins up an Axum stub of the task service on a random port
//! and drives it through `HttpTaskApi` and the dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::timeout;

use foreman::api::{HttpTaskApi, Priority, Task, TaskApi, TaskLock, TaskStatus, TaskUpdate};
use foreman::dispatch::{DispatchScope, Dispatcher};
use foreman::error::ApiError;
use foreman::orchestrator::{AgentState, new_agent_table};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const API_KEY: &str = "test-key";

#[derive(Default)]
struct Board {
    tasks: HashMap<String, Task>,
    comments: Vec<(String, Value)>,
    locks: HashMap<String, String>,
    unauthorized: usize,
}

type Shared = Arc<Mutex<Board>>;

fn authorized(board: &Shared, headers: &HeaderMap) -> bool {
    let ok = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {API_KEY}"));
    if !ok {
        board.lock().unwrap().unauthorized += 1;
    }
    ok
}

async fn list_tasks(State(board): State<Shared>, Path(ws): Path<String>, headers: HeaderMap) -> Result<Json<Vec<Task>>, StatusCode> {
    if !authorized(&board, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let board = board.lock().unwrap();
    let mut tasks: Vec<Task> = board
        .tasks
        .values()
        .filter(|t| t.workspace_id == ws && t.status == TaskStatus::Todo && t.assignee_id.is_none())
        .cloned()
        .collect();
    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(tasks))
}

async fn get_task(State(board): State<Shared>, Path(id): Path<String>) -> Result<Json<Task>, StatusCode> {
    board
        .lock()
        .unwrap()
        .tasks
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn patch_task(
    State(board): State<Shared>,
    Path(id): Path<String>,
    Json(update): Json<TaskUpdate>,
) -> Result<Json<Task>, StatusCode> {
    let mut board = board.lock().unwrap();
    let task = board.tasks.get_mut(&id).ok_or(StatusCode::NOT_FOUND)?;
    update.apply_to(task);
    Ok(Json(task.clone()))
}

async fn add_comment(State(board): State<Shared>, Path(id): Path<String>, Json(body): Json<Value>) -> StatusCode {
    board.lock().unwrap().comments.push((id, body));
    StatusCode::CREATED
}

async fn lock_task(
    State(board): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<TaskLock>, StatusCode> {
    let agent_id = body["agentId"].as_str().unwrap_or_default().to_string();
    let ttl = body["ttlSeconds"].as_u64().unwrap_or(60);
    let mut board = board.lock().unwrap();
    if board.locks.get(&id).is_some_and(|holder| *holder != agent_id) {
        return Err(StatusCode::CONFLICT);
    }
    board.locks.insert(id, agent_id.clone());
    Ok(Json(TaskLock::new(agent_id, Duration::from_secs(ttl))))
}

async fn unlock_task(State(board): State<Shared>, Path(id): Path<String>) -> StatusCode {
    board.lock().unwrap().locks.remove(&id);
    StatusCode::NO_CONTENT
}

async fn no_active_sprint() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Start the stub service on a random port, return (client, board).
async fn start_server(tasks: Vec<Task>) -> (HttpTaskApi, Shared) {
    let board: Shared = Arc::new(Mutex::new(Board {
        tasks: tasks.into_iter().map(|t| (t.id.clone(), t)).collect(),
        ..Board::default()
    }));
    let app = Router::new()
        .route("/api/workspaces/{ws}/tasks", get(list_tasks))
        .route("/api/workspaces/{ws}/sprints/active", get(no_active_sprint))
        .route("/api/tasks/{id}", get(get_task).patch(patch_task))
        .route("/api/tasks/{id}/comments", post(add_comment))
        .route("/api/tasks/{id}/lock", post(lock_task).delete(unlock_task))
        .with_state(board.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let api = HttpTaskApi::new(format!("http://127.0.0.1:{port}/"), SecretString::from(API_KEY.to_string())).unwrap();
    (api, board)
}

#[tokio::test]
async fn lists_available_tasks_with_bearer_auth() {
    timeout(TEST_TIMEOUT, async {
        let mut taken = Task::new("t3", "ws", "taken");
        taken.assignee_id = Some("someone".to_string());
        let (api, board) = start_server(vec![
            Task::new("t1", "ws", "first"),
            Task::new("t2", "other", "elsewhere"),
            taken,
        ])
        .await;

        let tasks = api.list_available_tasks("ws", None).await.unwrap();
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["t1"]);
        assert_eq!(board.lock().unwrap().unauthorized, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn wrong_key_surfaces_status_error() {
    timeout(TEST_TIMEOUT, async {
        let (api, _board) = start_server(vec![]).await;
        let bad = HttpTaskApi::new(api.base_url(), SecretString::from("nope".to_string())).unwrap();

        match bad.list_available_tasks("ws", None).await {
            Err(ApiError::Status { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected 401, got {other:?}"),
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_task_is_not_found_and_missing_sprint_is_none() {
    timeout(TEST_TIMEOUT, async {
        let (api, _board) = start_server(vec![]).await;

        assert!(matches!(
            api.get_task("ghost").await,
            Err(ApiError::NotFound { .. })
        ));
        assert_eq!(api.get_active_sprint("ws").await.unwrap(), None);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn second_agent_cannot_take_a_held_lock() {
    timeout(TEST_TIMEOUT, async {
        let (api, _board) = start_server(vec![Task::new("t1", "ws", "first")]).await;
        let ttl = Duration::from_secs(60);

        let lock = api.lock_task("t1", "agent-1", ttl).await.unwrap();
        assert_eq!(lock.agent_id, "agent-1");
        assert!(api.lock_task("t1", "agent-2", ttl).await.is_err());

        api.unlock_task("t1", "agent-1").await.unwrap();
        assert!(api.lock_task("t1", "agent-2", ttl).await.is_ok());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn dispatcher_claims_and_completes_over_http() {
    timeout(TEST_TIMEOUT, async {
        let (api, board) = start_server(vec![
            Task::new("low", "ws", "tidy up").with_priority(Priority::Low),
            Task::new("crit", "ws", "fix outage").with_priority(Priority::Critical),
        ])
        .await;

        let agents = new_agent_table();
        agents
            .write()
            .await
            .insert("agent-1".to_string(), AgentState::new("agent-1"));
        let api: Arc<dyn TaskApi> = Arc::new(api);
        let dispatcher = Dispatcher::new(
            api,
            DispatchScope {
                workspace_id: "ws".to_string(),
                sprint_id: None,
            },
            agents,
        );

        let task = dispatcher.assign_task_to_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(task.id, "crit");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assignee_id.as_deref(), Some("agent-1"));
        assert_eq!(board.lock().unwrap().locks.get("crit").map(String::as_str), Some("agent-1"));

        dispatcher
            .complete_task("crit", "agent-1", Some("Restarted the service."))
            .await
            .unwrap();

        let board = board.lock().unwrap();
        assert_eq!(board.tasks["crit"].status, TaskStatus::NeedsVerification);
        assert!(!board.locks.contains_key("crit"));
        assert_eq!(board.comments.len(), 1);
        let (task_id, body) = &board.comments[0];
        assert_eq!(task_id, "crit");
        assert!(body["body"].as_str().unwrap().contains("Restarted the service."));
        assert_eq!(board.tasks["low"].status, TaskStatus::Todo);
    })
    .await
    .expect("test timed out");
}
