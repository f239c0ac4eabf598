//! Session ↔ WebSocket ↔ topic fanout (spec.md §4.6) plus the HTTP/JSON
//! surface of §6. Owns three session-keyed tables (`session → [WebSocket]`,
//! `session → [ExecutionReference]`, `session → set<topic>`) and the
//! reverse `execution → session` index, and implements
//! [`ExecutionObserver`] so the Service can push every emitted response
//! here for fanout — the "skip the indirection, inline the Server-side
//! fanout" option spec.md §9 calls out for when Service and Server share
//! a process, which they do in this binary.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures::stream::{SplitSink, Stream, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::execution::ExecutionResponse;
use crate::service::{
    ExecuteRequest, ExecutionObserver, ExecutionRef, NewProcessRequest, Service,
};
use crate::topic::{TopicManager, TopicMessage};

const TOPIC_KEEPALIVE: std::time::Duration = std::time::Duration::from_secs(15);

struct WebSocketEntry {
    id: Uuid,
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
}

/// Shared application state: the engine (`Service` + `TopicManager`) and
/// the session tables this server layer owns on top of it.
pub struct ServerState {
    service: Arc<Service>,
    topics: Arc<TopicManager>,
    session_websockets: DashMap<String, Vec<Arc<WebSocketEntry>>>,
    session_executions: DashMap<String, Vec<ExecutionRef>>,
    session_topics: DashMap<String, HashSet<String>>,
    execution_session: DashMap<ExecutionRef, String>,
}

impl ServerState {
    pub fn new(service: Arc<Service>, topics: Arc<TopicManager>) -> Arc<Self> {
        Arc::new(ServerState {
            service,
            topics,
            session_websockets: DashMap::new(),
            session_executions: DashMap::new(),
            session_topics: DashMap::new(),
            execution_session: DashMap::new(),
        })
    }

    fn snapshot_for(&self, session_id: &str) -> SnapshotFrame {
        let execution_ids = self
            .session_executions
            .get(session_id)
            .map(|refs| refs.clone())
            .unwrap_or_default();
        let state = self.service.get_execution_state(&execution_ids);
        let mut processes = HashMap::new();
        for process in state.processes {
            processes.insert(
                process.pid,
                SnapshotProcessState {
                    running_command_id: process.running_command_id,
                    is_done_logging_in: process.is_done_logging_in,
                },
            );
        }
        SnapshotFrame {
            frame_type: "snapshot",
            session_id: session_id.to_string(),
            execution_ids,
            processes,
        }
    }

    fn remove_websocket(&self, session_id: &str, id: Uuid) {
        if let Some(mut sockets) = self.session_websockets.get_mut(session_id) {
            sockets.retain(|entry| entry.id != id);
            let now_empty = sockets.is_empty();
            drop(sockets);
            if now_empty {
                self.session_websockets.remove(session_id);
            }
        }
    }
}

#[async_trait]
impl ExecutionObserver for ServerState {
    /// Looks up the session owning `response.execution_id`, sends the JSON
    /// payload to each of its WebSockets (removing any that error), and
    /// publishes the same payload — prefixed with `session_id` — to each
    /// topic the session subscribes to.
    async fn receive_execution_response(&self, response: ExecutionResponse) {
        let Some(session_id) = self
            .execution_session
            .get(&response.execution_id)
            .map(|e| e.clone())
        else {
            debug!(
                execution_id = %response.execution_id,
                "session not found for execution; dropping response"
            );
            return;
        };

        let frame = ExecutionResponseFrame::from(&response);
        let payload = serde_json::to_value(&frame).unwrap_or(Value::Null);
        let text = payload.to_string();

        if let Some(sockets) = self.session_websockets.get(&session_id).map(|s| s.clone()) {
            let mut dead = Vec::new();
            for entry in &sockets {
                let mut sink = entry.sink.lock().await;
                if let Err(e) = sink.send(Message::Text(text.clone())).await {
                    warn!(session_id = %session_id, error = %e, "websocket send failed, removing");
                    dead.push(entry.id);
                }
            }
            for id in dead {
                self.remove_websocket(&session_id, id);
            }
        }

        if let Some(topics) = self.session_topics.get(&session_id).map(|t| t.clone()) {
            if !topics.is_empty() {
                let mut with_session = payload.clone();
                if let Value::Object(map) = &mut with_session {
                    map.insert("session_id".to_string(), json!(session_id));
                }
                for topic_id in topics {
                    self.topics.publish(&topic_id, with_session.clone());
                }
            }
        }
    }
}

#[derive(Serialize)]
struct SnapshotFrame {
    #[serde(rename = "type")]
    frame_type: &'static str,
    session_id: String,
    execution_ids: Vec<ExecutionRef>,
    processes: HashMap<String, SnapshotProcessState>,
}

#[derive(Serialize, Default)]
struct SnapshotProcessState {
    #[serde(skip_serializing_if = "Option::is_none")]
    running_command_id: Option<String>,
    is_done_logging_in: bool,
}

#[derive(Serialize, Clone, Default)]
struct ExecutionResponseFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    loopback_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_processes: Option<Vec<NewProcessAckFrame>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processes: Option<HashMap<String, ProcessUpdateFrame>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize, Clone)]
struct NewProcessAckFrame {
    pid: String,
}

#[derive(Serialize, Clone, Default)]
struct ProcessUpdateFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    is_done: bool,
    is_done_logging_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_command_id: Option<String>,
    stop_mark_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<&ExecutionResponse> for ExecutionResponseFrame {
    fn from(response: &ExecutionResponse) -> Self {
        ExecutionResponseFrame {
            loopback_payload: response.loopback_payload.clone(),
            new_processes: response
                .new_processes
                .as_ref()
                .map(|pids| pids.iter().map(|pid| NewProcessAckFrame { pid: pid.clone() }).collect()),
            processes: response.processes.as_ref().map(|map| {
                map.iter()
                    .map(|(pid, update)| {
                        (
                            pid.clone(),
                            ProcessUpdateFrame {
                                output: update.output.clone(),
                                is_done: update.is_done,
                                is_done_logging_in: update.is_done_logging_in,
                                running_command_id: update.running_command_id.clone(),
                                stop_mark_found: update.stop_mark_found,
                                error: update.error.clone(),
                            },
                        )
                    })
                    .collect()
            }),
            error: response.error.clone(),
        }
    }
}

#[derive(Deserialize)]
struct SessionRefBody {
    session_id: String,
}

#[derive(Deserialize)]
struct NewProcessBody {
    pid: String,
}

#[derive(Deserialize, Default)]
struct ProcessActionBody {
    send_text: Option<String>,
    send_bytes: Option<Vec<u8>>,
    signal: Option<String>,
    stop_mark: Option<String>,
    running_command_id: Option<String>,
}

#[derive(Deserialize)]
struct ExecuteRequestBody {
    session: SessionRefBody,
    loopback_payload: Option<String>,
    new_processes: Option<Vec<NewProcessBody>>,
    processes: Option<HashMap<String, ProcessActionBody>>,
    poll_interval: Option<u64>,
}

#[derive(Serialize, Default)]
struct ExecuteResponseBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SessionsQuery {
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Serialize)]
struct SessionsResponse {
    items: Vec<SessionItem>,
    page: usize,
    page_size: usize,
    total: usize,
    has_next: bool,
}

#[derive(Serialize)]
struct SessionItem {
    session_id: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct AddTopicBody {
    topic_id: String,
}

#[derive(Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Deserialize)]
struct StateRequestBody {
    sessions: Vec<String>,
    topic_id: Option<String>,
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error: message.into() })).into_response()
}

async fn websocket_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = match headers.get("session_id").and_then(|v| v.to_str().ok()) {
        Some(id) => id.to_string(),
        None => return bad_request("Missing 'session_id' header in websocket request."),
    };

    ws.on_upgrade(move |socket| async move {
        handle_websocket(socket, state, session_id).await;
    })
}

async fn handle_websocket(socket: WebSocket, state: Arc<ServerState>, session_id: String) {
    let (sink, mut stream) = socket.split();
    let id = Uuid::new_v4();
    let entry = Arc::new(WebSocketEntry {
        id,
        sink: AsyncMutex::new(sink),
    });

    state
        .session_websockets
        .entry(session_id.clone())
        .or_default()
        .push(entry.clone());

    // Snapshot immediately only if the session already owns executions.
    let has_executions = state
        .session_executions
        .get(&session_id)
        .map(|refs| !refs.is_empty())
        .unwrap_or(false);
    if has_executions {
        let snapshot = state.snapshot_for(&session_id);
        if let Ok(text) = serde_json::to_string(&snapshot) {
            let mut sink = entry.sink.lock().await;
            let _ = sink.send(Message::Text(text)).await;
        }
    }

    trace!(session_id = %session_id, "websocket connected");

    // Reads only to detect close/error; any text frame is logged and
    // ignored, matching spec.md §4.6.
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(session_id = %session_id, message = %text, "unexpected websocket message, ignoring");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "websocket error");
                break;
            }
        }
    }

    state.remove_websocket(&session_id, id);
    trace!(session_id = %session_id, "websocket disconnected");
}

async fn execute_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ExecuteRequestBody>,
) -> Json<ExecuteResponseBody> {
    let session_id = body.session.session_id;

    if let Some(poll_interval) = body.poll_interval {
        if let Some(existing) = state.session_executions.get(&session_id) {
            for execution_id in existing.iter() {
                let _ = state.service.set_poll_interval(execution_id, poll_interval);
            }
        }
    }

    let request = ExecuteRequest {
        loopback_payload: body.loopback_payload,
        new_processes: body
            .new_processes
            .map(|ps| ps.into_iter().map(|p| NewProcessRequest { pid: p.pid }).collect()),
        processes: body.processes.map(|ps| {
            ps.into_iter()
                .map(|(pid, action)| {
                    (
                        pid,
                        crate::execution::ProcessAction {
                            send_text: action.send_text,
                            send_bytes: action.send_bytes,
                            signal: action.signal,
                            stop_mark: action.stop_mark,
                            running_command_id: action.running_command_id,
                        },
                    )
                })
                .collect()
        }),
        poll_interval: body.poll_interval,
    };

    let execution_id = state.service.execute(&session_id, request);
    state
        .session_executions
        .entry(session_id.clone())
        .or_default()
        .push(execution_id.clone());
    state.execution_session.insert(execution_id.clone(), session_id.clone());

    info!(session_id = %session_id, execution_id = %execution_id, "execution started");

    Json(ExecuteResponseBody { error: None })
}

async fn sessions_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SessionsQuery>,
) -> Response {
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(50);

    if page < 1 || page_size < 1 || page_size > 1000 {
        return bad_request("invalid pagination params");
    }

    let mut session_ids: Vec<String> = state
        .session_executions
        .iter()
        .map(|e| e.key().clone())
        .chain(state.session_websockets.iter().map(|e| e.key().clone()))
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    session_ids.sort();

    let total = session_ids.len();
    let start = (page - 1) * page_size;
    let end = start + page_size;

    if start >= total && total != 0 {
        return bad_request("page out of range");
    }

    let items = session_ids
        .get(start..end.min(total))
        .unwrap_or(&[])
        .iter()
        .map(|id| SessionItem { session_id: id.clone() })
        .collect();

    Json(SessionsResponse {
        items,
        page,
        page_size,
        total,
        has_next: end < total,
    })
    .into_response()
}

async fn add_topic_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
    Json(body): Json<AddTopicBody>,
) -> Json<OkBody> {
    state
        .session_topics
        .entry(session_id)
        .or_default()
        .insert(body.topic_id);
    Json(OkBody { ok: true })
}

async fn remove_topic_handler(
    State(state): State<Arc<ServerState>>,
    Path((session_id, topic_id)): Path<(String, String)>,
) -> Json<OkBody> {
    if let Some(mut topics) = state.session_topics.get_mut(&session_id) {
        topics.remove(&topic_id);
        let now_empty = topics.is_empty();
        drop(topics);
        if now_empty {
            state.session_topics.remove(&session_id);
        }
    }
    Json(OkBody { ok: true })
}

/// Detaches the session from fanout (all three tables and the reverse
/// execution→session index) without terminating its Executions — spec.md
/// §9 adopts "detach, do not terminate"; termination is a caller
/// responsibility.
async fn delete_session_handler(
    State(state): State<Arc<ServerState>>,
    Path(session_id): Path<String>,
) -> Json<OkBody> {
    state.session_websockets.remove(&session_id);
    state.session_executions.remove(&session_id);
    state.session_topics.remove(&session_id);
    state
        .execution_session
        .retain(|_, sid| sid != &session_id);
    Json(OkBody { ok: true })
}

async fn state_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<StateRequestBody>,
) -> Json<OkBody> {
    for session_id in body.sessions {
        let snapshot = state.snapshot_for(&session_id);
        let payload = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let text = payload.to_string();

        if let Some(sockets) = state.session_websockets.get(&session_id).map(|s| s.clone()) {
            for entry in &sockets {
                let mut sink = entry.sink.lock().await;
                let _ = sink.send(Message::Text(text.clone())).await;
            }
        }

        let mut topics: HashSet<String> = state
            .session_topics
            .get(&session_id)
            .map(|t| t.clone())
            .unwrap_or_default();
        if let Some(explicit) = &body.topic_id {
            topics.insert(explicit.clone());
        }
        for topic_id in topics {
            state.topics.publish(&topic_id, payload.clone());
        }
    }
    Json(OkBody { ok: true })
}

async fn topic_stream_handler(
    State(state): State<Arc<ServerState>>,
    Path(topic_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut subscription = state.topics.add_subscription(&topic_id);
    let topics = state.topics.clone();

    let stream = async_stream::stream! {
        loop {
            match subscription.recv().await {
                Some(TopicMessage::Data(payload)) => {
                    yield Ok(Event::default().data(payload.to_string()));
                }
                Some(TopicMessage::Closed) | None => break,
            }
        }
        topics.remove_subscription(subscription.topic(), subscription.id);
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(TOPIC_KEEPALIVE).text("keep-alive"))
}

pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS]);

    Router::new()
        .route("/websocket", get(websocket_handler))
        .route("/execute", post(execute_handler))
        .route("/sessions", get(sessions_handler))
        .route("/sessions/:session_id/topics", post(add_topic_handler))
        .route("/sessions/:session_id/topics/:topic_id", delete(remove_topic_handler))
        .route("/sessions/:session_id", delete(delete_session_handler))
        .route("/state", post(state_handler))
        .route("/topics/:topic_id/stream", get(topic_stream_handler))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::TopicManager;
    use tower::ServiceExt;

    fn test_state() -> Arc<ServerState> {
        ServerState::new(Service::new(), Arc::new(TopicManager::new()))
    }

    #[tokio::test]
    async fn execute_returns_ok_body() {
        let state = test_state();
        state.service.set_observer(state.clone()).await;
        let app = router(state.clone());

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&json!({
                    "session": {"session_id": "s1"},
                    "new_processes": [{"pid": "p1"}],
                }))
                .unwrap(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        state.service.shutdown().await;
    }

    #[tokio::test]
    async fn sessions_pagination_rejects_invalid_page_size() {
        let state = test_state();
        let app = router(state.clone());

        let request = axum::http::Request::builder()
            .uri("/sessions?page=1&page_size=5000")
            .body(axum::body::Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn add_then_remove_topic_round_trips() {
        let state = test_state();
        let app = router(state.clone());

        let add = axum::http::Request::builder()
            .method("POST")
            .uri("/sessions/s1/topics")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                serde_json::to_vec(&json!({"topic_id": "t1"})).unwrap(),
            ))
            .unwrap();
        let response = app.clone().oneshot(add).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.session_topics.get("s1").unwrap().contains("t1"));

        let remove = axum::http::Request::builder()
            .method("DELETE")
            .uri("/sessions/s1/topics/t1")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(remove).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.session_topics.get("s1").is_none());
    }

    #[tokio::test]
    async fn delete_session_clears_all_tables() {
        let state = test_state();
        state.session_executions.insert("s1".to_string(), vec!["e1".to_string()]);
        state.execution_session.insert("e1".to_string(), "s1".to_string());
        state.session_topics.entry("s1".to_string()).or_default().insert("t1".to_string());

        let app = router(state.clone());
        let request = axum::http::Request::builder()
            .method("DELETE")
            .uri("/sessions/s1")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(state.session_executions.get("s1").is_none());
        assert!(state.session_topics.get("s1").is_none());
        assert!(state.execution_session.get("e1").is_none());
    }
}
