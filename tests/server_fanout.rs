//! Session-level fanout through the HTTP surface: executing against a real
//! process, subscribing a topic to the owning session, and confirming that
//! deleting the session stops further publishes — the "topic fanout after
//! session delete" scenario.

use std::sync::Arc;
use std::time::Duration;

use action_engine::{router, Service, ServerState, TopicManager, TopicMessage};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

#[tokio::test(flavor = "multi_thread")]
async fn topic_subscription_stops_receiving_after_session_delete() {
    let service = Service::new();
    let topics = Arc::new(TopicManager::new());
    let state = ServerState::new(service.clone(), topics.clone());
    service.set_observer(state.clone()).await;

    let mut subscription = topics.add_subscription("t1");
    let app = router(state.clone());

    let add_topic = Request::builder()
        .method("POST")
        .uri("/sessions/s1/topics")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!({"topic_id": "t1"})).unwrap()))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(add_topic).await.unwrap().status(),
        StatusCode::OK
    );

    let execute = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "session": {"session_id": "s1"},
                "new_processes": [{"pid": "p1"}],
                "poll_interval": 1,
            }))
            .unwrap(),
        ))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(execute).await.unwrap().status(),
        StatusCode::OK
    );

    // The execution's first poll cycle (new_process ack) should reach the
    // topic, prefixed with session_id, before the session is deleted.
    let first = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("expected a published message before deletion")
        .expect("subscription channel should still be open");
    match first {
        TopicMessage::Data(payload) => assert_eq!(payload["session_id"], "s1"),
        TopicMessage::Closed => panic!("unexpected close before session deletion"),
    }

    let delete = Request::builder()
        .method("DELETE")
        .uri("/sessions/s1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.clone().oneshot(delete).await.unwrap().status(), StatusCode::OK);

    // The underlying execution keeps running and emitting cycles, but with
    // the session detached from every table, nothing further should reach
    // this topic subscription.
    let second = tokio::time::timeout(Duration::from_secs(3), subscription.recv()).await;
    assert!(
        second.is_err(),
        "expected no further publishes to t1 after session deletion"
    );

    service.shutdown().await;
}

#[tokio::test]
async fn sessions_pagination_lists_every_session_exactly_once() {
    let service = Service::new();
    let topics = Arc::new(TopicManager::new());
    let state = ServerState::new(service.clone(), topics);
    let app = router(state.clone());

    for i in 0..5 {
        let execute = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&json!({"session": {"session_id": format!("s{i}")}})).unwrap(),
            ))
            .unwrap();
        assert_eq!(
            app.clone().oneshot(execute).await.unwrap().status(),
            StatusCode::OK
        );
    }

    let mut seen = std::collections::HashSet::new();
    let mut page = 1;
    loop {
        let request = Request::builder()
            .uri(format!("/sessions?page={page}&page_size=2"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        for item in body["items"].as_array().unwrap() {
            seen.insert(item["session_id"].as_str().unwrap().to_string());
        }
        if !body["has_next"].as_bool().unwrap() {
            break;
        }
        page += 1;
    }

    assert_eq!(seen.len(), 5);
    service.shutdown().await;
}
