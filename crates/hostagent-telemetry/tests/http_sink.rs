use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use hostagent_common::InstanceStatus;
use hostagent_telemetry::{HttpSink, TelemetryError, TelemetryReport, TelemetrySink};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct Collector {
    received: Arc<Mutex<Vec<(Option<String>, serde_json::Value)>>>,
}

async fn collect(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let secret = headers
        .get("x-agent-secret")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    collector.received.lock().await.push((secret, body));
    StatusCode::OK
}

async fn spawn_collector(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_push_posts_report_with_secret() {
    let collector = Collector::default();
    let app = Router::new()
        .route("/stats", post(collect))
        .with_state(collector.clone());
    let base = spawn_collector(app).await;

    let sink = HttpSink::new(&base, Some("s3cret".to_string())).unwrap();
    let report = TelemetryReport::new("inst-1", 55.5, 12.0, InstanceStatus::Running);
    sink.push(&report).await.unwrap();

    let received = collector.received.lock().await;
    assert_eq!(received.len(), 1);
    let (secret, body) = &received[0];
    assert_eq!(secret.as_deref(), Some("s3cret"));
    assert_eq!(body["instance_id"], "inst-1");
    assert_eq!(body["cpu_pct"], 55.5);
    assert_eq!(body["status"], "running");
}

#[tokio::test]
async fn test_collector_error_is_reported() {
    let app = Router::new().route(
        "/stats",
        post(|| async { (StatusCode::UNAUTHORIZED, "bad secret") }),
    );
    let base = spawn_collector(app).await;

    let sink = HttpSink::new(&base, None).unwrap();
    let err = sink
        .push(&TelemetryReport::idle("inst-2", InstanceStatus::Stopped))
        .await
        .unwrap_err();
    match err {
        TelemetryError::Rejected { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "bad secret");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unreachable_collector_is_a_delivery_error() {
    // Bind and drop to get a port nobody listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let sink = HttpSink::new(&format!("http://127.0.0.1:{port}"), None).unwrap();
    let err = sink
        .push(&TelemetryReport::idle("inst-3", InstanceStatus::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, TelemetryError::Delivery(_)));
}
