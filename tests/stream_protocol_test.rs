//! 流协议不变量：一条 start、一条 finish、顺序约定与 [DONE] 终止行

mod common;

use common::{default_state, make_state, run_question, run_question_with_cancel};
use faro::config::AppConfig;
use faro::executor::DemoBackend;
use faro::stream::{FinishReason, StreamEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const QUESTIONS: &[&str] = &[
    "hola",
    "como van las ventas",
    "como esta el inventario",
    "cuantas ordenes tuvimos",
    "comparame noviembre vs octubre",
];

#[tokio::test]
async fn test_exactly_one_start_and_finish() {
    let state = default_state();
    for q in QUESTIONS {
        let result = run_question(&state, q).await;
        assert_eq!(
            result.count(|e| matches!(e, StreamEvent::Start { .. })),
            1,
            "pregunta: {}",
            q
        );
        assert_eq!(
            result.count(|e| matches!(e, StreamEvent::Finish { .. })),
            1,
            "pregunta: {}",
            q
        );
    }
}

#[tokio::test]
async fn test_start_first_finish_last() {
    let state = default_state();
    for q in QUESTIONS {
        let result = run_question(&state, q).await;
        assert!(matches!(result.events.first(), Some(StreamEvent::Start { .. })));
        assert!(matches!(result.events.last(), Some(StreamEvent::Finish { .. })));
    }
}

#[tokio::test]
async fn test_dashboard_strictly_before_payload() {
    let state = default_state();
    for q in ["como van las ventas", "como esta el inventario"] {
        let result = run_question(&state, q).await;
        let dash = result.position(|e| matches!(e, StreamEvent::Dashboard { .. }));
        let payload = result.position(|e| matches!(e, StreamEvent::Payload { .. }));
        let (dash, payload) = (dash.unwrap(), payload.unwrap());
        assert!(dash < payload, "pregunta: {}", q);
    }
}

#[tokio::test]
async fn test_text_block_well_nested() {
    let state = default_state();
    let result = run_question(&state, "como van las ventas").await;

    let text_start = result
        .position(|e| matches!(e, StreamEvent::TextStart { .. }))
        .unwrap();
    let text_end = result
        .position(|e| matches!(e, StreamEvent::TextEnd { .. }))
        .unwrap();
    let finish = result
        .position(|e| matches!(e, StreamEvent::Finish { .. }))
        .unwrap();

    assert_eq!(
        result.count(|e| matches!(e, StreamEvent::TextStart { .. })),
        1
    );
    assert_eq!(result.count(|e| matches!(e, StreamEvent::TextEnd { .. })), 1);
    assert!(text_start < text_end && text_end < finish);

    for (i, ev) in result.events.iter().enumerate() {
        if matches!(ev, StreamEvent::TextDelta { .. }) {
            assert!(text_start < i && i < text_end, "delta fuera del bloque");
        }
    }
}

#[tokio::test]
async fn test_every_spec_ref_exists_in_payload() {
    let state = default_state();
    for q in [
        "como van las ventas",
        "como esta el inventario",
        "comparame noviembre vs octubre",
        "casos escalados del agente",
    ] {
        let result = run_question(&state, q).await;
        let (Some(spec), Some(payload)) = (result.dashboard(), result.payload()) else {
            continue;
        };
        for r in spec.collect_refs() {
            assert!(payload.has_ref(r), "ref {} sin datos (pregunta: {})", r, q);
        }
    }
}

#[tokio::test]
async fn test_events_roundtrip_serialization() {
    let state = default_state();
    let result = run_question(&state, "como van las ventas").await;
    for ev in &result.events {
        let json = serde_json::to_string(ev).unwrap();
        let back: StreamEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(*ev, back);
    }
}

#[tokio::test]
async fn test_cancellation_before_stages() {
    let state = default_state();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = run_question_with_cancel(&state, "como van las ventas", cancel).await;

    assert_eq!(result.reason, FinishReason::Cancelled);
    assert!(result.dashboard().is_none());
    assert!(result.payload().is_none());
    // cancelado antes del fetch: ninguna escritura al cache
    assert_eq!(state.cache.stats().size, 0);
    assert!(matches!(result.events.last(), Some(StreamEvent::Finish { .. })));
}

#[tokio::test]
async fn test_deadline_forces_finish_error() {
    let mut cfg = AppConfig::default();
    cfg.pipeline.request_deadline_seconds = 0;
    let state = make_state(DemoBackend::new(), None, cfg);
    let result = run_question(&state, "como van las ventas").await;

    assert_eq!(result.reason, FinishReason::Error);
    // nada de dashboard/payload despues (ni antes) del finish
    assert!(result.dashboard().is_none());
    assert!(result.payload().is_none());
    let finish = result
        .position(|e| matches!(e, StreamEvent::Finish { .. }))
        .unwrap();
    assert_eq!(finish, result.events.len() - 1);
}

// ============== capa HTTP: headers + terminador [DONE] ==============

async fn http_request(addr: std::net::SocketAddr, body: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "POST /v1/chat/stream HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let read_all = stream.read_to_end(&mut buf);
    tokio::time::timeout(std::time::Duration::from_secs(30), read_all)
        .await
        .expect("respuesta completa")
        .unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

async fn spawn_server() -> std::net::SocketAddr {
    let state = default_state();
    let app = faro::server::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_http_stream_headers_and_done_terminator() {
    let addr = spawn_server().await;
    let response = http_request(addr, r#"{"question":"hola"}"#).await;

    assert!(response.starts_with("HTTP/1.1 200"));
    let lower = response.to_lowercase();
    assert!(lower.contains("content-type: text/event-stream"));
    assert!(lower.contains("cache-control: no-cache, no-transform"));
    assert!(lower.contains("x-accel-buffering: no"));
    assert!(lower.contains("x-vercel-ai-ui-message-stream: v1"));

    // [DONE] es la ultima linea de datos, despues del finish
    let finish_pos = response.find("\"type\":\"finish\"").expect("finish presente");
    let done_pos = response.find("data: [DONE]").expect("[DONE] presente");
    assert!(finish_pos < done_pos);
    assert!(!response[done_pos..].contains("\"type\":"));
}

#[tokio::test]
async fn test_http_empty_question_is_400_without_stream() {
    let addr = spawn_server().await;
    let response = http_request(addr, r#"{"question":"  "}"#).await;

    assert!(response.starts_with("HTTP/1.1 400"));
    assert!(!response.contains("data:"));
}
