use super::super::test_support::{prelude::*, *};
use crate::{ConnectionState, Envelope, HostError, McpConnection, ResponseOutcome};

#[tokio::test]
async fn handshake_caches_server_info() {
    let (_dir, connection) = start_demo_connection().await;
    assert_eq!(connection.state(), ConnectionState::Ready);

    let info = connection.server_info().expect("server info");
    assert_eq!(info.name, "demo");
    assert_eq!(info.version, "0.1.0");

    connection.close().await;
}

#[tokio::test]
async fn execute_tool_round_trips() {
    let (_dir, connection) = start_demo_connection().await;

    let result = connection.execute_tool("ping", None).await.expect("ping");
    assert!(!result.is_error);
    assert_eq!(result.content[0].kind, "text");
    assert_eq!(result.content[0].text.as_deref(), Some("pong"));

    connection.close().await;
}

#[tokio::test]
async fn server_reported_tool_error_is_data_not_failure() {
    let (_dir, connection) = start_demo_connection().await;

    let result = connection.execute_tool("boom", None).await.expect("boom");
    assert!(result.is_error);
    assert_eq!(result.content[0].kind, "error");
    assert!(result.content[0]
        .text
        .as_deref()
        .expect("error text")
        .contains("tool exploded"));

    connection.close().await;
}

#[tokio::test]
async fn noisy_stdout_does_not_break_the_handshake() {
    let (_dir, script) = write_noisy_server();
    let connection = McpConnection::new("noisy", server_config(&script), quick_dialect());
    connection.initialize().await.expect("initialize despite noise");

    let result = connection.execute_tool("ping", None).await.expect("ping");
    assert_eq!(result.content[0].text.as_deref(), Some("pong"));

    connection.close().await;
}

#[tokio::test]
async fn slow_tool_times_out_and_clears_its_entry() {
    let (_dir, connection) = start_demo_connection().await;

    let started = Instant::now();
    let err = connection.execute_tool("slow", None).await.unwrap_err();
    assert!(matches!(err, HostError::Timeout { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(connection.pending_requests(), 0);

    // The connection stays usable after a timed-out call.
    let result = connection.execute_tool("ping", None).await.expect("ping");
    assert_eq!(result.content[0].text.as_deref(), Some("pong"));

    connection.close().await;
}

#[tokio::test]
async fn close_fails_pending_calls_and_kills_the_child() {
    let (_dir, connection) = start_demo_connection().await;

    let first = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.execute_tool("slow", None).await }
    });
    let second = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.execute_tool("slow", None).await }
    });
    time::sleep(Duration::from_millis(100)).await;

    connection.close().await;

    for handle in [first, second] {
        let result = time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("pending call resolves promptly")
            .expect("join");
        assert!(matches!(result, Err(HostError::ConnectionClosed { .. })));
    }

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.pending_requests(), 0);
    assert!(!connection.is_healthy().await);

    let err = connection.execute_tool("ping", None).await.unwrap_err();
    assert!(matches!(err, HostError::ConnectionClosed { .. }));
}

#[tokio::test]
async fn dying_child_fails_the_pending_call() {
    let (_dir, connection) = start_demo_connection().await;

    let err = connection.execute_tool("die", None).await.unwrap_err();
    assert!(matches!(err, HostError::ConnectionClosed { .. }), "got {err:?}");
    assert!(!connection.is_healthy().await);

    connection.close().await;
}

#[tokio::test]
async fn callers_queue_fifo_until_ready() {
    let (_dir, script) = write_demo_server();
    let mut config = server_config(&script);
    config
        .env
        .insert("DEMO_INIT_DELAY_MS".into(), "300".into());
    let connection = Arc::new(McpConnection::new("demo", config, quick_dialect()));

    let init = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.initialize().await }
    });
    // The handshake is now in flight and holds the readiness gate.
    time::sleep(Duration::from_millis(50)).await;
    let early_caller = tokio::spawn({
        let connection = Arc::clone(&connection);
        async move { connection.list_tools().await }
    });

    init.await.expect("join").expect("initialize");
    let tools = time::timeout(Duration::from_secs(2), early_caller)
        .await
        .expect("early caller resolves")
        .expect("join")
        .expect("tools");
    assert!(tools.iter().any(|tool| tool.name == "ping"));
    // The early caller never saw a half-initialized server.
    assert!(connection.server_info().is_some());

    connection.close().await;
}

#[tokio::test]
async fn notifications_are_broadcast_to_subscribers() {
    let (_dir, connection) = start_demo_connection().await;
    let mut events = connection.notifications().await.expect("subscribe");

    let result = connection
        .execute_tool("notify", None)
        .await
        .expect("notify tool");
    assert!(!result.is_error);

    let event = time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event timeout")
        .expect("event");
    assert_eq!(event.method, "demo/event");
    assert_eq!(
        event.params.get("kind").and_then(Value::as_str),
        Some("tool-side-effect")
    );

    connection.close().await;
}

#[tokio::test]
async fn send_message_passes_raw_requests_through() {
    let (_dir, connection) = start_demo_connection().await;

    // The injected id is irrelevant: the multiplexer re-issues under its own.
    let injected = Envelope::request(999, "tools/list", Some(json!({})));
    let response = connection
        .send_message(injected)
        .await
        .expect("send")
        .expect("response");
    match response {
        Envelope::Response {
            outcome: ResponseOutcome::Result(value),
            ..
        } => assert!(value.get("tools").is_some()),
        other => panic!("unexpected envelope: {other:?}"),
    }

    let none = connection
        .send_message(Envelope::notification("demo/heartbeat", Some(json!({}))))
        .await
        .expect("send notification");
    assert!(none.is_none());

    connection.close().await;
}

#[tokio::test]
async fn list_tools_and_resources_expose_the_catalog() {
    let (_dir, connection) = start_demo_connection().await;

    let tools = connection.list_tools().await.expect("tools");
    let echo = tools.iter().find(|tool| tool.name == "echo").expect("echo");
    assert_eq!(echo.expected_arguments(), vec!["message".to_string()]);

    let resources = connection.list_resources().await.expect("resources");
    assert_eq!(resources[0].uri, "demo://greeting");

    let content = connection
        .read_resource("demo://greeting")
        .await
        .expect("read");
    assert_eq!(content.text.as_deref(), Some("hello"));
    assert_eq!(content.mime_type.as_deref(), Some("text/plain"));

    // A server-reported read error surfaces as error text, not a failure.
    let missing = connection
        .read_resource("demo://missing")
        .await
        .expect("read");
    assert_eq!(missing.uri, "demo://missing");
    assert!(missing
        .text
        .as_deref()
        .expect("error text")
        .contains("unknown resource"));

    connection.close().await;
}

#[tokio::test]
async fn handshake_error_fails_the_connection() {
    let (_dir, script) = write_broken_server();
    let connection = McpConnection::new("broken", server_config(&script), quick_dialect());

    let err = connection.initialize().await.unwrap_err();
    assert!(matches!(err, HostError::Handshake { .. }));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn handshake_timeout_fails_the_connection() {
    let (_dir, script) = write_silent_server();
    let connection = McpConnection::new("silent", server_config(&script), quick_dialect());

    let err = connection.initialize().await.unwrap_err();
    assert!(matches!(err, HostError::Handshake { .. }));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn spawn_failure_fails_the_connection() {
    let config = server_config(Path::new("/nonexistent/mcp-server"));
    let connection = McpConnection::new("ghost", config, quick_dialect());

    let err = connection.initialize().await.unwrap_err();
    assert!(matches!(err, HostError::TransportStart { .. }));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn concurrent_calls_demultiplex_without_collisions() {
    let (_dir, connection) = start_demo_connection().await;

    let mut join_set = tokio::task::JoinSet::new();
    for index in 0..1000u32 {
        let connection = Arc::clone(&connection);
        join_set.spawn(async move {
            let result = connection
                .execute_tool("echo", Some(json!({ "message": format!("msg-{index}") })))
                .await
                .expect("echo");
            (index, result)
        });
    }

    let mut seen = 0usize;
    while let Some(joined) = join_set.join_next().await {
        let (index, result) = joined.expect("join");
        assert!(!result.is_error);
        assert_eq!(
            result.content[0].text.as_deref(),
            Some(format!("msg-{index}").as_str())
        );
        seen += 1;
    }
    assert_eq!(seen, 1000);
    assert_eq!(connection.pending_requests(), 0);

    connection.close().await;
}
