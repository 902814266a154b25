//! Integration tests for the command relay.
//!
//! The relay runs against an in-memory connector; each test plays the relay
//! server and the Figma plugin through the `MemoryHost` end of the link.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use figma_relay_mcp::config::RelayConfig;
use figma_relay_mcp::relay::{
    Connector, Link, MemoryConnector, MemoryHost, Relay, RelayError, RelayResult,
};

// =============================================================================
// Harness
// =============================================================================

fn test_config() -> RelayConfig {
    RelayConfig {
        connect_max_attempts: 1,
        connect_backoff_ms: 10,
        join_timeout_ms: 500,
        command_timeout_ms: 2_000,
        ..RelayConfig::default()
    }
}

struct Harness {
    relay: Relay,
    connector: Arc<MemoryConnector>,
    hosts: UnboundedReceiver<MemoryHost>,
}

fn harness(config: RelayConfig) -> Harness {
    let (connector, hosts) = MemoryConnector::new();
    let connector = Arc::new(connector);
    let relay = Relay::new(config, connector.clone());
    Harness {
        relay,
        connector,
        hosts,
    }
}

impl Harness {
    /// Joins `channel`, acknowledging as the relay server would.
    async fn join(&mut self, channel: &str) -> MemoryHost {
        let join = {
            let relay = self.relay.clone();
            let channel = channel.to_string();
            tokio::spawn(async move { relay.join_channel(&channel).await })
        };

        let mut host = self.hosts.recv().await.expect("link opened");
        let frame = host.recv().await.expect("join frame");
        assert_eq!(frame, json!({"type": "join", "channel": channel}));
        host.send(&json!({"type": "join-ack", "channel": channel, "success": true}));

        join.await.unwrap().unwrap();
        host
    }

    fn spawn_command(
        &self,
        command: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> JoinHandle<RelayResult<Value>> {
        let relay = self.relay.clone();
        let command = command.to_string();
        tokio::spawn(async move { relay.send_command(&command, params, timeout).await })
    }
}

/// Receives the next command frame and returns its id.
async fn next_command(host: &mut MemoryHost) -> (String, Value) {
    let frame = host.recv().await.expect("command frame");
    assert_eq!(frame["type"], "command");
    let id = frame["id"].as_str().expect("string id").to_string();
    (id, frame)
}

/// Completes one command round trip, which also guarantees every frame the
/// host sent before it has been routed.
async fn round_trip(harness: &Harness, host: &mut MemoryHost) {
    let call = harness.spawn_command("sync", json!({}), None);
    let (id, _) = next_command(host).await;
    host.send(&json!({"id": id, "result": "ok"}));
    assert_eq!(call.await.unwrap(), Ok(json!("ok")));
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test]
async fn command_before_join_is_rejected() {
    let mut h = harness(test_config());

    let err = h
        .relay
        .send_command("get_selection", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NoChannel);

    // The link was opened but nothing was sent over it.
    let mut host = h.hosts.try_recv().expect("link opened");
    assert!(host.try_recv().is_none());
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn failed_connect_sends_nothing() {
    let mut h = harness(test_config());
    h.connector.refuse_next(1);

    let err = h
        .relay
        .send_command("get_document_info", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Connection { .. }), "{err:?}");
    assert_eq!(h.connector.attempts(), 1);
    assert!(h.hosts.try_recv().is_err());
    assert!(!h.relay.is_connected());

    // Reconnection is lazy: the next call dials again.
    let _host = h.join("design").await;
    assert_eq!(h.connector.attempts(), 2);
}

#[tokio::test]
async fn connect_retries_with_backoff() {
    let h = harness(RelayConfig {
        connect_max_attempts: 3,
        ..test_config()
    });
    h.connector.refuse_next(2);

    h.relay.connect().await.unwrap();
    assert_eq!(h.connector.attempts(), 3);
    assert!(h.relay.is_connected());
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let h = harness(test_config());

    let results =
        futures_util::future::join_all((0..5).map(|_| h.relay.connect())).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(h.connector.attempts(), 1);
    assert_eq!(h.relay.diagnostics().connections, 1);
}

#[tokio::test]
async fn connect_is_idempotent() {
    let h = harness(test_config());
    h.relay.connect().await.unwrap();
    h.relay.connect().await.unwrap();
    assert_eq!(h.connector.attempts(), 1);
}

#[tokio::test]
async fn connection_loss_rejects_everything_outstanding() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let calls: Vec<_> = (0..3)
        .map(|i| h.spawn_command("get_node_info", json!({"nodeId": format!("1:{i}")}), None))
        .collect();
    for _ in 0..3 {
        next_command(&mut host).await;
    }
    assert_eq!(h.relay.diagnostics().pending_requests, 3);

    host.close();

    for call in calls {
        assert_eq!(call.await.unwrap(), Err(RelayError::ConnectionLost));
    }
    assert_eq!(h.relay.diagnostics().pending_requests, 0);
    assert!(!h.relay.is_connected());
    assert_eq!(h.relay.current_channel(), None);

    // Rejoining is explicit.
    let err = h
        .relay
        .send_command("get_selection", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::NoChannel);
    assert_eq!(h.connector.attempts(), 2);
}

/// Both halves of a link, held separately so one can die without the other.
struct SplitLink {
    from_client: UnboundedReceiver<String>,
    to_client: UnboundedSender<String>,
}

/// Hands every opened link to the test as a [`SplitLink`].
struct SplitConnector {
    links: UnboundedSender<SplitLink>,
}

impl Connector for SplitConnector {
    fn open<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, io::Result<Link>> {
        let (outbound, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let sent = self.links.send(SplitLink {
            from_client,
            to_client,
        });
        Box::pin(std::future::ready(
            sent.map(|()| Link { outbound, inbound })
                .map_err(|_| io::Error::other("test dropped the link receiver")),
        ))
    }
}

fn split_relay() -> (Relay, UnboundedReceiver<SplitLink>) {
    let (links, rx) = mpsc::unbounded_channel();
    (Relay::new(test_config(), Arc::new(SplitConnector { links })), rx)
}

#[tokio::test]
async fn dead_writer_drops_the_connection() {
    let (relay, mut links) = split_relay();
    let mut read_halves = Vec::new();

    for _ in 0..3 {
        relay.connect().await.unwrap();
        let SplitLink {
            from_client,
            to_client,
        } = links.try_recv().expect("a fresh link per attempt");
        drop(from_client);
        read_halves.push(to_client);

        let err = relay.join_channel("design").await.unwrap_err();
        assert_eq!(err, RelayError::ConnectionLost);
        assert!(!relay.is_connected());
    }
    assert!(links.try_recv().is_err());
}

#[tokio::test]
async fn dead_writer_fails_outstanding_requests_at_once() {
    let (relay, mut links) = split_relay();

    let join = {
        let relay = relay.clone();
        tokio::spawn(async move { relay.join_channel("design").await })
    };
    let mut link = links.recv().await.unwrap();
    assert_eq!(
        link.from_client.recv().await.unwrap(),
        r#"{"type":"join","channel":"design"}"#
    );
    link.to_client
        .send(json!({"type": "join-ack", "channel": "design", "success": true}).to_string())
        .unwrap();
    join.await.unwrap().unwrap();

    let first = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .send_command("scan_text_nodes", json!({"nodeId": "1:1"}), None)
                .await
        })
    };
    link.from_client.recv().await.unwrap();

    let SplitLink {
        from_client,
        to_client: _read_half,
    } = link;
    drop(from_client);

    let second = relay.send_command("get_selection", json!({}), None).await;
    assert_eq!(second, Err(RelayError::ConnectionLost));
    assert_eq!(first.await.unwrap(), Err(RelayError::ConnectionLost));
    assert!(!relay.is_connected());
    assert_eq!(relay.current_channel(), None);
    assert_eq!(relay.diagnostics().pending_requests, 0);
}

#[tokio::test]
async fn disconnect_fails_in_flight_commands() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_styles", json!({}), None);
    next_command(&mut host).await;

    h.relay.disconnect();
    assert_eq!(call.await.unwrap(), Err(RelayError::ConnectionLost));
    assert!(host.recv().await.is_none());
}

// =============================================================================
// Channels
// =============================================================================

#[tokio::test]
async fn join_sets_current_channel() {
    let mut h = harness(test_config());
    assert_eq!(h.relay.current_channel(), None);

    let mut host = h.join("design-review").await;
    assert_eq!(h.relay.current_channel().as_deref(), Some("design-review"));

    let call = h.spawn_command("get_selection", json!({}), None);
    let (id, frame) = next_command(&mut host).await;
    assert_eq!(frame["channel"], "design-review");
    assert_eq!(frame["command"], "get_selection");
    host.send(&json!({"id": id, "result": []}));
    assert_eq!(call.await.unwrap(), Ok(json!([])));
}

#[tokio::test]
async fn rejected_join_leaves_channel_unset() {
    let mut h = harness(test_config());

    let join = {
        let relay = h.relay.clone();
        tokio::spawn(async move { relay.join_channel("missing").await })
    };
    let mut host = h.hosts.recv().await.unwrap();
    host.recv().await.unwrap();
    host.send(&json!({
        "type": "join-ack",
        "channel": "missing",
        "success": false,
        "error": "no such channel"
    }));

    assert_eq!(
        join.await.unwrap(),
        Err(RelayError::ChannelJoin {
            channel: "missing".to_string(),
            reason: "no such channel".to_string(),
        })
    );
    assert_eq!(h.relay.current_channel(), None);
}

#[tokio::test]
async fn unacknowledged_join_times_out() {
    let mut h = harness(RelayConfig {
        join_timeout_ms: 50,
        ..test_config()
    });

    let err = h.relay.join_channel("silent").await.unwrap_err();
    let RelayError::ChannelJoin { channel, reason } = err else {
        panic!("expected ChannelJoin, got {err:?}");
    };
    assert_eq!(channel, "silent");
    assert!(reason.contains("no acknowledgement"), "{reason}");
    assert_eq!(h.relay.current_channel(), None);

    // A late acknowledgement is dropped.
    let host = h.hosts.recv().await.unwrap();
    host.send(&json!({"type": "join-ack", "channel": "silent", "success": true}));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.relay.current_channel(), None);
}

#[tokio::test]
async fn empty_channel_name_is_rejected() {
    let h = harness(test_config());
    assert!(matches!(
        h.relay.join_channel("  ").await,
        Err(RelayError::ChannelJoin { .. })
    ));
    assert_eq!(h.connector.attempts(), 0);
}

// =============================================================================
// Dispatch and routing
// =============================================================================

#[tokio::test]
async fn responses_are_matched_by_id() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let first = h.spawn_command("get_node_info", json!({"nodeId": "1:1"}), None);
    let second = h.spawn_command("get_node_info", json!({"nodeId": "1:2"}), None);

    let (id_a, frame_a) = next_command(&mut host).await;
    let (id_b, frame_b) = next_command(&mut host).await;
    assert_ne!(id_a, id_b);

    // Answer in reverse order; each call still gets its own node.
    host.send(&json!({"id": id_b, "result": {"id": frame_b["params"]["nodeId"]}}));
    host.send(&json!({"id": id_a, "result": {"id": frame_a["params"]["nodeId"]}}));

    assert_eq!(first.await.unwrap(), Ok(json!({"id": "1:1"})));
    assert_eq!(second.await.unwrap(), Ok(json!({"id": "1:2"})));
}

#[tokio::test]
async fn unknown_ids_are_dropped() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_styles", json!({}), None);
    let (id, _) = next_command(&mut host).await;

    host.send(&json!({"id": "not-ours", "result": {"colors": []}}));
    host.send(&json!({"id": id, "result": {"colors": ["#fff"]}}));

    assert_eq!(call.await.unwrap(), Ok(json!({"colors": ["#fff"]})));
    assert_eq!(h.relay.diagnostics().unknown_id_frames, 1);
}

#[tokio::test]
async fn remote_errors_carry_the_host_message() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_node_info", json!({"nodeId": "0:0"}), None);
    let (id, _) = next_command(&mut host).await;
    host.send(&json!({"id": id, "error": {"message": "Node not found: 0:0"}}));

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "Node not found: 0:0");
    assert!(matches!(err, RelayError::Remote { .. }));
}

#[tokio::test]
async fn timed_out_command_drops_late_response() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let err = h
        .relay
        .send_command("x", json!({}), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RelayError::Timeout {
            command: "x".to_string(),
            timeout_ms: 50,
        }
    );
    assert_eq!(h.relay.diagnostics().pending_requests, 0);
    assert_eq!(h.relay.diagnostics().timeouts, 1);

    let (id, _) = next_command(&mut host).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    host.send(&json!({"id": id, "result": "too late"}));

    round_trip(&h, &mut host).await;
    assert_eq!(h.relay.diagnostics().unknown_id_frames, 1);
}

#[tokio::test]
async fn progress_updates_extend_the_deadline() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command(
        "scan_text_nodes",
        json!({"nodeId": "1:1"}),
        Some(Duration::from_millis(200)),
    );
    let (id, _) = next_command(&mut host).await;

    for step in 1..=4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        host.send(&json!({
            "type": "progress_update",
            "id": id,
            "data": {"progress": step * 20, "message": "scanning"}
        }));
    }
    host.send(&json!({"id": id, "result": {"done": true}}));

    assert_eq!(call.await.unwrap(), Ok(json!({"done": true})));
    assert_eq!(h.relay.diagnostics().timeouts, 0);
}

#[tokio::test]
async fn pending_limit_applies_backpressure() {
    let mut h = harness(RelayConfig {
        max_pending_requests: Some(1),
        ..test_config()
    });
    let mut host = h.join("design").await;

    let first = h.spawn_command("get_document_info", json!({}), None);
    let (id, _) = next_command(&mut host).await;

    let err = h
        .relay
        .send_command("get_selection", json!({}), None)
        .await
        .unwrap_err();
    assert_eq!(err, RelayError::Backpressure { limit: 1 });

    host.send(&json!({"id": id, "result": {}}));
    assert_eq!(first.await.unwrap(), Ok(json!({})));
}

#[tokio::test]
async fn abandoned_command_is_unregistered() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_local_components", json!({}), None);
    let (id, _) = next_command(&mut host).await;
    assert_eq!(h.relay.diagnostics().pending_requests, 1);

    call.abort();
    assert!(call.await.unwrap_err().is_cancelled());
    assert_eq!(h.relay.diagnostics().pending_requests, 0);

    host.send(&json!({"id": id, "result": []}));
    round_trip(&h, &mut host).await;
    assert_eq!(h.relay.diagnostics().unknown_id_frames, 1);
}

#[tokio::test]
async fn wrapped_frames_are_unwrapped_and_echoes_ignored() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_selection", json!({}), None);
    let (id, frame) = next_command(&mut host).await;

    // The relay echoes our own command back to the channel.
    host.send(&json!({"type": "broadcast", "channel": "design", "message": frame}));
    host.send(&json!({"type": "system", "message": "Joined channel design"}));
    host.send(&json!({
        "type": "broadcast",
        "channel": "design",
        "message": {"id": id, "result": {"selectionCount": 0}}
    }));

    assert_eq!(call.await.unwrap(), Ok(json!({"selectionCount": 0})));
    let diagnostics = h.relay.diagnostics();
    assert_eq!(diagnostics.malformed_frames, 0);
    assert_eq!(diagnostics.unknown_id_frames, 0);
}

// =============================================================================
// Chunked results
// =============================================================================

#[tokio::test]
async fn chunks_reassemble_to_the_single_response_value() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let chunked = h.spawn_command("scan_text_nodes", json!({"nodeId": "1:1"}), None);
    let (id, _) = next_command(&mut host).await;
    for (index, payload) in [(0, json!(["a"])), (1, json!(["b"])), (1, json!(["b"])), (2, json!(["c"]))] {
        host.send(&json!({"id": id, "chunkIndex": index, "chunkCount": 3, "payload": payload}));
    }
    let chunked = chunked.await.unwrap().unwrap();

    let single = h.spawn_command("scan_text_nodes", json!({"nodeId": "1:1"}), None);
    let (id, _) = next_command(&mut host).await;
    host.send(&json!({"id": id, "result": ["a", "b", "c"]}));
    let single = single.await.unwrap().unwrap();

    assert_eq!(chunked, single);
    let diagnostics = h.relay.diagnostics();
    assert_eq!(diagnostics.duplicate_chunks, 1);
    assert_eq!(diagnostics.buffered_results, 0);
}

#[tokio::test]
async fn chunks_may_arrive_out_of_order() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("scan_text_nodes", json!({"nodeId": "1:1"}), None);
    let (id, _) = next_command(&mut host).await;
    for index in [2, 0, 1] {
        host.send(&json!({
            "id": id,
            "chunkIndex": index,
            "chunkCount": 3,
            "payload": format!("part{index};")
        }));
    }

    assert_eq!(call.await.unwrap(), Ok(json!("part0;part1;part2;")));
}

#[tokio::test]
async fn failed_chunk_rejects_and_discards_the_buffer() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("scan_text_nodes", json!({"nodeId": "1:1"}), None);
    let (id, _) = next_command(&mut host).await;
    host.send(&json!({"id": id, "chunkIndex": 0, "chunkCount": 3, "payload": ["a"]}));
    host.send(&json!({"id": id, "chunkIndex": 1, "chunkCount": 3, "error": "scan aborted"}));
    host.send(&json!({"id": id, "chunkIndex": 2, "chunkCount": 3, "payload": ["c"]}));

    assert_eq!(
        call.await.unwrap(),
        Err(RelayError::Remote {
            message: "scan aborted".to_string()
        })
    );

    round_trip(&h, &mut host).await;
    let diagnostics = h.relay.diagnostics();
    assert_eq!(diagnostics.buffered_results, 0);
    assert_eq!(diagnostics.unknown_id_frames, 1);
}

#[tokio::test]
async fn oversized_chunk_count_is_a_protocol_error() {
    let mut h = harness(RelayConfig {
        max_chunk_count: 4,
        ..test_config()
    });
    let mut host = h.join("design").await;

    let call = h.spawn_command("scan_text_nodes", json!({"nodeId": "1:1"}), None);
    let (id, _) = next_command(&mut host).await;
    host.send(&json!({"id": id, "chunkIndex": 0, "chunkCount": 5, "payload": []}));

    assert!(matches!(
        call.await.unwrap(),
        Err(RelayError::Protocol { .. })
    ));
}

// =============================================================================
// Malformed input
// =============================================================================

#[tokio::test]
async fn malformed_frames_are_counted_not_surfaced() {
    let mut h = harness(test_config());
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_styles", json!({}), None);
    let (id, _) = next_command(&mut host).await;
    host.send_raw("{not json");
    host.send_raw("[1, 2, 3]");
    host.send(&json!({"id": id, "result": {}}));

    assert_eq!(call.await.unwrap(), Ok(json!({})));
    assert_eq!(h.relay.diagnostics().malformed_frames, 2);
    assert!(h.relay.is_connected());
}

#[tokio::test]
async fn malformed_run_forces_a_reconnect() {
    let mut h = harness(RelayConfig {
        malformed_frame_limit: 3,
        ..test_config()
    });
    let mut host = h.join("design").await;

    let call = h.spawn_command("get_styles", json!({}), None);
    next_command(&mut host).await;
    for _ in 0..3 {
        host.send_raw("garbage");
    }

    assert_eq!(call.await.unwrap(), Err(RelayError::ConnectionLost));
    let diagnostics = h.relay.diagnostics();
    assert_eq!(diagnostics.malformed_frames, 3);
    assert_eq!(diagnostics.forced_reconnects, 1);
    assert!(!h.relay.is_connected());

    // The next dispatch reconnects.
    let _host = h.join("design").await;
    assert_eq!(h.connector.attempts(), 2);
}
