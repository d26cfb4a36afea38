//! Integration tests: a `GatewayClient` against the in-process mock gateway.

mod common;

use common::{eventually, MockGateway, MockOptions};
use futures_util::StreamExt;
use perch::gateway::{bridge_stream, BridgeMessage, ConnectionStatus, GatewayError, StreamBridge};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test]
async fn concurrent_ensure_connected_shares_one_socket() {
    let mock = MockGateway::start().await;
    let client = mock.client();

    let attempts = (0..8).map(|_| client.ensure_connected());
    let results = futures_util::future::join_all(attempts).await;
    assert!(results.iter().all(|r| r.is_ok()), "{:?}", results);

    assert_eq!(mock.connections(), 1);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    assert_eq!(client.hello().map(|h| h.protocol), Some(3));

    client.ensure_connected().await.unwrap();
    assert_eq!(mock.connections(), 1);
    client.destroy();
}

#[tokio::test]
async fn handshake_carries_identity_and_credential() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let params = mock.connect_params();
    assert_eq!(params.len(), 1);
    let p = &params[0];
    assert_eq!(p["auth"], json!({ "token": common::TOKEN }));
    assert_eq!(p["minProtocol"], 3);
    assert_eq!(p["maxProtocol"], 3);
    assert_eq!(p["client"]["id"], "perch");
    assert_eq!(p["role"], "operator");
    assert_eq!(p["scopes"], json!(["operator.read", "operator.write"]));
    client.destroy();
}

#[tokio::test]
async fn rpc_resolves_with_payload() {
    let mock = MockGateway::start().await;
    let client = mock.client();

    let payload = client.rpc("echo", json!({ "x": 1 }), None).await.unwrap();
    assert_eq!(payload, json!({ "x": 1 }));
    assert_eq!(client.pending_calls(), 0);
    client.destroy();
}

#[tokio::test]
async fn responses_are_matched_by_id_not_order() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let slow = {
        let finished = finished.clone();
        let client = client.clone();
        async move {
            let v = client
                .rpc("delay", json!({ "ms": 150, "value": "slow" }), None)
                .await;
            finished.lock().unwrap().push("slow");
            v
        }
    };
    let fast = {
        let finished = finished.clone();
        let client = client.clone();
        async move {
            let v = client
                .rpc("delay", json!({ "ms": 10, "value": "fast" }), None)
                .await;
            finished.lock().unwrap().push("fast");
            v
        }
    };
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), json!({ "value": "slow" }));
    assert_eq!(fast.unwrap(), json!({ "value": "fast" }));
    assert_eq!(*finished.lock().unwrap(), vec!["fast", "slow"]);
    client.destroy();
}

#[tokio::test]
async fn timed_out_call_ignores_late_response() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let started = Instant::now();
    let err = client
        .rpc(
            "delay",
            json!({ "ms": 200, "value": "late" }),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    match err {
        GatewayError::RpcTimeout { method, timeout } => {
            assert_eq!(method, "delay");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(45), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(180), "{:?}", elapsed);
    assert_eq!(client.pending_calls(), 0);

    // The late reply lands on an unknown id and is dropped; the socket stays usable.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(client.status(), ConnectionStatus::Connected);
    let v = client.rpc("echo", json!("still here"), None).await.unwrap();
    assert_eq!(v, json!("still here"));
    assert_eq!(mock.connections(), 1);
    client.destroy();
}

#[tokio::test]
async fn gateway_error_response_surfaces_code_and_details() {
    let mock = MockGateway::start().await;
    let client = mock.client();

    let err = client.rpc("fail", Value::Null, None).await.unwrap_err();
    match err {
        GatewayError::Rpc {
            code,
            message,
            details,
        } => {
            assert_eq!(code, "BAD_REQUEST");
            assert_eq!(message, "nope");
            assert_eq!(details, Some(json!({ "field": "x" })));
        }
        other => panic!("expected rpc error, got {:?}", other),
    }
    // A failed call does not affect the connection.
    assert_eq!(client.status(), ConnectionStatus::Connected);
    client.destroy();
}

#[tokio::test]
async fn destroy_rejects_pending_and_stays_down() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.rpc("never", Value::Null, None).await })
    };
    assert!(eventually(Duration::from_secs(2), || client.pending_calls() == 1).await);

    client.destroy();
    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .expect("pending call settled")
        .expect("task joined");
    assert!(matches!(result, Err(GatewayError::Closed)), "{:?}", result);

    assert!(matches!(
        client.rpc("echo", Value::Null, None).await,
        Err(GatewayError::Destroyed)
    ));
    assert!(matches!(
        client.ensure_connected().await,
        Err(GatewayError::Destroyed)
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.connections(), 1);
    assert_eq!(client.status(), ConnectionStatus::Destroyed);
}

#[tokio::test]
async fn dropped_socket_rejects_pending_and_reconnects() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let never = {
        let client = client.clone();
        tokio::spawn(async move { client.rpc("never", Value::Null, None).await })
    };
    assert!(eventually(Duration::from_secs(2), || client.pending_calls() == 1).await);

    let dropped = client.rpc("drop", Value::Null, None).await;
    assert!(matches!(dropped, Err(GatewayError::Closed)), "{:?}", dropped);
    let never = never.await.expect("task joined");
    assert!(matches!(never, Err(GatewayError::Closed)), "{:?}", never);

    assert!(
        eventually(Duration::from_secs(3), || mock.connections() == 2
            && client.status() == ConnectionStatus::Connected)
        .await,
        "client did not reconnect"
    );
    let v = client.rpc("echo", json!(1), None).await.unwrap();
    assert_eq!(v, json!(1));
    client.destroy();
}

#[tokio::test]
async fn rejected_handshake_is_a_connection_error() {
    let mock = MockGateway::start_with(MockOptions {
        token: "someone-else".to_string(),
        ..MockOptions::default()
    })
    .await;
    let client = mock.client();

    let err = client.ensure_connected().await.unwrap_err();
    match &err {
        GatewayError::Connection(message) => {
            assert!(message.contains("UNAUTHORIZED"), "{}", message)
        }
        other => panic!("expected connection error, got {:?}", other),
    }
    assert_ne!(client.status(), ConnectionStatus::Connected);
    assert!(client.hello().is_none());
    client.destroy();
}

#[tokio::test]
async fn slow_hello_is_shared_by_waiters() {
    let mock = MockGateway::start_with(MockOptions {
        hello_delay: Duration::from_millis(150),
        ..MockOptions::default()
    })
    .await;
    let client = mock.client();

    let first = client.ensure_connected();
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.status(), ConnectionStatus::Connecting);
        client.rpc("echo", json!("after hello"), None).await
    };
    let (first, second) = tokio::join!(first, second);
    first.unwrap();
    assert_eq!(second.unwrap(), json!("after hello"));
    assert_eq!(mock.connections(), 1);
    client.destroy();
}

#[tokio::test]
async fn silent_gateway_trips_liveness_watchdog() {
    let mock = MockGateway::start_with(MockOptions {
        tick_interval_ms: Some(50),
        ..MockOptions::default()
    })
    .await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();
    assert_eq!(
        client.hello().and_then(|h| h.policy).and_then(|p| p.tick_interval_ms),
        Some(50)
    );

    assert!(
        eventually(Duration::from_secs(3), || mock.connections() >= 2).await,
        "watchdog never dropped the silent connection"
    );
    client.destroy();
}

#[tokio::test]
async fn events_route_by_conversation_key() {
    let mock = MockGateway::start().await;
    let client = mock.client();

    let keyed = Arc::new(Mutex::new(Vec::new()));
    let all = Arc::new(Mutex::new(Vec::new()));
    let _s1 = {
        let keyed = keyed.clone();
        client.subscribe("s1", move |e| keyed.lock().unwrap().push(e.name.clone()))
    };
    let _all = {
        let all = all.clone();
        client.subscribe_all(move |e| all.lock().unwrap().push(e.name.clone()))
    };

    client
        .rpc(
            "emit",
            json!({ "events": [
                { "event": "agent", "payload": { "sessionKey": "s1", "stream": "assistant", "data": { "delta": "a" } }, "seq": 1 },
                { "event": "chat", "payload": { "session": "s2", "state": "delta" }, "seq": 2 },
                { "event": "health", "payload": { "data": { "sessionKey": "s1" } }, "seq": 3 },
                { "event": "tick", "payload": {}, "seq": 4 }
            ] }),
            None,
        )
        .await
        .unwrap();

    // Events precede the reply on the socket, so they are dispatched by now.
    assert_eq!(*keyed.lock().unwrap(), vec!["agent", "health"]);
    assert_eq!(*all.lock().unwrap(), vec!["agent", "chat", "health", "tick"]);
    client.destroy();
}

#[tokio::test]
async fn wrapping_event_seq_keeps_connection_usable() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _all = {
        let seen = seen.clone();
        client.subscribe_all(move |e| seen.lock().unwrap().push(e.seq))
    };

    client
        .rpc(
            "emit",
            json!({ "events": [
                { "event": "tick", "payload": {}, "seq": u64::MAX },
                { "event": "tick", "payload": {}, "seq": 1 }
            ] }),
            None,
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![Some(u64::MAX), Some(1)]);
    assert_eq!(client.status(), ConnectionStatus::Connected);
    let v = client.rpc("echo", json!("alive"), None).await.unwrap();
    assert_eq!(v, json!("alive"));
    assert_eq!(mock.connections(), 1);
    client.destroy();
}

#[tokio::test]
async fn bridge_streams_agent_tokens_and_finishes() {
    let mock = MockGateway::start().await;
    let client = mock.client();
    client.ensure_connected().await.unwrap();

    let (bridge, rx) = StreamBridge::channel(client.router(), "s1");
    let stream = bridge_stream(bridge, rx, Some(Duration::from_secs(2)));

    client
        .rpc(
            "emit",
            json!({ "events": [
                { "event": "agent", "payload": { "sessionKey": "s1", "stream": "assistant", "text": "Hi" } },
                { "event": "chat", "payload": { "sessionKey": "s1", "state": "delta", "text": "Hi" } },
                { "event": "agent", "payload": { "sessionKey": "s2", "stream": "assistant", "text": "other" } },
                { "event": "chat", "payload": { "sessionKey": "s1", "state": "final" } }
            ] }),
            None,
        )
        .await
        .unwrap();

    let messages: Vec<BridgeMessage> = stream.collect().await;
    assert_eq!(
        messages,
        vec![
            BridgeMessage::Connected {
                session_key: "s1".into()
            },
            BridgeMessage::Delta {
                text: "Hi".into(),
                session_key: "s1".into()
            },
            BridgeMessage::Done {
                session_key: "s1".into(),
                status: "ok".into(),
                error: None
            },
        ]
    );
    assert_eq!(client.router().listener_count(), 0);
    client.destroy();
}
