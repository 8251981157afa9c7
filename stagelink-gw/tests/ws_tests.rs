//! WebSocket integration tests for the realtime gateway
//!
//! These run a real gateway on an ephemeral port and drive it with
//! tokio-tungstenite clients, covering join/snapshot, fan-out, clear-all,
//! error isolation and the join policy.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use stagelink_common::config::GatewayConfig;
use stagelink_common::db::{init_memory_database, RequestAction, Store};
use stagelink_gw::{build_router, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Spawn a gateway over a fresh in-memory database; returns its address and
/// a store handle sharing the same pool for seeding and assertions.
async fn spawn_gateway(auto_create_rooms: bool) -> (SocketAddr, Store) {
    let pool = init_memory_database().await.unwrap();
    let store = Store::new(pool);
    let config = GatewayConfig {
        auto_create_rooms,
        ..GatewayConfig::default()
    };
    let state = Arc::new(AppState::new(store.clone(), config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, store)
}

async fn connect(addr: SocketAddr, room_key: &str) -> Client {
    let url = format!("ws://{}/ws?room={}", addr, room_key);
    let (client, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("Should open WebSocket");
    client
}

/// Next text frame as JSON, skipping transport-level frames
async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Connection closed while waiting for a message")
            .expect("Transport error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("Should parse JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }
}

/// Assert nothing application-level arrives within the window
async fn assert_silent(client: &mut Client) {
    let result = tokio::time::timeout(Duration::from_millis(300), client.next()).await;
    match result {
        Err(_) => {} // timeout: silence, as expected
        Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
        Ok(other) => panic!("Expected silence, got {:?}", other),
    }
}

/// Read and check the three join messages: joined, initialRequests,
/// initialInstruments, in that order. Returns the two snapshot payloads.
async fn read_snapshot(client: &mut Client, room_id: i64) -> (Value, Value) {
    let joined = next_json(client).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["data"]["roomId"], room_id);

    let requests = next_json(client).await;
    assert_eq!(requests["type"], "initialRequests");

    let instruments = next_json(client).await;
    assert_eq!(instruments["type"], "initialInstruments");

    (requests["data"].clone(), instruments["data"].clone())
}

fn submit_envelope(musician: &str, target: &str, action: &str) -> Message {
    Message::Text(
        json!({
            "type": "request",
            "data": {
                "musician": musician,
                "instrument": musician,
                "targetInstrument": target,
                "action": action,
            }
        })
        .to_string(),
    )
}

#[tokio::test]
async fn unknown_room_is_rejected_and_closed() {
    let (addr, _store) = spawn_gateway(false).await;
    let mut client = connect(addr, "no-such-room").await;

    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["message"], "room not found");

    // The gateway closes after the terminal error
    let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Timed out waiting for close");
    assert!(matches!(frame, None | Some(Ok(Message::Close(_)))));
}

#[tokio::test]
async fn auto_create_policy_creates_placeholder_room() {
    let (addr, store) = spawn_gateway(true).await;
    let mut client = connect(addr, "JamNight").await;

    let joined = next_json(&mut client).await;
    assert_eq!(joined["type"], "joined");
    assert_eq!(joined["data"]["roomName"], "JamNight");

    let room = store.find_room_by_name("JamNight").await.unwrap();
    assert!(room.is_some());
}

#[tokio::test]
async fn snapshot_is_exhaustive_and_exclusive() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();
    let (other, _) = store.find_or_create_room("Otro").await.unwrap();

    let active = store
        .insert_request(room.id, "Ana", "Voz", "Guitarra", RequestAction::VolumeUp)
        .await
        .unwrap();
    let done = store
        .insert_request(room.id, "Luis", "Bajo", "Bajo", RequestAction::ReverbUp)
        .await
        .unwrap();
    store.complete_request(done.id).await.unwrap();
    store
        .insert_request(other.id, "Eva", "Teclado", "Voz", RequestAction::Thanks)
        .await
        .unwrap();
    store
        .find_or_create_custom_instrument(room.id, "Sax")
        .await
        .unwrap();

    let mut client = connect(addr, &room.id.to_string()).await;
    let (requests, instruments) = read_snapshot(&mut client, room.id).await;

    // Only this room's active row, no completed rows, no other rooms
    let rows = requests.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_i64().unwrap(), active.id);
    assert_eq!(rows[0]["completed"], false);

    assert_eq!(instruments, json!(["Sax"]));
}

#[tokio::test]
async fn submit_fans_out_to_every_member_including_sender() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();

    let mut musician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut musician, room.id).await;
    let mut technician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut technician, room.id).await;

    musician
        .send(submit_envelope("Ana", "Guitarra", "volume_up"))
        .await
        .unwrap();

    let to_musician = next_json(&mut musician).await;
    let to_technician = next_json(&mut technician).await;
    assert_eq!(to_musician["type"], "newRequest");
    assert_eq!(to_technician, to_musician);

    // The broadcast carries the persisted row with its fresh id
    let id = to_musician["data"]["id"].as_i64().unwrap();
    let persisted = store.list_active_requests(room.id).await.unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].id, id);
    assert_eq!(to_musician["data"]["targetInstrument"], "Guitarra");
    assert_eq!(to_musician["data"]["action"], "volume_up");
}

#[tokio::test]
async fn join_during_submissions_never_loses_requests() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();

    const TOTAL: usize = 20;
    let mut submitter = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut submitter, room.id).await;
    let feeder = tokio::spawn(async move {
        for i in 0..TOTAL {
            submitter
                .send(submit_envelope(&format!("M{}", i), "Voz", "volume_up"))
                .await
                .unwrap();
        }
        let mut echoed = 0;
        while echoed < TOTAL {
            if next_json(&mut submitter).await["type"] == "newRequest" {
                echoed += 1;
            }
        }
    });

    // Join mid-stream: every request must arrive exactly once, either in the
    // snapshot or on the stream, never both and never neither
    let mut joiner = connect(addr, &room.id.to_string()).await;
    let (requests, _) = read_snapshot(&mut joiner, room.id).await;
    let mut seen: std::collections::HashSet<i64> = requests
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["id"].as_i64().unwrap())
        .collect();
    while seen.len() < TOTAL {
        let event = next_json(&mut joiner).await;
        assert_eq!(event["type"], "newRequest");
        let id = event["data"]["id"].as_i64().unwrap();
        assert!(seen.insert(id), "request {} delivered twice", id);
    }

    feeder.await.unwrap();
    assert_eq!(store.list_active_requests(room.id).await.unwrap().len(), TOTAL);
}

#[tokio::test]
async fn complete_one_broadcasts_the_completed_row() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();
    let req = store
        .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::ReverbDown)
        .await
        .unwrap();

    let mut musician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut musician, room.id).await;
    let mut technician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut technician, room.id).await;

    technician
        .send(Message::Text(
            json!({ "type": "completeRequest", "data": { "requestId": req.id } }).to_string(),
        ))
        .await
        .unwrap();

    for client in [&mut musician, &mut technician] {
        let event = next_json(client).await;
        assert_eq!(event["type"], "requestCompleted");
        assert_eq!(event["data"]["id"].as_i64().unwrap(), req.id);
        assert_eq!(event["data"]["completed"], true);
    }

    assert!(store.list_active_requests(room.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn completing_another_rooms_request_is_rejected() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();
    let (other, _) = store.find_or_create_room("Otro").await.unwrap();
    let req = store
        .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::VolumeUp)
        .await
        .unwrap();

    let mut owner = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut owner, room.id).await;
    let mut outsider = connect(addr, &other.id.to_string()).await;
    read_snapshot(&mut outsider, other.id).await;

    outsider
        .send(Message::Text(
            json!({ "type": "completeRequest", "data": { "requestId": req.id } }).to_string(),
        ))
        .await
        .unwrap();

    let reply = next_json(&mut outsider).await;
    assert_eq!(reply["type"], "error");
    // The owning room hears nothing and the row stays active
    assert_silent(&mut owner).await;
    assert_eq!(store.list_active_requests(room.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn clear_all_emits_one_room_wide_event() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();
    for _ in 0..3 {
        store
            .insert_request(room.id, "Ana", "Voz", "Voz", RequestAction::VolumeDown)
            .await
            .unwrap();
    }

    let mut musician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut musician, room.id).await;
    let mut technician = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut technician, room.id).await;

    technician
        .send(Message::Text(json!({ "type": "clearAllRequests" }).to_string()))
        .await
        .unwrap();

    // Exactly one event per connection, not one per cleared row
    for client in [&mut musician, &mut technician] {
        let event = next_json(client).await;
        assert_eq!(event["type"], "allRequestsCompleted");
        assert_eq!(event["data"]["roomId"], room.id);
        assert_silent(client).await;
    }

    assert!(store.list_active_requests(room.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_payload_is_ignored_and_connection_survives() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();

    let mut client = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut client, room.id).await;

    client
        .send(Message::Text("definitely not json".to_string()))
        .await
        .unwrap();
    client
        .send(Message::Text(json!({ "type": "shout" }).to_string()))
        .await
        .unwrap();

    // Connection still works after the garbage
    client
        .send(submit_envelope("Ana", "Voz", "thanks"))
        .await
        .unwrap();
    let event = next_json(&mut client).await;
    assert_eq!(event["type"], "newRequest");
}

#[tokio::test]
async fn validation_errors_go_to_sender_only() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();

    let mut offender = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut offender, room.id).await;
    let mut bystander = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut bystander, room.id).await;

    offender
        .send(submit_envelope("Ana", "   ", "volume_up"))
        .await
        .unwrap();

    let reply = next_json(&mut offender).await;
    assert_eq!(reply["type"], "error");
    assert_silent(&mut bystander).await;

    // Completing a nonexistent request behaves the same way
    offender
        .send(Message::Text(
            json!({ "type": "completeRequest", "data": { "requestId": 12345 } }).to_string(),
        ))
        .await
        .unwrap();
    let reply = next_json(&mut offender).await;
    assert_eq!(reply["type"], "error");
    assert_silent(&mut bystander).await;
}

#[tokio::test]
async fn create_instrument_is_idempotent_and_always_confirmed() {
    let (addr, store) = spawn_gateway(false).await;
    let (room, _) = store.find_or_create_room("Ensayo1").await.unwrap();

    let mut client = connect(addr, &room.id.to_string()).await;
    read_snapshot(&mut client, room.id).await;

    let create = json!({ "type": "createInstrument", "data": { "name": " Sax " } }).to_string();
    client.send(Message::Text(create.clone())).await.unwrap();
    let first = next_json(&mut client).await;
    assert_eq!(first["type"], "newInstrument");
    assert_eq!(first["data"]["name"], "Sax");

    // Duplicate create still confirms, with the same row
    client.send(Message::Text(create)).await.unwrap();
    let second = next_json(&mut client).await;
    assert_eq!(second, first);

    let names = store.list_custom_instruments(room.id).await.unwrap();
    assert_eq!(names, vec!["Sax".to_string()]);
}
