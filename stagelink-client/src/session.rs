//! Client session: one logical room subscription across reconnects
//!
//! The driver task is an explicit state machine, Disconnected → Connecting →
//! Open → Disconnected, with the backoff counter owned by the loop. The
//! local view is derived only from replayed + streamed events; a fresh
//! snapshot replaces it wholesale (resync, not merge), so missed broadcasts
//! during an outage never cause divergence.

use crate::backoff::Backoff;
use futures::{SinkExt, StreamExt};
use stagelink_common::db::{Request, RequestAction};
use stagelink_common::proto::{ClientMessage, ServerMessage};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Submission contract: callers learn about a dead transport at call time
/// instead of their messages queueing indefinitely.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("not connected")]
    NotConnected,
    #[error("session closed")]
    Closed,
}

/// The room state a UI renders, derived purely from gateway messages
#[derive(Debug, Clone, Default)]
pub struct RoomView {
    pub room_name: Option<String>,
    pub requests: Vec<Request>,
    pub instruments: Vec<String>,
    /// Most recent error notification from the gateway, for transient toasts
    pub last_error: Option<String>,
}

/// Notifications for the UI layer (connection banner, toasts)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// Snapshot fully applied (after a join or rejoin)
    Snapshot,
    RequestAdded(Request),
    RequestCompleted(i64),
    AllCleared,
    InstrumentAdded(String),
    ErrorMessage(String),
}

/// Tunables; defaults match production use, tests shrink the delays
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

enum Command {
    Send(ClientMessage),
    /// Skip any pending backoff delay and reconnect now
    Reconnect,
    Close,
}

/// Handle to a running room subscription
pub struct ClientSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected_rx: watch::Receiver<bool>,
    view: Arc<Mutex<RoomView>>,
    events_tx: broadcast::Sender<SessionEvent>,
    driver: JoinHandle<()>,
}

impl ClientSession {
    /// Open a session against `base_url` (e.g. `ws://host:5000`) for the
    /// given room key. Returns immediately; the driver task connects in the
    /// background and keeps reconnecting until [`close`](Self::close).
    pub fn connect(base_url: &str, room_key: &str) -> Self {
        Self::connect_with(base_url, room_key, SessionOptions::default())
    }

    pub fn connect_with(base_url: &str, room_key: &str, options: SessionOptions) -> Self {
        let url = format!("{}/ws?room={}", base_url.trim_end_matches('/'), room_key);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(64);
        let view = Arc::new(Mutex::new(RoomView::default()));

        let driver = tokio::spawn(drive(
            url,
            options,
            cmd_rx,
            connected_tx,
            Arc::clone(&view),
            events_tx.clone(),
        ));

        Self {
            cmd_tx,
            connected_rx,
            view,
            events_tx,
            driver,
        }
    }

    /// Whether the transport is currently open
    pub fn connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch channel mirroring the connected state, for "disconnected,
    /// retrying" indicators
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Snapshot of the current room view
    pub fn view(&self) -> RoomView {
        self.view.lock().expect("view lock poisoned").clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Submit a monitor-mix request. Fire-and-forget once accepted; fails
    /// fast when the transport is not open.
    pub fn submit(
        &self,
        musician: &str,
        instrument: &str,
        target_instrument: &str,
        action: RequestAction,
    ) -> Result<(), SessionError> {
        self.send(ClientMessage::Request {
            musician: musician.to_string(),
            instrument: instrument.to_string(),
            target_instrument: target_instrument.to_string(),
            action,
        })
    }

    pub fn complete(&self, request_id: i64) -> Result<(), SessionError> {
        self.send(ClientMessage::CompleteRequest { request_id })
    }

    pub fn clear_all(&self) -> Result<(), SessionError> {
        self.send(ClientMessage::ClearAllRequests)
    }

    pub fn create_instrument(&self, name: &str) -> Result<(), SessionError> {
        self.send(ClientMessage::CreateInstrument {
            name: name.to_string(),
        })
    }

    /// Call when the hosting application returns to the foreground: if the
    /// connection is not open, reconnect immediately instead of waiting out
    /// the backoff timer.
    pub fn resume(&self) {
        if !self.connected() {
            let _ = self.cmd_tx.send(Command::Reconnect);
        }
    }

    /// Explicit local shutdown; the driver will not reconnect after this
    pub async fn close(self) {
        let _ = self.cmd_tx.send(Command::Close);
        let _ = self.driver.await;
    }

    fn send(&self, msg: ClientMessage) -> Result<(), SessionError> {
        if !self.connected() {
            return Err(SessionError::NotConnected);
        }
        self.cmd_tx
            .send(Command::Send(msg))
            .map_err(|_| SessionError::Closed)
    }
}

/// Driver state machine. Join is re-sent implicitly on every reconnect:
/// the room key rides the URL.
async fn drive(
    url: String,
    options: SessionOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    connected_tx: watch::Sender<bool>,
    view: Arc<Mutex<RoomView>>,
    events_tx: broadcast::Sender<SessionEvent>,
) {
    let mut backoff = Backoff::new(options.backoff_base, options.backoff_max);

    loop {
        // Connecting
        match tokio_tungstenite::connect_async(&url).await {
            Ok((socket, _)) => {
                info!("connected to {}", url);
                backoff.reset();
                connected_tx.send_replace(true);
                let _ = events_tx.send(SessionEvent::Connected);

                let local_close = run_open(socket, &mut cmd_rx, &view, &events_tx).await;

                connected_tx.send_replace(false);
                let _ = events_tx.send(SessionEvent::Disconnected);
                if local_close {
                    return;
                }
            }
            Err(e) => {
                warn!("connect to {} failed: {}", url, e);
            }
        }

        // Disconnected: wait out the backoff, unless resumed or closed
        let delay = backoff.next_delay();
        debug!("reconnecting in {:?}", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Reconnect) => break,
                    Some(Command::Close) | None => return,
                    // Not open: the caller already saw NotConnected; per the
                    // submission contract nothing is queued
                    Some(Command::Send(_)) => {}
                }
            }
        }
    }
}

/// Open state: pump commands out and gateway messages in.
/// Returns true when the close was locally requested.
async fn run_open(
    socket: Socket,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    view: &Mutex<RoomView>,
    events_tx: &broadcast::Sender<SessionEvent>,
) -> bool {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode message: {}", e);
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        return false; // transport lost mid-send
                    }
                }
                Some(Command::Reconnect) => {} // already open
                Some(Command::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return true;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    apply_server_text(&text, view, events_tx);
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {} // ping/pong handled by the transport
                Some(Err(e)) => {
                    debug!("transport error: {}", e);
                    return false;
                }
            }
        }
    }
}

fn apply_server_text(
    text: &str,
    view: &Mutex<RoomView>,
    events_tx: &broadcast::Sender<SessionEvent>,
) {
    let msg = match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("ignoring unparseable gateway message: {}", e);
            return;
        }
    };
    apply_server_message(msg, view, events_tx);
}

/// Fold one gateway message into the view. Snapshot messages replace state
/// wholesale; streamed mutations edit it incrementally.
fn apply_server_message(
    msg: ServerMessage,
    view: &Mutex<RoomView>,
    events_tx: &broadcast::Sender<SessionEvent>,
) {
    let mut view = view.lock().expect("view lock poisoned");
    match msg {
        ServerMessage::Joined { room_name, .. } => {
            view.room_name = Some(room_name);
        }
        ServerMessage::InitialRequests(requests) => {
            view.requests = requests;
        }
        ServerMessage::InitialInstruments(instruments) => {
            view.instruments = instruments;
            // Instruments arrive last; the snapshot is now complete
            let _ = events_tx.send(SessionEvent::Snapshot);
        }
        ServerMessage::NewRequest(request) => {
            let _ = events_tx.send(SessionEvent::RequestAdded(request.clone()));
            view.requests.push(request);
        }
        ServerMessage::RequestCompleted(request) => {
            view.requests.retain(|r| r.id != request.id);
            let _ = events_tx.send(SessionEvent::RequestCompleted(request.id));
        }
        ServerMessage::AllRequestsCompleted { .. } => {
            view.requests.clear();
            let _ = events_tx.send(SessionEvent::AllCleared);
        }
        ServerMessage::NewInstrument(instrument) => {
            if !view.instruments.iter().any(|n| n == &instrument.name) {
                view.instruments.push(instrument.name.clone());
            }
            let _ = events_tx.send(SessionEvent::InstrumentAdded(instrument.name));
        }
        ServerMessage::Error { message } => {
            warn!("gateway error: {}", message);
            view.last_error = Some(message.clone());
            let _ = events_tx.send(SessionEvent::ErrorMessage(message));
        }
    }
}
