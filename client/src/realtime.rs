use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::header::AUTHORIZATION, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

use crate::protocol::{ChatMessage, ChatSend, PlaybackSnapshot};
use crate::stomp::{self, Command, Frame};

/// Fixed backoff between connection attempts; the component does not
/// distinguish first connect from reconnect.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);
/// Upper bound on connect + STOMP handshake before the attempt counts as
/// failed and the backoff kicks in.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the realtime connection delivers to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Snapshot(PlaybackSnapshot),
    Chat(ChatMessage),
    /// Auth or transport failure. Non-fatal: the UI keeps last-known state.
    ConnectionError(String),
}

/// The per-session destination set on the broker.
#[derive(Debug, Clone)]
pub struct Topics {
    /// Initial-state push on subscribe.
    pub state_app: String,
    /// Ongoing state broadcasts; routed to the same handler as the push.
    pub state_topic: String,
    pub chat_topic: String,
    pub chat_send: String,
}

impl Topics {
    pub fn new(schedule_id: u64) -> Self {
        Self {
            state_app: format!("/app/theaters/{schedule_id}/state"),
            state_topic: format!("/topic/theaters/{schedule_id}/state"),
            chat_topic: format!("/topic/theaters/{schedule_id}/chat"),
            chat_send: format!("/app/chat/{schedule_id}"),
        }
    }
}

/// Route one decoded frame to a session event. Malformed payloads and
/// unknown destinations yield `None` and are dropped silently.
fn route_frame(frame: &Frame, topics: &Topics) -> Option<RealtimeEvent> {
    match frame.command {
        Command::Message => {
            let destination = frame.get("destination")?;
            if destination == topics.state_app || destination == topics.state_topic {
                match serde_json::from_str::<PlaybackSnapshot>(&frame.body) {
                    Ok(snapshot) => Some(RealtimeEvent::Snapshot(snapshot)),
                    Err(err) => {
                        tracing::debug!(%err, "dropping malformed state payload");
                        None
                    }
                }
            } else if destination == topics.chat_topic {
                match serde_json::from_str::<ChatMessage>(&frame.body) {
                    Ok(chat) => Some(RealtimeEvent::Chat(chat)),
                    Err(err) => {
                        tracing::debug!(%err, "dropping malformed chat payload");
                        None
                    }
                }
            } else {
                tracing::debug!(destination, "message for unknown destination");
                None
            }
        }
        Command::Error => {
            let detail = frame
                .get("message")
                .map(str::to_string)
                .unwrap_or_else(|| frame.body.clone());
            Some(RealtimeEvent::ConnectionError(detail))
        }
        // CONNECTED is consumed by the handshake; RECEIPT is ignored.
        _ => None,
    }
}

enum ConnectionOutcome {
    Deactivated,
    Disconnected,
}

/// One realtime connection per session: WebSocket + STOMP handshake,
/// three subscriptions, outbound chat, automatic reconnection.
pub struct RealtimeClient {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RealtimeClient {
    pub fn spawn(
        ws_url: String,
        bearer_token: Option<String>,
        schedule_id: u64,
        events: mpsc::UnboundedSender<RealtimeEvent>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let topics = Topics::new(schedule_id);
        let task = tokio::spawn(run_connection_loop(
            ws_url,
            bearer_token,
            topics,
            events,
            outbound_rx,
            shutdown_rx,
        ));
        Self {
            outbound,
            shutdown,
            task,
        }
    }

    /// Queue an already-composed chat message for publication.
    pub fn send_chat(&self, message: String) {
        let _ = self.outbound.send(message);
    }

    /// Stop the connection loop and close the socket. Consumes the client,
    /// so teardown happens exactly once, before the session's leave call.
    pub async fn deactivate(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run_connection_loop(
    ws_url: String,
    bearer_token: Option<String>,
    topics: Topics,
    events: mpsc::UnboundedSender<RealtimeEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        match run_connection(
            &ws_url,
            bearer_token.as_deref(),
            &topics,
            &events,
            &mut outbound_rx,
            &mut shutdown_rx,
        )
        .await
        {
            Ok(ConnectionOutcome::Deactivated) => return,
            Ok(ConnectionOutcome::Disconnected) => {
                tracing::info!("realtime connection lost, reconnecting");
            }
            Err(err) => {
                tracing::warn!(%err, "realtime connection attempt failed");
                let _ = events.send(RealtimeEvent::ConnectionError(err.to_string()));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown_signal(&mut shutdown_rx) => return,
        }
    }
}

async fn run_connection(
    ws_url: &str,
    bearer_token: Option<&str>,
    topics: &Topics,
    events: &mpsc::UnboundedSender<RealtimeEvent>,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<ConnectionOutcome> {
    // The connect and handshake race the shutdown signal, so deactivation
    // never waits on a broker that accepted the socket and then stalled.
    let (mut sink, mut stream) = tokio::select! {
        attempt = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            establish_session(ws_url, bearer_token, topics, events),
        ) => match attempt {
            Ok(established) => established?,
            Err(_) => anyhow::bail!("broker handshake timed out"),
        },
        _ = shutdown_signal(shutdown_rx) => return Ok(ConnectionOutcome::Deactivated),
    };
    tracing::info!("realtime connection established");

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown_signal(shutdown_rx) => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(ConnectionOutcome::Deactivated);
            }
            Some(text) = outbound_rx.recv() => {
                let body = serde_json::to_string(&ChatSend { message: text })?;
                let frame = Frame::new(Command::Send)
                    .header("destination", &topics.chat_send)
                    .header("content-type", "application/json")
                    .body(body);
                if sink.send(WsMessage::Text(frame.encode().into())).await.is_err() {
                    return Ok(ConnectionOutcome::Disconnected);
                }
            }
            _ = keepalive.tick() => {
                if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return Ok(ConnectionOutcome::Disconnected);
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if stomp::is_heartbeat(&text) {
                            continue;
                        }
                        match Frame::decode(&text) {
                            Ok(frame) => {
                                if let Some(event) = route_frame(&frame, topics) {
                                    let _ = events.send(event);
                                }
                            }
                            Err(err) => tracing::debug!(%err, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return Ok(ConnectionOutcome::Disconnected);
                    }
                    Some(Err(err)) => {
                        tracing::warn!(%err, "realtime socket error");
                        return Ok(ConnectionOutcome::Disconnected);
                    }
                    _ => {}
                }
            }
        }
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

async fn establish_session(
    ws_url: &str,
    bearer_token: Option<&str>,
    topics: &Topics,
    events: &mpsc::UnboundedSender<RealtimeEvent>,
) -> anyhow::Result<(WsSink, WsStream)> {
    let mut request = ws_url.into_client_request()?;
    if let Some(token) = bearer_token {
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse()?);
    }

    let (ws_stream, _) = connect_async(request).await?;
    let (mut sink, mut stream) = ws_stream.split();

    // STOMP handshake. Spring reads the bearer token from the CONNECT
    // frame headers, so it travels there as well.
    let host = url::Url::parse(ws_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string());
    let mut connect = Frame::new(Command::Connect)
        .header("accept-version", "1.2")
        .header("host", &host)
        .header("heart-beat", "0,0");
    if let Some(token) = bearer_token {
        connect = connect.header("Authorization", &format!("Bearer {token}"));
    }
    sink.send(WsMessage::Text(connect.encode().into())).await?;

    await_connected(&mut stream, events).await?;

    for (id, destination) in [
        ("sub-0", topics.state_app.as_str()),
        ("sub-1", topics.state_topic.as_str()),
        ("sub-2", topics.chat_topic.as_str()),
    ] {
        let frame = Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination);
        sink.send(WsMessage::Text(frame.encode().into())).await?;
    }
    Ok((sink, stream))
}

/// Resolves once shutdown is requested. If the handle is gone without a
/// shutdown the future never resolves; the socket arm ends the loop.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    if *rx.borrow() {
        return;
    }
    while rx.changed().await.is_ok() {
        if *rx.borrow() {
            return;
        }
    }
    std::future::pending().await
}

async fn await_connected<S>(
    stream: &mut S,
    events: &mpsc::UnboundedSender<RealtimeEvent>,
) -> anyhow::Result<()>
where
    S: Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message? {
            WsMessage::Text(text) => {
                if stomp::is_heartbeat(&text) {
                    continue;
                }
                let frame = Frame::decode(&text)?;
                match frame.command {
                    Command::Connected => return Ok(()),
                    Command::Error => {
                        let detail = frame
                            .get("message")
                            .map(str::to_string)
                            .unwrap_or_else(|| frame.body.clone());
                        let _ = events.send(RealtimeEvent::ConnectionError(detail.clone()));
                        anyhow::bail!("broker rejected connect: {detail}");
                    }
                    other => tracing::debug!(?other, "unexpected frame before CONNECTED"),
                }
            }
            WsMessage::Close(_) => anyhow::bail!("socket closed during handshake"),
            _ => {}
        }
    }
    anyhow::bail!("socket ended during handshake")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PlaybackPhase;

    fn topics() -> Topics {
        Topics::new(42)
    }

    fn message_frame(destination: &str, body: &str) -> Frame {
        Frame::new(Command::Message)
            .header("destination", destination)
            .header("subscription", "sub-1")
            .body(body)
    }

    const SNAPSHOT_BODY: &str = r#"{"status":"PLAYING","playing":true,"positionMs":1000,"playbackRate":1.0,"serverTimeMs":5}"#;

    #[test]
    fn initial_push_and_broadcast_route_to_the_same_handler() {
        let topics = topics();
        for destination in ["/app/theaters/42/state", "/topic/theaters/42/state"] {
            let event = route_frame(&message_frame(destination, SNAPSHOT_BODY), &topics).unwrap();
            match event {
                RealtimeEvent::Snapshot(snap) => assert_eq!(snap.status, PlaybackPhase::Playing),
                other => panic!("expected snapshot, got {other:?}"),
            }
        }
    }

    #[test]
    fn chat_routes_to_the_chat_handler() {
        let topics = topics();
        let body = r#"{"scheduleId":42,"nickname":"mina","message":"hello"}"#;
        let event = route_frame(&message_frame("/topic/theaters/42/chat", body), &topics).unwrap();
        assert_eq!(
            event,
            RealtimeEvent::Chat(ChatMessage {
                schedule_id: 42,
                nickname: "mina".into(),
                message: "hello".into(),
                sent_at: None,
            })
        );
    }

    #[test]
    fn malformed_payloads_are_dropped_silently() {
        let topics = topics();
        assert!(route_frame(&message_frame("/topic/theaters/42/state", "not json"), &topics).is_none());
        assert!(route_frame(&message_frame("/topic/theaters/42/chat", "{\"broken\":"), &topics).is_none());
    }

    #[test]
    fn unknown_destinations_are_dropped() {
        let topics = topics();
        let frame = message_frame("/topic/theaters/7/state", SNAPSHOT_BODY);
        assert!(route_frame(&frame, &topics).is_none());
    }

    #[tokio::test]
    async fn deactivate_completes_while_the_broker_stalls_mid_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept the socket and never answer the upgrade request.
            let _held = listener.accept().await;
            std::future::pending::<()>().await;
        });

        let (events_tx, _events) = mpsc::unbounded_channel();
        let client = RealtimeClient::spawn(format!("ws://{addr}"), None, 1, events_tx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(2), client.deactivate())
            .await
            .expect("deactivate must not wait on a stalled handshake");
    }

    #[test]
    fn error_frames_surface_as_connection_errors() {
        let topics = topics();
        let frame = Frame::new(Command::Error).header("message", "bad credentials");
        assert_eq!(
            route_frame(&frame, &topics),
            Some(RealtimeEvent::ConnectionError("bad credentials".into()))
        );
    }
}
