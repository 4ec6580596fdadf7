//! Stream transport against a mock voice server.
//!
//! The mock speaks the `/ws/voice` protocol: it acknowledges `start` with
//! `started`, records everything the client sends and forwards any message
//! the test pushes through `MockVoiceServer::say`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use kiosk_voice::config::TransportConfig;
use kiosk_voice::language::Language;
use kiosk_voice::transport::{ConnectionState, StreamTransport, TransportCommand, TransportEvent};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

const WAIT: Duration = Duration::from_secs(5);

struct MockVoiceServer {
    url: String,
    received: mpsc::UnboundedReceiver<Value>,
    outgoing: mpsc::UnboundedSender<Value>,
}

impl MockVoiceServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws/voice", listener.local_addr().unwrap());
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Value>();

        tokio::spawn(async move {
            let mut sessions = 0;
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(socket) = accept_async(stream).await else {
                    continue;
                };
                sessions += 1;
                let (mut write, mut read) = socket.split();

                loop {
                    tokio::select! {
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                let value: Value = serde_json::from_str(text.as_str()).unwrap();
                                if value["type"] == "start" {
                                    let started = json!({
                                        "type": "started",
                                        "session_id": format!("srv-{}", sessions),
                                        "language": value["language"],
                                    });
                                    let _ = write.send(Message::Text(started.to_string().into())).await;
                                }
                                let _ = received_tx.send(value);
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                        Some(value) = outgoing_rx.recv() => {
                            let _ = write.send(Message::Text(value.to_string().into())).await;
                        }
                    }
                }
            }
        });

        Self {
            url,
            received,
            outgoing,
        }
    }

    fn say(&self, message: Value) {
        self.outgoing.send(message).unwrap();
    }

    async fn next_received(&mut self) -> Value {
        timeout(WAIT, self.received.recv())
            .await
            .expect("server received nothing")
            .unwrap()
    }

    /// Skip messages until one of the given type arrives
    async fn expect_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.next_received().await;
            if value["type"] == kind {
                return value;
            }
        }
    }
}

fn transport_config(url: &str) -> TransportConfig {
    TransportConfig {
        enabled: true,
        url: url.to_string(),
        max_reconnect_attempts: 3,
        base_delay: Duration::from_millis(10),
        ..TransportConfig::default()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("no transport event")
        .unwrap()
}

async fn connect(
    server: &MockVoiceServer,
) -> (StreamTransport, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, mut events) = mpsc::unbounded_channel();
    let transport = StreamTransport::spawn(
        transport_config(&server.url),
        "kiosk-1".to_string(),
        Language::Hindi,
        tx,
    );
    match next_event(&mut events).await {
        TransportEvent::Ready { .. } => {}
        other => panic!("expected Ready, got {:?}", other),
    }
    (transport, events)
}

#[test_log::test(tokio::test)]
async fn test_start_handshake_adopts_server_session() {
    let mut server = MockVoiceServer::start().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    let transport = StreamTransport::spawn(
        transport_config(&server.url),
        "kiosk-1".to_string(),
        Language::Hindi,
        tx,
    );

    let start = server.next_received().await;
    assert_eq!(
        start,
        json!({"type": "start", "session_id": "kiosk-1", "language": "hindi"})
    );
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Ready {
            session_id: "srv-1".to_string(),
            language: Some("hindi".to_string()),
        }
    );
    assert_eq!(transport.status().state, ConnectionState::Open);

    transport.shutdown().await.unwrap();
    server.expect_type("stop").await;
}

#[test_log::test(tokio::test)]
async fn test_transcripts_and_replies_are_forwarded() {
    let server = MockVoiceServer::start().await;
    let (transport, mut events) = connect(&server).await;

    server.say(json!({"type": "transcript", "text": "gehun ka", "is_final": false}));
    server.say(json!({
        "type": "response",
        "text": "Aaj gehun ka bhav 2400 rupaye hai",
        "requires_camera": false,
        "image_urls": ["https://example.org/mandi.png"]
    }));

    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Transcript {
            text: "gehun ka".to_string(),
            is_final: false,
        }
    );
    match next_event(&mut events).await {
        TransportEvent::Response(reply) => {
            assert_eq!(reply.text, "Aaj gehun ka bhav 2400 rupaye hai");
            assert_eq!(reply.image_urls, vec!["https://example.org/mandi.png".to_string()]);
            assert!(reply.audio.is_none());
        }
        other => panic!("expected Response, got {:?}", other),
    }

    transport.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_malformed_server_message_is_skipped() {
    let server = MockVoiceServer::start().await;
    let (transport, mut events) = connect(&server).await;

    server.say(json!({"type": "weather", "text": "sunny"}));
    server.say(json!({"type": "error", "message": "asr hiccup"}));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::ServerError("asr hiccup".to_string())
    );

    transport.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_audio_is_sent_in_100ms_chunks_while_recording() {
    let mut server = MockVoiceServer::start().await;
    let (transport, _events) = connect(&server).await;
    server.expect_type("start").await;

    transport.send(TransportCommand::SetRecording(true)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    transport.push_audio(vec![1000; 1200]);
    transport.push_audio(vec![-1000; 1200]);

    let audio = server.expect_type("audio").await;
    let bytes = STANDARD.decode(audio["data"].as_str().unwrap()).unwrap();
    assert_eq!(bytes.len(), 1600 * 2);
    assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 1000);
    assert_eq!(i16::from_le_bytes([bytes[3198], bytes[3199]]), -1000);

    transport.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_language_change_does_not_reconnect() {
    let mut server = MockVoiceServer::start().await;
    let (transport, mut events) = connect(&server).await;
    server.expect_type("start").await;

    transport
        .send(TransportCommand::ChangeLanguage(Language::Tamil))
        .unwrap();
    assert_eq!(
        server.next_received().await,
        json!({"type": "change_language", "language": "tamil"})
    );
    assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());

    transport.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_restart_opens_a_fresh_session() {
    let mut server = MockVoiceServer::start().await;
    let (transport, mut events) = connect(&server).await;
    server.expect_type("start").await;

    transport
        .send(TransportCommand::Restart {
            session_id: "kiosk-2".to_string(),
            language: Language::English,
        })
        .unwrap();

    server.expect_type("stop").await;
    let start = server.expect_type("start").await;
    assert_eq!(start["session_id"], "kiosk-2");
    assert_eq!(start["language"], "english");
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Ready {
            session_id: "srv-2".to_string(),
            language: Some("english".to_string()),
        }
    );

    transport.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_reconnect_backoff_then_exhaustion() {
    // Nothing listens on this port once the listener is dropped
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws/voice", listener.local_addr().unwrap());
    drop(listener);

    let (tx, mut events) = mpsc::unbounded_channel();
    let transport = StreamTransport::spawn(
        transport_config(&url),
        "kiosk-1".to_string(),
        Language::Hindi,
        tx,
    );

    for attempt in 1..=3u32 {
        assert!(matches!(
            next_event(&mut events).await,
            TransportEvent::Disconnected(_)
        ));
        assert_eq!(
            next_event(&mut events).await,
            TransportEvent::Reconnecting {
                attempt,
                delay: Duration::from_millis(10) * attempt,
            }
        );
    }
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Disconnected(_)
    ));
    assert_eq!(
        next_event(&mut events).await,
        TransportEvent::Exhausted { attempts: 3 }
    );

    // Terminal: no further attempts
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
    assert_eq!(transport.status().state, ConnectionState::Closed);

    transport.shutdown().await.unwrap();
}
