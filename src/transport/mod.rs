//! Stream Transport
//!
//! Alternative recognition path: a persistent websocket to the voice server
//! that receives 100 ms audio frames and answers with transcripts and agent
//! replies. The connection runs in its own tokio task and reconnects with a
//! linear backoff until the attempt budget is spent.

pub mod chunker;
pub mod protocol;
pub mod reconnect;

use crate::config::TransportConfig;
use crate::error::{Result, VoiceError};
use crate::language::Language;
use chunker::AudioChunker;
use futures_util::{SinkExt, StreamExt};
use protocol::{AgentReply, ClientMessage, ServerMessage};
use reconnect::{Backoff, ReconnectPolicy};
use std::time::Duration;
use strum::Display;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
const AUDIO_QUEUE: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control messages from the controller to the transport task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// Start or pause sending audio frames
    SetRecording(bool),
    ChangeLanguage(Language),
    /// Close the current session and open a fresh one
    Restart { session_id: String, language: Language },
    Shutdown,
}

/// Notifications from the transport task
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// `started` received, the connection is usable
    Ready { session_id: String, language: Option<String> },
    Transcript { text: String, is_final: bool },
    Response(AgentReply),
    /// Non-fatal error reported by the server
    ServerError(String),
    Disconnected(String),
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: no further reconnects until a restart
    Exhausted { attempts: u32 },
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// Observable connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
}

/// Handle to the transport task
pub struct StreamTransport {
    commands: mpsc::UnboundedSender<TransportCommand>,
    audio: mpsc::Sender<Vec<i16>>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl StreamTransport {
    pub fn spawn(
        config: TransportConfig,
        session_id: String,
        language: Language,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            reconnect_attempt: 0,
        });

        let task = TransportTask {
            policy: ReconnectPolicy::new(config.max_reconnect_attempts, config.base_delay),
            chunker: AudioChunker::new(config.chunk_samples()),
            config,
            session_id,
            language,
            recording: false,
            pending: None,
            events,
            commands: commands_rx,
            audio: audio_rx,
            status: status_tx,
        };

        Self {
            commands: commands_tx,
            audio: audio_tx,
            status: status_rx,
            task: tokio::spawn(task.run()),
        }
    }

    pub fn send(&self, command: TransportCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| VoiceError::Closed("transport task has exited".to_string()))
    }

    /// Queue captured samples. Frames are dropped when the task falls behind.
    pub fn push_audio(&self, samples: Vec<i16>) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.audio.try_send(samples) {
            log::debug!("Transport audio queue full, dropping frame");
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Send `stop`, close the socket and wait for the task to finish
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(TransportCommand::Shutdown);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(VoiceError::Transport(format!("transport task failed: {}", e))),
            Err(_) => Err(VoiceError::Transport("transport shutdown timed out".to_string())),
        }
    }
}

/// How a connected session or a wait ended
enum Flow {
    Shutdown,
    Restart,
    Dropped(String),
}

struct TransportTask {
    config: TransportConfig,
    session_id: String,
    language: Language,
    recording: bool,
    policy: ReconnectPolicy,
    chunker: AudioChunker,
    // At most one chunk waits for the connection to become usable
    pending: Option<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    commands: mpsc::UnboundedReceiver<TransportCommand>,
    audio: mpsc::Receiver<Vec<i16>>,
    status: watch::Sender<ConnectionStatus>,
}

impl TransportTask {
    async fn run(mut self) {
        log::info!("🌐 Stream transport starting for {}", self.config.url);

        loop {
            self.set_state(ConnectionState::Connecting);
            let flow = match self.connect().await {
                Ok(socket) => self.session(socket).await,
                Err(e) => Flow::Dropped(e.to_string()),
            };
            self.set_state(ConnectionState::Closed);

            match flow {
                Flow::Shutdown => break,
                Flow::Restart => continue,
                Flow::Dropped(reason) => {
                    log::warn!("⚠️ Stream connection lost: {}", reason);
                    self.emit(TransportEvent::Disconnected(reason));

                    let next = match self.policy.on_failure() {
                        Some(Backoff::Retry { attempt, delay }) => {
                            log::info!(
                                "🔄 Reconnecting in {:?} (attempt {}/{})",
                                delay,
                                attempt,
                                self.config.max_reconnect_attempts
                            );
                            self.emit(TransportEvent::Reconnecting { attempt, delay });
                            self.wait(Some(delay)).await
                        }
                        Some(Backoff::Exhausted { attempts }) => {
                            log::error!("❌ Stream transport gave up after {} reconnect attempts", attempts);
                            self.emit(TransportEvent::Exhausted { attempts });
                            self.wait(None).await
                        }
                        None => self.wait(None).await,
                    };

                    if let Some(Flow::Shutdown) = next {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        log::info!("🌐 Stream transport stopped");
    }

    async fn connect(&mut self) -> Result<Socket> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = self.config.token() {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| VoiceError::Transport(format!("invalid token header: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        log::debug!("Connecting to {}", self.config.url);
        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| VoiceError::Transport("connect timed out".to_string()))??;
        log::info!("🔌 Connected to stream server");
        Ok(socket)
    }

    async fn session(&mut self, socket: Socket) -> Flow {
        let (mut write, mut read) = socket.split();
        let mut ready = false;

        let start = ClientMessage::Start {
            session_id: self.session_id.clone(),
            language: self.language,
        };
        if let Err(e) = send(&mut write, &start).await {
            return Flow::Dropped(e.to_string());
        }

        loop {
            tokio::select! {
                message = read.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("⚠️ {}", protocol::ProtocolError::UnexpectedBinary(data.len()));
                            continue;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server ({})", f.code))
                                .unwrap_or_else(|| "closed by server".to_string());
                            return Flow::Dropped(reason);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Flow::Dropped(e.to_string()),
                        None => return Flow::Dropped("stream ended".to_string()),
                    };

                    let message = match ServerMessage::parse(text.as_str()) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("⚠️ Ignoring server message: {}", e);
                            continue;
                        }
                    };

                    match message {
                        ServerMessage::Started { session_id, language } => {
                            log::info!("✅ Stream session {} started", session_id);
                            ready = true;
                            self.policy.on_started();
                            self.session_id = session_id.clone();
                            self.set_state(ConnectionState::Open);
                            self.emit(TransportEvent::Ready { session_id, language });

                            if let Some(chunk) = self.pending.take() {
                                if let Err(e) = send(&mut write, &ClientMessage::Audio { data: chunk }).await {
                                    return Flow::Dropped(e.to_string());
                                }
                            }
                        }
                        ServerMessage::Transcript { text, is_final } => {
                            log::debug!("📝 Stream transcript (final={}): {}", is_final, text);
                            self.emit(TransportEvent::Transcript { text, is_final });
                        }
                        ServerMessage::Response(reply) => {
                            log::info!("💬 Agent reply received ({} chars)", reply.text.len());
                            self.emit(TransportEvent::Response(reply));
                        }
                        ServerMessage::Error { message } => {
                            log::warn!("⚠️ Server error: {}", message);
                            self.emit(TransportEvent::ServerError(message));
                        }
                        ServerMessage::Stopped => self.emit(TransportEvent::Stopped),
                    }
                }

                command = self.commands.recv() => {
                    let command = command.unwrap_or(TransportCommand::Shutdown);
                    match command {
                        TransportCommand::Shutdown => {
                            let _ = send(&mut write, &ClientMessage::Stop).await;
                            let _ = write.close().await;
                            return Flow::Shutdown;
                        }
                        TransportCommand::Restart { session_id, language } => {
                            let _ = send(&mut write, &ClientMessage::Stop).await;
                            let _ = write.close().await;
                            self.restart(session_id, language);
                            return Flow::Restart;
                        }
                        TransportCommand::ChangeLanguage(language) => {
                            self.language = language;
                            if ready {
                                if let Err(e) = send(&mut write, &ClientMessage::ChangeLanguage { language }).await {
                                    return Flow::Dropped(e.to_string());
                                }
                            }
                        }
                        TransportCommand::SetRecording(on) => self.set_recording(on),
                    }
                }

                Some(samples) = self.audio.recv() => {
                    for chunk in self.chunk(&samples) {
                        if ready {
                            if let Err(e) = send(&mut write, &ClientMessage::Audio { data: chunk }).await {
                                return Flow::Dropped(e.to_string());
                            }
                        } else {
                            self.pending = Some(chunk);
                        }
                    }
                }
            }
        }
    }

    /// Sleep out a backoff (or idle indefinitely when `delay` is `None`)
    /// while still serving commands. Returns `None` when the delay elapsed.
    async fn wait(&mut self, delay: Option<Duration>) -> Option<Flow> {
        let sleep = tokio::time::sleep(delay.unwrap_or(Duration::MAX));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep, if delay.is_some() => return None,
                command = self.commands.recv() => {
                    match command.unwrap_or(TransportCommand::Shutdown) {
                        TransportCommand::Shutdown => return Some(Flow::Shutdown),
                        TransportCommand::Restart { session_id, language } => {
                            self.restart(session_id, language);
                            return Some(Flow::Restart);
                        }
                        TransportCommand::ChangeLanguage(language) => self.language = language,
                        TransportCommand::SetRecording(on) => self.set_recording(on),
                    }
                }
                Some(samples) = self.audio.recv() => {
                    if !self.policy.is_exhausted() {
                        if let Some(chunk) = self.chunk(&samples).pop() {
                            self.pending = Some(chunk);
                        }
                    }
                }
            }
        }
    }

    fn chunk(&mut self, samples: &[i16]) -> Vec<String> {
        if self.recording {
            self.chunker.push(samples)
        } else {
            Vec::new()
        }
    }

    fn set_recording(&mut self, on: bool) {
        if self.recording != on {
            log::debug!("Stream recording {}", if on { "on" } else { "off" });
        }
        self.recording = on;
        if !on {
            self.chunker.clear();
            self.pending = None;
        }
    }

    fn restart(&mut self, session_id: String, language: Language) {
        log::info!("🔄 Restarting stream session as {}", session_id);
        self.session_id = session_id;
        self.language = language;
        self.policy.reset();
        self.pending = None;
        self.chunker.clear();
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_replace(ConnectionStatus {
            state,
            reconnect_attempt: self.policy.attempt(),
        });
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            log::debug!("Transport event receiver dropped");
        }
    }
}

async fn send<S>(write: &mut S, message: &ClientMessage) -> Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = message.to_json()?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}
