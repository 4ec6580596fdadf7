//! Tokio driver for the mode controller.
//!
//! One task owns the [`ModeController`] and feeds it every input in arrival
//! order: external events, engine callbacks, timer expiries, transport
//! notifications and loudness samples. Effects are executed right after each
//! step. Timers are spawned sleeps that post their token back into the queue.

use crate::audio_level::AudioLevelSampler;
use crate::config::VoiceConfig;
use crate::controller::ModeController;
use crate::error::{Result, VoiceError};
use crate::events::{ControllerEvent, ControllerOutput, Effect};
use crate::listener::RecognitionEngine;
use crate::transport::{StreamTransport, TransportEvent};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const OUTPUT_CAPACITY: usize = 64;

/// Where recognition comes from for the lifetime of the runtime
pub enum Recognizer {
    Listeners {
        main: Box<dyn RecognitionEngine>,
        wake: Box<dyn RecognitionEngine>,
    },
    Stream,
}

/// Cloneable access to a running (or about to run) runtime
#[derive(Clone)]
pub struct RuntimeHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
    outputs: broadcast::Sender<ControllerOutput>,
    cancel: CancellationToken,
}

impl RuntimeHandle {
    pub fn send(&self, event: ControllerEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| VoiceError::Closed("voice runtime has stopped".to_string()))
    }

    /// Sender for recognition engines to post their callbacks on
    pub fn event_sender(&self) -> mpsc::UnboundedSender<ControllerEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerOutput> {
        self.outputs.subscribe()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

pub struct VoiceRuntime {
    config: VoiceConfig,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    outputs: broadcast::Sender<ControllerOutput>,
    cancel: CancellationToken,
}

impl VoiceRuntime {
    pub fn new(config: VoiceConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outputs, _) = broadcast::channel(OUTPUT_CAPACITY);
        Self {
            config,
            events_tx,
            events_rx,
            outputs,
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            events: self.events_tx.clone(),
            outputs: self.outputs.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Run until [`RuntimeHandle::shutdown`]. `audio` carries microphone
    /// frames; without it the level signal stays silent.
    pub async fn run(
        mut self,
        recognizer: Recognizer,
        mut audio: Option<mpsc::Receiver<Vec<i16>>>,
    ) -> Result<()> {
        let mut controller = match recognizer {
            Recognizer::Listeners { main, wake } => {
                ModeController::with_listeners(self.config.clone(), main, wake)
            }
            Recognizer::Stream => ModeController::with_stream(self.config.clone()),
        };

        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
        let transport = controller.uses_stream().then(|| {
            StreamTransport::spawn(
                self.config.transport.clone(),
                controller.session().session_id.clone(),
                controller.language(),
                transport_tx,
            )
        });

        let mut sampler = AudioLevelSampler::new(self.config.sampler.clone());
        let mut ticker = tokio::time::interval(self.config.sampler.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let effects = controller.start(Instant::now());
        self.execute(effects, transport.as_ref());

        loop {
            let effects = tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events_rx.recv() => controller.handle(event, Instant::now()),
                Some(event) = transport_rx.recv() => {
                    controller.handle(ControllerEvent::Stream(event), Instant::now())
                }
                frame = next_frame(&mut audio) => {
                    match frame {
                        Some(frame) => {
                            sampler.push_samples(&frame);
                            if let Some(transport) = &transport {
                                if controller.stream_recording() {
                                    transport.push_audio(frame);
                                }
                            }
                        }
                        None => {
                            log::warn!("⚠️ Microphone capture ended");
                            audio = None;
                        }
                    }
                    continue;
                }
                // Scheduled tick time keeps the throttle free of wakeup jitter
                tick = ticker.tick() => match sampler.sample(tick.into_std()) {
                    Some(sample) => controller.handle(ControllerEvent::Level(sample), Instant::now()),
                    None => continue,
                },
            };
            self.execute(effects, transport.as_ref());
        }

        log::info!("🛑 Voice runtime stopping");
        if let Some(transport) = transport {
            transport.shutdown().await?;
        }
        Ok(())
    }

    fn execute(&self, effects: Vec<Effect>, transport: Option<&StreamTransport>) {
        for effect in effects {
            match effect {
                Effect::Schedule {
                    timer,
                    token,
                    delay,
                } => {
                    let events = self.events_tx.clone();
                    let cancel = self.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                let _ = events.send(ControllerEvent::Timer { timer, token });
                            }
                            _ = cancel.cancelled() => {}
                        }
                    });
                }
                Effect::Emit(output) => {
                    log::debug!("Controller output: {:?}", output);
                    // No subscribers is fine
                    let _ = self.outputs.send(output);
                }
                Effect::Transport(command) => match transport {
                    Some(transport) => {
                        if let Err(e) = transport.send(command) {
                            log::warn!("⚠️ Transport command dropped: {}", e);
                        }
                    }
                    None => log::debug!("No transport for {:?}", command),
                },
            }
        }
    }
}

async fn next_frame(audio: &mut Option<mpsc::Receiver<Vec<i16>>>) -> Option<Vec<i16>> {
    match audio {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
