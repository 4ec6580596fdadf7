//! Listener slots around recognition engines.
//!
//! A [`ListenerSlot`] owns one engine instance (the single-utterance main
//! listener or the continuous wake listener) and gives it idempotent
//! start/stop semantics. Every start bumps a generation counter; engine
//! callbacks carry the generation they were started with, so callbacks from a
//! torn-down instance are recognised as stale and dropped.

pub mod wake;

use crate::events::{EngineEvent, EngineEventKind};
use std::fmt;
use strum::Display;
use thiserror::Error;

pub use wake::{WakeMatch, WakePhrases};

/// Which of the two listeners a slot or callback belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ListenerKind {
    /// Single-utterance recording listener
    Main,
    /// Continuous wake-phrase listener
    Wake,
}

impl ListenerKind {
    pub fn continuous(&self) -> bool {
        matches!(self, ListenerKind::Wake)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The engine is already running; starting again is a no-op
    #[error("recognition already started")]
    AlreadyStarted,
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("recognition engine unavailable: {0}")]
    Unavailable(String),
}

/// Parameters handed to the engine on start
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRequest {
    pub listener: ListenerKind,
    pub generation: u64,
    pub continuous: bool,
    pub interim_results: bool,
    pub locale: String,
}

/// The platform speech-recognition capability.
///
/// Implementations report back asynchronously by sending [`EngineEvent`]s,
/// tagged with the request's generation, into the controller's event queue.
/// After `start` succeeds the engine must eventually report `Ended` once.
pub trait RecognitionEngine: Send {
    fn start(&mut self, request: &EngineRequest) -> Result<(), EngineError>;

    /// Request the engine to stop. Must not block waiting for acknowledgement.
    fn stop(&mut self);
}

/// Error classification surfaced to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerError {
    /// Caller-initiated; never auto-restart
    Aborted,
    /// Benign; may restart
    NoSpeech,
    /// Anything else; restart with the error delay
    Other(String),
}

impl fmt::Display for ListenerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerError::Aborted => write!(f, "aborted"),
            ListenerError::NoSpeech => write!(f, "no-speech"),
            ListenerError::Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl ListenerError {
    /// Classify a raw engine error code
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "aborted" => ListenerError::Aborted,
            "no-speech" | "no_speech" | "nospeech" => ListenerError::NoSpeech,
            other => ListenerError::Other(other.to_string()),
        }
    }

    /// True when the failure is a microphone permission or hardware problem
    pub fn is_device_failure(&self) -> bool {
        match self {
            ListenerError::Other(reason) => matches!(
                reason.as_str(),
                "not-allowed" | "service-not-allowed" | "audio-capture" | "permission-denied"
            ),
            _ => false,
        }
    }
}

/// Callbacks surfaced by a slot after staleness filtering
#[derive(Debug, Clone, PartialEq)]
pub enum SlotEvent {
    Transcript { text: String, is_final: bool },
    Error(ListenerError),
    /// Fires exactly once per start
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SlotPhase {
    Idle,
    Running,
    Stopping,
}

pub struct ListenerSlot {
    kind: ListenerKind,
    engine: Box<dyn RecognitionEngine>,
    generation: u64,
    phase: SlotPhase,
}

impl ListenerSlot {
    pub fn new(kind: ListenerKind, engine: Box<dyn RecognitionEngine>) -> Self {
        Self {
            kind,
            engine,
            generation: 0,
            phase: SlotPhase::Idle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> SlotPhase {
        self.phase
    }

    /// True while the engine holds the microphone (running or tearing down)
    pub fn is_active(&self) -> bool {
        self.phase != SlotPhase::Idle
    }

    pub fn is_running(&self) -> bool {
        self.phase == SlotPhase::Running
    }

    /// Start the engine. Starting a running or stopping slot is a no-op.
    ///
    /// A synchronous start failure is reported as an error followed by
    /// `Ended`, so callers drive restarts from one place.
    pub fn start(&mut self, locale: &str) -> Vec<SlotEvent> {
        if self.phase != SlotPhase::Idle {
            log::debug!("{} listener already {}, start ignored", self.kind, self.phase);
            return Vec::new();
        }

        self.generation += 1;
        let request = EngineRequest {
            listener: self.kind,
            generation: self.generation,
            continuous: self.kind.continuous(),
            interim_results: true,
            locale: locale.to_string(),
        };

        match self.engine.start(&request) {
            Ok(()) | Err(EngineError::AlreadyStarted) => {
                log::debug!(
                    "🎙️ {} listener started (generation {}, locale {})",
                    self.kind,
                    self.generation,
                    locale
                );
                self.phase = SlotPhase::Running;
                Vec::new()
            }
            Err(e) => {
                log::warn!("⚠️ {} listener failed to start: {}", self.kind, e);
                let error = match e {
                    EngineError::PermissionDenied(_) => {
                        ListenerError::Other("not-allowed".to_string())
                    }
                    other => ListenerError::Other(other.to_string()),
                };
                vec![SlotEvent::Error(error), SlotEvent::Ended]
            }
        }
    }

    /// Request a stop. Idempotent; the next `Ended` confirms it.
    pub fn stop(&mut self) {
        if self.phase == SlotPhase::Running {
            log::debug!("🛑 Stopping {} listener (generation {})", self.kind, self.generation);
            self.phase = SlotPhase::Stopping;
            self.engine.stop();
        }
    }

    /// Tear down without waiting for the engine. Any callback still in flight
    /// for the current generation becomes stale.
    pub fn force_close(&mut self) {
        if self.phase != SlotPhase::Idle {
            log::debug!("✂️ Force-closing {} listener (generation {})", self.kind, self.generation);
            if self.phase == SlotPhase::Running {
                self.engine.stop();
            }
        }
        self.generation += 1;
        self.phase = SlotPhase::Idle;
    }

    /// Filter and translate an engine callback
    pub fn accept(&mut self, event: EngineEvent) -> Option<SlotEvent> {
        if event.listener != self.kind || event.generation != self.generation {
            log::debug!(
                "Dropping stale {} callback (generation {}, current {})",
                event.listener,
                event.generation,
                self.generation
            );
            return None;
        }
        if self.phase == SlotPhase::Idle {
            log::debug!("Dropping {} callback for an idle slot", self.kind);
            return None;
        }

        match event.kind {
            EngineEventKind::Started => None,
            EngineEventKind::Result { text, is_final } => {
                Some(SlotEvent::Transcript { text, is_final })
            }
            EngineEventKind::Error(raw) => Some(SlotEvent::Error(ListenerError::classify(&raw))),
            EngineEventKind::Ended => {
                self.phase = SlotPhase::Idle;
                Some(SlotEvent::Ended)
            }
        }
    }
}
