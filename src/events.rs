//! Typed messages flowing into and out of the mode controller.

use crate::audio_level::LevelSample;
use crate::controller::session::{ConversationMode, MicState};
use crate::echo_guard::AvatarState;
use crate::language::Language;
use crate::listener::ListenerKind;
use crate::transport::protocol::AgentReply;
use crate::transport::{TransportCommand, TransportEvent};
use std::fmt;
use std::time::Duration;
use strum::Display;

/// Raw callback from a recognition engine instance
#[derive(Debug, Clone, PartialEq)]
pub struct EngineEvent {
    pub listener: ListenerKind,
    /// Generation the engine was started with
    pub generation: u64,
    pub kind: EngineEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEventKind {
    Started,
    Result { text: String, is_final: bool },
    /// Engine error code, e.g. "no-speech", "aborted", "not-allowed"
    Error(String),
    Ended,
}

/// Everything the controller reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Engine(EngineEvent),
    Level(LevelSample),
    /// `avatar-speaking-start` / `avatar-speaking-end`
    Avatar(AvatarState),
    MicButton,
    Reset,
    SetLanguage(Language),
    Timer { timer: TimerKind, token: u64 },
    Stream(TransportEvent),
    /// The agent collaborator could not produce a reply
    AgentReplyFailed,
}

/// Where a forwarded command came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum InputOrigin {
    /// A recorded utterance
    Listener,
    /// Text spoken together with the wake phrase
    WakeResidual,
    /// A final transcript from the stream server
    Stream,
}

/// The only failures the user is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserNotice {
    PermissionDenied,
    TransportExhausted { attempts: u32 },
}

impl fmt::Display for UserNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserNotice::PermissionDenied => {
                write!(f, "Microphone access was denied. Tap the mic button to try again.")
            }
            UserNotice::TransportExhausted { attempts } => {
                write!(f, "Voice service unavailable after {} attempts.", attempts)
            }
        }
    }
}

/// Everything the controller produces for the outside world
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerOutput {
    /// `voice-input-ready(text)` toward the agent collaborator
    VoiceInputReady { text: String, origin: InputOrigin },
    WakeDetected,
    MicStateChanged(MicState),
    ModeChanged(ConversationMode),
    LanguageChanged(Language),
    /// Live transcript of the utterance being recorded
    Transcript { text: String, is_final: bool },
    AgentReply(AgentReply),
    Notice(UserNotice),
    SessionReset { session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TimerKind {
    /// Avatar stopped speaking; re-arm once the room is quiet
    SettleRearm,
    /// Retry listening after a listener ended on its own
    Restart,
    /// Utterance fallback deadline
    FallbackDeadline,
    /// A stopped listener failed to report `Ended` in time
    TeardownTimeout(ListenerKind),
    ReplyTimeout,
    InactivityTimeout,
}

/// Side effects requested by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Deliver `ControllerEvent::Timer { timer, token }` after `delay`
    Schedule {
        timer: TimerKind,
        token: u64,
        delay: Duration,
    },
    Emit(ControllerOutput),
    Transport(TransportCommand),
}
