//! Mode Controller
//!
//! The single authority on who may listen. Every input (engine callbacks,
//! loudness samples, avatar events, the mic button, timers and the stream
//! transport) goes through [`ModeController::handle`], which updates the
//! owned state and returns the side effects for the runtime to execute.
//! The controller never sleeps or spawns; waits are [`Effect::Schedule`]
//! requests whose token is checked when the timer comes back.

pub mod session;

use crate::audio_level::LevelSample;
use crate::config::VoiceConfig;
use crate::echo_guard::{AvatarState, EchoGuard, Rearm};
use crate::events::{
    ControllerEvent, ControllerOutput, Effect, EngineEvent, InputOrigin, TimerKind, UserNotice,
};
use crate::language::{detect_language_switch, Language};
use crate::listener::{
    ListenerError, ListenerKind, ListenerSlot, RecognitionEngine, SlotEvent, SlotPhase,
    WakePhrases,
};
use crate::silence::CompletionReason;
use crate::transport::{TransportCommand, TransportEvent};
use session::{ConversationMode, MicState, Utterance, VoiceSession};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

enum Recognition {
    Listeners {
        main: ListenerSlot,
        wake: ListenerSlot,
    },
    Stream(StreamRecognition),
}

#[derive(Debug, Default)]
struct StreamRecognition {
    recording: bool,
    ready: bool,
    exhausted: bool,
}

/// Current token per timer; a timer coming back with any other token is stale
#[derive(Debug, Default)]
struct Timers {
    tokens: HashMap<TimerKind, u64>,
    next: u64,
}

impl Timers {
    fn arm(&mut self, timer: TimerKind, delay: Duration) -> Effect {
        self.next += 1;
        self.tokens.insert(timer, self.next);
        Effect::Schedule {
            timer,
            token: self.next,
            delay,
        }
    }

    fn cancel(&mut self, timer: TimerKind) {
        self.tokens.remove(&timer);
    }

    fn fire(&mut self, timer: TimerKind, token: u64) -> bool {
        if self.tokens.get(&timer) == Some(&token) {
            self.tokens.remove(&timer);
            true
        } else {
            false
        }
    }

    fn clear(&mut self) {
        self.tokens.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinishCause {
    Detector(CompletionReason),
    ListenerEnded,
    StreamFinal,
    TransportLost,
}

impl fmt::Display for FinishCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinishCause::Detector(reason) => write!(f, "{}", reason),
            FinishCause::ListenerEnded => write!(f, "listener ended"),
            FinishCause::StreamFinal => write!(f, "final transcript"),
            FinishCause::TransportLost => write!(f, "transport lost"),
        }
    }
}

fn mic_state_for(kind: ListenerKind) -> MicState {
    match kind {
        ListenerKind::Main => MicState::ActiveRecording,
        ListenerKind::Wake => MicState::WakeListening,
    }
}

fn other(kind: ListenerKind) -> ListenerKind {
    match kind {
        ListenerKind::Main => ListenerKind::Wake,
        ListenerKind::Wake => ListenerKind::Main,
    }
}

pub struct ModeController {
    config: VoiceConfig,
    session: VoiceSession,
    mic: MicState,
    recognition: Recognition,
    wake_phrases: WakePhrases,
    echo: EchoGuard,
    utterance: Option<Utterance>,
    // Utterance whose main listener is stopping; its late finals still count
    closing: Option<(Utterance, FinishCause)>,
    timers: Timers,
    // Listener waiting for the microphone to be released
    pending: Option<ListenerKind>,
    slot_errors: HashMap<ListenerKind, ListenerError>,
    manual_hold: bool,
    awaiting_reply: bool,
    device_blocked: bool,
    permission_notified: bool,
    started: bool,
    effects: Vec<Effect>,
}

impl ModeController {
    /// Controller driving the two recognition-engine listeners
    pub fn with_listeners(
        config: VoiceConfig,
        main_engine: Box<dyn RecognitionEngine>,
        wake_engine: Box<dyn RecognitionEngine>,
    ) -> Self {
        let recognition = Recognition::Listeners {
            main: ListenerSlot::new(ListenerKind::Main, main_engine),
            wake: ListenerSlot::new(ListenerKind::Wake, wake_engine),
        };
        Self::new(config, recognition)
    }

    /// Controller whose recognition comes from the stream transport
    pub fn with_stream(config: VoiceConfig) -> Self {
        Self::new(config, Recognition::Stream(StreamRecognition::default()))
    }

    fn new(config: VoiceConfig, recognition: Recognition) -> Self {
        let session = VoiceSession::new(config.session.session_id.clone(), config.session.language);
        Self {
            wake_phrases: WakePhrases::new(&config.listener.wake_phrases),
            echo: EchoGuard::new(config.echo.settle_delay),
            config,
            session,
            mic: MicState::Idle,
            recognition,
            utterance: None,
            closing: None,
            timers: Timers::default(),
            pending: None,
            slot_errors: HashMap::new(),
            manual_hold: false,
            awaiting_reply: false,
            device_blocked: false,
            permission_notified: false,
            started: false,
            effects: Vec::new(),
        }
    }

    pub fn session(&self) -> &VoiceSession {
        &self.session
    }

    pub fn mic_state(&self) -> MicState {
        self.mic
    }

    pub fn mode(&self) -> ConversationMode {
        self.session.mode
    }

    pub fn language(&self) -> Language {
        self.session.language
    }

    pub fn avatar(&self) -> AvatarState {
        self.echo.avatar()
    }

    pub fn uses_stream(&self) -> bool {
        matches!(self.recognition, Recognition::Stream(_))
    }

    pub fn listener_active(&self, kind: ListenerKind) -> bool {
        self.slot(kind).map(ListenerSlot::is_active).unwrap_or(false)
    }

    pub fn listener_generation(&self, kind: ListenerKind) -> Option<u64> {
        self.slot(kind).map(ListenerSlot::generation)
    }

    pub fn stream_recording(&self) -> bool {
        match &self.recognition {
            Recognition::Stream(stream) => stream.recording,
            Recognition::Listeners { .. } => false,
        }
    }

    /// True once the stream server acknowledged the session
    pub fn stream_ready(&self) -> bool {
        matches!(&self.recognition, Recognition::Stream(stream) if stream.ready)
    }

    /// How many audio consumers hold the microphone right now
    pub fn active_sources(&self) -> usize {
        match &self.recognition {
            Recognition::Listeners { main, wake } => {
                usize::from(main.is_active()) + usize::from(wake.is_active())
            }
            Recognition::Stream(stream) => usize::from(stream.recording),
        }
    }

    /// Arm the initial listener
    pub fn start(&mut self, now: Instant) -> Vec<Effect> {
        if !self.started {
            self.started = true;
            log::info!(
                "🚀 Voice controller started (session {}, language {}, {})",
                self.session.session_id,
                self.session.language,
                if self.uses_stream() { "stream transport" } else { "recognition engines" }
            );
            self.rearm(now);
        }
        std::mem::take(&mut self.effects)
    }

    pub fn handle(&mut self, event: ControllerEvent, now: Instant) -> Vec<Effect> {
        match event {
            ControllerEvent::Engine(event) => self.on_engine_event(event, now),
            ControllerEvent::Level(sample) => self.on_level(sample, now),
            ControllerEvent::Avatar(AvatarState::Speaking) => self.on_avatar_speaking(),
            ControllerEvent::Avatar(AvatarState::Idle) => self.on_avatar_idle(),
            ControllerEvent::MicButton => self.on_mic_button(now),
            ControllerEvent::Reset => self.reset(),
            ControllerEvent::SetLanguage(language) => self.set_language(language),
            ControllerEvent::Timer { timer, token } => {
                if self.timers.fire(timer, token) {
                    self.on_timer(timer, now);
                } else {
                    log::debug!("Ignoring stale {} timer", timer);
                }
            }
            ControllerEvent::Stream(event) => self.on_stream_event(event, now),
            ControllerEvent::AgentReplyFailed => self.on_reply_failed(now),
        }
        std::mem::take(&mut self.effects)
    }

    // Listener callbacks

    fn on_engine_event(&mut self, event: EngineEvent, now: Instant) {
        let kind = event.listener;
        let Some(slot) = self.slot_mut(kind) else {
            log::debug!("Engine callback ignored in stream mode");
            return;
        };
        let was_running = slot.is_running();
        if let Some(slot_event) = slot.accept(event) {
            self.on_slot_event(kind, slot_event, was_running, now);
        }
    }

    fn on_slot_event(&mut self, kind: ListenerKind, event: SlotEvent, unsolicited: bool, now: Instant) {
        match event {
            SlotEvent::Transcript { text, is_final } => match kind {
                ListenerKind::Wake => self.on_wake_transcript(&text, is_final, now),
                ListenerKind::Main => self.on_recording_transcript(&text, is_final),
            },
            SlotEvent::Error(error) => self.on_listener_error(kind, error),
            SlotEvent::Ended => self.on_listener_ended(kind, unsolicited, now),
        }
    }

    fn on_listener_error(&mut self, kind: ListenerKind, error: ListenerError) {
        match &error {
            ListenerError::Aborted => log::debug!("{} listener aborted", kind),
            ListenerError::NoSpeech => log::debug!("{} listener heard no speech", kind),
            ListenerError::Other(reason) => log::warn!("⚠️ {} listener error: {}", kind, reason),
        }

        if error.is_device_failure() {
            self.device_blocked = true;
            if !self.permission_notified {
                self.permission_notified = true;
                log::error!("❌ Microphone unavailable: {}", error);
                self.emit(ControllerOutput::Notice(UserNotice::PermissionDenied));
            }
        }
        self.slot_errors.insert(kind, error);
    }

    fn on_listener_ended(&mut self, kind: ListenerKind, unsolicited: bool, now: Instant) {
        let error = self.slot_errors.remove(&kind);
        self.timers.cancel(TimerKind::TeardownTimeout(kind));

        if !unsolicited {
            log::debug!("{} listener released the microphone", kind);
            self.on_released(kind, now);
            return;
        }

        log::info!("{} listener ended on its own", kind);
        let delivered = match kind {
            ListenerKind::Main => self.finish_utterance(FinishCause::ListenerEnded),
            ListenerKind::Wake => {
                if self.mic == MicState::WakeListening {
                    self.set_mic(MicState::Idle);
                }
                false
            }
        };

        match error {
            Some(ListenerError::Aborted) => log::info!("{} listener aborted, not restarting", kind),
            Some(error) if error.is_device_failure() => {}
            Some(ListenerError::Other(_)) => {
                self.arm(TimerKind::Restart, self.config.listener.error_restart_delay)
            }
            _ if delivered => self.rearm(now),
            _ => self.arm(TimerKind::Restart, self.config.listener.restart_delay),
        }
    }

    fn on_wake_transcript(&mut self, text: &str, is_final: bool, now: Instant) {
        // Checked synchronously so a result racing a state change never double-starts
        if self.mic != MicState::WakeListening || self.echo.is_speaking() {
            log::debug!("Discarding wake transcript while {}: '{}'", self.mic, text);
            return;
        }
        if !is_final {
            return;
        }
        let Some(found) = self.wake_phrases.find(text) else {
            log::debug!("No wake phrase in '{}'", text);
            return;
        };

        log::info!("👂 Wake phrase '{}' detected", found.phrase);
        self.emit(ControllerOutput::WakeDetected);
        self.manual_hold = false;
        if self.session.enter_continuous() {
            log::info!("🔁 Switching to continuous conversation");
            self.emit(ControllerOutput::ModeChanged(ConversationMode::Continuous));
        }
        self.touch();

        if found.is_wake_only() {
            self.engage(ListenerKind::Main, now);
        } else {
            self.release_wake();
            self.set_mic(MicState::Idle);
            self.deliver(found.residual, InputOrigin::WakeResidual);
        }
    }

    fn on_recording_transcript(&mut self, text: &str, is_final: bool) {
        if self.echo.is_speaking() {
            log::debug!("Discarding transcript while the avatar speaks: '{}'", text);
            return;
        }
        let utterance = match (self.closing.as_mut(), self.utterance.as_mut()) {
            (Some((closing, _)), _) => closing,
            (None, Some(utterance)) if self.mic == MicState::ActiveRecording => utterance,
            _ => {
                log::debug!("Discarding transcript while {}: '{}'", self.mic, text);
                return;
            }
        };
        utterance.push(text, is_final);
        let text = utterance.text();
        self.emit(ControllerOutput::Transcript { text, is_final });
    }

    fn on_level(&mut self, sample: LevelSample, now: Instant) {
        if self.mic != MicState::ActiveRecording {
            return;
        }
        let recording = match &self.recognition {
            Recognition::Listeners { main, .. } => main.is_running(),
            Recognition::Stream(stream) => stream.recording,
        };
        if !recording {
            return;
        }
        let Some(utterance) = self.utterance.as_mut() else {
            return;
        };
        let end = utterance.detector().observe(sample, now);
        if let Some(end) = end {
            self.complete(end.reason, now);
        }
    }

    // Avatar and user input

    fn on_avatar_speaking(&mut self) {
        if !self.echo.speaking_started() {
            return;
        }
        log::info!("🔇 Avatar speaking, microphone suppressed");
        for timer in [
            TimerKind::SettleRearm,
            TimerKind::Restart,
            TimerKind::ReplyTimeout,
            TimerKind::FallbackDeadline,
        ] {
            self.timers.cancel(timer);
        }
        self.awaiting_reply = false;
        let open = self.utterance.take().is_some();
        if self.closing.take().is_some() || open {
            log::info!("Discarding the utterance in progress");
        }
        self.stop_everything();
        self.set_mic(MicState::Suppressed);
        self.touch();
    }

    fn on_avatar_idle(&mut self) {
        if !self.echo.speaking_ended() {
            return;
        }
        log::info!("🔈 Avatar finished speaking, re-arming in {:?}", self.echo.settle_delay());
        self.arm(TimerKind::SettleRearm, self.echo.settle_delay());
        self.touch();
    }

    fn on_settled(&mut self, now: Instant) {
        if self.echo.is_speaking() {
            return;
        }
        if self.echo.has_manual_request() {
            log::info!("🎤 Honouring the mic press queued during speech");
            self.manual_hold = false;
        }
        self.rearm(now);
    }

    fn on_mic_button(&mut self, now: Instant) {
        if self.echo.is_speaking() {
            if self.echo.toggle_manual_request() {
                log::info!("🎤 Mic press queued until the avatar finishes");
            } else {
                log::info!("🎤 Queued mic press cancelled");
            }
            return;
        }

        if self.mic == MicState::ActiveRecording {
            log::info!("🎤 Manual stop");
            self.manual_hold = true;
            if let Some(utterance) = self.utterance.as_mut() {
                utterance.detector().finish_manual(now);
            }
            self.complete(CompletionReason::Manual, now);
        } else {
            log::info!("🎤 Manual start");
            self.manual_hold = false;
            self.device_blocked = false;
            self.permission_notified = false;
            self.awaiting_reply = false;
            for timer in [TimerKind::SettleRearm, TimerKind::Restart, TimerKind::ReplyTimeout] {
                self.timers.cancel(timer);
            }
            self.engage(ListenerKind::Main, now);
        }
    }

    fn on_reply_failed(&mut self, now: Instant) {
        if !self.awaiting_reply {
            return;
        }
        log::warn!("⚠️ Agent reply failed, listening again");
        self.awaiting_reply = false;
        self.timers.cancel(TimerKind::ReplyTimeout);
        if self.mic == MicState::Idle {
            self.rearm(now);
        }
    }

    /// Full session reset: back to wake-word mode with a fresh session id.
    /// Listener handles are invalidated so in-flight callbacks are stale.
    fn reset(&mut self) {
        log::info!("🔄 Resetting voice session {}", self.session.session_id);
        self.timers.clear();
        self.utterance = None;
        self.closing = None;
        self.pending = None;
        self.slot_errors.clear();
        self.manual_hold = false;
        self.awaiting_reply = false;
        self.device_blocked = false;
        self.permission_notified = false;
        self.echo.clear_manual_request();

        match &mut self.recognition {
            Recognition::Listeners { main, wake } => {
                main.force_close();
                wake.force_close();
            }
            Recognition::Stream(stream) => *stream = StreamRecognition::default(),
        }

        let was_continuous = self.session.mode == ConversationMode::Continuous;
        self.session = VoiceSession::new(None, self.session.language);
        if was_continuous {
            self.emit(ControllerOutput::ModeChanged(ConversationMode::WakeWord));
        }
        if self.uses_stream() {
            self.effects.push(Effect::Transport(TransportCommand::Restart {
                session_id: self.session.session_id.clone(),
                language: self.session.language,
            }));
        }
        self.emit(ControllerOutput::SessionReset {
            session_id: self.session.session_id.clone(),
        });

        if self.echo.is_speaking() {
            self.set_mic(MicState::Suppressed);
        } else {
            self.set_mic(MicState::Idle);
            self.arm(TimerKind::Restart, self.config.listener.restart_delay);
        }
    }

    fn set_language(&mut self, language: Language) {
        if language == self.session.language {
            return;
        }
        log::info!("🌐 Language switched to {}", language);
        self.session.language = language;
        self.emit(ControllerOutput::LanguageChanged(language));

        if self.uses_stream() {
            self.effects
                .push(Effect::Transport(TransportCommand::ChangeLanguage(language)));
        } else if self.slot(ListenerKind::Wake).is_some_and(ListenerSlot::is_running)
            && self.pending.is_none()
        {
            // Restart the wake listener so it picks up the new locale
            self.stop_slot(ListenerKind::Wake);
            self.pending = Some(ListenerKind::Wake);
        }
    }

    fn on_timer(&mut self, timer: TimerKind, now: Instant) {
        match timer {
            TimerKind::SettleRearm => self.on_settled(now),
            TimerKind::Restart => {
                if self.mic == MicState::Idle {
                    self.rearm(now);
                }
            }
            TimerKind::FallbackDeadline => {
                let end = self
                    .utterance
                    .as_mut()
                    .and_then(|utterance| utterance.detector().check_deadline(now));
                if let Some(end) = end {
                    self.complete(end.reason, now);
                }
            }
            TimerKind::TeardownTimeout(kind) => {
                let teardown = self.config.listener.teardown_timeout;
                if let Some(slot) = self.slot_mut(kind) {
                    if slot.is_active() {
                        log::warn!(
                            "⚠️ {} listener did not end within {:?}, force-closing",
                            kind,
                            teardown
                        );
                        slot.force_close();
                    }
                }
                self.slot_errors.remove(&kind);
                self.on_released(kind, now);
            }
            TimerKind::ReplyTimeout => {
                if self.awaiting_reply {
                    log::warn!(
                        "⏰ No reply within {:?}, listening again",
                        self.config.session.reply_timeout
                    );
                    self.awaiting_reply = false;
                } else {
                    log::info!("No avatar speech after the reply, listening again");
                }
                if self.mic == MicState::Idle {
                    self.rearm(now);
                }
            }
            TimerKind::InactivityTimeout => {
                if self.session.mode != ConversationMode::Continuous {
                    return;
                }
                if self.echo.is_speaking() || self.utterance.is_some() || self.closing.is_some() {
                    self.touch();
                } else {
                    log::info!(
                        "⏰ No activity for {:?}, ending the conversation",
                        self.config.session.inactivity_timeout
                    );
                    self.reset();
                }
            }
        }
    }

    fn on_stream_event(&mut self, event: TransportEvent, now: Instant) {
        let Recognition::Stream(stream) = &mut self.recognition else {
            log::debug!("Stream event ignored without a stream transport");
            return;
        };

        match event {
            TransportEvent::Ready { session_id, .. } => {
                stream.ready = true;
                stream.exhausted = false;
                if session_id != self.session.session_id {
                    log::info!("Adopting server session id {}", session_id);
                    self.session.session_id = session_id;
                }
            }
            TransportEvent::Transcript { text, is_final } => match self.mic {
                MicState::WakeListening => self.on_wake_transcript(&text, is_final, now),
                MicState::ActiveRecording => {
                    self.on_recording_transcript(&text, is_final);
                    if is_final && self.utterance.is_some() {
                        self.finish_utterance(FinishCause::StreamFinal);
                        self.rearm(now);
                    }
                }
                _ => log::debug!("Discarding stream transcript while {}: '{}'", self.mic, text),
            },
            TransportEvent::Response(reply) => {
                self.awaiting_reply = false;
                self.timers.cancel(TimerKind::ReplyTimeout);
                self.emit(ControllerOutput::AgentReply(reply));
                // Avatar speech normally follows; listen again if it never starts
                if !self.echo.is_speaking() {
                    self.arm(TimerKind::ReplyTimeout, self.config.session.reply_grace);
                }
                self.touch();
            }
            TransportEvent::ServerError(message) => log::warn!("⚠️ Stream server error: {}", message),
            TransportEvent::Disconnected(reason) => {
                stream.ready = false;
                log::warn!("⚠️ Stream disconnected: {}", reason);
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                log::info!("🔄 Stream reconnect {} in {:?}", attempt, delay)
            }
            TransportEvent::Exhausted { attempts } => {
                stream.exhausted = true;
                stream.ready = false;
                log::error!("❌ Stream transport exhausted after {} attempts", attempts);
                self.emit(ControllerOutput::Notice(UserNotice::TransportExhausted { attempts }));
                if self.utterance.is_some() {
                    self.finish_utterance(FinishCause::TransportLost);
                }
                self.release_wake();
                self.timers.cancel(TimerKind::Restart);
                if !self.echo.is_speaking() {
                    self.set_mic(MicState::Idle);
                }
            }
            TransportEvent::Stopped => log::debug!("Stream session stopped"),
        }
    }

    // Transitions

    /// Pick what should listen now that nothing is recording
    fn rearm(&mut self, now: Instant) {
        if self.echo.is_speaking() {
            self.set_mic(MicState::Suppressed);
            return;
        }
        if self.device_blocked || self.stream_exhausted() {
            log::debug!("Microphone unavailable, staying idle");
            self.set_mic(MicState::Idle);
            return;
        }
        match self
            .echo
            .rearm_target(self.session.mode, self.manual_hold, self.awaiting_reply)
        {
            Rearm::Listen(kind) => {
                if kind == ListenerKind::Main {
                    self.echo.clear_manual_request();
                }
                self.engage(kind, now);
            }
            Rearm::Stay => self.set_mic(MicState::Idle),
        }
    }

    /// Make `target` the one listener, queueing it while the other releases the microphone
    fn engage(&mut self, target: ListenerKind, now: Instant) {
        self.timers.cancel(TimerKind::Restart);
        if self.echo.is_speaking() {
            self.set_mic(MicState::Suppressed);
            return;
        }

        if let Recognition::Stream(stream) = &mut self.recognition {
            if stream.exhausted {
                self.set_mic(MicState::Idle);
                return;
            }
            if !stream.recording {
                stream.recording = true;
                self.effects
                    .push(Effect::Transport(TransportCommand::SetRecording(true)));
            }
            self.set_mic(mic_state_for(target));
            if target == ListenerKind::Main && self.utterance.is_none() {
                self.begin_utterance(now);
            }
            return;
        }

        let other_active = self.listener_active(other(target));
        let target_stopping = self
            .slot(target)
            .is_some_and(|slot| slot.phase() == SlotPhase::Stopping);
        if other_active || target_stopping {
            self.stop_slot(other(target));
            self.pending = Some(target);
            log::debug!("{} listener queued until the microphone is released", target);
            self.set_mic(mic_state_for(target));
            return;
        }

        self.pending = None;
        self.start_slot(target, now);
    }

    fn start_pending(&mut self, now: Instant) {
        if self.listener_active(ListenerKind::Main) || self.listener_active(ListenerKind::Wake) {
            return;
        }
        if let Some(target) = self.pending.take() {
            if self.echo.is_speaking() {
                return;
            }
            self.start_slot(target, now);
        }
    }

    fn start_slot(&mut self, kind: ListenerKind, now: Instant) {
        let locale = self.session.language.locale();
        let Some(slot) = self.slot_mut(kind) else {
            return;
        };
        let failures = slot.start(&locale);

        if failures.is_empty() {
            self.set_mic(mic_state_for(kind));
            if kind == ListenerKind::Main && self.utterance.is_none() {
                self.begin_utterance(now);
            }
            return;
        }

        if self.mic == MicState::WakeListening || self.mic == MicState::ActiveRecording {
            self.set_mic(MicState::Idle);
        }
        for event in failures {
            self.on_slot_event(kind, event, true, now);
        }
    }

    fn stop_slot(&mut self, kind: ListenerKind) {
        let stopped = match self.slot_mut(kind) {
            Some(slot) if slot.is_running() => {
                slot.stop();
                true
            }
            _ => false,
        };
        if stopped {
            self.arm(
                TimerKind::TeardownTimeout(kind),
                self.config.listener.teardown_timeout,
            );
        }
    }

    /// Stop the wake listener, or stream recording in stream mode
    fn release_wake(&mut self) {
        self.stop_slot(ListenerKind::Wake);
        self.stop_stream_recording();
    }

    fn stop_stream_recording(&mut self) {
        if let Recognition::Stream(stream) = &mut self.recognition {
            if stream.recording {
                stream.recording = false;
                self.effects
                    .push(Effect::Transport(TransportCommand::SetRecording(false)));
            }
        }
    }

    fn stop_everything(&mut self) {
        self.pending = None;
        self.stop_slot(ListenerKind::Main);
        self.stop_slot(ListenerKind::Wake);
        self.stop_stream_recording();
    }

    fn begin_utterance(&mut self, now: Instant) {
        self.utterance = Some(Utterance::begin(self.config.silence.clone(), now));
        self.arm(TimerKind::FallbackDeadline, self.config.silence.fallback_timeout);
    }

    /// End recording on a silence, fallback or manual stop. A running main
    /// listener may still deliver pending finals while it stops, so the
    /// utterance stays open until it reports `Ended` or the teardown timeout.
    fn complete(&mut self, reason: CompletionReason, now: Instant) {
        let cause = FinishCause::Detector(reason);
        let main_running = self
            .slot(ListenerKind::Main)
            .is_some_and(ListenerSlot::is_running);
        let utterance = match self.utterance.take() {
            Some(utterance) if main_running => utterance,
            other => {
                self.utterance = other;
                self.finish_utterance(cause);
                self.rearm(now);
                return;
            }
        };

        log::debug!("Recording stopped ({}), waiting for the main listener", cause);
        self.timers.cancel(TimerKind::FallbackDeadline);
        self.closing = Some((utterance, cause));
        self.stop_slot(ListenerKind::Main);
        if self.mic == MicState::ActiveRecording {
            self.set_mic(MicState::Idle);
        }
    }

    /// A stopped listener let go of the microphone
    fn on_released(&mut self, kind: ListenerKind, now: Instant) {
        let closing = match kind {
            ListenerKind::Main => self.closing.take(),
            ListenerKind::Wake => None,
        };
        let Some((utterance, cause)) = closing else {
            self.start_pending(now);
            return;
        };
        self.deliver_utterance(Some(utterance), cause);
        if self.pending.is_some() {
            self.start_pending(now);
        } else {
            self.rearm(now);
        }
    }

    /// Close the open utterance and stop recording. Returns whether text was
    /// forwarded to the agent.
    fn finish_utterance(&mut self, cause: FinishCause) -> bool {
        self.timers.cancel(TimerKind::FallbackDeadline);
        let utterance = self.utterance.take();
        if self.pending == Some(ListenerKind::Main) {
            self.pending = None;
        }
        self.stop_slot(ListenerKind::Main);
        self.stop_stream_recording();
        if self.mic == MicState::ActiveRecording {
            self.set_mic(MicState::Idle);
        }
        self.deliver_utterance(utterance, cause)
    }

    fn deliver_utterance(&mut self, utterance: Option<Utterance>, cause: FinishCause) -> bool {
        let text = utterance.map(|utterance| utterance.text()).unwrap_or_default();
        if text.is_empty() {
            log::info!("🔇 Utterance ended ({}) with nothing to send", cause);
            return false;
        }

        log::info!("🗣️ Utterance ended ({}): '{}'", cause, text);
        let origin = if self.uses_stream() {
            InputOrigin::Stream
        } else {
            InputOrigin::Listener
        };
        self.deliver(text, origin);
        true
    }

    fn deliver(&mut self, text: String, origin: InputOrigin) {
        if let Some(language) = detect_language_switch(&text) {
            self.set_language(language);
        }
        self.emit(ControllerOutput::VoiceInputReady { text, origin });
        self.awaiting_reply = true;
        self.arm(TimerKind::ReplyTimeout, self.config.session.reply_timeout);
        self.touch();
    }

    /// Push back the inactivity reset while a conversation is running
    fn touch(&mut self) {
        if self.session.mode == ConversationMode::Continuous {
            self.arm(
                TimerKind::InactivityTimeout,
                self.config.session.inactivity_timeout,
            );
        }
    }

    fn set_mic(&mut self, state: MicState) {
        if self.mic != state {
            log::info!("🎙️ Mic {} → {}", self.mic, state);
            self.mic = state;
            self.emit(ControllerOutput::MicStateChanged(state));
        }
    }

    fn stream_exhausted(&self) -> bool {
        matches!(&self.recognition, Recognition::Stream(stream) if stream.exhausted)
    }

    fn emit(&mut self, output: ControllerOutput) {
        self.effects.push(Effect::Emit(output));
    }

    fn arm(&mut self, timer: TimerKind, delay: Duration) {
        let effect = self.timers.arm(timer, delay);
        self.effects.push(effect);
    }

    fn slot(&self, kind: ListenerKind) -> Option<&ListenerSlot> {
        match &self.recognition {
            Recognition::Listeners { main, wake } => Some(match kind {
                ListenerKind::Main => main,
                ListenerKind::Wake => wake,
            }),
            Recognition::Stream(_) => None,
        }
    }

    fn slot_mut(&mut self, kind: ListenerKind) -> Option<&mut ListenerSlot> {
        match &mut self.recognition {
            Recognition::Listeners { main, wake } => Some(match kind {
                ListenerKind::Main => main,
                ListenerKind::Wake => wake,
            }),
            Recognition::Stream(_) => None,
        }
    }
}
