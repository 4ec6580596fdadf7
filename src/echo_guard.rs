//! Echo prevention.
//!
//! The guard is the single owner of the avatar speaking state. While the avatar
//! speaks the controller keeps every listener stopped; once it falls silent the
//! guard decides what to re-arm after the settle delay.

use crate::controller::session::ConversationMode;
use crate::listener::ListenerKind;
use std::time::Duration;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum AvatarState {
    #[default]
    Idle,
    Speaking,
}

/// What the controller should arm once the microphone is free again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    Listen(ListenerKind),
    /// Leave the microphone idle
    Stay,
}

pub struct EchoGuard {
    avatar: AvatarState,
    settle_delay: Duration,
    // Manual press that arrived while the avatar was speaking
    manual_request: bool,
}

impl EchoGuard {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            avatar: AvatarState::Idle,
            settle_delay,
            manual_request: false,
        }
    }

    pub fn avatar(&self) -> AvatarState {
        self.avatar
    }

    pub fn is_speaking(&self) -> bool {
        self.avatar == AvatarState::Speaking
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Returns true on an actual Idle -> Speaking transition
    pub fn speaking_started(&mut self) -> bool {
        if self.is_speaking() {
            log::debug!("Avatar already speaking");
            return false;
        }
        self.avatar = AvatarState::Speaking;
        true
    }

    /// Returns true on an actual Speaking -> Idle transition
    pub fn speaking_ended(&mut self) -> bool {
        if !self.is_speaking() {
            log::debug!("Avatar speaking-end without a start, ignored");
            return false;
        }
        self.avatar = AvatarState::Idle;
        true
    }

    /// Toggle a manual listening request queued behind avatar speech.
    /// Returns whether a request is now pending.
    pub fn toggle_manual_request(&mut self) -> bool {
        self.manual_request = !self.manual_request;
        self.manual_request
    }

    pub fn has_manual_request(&self) -> bool {
        self.manual_request
    }

    pub fn clear_manual_request(&mut self) {
        self.manual_request = false;
    }

    /// Decide what to listen with now that nothing else holds the microphone.
    ///
    /// `manual_hold` is set when the user stopped recording by hand; it blocks
    /// the automatic return to recording but not wake listening.
    pub fn rearm_target(
        &self,
        mode: ConversationMode,
        manual_hold: bool,
        awaiting_reply: bool,
    ) -> Rearm {
        if self.is_speaking() {
            return Rearm::Stay;
        }
        if self.manual_request {
            return Rearm::Listen(ListenerKind::Main);
        }
        match mode {
            ConversationMode::WakeWord => Rearm::Listen(ListenerKind::Wake),
            ConversationMode::Continuous if manual_hold || awaiting_reply => Rearm::Stay,
            ConversationMode::Continuous => Rearm::Listen(ListenerKind::Main),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> EchoGuard {
        EchoGuard::new(Duration::from_millis(500))
    }

    #[test]
    fn test_transitions_are_edge_triggered() {
        let mut guard = guard();
        assert!(!guard.speaking_ended());
        assert!(guard.speaking_started());
        assert!(!guard.speaking_started());
        assert!(guard.is_speaking());
        assert!(guard.speaking_ended());
        assert_eq!(guard.avatar(), AvatarState::Idle);
    }

    #[test]
    fn test_never_rearms_while_speaking() {
        let mut guard = guard();
        guard.speaking_started();
        guard.toggle_manual_request();
        for mode in [ConversationMode::WakeWord, ConversationMode::Continuous] {
            assert_eq!(guard.rearm_target(mode, false, false), Rearm::Stay);
        }
    }

    #[test]
    fn test_rearm_by_mode() {
        let guard = guard();
        assert_eq!(
            guard.rearm_target(ConversationMode::WakeWord, true, true),
            Rearm::Listen(ListenerKind::Wake)
        );
        assert_eq!(
            guard.rearm_target(ConversationMode::Continuous, false, false),
            Rearm::Listen(ListenerKind::Main)
        );
        assert_eq!(
            guard.rearm_target(ConversationMode::Continuous, true, false),
            Rearm::Stay
        );
        assert_eq!(
            guard.rearm_target(ConversationMode::Continuous, false, true),
            Rearm::Stay
        );
    }

    #[test]
    fn test_manual_request_wins_and_toggles() {
        let mut guard = guard();
        assert!(guard.toggle_manual_request());
        assert_eq!(
            guard.rearm_target(ConversationMode::Continuous, true, false),
            Rearm::Listen(ListenerKind::Main)
        );
        assert!(!guard.toggle_manual_request());
        assert!(guard.toggle_manual_request());
        guard.clear_manual_request();
        assert!(!guard.has_manual_request());
    }
}
