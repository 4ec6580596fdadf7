use crate::config::SilenceConfig;
use crate::language::Language;
use crate::silence::SilenceDetector;
use chrono::{DateTime, Utc};
use std::time::Instant;
use strum::Display;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum ConversationMode {
    #[default]
    WakeWord,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum MicState {
    #[default]
    Idle,
    WakeListening,
    ActiveRecording,
    Suppressed,
}

/// One kiosk conversation
#[derive(Debug, Clone)]
pub struct VoiceSession {
    pub session_id: String,
    pub mode: ConversationMode,
    pub language: Language,
    pub started_at: DateTime<Utc>,
}

impl VoiceSession {
    pub fn new(session_id: Option<String>, language: Language) -> Self {
        Self {
            session_id: session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            mode: ConversationMode::WakeWord,
            language,
            started_at: Utc::now(),
        }
    }

    /// Switch to continuous mode. Returns true only the first time.
    pub fn enter_continuous(&mut self) -> bool {
        if self.mode == ConversationMode::Continuous {
            return false;
        }
        self.mode = ConversationMode::Continuous;
        true
    }
}

/// Transcript accumulated while recording, plus its silence detector
pub struct Utterance {
    finals: Vec<String>,
    interim: String,
    detector: SilenceDetector,
}

impl Utterance {
    pub fn begin(config: SilenceConfig, now: Instant) -> Self {
        let mut detector = SilenceDetector::new(config);
        detector.begin(now);
        Self {
            finals: Vec::new(),
            interim: String::new(),
            detector,
        }
    }

    pub fn push(&mut self, text: &str, is_final: bool) {
        let text = text.trim();
        if is_final {
            if !text.is_empty() {
                self.finals.push(text.to_string());
            }
            self.interim.clear();
        } else {
            self.interim = text.to_string();
        }
    }

    /// Final segments followed by the latest interim result
    pub fn text(&self) -> String {
        self.finals
            .iter()
            .map(String::as_str)
            .chain((!self.interim.is_empty()).then_some(self.interim.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn detector(&mut self) -> &mut SilenceDetector {
        &mut self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utterance_accumulates_finals_and_interim() {
        let mut utterance = Utterance::begin(SilenceConfig::default(), Instant::now());
        utterance.push("what is", false);
        assert_eq!(utterance.text(), "what is");
        utterance.push("what is the price", true);
        utterance.push("of wheat", false);
        assert_eq!(utterance.text(), "what is the price of wheat");
        utterance.push("of wheat today", true);
        assert_eq!(utterance.text(), "what is the price of wheat today");
    }

    #[test]
    fn test_session_enters_continuous_once() {
        let mut session = VoiceSession::new(None, Language::Hindi);
        assert!(Uuid::parse_str(&session.session_id).is_ok());
        assert!(session.enter_continuous());
        assert!(!session.enter_continuous());
        assert_eq!(session.mode, ConversationMode::Continuous);
    }
}
