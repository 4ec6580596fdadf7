//! Silence Detector
//!
//! Decides when a recorded utterance has started and ended from the stream of
//! loudness samples. Every started utterance ends exactly once: on sustained
//! silence after speech, on the fallback timeout when no speech ever showed
//! up, or on a manual stop.

use crate::audio_level::LevelSample;
use crate::config::SilenceConfig;
use std::time::{Duration, Instant};
use strum::Display;

/// Why an utterance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CompletionReason {
    /// Speech was followed by `silence_duration` of quiet
    Silence,
    /// No speech detected before `fallback_timeout`
    Fallback,
    /// Stopped by the caller
    Manual,
}

/// The single completion signal of an utterance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtteranceEnd {
    pub reason: CompletionReason,
    pub speech_detected: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Listening,
}

pub struct SilenceDetector {
    config: SilenceConfig,
    phase: Phase,
    started_at: Option<Instant>,
    silence_started_at: Option<Instant>,
    speech_detected: bool,
}

impl SilenceDetector {
    pub fn new(config: SilenceConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            started_at: None,
            silence_started_at: None,
            speech_detected: false,
        }
    }

    /// Start monitoring a new utterance. Any previous one is discarded silently.
    pub fn begin(&mut self, now: Instant) {
        self.phase = Phase::Listening;
        self.started_at = Some(now);
        self.silence_started_at = None;
        self.speech_detected = false;
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Listening
    }

    pub fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    pub fn silence_started_at(&self) -> Option<Instant> {
        self.silence_started_at
    }

    /// Hard deadline at which an utterance without speech is given up
    pub fn fallback_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Listening => self.started_at.map(|start| start + self.config.fallback_timeout),
            Phase::Idle => None,
        }
    }

    /// Consume one loudness sample.
    pub fn observe(&mut self, sample: LevelSample, now: Instant) -> Option<UtteranceEnd> {
        let started_at = match (self.phase, self.started_at) {
            (Phase::Listening, Some(started_at)) => started_at,
            _ => return None,
        };
        let elapsed = now.saturating_duration_since(started_at);

        if sample.level > self.config.speech_threshold {
            if !self.speech_detected {
                log::debug!("🗣️ Speech detected (level {:.3})", sample.level);
            }
            self.speech_detected = true;
            self.silence_started_at = None;
        } else if !self.speech_detected
            && elapsed >= self.config.variance_grace
            && sample.spread > self.config.variance_threshold
        {
            log::debug!(
                "🗣️ Speech inferred from spectral spread {:.3} after {:?}",
                sample.spread,
                elapsed
            );
            self.speech_detected = true;
        }

        if self.speech_detected {
            if sample.level < self.config.silence_threshold {
                let silence_start = *self.silence_started_at.get_or_insert(now);
                if now.saturating_duration_since(silence_start) >= self.config.silence_duration {
                    return self.complete(CompletionReason::Silence, now);
                }
            } else {
                self.silence_started_at = None;
            }
            return None;
        }

        self.check_deadline(now)
    }

    /// Fire the fallback if it is due. Used by the scheduled deadline so an
    /// utterance completes even when samples stop arriving.
    pub fn check_deadline(&mut self, now: Instant) -> Option<UtteranceEnd> {
        let deadline = self.fallback_deadline()?;
        if !self.speech_detected && now >= deadline {
            log::info!("⏰ No speech within {:?}, ending utterance", self.config.fallback_timeout);
            return self.complete(CompletionReason::Fallback, now);
        }
        None
    }

    /// End the utterance on caller request
    pub fn finish_manual(&mut self, now: Instant) -> Option<UtteranceEnd> {
        self.complete(CompletionReason::Manual, now)
    }

    /// Drop the utterance without a completion signal (suppression, reset)
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.started_at = None;
        self.silence_started_at = None;
        self.speech_detected = false;
    }

    fn complete(&mut self, reason: CompletionReason, now: Instant) -> Option<UtteranceEnd> {
        if self.phase != Phase::Listening {
            return None;
        }
        let elapsed = self
            .started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        let end = UtteranceEnd {
            reason,
            speech_detected: self.speech_detected,
            elapsed,
        };
        self.phase = Phase::Idle;
        self.silence_started_at = None;
        log::debug!("🔇 Utterance complete: {} after {:?}", reason, elapsed);
        Some(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CADENCE: Duration = Duration::from_millis(50);

    fn config(silence_ms: u64) -> SilenceConfig {
        SilenceConfig {
            speech_threshold: 0.1,
            silence_threshold: 0.05,
            silence_duration: Duration::from_millis(silence_ms),
            fallback_timeout: Duration::from_millis(10_000),
            variance_grace: Duration::from_millis(4000),
            variance_threshold: 0.3,
        }
    }

    fn quiet() -> LevelSample {
        LevelSample::new(0.01, 0.0)
    }

    /// Tiny deterministic generator so fuzzed sequences are reproducible
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> f32 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((self.0 >> 33) as f32) / (u32::MAX >> 1) as f32
        }
    }

    #[test]
    fn test_speech_then_silence_completes_after_silence_duration() {
        let mut detector = SilenceDetector::new(config(3000));
        let start = Instant::now();
        detector.begin(start);

        let mut t = start;
        for _ in 0..5 {
            assert!(detector.observe(LevelSample::new(0.2, 0.5), t).is_none());
            t += CADENCE;
        }
        assert!(detector.speech_detected());

        let mut fired_at = None;
        for index in 0..200 {
            if let Some(end) = detector.observe(quiet(), t) {
                assert_eq!(end.reason, CompletionReason::Silence);
                fired_at = Some(index);
                break;
            }
            t += CADENCE;
        }
        let fired_at = fired_at.expect("silence should end the utterance");
        assert!((59..=61).contains(&fired_at), "fired at silence sample {}", fired_at);
    }

    #[test]
    fn test_sound_resuming_resets_silence_timer() {
        let mut detector = SilenceDetector::new(config(1000));
        let start = Instant::now();
        detector.begin(start);
        detector.observe(LevelSample::new(0.3, 0.0), start);
        detector.observe(quiet(), start + Duration::from_millis(100));
        assert!(detector.silence_started_at().is_some());

        // At the silence threshold counts as sound
        detector.observe(LevelSample::new(0.05, 0.0), start + Duration::from_millis(900));
        assert!(detector.silence_started_at().is_none());

        assert!(detector
            .observe(quiet(), start + Duration::from_millis(1200))
            .is_none());
        assert!(detector
            .observe(quiet(), start + Duration::from_millis(2200))
            .is_some());
    }

    #[test]
    fn test_fallback_fires_at_timeout_without_speech() {
        let mut detector = SilenceDetector::new(config(3000));
        let start = Instant::now();
        detector.begin(start);

        let mut t = start;
        loop {
            if let Some(end) = detector.observe(quiet(), t) {
                assert_eq!(end.reason, CompletionReason::Fallback);
                assert!(!end.speech_detected);
                assert!(end.elapsed >= Duration::from_millis(10_000));
                assert!(end.elapsed <= Duration::from_millis(10_000) + CADENCE);
                break;
            }
            t += CADENCE;
            assert!(t - start < Duration::from_secs(11), "fallback never fired");
        }
    }

    #[test]
    fn test_deadline_fires_without_samples() {
        let mut detector = SilenceDetector::new(config(3000));
        let start = Instant::now();
        detector.begin(start);
        assert!(detector.check_deadline(start + Duration::from_secs(5)).is_none());
        let end = detector
            .check_deadline(start + Duration::from_secs(10))
            .unwrap();
        assert_eq!(end.reason, CompletionReason::Fallback);
        assert!(detector.check_deadline(start + Duration::from_secs(11)).is_none());
    }

    #[test]
    fn test_spread_marks_speech_after_grace() {
        let mut detector = SilenceDetector::new(config(1000));
        let start = Instant::now();
        detector.begin(start);

        // Spread before the grace period is ignored
        detector.observe(LevelSample::new(0.08, 0.6), start + Duration::from_secs(1));
        assert!(!detector.speech_detected());

        detector.observe(LevelSample::new(0.08, 0.6), start + Duration::from_secs(4));
        assert!(detector.speech_detected());

        // Quiet microphone: the level never crossed the speech threshold,
        // the fallback must no longer fire and silence ends it instead
        let end = (0..100)
            .find_map(|i| detector.observe(quiet(), start + Duration::from_secs(4) + CADENCE * i))
            .unwrap();
        assert_eq!(end.reason, CompletionReason::Silence);
    }

    #[test]
    fn test_manual_stop_completes_once() {
        let mut detector = SilenceDetector::new(config(3000));
        let start = Instant::now();
        detector.begin(start);
        let end = detector.finish_manual(start + Duration::from_secs(1)).unwrap();
        assert_eq!(end.reason, CompletionReason::Manual);
        assert!(detector.finish_manual(start + Duration::from_secs(2)).is_none());
        assert!(detector.observe(quiet(), start + Duration::from_secs(20)).is_none());
    }

    #[test]
    fn test_fuzzed_sequences_complete_exactly_once() {
        let mut rng = Lcg(42);
        let mut seen = [0usize; 3];

        for round in 0..300 {
            let mut detector = SilenceDetector::new(config(1500));
            let start = Instant::now();
            detector.begin(start);

            // Rotate through regimes so every completion path is exercised
            let (opening, loud_probability, manual_at) = match round % 3 {
                0 => (10, 0.02 * rng.next(), None),
                1 => (0, 0.0, None),
                _ => (0, 0.3 * rng.next(), Some((rng.next() * 20.0) as u32)),
            };
            let mut completions = Vec::new();

            for i in 0..400u32 {
                let t = start + CADENCE * i;
                if Some(i) == manual_at {
                    completions.extend(detector.finish_manual(t));
                }
                let loud = i < opening || rng.next() < loud_probability;
                let level = if loud { 0.4 } else { 0.02 };
                let spread = rng.next() * 0.2;
                completions.extend(detector.observe(LevelSample::new(level, spread), t));
                completions.extend(detector.check_deadline(t));
            }
            completions.extend(detector.finish_manual(start + CADENCE * 400));

            assert_eq!(completions.len(), 1, "round {} completed {:?}", round, completions);
            let index = match completions[0].reason {
                CompletionReason::Silence => 0,
                CompletionReason::Fallback => 1,
                CompletionReason::Manual => 2,
            };
            seen[index] += 1;
        }

        assert!(seen.iter().all(|&count| count > 0), "paths hit: {:?}", seen);
    }
}
