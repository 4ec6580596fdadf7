//! Line-driven recognition engine.
//!
//! Stands in for a platform recogniser on a bench kiosk: text typed at the
//! console is delivered as a recognition result to whichever listener is
//! running. It follows the engine contract: `Started` after a start,
//! results tagged with the start generation, and exactly one `Ended`
//! per instance. A single-utterance instance ends itself after a final result.

use crate::events::{ControllerEvent, EngineEvent, EngineEventKind};
use crate::listener::{EngineError, EngineRequest, ListenerKind, RecognitionEngine};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Running {
    main: Option<EngineRequest>,
    wake: Option<EngineRequest>,
}

impl Running {
    fn slot(&mut self, kind: ListenerKind) -> &mut Option<EngineRequest> {
        match kind {
            ListenerKind::Main => &mut self.main,
            ListenerKind::Wake => &mut self.wake,
        }
    }
}

/// Shared console input feeding both engines
#[derive(Clone)]
pub struct ConsoleRecognizer {
    running: Arc<Mutex<Running>>,
    events: mpsc::UnboundedSender<ControllerEvent>,
}

impl ConsoleRecognizer {
    pub fn new(events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self {
            running: Arc::new(Mutex::new(Running::default())),
            events,
        }
    }

    pub fn engine(&self, kind: ListenerKind) -> ConsoleEngine {
        ConsoleEngine {
            kind,
            recognizer: self.clone(),
        }
    }

    /// Deliver a typed line. The main listener takes precedence over the
    /// wake listener. Returns false when nothing is listening.
    pub fn hear(&self, text: &str, is_final: bool) -> bool {
        let mut running = self.lock();
        let Some(kind) = [ListenerKind::Main, ListenerKind::Wake]
            .into_iter()
            .find(|kind| running.slot(*kind).is_some())
        else {
            return false;
        };

        let slot = running.slot(kind);
        let Some(request) = slot.as_ref() else {
            return false;
        };
        let generation = request.generation;
        let ends = is_final && !request.continuous;
        if ends {
            *slot = None;
        }
        drop(running);

        self.post(
            kind,
            generation,
            EngineEventKind::Result {
                text: text.to_string(),
                is_final,
            },
        );
        if ends {
            self.post(kind, generation, EngineEventKind::Ended);
        }
        true
    }

    /// Which listener would receive the next line
    pub fn listening(&self) -> Option<ListenerKind> {
        let running = self.lock();
        if running.main.is_some() {
            Some(ListenerKind::Main)
        } else if running.wake.is_some() {
            Some(ListenerKind::Wake)
        } else {
            None
        }
    }

    fn post(&self, listener: ListenerKind, generation: u64, kind: EngineEventKind) {
        let event = ControllerEvent::Engine(EngineEvent {
            listener,
            generation,
            kind,
        });
        if self.events.send(event).is_err() {
            log::debug!("Runtime gone, dropping {} engine callback", listener);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ConsoleEngine {
    kind: ListenerKind,
    recognizer: ConsoleRecognizer,
}

impl RecognitionEngine for ConsoleEngine {
    fn start(&mut self, request: &EngineRequest) -> Result<(), EngineError> {
        {
            let mut running = self.recognizer.lock();
            let slot = running.slot(self.kind);
            if slot.is_some() {
                return Err(EngineError::AlreadyStarted);
            }
            *slot = Some(request.clone());
        }
        log::debug!(
            "Console {} engine listening ({}, generation {})",
            self.kind,
            request.locale,
            request.generation
        );
        self.recognizer
            .post(self.kind, request.generation, EngineEventKind::Started);
        Ok(())
    }

    fn stop(&mut self) {
        let stopped = self.recognizer.lock().slot(self.kind).take();
        if let Some(request) = stopped {
            self.recognizer
                .post(self.kind, request.generation, EngineEventKind::Ended);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(listener: ListenerKind, generation: u64) -> EngineRequest {
        EngineRequest {
            listener,
            generation,
            continuous: listener.continuous(),
            interim_results: true,
            locale: "hi-IN".to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ControllerEvent>) -> Vec<(ListenerKind, u64, EngineEventKind)> {
        let mut out = Vec::new();
        while let Ok(ControllerEvent::Engine(event)) = rx.try_recv() {
            out.push((event.listener, event.generation, event.kind));
        }
        out
    }

    #[test]
    fn test_lines_go_to_running_main_first() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recognizer = ConsoleRecognizer::new(tx);
        let mut wake = recognizer.engine(ListenerKind::Wake);
        assert!(!recognizer.hear("hello", true));

        wake.start(&request(ListenerKind::Wake, 3)).unwrap();
        assert!(recognizer.hear("hey mira", true));
        assert_eq!(recognizer.listening(), Some(ListenerKind::Wake));

        let events = drain(&mut rx);
        assert_eq!(events[0], (ListenerKind::Wake, 3, EngineEventKind::Started));
        assert_eq!(
            events[1],
            (
                ListenerKind::Wake,
                3,
                EngineEventKind::Result {
                    text: "hey mira".to_string(),
                    is_final: true
                }
            )
        );
        assert_eq!(events.len(), 2, "continuous engine keeps running");
    }

    #[test]
    fn test_single_utterance_ends_after_final() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recognizer = ConsoleRecognizer::new(tx);
        let mut main = recognizer.engine(ListenerKind::Main);
        main.start(&request(ListenerKind::Main, 1)).unwrap();

        recognizer.hear("gehun ka", false);
        recognizer.hear("gehun ka bhav", true);
        assert_eq!(recognizer.listening(), None);

        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&(ListenerKind::Main, 1, EngineEventKind::Ended)));
        // A later stop must not produce a second Ended
        main.stop();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_double_start_reports_already_started() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let recognizer = ConsoleRecognizer::new(tx);
        let mut wake = recognizer.engine(ListenerKind::Wake);
        wake.start(&request(ListenerKind::Wake, 1)).unwrap();
        assert_eq!(
            wake.start(&request(ListenerKind::Wake, 2)),
            Err(EngineError::AlreadyStarted)
        );
    }
}
