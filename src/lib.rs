pub mod audio_capture;
pub mod audio_level;
pub mod config;
pub mod console_engine;
pub mod controller;
pub mod echo_guard;
pub mod error;
pub mod events;
pub mod language;
pub mod listener;
pub mod runtime;
pub mod silence;
pub mod transport;

pub use controller::ModeController;
pub use error::{Result, VoiceError};
pub use runtime::{Recognizer, RuntimeHandle, VoiceRuntime};
