use anyhow::{Context, Result};
use clap::Parser;
use kiosk_voice::audio_capture::{self, CaptureConfig, MicrophoneCapture};
use kiosk_voice::config::load_config;
use kiosk_voice::console_engine::ConsoleRecognizer;
use kiosk_voice::controller::session::{ConversationMode, MicState};
use kiosk_voice::echo_guard::AvatarState;
use kiosk_voice::events::{ControllerEvent, ControllerOutput};
use kiosk_voice::language::Language;
use kiosk_voice::listener::ListenerKind;
use kiosk_voice::{Recognizer, RuntimeHandle, VoiceRuntime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Stream server websocket URL (overrides KIOSK_STREAM_URL)
    #[arg(long)]
    stream_url: Option<String>,

    /// Recognise through the stream server instead of the console engine
    #[arg(long)]
    use_stream: bool,

    /// Initial language, by name or code
    #[arg(long)]
    language: Option<String>,

    /// Do not open the microphone
    #[arg(long)]
    no_mic: bool,

    /// Input device name (default device when omitted)
    #[arg(long)]
    device: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Say(String),
    Partial(String),
    SpeakStart,
    SpeakEnd,
    Mic,
    Reset,
    Lang(Language),
    Status,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "say" if !rest.is_empty() => ConsoleCommand::Say(rest.to_string()),
        "partial" if !rest.is_empty() => ConsoleCommand::Partial(rest.to_string()),
        "speak-start" => ConsoleCommand::SpeakStart,
        "speak-end" => ConsoleCommand::SpeakEnd,
        "mic" => ConsoleCommand::Mic,
        "reset" => ConsoleCommand::Reset,
        "lang" => ConsoleCommand::Lang(
            Language::parse(rest).with_context(|| format!("Unknown language '{}'", rest))?,
        ),
        "status" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        "help" => ConsoleCommand::Help,
        _ => anyhow::bail!("Unknown command '{}', try 'help'", line),
    };
    Ok(Some(command))
}

#[derive(Debug, Clone, Default)]
struct Snapshot {
    mic: MicState,
    mode: ConversationMode,
    language: Option<Language>,
    session_id: Option<String>,
}

fn print_help() {
    println!("Commands:");
    println!("  say <text>      final recognition result for the running listener");
    println!("  partial <text>  interim recognition result");
    println!("  speak-start     avatar started speaking");
    println!("  speak-end       avatar finished speaking");
    println!("  mic             press the mic button");
    println!("  reset           start a new session");
    println!("  lang <name>     switch language");
    println!("  status          show controller state");
    println!("  quit            exit");
}

/// Print controller outputs and keep the status snapshot current
async fn print_outputs(
    mut outputs: broadcast::Receiver<ControllerOutput>,
    snapshot: watch::Sender<Snapshot>,
) {
    loop {
        let output = match outputs.recv().await {
            Ok(output) => output,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("⚠️ Output printer lagged, {} outputs skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match &output {
            ControllerOutput::VoiceInputReady { text, origin } => {
                println!("✨ Voice input ({}): \"{}\"", origin, text)
            }
            ControllerOutput::WakeDetected => println!("👂 Wake phrase detected"),
            ControllerOutput::MicStateChanged(state) => {
                println!("🎙️ Mic: {}", state);
                snapshot.send_modify(|s| s.mic = *state);
            }
            ControllerOutput::ModeChanged(mode) => {
                println!("🔁 Mode: {}", mode);
                snapshot.send_modify(|s| s.mode = *mode);
            }
            ControllerOutput::LanguageChanged(language) => {
                println!("🌐 Language: {}", language);
                snapshot.send_modify(|s| s.language = Some(*language));
            }
            ControllerOutput::Transcript { text, is_final } => {
                println!("📝 {}{}", text, if *is_final { "" } else { " …" })
            }
            ControllerOutput::AgentReply(reply) => println!("🗣️ Reply: {}", reply.text),
            ControllerOutput::Notice(notice) => println!("❌ {}", notice),
            ControllerOutput::SessionReset { session_id } => {
                println!("🔄 New session {}", session_id);
                snapshot.send_modify(|s| {
                    s.session_id = Some(session_id.clone());
                    s.mode = ConversationMode::WakeWord;
                });
            }
        }
    }
}

fn dispatch(
    command: ConsoleCommand,
    handle: &RuntimeHandle,
    console: Option<&ConsoleRecognizer>,
    snapshot: &watch::Receiver<Snapshot>,
) -> Result<bool> {
    let event = match command {
        ConsoleCommand::Say(text) | ConsoleCommand::Partial(text) if console.is_none() => {
            println!("Recognition comes from the stream server; '{}' ignored", text);
            return Ok(true);
        }
        ConsoleCommand::Say(text) => {
            hear(console, &text, true);
            return Ok(true);
        }
        ConsoleCommand::Partial(text) => {
            hear(console, &text, false);
            return Ok(true);
        }
        ConsoleCommand::SpeakStart => ControllerEvent::Avatar(AvatarState::Speaking),
        ConsoleCommand::SpeakEnd => ControllerEvent::Avatar(AvatarState::Idle),
        ConsoleCommand::Mic => ControllerEvent::MicButton,
        ConsoleCommand::Reset => ControllerEvent::Reset,
        ConsoleCommand::Lang(language) => ControllerEvent::SetLanguage(language),
        ConsoleCommand::Status => {
            let s = snapshot.borrow();
            println!(
                "mic {}, mode {}, language {}, session {}, listening: {}",
                s.mic,
                s.mode,
                s.language.map(|l| l.to_string()).unwrap_or_else(|| "-".into()),
                s.session_id.as_deref().unwrap_or("-"),
                console
                    .and_then(ConsoleRecognizer::listening)
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "none".into())
            );
            return Ok(true);
        }
        ConsoleCommand::Help => {
            print_help();
            return Ok(true);
        }
        ConsoleCommand::Quit => return Ok(false),
    };
    handle.send(event).context("Failed to reach the voice runtime")?;
    Ok(true)
}

fn hear(console: Option<&ConsoleRecognizer>, text: &str, is_final: bool) {
    if let Some(console) = console {
        if !console.hear(text, is_final) {
            println!("Nothing is listening right now");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list_devices {
        for device in audio_capture::list_devices().context("Failed to list input devices")? {
            println!(
                "{}{} ({} channels)",
                if device.is_default { "* " } else { "  " },
                device.name,
                device.channel_count
            );
        }
        return Ok(());
    }

    let mut config = load_config().context("Failed to load configuration")?;
    if let Some(url) = args.stream_url {
        url::Url::parse(&url).with_context(|| format!("Invalid stream URL '{}'", url))?;
        config.transport.url = url;
    }
    if args.use_stream {
        config.transport.enabled = true;
    }
    if let Some(language) = args.language.as_deref() {
        config.session.language = Language::parse(language)
            .with_context(|| format!("Unsupported language '{}'", language))?;
    }
    config.validate().context("Invalid configuration")?;
    log::info!("🚀 Initializing kiosk-voice");

    let runtime = VoiceRuntime::new(config.clone());
    let handle = runtime.handle();

    let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
        language: Some(config.session.language),
        ..Snapshot::default()
    });
    let printer = tokio::spawn(print_outputs(handle.subscribe(), snapshot_tx));

    let mut capture = None;
    let mut frames = None;
    if !args.no_mic {
        let (tx, rx) = mpsc::channel(32);
        let capture_config = CaptureConfig {
            device_name: args.device.clone(),
            ..CaptureConfig::default()
        };
        match MicrophoneCapture::open(capture_config, tx) {
            Ok(mic) => {
                capture = Some(mic);
                frames = Some(rx);
            }
            Err(e) => log::warn!("⚠️ Running without microphone: {}", e),
        }
    }

    let console = (!config.transport.enabled).then(|| ConsoleRecognizer::new(handle.event_sender()));
    let recognizer = match &console {
        Some(console) => Recognizer::Listeners {
            main: Box::new(console.engine(ListenerKind::Main)),
            wake: Box::new(console.engine(ListenerKind::Wake)),
        },
        None => Recognizer::Stream,
    };
    let runtime_task = tokio::spawn(runtime.run(recognizer, frames));

    println!("🎧 kiosk-voice ready. Type 'help' for commands, Ctrl+C to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        match parse_command(&line) {
            Ok(Some(command)) => {
                if !dispatch(command, &handle, console.as_ref(), &snapshot_rx)? {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => println!("{}", e),
        }
    }

    handle.shutdown();
    runtime_task
        .await
        .context("Voice runtime panicked")?
        .context("Voice runtime failed")?;
    if let Some(capture) = capture {
        capture.close();
    }
    printer.abort();
    log::info!("👋 kiosk-voice stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            parse_command("say hey mira").unwrap(),
            Some(ConsoleCommand::Say("hey mira".to_string()))
        );
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("SPEAK-START").unwrap(), Some(ConsoleCommand::SpeakStart));
        assert_eq!(
            parse_command("lang ta").unwrap(),
            Some(ConsoleCommand::Lang(Language::Tamil))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_command("lang klingon").is_err());
        assert!(parse_command("say").is_err());
        assert!(parse_command("dance").is_err());
    }
}
