pub mod audio;
pub mod credentials;
pub mod live;
pub mod settings;
pub mod state_machine;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use audio::{CaptureSession, CpalInput, CpalOutput, VoiceActivityGate};
use live::{LiveClient, ServerMessage};
use settings::ClientSettings;

const HELP: &str = "Type a message and press Enter. /mic toggles the microphone, \
/key shows the stored API key, /key <value> stores one, /key clear removes it, /quit exits.";

/// Entry point for the `live-voice` binary
pub fn run() {
    // RUST_LOG overrides; `log` records are bridged into the subscriber
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    // tokio-tungstenite's rustls needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    // One logical execution context for the whole session
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run_terminal(settings::load_or_create_settings())) {
        log::error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_terminal(settings: ClientSettings) -> Result<(), String> {
    let api_key = credentials::get_api_key();
    if let Some(key) = api_key.as_deref() {
        log::info!("Using API key {}", credentials::mask_key(key));
    }

    let client = LiveClient::with_websocket(settings.session_options(api_key), Box::new(CpalOutput));

    println!("Connecting to {}...", settings.model);
    client
        .connect(settings.session_config())
        .await
        .map_err(|e| e.to_string())?;
    println!("Connected. {}", HELP);

    let printer = tokio::spawn(print_content(client.content()));

    let mut capture = CaptureSession::new(Box::new(CpalInput))
        .with_batch_blocks(settings.capture_batch_blocks)
        .with_volume_interval(Duration::from_millis(settings.volume_interval_ms));
    wire_capture(&capture, &client, settings.vad_threshold);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = client.connection_status();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => match parse_line(&line) {
                    TerminalCommand::Empty => {}
                    TerminalCommand::Quit => break,
                    TerminalCommand::Mic => toggle_microphone(&mut capture, &client),
                    TerminalCommand::Help => println!("{}", HELP),
                    TerminalCommand::Key(action) => run_key_command(action),
                    TerminalCommand::Text(text) => client.send_text(text),
                },
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            },

            changed = status.changed() => {
                if changed.is_err() || !status.borrow().is_connected() {
                    println!("Disconnected.");
                    break;
                }
            }
        }
    }

    capture.stop();
    client.disconnect().await;
    printer.abort();
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum KeyAction<'a> {
    Show,
    Store(&'a str),
    Clear,
}

/// One line of terminal input
#[derive(Debug, PartialEq, Eq)]
enum TerminalCommand<'a> {
    Empty,
    Quit,
    Mic,
    Help,
    Key(KeyAction<'a>),
    Text(&'a str),
}

fn parse_line(line: &str) -> TerminalCommand<'_> {
    let line = line.trim();
    match line {
        "" => TerminalCommand::Empty,
        "/quit" => TerminalCommand::Quit,
        "/mic" => TerminalCommand::Mic,
        "/help" => TerminalCommand::Help,
        "/key" => TerminalCommand::Key(KeyAction::Show),
        "/key clear" => TerminalCommand::Key(KeyAction::Clear),
        _ => match line.strip_prefix("/key ") {
            Some(value) => TerminalCommand::Key(KeyAction::Store(value.trim())),
            None => TerminalCommand::Text(line),
        },
    }
}

/// Keyring changes apply from the next connect
fn run_key_command(action: KeyAction<'_>) {
    let result = match action {
        KeyAction::Show => {
            match credentials::masked_api_key() {
                Some(masked) => println!("API key: {}", masked),
                None => println!("No API key configured."),
            }
            return;
        }
        KeyAction::Store(value) => credentials::set_api_key(Some(value))
            .map(|()| "API key stored; it is used from the next connection."),
        KeyAction::Clear => credentials::set_api_key(None).map(|()| "API key removed."),
    };

    match result {
        Ok(message) => println!("{}", message),
        Err(e) => {
            log::error!("Credentials: {}", e);
            eprintln!("{}", e);
        }
    }
}

/// Capture frames stream as realtime input; volume edges drive the silence timer
fn wire_capture(capture: &CaptureSession, client: &LiveClient, vad_threshold: f32) {
    let data_client = client.clone();
    capture.on_data(move |chunk| data_client.send_realtime_input(vec![chunk]));

    let vad_client = client.clone();
    let mut gate = VoiceActivityGate::new(vad_threshold);
    capture.on_volume(move |volume| {
        if let Some(speaking) = gate.update(volume) {
            vad_client.voice_activity(speaking);
        }
    });
}

fn toggle_microphone(capture: &mut CaptureSession, client: &LiveClient) {
    if capture.is_running() {
        capture.stop();
        client.voice_activity(false);
        println!("Microphone muted.");
        return;
    }

    match capture.start() {
        Ok(()) => {
            // Capture start is a new user turn
            client.begin_user_turn();
            println!("Microphone live.");
        }
        Err(e) => {
            log::error!("Capture: {}", e);
            eprintln!("Microphone unavailable: {}", e);
        }
    }
}

async fn print_content(mut content: broadcast::Receiver<ServerMessage>) {
    loop {
        match content.recv().await {
            Ok(ServerMessage::ServerContent(server_content)) => {
                if let Some(text) = server_content.text() {
                    println!("{}", text);
                }
            }
            Ok(ServerMessage::ToolCall(call)) => println!("[tool call] {}", call),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Content printer lagged, skipped {} messages", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   "), TerminalCommand::Empty);
        assert_eq!(parse_line("/quit"), TerminalCommand::Quit);
        assert_eq!(parse_line(" /mic "), TerminalCommand::Mic);
        assert_eq!(parse_line("/help"), TerminalCommand::Help);
    }

    #[test]
    fn test_parse_key_commands() {
        assert_eq!(parse_line("/key"), TerminalCommand::Key(KeyAction::Show));
        assert_eq!(parse_line("/key clear"), TerminalCommand::Key(KeyAction::Clear));
        assert_eq!(
            parse_line("/key  AIzaSyExample123456 "),
            TerminalCommand::Key(KeyAction::Store("AIzaSyExample123456"))
        );
    }

    #[test]
    fn test_other_lines_are_sent_as_text() {
        assert_eq!(parse_line("  hello there "), TerminalCommand::Text("hello there"));
        assert_eq!(parse_line("/keyboard"), TerminalCommand::Text("/keyboard"));
    }
}
