//! # parley
//!
//! Terminal client for one conversation. Plain lines are sent as messages;
//! slash commands drive typing state and read receipts.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_client::{ConversationSession, SessionConfig, SessionEvent, WsConnector};
use parley_core::{ConversationId, Credential, Endpoint, Message, MessageId, UserId};
use parley_telemetry::{init_telemetry, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Parley chat client.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "Real-time conversation client")]
struct Cli {
    /// WebSocket endpoint (ws:// or wss://). With `--conversation` this is
    /// the base path the conversation id is appended to.
    #[arg(long)]
    endpoint: String,

    /// Conversation id appended to the endpoint path.
    #[arg(long)]
    conversation: Option<String>,

    /// Access token for the conversation.
    #[arg(long)]
    token: String,

    /// Local user id, used to ignore our own typing echoes.
    #[arg(long)]
    user: String,

    /// Settings file (defaults to `~/.parley/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Reconnect with backoff after network failures.
    #[arg(long)]
    reconnect: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    Typing,
    Idle,
    Read(MessageId),
    History,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Some(Command::Send(line.trim_end().to_owned()));
    };

    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let arg = arg.trim();
    Some(match name {
        "typing" => Command::Typing,
        "idle" => Command::Idle,
        "read" if !arg.is_empty() => Command::Read(MessageId::from_raw(arg)),
        "history" => Command::History,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(trimmed.to_owned()),
    })
}

fn format_message(message: &Message) -> String {
    let marker = if message.is_read { ' ' } else { '*' };
    format!(
        "{marker} [{}] {} ({}): {}",
        message.created_at.format("%H:%M:%S"),
        message.sender.display_name,
        message.id,
        message.content
    )
}

fn print_history(session: &ConversationSession) {
    for message in session.messages() {
        println!("{}", format_message(message));
    }
}

fn print_event(session: &ConversationSession, event: &SessionEvent) {
    match event {
        SessionEvent::Connected => println!("-- connected"),
        SessionEvent::Disconnected { error: None } => println!("-- server closed the connection"),
        SessionEvent::Disconnected { error: Some(e) } => println!("-- disconnected ({}): {e}", e.reason()),
        SessionEvent::ConnectionFailed(e) => println!("-- connection failed ({}): {e}", e.reason()),
        SessionEvent::Reconnecting { attempt, delay } => {
            println!("-- reconnecting (attempt {attempt}) in {}ms", delay.as_millis())
        }
        SessionEvent::HistoryReplaced { count } => {
            println!("-- {count} messages");
            print_history(session);
        }
        SessionEvent::MessageReceived { message, .. } => println!("{}", format_message(message)),
        SessionEvent::PeerTyping(true) => println!("-- typing..."),
        SessionEvent::PeerTyping(false) => {}
        SessionEvent::Warning(text) => println!("!! {text}"),
        SessionEvent::ServerNotice(text) => println!("!! server: {text}"),
    }
}

fn run_command(session: &mut ConversationSession, command: Command) -> bool {
    let result = match command {
        Command::Send(text) => session.send_message(&text),
        Command::Typing => session.set_editing(true),
        Command::Idle => session.set_editing(false),
        Command::Read(id) => session.mark_read(&id).map(|changed| {
            if !changed {
                println!("-- nothing to mark for {id}");
            }
        }),
        Command::History => {
            print_history(session);
            Ok(())
        }
        Command::Quit => return false,
        Command::Unknown(raw) => {
            println!("!! unknown command {raw} (try /typing, /idle, /read <id>, /history, /quit)");
            Ok(())
        }
    };
    if let Err(e) = result {
        println!("!! {e}");
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => parley_settings::load_settings_from_path(path),
        None => parley_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if cli.reconnect {
        settings.connection.reconnect.enabled = true;
    }

    init_telemetry(&TelemetryConfig::with_level_str(
        &settings.logging.level,
        settings.logging.json,
    ))
    .context("Failed to initialize logging")?;

    let conversation = cli.conversation.as_deref().map(ConversationId::from_raw);
    let endpoint = match &conversation {
        Some(id) => Endpoint::for_conversation(&cli.endpoint, id),
        None => Endpoint::parse(&cli.endpoint),
    }
    .context("Invalid endpoint")?;

    let connector = Arc::new(WsConnector::new(settings.connection.connect_timeout()));
    let mut session = ConversationSession::new(
        connector,
        UserId::from_raw(cli.user),
        SessionConfig::from_settings(&settings),
    );
    if let Some(id) = conversation {
        session = session.with_conversation(id);
    }

    tracing::info!(endpoint = %endpoint, "starting parley");
    session
        .open(&endpoint.to_string(), &Credential::new(cli.token))
        .await
        .context("Failed to open session")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if let Some(command) = parse_command(&line) {
                    if !run_command(&mut session, command) {
                        break;
                    }
                }
            }
            event = session.next_event() => match event {
                Some(event) => print_event(&session, &event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    tracing::info!("session closed");
    Ok(())
}
