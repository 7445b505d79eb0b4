//! `MatchChat` line-oriented terminal client.
//!
//! Reads lines from stdin and prints the conversation to stdout.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/matchchat/config.toml`).
//!
//! ```bash
//! cargo run --bin matchchat-relay
//! cargo run --bin matchchat -- --push-url ws://127.0.0.1:9000/ws \
//!     --api-url http://127.0.0.1:9000/ --self-id alice --peer-id bob
//! ```
//!
//! Plain lines are sent. Commands: `/older`, `/list`, `/search <q>`,
//! `/retry <n>`, `/react <n> <emoji>`, `/pin <n>`, `/star <n>`,
//! `/delete <n>`, `/attach <path> [caption]`, `/quit`. `<n>` is the index
//! shown in front of each message.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use matchchat::chat::composer::{Draft, Payload};
use matchchat::chat::delivery::DeliveryState;
use matchchat::chat::store::{Direction, Message, MessageKey};
use matchchat::chat::{ChatEngine, ChatError, ChatEvent, LoadOutcome};
use matchchat::config::{CliArgs, ClientConfig, Endpoints};
use matchchat::environment::Environment;
use matchchat::transport::http::HttpFallback;
use matchchat::transport::manager::TransportManager;
use matchchat::transport::ws::WsPushChannel;
use matchchat::upload::{HttpUploader, PendingUpload, UploadFile};
use matchchat_proto::message::Timestamp;

type Engine = ChatEngine<WsPushChannel, HttpFallback>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file; stdout belongs to the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let endpoints = match config.endpoints() {
        Ok(endpoints) => endpoints,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(self_id = %endpoints.self_id, peer_id = %endpoints.peer_id, "matchchat starting");
    let code = match run(&config, endpoints).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    };
    tracing::info!("matchchat exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("matchchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(config: &ClientConfig, endpoints: Endpoints) -> Result<(), Box<dyn std::error::Error>> {
    let push = WsPushChannel::with_timeout(endpoints.push_url.clone(), config.connect_timeout);
    let fallback = HttpFallback::new(endpoints.api_url.clone(), endpoints.self_id.clone())?;
    let (transport, transport_events) =
        TransportManager::new(push, fallback, config.manager_config(), config.event_buffer);
    let (engine, mut chat_events) = ChatEngine::new(
        Arc::new(transport),
        endpoints.self_id.clone(),
        endpoints.peer_id.clone(),
        config.chat_config(),
    );
    let engine = Arc::new(engine);
    let uploader = Arc::new(HttpUploader::new(
        reqwest::Client::new(),
        &endpoints.api_url,
        endpoints.self_id.clone(),
    )?);

    let _tasks = engine.start(transport_events, Environment::always_online()).await;
    println!("chatting with {} (type /quit to leave)", endpoints.peer_id);
    if let Err(e) = engine.load_older().await {
        println!("* could not load history: {e}");
    }
    print_all(&engine, &config.timestamp_format);

    let (line_tx, mut lines) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = stdin.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if !handle_line(&engine, &uploader, line.trim(), &config.timestamp_format).await {
                    break;
                }
            }
            Some(event) = chat_events.recv() => {
                render_event(&engine, &event, &config.timestamp_format);
            }
        }
    }
    Ok(())
}

/// Apply one input line. Returns `false` to quit.
async fn handle_line(engine: &Arc<Engine>, uploader: &Arc<HttpUploader>, line: &str, fmt: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    let Some(command) = line.strip_prefix('/') else {
        engine.on_keystroke().await;
        report(engine.send(Draft::text(line)).await.map(|_| ()));
        return true;
    };

    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match name {
        "quit" => return false,
        "older" => match engine.load_older().await {
            Ok(LoadOutcome::Loaded { inserted, has_more, .. }) => {
                println!("* loaded {inserted} older messages{}", if has_more { "" } else { " (start of conversation)" });
                print_all(engine, fmt);
            }
            Ok(LoadOutcome::Skipped(skip)) => println!("* nothing to load ({skip:?})"),
            Err(e) => println!("* {e}"),
        },
        "list" => print_all(engine, fmt),
        "search" => {
            let messages = engine.messages();
            for hit in engine.search(rest) {
                if let Some(index) = messages.iter().position(|m| m.key == hit.key) {
                    println!("{}", format_message(index, &messages[index], fmt));
                }
            }
        }
        "retry" => {
            if let Some(MessageKey::Pending(temp)) = nth_key(engine, rest) {
                report(engine.retry(temp).await.map(|_| ()));
            } else {
                println!("* only failed messages can be retried");
            }
        }
        "react" => {
            let (index, emoji) = rest.split_once(' ').unwrap_or((rest, "+1"));
            if let Some(key) = nth_key(engine, index) {
                report(engine.toggle_reaction(&key, emoji.trim()).map(|_| ()));
            }
        }
        "pin" => {
            if let Some(key) = nth_key(engine, rest) {
                report(engine.toggle_pinned(&key).map(|_| ()));
            }
        }
        "star" => {
            if let Some(key) = nth_key(engine, rest) {
                report(engine.toggle_starred(&key).map(|_| ()));
            }
        }
        "delete" => {
            if let Some(key) = nth_key(engine, rest) {
                report(engine.delete_local(&key).map(|_| ()));
            }
        }
        "attach" => {
            let (path, caption) = rest.split_once(' ').unwrap_or((rest, ""));
            attach(engine, uploader, Path::new(path), caption.trim()).await;
        }
        other => println!("* unknown command /{other}"),
    }
    true
}

async fn attach(engine: &Arc<Engine>, uploader: &Arc<HttpUploader>, path: &Path, caption: &str) {
    let file = match UploadFile::read(path).await {
        Ok(file) => file,
        Err(e) => {
            println!("* {e}");
            return;
        }
    };
    let pending = PendingUpload::start(Arc::clone(uploader), file);
    println!("* uploading {}", pending.file_name());
    match pending.finish().await {
        Ok(attachment) => {
            report(engine.send(Draft::text(caption).with_attachment(attachment)).await.map(|_| ()));
        }
        Err(e) => println!("* {e}"),
    }
}

fn nth_key(engine: &Engine, index: &str) -> Option<MessageKey> {
    let key = index
        .parse::<usize>()
        .ok()
        .and_then(|i| engine.messages().get(i).map(|m| m.key.clone()));
    if key.is_none() {
        println!("* no message #{index}");
    }
    key
}

fn report(result: Result<(), ChatError>) {
    if let Err(e) = result {
        println!("* {e}");
    }
}

fn render_event(engine: &Engine, event: &ChatEvent, fmt: &str) {
    match event {
        ChatEvent::MessageInserted { key, index } => {
            if let Some(message) = engine.message(key) {
                println!("{}", format_message(*index, &message, fmt));
            }
        }
        ChatEvent::DeliveryChanged { state: DeliveryState::Failed, key } => {
            println!("* message {key} failed, /retry it");
        }
        ChatEvent::TypingChanged { typing: true } => println!("* {} is typing...", engine.peer_id()),
        ChatEvent::ConnectionChanged(state) => println!("* connection {state:?}"),
        ChatEvent::UpgradeRequired { upgrade_url } => {
            println!("* message limit reached, upgrade at {}", upgrade_url.as_deref().unwrap_or("the app"));
        }
        ChatEvent::Blocked => println!("* this conversation is no longer available"),
        ChatEvent::SessionExpired => println!("* session expired, sign in again"),
        ChatEvent::HistoryFailed { error } => println!("* history: {error}"),
        _ => {}
    }
}

fn print_all(engine: &Engine, fmt: &str) {
    for (index, message) in engine.messages().iter().enumerate() {
        println!("{}", format_message(index, message, fmt));
    }
}

fn format_message(index: usize, message: &Message, fmt: &str) -> String {
    let who = match message.direction {
        Direction::Outgoing => "you",
        Direction::Incoming => "them",
    };
    let content = match &message.payload {
        Payload::Text { body } => body.clone(),
        Payload::Image { url } => format!("[image] {url}"),
        Payload::Audio { url, duration_ms } => match duration_ms {
            Some(ms) => format!("[audio {}s] {url}", ms / 1000),
            None => format!("[audio] {url}"),
        },
    };
    let mut flags = String::new();
    if message.pinned {
        flags.push_str(" [pinned]");
    }
    if message.starred {
        flags.push_str(" [starred]");
    }
    for reaction in &message.reactions {
        flags.push(' ');
        flags.push_str(&reaction.emoji);
    }
    let state = match message.direction {
        Direction::Outgoing => format!(" ({})", message.delivery),
        Direction::Incoming => String::new(),
    };
    format!(
        "#{index} [{}] {who}: {content}{flags}{state}",
        format_timestamp(message.created_at, fmt)
    )
}

/// Format a timestamp in local time.
fn format_timestamp(at: Timestamp, fmt: &str) -> String {
    use chrono::{Local, TimeZone};
    let ms = at.as_millis();
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(fmt).to_string(),
        _ => "??:??".to_string(),
    }
}
