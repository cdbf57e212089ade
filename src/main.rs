use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use palaver::audio::playback::start_playback;
use palaver::chunklog::{read_log, replay_into, ChunkLogger};
use palaver::core::config::Config;
use palaver::core::message::{Message, Part, ToolState};
use palaver::core::session::TurnSession;
use palaver::transport::direct::DirectTransport;
use palaver::transport::sse::SseBridgeTransport;
use palaver::transport::ws::WsBridgeTransport;
use palaver::transport::Transport;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "A streaming chat client with interchangeable transports")]
#[command(version, long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ")"
))]
#[command(long_about = "Palaver streams conversational turns through a direct \
provider connection, an SSE bridge, or a WebSocket bridge, and folds the \
replies (text, tool approvals, audio) into one conversation.\n\n\
Environment Variables:\n\
  PALAVER_API_KEY   API key for the direct provider mode\n\
  OPENAI_API_KEY    Fallback API key\n\n\
Type a message and press Enter to send it. When a tool asks for approval,\n\
answer y or n (optionally followed by a reason).")]
struct Args {
    /// Transport mode: direct, sse, or ws
    #[arg(short = 't', long)]
    mode: Option<String>,

    /// Endpoint URL (provider base URL or bridge URL, depending on mode)
    #[arg(short, long)]
    url: Option<String>,

    /// Model for direct mode
    #[arg(short, long)]
    model: Option<String>,

    /// Export the chunk log to this file on exit
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Replay a recorded chunk log instead of connecting anywhere
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Location to replay from a recorded log
    #[arg(long, default_value = "direct")]
    replay_location: String,
}

fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load()?;

    if let Some(path) = &args.replay {
        return replay_transcript(path, &args.replay_location);
    }

    let mode = args
        .mode
        .or(config.mode.clone())
        .unwrap_or_else(|| "direct".to_string());

    let playback = if config.audio_playback {
        match start_playback() {
            Ok(handle) => Some(handle),
            Err(err) => {
                eprintln!("Audio playback unavailable: {err}");
                None
            }
        }
    } else {
        None
    };

    let transport: Box<dyn Transport> = match mode.as_str() {
        "direct" => {
            let base_url = args
                .url
                .or(config.direct.base_url.clone())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            let api_key = std::env::var("PALAVER_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .unwrap_or_default();
            let model = args
                .model
                .or(config.direct.model.clone())
                .unwrap_or_else(|| "gpt-4o".to_string());
            let mut transport = DirectTransport::new(base_url, api_key, model);
            if let Some(handle) = &playback {
                transport = transport.with_pcm_handler(handle.pcm_handler());
            }
            Box::new(transport)
        }
        "sse" => {
            let url = args
                .url
                .or(config.sse.url.clone())
                .ok_or("SSE mode needs --url or [sse].url in the config")?;
            let mut transport = SseBridgeTransport::new(url);
            if let Some(handle) = &playback {
                transport = transport.with_pcm_handler(handle.pcm_handler());
            }
            Box::new(transport)
        }
        "ws" => {
            let url = args
                .url
                .or(config.ws.url.clone())
                .ok_or("WS mode needs --url or [ws].url in the config")?;
            let mut transport = WsBridgeTransport::new(url);
            if let Some(handle) = &playback {
                transport = transport.with_pcm_handler(handle.pcm_handler());
            }
            Box::new(transport)
        }
        other => return Err(format!("Unknown mode: {other}").into()),
    };

    let mut logger = ChunkLogger::new(uuid::Uuid::new_v4().to_string(), mode.clone());
    if args.log.is_some() {
        logger.start();
    }
    let mut session = TurnSession::new(transport).with_logger(logger);

    let stdin = std::io::stdin();
    let mut printed = 0usize;
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        if let Err(err) = session.submit(text).await {
            eprintln!("Error: {err}");
        }
        printed = print_new_messages(session.messages(), printed);

        while let Some((approval_id, reason)) = pending_approval(session.messages()) {
            match reason {
                Some(reason) => println!("Approval required ({reason}). Approve? [y/N]"),
                None => println!("Approval required. Approve? [y/N]"),
            }
            let mut answer = String::new();
            if stdin.read_line(&mut answer)? == 0 {
                break;
            }
            let answer = answer.trim();
            let approved = answer.starts_with('y') || answer.starts_with('Y');
            let note = answer
                .split_once(' ')
                .map(|(_, rest)| rest.trim().to_string())
                .filter(|rest| !rest.is_empty());
            let reply = palaver::api::ApprovalReply {
                id: approval_id,
                approved,
                reason: note,
            };
            if let Err(err) = session.respond_to_approval(reply).await {
                eprintln!("Error: {err}");
            }
            // Re-print the approval-carrying message so late tool results
            // show up alongside whatever followed.
            printed = print_new_messages(session.messages(), printed.saturating_sub(1));
        }
    }

    if let Some(path) = &args.log {
        if let Some(logger) = session.logger() {
            let written = logger.export(path)?;
            eprintln!("Wrote {written} chunk records to {}", path.display());
        }
    }

    Ok(())
}

fn replay_transcript(path: &PathBuf, location: &str) -> Result<(), Box<dyn Error>> {
    let records = read_log(path)?;
    let mut messages = Vec::new();
    replay_into(&records, location, &mut messages);
    print_new_messages(&messages, 0);
    Ok(())
}

fn print_new_messages(messages: &[Message], already_printed: usize) -> usize {
    for msg in &messages[already_printed.min(messages.len())..] {
        if msg.role.is_user() {
            println!("You: {}", msg.text());
            continue;
        }
        let text = msg.text();
        if !text.is_empty() {
            println!("{text}");
        }
        for part in &msg.parts {
            if let Part::Tool(tool) = part {
                match &tool.state {
                    ToolState::OutputAvailable { output, .. } => {
                        println!("[{} -> {}]", tool.tool_name, output);
                    }
                    ToolState::OutputError { error_text, .. } => {
                        println!("[{} failed: {}]", tool.tool_name, error_text);
                    }
                    _ => {}
                }
            }
        }
    }
    messages.len()
}

fn pending_approval(messages: &[Message]) -> Option<(String, Option<String>)> {
    let last = messages.last()?;
    for tool in last.tools() {
        if let ToolState::ApprovalRequested { approval, .. } = &tool.state {
            return Some((approval.id.clone(), approval.reason.clone()));
        }
    }
    None
}
