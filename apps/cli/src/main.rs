use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use client_core::{
    load_config, ChatError, ChatSessionOrchestrator, EventRenderSink, HttpChatApi, RenderEvent,
    WebSocketTransport,
};
use shared::{
    domain::{ChatId, ChatScope, ChatType, Message, MessageId, UserId},
    protocol::Identity,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    ws_url: Option<String>,
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    username: String,
    #[arg(long)]
    token: Option<String>,
    /// Chat opened on start, e.g. `channel:42` or `direct:7`.
    #[arg(long)]
    chat: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Join(ChatScope),
    Back,
    Forward,
    More,
    Retry(MessageId),
    Typing(String),
    Send(String),
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Command::Send(line.to_string()));
        };
        let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        let arg = arg.trim();
        match name {
            "join" => Ok(Command::Join(parse_scope(arg)?)),
            "back" => Ok(Command::Back),
            "forward" => Ok(Command::Forward),
            "more" => Ok(Command::More),
            "retry" => {
                let id = arg
                    .trim_start_matches("tmp-")
                    .parse::<u64>()
                    .with_context(|| format!("invalid message id '{arg}'"))?;
                Ok(Command::Retry(MessageId::Temporary(id)))
            }
            "typing" => Ok(Command::Typing(arg.to_string())),
            "quit" | "exit" => Ok(Command::Quit),
            other => bail!("unknown command '/{other}'"),
        }
    }
}

/// Parses `channel:42` / `direct:7`.
fn parse_scope(raw: &str) -> Result<ChatScope> {
    let (kind, id) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("expected <channel|direct>:<id>, got '{raw}'"))?;
    let chat_type = match kind {
        "channel" => ChatType::Channel,
        "direct" | "dm" => ChatType::Direct,
        other => bail!("unknown chat type '{other}'"),
    };
    let chat_id = id
        .parse::<i64>()
        .with_context(|| format!("invalid chat id '{id}'"))?;
    Ok(ChatScope::new(chat_type, ChatId(chat_id)))
}

fn describe(message: &Message) -> String {
    let author = message
        .author_name
        .clone()
        .unwrap_or_else(|| format!("user {}", message.author_id));
    format!("[{}] #{} {}: {}", message.scope, message.id, author, message.content)
}

fn spawn_printer(mut events: broadcast::Receiver<RenderEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    println!("... {skipped} updates skipped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event {
                RenderEvent::Appended(message) if message.is_confirmed() => {
                    println!("{}", describe(&message));
                }
                RenderEvent::Appended(message) => println!("{} (sending)", describe(&message)),
                RenderEvent::Reconciled { temp_id, confirmed } => {
                    println!("{temp_id} -> {}", describe(&confirmed));
                }
                RenderEvent::Failed { id, reason } => {
                    println!("{id} failed: {reason} (use /retry {id})");
                }
                RenderEvent::Pending(id) => println!("{id} retrying..."),
                RenderEvent::HistoryPrepended { scope, messages } => {
                    println!("--- {} older messages in {scope} ---", messages.len());
                    for message in &messages {
                        println!("{}", describe(message));
                    }
                }
                RenderEvent::LoadingShown(scope) => println!("loading {scope}..."),
                RenderEvent::LoadingHidden(_) => {}
                RenderEvent::LoadFailed { scope, reason } => {
                    println!("could not load {scope}: {reason}");
                }
                RenderEvent::TypingChanged { summary, .. } => {
                    if let Some(summary) = summary {
                        println!("{summary}");
                    }
                }
                RenderEvent::ConnectionChanged(state) => println!("connection: {state:?}"),
            }
        }
    })
}

async fn run_command(chat: &ChatSessionOrchestrator, command: Command) -> Result<(), ChatError> {
    match command {
        Command::Join(scope) => chat.switch_to_chat(scope).await.map(|_| ()),
        Command::Back => chat.navigate_back().await.map(|_| ()),
        Command::Forward => chat.navigate_forward().await.map(|_| ()),
        Command::More => chat.load_older().await.map(|_| ()),
        Command::Retry(id) => chat.retry(id).await.map(|_| ()),
        Command::Typing(text) => {
            chat.input_changed(&text).await;
            Ok(())
        }
        Command::Send(text) => chat.send(&text, Vec::new()).await.map(|_| ()),
        Command::Quit => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(ws_url) = args.ws_url {
        config.ws_url = Some(ws_url);
    }
    let ws_url = config.resolved_ws_url()?;
    info!(server_url = %config.server_url, %ws_url, "cli: starting");

    let identity = Identity {
        user_id: UserId(args.user_id),
        username: args.username,
        token: args.token,
    };
    let renderer = Arc::new(EventRenderSink::default());
    let printer = spawn_printer(renderer.subscribe());
    let chat = ChatSessionOrchestrator::new_with_dependencies(
        &config,
        identity,
        Arc::new(WebSocketTransport::new(ws_url)),
        Arc::new(HttpChatApi::new(config.server_url.clone())),
        renderer.clone(),
    );
    chat.start().await.context("failed to connect")?;

    if let Some(raw) = args.chat.as_deref() {
        let scope = parse_scope(raw)?;
        if let Err(err) = chat.switch_to_chat(scope).await {
            println!("could not open {scope}: {err}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{err:#}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        // Sends and history loads wait on the network; keep reading input meanwhile.
        let chat = Arc::clone(&chat);
        tokio::spawn(async move {
            match run_command(&chat, command).await {
                Ok(()) => {}
                Err(err) if err.is_silent() => debug!("cli: {err}"),
                Err(err) => println!("{err}"),
            }
        });
    }

    chat.shutdown().await;
    printer.abort();
    Ok(())
}
