//! storefront-chat - terminal client for storefront support chat
//!
//! Live message timeline, typing indicator and call signaling over the
//! storefront's socket.io server.

mod api;
mod calling;
mod chat;
mod config;
mod conversation;
mod models;
mod signaling;
mod timer;
mod tui;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::{ChatBackend, ChatClient};
use calling::media::{MediaResourceManager, SyntheticDevices};
use calling::signal_only::SignalOnlyConnector;
use chat::MessageSynchronizer;
use config::Config;
use conversation::{ConversationHandle, ConversationSettings, ConversationView};
use models::{Attachment, ChatStatus, Message, OutgoingMessage};
use signaling::websocket::{self, SocketIoTransport};
use signaling::SignalingChannel;

#[derive(Parser)]
#[command(name = "storefront-chat")]
#[command(about = "Terminal client for storefront support chat", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Socket.IO server URL (overrides the config file)
    #[arg(long, global = true)]
    server: Option<String>,

    /// Local user id (overrides the config file)
    #[arg(long, global = true)]
    user_id: Option<String>,

    /// Local display name (overrides the config file)
    #[arg(long, global = true)]
    user_name: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a conversation in the terminal UI
    Chat {
        /// Chat id
        chat_id: String,
    },

    /// Follow a conversation and print events as they arrive
    Listen {
        /// Chat id
        chat_id: String,
    },

    /// Print a chat's message history
    History {
        /// Chat id
        chat_id: String,
    },

    /// Send a message
    Send {
        /// Chat id
        chat_id: String,

        /// Message text
        message: Option<String>,

        /// Attach an image or voice recording
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Mark a chat resolved (admins only)
    Resolve {
        /// Chat id
        chat_id: String,
    },

    /// Show the configuration file
    Config {
        /// Write the defaults if no config file exists yet
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // In the TUI, logs go to the debug pane instead of stderr.
    let log_buffer = tui::log_capture::LogBuffer::new();
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());
    if matches!(cli.command, Commands::Chat { .. }) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(log_buffer.clone()),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let mut config = Config::load()?;
    if let Some(server) = cli.server {
        config.server_url = server;
    }
    if let Some(id) = cli.user_id {
        config.identity.id = id;
    }
    if let Some(name) = cli.user_name {
        config.identity.name = name;
    }

    match cli.command {
        Commands::Chat { chat_id } => {
            let (channel, connection) = connect(&config)?;
            let conversation = open_conversation(&chat_id, &channel, &config);
            let result = tui::run(conversation, channel, config.identity.clone(), log_buffer).await;
            connection.abort();
            result?;
        }
        Commands::Listen { chat_id } => {
            let (channel, connection) = connect(&config)?;
            let conversation = open_conversation(&chat_id, &channel, &config);
            listen(conversation).await;
            connection.abort();
        }
        Commands::History { chat_id } => {
            let client = ChatClient::from_config(&config);
            let chat = client.fetch_chat(&chat_id).await?;
            let mut timeline = MessageSynchronizer::new(&chat.id);
            let report = timeline.ingest_history(chat.messages);
            for rejected in &report.rejected {
                tracing::warn!("Skipped malformed message: {}", rejected);
            }
            let status = chat.status.map(|s| s.as_str()).unwrap_or("UNKNOWN");
            println!("Chat {} ({}), {} messages", chat.id, status, timeline.len());
            for message in timeline.messages() {
                println!("{}", format_message(message));
            }
        }
        Commands::Send {
            chat_id,
            message,
            file,
        } => {
            let attachment = file.as_deref().map(read_attachment).transpose()?;
            let outgoing = OutgoingMessage {
                content: message.filter(|m| !m.trim().is_empty()),
                attachment,
            };
            if outgoing.content.is_none() && outgoing.attachment.is_none() {
                bail!("Nothing to send: give a message or --file");
            }
            tracing::info!("Sending message...");
            let client = ChatClient::from_config(&config);
            let stored = client.send_message(&chat_id, &outgoing).await?;
            let message = stored
                .normalize(&chat_id)
                .context("Server returned an unusable message")?;
            println!("Sent {}", format_message(&message));
        }
        Commands::Resolve { chat_id } => {
            if !config.identity.role.can_resolve() {
                tracing::warn!("Configured role cannot resolve chats; the server may refuse");
            }
            let client = ChatClient::from_config(&config);
            let status = client.update_status(&chat_id, ChatStatus::Resolved).await?;
            println!("Chat {} is now {}", chat_id, status.as_str());
        }
        Commands::Config { init } => {
            let path = Config::config_path()?;
            if init && !path.exists() {
                config.save()?;
                println!("Wrote {}", path.display());
            }
            println!("# {}", path.display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render config")?
            );
        }
    }

    Ok(())
}

/// Start the socket connection. The returned task reconnects until aborted.
fn connect(config: &Config) -> Result<(SignalingChannel, tokio::task::JoinHandle<()>)> {
    anyhow::ensure!(
        !config.identity.id.is_empty(),
        "No identity configured: set [identity] in {} or pass --user-id",
        Config::config_path()?.display()
    );
    let url = websocket::socket_url(&config.server_url)?;
    let (transport, outbound) = SocketIoTransport::new();
    let channel = SignalingChannel::new(transport.clone());
    let task = tokio::spawn(websocket::connect_and_run(
        url,
        transport,
        outbound,
        channel.clone(),
        config.max_backoff(),
    ));
    Ok((channel, task))
}

fn open_conversation(
    chat_id: &str,
    channel: &SignalingChannel,
    config: &Config,
) -> ConversationHandle {
    let backend: Arc<dyn ChatBackend> = Arc::new(ChatClient::from_config(config));
    let media = MediaResourceManager::new(Arc::new(SyntheticDevices), config.media_constraints());
    let mut settings = ConversationSettings::new(config.identity.clone());
    settings.typing_timeout = config.typing_timeout();
    settings.call = config.call_settings();
    conversation::spawn(
        chat_id,
        channel,
        backend,
        media,
        Arc::new(SignalOnlyConnector),
        settings,
    )
}

/// Print timeline, typing and call changes until Ctrl-C.
async fn listen(mut conversation: ConversationHandle) {
    let mut printed: HashSet<String> = HashSet::new();
    let mut last = conversation.snapshot();

    loop {
        tokio::select! {
            changed = conversation.view.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = conversation.view.borrow_and_update().clone();
                report_changes(&last, &view, &mut printed);
                last = view;
            }
            Some(notice) = conversation.notices.recv() => {
                eprintln!("! {}", notice);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, leaving conversation");
                break;
            }
        }
    }
    conversation.shutdown().await;
}

fn report_changes(last: &ConversationView, view: &ConversationView, printed: &mut HashSet<String>) {
    if view.status != last.status {
        if let Some(status) = view.status {
            println!("-- chat is {}", status.as_str());
        }
    }
    for message in &view.messages {
        if printed.insert(message.id.clone()) {
            println!("{}", format_message(message));
        }
    }
    if view.typing != last.typing {
        println!("-- {}", if view.typing { "someone is typing" } else { "typing stopped" });
    }
    if view.call_state != last.call_state {
        println!("-- call {}", view.call_state.label());
    }
}

fn format_message(message: &Message) -> String {
    let sender = message
        .sender
        .display_name()
        .unwrap_or_else(|| message.sender.id());
    let mut line = format!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        sender,
        message.body()
    );
    if let Some(url) = &message.url {
        line.push_str(&format!(" <{}>", url));
    }
    line
}

fn read_attachment(path: &Path) -> Result<Attachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("Attachment path has no file name")?
        .to_string();
    Ok(Attachment {
        mime_type: mime_type_for(&file_name).to_string(),
        file_name,
        bytes,
    })
}

fn mime_type_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}
