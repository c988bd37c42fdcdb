mod assembler;
mod attachment;
mod client;
mod conversation;
mod decoder;
mod error;
mod history;
mod protocol;
mod server;
mod session;
#[cfg(test)]
mod testing;
mod ui;
mod voice;

use clap::{Args, Parser, Subcommand};
use client::{ChatClient, ClientConfig};
use conversation::SharedConversation;
use history::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
use server::ServerConfig;
use session::ChatSession;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use ui::UiConfig;
use voice::VoiceClient;

/// Terminal chat with a local Gemma model, plus the proxy it talks to.
#[derive(Parser)]
#[command(name = "gemma-chat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat proxy in front of the model server
    Serve(ServeArgs),
    /// Open the terminal chat client
    Chat(ChatArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "GEMMA_CHAT_LISTEN", default_value = "127.0.0.1:4321")]
    listen: String,

    /// Base URL of the Ollama-compatible model server
    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    upstream_url: String,

    /// Model name sent upstream
    #[arg(long, env = "GEMMA_CHAT_MODEL", default_value = "gemma3:12b")]
    model: String,

    /// System message placed before every conversation
    #[arg(long, env = "GEMMA_CHAT_PERSONA")]
    persona: Option<String>,
}

#[derive(Args)]
struct ChatArgs {
    /// Base URL of the chat proxy
    #[arg(long, env = "GEMMA_CHAT_URL", default_value = "http://127.0.0.1:4321")]
    server_url: String,

    /// File the conversation is saved to
    #[arg(long, env = "GEMMA_CHAT_HISTORY")]
    history_file: Option<PathBuf>,

    /// Keep the conversation in memory only
    #[arg(long)]
    no_history: bool,

    /// Base URL of the speech service
    #[arg(long, env = "GEMMA_CHAT_VOICE_URL", default_value = "http://localhost:8008")]
    voice_url: String,
}

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            init_logging(cli.verbose, None)?;
            server::run(ServerConfig {
                listen: args.listen,
                upstream_url: args.upstream_url,
                model: args.model,
                persona: args
                    .persona
                    .unwrap_or_else(|| server::DEFAULT_PERSONA.to_string()),
            })
            .await
        }
        Commands::Chat(args) => {
            // The terminal belongs to the UI, so logs go to a file.
            init_logging(cli.verbose, Some(history::data_dir().join("chat.log")))?;
            run_chat(args)
        }
    }
}

fn run_chat(args: ChatArgs) -> MainResult<()> {
    let history: Arc<dyn HistoryStore> = if args.no_history {
        Arc::new(MemoryHistoryStore::new())
    } else {
        let path = args
            .history_file
            .unwrap_or_else(history::default_history_path);
        tracing::info!(path = %path.display(), "using chat history file");
        Arc::new(FileHistoryStore::new(path))
    };

    let session = Arc::new(ChatSession::new(
        ChatClient::new(ClientConfig {
            base_url: args.server_url,
        }),
        SharedConversation::default(),
        history,
    ));
    let restored = session.restore();
    tracing::info!(messages = restored, "restored chat history");

    ui::run_tui(
        session,
        UiConfig {
            voice: VoiceClient::new(&args.voice_url),
            speech_dir: history::data_dir().join("speech"),
        },
    )
}

fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> MainResult<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}
