use clap::{Parser, Subcommand};
use datachat::attachment::{format_file_size, Attachment};
use datachat::chat::ChatState;
use datachat::client::ChatClient;
use datachat::config::{Config, ConfigOverrides};
use datachat::logging::{init_tracing, LogTarget};
use datachat::protocol::Role;
use datachat::stream::{StreamOptions, StreamOutcome};
use datachat::ui::{self, ChatScreen};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;

type MainResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "datachat", about = "Chat with a CSV dataset through the analysis backend")]
struct Cli {
    /// Backend API root
    #[arg(long, global = true, env = "DATACHAT_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the backend
    #[arg(long, global = true, env = "DATACHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Request timeout and per-reply deadline, in seconds
    #[arg(long, global = true, env = "DATACHAT_TIMEOUT")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat over a CSV file
    Chat {
        file: PathBuf,
        /// Resume an existing session instead of creating one
        #[arg(long)]
        session: Option<String>,
    },
    /// Ask a single question and print the reply
    Ask {
        file: PathBuf,
        #[arg(long)]
        session: Option<String>,
        /// Wait for the whole reply instead of streaming it
        #[arg(long)]
        no_stream: bool,
        message: String,
    },
    /// Print a session's message history
    History { session: String },
    /// Print session details
    Session { session: String },
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let target = match cli.command {
        Command::Chat { .. } => LogTarget::FileOnly,
        _ => LogTarget::Stderr,
    };
    init_tracing(target);

    let config = Config::load()?.resolve(ConfigOverrides {
        base_url: cli.base_url,
        token: cli.token,
        timeout_seconds: cli.timeout,
    })?;
    let client = ChatClient::new(config.client_config())?;

    match cli.command {
        Command::Chat { file, session } => {
            let attachment = load_attachment(&file).await?;
            let state = open_session(&client, &attachment, session).await?;
            let screen = ChatScreen {
                client: Arc::new(client),
                attachment: Arc::new(attachment),
                state,
                reply_timeout: config.timeout(),
            };
            ui::run_tui(screen)
        }
        Command::Ask {
            file,
            session,
            no_stream,
            message,
        } => {
            let attachment = load_attachment(&file).await?;
            let mut state = open_session(&client, &attachment, session).await?;
            let turn = state.begin_turn(&message)?;

            if no_stream {
                let reply = client
                    .send_message(&turn.session_id, &turn.message, &attachment)
                    .await?;
                println!("{}", reply.ai_response);
                return Ok(());
            }

            let options = StreamOptions::new().with_deadline(Instant::now() + config.timeout());
            let cancel = options.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let mut stdout = std::io::stdout();
            let summary = client
                .send_streaming_message(
                    &turn.session_id,
                    &turn.message,
                    &attachment,
                    &options,
                    |delta| {
                        let _ = write!(stdout, "{}", delta);
                        let _ = stdout.flush();
                    },
                )
                .await?;
            println!();

            if summary.outcome == StreamOutcome::Cancelled {
                eprintln!("(reply stopped)");
            }
            Ok(())
        }
        Command::History { session } => {
            for message in client.session_messages(&session).await? {
                let who = match message.role {
                    Role::User => "you",
                    Role::Assistant => "assistant",
                };
                println!("[{}] {}: {}", message.timestamp, who, message.content);
            }
            Ok(())
        }
        Command::Session { session } => {
            let details = client.session(&session).await?;
            println!("session:      {}", details.session_id);
            println!("file:         {}", details.file_name);
            println!("created:      {}", details.created_at);
            if let Some(updated) = details.last_updated {
                println!("last updated: {}", updated);
            }
            Ok(())
        }
    }
}

async fn load_attachment(path: &Path) -> MainResult<Attachment> {
    let attachment = Attachment::from_path(path).await?;
    attachment.ensure_chat_compatible()?;
    eprintln!(
        "Loaded {} ({})",
        attachment.file_name,
        format_file_size(attachment.len() as u64)
    );
    Ok(attachment)
}

async fn open_session(
    client: &ChatClient,
    attachment: &Attachment,
    session_id: Option<String>,
) -> MainResult<ChatState> {
    let mut state = ChatState::new(attachment.file_name.clone());
    let Some(session_id) = session_id else {
        let session = client.create_session(attachment).await?;
        eprintln!("Chat session {} created", session.session_id);
        state.attach_session(session)?;
        return Ok(state);
    };

    state.attach_session(client.session(&session_id).await?)?;
    state.load_history(client.session_messages(&session_id).await?)?;
    Ok(state)
}
