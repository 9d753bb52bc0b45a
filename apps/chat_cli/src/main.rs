use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, open_store, ChatClient, ChatEvent, ConnectionStatus, GithubOAuth, OAuthCallback,
};
use shared::domain::{ConversationId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const DEFAULT_STORE_FILE: &str = "chat_client_state.json";

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from chat_client.toml and the environment.
    #[arg(long)]
    server_url: Option<String>,
    /// Where the signed-in session is kept between runs.
    #[arg(long)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        password: String,
    },
    Register {
        username: String,
        email: String,
        password: String,
    },
    /// Lists users, or searches them when a query is given.
    Users { query: Option<String> },
    /// Opens an interactive chat with the stored session.
    Chat {
        conversation_id: i64,
        recipient_id: i64,
    },
    GithubUrl,
    GithubCallback { redirect_url: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    settings.store_path = cli
        .store
        .or(settings.store_path)
        .or_else(|| Some(PathBuf::from(DEFAULT_STORE_FILE)));

    let store = open_store(&settings).context("failed to open session store")?;
    let client = ChatClient::new(settings, store);

    match cli.command {
        Command::Login { username, password } => {
            let login = client.api().login(&username, &password).await?;
            println!("signed in as {} (user_id={})", login.username, login.user_id);
        }
        Command::Register {
            username,
            email,
            password,
        } => {
            let login = client.api().register(&username, &email, &password).await?;
            println!("registered {} (user_id={})", login.username, login.user_id);
        }
        Command::Users { query } => {
            let users = match query {
                Some(query) => client.api().search_users(&query).await?,
                None => client.api().list_users().await?,
            };
            if users.is_empty() {
                println!("no users found");
            }
            for user in users {
                println!("{:>6}  {}", user.user_id, user.username);
            }
        }
        Command::Chat {
            conversation_id,
            recipient_id,
        } => {
            run_chat(
                &client,
                ConversationId(conversation_id),
                UserId(recipient_id),
            )
            .await?;
        }
        Command::GithubUrl => {
            let oauth = GithubOAuth::from_settings(client.settings())?;
            println!("{}", oauth.authorization_url(client.auth())?);
        }
        Command::GithubCallback { redirect_url } => {
            let oauth = GithubOAuth::from_settings(client.settings())?;
            let callback = OAuthCallback::from_redirect_url(&redirect_url)?;
            let login = oauth.complete(client.api(), callback).await?;
            println!("signed in as {} (user_id={})", login.username, login.user_id);
        }
    }

    Ok(())
}

async fn run_chat(
    client: &ChatClient,
    conversation_id: ConversationId,
    recipient_id: UserId,
) -> Result<()> {
    if !client.resume()? {
        bail!("no stored session; run `chat_cli login` first");
    }

    let chat = client.open_chat();
    let printer = tokio::spawn(print_events(chat.subscribe_events()));
    let mut status = client.connection().watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            if current != ConnectionStatus::Connected {
                eprintln!("-- connection {current:?}");
            }
        }
    });

    if let Err(err) = client
        .open_conversation(&chat, conversation_id, recipient_id)
        .await
    {
        printer.abort();
        if err.is_unauthorized() {
            bail!("session expired; run `chat_cli login` again");
        }
        return Err(err.into());
    }
    for message in chat.messages() {
        let who = if message.outgoing { "me" } else { "them" };
        println!("[{}] {who}: {}", message.sent_at.format("%H:%M"), message.content);
    }
    println!("-- type a message and press enter; /reconnect or /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/reconnect" => client.connection().reconnect(),
            text => {
                if let Err(err) = chat.send(text) {
                    eprintln!("-- {err}");
                }
            }
        }
    }

    printer.abort();
    client.connection().disconnect();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::MessageAdded(message)) if !message.outgoing => {
                println!("them: {}", message.content);
            }
            Ok(ChatEvent::StatusChanged { status, .. }) => println!("   ({status:?})"),
            Ok(ChatEvent::TypingChanged { is_typing: true, .. }) => println!("   (typing...)"),
            Ok(ChatEvent::ServerError(err)) => eprintln!("-- server: {err}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
