use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, load_settings_from},
    messages::MessageThread,
    ChatClient,
};
use futures::StreamExt;
use shared::domain::{Chat, ChatId, Message, MessageKey, MessageStatus, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal front end for the chat client core")]
struct Cli {
    /// Settings file; `client.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        login: String,
        password: String,
    },
    Register {
        login: String,
        password: String,
        display_name: String,
    },
    /// Lists chats, newest activity first.
    Chats {
        #[arg(long, default_value_t = 1)]
        pages: u32,
    },
    /// Finds users by login or display name.
    Search {
        query: String,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Changes the display name other users see.
    Rename {
        display_name: String,
    },
    /// Starts (or reopens) a chat with a user.
    NewChat {
        user_id: i64,
    },
    /// Prints the recent history of a chat.
    Open {
        chat_id: i64,
    },
    Send {
        chat_id: i64,
        text: String,
    },
    /// Streams a chat live; lines typed on stdin are sent as messages.
    Follow {
        chat_id: i64,
    },
    Logout,
    /// Signs every device of this account out.
    LogoutAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    let client = ChatClient::connect(settings).await?;

    match cli.command {
        Command::Login { login, password } => {
            let me = client.login(&login, &password).await?;
            println!("logged in as {} (user_id={})", me.display_name, me.user_id);
        }
        Command::Register {
            login,
            password,
            display_name,
        } => {
            let me = client.register(&login, &password, &display_name).await?;
            println!("registered {} (user_id={})", me.display_name, me.user_id);
        }
        Command::Chats { pages } => {
            require_session(&client).await?;
            let chat_list = client.chat_list();
            chat_list.refresh().await?;
            for _ in 1..pages {
                if !chat_list.snapshot().has_more {
                    break;
                }
                chat_list.load_next_page().await?;
            }
            for chat in chat_list.snapshot().items {
                print_chat(&chat);
            }
        }
        Command::Search { query, offset } => {
            require_session(&client).await?;
            for user in client.search_users(&query, offset).await? {
                println!("{:>6}  {} (@{})", user.user_id, user.display_name, user.username);
            }
        }
        Command::Rename { display_name } => {
            require_session(&client).await?;
            let me = client.update_display_name(&display_name).await?;
            println!("display name is now {}", me.display_name);
        }
        Command::NewChat { user_id } => {
            require_session(&client).await?;
            let thread = client.open_chat_with(UserId(user_id)).await?;
            println!(
                "chat {} with {}",
                thread.chat_id(),
                thread.companion_name()
            );
        }
        Command::Open { chat_id } => {
            let thread = open_thread(&client, ChatId(chat_id)).await?;
            for message in thread.snapshot().items {
                print_message(&message);
            }
        }
        Command::Send { chat_id, text } => {
            let thread = open_thread(&client, ChatId(chat_id)).await?;
            let sent = thread.send(&text).await?;
            print_message(&sent);
        }
        Command::Follow { chat_id } => follow(&client, ChatId(chat_id)).await?,
        Command::Logout => {
            client.logout().await;
            println!("logged out");
        }
        Command::LogoutAll => {
            require_session(&client).await?;
            client.logout_all().await?;
            println!("logged out on every device");
        }
    }

    Ok(())
}

async fn require_session(client: &ChatClient) -> Result<()> {
    if client.is_logged_in().await {
        Ok(())
    } else {
        Err(anyhow!("not logged in; run `login` first"))
    }
}

async fn find_chat(client: &ChatClient, chat_id: ChatId) -> Result<Chat> {
    let chat_list = client.chat_list();
    if let Some(chat) = chat_list.find(chat_id).await {
        return Ok(chat);
    }
    chat_list.refresh().await?;
    while chat_list.find(chat_id).await.is_none() && chat_list.snapshot().has_more {
        chat_list.load_next_page().await?;
    }
    chat_list
        .find(chat_id)
        .await
        .with_context(|| format!("chat {chat_id} is not in your chat list"))
}

async fn open_thread(client: &ChatClient, chat_id: ChatId) -> Result<Arc<MessageThread>> {
    require_session(client).await?;
    let chat = find_chat(client, chat_id).await?;
    let thread = client.open_chat(&chat).await;
    thread.refresh().await?;
    Ok(thread)
}

async fn follow(client: &ChatClient, chat_id: ChatId) -> Result<()> {
    let thread = open_thread(client, chat_id).await?;
    client.connect_push().await?;
    info!(chat_id = %chat_id, "following chat; ctrl-c to stop");

    let mut printed: HashSet<MessageKey> = HashSet::new();
    let mut snapshots = thread.subscribe();
    let mut typing = thread.subscribe_typing();
    let mut expired = client.subscribe_session_expired();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(snapshot) = snapshots.next() => {
                for message in snapshot.items {
                    if message.status == MessageStatus::Sent && printed.insert(message.key) {
                        print_message(&message);
                    }
                }
            }
            Some(state) = typing.next() => {
                if state.is_active {
                    println!("  {} is typing: {}", thread.companion_name(), state.remote_text);
                }
            }
            line = stdin.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(err) = thread.send(&line).await {
                        eprintln!("send failed: {err}");
                    }
                }
                None => break,
            },
            _ = expired.recv() => {
                eprintln!("session expired; log in again");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close_chat(chat_id).await;
    client.disconnect_push().await;
    Ok(())
}

fn format_time(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| millis.to_string())
}

fn print_chat(chat: &Chat) {
    let preview = match (&chat.last_message_sender_name, &chat.last_message_text) {
        (Some(sender), Some(text)) => format!("{sender}: {text}"),
        _ => "(no messages yet)".to_string(),
    };
    println!(
        "[{}] {}  {}  {}",
        chat.chat_id,
        chat.companion_name,
        format_time(chat.last_message_timestamp),
        preview
    );
}

fn print_message(message: &Message) {
    let marker = match message.status {
        MessageStatus::Sending => " (sending)",
        MessageStatus::Sent => "",
        MessageStatus::Failed => " (failed)",
    };
    println!(
        "{} {}: {}{}",
        format_time(message.timestamp),
        message.sender_name,
        message.text,
        marker
    );
}
