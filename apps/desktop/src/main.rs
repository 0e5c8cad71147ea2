use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use client_core::{load_settings, ClientEvent, MessagingClient, SendOptions};
use shared::domain::{MessageId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `client.toml` in the working directory by default.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    /// Bearer token issued by the account service.
    #[arg(long)]
    token: String,
    #[arg(long)]
    user_id: String,
    /// Peer to open; otherwise the first roster entry is used.
    #[arg(long)]
    peer: Option<String>,
    #[arg(long)]
    expire_minutes: Option<u64>,
    #[arg(long)]
    no_signal: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url.trim_end_matches('/').to_string();
    }
    if args.no_signal {
        settings.signal_enabled = false;
    }
    let user_id = UserId::parse(&args.user_id)
        .ok_or_else(|| anyhow!("--user-id must be a UUID, got '{}'", args.user_id))?;

    let client = MessagingClient::new(settings)?;
    spawn_printer(Arc::clone(&client));
    client.login(args.token, user_id).await?;
    if let Some(peer) = args.peer {
        client
            .select_conversation(&peer)
            .await
            .with_context(|| format!("--peer must be a UUID, got '{peer}'"))?;
    }

    let expire_after = expiry_from_minutes(args.expire_minutes);
    println!("Type a message and press enter. Commands: /delete <id>, /once <text>, /peers, /unread, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if let Err(err) = run_command(&client, line, expire_after).await {
            eprintln!("{err}");
        }
        if line == "/quit" {
            break;
        }
    }

    client.logout().await;
    Ok(())
}

fn expiry_from_minutes(minutes: Option<u64>) -> Option<Duration> {
    minutes.map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
}

async fn run_command(
    client: &Arc<MessagingClient>,
    line: &str,
    expire_after: Option<Duration>,
) -> Result<()> {
    match line.split_once(' ').unwrap_or((line, "")) {
        ("/quit", _) => {}
        ("/peers", _) => {
            for peer in client.peers().await {
                let status = if peer.is_online { "online" } else { "offline" };
                println!("{} {} ({status})", peer.id, peer.display_name);
            }
        }
        ("/unread", _) => println!("unread: {}", client.unread_count().await?),
        ("/delete", raw_id) => {
            let id = MessageId::parse(raw_id).ok_or_else(|| anyhow!("not a message id: {raw_id}"))?;
            client.delete_message(id).await?;
        }
        ("/once", text) => {
            client.notify_local_activity().await;
            client
                .send_with_options(
                    text,
                    SendOptions {
                        expire_after,
                        read_once: true,
                    },
                )
                .await?;
        }
        _ => {
            client.notify_local_activity().await;
            client.send_message(line, expire_after).await?;
        }
    }
    Ok(())
}

fn spawn_printer(client: Arc<MessagingClient>) {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(_)) => ClientEvent::MessagesChanged,
                Err(RecvError::Closed) => break,
            };
            match event {
                ClientEvent::MessagesChanged => {
                    println!("----");
                    for message in client.visible_messages().await {
                        let id = message
                            .id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "pending".to_string());
                        let mark = if message.read { " (read)" } else { "" };
                        println!(
                            "[{}] {} {}: {}{mark}",
                            message.created_at.format("%H:%M:%S"),
                            id,
                            message.sender_id,
                            message.body
                        );
                    }
                }
                ClientEvent::TypingChanged { peer_id, is_typing } if is_typing => {
                    println!("{peer_id} is typing...");
                }
                ClientEvent::ConnectionChanged(state) => println!("signal: {state:?}"),
                ClientEvent::SendFailed { reason, .. } => eprintln!("send failed: {reason}"),
                ClientEvent::Error(err) => eprintln!("{err}"),
                _ => {}
            }
        }
    });
}
