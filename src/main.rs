mod chat;
mod common;
mod config;
mod network;
mod storage;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use chat::{ChatService, Direction, SessionStore, StoreEvent};
use common::{NetworkCommand, PeerIdentity};
use network::NetworkClient;
use storage::{KvStore, MemoryStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "peerchat", about = "Presence-aware p2p chat over /chat/1.0.0")]
struct Args {
    /// Path to the JSON config file.
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,
    /// Keep all state in memory (no database file).
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let cfg = config::load_config(&args.config);

    let kv: Arc<dyn KvStore> = if args.ephemeral {
        Arc::new(MemoryStore::default())
    } else {
        if let Some(parent) = std::path::Path::new(&cfg.db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        Arc::new(SqliteStore::open(&cfg.db_path)?)
    };

    // Core <-> network channels.
    let (command_tx, command_rx) = mpsc::channel(100);
    let (event_tx, event_rx) = mpsc::channel(100);

    let keep_alive = Duration::from_secs(cfg.keep_alive_secs);
    let client = NetworkClient::new(
        event_tx,
        command_rx,
        cfg.listen_port,
        keep_alive,
        Duration::from_secs(cfg.idle_timeout_secs),
    );
    let client_kv = kv.clone();
    tokio::spawn(async move {
        if let Err(err) = client.run(client_kv.as_ref()).await {
            log::error!("network client terminated: {err}");
        }
    });

    let store = Arc::new(SessionStore::new());
    let service = ChatService::new(store, kv, command_tx.clone(), keep_alive);
    let service_task = service.clone().start(event_rx);

    // Print store changes as they happen.
    let mut updates = service.store().subscribe();
    let printer_store = service.store().clone();
    tokio::spawn(async move {
        while let Ok(event) = updates.recv().await {
            print_update(&printer_store, event);
        }
    });

    run_cli(&service, &command_tx).await;

    service.stop();
    let _ = service_task.await;
    Ok(())
}

async fn run_cli(service: &Arc<ChatService>, commands: &mpsc::Sender<NetworkCommand>) {
    println!("commands: /peers, /msg <n> <text>, /nick <name>, /dial <multiaddr>, /clear, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            _ => break,
        };
        let line = line.trim();

        if line == "/quit" {
            break;
        } else if line == "/peers" {
            let sessions = service.list_sessions();
            if sessions.is_empty() {
                println!("no chats yet");
            }
            for (i, session) in sessions.iter().enumerate() {
                println!(
                    "[{i}] {} {} ({} messages)",
                    if session.peer.is_active { "*" } else { " " },
                    session.peer.display_name,
                    session.messages.len()
                );
            }
        } else if let Some(rest) = line.strip_prefix("/msg ") {
            send_from_cli(service, rest);
        } else if let Some(name) = line.strip_prefix("/nick ") {
            if let Err(err) = service.set_local_nickname(name.trim()) {
                println!("failed to save nickname: {err}");
            }
        } else if let Some(addr) = line.strip_prefix("/dial ") {
            let command = NetworkCommand::Dial {
                address: addr.trim().to_string(),
            };
            if commands.try_send(command).is_err() {
                println!("network task is not running");
            }
        } else if line == "/clear" {
            service.delete_all_sessions();
        } else if !line.is_empty() {
            println!("unknown command: {line}");
        }
    }
}

fn send_from_cli(service: &Arc<ChatService>, rest: &str) {
    let Some((index, text)) = rest.split_once(' ') else {
        println!("usage: /msg <n> <text>");
        return;
    };
    let Ok(index) = index.parse::<usize>() else {
        println!("usage: /msg <n> <text>");
        return;
    };
    let Some(session) = service.list_sessions().into_iter().nth(index) else {
        println!("no chat at index {index}; see /peers");
        return;
    };
    if let Err(err) = service.send(text, &session.peer.identity) {
        println!("send failed: {err}");
    }
}

fn print_update(store: &Arc<SessionStore>, event: StoreEvent) {
    match event {
        StoreEvent::SessionCreated(identity) => {
            println!("new chat with {}", identity.short());
        }
        StoreEvent::PresenceChanged {
            identity,
            is_active,
        } => {
            println!(
                "{} is {}",
                display_name_of(store, &identity),
                if is_active { "online" } else { "offline" }
            );
        }
        StoreEvent::DisplayNameChanged {
            identity,
            display_name,
        } => {
            println!("{} is now known as {display_name}", identity.short());
        }
        StoreEvent::MessageAppended { identity, message } => {
            if message.direction == Direction::Received {
                println!("{}: {}", display_name_of(store, &identity), message.content);
            }
        }
        StoreEvent::Cleared => println!("all chats deleted"),
    }
}

fn display_name_of(store: &Arc<SessionStore>, identity: &PeerIdentity) -> String {
    store
        .session(identity)
        .map(|s| s.peer.display_name)
        .unwrap_or_else(|| identity.short())
}
