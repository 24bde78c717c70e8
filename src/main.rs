use std::time::Duration;

use clap::Parser;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use nyaya_chat::cli::{render_message, Args, Command};
use nyaya_chat::{ChatClient, ChatConfig, ChatError, ChatServer, ClientConfig, ServerConfig};

/// How often the terminal client polls its message buffer.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = ChatConfig::from_file(&args.config)?;
    match args.command {
        Command::Serve(serve) => {
            serve.apply(&mut config.server);
            run_server(config.server).await?;
        }
        Command::Connect(connect) => {
            connect.apply(&mut config.client);
            run_client(config.client, &connect.name).await?;
        }
    }
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<(), ChatError> {
    let server = ChatServer::bind(config).await?;
    println!(
        "{} {} (capacity {})",
        "Server started on".green().bold(),
        server.local_addr()?,
        server.config().capacity
    );
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

async fn run_client(config: ClientConfig, name: &str) -> Result<(), ChatError> {
    let addr = config.addr();
    let mut client = ChatClient::new(config);
    if !client.connect(name).await {
        return Err(ChatError::connection(
            addr,
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "could not join relay"),
        ));
    }
    println!("{}", format!("Connected to {} as {}. Type /quit to leave.", addr, name).dimmed());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut seen = 0usize;

    loop {
        tokio::select! {
            line = stdin.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text == "/quit" {
                        break;
                    }
                    if text.is_empty() {
                        continue;
                    }
                    if !client.send(text).await {
                        eprintln!("{}", "Failed to send".red());
                    }
                }
                _ => break,
            },
            _ = ticker.tick() => {
                // Read the flag first so frames pushed just before the
                // receive loop stopped are still printed.
                let connected = client.is_connected();
                let fresh = client.buffer().since(seen);
                seen += fresh.len();
                for envelope in &fresh {
                    println!("{}", render_message(envelope, name));
                }
                if !connected {
                    println!("{}", "Disconnected from relay.".red());
                    break;
                }
            }
        }
    }

    client.disconnect().await;
    for envelope in &client.buffer().since(seen) {
        println!("{}", render_message(envelope, name));
    }
    Ok(())
}
