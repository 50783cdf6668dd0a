//! Terminal front-end for the chat engine: prints channel events and sends
//! each line read from stdin as a text.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::sync::broadcast;
use tracing::Level;

use multichat::chat::chat_config::ChatConfig;
use multichat::chat::chat_events::ChatEvent;
use multichat::chat::engine::ChatEngine;
use multichat::messaging::multicast::{MulticastConfig, MulticastTransport};

#[derive(Parser, Debug)]
#[command(name = "multichat", about = "Serverless LAN chat over IPv4 multicast")]
struct Args {
    /// Nick shown to other peers (up to 64 UTF-8 bytes, no '|')
    #[arg(long)]
    nick: String,

    /// Multicast group of the channel (224.0.0.0/4)
    #[arg(long, default_value = "239.255.42.42")]
    group: Ipv4Addr,

    /// UDP port of the channel
    #[arg(long, default_value_t = 42424)]
    port: u16,

    /// Network interface to use; defaults to the single eligible one
    #[arg(long)]
    interface: Option<String>,

    /// Debug: drop every Nth outgoing datagram, 0 disables
    #[arg(long, default_value_t = 0)]
    waste_each_nth_sent: u64,

    /// Debug: drop every Nth incoming datagram, 0 disables
    #[arg(long, default_value_t = 0)]
    waste_each_nth_received: u64,

    /// Log protocol traffic
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Arc::new(ChatConfig {
        multicast: MulticastConfig {
            group_address: args.group,
            port: args.port,
            interface: args.interface.clone(),
            debug_waste_each_nth_sent: args.waste_each_nth_sent,
            debug_waste_each_nth_received: args.waste_each_nth_received,
        },
        ..ChatConfig::default()
    });

    let transport = Arc::new(
        MulticastTransport::new(config.multicast.clone())
            .context("unable to start the multicast transport")?,
    );
    let engine = Arc::new(ChatEngine::new(config, args.nick, transport)?);

    println!(
        "joined the channel as {} - type a line to send it, Ctrl-C or EOF to leave",
        engine.own_nick()
    );

    let events = engine.subscribe();

    let result = select! {
        result = engine.run() => result,
        _ = print_events(events) => Ok(()),
        result = read_and_send_lines(engine.clone()) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    engine.leave_chat().await;
    result
}

async fn print_events(mut events: broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::TextReceived { text, sender_nick }) => {
                println!("<{}> {}", sender_nick, text);
            }
            Ok(ChatEvent::TextSent { failed_peer_ids }) => {
                if failed_peer_ids.is_empty() {
                    println!("(delivered to everyone)");
                } else {
                    println!("(delivery failed for {:?})", failed_peer_ids);
                }
            }
            Ok(ChatEvent::UserJoined { peer_id, nick }) => {
                println!("* {} joined ({})", nick, peer_id);
            }
            Ok(ChatEvent::UserLeft { peer_id, nick }) => {
                println!("* {} left ({})", nick, peer_id);
            }
            Ok(ChatEvent::NetworkError { message }) => {
                eprintln!("network error: {}", message);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                eprintln!("({} events dropped)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn read_and_send_lines(engine: Arc<ChatEngine<MulticastTransport>>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if let Err(e) = engine.send_text(line).await {
            eprintln!("{}", e);
        }
    }
    // EOF quits the chat
    Ok(())
}
