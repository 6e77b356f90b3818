use std::path::Path;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use crate::config::{self, Config};
use crate::node::console::{Command, HELP};
use crate::node::prettylog::{log_startup_banner, print_event, print_peers, print_sent};
use crate::node::{Args, Node};
use crate::utils;

pub async fn run_node() {
    let args = Args::parse();

    if let Err(e) = utils::init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        return;
    }

    let mut config = if Path::new(&args.config).exists() {
        match config::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Invalid configuration {}: {:#}", args.config, e);
                return;
            }
        }
    } else {
        tracing::info!("No configuration at {}, using defaults", args.config);
        Config::default()
    };
    args.apply(&mut config);

    let (node, events) = match Node::start(config.clone()).await {
        Ok(started) => started,
        Err(e) => {
            tracing::error!("Failed to start: {:#}", e);
            return;
        }
    };
    log_startup_banner(&config, &node.listen_addrs());

    for peer in &args.peer {
        connect(&node, peer).await;
    }

    run_event_loop(&node, events).await;
    node.shutdown().await;
}

async fn run_event_loop(node: &Node, mut events: tokio::sync::mpsc::UnboundedReceiver<crate::session::SessionEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("stdin error: {}", e);
                        break;
                    }
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => execute(node, command).await,
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }
}

async fn execute(node: &Node, command: Command) {
    match command {
        Command::Connect(target) => connect(node, &target).await,
        Command::Send { target, text } => {
            let remote = match utils::resolve_addr(&target).await {
                Ok(remote) => remote,
                Err(e) => {
                    println!("cannot resolve {}: {:#}", target, e);
                    return;
                }
            };
            match node.send(remote, text.as_bytes()).await {
                Ok(()) => print_sent(remote, &text),
                Err(e) => tracing::error!("message send error to {}: {}", remote, e),
            }
        }
        Command::Peers => print_peers(&node.status().await),
        Command::Status => match serde_json::to_string_pretty(&node.status().await) {
            Ok(json) => println!("{}", json),
            Err(e) => tracing::error!("Failed to encode status: {}", e),
        },
        Command::Help => println!("{}", HELP),
        Command::Quit => {}
    }
}

async fn connect(node: &Node, target: &str) {
    match utils::resolve_addr(target).await {
        Ok(remote) => {
            node.connect(remote).await;
            println!("connecting to {}", remote);
        }
        Err(e) => println!("cannot resolve {}: {:#}", target, e),
    }
}
