//! Command line demo for hosting or joining a portbus cluster.
//!
//! Use cases:
//! $ pbctl dynamic --secret <SECRET> --label renderer
//! $ pbctl worker --secret <SECRET> --url ws://localhost:46003/nextcord-ipc
//! $ pbctl master --secret <SECRET> --host 0.0.0.0:46000

use std::process::ExitCode;
use std::time::Duration;

use clap::{arg, crate_authors, crate_description, crate_version, ArgMatches, Command};
use portbus::{Config, Peer};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let matches = Command::new("pbctl")
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .disable_help_subcommand(true)
        .arg_required_else_help(true)
        .subcommand_required(true)
        .arg(arg!(--secret <SECRET> "Shared secret every peer on this cluster must present").required(true).global(true))
        .arg(arg!(--label <LABEL> "Label to advertise on connect, may be repeated").action(clap::ArgAction::Append).global(true))
        .subcommand(Command::new("dynamic").about("Probe the default port range, joining an existing master or becoming one"))
        .subcommand(
            Command::new("worker")
                .about("Connect directly to a known master, skipping discovery")
                .arg(arg!(--url <URL> "Websocket URL of the master to join").required(true)),
        )
        .subcommand(
            Command::new("master")
                .about("Bind directly on a known address, skipping discovery")
                .arg(arg!(--host <ADDR> "Address to bind, e.g. 0.0.0.0:46000").required(true)),
        )
        .get_matches();

    if let Err(message) = run(&matches).await {
        eprintln!("{message}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(matches: &ArgMatches) -> CmdResult<()> {
    let secret = matches.get_one::<String>("secret").unwrap().clone();
    let labels: Vec<String> = matches.get_many::<String>("label").map(|v| v.cloned().collect()).unwrap_or_default();

    let config = match matches.subcommand() {
        Some(("dynamic", _)) => Config::new(secret),
        Some(("worker", sub)) => Config::new(secret)
            .url(sub.get_one::<String>("url").unwrap().clone())
            .map_err(|e| e.to_string())?,
        Some(("master", sub)) => Config::new(secret)
            .host(sub.get_one::<String>("host").unwrap().clone())
            .map_err(|e| e.to_string())?,
        _ => unreachable!(),
    };

    let peer = Peer::connect(config).await.map_err(|e| format!("failed to join the bus: {e}"))?;

    if !labels.is_empty() {
        peer.set_labels(labels.clone()).await.map_err(|e| format!("failed to register labels: {e}"))?;
        println!("advertising labels: {labels:?}");
    }

    let echo_peer = peer.clone();
    peer.on("ping", move |envelope| {
        let peer = echo_peer.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            let _ = peer.reply(&envelope, serde_json::json!({ "pong": true })).await;
        });
    });

    let printer = peer.clone();
    peer.on("receive", move |envelope| {
        println!("<- {} {}", envelope.kind, envelope.data);
        let _ = &printer;
    });

    println!("connected; type `help` for the command list");
    repl(peer).await
}

async fn repl(peer: Peer) -> CmdResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.map_err(|e| format!("stdin error: {e}"))? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = dispatch_line(&peer, line).await {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

async fn dispatch_line(peer: &Peer, line: &str) -> CmdResult<()> {
    let mut parts = line.splitn(4, ' ');
    match parts.next().unwrap_or_default() {
        "help" => {
            println!("commands:");
            println!("  send <event> <target|-> <json>");
            println!("  request <event> <target|-> <json>");
            println!("  reqmany <event> <label> <json>");
            println!("  labels <comma,separated,labels>");
            println!("  quit");
        }
        "send" => {
            let (event, target, data) = parse_targeted(&mut parts)?;
            match target {
                Some(target) => peer.send_to(event, data, target).await.map_err(|e| e.to_string())?,
                None => peer.send_message(event, data).await.map_err(|e| e.to_string())?,
            }
        }
        "request" => {
            let (event, target, data) = parse_targeted(&mut parts)?;
            let reply = peer
                .request(event, data, target.as_deref(), Some(Duration::from_secs(5)))
                .await
                .map_err(|e| e.to_string())?;
            println!("-> {} {}", reply.kind, reply.data);
        }
        "reqmany" => {
            let event = parts.next().ok_or("usage: reqmany <event> <label> <json>")?.to_string();
            let label = parts.next().ok_or("usage: reqmany <event> <label> <json>")?.to_string();
            let data = parse_json(parts.next().unwrap_or("null"))?;
            let replies = peer.request_many(event, data, label, Some(Duration::from_secs(5))).await.map_err(|e| e.to_string())?;
            println!("-> {} replies", replies.len());
            for reply in replies {
                println!("   {} {}", reply.kind, reply.data);
            }
        }
        "labels" => {
            let labels = parts.next().unwrap_or_default().split(',').filter(|s| !s.is_empty()).map(String::from).collect();
            peer.set_labels(labels).await.map_err(|e| e.to_string())?;
        }
        "quit" => std::process::exit(0),
        other => return Err(format!("unknown command {other:?}, type `help`")),
    }
    Ok(())
}

fn parse_targeted<'a>(parts: &mut impl Iterator<Item = &'a str>) -> CmdResult<(String, Option<String>, serde_json::Value)> {
    let event = parts.next().ok_or("usage: <cmd> <event> <target|-> <json>")?.to_string();
    let target = parts.next().ok_or("usage: <cmd> <event> <target|-> <json>")?;
    let target = if target == "-" { None } else { Some(target.to_string()) };
    let data = parse_json(parts.next().unwrap_or("null"))?;
    Ok((event, target, data))
}

fn parse_json(text: &str) -> CmdResult<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| format!("invalid json: {e}"))
}

type CmdResult<T> = Result<T, String>;
