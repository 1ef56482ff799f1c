// rfchat: two-role chat over an RFCOMM-style stream, driven from the terminal.

mod config;
mod discovery;
mod events;
mod manager;
mod radio;
mod session;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rfchat_core::{ConnectionState, DeviceId, Toggle, WatcherStatus, CHAT_SERVICE};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use crate::events::{ChatEvent, EventReceiver};
use crate::radio::lan::LanRadio;
use crate::session::ChatSession;

#[derive(Debug, Parser)]
#[command(name = "rfchat", version, about = "Chat with a nearby device")]
struct Args {
    /// Config file (default: ~/.config/rfchat/config.toml, then /etc/rfchat/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Name shown to other devices; overrides config and environment
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Listen,
    Stop,
    /// Toggle discovery.
    Discover,
    DiscoverStart,
    DiscoverStop,
    Devices,
    Status,
    Connect(String),
    Send(String),
    Disconnect,
    Help,
    Quit,
    /// Anything else: sent as a message while connected.
    Text(String),
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if line.trim().is_empty() {
            return None;
        }
        let (word, rest) = match line.trim_start().split_once(' ') {
            Some((w, r)) => (w, r.trim()),
            None => (line.trim(), ""),
        };
        let cmd = match (word, rest.is_empty()) {
            ("listen", true) => Command::Listen,
            ("stop", true) => Command::Stop,
            ("discover", true) => Command::Discover,
            ("discover", false) if rest == "start" => Command::DiscoverStart,
            ("discover", false) if rest == "stop" => Command::DiscoverStop,
            ("devices", true) => Command::Devices,
            ("status", true) => Command::Status,
            ("connect", false) => Command::Connect(rest.to_owned()),
            ("send", _) => Command::Send(rest.to_owned()),
            ("disconnect", true) => Command::Disconnect,
            ("help", true) => Command::Help,
            ("quit" | "exit", true) => Command::Quit,
            _ => Command::Text(line.to_owned()),
        };
        Some(cmd)
    }
}

const HELP: &str = "\
commands:
  listen              advertise the chat service and wait for a peer
  stop                stop listening (same as disconnect)
  discover [start|stop]
                      look for nearby devices (toggles without an argument)
  devices             list discovered devices
  status              connection state, peer and discovery
  connect <n|id>      connect to device number n or id
  send <text>         send a message (bare text works too while connected)
  disconnect          close the connection
  quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rfchat=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(name) = args.name {
        cfg.device_name = name;
    }
    let radio = LanRadio::bind(cfg.lan_settings())
        .await
        .context("starting lan radio")?;
    tracing::info!(id = %radio.id(), name = %cfg.device_name, "ready");

    let (session, events) = ChatSession::new(Arc::new(radio), CHAT_SERVICE);
    let printer = tokio::spawn(print_events(events));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            res = shutdown_signal() => {
                res?;
                None
            }
        };
        let Some(line) = line else {
            break;
        };
        let Some(cmd) = Command::parse(&line) else {
            continue;
        };
        if cmd == Command::Quit {
            break;
        }
        run(&session, cmd).await;
    }

    session.disconnect().await;
    drop(session);
    printer.abort();
    Ok(())
}

async fn run(session: &ChatSession, cmd: Command) {
    let result = match cmd {
        Command::Listen => session.start_listening().await.map(|()| {
            println!("Listening as \"{}\"", session.local_name());
        }),
        Command::Stop | Command::Disconnect => {
            session.disconnect().await;
            Ok(())
        }
        Command::Discover => session.toggle_discovery().await.map(|t| match t {
            Toggle::Started => println!("Discovery started"),
            Toggle::Stopped => println!("Discovery stopped"),
        }),
        Command::DiscoverStart => session.start_discovery().await.map(|started| {
            if !started {
                println!("Discovery already running");
            }
        }),
        Command::DiscoverStop => {
            if !session.stop_discovery().await {
                println!("Discovery not running");
            }
            Ok(())
        }
        Command::Devices => {
            print_devices(session);
            Ok(())
        }
        Command::Status => {
            print_status(session).await;
            Ok(())
        }
        Command::Connect(target) => match resolve_target(session, &target) {
            Some(id) => session.connect(&id).await,
            None => {
                println!("No device {target}");
                Ok(())
            }
        },
        Command::Send(text) => session.send(&text).await,
        Command::Text(text) => {
            if session.state().await == ConnectionState::Connected {
                session.send(&text).await
            } else {
                println!("Unknown command; type `help`");
                Ok(())
            }
        }
        Command::Help => {
            println!("{HELP}");
            Ok(())
        }
        Command::Quit => Ok(()),
    };
    if let Err(e) = result {
        println!("Error: {e}");
    }
}

/// `n` is a 1-based index into the device list; anything else is a device id.
fn resolve_target(session: &ChatSession, target: &str) -> Option<DeviceId> {
    let devices = session.devices();
    if let Ok(n) = target.parse::<usize>() {
        return n
            .checked_sub(1)
            .and_then(|i| devices.get(i))
            .map(|d| d.id.clone());
    }
    Some(DeviceId::new(target))
}

fn print_devices(session: &ChatSession) {
    let devices = session.devices();
    if devices.is_empty() {
        println!("No devices");
    }
    for (i, d) in devices.iter().enumerate() {
        println!(
            "{:>3}. {} [{}]{}",
            i + 1,
            d.name,
            d.address.as_deref().unwrap_or("?"),
            if d.is_connected == Some(true) { " (connected)" } else { "" }
        );
    }
}

async fn print_status(session: &ChatSession) {
    let state = session.state().await;
    match session.peer_name().await {
        Some(peer) => println!("{state:?} with {peer}"),
        None => println!("{state:?}"),
    }
    match session.discovery_status() {
        WatcherStatus::Stopped => println!("Discovery stopped"),
        WatcherStatus::Watching {
            enumeration_complete,
        } => println!(
            "Discovering ({} device(s){})",
            session.devices().len(),
            if enumeration_complete { "" } else { ", enumerating" }
        ),
    }
}

async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        println!("{}", describe(&event));
    }
}

fn describe(event: &ChatEvent) -> String {
    match event {
        ChatEvent::DeviceAdded(d) => format!("+ {} ({})", d.name, d.id),
        ChatEvent::DeviceUpdated(d) => format!("~ {} ({})", d.name, d.id),
        ChatEvent::DeviceRemoved(id) => format!("- {id}"),
        ChatEvent::EnumerationCompleted { count } => {
            format!("Enumeration complete: {count} device(s)")
        }
        ChatEvent::DiscoveryStopped => "Device list cleared".to_owned(),
        ChatEvent::Connected {
            role,
            peer_name,
            service_name,
        } => format!("Connected to {peer_name} as {role} ({service_name})"),
        ChatEvent::MessageReceived(text) => format!("Received: {text}"),
        ChatEvent::MessageSent(text) => format!("Sent: {text}"),
        ChatEvent::PeerDisconnected(reason) => format!("Peer disconnected: {reason}"),
        ChatEvent::Disconnected(reason) => reason.clone(),
        ChatEvent::ReceiveStopped(cause) => format!("Receive stopped: {cause}"),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
