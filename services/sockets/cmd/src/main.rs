//! TCP/TLS sockets binary.
//!
//! Opens a client session or runs a listener on top of the session manager
//! and prints every event it observes.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sockets_session::{
    ConnectOptions, EventKind, ListenOptions, ListenerEventKind, Notification, SessionEvent,
    SessionId, SocketManager, TlsOptions,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::SocketsConfig;
use logging::SocketsLogFormatter;

/// How long shutdown waits for sessions to finish closing
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

/// TCP/TLS socket sessions from the command line
#[derive(Parser, Debug)]
#[command(name = "tcp-sockets", version, about = "TCP/TLS socket sessions")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a session and print what arrives
    Connect(ConnectArgs),
    /// Accept sessions and print what arrives
    Listen(ListenArgs),
}

#[derive(ClapArgs, Debug)]
struct ConnectArgs {
    /// Remote host
    #[arg(long)]
    host: String,

    /// Remote port
    #[arg(long)]
    port: u16,

    /// Message to send once connected (repeatable)
    #[arg(long)]
    message: Vec<String>,

    /// Connect timeout, e.g. 10s
    #[arg(long)]
    connect_timeout: Option<humantime::Duration>,

    /// Upgrade to TLS right after connecting
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Server name for TLS SNI (defaults to --host)
    #[arg(long, requires = "tls")]
    tls_sni: Option<String>,

    /// Close the session once the messages are sent
    #[arg(long)]
    close_after_send: bool,
}

#[derive(ClapArgs, Debug)]
struct ListenArgs {
    /// Bind host (defaults to the configured listen host)
    #[arg(long)]
    host: Option<String>,

    /// Bind port; 0 picks a free port
    #[arg(long)]
    port: Option<u16>,

    /// Write received data back to the sender
    #[arg(long)]
    echo: bool,

    /// Upgrade every accepted session to TLS using the configured identity
    #[arg(long)]
    tls: bool,

    /// Accept backlog
    #[arg(long, default_value_t = 1024)]
    backlog: u32,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive(format!("tcp_sockets={}", args.log_level).parse()?)
        .add_directive(format!("sockets_session={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(SocketsLogFormatter::new("tcp-sockets"))
        .init();

    info!("Starting tcp-sockets v{}", env!("CARGO_PKG_VERSION"));

    let config = SocketsConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Connect(connect) => run_connect(&config, connect).await,
        Command::Listen(listen) => run_listen(&config, listen).await,
    }
}

async fn run_connect(config: &SocketsConfig, args: ConnectArgs) -> Result<()> {
    let (manager, mut events) = SocketManager::tcp(config.session_config())?;

    let mut options = ConnectOptions {
        connect_timeout: args.connect_timeout.map(Into::into),
        ..ConnectOptions::default()
    };
    if args.tls {
        options.tls = Some(client_tls(config, &args)?);
    }

    let id = manager.open(&args.host, args.port, options)?;
    component_info!("client", "Session {} opened to {}:{}", id, args.host, args.port);

    for message in &args.message {
        manager.write(id, Bytes::from(message.clone().into_bytes()))?;
    }
    if args.close_after_send {
        manager.close(id)?;
    }

    let mut interrupted = false;
    loop {
        tokio::select! {
            notification = events.recv() => match notification {
                Some(Notification::Session(event)) => {
                    print_event(&event);
                    match event.kind {
                        EventKind::End => acknowledge_end(&manager, id),
                        EventKind::Closed => break,
                        _ => {}
                    }
                }
                Some(Notification::Listener(_)) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                component_info!("client", "Interrupted, closing session {}", id);
                interrupted = true;
                if let Err(e) = manager.close(id) {
                    component_debug!("client", "Session {} already gone: {}", id, e);
                }
            }
        }
    }

    component_info!("client", "Done");
    Ok(())
}

fn client_tls(config: &SocketsConfig, args: &ConnectArgs) -> Result<TlsOptions> {
    let server_name = args
        .tls_sni
        .clone()
        .or_else(|| (!config.tls.server_name.is_empty()).then(|| config.tls.server_name.clone()))
        .unwrap_or_else(|| args.host.clone());

    match &args.tls_ca {
        Some(path) => {
            let ca_pem = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read CA certificate from {:?}", path))?;
            config.client_tls_with_ca(&server_name, ca_pem)
        }
        None => config.client_tls(&server_name),
    }
}

async fn run_listen(config: &SocketsConfig, args: ListenArgs) -> Result<()> {
    let (manager, mut events) = SocketManager::tcp(config.session_config())?;
    let server_tls = if args.tls {
        Some(config.server_tls()?)
    } else {
        None
    };

    let host = args.host.unwrap_or_else(|| config.listen_host.clone());
    let port = args.port.unwrap_or(config.listen_port);
    let listener = manager
        .listen(
            &host,
            port,
            ListenOptions {
                backlog: args.backlog,
                link: None,
            },
        )
        .await?;

    loop {
        tokio::select! {
            notification = events.recv() => {
                let Some(notification) = notification else { break };
                match notification {
                    Notification::Listener(event) => match event.kind {
                        ListenerEventKind::Listening { local_addr } => {
                            component_info!("listener", "Listener {} listening on {:?}", event.listener_id, local_addr);
                        }
                        ListenerEventKind::Connection { session_id, peer_addr } => {
                            component_info!("listener", "Session {} accepted from {:?}", session_id, peer_addr);
                            if let Some(tls) = &server_tls {
                                if let Err(e) = manager.start_tls(session_id, tls.clone()) {
                                    component_warn!("listener", "Session {} TLS upgrade rejected: {}", session_id, e);
                                }
                            }
                        }
                        ListenerEventKind::Error(e) => {
                            component_warn!("listener", "Accept failed: {}", e);
                        }
                        ListenerEventKind::Closed => {
                            component_info!("listener", "Listener {} closed", event.listener_id);
                        }
                    },
                    Notification::Session(event) => {
                        print_event(&event);
                        match &event.kind {
                            EventKind::Data(bytes) if args.echo => {
                                echo(&manager, event.session_id, bytes.clone());
                            }
                            EventKind::End => acknowledge_end(&manager, event.session_id),
                            _ => {}
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                component_info!("listener", "Interrupted, shutting down");
                break;
            }
        }
    }

    manager.stop_listening(listener)?;
    for id in manager.registry().ids() {
        let _ = manager.close(id);
    }

    let drain = async {
        while !manager.registry().is_empty() {
            match events.recv().await {
                Some(Notification::Session(event)) => {
                    print_event(&event);
                    if event.kind == EventKind::End {
                        acknowledge_end(&manager, event.session_id);
                    }
                }
                Some(Notification::Listener(_)) => {}
                None => break,
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_WAIT, drain).await.is_err() {
        component_warn!(
            "listener",
            "{} sessions still open after {}",
            manager.registry().len(),
            humantime::format_duration(SHUTDOWN_WAIT)
        );
    }

    component_info!("listener", "Done");
    Ok(())
}

/// The peer is done sending; finish our side too
fn acknowledge_end(manager: &SocketManager, id: SessionId) {
    if let Err(e) = manager.close(id) {
        component_debug!("session", "Session {} already gone: {}", id, e);
    }
}

fn echo(manager: &SocketManager, id: SessionId, bytes: Bytes) {
    if let Err(e) = manager.write(id, bytes) {
        component_debug!("listener", "Session {} echo skipped: {}", id, e);
    }
}

fn print_event(event: &SessionEvent) {
    match &event.kind {
        EventKind::Connected {
            local_addr,
            peer_addr,
        } => component_info!(
            "session",
            "#{} session {} connected {:?} -> {:?}",
            event.sequence,
            event.session_id,
            local_addr,
            peer_addr
        ),
        EventKind::Data(bytes) => component_info!(
            "session",
            "#{} session {} data ({} bytes): {}",
            event.sequence,
            event.session_id,
            bytes.len(),
            String::from_utf8_lossy(bytes).trim_end()
        ),
        EventKind::Secured => component_info!(
            "session",
            "#{} session {} secured",
            event.sequence,
            event.session_id
        ),
        EventKind::End => component_info!(
            "session",
            "#{} session {} peer ended",
            event.sequence,
            event.session_id
        ),
        EventKind::Error(e) => component_error!(
            "session",
            "#{} session {} error ({:?}): {}",
            event.sequence,
            event.session_id,
            e.kind(),
            e
        ),
        EventKind::Closed => component_info!(
            "session",
            "#{} session {} closed",
            event.sequence,
            event.session_id
        ),
    }
}
