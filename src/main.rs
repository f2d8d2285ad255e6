use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};

use tftpd_rs::{Server, ServerConfig, ServerEvent, TransferKind};

/// A windowed TFTP server.
#[derive(Parser, Debug)]
#[command(name = "tftpd-rs", version, about)]
struct Cli {
    /// Address to bind.
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 69)]
    port: u16,

    /// Directory to serve / receive files.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Refuse write requests.
    #[arg(long, conflicts_with = "write_only")]
    read_only: bool,

    /// Refuse read requests.
    #[arg(long)]
    write_only: bool,

    /// Maximum concurrent transfers.
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Retransmissions per frame before a transfer is dropped.
    #[arg(long, default_value_t = 5)]
    max_retry: u32,

    /// Optional file path to write logs to.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dir = std::fs::canonicalize(&cli.dir)?;

    let mut log_writer = match cli.log_file {
        Some(ref path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };

    let config = ServerConfig {
        bind: SocketAddr::new(cli.bind, cli.port),
        root: dir,
        allow_read: !cli.write_only,
        allow_write: !cli.read_only,
        max_connections: cli.max_connections,
        max_retry: cli.max_retry,
    };

    let server = Server::bind(config).await?;

    // Channel: server -> log loop.
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Shutdown signal: Ctrl-C -> server.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run(ev_tx.clone(), shutdown_rx).await {
            let _ = ev_tx.send(ServerEvent::Log(format!("Server fatal: {e}")));
        }
    });

    loop {
        tokio::select! {
            event = ev_rx.recv() => {
                match event {
                    Some(event) => emit(&event, log_writer.as_mut()),
                    None => break, // server task is gone
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    // Give the server a moment to wind down, then drain the last events.
    let _ = tokio::time::timeout(Duration::from_millis(200), server_handle).await;
    while let Ok(event) = ev_rx.try_recv() {
        emit(&event, log_writer.as_mut());
    }

    Ok(())
}

fn emit(event: &ServerEvent, log_writer: Option<&mut std::fs::File>) {
    let line = render_event(event);
    println!("{line}");
    if let Some(file) = log_writer {
        let _ = writeln!(file, "{line}");
    }
}

fn render_event(event: &ServerEvent) -> String {
    match event {
        ServerEvent::Log(msg) => msg.clone(),
        ServerEvent::TransferStarted(info) => format!(
            "Transfer #{} started: {} \"{}\" ({})",
            info.id,
            match info.kind {
                TransferKind::Download => "DL",
                TransferKind::Upload => "UL",
            },
            info.filename,
            info.peer,
        ),
        ServerEvent::TransferComplete { id, bytes } => {
            format!("Transfer #{id} complete ({bytes} bytes)")
        }
        ServerEvent::TransferFailed { id, error } => {
            format!("Transfer #{id} failed: {error}")
        }
    }
}
