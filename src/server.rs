use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::protocol::{ErrorKind, OPCODE_ERROR, OPCODE_RRQ, OPCODE_WRQ, Packet};
use crate::resolver::DirResolver;
use crate::session::{Outcome, Session, Tick, TransferKind};

/// Concurrent transfers accepted before new requests are refused.
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Retransmissions per frame before a transfer is dropped.
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Scratch receive buffer, large enough for any UDP datagram.
const RECV_BUFFER: usize = 64 * 1024;

/// The idle sweep visits every session at most this often.
const SWEEP_INTERVAL: Duration = Duration::from_millis(512);

/// A TFTP frame needs opcode + one 16-bit field; anything shorter is noise.
const MIN_DATAGRAM: usize = 4;

/// Operator-facing parameters. No particular CLI is implied; the binary
/// maps its flags onto this struct.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub root: PathBuf,
    pub allow_read: bool,
    pub allow_write: bool,
    pub max_connections: usize,
    pub max_retry: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:69".parse().unwrap(),
            root: PathBuf::from("."),
            allow_read: true,
            allow_write: true,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_retry: DEFAULT_MAX_RETRY,
        }
    }
}

/// A snapshot of an accepted transfer, suitable for display.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub filename: String,
    pub kind: TransferKind,
    /// Total size in bytes when the tsize option established one.
    pub total_bytes: Option<u64>,
}

/// Events emitted by the server for observers.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Log(String),
    TransferStarted(TransferInfo),
    TransferComplete { id: u64, bytes: u64 },
    TransferFailed { id: u64, error: String },
}

/// Active sessions keyed by remote endpoint. Linear scan on purpose: the
/// population is bounded by max_connections and the probe is cache-friendly.
#[derive(Default)]
struct Registry {
    sessions: Vec<Session>,
}

impl Registry {
    fn find(&self, remote: SocketAddr) -> Option<usize> {
        self.sessions.iter().position(|s| s.remote() == remote)
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn insert(&mut self, session: Session) {
        self.sessions.push(session);
    }

    fn remove(&mut self, index: usize) -> Session {
        self.sessions.swap_remove(index)
    }
}

/// The TFTP listener: one UDP socket on the well-known port plus the
/// registry of running transfers.
pub struct Server {
    socket: UdpSocket,
    resolver: DirResolver,
    config: ServerConfig,
}

impl Server {
    /// Bind the listener socket. Failure here is fatal and reported before
    /// the loop ever starts.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|e| anyhow!("cannot bind {}: {e}", config.bind))?;
        let resolver = DirResolver::new(&config.root);
        Ok(Self {
            socket,
            resolver,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drive the listener until the shutdown flag trips. One task owns the
    /// listener socket, the registry and every session, so no session state
    /// is ever shared; the suspension points are the readiness waits inside
    /// the select.
    pub async fn run(
        self,
        events: mpsc::UnboundedSender<ServerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut registry = Registry::default();
        let mut scratch = vec![0u8; RECV_BUFFER];
        let mut next_id: u64 = 1;
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Ok(addr) = self.socket.local_addr() {
            let _ = events.send(ServerEvent::Log(format!("Listening on {addr}")));
        }

        loop {
            tokio::select! {
                inbound = next_datagram(&self.socket, &registry.sessions, &mut scratch) => {
                    match inbound {
                        Inbound::Listener(Ok((len, peer))) => {
                            self.on_listener_datagram(&scratch[..len], peer, &mut registry, &mut next_id, &events).await;
                        }
                        Inbound::Listener(Err(e)) => {
                            // Unrecoverable listener I/O: drop every session
                            // (closing its stream) and surface the fault.
                            let _ = events.send(ServerEvent::Log(format!("listener receive failed: {e}")));
                            return Err(anyhow!("listener receive failed: {e}"));
                        }
                        Inbound::Transfer(index, Ok((len, _peer))) => {
                            let outcome = if len < MIN_DATAGRAM {
                                Outcome::Active
                            } else {
                                match Packet::from_bytes(&scratch[..len]) {
                                    Ok(packet) => registry.sessions[index].handle_frame(packet),
                                    // Malformed mid-transfer datagrams change nothing.
                                    Err(_) => Outcome::Active,
                                }
                            };
                            Self::settle(&mut registry, index, outcome, &events);
                        }
                        Inbound::Transfer(index, Err(e)) => {
                            let session = registry.remove(index);
                            let _ = events.send(ServerEvent::TransferFailed {
                                id: session.id(),
                                error: format!("transfer socket failed: {e}"),
                            });
                        }
                    }
                }
                _ = sweep.tick() => {
                    let now = Instant::now();
                    let mut index = 0;
                    while index < registry.sessions.len() {
                        match registry.sessions[index].on_tick(now) {
                            Tick::Active => index += 1,
                            Tick::Expired => {
                                // Retry budget exhausted: removed silently,
                                // no farewell frame.
                                let session = registry.remove(index);
                                let _ = events.send(ServerEvent::TransferFailed {
                                    id: session.id(),
                                    error: "transfer timed out".into(),
                                });
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Dropping the registry closes every stream; clients learn of the
        // shutdown from their own timeouts.
        let _ = events.send(ServerEvent::Log(format!(
            "Shutting down, dropping {} active transfer(s)",
            registry.len()
        )));
        Ok(())
    }

    async fn on_listener_datagram(
        &self,
        datagram: &[u8],
        peer: SocketAddr,
        registry: &mut Registry,
        next_id: &mut u64,
        events: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if datagram.len() < MIN_DATAGRAM {
            return;
        }

        // Continuation traffic from a registered endpoint is demultiplexed
        // to its session even when the client keeps addressing the
        // well-known port.
        if let Some(index) = registry.find(peer) {
            let outcome = match Packet::from_bytes(datagram) {
                Ok(packet) => registry.sessions[index].handle_frame(packet),
                Err(_) => Outcome::Active,
            };
            Self::settle(registry, index, outcome, events);
            return;
        }

        // The decision for an unknown endpoint is strictly opcode-based:
        // only a request may start a session, an ERROR frame is never
        // answered with another ERROR frame, and anything else earns
        // UnknownTid whether or not the rest of the frame parses.
        match u16::from_be_bytes([datagram[0], datagram[1]]) {
            OPCODE_RRQ | OPCODE_WRQ => {}
            OPCODE_ERROR => return,
            _ => {
                self.send_error(peer, &Packet::error(ErrorKind::UnknownTid));
                return;
            }
        }

        let (kind, filename, mode, options) = match Packet::from_bytes(datagram) {
            Ok(Packet::RRQ {
                filename,
                mode,
                options,
            }) => (TransferKind::Download, filename, mode, options),
            Ok(Packet::WRQ {
                filename,
                mode,
                options,
            }) => (TransferKind::Upload, filename, mode, options),
            // The opcode gate only lets requests through.
            Ok(_) => return,
            Err(e) => {
                let _ = events.send(ServerEvent::Log(format!("{peer}: bad request: {e}")));
                return;
            }
        };

        let allowed = match kind {
            TransferKind::Download => self.config.allow_read,
            TransferKind::Upload => self.config.allow_write,
        };
        if !allowed {
            self.send_error(
                peer,
                &Packet::error_with(ErrorKind::AccessViolation, "Request kind disabled"),
            );
            let _ = events.send(ServerEvent::Log(format!(
                "{peer}: refused {} \"{filename}\": request kind disabled",
                request_name(kind)
            )));
            return;
        }

        if registry.len() >= self.config.max_connections {
            self.send_error(
                peer,
                &Packet::error_with(ErrorKind::IllegalOperation, "Too Many Connections"),
            );
            let _ = events.send(ServerEvent::Log(format!(
                "{peer}: refused {} \"{filename}\": too many connections",
                request_name(kind)
            )));
            return;
        }

        let id = *next_id;
        *next_id += 1;
        match Session::open(
            id,
            peer,
            kind,
            &filename,
            mode,
            &options,
            &self.resolver,
            self.config.max_retry,
        )
        .await
        {
            Ok(session) => {
                let _ = events.send(ServerEvent::Log(format!(
                    "{peer}: {} \"{filename}\"",
                    request_name(kind)
                )));
                let _ = events.send(ServerEvent::TransferStarted(TransferInfo {
                    id,
                    peer,
                    filename,
                    kind,
                    total_bytes: session.options().transfer_size,
                }));
                registry.insert(session);
            }
            Err(refusal) => {
                // The client only knows the listener TID until our first
                // reply, so refusals go out on the listener socket.
                self.send_error(peer, &Packet::error_with(refusal.kind, refusal.msg.clone()));
                let _ = events.send(ServerEvent::Log(format!(
                    "{peer}: refused {} \"{filename}\": {}",
                    request_name(kind),
                    refusal.msg
                )));
            }
        }
    }

    fn settle(
        registry: &mut Registry,
        index: usize,
        outcome: Outcome,
        events: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        match outcome {
            Outcome::Active => {}
            Outcome::Complete => {
                let session = registry.remove(index);
                let _ = events.send(ServerEvent::TransferComplete {
                    id: session.id(),
                    bytes: session.transferred(),
                });
            }
            Outcome::Terminated(reason) => {
                let session = registry.remove(index);
                let _ = events.send(ServerEvent::TransferFailed {
                    id: session.id(),
                    error: reason,
                });
            }
        }
    }

    /// Best-effort error reply from the listener socket.
    fn send_error(&self, peer: SocketAddr, packet: &Packet) {
        let _ = self.socket.try_send_to(&packet.to_bytes(), peer);
    }
}

fn request_name(kind: TransferKind) -> &'static str {
    match kind {
        TransferKind::Download => "RRQ",
        TransferKind::Upload => "WRQ",
    }
}

/// Which socket produced a datagram.
enum Inbound {
    Listener(io::Result<(usize, SocketAddr)>),
    Transfer(usize, io::Result<(usize, SocketAddr)>),
}

/// Wait for the next datagram on the listener socket or any session's
/// transfer socket. Polling every socket from one future keeps the whole
/// server on a single task.
async fn next_datagram(listener: &UdpSocket, sessions: &[Session], buf: &mut [u8]) -> Inbound {
    poll_fn(|cx| {
        if let Poll::Ready(result) = poll_datagram(listener, cx, buf) {
            return Poll::Ready(Inbound::Listener(result));
        }
        for (index, session) in sessions.iter().enumerate() {
            if let Poll::Ready(result) = poll_datagram(session.socket(), cx, buf) {
                return Poll::Ready(Inbound::Transfer(index, result));
            }
        }
        Poll::Pending
    })
    .await
}

fn poll_datagram(
    socket: &UdpSocket,
    cx: &mut Context<'_>,
    buf: &mut [u8],
) -> Poll<io::Result<(usize, SocketAddr)>> {
    let mut read_buf = ReadBuf::new(buf);
    match socket.poll_recv_from(cx, &mut read_buf) {
        Poll::Ready(Ok(peer)) => Poll::Ready(Ok((read_buf.filled().len(), peer))),
        Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        Poll::Pending => Poll::Pending,
    }
}
