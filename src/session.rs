use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::options::{self, NegotiatedOptions, RequestKind};
use crate::protocol::{ErrorKind, Mode, Packet};
use crate::resolver::StreamResolver;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Download, // RRQ  (client is downloading from us)
    Upload,   // WRQ  (client is uploading to us)
}

/// Why a request was refused before a session existed. The listener reports
/// this to the client as an ERROR frame; the client only knows the listener
/// TID at that point.
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct Refusal {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Refusal {
    fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    fn wire(kind: ErrorKind) -> Self {
        Self::new(kind, kind.to_string())
    }
}

/// What the listener should do with a session after it handled an event.
#[must_use]
pub(crate) enum Outcome {
    Active,
    Complete,
    Terminated(String),
}

/// Result of one idle-sweep visit.
#[must_use]
pub(crate) enum Tick {
    Active,
    Expired,
}

enum TransferStream {
    Reading(Box<dyn Read + Send + Sync>),
    Writing(Box<dyn Write + Send + Sync>),
}

/// One TFTP connection: the ephemeral socket, the exclusively owned byte
/// stream and the window/retransmit bookkeeping. Owned by the listener's
/// registry; dropping the session closes the stream.
pub struct Session {
    id: u64,
    remote: SocketAddr,
    socket: UdpSocket,
    kind: TransferKind,
    stream: TransferStream,
    filename: String,
    options: NegotiatedOptions,
    max_retry: u32,
    /// Next DATA block to read and send (downloads).
    next_block: u16,
    /// In-flight budget left in the current window (downloads).
    window_remaining: u16,
    /// Highest block acknowledged (downloads) or stored (uploads).
    last_ack_block: u16,
    /// An OACK went out and the client's ACK 0 is still outstanding.
    awaiting_oack_ack: bool,
    /// Block number of the final short DATA frame, once it has been sent.
    short_block: Option<u16>,
    /// Most recently sent frame, retransmitted on timeout.
    last_frame: Vec<u8>,
    /// Past this point the retransmit path takes over.
    deadline: Instant,
    /// Consecutive retransmits since the last progress.
    retries: u32,
    finished: bool,
    /// Payload bytes moved so far.
    transferred: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .field("filename", &self.filename)
            .finish()
    }
}

impl Session {
    /// Accept an RRQ/WRQ: resolve the stream, negotiate options, allocate
    /// the ephemeral transfer socket and send the opening reply (OACK, first
    /// DATA window, or ACK 0).
    pub(crate) async fn open(
        id: u64,
        remote: SocketAddr,
        kind: TransferKind,
        filename: &str,
        mode: Mode,
        offered: &[(String, String)],
        resolver: &dyn StreamResolver,
        max_retry: u32,
    ) -> Result<Session, Refusal> {
        if mode == Mode::Mail {
            return Err(Refusal::new(
                ErrorKind::IllegalOperation,
                "Mail mode not supported",
            ));
        }

        let option_err =
            |e: options::OptionError| Refusal::new(ErrorKind::OptionNegotiationFailed, e.to_string());

        // For a download the resolver runs first because tsize needs the
        // file length; for an upload negotiation runs first so a rejected
        // request never creates a file.
        let (stream, negotiated, acked) = match kind {
            TransferKind::Download => {
                let (stream, size) = resolver.open_read(filename).map_err(Refusal::wire)?;
                let (negotiated, acked) =
                    options::negotiate(offered, RequestKind::Read, Some(size))
                        .map_err(option_err)?;
                (TransferStream::Reading(stream), negotiated, acked)
            }
            TransferKind::Upload => {
                let (negotiated, acked) =
                    options::negotiate(offered, RequestKind::Write, None).map_err(option_err)?;
                let stream = resolver.open_write(filename).map_err(Refusal::wire)?;
                (TransferStream::Writing(stream), negotiated, acked)
            }
        };

        let socket = bind_transfer_socket(remote, &negotiated)
            .await
            .map_err(|e| {
                Refusal::new(
                    ErrorKind::NotDefined,
                    format!("cannot allocate transfer socket: {e}"),
                )
            })?;

        let mut session = Session {
            id,
            remote,
            socket,
            kind,
            stream,
            filename: filename.to_string(),
            max_retry,
            next_block: 1,
            window_remaining: negotiated.window_size,
            last_ack_block: 0,
            awaiting_oack_ack: false,
            short_block: None,
            last_frame: Vec::new(),
            deadline: Instant::now() + negotiated.timeout,
            retries: 0,
            finished: false,
            transferred: 0,
            options: negotiated,
        };

        if !acked.is_empty() {
            // For a download the OACK is answered by ACK 0; for an upload it
            // doubles as the ACK 0 and the client proceeds with DATA 1.
            let oack = Packet::OACK { options: acked }.to_bytes();
            session.send_frame(&oack);
            session.last_frame = oack;
            session.awaiting_oack_ack = session.kind == TransferKind::Download;
        } else {
            match session.kind {
                TransferKind::Download => session.fill_window().map_err(|e| {
                    Refusal::new(ErrorKind::NotDefined, format!("file read failed: {e}"))
                })?,
                TransferKind::Upload => {
                    let ack0 = Packet::ACK { block_num: 0 }.to_bytes();
                    session.send_frame(&ack0);
                    session.last_frame = ack0;
                }
            }
        }

        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// True once the final short block has been sent and acknowledged
    /// (download) or received and acknowledged (upload).
    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn options(&self) -> &NegotiatedOptions {
        &self.options
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Advance the state machine with one frame from the session's peer.
    pub(crate) fn handle_frame(&mut self, packet: Packet) -> Outcome {
        match packet {
            Packet::ACK { block_num } if self.kind == TransferKind::Download => {
                self.handle_ack(block_num)
            }
            Packet::DATA { block_num, data } if self.kind == TransferKind::Upload => {
                self.handle_data(block_num, &data)
            }
            Packet::ERROR { code, msg } => {
                // Peer aborted. Torn down silently; an ERROR is never
                // answered with another ERROR.
                Outcome::Terminated(format!("peer error {code}: {msg}"))
            }
            Packet::RRQ { filename, .. }
                if self.kind == TransferKind::Download
                    && filename == self.filename
                    && self.last_ack_block == 0 =>
            {
                // The client missed our opening reply and repeated the
                // request; repeat the reply.
                self.send_frame(&self.last_frame);
                Outcome::Active
            }
            Packet::WRQ { filename, .. }
                if self.kind == TransferKind::Upload
                    && filename == self.filename
                    && self.last_ack_block == 0 =>
            {
                self.send_frame(&self.last_frame);
                Outcome::Active
            }
            _ => {
                self.send_frame(&Packet::error(ErrorKind::IllegalOperation).to_bytes());
                Outcome::Terminated("unexpected packet for this transfer".into())
            }
        }
    }

    /// One idle-sweep visit: retransmit past the deadline, expire past the
    /// retry budget.
    pub(crate) fn on_tick(&mut self, now: Instant) -> Tick {
        if now < self.deadline {
            return Tick::Active;
        }
        if self.retries >= self.max_retry {
            return Tick::Expired;
        }
        self.retries += 1;
        self.send_frame(&self.last_frame);
        self.deadline = now + self.options.timeout;
        Tick::Active
    }

    fn handle_ack(&mut self, block_num: u16) -> Outcome {
        if self.awaiting_oack_ack {
            if block_num != 0 {
                return Outcome::Active;
            }
            self.awaiting_oack_ack = false;
            self.retries = 0;
            return self.advance_window();
        }

        // Only the highest block sent counts; anything else is a duplicate
        // or out-of-window ACK and changes nothing. There is no selective
        // resend: the stream is read sequentially and only the last frame
        // is kept.
        let highest_sent = self.next_block.wrapping_sub(1);
        if block_num != highest_sent {
            return Outcome::Active;
        }

        self.last_ack_block = block_num;
        self.retries = 0;
        if self.short_block == Some(block_num) {
            self.finished = true;
            return Outcome::Complete;
        }
        self.advance_window()
    }

    fn advance_window(&mut self) -> Outcome {
        match self.fill_window() {
            Ok(()) => Outcome::Active,
            Err(e) => {
                self.send_frame(
                    &Packet::error_with(ErrorKind::NotDefined, "file read failed").to_bytes(),
                );
                Outcome::Terminated(format!("file read failed: {e}"))
            }
        }
    }

    /// Read and send up to `window_size` consecutive DATA frames starting at
    /// `next_block`, retaining the last for retransmission. A block shorter
    /// than block_size (possibly empty) is the final one.
    fn fill_window(&mut self) -> io::Result<()> {
        self.window_remaining = self.options.window_size;
        while self.window_remaining > 0 {
            let mut payload = vec![0u8; self.options.block_size];
            let n = match &mut self.stream {
                TransferStream::Reading(stream) => read_full(stream.as_mut(), &mut payload)?,
                TransferStream::Writing(_) => return Ok(()),
            };
            payload.truncate(n);
            let short = n < self.options.block_size;

            let frame = Packet::DATA {
                block_num: self.next_block,
                data: payload,
            }
            .to_bytes();
            self.send_frame(&frame);
            self.last_frame = frame;
            self.transferred += n as u64;

            if short {
                self.short_block = Some(self.next_block);
            }
            self.next_block = self.next_block.wrapping_add(1);
            self.window_remaining -= 1;
            if short {
                break;
            }
        }
        self.deadline = Instant::now() + self.options.timeout;
        Ok(())
    }

    fn handle_data(&mut self, block_num: u16, data: &[u8]) -> Outcome {
        let expected = self.last_ack_block.wrapping_add(1);
        if block_num == expected {
            let short = data.len() < self.options.block_size;
            let write_result = match &mut self.stream {
                TransferStream::Writing(stream) => match stream.write_all(data) {
                    // The final block is flushed before its ACK so the
                    // client never sees success for unwritten bytes.
                    Ok(()) if short => stream.flush(),
                    other => other,
                },
                TransferStream::Reading(_) => Ok(()),
            };
            if let Err(e) = write_result {
                self.send_frame(&Packet::error(ErrorKind::DiskFull).to_bytes());
                return Outcome::Terminated(format!("write failed: {e}"));
            }

            self.transferred += data.len() as u64;
            self.last_ack_block = block_num;
            self.retries = 0;

            let ack = Packet::ACK { block_num }.to_bytes();
            self.send_frame(&ack);
            self.last_frame = ack;
            self.deadline = Instant::now() + self.options.timeout;

            if short {
                self.finished = true;
                return Outcome::Complete;
            }
            Outcome::Active
        } else if block_num == self.last_ack_block {
            // Retransmitted block we already stored; repeat the ACK without
            // re-appending.
            self.send_frame(&self.last_frame);
            Outcome::Active
        } else {
            Outcome::Active
        }
    }

    /// Best-effort, non-blocking send. A failed send is indistinguishable
    /// from a lost datagram and the timeout path repairs it.
    fn send_frame(&self, frame: &[u8]) {
        let _ = self.socket.try_send(frame);
    }
}

/// Read until `buf` is full or EOF. DATA payloads must be exactly
/// block_size bytes long except for the final block.
fn read_full(stream: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Allocate the transfer socket for one session. The port is OS-assigned
/// (the transfer TID) and the kernel buffers are sized from the negotiated
/// options: a windowed download queues `window_size` DATA frames in one
/// burst, which overruns the OS default once blksize grows past a few KiB.
async fn bind_transfer_socket(peer: SocketAddr, options: &NegotiatedOptions) -> io::Result<UdpSocket> {
    let frame_bytes = 4 + options.block_size;
    let burst_bytes = frame_bytes * (options.window_size as usize + 1);

    let socket = socket2::Socket::new(
        socket2::Domain::for_address(peer),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    // An undersized kernel buffer only degrades into retransmits, so a
    // refused size is not an error.
    let _ = socket.set_send_buffer_size(burst_bytes);
    let _ = socket.set_recv_buffer_size(burst_bytes);

    let unspecified = match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    socket.bind(&SocketAddr::new(unspecified, 0).into())?;
    socket.set_nonblocking(true)?;

    // Pin the peer once tokio owns the socket: the kernel then drops
    // datagrams from any other endpoint, which is the TID check.
    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(peer).await?;
    Ok(socket)
}
