//! UDP/TCP overlay.
//!
//! Overlay addresses route by their identifier: `127.0.0.1:7400.<publicKey>`
//! is reached at `127.0.0.1:7400`. Datagrams go over one UDP socket with
//! tuned buffers; sessions are TCP connections to the same port.
//!
//! ```text
//! datagram: [sender_len: u16 LE][sender address][payload]
//! session:  [len: u32 BE][sender address]  then  [len: u32 BE][payload]...
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use waymesh_peers::{Address, PeerKey};

use crate::error::{Result, SendError};
use crate::overlay::{Inbound, Overlay, Session};

/// Largest UDP payload on IPv4.
pub const MAX_DATAGRAM: usize = 65_507;
/// Largest session frame.
pub const MAX_FRAME: usize = 1 << 20;

const INBOUND_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Socket to bind; UDP and TCP share the port.
    pub bind: SocketAddr,
    /// Socket address advertised in our overlay address. Defaults to the
    /// bound address, with an unspecified IP replaced by loopback.
    pub advertise: Option<SocketAddr>,
    /// Send buffer size in bytes
    pub sndbuf: usize,
    /// Receive buffer size in bytes
    pub rcvbuf: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 7400)),
            advertise: None,
            sndbuf: 4 * 1024 * 1024, // 4MB
            rcvbuf: 4 * 1024 * 1024, // 4MB
        }
    }
}

fn bind_udp(addr: SocketAddr, sndbuf: usize, rcvbuf: usize) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    // Buffer sizes must be set before binding
    socket.set_send_buffer_size(sndbuf)?;
    socket.set_recv_buffer_size(rcvbuf)?;
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

fn routable(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
    } else {
        addr
    }
}

/// Socket address named by an overlay address's identifier.
pub fn route(to: &str) -> Result<SocketAddr> {
    let addr = Address::parse(to).map_err(|_| SendError::Unreachable(to.to_string()))?;
    addr.identifier
        .as_deref()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| SendError::Unreachable(to.to_string()))
}

fn encode_datagram(sender: &str, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + sender.len() + payload.len());
    buf.extend_from_slice(&(sender.len() as u16).to_le_bytes());
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode_datagram(buf: &[u8]) -> Option<(String, &[u8])> {
    let len = u16::from_le_bytes([*buf.first()?, *buf.get(1)?]) as usize;
    let sender = buf.get(2..2 + len)?;
    let sender = std::str::from_utf8(sender).ok()?.to_string();
    Some((sender, &buf[2 + len..]))
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame too large"));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

async fn pump_frames<R: AsyncRead + Unpin>(mut reader: R, src: String, tx: mpsc::Sender<Inbound>) {
    while let Ok(frame) = read_frame(&mut reader).await {
        let inbound = Inbound {
            src: src.clone(),
            payload: Bytes::from(frame),
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
}

async fn recv_datagrams(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "udp recv failed");
                continue;
            }
        };
        let Some((src, payload)) = decode_datagram(&buf[..len]) else {
            trace!(%peer, "dropping unframed datagram");
            continue;
        };
        let inbound = Inbound {
            src,
            payload: Bytes::copy_from_slice(payload),
        };
        if tx.send(inbound).await.is_err() {
            break;
        }
    }
}

async fn accept_sessions(listener: TcpListener, tx: mpsc::Sender<Inbound>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    // Hold the write half so the dialer does not see EOF.
                    let (mut reader, _writer) = stream.into_split();
                    let src = match read_frame(&mut reader).await.map(String::from_utf8) {
                        Ok(Ok(src)) => src,
                        _ => {
                            debug!(%peer, "session without sender frame");
                            return;
                        }
                    };
                    debug!(%peer, %src, "session accepted");
                    pump_frames(reader, src, tx).await;
                });
            }
            Err(e) => warn!(error = %e, "tcp accept failed"),
        }
    }
}

/// Overlay over UDP datagrams and TCP sessions.
pub struct UdpOverlay {
    socket: Arc<UdpSocket>,
    local: String,
    inbound: mpsc::Sender<Inbound>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpOverlay {
    /// Bind the UDP socket and TCP listener and start receiving.
    pub async fn bind(
        config: UdpConfig,
        key: PeerKey,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Inbound>)> {
        let socket = bind_udp(config.bind, config.sndbuf, config.rcvbuf)?;
        let bound = socket.local_addr()?;
        let listener = TcpListener::bind(bound).await?;

        let advertised = config.advertise.unwrap_or_else(|| routable(bound));
        let local = Address::new(advertised.to_string(), key).to_string();

        info!(
            "UDP overlay bound to {} as {} (sndbuf={}, rcvbuf={})",
            bound,
            advertised,
            config.sndbuf,
            config.rcvbuf
        );

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let socket = Arc::new(socket);
        let tasks = vec![
            tokio::spawn(recv_datagrams(socket.clone(), tx.clone())),
            tokio::spawn(accept_sessions(listener, tx.clone())),
        ];

        Ok((
            Self {
                socket,
                local,
                inbound: tx,
                tasks,
            },
            rx,
        ))
    }

    /// Bound socket address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Drop for UdpOverlay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl Overlay for UdpOverlay {
    fn local_address(&self) -> String {
        self.local.clone()
    }

    async fn send(&self, to: &str, payload: &[u8]) -> Result<()> {
        let target = route(to)?;
        let frame = encode_datagram(&self.local, payload);
        if frame.len() > MAX_DATAGRAM {
            return Err(SendError::Unreachable(format!(
                "{} byte datagram to {}",
                frame.len(),
                to
            )));
        }
        self.socket.send_to(&frame, target).await?;
        Ok(())
    }

    async fn dial(&self, to: &str) -> Result<Arc<dyn Session>> {
        let target = route(to)?;
        let stream = TcpStream::connect(target).await?;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        write_frame(&mut writer, self.local.as_bytes()).await?;

        let alive = Arc::new(AtomicBool::new(true));
        let reader_task = {
            let alive = alive.clone();
            let tx = self.inbound.clone();
            let src = to.to_string();
            tokio::spawn(async move {
                pump_frames(reader, src, tx).await;
                alive.store(false, Ordering::Relaxed);
            })
        };
        debug!(%to, "session dialed");
        Ok(Arc::new(TcpSession {
            remote: to.to_string(),
            writer: Mutex::new(writer),
            alive,
            reader: reader_task,
        }))
    }
}

#[derive(Debug)]
struct TcpSession {
    remote: String,
    writer: Mutex<OwnedWriteHalf>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Session for TcpSession {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, payload).await {
            self.alive.store(false, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }
}
