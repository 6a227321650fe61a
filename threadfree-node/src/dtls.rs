//! DTLS 1.2 PSK transport over UDP
//!
//! OpenSSL drives a blocking socket, so every connection gets its own I/O
//! thread. The async side talks to it through two queues: datagrams to send go
//! down an unbounded channel, received datagrams come back up a bounded one.
//! The thread polls the socket with a short read timeout so it notices when the
//! outgoing queue closes, then sends close_notify and exits.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use openssl::ssl::{
    ErrorCode, HandshakeError, Ssl, SslConnector, SslMethod, SslStream, SslVerifyMode,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use zeroize::Zeroizing;

use crate::Result;
use crate::channel::{Connector, SecureChannel};
use crate::credential::Credential;

pub const DEFAULT_PORT: u16 = 5684;
pub const CIPHER_LIST: &str = "PSK-AES128-CCM8";

const MTU: u32 = 1280;
const MAX_DATAGRAM: usize = 2048;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const INCOMING_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub struct DtlsConfig {
    pub port: u16,
    pub handshake_timeout: Duration,
}

impl Default for DtlsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DtlsConnector {
    config: DtlsConfig,
}

impl DtlsConnector {
    pub fn new(config: DtlsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for DtlsConnector {
    async fn connect(&self, host: &str, credential: &Credential) -> Result<Box<dyn SecureChannel>> {
        let host = host.to_string();
        let credential = credential.clone();
        let config = self.config.clone();
        let channel = tokio::task::spawn_blocking(move || DtlsChannel::open(host, &credential, &config))
            .await
            .map_err(io::Error::other)??;
        Ok(Box::new(channel))
    }
}

/// Connected UDP socket seen as a byte stream by OpenSSL
#[derive(Debug)]
struct UdpStream(UdpSocket);

impl Read for UdpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl Write for UdpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct DtlsChannel {
    peer: String,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    incoming: mpsc::Receiver<io::Result<Vec<u8>>>,
    worker: Option<JoinHandle<()>>,
}

impl DtlsChannel {
    fn open(host: String, credential: &Credential, config: &DtlsConfig) -> io::Result<Self> {
        let addr = resolve(&host, config.port)?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.connect(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let mut builder = SslConnector::builder(SslMethod::dtls()).map_err(io::Error::other)?;
        builder.set_verify(SslVerifyMode::NONE);
        builder
            .set_cipher_list(CIPHER_LIST)
            .map_err(io::Error::other)?;

        let identity = credential.identity().as_bytes().to_vec();
        let psk = Zeroizing::new(credential.secret().expose().to_vec());
        builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
            // identity must leave room for the NUL terminator
            if identity.len() >= identity_out.len() || psk.len() > psk_out.len() {
                return Ok(0);
            }
            identity_out[..identity.len()].copy_from_slice(&identity);
            identity_out[identity.len()] = 0;
            psk_out[..psk.len()].copy_from_slice(&psk);
            Ok(psk.len())
        });

        let mut ssl = builder
            .build()
            .configure()
            .map_err(io::Error::other)?
            .verify_hostname(false)
            .use_server_name_indication(false)
            .into_ssl(&host)
            .map_err(io::Error::other)?;
        ssl.set_mtu(MTU).map_err(io::Error::other)?;

        let stream = handshake(ssl, UdpStream(socket), config.handshake_timeout)?;
        tracing::debug!(peer = %addr, identity = credential.identity(), "dtls session established");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let worker = std::thread::Builder::new()
            .name(format!("dtls-{host}"))
            .spawn(move || pump(stream, outgoing_rx, incoming_tx))?;

        Ok(Self {
            peer: host,
            outgoing: Some(outgoing_tx),
            incoming: incoming_rx,
            worker: Some(worker),
        })
    }

    fn shutdown(&mut self) {
        self.outgoing.take();
        self.incoming.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(peer = %self.peer, "dtls worker panicked");
            }
        }
    }
}

impl Drop for DtlsChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl SecureChannel for DtlsChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&mut self, datagram: &[u8]) -> io::Result<()> {
        self.outgoing
            .as_ref()
            .ok_or_else(closed)?
            .send(datagram.to_vec())
            .map_err(|_| closed())
    }

    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        self.incoming.recv().await.unwrap_or_else(|| Err(closed()))
    }

    async fn close(self: Box<Self>) -> io::Result<()> {
        let mut channel = self;
        tokio::task::spawn_blocking(move || channel.shutdown())
            .await
            .map_err(io::Error::other)
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "dtls channel closed")
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no address found for {host}"),
        )
    })
}

fn handshake(
    ssl: Ssl,
    stream: UdpStream,
    timeout: Duration,
) -> io::Result<SslStream<UdpStream>> {
    let deadline = Instant::now() + timeout;
    let mut attempt = ssl.connect(stream);
    loop {
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(HandshakeError::WouldBlock(mid)) => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "dtls handshake timed out",
                    ));
                }
                attempt = mid.handshake();
            }
            Err(HandshakeError::SetupFailure(e)) => return Err(io::Error::other(e)),
            Err(HandshakeError::Failure(mid)) => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("dtls handshake failed: {}", mid.error()),
                ));
            }
        }
    }
}

fn pump(
    mut stream: SslStream<UdpStream>,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    incoming: mpsc::Sender<io::Result<Vec<u8>>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        loop {
            match outgoing.try_recv() {
                Ok(datagram) => {
                    if let Err(e) = stream.write_all(&datagram) {
                        let _ = incoming.blocking_send(Err(e));
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    let _ = stream.shutdown();
                    return;
                }
            }
        }

        match stream.ssl_read(&mut buf) {
            Ok(0) => {
                let _ = incoming.blocking_send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "hub closed the dtls session",
                )));
                return;
            }
            Ok(n) => {
                if incoming.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    let _ = stream.shutdown();
                    return;
                }
            }
            Err(e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {}
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => {
                let _ = incoming.blocking_send(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "hub closed the dtls session",
                )));
                return;
            }
            Err(e) => {
                let err = e
                    .into_io_error()
                    .unwrap_or_else(|e| io::Error::other(e.to_string()));
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                    continue;
                }
                let _ = incoming.blocking_send(Err(err));
                return;
            }
        }
    }
}
