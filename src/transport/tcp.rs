//! TCP implementation of [`Transport`].
//!
//! The transport runs its own multi-threaded Tokio runtime. Every frame on
//! the wire is length-delimited (four-byte big-endian length) and carries a
//! bincode-encoded body. On accept the server first sends a [`ServerHello`]
//! containing the client's id and a snapshot of the info map, so a peer can
//! read `CAPS` without any in-process negotiation. The client then streams
//! [`WireData`] frames; each becomes a `NewDataReceived` event with the
//! connection's `client_id` stamped into its info.

use std::{
    io,
    net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs},
    sync::{
        Arc,
        Mutex,
        PoisonError,
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bincode::{Decode, Encode, config};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Builder, Runtime},
    select,
    time::{sleep, timeout},
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, error, info, warn};

use super::{
    EventCallback,
    INFO_IP,
    INFO_PORT,
    Transport,
    TransportError,
    TransportEvent,
    TransportFactory,
};
use crate::{
    config::{Protocol, ServerSrcConfig},
    frame::ClientId,
    message::{CLIENT_ID_KEY, EdgeData},
};


/// Largest frame accepted from a peer.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// First frame sent by the server on every connection.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ServerHello {
    /// Id the server assigned to this connection.
    pub client_id: u64,
    /// Snapshot of the server's info map, sorted by key.
    pub info: Vec<(String, String)>,
}

impl ServerHello {
    /// Look up an info value.
    #[must_use]
    pub fn info(&self, key: &str) -> Option<&str> {
        self.info
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Data frame sent by clients.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct WireData {
    /// Raw segments in order.
    pub segments: Vec<Vec<u8>>,
    /// Client-supplied info entries.
    pub info: Vec<(String, String)>,
}

impl WireData {
    fn into_edge_data(self, client_id: ClientId) -> EdgeData {
        let mut data = EdgeData::new();
        for segment in self.segments {
            data.push_segment(Bytes::from(segment));
        }
        for (key, value) in self.info {
            data.set_info(key, value);
        }
        data.set_info(CLIENT_ID_KEY, client_id.as_u64().to_string());
        data
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

fn wire_config() -> impl config::Config {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

struct Shared {
    info: DashMap<String, String>,
    callback: RwLock<Option<EventCallback>>,
    next_client_id: AtomicU64,
    idle_timeout: Option<Duration>,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn hello(&self, client_id: ClientId) -> ServerHello {
        let mut info: Vec<(String, String)> = self
            .info
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        info.sort();
        ServerHello {
            client_id: client_id.as_u64(),
            info,
        }
    }
}

struct Running {
    runtime: Runtime,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    local_addr: SocketAddr,
}

/// Transport serving the `tcp` protocol.
pub struct TcpTransport {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl TcpTransport {
    /// Create a transport dropping connections idle for `idle_timeout`.
    #[must_use]
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                info: DashMap::new(),
                callback: RwLock::new(None),
                next_client_id: AtomicU64::new(1),
                idle_timeout,
            }),
            running: Mutex::new(None),
        }
    }

    fn listen_addr(&self) -> Result<SocketAddr, TransportError> {
        let host = self.info(INFO_IP).unwrap_or_else(|| "localhost".to_owned());
        let port = self.info(INFO_PORT).unwrap_or_else(|| "0".to_owned());
        let port: u16 = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("{host}:{port}")))?;
        (host.as_str(), port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::InvalidAddress(format!("{host}:{port}")))
    }
}

impl Transport for TcpTransport {
    fn set_info(&self, key: &str, value: &str) -> Result<(), TransportError> {
        self.shared.info.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn info(&self, key: &str) -> Option<String> {
        self.shared.info.get(key).map(|v| v.value().clone())
    }

    fn set_event_callback(&self, callback: EventCallback) {
        *self
            .shared
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn start(&self) -> Result<(), TransportError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }

        let addr = self.listen_addr()?;
        let std_listener =
            StdTcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        std_listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tensor-query-tcp")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(std_listener)
                .map_err(|source| TransportError::Bind { addr, source })?
        };

        self.shared
            .info
            .insert(INFO_PORT.to_owned(), local_addr.port().to_string());

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        runtime.spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            shutdown.clone(),
            tracker.clone(),
        ));
        info!(%local_addr, "tcp transport listening");

        *running = Some(Running {
            runtime,
            shutdown,
            tracker,
            local_addr,
        });
        Ok(())
    }

    fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Running {
            runtime,
            shutdown,
            tracker,
            local_addr,
        }) = running
        {
            shutdown.cancel();
            tracker.close();
            if tokio::runtime::Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
            info!(%local_addr, "tcp transport stopped");
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.local_addr)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) { self.stop(); }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let client_id = ClientId::new(shared.next_client_id.fetch_add(1, Ordering::Relaxed));
                    let shared = Arc::clone(&shared);
                    let token = shutdown.clone();
                    tracker.spawn(async move {
                        let fut = std::panic::AssertUnwindSafe(
                            serve_connection(stream, peer, client_id, shared, token),
                        )
                        .catch_unwind();
                        if fut.await.is_err() {
                            error!(%peer, %client_id, "connection task panicked");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
        }
    }
    debug!("accept loop finished");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    client_id: ClientId,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    let mut framed = Framed::new(stream, codec());
    let hello = match bincode::encode_to_vec(shared.hello(client_id), wire_config()) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, %peer, "failed to encode server hello");
            return;
        }
    };
    if let Err(e) = framed.send(Bytes::from(hello)).await {
        warn!(error = %e, %peer, "failed to send server hello");
        return;
    }
    debug!(%peer, %client_id, "client connected");
    shared.emit(TransportEvent::ClientConnected(client_id));

    loop {
        let next = select! {
            () = shutdown.cancelled() => break,
            next = read_frame(&mut framed, shared.idle_timeout) => next,
        };
        match next {
            Ok(Some(body)) => match bincode::decode_from_slice::<WireData, _>(&body, wire_config()) {
                Ok((wire, _)) => {
                    let data = wire.into_edge_data(client_id);
                    shared.emit(TransportEvent::NewDataReceived(Box::new(data)));
                }
                Err(e) => warn!(error = %e, %peer, "discarding undecodable frame"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, %peer, "connection closed");
                break;
            }
        }
    }

    debug!(%peer, %client_id, "client disconnected");
    shared.emit(TransportEvent::ClientDisconnected(client_id));
}

async fn read_frame(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    idle_timeout: Option<Duration>,
) -> io::Result<Option<bytes::BytesMut>> {
    let next = match idle_timeout {
        Some(limit) => timeout(limit, framed.next())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))?,
        None => framed.next().await,
    };
    next.transpose()
}

/// Creates [`TcpTransport`]s for the `tcp` and `hybrid` protocols.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, config: &ServerSrcConfig) -> Result<Arc<dyn Transport>, TransportError> {
        match config.protocol() {
            Protocol::Tcp | Protocol::Hybrid => {
                let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config.timeout()));
                Ok(transport)
            }
            other => Err(TransportError::UnsupportedProtocol(other)),
        }
    }
}

/// Blocking client for the TCP transport.
///
/// Reads the [`ServerHello`] on connect; use
/// [`server_caps_from_info`](crate::caps::server_caps_from_info) on its
/// `CAPS` entry to learn the server's output format. The client drives its
/// socket on a private current-thread runtime, so it must not be used from
/// within another Tokio runtime.
pub struct TcpClient {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    hello: ServerHello,
    runtime: Runtime,
}

impl TcpClient {
    /// Connect and read the server hello.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if connecting or reading the hello fails.
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (framed, hello) = runtime.block_on(async {
            let stream = TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, codec());
            let body = framed.next().await.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "closed before server hello")
            })??;
            let (hello, _) = bincode::decode_from_slice::<ServerHello, _>(&body, wire_config())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok::<_, io::Error>((framed, hello))
        })?;
        Ok(Self {
            runtime,
            framed,
            hello,
        })
    }

    #[must_use]
    pub fn hello(&self) -> &ServerHello { &self.hello }

    #[must_use]
    pub fn client_id(&self) -> ClientId { ClientId::new(self.hello.client_id) }

    /// Send one data frame.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if encoding or writing fails. Frames longer than
    /// [`MAX_FRAME_LENGTH`] are refused with [`io::ErrorKind::InvalidInput`]
    /// before anything is written, leaving the connection usable.
    pub fn send(&mut self, data: &WireData) -> io::Result<()> {
        let body = bincode::encode_to_vec(data, wire_config())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.runtime.block_on(self.framed.send(Bytes::from(body)))
    }
}
