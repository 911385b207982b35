//! Connection management for the manager client

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::action::{Action, ActionHandle, CompletedAction, PendingActions};
use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT_MS, MAX_EVENT_QUEUE_SIZE, MAX_SIGNATURE_LEN, PACKET_TERMINATOR,
    SOCKET_BUF_SIZE,
};
use crate::error::{AmiError, AmiResult};
use crate::event::{Event, EventRegistry};
use crate::filter::Filter;
use crate::protocol::{parse_server_signature, serialize_packet, IncomingPacket, Parser, ServerSignature};

/// Connection status for the manager client
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionStatus {
    /// Manager session is active.
    Connected,
    /// Manager session ended.
    Disconnected(DisconnectReason),
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Clean EOF initiated by the remote server
    ServerClosed,
    /// TCP I/O or unrecoverable buffer error (io::Error is not Clone, so we
    /// store the message)
    IoError(String),
    /// Client called disconnect()
    ClientRequested,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::ServerClosed => write!(f, "server closed connection"),
            DisconnectReason::IoError(msg) => write!(f, "I/O error: {}", msg),
            DisconnectReason::ClientRequested => write!(f, "client requested disconnect"),
        }
    }
}

type EventCallback = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One registered event handler: an optional filter plus its callback.
struct HandlerBinding {
    filter: Option<Filter>,
    callback: EventCallback,
}

/// Shared state between the client handle(s) and the reader task
struct SharedState {
    pending: Mutex<PendingActions>,
    handlers: RwLock<Vec<HandlerBinding>>,
    /// Set when events have been dropped due to a full queue
    event_overflow: AtomicBool,
    /// Total count of dropped events
    dropped_event_count: AtomicU64,
    /// Set by disconnect() so the reader reports the right reason on EOF
    client_closing: AtomicBool,
}

fn read_handlers(shared: &SharedState) -> std::sync::RwLockReadGuard<'_, Vec<HandlerBinding>> {
    shared.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Options for manager connection configuration.
#[derive(Debug, Clone)]
pub struct AmiConnectOptions {
    /// Timeout for establishing the TCP connection. Default: 5 seconds.
    pub connect_timeout: Duration,
    /// Capacity of the mpsc channel delivering events. Default: 1000.
    pub event_queue_size: usize,
    /// Schema registry consulted while parsing named events. Default: empty.
    pub registry: Arc<EventRegistry>,
}

impl Default for AmiConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            event_queue_size: MAX_EVENT_QUEUE_SIZE,
            registry: Arc::new(EventRegistry::new()),
        }
    }
}

/// Manager client handle (Clone + Send)
///
/// Actions can be sent from any task; each returns its own
/// [`ActionHandle`] resolved by the background reader task, so concurrent
/// actions with distinct ids are fully independent.
#[derive(Clone)]
pub struct AmiClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    shared: Arc<SharedState>,
    status_rx: watch::Receiver<ConnectionStatus>,
    signature: ServerSignature,
}

impl std::fmt::Debug for AmiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiClient")
            .field("server", &self.signature.raw)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Event stream receiver (!Clone)
///
/// Receives events from the background reader task. Command responses never
/// appear here — pulling events silently skips them. Items are
/// `AmiResult<Event>`: an `Err` is either a rejected frame
/// (logged, connection still up) or `AmiError::QueueFull` after the
/// application fell behind and events were dropped.
pub struct AmiEventStream {
    rx: mpsc::Receiver<AmiResult<Event>>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for AmiEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmiEventStream")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Establish the TCP connection under the configured timeout.
async fn tcp_connect(host: &str, port: u16, connect_timeout: Duration) -> AmiResult<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            debug!("TCP connection to {}:{} established", host, port);
            Ok(stream)
        }
        Ok(Err(source)) => {
            warn!("TCP connect to {}:{} failed: {}", host, port, source);
            Err(AmiError::Connect {
                host: host.to_string(),
                port,
                source,
            })
        }
        Err(_) => {
            warn!(
                "TCP connect to {}:{} timed out after {}ms",
                host,
                port,
                connect_timeout.as_millis()
            );
            Err(AmiError::ConnectTimeout {
                host: host.to_string(),
                port,
                timeout_ms: connect_timeout.as_millis() as u64,
            })
        }
    }
}

/// Read the greeting line the server sends immediately after connecting.
async fn read_signature(
    stream: &mut TcpStream,
    parser: &mut Parser,
    read_buffer: &mut [u8],
) -> AmiResult<ServerSignature> {
    loop {
        if let Some(line) = parser.take_signature_line() {
            return parse_server_signature(&line);
        }
        if parser.buffered_len() > MAX_SIGNATURE_LEN {
            return Err(AmiError::protocol(format!(
                "server greeting exceeds {MAX_SIGNATURE_LEN} bytes"
            )));
        }
        let n = stream.read(read_buffer).await.map_err(AmiError::Io)?;
        if n == 0 {
            return Err(AmiError::protocol(
                "server closed connection during greeting",
            ));
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// Read a single packet from the unsplit stream (handshake only; the reader
/// loop takes over after login).
async fn recv_packet(
    stream: &mut TcpStream,
    parser: &mut Parser,
    registry: &EventRegistry,
    read_buffer: &mut [u8],
) -> AmiResult<IncomingPacket> {
    loop {
        if let Some(packet) = parser.parse_packet(registry)? {
            trace!("parsed {} from buffer", packet.signature());
            return Ok(packet);
        }
        let n = stream.read(read_buffer).await.map_err(AmiError::Io)?;
        if n == 0 {
            return Err(AmiError::ConnectionClosed);
        }
        parser.add_data(&read_buffer[..n])?;
    }
}

/// Perform the login handshake on the unsplit stream.
async fn authenticate(
    stream: &mut TcpStream,
    parser: &mut Parser,
    registry: &EventRegistry,
    read_buffer: &mut [u8],
    username: &str,
    secret: &str,
) -> AmiResult<()> {
    let action = Action::login(username, secret)?;
    debug!("sending login action for user {} [secret redacted]", username);

    let mut data = serialize_packet(action.packet());
    data.extend_from_slice(PACKET_TERMINATOR);
    stream.write_all(&data).await.map_err(AmiError::Io)?;

    // Events may already be flowing; skip everything until the login's own
    // response arrives.
    loop {
        let packet = recv_packet(stream, parser, registry, read_buffer).await?;
        match packet {
            IncomingPacket::Response(response)
                if response.action_id() == Some(action.action_id()) =>
            {
                if response.is_error() {
                    return Err(AmiError::Authentication {
                        message: response.message().to_string(),
                    });
                }
                debug!("authenticated, message={:?}", response.message());
                return Ok(());
            }
            other => trace!("skipping {} during login", other.signature()),
        }
    }
}

/// Try to send an event (or error) to the pull stream via try_send.
///
/// If the channel is full, drop the item, set the overflow flag, and count the
/// drop. Before each dispatch, attempt to deliver a pending QueueFull marker
/// first. A closed channel is not an error: the application may have dropped
/// the stream and rely entirely on registered handlers.
fn dispatch_stream_item(
    event_tx: &mpsc::Sender<AmiResult<Event>>,
    shared: &SharedState,
    item: AmiResult<Event>,
) {
    if shared.event_overflow.load(Ordering::Relaxed) {
        match event_tx.try_send(Err(AmiError::QueueFull)) {
            Ok(()) => {
                shared.event_overflow.store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
            Err(mpsc::error::TrySendError::Full(_)) => {}
        }
    }

    match event_tx.try_send(item) {
        Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            shared.event_overflow.store(true, Ordering::Relaxed);
            shared.dropped_event_count.fetch_add(1, Ordering::Relaxed);
            warn!("event queue full, dropping event");
        }
    }
}

/// Route one parsed packet: action correlation first, then handler dispatch
/// and the pull stream for events.
async fn process_packet(
    packet: IncomingPacket,
    shared: &SharedState,
    event_tx: &mpsc::Sender<AmiResult<Event>>,
) {
    trace!("received {}", packet.signature());
    match packet {
        IncomingPacket::Response(response) => {
            let signature = response.signature();
            let mut pending = shared.pending.lock().await;
            if !pending.handle_response(response) {
                warn!("{} does not match any pending action", signature);
            }
        }
        IncomingPacket::Event(event) => {
            {
                let mut pending = shared.pending.lock().await;
                pending.handle_event(&event);
            }

            // Matching callbacks run as independent tasks; a slow handler
            // never blocks the reader.
            let callbacks: Vec<EventCallback> = read_handlers(shared)
                .iter()
                .filter(|binding| {
                    binding
                        .filter
                        .as_ref()
                        .map_or(true, |filter| filter.matches(&event))
                })
                .map(|binding| binding.callback.clone())
                .collect();
            for callback in callbacks {
                tokio::spawn(callback(event.clone()));
            }

            dispatch_stream_item(event_tx, shared, Ok(event));
        }
    }
}

/// Background reader loop
async fn reader_loop(
    reader: OwnedReadHalf,
    parser: Parser,
    registry: Arc<EventRegistry>,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<AmiResult<Event>>,
) {
    let inner = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader,
        parser,
        registry,
        shared.clone(),
        status_tx.clone(),
        event_tx,
    ));
    if futures_util::FutureExt::catch_unwind(inner).await.is_err() {
        tracing::error!("reader task panicked");
        shared.pending.lock().await.fail_all();
        let _ = status_tx.send(ConnectionStatus::Disconnected(DisconnectReason::IoError(
            "reader task panicked".to_string(),
        )));
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    mut parser: Parser,
    registry: Arc<EventRegistry>,
    shared: Arc<SharedState>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: mpsc::Sender<AmiResult<Event>>,
) {
    let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

    loop {
        // Drain complete packets from buffered data before touching the socket
        match parser.parse_packet(&registry) {
            Ok(Some(packet)) => {
                process_packet(packet, &shared, &event_tx).await;
                continue;
            }
            Ok(None) => {
                // Need more data from the socket
            }
            Err(err) => {
                // The offending frame was consumed; reject it and keep the
                // connection.
                warn!("rejecting unparsable frame: {}", err);
                dispatch_stream_item(&event_tx, &shared, Err(err));
                continue;
            }
        }

        match reader.read(&mut read_buffer).await {
            Ok(0) => {
                let reason = if shared.client_closing.load(Ordering::Relaxed) {
                    DisconnectReason::ClientRequested
                } else {
                    DisconnectReason::ServerClosed
                };
                info!("connection closed ({})", reason);
                shared.pending.lock().await.fail_all();
                let _ = status_tx.send(ConnectionStatus::Disconnected(reason));
                return;
            }
            Ok(n) => {
                if let Err(err) = parser.add_data(&read_buffer[..n]) {
                    warn!("receive buffer error: {}", err);
                    shared.pending.lock().await.fail_all();
                    let _ = status_tx.send(ConnectionStatus::Disconnected(
                        DisconnectReason::IoError(err.to_string()),
                    ));
                    return;
                }
            }
            Err(err) => {
                warn!("read error: {}", err);
                shared.pending.lock().await.fail_all();
                let _ = status_tx.send(ConnectionStatus::Disconnected(
                    DisconnectReason::IoError(err.to_string()),
                ));
                return;
            }
        }
    }
}

impl AmiClient {
    /// Connect and authenticate against a manager server.
    ///
    /// Returns the client handle for sending actions plus the event stream.
    /// There is no reconnect logic: once disconnected, call `connect` again
    /// for a fresh pair.
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        secret: &str,
    ) -> AmiResult<(Self, AmiEventStream)> {
        Self::connect_with_options(host, port, username, secret, AmiConnectOptions::default())
            .await
    }

    /// [`connect`](Self::connect) with explicit options (timeout, queue size,
    /// event schema registry).
    pub async fn connect_with_options(
        host: &str,
        port: u16,
        username: &str,
        secret: &str,
        options: AmiConnectOptions,
    ) -> AmiResult<(Self, AmiEventStream)> {
        info!("connecting to manager at {}:{}", host, port);

        let mut stream = tcp_connect(host, port, options.connect_timeout).await?;
        let mut parser = Parser::new();
        let mut read_buffer = [0u8; SOCKET_BUF_SIZE];

        let signature = read_signature(&mut stream, &mut parser, &mut read_buffer).await?;
        debug!("remote server identified as {}", signature);

        authenticate(
            &mut stream,
            &mut parser,
            &options.registry,
            &mut read_buffer,
            username,
            secret,
        )
        .await?;

        info!(
            "connected and authenticated to \"{}\" at {}:{}",
            signature, host, port
        );
        Ok(Self::split_and_spawn(stream, parser, signature, options))
    }

    fn split_and_spawn(
        stream: TcpStream,
        parser: Parser,
        signature: ServerSignature,
        options: AmiConnectOptions,
    ) -> (Self, AmiEventStream) {
        let queue_size = options.event_queue_size.max(1);
        let (read_half, write_half) = stream.into_split();

        let shared = Arc::new(SharedState {
            pending: Mutex::new(PendingActions::new()),
            handlers: RwLock::new(Vec::new()),
            event_overflow: AtomicBool::new(false),
            dropped_event_count: AtomicU64::new(0),
            client_closing: AtomicBool::new(false),
        });

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);
        let status_rx2 = status_tx.subscribe();
        let (event_tx, event_rx) = mpsc::channel(queue_size);

        tokio::spawn(reader_loop(
            read_half,
            parser,
            options.registry,
            shared.clone(),
            status_tx,
            event_tx,
        ));

        let client = AmiClient {
            writer: Arc::new(Mutex::new(write_half)),
            shared,
            status_rx,
            signature,
        };

        let stream = AmiEventStream {
            rx: event_rx,
            status_rx: status_rx2,
        };

        (client, stream)
    }

    /// Send an action and return its completion signal.
    ///
    /// The action is registered in the pending table before its bytes are
    /// flushed, so a response can never arrive unannounced. The whole packet
    /// is written as one contiguous append under the writer lock; the lock is
    /// released immediately after, so concurrent senders only serialize the
    /// writes themselves.
    pub async fn send_action(&self, action: Action) -> AmiResult<ActionHandle> {
        if !self.is_connected() {
            return Err(AmiError::NotConnected);
        }
        debug!("sending {}", action.signature());

        let mut data = serialize_packet(action.packet());
        data.extend_from_slice(PACKET_TERMINATOR);

        let handle = {
            let mut pending = self.shared.pending.lock().await;
            pending.register(&action)?
        };

        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.write_all(&data).await {
            drop(writer);
            let mut pending = self.shared.pending.lock().await;
            pending.remove(handle.action_id());
            return Err(AmiError::Io(err));
        }
        drop(writer);

        // The reader sweeps the table when the connection dies; an entry
        // registered after that sweep would wait forever. Re-check and sweep.
        if !self.is_connected() {
            self.shared.pending.lock().await.fail_all();
        }

        Ok(handle)
    }

    /// Send an action and wait for its completion.
    pub async fn run_action(&self, action: Action) -> AmiResult<CompletedAction> {
        self.send_action(action).await?.wait().await
    }

    /// Register an event handler.
    ///
    /// A handler with no filter matches every event. Matching callbacks are
    /// spawned as independent tasks (fire-and-forget); their panics or
    /// slowness never reach the reader loop. Handlers may be registered at
    /// any time, including after events started flowing.
    pub fn on_event<F, Fut>(&self, filter: Option<Filter>, callback: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(move |event| {
            Box::pin(callback(event)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let mut handlers = self
            .shared
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.push(HandlerBinding { filter, callback });
    }

    /// Identity string the server sent in its greeting.
    pub fn server_signature(&self) -> &ServerSignature {
        &self.signature
    }

    /// Number of events dropped due to a full event queue.
    pub fn dropped_event_count(&self) -> u64 {
        self.shared.dropped_event_count.load(Ordering::Relaxed)
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    /// Tear the connection down by shutting down the write half.
    ///
    /// The reader observes EOF, fails any still-pending actions with
    /// [`AmiError::ConnectionLost`] and closes the event stream.
    pub async fn disconnect(&self) -> AmiResult<()> {
        info!("client requested disconnect");
        self.shared.client_closing.store(true, Ordering::Relaxed);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(AmiError::Io)?;
        Ok(())
    }
}

impl AmiEventStream {
    /// Receive the next event, or `None` once the connection is gone.
    ///
    /// `Err` items carry rejected frames and the one-shot
    /// [`AmiError::QueueFull`] overflow marker; the connection is still up
    /// after either.
    pub async fn recv(&mut self) -> Option<AmiResult<Event>> {
        self.rx.recv().await
    }

    /// Pump the stream forever, discarding items.
    ///
    /// For handler-only (push) consumption: registered handlers do all the
    /// work while this keeps the queue drained. Returns the disconnect reason
    /// once the connection ends.
    pub async fn run_dispatch_loop(mut self) -> DisconnectReason {
        while self.rx.recv().await.is_some() {}
        match self.status_rx.borrow().clone() {
            ConnectionStatus::Disconnected(reason) => reason,
            ConnectionStatus::Connected => DisconnectReason::ServerClosed,
        }
    }

    /// Whether the connection is alive (not yet disconnected).
    pub fn is_connected(&self) -> bool {
        matches!(*self.status_rx.borrow(), ConnectionStatus::Connected)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }
}

impl futures_util::Stream for AmiEventStream {
    type Item = AmiResult<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
