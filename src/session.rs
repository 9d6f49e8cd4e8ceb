use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::buffer_pool::PooledBuf;
use crate::context::RemoteContext;
use crate::error::RemoteError;
use crate::event_hooks::EventHooks;
use crate::packet_header::{self, PacketHeader};
use crate::rpc_pool::{LazyRpcFuture, RpcFuture, RpcPool};

pub mod reconnect;
pub mod tcp;
pub mod udp;

/// Process-wide identity counter for sessions. Not persisted.
static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport reported an I/O error.
    Io(String),
    /// A stream peer violated the framing contract - fatal for the session.
    Framing,
    /// The peer closed the connection in an orderly fashion.
    PeerClosed,
    /// The reconnect supervisor gave up after its window elapsed.
    ReconnectFailed,
}

/// Application-side handler for inbound messages, invoked on the application
///  context by [crate::message_dispatcher::MessageDispatcher::drain].
///
/// The result is the reply for the peer: return it non-`None` only when the
///  peer asked for one (i.e. the message arrived as an rpc request).
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    async fn on_message(
        &self,
        session: &Arc<RemoteSession>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>>;
}

/// Transport-specific write primitive, owned by the session's writer task.
///  Introduced to facilitate mocking the I/O part away for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait PacketSink: Send + 'static {
    async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()>;
}

/// Where the session's inbound packets come from once it is started.
pub(crate) enum ReadSource {
    /// A stream socket's read half; frames are reassembled from it.
    Stream(tokio::net::tcp::OwnedReadHalf),
    /// A datagram socket owned by this session; one datagram is one packet.
    Datagram {
        socket: Arc<tokio::net::UdpSocket>,
        peer: SocketAddr,
    },
    /// A datagram listener demultiplexes packets into this session.
    Demuxed,
}

/// Established transport state of a session. Replaced wholesale on reconnect.
struct ActiveLink {
    outbound: mpsc::UnboundedSender<PooledBuf>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
    /// present until the reader task is spawned by `start`
    read_source: Option<ReadSource>,
    /// cleanup hook, e.g. removing a virtual session from its listener's demux tables
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

enum LinkState {
    /// created but no transport installed yet
    Down,
    Connected(ActiveLink),
    /// link lost, supervisor is trying to re-establish
    Reconnecting,
    /// final
    Closed,
}

/// Re-establishes the transport of a broken session. Client-initiated
///  sessions carry one; accepted sessions do not and cannot reconnect.
#[async_trait]
pub(crate) trait LinkConnector: Send + Sync + 'static {
    async fn establish(&self, session: &Arc<RemoteSession>) -> anyhow::Result<()>;
}

/// A logical bidirectional message channel with one peer over a single
///  socket. Owns the send path, the receive processing, the per-session rpc
///  pool and the reconnect policy.
///
/// Sessions are handed out unstarted: set the receiver first, then call
///  [RemoteSession::start]. Serialization in [RemoteSession::send] happens on
///  the caller's thread and completes before the call returns; the socket
///  write itself is offloaded to a writer task (FIFO per session).
pub struct RemoteSession {
    id: u32,
    token: AtomicU64,
    peer_addr: SocketAddr,
    context: Arc<RemoteContext>,
    rpc_pool: RpcPool,
    connector: Option<Arc<dyn LinkConnector>>,

    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    valid: AtomicBool,
    started: AtomicBool,
    /// packets arriving before `start` are parked and replayed in order
    parking: AtomicBool,
    pending_inbound: Mutex<Vec<Bytes>>,
    last_receive: Mutex<Instant>,
    local_addr: Mutex<Option<SocketAddr>>,
    link: Mutex<LinkState>,

    disconnect_hooks: EventHooks<DisconnectReason>,
    pre_reconnect_hooks: EventHooks<()>,
    reconnect_success_hooks: EventHooks<()>,
}

impl RemoteSession {
    pub(crate) fn create(
        context: Arc<RemoteContext>,
        peer_addr: SocketAddr,
        connector: Option<Arc<dyn LinkConnector>>,
    ) -> Arc<RemoteSession> {
        let session = Arc::new(RemoteSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            token: AtomicU64::new(0),
            peer_addr,
            rpc_pool: RpcPool::new(context.config().rpc_timeout),
            connector,
            receiver: RwLock::new(None),
            valid: AtomicBool::new(false),
            started: AtomicBool::new(false),
            parking: AtomicBool::new(true),
            pending_inbound: Mutex::new(Vec::new()),
            last_receive: Mutex::new(Instant::now()),
            local_addr: Mutex::new(None),
            link: Mutex::new(LinkState::Down),
            disconnect_hooks: EventHooks::new(),
            pre_reconnect_hooks: EventHooks::new(),
            reconnect_success_hooks: EventHooks::new(),
            context,
        });
        session.spawn_sweeper();
        session
    }

    fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.context.config().rpc_sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.rpc_pool.sweep(Instant::now());
            }
        });
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Opaque user-assigned token, e.g. for routing in the application.
    pub fn token(&self) -> u64 {
        self.token.load(Ordering::Relaxed)
    }

    pub fn set_token(&self, token: u64) {
        self.token.store(token, Ordering::Relaxed);
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The local address actually bound for this session's socket, i.e. the
    ///  post-NAT remapped address as far as this process can observe it.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    pub fn last_receive(&self) -> Instant {
        *self.last_receive.lock().unwrap()
    }

    pub fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.receiver.write().unwrap() = Some(receiver);
    }

    pub(crate) fn receiver(&self) -> Option<Arc<dyn MessageReceiver>> {
        self.receiver.read().unwrap().clone()
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.rpc_pool.pending_count()
    }

    pub(crate) fn context(&self) -> &Arc<RemoteContext> {
        &self.context
    }

    pub fn on_disconnect(&self, sink: impl Fn(&DisconnectReason) + Send + Sync + 'static) {
        self.disconnect_hooks.add(sink);
    }

    pub fn on_pre_reconnect(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.pre_reconnect_hooks.add(move |_| sink());
    }

    pub fn on_reconnect_success(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.reconnect_success_hooks.add(move |_| sink());
    }

    pub(crate) fn notify_pre_reconnect(&self) {
        self.pre_reconnect_hooks.notify(&());
    }

    pub(crate) fn notify_reconnect_success(&self) {
        self.reconnect_success_hooks.notify(&());
    }

    fn reconnect_enabled(&self) -> bool {
        self.connector.is_some() && self.context.config().is_reconnect
    }

    pub(crate) fn is_reconnecting(&self) -> bool {
        matches!(&*self.link.lock().unwrap(), LinkState::Reconnecting)
    }

    /// Installs an established transport: the writer task starts immediately,
    ///  the reader once the session is started.
    pub(crate) fn install_link(
        self: &Arc<Self>,
        sink: Box<dyn PacketSink>,
        read_source: ReadSource,
        local_addr: Option<SocketAddr>,
        on_close: Option<Box<dyn FnOnce() + Send>>,
    ) -> anyhow::Result<()> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(Arc::downgrade(self), sink, outbound_rx));

        {
            let mut link = self.link.lock().unwrap();
            match &*link {
                LinkState::Connected(_) => {
                    writer.abort();
                    return Err(RemoteError::AlreadyConnected.into());
                }
                LinkState::Closed => {
                    writer.abort();
                    return Err(RemoteError::Disconnected.into());
                }
                LinkState::Down | LinkState::Reconnecting => {}
            }
            *link = LinkState::Connected(ActiveLink {
                outbound,
                writer,
                reader: None,
                read_source: Some(read_source),
                on_close,
            });
        }

        *self.local_addr.lock().unwrap() = local_addr;
        self.valid.store(true, Ordering::SeqCst);

        if self.started.load(Ordering::SeqCst) {
            // a re-established link resumes reading without a second `start`
            self.spawn_reader();
        }
        Ok(())
    }

    /// Starts receive processing. Idempotent; set the receiver before calling
    ///  this so no message can slip past it.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("session {}: starting receive processing", self.id);
        self.spawn_reader();

        // replay packets that were demuxed into the session before it started;
        //  `parking` flips under the queue lock so no packet can overtake the replay
        loop {
            let batch = {
                let mut pending = self.pending_inbound.lock().unwrap();
                if pending.is_empty() {
                    self.parking.store(false, Ordering::SeqCst);
                    break;
                }
                std::mem::take(&mut *pending)
            };
            for packet in batch {
                self.process_packet(&packet);
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>) {
        let mut link = self.link.lock().unwrap();
        let LinkState::Connected(active) = &mut *link else {
            return;
        };
        let Some(source) = active.read_source.take() else {
            return;
        };

        match source {
            ReadSource::Stream(read_half) => {
                active.reader = Some(tokio::spawn(tcp::run_stream_reader(Arc::downgrade(self), read_half)));
            }
            ReadSource::Datagram { socket, peer } => {
                active.reader = Some(tokio::spawn(udp::run_datagram_reader(Arc::downgrade(self), socket, peer)));
            }
            ReadSource::Demuxed => {}
        }
    }

    /// Entry point for complete packets from the reader / demux side. Parks
    ///  the packet if the session has not been started yet.
    pub(crate) fn accept_packet(self: &Arc<Self>, packet: Bytes) {
        {
            let mut pending = self.pending_inbound.lock().unwrap();
            if self.parking.load(Ordering::SeqCst) {
                pending.push(packet);
                return;
            }
        }
        self.process_packet(&packet);
    }

    /// Decodes one complete packet and routes it: rpc responses into the rpc
    ///  pool, everything else to the application via the dispatcher.
    pub(crate) fn process_packet(self: &Arc<Self>, packet: &[u8]) {
        let header = match PacketHeader::try_parse(packet) {
            Ok(header) => header,
            Err(e) => {
                warn!("session {}: dropping unparseable packet: {}", self.id, e);
                return;
            }
        };
        let declared_len = header.len as usize;
        if declared_len < PacketHeader::SERIALIZED_LEN || declared_len > packet.len() {
            warn!("session {}: packet length {} does not match the {} bytes received - dropping", self.id, declared_len, packet.len());
            return;
        }

        *self.last_receive.lock().unwrap() = Instant::now();

        let body = &packet[PacketHeader::SERIALIZED_LEN..declared_len];
        let decoded = match self.context.registry().decode(header.message_id, body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("session {}: {} - dropping frame", self.id, e);
                return;
            }
        };

        if header.rpc_id < 0 {
            // `checked_neg` guards against the unnegatable i16::MIN, which no
            //  well-behaved peer ever sends
            let completed = match header.rpc_id.checked_neg() {
                Some(request_id) => self.rpc_pool.try_complete(request_id, decoded),
                None => false,
            };
            if !completed {
                // late, duplicate, or never-issued correlation id
                debug!("session {}: response for unknown rpc id {} - discarding", self.id, header.rpc_id);
            }
        }
        else {
            self.context.dispatcher().enqueue(self.clone(), header.rpc_id, decoded);
        }
    }

    /// Serializes `message` and hands the framed packet to the writer task.
    ///  The message may be mutated again as soon as this returns.
    pub fn send<T: Send + 'static>(&self, message: &T) -> anyhow::Result<()> {
        self.send_packet(std::any::type_name::<T>(), message, 0)?;
        Ok(())
    }

    pub(crate) fn send_reply(&self, message: Box<dyn Any + Send>, rpc_id: i16) -> anyhow::Result<()> {
        self.send_packet("rpc reply", message.as_ref(), rpc_id)?;
        Ok(())
    }

    fn send_packet(&self, type_name: &'static str, message: &(dyn Any + Send), rpc_id: i16) -> Result<(), RemoteError> {
        if !self.valid.load(Ordering::SeqCst) {
            return Err(RemoteError::Disconnected);
        }

        let pool = self.context.buffer_pool();
        let mut encode_buf = pool.acquire();
        let message_id = self.context.registry().encode(type_name, message, &mut encode_buf)?;

        let mut frame_buf = pool.acquire();
        packet_header::frame(
            message_id,
            rpc_id,
            &encode_buf,
            &mut frame_buf,
            self.context.config().max_packet_size,
        )?;
        drop(encode_buf); // back in the pool before the write is handed off

        let link = self.link.lock().unwrap();
        match &*link {
            LinkState::Connected(active) => active.outbound
                .send(frame_buf)
                .map_err(|_| RemoteError::Disconnected),
            _ => Err(RemoteError::Disconnected),
        }
    }

    /// Sends `message` as an rpc request and returns the awaitable response.
    ///  Starts receive processing if it is not running yet. A synchronous
    ///  send failure yields an already-resolved future.
    pub fn rpc<R, T>(self: &Arc<Self>, message: &T) -> RpcFuture<R>
    where
        R: Send + 'static,
        T: Send + 'static,
    {
        if !self.valid.load(Ordering::SeqCst) {
            return RpcFuture::failed(RemoteError::Disconnected);
        }
        self.start();

        let (rpc_id, future) = self.rpc_pool.register::<R>();
        if let Err(e) = self.send_packet(std::any::type_name::<T>(), message, rpc_id) {
            self.rpc_pool.try_fail(rpc_id, e);
        }
        future
    }

    /// As [RemoteSession::rpc], but with the cancellable continuation: on any
    ///  failure the returned awaitable resolves to `None` and `on_error`
    ///  receives the cause, so the success path needs no error handling.
    pub fn lazy_rpc<R, T>(
        self: &Arc<Self>,
        message: &T,
        on_error: impl FnOnce(RemoteError) + Send + 'static,
    ) -> LazyRpcFuture<R>
    where
        R: Send + 'static,
        T: Send + 'static,
    {
        if !self.valid.load(Ordering::SeqCst) {
            on_error(RemoteError::Disconnected);
            return LazyRpcFuture::cancelled();
        }
        self.start();

        let (rpc_id, future) = self.rpc_pool.register_lazy::<R>(on_error);
        if let Err(e) = self.send_packet(std::any::type_name::<T>(), message, rpc_id) {
            self.rpc_pool.try_fail(rpc_id, e);
        }
        future
    }

    /// User-initiated disconnect: closes the socket, invalidates the session
    ///  and drains all pending rpcs with [RemoteError::Disconnected]. Fires
    ///  no disconnect event.
    pub fn disconnect(&self) {
        debug!("session {}: user disconnect", self.id);

        let prev = std::mem::replace(&mut *self.link.lock().unwrap(), LinkState::Closed);
        if let LinkState::Connected(active) = prev {
            close_link(active);
        }
        self.valid.store(false, Ordering::SeqCst);
        self.rpc_pool.fail_all(RemoteError::Disconnected);
    }

    /// Unsolicited link failure, reported by the reader or writer task. Only
    ///  the first report per link takes effect.
    pub(crate) fn handle_link_failure(self: &Arc<Self>, reason: DisconnectReason) {
        let active = {
            let mut link = self.link.lock().unwrap();
            match &*link {
                LinkState::Connected(_) => {}
                // user disconnect, duplicate report, or reconnect already under way
                _ => return,
            }
            let next = if self.reconnect_enabled() { LinkState::Reconnecting } else { LinkState::Closed };
            match std::mem::replace(&mut *link, next) {
                LinkState::Connected(active) => active,
                _ => unreachable!(),
            }
        };
        close_link(active);

        if self.reconnect_enabled() {
            warn!("session {}: link failed ({:?}) - starting reconnect", self.id, reason);
            let connector = self.connector.clone().expect("reconnect implies a connector");
            tokio::spawn(reconnect::run_supervisor(self.clone(), connector));
        }
        else {
            warn!("session {}: link failed ({:?}) - disconnecting", self.id, reason);
            self.valid.store(false, Ordering::SeqCst);
            self.rpc_pool.fail_all(RemoteError::Disconnected);
            self.disconnect_hooks.notify(&reason);
        }
    }

    /// Called by the supervisor once the reconnect window is exhausted.
    pub(crate) fn finalize_failed_reconnect(&self) {
        {
            let mut link = self.link.lock().unwrap();
            if !matches!(&*link, LinkState::Reconnecting) {
                return;
            }
            *link = LinkState::Closed;
        }
        self.valid.store(false, Ordering::SeqCst);
        self.rpc_pool.fail_all(RemoteError::Disconnected);
        self.disconnect_hooks.notify(&DisconnectReason::ReconnectFailed);
    }
}

fn close_link(active: ActiveLink) {
    if let Some(reader) = active.reader {
        reader.abort();
    }
    active.writer.abort();
    if let Some(on_close) = active.on_close {
        on_close();
    }
}

/// Writer task: drains the session's outbound queue into the transport. The
///  queue guarantees per-session FIFO on the wire.
async fn run_writer(
    session: Weak<RemoteSession>,
    mut sink: Box<dyn PacketSink>,
    mut outbound: mpsc::UnboundedReceiver<PooledBuf>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.write_packet(frame.as_ref()).await {
            if let Some(session) = session.upgrade() {
                session.handle_link_failure(DisconnectReason::Io(e.to_string()));
            }
            return;
        }
    }
}
