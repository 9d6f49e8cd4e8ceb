use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::context::RemoteContext;
use crate::error::RemoteError;
use crate::message_registry::UDP_CONNECT_MESSAGE_ID;
use crate::packet_header::PacketHeader;
use crate::session::{DisconnectReason, LinkConnector, PacketSink, ReadSource, RemoteSession};

/// Handshake roles, carried in the `rpc_id` field of a handshake packet:
///  the connecting side asks (positive), the listener acknowledges (negative),
///  the connecting side confirms (zero) - mirroring the regular rpc sign
///  convention on the wire.
const HANDSHAKE_REQUEST: i16 = 1;
const HANDSHAKE_ACK: i16 = -1;
const HANDSHAKE_CONFIRM: i16 = 0;

const HANDSHAKE_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

fn handshake_packet(rpc_id: i16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN);
    PacketHeader {
        len: PacketHeader::SERIALIZED_LEN as u16,
        message_id: UDP_CONNECT_MESSAGE_ID,
        rpc_id,
    }.ser(&mut buf);
    buf
}

/// Opens a connection-emulated datagram session to `addr`: binds a fresh
///  socket and runs the handshake. The returned session is connected but not
///  started.
pub async fn connect(context: &Arc<RemoteContext>, addr: SocketAddr) -> anyhow::Result<Arc<RemoteSession>> {
    let connector = Arc::new(UdpConnector { target: addr });
    let session = RemoteSession::create(context.clone(), addr, Some(connector.clone()));
    connector.establish(&session).await?;
    Ok(session)
}

struct UdpConnector {
    target: SocketAddr,
}

#[async_trait]
impl LinkConnector for UdpConnector {
    async fn establish(&self, session: &Arc<RemoteSession>) -> anyhow::Result<()> {
        let bind_addr: SocketAddr = if self.target.is_ipv4() {
            "0.0.0.0:0".parse().expect("hardcoded bind address")
        }
        else {
            "[::]:0".parse().expect("hardcoded bind address")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

        run_client_handshake(&socket, self.target).await?;

        let local_addr = socket.local_addr().ok();
        session.install_link(
            Box::new(DatagramSink { socket: socket.clone(), peer: self.target }),
            ReadSource::Datagram { socket, peer: self.target },
            local_addr,
            None,
        )
    }
}

/// Client side of the handshake: send the request once a second until the
///  listener acknowledges (or the deadline passes), then confirm.
async fn run_client_handshake(socket: &UdpSocket, target: SocketAddr) -> anyhow::Result<()> {
    let request = handshake_packet(HANDSHAKE_REQUEST);
    let deadline = tokio::time::Instant::now() + HANDSHAKE_DEADLINE;
    let mut response = [0u8; 64];

    loop {
        socket.send_to(&request, target).await?;

        let attempt_deadline = (tokio::time::Instant::now() + HANDSHAKE_RETRY_INTERVAL).min(deadline);
        loop {
            let received = tokio::time::timeout_at(attempt_deadline, socket.recv_from(&mut response)).await;
            match received {
                Err(_) => break, // retry the request, or give up below
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok((n, from))) => {
                    if from != target {
                        trace!("handshake: datagram from unrelated peer {} - ignoring", from);
                        continue;
                    }
                    let Ok(header) = PacketHeader::try_parse(&response[..n]) else {
                        continue;
                    };
                    if header.message_id == UDP_CONNECT_MESSAGE_ID && header.rpc_id == HANDSHAKE_ACK {
                        socket.send_to(&handshake_packet(HANDSHAKE_CONFIRM), target).await?;
                        debug!("datagram handshake with {} complete", target);
                        return Ok(());
                    }
                }
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(RemoteError::ConnectFailed(format!("{}: datagram handshake timed out", target)).into());
        }
    }
}

struct DatagramSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl PacketSink for DatagramSink {
    async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        self.socket.send_to(packet, self.peer).await?;
        Ok(())
    }
}

/// Reader task for client-owned datagram sessions: one received datagram is
///  one packet. Malformed datagrams are dropped, only socket errors are fatal.
pub(crate) async fn run_datagram_reader(session: Weak<RemoteSession>, socket: Arc<UdpSocket>, peer: SocketAddr) {
    let max_packet_size = match session.upgrade() {
        Some(session) => session.context().config().max_packet_size,
        None => return,
    };

    let mut buf = vec![0u8; max_packet_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Err(e) => {
                if let Some(session) = session.upgrade() {
                    session.handle_link_failure(DisconnectReason::Io(e.to_string()));
                }
                return;
            }
            Ok((n, from)) => {
                if from != peer {
                    trace!("datagram from unrelated peer {} - ignoring", from);
                    continue;
                }
                let Some(session) = session.upgrade() else {
                    return;
                };
                dispatch_datagram(&session, &buf[..n]);
            }
        }
    }
}

/// Validates one datagram as one packet and hands it to the session. Datagram
///  framing errors drop the packet but never the session.
fn dispatch_datagram(session: &Arc<RemoteSession>, datagram: &[u8]) {
    let header = match PacketHeader::try_parse(datagram) {
        Ok(header) => header,
        Err(e) => {
            debug!("dropping malformed datagram: {}", e);
            return;
        }
    };
    if header.message_id == UDP_CONNECT_MESSAGE_ID {
        trace!("stray handshake datagram on an established session - ignoring");
        return;
    }

    let max_packet_size = session.context().config().max_packet_size;
    if header.validate_len(max_packet_size).is_err() || header.len as usize != datagram.len() {
        debug!("session {}: datagram length does not match its header - dropping packet", session.id());
        return;
    }

    session.accept_packet(Bytes::copy_from_slice(datagram));
}

struct PendingAccept {
    session: Arc<RemoteSession>,
    /// taken when the peer's confirmation arrives
    confirm: Option<oneshot::Sender<()>>,
}

struct ReadyQueue {
    queue: VecDeque<Arc<RemoteSession>>,
    waiter: Option<oneshot::Sender<Arc<RemoteSession>>>,
}

struct ListenerShared {
    context: Arc<RemoteContext>,
    socket: Arc<UdpSocket>,
    connecting: Mutex<FxHashMap<SocketAddr, PendingAccept>>,
    established: Mutex<FxHashMap<SocketAddr, Arc<RemoteSession>>>,
    ready: Mutex<ReadyQueue>,
}

impl ListenerShared {
    async fn send_handshake(&self, to: SocketAddr, rpc_id: i16) {
        if let Err(e) = self.socket.send_to(&handshake_packet(rpc_id), to).await {
            debug!("sending handshake packet to {} failed: {}", to, e);
        }
    }
}

/// Demultiplexes one shared datagram socket into virtual per-peer sessions.
///  Handshake packets drive the accept state machine; everything else routes
///  to the established session of its sender address.
pub struct UdpRemoteListener {
    shared: Arc<ListenerShared>,
    demux: JoinHandle<()>,
}

impl UdpRemoteListener {
    pub async fn bind(context: Arc<RemoteContext>, addr: SocketAddr) -> anyhow::Result<UdpRemoteListener> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening for datagram sessions on {}", socket.local_addr()?);

        let shared = Arc::new(ListenerShared {
            context,
            socket,
            connecting: Mutex::new(FxHashMap::default()),
            established: Mutex::new(FxHashMap::default()),
            ready: Mutex::new(ReadyQueue { queue: VecDeque::new(), waiter: None }),
        });
        let demux = tokio::spawn(run_demux(shared.clone()));

        Ok(UdpRemoteListener { shared, demux })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Returns the next accepted session - immediately from the connected
    ///  queue, or by waiting for the next handshake to complete. At most one
    ///  caller may wait at a time.
    pub async fn listen(&self) -> anyhow::Result<Arc<RemoteSession>> {
        let pending = {
            let mut ready = self.shared.ready.lock().unwrap();
            if let Some(session) = ready.queue.pop_front() {
                return Ok(session);
            }
            if ready.waiter.is_some() {
                bail!("listen called while another listen is in progress - only one waiter is supported");
            }
            let (sender, receiver) = oneshot::channel();
            ready.waiter = Some(sender);
            receiver
        };

        pending.await.map_err(|_| anyhow!("listener was shut down"))
    }
}

impl Drop for UdpRemoteListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

async fn run_demux(shared: Arc<ListenerShared>) {
    let max_packet_size = shared.context.config().max_packet_size;
    let mut buf = vec![0u8; max_packet_size];

    loop {
        let (n, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };

        let datagram = &buf[..n];
        let header = match PacketHeader::try_parse(datagram) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", from, e);
                continue;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

        if header.message_id == UDP_CONNECT_MESSAGE_ID {
            handle_handshake(&shared, from, header.rpc_id).instrument(span).await;
            continue;
        }

        let _entered = span.enter();
        let established = shared.established.lock().unwrap().get(&from).cloned();
        match established {
            Some(session) => dispatch_datagram(&session, datagram),
            None => {
                // a data datagram can overtake the explicit confirmation -
                //  treat it as the confirmation and deliver it
                let confirming = shared.connecting.lock().unwrap()
                    .get_mut(&from)
                    .map(|pending| (pending.confirm.take(), pending.session.clone()));
                match confirming {
                    Some((confirm, session)) => {
                        if let Some(confirm) = confirm {
                            let _ = confirm.send(());
                        }
                        dispatch_datagram(&session, datagram);
                    }
                    None => debug!("datagram from unknown peer {} - dropping", from),
                }
            }
        }
    }
}

async fn handle_handshake(shared: &Arc<ListenerShared>, from: SocketAddr, rpc_id: i16) {
    match rpc_id {
        HANDSHAKE_REQUEST => {
            if shared.connecting.lock().unwrap().contains_key(&from) {
                // the peer re-sent its request - join the accept already in progress
                trace!("duplicate handshake request from {} - re-acknowledging", from);
                shared.send_handshake(from, HANDSHAKE_ACK).await;
                return;
            }
            if shared.established.lock().unwrap().contains_key(&from) {
                debug!("handshake request from already-established peer {} - ignoring", from);
                return;
            }

            let session = RemoteSession::create(shared.context.clone(), from, None);
            let weak_shared = Arc::downgrade(shared);
            let on_close = Box::new(move || {
                if let Some(shared) = weak_shared.upgrade() {
                    shared.connecting.lock().unwrap().remove(&from);
                    shared.established.lock().unwrap().remove(&from);
                }
            });
            let install_result = session.install_link(
                Box::new(DatagramSink { socket: shared.socket.clone(), peer: from }),
                ReadSource::Demuxed,
                shared.socket.local_addr().ok(),
                Some(on_close),
            );
            if let Err(e) = install_result {
                error!("installing virtual session for {} failed: {}", from, e);
                return;
            }

            let (confirm_sender, confirm_receiver) = oneshot::channel();
            shared.connecting.lock().unwrap().insert(from, PendingAccept {
                session: session.clone(),
                confirm: Some(confirm_sender),
            });
            debug!("handshake request from {} - accepting as session {}", from, session.id());

            shared.send_handshake(from, HANDSHAKE_ACK).await;
            tokio::spawn(finish_accept(shared.clone(), from, session, confirm_receiver));
        }
        HANDSHAKE_CONFIRM => {
            let confirm = shared.connecting.lock().unwrap()
                .get_mut(&from)
                .and_then(|pending| pending.confirm.take());
            match confirm {
                Some(confirm) => {
                    let _ = confirm.send(());
                }
                None => trace!("handshake confirmation from {} without a pending accept - ignoring", from),
            }
        }
        other => debug!("handshake datagram from {} with unexpected rpc id {} - ignoring", from, other),
    }
}

/// Completes one pending accept: waits for the peer's confirmation, then
///  hands the session to the waiter or the connected queue. The `connecting`
///  entry is removed on every path so the table cannot leak.
async fn finish_accept(
    shared: Arc<ListenerShared>,
    from: SocketAddr,
    session: Arc<RemoteSession>,
    confirm: oneshot::Receiver<()>,
) {
    let confirmed = tokio::time::timeout(HANDSHAKE_DEADLINE, confirm).await;

    shared.connecting.lock().unwrap().remove(&from);

    match confirmed {
        Ok(Ok(())) => {
            shared.established.lock().unwrap().insert(from, session.clone());
            debug!("datagram session {} with {} is established", session.id(), from);

            let waiter = {
                let mut ready = shared.ready.lock().unwrap();
                match ready.waiter.take() {
                    Some(waiter) => Some(waiter),
                    None => {
                        ready.queue.push_back(session.clone());
                        None
                    }
                }
            };
            if let Some(waiter) = waiter {
                if let Err(unclaimed) = waiter.send(session) {
                    // the waiting listen() was dropped - keep the session available
                    shared.ready.lock().unwrap().queue.push_back(unclaimed);
                }
            }
        }
        Ok(Err(_)) | Err(_) => {
            debug!("accept of datagram session from {} timed out - disposing", from);
            session.disconnect();
        }
    }
}
