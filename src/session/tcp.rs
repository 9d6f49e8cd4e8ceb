use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::context::RemoteContext;
use crate::error::RemoteError;
use crate::packet_header::PacketHeader;
use crate::session::{DisconnectReason, LinkConnector, PacketSink, ReadSource, RemoteSession};

/// Opens a stream session to `addr`. The returned session is connected but
///  not started: set the receiver, then call [RemoteSession::start] (an rpc
///  send starts it implicitly).
pub async fn connect(context: &Arc<RemoteContext>, addr: SocketAddr) -> anyhow::Result<Arc<RemoteSession>> {
    let connector = Arc::new(TcpConnector { target: addr });
    let session = RemoteSession::create(context.clone(), addr, Some(connector.clone()));
    connector.establish(&session).await?;
    Ok(session)
}

struct TcpConnector {
    target: SocketAddr,
}

#[async_trait]
impl LinkConnector for TcpConnector {
    async fn establish(&self, session: &Arc<RemoteSession>) -> anyhow::Result<()> {
        let stream = TcpStream::connect(self.target).await
            .map_err(|e| RemoteError::ConnectFailed(format!("{}: {}", self.target, e)))?;
        install_stream(session, stream)
    }
}

fn install_stream(session: &Arc<RemoteSession>, stream: TcpStream) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let local_addr = stream.local_addr().ok();
    let (read_half, write_half) = stream.into_split();

    session.install_link(
        Box::new(StreamSink { write_half }),
        ReadSource::Stream(read_half),
        local_addr,
        None,
    )
}

struct StreamSink {
    write_half: OwnedWriteHalf,
}

#[async_trait]
impl PacketSink for StreamSink {
    async fn write_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        self.write_half.write_all(packet).await?;
        Ok(())
    }
}

/// Accepts stream sessions, one per [TcpRemoteListener::listen] call.
pub struct TcpRemoteListener {
    context: Arc<RemoteContext>,
    listener: TcpListener,
}

impl TcpRemoteListener {
    pub async fn bind(context: Arc<RemoteContext>, addr: SocketAddr) -> anyhow::Result<TcpRemoteListener> {
        let listener = TcpListener::bind(addr).await?;
        info!("listening for stream sessions on {}", listener.local_addr()?);
        Ok(TcpRemoteListener { context, listener })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts the next peer and wraps it in a fresh, unstarted session. May
    ///  be called repeatedly to accept concurrently.
    pub async fn listen(&self) -> anyhow::Result<Arc<RemoteSession>> {
        let (stream, peer_addr) = self.listener.accept().await?;
        debug!("accepted stream connection from {}", peer_addr);

        let session = RemoteSession::create(self.context.clone(), peer_addr, None);
        install_stream(&session, stream)?;
        Ok(session)
    }
}

/// Reader task for stream sessions: reassembles packets from the byte stream
///  using the authoritative header length, advancing frame by frame.
///
/// A framing violation is fatal here - with a corrupted length field there is
///  no way to find the next packet boundary in a stream.
pub(crate) async fn run_stream_reader(session: Weak<RemoteSession>, mut read_half: OwnedReadHalf) {
    let max_packet_size = match session.upgrade() {
        Some(session) => session.context().config().max_packet_size,
        None => return,
    };

    let mut buf = BytesMut::with_capacity(2 * max_packet_size);
    loop {
        // dispatch every complete frame currently buffered
        while buf.len() >= PacketHeader::SERIALIZED_LEN {
            let header = match PacketHeader::try_parse(&buf) {
                Ok(header) => header,
                Err(_) => break,
            };
            if let Err(e) = header.validate_len(max_packet_size) {
                if let Some(session) = session.upgrade() {
                    warn!("session {}: {} - closing stream", session.id(), e);
                    session.handle_link_failure(DisconnectReason::Framing);
                }
                return;
            }
            if buf.len() < header.len as usize {
                break;
            }

            let frame = buf.split_to(header.len as usize).freeze();
            let Some(session) = session.upgrade() else {
                return;
            };
            session.accept_packet(frame);
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                if let Some(session) = session.upgrade() {
                    debug!("session {}: peer closed the stream", session.id());
                    session.handle_link_failure(DisconnectReason::PeerClosed);
                }
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(session) = session.upgrade() {
                    session.handle_link_failure(DisconnectReason::Io(e.to_string()));
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use crate::config::RemoteConfig;
    use crate::message_dispatcher::MessageDispatcher;
    use crate::message_registry::MessageRegistry;
    use crate::test_util::{
        spawn_drain, test_context, test_context_with, test_registry,
        EchoReceiver, Login2Gate, Login2GateResult, Note, RecordingReceiver, SilentReceiver,
    };
    use super::*;

    async fn accept_echo_peer(listener: &TcpRemoteListener) -> Arc<RemoteSession> {
        let session = listener.listen().await.unwrap();
        session.set_receiver(Arc::new(EchoReceiver));
        session.start();
        session
    }

    #[tokio::test]
    async fn test_basic_rpc() {
        let (client_context, client_dispatcher) = test_context();
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { accept_echo_peer(&listener).await });

        let client = connect(&client_context, server_addr).await.unwrap();
        let _server_session = accept.await.unwrap();

        let result = client.rpc::<Login2GateResult, _>(&Login2Gate {
            acct: "u".to_string(),
            pwd: "p".to_string(),
        }).await;

        assert_eq!(result, Ok(Login2GateResult { is_success: true }));
        assert_eq!(client.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_rpc_timeout_when_handler_stays_silent() {
        let config = RemoteConfig { rpc_timeout: Duration::from_millis(50), ..RemoteConfig::default() };
        let (client_context, client_dispatcher) = test_context_with(config);
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let session = listener.listen().await.unwrap();
            session.set_receiver(Arc::new(SilentReceiver));
            session.start();
            session
        });

        let client = connect(&client_context, server_addr).await.unwrap();
        let _server_session = accept.await.unwrap();

        let start = std::time::Instant::now();
        let result = client.rpc::<Login2GateResult, _>(&Login2Gate {
            acct: "u".to_string(),
            pwd: "p".to_string(),
        }).await;

        assert_eq!(result, Err(crate::error::RemoteError::Timeout));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "resolved after {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "resolved after {:?}", elapsed);
        assert_eq!(client.pending_rpc_count(), 0);
    }

    #[tokio::test]
    async fn test_rpc_type_mismatch() {
        // the server answers the login rpc with an unrelated message type
        struct WrongReplyReceiver;
        #[async_trait]
        impl crate::session::MessageReceiver for WrongReplyReceiver {
            async fn on_message(
                &self,
                _session: &Arc<RemoteSession>,
                _message: Box<dyn std::any::Any + Send>,
            ) -> Option<Box<dyn std::any::Any + Send>> {
                Some(Box::new(Note { text: "surprise".to_string() }))
            }
        }

        let (client_context, client_dispatcher) = test_context();
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let session = listener.listen().await.unwrap();
            session.set_receiver(Arc::new(WrongReplyReceiver));
            session.start();
            session
        });

        let client = connect(&client_context, server_addr).await.unwrap();
        let _server_session = accept.await.unwrap();

        let result = client.rpc::<Login2GateResult, _>(&Login2Gate {
            acct: "u".to_string(),
            pwd: "p".to_string(),
        }).await;

        assert!(matches!(result, Err(crate::error::RemoteError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_sends_are_observed_in_order() {
        let (client_context, client_dispatcher) = test_context();
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let receiver = Arc::new(RecordingReceiver::new());
        let receiver2 = receiver.clone();
        let accept = tokio::spawn(async move {
            let session = listener.listen().await.unwrap();
            session.set_receiver(receiver2);
            session.start();
            session
        });

        let client = connect(&client_context, server_addr).await.unwrap();
        let _server_session = accept.await.unwrap();

        for i in 0..20 {
            client.send(&Note { text: format!("{}", i) }).unwrap();
        }

        let expected = (0..20).map(|i| format!("{}", i)).collect::<Vec<_>>();
        receiver.wait_for(20, Duration::from_secs(5)).await;
        assert_eq!(receiver.texts(), expected);
    }

    #[tokio::test]
    async fn test_framing_violation_closes_stream_session() {
        let (server_context, server_dispatcher) = test_context();
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let mut raw_client = TcpStream::connect(server_addr).await.unwrap();
        let session = listener.listen().await.unwrap();
        session.set_receiver(Arc::new(EchoReceiver));
        session.start();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        session.on_disconnect(move |reason| { let _ = event_tx.send(reason.clone()); });

        // length field far beyond the packet cap
        raw_client.write_all(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let reason = event_rx.recv().await.unwrap();
        assert_eq!(reason, DisconnectReason::Framing);
        assert!(!session.is_valid());
    }

    #[tokio::test]
    async fn test_reconnect_within_window() {
        let client_config = RemoteConfig {
            is_reconnect: true,
            reconnect_window: Duration::from_secs(5),
            ..RemoteConfig::default()
        };
        let (client_context, client_dispatcher) = test_context_with(client_config);
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let first_accept = tokio::spawn(async move {
            let first = accept_echo_peer(&listener).await;
            (listener, first)
        });

        let client = connect(&client_context, server_addr).await.unwrap();
        client.set_receiver(Arc::new(EchoReceiver));
        client.start();
        let (listener, first_server_session) = first_accept.await.unwrap();

        let pre_count = Arc::new(AtomicUsize::new(0));
        let success_count = Arc::new(AtomicUsize::new(0));
        let pre_count2 = pre_count.clone();
        let success_count2 = success_count.clone();
        client.on_pre_reconnect(move || { pre_count2.fetch_add(1, Ordering::SeqCst); });
        client.on_reconnect_success(move || { success_count2.fetch_add(1, Ordering::SeqCst); });

        // the listener stays up, so the supervisor finds the peer again
        let second_accept = tokio::spawn(async move { accept_echo_peer(&listener).await });
        first_server_session.disconnect();

        let _second_server_session = second_accept.await.unwrap();

        // wait until the supervisor re-established the link
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while success_count.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "reconnect did not happen in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pre_count.load(Ordering::SeqCst), 1);
        assert_eq!(success_count.load(Ordering::SeqCst), 1);
        assert!(client.is_valid());

        // the re-established session carries traffic without user intervention
        let result = client.rpc::<Login2GateResult, _>(&Login2Gate {
            acct: "u".to_string(),
            pwd: "p".to_string(),
        }).await;
        assert_eq!(result, Ok(Login2GateResult { is_success: true }));
    }

    #[tokio::test]
    async fn test_reconnect_window_exhaustion_invalidates_session() {
        let client_config = RemoteConfig {
            is_reconnect: true,
            reconnect_window: Duration::from_millis(200),
            ..RemoteConfig::default()
        };
        let (client_context, client_dispatcher) = test_context_with(client_config);
        let (server_context, server_dispatcher) = test_context();
        let _client_drain = spawn_drain(client_dispatcher);
        let _server_drain = spawn_drain(server_dispatcher);

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let session = accept_echo_peer(&listener).await;
            (listener, session)
        });

        let client = connect(&client_context, server_addr).await.unwrap();
        client.start();
        let (listener, server_session) = accept.await.unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        client.on_disconnect(move |reason| { let _ = event_tx.send(reason.clone()); });

        // no listener to come back to
        drop(listener);
        server_session.disconnect();

        let reason = event_rx.recv().await.unwrap();
        assert_eq!(reason, DisconnectReason::ReconnectFailed);
        assert!(!client.is_valid());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let registry = MessageRegistry::new();
        let dispatcher = MessageDispatcher::new();
        let context = crate::context::RemoteContext::new(RemoteConfig::default(), registry, dispatcher.handle()).unwrap();

        // bind and drop to get a port that is (momentarily) free
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        assert!(connect(&context, addr).await.is_err());
    }

    #[tokio::test]
    async fn test_listen_accepts_multiple_sessions() {
        let (server_context, server_dispatcher) = test_context();
        let _server_drain = spawn_drain(server_dispatcher);
        let (client_context, _client_dispatcher) = test_context();

        let listener = TcpRemoteListener::bind(server_context, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let accepts = tokio::spawn(async move {
            let a = listener.listen().await.unwrap();
            let b = listener.listen().await.unwrap();
            (a, b)
        });

        let c1 = connect(&client_context, server_addr).await.unwrap();
        let c2 = connect(&client_context, server_addr).await.unwrap();
        let (a, b) = accepts.await.unwrap();

        assert_ne!(a.id(), b.id());
        assert!(c1.is_valid() && c2.is_valid());
        assert!(a.is_valid() && b.is_valid());
    }

    #[tokio::test]
    async fn test_shared_registry_knows_scenario_messages() {
        let registry = test_registry();
        let mut buf = bytes::BytesMut::new();
        assert!(registry.encode("Note", &Note { text: "x".to_string() }, &mut buf).is_ok());
    }
}
