//! Network transport: a TCP control stream plus a UDP video socket.
//!
//! ```text
//!            ┌──── writer task ◄── outbound mpsc ◄── send_* / close
//! TcpStream ─┤
//!            └──── reader task ──► inbound mpsc ──► login / recv_host_message
//! UdpSocket ─────────────────────────────────────► recv_fragment
//! ```
//!
//! The client binds an ephemeral UDP port and announces it in `Hello`; the
//! host sends fragment datagrams there. Datagrams from any other address
//! are ignored.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ConnectTarget;
use crate::controller::ControllerState;
use crate::error::TransportError;
use crate::event::QuitReason;
use crate::profile::VideoProfile;
use crate::transport::wire::{ControlCodec, ControlMessage, MAX_DATAGRAM, PROTOCOL_VERSION};
use crate::transport::{
    Connector, HostMessage, LoginRequest, RecoveryRequest, Transport, VideoFragment,
};

const CHANNEL_DEPTH: usize = 64;

/// Opens a [`NetTransport`] to `target.address()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConnector;

#[async_trait]
impl Connector for NetConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(NetTransport::connect(target).await?))
    }
}

/// A connected control stream and its video socket.
#[derive(Debug)]
pub struct NetTransport {
    peer: SocketAddr,
    video: UdpSocket,
    outbound: mpsc::Sender<ControlMessage>,
    inbound: Mutex<mpsc::Receiver<ControlMessage>>,
    shutdown: CancellationToken,
}

impl NetTransport {
    pub async fn connect(target: &ConnectTarget) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(target.address()).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let unspecified = match peer.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let video = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;

        let (mut net_writer, mut net_reader) = Framed::new(stream, ControlCodec::default()).split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ControlMessage>(CHANNEL_DEPTH);
        let (inbound_tx, inbound) = mpsc::channel::<ControlMessage>(CHANNEL_DEPTH);
        let shutdown = CancellationToken::new();

        // Client -> host
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = net_writer.send(message).await {
                    warn!(error = %e, "control write failed");
                    break;
                }
            }
        });

        // Host -> client
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    next = net_reader.next() => next,
                };
                match next {
                    Some(Ok(message)) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "control read failed");
                        break;
                    }
                    None => {
                        debug!("control stream closed by host");
                        break;
                    }
                }
            }
        });

        debug!(%peer, video_port = video.local_addr()?.port(), "control stream connected");
        Ok(Self {
            peer,
            video,
            outbound,
            inbound: Mutex::new(inbound),
            shutdown,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn video_port(&self) -> Result<u16, TransportError> {
        Ok(self.video.local_addr()?.port())
    }

    async fn next_inbound(&self) -> Result<ControlMessage, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn login(&self, request: &LoginRequest) -> Result<VideoProfile, TransportError> {
        self.outbound
            .send(ControlMessage::Hello {
                version: PROTOCOL_VERSION,
                login: request.clone(),
                video_port: self.video_port()?,
            })
            .await?;

        match self.next_inbound().await? {
            ControlMessage::LoginAccepted { profile } => Ok(profile),
            ControlMessage::LoginRejected {
                reason: QuitReason::AuthRejected,
            } => Err(TransportError::AuthRejected),
            ControlMessage::LoginRejected { reason } => Err(TransportError::SessionRefused(reason)),
            ControlMessage::Goodbye => Err(TransportError::Disconnected),
            other => Err(TransportError::Protocol(format!(
                "unexpected message during login: {other:?}"
            ))),
        }
    }

    async fn recv_fragment(&self) -> Result<VideoFragment, TransportError> {
        loop {
            // One spare byte tells an exact fit from a cut-off datagram.
            let mut buf = BytesMut::zeroed(MAX_DATAGRAM + 1);
            let (len, from) = self.video.recv_from(&mut buf).await?;
            if from.ip() != self.peer.ip() {
                trace!(%from, "ignoring datagram from unknown sender");
                continue;
            }
            if len > MAX_DATAGRAM {
                trace!(%from, max = MAX_DATAGRAM, "dropping oversized video datagram");
                continue;
            }
            buf.truncate(len);
            match VideoFragment::from_datagram(buf.freeze()) {
                Ok(fragment) => return Ok(fragment),
                Err(e) => trace!(error = %e, "malformed video datagram"),
            }
        }
    }

    async fn recv_host_message(&self) -> Result<HostMessage, TransportError> {
        loop {
            match self.next_inbound().await? {
                ControlMessage::Host(message) => return Ok(message),
                ControlMessage::Goodbye => return Err(TransportError::Disconnected),
                other => trace!(?other, "ignoring control message"),
            }
        }
    }

    async fn send_controller_state(&self, state: &ControllerState) -> Result<(), TransportError> {
        Ok(self.outbound.send(ControlMessage::Controller(*state)).await?)
    }

    async fn request_recovery(&self, request: RecoveryRequest) -> Result<(), TransportError> {
        Ok(self.outbound.send(ControlMessage::Recovery(request)).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.outbound.send(ControlMessage::Goodbye).await;
        self.shutdown.cancel();
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn host_listener() -> (TcpListener, ConnectTarget) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = ConnectTarget::new(&format!("127.0.0.1:{port}"), &[7u8; 16]).unwrap();
        (listener, target)
    }

    fn login_request() -> LoginRequest {
        LoginRequest {
            credential: [7u8; 16],
            target: Default::default(),
            profile: VideoProfile::default(),
        }
    }

    #[tokio::test]
    async fn login_stream_and_goodbye() {
        let (listener, target) = host_listener().await;

        let host = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, ControlCodec::default());
            let Some(Ok(ControlMessage::Hello { login, video_port, .. })) = framed.next().await
            else {
                panic!("expected hello");
            };
            assert_eq!(login.credential, [7u8; 16]);
            framed
                .send(ControlMessage::LoginAccepted {
                    profile: login.profile,
                })
                .await
                .unwrap();

            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            for frag in VideoFragment::split(1, b"keyframe", 1400).unwrap() {
                udp.send_to(&frag.to_datagram(), SocketAddr::new(peer.ip(), video_port))
                    .await
                    .unwrap();
            }
            framed
                .send(ControlMessage::Host(HostMessage::Rumble { left: 3, right: 4 }))
                .await
                .unwrap();

            let mut seen = Vec::new();
            while let Some(Ok(msg)) = framed.next().await {
                let done = msg == ControlMessage::Goodbye;
                seen.push(msg);
                if done {
                    break;
                }
            }
            seen
        });

        let transport = NetConnector.connect(&target).await.unwrap();
        let profile = transport.login(&login_request()).await.unwrap();
        assert_eq!(profile, VideoProfile::default());

        let frag = tokio::time::timeout(Duration::from_secs(2), transport.recv_fragment())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&frag.payload[..], b"keyframe");
        assert_eq!(
            transport.recv_host_message().await.unwrap(),
            HostMessage::Rumble { left: 3, right: 4 }
        );

        let state = ControllerState::new().with_triggers(255, 0);
        transport.send_controller_state(&state).await.unwrap();
        transport.close().await.unwrap();

        let seen = host.await.unwrap();
        assert_eq!(
            seen,
            vec![ControlMessage::Controller(state), ControlMessage::Goodbye]
        );
    }

    #[tokio::test]
    async fn oversized_datagram_is_dropped() {
        let (listener, target) = host_listener().await;

        let host = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, ControlCodec::default());
            let Some(Ok(ControlMessage::Hello { login, video_port, .. })) = framed.next().await
            else {
                panic!("expected hello");
            };
            framed
                .send(ControlMessage::LoginAccepted {
                    profile: login.profile,
                })
                .await
                .unwrap();

            let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let to = SocketAddr::new(peer.ip(), video_port);
            let oversized = VideoFragment {
                frame_index: 1,
                fragment_index: 0,
                fragment_count: 1,
                payload: vec![0xAB; 2000].into(),
            };
            udp.send_to(&oversized.to_datagram(), to).await.unwrap();
            for frag in VideoFragment::split(2, b"fits", 1400).unwrap() {
                udp.send_to(&frag.to_datagram(), to).await.unwrap();
            }
            // Keep the control stream open until the client is done.
            let _ = framed.next().await;
        });

        let transport = NetConnector.connect(&target).await.unwrap();
        transport.login(&login_request()).await.unwrap();

        let frag = tokio::time::timeout(Duration::from_secs(2), transport.recv_fragment())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frag.frame_index, 2);
        assert_eq!(&frag.payload[..], b"fits");

        transport.close().await.unwrap();
        host.await.unwrap();
    }

    #[tokio::test]
    async fn login_rejections_are_classified() {
        for (reason, auth) in [
            (QuitReason::AuthRejected, true),
            (QuitReason::SessionRequestRpInUse, false),
        ] {
            let (listener, target) = host_listener().await;
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                let mut framed = Framed::new(stream, ControlCodec::default());
                let _hello = framed.next().await;
                framed
                    .send(ControlMessage::LoginRejected { reason })
                    .await
                    .unwrap();
            });

            let transport = NetConnector.connect(&target).await.unwrap();
            match transport.login(&login_request()).await {
                Err(TransportError::AuthRejected) => assert!(auth),
                Err(TransportError::SessionRefused(r)) => {
                    assert!(!auth);
                    assert_eq!(r, reason);
                }
                other => panic!("unexpected login outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn refused_connect_is_io_error() {
        let (listener, target) = host_listener().await;
        drop(listener);
        let err = NetConnector.connect(&target).await.err().unwrap();
        assert_eq!(err.connect_reason(), QuitReason::CtrlConnectionRefused);
    }
}
