//! TCP transport
//!
//! Frame codec, listener, dialing, the handshake exchange, and the
//! per-connection reader and writer tasks.

use crate::network::message::{
    major_version, Frame, Handshake, MAGIC, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
use crate::network::peer::PeerHandle;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Frames queued per peer before writers push back
const WRITE_QUEUE: usize = 256;

/// Errors establishing a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Failed to dial {peer_uri}: {reason}")]
    DialFailure { peer_uri: String, reason: String },
    #[error("Handshake with {peer_uri} timed out")]
    HandshakeTimeout { peer_uri: String },
    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch { ours: String, theirs: String },
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("Refusing to connect to ourselves")]
    SelfConnection,
    #[error("Bridge is shut down")]
    BridgeClosed,
}

/// Length-prefixed frame codec: magic (4) + length (4, big endian) + JSON body
#[derive(Debug)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Frame of {} bytes exceeds limit", data.len()),
            ));
        }

        dst.reserve(8 + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 8 {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid magic bytes",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Frame of {} bytes exceeds limit", len),
            ));
        }

        if src.len() < 8 + len {
            src.reserve(8 + len - src.len());
            return Ok(None);
        }

        src.advance(8);
        let data = src.split_to(len);

        let frame = Frame::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(frame))
    }
}

pub type FramedStream = Framed<TcpStream, FrameCodec>;

/// TCP listener for inbound peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `host:port`; port 0 picks an ephemeral port
    pub async fn bind(host: &str, port: u16) -> Result<Self, io::Error> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Bridge listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), io::Error> {
        self.listener.accept().await
    }
}

/// Open a TCP connection to `host:port`
pub async fn dial(peer_uri: &str, connect_timeout: Duration) -> Result<TcpStream, ConnectionError> {
    let failure = |reason: String| ConnectionError::DialFailure {
        peer_uri: peer_uri.to_string(),
        reason,
    };

    match tokio::time::timeout(connect_timeout, TcpStream::connect(peer_uri)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(e)) => Err(failure(e.to_string())),
        Err(_) => Err(failure(format!(
            "connect timed out after {}ms",
            connect_timeout.as_millis()
        ))),
    }
}

/// Validate a remote handshake against our own identity
pub fn check_handshake(theirs: &Handshake, local_id: &str) -> Result<(), ConnectionError> {
    if !theirs.is_compatible() {
        return Err(ConnectionError::VersionMismatch {
            ours: PROTOCOL_VERSION.to_string(),
            theirs: theirs.version.clone(),
        });
    }

    if theirs.instance_id == local_id {
        return Err(ConnectionError::SelfConnection);
    }

    match theirs.verify() {
        Ok(true) => Ok(()),
        Ok(false) => Err(ConnectionError::HandshakeRejected(format!(
            "bad signature from {}",
            theirs.instance_id
        ))),
        Err(e) => Err(ConnectionError::HandshakeRejected(e.to_string())),
    }
}

async fn next_frame(
    framed: &mut FramedStream,
    peer_uri: &str,
    timeout: Duration,
) -> Result<Frame, ConnectionError> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(Ok(frame))) => Ok(frame),
        Ok(Some(Err(e))) => Err(ConnectionError::HandshakeRejected(e.to_string())),
        Ok(None) => Err(ConnectionError::HandshakeRejected(format!(
            "{} closed the connection",
            peer_uri
        ))),
        Err(_) => Err(ConnectionError::HandshakeTimeout {
            peer_uri: peer_uri.to_string(),
        }),
    }
}

async fn reject(framed: &mut FramedStream, error: &ConnectionError) {
    let frame = Frame::HandshakeReject {
        reason: error.to_string(),
        version: PROTOCOL_VERSION.to_string(),
    };
    if let Err(e) = framed.send(frame).await {
        log::debug!("Failed to send handshake rejection: {}", e);
    }
}

/// Dialer side: send our handshake, then wait for theirs
pub async fn handshake_outbound(
    stream: TcpStream,
    peer_uri: &str,
    ours: Handshake,
    local_id: &str,
    timeout: Duration,
) -> Result<(FramedStream, Handshake), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec);
    let our_version = ours.version.clone();

    framed
        .send(Frame::Handshake(ours))
        .await
        .map_err(|e| ConnectionError::DialFailure {
            peer_uri: peer_uri.to_string(),
            reason: e.to_string(),
        })?;
    log::debug!("Sent handshake to {}", peer_uri);

    match next_frame(&mut framed, peer_uri, timeout).await? {
        Frame::Handshake(theirs) => {
            if let Err(e) = check_handshake(&theirs, local_id) {
                reject(&mut framed, &e).await;
                return Err(e);
            }
            Ok((framed, theirs))
        }
        Frame::HandshakeReject { reason, version } => {
            // The listener states its own version; compare with what we offered
            if major_version(&version) == major_version(&our_version) {
                Err(ConnectionError::HandshakeRejected(reason))
            } else {
                Err(ConnectionError::VersionMismatch {
                    ours: our_version,
                    theirs: version,
                })
            }
        }
        other => Err(ConnectionError::HandshakeRejected(format!(
            "expected handshake, got {}",
            other.type_name()
        ))),
    }
}

/// Listener side: wait for the dialer's handshake, validate, then answer
pub async fn handshake_inbound(
    stream: TcpStream,
    remote: SocketAddr,
    ours: Handshake,
    local_id: &str,
    timeout: Duration,
) -> Result<(FramedStream, Handshake), ConnectionError> {
    let mut framed = Framed::new(stream, FrameCodec);
    let peer_uri = remote.to_string();

    let theirs = match next_frame(&mut framed, &peer_uri, timeout).await? {
        Frame::Handshake(theirs) => theirs,
        other => {
            let e = ConnectionError::HandshakeRejected(format!(
                "expected handshake, got {}",
                other.type_name()
            ));
            reject(&mut framed, &e).await;
            return Err(e);
        }
    };

    if let Err(e) = check_handshake(&theirs, local_id) {
        log::warn!("Rejected handshake from {}: {}", peer_uri, e);
        if e == ConnectionError::SelfConnection {
            // Answer so the dialer sees its own id and fails the same way
            let _ = framed.send(Frame::Handshake(ours)).await;
        } else {
            reject(&mut framed, &e).await;
        }
        return Err(e);
    }

    framed
        .send(Frame::Handshake(ours))
        .await
        .map_err(|e| ConnectionError::HandshakeRejected(e.to_string()))?;

    Ok((framed, theirs))
}

/// What a connection's reader reports to the event loop
#[derive(Debug)]
pub enum ConnectionEvent {
    Frame {
        peer_id: String,
        session: u64,
        frame: Frame,
    },
    Closed {
        peer_id: String,
        session: u64,
        reason: String,
    },
}

/// Start the reader and writer tasks for an established connection
pub fn spawn_connection(
    framed: FramedStream,
    peer_id: &str,
    session: u64,
    events: mpsc::Sender<ConnectionEvent>,
) -> (PeerHandle, Vec<AbortHandle>) {
    let (mut writer, mut reader) = framed.split();
    let (tx, mut rx) = mpsc::channel::<Frame>(WRITE_QUEUE);
    let handle = PeerHandle {
        peer_id: peer_id.to_string(),
        tx,
    };

    let write_peer = peer_id.to_string();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send(frame).await {
                log::warn!("Error writing to {}: {}", write_peer, e);
                break;
            }
        }
    });

    let read_peer = peer_id.to_string();
    let read_task = tokio::spawn(async move {
        let reason = loop {
            match reader.next().await {
                Some(Ok(frame)) => {
                    let event = ConnectionEvent::Frame {
                        peer_id: read_peer.clone(),
                        session,
                        frame,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Error reading from {}: {}", read_peer, e);
                    break e.to_string();
                }
                None => {
                    log::info!("Peer {} disconnected", read_peer);
                    break "connection closed".to_string();
                }
            }
        };

        let _ = events
            .send(ConnectionEvent::Closed {
                peer_id: read_peer,
                session,
                reason,
            })
            .await;
    });

    (handle, vec![read_task.abort_handle(), write_task.abort_handle()])
}
