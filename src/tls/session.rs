//! Live session I/O.

use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

/// One unit received from the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Application payload.
    Data(Vec<u8>),
    /// Control traffic (ping/pong). Proves the peer is alive; carries no payload.
    Activity,
}

/// Byte-frame I/O over an established session.
///
/// The supervisor's session task is the only user; it owns the value and
/// drops it on teardown, which releases the transport and TLS state.
pub trait SessionIo: Send + 'static {
    /// Send one payload frame and flush it.
    fn send(&mut self, bytes: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next frame. `Ok(None)` means the peer closed the session.
    ///
    /// Must be cancel-safe.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Frame>>> + Send;

    /// Send a keepalive ping.
    fn ping(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Close gracefully, best effort.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket session over any byte stream (TLS in production).
pub struct WsSession<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsSession<S> {
    /// Wrap an upgraded WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// Unwrap the WebSocket stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.ws
    }
}

impl<S> SessionIo for WsSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, bytes: Vec<u8>) -> io::Result<()> {
        trace!("Sending {} byte frame", bytes.len());
        self.ws.send(Message::Binary(bytes)).await.map_err(ws_to_io)
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        match self.ws.next().await {
            None => Ok(None),
            Some(Ok(Message::Binary(bytes))) => Ok(Some(Frame::Data(bytes))),
            Some(Ok(Message::Text(text))) => Ok(Some(Frame::Data(text.into_bytes()))),
            Some(Ok(Message::Close(frame))) => {
                debug!("Peer sent close: {:?}", frame);
                Ok(None)
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                Ok(Some(Frame::Activity))
            }
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Ok(None),
            Some(Err(e)) => Err(ws_to_io(e)),
        }
    }

    async fn ping(&mut self) -> io::Result<()> {
        self.ws.send(Message::Ping(Vec::new())).await.map_err(ws_to_io)
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Close handshake incomplete: {}", e);
        }
    }
}

fn ws_to_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::NotConnected, e.to_string())
        }
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn pair() -> (WsSession<tokio::io::DuplexStream>, WebSocketStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(4096);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WsSession::new(client), server)
    }

    #[tokio::test]
    async fn test_send_is_binary() {
        let (mut session, mut server) = pair().await;
        session.send(b"hello".to_vec()).await.unwrap();

        let msg = server.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Binary(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_recv_text_and_binary_as_data() {
        let (mut session, mut server) = pair().await;
        server.send(Message::Text("hi".into())).await.unwrap();
        server.send(Message::Binary(vec![1, 2, 3])).await.unwrap();

        assert_eq!(session.recv().await.unwrap(), Some(Frame::Data(b"hi".to_vec())));
        assert_eq!(session.recv().await.unwrap(), Some(Frame::Data(vec![1, 2, 3])));
    }

    #[tokio::test]
    async fn test_ping_pong_is_activity() {
        let (mut session, mut server) = pair().await;
        session.ping().await.unwrap();

        // Server sees the ping; reading it queues the pong
        assert!(matches!(server.next().await, Some(Ok(Message::Ping(_)))));
        server.flush().await.unwrap();

        assert_eq!(session.recv().await.unwrap(), Some(Frame::Activity));
    }

    #[tokio::test]
    async fn test_remote_close_is_none() {
        let (mut session, mut server) = pair().await;
        server.close(None).await.unwrap();

        assert_eq!(session.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_transport_is_end() {
        let (mut session, server) = pair().await;
        drop(server);

        // Abrupt EOF surfaces either as a clean end or a transport error
        match session.recv().await {
            Ok(None) | Err(_) => {}
            Ok(Some(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }
}
