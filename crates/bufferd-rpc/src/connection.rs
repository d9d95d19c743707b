//! A framed TCP connection with a dedicated writer task.
//!
//! Outbound messages are queued on an unbounded channel and written in order
//! by the writer task, so senders never block. The read half is handed back to
//! the caller, which runs its own receiver loop over it.

use std::fmt;
use std::net::SocketAddr;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::sender::{MessageSender, Outbound};
use crate::transport::MessageCodec;

/// Inbound half of a connection.
pub type FrameStream = SplitStream<Framed<TcpStream, MessageCodec>>;

/// Lifecycle of an endpoint's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Disconnecting,
}

/// Unique id of one connection, used in logs and as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write side of an open connection.
///
/// Dropping it flushes every queued message and shuts the socket's write
/// half down.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    sender: MessageSender,
}

impl Connection {
    /// Frame `stream`, start its writer task and return the read half.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(stream: TcpStream) -> (Self, FrameStream) {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Cannot disable Nagle on {:?}: {}", peer, e);
        }

        let framed = Framed::new(stream, MessageCodec::new());
        let (mut sink, frames) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let id = ConnectionId::new();

        let writer_id = id.clone();
        tokio::spawn(async move {
            trace!("[{}] writer started", writer_id);
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Frame(message) => {
                        trace!("[{}] sending {}", writer_id, message.verb());
                        if let Err(e) = sink.send(message).await {
                            warn!("[{}] write failed: {}", writer_id, e);
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            if let Err(e) = sink.close().await {
                trace!("[{}] close failed: {}", writer_id, e);
            }
            trace!("[{}] writer ended", writer_id);
        });

        debug!("[{}] connection opened to {:?}", id, peer);
        let connection = Self {
            id,
            peer,
            sender: MessageSender::new(tx),
        };
        (connection, frames)
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[must_use]
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.sender.close();
        debug!("[{}] connection closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Message;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (a, b) = pair().await;
        let (connection, _frames) = Connection::open(a);
        let (_peer, mut peer_frames) = Connection::open(b);

        connection.sender().accepted().unwrap();
        connection.sender().get("AI").unwrap();

        assert_eq!(
            peer_frames.next().await.unwrap().unwrap(),
            Message::Accepted {}
        );
        assert_eq!(
            peer_frames.next().await.unwrap().unwrap(),
            Message::Get {
                name: "AI".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_drop_flushes_then_closes() {
        let (a, b) = pair().await;
        let (connection, frames) = Connection::open(a);
        let (_peer, mut peer_frames) = Connection::open(b);

        connection.sender().disconnect().unwrap();
        drop(connection);
        drop(frames);

        assert_eq!(
            peer_frames.next().await.unwrap().unwrap(),
            Message::Disconnect {}
        );
        assert!(peer_frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_drop_fails() {
        let (a, _b) = pair().await;
        let (connection, _frames) = Connection::open(a);
        let sender = connection.sender().clone();
        drop(connection);

        // The writer exits once it sees the close marker.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(sender.accepted().is_err());
    }
}
