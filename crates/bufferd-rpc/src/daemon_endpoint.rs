//! Daemon side of one client connection.
//!
//! The endpoint decodes requests, runs them against a
//! [`ClientRequestExecutionStrategy`] and writes the answers. It also keeps
//! the connection's one-shot subscriptions: a `get` arms a buffer name, the
//! next change of that buffer is pushed once and disarms it.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bufferd_types::{BufferConfiguration, BufferDescription, SimpleData};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionId, FrameStream};
use crate::error::{Error, Result};
use crate::protocol::{
    Message, PROTOCOL_VERSION, REASON_ILLEGAL_VERSION, REASON_UNKNOWN_ACTOR, REASON_UNKNOWN_BUFFER,
    REASON_WRONG_CONFIGURATION,
};
use crate::sender::MessageSender;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What the daemon does with client requests.
///
/// Methods are called on the connection's receiver task and must not block
/// for long.
pub trait ClientRequestExecutionStrategy: Send + Sync {
    /// The connection is gone; called exactly once per endpoint.
    fn connection_died(&self, connection: &ConnectionId);

    /// The client asked the daemon to stop.
    fn shutdown(&self, connection: &ConnectionId);

    fn buffer_exists(&self, name: &str) -> bool;

    fn query_buffers_by_name(&self, name: &str) -> BTreeSet<String>;

    fn query_buffers_by_metainfo(&self, topic: &str, metainfo: &str) -> BTreeSet<String>;

    fn buffer_configuration(&self, name: &str) -> Option<BufferConfiguration>;

    fn is_hardware_buffer(&self, name: &str) -> bool;

    /// Create or replace a buffer; `false` if the request is refused.
    fn set_buffer_configuration(
        &self,
        name: &str,
        configuration: BufferConfiguration,
        create: bool,
    ) -> bool;

    fn buffer_value(&self, name: &str) -> Option<SimpleData>;

    /// Write an actor value. `None` if there is no such actor buffer.
    fn set_buffer_value(&self, name: &str, value: f64) -> Option<SimpleData>;

    fn remove_buffer(&self, name: &str) -> bool;
}

enum Flow {
    Continue,
    Close,
}

struct ActiveLink {
    connection: Connection,
    receiver: JoinHandle<()>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

struct Inner {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    strategy: Arc<dyn ClientRequestExecutionStrategy>,
    subscriptions: Mutex<HashSet<String>>,
    link: Mutex<Option<ActiveLink>>,
    grace: Duration,
}

/// One accepted client connection. Clones share the connection.
#[derive(Clone)]
pub struct DaemonEndpoint {
    inner: Arc<Inner>,
}

impl DaemonEndpoint {
    /// Take over an accepted socket and start serving it.
    ///
    /// `grace` is the pause between sending `disconnect` and closing.
    pub fn accept(
        stream: TcpStream,
        strategy: Arc<dyn ClientRequestExecutionStrategy>,
        grace: Duration,
    ) -> Self {
        let (connection, frames) = Connection::open(stream);
        let sender = connection.sender().clone();
        let inner = Arc::new(Inner {
            id: connection.id().clone(),
            peer: connection.peer(),
            strategy,
            subscriptions: Mutex::new(HashSet::new()),
            link: Mutex::new(None),
            grace,
        });

        {
            let mut link = lock(&inner.link);
            let receiver = tokio::spawn(receive_loop(inner.clone(), sender, frames));
            *link = Some(ActiveLink {
                connection,
                receiver,
            });
        }

        info!("[{}] client connected from {:?}", inner.id, inner.peer);
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).is_some()
    }

    #[must_use]
    pub fn is_subscribed(&self, name: &str) -> bool {
        lock(&self.inner.subscriptions).contains(name)
    }

    /// Push `value` if its buffer has an armed subscription, disarming it.
    pub fn spontaneous_value_change(&self, value: &SimpleData) {
        if !lock(&self.inner.subscriptions).remove(value.buffer_name()) {
            return;
        }

        let sender = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.connection.sender().clone());
        if let Some(sender) = sender
            && let Err(e) = sender.push(value, true)
        {
            debug!("[{}] push of {} dropped: {}", self.inner.id, value, e);
        }
    }

    /// Tell the client goodbye, wait the grace period and close.
    pub async fn disconnect(&self) {
        let sender = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.connection.sender().clone());
        let Some(sender) = sender else {
            return;
        };

        if sender.disconnect().is_ok() {
            tokio::time::sleep(self.inner.grace).await;
        }
        self.inner.disconnect_immediately();
    }

    /// Close without saying goodbye.
    pub fn disconnect_immediately(&self) {
        self.inner.disconnect_immediately();
    }
}

impl Inner {
    fn disconnect_immediately(&self) {
        let Some(link) = lock(&self.link).take() else {
            return;
        };
        lock(&self.subscriptions).clear();
        info!("[{}] client disconnected", self.id);
        drop(link);
        self.strategy.connection_died(&self.id);
    }

    fn handle(&self, sender: &MessageSender, message: Message) -> Result<Flow> {
        trace!("[{}] received {}", self.id, message.verb());
        let strategy = &self.strategy;

        match message {
            Message::Establish { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        "[{}] protocol version {} is not supported, expected {}",
                        self.id, version, PROTOCOL_VERSION
                    );
                    sender.rejected(REASON_ILLEGAL_VERSION)?;
                    return Ok(Flow::Close);
                }
                sender.accepted()?;
            }
            Message::Disconnect {} => {
                debug!("[{}] client says goodbye", self.id);
                return Ok(Flow::Close);
            }
            Message::Shutdown {} => strategy.shutdown(&self.id),
            Message::QueryBufferByName { name } => {
                sender.buffer_names(strategy.query_buffers_by_name(&name))?;
            }
            Message::QueryBufferByMetainfo { topic, metainfo } => {
                sender.buffer_names(strategy.query_buffers_by_metainfo(&topic, &metainfo))?;
            }
            Message::QueryMetainfo { name } => match strategy.buffer_configuration(&name) {
                Some(configuration) => {
                    let is_hardware = strategy.is_hardware_buffer(&name);
                    sender.buffer_metainfo(BufferDescription {
                        name,
                        is_hardware,
                        metainfo: configuration.metainfo,
                    })?;
                }
                None => sender.rejected(REASON_UNKNOWN_BUFFER)?,
            },
            Message::GetBufferConfiguration { name } => match strategy.buffer_configuration(&name) {
                Some(configuration) => sender.buffer_configuration(configuration)?,
                None => sender.rejected(REASON_UNKNOWN_BUFFER)?,
            },
            Message::SetBufferConfiguration {
                name,
                configuration,
                create,
            } => {
                if strategy.set_buffer_configuration(&name, configuration, create) {
                    sender.accepted()?;
                } else {
                    sender.rejected(REASON_WRONG_CONFIGURATION)?;
                }
            }
            Message::ReleaseBuffer { name } => {
                if strategy.remove_buffer(&name) {
                    sender.accepted()?;
                } else {
                    sender.rejected(REASON_UNKNOWN_BUFFER)?;
                }
            }
            Message::GetImmediate { name } => match strategy.buffer_value(&name) {
                Some(value) => sender.push(&value, false)?,
                None => sender.rejected(REASON_UNKNOWN_BUFFER)?,
            },
            Message::Get { name } => {
                if strategy.buffer_exists(&name) {
                    lock(&self.subscriptions).insert(name);
                } else {
                    debug!("[{}] ignoring subscription to unknown '{}'", self.id, name);
                }
            }
            Message::Set { name, value } => match strategy.set_buffer_value(&name, value) {
                Some(value) => sender.push(&value, false)?,
                None => sender.rejected(REASON_UNKNOWN_ACTOR)?,
            },
            reply @ (Message::Accepted {}
            | Message::Rejected { .. }
            | Message::BufferNames { .. }
            | Message::BufferMetainfo(_)
            | Message::BufferConfiguration { .. }
            | Message::Push(_)) => {
                return Err(Error::protocol(format!(
                    "client sent '{}'",
                    reply.verb()
                )));
            }
        }

        Ok(Flow::Continue)
    }
}

async fn receive_loop(inner: Arc<Inner>, sender: MessageSender, mut frames: FrameStream) {
    while let Some(frame) = frames.next().await {
        let outcome = match frame {
            Ok(message) => inner.handle(&sender, message),
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                warn!("[{}] {}", inner.id, e);
                break;
            }
        }
    }
    inner.disconnect_immediately();
}
