//! Client side of the protocol.
//!
//! A [`ClientEndpoint`] owns at most one connection to the daemon. Requests
//! are serialized: a caller takes the request lock, arms the single answer
//! slot, sends, and waits for the receiver task to hand over the reply.
//! Spontaneous pushes bypass the slot and go to a distributor task that calls
//! the registered [`ValueChangeObserver`]s.
//!
//! Any transport error, protocol violation or missed hand-off tears the
//! connection down. The next operation reconnects.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use bufferd_types::{BufferConfiguration, BufferDescription, SimpleData};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, ConnectionState, FrameStream};
use crate::error::{Error, Result};
use crate::protocol::Message;
use crate::sender::MessageSender;
use crate::settings::CommunicationSettings;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives buffer values pushed by the daemon.
pub trait ValueChangeObserver: Send + Sync {
    /// A subscribed buffer changed. Called on the distributor task.
    fn value_changed(&self, value: &SimpleData);

    /// The connection to the daemon was lost.
    fn communication_lost(&self) {}
}

/// Handle returned by [`ClientEndpoint::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

#[derive(Debug)]
enum Answer {
    Accepted,
    Rejected(Option<String>),
    BufferNames(Vec<String>),
    Metainfo(BufferDescription),
    Configuration(BufferConfiguration),
    Value(SimpleData),
}

impl Answer {
    fn kind(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected(_) => "rejected",
            Self::BufferNames(_) => "bufferNames",
            Self::Metainfo(_) => "bufferMetainfo",
            Self::Configuration(_) => "bufferConfiguration",
            Self::Value(_) => "push",
        }
    }
}

/// Single-slot hand-off between the receiver task and the waiting caller.
#[derive(Default)]
struct AnswerSlot {
    waiter: StdMutex<Option<oneshot::Sender<Answer>>>,
    armed: Notify,
}

impl AnswerSlot {
    fn arm(&self) -> oneshot::Receiver<Answer> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.waiter) = Some(tx);
        self.armed.notify_one();
        rx
    }

    fn disarm(&self) {
        lock(&self.waiter).take();
    }

    /// Hand `answer` to the armed caller, waiting at most `bound` for one.
    async fn deliver(&self, answer: Answer, bound: Duration) -> bool {
        let deadline = Instant::now() + bound;
        loop {
            let waiter = lock(&self.waiter).take();
            if let Some(tx) = waiter {
                return tx.send(answer).is_ok();
            }
            if tokio::time::timeout_at(deadline, self.armed.notified())
                .await
                .is_err()
            {
                return false;
            }
        }
    }
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

struct Link {
    state: ConnectionState,
    generation: u64,
    active: Option<ActiveLink>,
}

#[derive(Default)]
struct Observers {
    next_id: u64,
    registered: BTreeMap<ObserverId, Arc<dyn ValueChangeObserver>>,
}

struct Inner {
    settings: CommunicationSettings,
    request_lock: Mutex<()>,
    link: StdMutex<Link>,
    slot: AnswerSlot,
    observers: StdMutex<Observers>,
}

impl Inner {
    fn current(&self) -> Option<(MessageSender, u64)> {
        let link = lock(&self.link);
        match (&link.active, link.state) {
            (Some(active), ConnectionState::Connected) => {
                Some((active.connection.sender().clone(), link.generation))
            }
            _ => None,
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn ValueChangeObserver>> {
        lock(&self.observers).registered.values().cloned().collect()
    }

    /// Drop the connection of `generation` without telling the daemon.
    fn disconnect_immediately(&self, generation: u64) {
        let active = {
            let mut link = lock(&self.link);
            if link.generation != generation || link.active.is_none() {
                return;
            }
            link.state = ConnectionState::Disconnected;
            link.active.take()
        };

        self.slot.disarm();
        if let Some(active) = active {
            info!("[{}] disconnected from the daemon", active.connection.id());
            drop(active);
        }

        for observer in self.observer_snapshot() {
            observer.communication_lost();
        }
    }
}

/// The process's connection to the daemon.
///
/// All operations connect on demand. A failed operation leaves the endpoint
/// disconnected; there is no background reconnect.
pub struct ClientEndpoint {
    inner: Arc<Inner>,
}

static GLOBAL: OnceLock<ClientEndpoint> = OnceLock::new();

impl ClientEndpoint {
    #[must_use]
    pub fn new(settings: CommunicationSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                request_lock: Mutex::new(()),
                link: StdMutex::new(Link {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    active: None,
                }),
                slot: AnswerSlot::default(),
                observers: StdMutex::new(Observers::default()),
            }),
        }
    }

    /// The process-wide endpoint, configured from the environment.
    pub fn global() -> &'static ClientEndpoint {
        GLOBAL.get_or_init(|| Self::new(CommunicationSettings::from_env()))
    }

    #[must_use]
    pub fn settings(&self) -> &CommunicationSettings {
        &self.inner.settings
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.link).state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the connection if it is not open yet.
    ///
    /// # Errors
    ///
    /// Fails if the daemon is unreachable, does not answer the handshake, or
    /// rejects the protocol version.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.request_lock.lock().await;
        self.ensure_connected().await.map(|_| ())
    }

    /// Say goodbye to the daemon and close the connection.
    pub async fn disconnect(&self) {
        let _guard = self.inner.request_lock.lock().await;
        let Some((sender, generation)) = self.inner.current() else {
            return;
        };

        lock(&self.inner.link).state = ConnectionState::Disconnecting;
        if sender.disconnect().is_ok() {
            tokio::time::sleep(self.inner.settings.disconnect_grace).await;
        }
        self.inner.disconnect_immediately(generation);
    }

    /// Names of all buffers whose name matches the regex `name`.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn query_buffers_by_name(&self, name: &str) -> Result<BTreeSet<String>> {
        match self.request(|s| s.query_buffer_by_name(name)).await? {
            (Answer::BufferNames(names), _) => Ok(names.into_iter().collect()),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Names of all buffers with a metainfo entry whose topic matches `topic`
    /// and whose value matches `metainfo`.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn query_buffers_by_metainfo(
        &self,
        topic: &str,
        metainfo: &str,
    ) -> Result<BTreeSet<String>> {
        match self
            .request(|s| s.query_buffer_by_metainfo(topic, metainfo))
            .await?
        {
            (Answer::BufferNames(names), _) => Ok(names.into_iter().collect()),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Description of a buffer, `None` if the daemon does not know it.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn buffer_metainfo(&self, name: &str) -> Result<Option<BufferDescription>> {
        match self.request(|s| s.query_metainfo(name)).await? {
            (Answer::Metainfo(description), _) => Ok(Some(description)),
            (Answer::Rejected(_), _) => Ok(None),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Configuration of a buffer, `None` if the daemon does not know it.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn buffer_configuration(&self, name: &str) -> Result<Option<BufferConfiguration>> {
        match self.request(|s| s.get_buffer_configuration(name)).await? {
            (Answer::Configuration(configuration), _) => Ok(Some(configuration)),
            (Answer::Rejected(_), _) => Ok(None),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Create or replace a buffer. Returns `false` if the daemon refused.
    ///
    /// With `create == false` only an existing buffer is reconfigured.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn set_buffer_configuration(
        &self,
        name: &str,
        configuration: &BufferConfiguration,
        create: bool,
    ) -> Result<bool> {
        match self
            .request(|s| s.set_buffer_configuration(name, configuration, create))
            .await?
        {
            (Answer::Accepted, _) => Ok(true),
            (Answer::Rejected(reason), _) => {
                debug!("Configuration of '{}' rejected: {:?}", name, reason);
                Ok(false)
            }
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Remove a buffer. Returns `false` if the daemon refused.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn release_buffer(&self, name: &str) -> Result<bool> {
        match self.request(|s| s.release_buffer(name)).await? {
            (Answer::Accepted, _) => Ok(true),
            (Answer::Rejected(_), _) => Ok(false),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Read the current value of a buffer, `None` if the daemon does not
    /// know it.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn get_immediate(&self, name: &str) -> Result<Option<SimpleData>> {
        match self.request(|s| s.get_immediate(name)).await? {
            (Answer::Value(value), _) => Ok(Some(value)),
            (Answer::Rejected(_), _) => Ok(None),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Write an actor value. Returns the buffer's value after the write, or
    /// `None` if the buffer is unknown or not an actor.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn set(&self, name: &str, value: f64) -> Result<Option<SimpleData>> {
        match self.request(|s| s.set(name, value)).await? {
            (Answer::Value(value), _) => Ok(Some(value)),
            (Answer::Rejected(_), _) => Ok(None),
            (other, generation) => self.unexpected(&other, generation),
        }
    }

    /// Ask for the next change of a buffer.
    ///
    /// Exactly one push follows; call again after it arrived to keep
    /// watching.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn get(&self, name: &str) -> Result<()> {
        let _guard = self.inner.request_lock.lock().await;
        let (sender, generation) = self.ensure_connected().await?;
        sender
            .get(name)
            .inspect_err(|_| self.inner.disconnect_immediately(generation))
    }

    /// Ask the daemon process to stop.
    ///
    /// # Errors
    ///
    /// Fails on any communication problem.
    pub async fn shutdown_daemon(&self) -> Result<()> {
        let _guard = self.inner.request_lock.lock().await;
        let (sender, generation) = self.ensure_connected().await?;
        sender
            .shutdown()
            .inspect_err(|_| self.inner.disconnect_immediately(generation))
    }

    pub fn add_observer(&self, observer: Arc<dyn ValueChangeObserver>) -> ObserverId {
        let mut observers = lock(&self.inner.observers);
        observers.next_id += 1;
        let id = ObserverId(observers.next_id);
        observers.registered.insert(id, observer);
        id
    }

    /// Unregister an observer. Removing the last one closes the connection.
    pub async fn remove_observer(&self, id: ObserverId) -> bool {
        let (removed, now_empty) = {
            let mut observers = lock(&self.inner.observers);
            let removed = observers.registered.remove(&id).is_some();
            (removed, observers.registered.is_empty())
        };

        if removed && now_empty {
            debug!("Last observer removed, closing the connection");
            self.disconnect().await;
        }
        removed
    }

    async fn request(
        &self,
        request: impl FnOnce(&MessageSender) -> Result<()>,
    ) -> Result<(Answer, u64)> {
        let _guard = self.inner.request_lock.lock().await;
        let (sender, generation) = self.ensure_connected().await?;
        let answer = self.exchange(&sender, generation, request).await?;
        Ok((answer, generation))
    }

    /// Send one request and wait for its answer. The request lock must be held.
    async fn exchange(
        &self,
        sender: &MessageSender,
        generation: u64,
        request: impl FnOnce(&MessageSender) -> Result<()>,
    ) -> Result<Answer> {
        let answer = self.inner.slot.arm();

        if let Err(e) = request(sender) {
            self.inner.slot.disarm();
            self.inner.disconnect_immediately(generation);
            return Err(e);
        }

        let timeout = self.inner.settings.answer_timeout;
        match tokio::time::timeout(timeout, answer).await {
            Ok(Ok(answer)) => {
                trace!("Received {}", answer.kind());
                Ok(answer)
            }
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.inner.slot.disarm();
                warn!("No answer within {:?}, dropping the connection", timeout);
                self.inner.disconnect_immediately(generation);
                Err(Error::Timeout)
            }
        }
    }

    /// Connect and shake hands unless already connected. The request lock
    /// must be held.
    async fn ensure_connected(&self) -> Result<(MessageSender, u64)> {
        if let Some(current) = self.inner.current() {
            return Ok(current);
        }

        let address = self.inner.settings.socket_addr();
        debug!("Connecting to the daemon at {}", address);
        let stream = TcpStream::connect(address).await?;
        let (connection, frames) = Connection::open(stream);
        let sender = connection.sender().clone();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut link = lock(&self.inner.link);
            link.generation += 1;
            let generation = link.generation;
            let receiver = tokio::spawn(receive_loop(
                Arc::downgrade(&self.inner),
                generation,
                frames,
                push_tx,
            ));
            link.active = Some(ActiveLink {
                connection,
                receiver,
            });
            link.state = ConnectionState::Connected;
            generation
        };
        tokio::spawn(distribute(Arc::downgrade(&self.inner), push_rx));

        match self
            .exchange(&sender, generation, MessageSender::establish)
            .await?
        {
            Answer::Accepted => {
                info!("Connected to the daemon at {}", address);
                Ok((sender, generation))
            }
            Answer::Rejected(reason) => {
                warn!("The daemon rejected the connection: {:?}", reason);
                self.inner.disconnect_immediately(generation);
                Err(Error::VersionRejected(reason))
            }
            other => {
                self.inner.disconnect_immediately(generation);
                Err(Error::UnexpectedAnswer(other.kind()))
            }
        }
    }

    fn unexpected<T>(&self, answer: &Answer, generation: u64) -> Result<T> {
        warn!(
            "Protocol violation: unexpected '{}' answer, dropping the connection",
            answer.kind()
        );
        self.inner.disconnect_immediately(generation);
        Err(Error::UnexpectedAnswer(answer.kind()))
    }
}

async fn receive_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut frames: FrameStream,
    pushes: mpsc::UnboundedSender<SimpleData>,
) {
    while let Some(frame) = frames.next().await {
        let Some(endpoint) = inner.upgrade() else {
            return;
        };

        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                warn!("Reading from the daemon failed: {}", e);
                endpoint.disconnect_immediately(generation);
                return;
            }
        };

        let answer = match message {
            Message::Push(push) => {
                let data = match push.to_data() {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("Protocol violation: {}", e);
                        endpoint.disconnect_immediately(generation);
                        return;
                    }
                };
                if push.spontaneous {
                    trace!("Spontaneous push: {}", data);
                    let _ = pushes.send(data);
                    continue;
                }
                Answer::Value(data)
            }
            Message::Accepted {} => Answer::Accepted,
            Message::Rejected { reason } => Answer::Rejected(reason),
            Message::BufferNames { name } => Answer::BufferNames(name),
            Message::BufferMetainfo(description) => Answer::Metainfo(description),
            Message::BufferConfiguration { configuration } => Answer::Configuration(configuration),
            Message::Disconnect {} => {
                info!("The daemon closes the connection");
                endpoint.disconnect_immediately(generation);
                return;
            }
            other => {
                warn!("Protocol violation: the daemon sent '{}'", other.verb());
                endpoint.disconnect_immediately(generation);
                return;
            }
        };

        let bound = endpoint.settings.client_ready_timeout;
        if !endpoint.slot.deliver(answer, bound).await {
            warn!("No caller took the daemon's answer, dropping the connection");
            endpoint.disconnect_immediately(generation);
            return;
        }
    }

    if let Some(endpoint) = inner.upgrade() {
        debug!("The daemon closed the connection");
        endpoint.disconnect_immediately(generation);
    }
}

async fn distribute(inner: Weak<Inner>, mut pushes: mpsc::UnboundedReceiver<SimpleData>) {
    while let Some(data) = pushes.recv().await {
        let Some(endpoint) = inner.upgrade() else {
            break;
        };
        for observer in endpoint.observer_snapshot() {
            observer.value_changed(&data);
        }
    }
}
