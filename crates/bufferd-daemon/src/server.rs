//! TCP server: accepts clients and routes buffer changes to their endpoints.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bufferd_core::{
    Buffers, ConsumerId, Driver, GathererRegistry, HardwareDriver, SimpleData,
};
use bufferd_rpc::{
    ClientRequestExecutionStrategy, CommunicationSettings, ConnectionId, DaemonEndpoint,
};
use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{DaemonError, Result};
use crate::{lock, panic};

/// State shared between the server and its client endpoints.
pub(crate) struct Shared {
    pub(crate) buffers: Arc<Buffers>,
    pub(crate) stop: CancellationToken,
    connections: Mutex<HashMap<ConnectionId, DaemonEndpoint>>,
}

impl Shared {
    pub(crate) fn forget_connection(&self, id: &ConnectionId) -> bool {
        lock(&self.connections).remove(id).is_some()
    }

    fn endpoints(&self) -> Vec<DaemonEndpoint> {
        lock(&self.connections).values().cloned().collect()
    }

    fn value_changed(&self, value: &SimpleData) {
        for endpoint in self.endpoints() {
            endpoint.spontaneous_value_change(value);
        }
    }
}

/// Controls a running daemon from outside its accept loop.
#[derive(Clone)]
pub struct DaemonHandle {
    shared: Arc<Shared>,
    driver: Arc<Driver>,
}

impl DaemonHandle {
    /// Ask the daemon to stop. The shutdown sequence runs on the server task.
    pub fn shutdown(&self) {
        self.shared.stop.cancel();
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    #[must_use]
    pub fn buffers(&self) -> &Arc<Buffers> {
        &self.shared.buffers
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }
}

/// A bound daemon with a started buffer pipeline.
pub struct Daemon {
    listener: TcpListener,
    shared: Arc<Shared>,
    driver: Arc<Driver>,
    fan_out: ConsumerId,
    grace: Duration,
}

impl Daemon {
    /// Bind the listening socket, build the pipeline and start the driver.
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound or the driver does not start.
    pub async fn bind(
        settings: &CommunicationSettings,
        hardware: Arc<dyn HardwareDriver>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(settings.socket_addr()).await?;
        info!("Daemon listening on {}", listener.local_addr()?);

        let gatherers = Arc::new(GathererRegistry::new(hardware.clone()));
        let buffers = Arc::new(Buffers::new(gatherers));
        let shared = Arc::new(Shared {
            buffers: buffers.clone(),
            stop: CancellationToken::new(),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&shared);
        let fan_out = buffers.add_value_change_consumer(Arc::new(move |value: &SimpleData| {
            if let Some(shared) = weak.upgrade() {
                shared.value_changed(value);
            }
        }));

        let name = hardware.name().to_string();
        let driver = Driver::new(hardware, buffers);
        driver
            .start()
            .map_err(|source| DaemonError::Driver { driver: name, source })?;

        Ok(Self {
            listener,
            shared,
            driver,
            fan_out,
            grace: settings.disconnect_grace,
        })
    }

    /// # Errors
    ///
    /// Fails if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            shared: self.shared.clone(),
            driver: self.driver.clone(),
        }
    }

    /// Serve clients until a shutdown is requested, then shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the listening socket fails.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            shared,
            driver,
            fan_out,
            grace,
        } = self;

        info!("Ready to accept connections");
        loop {
            tokio::select! {
                () = shared.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        serve(&shared, stream, grace);
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }
        drop(listener);

        stop(&shared, &driver, fan_out).await;
        Ok(())
    }
}

fn serve(shared: &Arc<Shared>, stream: TcpStream, grace: Duration) {
    let strategy: Arc<dyn ClientRequestExecutionStrategy> = shared.clone();
    let endpoint = DaemonEndpoint::accept(stream, strategy, grace);
    let id = endpoint.id().clone();
    lock(&shared.connections).insert(id.clone(), endpoint.clone());

    // The client may already be gone, in which case connection_died ran first.
    if !endpoint.is_connected() {
        shared.forget_connection(&id);
    }
}

async fn stop(shared: &Shared, driver: &Driver, fan_out: ConsumerId) {
    info!("Shutting down");
    panic::shutdown_started();

    let endpoints = shared.endpoints();
    debug!("Disconnecting {} clients", endpoints.len());
    join_all(endpoints.iter().map(DaemonEndpoint::disconnect)).await;

    driver.shutdown();
    shared.buffers.shutdown();
    shared.buffers.remove_value_change_consumer(fan_out);

    for endpoint in shared.endpoints() {
        endpoint.disconnect_immediately();
    }
    info!("Daemon stopped");
}
