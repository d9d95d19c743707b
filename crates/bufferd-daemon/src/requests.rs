//! Client requests executed against the buffer registry.

use std::collections::BTreeSet;
use std::time::Duration;

use bufferd_core::{BufferClass, BufferConfiguration, PipelineError, SimpleData};
use bufferd_rpc::{ClientRequestExecutionStrategy, ConnectionId};
use tracing::{debug, info, warn};

use crate::server::Shared;

/// Pause between a client's shutdown request and the start of the shutdown.
pub const SHUTDOWN_DELAY: Duration = Duration::from_millis(250);

impl ClientRequestExecutionStrategy for Shared {
    fn connection_died(&self, connection: &ConnectionId) {
        if self.forget_connection(connection) {
            debug!("[{}] removed from connection list", connection);
        }
    }

    fn shutdown(&self, connection: &ConnectionId) {
        info!("[{}] requested daemon shutdown", connection);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_DELAY).await;
            stop.cancel();
        });
    }

    fn buffer_exists(&self, name: &str) -> bool {
        self.buffers.contains(name)
    }

    fn query_buffers_by_name(&self, name: &str) -> BTreeSet<String> {
        self.buffers.query_by_name(name)
    }

    fn query_buffers_by_metainfo(&self, topic: &str, metainfo: &str) -> BTreeSet<String> {
        self.buffers.query_by_metainfo(topic, metainfo)
    }

    fn buffer_configuration(&self, name: &str) -> Option<BufferConfiguration> {
        self.buffers
            .buffer(name)
            .map(|buffer| buffer.configuration().clone())
    }

    fn is_hardware_buffer(&self, name: &str) -> bool {
        self.buffers
            .buffer(name)
            .is_some_and(|buffer| buffer.is_hardware())
    }

    fn set_buffer_configuration(
        &self,
        name: &str,
        configuration: BufferConfiguration,
        create: bool,
    ) -> bool {
        if !create && !self.buffers.contains(name) {
            debug!("Not creating unknown buffer '{}'", name);
            return false;
        }
        match self.buffers.create(name, configuration, false) {
            Ok(_) => true,
            Err(e) => {
                warn!("Configuration of '{}' refused: {}", name, e);
                false
            }
        }
    }

    fn buffer_value(&self, name: &str) -> Option<SimpleData> {
        self.buffers.buffer(name).map(|buffer| buffer.get())
    }

    fn set_buffer_value(&self, name: &str, value: f64) -> Option<SimpleData> {
        let buffer = self
            .buffers
            .buffer(name)
            .filter(|buffer| buffer.buffer_class() == BufferClass::Actor)?;
        match buffer.write(value) {
            Ok(true) => {}
            Ok(false) => debug!("Hardware refused {} for '{}'", value, name),
            Err(e) => {
                debug!("{}", e);
                return None;
            }
        }
        Some(buffer.get())
    }

    fn remove_buffer(&self, name: &str) -> bool {
        match self.buffers.remove(name) {
            Ok(()) => true,
            Err(PipelineError::UnknownBuffer(_)) => false,
            Err(e) => {
                warn!("Release of '{}' refused: {}", name, e);
                false
            }
        }
    }
}
