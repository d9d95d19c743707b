//! Protocol verbs mapped onto outbound messages.

use std::collections::BTreeSet;

use bufferd_types::{BufferConfiguration, BufferDescription, SimpleData};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{Message, PROTOCOL_VERSION, Push};

/// Item queued for a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Message),
    Close,
}

/// Sends protocol messages over one connection.
///
/// Cheap to clone; all clones feed the same writer. Sending never blocks and
/// fails with [`Error::Disconnected`] once the connection's writer is gone.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl MessageSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    pub(crate) fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    /// Queue a raw message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Outbound::Frame(message))
            .map_err(|_| Error::Disconnected)
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn establish(&self) -> Result<()> {
        self.send(Message::Establish {
            version: PROTOCOL_VERSION,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn accepted(&self) -> Result<()> {
        self.send(Message::Accepted {})
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn rejected(&self, reason: &str) -> Result<()> {
        self.send(Message::Rejected {
            reason: Some(reason.to_string()),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn disconnect(&self) -> Result<()> {
        self.send(Message::Disconnect {})
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Message::Shutdown {})
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn query_buffer_by_name(&self, name: &str) -> Result<()> {
        self.send(Message::QueryBufferByName {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn query_buffer_by_metainfo(&self, topic: &str, metainfo: &str) -> Result<()> {
        self.send(Message::QueryBufferByMetainfo {
            topic: topic.to_string(),
            metainfo: metainfo.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn buffer_names(&self, names: BTreeSet<String>) -> Result<()> {
        self.send(Message::BufferNames {
            name: names.into_iter().collect(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn query_metainfo(&self, name: &str) -> Result<()> {
        self.send(Message::QueryMetainfo {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn buffer_metainfo(&self, description: BufferDescription) -> Result<()> {
        self.send(Message::BufferMetainfo(description))
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn get_buffer_configuration(&self, name: &str) -> Result<()> {
        self.send(Message::GetBufferConfiguration {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn buffer_configuration(&self, configuration: BufferConfiguration) -> Result<()> {
        self.send(Message::BufferConfiguration { configuration })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn set_buffer_configuration(
        &self,
        name: &str,
        configuration: &BufferConfiguration,
        create: bool,
    ) -> Result<()> {
        self.send(Message::SetBufferConfiguration {
            name: name.to_string(),
            configuration: configuration.clone(),
            create,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn release_buffer(&self, name: &str) -> Result<()> {
        self.send(Message::ReleaseBuffer {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn get_immediate(&self, name: &str) -> Result<()> {
        self.send(Message::GetImmediate {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn get(&self, name: &str) -> Result<()> {
        self.send(Message::Get {
            name: name.to_string(),
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn set(&self, name: &str, value: f64) -> Result<()> {
        self.send(Message::Set {
            name: name.to_string(),
            value,
        })
    }

    /// # Errors
    ///
    /// Returns [`Error::Disconnected`] if the connection is closed.
    pub fn push(&self, data: &SimpleData, spontaneous: bool) -> Result<()> {
        self.send(Message::Push(Push::new(data, spontaneous)))
    }
}
