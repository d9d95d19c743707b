//! Protocol messages exchanged between clients and the daemon.
//!
//! Every message is an envelope `{"type": <verb>, "arguments": {...}}`. The
//! verb set is closed; decoding an unknown verb fails.

use bufferd_types::{BufferConfiguration, BufferDescription, BufferState, InvalidData, SimpleData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version sent with `establish`; the daemon rejects any other.
pub const PROTOCOL_VERSION: i32 = 1;

pub const REASON_ILLEGAL_VERSION: &str = "illegal version";
pub const REASON_UNKNOWN_BUFFER: &str = "unknown buffer";
pub const REASON_UNKNOWN_ACTOR: &str = "unknown actor";
pub const REASON_WRONG_CONFIGURATION: &str = "wrong buffer configuration";

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "arguments",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Message {
    /// Client handshake
    Establish { version: i32 },
    Accepted {},
    Rejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Either side is about to close the connection
    Disconnect {},
    /// Ask the daemon process to stop
    Shutdown {},
    QueryBufferByName { name: String },
    QueryBufferByMetainfo { topic: String, metainfo: String },
    BufferNames { name: Vec<String> },
    QueryMetainfo { name: String },
    BufferMetainfo(BufferDescription),
    GetBufferConfiguration { name: String },
    BufferConfiguration { configuration: BufferConfiguration },
    SetBufferConfiguration {
        name: String,
        configuration: BufferConfiguration,
        create: bool,
    },
    ReleaseBuffer { name: String },
    GetImmediate { name: String },
    /// Arm a one-shot subscription; never answered directly
    Get { name: String },
    Set { name: String, value: f64 },
    Push(Push),
}

impl Message {
    /// The wire verb, for logging.
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Establish { .. } => "establish",
            Self::Accepted {} => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Disconnect {} => "disconnect",
            Self::Shutdown {} => "shutdown",
            Self::QueryBufferByName { .. } => "queryBufferByName",
            Self::QueryBufferByMetainfo { .. } => "queryBufferByMetainfo",
            Self::BufferNames { .. } => "bufferNames",
            Self::QueryMetainfo { .. } => "queryMetainfo",
            Self::BufferMetainfo(_) => "bufferMetainfo",
            Self::GetBufferConfiguration { .. } => "getBufferConfiguration",
            Self::BufferConfiguration { .. } => "bufferConfiguration",
            Self::SetBufferConfiguration { .. } => "setBufferConfiguration",
            Self::ReleaseBuffer { .. } => "releaseBuffer",
            Self::GetImmediate { .. } => "getImmediate",
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
            Self::Push(_) => "push",
        }
    }
}

/// A buffer value sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub name: String,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub state: BufferState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// `true` for subscription deliveries, `false` for request answers
    pub spontaneous: bool,
}

impl Push {
    #[must_use]
    pub fn new(data: &SimpleData, spontaneous: bool) -> Self {
        Self {
            name: data.buffer_name().to_string(),
            timestamp: data.timestamp_millis(),
            state: data.state(),
            value: data.value(),
            spontaneous,
        }
    }

    /// Rebuild the value envelope.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidData`] for a READY push without a value.
    pub fn to_data(&self) -> Result<SimpleData, InvalidData> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now);
        SimpleData::new(self.name.clone(), timestamp, self.state, self.value)
    }
}
