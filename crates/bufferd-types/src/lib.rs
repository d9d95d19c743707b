//! Shared types for bufferd components.
//!
//! This crate provides the value envelope, buffer states and the buffer
//! configuration model used by bufferd-core, bufferd-rpc and the binaries.
//! Configurations serialize to the wire form spoken between clients and the
//! daemon.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Two values closer than this are treated as the same reading.
pub const VALUE_TOLERANCE: f64 = 1e-8;

/// Lifecycle state of a buffer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferState {
    /// No value has been established yet
    Initializing,
    /// A value is available
    Ready,
    /// A lower layer reported a failure
    Faulted,
    /// The buffer was shut down; terminal
    Released,
    /// Assigned by a client that lost its daemon connection; never sent on the wire
    Isolated,
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Faulted => "FAULTED",
            Self::Released => "RELEASED",
            Self::Isolated => "ISOLATED",
        };
        f.write_str(name)
    }
}

/// Direction of a buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferClass {
    /// Values are written by clients and forwarded to the hardware
    Actor,
    /// Values are read from the hardware
    #[default]
    Sensor,
}

/// Error for value envelopes violating the READY/value invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("value of '{buffer_name}' is in state {state} but carries no number")]
pub struct InvalidData {
    pub buffer_name: String,
    pub state: BufferState,
}

/// The value envelope exchanged at every layer.
///
/// A value is present exactly when the state is [`BufferState::Ready`].
#[derive(Debug, Clone)]
pub struct SimpleData {
    buffer_name: String,
    timestamp: DateTime<Utc>,
    state: BufferState,
    value: Option<f64>,
}

impl SimpleData {
    /// Build an envelope from raw parts, as received from the wire.
    ///
    /// A number attached to a non-ready state is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidData`] if the state is READY but no value is given.
    pub fn new(
        buffer_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        state: BufferState,
        value: Option<f64>,
    ) -> Result<Self, InvalidData> {
        let buffer_name = buffer_name.into();
        match (state, value) {
            (BufferState::Ready, None) => Err(InvalidData { buffer_name, state }),
            (BufferState::Ready, Some(value)) => Ok(Self {
                buffer_name,
                timestamp,
                state,
                value: Some(value),
            }),
            (state, _) => Ok(Self {
                buffer_name,
                timestamp,
                state,
                value: None,
            }),
        }
    }

    /// A READY value stamped now.
    #[must_use]
    pub fn ready(buffer_name: impl Into<String>, value: f64) -> Self {
        Self {
            buffer_name: buffer_name.into(),
            timestamp: Utc::now(),
            state: BufferState::Ready,
            value: Some(value),
        }
    }

    /// A value-less envelope stamped now.
    ///
    /// Passing [`BufferState::Ready`] yields a FAULTED envelope, since a ready
    /// state without a number cannot exist.
    #[must_use]
    pub fn with_state(buffer_name: impl Into<String>, state: BufferState) -> Self {
        debug_assert!(state != BufferState::Ready, "READY requires a value");
        let state = if state == BufferState::Ready {
            BufferState::Faulted
        } else {
            state
        };
        Self {
            buffer_name: buffer_name.into(),
            timestamp: Utc::now(),
            state,
            value: None,
        }
    }

    #[must_use]
    pub fn buffer_name(&self) -> &str {
        &self.buffer_name
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Milliseconds since the unix epoch, the wire representation.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    #[must_use]
    pub fn state(&self) -> BufferState {
        self.state
    }

    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == BufferState::Ready
    }

    /// The same reading attributed to another buffer.
    #[must_use]
    pub fn renamed(&self, buffer_name: impl Into<String>) -> Self {
        Self {
            buffer_name: buffer_name.into(),
            ..self.clone()
        }
    }

    /// Change-detection equality: same state and, when ready, values within
    /// [`VALUE_TOLERANCE`]. Name and timestamp are ignored.
    #[must_use]
    pub fn same_reading(&self, other: &Self) -> bool {
        if self.state != other.state {
            return false;
        }
        match (self.value, other.value) {
            (Some(a), Some(b)) => (a - b).abs() < VALUE_TOLERANCE,
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SimpleData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "{} = {value:.3}", self.buffer_name),
            None => write!(f, "{} is {}", self.buffer_name, self.state),
        }
    }
}

/// Source of a buffer's values.
///
/// Two configurations are equal when they have the same kind and port; this
/// equality decides which buffers share a gatherer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GathererConfiguration {
    /// Accepts any value, starts at 0
    #[default]
    Dummy,
    /// Counts up by 0.1 every second
    Test,
    /// Writes to a hardware output port
    Actor {
        #[serde(rename = "name")]
        port_name: String,
    },
    /// Reads from a hardware input port
    Sensor {
        #[serde(rename = "name")]
        port_name: String,
    },
}

impl GathererConfiguration {
    #[must_use]
    pub fn actor(port_name: impl Into<String>) -> Self {
        Self::Actor {
            port_name: port_name.into(),
        }
    }

    #[must_use]
    pub fn sensor(port_name: impl Into<String>) -> Self {
        Self::Sensor {
            port_name: port_name.into(),
        }
    }

    #[must_use]
    pub fn port_name(&self) -> Option<&str> {
        match self {
            Self::Actor { port_name } | Self::Sensor { port_name } => Some(port_name),
            Self::Dummy | Self::Test => None,
        }
    }

    /// Whether a gatherer of this kind accepts values written by a buffer.
    #[must_use]
    pub fn can_use_as_actor(&self) -> bool {
        !matches!(self, Self::Sensor { .. })
    }

    #[must_use]
    pub fn supports(&self, class: BufferClass) -> bool {
        match class {
            BufferClass::Actor => self.can_use_as_actor(),
            BufferClass::Sensor => true,
        }
    }
}

impl fmt::Display for GathererConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dummy => f.write_str("dummy"),
            Self::Test => f.write_str("test"),
            Self::Actor { port_name } => write!(f, "actor:{port_name}"),
            Self::Sensor { port_name } => write!(f, "sensor:{port_name}"),
        }
    }
}

/// One stage of a buffer's adapter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum AdapterConfiguration {
    /// Identity
    Dummy,
    /// `y = a·x² + b·x + c`
    Scale { a: f64, b: f64, c: f64 },
    /// Hysteresis comparator
    Trigger {
        lower_threshold: f64,
        upper_threshold: f64,
        #[serde(rename = "lowerValue")]
        lower_output: f64,
        #[serde(rename = "upperValue")]
        upper_output: f64,
    },
    /// Exponential smoothing on a one second tick
    Lowpass { interpolation_factor: f64 },
    /// Deadband suppressing small changes
    Filter { minimum_difference: f64 },
}

impl AdapterConfiguration {
    #[must_use]
    pub fn scale(a: f64, b: f64, c: f64) -> Self {
        Self::Scale { a, b, c }
    }

    #[must_use]
    pub fn trigger(
        lower_threshold: f64,
        upper_threshold: f64,
        lower_output: f64,
        upper_output: f64,
    ) -> Self {
        Self::Trigger {
            lower_threshold,
            upper_threshold,
            lower_output,
            upper_output,
        }
    }

    /// A lowpass stage; the factor is clamped to `[0, 1]`.
    #[must_use]
    pub fn lowpass(interpolation_factor: f64) -> Self {
        Self::Lowpass {
            interpolation_factor: interpolation_factor.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn filter(minimum_difference: f64) -> Self {
        Self::Filter {
            minimum_difference: minimum_difference.abs(),
        }
    }

    /// Whether the stage emits values on a timer.
    #[must_use]
    pub fn is_timer_driven(&self) -> bool {
        matches!(self, Self::Lowpass { .. })
    }
}

/// Full description of how a buffer is built.
///
/// Fields are not cross-checked on assignment. [`BufferConfiguration::validate`]
/// runs when the configuration is applied to a buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireConfiguration", into = "WireConfiguration")]
pub struct BufferConfiguration {
    pub buffer_class: BufferClass,
    pub adapter_chain: Vec<AdapterConfiguration>,
    pub gatherer: GathererConfiguration,
    pub metainfo: BTreeMap<String, String>,
}

impl BufferConfiguration {
    #[must_use]
    pub fn sensor(gatherer: GathererConfiguration) -> Self {
        Self {
            buffer_class: BufferClass::Sensor,
            gatherer,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn actor(gatherer: GathererConfiguration) -> Self {
        Self {
            buffer_class: BufferClass::Actor,
            gatherer,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: AdapterConfiguration) -> Self {
        self.adapter_chain.push(adapter);
        self
    }

    #[must_use]
    pub fn with_metainfo(mut self, topic: impl Into<String>, value: impl Into<String>) -> Self {
        self.metainfo.insert(topic.into(), value.into());
        self
    }

    /// Check that the gatherer can serve the buffer class.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::GathererNotActorCapable`] for an actor
    /// buffer backed by a read-only gatherer.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.gatherer.supports(self.buffer_class) {
            Ok(())
        } else {
            Err(ConfigurationError::GathererNotActorCapable(
                self.gatherer.clone(),
            ))
        }
    }
}

/// A configuration that cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("gatherer {0} cannot be used as actor")]
    GathererNotActorCapable(GathererConfiguration),
}

/// What clients learn about a buffer without reading its configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferDescription {
    pub name: String,
    pub is_hardware: bool,
    #[serde(with = "metainfo_entries")]
    pub metainfo: BTreeMap<String, String>,
}

/// One metainfo pair in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetainfoEntry {
    pub topic: String,
    pub metainfo: String,
}

/// Serde adapter for metainfo maps, written as a list of `{topic, metainfo}`.
pub mod metainfo_entries {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::MetainfoEntry;

    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S>(map: &BTreeMap<String, String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        to_entries(map).serialize(serializer)
    }

    /// # Errors
    ///
    /// Fails if the input is not a list of `{topic, metainfo}` objects.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let entries = Vec::<MetainfoEntry>::deserialize(deserializer)?;
        Ok(from_entries(entries))
    }

    pub(crate) fn to_entries(map: &BTreeMap<String, String>) -> Vec<MetainfoEntry> {
        map.iter()
            .map(|(topic, metainfo)| MetainfoEntry {
                topic: topic.clone(),
                metainfo: metainfo.clone(),
            })
            .collect()
    }

    pub(crate) fn from_entries(entries: Vec<MetainfoEntry>) -> BTreeMap<String, String> {
        entries
            .into_iter()
            .map(|entry| (entry.topic, entry.metainfo))
            .collect()
    }
}

#[derive(Serialize, Deserialize)]
struct WireBufferClass {
    #[serde(rename = "type")]
    class: BufferClass,
}

#[derive(Serialize, Deserialize)]
struct WireConfiguration {
    buffer: WireBufferClass,
    gatherer: GathererConfiguration,
    #[serde(default)]
    adapter: Vec<AdapterConfiguration>,
    #[serde(default)]
    metainfo: Vec<MetainfoEntry>,
}

impl From<WireConfiguration> for BufferConfiguration {
    fn from(wire: WireConfiguration) -> Self {
        Self {
            buffer_class: wire.buffer.class,
            adapter_chain: wire.adapter,
            gatherer: wire.gatherer,
            metainfo: metainfo_entries::from_entries(wire.metainfo),
        }
    }
}

impl From<BufferConfiguration> for WireConfiguration {
    fn from(config: BufferConfiguration) -> Self {
        Self {
            buffer: WireBufferClass {
                class: config.buffer_class,
            },
            metainfo: metainfo_entries::to_entries(&config.metainfo),
            gatherer: config.gatherer,
            adapter: config.adapter_chain,
        }
    }
}
