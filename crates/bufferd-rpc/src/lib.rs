//! Wire protocol and connection endpoints for bufferd.
//!
//! Clients and the daemon talk over TCP. Each message is a JSON envelope
//! `{"type": <verb>, "arguments": {...}}` in a length-prefixed frame.
//!
//! # Architecture
//!
//! - [`transport`]: length-prefixed JSON codec
//! - [`protocol`]: the closed message set
//! - [`connection`]: framed socket with a writer task
//! - [`sender`]: protocol verbs as methods
//! - [`client`]: the client endpoint with request/answer correlation
//! - [`daemon_endpoint`]: the daemon's side of one client connection
//! - [`settings`]: address, port and timeouts
//!
//! # Example
//!
//! ```no_run
//! use bufferd_rpc::{ClientEndpoint, CommunicationSettings};
//!
//! # async fn example() -> bufferd_rpc::Result<()> {
//! let client = ClientEndpoint::new(CommunicationSettings::from_env());
//! for name in client.query_buffers_by_name(".*").await? {
//!     if let Some(value) = client.get_immediate(&name).await? {
//!         println!("{value}");
//!     }
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod daemon_endpoint;
pub mod error;
pub mod protocol;
pub mod sender;
pub mod settings;
pub mod transport;

pub use client::{ClientEndpoint, ObserverId, ValueChangeObserver};
pub use connection::{Connection, ConnectionId, ConnectionState, FrameStream};
pub use daemon_endpoint::{ClientRequestExecutionStrategy, DaemonEndpoint};
pub use error::{Error, Result};
pub use protocol::{
    Message, PROTOCOL_VERSION, Push, REASON_ILLEGAL_VERSION, REASON_UNKNOWN_ACTOR,
    REASON_UNKNOWN_BUFFER, REASON_WRONG_CONFIGURATION,
};
pub use sender::MessageSender;
pub use settings::{CommunicationSettings, DEFAULT_PORT};
pub use transport::{CodecError, MessageCodec};
