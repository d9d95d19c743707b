//! Error types for the bufferd daemon.

use bufferd_core::PipelineError;

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] bufferd_rpc::CodecError),

    /// Connection error
    #[error("Connection error: {0}")]
    Rpc(#[from] bufferd_rpc::Error),

    /// Buffer pipeline error
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// The hardware driver could not be started
    #[error("Driver '{driver}' failed to start: {source}")]
    Driver {
        driver: String,
        #[source]
        source: PipelineError,
    },
}

pub type Result<T> = std::result::Result<T, DaemonError>;
