use bufferd_types::ConfigurationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigurationError),

    #[error("Buffer not found: {0}")]
    UnknownBuffer(String),

    #[error("Hardware buffer cannot be changed: {0}")]
    HardwareBuffer(String),

    #[error("Buffer cannot be written: {0}")]
    NotWritable(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
