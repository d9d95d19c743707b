//! bufferd daemon library: the TCP server in front of the buffer pipeline.
//!
//! [`Daemon::bind`] starts the hardware driver and its buffers, and
//! [`Daemon::run`] serves clients until one of them, a signal or a
//! [`DaemonHandle`] asks it to stop.

pub mod error;
pub mod panic;
pub mod requests;
pub mod server;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use error::{DaemonError, Result};
pub use requests::SHUTDOWN_DELAY;
pub use server::{Daemon, DaemonHandle};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
