//! Buffer pipeline of the bufferd gateway.
//!
//! Values flow from a [`Gatherer`] through the [`AdapterChain`] of each
//! [`Buffer`] using it, and from every buffer into the fan-out of the
//! [`Buffers`] registry. Actor buffers run the other way: a value put into the
//! buffer passes its chain and is written to the gatherer.

pub mod driver;

mod adapter;
mod buffer;
mod buffers;
mod chain;
mod error;
mod gatherer;
mod gatherers;
mod producer;
mod ticker;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use adapter::Adapter;
pub use buffer::Buffer;
pub use buffers::Buffers;
pub use chain::AdapterChain;
pub use driver::{Driver, DriverChoice, HardwareDriver, select_driver};
pub use error::{PipelineError, Result};
pub use gatherer::Gatherer;
pub use gatherers::GathererRegistry;
pub use producer::{ConsumerId, Consumers, ValueChangeConsumer};
pub use ticker::{TICK_PERIOD, Ticker};

pub use bufferd_types::*;

/// Lock a mutex, taking over the data of a poisoned one.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
