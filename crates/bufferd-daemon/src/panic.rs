//! Emergency shutdown on unexpected panics.
//!
//! A panic on any thread ends the process with [`EMERGENCY_EXIT_CODE`].
//! Panics raised while a regular shutdown is already running are only logged.

use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static INSTALL: Once = Once::new();

/// Exit code of an emergency shutdown.
pub const EMERGENCY_EXIT_CODE: i32 = 1;

/// Install the emergency shutdown hook. Later calls are no-ops.
pub fn install() {
    INSTALL.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_hook(info);
            if is_shutting_down() {
                error!("Panic during shutdown: {}", info);
                return;
            }
            error!("Emergency shutdown after unexpected panic: {}", info);
            std::process::exit(EMERGENCY_EXIT_CODE);
        }));
    });
}

/// Record that the regular shutdown sequence has begun.
pub fn shutdown_started() {
    SHUTTING_DOWN.store(true, Ordering::SeqCst);
}

#[must_use]
pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::SeqCst)
}
