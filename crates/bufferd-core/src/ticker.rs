//! Periodic callbacks on the tokio runtime.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// Period of timer-driven adapters, the test gatherer and driver polling.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// A running periodic task. Dropping the handle stops it.
#[derive(Debug)]
pub struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Call `tick` every `period`, first after one full period.
    ///
    /// The task ends when `tick` returns `false`. Returns `None` outside a
    /// tokio runtime, where nothing can tick.
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Option<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, {} will not tick", name);
            return None;
        };

        let handle = runtime.spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !tick() {
                    break;
                }
            }
        });
        Some(Self { handle })
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, impl FnMut() -> bool + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (count, move || {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    #[test]
    fn test_no_runtime_no_ticker() {
        assert!(Ticker::spawn("test", TICK_PERIOD, || true).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_period() {
        let (count, tick) = counting();
        let _ticker = Ticker::spawn("test", TICK_PERIOD, tick).unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_ticking() {
        let (count, tick) = counting();
        let ticker = Ticker::spawn("test", TICK_PERIOD, tick).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        drop(ticker);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_false_ends_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _ticker = Ticker::spawn("test", TICK_PERIOD, move || {
            seen.fetch_add(1, Ordering::SeqCst) < 1
        })
        .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
