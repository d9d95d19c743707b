//! Gatherers: the process-local representatives of value sources.

use std::sync::{Arc, Mutex};

use bufferd_types::{BufferState, GathererConfiguration, SimpleData};
use tracing::{debug, trace, warn};

use crate::driver::HardwareDriver;
use crate::lock;
use crate::producer::{ConsumerId, Consumers, ValueChangeConsumer};
use crate::ticker::{TICK_PERIOD, Ticker};

/// The test gatherer wraps around once its value reaches this.
const TEST_WRAP_THRESHOLD: f64 = 0.999_999_999_9;

struct GathererState {
    current: SimpleData,
    released: bool,
}

/// A value source shared by every buffer with an equal gatherer configuration.
///
/// Mutations are serialized by a write lock held across the driver call and
/// the notification of consumers. The reading itself sits behind a separate
/// lock, so consumers may read [`Gatherer::get`] while being notified.
pub struct Gatherer {
    configuration: GathererConfiguration,
    driver: Arc<dyn HardwareDriver>,
    writes: Mutex<()>,
    state: Mutex<GathererState>,
    consumers: Consumers,
    ticker: Option<Ticker>,
}

impl Gatherer {
    /// Create a gatherer in its start state. A test gatherer starts ticking
    /// if a runtime is available.
    pub fn new(configuration: GathererConfiguration, driver: Arc<dyn HardwareDriver>) -> Arc<Self> {
        let name = configuration.to_string();
        let current = match configuration {
            GathererConfiguration::Dummy | GathererConfiguration::Test => {
                SimpleData::ready(name.clone(), 0.0)
            }
            GathererConfiguration::Sensor { .. } => {
                SimpleData::with_state(name.clone(), BufferState::Faulted)
            }
            GathererConfiguration::Actor { .. } => {
                SimpleData::with_state(name.clone(), BufferState::Initializing)
            }
        };
        debug!("Creating gatherer {}", name);

        Arc::new_cyclic(|weak| {
            let ticker = if configuration == GathererConfiguration::Test {
                let weak = weak.clone();
                Ticker::spawn(&name, TICK_PERIOD, move || {
                    weak.upgrade().is_some_and(|gatherer: Arc<Gatherer>| {
                        gatherer.tick();
                        true
                    })
                })
            } else {
                None
            };

            Self {
                configuration,
                driver,
                writes: Mutex::new(()),
                state: Mutex::new(GathererState {
                    current,
                    released: false,
                }),
                consumers: Consumers::new(),
                ticker,
            }
        })
    }

    #[must_use]
    pub fn configuration(&self) -> &GathererConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn get(&self) -> SimpleData {
        lock(&self.state).current.clone()
    }

    #[must_use]
    pub fn state(&self) -> BufferState {
        lock(&self.state).current.state()
    }

    #[must_use]
    pub fn can_use_as_actor(&self) -> bool {
        self.configuration.can_use_as_actor()
    }

    pub fn subscribe(&self, consumer: Arc<dyn ValueChangeConsumer>) -> ConsumerId {
        self.consumers.subscribe(consumer)
    }

    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        self.consumers.unsubscribe(id)
    }

    #[must_use]
    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// Write a value on behalf of a buffer. Returns whether it was accepted.
    ///
    /// `origin` is not notified about the resulting change.
    pub fn set(&self, value: f64, origin: Option<ConsumerId>) -> bool {
        let name = self.configuration.to_string();
        match &self.configuration {
            GathererConfiguration::Sensor { .. } => {
                debug!("Gatherer {} is read-only", name);
                false
            }
            GathererConfiguration::Dummy | GathererConfiguration::Test => {
                let _writing = lock(&self.writes);
                self.update(origin, |current| {
                    current
                        .is_ready()
                        .then(|| SimpleData::ready(name.clone(), value))
                })
            }
            GathererConfiguration::Actor { port_name } => {
                // Held across the driver write and the recorded change.
                let _writing = lock(&self.writes);
                if lock(&self.state).released {
                    return false;
                }
                let written = self.driver.set(port_name, value);
                if !written {
                    warn!("Driver refused {} on port {}", value, port_name);
                }
                self.update(origin, |_| {
                    Some(if written {
                        SimpleData::ready(name.clone(), value)
                    } else {
                        SimpleData::with_state(name.clone(), BufferState::Faulted)
                    })
                });
                written
            }
        }
    }

    /// Take a reading polled from the hardware. Only sensor gatherers listen.
    pub fn feed(&self, reading: &SimpleData) {
        if !matches!(self.configuration, GathererConfiguration::Sensor { .. }) {
            return;
        }
        let name = self.configuration.to_string();
        trace!("Gatherer {} fed {}", name, reading);
        let _writing = lock(&self.writes);
        self.update(None, |_| Some(reading.renamed(name.clone())));
    }

    /// Force the state of a dummy gatherer. Entering READY starts at 0.
    pub fn force_state(&self, state: BufferState) -> bool {
        if self.configuration != GathererConfiguration::Dummy {
            debug!("Only dummy gatherers can be forced, not {}", self.configuration);
            return false;
        }
        let name = self.configuration.to_string();
        let _writing = lock(&self.writes);
        self.update(None, |current| {
            Some(match state {
                BufferState::Ready if current.is_ready() => current.clone(),
                BufferState::Ready => SimpleData::ready(name.clone(), 0.0),
                other => SimpleData::with_state(name.clone(), other),
            })
        })
    }

    /// Release the gatherer. Consumers see RELEASED once; later writes fail.
    pub fn shutdown(&self) {
        if let Some(ticker) = &self.ticker {
            ticker.stop();
        }

        let _writing = lock(&self.writes);
        let released = {
            let mut state = lock(&self.state);
            if state.released {
                return;
            }
            state.released = true;
            state.current =
                SimpleData::with_state(self.configuration.to_string(), BufferState::Released);
            state.current.clone()
        };
        debug!("Gatherer {} released", self.configuration);
        self.consumers.fire(&released, None);
    }

    fn tick(&self) {
        let name = self.configuration.to_string();
        let _writing = lock(&self.writes);
        self.update(None, |current| {
            let value = current.value()?;
            let next = if value < TEST_WRAP_THRESHOLD {
                value + 0.1
            } else {
                value - 1.0
            };
            Some(SimpleData::ready(name.clone(), next))
        });
    }

    /// Apply `change` under the state lock, then notify consumers if the
    /// reading changed. Returns `false` if released or `change` declined.
    ///
    /// Callers hold the write lock.
    fn update(
        &self,
        origin: Option<ConsumerId>,
        change: impl FnOnce(&SimpleData) -> Option<SimpleData>,
    ) -> bool {
        let next = {
            let mut state = lock(&self.state);
            if state.released {
                return false;
            }
            let Some(next) = change(&state.current) else {
                return false;
            };
            if next.same_reading(&state.current) {
                return true;
            }
            state.current = next.clone();
            next
        };

        self.consumers.fire(&next, origin);
        true
    }
}
