//! A named buffer: one gatherer behind one adapter chain.

use std::sync::{Arc, Mutex, Weak};

use bufferd_types::{BufferClass, BufferConfiguration, BufferState, SimpleData};
use tracing::{debug, info, trace};

use crate::chain::AdapterChain;
use crate::error::{PipelineError, Result};
use crate::gatherer::Gatherer;
use crate::gatherers::GathererRegistry;
use crate::lock;
use crate::producer::{ConsumerId, Consumers, ValueChangeConsumer};
use crate::ticker::{TICK_PERIOD, Ticker};

struct BufferCore {
    chain: AdapterChain,
    current: SimpleData,
    released: bool,
}

impl BufferCore {
    /// Store `next` if it is a different reading.
    fn replace(&mut self, next: SimpleData) -> Option<SimpleData> {
        if next.same_reading(&self.current) {
            return None;
        }
        self.current = next.clone();
        Some(next)
    }
}

/// A buffer of either class.
///
/// Sensor buffers follow their gatherer through the chain. Actor buffers take
/// values from [`Buffer::put`] and write the chain's output to the gatherer.
/// One lock covers the reading in both directions; consumers are notified
/// after it is released. Writes to the gatherer are serialized by a second
/// lock held from the chain until the gatherer has taken the value.
pub struct Buffer {
    name: String,
    hardware: bool,
    configuration: BufferConfiguration,
    gatherer: Arc<Gatherer>,
    subscription: ConsumerId,
    writes: Mutex<()>,
    core: Mutex<BufferCore>,
    consumers: Consumers,
    ticker: Option<Ticker>,
}

impl Buffer {
    /// Build a buffer and attach it to its gatherer.
    ///
    /// # Errors
    ///
    /// Fails without touching the registry if the gatherer cannot serve the
    /// buffer class.
    pub fn create(
        name: &str,
        configuration: BufferConfiguration,
        hardware: bool,
        gatherers: &GathererRegistry,
    ) -> Result<Arc<Self>> {
        configuration.validate()?;

        let gatherer = gatherers.gatherer_for(&configuration.gatherer);
        let chain = AdapterChain::new(&configuration.adapter_chain);
        let timer_driven = chain.is_timer_driven();

        let buffer = Arc::new_cyclic(|weak: &Weak<Buffer>| {
            let link = weak.clone();
            let subscription = gatherer.subscribe(Arc::new(move |_: &SimpleData| {
                if let Some(buffer) = link.upgrade() {
                    buffer.gatherer_changed();
                }
            }));

            let ticker = if timer_driven {
                let weak = weak.clone();
                Ticker::spawn(name, TICK_PERIOD, move || {
                    weak.upgrade().is_some_and(|buffer: Arc<Buffer>| {
                        buffer.tick();
                        true
                    })
                })
            } else {
                None
            };

            Self {
                name: name.to_string(),
                hardware,
                configuration,
                gatherer,
                subscription,
                writes: Mutex::new(()),
                core: Mutex::new(BufferCore {
                    chain,
                    current: SimpleData::with_state(name, BufferState::Initializing),
                    released: false,
                }),
                consumers: Consumers::new(),
                ticker,
            }
        });

        buffer.gatherer_changed();
        info!(
            "Created {:?} buffer '{}' on gatherer {}",
            buffer.configuration.buffer_class, name, buffer.configuration.gatherer
        );
        Ok(buffer)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_hardware(&self) -> bool {
        self.hardware
    }

    #[must_use]
    pub fn configuration(&self) -> &BufferConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn buffer_class(&self) -> BufferClass {
        self.configuration.buffer_class
    }

    #[must_use]
    pub fn gatherer(&self) -> &Arc<Gatherer> {
        &self.gatherer
    }

    #[must_use]
    pub fn get(&self) -> SimpleData {
        lock(&self.core).current.clone()
    }

    pub fn subscribe(&self, consumer: Arc<dyn ValueChangeConsumer>) -> ConsumerId {
        self.consumers.subscribe(consumer)
    }

    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        self.consumers.unsubscribe(id)
    }

    /// Write a value into an actor buffer.
    ///
    /// Returns `false` if [`Buffer::write`] refused the value or the gatherer
    /// did not take it.
    pub fn put(&self, value: f64) -> bool {
        matches!(self.write(value), Ok(true))
    }

    /// Write a value into an actor buffer.
    ///
    /// The buffer becomes READY with `value` and the chain's output goes to
    /// the gatherer. Returns `Ok(false)` if the gatherer refused; the buffer
    /// is then FAULTED.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::NotWritable`] without touching the buffer if
    /// it is no actor, is released, or its gatherer is not writable.
    pub fn write(&self, value: f64) -> Result<bool> {
        if self.configuration.buffer_class != BufferClass::Actor {
            debug!("Buffer '{}' is no actor", self.name);
            return Err(PipelineError::NotWritable(self.name.clone()));
        }
        let gatherer_state = self.gatherer.state();
        if !matches!(
            gatherer_state,
            BufferState::Initializing | BufferState::Ready | BufferState::Faulted
        ) {
            debug!(
                "Buffer '{}' cannot be written, gatherer is {}",
                self.name, gatherer_state
            );
            return Err(PipelineError::NotWritable(self.name.clone()));
        }

        let _writing = lock(&self.writes);
        let (changed, output) = {
            let mut core = lock(&self.core);
            if core.released {
                return Err(PipelineError::NotWritable(self.name.clone()));
            }
            let input = SimpleData::ready(self.name.clone(), value);
            let output = core.chain.put(&input);
            (core.replace(input), output)
        };

        if let Some(changed) = changed {
            self.consumers.fire(&changed, None);
        }
        Ok(match output {
            Some(output) => self.write_through(&output),
            None => true,
        })
    }

    /// Release the buffer and, if unused now, its gatherer.
    pub fn shutdown(&self, gatherers: &GathererRegistry) {
        let released = {
            let mut core = lock(&self.core);
            if core.released {
                return;
            }
            core.released = true;
            core.current = SimpleData::with_state(self.name.clone(), BufferState::Released);
            core.current.clone()
        };

        if let Some(ticker) = &self.ticker {
            ticker.stop();
        }
        self.gatherer.unsubscribe(self.subscription);
        gatherers.release_if_unused(&self.configuration.gatherer);

        info!("Released buffer '{}'", self.name);
        self.consumers.fire(&released, None);
    }

    fn gatherer_changed(&self) {
        let changed = {
            let mut core = lock(&self.core);
            if core.released {
                return;
            }
            let reading = self.gatherer.get();
            let next = match self.configuration.buffer_class {
                BufferClass::Sensor => core
                    .chain
                    .put(&reading)
                    .map(|output| output.renamed(self.name.clone())),
                BufferClass::Actor => (!reading.is_ready())
                    .then(|| SimpleData::with_state(self.name.clone(), reading.state())),
            };
            next.and_then(|next| core.replace(next))
        };

        if let Some(changed) = changed {
            trace!("Buffer '{}' now {}", self.name, changed);
            self.consumers.fire(&changed, None);
        }
    }

    fn tick(&self) {
        let _writing = (self.configuration.buffer_class == BufferClass::Actor)
            .then(|| lock(&self.writes));
        let (changed, output) = {
            let mut core = lock(&self.core);
            if core.released {
                return;
            }
            let Some(output) = core.chain.tick() else {
                return;
            };
            match self.configuration.buffer_class {
                BufferClass::Sensor => (core.replace(output.renamed(self.name.clone())), None),
                BufferClass::Actor => (None, Some(output)),
            }
        };

        if let Some(changed) = changed {
            self.consumers.fire(&changed, None);
        }
        if let Some(output) = output {
            self.write_through(&output);
        }
    }

    /// Callers hold the write lock.
    fn write_through(&self, output: &SimpleData) -> bool {
        let Some(value) = output.value() else {
            return true;
        };
        if self.gatherer.set(value, Some(self.subscription)) {
            return true;
        }

        let faulted = {
            let mut core = lock(&self.core);
            if core.released {
                return false;
            }
            // Start over so the same value is written again on the next put.
            core.chain = AdapterChain::new(&self.configuration.adapter_chain);
            core.replace(SimpleData::with_state(self.name.clone(), BufferState::Faulted))
        };
        if let Some(faulted) = faulted {
            self.consumers.fire(&faulted, None);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DummyDriver, HardwareDriver, PortDescription, UnitTestDriver};
    use bufferd_types::{AdapterConfiguration, GathererConfiguration};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn registry() -> GathererRegistry {
        GathererRegistry::new(Arc::new(DummyDriver))
    }

    /// Holds a write of 1.0 inside `set` until released.
    struct GatedDriver {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        written: Mutex<Vec<f64>>,
    }

    impl GatedDriver {
        fn new() -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered, on_enter) = mpsc::channel();
            let (release, on_release) = mpsc::channel();
            let driver = Arc::new(Self {
                entered: Mutex::new(entered),
                release: Mutex::new(on_release),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                written: Mutex::new(Vec::new()),
            });
            (driver, on_enter, release)
        }
    }

    impl HardwareDriver for GatedDriver {
        fn name(&self) -> &str {
            "gated"
        }

        fn is_suitable(&self) -> bool {
            true
        }

        fn initialize(&self) -> Result<()> {
            Ok(())
        }

        fn ports(&self) -> Vec<PortDescription> {
            Vec::new()
        }

        fn read_values(&self) -> Vec<SimpleData> {
            Vec::new()
        }

        fn set(&self, _port: &str, value: f64) -> bool {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            if (value - 1.0).abs() < f64::EPSILON {
                self.entered.lock().unwrap().send(()).unwrap();
                self.release.lock().unwrap().recv().unwrap();
            }
            self.written.lock().unwrap().push(value);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            true
        }

        fn shutdown(&self) {}
    }

    fn actor_on(gatherers: &GathererRegistry, name: &str) -> Arc<Buffer> {
        Buffer::create(
            name,
            BufferConfiguration::actor(GathererConfiguration::actor("AO")),
            false,
            gatherers,
        )
        .unwrap()
    }

    /// Put 1.0 through `first`, and 2.0 through `second` while the first
    /// write is held inside the driver.
    fn overlapping_puts(
        driver: &GatedDriver,
        entered: &mpsc::Receiver<()>,
        release: &mpsc::Sender<()>,
        first: &Arc<Buffer>,
        second: &Arc<Buffer>,
    ) {
        let held = {
            let first = first.clone();
            thread::spawn(move || first.put(1.0))
        };
        entered.recv().unwrap();

        let queued = {
            let second = second.clone();
            thread::spawn(move || second.put(2.0))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(driver.written.lock().unwrap().len(), 0);

        release.send(()).unwrap();
        assert!(held.join().unwrap());
        assert!(queued.join().unwrap());
    }

    fn recording(buffer: &Buffer) -> Arc<Mutex<Vec<SimpleData>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        buffer.subscribe(Arc::new(move |value: &SimpleData| {
            sink.lock().unwrap().push(value.clone());
        }));
        seen
    }

    #[test]
    fn test_sensor_follows_gatherer_through_chain() {
        let gatherers = registry();
        let config = BufferConfiguration::sensor(GathererConfiguration::Dummy)
            .with_adapter(AdapterConfiguration::scale(0.0, 2.0, 1.0));
        let buffer = Buffer::create("scaled", config, false, &gatherers).unwrap();
        assert_eq!(buffer.get().value(), Some(1.0));
        assert_eq!(buffer.get().buffer_name(), "scaled");

        let seen = recording(&buffer);
        buffer.gatherer().set(10.0, None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value(), Some(21.0));
        assert_eq!(seen[0].buffer_name(), "scaled");
    }

    #[test]
    fn test_actor_on_sensor_gatherer_rejected() {
        let gatherers = registry();
        let config = BufferConfiguration::actor(GathererConfiguration::sensor("AI"));
        let result = Buffer::create("bad", config, false, &gatherers);

        assert!(matches!(
            result,
            Err(PipelineError::InvalidConfiguration(_))
        ));
        assert!(gatherers.is_empty());
    }

    #[test]
    fn test_actor_starts_initializing() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "out",
            BufferConfiguration::actor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        assert_eq!(buffer.get().state(), BufferState::Initializing);
    }

    #[test]
    fn test_actor_put_writes_chain_output() {
        let gatherers = registry();
        let config = BufferConfiguration::actor(GathererConfiguration::Dummy)
            .with_adapter(AdapterConfiguration::scale(0.0, 10.0, 0.0));
        let buffer = Buffer::create("out", config, false, &gatherers).unwrap();
        let seen = recording(&buffer);

        assert!(buffer.put(2.0));
        assert_eq!(buffer.get().value(), Some(2.0));
        assert_eq!(buffer.gatherer().get().value(), Some(20.0));
        // Its own write does not come back as a second change.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_refused_write_faults_buffer() {
        let driver = Arc::new(UnitTestDriver::new());
        driver.initialize().unwrap();
        let gatherers = GathererRegistry::new(driver);
        let buffer = Buffer::create(
            "wrong",
            BufferConfiguration::actor(GathererConfiguration::actor("AI")),
            false,
            &gatherers,
        )
        .unwrap();

        assert!(!buffer.put(1.0));
        assert_eq!(buffer.get().state(), BufferState::Faulted);
    }

    #[test]
    fn test_overlapping_puts_keep_order() {
        let (driver, entered, release) = GatedDriver::new();
        let gatherers = GathererRegistry::new(driver.clone());
        let buffer = actor_on(&gatherers, "out");

        overlapping_puts(&driver, &entered, &release, &buffer, &buffer);

        assert_eq!(*driver.written.lock().unwrap(), vec![1.0, 2.0]);
        assert_eq!(driver.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.get().value(), Some(2.0));
        assert_eq!(buffer.gatherer().get().value(), Some(2.0));
    }

    #[test]
    fn test_shared_actor_gatherer_serializes_writes() {
        let (driver, entered, release) = GatedDriver::new();
        let gatherers = GathererRegistry::new(driver.clone());
        let first = actor_on(&gatherers, "first");
        let second = actor_on(&gatherers, "second");
        assert_eq!(gatherers.len(), 1);

        overlapping_puts(&driver, &entered, &release, &first, &second);

        assert_eq!(*driver.written.lock().unwrap(), vec![1.0, 2.0]);
        assert_eq!(driver.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(first.gatherer().get().value(), Some(2.0));
    }

    #[test]
    fn test_write_distinguishes_refusals() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "out",
            BufferConfiguration::actor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        assert!(matches!(buffer.write(1.0), Ok(true)));

        buffer.gatherer().shutdown();
        assert!(matches!(
            buffer.write(2.0),
            Err(PipelineError::NotWritable(name)) if name == "out"
        ));
        assert_eq!(buffer.get().value(), Some(1.0));
    }

    #[test]
    fn test_put_on_sensor_refused() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "in",
            BufferConfiguration::sensor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        assert!(!buffer.put(1.0));
    }

    #[test]
    fn test_put_refused_while_gatherer_released() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "out",
            BufferConfiguration::actor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        buffer.gatherer().shutdown();
        assert!(!buffer.put(1.0));
    }

    #[test]
    fn test_shared_gatherer_connects_buffers() {
        let gatherers = registry();
        let actor = Buffer::create(
            "writer",
            BufferConfiguration::actor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        let sensor = Buffer::create(
            "reader",
            BufferConfiguration::sensor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();

        actor.put(5.0);
        assert_eq!(sensor.get().value(), Some(5.0));
        assert_eq!(gatherers.len(), 1);
    }

    #[test]
    fn test_gatherer_fault_reaches_actor_buffer() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "out",
            BufferConfiguration::actor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        buffer.gatherer().force_state(BufferState::Faulted);
        assert_eq!(buffer.get().state(), BufferState::Faulted);
    }

    #[test]
    fn test_shutdown_releases_unused_gatherer() {
        let gatherers = registry();
        let first = Buffer::create(
            "a",
            BufferConfiguration::sensor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        let second = Buffer::create(
            "b",
            BufferConfiguration::sensor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        let seen = recording(&first);

        first.shutdown(&gatherers);
        assert!(gatherers.contains(&GathererConfiguration::Dummy));
        assert_eq!(first.get().state(), BufferState::Released);
        assert_eq!(seen.lock().unwrap().len(), 1);

        second.shutdown(&gatherers);
        assert!(!gatherers.contains(&GathererConfiguration::Dummy));
        assert!(!first.put(1.0));
    }

    #[test]
    fn test_released_buffer_ignores_gatherer() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "a",
            BufferConfiguration::sensor(GathererConfiguration::Dummy),
            false,
            &gatherers,
        )
        .unwrap();
        let gatherer = buffer.gatherer().clone();
        buffer.shutdown(&gatherers);
        gatherer.set(3.0, None);
        assert_eq!(buffer.get().state(), BufferState::Released);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lowpass_buffer_ticks() {
        let gatherers = registry();
        let config = BufferConfiguration::sensor(GathererConfiguration::Dummy)
            .with_adapter(AdapterConfiguration::lowpass(0.5));
        let buffer = Buffer::create("smooth", config, false, &gatherers).unwrap();
        assert_eq!(buffer.get().value(), Some(0.0));

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        buffer.subscribe(Arc::new(move |_: &SimpleData| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        buffer.gatherer().set(2.0, None);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(buffer.get().value(), Some(1.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(buffer.get().value(), Some(1.5));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hardware_flag() {
        let gatherers = registry();
        let buffer = Buffer::create(
            "AI",
            BufferConfiguration::sensor(GathererConfiguration::sensor("AI")),
            true,
            &gatherers,
        )
        .unwrap();
        assert!(buffer.is_hardware());
        assert_eq!(buffer.get().state(), BufferState::Faulted);
    }
}
