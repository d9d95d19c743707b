//! Hardware driver layer.
//!
//! A [`HardwareDriver`] exposes ports. The [`Driver`] component turns every
//! port into a hardware buffer and polls the driver once per second, feeding
//! changed readings to the sensor gatherers. Actor gatherers write through the
//! driver directly.

mod dummy;

pub use dummy::DummyDriver;
pub use unit_test::{ANALOG_LIMIT, UnitTestDriver};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bufferd_types::{BufferClass, BufferConfiguration, GathererConfiguration, SimpleData};
use tracing::{debug, info};

use crate::buffers::Buffers;
use crate::error::Result;
use crate::lock;
use crate::ticker::{TICK_PERIOD, Ticker};

/// Environment variable selecting a driver by name during auto-selection.
pub const DRIVER_ENV: &str = "BUFFERD_DRIVER";

/// Kind of a hardware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortClass {
    DigitalInput,
    DigitalOutput,
    AnalogInput,
    AnalogOutput,
}

impl PortClass {
    /// Short name, also used as port name by the unit test driver.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::DigitalInput => "DI",
            Self::DigitalOutput => "DO",
            Self::AnalogInput => "AI",
            Self::AnalogOutput => "AO",
        }
    }

    #[must_use]
    pub fn is_output(self) -> bool {
        matches!(self, Self::DigitalOutput | Self::AnalogOutput)
    }

    #[must_use]
    pub fn is_analog(self) -> bool {
        matches!(self, Self::AnalogInput | Self::AnalogOutput)
    }

    #[must_use]
    pub fn buffer_class(self) -> BufferClass {
        if self.is_output() {
            BufferClass::Actor
        } else {
            BufferClass::Sensor
        }
    }
}

/// A port as announced by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescription {
    pub name: String,
    pub class: PortClass,
    pub metainfo: BTreeMap<String, String>,
}

impl PortDescription {
    /// A port with the default `class` and `direction` metainfo.
    #[must_use]
    pub fn new(name: impl Into<String>, class: PortClass) -> Self {
        let direction = if class.is_output() { "output" } else { "input" };
        let metainfo = BTreeMap::from([
            ("class".to_string(), class.code().to_string()),
            ("direction".to_string(), direction.to_string()),
        ]);
        Self {
            name: name.into(),
            class,
            metainfo,
        }
    }

    /// The configuration of the hardware buffer serving this port.
    #[must_use]
    pub fn configuration(&self) -> BufferConfiguration {
        let mut configuration = match self.class.buffer_class() {
            BufferClass::Actor => {
                BufferConfiguration::actor(GathererConfiguration::actor(self.name.clone()))
            }
            BufferClass::Sensor => {
                BufferConfiguration::sensor(GathererConfiguration::sensor(self.name.clone()))
            }
        };
        configuration.metainfo.clone_from(&self.metainfo);
        configuration
    }
}

/// Access to one kind of I/O hardware.
pub trait HardwareDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the hardware is present on this host.
    fn is_suitable(&self) -> bool;

    /// Preferred over other suitable drivers.
    fn is_best_choice(&self) -> bool {
        false
    }

    /// # Errors
    ///
    /// Returns [`crate::PipelineError::Driver`] if the hardware cannot be set up.
    fn initialize(&self) -> Result<()>;

    fn ports(&self) -> Vec<PortDescription>;

    /// Current reading of every port, named by port.
    fn read_values(&self) -> Vec<SimpleData>;

    /// Write an output port. Returns whether the hardware took the value.
    fn set(&self, port: &str, value: f64) -> bool;

    fn shutdown(&self);
}

/// Which driver the daemon runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverChoice {
    /// The best suitable driver
    #[default]
    Auto,
    Dummy,
    UnitTest,
}

/// Instantiate the driver for `choice`.
#[must_use]
pub fn select_driver(choice: DriverChoice) -> Arc<dyn HardwareDriver> {
    let driver: Arc<dyn HardwareDriver> = match choice {
        DriverChoice::Dummy => Arc::new(DummyDriver),
        DriverChoice::UnitTest => Arc::new(UnitTestDriver::new()),
        DriverChoice::Auto => {
            let candidates: Vec<Arc<dyn HardwareDriver>> =
                vec![Arc::new(UnitTestDriver::new()), Arc::new(DummyDriver)];
            let suitable: Vec<_> = candidates
                .into_iter()
                .filter(|driver| driver.is_suitable())
                .collect();
            suitable
                .iter()
                .find(|driver| driver.is_best_choice())
                .or_else(|| suitable.first())
                .cloned()
                .unwrap_or_else(|| Arc::new(DummyDriver))
        }
    };
    info!("Using hardware driver '{}'", driver.name());
    driver
}

/// Runs a driver: creates the hardware buffers and polls readings.
pub struct Driver {
    hardware: Arc<dyn HardwareDriver>,
    buffers: Arc<Buffers>,
    readings: Mutex<HashMap<String, SimpleData>>,
    poller: Mutex<Option<Ticker>>,
}

impl Driver {
    #[must_use]
    pub fn new(hardware: Arc<dyn HardwareDriver>, buffers: Arc<Buffers>) -> Arc<Self> {
        Arc::new(Self {
            hardware,
            buffers,
            readings: Mutex::new(HashMap::new()),
            poller: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn hardware(&self) -> &Arc<dyn HardwareDriver> {
        &self.hardware
    }

    /// Initialize the hardware, create one hardware buffer per port, take a
    /// first reading and start polling. Returns the number of ports.
    ///
    /// # Errors
    ///
    /// Fails if the driver cannot initialize or a port buffer cannot be
    /// created.
    pub fn start(self: &Arc<Self>) -> Result<usize> {
        self.hardware.initialize()?;

        let ports = self.hardware.ports();
        for port in &ports {
            debug!("Creating hardware buffer for port {} ({:?})", port.name, port.class);
            self.buffers.create(&port.name, port.configuration(), true)?;
        }
        self.poll();

        let weak = Arc::downgrade(self);
        *lock(&self.poller) = Ticker::spawn("driver poll", TICK_PERIOD, move || {
            weak.upgrade().is_some_and(|driver: Arc<Driver>| {
                driver.poll();
                true
            })
        });

        info!(
            "Driver '{}' started with {} ports",
            self.hardware.name(),
            ports.len()
        );
        Ok(ports.len())
    }

    /// Read all ports and feed changed readings to the sensor gatherers.
    /// Returns the number of changed readings.
    pub fn poll(&self) -> usize {
        let changed: Vec<SimpleData> = {
            let mut readings = lock(&self.readings);
            self.hardware
                .read_values()
                .into_iter()
                .filter(|reading| {
                    let unchanged = readings
                        .get(reading.buffer_name())
                        .is_some_and(|previous| previous.same_reading(reading));
                    if !unchanged {
                        readings.insert(reading.buffer_name().to_string(), reading.clone());
                    }
                    !unchanged
                })
                .collect()
        };

        for reading in &changed {
            self.buffers
                .gatherers()
                .feed_sensor(reading.buffer_name(), reading);
        }
        changed.len()
    }

    /// Stop polling and shut the hardware down.
    pub fn shutdown(&self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.stop();
        }
        self.hardware.shutdown();
        info!("Driver '{}' shut down", self.hardware.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatherers::GathererRegistry;
    use bufferd_types::BufferState;
    use std::time::Duration;

    fn pipeline(hardware: Arc<dyn HardwareDriver>) -> (Arc<Buffers>, Arc<Driver>) {
        let gatherers = Arc::new(GathererRegistry::new(hardware.clone()));
        let buffers = Arc::new(Buffers::new(gatherers));
        let driver = Driver::new(hardware, buffers.clone());
        (buffers, driver)
    }

    #[test]
    fn test_port_classes() {
        assert_eq!(PortClass::AnalogOutput.buffer_class(), BufferClass::Actor);
        assert_eq!(PortClass::DigitalInput.buffer_class(), BufferClass::Sensor);
        assert!(PortClass::AnalogInput.is_analog());
        assert!(!PortClass::DigitalOutput.is_analog());
    }

    #[test]
    fn test_port_configuration() {
        let output = PortDescription::new("AO", PortClass::AnalogOutput).configuration();
        assert_eq!(output.buffer_class, BufferClass::Actor);
        assert_eq!(output.gatherer, GathererConfiguration::actor("AO"));
        assert_eq!(output.metainfo.get("direction").map(String::as_str), Some("output"));

        let input = PortDescription::new("DI", PortClass::DigitalInput).configuration();
        assert_eq!(input.gatherer, GathererConfiguration::sensor("DI"));
        assert!(input.validate().is_ok());
    }

    #[test]
    fn test_explicit_selection() {
        assert_eq!(select_driver(DriverChoice::Dummy).name(), "dummy");
        assert_eq!(select_driver(DriverChoice::UnitTest).name(), "unit-test");
    }

    #[test]
    fn test_start_creates_hardware_buffers() {
        let hardware = Arc::new(UnitTestDriver::new());
        let (buffers, driver) = pipeline(hardware);

        assert_eq!(driver.start().unwrap(), 4);
        for name in ["AI", "AO", "DI", "DO"] {
            assert!(buffers.buffer(name).unwrap().is_hardware());
        }
        assert_eq!(buffers.buffer("AI").unwrap().get().value(), Some(0.0));
        assert_eq!(
            buffers.buffer("AO").unwrap().get().state(),
            BufferState::Initializing
        );
        driver.shutdown();
    }

    #[test]
    fn test_poll_forwards_changes_only() {
        let hardware = Arc::new(UnitTestDriver::new());
        let (buffers, driver) = pipeline(hardware.clone());
        driver.start().unwrap();

        assert_eq!(driver.poll(), 0);
        hardware.stimulate_port("AI", 12.0).unwrap();
        assert_eq!(driver.poll(), 1);
        assert_eq!(buffers.buffer("AI").unwrap().get().value(), Some(12.0));

        hardware.disturb_port("DI").unwrap();
        driver.poll();
        assert_eq!(
            buffers.buffer("DI").unwrap().get().state(),
            BufferState::Faulted
        );
        driver.shutdown();
    }

    #[test]
    fn test_actor_buffer_writes_hardware() {
        let hardware = Arc::new(UnitTestDriver::new());
        let (buffers, driver) = pipeline(hardware.clone());
        driver.start().unwrap();

        let actor = buffers.buffer("AO").unwrap();
        assert!(actor.put(150.0));
        assert_eq!(hardware.port_value("AO").unwrap().value(), Some(100.0));
        assert_eq!(actor.get().value(), Some(150.0));

        hardware.disturb_port("AO").unwrap();
        assert!(!actor.put(1.0));
        assert_eq!(actor.get().state(), BufferState::Faulted);
        driver.shutdown();
    }

    #[test]
    fn test_dummy_driver_has_no_ports() {
        let (buffers, driver) = pipeline(Arc::new(DummyDriver));
        assert_eq!(driver.start().unwrap(), 0);
        assert!(buffers.is_empty());
        driver.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_runs_every_second() {
        let hardware = Arc::new(UnitTestDriver::new());
        let (buffers, driver) = pipeline(hardware.clone());
        driver.start().unwrap();

        hardware.stimulate_port("AI", 3.0).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(buffers.buffer("AI").unwrap().get().value(), Some(3.0));

        driver.shutdown();
        hardware.stimulate_port("AI", 4.0).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(buffers.buffer("AI").unwrap().get().value(), Some(3.0));
    }
}
