//! Registry sharing one gatherer per configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bufferd_types::{GathererConfiguration, SimpleData};
use tracing::debug;

use crate::driver::HardwareDriver;
use crate::gatherer::Gatherer;
use crate::lock;

/// Hands out gatherers keyed by configuration.
///
/// Equal configurations get the same instance until it is released. Lookups
/// and releases for one configuration must not race; the buffer registry
/// serializes them.
pub struct GathererRegistry {
    driver: Arc<dyn HardwareDriver>,
    gatherers: Mutex<HashMap<GathererConfiguration, Arc<Gatherer>>>,
}

impl GathererRegistry {
    #[must_use]
    pub fn new(driver: Arc<dyn HardwareDriver>) -> Self {
        Self {
            driver,
            gatherers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn HardwareDriver> {
        &self.driver
    }

    /// The gatherer for `configuration`, created on first use.
    pub fn gatherer_for(&self, configuration: &GathererConfiguration) -> Arc<Gatherer> {
        lock(&self.gatherers)
            .entry(configuration.clone())
            .or_insert_with(|| Gatherer::new(configuration.clone(), self.driver.clone()))
            .clone()
    }

    #[must_use]
    pub fn contains(&self, configuration: &GathererConfiguration) -> bool {
        lock(&self.gatherers).contains_key(configuration)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.gatherers).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.gatherers).is_empty()
    }

    /// Release the gatherer if no buffer uses it anymore.
    pub fn release_if_unused(&self, configuration: &GathererConfiguration) -> bool {
        let released = {
            let mut gatherers = lock(&self.gatherers);
            let unused = gatherers
                .get(configuration)
                .is_some_and(|gatherer| !gatherer.has_consumers());
            if unused {
                gatherers.remove(configuration)
            } else {
                None
            }
        };

        match released {
            Some(gatherer) => {
                debug!("Releasing unused gatherer {}", configuration);
                gatherer.shutdown();
                true
            }
            None => false,
        }
    }

    /// Forward a polled reading to the sensor gatherer of `port`, if any.
    pub fn feed_sensor(&self, port: &str, reading: &SimpleData) -> bool {
        let gatherer = lock(&self.gatherers)
            .get(&GathererConfiguration::sensor(port))
            .cloned();
        match gatherer {
            Some(gatherer) => {
                gatherer.feed(reading);
                true
            }
            None => false,
        }
    }

    /// Release every gatherer.
    pub fn shutdown(&self) {
        let gatherers: Vec<_> = lock(&self.gatherers).drain().map(|(_, g)| g).collect();
        debug!("Releasing {} gatherers", gatherers.len());
        for gatherer in gatherers {
            gatherer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;
    use bufferd_types::BufferState;

    fn registry() -> GathererRegistry {
        GathererRegistry::new(Arc::new(DummyDriver))
    }

    #[test]
    fn test_equal_configurations_share_instance() {
        let registry = registry();
        let a = registry.gatherer_for(&GathererConfiguration::sensor("AI"));
        let b = registry.gatherer_for(&GathererConfiguration::sensor("AI"));
        let c = registry.gatherer_for(&GathererConfiguration::sensor("DI"));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_used_gatherer_is_kept() {
        let registry = registry();
        let gatherer = registry.gatherer_for(&GathererConfiguration::Dummy);
        let id = gatherer.subscribe(Arc::new(|_: &SimpleData| {}));

        assert!(!registry.release_if_unused(&GathererConfiguration::Dummy));
        assert!(registry.contains(&GathererConfiguration::Dummy));

        gatherer.unsubscribe(id);
        assert!(registry.release_if_unused(&GathererConfiguration::Dummy));
        assert!(!registry.contains(&GathererConfiguration::Dummy));
        assert_eq!(gatherer.state(), BufferState::Released);
    }

    #[test]
    fn test_released_gatherer_is_replaced() {
        let registry = registry();
        let first = registry.gatherer_for(&GathererConfiguration::Dummy);
        registry.release_if_unused(&GathererConfiguration::Dummy);

        let second = registry.gatherer_for(&GathererConfiguration::Dummy);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), BufferState::Ready);
    }

    #[test]
    fn test_release_unknown_is_noop() {
        assert!(!registry().release_if_unused(&GathererConfiguration::Test));
    }

    #[test]
    fn test_feed_sensor_reaches_matching_gatherer() {
        let registry = registry();
        let gatherer = registry.gatherer_for(&GathererConfiguration::sensor("AI"));

        assert!(registry.feed_sensor("AI", &SimpleData::ready("AI", 3.0)));
        assert_eq!(gatherer.get().value(), Some(3.0));
        assert!(!registry.feed_sensor("DI", &SimpleData::ready("DI", 1.0)));
    }

    #[test]
    fn test_shutdown_releases_all() {
        let registry = registry();
        let gatherer = registry.gatherer_for(&GathererConfiguration::Dummy);
        registry.shutdown();
        assert!(registry.is_empty());
        assert_eq!(gatherer.state(), BufferState::Released);
    }
}
