//! The daemon's buffer registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bufferd_types::{BufferConfiguration, SimpleData};
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{PipelineError, Result};
use crate::gatherers::GathererRegistry;
use crate::lock;
use crate::producer::{ConsumerId, Consumers, ValueChangeConsumer};

struct Entry {
    buffer: Arc<Buffer>,
    forwarder: ConsumerId,
}

/// All buffers by name, plus a fan-out of every buffer's changes.
pub struct Buffers {
    gatherers: Arc<GathererRegistry>,
    buffers: Mutex<BTreeMap<String, Entry>>,
    consumers: Arc<Consumers>,
}

impl Buffers {
    #[must_use]
    pub fn new(gatherers: Arc<GathererRegistry>) -> Self {
        Self {
            gatherers,
            buffers: Mutex::new(BTreeMap::new()),
            consumers: Arc::new(Consumers::new()),
        }
    }

    #[must_use]
    pub fn gatherers(&self) -> &Arc<GathererRegistry> {
        &self.gatherers
    }

    /// Create a buffer or replace the one with the same name.
    ///
    /// The new buffer is built first; if that fails the registry is
    /// unchanged. Consumers see the new buffer's start value.
    ///
    /// # Errors
    ///
    /// Fails for invalid configurations, and when a non-hardware request
    /// would replace a hardware buffer.
    pub fn create(
        &self,
        name: &str,
        configuration: BufferConfiguration,
        hardware: bool,
    ) -> Result<Arc<Buffer>> {
        let (buffer, replaced) = {
            let mut buffers = lock(&self.buffers);
            if !hardware && buffers.get(name).is_some_and(|entry| entry.buffer.is_hardware()) {
                warn!("Refusing to replace hardware buffer '{}'", name);
                return Err(PipelineError::HardwareBuffer(name.to_string()));
            }

            let buffer = Buffer::create(name, configuration, hardware, &self.gatherers)?;
            let forwarder = buffer.subscribe(self.forwarder());
            let replaced = buffers.insert(
                name.to_string(),
                Entry {
                    buffer: buffer.clone(),
                    forwarder,
                },
            );
            if let Some(old) = &replaced {
                old.buffer.unsubscribe(old.forwarder);
                old.buffer.shutdown(&self.gatherers);
            }
            (buffer, replaced.is_some())
        };

        if replaced {
            info!("Replaced buffer '{}'", name);
        }
        self.consumers.fire(&buffer.get(), None);
        Ok(buffer)
    }

    /// Remove and release a buffer. Consumers see it RELEASED.
    ///
    /// # Errors
    ///
    /// Fails for unknown names and hardware buffers.
    pub fn remove(&self, name: &str) -> Result<()> {
        let entry = {
            let mut buffers = lock(&self.buffers);
            if buffers.get(name).is_some_and(|entry| entry.buffer.is_hardware()) {
                return Err(PipelineError::HardwareBuffer(name.to_string()));
            }
            let entry = buffers
                .remove(name)
                .ok_or_else(|| PipelineError::UnknownBuffer(name.to_string()))?;
            // Creates must not see the gatherer mid-release.
            entry.buffer.shutdown(&self.gatherers);
            entry
        };
        entry.buffer.unsubscribe(entry.forwarder);
        Ok(())
    }

    #[must_use]
    pub fn buffer(&self, name: &str) -> Option<Arc<Buffer>> {
        lock(&self.buffers)
            .get(name)
            .map(|entry| entry.buffer.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        lock(&self.buffers).contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.buffers).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.buffers).is_empty()
    }

    /// Names matching the case-insensitive regex `pattern` anywhere.
    ///
    /// An invalid pattern matches nothing.
    #[must_use]
    pub fn query_by_name(&self, pattern: &str) -> BTreeSet<String> {
        let Some(regex) = compile(pattern) else {
            return BTreeSet::new();
        };
        lock(&self.buffers)
            .keys()
            .filter(|name| regex.is_match(name))
            .cloned()
            .collect()
    }

    /// Names of buffers with a metainfo entry whose topic matches `topic` and
    /// whose value matches `metainfo`.
    #[must_use]
    pub fn query_by_metainfo(&self, topic: &str, metainfo: &str) -> BTreeSet<String> {
        let (Some(topic), Some(metainfo)) = (compile(topic), compile(metainfo)) else {
            return BTreeSet::new();
        };
        lock(&self.buffers)
            .iter()
            .filter(|(_, entry)| {
                entry
                    .buffer
                    .configuration()
                    .metainfo
                    .iter()
                    .any(|(key, value)| topic.is_match(key) && metainfo.is_match(value))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Receive the changes of every buffer, present and future.
    pub fn add_value_change_consumer(&self, consumer: Arc<dyn ValueChangeConsumer>) -> ConsumerId {
        self.consumers.subscribe(consumer)
    }

    pub fn remove_value_change_consumer(&self, id: ConsumerId) -> bool {
        self.consumers.unsubscribe(id)
    }

    /// Release every buffer, then every remaining gatherer.
    pub fn shutdown(&self) {
        let entries = std::mem::take(&mut *lock(&self.buffers));
        info!("Releasing {} buffers", entries.len());
        for entry in entries.into_values() {
            entry.buffer.shutdown(&self.gatherers);
            entry.buffer.unsubscribe(entry.forwarder);
        }
        self.gatherers.shutdown();
    }

    fn forwarder(&self) -> Arc<dyn ValueChangeConsumer> {
        let consumers = self.consumers.clone();
        Arc::new(move |value: &SimpleData| consumers.fire(value, None))
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(regex) => Some(regex),
        Err(e) => {
            debug!("Invalid query pattern '{}': {}", pattern, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DummyDriver;
    use bufferd_types::{AdapterConfiguration, BufferState, GathererConfiguration};

    fn buffers() -> Buffers {
        Buffers::new(Arc::new(GathererRegistry::new(Arc::new(DummyDriver))))
    }

    fn recording(buffers: &Buffers) -> Arc<Mutex<Vec<SimpleData>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        buffers.add_value_change_consumer(Arc::new(move |value: &SimpleData| {
            sink.lock().unwrap().push(value.clone());
        }));
        seen
    }

    fn dummy_sensor() -> BufferConfiguration {
        BufferConfiguration::sensor(GathererConfiguration::Dummy)
    }

    #[test]
    fn test_create_fires_start_value() {
        let buffers = buffers();
        let seen = recording(&buffers);
        buffers.create("a", dummy_sensor(), false).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].buffer_name(), "a");
        assert_eq!(seen[0].value(), Some(0.0));
    }

    #[test]
    fn test_changes_fan_out() {
        let buffers = buffers();
        let buffer = buffers.create("a", dummy_sensor(), false).unwrap();
        let seen = recording(&buffers);

        buffer.gatherer().set(4.0, None);
        assert_eq!(seen.lock().unwrap().last().unwrap().value(), Some(4.0));
    }

    #[test]
    fn test_failed_create_keeps_old_buffer() {
        let buffers = buffers();
        let first = buffers.create("a", dummy_sensor(), false).unwrap();

        let invalid = BufferConfiguration::actor(GathererConfiguration::sensor("AI"));
        assert!(buffers.create("a", invalid, false).is_err());
        assert!(Arc::ptr_eq(&buffers.buffer("a").unwrap(), &first));
        assert!(!buffers.gatherers().contains(&GathererConfiguration::sensor("AI")));
    }

    #[test]
    fn test_replace_releases_old_without_forwarding() {
        let buffers = buffers();
        let old = buffers.create("a", dummy_sensor(), false).unwrap();
        let seen = recording(&buffers);

        let config = dummy_sensor().with_adapter(AdapterConfiguration::scale(0.0, 1.0, 5.0));
        let new = buffers.create("a", config, false).unwrap();

        assert_eq!(old.get().state(), BufferState::Released);
        assert_eq!(new.get().value(), Some(5.0));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value(), Some(5.0));
        // The shared gatherer survived the swap.
        assert!(buffers.gatherers().contains(&GathererConfiguration::Dummy));
    }

    #[test]
    fn test_hardware_buffers_protected() {
        let buffers = buffers();
        buffers
            .create(
                "AI",
                BufferConfiguration::sensor(GathererConfiguration::sensor("AI")),
                true,
            )
            .unwrap();

        assert!(matches!(
            buffers.create("AI", dummy_sensor(), false),
            Err(PipelineError::HardwareBuffer(_))
        ));
        assert!(matches!(
            buffers.remove("AI"),
            Err(PipelineError::HardwareBuffer(_))
        ));
        assert!(buffers.buffer("AI").unwrap().is_hardware());
    }

    #[test]
    fn test_remove_releases_and_notifies() {
        let buffers = buffers();
        buffers.create("a", dummy_sensor(), false).unwrap();
        let seen = recording(&buffers);

        buffers.remove("a").unwrap();
        assert!(!buffers.contains("a"));
        assert!(buffers.gatherers().is_empty());
        assert_eq!(
            seen.lock().unwrap().last().unwrap().state(),
            BufferState::Released
        );
        assert!(matches!(
            buffers.remove("a"),
            Err(PipelineError::UnknownBuffer(_))
        ));
    }

    #[test]
    fn test_query_by_name() {
        let buffers = buffers();
        for name in ["Temperature", "temp_2", "pressure"] {
            buffers.create(name, dummy_sensor(), false).unwrap();
        }

        let found: Vec<_> = buffers.query_by_name("TEMP").into_iter().collect();
        assert_eq!(found, vec!["Temperature".to_string(), "temp_2".to_string()]);
        assert_eq!(buffers.query_by_name(".*").len(), 3);
        assert_eq!(buffers.query_by_name("^pressure$").len(), 1);
        assert!(buffers.query_by_name("(").is_empty());
    }

    #[test]
    fn test_query_by_metainfo() {
        let buffers = buffers();
        buffers
            .create("a", dummy_sensor().with_metainfo("room", "Lab 1"), false)
            .unwrap();
        buffers
            .create("b", dummy_sensor().with_metainfo("room", "office"), false)
            .unwrap();
        buffers
            .create("c", dummy_sensor().with_metainfo("unit", "lab"), false)
            .unwrap();

        let found: Vec<_> = buffers.query_by_metainfo("room", "lab").into_iter().collect();
        assert_eq!(found, vec!["a".to_string()]);
        assert_eq!(buffers.query_by_metainfo(".*", "lab").len(), 2);
        assert!(buffers.query_by_metainfo("[", "lab").is_empty());
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let buffers = buffers();
        let a = buffers.create("a", dummy_sensor(), false).unwrap();
        buffers
            .create("b", BufferConfiguration::sensor(GathererConfiguration::Test), false)
            .unwrap();
        let seen = recording(&buffers);

        buffers.shutdown();
        assert!(buffers.is_empty());
        assert!(buffers.gatherers().is_empty());
        assert_eq!(a.get().state(), BufferState::Released);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
