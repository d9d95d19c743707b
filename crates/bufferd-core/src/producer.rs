//! Value-change fan-out shared by gatherers, buffers and the buffer registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bufferd_types::SimpleData;

use crate::lock;

/// Receives value changes from a producer.
///
/// Called synchronously on the producer's thread, outside the producer's own
/// lock.
pub trait ValueChangeConsumer: Send + Sync {
    fn value_changed(&self, value: &SimpleData);
}

impl<F> ValueChangeConsumer for F
where
    F: Fn(&SimpleData) + Send + Sync,
{
    fn value_changed(&self, value: &SimpleData) {
        self(value);
    }
}

/// Handle returned when subscribing to a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

#[derive(Default)]
struct Registered {
    next_id: u64,
    consumers: BTreeMap<ConsumerId, Arc<dyn ValueChangeConsumer>>,
}

/// The consumer list of one producer.
#[derive(Default)]
pub struct Consumers {
    registered: Mutex<Registered>,
}

impl Consumers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, consumer: Arc<dyn ValueChangeConsumer>) -> ConsumerId {
        let mut registered = lock(&self.registered);
        registered.next_id += 1;
        let id = ConsumerId(registered.next_id);
        registered.consumers.insert(id, consumer);
        id
    }

    pub fn unsubscribe(&self, id: ConsumerId) -> bool {
        lock(&self.registered).consumers.remove(&id).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.registered).consumers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registered).consumers.len()
    }

    /// Notify every consumer except `skip`, in subscription order.
    ///
    /// Works on a snapshot, so consumers may subscribe or unsubscribe while
    /// being notified.
    pub fn fire(&self, value: &SimpleData, skip: Option<ConsumerId>) {
        let snapshot: Vec<_> = lock(&self.registered)
            .consumers
            .iter()
            .filter(|(id, _)| Some(**id) != skip)
            .map(|(_, consumer)| consumer.clone())
            .collect();

        for consumer in snapshot {
            consumer.value_changed(value);
        }
    }
}
