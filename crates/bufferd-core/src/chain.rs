//! Ordered composition of adapters.

use bufferd_types::{AdapterConfiguration, BufferState, SimpleData};

use crate::adapter::Adapter;

/// The adapters of one buffer, applied in order.
///
/// A value travels down the chain until a stage reports no change. The chain
/// itself also gates its output, so an empty chain still suppresses repeated
/// readings.
#[derive(Debug, Clone)]
pub struct AdapterChain {
    stages: Vec<Adapter>,
    output: SimpleData,
}

impl AdapterChain {
    #[must_use]
    pub fn new(configurations: &[AdapterConfiguration]) -> Self {
        Self {
            stages: configurations.iter().map(Adapter::new).collect(),
            output: SimpleData::with_state("", BufferState::Initializing),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Whether any stage needs the periodic tick.
    #[must_use]
    pub fn is_timer_driven(&self) -> bool {
        self.stages.iter().any(Adapter::is_timer_driven)
    }

    /// Feed a value into the first stage.
    pub fn put(&mut self, input: &SimpleData) -> Option<SimpleData> {
        let output = Self::propagate(&mut self.stages, input.clone())?;
        self.gate(output)
    }

    /// Tick every timer-driven stage and pass their outputs downstream.
    ///
    /// Returns the last output that left the chain.
    pub fn tick(&mut self) -> Option<SimpleData> {
        let mut result = None;
        for index in 0..self.stages.len() {
            let Some(ticked) = self.stages[index].tick() else {
                continue;
            };
            if let Some(output) = Self::propagate(&mut self.stages[index + 1..], ticked)
                && let Some(output) = self.gate(output)
            {
                result = Some(output);
            }
        }
        result
    }

    fn propagate(stages: &mut [Adapter], input: SimpleData) -> Option<SimpleData> {
        stages
            .iter_mut()
            .try_fold(input, |value, stage| stage.value_changed(&value))
    }

    fn gate(&mut self, output: SimpleData) -> Option<SimpleData> {
        if output.same_reading(&self.output) {
            return None;
        }
        self.output = output.clone();
        Some(output)
    }
}
