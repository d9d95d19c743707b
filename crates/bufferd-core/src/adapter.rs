//! Single transform stages of an adapter chain.
//!
//! Every stage remembers its last output and only reports outputs that are a
//! different reading (state or value beyond the tolerance). Non-ready inputs
//! pass straight through all stages.

use bufferd_types::{AdapterConfiguration, BufferState, SimpleData};

#[derive(Debug, Clone, PartialEq)]
enum Stage {
    Dummy,
    Scale {
        a: f64,
        b: f64,
        c: f64,
    },
    Trigger {
        lower: f64,
        upper: f64,
        lower_output: f64,
        upper_output: f64,
    },
    Lowpass {
        factor: f64,
        input: Option<f64>,
        last: f64,
    },
    Filter {
        minimum_difference: f64,
    },
}

impl Stage {
    fn new(configuration: &AdapterConfiguration) -> Self {
        match *configuration {
            AdapterConfiguration::Dummy => Self::Dummy,
            AdapterConfiguration::Scale { a, b, c } => Self::Scale { a, b, c },
            AdapterConfiguration::Trigger {
                lower_threshold,
                upper_threshold,
                lower_output,
                upper_output,
            } => Self::Trigger {
                lower: lower_threshold,
                upper: upper_threshold.max(lower_threshold),
                lower_output,
                upper_output,
            },
            AdapterConfiguration::Lowpass {
                interpolation_factor,
            } => Self::Lowpass {
                factor: interpolation_factor.clamp(0.0, 1.0),
                input: None,
                last: 0.0,
            },
            AdapterConfiguration::Filter { minimum_difference } => Self::Filter {
                minimum_difference: minimum_difference.abs(),
            },
        }
    }
}

/// One stage with its output gate.
#[derive(Debug, Clone)]
pub struct Adapter {
    stage: Stage,
    current: SimpleData,
}

impl Adapter {
    #[must_use]
    pub fn new(configuration: &AdapterConfiguration) -> Self {
        Self {
            stage: Stage::new(configuration),
            current: SimpleData::with_state("", BufferState::Initializing),
        }
    }

    /// The last value this stage emitted.
    #[must_use]
    pub fn current(&self) -> &SimpleData {
        &self.current
    }

    #[must_use]
    pub fn is_timer_driven(&self) -> bool {
        matches!(self.stage, Stage::Lowpass { .. })
    }

    /// Feed an input; returns the new output if it changed.
    pub fn value_changed(&mut self, input: &SimpleData) -> Option<SimpleData> {
        let was_ready = self.current.is_ready();

        let Some(x) = input.value() else {
            if let Stage::Lowpass { input: last_input, .. } = &mut self.stage {
                *last_input = None;
            }
            return self.emit(input.clone());
        };
        let name = input.buffer_name();

        let candidate = match &mut self.stage {
            Stage::Dummy => input.clone(),
            Stage::Scale { a, b, c } => SimpleData::ready(name, *a * x * x + *b * x + *c),
            Stage::Trigger {
                lower,
                upper,
                lower_output,
                upper_output,
            } => {
                if x >= *upper {
                    SimpleData::ready(name, *upper_output)
                } else if !was_ready || x <= *lower {
                    SimpleData::ready(name, *lower_output)
                } else {
                    return None;
                }
            }
            Stage::Lowpass {
                input: last_input,
                last,
                ..
            } => {
                *last_input = Some(x);
                if was_ready {
                    return None;
                }
                *last = 0.0;
                SimpleData::ready(name, 0.0)
            }
            Stage::Filter { minimum_difference } => match self.current.value() {
                Some(previous) if (x - previous).abs() < *minimum_difference => return None,
                _ => input.clone(),
            },
        };

        self.emit(candidate)
    }

    /// Advance a timer-driven stage by one period.
    pub fn tick(&mut self) -> Option<SimpleData> {
        let Stage::Lowpass {
            factor,
            input: Some(x),
            last,
        } = &mut self.stage
        else {
            return None;
        };
        if !self.current.is_ready() {
            return None;
        }

        let output = *x + *factor * (*last - *x);
        *last = output;
        let candidate = SimpleData::ready(self.current.buffer_name(), output);
        self.emit(candidate)
    }

    fn emit(&mut self, candidate: SimpleData) -> Option<SimpleData> {
        if candidate.same_reading(&self.current) {
            return None;
        }
        self.current = candidate.clone();
        Some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(value: f64) -> SimpleData {
        SimpleData::ready("in", value)
    }

    fn faulted() -> SimpleData {
        SimpleData::with_state("in", BufferState::Faulted)
    }

    fn value_of(output: Option<SimpleData>) -> Option<f64> {
        output.and_then(|data| data.value())
    }

    #[test]
    fn test_dummy_is_identity() {
        let mut adapter = Adapter::new(&AdapterConfiguration::Dummy);
        assert_eq!(value_of(adapter.value_changed(&ready(4.2))), Some(4.2));
    }

    #[test]
    fn test_same_value_twice_emits_once() {
        let mut adapter = Adapter::new(&AdapterConfiguration::Dummy);
        assert!(adapter.value_changed(&ready(1.0)).is_some());
        assert!(adapter.value_changed(&ready(1.0)).is_none());
        assert!(adapter.value_changed(&ready(1.0 + 1e-9)).is_none());
        assert!(adapter.value_changed(&ready(1.1)).is_some());
    }

    #[test]
    fn test_scale_polynomial() {
        let mut adapter = Adapter::new(&AdapterConfiguration::scale(0.0, 2.0, 1.0));
        assert_eq!(value_of(adapter.value_changed(&ready(10.0))), Some(21.0));

        let mut square = Adapter::new(&AdapterConfiguration::scale(1.0, 0.0, 0.0));
        assert_eq!(value_of(square.value_changed(&ready(-3.0))), Some(9.0));
    }

    #[test]
    fn test_scale_passes_states() {
        let mut adapter = Adapter::new(&AdapterConfiguration::scale(0.0, 2.0, 1.0));
        let output = adapter.value_changed(&faulted()).unwrap();
        assert_eq!(output.state(), BufferState::Faulted);
        assert!(output.value().is_none());
    }

    #[test]
    fn test_trigger_hysteresis() {
        let mut adapter = Adapter::new(&AdapterConfiguration::trigger(0.33, 0.67, 1.0, 0.0));
        assert!(adapter.value_changed(&faulted()).is_some());

        // Entering READY inside the dead zone picks the lower output.
        assert_eq!(value_of(adapter.value_changed(&ready(0.6))), Some(1.0));
        assert!(adapter.value_changed(&ready(0.5)).is_none());
        assert!(adapter.value_changed(&ready(0.4)).is_none());

        assert_eq!(value_of(adapter.value_changed(&ready(0.67))), Some(0.0));
        assert!(adapter.value_changed(&ready(0.5)).is_none());
        assert_eq!(value_of(adapter.value_changed(&ready(0.33))), Some(1.0));
    }

    #[test]
    fn test_trigger_entering_ready_above_upper() {
        let mut adapter = Adapter::new(&AdapterConfiguration::trigger(0.33, 0.67, 1.0, 0.0));
        assert_eq!(value_of(adapter.value_changed(&ready(0.9))), Some(0.0));
    }

    #[test]
    fn test_trigger_upper_below_lower_is_lifted() {
        // upper < lower behaves like upper == lower
        let mut adapter = Adapter::new(&AdapterConfiguration::trigger(0.5, 0.1, -1.0, 1.0));
        assert_eq!(value_of(adapter.value_changed(&ready(0.3))), Some(-1.0));
        assert_eq!(value_of(adapter.value_changed(&ready(0.5))), Some(1.0));
    }

    #[test]
    fn test_lowpass_enters_ready_at_zero() {
        let mut adapter = Adapter::new(&AdapterConfiguration::lowpass(0.9));
        assert_eq!(value_of(adapter.value_changed(&ready(2.0))), Some(0.0));
        // Further inputs only take effect on the next tick.
        assert!(adapter.value_changed(&ready(3.0)).is_none());
    }

    #[test]
    fn test_lowpass_ticks() {
        let mut adapter = Adapter::new(&AdapterConfiguration::lowpass(0.9));
        adapter.value_changed(&ready(2.0));

        let first = value_of(adapter.tick()).unwrap();
        assert!((first - 0.2).abs() < 1e-9);
        let second = value_of(adapter.tick()).unwrap();
        assert!((second - 0.38).abs() < 1e-9);
    }

    #[test]
    fn test_lowpass_passes_states_immediately() {
        let mut adapter = Adapter::new(&AdapterConfiguration::lowpass(0.9));
        adapter.value_changed(&ready(2.0));
        let output = adapter.value_changed(&faulted()).unwrap();
        assert_eq!(output.state(), BufferState::Faulted);
        assert!(adapter.tick().is_none());

        // Re-entering READY restarts from zero.
        assert_eq!(value_of(adapter.value_changed(&ready(5.0))), Some(0.0));
        let tick = value_of(adapter.tick()).unwrap();
        assert!((tick - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_lowpass_factor_clamped() {
        let mut adapter = Adapter::new(&AdapterConfiguration::Lowpass {
            interpolation_factor: 7.0,
        });
        adapter.value_changed(&ready(2.0));
        // factor 1 holds the last output
        assert!(adapter.tick().is_none());
    }

    #[test]
    fn test_lowpass_without_ready_input_does_not_tick() {
        let mut adapter = Adapter::new(&AdapterConfiguration::lowpass(0.5));
        assert!(adapter.tick().is_none());
    }

    #[test]
    fn test_filter_suppresses_small_changes() {
        let mut adapter = Adapter::new(&AdapterConfiguration::filter(0.5));
        assert_eq!(value_of(adapter.value_changed(&ready(1.0))), Some(1.0));
        assert!(adapter.value_changed(&ready(1.4)).is_none());
        assert_eq!(value_of(adapter.value_changed(&ready(1.6))), Some(1.6));
        assert!(adapter.value_changed(&ready(1.2)).is_none());
    }

    #[test]
    fn test_filter_state_changes_always_pass() {
        let mut adapter = Adapter::new(&AdapterConfiguration::filter(10.0));
        adapter.value_changed(&ready(1.0));
        assert!(adapter.value_changed(&faulted()).is_some());
        assert_eq!(value_of(adapter.value_changed(&ready(1.5))), Some(1.5));
    }

    #[test]
    fn test_timer_driven_flag() {
        assert!(Adapter::new(&AdapterConfiguration::lowpass(0.5)).is_timer_driven());
        assert!(!Adapter::new(&AdapterConfiguration::filter(0.5)).is_timer_driven());
    }
}
