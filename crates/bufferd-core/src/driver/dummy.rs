use bufferd_types::SimpleData;

use super::{HardwareDriver, PortDescription};
use crate::error::Result;

/// Driver for hosts without hardware. Has no ports.
#[derive(Debug, Default)]
pub struct DummyDriver;

impl HardwareDriver for DummyDriver {
    fn name(&self) -> &str {
        "dummy"
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

    fn set(&self, _port: &str, _value: f64) -> bool {
        false
    }

    fn shutdown(&self) {}
}
