//! Mapping from user-facing device identifiers to compute devices.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A resolved compute device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComputeDevice {
    /// The host's unified-memory accelerator (identifier `-1`)
    UnifiedMemory,
    /// Indexed discrete accelerator
    Discrete(usize),
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::UnifiedMemory => write!(f, "unified-memory"),
            ComputeDevice::Discrete(id) => write!(f, "discrete:{}", id),
        }
    }
}

impl TryFrom<i64> for ComputeDevice {
    type Error = Error;

    fn try_from(id: i64) -> Result<Self> {
        match id {
            -1 => Ok(ComputeDevice::UnifiedMemory),
            n if n >= 0 => Ok(ComputeDevice::Discrete(n as usize)),
            n => Err(Error::Config(format!(
                "invalid device identifier {}; use -1 or a non-negative index",
                n
            ))),
        }
    }
}

/// Resolve the configured identifiers once, before the first task.
pub fn resolve_devices(ids: &[i64]) -> Result<Vec<ComputeDevice>> {
    if ids.is_empty() {
        return Err(Error::Config("device list must not be empty".to_string()));
    }
    ids.iter().map(|&id| ComputeDevice::try_from(id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_devices() {
        let devices = resolve_devices(&[-1, 0, 3]).unwrap();
        assert_eq!(
            devices,
            vec![
                ComputeDevice::UnifiedMemory,
                ComputeDevice::Discrete(0),
                ComputeDevice::Discrete(3)
            ]
        );
    }

    #[test]
    fn test_resolve_rejects_negative() {
        assert!(matches!(resolve_devices(&[-2]), Err(Error::Config(_))));
        assert!(resolve_devices(&[]).is_err());
    }

    #[test]
    fn test_device_display() {
        assert_eq!(ComputeDevice::UnifiedMemory.to_string(), "unified-memory");
        assert_eq!(ComputeDevice::Discrete(1).to_string(), "discrete:1");
    }
}
