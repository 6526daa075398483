//! Device handles, the backend registry, and tensor-construction config.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::{Result, TensorError};

/// Shared handle to a backend. Cheap to clone; two devices are equal when
/// their backends carry the same name.
#[derive(Clone)]
pub struct Device(Arc<dyn Backend>);

impl Device {
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Device(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn Backend>) -> Self {
        Device(backend)
    }

    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// Whether the backend can run on this machine.
    pub fn is_enabled(&self) -> bool {
        self.0.is_enabled()
    }

    pub fn backend(&self) -> &dyn Backend {
        self.0.as_ref()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.name())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type DeviceFactory = Box<dyn Fn() -> Device + Send + Sync>;

/// Maps device tags ("cpu", ...) to backend constructors.
#[derive(Default)]
pub struct DeviceRegistry {
    factories: BTreeMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `tag`.
    pub fn register<F>(&mut self, tag: &str, factory: F)
    where
        F: Fn() -> Device + Send + Sync + 'static,
    {
        self.factories.insert(tag.to_string(), Box::new(factory));
    }

    /// Resolve a tag to a device.
    pub fn get(&self, tag: &str) -> Result<Device> {
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| TensorError::UnknownDevice(tag.to_string()))?;
        let device = factory();
        debug!("resolved device `{tag}` (enabled: {})", device.is_enabled());
        Ok(device)
    }

    /// True when `tag` is registered and its backend is enabled.
    pub fn is_available(&self, tag: &str) -> bool {
        self.factories
            .get(tag)
            .map(|factory| factory().is_enabled())
            .unwrap_or(false)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

/// When a derived tensor computes its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// On first read.
    #[default]
    Lazy,
    /// As soon as the node is built.
    Eager,
}

/// Device, dtype and execution mode for new leaf tensors.
///
/// There is no process-wide default; entry points build one of these and
/// pass it down.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub device: Device,
    pub dtype: DType,
    pub mode: ExecutionMode,
}

impl Config {
    pub fn new(device: Device) -> Self {
        Config {
            device,
            dtype: DType::default(),
            mode: ExecutionMode::default(),
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stub(&'static str, bool);

    impl Backend for Stub {
        fn name(&self) -> &str {
            self.0
        }

        fn is_enabled(&self) -> bool {
            self.1
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.register("stub", || Device::new(Stub("stub", true)));
        registry.register("gpu", || Device::new(Stub("gpu", false)));

        assert_eq!(registry.get("stub").unwrap().name(), "stub");
        assert!(registry.is_available("stub"));
        assert!(!registry.is_available("gpu"));
        assert!(!registry.is_available("tpu"));
        assert!(matches!(
            registry.get("tpu"),
            Err(TensorError::UnknownDevice(tag)) if tag == "tpu"
        ));
        assert_eq!(registry.tags().collect::<Vec<_>>(), vec!["gpu", "stub"]);
    }

    #[test]
    fn test_device_equality_by_name() {
        let a = Device::new(Stub("stub", true));
        let b = Device::new(Stub("stub", true));
        assert_eq!(a, b);
        assert_ne!(a, Device::new(Stub("other", true)));
    }

    #[test]
    fn test_config_builders() {
        let cfg = Config::new(Device::new(Stub("stub", true)))
            .with_dtype(DType::Float64)
            .with_mode(ExecutionMode::Eager);
        assert_eq!(cfg.dtype, DType::Float64);
        assert_eq!(cfg.mode, ExecutionMode::Eager);
    }
}
