/*!

A [`Device`] executes [kernels](crate::kernel) and owns [buffers](crate::buffer) and [images](crate::image).

Devices are described by a [`DeviceInfo`], which holds the capabilities that kernels are negotiated against.
Devices are created by a [`Context`](crate::context::Context):
```
# use xcompute::{anyhow::Result, context::Context, device::DeviceInfo};
# fn main() -> Result<()> {
let context = Context::builder()
    .device(DeviceInfo::new("gpu0").with_max_total_local_size(256))
    .build()?;
let device = &context.devices()[0];
assert_eq!(device.info().max_total_local_size(), 256);
# Ok(())
# }
```

# Host functions
The host engine executes kernels on the CPU. Each entry point resolves to a [`HostFunction`]
registered on the device by name, entry points without one are unavailable on that device.

# Vulkan
With the `device` feature, [`Backend::Vulkan`] creates the device on a Vulkan physical device.
Its [`DeviceInfo`] is queried from the physical device, and entry points are compiled into
compute pipelines from their SPIR-V.
*/

use crate::{
    descriptor::{DescriptorSet, DescriptorWrite},
    image::ImageFormat,
    queue::CommandBuffer,
};
use anyhow::Result;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, Display},
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use xcompute_core::{function::FunctionInfo, work_group::LocalSizeLimits};

mod host_engine;
use host_engine::{HostEntry, HostMemory, HostModule};
pub use host_engine::{HostFunction, Invocation};

#[cfg(feature = "device")]
mod vulkan_engine;
#[cfg(feature = "device")]
pub(crate) use vulkan_engine::NativeDescriptorSet;
#[cfg(feature = "device")]
use vulkan_engine::{VulkanEntry, VulkanMemory, VulkanModule};

/// Errors.
pub mod error {
    use std::fmt::{self, Display};

    /// Native error codes.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::IsVariant)]
    pub enum NativeCode {
        InitializationFailed,
        InvalidModule,
        FunctionNotFound,
        OutOfDeviceMemory,
        InvalidMemoryType,
        InvalidDescriptor,
        ExecutionFailed,
        /// The backend does not support the operation.
        Unsupported,
    }

    /// A native (backend) call failed.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("{operation} failed on Device({device}): {code:?}: {message}")]
    pub struct NativeError {
        pub(crate) device: usize,
        pub(crate) operation: &'static str,
        pub(crate) code: NativeCode,
        pub(crate) message: String,
    }

    impl NativeError {
        pub(crate) fn new(
            device: usize,
            operation: &'static str,
            code: NativeCode,
            message: impl Into<String>,
        ) -> Self {
            Self {
                device,
                operation,
                code,
                message: message.into(),
            }
        }
        /// The device index.
        pub fn device(&self) -> usize {
            self.device
        }
        /// The failed operation.
        pub fn operation(&self) -> &'static str {
            self.operation
        }
        pub fn code(&self) -> NativeCode {
            self.code
        }
    }

    /// The Device was lost.
    ///
    /// A submission failed to execute, or its queue shut down before it completed.
    #[derive(Clone, Debug, thiserror::Error)]
    pub struct DeviceLost {
        pub(crate) device: usize,
        pub(crate) reason: String,
    }

    impl DeviceLost {
        pub fn device(&self) -> usize {
            self.device
        }
        pub fn reason(&self) -> &str {
            &self.reason
        }
    }

    impl Display for DeviceLost {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "Device({}) lost: {}", self.device, self.reason)
        }
    }

    /// The memory is not in host address space.
    ///
    /// Only memory of the host backend can be accessed without a queue.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Memory of Device({device}) is not host accessible!")]
    pub struct HostAccessUnavailable {
        pub(crate) device: usize,
    }
}
use error::*;

/// The backend of a device.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum Backend {
    /// Executes [`HostFunction`]s on the CPU.
    #[default]
    Host,
    /// A Vulkan physical device, by enumeration order.
    #[cfg(feature = "device")]
    Vulkan { physical_device: usize },
}

/// Builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Device`].
    pub struct DeviceBuilder {
        pub(super) index: usize,
        pub(super) info: DeviceInfo,
        pub(super) backend: Backend,
    }

    impl DeviceBuilder {
        /// Index of the device, defaults to 0.
        pub fn index(mut self, index: usize) -> Self {
            self.index = index;
            self
        }
        /// The device descriptor.
        ///
        /// Ignored by [`Backend::Vulkan`], which queries it.
        pub fn info(mut self, info: DeviceInfo) -> Self {
            self.info = info;
            self
        }
        /// The backend, defaults to [`Backend::Host`].
        pub fn backend(mut self, backend: Backend) -> Self {
            self.backend = backend;
            self
        }
        /// Creates a device.
        ///
        /// **errors**
        /// The engine or its fixed sampler set could not be created.
        pub fn build(self) -> Result<Device> {
            let inner = match self.backend {
                Backend::Host => {
                    DeviceInner::Host(host_engine::Engine::new(self.index, Arc::new(self.info))?)
                }
                #[cfg(feature = "device")]
                Backend::Vulkan { physical_device } => {
                    DeviceInner::Vulkan(vulkan_engine::Engine::new(self.index, physical_device)?)
                }
            };
            Ok(Device { inner })
        }
    }
}
use builder::*;

/// Matches every backend variant of `$enum`, binding the payload to `$x`.
macro_rules! dispatch {
    ($enum:ident, $value:expr, $x:ident => $body:expr) => {
        match $value {
            $enum::Host($x) => $body,
            #[cfg(feature = "device")]
            $enum::Vulkan($x) => $body,
        }
    };
}

pub(crate) trait DeviceEngine: Send + Sync + Sized {
    type Module: Send + Sync;
    type Entry: Send + Sync;
    type Memory: DeviceEngineMemory;
    fn index(&self) -> usize;
    fn info(&self) -> &Arc<DeviceInfo>;
    /// Set 0 of every pipeline.
    fn fixed_samplers(&self) -> &DescriptorSet;
    fn create_module(&self, words: &[u32]) -> Result<Arc<Self::Module>, NativeError>;
    /// Creates the native entry and queries its max total local size.
    fn create_entry(
        &self,
        module: &Arc<Self::Module>,
        info: &FunctionInfo,
    ) -> Result<(Self::Entry, u32), NativeError>;
    fn alloc(self: &Arc<Self>, desc: &MemoryDesc, memory_type: u32)
        -> Result<Self::Memory, NativeError>;
    /// Validates all writes before applying any.
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<(), NativeError>;
    fn execute(&self, command_buffer: &CommandBuffer) -> Result<(), NativeError>;
    fn live_memory(&self) -> usize;
}

pub(crate) trait DeviceEngineMemory: Send + Sync {
    fn len(&self) -> usize;
    fn memory_type(&self) -> u32;
    /// Copies the whole memory into `data`.
    fn read(&self, data: &mut [u8]) -> Result<(), NativeError>;
    /// Copies `data` to `offset`.
    ///
    /// Image memory is written one mip level at a time.
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), NativeError>;
}

/// What an allocation backs.
#[derive(Clone, Debug)]
pub(crate) enum MemoryDesc {
    Buffer {
        len: usize,
    },
    Image {
        extent: [u32; 3],
        format: ImageFormat,
        /// The byte range of each mip level.
        levels: Vec<Range<usize>>,
    },
}

impl MemoryDesc {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Buffer { len } => *len,
            Self::Image { levels, .. } => levels.last().map_or(0, |level| level.end),
        }
    }
}

pub(crate) enum RawModule {
    Host(Arc<HostModule>),
    #[cfg(feature = "device")]
    Vulkan(Arc<VulkanModule>),
}

#[derive(Clone)]
pub(crate) enum RawEntry {
    Host(Arc<HostEntry>),
    #[cfg(feature = "device")]
    Vulkan(Arc<VulkanEntry>),
}

impl RawEntry {
    pub(crate) fn host(&self) -> Option<&HostEntry> {
        match self {
            Self::Host(entry) => Some(entry),
            #[cfg(feature = "device")]
            _ => None,
        }
    }
    #[cfg(feature = "device")]
    pub(crate) fn vulkan(&self) -> Option<&VulkanEntry> {
        match self {
            Self::Vulkan(entry) => Some(entry),
            _ => None,
        }
    }
}

pub(crate) enum RawMemory {
    Host(HostMemory),
    #[cfg(feature = "device")]
    Vulkan(VulkanMemory),
}

impl RawMemory {
    pub(crate) fn host(&self) -> Option<&HostMemory> {
        match self {
            Self::Host(memory) => Some(memory),
            #[cfg(feature = "device")]
            _ => None,
        }
    }
    #[cfg(feature = "device")]
    pub(crate) fn vulkan(&self) -> Option<&VulkanMemory> {
        match self {
            Self::Vulkan(memory) => Some(memory),
            _ => None,
        }
    }
    /// The contents of host memory of Device(`device`).
    pub(crate) fn contents(
        &self,
        device: usize,
    ) -> Result<RwLockReadGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.host()
            .map(HostMemory::map)
            .ok_or(HostAccessUnavailable { device })
    }
    pub(crate) fn contents_mut(
        &self,
        device: usize,
    ) -> Result<RwLockWriteGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.host()
            .map(HostMemory::map_mut)
            .ok_or(HostAccessUnavailable { device })
    }
}

impl DeviceEngineMemory for RawMemory {
    fn len(&self) -> usize {
        dispatch!(RawMemory, self, memory => memory.len())
    }
    fn memory_type(&self) -> u32 {
        dispatch!(RawMemory, self, memory => memory.memory_type())
    }
    fn read(&self, data: &mut [u8]) -> Result<(), NativeError> {
        dispatch!(RawMemory, self, memory => memory.read(data))
    }
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), NativeError> {
        dispatch!(RawMemory, self, memory => memory.write(offset, data))
    }
}

pub(crate) fn next_handle() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
enum DeviceInner {
    Host(Arc<host_engine::Engine>),
    #[cfg(feature = "device")]
    Vulkan(Arc<vulkan_engine::Engine>),
}

/** A device.

Devices can be cloned, which is equivalent to [`Arc::clone()`].

Devices are unique, two devices created from the same [`DeviceInfo`] are not equal.
*/
#[derive(Clone)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            index: 0,
            info: DeviceInfo::default(),
            backend: Backend::default(),
        }
    }
    /// The index of the device in its context.
    pub fn index(&self) -> usize {
        dispatch!(DeviceInner, &self.inner, engine => engine.index())
    }
    /// Device info.
    pub fn info(&self) -> &Arc<DeviceInfo> {
        dispatch!(DeviceInner, &self.inner, engine => engine.info())
    }
    pub fn backend(&self) -> Backend {
        match &self.inner {
            DeviceInner::Host(_) => Backend::Host,
            #[cfg(feature = "device")]
            DeviceInner::Vulkan(engine) => engine.backend(),
        }
    }
    /// Registers `function` for entry points named `name`.
    ///
    /// Replaces a previously registered function. Only affects programs created afterwards.
    /// Ignored (with a warning) by devices that do not execute on the host.
    pub fn register_function(&self, name: impl Into<String>, function: HostFunction) {
        let name = name.into();
        match &self.inner {
            DeviceInner::Host(engine) => engine.register_function(name, function),
            #[cfg(feature = "device")]
            DeviceInner::Vulkan(_) => {
                log::warn!("{self:?} does not execute host functions, ignoring {name:?}");
            }
        }
    }
    /// The number of live memory objects (buffers and images) on the device.
    pub fn live_buffers(&self) -> usize {
        dispatch!(DeviceInner, &self.inner, engine => engine.live_memory())
    }
    pub(crate) fn fixed_samplers(&self) -> &DescriptorSet {
        dispatch!(DeviceInner, &self.inner, engine => engine.fixed_samplers())
    }
    pub(crate) fn create_module(&self, words: &[u32]) -> Result<RawModule, NativeError> {
        match &self.inner {
            DeviceInner::Host(engine) => engine.create_module(words).map(RawModule::Host),
            #[cfg(feature = "device")]
            DeviceInner::Vulkan(engine) => engine.create_module(words).map(RawModule::Vulkan),
        }
    }
    pub(crate) fn create_entry(
        &self,
        module: &RawModule,
        info: &FunctionInfo,
    ) -> Result<(RawEntry, u32), NativeError> {
        match (&self.inner, module) {
            (DeviceInner::Host(engine), RawModule::Host(module)) => {
                let (entry, max_total_local_size) = engine.create_entry(module, info)?;
                Ok((RawEntry::Host(Arc::new(entry)), max_total_local_size))
            }
            #[cfg(feature = "device")]
            (DeviceInner::Vulkan(engine), RawModule::Vulkan(module)) => {
                let (entry, max_total_local_size) = engine.create_entry(module, info)?;
                Ok((RawEntry::Vulkan(Arc::new(entry)), max_total_local_size))
            }
            #[cfg(feature = "device")]
            _ => Err(NativeError::new(
                self.index(),
                "create_entry",
                NativeCode::InvalidModule,
                format!("the module of {:?} belongs to another backend", info.name),
            )),
        }
    }
    pub(crate) fn alloc(&self, desc: &MemoryDesc, memory_type: u32) -> Result<RawMemory, NativeError> {
        match &self.inner {
            DeviceInner::Host(engine) => engine.alloc(desc, memory_type).map(RawMemory::Host),
            #[cfg(feature = "device")]
            DeviceInner::Vulkan(engine) => engine.alloc(desc, memory_type).map(RawMemory::Vulkan),
        }
    }
    pub(crate) fn update_descriptor_sets(
        &self,
        writes: &[DescriptorWrite],
    ) -> Result<(), NativeError> {
        dispatch!(DeviceInner, &self.inner, engine => engine.update_descriptor_sets(writes))
    }
    pub(crate) fn execute(&self, command_buffer: &CommandBuffer) -> Result<(), NativeError> {
        dispatch!(DeviceInner, &self.inner, engine => engine.execute(command_buffer))
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (DeviceInner::Host(a), DeviceInner::Host(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "device")]
            (DeviceInner::Vulkan(a), DeviceInner::Vulkan(b)) => Arc::ptr_eq(a, b),
            #[cfg(feature = "device")]
            _ => false,
        }
    }
}

impl Eq for Device {}

/// Prints `Device(index, name)`.
impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({}, {:?})", self.index(), self.info().name())
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Memory type indices of a device.
///
/// Missing types are `None`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MemoryTypeIndices {
    pub device_local: Option<u32>,
    pub host_cached: Option<u32>,
    pub host_uncached: Option<u32>,
}

impl MemoryTypeIndices {
    /// Whether `index` is one of the memory types.
    pub fn contains(&self, index: u32) -> bool {
        [self.device_local, self.host_cached, self.host_uncached]
            .into_iter()
            .any(|x| x == Some(index))
    }
}

impl Default for MemoryTypeIndices {
    fn default() -> Self {
        Self {
            device_local: Some(0),
            host_cached: Some(1),
            host_uncached: Some(2),
        }
    }
}

/// Device info.
///
/// Immutable once the device is created.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    name: String,
    max_local_size: [u32; 3],
    max_total_local_size: u32,
    memory_types: MemoryTypeIndices,
    max_push_constants_size: u32,
}

impl DeviceInfo {
    /// A device named `name` with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Max local size per dimension.
    pub fn max_local_size(&self) -> [u32; 3] {
        self.max_local_size
    }
    /// Adds `max_local_size`.
    pub fn with_max_local_size(mut self, max_local_size: [u32; 3]) -> Self {
        self.max_local_size = max_local_size;
        self
    }
    /// Max product of the local size.
    pub fn max_total_local_size(&self) -> u32 {
        self.max_total_local_size
    }
    /// Adds `max_total_local_size`.
    pub fn with_max_total_local_size(mut self, max_total_local_size: u32) -> Self {
        self.max_total_local_size = max_total_local_size;
        self
    }
    pub fn memory_types(&self) -> MemoryTypeIndices {
        self.memory_types
    }
    /// Adds `memory_types`.
    pub fn with_memory_types(mut self, memory_types: MemoryTypeIndices) -> Self {
        self.memory_types = memory_types;
        self
    }
    pub fn max_push_constants_size(&self) -> u32 {
        self.max_push_constants_size
    }
    /// Adds `max_push_constants_size`.
    pub fn with_max_push_constants_size(mut self, max_push_constants_size: u32) -> Self {
        self.max_push_constants_size = max_push_constants_size;
        self
    }
    /// The generic local size limits of the device.
    pub fn limits(&self) -> LocalSizeLimits {
        LocalSizeLimits::new(self.max_local_size, self.max_total_local_size)
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "host".to_string(),
            max_local_size: [1024, 1024, 64],
            max_total_local_size: 1024,
            memory_types: MemoryTypeIndices::default(),
            max_push_constants_size: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_defaults() {
        let info = DeviceInfo::new("gpu").with_max_total_local_size(256);
        assert_eq!(info.name(), "gpu");
        assert_eq!(info.max_local_size(), [1024, 1024, 64]);
        assert_eq!(info.limits(), LocalSizeLimits::new([1024, 1024, 64], 256));
        assert!(info.memory_types().contains(2));
        assert!(!info.memory_types().contains(3));
    }

    #[test]
    fn devices_are_unique() {
        let a = Device::builder().build().unwrap();
        let b = Device::builder().build().unwrap();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(format!("{a:?}"), "Device(0, \"host\")");
    }

    #[test]
    fn host_backend_is_default() {
        let device = Device::builder().index(2).build().unwrap();
        assert_eq!(device.backend(), Backend::Host);
        assert!(device.backend().is_host());
        assert_eq!(device.index(), 2);
    }
}
