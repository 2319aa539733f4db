/*!
Buffers.

A [`Buffer`] is a range of device memory. Host access through [`Buffer::read`], [`Buffer::write`]
and [`Buffer::map`] first waits for all work previously submitted to the queue.
Memory that is not host visible is copied through a staging buffer.

```
# use xcompute::{anyhow::Result, buffer::{Buffer, MemoryFlags}, context::Context, device::DeviceInfo};
# fn main() -> Result<()> {
# let context = Context::builder().device(DeviceInfo::new("host")).build()?;
# let device = &context.devices()[0];
let queue = context.default_queue(device)?;
let buffer = Buffer::from_slice(device, &[1f32, 2., 3.], MemoryFlags::host_read_write())?;
assert_eq!(buffer.read_as::<f32>(&queue)?, [1., 2., 3.]);
# Ok(())
# }
```
*/

use crate::{
    device::{
        error::{HostAccessUnavailable, NativeError},
        next_handle, Device, DeviceEngineMemory, MemoryDesc, MemoryTypeIndices, RawMemory,
    },
    queue::Queue,
};
use anyhow::Result;
use bytemuck::Pod;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::{
    fmt::{self, Debug},
    mem::size_of,
    ops::{Deref, DerefMut},
    sync::Arc,
};

pub mod error {
    use super::MemoryFlags;

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Buffer of {bytes}B is too large!")]
    pub struct BufferTooLarge {
        pub(crate) bytes: usize,
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Device({device}) has no memory type for {flags:?}!")]
    pub struct MemoryTypeUnavailable {
        pub(crate) device: usize,
        pub(crate) flags: MemoryFlags,
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Expected {expected}B, found {found}B!")]
    pub struct LengthMismatch {
        pub(crate) expected: usize,
        pub(crate) found: usize,
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Memory of Device({memory}) can not be accessed through a queue of Device({queue})!")]
    pub struct DeviceMismatch {
        pub(crate) memory: usize,
        pub(crate) queue: usize,
    }
}
use error::*;

/** Memory flags.

Select the memory type of a buffer, see [`MemoryTypeIndices`].
*/
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct MemoryFlags {
    host_read: bool,
    host_write: bool,
}

impl MemoryFlags {
    /// Device local memory.
    pub const fn empty() -> Self {
        Self {
            host_read: false,
            host_write: false,
        }
    }
    /// Host visible memory, read and written by the host.
    pub const fn host_read_write() -> Self {
        Self::empty().with_host_read(true).with_host_write(true)
    }
    /// Read by the host.
    pub const fn host_read(&self) -> bool {
        self.host_read
    }
    /// Adds `host_read`.
    pub const fn with_host_read(mut self, host_read: bool) -> Self {
        self.host_read = host_read;
        self
    }
    /// Written by the host.
    pub const fn host_write(&self) -> bool {
        self.host_write
    }
    /// Adds `host_write`.
    pub const fn with_host_write(mut self, host_write: bool) -> Self {
        self.host_write = host_write;
        self
    }
    /// Selects a memory type.
    ///
    /// - Host reads prefer cached memory.
    /// - Host writes prefer uncached memory.
    /// - Otherwise device local memory is preferred.
    pub fn memory_type(&self, indices: &MemoryTypeIndices) -> Option<u32> {
        if self.host_read {
            indices.host_cached.or(indices.host_uncached)
        } else if self.host_write {
            indices.host_uncached.or(indices.host_cached)
        } else {
            indices
                .device_local
                .or(indices.host_uncached)
                .or(indices.host_cached)
        }
    }
}

/// Allocates memory for `desc`.
pub(crate) fn alloc(device: &Device, desc: &MemoryDesc, flags: MemoryFlags) -> Result<RawMemory> {
    const MAX_SIZE: usize = i32::MAX as usize;
    let len = desc.len();
    if len > MAX_SIZE {
        return Err(BufferTooLarge { bytes: len }.into());
    }
    let memory_type = flags
        .memory_type(&device.info().memory_types())
        .ok_or(MemoryTypeUnavailable {
            device: device.index(),
            flags,
        })?;
    device.alloc(desc, memory_type).map_err(|e| {
        log::error!("{e}");
        e.into()
    })
}

/// Waits for `queue` before host access to memory of `device`.
pub(crate) fn wait_for_host_access(device: &Device, queue: &Queue) -> Result<()> {
    if device != queue.device() {
        return Err(DeviceMismatch {
            memory: device.index(),
            queue: queue.device().index(),
        }
        .into());
    }
    queue.finish()?;
    Ok(())
}

struct BufferInner {
    id: u64,
    device: Device,
    flags: MemoryFlags,
    memory: RawMemory,
}

/** A buffer.

Cloning is equivalent to [`Arc::clone()`], the memory is released when the last clone
(including those held by pending submissions) is dropped.
*/
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    /// Allocates a zeroed buffer of `len` bytes.
    ///
    /// **errors**
    /// - [`BufferTooLarge`]
    /// - [`MemoryTypeUnavailable`]
    /// - The device is out of memory.
    pub fn new(device: &Device, len: usize, flags: MemoryFlags) -> Result<Self> {
        let memory = alloc(device, &MemoryDesc::Buffer { len }, flags)?;
        Ok(Self {
            inner: Arc::new(BufferInner {
                id: next_handle(),
                device: device.clone(),
                flags,
                memory,
            }),
        })
    }
    /// Allocates a buffer initialized with `bytes`.
    pub fn from_bytes(device: &Device, bytes: &[u8], flags: MemoryFlags) -> Result<Self> {
        let buffer = Self::new(device, bytes.len(), flags)?;
        buffer.inner.memory.write(0, bytes)?;
        Ok(buffer)
    }
    /// Allocates a buffer initialized with `slice`.
    pub fn from_slice<T: Pod>(device: &Device, slice: &[T], flags: MemoryFlags) -> Result<Self> {
        Self::from_bytes(device, bytemuck::cast_slice(slice), flags)
    }
    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn device(&self) -> &Device {
        &self.inner.device
    }
    /// The length in bytes.
    pub fn len(&self) -> usize {
        self.inner.memory.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn flags(&self) -> MemoryFlags {
        self.inner.flags
    }
    /// The memory type index.
    pub fn memory_type(&self) -> u32 {
        self.inner.memory.memory_type()
    }
    #[cfg(feature = "device")]
    pub(crate) fn memory(&self) -> &RawMemory {
        &self.inner.memory
    }
    /// Copies the contents to the host.
    ///
    /// Waits for `queue`.
    pub fn read(&self, queue: &Queue) -> Result<Vec<u8>> {
        wait_for_host_access(self.device(), queue)?;
        let mut data = vec![0; self.len()];
        self.inner.memory.read(&mut data)?;
        Ok(data)
    }
    /// Copies the contents to the host as `T`s.
    ///
    /// Trailing bytes that do not fill a `T` are ignored.
    pub fn read_as<T: Pod>(&self, queue: &Queue) -> Result<Vec<T>> {
        Ok(self
            .read(queue)?
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
    /// Copies `data` into the buffer.
    ///
    /// Waits for `queue`.
    ///
    /// **errors**
    /// [`LengthMismatch`] if `data` is not the length of the buffer.
    pub fn write(&self, queue: &Queue, data: &[u8]) -> Result<()> {
        if data.len() != self.len() {
            return Err(LengthMismatch {
                expected: self.len(),
                found: data.len(),
            }
            .into());
        }
        wait_for_host_access(self.device(), queue)?;
        self.inner.memory.write(0, data)?;
        Ok(())
    }
    /// Maps the buffer for host access.
    ///
    /// Waits for `queue`. The contents are copied to the host, and written back when the map
    /// is dropped.
    pub fn map(&self, queue: &Queue) -> Result<BufferMap<'_>> {
        let data = self.read(queue)?;
        Ok(BufferMap {
            buffer: self,
            data,
            unmapped: false,
        })
    }
    /// The contents, without waiting.
    ///
    /// For [host functions](crate::device::HostFunction), which execute in submission order.
    ///
    /// **errors**
    /// [`HostAccessUnavailable`] if the buffer is not on a host device.
    pub fn contents(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.inner.memory.contents(self.device().index())
    }
    /// The mutable contents, without waiting.
    ///
    /// See [`.contents()`](Buffer::contents).
    pub fn contents_mut(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.inner.memory.contents_mut(self.device().index())
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id())
            .field("device", self.device())
            .field("len", &self.len())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A mapped buffer, see [`Buffer::map`].
pub struct BufferMap<'a> {
    buffer: &'a Buffer,
    data: Vec<u8>,
    unmapped: bool,
}

impl BufferMap<'_> {
    fn write_back(&mut self) -> Result<(), NativeError> {
        self.unmapped = true;
        self.buffer.inner.memory.write(0, &self.data)
    }
    /// Writes the contents back to the buffer.
    ///
    /// Dropping the map does the same, logging a failure.
    pub fn unmap(mut self) -> Result<()> {
        self.write_back()?;
        Ok(())
    }
}

impl Deref for BufferMap<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufferMap<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for BufferMap<'_> {
    fn drop(&mut self) {
        if self.unmapped {
            return;
        }
        if let Err(e) = self.write_back() {
            log::error!("failed to unmap {:?}: {e}", self.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Context, device::DeviceInfo};

    #[test]
    fn memory_type_selection() {
        let indices = MemoryTypeIndices::default();
        assert_eq!(MemoryFlags::empty().memory_type(&indices), Some(0));
        assert_eq!(MemoryFlags::host_read_write().memory_type(&indices), Some(1));
        assert_eq!(
            MemoryFlags::empty()
                .with_host_write(true)
                .memory_type(&indices),
            Some(2)
        );
        let integrated = MemoryTypeIndices {
            device_local: None,
            host_cached: None,
            host_uncached: Some(0),
        };
        assert_eq!(MemoryFlags::empty().memory_type(&integrated), Some(0));
        let none = MemoryTypeIndices {
            device_local: None,
            host_cached: None,
            host_uncached: None,
        };
        assert_eq!(MemoryFlags::empty().memory_type(&none), None);
    }

    #[test]
    fn buffer_read_write_map() {
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let device = &context.devices()[0];
        let queue = context.default_queue(device).unwrap();
        let buffer = Buffer::new(device, 8, MemoryFlags::host_read_write()).unwrap();
        assert_eq!(buffer.read(&queue).unwrap(), [0; 8]);
        buffer.write(&queue, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(buffer.write(&queue, &[1]).is_err());
        {
            let mut map = buffer.map(&queue).unwrap();
            map[0] = 9;
        }
        let mut map = buffer.map(&queue).unwrap();
        map[1] = 2;
        map.unmap().unwrap();
        assert_eq!(
            buffer.read_as::<u32>(&queue).unwrap(),
            [u32::from_ne_bytes([9, 2, 3, 4]), u32::from_ne_bytes([5, 6, 7, 8])]
        );
        assert_eq!(buffer.memory_type(), 1);
    }

    #[test]
    fn buffers_are_counted() {
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let device = &context.devices()[0];
        assert_eq!(device.live_buffers(), 0);
        let buffer = Buffer::from_slice(device, &[1u32, 2], MemoryFlags::empty()).unwrap();
        let clone = buffer.clone();
        assert_eq!(device.live_buffers(), 1);
        drop(buffer);
        assert_eq!(device.live_buffers(), 1);
        drop(clone);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn host_contents() {
        let device = Device::builder().build().unwrap();
        let buffer = Buffer::from_slice(&device, &[1u8, 2, 3], MemoryFlags::empty()).unwrap();
        buffer.contents_mut().unwrap()[0] = 4;
        assert_eq!(buffer.contents().unwrap().as_slice(), [4, 2, 3]);
    }

    #[test]
    fn buffer_too_large() {
        let device = Device::builder().build().unwrap();
        let error = Buffer::new(&device, usize::MAX, MemoryFlags::empty()).unwrap_err();
        assert!(error.is::<BufferTooLarge>());
    }
}
