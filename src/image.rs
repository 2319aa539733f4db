/*!
Images.

An [`Image`] is 1 to 3 dimensional device memory with a chain of mip levels. Launches
transition images to the layout a kernel accesses them with:
[`ImageLayout::ShaderReadOnly`] for reads and [`ImageLayout::General`] for writes.
The new layout is committed once the launch was submitted.
*/

use crate::{
    buffer::{alloc, wait_for_host_access, MemoryFlags},
    device::{
        error::HostAccessUnavailable, next_handle, Device, DeviceEngineMemory, MemoryDesc,
        RawMemory,
    },
    queue::Queue,
};
use anyhow::Result;
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    ops::Range,
    sync::Arc,
};

pub mod error {
    use super::ImageFormat;

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Invalid image extent {extent:?}!")]
    pub struct InvalidExtent {
        pub(crate) extent: [u32; 3],
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Image of extent {extent:?} supports 1..={max} mip levels, requested {mip_levels}!")]
    pub struct InvalidMipLevels {
        pub(crate) extent: [u32; 3],
        pub(crate) mip_levels: u32,
        pub(crate) max: u32,
    }

    /// The size of the image overflows `usize`.
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Image of extent {extent:?} and format {format:?} is too large!")]
    pub struct ImageTooLarge {
        pub(crate) extent: [u32; 3],
        pub(crate) format: ImageFormat,
    }
}
use error::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    R8Unorm,
    Rgba8Unorm,
    R32Uint,
    R32Float,
    Rgba32Float,
}

impl ImageFormat {
    pub const fn bytes_per_pixel(&self) -> usize {
        match self {
            Self::R8Unorm => 1,
            Self::Rgba8Unorm | Self::R32Uint | Self::R32Float => 4,
            Self::Rgba32Float => 16,
        }
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum ImageLayout {
    Undefined,
    /// Sampled by kernels.
    ShaderReadOnly,
    /// Read and written by kernels.
    General,
}

struct ImageInner {
    id: u64,
    device: Device,
    extent: [u32; 3],
    format: ImageFormat,
    mip_levels: u32,
    /// The byte range of each mip level.
    levels: Vec<Range<usize>>,
    memory: RawMemory,
    layout: Mutex<ImageLayout>,
}

/// An image.
///
/// Cloning is equivalent to [`Arc::clone()`].
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

fn mip_extent(extent: [u32; 3], level: u32) -> [u32; 3] {
    extent.map(|x| x.checked_shr(level).unwrap_or(0).max(1))
}

/// The byte length of mip `level`, `None` on overflow.
fn level_len(extent: [u32; 3], format: ImageFormat, level: u32) -> Option<usize> {
    mip_extent(extent, level)
        .into_iter()
        .try_fold(format.bytes_per_pixel(), |len, x| {
            len.checked_mul(usize::try_from(x).ok()?)
        })
}

/// The byte ranges of `mip_levels` levels packed back to back.
fn level_ranges(
    extent: [u32; 3],
    format: ImageFormat,
    mip_levels: u32,
) -> Option<Vec<Range<usize>>> {
    let mut start = 0usize;
    (0..mip_levels)
        .map(|level| {
            let end = start.checked_add(level_len(extent, format, level)?)?;
            let range = start..end;
            start = end;
            Some(range)
        })
        .collect()
}

impl Image {
    /// The number of levels of a full mip chain.
    pub fn max_mip_levels(extent: [u32; 3]) -> u32 {
        let max = extent.into_iter().max().unwrap_or(1).max(1);
        u32::BITS - max.leading_zeros()
    }
    /// Allocates a zeroed image in device local memory.
    ///
    /// **errors**
    /// - [`InvalidExtent`] if any dimension is 0.
    /// - [`InvalidMipLevels`] if `mip_levels` is 0 or longer than the full chain.
    /// - [`ImageTooLarge`] if the size overflows.
    /// - [`BufferTooLarge`](crate::buffer::error::BufferTooLarge) if the device can not allocate it.
    pub fn new(
        device: &Device,
        extent: [u32; 3],
        format: ImageFormat,
        mip_levels: u32,
    ) -> Result<Self> {
        if extent.contains(&0) {
            return Err(InvalidExtent { extent }.into());
        }
        let max = Self::max_mip_levels(extent);
        if mip_levels == 0 || mip_levels > max {
            return Err(InvalidMipLevels {
                extent,
                mip_levels,
                max,
            }
            .into());
        }
        let levels =
            level_ranges(extent, format, mip_levels).ok_or(ImageTooLarge { extent, format })?;
        let desc = MemoryDesc::Image {
            extent,
            format,
            levels: levels.clone(),
        };
        let memory = alloc(device, &desc, MemoryFlags::empty())?;
        Ok(Self {
            inner: Arc::new(ImageInner {
                id: next_handle(),
                device: device.clone(),
                extent,
                format,
                mip_levels,
                levels,
                memory,
                layout: Mutex::new(ImageLayout::Undefined),
            }),
        })
    }
    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn device(&self) -> &Device {
        &self.inner.device
    }
    pub fn extent(&self) -> [u32; 3] {
        self.inner.extent
    }
    pub fn format(&self) -> ImageFormat {
        self.inner.format
    }
    pub fn mip_levels(&self) -> u32 {
        self.inner.mip_levels
    }
    /// The extent of mip `level`.
    pub fn mip_extent(&self, level: u32) -> [u32; 3] {
        mip_extent(self.inner.extent, level)
    }
    /// The byte range of mip `level`.
    pub fn mip_range(&self, level: u32) -> Option<Range<usize>> {
        self.inner.levels.get(level as usize).cloned()
    }
    /// The layout of the last submitted transition.
    pub fn layout(&self) -> ImageLayout {
        *self.inner.layout.lock()
    }
    pub(crate) fn set_layout(&self, layout: ImageLayout) {
        *self.inner.layout.lock() = layout;
    }
    #[cfg(feature = "device")]
    pub(crate) fn memory(&self) -> &RawMemory {
        &self.inner.memory
    }
    /// Copies all mip levels to the host.
    ///
    /// Waits for `queue`.
    pub fn read(&self, queue: &Queue) -> Result<Vec<u8>> {
        wait_for_host_access(self.device(), queue)?;
        let mut data = vec![0; self.inner.memory.len()];
        self.inner.memory.read(&mut data)?;
        Ok(data)
    }
    /// Copies `data` into mip `level`.
    ///
    /// Waits for `queue`.
    pub fn write_level(&self, queue: &Queue, level: u32, data: &[u8]) -> Result<()> {
        let range = self
            .mip_range(level)
            .ok_or_else(|| anyhow::format_err!("Mip level {level} out of range!"))?;
        if range.len() != data.len() {
            return Err(crate::buffer::error::LengthMismatch {
                expected: range.len(),
                found: data.len(),
            }
            .into());
        }
        wait_for_host_access(self.device(), queue)?;
        self.inner.memory.write(range.start, data)?;
        Ok(())
    }
    /// The contents of all mip levels, without waiting.
    ///
    /// For [host functions](crate::device::HostFunction).
    ///
    /// **errors**
    /// [`HostAccessUnavailable`] if the image is not on a host device.
    pub fn contents(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.inner.memory.contents(self.device().index())
    }
    /// See [`.contents()`](Image::contents).
    pub fn contents_mut(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>, HostAccessUnavailable> {
        self.inner.memory.contents_mut(self.device().index())
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Image {}

impl Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("id", &self.id())
            .field("device", self.device())
            .field("extent", &self.extent())
            .field("format", &self.format())
            .field("mip_levels", &self.mip_levels())
            .field("layout", &self.layout())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain() {
        assert_eq!(Image::max_mip_levels([1, 1, 1]), 1);
        assert_eq!(Image::max_mip_levels([16, 4, 1]), 5);
        assert_eq!(Image::max_mip_levels([17, 1, 1]), 5);
        let device = Device::builder().build().unwrap();
        let image = Image::new(&device, [16, 4, 1], ImageFormat::Rgba8Unorm, 3).unwrap();
        assert_eq!(image.mip_extent(2), [4, 1, 1]);
        assert_eq!(image.mip_range(0), Some(0..256));
        assert_eq!(image.mip_range(1), Some(256..320));
        assert_eq!(image.mip_range(2), Some(320..336));
        assert_eq!(image.mip_range(3), None);
        assert_eq!(image.contents().unwrap().len(), 336);
    }

    #[test]
    fn invalid_images() {
        let device = Device::builder().build().unwrap();
        let error = Image::new(&device, [0, 1, 1], ImageFormat::R8Unorm, 1).unwrap_err();
        assert!(error.is::<InvalidExtent>());
        let error = Image::new(&device, [4, 4, 1], ImageFormat::R8Unorm, 4).unwrap_err();
        assert!(error.is::<InvalidMipLevels>());
        let error = Image::new(&device, [4, 4, 1], ImageFormat::R8Unorm, 0).unwrap_err();
        assert!(error.is::<InvalidMipLevels>());
    }

    #[test]
    fn oversized_images() {
        let device = Device::builder().build().unwrap();
        let error = Image::new(&device, [u32::MAX; 3], ImageFormat::Rgba32Float, 1).unwrap_err();
        assert!(error.is::<ImageTooLarge>());
        let error =
            Image::new(&device, [1 << 16, 1 << 16, 1], ImageFormat::R8Unorm, 1).unwrap_err();
        assert!(error.is::<crate::buffer::error::BufferTooLarge>());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(
            level_len([u32::MAX, 1, 1], ImageFormat::R8Unorm, 0),
            Some(u32::MAX as usize)
        );
    }
}
