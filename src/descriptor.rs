/*!
Descriptor sets.

Kernels access resources through descriptor sets. Set 0 of every pipeline is the
fixed [sampler](crate::sampler) set of the device, set `1 + i` belongs to the `i`th entry
of the pipeline (ie the vertex and fragment stage of a draw).
*/

#[cfg(feature = "device")]
use crate::device::NativeDescriptorSet;
use crate::{buffer::Buffer, device::next_handle, image::Image, sampler::Sampler};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};
use xcompute_core::function::{ArgKind, FunctionInfo, ImageAccess};

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum DescriptorType {
    Sampler,
    UniformBuffer,
    /// Bound with a dynamic offset.
    StorageBuffer,
    SampledImage,
    StorageImage,
}

/// A binding of a [`DescriptorSetLayout`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DescriptorBinding {
    pub ty: DescriptorType,
    /// Number of descriptors, 0 is variable (one per mip level of a storage image).
    pub count: u32,
}

impl DescriptorBinding {
    const fn new(ty: DescriptorType, count: u32) -> Self {
        Self { ty, count }
    }
}

/// The bindings of a descriptor set.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DescriptorSetLayout {
    bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    pub fn new(bindings: impl Into<Vec<DescriptorBinding>>) -> Self {
        Self {
            bindings: bindings.into(),
        }
    }
    /// The layout of the arguments of `info`.
    ///
    /// Returns `None` if there are no bindable arguments.
    ///
    /// - value: uniform buffer
    /// - buffer: storage buffer
    /// - read image: sampled image
    /// - write image: storage image per mip level
    /// - read-write image: sampled image, then storage image per mip level
    /// - image array: sampled (or storage if written) image per element
    pub fn from_function(info: &FunctionInfo) -> Option<Self> {
        use DescriptorType::*;
        let mut bindings = Vec::with_capacity(info.binding_count() as usize);
        for arg in info.bindable_args() {
            let access = arg.image_access;
            match arg.kind {
                ArgKind::Value => bindings.push(DescriptorBinding::new(UniformBuffer, 1)),
                ArgKind::Buffer => bindings.push(DescriptorBinding::new(StorageBuffer, 1)),
                ArgKind::Image => {
                    if access.reads() {
                        bindings.push(DescriptorBinding::new(SampledImage, 1));
                    }
                    if access.writes() {
                        bindings.push(DescriptorBinding::new(StorageImage, 0));
                    }
                }
                ArgKind::ImageArray => {
                    let ty = if access.writes() {
                        StorageImage
                    } else {
                        SampledImage
                    };
                    bindings.push(DescriptorBinding::new(ty, arg.array_size));
                }
            }
        }
        if bindings.is_empty() {
            None
        } else {
            Some(Self { bindings })
        }
    }
    pub fn bindings(&self) -> &[DescriptorBinding] {
        &self.bindings
    }
    /// The number of storage buffer bindings, which need a dynamic offset.
    pub fn dynamic_offset_count(&self) -> usize {
        self.bindings
            .iter()
            .filter(|x| x.ty.is_storage_buffer())
            .count()
    }
}

/// A resource written to a binding.
#[derive(Clone)]
pub enum Descriptor {
    Sampler(Sampler),
    Buffer(Buffer),
    Image {
        image: Image,
        /// The mip level of a storage image, `None` for the whole image.
        mip_level: Option<u32>,
    },
}

impl Descriptor {
    /// Whether the descriptor can be written to a binding of type `ty`.
    pub fn matches(&self, ty: DescriptorType) -> bool {
        use DescriptorType::*;
        match self {
            Self::Sampler(_) => ty == Sampler,
            Self::Buffer(_) => matches!(ty, UniformBuffer | StorageBuffer),
            Self::Image { mip_level, .. } => match ty {
                SampledImage => mip_level.is_none(),
                StorageImage => mip_level.is_some(),
                _ => false,
            },
        }
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sampler(sampler) => f.debug_tuple("Sampler").field(sampler).finish(),
            Self::Buffer(buffer) => f.debug_tuple("Buffer").field(&buffer.len()).finish(),
            Self::Image { image, mip_level } => f
                .debug_struct("Image")
                .field("extent", &image.extent())
                .field("mip_level", mip_level)
                .finish(),
        }
    }
}

/// Replaces the descriptors of `binding` in `set`.
#[derive(Clone, Debug)]
pub struct DescriptorWrite {
    pub set: DescriptorSet,
    pub binding: u32,
    pub descriptors: Vec<Descriptor>,
}

struct DescriptorSetInner {
    id: u64,
    layout: DescriptorSetLayout,
    bindings: RwLock<Vec<Vec<Descriptor>>>,
    /// The Vulkan set holding `bindings`, once all are written.
    #[cfg(feature = "device")]
    native: RwLock<Option<NativeDescriptorSet>>,
}

/// A descriptor set.
///
/// Cloning is equivalent to [`Arc::clone()`].
#[derive(Clone)]
pub struct DescriptorSet {
    inner: Arc<DescriptorSetInner>,
}

impl DescriptorSet {
    /// Allocates an empty set.
    pub fn new(layout: DescriptorSetLayout) -> Self {
        let bindings = vec![Vec::new(); layout.bindings().len()];
        Self {
            inner: Arc::new(DescriptorSetInner {
                id: next_handle(),
                layout,
                bindings: RwLock::new(bindings),
                #[cfg(feature = "device")]
                native: RwLock::default(),
            }),
        }
    }
    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.inner.layout
    }
    /// The descriptors written to `binding`.
    pub fn descriptors(&self, binding: u32) -> Option<Vec<Descriptor>> {
        self.inner.bindings.read().get(binding as usize).cloned()
    }
    /// The first binding that has not been written.
    pub fn first_unwritten(&self) -> Option<u32> {
        self.inner
            .bindings
            .read()
            .iter()
            .position(Vec::is_empty)
            .map(|x| x as u32)
    }
    pub(crate) fn write_unchecked(&self, binding: u32, descriptors: Vec<Descriptor>) {
        if let Some(slot) = self.inner.bindings.write().get_mut(binding as usize) {
            *slot = descriptors;
        }
    }
    #[cfg(feature = "device")]
    pub(crate) fn native(&self) -> Option<NativeDescriptorSet> {
        self.inner.native.read().clone()
    }
    #[cfg(feature = "device")]
    pub(crate) fn set_native(&self, native: NativeDescriptorSet) {
        self.inner.native.write().replace(native);
    }
}

impl PartialEq for DescriptorSet {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for DescriptorSet {}

impl Debug for DescriptorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSet")
            .field("id", &self.inner.id)
            .field("layout", &self.inner.layout)
            .finish()
    }
}

/// Checks that `write` is valid for its set.
///
/// Returns a description of the problem.
pub(crate) fn validate_write(write: &DescriptorWrite, device: usize) -> Result<(), String> {
    let layout = write.set.layout();
    let binding = layout
        .bindings()
        .get(write.binding as usize)
        .ok_or_else(|| {
            format!(
                "binding {} out of range for set {} with {} bindings",
                write.binding,
                write.set.id(),
                layout.bindings().len()
            )
        })?;
    let count = write.descriptors.len();
    if count == 0 || (binding.count != 0 && count != binding.count as usize) {
        return Err(format!(
            "binding {} expects {} descriptors, found {count}",
            write.binding,
            if binding.count == 0 {
                "1 or more".to_string()
            } else {
                binding.count.to_string()
            },
        ));
    }
    for descriptor in write.descriptors.iter() {
        if !descriptor.matches(binding.ty) {
            return Err(format!(
                "binding {} of type {:?} can not hold {descriptor:?}",
                write.binding, binding.ty
            ));
        }
        let owner = match descriptor {
            Descriptor::Sampler(_) => None,
            Descriptor::Buffer(buffer) => Some(buffer.device().index()),
            Descriptor::Image { image, mip_level } => {
                if let Some(mip_level) = mip_level {
                    if *mip_level >= image.mip_levels() {
                        return Err(format!(
                            "mip level {mip_level} out of range 0..{}",
                            image.mip_levels()
                        ));
                    }
                }
                Some(image.device().index())
            }
        };
        if let Some(owner) = owner {
            if owner != device {
                return Err(format!(
                    "binding {} holds a resource of Device({owner})",
                    write.binding
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xcompute_core::function::ArgInfo;

    #[test]
    fn layout_from_function() {
        use DescriptorType::*;
        let info = FunctionInfo::kernel(
            "blur",
            [
                ArgInfo::value(),
                ArgInfo::buffer(),
                ArgInfo::image(ImageAccess::Read),
                ArgInfo::image(ImageAccess::Write),
                ArgInfo::image(ImageAccess::ReadWrite),
                ArgInfo::image_array(ImageAccess::Read, 3),
                ArgInfo::image_array(ImageAccess::Write, 2),
                ArgInfo::image(ImageAccess::None),
            ],
        );
        let layout = DescriptorSetLayout::from_function(&info).unwrap();
        let bindings: Vec<_> = layout.bindings().iter().map(|x| (x.ty, x.count)).collect();
        assert_eq!(
            bindings,
            [
                (UniformBuffer, 1),
                (StorageBuffer, 1),
                (SampledImage, 1),
                (StorageImage, 0),
                (SampledImage, 1),
                (StorageImage, 0),
                (SampledImage, 3),
                (StorageImage, 2),
                (SampledImage, 1),
            ]
        );
        assert_eq!(bindings.len(), info.binding_count() as usize);
        assert_eq!(layout.dynamic_offset_count(), 1);
    }

    #[test]
    fn no_bindings_no_layout() {
        let info = FunctionInfo::new(
            "vs",
            xcompute_core::function::FunctionType::Vertex,
            [ArgInfo::buffer().stage_input()],
        );
        assert!(DescriptorSetLayout::from_function(&info).is_none());
    }

    #[test]
    fn set_starts_unwritten() {
        let set = DescriptorSet::new(DescriptorSetLayout::new([DescriptorBinding::new(
            DescriptorType::Sampler,
            1,
        )]));
        assert_eq!(set.first_unwritten(), Some(0));
        set.write_unchecked(0, vec![Descriptor::Sampler(Sampler::from_index(0).unwrap())]);
        assert_eq!(set.first_unwritten(), None);
        assert!(set.descriptors(1).is_none());
    }
}
