use super::{
    error::{NativeCode, NativeError},
    Backend, DeviceEngine, DeviceEngineMemory, DeviceInfo, MemoryDesc, MemoryTypeIndices,
};
use crate::{
    descriptor::{
        validate_write, Descriptor, DescriptorSet, DescriptorSetLayout, DescriptorType,
        DescriptorWrite,
    },
    image::ImageFormat,
    queue::{BindPoint, Command, CommandBuffer},
    sampler::{self, AddressMode, CoordMode, Filter, Sampler},
};
use anyhow::Result;
use dashmap::DashMap;
use std::{
    fmt::Display,
    ops::Range,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use vulkano::{
    buffer::{Buffer as VkBuffer, BufferCreateInfo, BufferUsage, Subbuffer},
    command_buffer::{
        allocator::StandardCommandBufferAllocator, AutoCommandBufferBuilder, BufferImageCopy,
        CommandBufferUsage, CopyBufferInfo, CopyBufferToImageInfo, CopyImageToBufferInfo,
        PrimaryAutoCommandBuffer, PrimaryCommandBufferAbstract,
    },
    descriptor_set::{
        allocator::StandardDescriptorSetAllocator,
        layout::{
            DescriptorSetLayout as VkDescriptorSetLayout, DescriptorSetLayoutBinding,
            DescriptorSetLayoutCreateInfo, DescriptorType as VkDescriptorType,
        },
        DescriptorSetWithOffsets, PersistentDescriptorSet, WriteDescriptorSet,
    },
    device::{Device as VkDevice, DeviceCreateInfo, Queue, QueueCreateInfo, QueueFlags},
    format::Format,
    image::{
        sampler::{
            BorderColor, Filter as VkFilter, Sampler as VkSampler, SamplerAddressMode,
            SamplerCreateInfo,
        },
        view::{ImageView, ImageViewCreateInfo},
        Image as VkImage, ImageAspects, ImageCreateInfo, ImageSubresourceLayers,
        ImageSubresourceRange, ImageType, ImageUsage,
    },
    instance::{Instance, InstanceCreateFlags, InstanceCreateInfo, InstanceExtensions},
    memory::{
        allocator::{AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator},
        MemoryPropertyFlags,
    },
    pipeline::{
        compute::ComputePipelineCreateInfo, layout::PipelineLayoutCreateInfo, ComputePipeline,
        Pipeline, PipelineBindPoint, PipelineLayout, PipelineShaderStageCreateInfo,
    },
    shader::{ShaderModule, ShaderModuleCreateInfo, ShaderStages},
    sync::GpuFuture,
    DeviceSize, VulkanLibrary,
};
use xcompute_core::function::{FunctionInfo, FunctionType};

/// Descriptors of a variable storage image binding, one per mip level.
///
/// Images with fewer levels repeat the last level.
const MAX_MIP_LEVELS: u32 = 16;

pub(crate) type NativeDescriptorSet = Arc<PersistentDescriptorSet>;

fn native_error<E: Display>(
    device: usize,
    operation: &'static str,
    code: NativeCode,
) -> impl Fn(E) -> NativeError {
    move |e| NativeError::new(device, operation, code, e.to_string())
}

pub(crate) struct VulkanModule {
    module: Arc<ShaderModule>,
}

pub(crate) struct VulkanEntry {
    pipeline: Arc<ComputePipeline>,
}

enum Resource {
    Buffer(Subbuffer<[u8]>),
    Image {
        image: Arc<VkImage>,
        view: Arc<ImageView>,
        mip_views: Vec<Arc<ImageView>>,
        levels: Vec<Range<usize>>,
    },
}

pub(crate) struct VulkanMemory {
    engine: Arc<Engine>,
    memory_type: u32,
    len: usize,
    resource: Resource,
}

impl VulkanMemory {
    fn subbuffer(&self) -> Option<Subbuffer<[u8]>> {
        match &self.resource {
            Resource::Buffer(buffer) => Some(buffer.clone()),
            Resource::Image { .. } => None,
        }
    }
    /// The view of `mip_level`, or of the whole image.
    fn view(&self, mip_level: Option<u32>) -> Option<Arc<ImageView>> {
        match (&self.resource, mip_level) {
            (Resource::Image { view, .. }, None) => Some(view.clone()),
            (Resource::Image { mip_views, .. }, Some(level)) => mip_views.get(level as usize).cloned(),
            (Resource::Buffer(_), _) => None,
        }
    }
    fn host_visible(&self) -> bool {
        self.engine
            .host_visible
            .get(self.memory_type as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// Copies of `levels` of `image` to or from a buffer laid out like [`MemoryDesc::Image`].
fn level_regions<'a>(
    image: &VkImage,
    levels: &'a [Range<usize>],
) -> impl Iterator<Item = (usize, BufferImageCopy)> + 'a {
    let extent = image.extent();
    levels.iter().enumerate().map(move |(level, range)| {
        let region = BufferImageCopy {
            buffer_offset: range.start as DeviceSize,
            image_subresource: ImageSubresourceLayers {
                aspects: ImageAspects::COLOR,
                mip_level: level as u32,
                array_layers: 0..1,
            },
            image_extent: extent.map(|x| (x >> level).max(1)),
            ..Default::default()
        };
        (level, region)
    })
}

impl DeviceEngineMemory for VulkanMemory {
    fn len(&self) -> usize {
        self.len
    }
    fn memory_type(&self) -> u32 {
        self.memory_type
    }
    fn read(&self, data: &mut [u8]) -> Result<(), NativeError> {
        let engine = &self.engine;
        if data.len() != self.len {
            return Err(engine.error(
                "read",
                NativeCode::ExecutionFailed,
                format!("read of {}B from {}B", data.len(), self.len),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        if let (Resource::Buffer(buffer), true) = (&self.resource, self.host_visible()) {
            let contents = buffer
                .read()
                .map_err(engine.native_error("read", NativeCode::ExecutionFailed))?;
            data.copy_from_slice(&contents[..self.len]);
            return Ok(());
        }
        let staging = engine.staging(self.len)?;
        let mut builder = engine.command_buffer_builder()?;
        let copy = match &self.resource {
            Resource::Buffer(buffer) => builder.copy_buffer(CopyBufferInfo::buffers(
                buffer.clone().slice(..self.len as DeviceSize),
                staging.clone(),
            )),
            Resource::Image { image, levels, .. } => {
                builder.copy_image_to_buffer(CopyImageToBufferInfo {
                    regions: level_regions(image, levels).map(|(_, region)| region).collect(),
                    ..CopyImageToBufferInfo::image_buffer(image.clone(), staging.clone())
                })
            }
        };
        copy.map_err(engine.native_error("read", NativeCode::ExecutionFailed))?;
        engine.submit(builder)?;
        let contents = staging
            .read()
            .map_err(engine.native_error("read", NativeCode::ExecutionFailed))?;
        data.copy_from_slice(&contents);
        Ok(())
    }
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), NativeError> {
        let engine = &self.engine;
        let write_error = |message: String| engine.error("write", NativeCode::ExecutionFailed, message);
        if data.is_empty() {
            return Ok(());
        }
        match &self.resource {
            Resource::Buffer(buffer) => {
                let end = offset
                    .checked_add(data.len())
                    .filter(|&end| end <= self.len)
                    .ok_or_else(|| {
                        write_error(format!("write of {}B at {offset} into {}B", data.len(), self.len))
                    })?;
                let dst = buffer.clone().slice(offset as DeviceSize..end as DeviceSize);
                if self.host_visible() {
                    dst.write()
                        .map_err(engine.native_error("write", NativeCode::ExecutionFailed))?
                        .copy_from_slice(data);
                    return Ok(());
                }
                let staging = engine.staging_from(data)?;
                let mut builder = engine.command_buffer_builder()?;
                builder
                    .copy_buffer(CopyBufferInfo::buffers(staging, dst))
                    .map_err(engine.native_error("write", NativeCode::ExecutionFailed))?;
                engine.submit(builder)
            }
            Resource::Image { image, levels, .. } => {
                let (_, mut region) = level_regions(image, levels)
                    .find(|(level, _)| {
                        levels[*level].start == offset && levels[*level].len() == data.len()
                    })
                    .ok_or_else(|| {
                        write_error(format!("write of {}B at {offset} is not a mip level", data.len()))
                    })?;
                region.buffer_offset = 0;
                let staging = engine.staging_from(data)?;
                let mut builder = engine.command_buffer_builder()?;
                builder
                    .copy_buffer_to_image(CopyBufferToImageInfo {
                        regions: [region].into_iter().collect(),
                        ..CopyBufferToImageInfo::buffer_image(staging, image.clone())
                    })
                    .map_err(engine.native_error("write", NativeCode::ExecutionFailed))?;
                engine.submit(builder)
            }
        }
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        self.engine.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn vk_format(format: ImageFormat) -> Format {
    match format {
        ImageFormat::R8Unorm => Format::R8_UNORM,
        ImageFormat::Rgba8Unorm => Format::R8G8B8A8_UNORM,
        ImageFormat::R32Uint => Format::R32_UINT,
        ImageFormat::R32Float => Format::R32_SFLOAT,
        ImageFormat::Rgba32Float => Format::R32G32B32A32_SFLOAT,
    }
}

fn image_type(extent: [u32; 3]) -> ImageType {
    if extent[2] > 1 {
        ImageType::Dim3d
    } else {
        ImageType::Dim2d
    }
}

fn sampler_create_info(sampler: &Sampler) -> SamplerCreateInfo {
    let filter = match sampler.filter {
        Filter::Nearest => VkFilter::Nearest,
        Filter::Linear => VkFilter::Linear,
    };
    let pixel = sampler.coord_mode == CoordMode::Pixel;
    let address_mode = match sampler.address_mode {
        AddressMode::ClampToZero => SamplerAddressMode::ClampToBorder,
        AddressMode::ClampToEdge => SamplerAddressMode::ClampToEdge,
        // unnormalized coordinates can only clamp
        AddressMode::Repeat | AddressMode::MirroredRepeat if pixel => {
            SamplerAddressMode::ClampToEdge
        }
        AddressMode::Repeat => SamplerAddressMode::Repeat,
        AddressMode::MirroredRepeat => SamplerAddressMode::MirroredRepeat,
    };
    SamplerCreateInfo {
        mag_filter: filter,
        min_filter: filter,
        address_mode: [address_mode; 3],
        border_color: BorderColor::FloatTransparentBlack,
        unnormalized_coordinates: pixel,
        ..Default::default()
    }
}

fn binding_type(ty: DescriptorType, count: u32) -> (VkDescriptorType, u32) {
    match ty {
        DescriptorType::Sampler => (VkDescriptorType::Sampler, count),
        DescriptorType::UniformBuffer => (VkDescriptorType::UniformBuffer, count),
        DescriptorType::StorageBuffer => (VkDescriptorType::StorageBufferDynamic, count),
        DescriptorType::SampledImage => (VkDescriptorType::SampledImage, count),
        DescriptorType::StorageImage if count == 0 => (VkDescriptorType::StorageImage, MAX_MIP_LEVELS),
        DescriptorType::StorageImage => (VkDescriptorType::StorageImage, count),
    }
}

pub(crate) struct Engine {
    index: usize,
    physical_device: usize,
    info: Arc<DeviceInfo>,
    /// Per memory type.
    host_visible: Vec<bool>,
    device: Arc<VkDevice>,
    queue: Arc<Queue>,
    memory_allocator: Arc<StandardMemoryAllocator>,
    descriptor_set_allocator: StandardDescriptorSetAllocator,
    command_buffer_allocator: StandardCommandBufferAllocator,
    /// In fixed sampler order.
    samplers: Vec<Arc<VkSampler>>,
    set_layouts: DashMap<DescriptorSetLayout, Arc<VkDescriptorSetLayout>>,
    fixed_samplers: DescriptorSet,
    live: AtomicUsize,
    _instance: Arc<Instance>,
}

impl Engine {
    pub(super) fn new(index: usize, physical_device: usize) -> Result<Arc<Self>> {
        let init_error = |message: String| {
            let e = NativeError::new(
                index,
                "create_device",
                NativeCode::InitializationFailed,
                message,
            );
            log::error!("{e}");
            e
        };
        let library = VulkanLibrary::new().map_err(|e| init_error(e.to_string()))?;
        let portability = library.supported_extensions().khr_portability_enumeration;
        let instance = Instance::new(
            library,
            InstanceCreateInfo {
                flags: if portability {
                    InstanceCreateFlags::ENUMERATE_PORTABILITY
                } else {
                    InstanceCreateFlags::empty()
                },
                enabled_extensions: InstanceExtensions {
                    khr_portability_enumeration: portability,
                    ..InstanceExtensions::empty()
                },
                ..InstanceCreateInfo::application_from_cargo_toml()
            },
        )
        .map_err(|e| init_error(e.to_string()))?;
        let mut physical_devices = instance
            .enumerate_physical_devices()
            .map_err(|e| init_error(e.to_string()))?;
        let devices = physical_devices.len();
        let physical = physical_devices.nth(physical_device).ok_or_else(|| {
            init_error(format!(
                "physical device {physical_device} is out of range, found {devices}"
            ))
        })?;
        let families = physical.queue_family_properties();
        let queue_family_index = families
            .iter()
            .position(|x| {
                x.queue_flags.contains(QueueFlags::COMPUTE)
                    && !x.queue_flags.contains(QueueFlags::GRAPHICS)
            })
            .or_else(|| {
                families
                    .iter()
                    .position(|x| x.queue_flags.contains(QueueFlags::COMPUTE))
            })
            .map(|x| x as u32)
            .ok_or_else(|| init_error("no compute queue".into()))?;
        let properties = physical.properties();
        let name = properties.device_name.clone();
        let memory_types = &physical.memory_properties().memory_types;
        let excluded = MemoryPropertyFlags::LAZILY_ALLOCATED | MemoryPropertyFlags::PROTECTED;
        let find_memory_type = |required: MemoryPropertyFlags, excluded: MemoryPropertyFlags| {
            memory_types
                .iter()
                .position(|x| {
                    x.property_flags.contains(required) && !x.property_flags.intersects(excluded)
                })
                .map(|x| x as u32)
        };
        let memory_type_indices = MemoryTypeIndices {
            device_local: find_memory_type(MemoryPropertyFlags::DEVICE_LOCAL, excluded),
            host_cached: find_memory_type(
                MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED,
                excluded,
            ),
            host_uncached: find_memory_type(
                MemoryPropertyFlags::HOST_VISIBLE,
                excluded | MemoryPropertyFlags::HOST_CACHED,
            ),
        };
        let host_visible = memory_types
            .iter()
            .map(|x| x.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE))
            .collect();
        let info = DeviceInfo::new(name)
            .with_max_local_size(properties.max_compute_work_group_size)
            .with_max_total_local_size(properties.max_compute_work_group_invocations)
            .with_memory_types(memory_type_indices)
            .with_max_push_constants_size(properties.max_push_constants_size);
        let (device, mut queues) = VkDevice::new(
            physical,
            DeviceCreateInfo {
                queue_create_infos: vec![QueueCreateInfo {
                    queue_family_index,
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .map_err(|e| init_error(e.to_string()))?;
        let queue = queues
            .next()
            .ok_or_else(|| init_error("no queue was created".into()))?;
        let samplers = Sampler::all()
            .iter()
            .map(|sampler| VkSampler::new(device.clone(), sampler_create_info(sampler)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| init_error(format!("failed to create the fixed samplers: {e}")))?;
        let engine = Arc::new(Self {
            index,
            physical_device,
            info: Arc::new(info),
            host_visible,
            memory_allocator: Arc::new(StandardMemoryAllocator::new_default(device.clone())),
            descriptor_set_allocator: StandardDescriptorSetAllocator::new(
                device.clone(),
                Default::default(),
            ),
            command_buffer_allocator: StandardCommandBufferAllocator::new(
                device.clone(),
                Default::default(),
            ),
            device,
            queue,
            samplers,
            set_layouts: DashMap::new(),
            fixed_samplers: DescriptorSet::new(sampler::fixed_layout()),
            live: AtomicUsize::default(),
            _instance: instance,
        });
        engine
            .update_descriptor_sets(&[sampler::fixed_sampler_write(&engine.fixed_samplers)])
            .map_err(|e| init_error(format!("failed to create the fixed sampler set: {e}")))?;
        log::debug!(
            "created Device({index}) {:?} on physical device {physical_device}",
            engine.info.name()
        );
        Ok(engine)
    }
    pub(super) fn backend(&self) -> Backend {
        Backend::Vulkan {
            physical_device: self.physical_device,
        }
    }
    fn error(&self, operation: &'static str, code: NativeCode, message: impl Into<String>) -> NativeError {
        NativeError::new(self.index, operation, code, message)
    }
    fn native_error<E: Display>(
        &self,
        operation: &'static str,
        code: NativeCode,
    ) -> impl Fn(E) -> NativeError {
        native_error(self.index, operation, code)
    }
    fn set_layout(
        &self,
        layout: &DescriptorSetLayout,
    ) -> Result<Arc<VkDescriptorSetLayout>, NativeError> {
        if let Some(set_layout) = self.set_layouts.get(layout) {
            return Ok(set_layout.value().clone());
        }
        let bindings = layout
            .bindings()
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                let (ty, descriptor_count) = binding_type(binding.ty, binding.count);
                let binding = DescriptorSetLayoutBinding {
                    stages: ShaderStages::COMPUTE,
                    descriptor_count,
                    ..DescriptorSetLayoutBinding::descriptor_type(ty)
                };
                (i as u32, binding)
            })
            .collect();
        let set_layout = VkDescriptorSetLayout::new(
            self.device.clone(),
            DescriptorSetLayoutCreateInfo {
                bindings,
                ..Default::default()
            },
        )
        .map_err(self.native_error("create_descriptor_set_layout", NativeCode::InvalidDescriptor))?;
        self.set_layouts.insert(layout.clone(), set_layout.clone());
        Ok(set_layout)
    }
    fn resource_error(&self, descriptor: &Descriptor) -> NativeError {
        self.error(
            "update_descriptor_sets",
            NativeCode::InvalidDescriptor,
            format!("{descriptor:?} is not Vulkan memory"),
        )
    }
    fn vk_sampler(&self, descriptor: &Descriptor) -> Result<Arc<VkSampler>, NativeError> {
        let sampler = match descriptor {
            Descriptor::Sampler(sampler) => self.samplers.get(sampler.index() as usize).cloned(),
            _ => None,
        };
        sampler.ok_or_else(|| self.resource_error(descriptor))
    }
    fn vk_buffer(&self, descriptor: &Descriptor) -> Result<Subbuffer<[u8]>, NativeError> {
        let buffer = match descriptor {
            Descriptor::Buffer(buffer) => buffer.memory().vulkan().and_then(VulkanMemory::subbuffer),
            _ => None,
        };
        buffer.ok_or_else(|| self.resource_error(descriptor))
    }
    fn vk_image_view(&self, descriptor: &Descriptor) -> Result<Arc<ImageView>, NativeError> {
        let view = match descriptor {
            Descriptor::Image { image, mip_level } => {
                image.memory().vulkan().and_then(|memory| memory.view(*mip_level))
            }
            _ => None,
        };
        view.ok_or_else(|| self.resource_error(descriptor))
    }
    /// Creates the set holding `bindings`.
    ///
    /// Returns `None` while a binding is unwritten.
    fn native_set(
        &self,
        layout: &DescriptorSetLayout,
        bindings: &[Vec<Descriptor>],
    ) -> Result<Option<NativeDescriptorSet>, NativeError> {
        if bindings.iter().any(Vec::is_empty) {
            return Ok(None);
        }
        let mut writes = Vec::with_capacity(bindings.len());
        for (i, (descriptors, binding)) in bindings.iter().zip(layout.bindings()).enumerate() {
            let i = i as u32;
            let write = match binding.ty {
                DescriptorType::Sampler => {
                    let samplers = descriptors
                        .iter()
                        .map(|x| self.vk_sampler(x))
                        .collect::<Result<Vec<_>, _>>()?;
                    WriteDescriptorSet::sampler_array(i, 0, samplers)
                }
                DescriptorType::UniformBuffer | DescriptorType::StorageBuffer => {
                    let buffers = descriptors
                        .iter()
                        .map(|x| self.vk_buffer(x))
                        .collect::<Result<Vec<_>, _>>()?;
                    WriteDescriptorSet::buffer_array(i, 0, buffers)
                }
                DescriptorType::SampledImage | DescriptorType::StorageImage => {
                    let mut views = descriptors
                        .iter()
                        .map(|x| self.vk_image_view(x))
                        .collect::<Result<Vec<_>, _>>()?;
                    if binding.count == 0 {
                        if views.len() > MAX_MIP_LEVELS as usize {
                            return Err(self.error(
                                "update_descriptor_sets",
                                NativeCode::Unsupported,
                                format!(
                                    "binding {i} holds {} mip levels, at most {MAX_MIP_LEVELS} can be bound",
                                    views.len()
                                ),
                            ));
                        }
                        if let Some(last) = views.last().cloned() {
                            views.resize(MAX_MIP_LEVELS as usize, last);
                        }
                    }
                    WriteDescriptorSet::image_view_array(i, 0, views)
                }
            };
            writes.push(write);
        }
        let set = PersistentDescriptorSet::new(
            &self.descriptor_set_allocator,
            self.set_layout(layout)?,
            writes,
            [],
        )
        .map_err(self.native_error("update_descriptor_sets", NativeCode::InvalidDescriptor))?;
        Ok(Some(set))
    }
    fn staging(&self, len: usize) -> Result<Subbuffer<[u8]>, NativeError> {
        VkBuffer::new_slice::<u8>(
            self.memory_allocator.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_HOST
                    | MemoryTypeFilter::HOST_RANDOM_ACCESS,
                ..Default::default()
            },
            len as DeviceSize,
        )
        .map_err(self.native_error("alloc", NativeCode::OutOfDeviceMemory))
    }
    fn staging_from(&self, data: &[u8]) -> Result<Subbuffer<[u8]>, NativeError> {
        let staging = self.staging(data.len())?;
        staging
            .write()
            .map_err(self.native_error("write", NativeCode::ExecutionFailed))?
            .copy_from_slice(data);
        Ok(staging)
    }
    fn command_buffer_builder(
        &self,
    ) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, NativeError> {
        AutoCommandBufferBuilder::primary(
            &self.command_buffer_allocator,
            self.queue.queue_family_index(),
            CommandBufferUsage::OneTimeSubmit,
        )
        .map_err(self.native_error("record", NativeCode::ExecutionFailed))
    }
    /// Submits `builder` and waits for it to finish.
    fn submit(
        &self,
        builder: AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    ) -> Result<(), NativeError> {
        let command_buffer = builder
            .build()
            .map_err(self.native_error("record", NativeCode::ExecutionFailed))?;
        command_buffer
            .execute(self.queue.clone())
            .map_err(self.native_error("submit", NativeCode::ExecutionFailed))?
            .then_signal_fence_and_flush()
            .map_err(self.native_error("submit", NativeCode::ExecutionFailed))?
            .wait(None)
            .map_err(self.native_error("submit", NativeCode::ExecutionFailed))
    }
}

impl DeviceEngine for Engine {
    type Module = VulkanModule;
    type Entry = VulkanEntry;
    type Memory = VulkanMemory;
    fn index(&self) -> usize {
        self.index
    }
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn fixed_samplers(&self) -> &DescriptorSet {
        &self.fixed_samplers
    }
    fn create_module(&self, words: &[u32]) -> Result<Arc<VulkanModule>, NativeError> {
        let module = unsafe {
            ShaderModule::new(self.device.clone(), ShaderModuleCreateInfo::new(words))
        }
        .map_err(self.native_error("create_module", NativeCode::InvalidModule))?;
        log::trace!(
            "Device({}) created module ({} words)",
            self.index,
            words.len()
        );
        Ok(Arc::new(VulkanModule { module }))
    }
    fn create_entry(
        &self,
        module: &Arc<VulkanModule>,
        info: &FunctionInfo,
    ) -> Result<(VulkanEntry, u32), NativeError> {
        if info.function_type != FunctionType::Kernel {
            return Err(self.error(
                "create_entry",
                NativeCode::Unsupported,
                format!(
                    "{:?} is a {:?} function, only kernels run on Vulkan",
                    info.name, info.function_type
                ),
            ));
        }
        let entry_point = module.module.entry_point(&info.name).ok_or_else(|| {
            self.error(
                "create_entry",
                NativeCode::FunctionNotFound,
                format!("no entry point named {:?}", info.name),
            )
        })?;
        let mut set_layouts = vec![self.set_layout(&sampler::fixed_layout())?];
        if let Some(layout) = DescriptorSetLayout::from_function(info) {
            set_layouts.push(self.set_layout(&layout)?);
        }
        let layout = PipelineLayout::new(
            self.device.clone(),
            PipelineLayoutCreateInfo {
                set_layouts,
                ..Default::default()
            },
        )
        .map_err(self.native_error("create_entry", NativeCode::InvalidModule))?;
        let pipeline = ComputePipeline::new(
            self.device.clone(),
            None,
            ComputePipelineCreateInfo::stage_layout(
                PipelineShaderStageCreateInfo::new(entry_point),
                layout,
            ),
        )
        .map_err(self.native_error("create_entry", NativeCode::InvalidModule))?;
        Ok((VulkanEntry { pipeline }, self.info.max_total_local_size()))
    }
    fn alloc(
        self: &Arc<Self>,
        desc: &MemoryDesc,
        memory_type: u32,
    ) -> Result<VulkanMemory, NativeError> {
        if !self.info.memory_types().contains(memory_type) {
            return Err(self.error(
                "alloc",
                NativeCode::InvalidMemoryType,
                format!("memory type {memory_type} does not exist"),
            ));
        }
        let host_visible = self
            .host_visible
            .get(memory_type as usize)
            .copied()
            .unwrap_or(false);
        let allocation_info = AllocationCreateInfo {
            memory_type_filter: if host_visible {
                MemoryTypeFilter::HOST_RANDOM_ACCESS
            } else {
                MemoryTypeFilter::PREFER_DEVICE
            },
            memory_type_bits: 1u32.checked_shl(memory_type).unwrap_or(0),
            ..Default::default()
        };
        let resource = match desc {
            MemoryDesc::Buffer { len } => {
                let buffer = VkBuffer::new_slice::<u8>(
                    self.memory_allocator.clone(),
                    BufferCreateInfo {
                        usage: BufferUsage::STORAGE_BUFFER
                            | BufferUsage::UNIFORM_BUFFER
                            | BufferUsage::TRANSFER_SRC
                            | BufferUsage::TRANSFER_DST,
                        ..Default::default()
                    },
                    allocation_info,
                    (*len).max(1) as DeviceSize,
                )
                .map_err(self.native_error("alloc", NativeCode::OutOfDeviceMemory))?;
                Resource::Buffer(buffer)
            }
            MemoryDesc::Image {
                extent,
                format,
                levels,
            } => {
                let image = VkImage::new(
                    self.memory_allocator.clone(),
                    ImageCreateInfo {
                        image_type: image_type(*extent),
                        format: vk_format(*format),
                        extent: *extent,
                        mip_levels: levels.len() as u32,
                        usage: ImageUsage::SAMPLED
                            | ImageUsage::STORAGE
                            | ImageUsage::TRANSFER_SRC
                            | ImageUsage::TRANSFER_DST,
                        ..Default::default()
                    },
                    allocation_info,
                )
                .map_err(self.native_error("alloc", NativeCode::OutOfDeviceMemory))?;
                let view = ImageView::new_default(image.clone())
                    .map_err(self.native_error("alloc", NativeCode::ExecutionFailed))?;
                let mip_views = (0..levels.len() as u32)
                    .map(|level| {
                        ImageView::new(
                            image.clone(),
                            ImageViewCreateInfo {
                                subresource_range: ImageSubresourceRange {
                                    aspects: ImageAspects::COLOR,
                                    mip_levels: level..level + 1,
                                    array_layers: 0..1,
                                },
                                ..ImageViewCreateInfo::from_image(&image)
                            },
                        )
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(self.native_error("alloc", NativeCode::ExecutionFailed))?;
                Resource::Image {
                    image,
                    view,
                    mip_views,
                    levels: levels.clone(),
                }
            }
        };
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(VulkanMemory {
            engine: self.clone(),
            memory_type,
            len: desc.len(),
            resource,
        })
    }
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<(), NativeError> {
        for write in writes.iter() {
            validate_write(write, self.index).map_err(|message| {
                self.error("update_descriptor_sets", NativeCode::InvalidDescriptor, message)
            })?;
        }
        let mut sets: Vec<&DescriptorSet> = Vec::new();
        for write in writes.iter() {
            if !sets.contains(&&write.set) {
                sets.push(&write.set);
            }
        }
        // built from the bindings after the writes, before any is applied
        let natives = sets
            .iter()
            .map(|set| {
                let bindings: Vec<Vec<Descriptor>> = (0..set.layout().bindings().len() as u32)
                    .map(|binding| {
                        writes
                            .iter()
                            .rev()
                            .find(|write| write.set == **set && write.binding == binding)
                            .map(|write| write.descriptors.clone())
                            .or_else(|| set.descriptors(binding))
                            .unwrap_or_default()
                    })
                    .collect();
                self.native_set(set.layout(), &bindings)
            })
            .collect::<Result<Vec<_>, _>>()?;
        for write in writes.iter() {
            write
                .set
                .write_unchecked(write.binding, write.descriptors.clone());
        }
        for (set, native) in sets.into_iter().zip(natives) {
            if let Some(native) = native {
                set.set_native(native);
            }
        }
        Ok(())
    }
    fn execute(&self, command_buffer: &CommandBuffer) -> Result<(), NativeError> {
        let exec_error = |message: String| self.error("execute", NativeCode::ExecutionFailed, message);
        let mut builder = self.command_buffer_builder()?;
        let mut layout: Option<Arc<PipelineLayout>> = None;
        for command in command_buffer.commands() {
            log::trace!(
                "Device({}) {:?}: {command:?}",
                self.index,
                command_buffer.label()
            );
            match command {
                Command::BindPipeline { bind_point, stages } => {
                    let stage = match (bind_point, stages.as_slice()) {
                        (BindPoint::Compute, [stage]) => stage,
                        _ => {
                            return Err(self.error(
                                "execute",
                                NativeCode::Unsupported,
                                format!("{bind_point:?} pipeline of {} stages", stages.len()),
                            ))
                        }
                    };
                    let entry = stage.native().vulkan().ok_or_else(|| {
                        exec_error(format!("{:?} is not a Vulkan entry", stage.name()))
                    })?;
                    builder
                        .bind_pipeline_compute(entry.pipeline.clone())
                        .map_err(self.native_error("execute", NativeCode::ExecutionFailed))?;
                    layout.replace(entry.pipeline.layout().clone());
                }
                // barriers are recorded by the builder from the bound descriptors
                Command::TransitionImage { .. } => (),
                Command::BindDescriptorSets {
                    bind_point,
                    first_set,
                    sets,
                    dynamic_offsets,
                } => {
                    let layout = match (bind_point, layout.as_ref()) {
                        (BindPoint::Compute, Some(layout)) => layout.clone(),
                        _ => {
                            return Err(exec_error(format!(
                                "descriptor sets bound to {bind_point:?} without a matching pipeline"
                            )))
                        }
                    };
                    let expected: usize = sets
                        .iter()
                        .map(|set| set.layout().dynamic_offset_count())
                        .sum();
                    if dynamic_offsets.len() != expected {
                        return Err(exec_error(format!(
                            "sets {first_set}..{} expect {expected} dynamic offsets, found {}",
                            *first_set as usize + sets.len(),
                            dynamic_offsets.len()
                        )));
                    }
                    let mut offsets = dynamic_offsets.iter().copied();
                    let mut bound = Vec::with_capacity(sets.len());
                    for (i, set) in sets.iter().enumerate() {
                        let set_index = *first_set as usize + i;
                        if let Some(binding) = set.first_unwritten() {
                            return Err(exec_error(format!(
                                "binding {binding} of descriptor set {set_index} was not written"
                            )));
                        }
                        let native = set.native().ok_or_else(|| {
                            exec_error(format!(
                                "descriptor set {set_index} was not written on Device({})",
                                self.index
                            ))
                        })?;
                        let count = set.layout().dynamic_offset_count();
                        bound.push(DescriptorSetWithOffsets::new(
                            native,
                            offsets.by_ref().take(count),
                        ));
                    }
                    builder
                        .bind_descriptor_sets(PipelineBindPoint::Compute, layout, *first_set, bound)
                        .map_err(self.native_error("execute", NativeCode::ExecutionFailed))?;
                }
                Command::Dispatch { groups, .. } => {
                    if layout.is_none() {
                        return Err(exec_error("dispatch without a compute pipeline".into()));
                    }
                    if groups.contains(&0) {
                        continue;
                    }
                    // the local size is declared by the module
                    unsafe { builder.dispatch(*groups) }
                        .map_err(self.native_error("execute", NativeCode::ExecutionFailed))?;
                }
                Command::Draw(_) => {
                    return Err(self.error(
                        "execute",
                        NativeCode::Unsupported,
                        "draws are not supported on Vulkan",
                    ))
                }
            }
        }
        self.submit(builder)
    }
    fn live_memory(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{Buffer, MemoryFlags},
        context::Context,
        image::Image,
    };

    /// A context on the first physical device, if there is one.
    fn vulkan_context() -> Option<Context> {
        match Context::builder().vulkan_device(0).build() {
            Ok(context) => Some(context),
            Err(e) => {
                eprintln!("skipping, no Vulkan device: {e:#}");
                None
            }
        }
    }

    #[test]
    fn pixel_samplers_clamp() {
        let info = sampler_create_info(&Sampler::new(
            AddressMode::Repeat,
            Filter::Linear,
            CoordMode::Pixel,
        ));
        assert_eq!(info.address_mode, [SamplerAddressMode::ClampToEdge; 3]);
        assert!(info.unnormalized_coordinates);
        assert_eq!(info.mag_filter, VkFilter::Linear);
        let info = sampler_create_info(&Sampler::new(
            AddressMode::MirroredRepeat,
            Filter::Nearest,
            CoordMode::Normalized,
        ));
        assert_eq!(info.address_mode, [SamplerAddressMode::MirroredRepeat; 3]);
        assert!(!info.unnormalized_coordinates);
        let info = sampler_create_info(&Sampler::new(
            AddressMode::ClampToZero,
            Filter::Nearest,
            CoordMode::Normalized,
        ));
        assert_eq!(info.address_mode, [SamplerAddressMode::ClampToBorder; 3]);
        assert_eq!(info.border_color, BorderColor::FloatTransparentBlack);
    }

    #[test]
    fn variable_storage_images_are_padded() {
        assert_eq!(
            binding_type(DescriptorType::StorageImage, 0),
            (VkDescriptorType::StorageImage, MAX_MIP_LEVELS)
        );
        assert_eq!(
            binding_type(DescriptorType::StorageImage, 3),
            (VkDescriptorType::StorageImage, 3)
        );
        assert_eq!(
            binding_type(DescriptorType::StorageBuffer, 1),
            (VkDescriptorType::StorageBufferDynamic, 1)
        );
        assert_eq!(image_type([4, 1, 1]), ImageType::Dim2d);
        assert_eq!(image_type([4, 4, 2]), ImageType::Dim3d);
        assert_eq!(vk_format(ImageFormat::Rgba8Unorm), Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn vulkan_buffers() -> Result<()> {
        let Some(context) = vulkan_context() else {
            return Ok(());
        };
        let device = &context.devices()[0];
        assert!(device.backend().is_vulkan());
        let queue = context.default_queue(device)?;
        let data: Vec<u8> = (0..=255).collect();
        for flags in [MemoryFlags::empty(), MemoryFlags::host_read_write()] {
            let buffer = Buffer::from_bytes(device, &data, flags)?;
            assert!(buffer.contents().is_err());
            assert_eq!(buffer.read(&queue)?, data);
            buffer.write(&queue, &[7; 256])?;
            assert_eq!(buffer.read(&queue)?, [7; 256]);
        }
        let empty = Buffer::new(device, 0, MemoryFlags::empty())?;
        assert!(empty.read(&queue)?.is_empty());
        assert_eq!(device.live_buffers(), 1);
        Ok(())
    }

    #[test]
    fn vulkan_image_levels() -> Result<()> {
        let Some(context) = vulkan_context() else {
            return Ok(());
        };
        let device = &context.devices()[0];
        let queue = context.default_queue(device)?;
        let image = Image::new(device, [4, 2, 1], ImageFormat::Rgba8Unorm, 3)?;
        for level in 0..3 {
            let len = image.mip_range(level).map_or(0, |range| range.len());
            image.write_level(&queue, level, &vec![level as u8 + 1; len])?;
        }
        let data = image.read(&queue)?;
        for level in 0..3 {
            let range = image.mip_range(level).unwrap_or_default();
            assert!(data[range].iter().all(|&x| x == level as u8 + 1));
        }
        Ok(())
    }
}
