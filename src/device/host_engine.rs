use super::{
    error::{NativeCode, NativeError},
    DeviceEngine, DeviceEngineMemory, DeviceInfo, MemoryDesc,
};
use crate::{
    buffer::Buffer,
    descriptor::{validate_write, Descriptor, DescriptorSet, DescriptorSetLayout, DescriptorWrite},
    image::Image,
    kernel::KernelEntry,
    queue::{BindPoint, Command, CommandBuffer, DrawEntry},
    sampler::{self, Sampler},
};
use anyhow::{bail, format_err, Result};
use bytemuck::Pod;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
    fmt::{self, Debug},
    mem::size_of,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use xcompute_core::function::{FunctionInfo, FunctionType};

type HostFn = dyn Fn(&Invocation) -> Result<()> + Send + Sync;

/** A kernel implemented on the host.

Registered on a device with [`Device::register_function`](super::Device::register_function).
```
# use xcompute::device::HostFunction;
let fill = HostFunction::new(|invocation| {
    let y = invocation.buffer(1)?;
    let x = invocation.value::<u8>(0)?;
    y.contents_mut()?.fill(x);
    Ok(())
})
.with_max_total_local_size(64);
```
*/
#[derive(Clone)]
pub struct HostFunction {
    f: Arc<HostFn>,
    max_total_local_size: Option<u32>,
}

impl HostFunction {
    pub fn new(f: impl Fn(&Invocation) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            f: Arc::new(f),
            max_total_local_size: None,
        }
    }
    /// Limits the local size of entries below the device limit.
    pub fn with_max_total_local_size(mut self, max_total_local_size: u32) -> Self {
        self.max_total_local_size.replace(max_total_local_size);
        self
    }
}

impl Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("max_total_local_size", &self.max_total_local_size)
            .finish_non_exhaustive()
    }
}

/// One call of a [`HostFunction`], for a dispatch or for one stage of a draw.
pub struct Invocation<'a> {
    name: &'a str,
    groups: [u32; 3],
    local_size: [u32; 3],
    draw: Option<DrawEntry>,
    set: Option<&'a DescriptorSet>,
    samplers: &'a DescriptorSet,
}

impl Invocation<'_> {
    /// The entry point name.
    pub fn name(&self) -> &str {
        self.name
    }
    pub fn groups(&self) -> [u32; 3] {
        self.groups
    }
    pub fn local_size(&self) -> [u32; 3] {
        self.local_size
    }
    /// `groups * local_size`.
    pub fn global_size(&self) -> [u32; 3] {
        let mut global_size = self.groups;
        for (g, l) in global_size.iter_mut().zip(self.local_size) {
            *g = g.saturating_mul(l);
        }
        global_size
    }
    /// The draw, for stages of a draw.
    pub fn draw(&self) -> Option<DrawEntry> {
        self.draw
    }
    /// The descriptors of `binding`.
    pub fn descriptors(&self, binding: u32) -> Result<Vec<Descriptor>> {
        let set = self
            .set
            .ok_or_else(|| format_err!("{:?} has no descriptor set!", self.name))?;
        set.descriptors(binding)
            .ok_or_else(|| format_err!("{:?} has no binding {binding}!", self.name))
    }
    fn first(&self, binding: u32) -> Result<Descriptor> {
        self.descriptors(binding)?
            .into_iter()
            .next()
            .ok_or_else(|| format_err!("{:?} binding {binding} is empty!", self.name))
    }
    /// The buffer at `binding`.
    pub fn buffer(&self, binding: u32) -> Result<Buffer> {
        match self.first(binding)? {
            Descriptor::Buffer(buffer) => Ok(buffer),
            descriptor => bail!(
                "{:?} binding {binding} is {descriptor:?}, not a buffer!",
                self.name
            ),
        }
    }
    /// Reads a `T` from the start of the buffer at `binding`.
    pub fn value<T: Pod>(&self, binding: u32) -> Result<T> {
        let buffer = self.buffer(binding)?;
        let contents = buffer.contents()?;
        let bytes = contents.get(..size_of::<T>()).ok_or_else(|| {
            format_err!(
                "{:?} binding {binding} has {}B, expected {}B!",
                self.name,
                contents.len(),
                size_of::<T>()
            )
        })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
    /// The image at `binding`.
    pub fn image(&self, binding: u32) -> Result<Image> {
        match self.first(binding)? {
            Descriptor::Image { image, .. } => Ok(image),
            descriptor => bail!(
                "{:?} binding {binding} is {descriptor:?}, not an image!",
                self.name
            ),
        }
    }
    /// The images at `binding`, one per descriptor.
    ///
    /// Storage images hold one descriptor per mip level, see [`Invocation::image`].
    pub fn images(&self, binding: u32) -> Result<Vec<Image>> {
        self.descriptors(binding)?
            .into_iter()
            .map(|descriptor| match descriptor {
                Descriptor::Image { image, .. } => Ok(image),
                descriptor => Err(format_err!(
                    "{:?} binding {binding} holds {descriptor:?}, not an image!",
                    self.name
                )),
            })
            .collect()
    }
    /// The sampler at `index` of the bound sampler set.
    pub fn sampler(&self, index: u32) -> Option<Sampler> {
        match self.samplers.descriptors(0)?.get(index as usize)? {
            Descriptor::Sampler(sampler) => Some(*sampler),
            _ => None,
        }
    }
}

pub(crate) struct HostModule {
    id: u64,
    words: usize,
}

pub(crate) struct HostEntry {
    name: String,
    function: HostFunction,
    layout: Option<DescriptorSetLayout>,
}

pub(crate) struct HostMemory {
    data: RwLock<Vec<u8>>,
    device: usize,
    memory_type: u32,
    live: Arc<AtomicUsize>,
}

impl HostMemory {
    pub(crate) fn map(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }
    pub(crate) fn map_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
    fn error(&self, operation: &'static str, message: String) -> NativeError {
        NativeError::new(self.device, operation, NativeCode::ExecutionFailed, message)
    }
}

impl DeviceEngineMemory for HostMemory {
    fn len(&self) -> usize {
        self.data.read().len()
    }
    fn memory_type(&self) -> u32 {
        self.memory_type
    }
    fn read(&self, data: &mut [u8]) -> Result<(), NativeError> {
        let contents = self.data.read();
        if data.len() != contents.len() {
            return Err(self.error(
                "read",
                format!("read of {}B from {}B", data.len(), contents.len()),
            ));
        }
        data.copy_from_slice(&contents);
        Ok(())
    }
    fn write(&self, offset: usize, data: &[u8]) -> Result<(), NativeError> {
        let mut contents = self.data.write();
        let len = contents.len();
        let range = offset
            .checked_add(data.len())
            .filter(|&end| end <= len)
            .map(|end| offset..end)
            .ok_or_else(|| {
                self.error(
                    "write",
                    format!("write of {}B at {offset} into {len}B", data.len()),
                )
            })?;
        contents[range].copy_from_slice(data);
        Ok(())
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Engine {
    index: usize,
    info: Arc<DeviceInfo>,
    functions: DashMap<String, HostFunction>,
    fixed_samplers: DescriptorSet,
    live: Arc<AtomicUsize>,
}

impl Engine {
    pub(super) fn new(index: usize, info: Arc<DeviceInfo>) -> Result<Arc<Self>> {
        let fixed_samplers = DescriptorSet::new(sampler::fixed_layout());
        update(index, &[sampler::fixed_sampler_write(&fixed_samplers)]).map_err(|e| {
            let e = NativeError::new(
                index,
                "create_device",
                NativeCode::InitializationFailed,
                format!("failed to create the fixed sampler set: {e}"),
            );
            log::error!("{e}");
            e
        })?;
        log::debug!("created Device({index}) {:?}", info.name());
        Ok(Arc::new(Self {
            index,
            info,
            functions: DashMap::new(),
            fixed_samplers,
            live: Arc::default(),
        }))
    }
    pub(super) fn register_function(&self, name: String, function: HostFunction) {
        log::debug!("Device({}) registered host function {name:?}", self.index);
        self.functions.insert(name, function);
    }
    fn error(&self, operation: &'static str, code: NativeCode, message: impl Into<String>) -> NativeError {
        NativeError::new(self.index, operation, code, message)
    }
    fn invoke(
        &self,
        entry: &KernelEntry,
        stage: usize,
        sets: &[Option<DescriptorSet>],
        groups: [u32; 3],
        local_size: [u32; 3],
        draw: Option<DrawEntry>,
    ) -> Result<(), NativeError> {
        let exec_error = |message: String| self.error("execute", NativeCode::ExecutionFailed, message);
        if entry.device().index() != self.index {
            return Err(exec_error(format!(
                "{:?} belongs to Device({})",
                entry.name(),
                entry.device().index()
            )));
        }
        let native = entry.native().host().ok_or_else(|| {
            exec_error(format!("{:?} is not a host entry", entry.name()))
        })?;
        let set_index = 1 + stage;
        let set = if let Some(layout) = native.layout.as_ref() {
            let set = sets
                .get(set_index)
                .and_then(Option::as_ref)
                .ok_or_else(|| {
                    exec_error(format!(
                        "{:?} requires descriptor set {set_index}, which is not bound",
                        native.name
                    ))
                })?;
            if set.layout() != layout {
                return Err(exec_error(format!(
                    "descriptor set {set_index} does not match the layout of {:?}",
                    native.name
                )));
            }
            if let Some(binding) = set.first_unwritten() {
                return Err(exec_error(format!(
                    "binding {binding} of descriptor set {set_index} of {:?} was not written",
                    native.name
                )));
            }
            Some(set)
        } else {
            None
        };
        let samplers = sets
            .first()
            .and_then(Option::as_ref)
            .unwrap_or(&self.fixed_samplers);
        let invocation = Invocation {
            name: &native.name,
            groups,
            local_size,
            draw,
            set,
            samplers,
        };
        (native.function.f)(&invocation)
            .map_err(|e| exec_error(format!("{:?}: {e:#}", native.name)))
    }
}

fn update(index: usize, writes: &[DescriptorWrite]) -> Result<(), NativeError> {
    for write in writes.iter() {
        validate_write(write, index).map_err(|message| {
            NativeError::new(
                index,
                "update_descriptor_sets",
                NativeCode::InvalidDescriptor,
                message,
            )
        })?;
    }
    for write in writes.iter() {
        write
            .set
            .write_unchecked(write.binding, write.descriptors.clone());
    }
    Ok(())
}

impl DeviceEngine for Engine {
    type Module = HostModule;
    type Entry = HostEntry;
    type Memory = HostMemory;
    fn index(&self) -> usize {
        self.index
    }
    fn info(&self) -> &Arc<DeviceInfo> {
        &self.info
    }
    fn fixed_samplers(&self) -> &DescriptorSet {
        &self.fixed_samplers
    }
    fn create_module(&self, words: &[u32]) -> Result<Arc<HostModule>, NativeError> {
        const HEADER_WORDS: usize = 5;
        if words.len() < HEADER_WORDS || words[0] != spirv::MAGIC_NUMBER {
            return Err(self.error(
                "create_module",
                NativeCode::InvalidModule,
                format!("invalid SPIR-V header ({} words)", words.len()),
            ));
        }
        let module = HostModule {
            id: crate::device::next_handle(),
            words: words.len(),
        };
        log::trace!(
            "Device({}) created module {} ({} words)",
            self.index,
            module.id,
            module.words
        );
        Ok(Arc::new(module))
    }
    fn create_entry(
        &self,
        module: &Arc<HostModule>,
        info: &FunctionInfo,
    ) -> Result<(HostEntry, u32), NativeError> {
        if info.function_type == FunctionType::None {
            return Err(self.error(
                "create_entry",
                NativeCode::InvalidModule,
                format!("{:?} of module {} has no function type", info.name, module.id),
            ));
        }
        let function = self
            .functions
            .get(&info.name)
            .map(|x| x.value().clone())
            .ok_or_else(|| {
                self.error(
                    "create_entry",
                    NativeCode::FunctionNotFound,
                    format!("no host function named {:?}", info.name),
                )
            })?;
        let device_max = self.info.max_total_local_size();
        let max_total_local_size = match function.max_total_local_size {
            Some(max) if device_max == 0 => max,
            Some(max) => max.min(device_max),
            None => device_max,
        };
        let entry = HostEntry {
            name: info.name.clone(),
            function,
            layout: DescriptorSetLayout::from_function(info),
        };
        Ok((entry, max_total_local_size))
    }
    fn alloc(
        self: &Arc<Self>,
        desc: &MemoryDesc,
        memory_type: u32,
    ) -> Result<HostMemory, NativeError> {
        let len = desc.len();
        if !self.info.memory_types().contains(memory_type) {
            return Err(self.error(
                "alloc",
                NativeCode::InvalidMemoryType,
                format!("memory type {memory_type} does not exist"),
            ));
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            self.error(
                "alloc",
                NativeCode::OutOfDeviceMemory,
                format!("{len}B: {e}"),
            )
        })?;
        data.resize(len, 0);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(HostMemory {
            data: RwLock::new(data),
            device: self.index,
            memory_type,
            live: self.live.clone(),
        })
    }
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) -> Result<(), NativeError> {
        update(self.index, writes)
    }
    fn execute(&self, command_buffer: &CommandBuffer) -> Result<(), NativeError> {
        let exec_error = |message: String| self.error("execute", NativeCode::ExecutionFailed, message);
        let mut pipeline: Option<(BindPoint, &[Arc<KernelEntry>])> = None;
        let mut sets: Vec<Option<DescriptorSet>> = Vec::new();
        for command in command_buffer.commands() {
            log::trace!(
                "Device({}) {:?}: {command:?}",
                self.index,
                command_buffer.label()
            );
            match command {
                Command::BindPipeline { bind_point, stages } => {
                    pipeline.replace((*bind_point, stages.as_slice()));
                    sets.clear();
                }
                // host memory has no layouts
                Command::TransitionImage { .. } => (),
                Command::BindDescriptorSets {
                    bind_point,
                    first_set,
                    sets: bound,
                    dynamic_offsets,
                } => {
                    if pipeline.map(|x| x.0) != Some(*bind_point) {
                        return Err(exec_error(format!(
                            "descriptor sets bound to {bind_point:?} without a matching pipeline"
                        )));
                    }
                    let expected: usize = bound
                        .iter()
                        .map(|set| set.layout().dynamic_offset_count())
                        .sum();
                    if dynamic_offsets.len() != expected {
                        return Err(exec_error(format!(
                            "sets {first_set}..{} expect {expected} dynamic offsets, found {}",
                            *first_set as usize + bound.len(),
                            dynamic_offsets.len()
                        )));
                    }
                    let first_set = *first_set as usize;
                    if sets.len() < first_set + bound.len() {
                        sets.resize(first_set + bound.len(), None);
                    }
                    for (slot, set) in sets[first_set..].iter_mut().zip(bound) {
                        slot.replace(set.clone());
                    }
                }
                Command::Dispatch { groups, local_size } => {
                    let stage = match pipeline {
                        Some((BindPoint::Compute, [stage])) => stage,
                        _ => return Err(exec_error("dispatch without a compute pipeline".into())),
                    };
                    if groups.contains(&0) {
                        continue;
                    }
                    self.invoke(stage, 0, &sets, *groups, *local_size, None)?;
                }
                Command::Draw(draw) => {
                    let stages = match pipeline {
                        Some((BindPoint::Graphics, stages)) => stages,
                        _ => return Err(exec_error("draw without a graphics pipeline".into())),
                    };
                    for (i, stage) in stages.iter().enumerate() {
                        self.invoke(stage, i, &sets, [1; 3], [1; 3], Some(*draw))?;
                    }
                }
            }
        }
        Ok(())
    }
    fn live_memory(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}
