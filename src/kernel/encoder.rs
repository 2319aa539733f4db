use super::{error::BindingError, KernelArg, KernelEntry};
use crate::{
    buffer::{Buffer, MemoryFlags},
    descriptor::{Descriptor, DescriptorSet, DescriptorWrite},
    device::error::NativeError,
    future::Completion,
    image::{Image, ImageLayout},
    queue::{BindPoint, Command, CommandBuffer, DrawEntry, Queue},
};
use anyhow::Result;
use std::{iter::once, sync::Arc};
use xcompute_core::function::{ArgInfo, FunctionInfo, ImageAccess};

/// Cursor over the bindable arguments of one or more entries.
///
/// Local to one [`Encoder`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(super) struct IdxHandler {
    /// Index of the entry.
    pub(super) entry: usize,
    /// Index of the argument of the entry.
    pub(super) arg: usize,
    /// Binding slot in the set of the entry.
    pub(super) binding: u32,
    /// Number of descriptor writes.
    pub(super) write_desc: usize,
}

impl IdxHandler {
    /// Moves to the next bindable argument, skipping stage inputs and exhausted entries.
    ///
    /// Returns false when all entries are exhausted.
    pub(super) fn seek(&mut self, infos: &[&FunctionInfo]) -> bool {
        while let Some(info) = infos.get(self.entry) {
            while let Some(arg) = info.args.get(self.arg) {
                if !arg.is_stage_input() {
                    return true;
                }
                self.arg += 1;
            }
            self.entry += 1;
            self.arg = 0;
            self.binding = 0;
        }
        false
    }
    /// Moves past the current argument.
    pub(super) fn advance(&mut self, arg: &ArgInfo) {
        self.arg += 1;
        self.binding += arg.binding_slots();
    }
}

/// Records one launch or draw into a command buffer.
///
/// Owns the temporary buffers of value arguments until the submission completed. Image
/// layouts are only committed when the command buffer is submitted.
pub(super) struct Encoder<'a> {
    queue: &'a Queue,
    entries: Vec<Arc<KernelEntry>>,
    bind_point: BindPoint,
    command_buffer: CommandBuffer,
    /// The set of each entry, `None` for entries without bindings.
    sets: Vec<Option<DescriptorSet>>,
    /// Dynamic offsets of each entry.
    dynamic_offsets: Vec<Vec<u32>>,
    writes: Vec<DescriptorWrite>,
    /// Layouts of transitioned images, in recording order.
    layouts: Vec<(Image, ImageLayout)>,
    temporaries: Vec<Buffer>,
    idx: IdxHandler,
}

impl<'a> Encoder<'a> {
    pub(super) fn new(queue: &'a Queue, entries: Vec<Arc<KernelEntry>>, bind_point: BindPoint) -> Self {
        let label = entries
            .iter()
            .map(|entry| entry.name())
            .collect::<Vec<_>>()
            .join("+");
        let mut command_buffer = CommandBuffer::new(label);
        command_buffer.push(Command::BindPipeline {
            bind_point,
            stages: entries.clone(),
        });
        let sets = entries
            .iter()
            .map(|entry| entry.descriptor_set_layout().cloned().map(DescriptorSet::new))
            .collect();
        let dynamic_offsets = vec![Vec::new(); entries.len()];
        Self {
            queue,
            entries,
            bind_point,
            command_buffer,
            sets,
            dynamic_offsets,
            writes: Vec::new(),
            layouts: Vec::new(),
            temporaries: Vec::new(),
            idx: IdxHandler::default(),
        }
    }
    fn binding_error(&self, error: BindingError) -> anyhow::Error {
        log::error!("{error}");
        error.into()
    }
    /// Binds `args` to the bindable arguments of all entries, in order.
    pub(super) fn set_args(&mut self, args: &[KernelArg]) -> Result<()> {
        let entries = self.entries.clone();
        let infos: Vec<&FunctionInfo> = entries.iter().map(|entry| entry.info()).collect();
        let expected: usize = infos.iter().map(|info| info.bindable_args().count()).sum();
        let bounds_checks = self.queue.bounds_checks();
        for (index, arg) in args.iter().enumerate() {
            if !self.idx.seek(&infos) {
                if bounds_checks {
                    return Err(self.binding_error(BindingError::TooManyArguments {
                        kernel: self.command_buffer.label().to_string(),
                        expected,
                        found: args.len(),
                    }));
                }
                break;
            }
            let info = infos[self.idx.entry].args[self.idx.arg];
            if bounds_checks {
                self.check_arg(index, &info, arg)?;
            }
            self.set_arg(&info, arg)?;
            self.idx.advance(&info);
        }
        if bounds_checks && self.idx.seek(&infos) {
            return Err(self.binding_error(BindingError::MissingArguments {
                kernel: self.command_buffer.label().to_string(),
                expected,
                found: args.len(),
            }));
        }
        Ok(())
    }
    fn check_arg(&self, index: usize, info: &ArgInfo, arg: &KernelArg) -> Result<()> {
        let kernel = || self.entries[self.idx.entry].name().to_string();
        if info.kind != arg.kind() {
            return Err(self.binding_error(BindingError::KindMismatch {
                kernel: kernel(),
                index,
                expected: info.kind,
                found: arg.kind(),
            }));
        }
        if let KernelArg::ImageArray(images) = arg {
            if images.len() != info.array_size as usize {
                return Err(self.binding_error(BindingError::ImageArrayLength {
                    kernel: kernel(),
                    index,
                    expected: info.array_size,
                    found: images.len(),
                }));
            }
        }
        Ok(())
    }
    fn set_arg(&mut self, info: &ArgInfo, arg: &KernelArg) -> Result<()> {
        match arg {
            KernelArg::Value(bytes) => self.set_value(bytes)?,
            KernelArg::Buffer(buffer) => self.set_buffer(buffer),
            KernelArg::Image(image) => self.set_image(info.image_access, image),
            KernelArg::ImageArray(images) => self.set_image_array(info.image_access, images),
        }
        Ok(())
    }
    fn write(&mut self, binding: u32, descriptors: Vec<Descriptor>) {
        if let Some(set) = self.sets[self.idx.entry].clone() {
            self.writes.push(DescriptorWrite {
                set,
                binding,
                descriptors,
            });
            self.idx.write_desc += 1;
        }
    }
    fn set_value(&mut self, bytes: &[u8]) -> Result<()> {
        let buffer = Buffer::from_bytes(
            self.queue.device(),
            bytes,
            MemoryFlags::empty().with_host_write(true),
        )?;
        self.write(self.idx.binding, vec![Descriptor::Buffer(buffer.clone())]);
        self.temporaries.push(buffer);
        Ok(())
    }
    fn set_buffer(&mut self, buffer: &Buffer) {
        self.write(self.idx.binding, vec![Descriptor::Buffer(buffer.clone())]);
        self.dynamic_offsets[self.idx.entry].push(0);
    }
    fn image_layout(access: ImageAccess) -> ImageLayout {
        if access.writes() {
            ImageLayout::General
        } else {
            ImageLayout::ShaderReadOnly
        }
    }
    /// Records a transition of `image` to `layout`, unless it is already in `layout`.
    fn transition(&mut self, image: &Image, layout: ImageLayout) {
        let current = self
            .layouts
            .iter()
            .rev()
            .find(|(x, _)| x == image)
            .map_or_else(|| image.layout(), |(_, layout)| *layout);
        if current == layout {
            return;
        }
        self.command_buffer.push(Command::TransitionImage {
            image: image.clone(),
            from: current,
            to: layout,
        });
        self.layouts.push((image.clone(), layout));
    }
    fn set_image(&mut self, access: ImageAccess, image: &Image) {
        self.transition(image, Self::image_layout(access));
        let mut binding = self.idx.binding;
        if access.reads() {
            self.write(
                binding,
                vec![Descriptor::Image {
                    image: image.clone(),
                    mip_level: None,
                }],
            );
            binding += 1;
        }
        if access.writes() {
            let descriptors = (0..image.mip_levels())
                .map(|level| Descriptor::Image {
                    image: image.clone(),
                    mip_level: Some(level),
                })
                .collect();
            self.write(binding, descriptors);
        }
    }
    fn set_image_array(&mut self, access: ImageAccess, images: &[Image]) {
        let layout = Self::image_layout(access);
        for image in images.iter() {
            self.transition(image, layout);
        }
        let mip_level = access.writes().then_some(0);
        let descriptors = images
            .iter()
            .map(|image| Descriptor::Image {
                image: image.clone(),
                mip_level,
            })
            .collect();
        self.write(self.idx.binding, descriptors);
    }
    /// Writes all descriptors, then binds the sampler set and the entry sets.
    ///
    /// Set 0 is the fixed sampler set, set `1 + i` the set of entry `i`. Each contiguous run of
    /// sets is bound with one command, carrying the dynamic offsets of its sets.
    pub(super) fn update_and_bind(&mut self) -> Result<(), NativeError> {
        let device = self.queue.device();
        if !self.writes.is_empty() {
            device.update_descriptor_sets(&self.writes).map_err(|e| {
                log::error!("{:?}: {e}", self.command_buffer.label());
                e
            })?;
        }
        let sets: Vec<Option<DescriptorSet>> = once(Some(device.fixed_samplers().clone()))
            .chain(self.sets.iter().cloned())
            .collect();
        let dynamic_offsets: Vec<&[u32]> = once(&[] as &[u32])
            .chain(self.dynamic_offsets.iter().map(Vec::as_slice))
            .collect();
        let mut index = 0;
        while index < sets.len() {
            if sets[index].is_none() {
                index += 1;
                continue;
            }
            let first_set = index;
            let mut bound = Vec::new();
            let mut offsets = Vec::new();
            while let Some(Some(set)) = sets.get(index) {
                bound.push(set.clone());
                offsets.extend_from_slice(dynamic_offsets[index]);
                index += 1;
            }
            self.command_buffer.push(Command::BindDescriptorSets {
                bind_point: self.bind_point,
                first_set: first_set as u32,
                sets: bound,
                dynamic_offsets: offsets,
            });
        }
        Ok(())
    }
    pub(super) fn dispatch(&mut self, groups: [u32; 3], local_size: [u32; 3]) {
        self.command_buffer
            .push(Command::Dispatch { groups, local_size });
    }
    pub(super) fn draw(&mut self, draw: DrawEntry) {
        self.command_buffer.push(Command::Draw(draw));
    }
    /// Commits the image layouts and submits the command buffer.
    ///
    /// The temporaries are released before `on_complete` is called.
    pub(super) fn submit(self, on_complete: Option<Box<dyn FnOnce() + Send>>) -> Completion {
        for (image, layout) in self.layouts {
            image.set_layout(layout);
        }
        let temporaries = self.temporaries;
        self.queue.submit(self.command_buffer, move |_| {
            drop(temporaries);
            if let Some(on_complete) = on_complete {
                on_complete();
            }
        })
    }
}
