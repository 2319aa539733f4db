/*!
Kernels.

A [`Kernel`] is an entry point of a [`Program`](crate::program::Program), resolved into one
[`KernelEntry`] per device it is available on. Kernels are launched on a [`Queue`] with a global
size in work items, a requested local size, and an ordered list of [`KernelArg`]s.

# Local size
The requested local size is corrected to fit the entry, see
[`KernelEntry::check_local_work_size`]. Corrections are logged once per entry.

# Arguments
Arguments are bound in declaration order, skipping stage inputs:
- [`KernelArg::Value`] is copied into a temporary uniform buffer, released when the launch completed.
- [`KernelArg::Buffer`] is bound as a storage buffer.
- [`KernelArg::Image`] is transitioned and bound for reading, writing (every mip level) or both.
- [`KernelArg::ImageArray`] binds one descriptor per image.

With [bounds checks](crate::context::ContextOptions::bounds_checks) enabled, argument count,
kind and image array length are validated before anything is submitted.
*/

use crate::{
    buffer::Buffer,
    descriptor::DescriptorSetLayout,
    device::{
        error::{NativeCode, NativeError},
        Device, RawEntry, RawModule,
    },
    future::Completion,
    image::Image,
    queue::{BindPoint, Queue},
};
use anyhow::Result;
use bytemuck::Pod;
use std::{
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use xcompute_core::{
    function::{ArgKind, FunctionInfo, FunctionType},
    work_group::{negotiate_local_size, LocalSizeLimits},
};

mod encoder;
use encoder::Encoder;

pub use crate::queue::DrawEntry;

pub mod error {
    use xcompute_core::function::{ArgKind, FunctionType};

    /// The kernel has no entry on the device.
    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Kernel {kernel:?} is not available on Device({device})!")]
    pub struct KernelUnavailable {
        pub(crate) kernel: String,
        pub(crate) device: usize,
    }

    #[derive(Clone, Debug, thiserror::Error)]
    #[error("Kernel {kernel:?} is a {found:?} function, expected {expected:?}!")]
    pub struct FunctionTypeMismatch {
        pub(crate) kernel: String,
        pub(crate) expected: FunctionType,
        pub(crate) found: FunctionType,
    }

    /// Arguments do not match the signature of a kernel.
    #[derive(Clone, Debug, thiserror::Error)]
    pub enum BindingError {
        #[error("{kernel:?} takes {expected} arguments, found {found}!")]
        TooManyArguments {
            kernel: String,
            expected: usize,
            found: usize,
        },
        #[error("{kernel:?} takes {expected} arguments, found {found}!")]
        MissingArguments {
            kernel: String,
            expected: usize,
            found: usize,
        },
        #[error("{kernel:?} argument {index} is a {expected:?}, found {found:?}!")]
        KindMismatch {
            kernel: String,
            index: usize,
            expected: ArgKind,
            found: ArgKind,
        },
        #[error("{kernel:?} argument {index} is an array of {expected} images, found {found}!")]
        ImageArrayLength {
            kernel: String,
            index: usize,
            expected: u32,
            found: usize,
        },
    }
}
use error::*;

/// An argument of a launch.
#[derive(Clone, Debug)]
pub enum KernelArg<'a> {
    /// Bytes of a scalar or a plain struct.
    Value(Vec<u8>),
    Buffer(&'a Buffer),
    Image(&'a Image),
    ImageArray(&'a [Image]),
}

impl KernelArg<'_> {
    /// A value argument holding the bytes of `value`.
    pub fn value<T: Pod>(value: &T) -> Self {
        Self::Value(bytemuck::bytes_of(value).to_vec())
    }
    pub fn kind(&self) -> ArgKind {
        match self {
            Self::Value(_) => ArgKind::Value,
            Self::Buffer(_) => ArgKind::Buffer,
            Self::Image(_) => ArgKind::Image,
            Self::ImageArray(_) => ArgKind::ImageArray,
        }
    }
}

impl<'a> From<&'a Buffer> for KernelArg<'a> {
    fn from(buffer: &'a Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl<'a> From<&'a Image> for KernelArg<'a> {
    fn from(image: &'a Image) -> Self {
        Self::Image(image)
    }
}

impl<'a> From<&'a [Image]> for KernelArg<'a> {
    fn from(images: &'a [Image]) -> Self {
        Self::ImageArray(images)
    }
}

/// A kernel on one device.
pub struct KernelEntry {
    info: FunctionInfo,
    device: Device,
    limits: LocalSizeLimits,
    layout: Option<DescriptorSetLayout>,
    native: RawEntry,
    warned: AtomicBool,
}

impl KernelEntry {
    /// **errors**
    /// - An image array argument has no elements.
    /// - The device failed to create the entry.
    pub(crate) fn new(
        device: &Device,
        module: &RawModule,
        info: &FunctionInfo,
    ) -> Result<Self, NativeError> {
        if let Some(index) = info
            .args
            .iter()
            .position(|arg| arg.kind == ArgKind::ImageArray && arg.array_size == 0)
        {
            return Err(NativeError::new(
                device.index(),
                "create_entry",
                NativeCode::InvalidModule,
                format!("argument {index} of {:?} is an array of 0 images", info.name),
            ));
        }
        let (native, max_total_local_size) = device.create_entry(module, info)?;
        Ok(Self {
            info: info.clone(),
            device: device.clone(),
            limits: LocalSizeLimits::new(device.info().max_local_size(), max_total_local_size),
            layout: DescriptorSetLayout::from_function(info),
            native,
            warned: AtomicBool::default(),
        })
    }
    pub fn name(&self) -> &str {
        &self.info.name
    }
    pub fn info(&self) -> &FunctionInfo {
        &self.info
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// Max local size per dimension.
    pub fn max_local_size(&self) -> [u32; 3] {
        self.limits.max_local_size
    }
    /// Max product of the local size of this entry.
    ///
    /// Queried from the device for the entry, may be lower than
    /// [`DeviceInfo::max_total_local_size`](crate::device::DeviceInfo::max_total_local_size).
    pub fn max_total_local_size(&self) -> u32 {
        self.limits.max_total_local_size
    }
    pub fn limits(&self) -> LocalSizeLimits {
        self.limits
    }
    /// The layout of descriptor set `1 + i` when bound as the `i`th stage.
    ///
    /// `None` if the entry has no bindable arguments.
    pub fn descriptor_set_layout(&self) -> Option<&DescriptorSetLayout> {
        self.layout.as_ref()
    }
    /// Fits `requested` into the limits of the entry.
    ///
    /// The first correction is logged as a warning, later ones are not.
    pub fn check_local_work_size(&self, requested: [u32; 3]) -> [u32; 3] {
        let negotiated = negotiate_local_size(requested, &self.limits);
        if negotiated.corrected && !self.warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "local work size {requested:?} of kernel {:?} exceeds the limits of {:?} ({:?}, {}), using {:?}",
                self.name(),
                self.device,
                self.limits.max_local_size,
                self.limits.max_total_local_size,
                negotiated.local_size,
            );
        }
        negotiated.local_size
    }
    pub(crate) fn native(&self) -> &RawEntry {
        &self.native
    }
}

impl Debug for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelEntry")
            .field("name", &self.info.name)
            .field("device", &self.device)
            .field("limits", &self.limits)
            .finish()
    }
}

/// A kernel.
#[derive(Debug)]
pub struct Kernel {
    name: String,
    entries: Vec<Arc<KernelEntry>>,
}

impl Kernel {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            entries: Vec::new(),
        }
    }
    pub(crate) fn push(&mut self, entry: Arc<KernelEntry>) {
        self.entries.push(entry);
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// The entry on `device`.
    pub fn entry(&self, device: &Device) -> Option<&Arc<KernelEntry>> {
        self.entries.iter().find(|entry| entry.device() == device)
    }
    pub fn entries(&self) -> &[Arc<KernelEntry>] {
        &self.entries
    }
    /// The devices the kernel is available on.
    pub fn devices(&self) -> impl Iterator<Item = &Device> + '_ {
        self.entries.iter().map(|entry| entry.device())
    }
    fn entry_or_err(&self, device: &Device) -> Result<&Arc<KernelEntry>> {
        self.entry(device).ok_or_else(|| {
            let error = KernelUnavailable {
                kernel: self.name.clone(),
                device: device.index(),
            };
            log::error!("{error}");
            error.into()
        })
    }
    /// Launches the kernel.
    ///
    /// `global_size` is in work items, the kernel is dispatched with `ceil(global_size / local_size)`
    /// groups, after `local_size` was checked with [`KernelEntry::check_local_work_size`].
    ///
    /// **errors**
    /// - [`KernelUnavailable`]
    /// - [`BindingError`] if bounds checks are enabled.
    /// - [`NativeError`] if the descriptors could not be written.
    /// - A temporary buffer could not be allocated.
    pub fn launch(
        &self,
        queue: &Queue,
        global_size: [u32; 3],
        local_size: [u32; 3],
        args: &[KernelArg],
    ) -> Result<Completion> {
        self.launch_impl(queue, global_size, local_size, args, None)
    }
    /// Launches the kernel, and calls `on_complete` once it completed.
    ///
    /// See [`.launch()`](Kernel::launch).
    pub fn launch_with(
        &self,
        queue: &Queue,
        global_size: [u32; 3],
        local_size: [u32; 3],
        args: &[KernelArg],
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<Completion> {
        self.launch_impl(queue, global_size, local_size, args, Some(Box::new(on_complete)))
    }
    fn launch_impl(
        &self,
        queue: &Queue,
        global_size: [u32; 3],
        local_size: [u32; 3],
        args: &[KernelArg],
        on_complete: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<Completion> {
        let entry = self.entry_or_err(queue.device())?;
        let local_size = entry.check_local_work_size(local_size);
        let groups = dispatch_groups(global_size, local_size);
        let mut encoder = Encoder::new(queue, vec![entry.clone()], BindPoint::Compute);
        encoder.set_args(args)?;
        encoder.update_and_bind()?;
        encoder.dispatch(groups, local_size);
        Ok(encoder.submit(on_complete))
    }
}

/// `ceil(global_size / local_size)`.
fn dispatch_groups(global_size: [u32; 3], local_size: [u32; 3]) -> [u32; 3] {
    let mut groups = [0; 3];
    for ((g, global), local) in groups.iter_mut().zip(global_size).zip(local_size) {
        let local = local.max(1);
        *g = global / local + u32::from(global % local != 0);
    }
    groups
}

/** Draws with a vertex and an optional fragment kernel.

Both stages are bound in one pass, arguments of the vertex stage first. The descriptor set of
the vertex stage is set 1, the fragment stage is set 2.

**errors**
- [`KernelUnavailable`]
- [`FunctionTypeMismatch`] if `vertex` is not a vertex function or `fragment` not a fragment function.
- See [`Kernel::launch`].
*/
pub fn draw(
    queue: &Queue,
    vertex: &Kernel,
    fragment: Option<&Kernel>,
    args: &[KernelArg],
    draws: &[DrawEntry],
) -> Result<Completion> {
    let mut entries = Vec::with_capacity(2);
    let stages = std::iter::once((vertex, FunctionType::Vertex))
        .chain(fragment.map(|kernel| (kernel, FunctionType::Fragment)));
    for (kernel, expected) in stages {
        let entry = kernel.entry_or_err(queue.device())?;
        let found = entry.info().function_type;
        if found != expected {
            let error = FunctionTypeMismatch {
                kernel: kernel.name.clone(),
                expected,
                found,
            };
            log::error!("{error}");
            return Err(error.into());
        }
        entries.push(entry.clone());
    }
    let mut encoder = Encoder::new(queue, entries, BindPoint::Graphics);
    encoder.set_args(args)?;
    encoder.update_and_bind()?;
    for draw in draws.iter().copied() {
        encoder.draw(draw);
    }
    Ok(encoder.submit(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::Context,
        device::{DeviceInfo, HostFunction},
        future::BlockableFuture,
        program::{Program, ProgramData},
        test_log,
    };
    use xcompute_core::function::{ArgInfo, ImageAccess};

    #[test]
    fn groups_round_up() {
        assert_eq!(dispatch_groups([100, 1, 0], [64, 1, 1]), [2, 1, 0]);
        assert_eq!(dispatch_groups([128, 8, 3], [64, 2, 1]), [2, 4, 3]);
        assert_eq!(dispatch_groups([u32::MAX, 1, 1], [2, 1, 1]), [1 << 31, 1, 1]);
    }

    fn context_with(
        name: &str,
        function: HostFunction,
        info: FunctionInfo,
    ) -> (Context, Arc<Program>) {
        let context = Context::builder()
            .device(
                DeviceInfo::new("host")
                    .with_max_local_size([1024, 4, 64])
                    .with_max_total_local_size(256),
            )
            .build()
            .unwrap();
        let device = context.devices()[0].clone();
        device.register_function(name, function);
        let program = context
            .add_program(vec![(device, vec![ProgramData::from_functions([info])])])
            .unwrap();
        (context, program)
    }

    #[test]
    fn oversized_local_size_warns_once() {
        test_log::init();
        let name = "oversized_local_size_warns_once";
        let (context, program) = context_with(
            name,
            HostFunction::new(|_| Ok(())),
            FunctionInfo::kernel(name, []),
        );
        let kernel = program.kernel(name).unwrap();
        let device = &context.devices()[0];
        let entry = kernel.entry(device).unwrap();
        assert_eq!(entry.max_total_local_size(), 256);
        for _ in 0..10 {
            assert_eq!(entry.check_local_work_size([1, 8, 1]), [128, 2, 1]);
            assert_eq!(entry.check_local_work_size([300, 1, 1]), [256, 1, 1]);
        }
        assert_eq!(test_log::count(log::Level::Warn, name), 1);
    }

    #[test]
    fn host_function_limits_entry() {
        let name = "host_function_limits_entry";
        let (context, program) = context_with(
            name,
            HostFunction::new(|_| Ok(())).with_max_total_local_size(64),
            FunctionInfo::kernel(name, []),
        );
        let kernel = program.kernel(name).unwrap();
        let entry = kernel.entry(&context.devices()[0]).unwrap();
        assert_eq!(entry.max_total_local_size(), 64);
        assert_eq!(entry.max_local_size(), [1024, 4, 64]);
        assert_eq!(entry.check_local_work_size([64, 2, 1]), [32, 2, 1]);
    }

    #[test]
    fn launch_dispatches_groups() {
        let name = "launch_dispatches_groups";
        let (context, program) = context_with(
            name,
            HostFunction::new(|invocation| {
                let out = invocation.buffer(0)?;
                let mut contents = out.contents_mut()?;
                for (x, y) in contents
                    .chunks_exact_mut(4)
                    .zip(invocation.groups().into_iter().chain(invocation.local_size()))
                {
                    x.copy_from_slice(&y.to_ne_bytes());
                }
                Ok(())
            }),
            FunctionInfo::kernel(name, [ArgInfo::buffer()]),
        );
        let kernel = program.kernel(name).unwrap();
        let device = &context.devices()[0];
        let queue = context.default_queue(device).unwrap();
        let out = Buffer::new(device, 24, crate::buffer::MemoryFlags::host_read_write()).unwrap();
        kernel
            .launch(&queue, [1000, 3, 1], [0, 0, 0], &[KernelArg::Buffer(&out)])
            .unwrap()
            .block()
            .unwrap();
        assert_eq!(out.read_as::<u32>(&queue).unwrap(), [1000, 3, 1, 1, 1, 1]);
    }

    #[test]
    fn unavailable_kernel() {
        let name = "unavailable_kernel";
        let (context, program) = context_with(
            name,
            HostFunction::new(|_| Ok(())),
            FunctionInfo::kernel(name, []),
        );
        let kernel = program.kernel(name).unwrap();
        let other = Context::builder()
            .device(DeviceInfo::new("other"))
            .build()
            .unwrap();
        let queue = other.default_queue(&other.devices()[0]).unwrap();
        let error = kernel.launch(&queue, [1; 3], [1; 3], &[]).unwrap_err();
        assert!(error.is::<KernelUnavailable>());
        drop(context);
    }

    #[test]
    fn empty_image_arrays_are_unavailable() {
        test_log::init();
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let device = context.devices()[0].clone();
        for name in ["empty_image_array", "empty_image_array_sibling"] {
            device.register_function(name, HostFunction::new(|_| Ok(())));
        }
        let program = context
            .add_program(vec![(
                device,
                vec![ProgramData::from_functions([
                    FunctionInfo::kernel(
                        "empty_image_array",
                        [ArgInfo::buffer(), ArgInfo::image_array(ImageAccess::Write, 0)],
                    ),
                    FunctionInfo::kernel("empty_image_array_sibling", [ArgInfo::buffer()]),
                ])],
            )])
            .unwrap();
        assert!(program.kernel("empty_image_array").is_none());
        assert!(program.kernel("empty_image_array_sibling").is_some());
        assert_eq!(
            test_log::count(log::Level::Warn, "argument 1 of \"empty_image_array\""),
            1
        );
    }

    #[test]
    fn draw_rejects_compute_kernels() {
        let name = "draw_rejects_compute_kernels";
        let (context, program) = context_with(
            name,
            HostFunction::new(|_| Ok(())),
            FunctionInfo::kernel(name, []),
        );
        let kernel = program.kernel(name).unwrap();
        let queue = context.default_queue(&context.devices()[0]).unwrap();
        let error = draw(&queue, kernel, None, &[], &[DrawEntry::new(3)]).unwrap_err();
        assert!(error.is::<FunctionTypeMismatch>());
    }
}
