/*!
A portable compute kernel runtime.

A [`Context`](context::Context) owns devices described by a [`DeviceInfo`](device::DeviceInfo).
Compiled modules are resolved into a [`Program`](program::Program) of [`Kernel`](kernel::Kernel)s,
which are launched on a [`Queue`](queue::Queue) with an ordered list of
[`KernelArg`](kernel::KernelArg)s. Launches return a [`Completion`](future::Completion).

```
# fn main() -> xcompute::anyhow::Result<()> {
use xcompute::{
    buffer::{Buffer, MemoryFlags},
    context::Context,
    device::{DeviceInfo, HostFunction},
    future::BlockableFuture,
    kernel::KernelArg,
    program::ProgramData,
    xcompute_core::function::{ArgInfo, FunctionInfo},
};

let context = Context::builder().device(DeviceInfo::new("host")).build()?;
let device = &context.devices()[0];
device.register_function(
    "fill",
    HostFunction::new(|invocation| {
        let value = invocation.value::<u8>(1)?;
        invocation.buffer(0)?.contents_mut()?.fill(value);
        Ok(())
    }),
);
let program = context.add_program(vec![(
    device.clone(),
    vec![ProgramData::from_functions([FunctionInfo::kernel(
        "fill",
        [ArgInfo::buffer(), ArgInfo::value()],
    )])],
)])?;
let queue = context.default_queue(device)?;
let y = Buffer::new(device, 8, MemoryFlags::host_read_write())?;
program
    .kernel("fill")
    .unwrap()
    .launch(&queue, [8, 1, 1], [8, 1, 1], &[(&y).into(), KernelArg::value(&7u8)])?
    .block()?;
assert_eq!(y.read(&queue)?, [7; 8]);
# Ok(())
# }
```

# Features
- `device`: the Vulkan engine, selected with `Backend::Vulkan`. Without it devices execute on the host.
*/

#![cfg_attr(not(feature = "device"), forbid(unsafe_code))]

pub use anyhow;
pub use xcompute_core;

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod buffer;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod future;
pub mod image;
pub mod kernel;
pub mod program;
pub mod queue;
pub mod sampler;

#[cfg(test)]
mod test_log;
