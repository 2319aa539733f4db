/*!
Queues.

A [`Queue`] executes [`CommandBuffer`]s on its device strictly in submission order, on a
worker thread owned by the queue. Each submission carries a one-shot completion handler,
which runs exactly once after the command buffer executed (or failed to), before the
returned [`Completion`] resolves.
*/

use crate::{
    context::ContextOptions,
    descriptor::DescriptorSet,
    device::{error::DeviceLost, next_handle, Device},
    future::{Completion, CompletionSignal},
    image::{Image, ImageLayout},
    kernel::KernelEntry,
};
use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver, SendError, Sender};
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    fmt::{self, Debug},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, derive_more::IsVariant)]
pub enum BindPoint {
    Compute,
    Graphics,
}

/// Parameters of one draw.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct DrawEntry {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

impl DrawEntry {
    /// Draws `vertex_count` vertices once.
    pub const fn new(vertex_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        }
    }
    /// Adds `instance_count`.
    pub const fn with_instance_count(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count;
        self
    }
}

/// A recorded command.
#[derive(Clone, Debug)]
pub enum Command {
    /// Binds the entries of a pipeline, one per stage.
    BindPipeline {
        bind_point: BindPoint,
        stages: Vec<Arc<KernelEntry>>,
    },
    TransitionImage {
        image: Image,
        from: ImageLayout,
        to: ImageLayout,
    },
    /// Binds `sets` to consecutive set indices starting at `first_set`.
    ///
    /// One dynamic offset per storage buffer of `sets`, in order.
    BindDescriptorSets {
        bind_point: BindPoint,
        first_set: u32,
        sets: Vec<DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    Dispatch {
        groups: [u32; 3],
        local_size: [u32; 3],
    },
    Draw(DrawEntry),
}

/// Recorded commands.
#[derive(Clone, Debug, Default)]
pub struct CommandBuffer {
    label: String,
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            commands: Vec::new(),
        }
    }
    pub fn label(&self) -> &str {
        &self.label
    }
    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
}

struct Submission {
    index: u64,
    command_buffer: CommandBuffer,
    on_complete: Box<dyn FnOnce(&CommandBuffer) + Send>,
    signal: CompletionSignal,
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    cond: Condvar,
}

struct QueueInner {
    id: u64,
    device: Device,
    bounds_checks: bool,
    log_commands: bool,
    sender: Option<Sender<Submission>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            // The last clone may be dropped by a completion handler on the worker itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

/** A queue.

Cloning is equivalent to [`Arc::clone()`]. The worker thread exits once all clones are dropped and
all pending submissions completed.
*/
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    pub(crate) fn new(device: &Device, options: &ContextOptions) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared::default());
        let id = next_handle();
        let worker = thread::Builder::new()
            .name(format!("xcompute-queue-{id}"))
            .spawn({
                let device = device.clone();
                let shared = shared.clone();
                move || run(device, receiver, shared)
            })?;
        let worker_id = worker.thread().id();
        log::debug!("created queue {id} on {device:?}");
        Ok(Self {
            inner: Arc::new(QueueInner {
                id,
                device: device.clone(),
                bounds_checks: options.bounds_checks,
                log_commands: options.log_commands,
                sender: Some(sender),
                shared,
                worker: Some(worker),
                worker_id,
            }),
        })
    }
    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn device(&self) -> &Device {
        &self.inner.device
    }
    /// Whether launches on this queue validate their arguments.
    pub fn bounds_checks(&self) -> bool {
        self.inner.bounds_checks
    }
    /// Submits `command_buffer`.
    ///
    /// `on_complete` runs on the worker after the command buffer executed, the returned
    /// [`Completion`] resolves after `on_complete` returned and the command buffer was dropped.
    pub fn submit(
        &self,
        command_buffer: CommandBuffer,
        on_complete: impl FnOnce(&CommandBuffer) + Send + 'static,
    ) -> Completion {
        let device = self.inner.device.index();
        let (completion, signal) = Completion::new(device);
        if self.inner.log_commands {
            log::debug!(
                "queue {} submit {:?}: {:#?}",
                self.inner.id,
                command_buffer.label(),
                command_buffer.commands()
            );
        }
        let mut progress = self.inner.shared.progress.lock();
        let index = progress.submitted + 1;
        let submission = Submission {
            index,
            command_buffer,
            on_complete: Box::new(on_complete),
            signal,
        };
        let result = match self.inner.sender.as_ref() {
            Some(sender) => sender.send(submission),
            None => Err(SendError(submission)),
        };
        match result {
            Ok(()) => {
                progress.submitted = index;
            }
            Err(SendError(submission)) => {
                drop(progress);
                log::error!("queue {} is closed", self.inner.id);
                let Submission {
                    command_buffer,
                    on_complete,
                    signal,
                    ..
                } = submission;
                on_complete(&command_buffer);
                drop(command_buffer);
                signal.complete(Err(DeviceLost {
                    device,
                    reason: "queue closed".to_string(),
                }));
            }
        }
        completion
    }
    /// Blocks until all previous submissions completed.
    ///
    /// Called from a host function executing on this queue, returns immediately, since all previous
    /// submissions completed.
    ///
    /// **errors**
    /// The worker exited before completing them.
    pub fn finish(&self) -> Result<(), DeviceLost> {
        if thread::current().id() == self.inner.worker_id {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let mut progress = shared.progress.lock();
        let target = progress.submitted;
        while progress.completed < target && !progress.closed {
            shared.cond.wait(&mut progress);
        }
        if progress.completed < target {
            Err(DeviceLost {
                device: self.inner.device.index(),
                reason: format!("queue {} closed", self.inner.id),
            })
        } else {
            Ok(())
        }
    }
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Queue {}

impl Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({}, {:?})", self.inner.id, self.inner.device)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}

fn run(device: Device, receiver: Receiver<Submission>, shared: Arc<Shared>) {
    for submission in receiver.iter() {
        let Submission {
            index,
            command_buffer,
            on_complete,
            signal,
        } = submission;
        let executed = catch_unwind(AssertUnwindSafe(|| device.execute(&command_buffer)));
        let result = match executed {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::error!("{:?} failed: {e}", command_buffer.label());
                Err(DeviceLost {
                    device: device.index(),
                    reason: e.to_string(),
                })
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                log::error!("{:?} panicked: {reason}", command_buffer.label());
                Err(DeviceLost {
                    device: device.index(),
                    reason,
                })
            }
        };
        if catch_unwind(AssertUnwindSafe(|| on_complete(&command_buffer))).is_err() {
            log::error!(
                "completion handler of {:?} panicked",
                command_buffer.label()
            );
        }
        drop(command_buffer);
        signal.complete(result);
        let mut progress = shared.progress.lock();
        progress.completed = index;
        shared.cond.notify_all();
    }
    shared.progress.lock().closed = true;
    shared.cond.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Context, device::DeviceInfo, future::BlockableFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context() -> Context {
        Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap()
    }

    #[test]
    fn submissions_complete_in_order() {
        let context = context();
        let queue = context.create_queue(&context.devices()[0]).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let completions: Vec<_> = (0..16)
            .map(|i| {
                let order = order.clone();
                queue.submit(CommandBuffer::new(format!("{i}")), move |cb| {
                    order.lock().push(cb.label().parse::<usize>().unwrap());
                })
            })
            .collect();
        queue.finish().unwrap();
        assert!(completions.iter().all(Completion::is_complete));
        for completion in completions {
            completion.block().unwrap();
        }
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn completion_handler_runs_once() {
        let context = context();
        let queue = context.create_queue(&context.devices()[0]).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let completion = queue.submit(CommandBuffer::new("once"), {
            let count = count.clone();
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        completion.block().unwrap();
        queue.finish().unwrap();
        drop(queue);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_still_completes() {
        let context = context();
        let queue = context.create_queue(&context.devices()[0]).unwrap();
        queue
            .submit(CommandBuffer::new("panic"), |_| panic!("handler"))
            .block()
            .unwrap();
        queue
            .submit(CommandBuffer::new("after"), |_| {})
            .block()
            .unwrap();
    }

    #[test]
    fn drop_queue_from_handler() {
        let context = context();
        let queue = context.create_queue(&context.devices()[0]).unwrap();
        let completion = queue.submit(CommandBuffer::new("drop"), {
            let queue = queue.clone();
            move |_| {
                let _ = queue.id();
            }
        });
        drop(queue);
        completion.block().unwrap();
    }
}
