/*!
Contexts.

A [`Context`] owns the devices, their default queues and the programs created on them.

```
# fn main() -> xcompute::anyhow::Result<()> {
use xcompute::{context::{Context, ContextOptions}, device::DeviceInfo};

let context = Context::builder()
    .device(DeviceInfo::new("host"))
    .options(ContextOptions::default().with_bounds_checks(true))
    .build()?;
let device = &context.devices()[0];
let queue = context.default_queue(device)?;
assert_eq!(queue, context.default_queue(device)?);
# Ok(())
# }
```
*/

use crate::{
    device::{Backend, Device, DeviceInfo},
    program::{self, CompileOptions, Program, ProgramData, Toolchain},
    queue::Queue,
};
use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{env, fmt, path::Path, path::PathBuf, sync::Arc};
use xcompute_core::{container, function::FunctionInfo};

use builder::ContextBuilder;
use program::error::ProgramError;

pub mod builder {
    use super::*;

    /// A builder for creating a [`Context`].
    ///
    /// See [`Context::builder()`].
    pub struct ContextBuilder {
        pub(super) devices: Vec<(Backend, DeviceInfo)>,
        pub(super) options: ContextOptions,
        pub(super) toolchain: Option<Arc<dyn Toolchain>>,
    }

    impl ContextBuilder {
        /// Adds a device.
        ///
        /// Devices are indexed in the order they are added.
        pub fn device(mut self, info: DeviceInfo) -> Self {
            self.devices.push((Backend::Host, info));
            self
        }
        /// Adds a device on the Vulkan physical device at `physical_device`.
        ///
        /// Its [`DeviceInfo`] is queried from the physical device.
        #[cfg(feature = "device")]
        pub fn vulkan_device(mut self, physical_device: usize) -> Self {
            self.devices
                .push((Backend::Vulkan { physical_device }, DeviceInfo::default()));
            self
        }
        pub fn options(mut self, options: ContextOptions) -> Self {
            self.options = options;
            self
        }
        /// Sets the toolchain used to compile source.
        pub fn toolchain(mut self, toolchain: impl Toolchain + 'static) -> Self {
            self.toolchain.replace(Arc::new(toolchain));
            self
        }
        /// Builds the context.
        ///
        /// **errors**
        /// Any device failed to initialize.
        pub fn build(self) -> Result<Context> {
            let devices = self
                .devices
                .into_iter()
                .enumerate()
                .map(|(index, (backend, info))| {
                    Device::builder()
                        .index(index)
                        .info(info)
                        .backend(backend)
                        .build()
                })
                .collect::<Result<Vec<_>>>()?;
            log::debug!("created context with {devices:?}");
            Ok(Context {
                devices,
                options: self.options,
                toolchain: self.toolchain,
                queues: DashMap::new(),
                programs: Mutex::new(Vec::new()),
            })
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => {
            log::warn!("ignoring {name}={value:?}, expected a boolean");
            None
        }
    }
}

/// Options of a [`Context`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContextOptions {
    /// Validate kernel arguments before launching.
    ///
    /// Defaults to `cfg!(debug_assertions)`.
    pub bounds_checks: bool,
    /// Look up compiled source in the cache directory before compiling it.
    pub use_cache: bool,
    pub cache_dir: Option<PathBuf>,
    /// Log every submitted command buffer at debug level.
    pub log_commands: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            bounds_checks: cfg!(debug_assertions),
            use_cache: false,
            cache_dir: None,
            log_commands: false,
        }
    }
}

impl ContextOptions {
    /// Defaults, overridden by the environment.
    ///
    /// - `XCOMPUTE_BOUNDS_CHECKS`: a boolean.
    /// - `XCOMPUTE_CACHE_DIR`: a directory, enables the cache.
    /// - `XCOMPUTE_LOG_COMMANDS`: a boolean.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(bounds_checks) = env_flag("XCOMPUTE_BOUNDS_CHECKS") {
            options.bounds_checks = bounds_checks;
        }
        if let Some(dir) = env::var_os("XCOMPUTE_CACHE_DIR") {
            options.use_cache = true;
            options.cache_dir.replace(dir.into());
        }
        if let Some(log_commands) = env_flag("XCOMPUTE_LOG_COMMANDS") {
            options.log_commands = log_commands;
        }
        options
    }
    pub fn with_bounds_checks(mut self, bounds_checks: bool) -> Self {
        self.bounds_checks = bounds_checks;
        self
    }
    /// Enables the program cache in `dir`.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.use_cache = true;
        self.cache_dir.replace(dir.into());
        self
    }
    pub fn with_log_commands(mut self, log_commands: bool) -> Self {
        self.log_commands = log_commands;
        self
    }
    fn cache_dir(&self) -> Option<&Path> {
        if self.use_cache {
            self.cache_dir.as_deref()
        } else {
            None
        }
    }
}

/// A context.
pub struct Context {
    devices: Vec<Device>,
    options: ContextOptions,
    toolchain: Option<Arc<dyn Toolchain>>,
    queues: DashMap<usize, Queue>,
    programs: Mutex<Vec<Arc<Program>>>,
}

impl Context {
    /// A builder for creating a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            devices: Vec::new(),
            options: ContextOptions::default(),
            toolchain: None,
        }
    }
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }
    /// Creates a new queue on `device`.
    ///
    /// **errors**
    /// The worker thread could not be spawned.
    pub fn create_queue(&self, device: &Device) -> Result<Queue> {
        Queue::new(device, &self.options)
    }
    /// The default queue of `device`, created on first use.
    ///
    /// **errors**
    /// - `device` does not belong to this context.
    /// - See [`.create_queue()`](Self::create_queue).
    pub fn default_queue(&self, device: &Device) -> Result<Queue> {
        if self.devices.get(device.index()) != Some(device) {
            let error = anyhow::anyhow!("{device:?} does not belong to this context!");
            log::error!("{error}");
            return Err(error);
        }
        let queue = self
            .queues
            .entry(device.index())
            .or_try_insert_with(|| self.create_queue(device))?
            .value()
            .clone();
        Ok(queue)
    }
    fn push_program(&self, program: Program) -> Arc<Program> {
        let program = Arc::new(program);
        self.programs.lock().push(program.clone());
        program
    }
    /// Creates a program from compiled modules.
    ///
    /// See [`Program`](crate::program) for how kernels are resolved.
    pub fn add_program(&self, modules: Vec<(Device, Vec<ProgramData>)>) -> Result<Arc<Program>> {
        Ok(self.push_program(Program::new(modules)?))
    }
    /// Compiles `source` for every device and creates a program.
    ///
    /// With the cache enabled, compiled modules are loaded from and stored in the cache.
    ///
    /// **errors**
    /// - [`ProgramError::NoToolchain`] if `source` is not cached and no toolchain was provided.
    /// - The toolchain failed.
    /// - See [`.add_program()`](Self::add_program).
    pub fn add_program_source(&self, source: &str, options: &CompileOptions) -> Result<Arc<Program>> {
        let mut modules = Vec::with_capacity(self.devices.len());
        for device in self.devices.iter() {
            let cache_path = self.options.cache_dir().map(|dir| {
                program::cache_path(dir, program::cache_key(device.info(), source, options))
            });
            if let Some(datas) = cache_path.as_deref().and_then(program::load_cached) {
                modules.push((device.clone(), datas));
                continue;
            }
            let toolchain = self.toolchain.as_ref().ok_or_else(|| {
                let error = ProgramError::NoToolchain {
                    name: source.lines().next().unwrap_or_default().to_string(),
                };
                log::error!("{error}");
                error
            })?;
            let datas = toolchain.compile(device.info(), source, options).map_err(|e| {
                log::error!("failed to compile for {device:?}: {e:#}");
                e
            })?;
            if let Some(path) = cache_path.as_deref() {
                program::store_cached(path, &datas);
            }
            modules.push((device.clone(), datas));
        }
        self.add_program(modules)
    }
    /// Reads `path` and compiles it with [`.add_program_source()`](Self::add_program_source).
    pub fn add_program_file(
        &self,
        path: impl AsRef<Path>,
        options: &CompileOptions,
    ) -> Result<Arc<Program>> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| {
            let error = ProgramError::Io {
                path: path.to_owned(),
                source,
            };
            log::error!("{error}");
            error
        })?;
        self.add_program_source(&source, options)
    }
    /// Loads a precompiled `SPVC` container and creates a program on every device.
    ///
    /// Every function in the container must be declared in `functions`, which provide the
    /// argument signatures.
    pub fn add_precompiled_program_file(
        &self,
        path: impl AsRef<Path>,
        functions: &[FunctionInfo],
    ) -> Result<Arc<Program>> {
        let path = path.as_ref();
        let container = container::load(path)?;
        let datas = program::container_modules(path, &container, functions)?;
        let modules = self
            .devices
            .iter()
            .map(|device| (device.clone(), datas.clone()))
            .collect();
        self.add_program(modules)
    }
    /// The programs created so far.
    pub fn programs(&self) -> Vec<Arc<Program>> {
        self.programs.lock().clone()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices)
            .field("options", &self.options)
            .field("programs", &self.programs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{Buffer, MemoryFlags},
        device::HostFunction,
        future::BlockableFuture,
        kernel::KernelArg,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use xcompute_core::{
        container::Container,
        function::{ArgInfo, FunctionType},
    };

    fn temp_dir(name: &str) -> PathBuf {
        env::temp_dir().join(format!("xcompute-{name}-{}", std::process::id()))
    }

    fn counting_context(options: ContextOptions, count: Arc<AtomicUsize>) -> Context {
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .options(options)
            .toolchain(move |_: &DeviceInfo, source: &str, _: &CompileOptions| -> Result<_> {
                count.fetch_add(1, Ordering::SeqCst);
                let functions = source
                    .split_whitespace()
                    .map(|name| FunctionInfo::kernel(name, [ArgInfo::buffer()]))
                    .collect::<Vec<_>>();
                Ok(vec![ProgramData::from_functions(functions)])
            })
            .build()
            .unwrap();
        context.devices()[0].register_function("cached_kernel", HostFunction::new(|_| Ok(())));
        context
    }

    #[test]
    fn cached_source_skips_toolchain() {
        let dir = temp_dir("cached-source");
        let _ = std::fs::remove_dir_all(&dir);
        let count = Arc::new(AtomicUsize::new(0));
        let options = ContextOptions::default().with_cache_dir(&dir);
        let compile_options = CompileOptions::default();
        for _ in 0..2 {
            let context = counting_context(options.clone(), count.clone());
            let program = context
                .add_program_source("cached_kernel", &compile_options)
                .unwrap();
            assert!(program.kernel("cached_kernel").is_some());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        let context = counting_context(options, count.clone());
        context
            .add_program_source("cached_kernel", &compile_options.with_debug_info(true))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn disabled_cache_compiles() {
        let count = Arc::new(AtomicUsize::new(0));
        let context = counting_context(ContextOptions::default(), count.clone());
        for _ in 0..2 {
            context
                .add_program_source("cached_kernel", &CompileOptions::default())
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(context.programs().len(), 2);
    }

    #[test]
    fn source_without_toolchain() {
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let error = context
            .add_program_source("kernel", &CompileOptions::default())
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProgramError>(),
            Some(ProgramError::NoToolchain { .. })
        ));
        let error = context
            .add_program_file(
                temp_dir("missing-source").join("missing.comp"),
                &CompileOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProgramError>(),
            Some(ProgramError::Io { .. })
        ));
        assert!(context.programs().is_empty());
    }

    #[test]
    fn precompiled_program() {
        let dir = temp_dir("precompiled");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("program.spvc");
        let header = [spirv::MAGIC_NUMBER, 0x0001_0000, 0, 1, 0];
        let container = Container::builder()
            .module(&header, [(FunctionType::Kernel, "precompiled_fill")])
            .build()
            .unwrap();
        container::save(&path, &container).unwrap();
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let device = context.devices()[0].clone();
        device.register_function(
            "precompiled_fill",
            HostFunction::new(|invocation| {
                let value = invocation.value::<u32>(1)?;
                let out = invocation.buffer(0)?;
                for x in out.contents_mut()?.chunks_exact_mut(4) {
                    x.copy_from_slice(&value.to_ne_bytes());
                }
                Ok(())
            }),
        );
        let program = context
            .add_precompiled_program_file(
                &path,
                &[FunctionInfo::kernel(
                    "precompiled_fill",
                    [ArgInfo::buffer(), ArgInfo::value()],
                )],
            )
            .unwrap();
        let queue = context.default_queue(&device).unwrap();
        let out = Buffer::new(&device, 16, MemoryFlags::host_read_write()).unwrap();
        program
            .kernel("precompiled_fill")
            .unwrap()
            .launch(&queue, [1; 3], [1; 3], &[(&out).into(), KernelArg::value(&9u32)])
            .unwrap()
            .block()
            .unwrap();
        assert_eq!(out.read_as::<u32>(&queue).unwrap(), [9; 4]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn default_queue_is_cached() {
        let context = Context::builder()
            .device(DeviceInfo::new("a"))
            .device(DeviceInfo::new("b"))
            .build()
            .unwrap();
        let [a, b] = [&context.devices()[0], &context.devices()[1]];
        let queue = context.default_queue(a).unwrap();
        assert_eq!(queue, context.default_queue(a).unwrap());
        assert_ne!(queue, context.default_queue(b).unwrap());
        assert_ne!(queue, context.create_queue(a).unwrap());
        assert_eq!(context.default_queue(b).unwrap().device(), b);
        let other = Context::builder()
            .device(DeviceInfo::new("a"))
            .build()
            .unwrap();
        assert!(context.default_queue(&other.devices()[0]).is_err());
    }

    #[test]
    fn options_from_env() {
        env::set_var("XCOMPUTE_BOUNDS_CHECKS", "off");
        env::set_var("XCOMPUTE_CACHE_DIR", "/tmp/xcompute-cache");
        env::set_var("XCOMPUTE_LOG_COMMANDS", "1");
        let options = ContextOptions::from_env();
        env::remove_var("XCOMPUTE_BOUNDS_CHECKS");
        env::remove_var("XCOMPUTE_CACHE_DIR");
        env::remove_var("XCOMPUTE_LOG_COMMANDS");
        assert_eq!(
            options,
            ContextOptions::default()
                .with_bounds_checks(false)
                .with_cache_dir("/tmp/xcompute-cache")
                .with_log_commands(true)
        );
    }
}
