/*!
Programs.

A [`Program`] holds the [`Kernel`]s of one or more compiled modules, each resolved into one
[`KernelEntry`] per device. Modules are [`ProgramData`], SPIR-V words plus the signatures of
their entry points, produced by a [`Toolchain`], loaded from an `SPVC` container or from the
program cache.

Kernels that fail to resolve on a device are skipped for that device and logged, see
[`Kernel::devices()`].
*/

use crate::{
    device::{Device, DeviceInfo},
    kernel::{Kernel, KernelEntry},
};
use anyhow::Result;
use fxhash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
    sync::Arc,
};
use xcompute_core::{
    container::Container,
    function::{FunctionInfo, FunctionType},
};

pub mod error {
    use std::path::PathBuf;

    #[derive(Debug, thiserror::Error)]
    pub enum ProgramError {
        /// Compiling source requires a toolchain.
        #[error("No toolchain to compile {name:?}!")]
        NoToolchain { name: String },
        /// No kernel resolved on any device.
        #[error("Program has no kernels!")]
        NoKernels,
        #[error("Container {path:?} declares {function:?}, which has no signature!")]
        UndeclaredFunction { path: PathBuf, function: String },
        #[error("Failed to read {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
    }
}
use error::*;

/// A compiled module.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProgramData {
    /// SPIR-V words.
    pub words: Vec<u32>,
    pub functions: Vec<FunctionInfo>,
}

impl ProgramData {
    pub fn new(words: Vec<u32>, functions: Vec<FunctionInfo>) -> Self {
        Self { words, functions }
    }
    /// A module with only a SPIR-V header.
    ///
    /// Sufficient for devices that execute host functions.
    pub fn from_functions(functions: impl IntoIterator<Item = FunctionInfo>) -> Self {
        Self {
            words: vec![spirv::MAGIC_NUMBER, 0x0001_0000, 0, 1, 0],
            functions: functions.into_iter().collect(),
        }
    }
}

/// Options passed to a [`Toolchain`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Preprocessor definitions, `(name, value)`.
    pub defines: Vec<(String, String)>,
    pub debug_info: bool,
}

impl CompileOptions {
    pub fn with_define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.push((name.into(), value.into()));
        self
    }
    pub fn with_debug_info(mut self, debug_info: bool) -> Self {
        self.debug_info = debug_info;
        self
    }
}

/** Compiles kernel source for a device.

Implemented for closures.

```
# use xcompute::{anyhow, program::{CompileOptions, ProgramData, Toolchain}, device::DeviceInfo, xcompute_core::function::FunctionInfo};
let toolchain = |_: &DeviceInfo, source: &str, _: &CompileOptions| -> anyhow::Result<_> {
    let functions = source.lines().map(|name| FunctionInfo::kernel(name, [])).collect::<Vec<_>>();
    Ok(vec![ProgramData::from_functions(functions)])
};
let modules = toolchain.compile(&DeviceInfo::new("host"), "fill\nscale", &CompileOptions::default()).unwrap();
assert_eq!(modules[0].functions.len(), 2);
```
*/
pub trait Toolchain: Send + Sync {
    fn compile(
        &self,
        device: &DeviceInfo,
        source: &str,
        options: &CompileOptions,
    ) -> Result<Vec<ProgramData>>;
}

impl<F> Toolchain for F
where
    F: Fn(&DeviceInfo, &str, &CompileOptions) -> Result<Vec<ProgramData>> + Send + Sync,
{
    fn compile(
        &self,
        device: &DeviceInfo,
        source: &str,
        options: &CompileOptions,
    ) -> Result<Vec<ProgramData>> {
        self(device, source, options)
    }
}

/// A set of kernels, resolved per device.
#[derive(Debug)]
pub struct Program {
    id: u64,
    kernels: Vec<Kernel>,
    index: FxHashMap<String, usize>,
}

impl Program {
    /// Resolves `modules` into kernels.
    ///
    /// Each module is resolved on the device it was compiled for. Entries that fail to resolve
    /// are skipped with a warning, kernels without any entry are dropped.
    ///
    /// **errors**
    /// No kernel resolved on any device.
    pub(crate) fn new(modules: Vec<(Device, Vec<ProgramData>)>) -> Result<Self> {
        let id = crate::device::next_handle();
        let mut kernels: Vec<Kernel> = Vec::new();
        let mut index = FxHashMap::<String, usize>::default();
        for (device, datas) in modules {
            for data in datas {
                let module = match device.create_module(&data.words) {
                    Ok(module) => module,
                    Err(e) => {
                        log::warn!("Program {id}: skipping a module on {device:?}: {e}");
                        continue;
                    }
                };
                for info in data.functions.iter() {
                    let i = *index.entry(info.name.clone()).or_insert_with(|| {
                        kernels.push(Kernel::new(info.name.clone()));
                        kernels.len() - 1
                    });
                    let kernel = &mut kernels[i];
                    if kernel.entry(&device).is_some() {
                        log::warn!(
                            "Program {id}: kernel {:?} is defined twice on {device:?}, skipping",
                            info.name
                        );
                        continue;
                    }
                    match KernelEntry::new(&device, &module, info) {
                        Ok(entry) => kernel.push(Arc::new(entry)),
                        Err(e) => {
                            log::warn!(
                                "Program {id}: kernel {:?} is not available on {device:?}: {e}",
                                info.name
                            );
                        }
                    }
                }
            }
        }
        kernels.retain(|kernel| !kernel.entries().is_empty());
        if kernels.is_empty() {
            log::error!("Program {id}: {}", ProgramError::NoKernels);
            return Err(ProgramError::NoKernels.into());
        }
        let index = kernels
            .iter()
            .enumerate()
            .map(|(i, kernel)| (kernel.name().to_string(), i))
            .collect();
        log::debug!(
            "Program {id}: {:?}",
            kernels.iter().map(Kernel::name).collect::<Vec<_>>()
        );
        Ok(Self { id, kernels, index })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn kernel(&self, name: &str) -> Option<&Kernel> {
        self.index.get(name).map(|i| &self.kernels[*i])
    }
    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }
    pub fn kernel_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.kernels.iter().map(Kernel::name)
    }
}

/// Splits a container into modules, pairing each function with its declared signature.
///
/// The function type stored in the container takes precedence over the declared one.
pub(crate) fn container_modules(
    path: &Path,
    container: &Container,
    declared: &[FunctionInfo],
) -> Result<Vec<ProgramData>> {
    let mut modules = Vec::with_capacity(container.entries().len());
    for (i, entry) in container.entries().iter().enumerate() {
        let words = container.entry_code(i).unwrap_or_default().to_vec();
        let mut functions = Vec::with_capacity(entry.function_names.len());
        for (function_type, name) in entry.functions() {
            let mut info = declared
                .iter()
                .find(|info| info.name == name)
                .cloned()
                .ok_or_else(|| {
                    let error = ProgramError::UndeclaredFunction {
                        path: path.to_owned(),
                        function: name.to_string(),
                    };
                    log::error!("{error}");
                    error
                })?;
            if function_type != FunctionType::None && info.function_type != function_type {
                log::warn!(
                    "{path:?}: {name:?} is declared as {:?}, but stored as {function_type:?}",
                    info.function_type
                );
                info.function_type = function_type;
            }
            functions.push(info);
        }
        modules.push(ProgramData::new(words, functions));
    }
    Ok(modules)
}

/// Key of compiled `source` for `device` in the program cache.
pub(crate) fn cache_key(device: &DeviceInfo, source: &str, options: &CompileOptions) -> u64 {
    let mut hasher = FxHasher::default();
    device.name().hash(&mut hasher);
    source.hash(&mut hasher);
    options.hash(&mut hasher);
    hasher.finish()
}

pub(crate) fn cache_path(dir: &Path, key: u64) -> PathBuf {
    dir.join(format!("{key:016x}.bin"))
}

/// Loads cached modules, `None` if missing or unreadable.
pub(crate) fn load_cached(path: &Path) -> Option<Vec<ProgramData>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            log::warn!("failed to read cached program {path:?}: {e}");
            return None;
        }
    };
    match bincode::deserialize(&bytes) {
        Ok(modules) => {
            log::debug!("loaded cached program {path:?}");
            Some(modules)
        }
        Err(e) => {
            log::warn!("cached program {path:?} is invalid: {e}");
            None
        }
    }
}

/// Stores modules in the cache, failures are logged.
pub(crate) fn store_cached(path: &Path, modules: &[ProgramData]) {
    let result = bincode::serialize(modules)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(path, bytes)?;
            Ok(())
        });
    match result {
        Ok(()) => log::debug!("cached program {path:?}"),
        Err(e) => log::warn!("failed to cache program {path:?}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{context::Context, device::HostFunction, test_log};
    use xcompute_core::function::ArgInfo;

    #[test]
    fn kernels_are_grouped_by_name() {
        test_log::init();
        let context = Context::builder()
            .device(DeviceInfo::new("full"))
            .device(DeviceInfo::new("partial"))
            .build()
            .unwrap();
        let devices = context.devices();
        for name in ["grouped_a", "grouped_b"] {
            devices[0].register_function(name, HostFunction::new(|_| Ok(())));
        }
        devices[1].register_function("grouped_a", HostFunction::new(|_| Ok(())));
        let functions = [
            FunctionInfo::kernel("grouped_a", [ArgInfo::buffer()]),
            FunctionInfo::kernel("grouped_b", []),
        ];
        let program = context
            .add_program(
                devices
                    .iter()
                    .map(|device| {
                        (
                            device.clone(),
                            vec![ProgramData::from_functions(functions.clone())],
                        )
                    })
                    .collect(),
            )
            .unwrap();
        assert_eq!(
            program.kernel_names().collect::<Vec<_>>(),
            ["grouped_a", "grouped_b"]
        );
        let a = program.kernel("grouped_a").unwrap();
        assert_eq!(a.devices().cloned().collect::<Vec<_>>(), devices);
        let b = program.kernel("grouped_b").unwrap();
        assert!(b.entry(&devices[0]).is_some());
        assert!(b.entry(&devices[1]).is_none());
        assert_eq!(test_log::count(log::Level::Warn, "\"grouped_b\" is not available"), 1);
        assert_eq!(test_log::count(log::Level::Warn, "Device(1, \"partial\")"), 1);
        assert!(program.kernel("missing").is_none());
    }

    #[test]
    fn no_kernels() {
        let context = Context::builder()
            .device(DeviceInfo::new("host"))
            .build()
            .unwrap();
        let device = context.devices()[0].clone();
        let error = context
            .add_program(vec![(
                device.clone(),
                vec![ProgramData::from_functions([FunctionInfo::kernel(
                    "no_kernels_unregistered",
                    [],
                )])],
            )])
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProgramError>(),
            Some(ProgramError::NoKernels)
        ));
        let error = context
            .add_program(vec![(device, vec![ProgramData::new(vec![0; 5], Vec::new())])])
            .unwrap_err();
        assert!(error.is::<ProgramError>());
    }

    #[test]
    fn container_signatures() {
        let container = Container::builder()
            .module(
                &[spirv::MAGIC_NUMBER, 0x0001_0000, 0, 1, 0],
                [(FunctionType::Vertex, "vs"), (FunctionType::Kernel, "k")],
            )
            .build()
            .unwrap();
        let declared = [
            FunctionInfo::kernel("vs", [ArgInfo::value()]),
            FunctionInfo::kernel("k", [ArgInfo::buffer()]),
        ];
        let path = Path::new("program.spvc");
        let modules = container_modules(path, &container, &declared).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].words.len(), 5);
        assert_eq!(modules[0].functions[0].function_type, FunctionType::Vertex);
        assert_eq!(modules[0].functions[0].args, [ArgInfo::value()]);
        assert_eq!(modules[0].functions[1], declared[1]);
        let error = container_modules(path, &container, &declared[..1]).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<ProgramError>(),
            Some(ProgramError::UndeclaredFunction { function, .. }) if function == "k"
        ));
    }

    #[test]
    fn cache_keys() {
        let device = DeviceInfo::new("host");
        let options = CompileOptions::default();
        let key = cache_key(&device, "source", &options);
        assert_eq!(key, cache_key(&device, "source", &options));
        assert_ne!(key, cache_key(&DeviceInfo::new("other"), "source", &options));
        assert_ne!(key, cache_key(&device, "source2", &options));
        assert_ne!(
            key,
            cache_key(&device, "source", &options.clone().with_define("N", "4"))
        );
        assert_eq!(
            cache_path(Path::new("cache"), 0xab),
            Path::new("cache/00000000000000ab.bin")
        );
    }

    #[test]
    fn cache_store_load() {
        let dir = std::env::temp_dir()
            .join(format!("xcompute-cache-store-load-{}", std::process::id()));
        let path = cache_path(&dir, 1);
        assert!(load_cached(&path).is_none());
        let modules = vec![ProgramData::from_functions([FunctionInfo::kernel(
            "cached",
            [ArgInfo::buffer()],
        )])];
        store_cached(&path, &modules);
        assert_eq!(load_cached(&path).unwrap(), modules);
        fs::write(&path, [1, 2, 3]).unwrap();
        assert!(load_cached(&path).is_none());
        fs::remove_dir_all(&dir).unwrap();
    }
}
