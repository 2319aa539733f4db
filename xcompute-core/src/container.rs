/*!
The `SPVC` container.

Bundles several precompiled modules and the names / types of their entry points
into one file, so that programs can be created without a compiler.

All integers are little endian, a word is 4 bytes.

```text
magic                  "SPVC"
version                u32, must equal CONTAINER_VERSION
entry_count            u32
entry_count x {
    function_entry_count   u32
    data_word_count        u32
}
code                   sum(data_word_count) words, in entry order
entry_count x {
    function_types         function_entry_count x u32
    function_names         function_entry_count x (name, NUL, padded with NUL to 4 bytes)
}
```

Decoding is all or nothing, any violated bound fails the whole parse.
*/

use crate::function::FunctionType;
use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

/// Magic bytes at the start of every container.
pub const CONTAINER_MAGIC: [u8; 4] = *b"SPVC";
/// The container version this codec reads and writes.
pub const CONTAINER_VERSION: u32 = 2;

const MAX_CONTAINER_SIZE: usize = 0x8000_0000;

pub mod error {
    use std::{io, path::PathBuf};

    /// Errors.
    #[derive(Debug, thiserror::Error)]
    pub enum ContainerError {
        #[error("container too small ({size}B)")]
        TooSmall { size: usize },
        #[error("container too large ({size}B)")]
        TooLarge { size: usize },
        #[error("invalid container magic {found:?}")]
        Magic { found: [u8; 4] },
        #[error("invalid container version {found}, expected {expected}")]
        Version { found: u32, expected: u32 },
        #[error("invalid {section} size: {needed}B at offset {offset} exceeds container size {size}B")]
        OutOfBounds {
            section: &'static str,
            offset: usize,
            needed: usize,
            size: usize,
        },
        #[error("function name {index} of entry {entry} has no terminator")]
        Unterminated { entry: usize, index: usize },
        #[error("function name {index} of entry {entry} is not valid utf-8")]
        Utf8 { entry: usize, index: usize },
        #[error("unknown function type {value} in entry {entry}")]
        FunctionType { entry: usize, value: u32 },
        #[error("entry {entry} has {types} function types but {names} function names")]
        FunctionCount {
            entry: usize,
            types: usize,
            names: usize,
        },
        #[error("function name {name:?} contains a NUL byte")]
        NameNul { name: String },
        #[error("entry {entry} code range does not follow the previous entry")]
        Layout { entry: usize },
        #[error("invalid binary {path:?}: size {size}B is not a multiple of 4")]
        Misaligned { path: PathBuf, size: usize },
        #[error("failed to read {path:?}: expected {expected}B, read {read}B")]
        ShortRead {
            path: PathBuf,
            expected: usize,
            read: usize,
        },
        #[error("failed to access {path:?}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }
}
use error::*;

/// One precompiled module of a [`Container`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ContainerEntry {
    pub function_types: Vec<FunctionType>,
    pub function_names: Vec<String>,
    pub data_word_count: u32,
    /// Word offset into [`Container::code`].
    pub data_offset: u32,
}

impl ContainerEntry {
    /// Pairs of entry point type and name.
    pub fn functions(&self) -> impl Iterator<Item = (FunctionType, &str)> + '_ {
        self.function_types
            .iter()
            .copied()
            .zip(self.function_names.iter().map(String::as_str))
    }
}

/// Several modules sharing one code blob.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Container {
    entries: Vec<ContainerEntry>,
    code: Vec<u32>,
}

impl Container {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::default()
    }
    pub fn entries(&self) -> &[ContainerEntry] {
        &self.entries
    }
    /// The code of all entries.
    pub fn code(&self) -> &[u32] {
        &self.code
    }
    /// The code of entry `index`.
    pub fn entry_code(&self, index: usize) -> Option<&[u32]> {
        let entry = self.entries.get(index)?;
        let start = entry.data_offset as usize;
        let end = start.checked_add(entry.data_word_count as usize)?;
        self.code.get(start..end)
    }
    pub fn into_parts(self) -> (Vec<ContainerEntry>, Vec<u32>) {
        (self.entries, self.code)
    }
}

/// Builds a [`Container`], assigning code offsets in insertion order.
#[derive(Default)]
pub struct ContainerBuilder {
    container: Container,
    error: Option<ContainerError>,
}

/// The word count and offset of a module of `len` words appended at word `offset`.
fn code_range(offset: usize, len: usize) -> Result<(u32, u32), ContainerError> {
    let too_large = || ContainerError::TooLarge {
        size: offset.saturating_add(len).saturating_mul(4),
    };
    let end = offset.checked_add(len).ok_or_else(too_large)?;
    if end.checked_mul(4).map_or(true, |size| size >= MAX_CONTAINER_SIZE) {
        return Err(too_large());
    }
    let data_word_count = u32::try_from(len).map_err(|_| too_large())?;
    let data_offset = u32::try_from(offset).map_err(|_| too_large())?;
    Ok((data_word_count, data_offset))
}

impl ContainerBuilder {
    /// Adds a module with the given entry points.
    ///
    /// Modules past the size limit of a container fail [`.build()`](ContainerBuilder::build).
    pub fn module<'a>(
        mut self,
        words: &[u32],
        functions: impl IntoIterator<Item = (FunctionType, &'a str)>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        let container = &mut self.container;
        let (data_word_count, data_offset) = match code_range(container.code.len(), words.len()) {
            Ok(range) => range,
            Err(e) => {
                self.error.replace(e);
                return self;
            }
        };
        let (function_types, function_names) = functions
            .into_iter()
            .map(|(ty, name)| (ty, name.to_string()))
            .unzip();
        container.entries.push(ContainerEntry {
            function_types,
            function_names,
            data_word_count,
            data_offset,
        });
        container.code.extend_from_slice(words);
        self
    }
    /// **errors**
    /// [`ContainerError::TooLarge`] if the code of all modules exceeds the size limit.
    pub fn build(self) -> Result<Container, ContainerError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.container),
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, section: &'static str, needed: usize) -> Result<&'a [u8], ContainerError> {
        let out_of_bounds = || ContainerError::OutOfBounds {
            section,
            offset: self.offset,
            needed,
            size: self.data.len(),
        };
        let end = self.offset.checked_add(needed).ok_or_else(out_of_bounds)?;
        let bytes = self.data.get(self.offset..end).ok_or_else(out_of_bounds)?;
        self.offset = end;
        Ok(bytes)
    }
    fn take_words(
        &mut self,
        section: &'static str,
        words: usize,
    ) -> Result<impl Iterator<Item = u32> + 'a, ContainerError> {
        let bytes = words
            .checked_mul(4)
            .ok_or(ContainerError::OutOfBounds {
                section,
                offset: self.offset,
                needed: usize::MAX,
                size: self.data.len(),
            })
            .and_then(|needed| self.take(section, needed))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|x| u32::from_le_bytes([x[0], x[1], x[2], x[3]])))
    }
    fn u32(&mut self, section: &'static str) -> Result<u32, ContainerError> {
        let mut words = self.take_words(section, 1)?;
        Ok(words.next().unwrap_or_default())
    }
    fn remaining(&self) -> &'a [u8] {
        self.data.get(self.offset..).unwrap_or_default()
    }
}

const fn padded_name_len(len: usize) -> usize {
    len + (4 - len % 4)
}

fn decode_impl(data: &[u8]) -> Result<Container, ContainerError> {
    let size = data.len();
    if size >= MAX_CONTAINER_SIZE {
        return Err(ContainerError::TooLarge { size });
    }
    if size < 8 {
        return Err(ContainerError::TooSmall { size });
    }
    let mut reader = Reader { data, offset: 0 };
    let magic = reader.take("magic", 4)?;
    if magic != CONTAINER_MAGIC {
        return Err(ContainerError::Magic {
            found: [magic[0], magic[1], magic[2], magic[3]],
        });
    }
    let version = reader.u32("version")?;
    if version != CONTAINER_VERSION {
        return Err(ContainerError::Version {
            found: version,
            expected: CONTAINER_VERSION,
        });
    }
    let entry_count = reader.u32("entry count")? as usize;
    let header: Vec<u32> = reader
        .take_words(
            "header entries",
            entry_count.checked_mul(2).unwrap_or(usize::MAX),
        )?
        .collect();
    let mut entries = Vec::with_capacity(entry_count);
    let mut function_counts = Vec::with_capacity(entry_count);
    let mut running_offset: u32 = 0;
    for pair in header.chunks_exact(2) {
        let (function_entry_count, data_word_count) = (pair[0], pair[1]);
        let data_offset = running_offset;
        running_offset = running_offset.checked_add(data_word_count).ok_or(
            ContainerError::OutOfBounds {
                section: "code",
                offset: reader.offset,
                needed: usize::MAX,
                size,
            },
        )?;
        function_counts.push(function_entry_count as usize);
        entries.push(ContainerEntry {
            function_types: Vec::new(),
            function_names: Vec::new(),
            data_word_count,
            data_offset,
        });
    }
    let code: Vec<u32> = reader
        .take_words("code", running_offset as usize)?
        .collect();
    for (entry_index, (entry, function_count)) in
        entries.iter_mut().zip(function_counts).enumerate()
    {
        let function_types = reader
            .take_words("function types", function_count)?
            .map(|value| {
                FunctionType::from_u32(value).ok_or(ContainerError::FunctionType {
                    entry: entry_index,
                    value,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut function_names = Vec::with_capacity(function_count);
        for index in 0..function_count {
            let len = reader
                .remaining()
                .iter()
                .position(|&b| b == 0)
                .ok_or(ContainerError::Unterminated {
                    entry: entry_index,
                    index,
                })?;
            let bytes = reader.take("function name", padded_name_len(len))?;
            let name = std::str::from_utf8(&bytes[..len]).map_err(|_| ContainerError::Utf8 {
                entry: entry_index,
                index,
            })?;
            function_names.push(name.to_string());
        }
        entry.function_types = function_types;
        entry.function_names = function_names;
    }
    Ok(Container { entries, code })
}

/// Decodes a container.
///
/// **errors**
/// Any malformed or out of bounds field, nothing is returned for a partial parse.
pub fn decode(data: &[u8]) -> Result<Container, ContainerError> {
    decode_impl(data).map_err(|e| {
        log::error!("failed to decode container: {e}");
        e
    })
}

/// Encodes a container.
///
/// Byte identical containers encode to byte identical output.
///
/// **errors**
/// - The number of function types and names differ.
/// - A function name contains NUL.
/// - Entry code ranges are not contiguous or do not cover the code blob.
pub fn encode(container: &Container) -> Result<Vec<u8>, ContainerError> {
    let mut running_offset = 0usize;
    for (entry_index, entry) in container.entries.iter().enumerate() {
        if entry.function_types.len() != entry.function_names.len() {
            return Err(ContainerError::FunctionCount {
                entry: entry_index,
                types: entry.function_types.len(),
                names: entry.function_names.len(),
            });
        }
        if let Some(name) = entry.function_names.iter().find(|x| x.contains('\0')) {
            return Err(ContainerError::NameNul { name: name.clone() });
        }
        if entry.data_offset as usize != running_offset {
            return Err(ContainerError::Layout { entry: entry_index });
        }
        running_offset += entry.data_word_count as usize;
    }
    if running_offset != container.code.len() {
        return Err(ContainerError::Layout {
            entry: container.entries.len(),
        });
    }
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&CONTAINER_MAGIC);
    bytes.extend_from_slice(&CONTAINER_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(container.entries.len() as u32).to_le_bytes());
    for entry in container.entries.iter() {
        bytes.extend_from_slice(&(entry.function_names.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&entry.data_word_count.to_le_bytes());
    }
    for word in container.code.iter() {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    for entry in container.entries.iter() {
        for ty in entry.function_types.iter() {
            bytes.extend_from_slice(&ty.to_u32().to_le_bytes());
        }
        for name in entry.function_names.iter() {
            bytes.extend_from_slice(name.as_bytes());
            let padding = padded_name_len(name.len()) - name.len();
            bytes.resize(bytes.len() + padding, 0);
        }
    }
    Ok(bytes)
}

fn read_file(path: &Path) -> Result<Vec<u8>, ContainerError> {
    let io_error = |source| ContainerError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    let expected = file.metadata().map_err(io_error)?.len() as usize;
    let mut data = Vec::with_capacity(expected);
    let read = file.read_to_end(&mut data).map_err(io_error)?;
    if read != expected {
        return Err(ContainerError::ShortRead {
            path: path.to_path_buf(),
            expected,
            read,
        });
    }
    Ok(data)
}

/// Loads a container from a file.
pub fn load(path: impl AsRef<Path>) -> Result<Container, ContainerError> {
    let path = path.as_ref();
    read_file(path)
        .and_then(|data| decode_impl(&data))
        .map_err(|e| {
            log::error!("failed to load container {path:?}: {e}");
            e
        })
}

/// Writes a container to a file.
pub fn save(path: impl AsRef<Path>, container: &Container) -> Result<(), ContainerError> {
    let path = path.as_ref();
    let bytes = encode(container)?;
    std::fs::write(path, bytes).map_err(|source| {
        log::error!("failed to write container {path:?}: {source}");
        ContainerError::Io {
            path: PathBuf::from(path),
            source,
        }
    })
}

/// Loads a single raw module (ie a SPIR-V binary).
pub fn load_binary(path: impl AsRef<Path>) -> Result<Vec<u32>, ContainerError> {
    let path = path.as_ref();
    let result = read_file(path).and_then(|data| {
        if data.len() % 4 != 0 {
            return Err(ContainerError::Misaligned {
                path: path.to_path_buf(),
                size: data.len(),
            });
        }
        Ok(data
            .chunks_exact(4)
            .map(|x| u32::from_le_bytes([x[0], x[1], x[2], x[3]]))
            .collect())
    });
    result.map_err(|e| {
        log::error!("failed to load binary {path:?}: {e}");
        e
    })
}
