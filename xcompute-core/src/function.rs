use serde::{Deserialize, Serialize};

/// Kind of entry point.
///
/// Stored as a little endian `u32` in containers, see [`FunctionType::to_u32`].
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
#[repr(u32)]
pub enum FunctionType {
    None = 0,
    Kernel = 1,
    Vertex = 2,
    Fragment = 3,
}

impl FunctionType {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Kernel),
            2 => Some(Self::Vertex),
            3 => Some(Self::Fragment),
            _ => None,
        }
    }
    /// The SPIR-V execution model of the entry point.
    pub fn execution_model(self) -> Option<spirv::ExecutionModel> {
        match self {
            Self::None => None,
            Self::Kernel => Some(spirv::ExecutionModel::GLCompute),
            Self::Vertex => Some(spirv::ExecutionModel::Vertex),
            Self::Fragment => Some(spirv::ExecutionModel::Fragment),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum ArgKind {
    Value,
    Buffer,
    Image,
    ImageArray,
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum ImageAccess {
    None,
    Read,
    Write,
    ReadWrite,
}

impl ImageAccess {
    /// Needs a read descriptor.
    ///
    /// Images without a declared access are bound for reading.
    pub const fn reads(self) -> bool {
        matches!(self, Self::None | Self::Read | Self::ReadWrite)
    }
    /// Needs a write descriptor.
    pub const fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, derive_more::IsVariant,
)]
pub enum SpecialType {
    Normal,
    /// Supplied by a fixed function stage (ie vertex input), never bound by the host.
    StageInput,
}

/// A kernel argument.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ArgInfo {
    pub kind: ArgKind,
    pub image_access: ImageAccess,
    pub special_type: SpecialType,
    /// Declared length of an image array, 0 otherwise.
    pub array_size: u32,
}

impl ArgInfo {
    const fn new(kind: ArgKind, image_access: ImageAccess, array_size: u32) -> Self {
        Self {
            kind,
            image_access,
            special_type: SpecialType::Normal,
            array_size,
        }
    }
    pub const fn value() -> Self {
        Self::new(ArgKind::Value, ImageAccess::None, 0)
    }
    pub const fn buffer() -> Self {
        Self::new(ArgKind::Buffer, ImageAccess::None, 0)
    }
    pub const fn image(access: ImageAccess) -> Self {
        Self::new(ArgKind::Image, access, 0)
    }
    pub const fn image_array(access: ImageAccess, array_size: u32) -> Self {
        Self::new(ArgKind::ImageArray, access, array_size)
    }
    /// Marks the argument as a stage input.
    pub const fn stage_input(mut self) -> Self {
        self.special_type = SpecialType::StageInput;
        self
    }
    pub const fn is_stage_input(&self) -> bool {
        matches!(self.special_type, SpecialType::StageInput)
    }
    /// Number of binding slots the argument occupies.
    ///
    /// Stage inputs occupy none, read-write images occupy a read and a write slot.
    pub const fn binding_slots(&self) -> u32 {
        if self.is_stage_input() {
            0
        } else if matches!(self.kind, ArgKind::Image)
            && matches!(self.image_access, ImageAccess::ReadWrite)
        {
            2
        } else {
            1
        }
    }
}

/// Portable signature of an entry point.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub name: String,
    pub function_type: FunctionType,
    pub args: Vec<ArgInfo>,
}

impl FunctionInfo {
    pub fn new(
        name: impl Into<String>,
        function_type: FunctionType,
        args: impl Into<Vec<ArgInfo>>,
    ) -> Self {
        Self {
            name: name.into(),
            function_type,
            args: args.into(),
        }
    }
    /// A compute kernel.
    pub fn kernel(name: impl Into<String>, args: impl Into<Vec<ArgInfo>>) -> Self {
        Self::new(name, FunctionType::Kernel, args)
    }
    /// Arguments bound by the host, in declaration order.
    pub fn bindable_args(&self) -> impl Iterator<Item = &ArgInfo> + '_ {
        self.args.iter().filter(|arg| !arg.is_stage_input())
    }
    /// Total binding slots of all arguments.
    pub fn binding_count(&self) -> u32 {
        self.args.iter().map(ArgInfo::binding_slots).sum()
    }
    pub fn has_bindings(&self) -> bool {
        self.binding_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_type_u32() {
        for ty in [
            FunctionType::None,
            FunctionType::Kernel,
            FunctionType::Vertex,
            FunctionType::Fragment,
        ] {
            assert_eq!(FunctionType::from_u32(ty.to_u32()), Some(ty));
        }
        assert_eq!(FunctionType::from_u32(4), None);
        assert_eq!(
            FunctionType::Kernel.execution_model(),
            Some(spirv::ExecutionModel::GLCompute)
        );
    }

    #[test]
    fn binding_slots() {
        assert_eq!(ArgInfo::value().binding_slots(), 1);
        assert_eq!(ArgInfo::buffer().binding_slots(), 1);
        assert_eq!(ArgInfo::image(ImageAccess::Read).binding_slots(), 1);
        assert_eq!(ArgInfo::image(ImageAccess::Write).binding_slots(), 1);
        assert_eq!(ArgInfo::image(ImageAccess::ReadWrite).binding_slots(), 2);
        assert_eq!(
            ArgInfo::image_array(ImageAccess::ReadWrite, 4).binding_slots(),
            1
        );
        assert_eq!(ArgInfo::buffer().stage_input().binding_slots(), 0);
    }

    #[test]
    fn binding_count_skips_stage_inputs() {
        let info = FunctionInfo::new(
            "vs",
            FunctionType::Vertex,
            [
                ArgInfo::buffer().stage_input(),
                ArgInfo::value(),
                ArgInfo::image(ImageAccess::ReadWrite),
            ],
        );
        assert_eq!(info.binding_count(), 3);
        assert_eq!(info.bindable_args().count(), 2);
        let stage_only = FunctionInfo::new(
            "vs",
            FunctionType::Vertex,
            [ArgInfo::buffer().stage_input()],
        );
        assert!(!stage_only.has_bindings());
    }
}
