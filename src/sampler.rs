/*!
Fixed samplers.

Every device has one immutable set of samplers, one for each combination of
[`AddressMode`], [`Filter`] and [`CoordMode`]. The set is bound at set 0 of every
pipeline and is never written per launch. Kernels select a sampler by [`Sampler::index`].
*/

use crate::descriptor::{
    Descriptor, DescriptorBinding, DescriptorSet, DescriptorSetLayout, DescriptorType,
    DescriptorWrite,
};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    ClampToZero,
    ClampToEdge,
    Repeat,
    MirroredRepeat,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum CoordMode {
    Normalized,
    Pixel,
}

/// A sampler description.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Sampler {
    pub address_mode: AddressMode,
    pub filter: Filter,
    pub coord_mode: CoordMode,
}

const ADDRESS_MODES: [AddressMode; 4] = [
    AddressMode::ClampToZero,
    AddressMode::ClampToEdge,
    AddressMode::Repeat,
    AddressMode::MirroredRepeat,
];
const FILTERS: [Filter; 2] = [Filter::Nearest, Filter::Linear];
const COORD_MODES: [CoordMode; 2] = [CoordMode::Normalized, CoordMode::Pixel];

/// The number of fixed samplers.
pub const SAMPLER_COUNT: u32 = (ADDRESS_MODES.len() * FILTERS.len() * COORD_MODES.len()) as u32;

static SAMPLERS: Lazy<Vec<Sampler>> = Lazy::new(|| {
    ADDRESS_MODES
        .iter()
        .flat_map(|&address_mode| {
            FILTERS.iter().flat_map(move |&filter| {
                COORD_MODES.iter().map(move |&coord_mode| Sampler {
                    address_mode,
                    filter,
                    coord_mode,
                })
            })
        })
        .collect()
});

impl Sampler {
    pub const fn new(address_mode: AddressMode, filter: Filter, coord_mode: CoordMode) -> Self {
        Self {
            address_mode,
            filter,
            coord_mode,
        }
    }
    /// The sampler at `index` of the fixed set.
    pub fn from_index(index: u32) -> Option<Self> {
        SAMPLERS.get(index as usize).copied()
    }
    /// The index in the fixed set.
    pub const fn index(&self) -> u32 {
        let address = self.address_mode as u32;
        let filter = self.filter as u32;
        let coord = self.coord_mode as u32;
        (address * FILTERS.len() as u32 + filter) * COORD_MODES.len() as u32 + coord
    }
    /// All fixed samplers, in index order.
    pub fn all() -> &'static [Sampler] {
        &SAMPLERS
    }
}

/// The layout of the fixed sampler set.
pub(crate) fn fixed_layout() -> DescriptorSetLayout {
    DescriptorSetLayout::new([DescriptorBinding {
        ty: DescriptorType::Sampler,
        count: SAMPLER_COUNT,
    }])
}

/// Writes every fixed sampler to `set`.
pub(crate) fn fixed_sampler_write(set: &DescriptorSet) -> DescriptorWrite {
    DescriptorWrite {
        set: set.clone(),
        binding: 0,
        descriptors: Sampler::all().iter().copied().map(Descriptor::Sampler).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampler_indices() {
        assert_eq!(Sampler::all().len(), SAMPLER_COUNT as usize);
        for (i, sampler) in Sampler::all().iter().enumerate() {
            assert_eq!(sampler.index(), i as u32);
            assert_eq!(Sampler::from_index(i as u32), Some(*sampler));
        }
        assert_eq!(Sampler::from_index(SAMPLER_COUNT), None);
        let sampler = Sampler::new(AddressMode::Repeat, Filter::Linear, CoordMode::Pixel);
        assert_eq!(sampler.index(), 11);
    }

    #[test]
    fn fixed_set_is_written() {
        let set = DescriptorSet::new(fixed_layout());
        let write = fixed_sampler_write(&set);
        crate::descriptor::validate_write(&write, 0).unwrap();
        set.write_unchecked(write.binding, write.descriptors);
        assert_eq!(set.first_unwritten(), None);
        assert_eq!(set.descriptors(0).unwrap().len(), SAMPLER_COUNT as usize);
    }
}
