/*!
Work-group (local work size) negotiation.

A requested local size is corrected to fit the limits of a kernel entry on a device,
it is never an error.
*/

use serde::{Deserialize, Serialize};

/// Local size limits of a kernel entry on a device.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LocalSizeLimits {
    /// Per dimension limits, 0 is unlimited.
    pub max_local_size: [u32; 3],
    /// Limit of the product of all dimensions, 0 is unlimited.
    pub max_total_local_size: u32,
}

impl LocalSizeLimits {
    pub const fn new(max_local_size: [u32; 3], max_total_local_size: u32) -> Self {
        Self {
            max_local_size,
            max_total_local_size,
        }
    }
    /// No limits.
    pub const fn unlimited() -> Self {
        Self::new([0; 3], 0)
    }
    fn exceeds(&self, local_size: [u32; 3]) -> bool {
        let total: u64 = local_size.iter().map(|&x| x as u64).product();
        if total > self.max_total_local_size as u64 {
            return true;
        }
        local_size
            .iter()
            .zip(self.max_local_size)
            .any(|(&x, max)| max != 0 && x > max)
    }
}

/// The result of [`negotiate_local_size`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Negotiated {
    pub local_size: [u32; 3],
    /// The request did not fit and was replaced by a fallback shape.
    pub corrected: bool,
}

/// Fits `requested` into `limits`.
///
/// Each component is clamped to at least 1. With a nonzero `max_total_local_size`, a
/// request whose product exceeds it, or that exceeds a per dimension limit, is replaced by:
/// - `(max_total / 2, 2, 1)` if more than 1 was requested in y, the y limit exceeds 1
///   and `max_total` exceeds 1.
/// - `(max_total, 1, 1)` otherwise.
///
/// x of the fallback is clamped to the x limit.
///
/// With `max_total_local_size == 0` only the clamp applies.
pub fn negotiate_local_size(requested: [u32; 3], limits: &LocalSizeLimits) -> Negotiated {
    let local_size = requested.map(|x| x.max(1));
    let max_total = limits.max_total_local_size;
    if max_total == 0 || !limits.exceeds(local_size) {
        return Negotiated {
            local_size,
            corrected: false,
        };
    }
    let [x_limit, y_limit, _] = limits.max_local_size;
    let mut local_size = if requested[1] > 1 && (y_limit == 0 || y_limit > 1) && max_total > 1 {
        [max_total / 2, 2, 1]
    } else {
        [max_total, 1, 1]
    };
    if x_limit != 0 {
        local_size[0] = local_size[0].min(x_limit);
    }
    Negotiated {
        local_size,
        corrected: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: LocalSizeLimits = LocalSizeLimits::new([1024, 4, 64], 256);

    #[test]
    fn prefers_two_dimensional_shape() {
        let negotiated = negotiate_local_size([1, 8, 1], &LIMITS);
        assert_eq!(negotiated.local_size, [128, 2, 1]);
        assert!(negotiated.corrected);
    }

    #[test]
    fn falls_back_to_one_dimensional_shape() {
        let negotiated = negotiate_local_size([300, 1, 1], &LIMITS);
        assert_eq!(negotiated.local_size, [256, 1, 1]);
        assert!(negotiated.corrected);
        let flat_y = LocalSizeLimits::new([1024, 1, 1], 256);
        assert_eq!(
            negotiate_local_size([64, 64, 1], &flat_y).local_size,
            [256, 1, 1]
        );
        let single = LocalSizeLimits::new([1, 1, 1], 1);
        assert_eq!(negotiate_local_size([4, 4, 4], &single).local_size, [1, 1, 1]);
    }

    #[test]
    fn fallback_respects_x_limit() {
        let narrow = LocalSizeLimits::new([64, 4, 64], 256);
        assert_eq!(
            negotiate_local_size([1, 8, 1], &narrow),
            Negotiated {
                local_size: [64, 2, 1],
                corrected: true,
            }
        );
        assert_eq!(negotiate_local_size([300, 1, 1], &narrow).local_size, [64, 1, 1]);
    }

    #[test]
    fn fitting_request_is_unchanged() {
        let negotiated = negotiate_local_size([16, 4, 2], &LIMITS);
        assert_eq!(negotiated.local_size, [16, 4, 2]);
        assert!(!negotiated.corrected);
    }

    #[test]
    fn zero_components_clamp_to_one() {
        assert_eq!(
            negotiate_local_size([0, 0, 0], &LIMITS).local_size,
            [1, 1, 1]
        );
        assert_eq!(
            negotiate_local_size([0, 7, 0], &LocalSizeLimits::unlimited()),
            Negotiated {
                local_size: [1, 7, 1],
                corrected: false,
            }
        );
    }

    #[test]
    fn unlimited_total_only_clamps() {
        let limits = LocalSizeLimits::new([4, 4, 4], 0);
        let requested = [u32::MAX, 2, 0];
        assert_eq!(
            negotiate_local_size(requested, &limits).local_size,
            [u32::MAX, 2, 1]
        );
    }

    #[test]
    fn output_is_within_limits() {
        let values = [0, 1, 2, 3, 7, 8, 64, 255, 256, 1000, u32::MAX];
        let totals = [0, 1, 2, 64, 256, 1024];
        for &total in totals.iter() {
            let limits = LocalSizeLimits::new([1024, 4, 64], total);
            for &x in values.iter() {
                for &y in values.iter() {
                    for &z in [0, 1, 9].iter() {
                        let out = negotiate_local_size([x, y, z], &limits).local_size;
                        assert!(out.iter().all(|&c| c >= 1), "{out:?}");
                        if total == 0 {
                            assert_eq!(out, [x.max(1), y.max(1), z.max(1)]);
                        } else {
                            let product: u64 = out.iter().map(|&c| c as u64).product();
                            assert!(product <= total as u64, "{x} {y} {z} -> {out:?}");
                            assert!(
                                out.iter().zip(limits.max_local_size).all(|(&c, max)| c <= max),
                                "{x} {y} {z} -> {out:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
