use std::collections::Bound;
use std::ops::RangeBounds;
use ash::vk;
use crate::error::RhiError;

macro_rules! normalize_range_function {
    ($unsigned:ty) => {
        $crate::paste! {
            /// Resolve `bounds` against `size` into `(start, count)`.
            pub(crate) fn [<normalize_range_ $unsigned>]<R: RangeBounds<$unsigned>>(
                bounds: R,
                size: $unsigned,
            ) -> Result<($unsigned, $unsigned), RhiError> {
                let overflow = || RhiError::InvalidArgument(format!("range overflows {}", stringify!($unsigned)));
                let start = match bounds.start_bound() {
                    Bound::Included(&v) => v,
                    Bound::Excluded(&v) => v.checked_add(1).ok_or_else(overflow)?,
                    Bound::Unbounded => 0,
                };
                let end_exclusive = match bounds.end_bound() {
                    Bound::Included(&v) => v.checked_add(1).ok_or_else(overflow)?,
                    Bound::Excluded(&v) => v,
                    Bound::Unbounded => size,
                };

                if start > end_exclusive || end_exclusive > size {
                    return Err(RhiError::InvalidArgument(format!(
                        "range {}..{} is outside 0..{}",
                        start, end_exclusive, size
                    )));
                }

                Ok((start, end_exclusive - start))
            }
        }
    };
}

normalize_range_function!(u64);
normalize_range_function!(u32);

/// First memory type allowed by `type_filter` that has every flag in `properties`.
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0 && memory_properties.memory_types[i as usize].property_flags.contains(properties)
    })
}

/// Number of mips in a full chain for the given extent.
pub(crate) fn full_mip_count(width: u32, height: u32, depth: u32) -> u32 {
    let largest = width.max(height).max(depth).max(1);
    32 - largest.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_resolve_against_size() {
        assert_eq!(normalize_range_u64(.., 256).unwrap(), (0, 256));
        assert_eq!(normalize_range_u64(16..48, 256).unwrap(), (16, 32));
        assert_eq!(normalize_range_u32(2..=3, 8).unwrap(), (2, 2));
        assert!(normalize_range_u64(200..300, 256).is_err());
        assert!(normalize_range_u32(5..2, 8).is_err());
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(full_mip_count(1, 1, 1), 1);
        assert_eq!(full_mip_count(256, 256, 1), 9);
        assert_eq!(full_mip_count(300, 17, 1), 9);
    }

    #[test]
    fn memory_type_honours_filter_and_flags() {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = 3;
        properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        properties.memory_types[1].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        properties.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let coherent = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&properties, 0b111, coherent), Some(2));
        assert_eq!(find_memory_type(&properties, 0b011, coherent), None);
        assert_eq!(find_memory_type(&properties, 0b110, vk::MemoryPropertyFlags::DEVICE_LOCAL), None);
    }
}
