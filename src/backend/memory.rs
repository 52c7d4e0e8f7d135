// Memory type selection

use ash::vk;

/// First memory type allowed by `type_filter` that has every flag in `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

/// Memory type for a D3D11 texture import.
///
/// `import_bits` comes from `vkGetMemoryWin32HandlePropertiesKHR` when the
/// driver reports it; otherwise the image requirements alone decide.
pub fn find_import_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirement_bits: u32,
    import_bits: Option<u32>,
) -> Option<u32> {
    let allowed = requirement_bits & import_bits.unwrap_or(u32::MAX);
    find_memory_type(
        memory_properties,
        allowed,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &f) in flags.iter().enumerate() {
            props.memory_types[i].property_flags = f;
        }
        props
    }

    #[test]
    fn respects_the_type_filter() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&props, 0b111, local), Some(0));
        assert_eq!(find_memory_type(&props, 0b110, local), Some(2));
        assert_eq!(find_memory_type(&props, 0b010, local), None);
    }

    #[test]
    fn import_type_must_be_allowed_by_both_masks() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(find_import_memory_type(&props, 0b111, Some(0b110)), Some(1));
        assert_eq!(find_import_memory_type(&props, 0b111, None), Some(0));
        assert_eq!(find_import_memory_type(&props, 0b001, Some(0b100)), None);
    }
}
