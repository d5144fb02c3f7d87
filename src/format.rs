// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Metadata for the image formats the translation layer renders to.
//!
//! Pipeline construction only needs to know two things about a format: which
//! image aspects it consists of, and which color components physically exist
//! in it. The latter drives write mask normalization; a format that stores
//! fewer components than the shader writes simply drops the rest, and an
//! emulated alpha-only target stores its payload in the red channel.

use ash::vk;

/// Format metadata consumed by pipeline construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatInfo {
    /// Image aspects present in the format.
    pub aspect_mask: vk::ImageAspectFlags,
    /// Color components that are actually stored. Empty for depth-stencil
    /// formats.
    pub component_mask: vk::ColorComponentFlags,
}

const fn components(bits: u32) -> vk::ColorComponentFlags {
    vk::ColorComponentFlags::from_raw(bits)
}

const R: vk::ColorComponentFlags = components(0b0001);
const RG: vk::ColorComponentFlags = components(0b0011);
const RGB: vk::ColorComponentFlags = components(0b0111);
const RGBA: vk::ColorComponentFlags = components(0b1111);

const fn color(component_mask: vk::ColorComponentFlags) -> FormatInfo {
    FormatInfo {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        component_mask,
    }
}

const fn depth_stencil(aspect_mask: vk::ImageAspectFlags) -> FormatInfo {
    FormatInfo {
        aspect_mask,
        component_mask: vk::ColorComponentFlags::empty(),
    }
}

const COLOR_R: FormatInfo = color(R);
const COLOR_RG: FormatInfo = color(RG);
const COLOR_RGB: FormatInfo = color(RGB);
const COLOR_RGBA: FormatInfo = color(RGBA);

const DEPTH: FormatInfo = depth_stencil(vk::ImageAspectFlags::DEPTH);
const STENCIL: FormatInfo = depth_stencil(vk::ImageAspectFlags::STENCIL);
const DEPTH_STENCIL: FormatInfo = depth_stencil(vk::ImageAspectFlags::from_raw(
    vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
));

/// Looks up metadata for the given format.
///
/// Returns `None` for `UNDEFINED` and for formats the translation layer
/// never uses as attachments.
pub fn lookup_format_info(format: vk::Format) -> Option<&'static FormatInfo> {
    match format {
        vk::Format::R8_UNORM
        | vk::Format::R8_SNORM
        | vk::Format::R8_UINT
        | vk::Format::R8_SINT
        | vk::Format::R16_UNORM
        | vk::Format::R16_SNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SINT
        | vk::Format::R16_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::R32_SFLOAT => Some(&COLOR_R),

        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8_SINT
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SNORM
        | vk::Format::R16G16_UINT
        | vk::Format::R16G16_SINT
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT
        | vk::Format::R32G32_SFLOAT => Some(&COLOR_RG),

        vk::Format::R5G6B5_UNORM_PACK16
        | vk::Format::B5G6R5_UNORM_PACK16
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R32G32B32_UINT
        | vk::Format::R32G32B32_SINT
        | vk::Format::R32G32B32_SFLOAT => Some(&COLOR_RGB),

        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::A8B8G8R8_UNORM_PACK32
        | vk::Format::A8B8G8R8_SRGB_PACK32
        | vk::Format::A2R10G10B10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A1R5G5B5_UNORM_PACK16
        | vk::Format::B5G5R5A1_UNORM_PACK16
        | vk::Format::B4G4R4A4_UNORM_PACK16
        | vk::Format::R4G4B4A4_UNORM_PACK16
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SNORM
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R32G32B32A32_UINT
        | vk::Format::R32G32B32A32_SINT
        | vk::Format::R32G32B32A32_SFLOAT => Some(&COLOR_RGBA),

        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            Some(&DEPTH)
        }

        vk::Format::S8_UINT => Some(&STENCIL),

        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => Some(&DEPTH_STENCIL),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undefined_has_no_info() {
        assert!(lookup_format_info(vk::Format::UNDEFINED).is_none());
    }

    #[test]
    fn alpha_emulation_format_is_red_only() {
        let info = lookup_format_info(vk::Format::R8_UNORM).unwrap();
        assert_eq!(info.component_mask, vk::ColorComponentFlags::R);
        assert_eq!(info.aspect_mask, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn depth_stencil_aspects() {
        let info = lookup_format_info(vk::Format::D24_UNORM_S8_UINT).unwrap();
        assert!(info.aspect_mask.contains(vk::ImageAspectFlags::DEPTH));
        assert!(info.aspect_mask.contains(vk::ImageAspectFlags::STENCIL));
        assert!(info.component_mask.is_empty());

        let info = lookup_format_info(vk::Format::D32_SFLOAT).unwrap();
        assert!(info.aspect_mask.contains(vk::ImageAspectFlags::DEPTH));
        assert!(!info.aspect_mask.contains(vk::ImageAspectFlags::STENCIL));
    }

    #[test]
    fn packed_formats_without_alpha() {
        let info = lookup_format_info(vk::Format::B10G11R11_UFLOAT_PACK32).unwrap();
        assert_eq!(info.component_mask, RGB);
    }
}
