// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The fragment output interface sub-vector and its pipeline library.

use crate::device::Device;
use crate::format::lookup_format_info;
use crate::pipeline::state::{
    remap_alpha_to_color_blend_factor, AttachmentBlendState, GraphicsPipelineState,
    COLOR_COMPONENTS_RGBA,
};
use crate::shader::{Shader, ShaderFlags};
use crate::{Error, Result, MAX_RENDER_TARGETS};
use ash::vk;
use smallvec::SmallVec;
use std::mem;
use std::sync::Arc;

/// Normalized fragment output state: render target formats, blending and
/// multisampling, with write masks reduced to what the fragment shader and
/// the formats can actually produce.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct FragmentOutputState {
    /// Color attachment formats; the length is the attachment count, and
    /// unbound slots below the highest bound one stay `UNDEFINED`.
    pub color_formats: SmallVec<[vk::Format; MAX_RENDER_TARGETS]>,
    pub depth_format: vk::Format,
    pub stencil_format: vk::Format,
    pub enable_logic_op: bool,
    pub logic_op: vk::LogicOp,
    /// Per-slot blend state, same length as `color_formats`. Slots the
    /// shader does not write carry the normalized unused state.
    pub attachments: SmallVec<[AttachmentBlendState; MAX_RENDER_TARGETS]>,
    pub rasterization_samples: vk::SampleCountFlags,
    pub enable_sample_shading: bool,
    pub sample_mask: u32,
    pub enable_alpha_to_coverage: bool,
    pub dynamic_blend_constants: bool,
}

impl FragmentOutputState {
    pub fn new(state: &GraphicsPipelineState, fs: Option<&Shader>) -> Self {
        // Disable the write mask for any attachment that the fragment
        // shader does not write to.
        let mut fs_output_mask = fs.map_or(0u32, |fs| fs.info().output_mask);

        // Dual-source blending can only write to one render target
        if state.use_dual_source_blending() {
            fs_output_mask &= 0x1;
        }

        let attachment_count = state
            .rt
            .color_formats
            .iter()
            .rposition(|&format| format != vk::Format::UNDEFINED)
            .map_or(0, |index| index + 1);

        let mut color_formats = SmallVec::new();
        let mut attachments = SmallVec::new();

        for i in 0..attachment_count {
            let format = state.rt.color_formats[i];
            color_formats.push(format);

            let mut attachment = AttachmentBlendState::unused();

            if fs_output_mask & (1u32 << i) != 0 && format != vk::Format::UNDEFINED {
                if let Some(format_info) = lookup_format_info(format) {
                    let requested = state.om_blend[i].color_write_mask;
                    let mut write_mask = requested;

                    if write_mask != COLOR_COMPONENTS_RGBA {
                        write_mask = state.om_swizzle[i].remap_write_mask(requested);
                    }

                    write_mask &= format_info.component_mask;

                    // A mask covering everything the format stores behaves
                    // like a full write; normalize it for hash stability.
                    if write_mask == format_info.component_mask {
                        write_mask = COLOR_COMPONENTS_RGBA;
                    }

                    if !write_mask.is_empty() {
                        attachment = if state.om_blend[i].blend_enable {
                            AttachmentBlendState {
                                color_write_mask: write_mask,
                                ..state.om_blend[i]
                            }
                        } else {
                            AttachmentBlendState {
                                color_write_mask: write_mask,
                                ..AttachmentBlendState::unused()
                            }
                        };

                        // If this is an emulated alpha-only render target,
                        // blending happens on the red channel instead.
                        if attachment.blend_enable
                            && format_info.component_mask == vk::ColorComponentFlags::R
                            && state.om_swizzle[i].r_index() == 3
                        {
                            attachment.src_color_blend_factor = remap_alpha_to_color_blend_factor(
                                mem::replace(
                                    &mut attachment.src_alpha_blend_factor,
                                    vk::BlendFactor::ONE,
                                ),
                            );
                            attachment.dst_color_blend_factor = remap_alpha_to_color_blend_factor(
                                mem::replace(
                                    &mut attachment.dst_alpha_blend_factor,
                                    vk::BlendFactor::ZERO,
                                ),
                            );
                            attachment.color_blend_op =
                                mem::replace(&mut attachment.alpha_blend_op, vk::BlendOp::ADD);
                        }
                    }
                }
            }

            attachments.push(attachment);
        }

        // Set up depth-stencil formats according to the aspects the shared
        // format actually contains.
        let mut depth_format = vk::Format::UNDEFINED;
        let mut stencil_format = vk::Format::UNDEFINED;

        if state.rt.depth_stencil_format != vk::Format::UNDEFINED {
            if let Some(format_info) = lookup_format_info(state.rt.depth_stencil_format) {
                if format_info.aspect_mask.contains(vk::ImageAspectFlags::DEPTH) {
                    depth_format = state.rt.depth_stencil_format;
                }

                if format_info
                    .aspect_mask
                    .contains(vk::ImageAspectFlags::STENCIL)
                {
                    stencil_format = state.rt.depth_stencil_format;
                }
            }
        }

        // Multisample state comes from shader info as well as the
        // rasterization state and render target sample counts.
        let rasterization_samples = if !state.ms.sample_count.is_empty() {
            state.ms.sample_count
        } else if !state.rs.sample_count.is_empty() {
            state.rs.sample_count
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        let enable_sample_shading =
            fs.map_or(false, |fs| fs.flags().contains(ShaderFlags::HAS_SAMPLE_RATE_SHADING));

        let sample_bits = rasterization_samples.as_raw();
        let sample_mask = if sample_bits < 32 {
            state.ms.sample_mask & ((1u32 << sample_bits) - 1)
        } else {
            state.ms.sample_mask
        };

        // This must be bit-identical to the incoming state vector; while it
        // could be inferred consistently, don't take any chances.
        let dynamic_blend_constants = state.use_dynamic_blend_constants();

        Self {
            color_formats,
            depth_format,
            stencil_format,
            enable_logic_op: state.om.enable_logic_op,
            logic_op: state.om.logic_op,
            attachments,
            rasterization_samples,
            enable_sample_shading,
            sample_mask,
            enable_alpha_to_coverage: state.ms.enable_alpha_to_coverage,
            dynamic_blend_constants,
        }
    }
}

/// Owns the fragment-output-interface pipeline library built from one
/// [`FragmentOutputState`].
pub struct FragmentOutputLibrary {
    device: Arc<Device>,
    handle: vk::Pipeline,
}

impl FragmentOutputLibrary {
    pub fn new(device: Arc<Device>, state: &FragmentOutputState) -> Result<Self> {
        let attachments_vk: SmallVec<[vk::PipelineColorBlendAttachmentState; 8]> =
            state.attachments.iter().map(Into::into).collect();

        let cb_info = vk::PipelineColorBlendStateCreateInfo {
            logic_op_enable: state.enable_logic_op as vk::Bool32,
            logic_op: state.logic_op,
            attachment_count: attachments_vk.len() as u32,
            p_attachments: attachments_vk.as_ptr(),
            ..Default::default()
        };

        let sample_mask: vk::SampleMask = state.sample_mask;

        let ms_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: state.rasterization_samples,
            sample_shading_enable: state.enable_sample_shading as vk::Bool32,
            min_sample_shading: if state.enable_sample_shading { 1.0 } else { 0.0 },
            p_sample_mask: &sample_mask,
            alpha_to_coverage_enable: state.enable_alpha_to_coverage as vk::Bool32,
            ..Default::default()
        };

        let rendering_info = vk::PipelineRenderingCreateInfo {
            color_attachment_count: state.color_formats.len() as u32,
            p_color_attachment_formats: state.color_formats.as_ptr(),
            depth_attachment_format: state.depth_format,
            stencil_attachment_format: state.stencil_format,
            ..Default::default()
        };

        let lib_info = vk::GraphicsPipelineLibraryCreateInfoEXT {
            p_next: &rendering_info as *const _ as *mut _,
            flags: vk::GraphicsPipelineLibraryFlagsEXT::FRAGMENT_OUTPUT_INTERFACE,
            ..Default::default()
        };

        let dynamic_states = [vk::DynamicState::BLEND_CONSTANTS];

        let dy_info = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: state.dynamic_blend_constants as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            p_next: &lib_info as *const _ as *const _,
            flags: vk::PipelineCreateFlags::LIBRARY_KHR,
            p_color_blend_state: &cb_info,
            p_multisample_state: &ms_info,
            p_dynamic_state: &dy_info,
            base_pipeline_index: -1,
            ..Default::default()
        };

        let handle = device
            .create_graphics_pipeline(&info)
            .map_err(Error::PipelineLibraryCreation)?;

        Ok(Self { device, handle })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }
}

impl Drop for FragmentOutputLibrary {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{ColorSwizzle, DynamicStateFlags};
    use crate::shader::{ShaderInfo, SpirvCodeBuffer};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn fragment_shader(output_mask: u32, flags: ShaderFlags) -> Arc<Shader> {
        Shader::new(
            ShaderInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                output_mask,
                ..ShaderInfo::default()
            },
            flags,
            SpirvCodeBuffer::new(vec![0x0723_0203]),
            "fs",
        )
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn attachment_count_covers_highest_bound_slot() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        state.rt.color_formats[2] = vk::Format::R16G16_SFLOAT;

        let fs = fragment_shader(0b111, ShaderFlags::empty());
        let fo = FragmentOutputState::new(&state, Some(&fs));

        assert_eq!(fo.color_formats.len(), 3);
        assert_eq!(fo.color_formats[1], vk::Format::UNDEFINED);
        assert!(fo.attachments[1].color_write_mask.is_empty());
    }

    #[test]
    fn unwritten_slots_have_empty_write_mask() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        state.rt.color_formats[1] = vk::Format::R8G8B8A8_UNORM;

        // Shader only writes output 0.
        let fs = fragment_shader(0b01, ShaderFlags::empty());
        let fo = FragmentOutputState::new(&state, Some(&fs));

        assert_eq!(fo.attachments[0].color_write_mask, COLOR_COMPONENTS_RGBA);
        assert!(fo.attachments[1].color_write_mask.is_empty());
    }

    #[test]
    fn dual_source_blending_limits_output_to_first_target() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        state.om_blend[0].blend_enable = true;
        state.om_blend[0].src_color_blend_factor = vk::BlendFactor::SRC1_COLOR;

        // The shader claims two outputs, but only the first target remains.
        let fs = fragment_shader(0b11, ShaderFlags::empty());
        let fo = FragmentOutputState::new(&state, Some(&fs));

        assert_eq!(fo.color_formats.len(), 1);
        assert_eq!(fo.attachments[0].color_write_mask, COLOR_COMPONENTS_RGBA);

        // With a second target bound, it exists but is never written.
        state.rt.color_formats[1] = vk::Format::R8G8B8A8_UNORM;
        let fo = FragmentOutputState::new(&state, Some(&fs));
        assert_eq!(fo.color_formats.len(), 2);
        assert!(fo.attachments[1].color_write_mask.is_empty());
    }

    #[test]
    fn write_mask_is_clamped_and_normalized() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R16G16_SFLOAT;

        let fs = fragment_shader(0b1, ShaderFlags::empty());

        // RG happens to be everything the format stores, so the mask is
        // normalized back to RGBA.
        state.om_blend[0].color_write_mask =
            vk::ColorComponentFlags::R | vk::ColorComponentFlags::G;
        let fo = FragmentOutputState::new(&state, Some(&fs));
        assert_eq!(fo.attachments[0].color_write_mask, COLOR_COMPONENTS_RGBA);

        // A blue-only mask intersects to nothing; the slot stays unused.
        state.om_blend[0].color_write_mask = vk::ColorComponentFlags::B;
        let fo = FragmentOutputState::new(&state, Some(&fs));
        assert!(fo.attachments[0].color_write_mask.is_empty());
    }

    #[test]
    fn alpha_only_target_rewrites_blending() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R8_UNORM;
        state.om_swizzle[0] = ColorSwizzle::new(3, 3, 3, 3);

        state.om_blend[0] = AttachmentBlendState {
            blend_enable: true,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::MAX,
            color_write_mask: vk::ColorComponentFlags::A,
        };

        let fs = fragment_shader(0b1, ShaderFlags::empty());
        let fo = FragmentOutputState::new(&state, Some(&fs));

        let attachment = &fo.attachments[0];
        assert!(attachment.blend_enable);
        assert_eq!(
            attachment.src_color_blend_factor,
            vk::BlendFactor::SRC_COLOR
        );
        assert_eq!(
            attachment.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_COLOR
        );
        assert_eq!(attachment.src_alpha_blend_factor, vk::BlendFactor::ONE);
        assert_eq!(attachment.dst_alpha_blend_factor, vk::BlendFactor::ZERO);
        assert_eq!(attachment.color_blend_op, vk::BlendOp::MAX);
        assert_eq!(attachment.alpha_blend_op, vk::BlendOp::ADD);

        // The alpha write lands on the red channel, normalized to RGBA
        // since red is everything the format stores.
        assert_eq!(attachment.color_write_mask, COLOR_COMPONENTS_RGBA);
    }

    #[test]
    fn sample_count_resolution_order() {
        let mut state = GraphicsPipelineState::default();
        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.rasterization_samples, vk::SampleCountFlags::TYPE_1);

        state.rs.sample_count = vk::SampleCountFlags::TYPE_8;
        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.rasterization_samples, vk::SampleCountFlags::TYPE_8);

        state.ms.sample_count = vk::SampleCountFlags::TYPE_4;
        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.rasterization_samples, vk::SampleCountFlags::TYPE_4);
    }

    #[test]
    fn sample_mask_is_truncated_to_sample_count() {
        let mut state = GraphicsPipelineState::default();
        state.ms.sample_count = vk::SampleCountFlags::TYPE_4;
        state.ms.sample_mask = 0xffff;

        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.sample_mask, 0x0f);
    }

    #[test]
    fn sample_rate_shading_follows_shader_flag() {
        let state = GraphicsPipelineState::default();

        let plain = fragment_shader(0b1, ShaderFlags::empty());
        assert!(!FragmentOutputState::new(&state, Some(&plain)).enable_sample_shading);

        let per_sample = fragment_shader(0b1, ShaderFlags::HAS_SAMPLE_RATE_SHADING);
        assert!(FragmentOutputState::new(&state, Some(&per_sample)).enable_sample_shading);
    }

    #[test]
    fn depth_stencil_formats_follow_aspects() {
        let mut state = GraphicsPipelineState::default();
        state.rt.depth_stencil_format = vk::Format::D32_SFLOAT;

        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.depth_format, vk::Format::D32_SFLOAT);
        assert_eq!(fo.stencil_format, vk::Format::UNDEFINED);

        state.rt.depth_stencil_format = vk::Format::D24_UNORM_S8_UINT;
        let fo = FragmentOutputState::new(&state, None);
        assert_eq!(fo.depth_format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(fo.stencil_format, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn disabled_blend_state_is_normalized() {
        let mut state = GraphicsPipelineState::default();
        state.rt.color_formats[0] = vk::Format::R8G8B8A8_UNORM;

        // Leftover factors on a disabled attachment must not affect the
        // equality class.
        state.om_blend[0].blend_enable = false;
        state.om_blend[0].src_color_blend_factor = vk::BlendFactor::DST_ALPHA;

        let fs = fragment_shader(0b1, ShaderFlags::empty());
        let with_garbage = FragmentOutputState::new(&state, Some(&fs));

        state.om_blend[0].src_color_blend_factor = vk::BlendFactor::ONE;
        let clean = FragmentOutputState::new(&state, Some(&fs));

        assert_eq!(with_garbage, clean);
        assert_eq!(hash_of(&with_garbage), hash_of(&clean));
    }

    #[test]
    fn dynamic_blend_constants_copied_verbatim() {
        let mut state = GraphicsPipelineState::default();
        let without = FragmentOutputState::new(&state, None);

        state.rs.dynamic_state |= DynamicStateFlags::BLEND_CONSTANTS;
        let with = FragmentOutputState::new(&state, None);

        assert!(!without.dynamic_blend_constants);
        assert!(with.dynamic_blend_constants);
        assert_ne!(hash_of(&without), hash_of(&with));
    }
}
