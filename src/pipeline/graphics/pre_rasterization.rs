// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The pre-rasterization sub-vector.

use crate::device::DeviceInfo;
use crate::pipeline::state::GraphicsPipelineState;
use crate::shader::Shader;
use ash::vk;

/// Normalized pre-rasterization state: tessellation, polygon and depth
/// handling, transform feedback stream selection and conservative
/// rasterization. The line width is always 1.0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PreRasterizationState {
    pub patch_control_points: u32,
    pub polygon_mode: vk::PolygonMode,
    pub depth_bias_enable: bool,
    pub rasterizer_discard: bool,
    /// Transform feedback stream feeding the rasterizer when it is not the
    /// default stream zero.
    pub xfb_rasterized_stream: u32,
    /// `Some` chains the depth-clip struct; `None` means the extension is
    /// unavailable and clipping is emulated through `depth_clamp_enable`.
    pub depth_clip_enable: Option<bool>,
    pub depth_clamp_enable: bool,
    pub conservative_mode: vk::ConservativeRasterizationModeEXT,
}

impl Default for PreRasterizationState {
    fn default() -> Self {
        Self {
            patch_control_points: 0,
            polygon_mode: vk::PolygonMode::FILL,
            depth_bias_enable: false,
            rasterizer_discard: false,
            xfb_rasterized_stream: 0,
            depth_clip_enable: None,
            depth_clamp_enable: true,
            conservative_mode: vk::ConservativeRasterizationModeEXT::DISABLED,
        }
    }
}

impl PreRasterizationState {
    pub fn new(device: &DeviceInfo, state: &GraphicsPipelineState, gs: Option<&Shader>) -> Self {
        let mut result = Self {
            patch_control_points: state.ia.patch_vertex_count,
            polygon_mode: state.rs.polygon_mode,
            depth_bias_enable: state.rs.depth_bias_enable,
            conservative_mode: state.rs.conservative_mode,
            ..Self::default()
        };

        // Set up the rasterized stream depending on geometry shader state.
        // Rasterizing stream 0 is default behaviour in all situations.
        let stream_index = gs.map_or(0, |gs| gs.info().xfb_rasterized_stream);

        if stream_index > 0 {
            result.xfb_rasterized_stream = stream_index as u32;
        } else if stream_index < 0 {
            result.rasterizer_discard = true;
        }

        // Set up depth clip state. If the extension is not supported, use
        // depth clamp instead, even though this is not accurate.
        if device.features.depth_clip_enable {
            result.depth_clip_enable = Some(state.rs.depth_clip_enable);
        } else {
            result.depth_clamp_enable = !state.rs.depth_clip_enable;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceFeatures;
    use crate::shader::{ShaderFlags, ShaderInfo, SpirvCodeBuffer};
    use std::sync::Arc;

    fn geometry_shader(xfb_rasterized_stream: i32) -> Arc<Shader> {
        Shader::new(
            ShaderInfo {
                stage: vk::ShaderStageFlags::GEOMETRY,
                xfb_rasterized_stream,
                ..ShaderInfo::default()
            },
            ShaderFlags::empty(),
            SpirvCodeBuffer::new(vec![0x0723_0203]),
            "gs",
        )
    }

    fn device_with_depth_clip(depth_clip_enable: bool) -> DeviceInfo {
        DeviceInfo {
            features: DeviceFeatures {
                depth_clip_enable,
                ..DeviceFeatures::default()
            },
            ..DeviceInfo::default()
        }
    }

    #[test]
    fn rasterized_stream_selection() {
        let state = GraphicsPipelineState::default();
        let device = device_with_depth_clip(true);

        let default = PreRasterizationState::new(&device, &state, None);
        assert_eq!(default.xfb_rasterized_stream, 0);
        assert!(!default.rasterizer_discard);

        let stream_two = geometry_shader(2);
        let forwarded = PreRasterizationState::new(&device, &state, Some(&stream_two));
        assert_eq!(forwarded.xfb_rasterized_stream, 2);
        assert!(!forwarded.rasterizer_discard);

        let discard = geometry_shader(-1);
        let discarded = PreRasterizationState::new(&device, &state, Some(&discard));
        assert_eq!(discarded.xfb_rasterized_stream, 0);
        assert!(discarded.rasterizer_discard);
    }

    #[test]
    fn depth_clip_prefers_the_extension() {
        let mut state = GraphicsPipelineState::default();
        state.rs.depth_clip_enable = false;

        let with_ext = PreRasterizationState::new(&device_with_depth_clip(true), &state, None);
        assert_eq!(with_ext.depth_clip_enable, Some(false));
        assert!(with_ext.depth_clamp_enable);

        // Without the extension, clipping is emulated by inverting clamp.
        let emulated = PreRasterizationState::new(&device_with_depth_clip(false), &state, None);
        assert_eq!(emulated.depth_clip_enable, None);
        assert!(emulated.depth_clamp_enable);

        state.rs.depth_clip_enable = true;
        let emulated = PreRasterizationState::new(&device_with_depth_clip(false), &state, None);
        assert!(!emulated.depth_clamp_enable);
    }

    #[test]
    fn fixed_function_fields_are_copied() {
        let mut state = GraphicsPipelineState::default();
        state.ia.patch_vertex_count = 3;
        state.rs.polygon_mode = vk::PolygonMode::LINE;
        state.rs.depth_bias_enable = true;
        state.rs.conservative_mode = vk::ConservativeRasterizationModeEXT::OVERESTIMATE;

        let pr = PreRasterizationState::new(&device_with_depth_clip(true), &state, None);

        assert_eq!(pr.patch_control_points, 3);
        assert_eq!(pr.polygon_mode, vk::PolygonMode::LINE);
        assert!(pr.depth_bias_enable);
        assert_eq!(
            pr.conservative_mode,
            vk::ConservativeRasterizationModeEXT::OVERESTIMATE
        );
    }
}
