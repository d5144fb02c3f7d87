// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The application-facing pipeline state vector.
//!
//! A [`GraphicsPipelineState`] is the full, input-only description of one
//! pipeline configuration: input assembly, vertex layout, rasterization,
//! multisampling, depth-stencil, output merger, render target formats and
//! specialization constants. Equality and hashing cover every bit that
//! influences the compiled pipeline, so two states comparing equal are
//! guaranteed to produce the same GPU-observable behavior.
//!
//! The groups deliberately store plain value types; normalization against
//! shader interfaces happens later, when the state is projected into the
//! four sub-vectors in [`crate::pipeline::graphics`].

use crate::{MAX_RENDER_TARGETS, MAX_SPEC_CONSTANTS};
use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;

/// Topology value of a state vector whose input assembly state was never
/// filled in. Such a state fails validation.
pub const PRIMITIVE_TOPOLOGY_UNDEFINED: vk::PrimitiveTopology =
    vk::PrimitiveTopology::from_raw(0x7fff_ffff);

pub(crate) const COLOR_COMPONENTS_RGBA: vk::ColorComponentFlags =
    vk::ColorComponentFlags::from_raw(0b1111);

bitflags! {
    /// Flags selecting which pieces of otherwise static pipeline state the
    /// command stream supplies dynamically.
    ///
    /// These are part of the state vector so that two configurations which
    /// differ only in dynamic-state usage hash to different pipelines.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DynamicStateFlags: u32 {
        const VERTEX_STRIDES  = 1 << 0;
        const DEPTH_BIAS      = 1 << 1;
        const DEPTH_BOUNDS    = 1 << 2;
        const BLEND_CONSTANTS = 1 << 3;
        const STENCIL_REF     = 1 << 4;
    }
}

/// Input assembly state: how vertices are assembled into primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InputAssemblyState {
    pub primitive_topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub patch_vertex_count: u32,
}

impl Default for InputAssemblyState {
    fn default() -> Self {
        Self {
            primitive_topology: PRIMITIVE_TOPOLOGY_UNDEFINED,
            primitive_restart: false,
            patch_vertex_count: 0,
        }
    }
}

/// One vertex attribute of the input layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// One vertex buffer binding of the input layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
    /// Instance rate divisor. Only meaningful for instance-rate bindings; a
    /// value of one is the default stepping.
    pub divisor: u32,
}

impl Default for VertexBinding {
    fn default() -> Self {
        Self {
            binding: 0,
            stride: 0,
            input_rate: vk::VertexInputRate::VERTEX,
            divisor: 1,
        }
    }
}

/// Rasterization state group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RasterizationState {
    pub polygon_mode: vk::PolygonMode,
    pub depth_bias_enable: bool,
    pub depth_clip_enable: bool,
    pub conservative_mode: vk::ConservativeRasterizationModeEXT,
    /// Sample count forced by the rasterizer. Empty when the state does not
    /// override the render target sample count.
    pub sample_count: vk::SampleCountFlags,
    pub dynamic_state: DynamicStateFlags,
}

impl Default for RasterizationState {
    fn default() -> Self {
        Self {
            polygon_mode: vk::PolygonMode::FILL,
            depth_bias_enable: false,
            depth_clip_enable: true,
            conservative_mode: vk::ConservativeRasterizationModeEXT::DISABLED,
            sample_count: vk::SampleCountFlags::empty(),
            dynamic_state: DynamicStateFlags::empty(),
        }
    }
}

/// Multisample state group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MultisampleState {
    /// Render target sample count. Empty when no render targets are bound
    /// and the rasterizer decides.
    pub sample_count: vk::SampleCountFlags,
    pub sample_mask: u32,
    pub enable_alpha_to_coverage: bool,
}

impl Default for MultisampleState {
    fn default() -> Self {
        Self {
            sample_count: vk::SampleCountFlags::empty(),
            sample_mask: !0u32,
            enable_alpha_to_coverage: false,
        }
    }
}

/// Depth-stencil state group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DepthStencilState {
    pub enable_depth_test: bool,
    pub enable_depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub enable_depth_bounds_test: bool,
    pub enable_stencil_test: bool,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            enable_depth_test: false,
            enable_depth_write: false,
            depth_compare_op: vk::CompareOp::ALWAYS,
            enable_depth_bounds_test: false,
            enable_stencil_test: false,
        }
    }
}

/// Stencil operations for one face.
///
/// The stencil reference value is always dynamic and therefore not part of
/// the state vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StencilOps {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
}

impl StencilOps {
    /// Resolves the face state against the render target's writability, so
    /// that a shared compiled structure reflects whether stencil writes can
    /// actually happen.
    pub fn op_state(&self, writes_enabled: bool) -> StencilOps {
        Self {
            write_mask: if writes_enabled { self.write_mask } else { 0 },
            ..*self
        }
    }
}

impl Default for StencilOps {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: !0u32,
            write_mask: !0u32,
        }
    }
}

impl From<&StencilOps> for vk::StencilOpState {
    fn from(ops: &StencilOps) -> Self {
        Self {
            fail_op: ops.fail_op,
            pass_op: ops.pass_op,
            depth_fail_op: ops.depth_fail_op,
            compare_op: ops.compare_op,
            compare_mask: ops.compare_mask,
            write_mask: ops.write_mask,
            reference: 0,
        }
    }
}

/// Output merger state group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputMergerState {
    pub enable_logic_op: bool,
    pub logic_op: vk::LogicOp,
}

impl Default for OutputMergerState {
    fn default() -> Self {
        Self {
            enable_logic_op: false,
            logic_op: vk::LogicOp::NO_OP,
        }
    }
}

/// Blend state for one render target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttachmentBlendState {
    pub blend_enable: bool,
    pub src_color_blend_factor: vk::BlendFactor,
    pub dst_color_blend_factor: vk::BlendFactor,
    pub color_blend_op: vk::BlendOp,
    pub src_alpha_blend_factor: vk::BlendFactor,
    pub dst_alpha_blend_factor: vk::BlendFactor,
    pub alpha_blend_op: vk::BlendOp,
    pub color_write_mask: vk::ColorComponentFlags,
}

impl AttachmentBlendState {
    /// The normalized state of an attachment slot that is not written at
    /// all: blending off, no components enabled, factors at their defaults
    /// so equality and hashing ignore whatever the application left behind.
    pub(crate) fn unused() -> Self {
        Self {
            color_write_mask: vk::ColorComponentFlags::empty(),
            ..Self::default()
        }
    }

    /// Whether any blend factor of this attachment reads the second color
    /// output of the fragment shader.
    pub fn uses_dual_source_factors(&self) -> bool {
        is_dual_source_blend_factor(self.src_color_blend_factor)
            || is_dual_source_blend_factor(self.dst_color_blend_factor)
            || is_dual_source_blend_factor(self.src_alpha_blend_factor)
            || is_dual_source_blend_factor(self.dst_alpha_blend_factor)
    }
}

impl Default for AttachmentBlendState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: vk::BlendFactor::ONE,
            dst_color_blend_factor: vk::BlendFactor::ZERO,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ZERO,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: COLOR_COMPONENTS_RGBA,
        }
    }
}

impl From<&AttachmentBlendState> for vk::PipelineColorBlendAttachmentState {
    fn from(state: &AttachmentBlendState) -> Self {
        Self {
            blend_enable: state.blend_enable as vk::Bool32,
            src_color_blend_factor: state.src_color_blend_factor,
            dst_color_blend_factor: state.dst_color_blend_factor,
            color_blend_op: state.color_blend_op,
            src_alpha_blend_factor: state.src_alpha_blend_factor,
            dst_alpha_blend_factor: state.dst_alpha_blend_factor,
            alpha_blend_op: state.alpha_blend_op,
            color_write_mask: state.color_write_mask,
        }
    }
}

/// Component remap for one render target.
///
/// Stores, for each channel of the attachment, the index of the source
/// component the shader output is taken from. The identity mapping writes
/// every channel from its own component; anything else requires either
/// shader patching or, for emulated single-component formats, a blend
/// rewrite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorSwizzle {
    r: u8,
    g: u8,
    b: u8,
    a: u8,
}

impl ColorSwizzle {
    pub const IDENTITY: Self = Self {
        r: 0,
        g: 1,
        b: 2,
        a: 3,
    };

    /// Builds a swizzle from source component indices (0 = r .. 3 = a).
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        debug_assert!(r < 4 && g < 4 && b < 4 && a < 4);
        Self { r, g, b, a }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn r_index(&self) -> u32 {
        u32::from(self.r)
    }

    pub fn g_index(&self) -> u32 {
        u32::from(self.g)
    }

    pub fn b_index(&self) -> u32 {
        u32::from(self.b)
    }

    pub fn a_index(&self) -> u32 {
        u32::from(self.a)
    }

    /// Remaps a component write mask from shader output space into
    /// attachment space: channel `c` of the result is enabled if the source
    /// component it reads from is enabled in `mask`.
    pub fn remap_write_mask(&self, mask: vk::ColorComponentFlags) -> vk::ColorComponentFlags {
        let mask = mask.as_raw();
        let mut result = 0u32;

        for (channel, index) in [self.r, self.g, self.b, self.a].into_iter().enumerate() {
            if mask & (1u32 << index) != 0 {
                result |= 1u32 << channel;
            }
        }

        vk::ColorComponentFlags::from_raw(result)
    }
}

impl Default for ColorSwizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Render target format group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderTargetState {
    pub color_formats: [vk::Format; MAX_RENDER_TARGETS],
    pub depth_stencil_format: vk::Format,
    /// Aspects of the bound depth-stencil view that are read-only; writes
    /// to them are disabled regardless of the depth-stencil state.
    pub depth_stencil_readonly_aspects: vk::ImageAspectFlags,
}

impl Default for RenderTargetState {
    fn default() -> Self {
        Self {
            color_formats: [vk::Format::UNDEFINED; MAX_RENDER_TARGETS],
            depth_stencil_format: vk::Format::UNDEFINED,
            depth_stencil_readonly_aspects: vk::ImageAspectFlags::empty(),
        }
    }
}

/// Specialization constant group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpecConstantState {
    pub spec_constants: [u32; MAX_SPEC_CONSTANTS],
}

/// The full, hashable description of one pipeline configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GraphicsPipelineState {
    pub ia: InputAssemblyState,
    pub il_attributes: SmallVec<[VertexAttribute; 8]>,
    pub il_bindings: SmallVec<[VertexBinding; 8]>,
    pub rs: RasterizationState,
    pub ms: MultisampleState,
    pub ds: DepthStencilState,
    pub ds_front: StencilOps,
    pub ds_back: StencilOps,
    pub om: OutputMergerState,
    pub om_blend: [AttachmentBlendState; MAX_RENDER_TARGETS],
    pub om_swizzle: [ColorSwizzle; MAX_RENDER_TARGETS],
    pub rt: RenderTargetState,
    pub sc: SpecConstantState,
}

impl GraphicsPipelineState {
    pub fn use_dynamic_vertex_strides(&self) -> bool {
        self.rs
            .dynamic_state
            .contains(DynamicStateFlags::VERTEX_STRIDES)
    }

    pub fn use_dynamic_depth_bias(&self) -> bool {
        self.rs.dynamic_state.contains(DynamicStateFlags::DEPTH_BIAS)
    }

    pub fn use_dynamic_depth_bounds(&self) -> bool {
        self.rs
            .dynamic_state
            .contains(DynamicStateFlags::DEPTH_BOUNDS)
    }

    pub fn use_dynamic_blend_constants(&self) -> bool {
        self.rs
            .dynamic_state
            .contains(DynamicStateFlags::BLEND_CONSTANTS)
    }

    pub fn use_dynamic_stencil_ref(&self) -> bool {
        self.rs
            .dynamic_state
            .contains(DynamicStateFlags::STENCIL_REF)
    }

    /// Whether the state requests dual-source blending. Only the first
    /// render target can ever read the second color output.
    pub fn use_dual_source_blending(&self) -> bool {
        let cb = &self.om_blend[0];
        cb.blend_enable && cb.uses_dual_source_factors()
    }
}

/// Whether a blend factor reads the second color output.
pub fn is_dual_source_blend_factor(factor: vk::BlendFactor) -> bool {
    matches!(
        factor,
        vk::BlendFactor::SRC1_COLOR
            | vk::BlendFactor::ONE_MINUS_SRC1_COLOR
            | vk::BlendFactor::SRC1_ALPHA
            | vk::BlendFactor::ONE_MINUS_SRC1_ALPHA
    )
}

/// Maps an alpha blend factor to the corresponding color factor, for render
/// targets whose alpha channel is emulated in the red component.
pub fn remap_alpha_to_color_blend_factor(factor: vk::BlendFactor) -> vk::BlendFactor {
    match factor {
        vk::BlendFactor::SRC_ALPHA => vk::BlendFactor::SRC_COLOR,
        vk::BlendFactor::ONE_MINUS_SRC_ALPHA => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        vk::BlendFactor::DST_ALPHA => vk::BlendFactor::DST_COLOR,
        vk::BlendFactor::ONE_MINUS_DST_ALPHA => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        other => other,
    }
}
