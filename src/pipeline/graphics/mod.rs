// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Graphics pipeline objects and their per-state pipeline caches.
//!
//! A [`GraphicsPipeline`] exists once per unique shader set and owns every
//! compiled variant for it. State vectors are deduplicated into an
//! append-only instance list that render threads scan without taking a
//! lock; a per-pipeline mutex only serializes the creation of new
//! instances. Each instance tracks up to two handles: a *base* pipeline
//! linked from pre-compiled libraries, handed out immediately, and a *fast*
//! optimized pipeline published by a background worker once compiled.

use crate::device::Device;
use crate::pipeline::cache::{StateCache, StateCacheKey};
use crate::pipeline::layout::{BindingLayout, GlobalBarrier};
use crate::pipeline::library::{ShaderPipelineLibrary, ShaderPipelineLibraryArgs};
use crate::pipeline::manager::{PipelineLibraryCache, PipelineManager, PipelineStats};
use crate::pipeline::state::{GraphicsPipelineState, PRIMITIVE_TOPOLOGY_UNDEFINED};
use crate::pipeline::worker::PipelineWorkers;
use crate::shader::{
    GraphicsShaderSet, Shader, ShaderFlags, ShaderPatchInfo, ShaderStageInfo, SpecConstantData,
    SpirvCodeBuffer,
};
use crate::sync::AppendList;
use crate::{MAX_RENDER_TARGETS, MAX_VERTEX_ATTRIBUTES, MAX_VERTEX_BINDINGS};
use ash::vk;
use ash::vk::Handle;
use bitflags::bitflags;
use log::error;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt::Write;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub use self::fragment_output::{FragmentOutputLibrary, FragmentOutputState};
pub use self::fragment_shader::FragmentShaderState;
pub use self::pre_rasterization::PreRasterizationState;
pub use self::vertex_input::{VertexInputLibrary, VertexInputState};

pub mod fragment_output;
pub mod fragment_shader;
pub mod pre_rasterization;
pub mod vertex_input;

bitflags! {
    /// Properties of a graphics pipeline derived from its shader set.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GraphicsPipelineFlags: u32 {
        const HAS_TRANSFORM_FEEDBACK  = 1 << 0;
        const HAS_RASTERIZER_DISCARD  = 1 << 1;
        const HAS_STORAGE_DESCRIPTORS = 1 << 2;
    }
}

/// Which variant of a pipeline a handle refers to.
///
/// Callers must tolerate the same state returning a `Base` handle first and
/// a different `Fast` handle on a later lookup; handles must not be cached
/// across lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphicsPipelineKind {
    /// Monolithic pipeline, fully optimized for the state vector.
    Fast,
    /// Pipeline linked from libraries; quick to create, slower to execute.
    Base,
}

/// A cached pipeline variant pair for one state vector.
///
/// The record itself never moves or disappears while the owning pipeline
/// lives; all mutation happens through the atomic handle fields.
pub struct GraphicsPipelineInstance {
    state: GraphicsPipelineState,
    base_handle: AtomicU64,
    fast_handle: AtomicU64,
    is_compiling: AtomicBool,
}

impl GraphicsPipelineInstance {
    fn new(state: GraphicsPipelineState, base: vk::Pipeline, fast: vk::Pipeline) -> Self {
        Self {
            state,
            base_handle: AtomicU64::new(base.as_raw()),
            fast_handle: AtomicU64::new(fast.as_raw()),
            is_compiling: AtomicBool::new(false),
        }
    }

    pub fn base_handle(&self) -> vk::Pipeline {
        vk::Pipeline::from_raw(self.base_handle.load(Ordering::Acquire))
    }

    pub fn fast_handle(&self) -> vk::Pipeline {
        vk::Pipeline::from_raw(self.fast_handle.load(Ordering::Acquire))
    }

    fn set_fast_handle(&self, handle: vk::Pipeline) {
        self.fast_handle.store(handle.as_raw(), Ordering::Release);
    }

    /// Elects the calling thread as the single compiler of this instance.
    fn begin_compile(&self) -> bool {
        !self.is_compiling.load(Ordering::Relaxed)
            && !self.is_compiling.swap(true, Ordering::Acquire)
    }
}

/// Key identifying one linked base pipeline: the two state libraries plus
/// the arguments the shader libraries were specialized for.
struct BaseInstanceKey {
    vi_library: Arc<VertexInputLibrary>,
    fo_library: Arc<FragmentOutputLibrary>,
    args: ShaderPipelineLibraryArgs,
}

struct BaseInstance {
    key: BaseInstanceKey,
    handle: vk::Pipeline,
}

/// A graphics pipeline object: one shader set and every pipeline variant
/// compiled for it.
pub struct GraphicsPipeline {
    device: Arc<Device>,
    libraries: Arc<PipelineLibraryCache>,
    workers: Arc<PipelineWorkers>,
    state_cache: Arc<StateCache>,
    stats: Arc<PipelineStats>,

    shaders: GraphicsShaderSet,
    bindings: Arc<BindingLayout>,
    vs_library: Option<Arc<ShaderPipelineLibrary>>,
    fs_library: Option<Arc<ShaderPipelineLibrary>>,

    flags: GraphicsPipelineFlags,
    barrier: GlobalBarrier,

    instances: AppendList<GraphicsPipelineInstance>,
    base_instances: AppendList<BaseInstance>,
    mutex: Mutex<()>,
}

impl GraphicsPipeline {
    pub fn new(
        device: Arc<Device>,
        manager: &PipelineManager,
        shaders: GraphicsShaderSet,
        bindings: Arc<BindingLayout>,
        vs_library: Option<Arc<ShaderPipelineLibrary>>,
        fs_library: Option<Arc<ShaderPipelineLibrary>>,
    ) -> Arc<Self> {
        let mut flags = GraphicsPipelineFlags::empty();
        let mut barrier = bindings.global_barrier();

        if let Some(gs) = &shaders.gs {
            if gs.flags().contains(ShaderFlags::HAS_TRANSFORM_FEEDBACK) {
                flags |= GraphicsPipelineFlags::HAS_TRANSFORM_FEEDBACK;

                barrier.stages |= vk::PipelineStageFlags::DRAW_INDIRECT
                    | vk::PipelineStageFlags::TRANSFORM_FEEDBACK_EXT;
                barrier.access |= vk::AccessFlags::TRANSFORM_FEEDBACK_COUNTER_READ_EXT
                    | vk::AccessFlags::TRANSFORM_FEEDBACK_COUNTER_WRITE_EXT
                    | vk::AccessFlags::TRANSFORM_FEEDBACK_WRITE_EXT;
            }

            if gs.info().xfb_rasterized_stream < 0 {
                flags |= GraphicsPipelineFlags::HAS_RASTERIZER_DISCARD;
            }
        }

        if barrier.access.contains(vk::AccessFlags::SHADER_WRITE) {
            flags |= GraphicsPipelineFlags::HAS_STORAGE_DESCRIPTORS;
        }

        Arc::new(Self {
            device,
            libraries: manager.library_cache(),
            workers: manager.workers(),
            state_cache: manager.state_cache(),
            stats: manager.stats_handle(),
            shaders,
            bindings,
            vs_library,
            fs_library,
            flags,
            barrier,
            instances: AppendList::new(),
            base_instances: AppendList::new(),
            mutex: Mutex::new(()),
        })
    }

    pub fn shaders(&self) -> &GraphicsShaderSet {
        &self.shaders
    }

    pub fn flags(&self) -> GraphicsPipelineFlags {
        self.flags
    }

    /// Returns the barrier covering every resource a draw with the given
    /// state may access through this pipeline.
    pub fn global_barrier(&self, state: &GraphicsPipelineState) -> GlobalBarrier {
        let mut barrier = self.barrier;

        if !state.il_bindings.is_empty() {
            barrier.stages |= vk::PipelineStageFlags::VERTEX_INPUT;
            barrier.access |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
        }

        barrier
    }

    /// Returns the best pipeline handle currently available for the given
    /// state, creating an instance on first use.
    ///
    /// A null handle with kind [`GraphicsPipelineKind::Fast`] means the
    /// state vector is invalid and the draw must be skipped.
    pub fn get_handle(
        self: &Arc<Self>,
        state: &GraphicsPipelineState,
    ) -> (vk::Pipeline, GraphicsPipelineKind) {
        let instance = match self.find_instance(state) {
            Some(instance) => instance,
            None => {
                // Exit early if the state vector is invalid
                if !self.validate_state(state, true) {
                    return (vk::Pipeline::null(), GraphicsPipelineKind::Fast);
                }

                // Prevent other threads from adding new instances and
                // check again
                let _lock = self.mutex.lock();

                match self.find_instance(state) {
                    Some(instance) => instance,
                    None => {
                        // Keep the pipeline locked during creation; at
                        // worst a state cache worker stalls while the
                        // render thread takes priority.
                        let can_base = self.can_create_base_pipeline(state);
                        let instance = self.create_instance(state, can_base);

                        // If necessary, compile an optimized variant in
                        // the background
                        if instance.fast_handle() == vk::Pipeline::null() {
                            self.workers
                                .compile_graphics_pipeline(Arc::clone(self), state.clone());
                        }

                        // Only store pipelines in the state cache that
                        // cannot be fast-linked; linking is cheap enough
                        // to redo every run.
                        if !can_base {
                            self.write_state_to_cache(state);
                        }

                        instance
                    }
                }
            }
        };

        // Use the optimized variant where available, the slower base
        // pipeline otherwise.
        let fast_handle = instance.fast_handle();

        if fast_handle != vk::Pipeline::null() {
            (fast_handle, GraphicsPipelineKind::Fast)
        } else {
            (instance.base_handle(), GraphicsPipelineKind::Base)
        }
    }

    /// Compiles the optimized pipeline for the given state. Intended for
    /// worker threads and for replaying the on-disk state cache.
    pub fn compile(&self, state: &GraphicsPipelineState) {
        let instance = match self.find_instance(state) {
            Some(instance) => instance,
            None => {
                // State vectors reaching this point come from the cache
                // and are untrusted
                if !self.validate_state(state, false) {
                    return;
                }

                // Do not compile if this pipeline can be fast-linked; such
                // states are not worth caching in the first place.
                if self.can_create_base_pipeline(state) {
                    return;
                }

                let _lock = self.mutex.lock();

                match self.find_instance(state) {
                    Some(instance) => instance,
                    None => self.create_instance(state, false),
                }
            }
        };

        // Nothing to do if an optimized variant already exists
        if instance.fast_handle() != vk::Pipeline::null() {
            return;
        }

        // Exit if another thread is already compiling an optimized
        // version of this pipeline
        if !instance.begin_compile() {
            return;
        }

        let pipeline = self.create_optimized_pipeline(state, vk::PipelineCreateFlags::empty());
        instance.set_fast_handle(pipeline);

        if pipeline == vk::Pipeline::null() {
            self.log_state(log::Level::Error, state);
        }
    }

    /// Looks up the instance for a state vector. Lock-free; creation of new
    /// instances is serialized by the pipeline mutex, so a miss here is
    /// only conclusive while that mutex is held.
    pub fn find_instance(&self, state: &GraphicsPipelineState) -> Option<&GraphicsPipelineInstance> {
        self.instances
            .iter()
            .find(|instance| instance.state == *state)
    }

    fn create_instance(
        &self,
        state: &GraphicsPipelineState,
        can_base: bool,
    ) -> &GraphicsPipelineInstance {
        let mut base_handle = vk::Pipeline::null();
        let mut fast_handle = vk::Pipeline::null();

        if can_base {
            // Try to create an optimized pipeline from the driver cache
            // first, since this is expected to be the fastest path.
            if self.device.can_use_pipeline_cache_control() {
                fast_handle = self.create_optimized_pipeline(
                    state,
                    vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED,
                );
            }

            if fast_handle == vk::Pipeline::null() {
                // If that didn't succeed, link a pipeline using the
                // pre-compiled fragment and vertex shader libraries.
                let vi_state = VertexInputState::new(state, &self.shaders.vs);
                let fo_state = FragmentOutputState::new(state, self.shaders.fs.as_deref());

                let vi_library = self.libraries.create_vertex_input_library(&vi_state);
                let fo_library = self.libraries.create_fragment_output_library(&fo_state);

                match (vi_library, fo_library) {
                    (Ok(vi_library), Ok(fo_library)) => {
                        let key = BaseInstanceKey {
                            vi_library,
                            fo_library,
                            args: ShaderPipelineLibraryArgs {
                                depth_clip_enable: state.rs.depth_clip_enable,
                            },
                        };

                        base_handle = self.create_base_instance(key).handle;
                    }
                    (vi_library, fo_library) => {
                        for err in [vi_library.err(), fo_library.err()].into_iter().flatten() {
                            error!("{}", err);
                        }
                    }
                }
            }
        } else {
            // Create the optimized variant right away, no choice
            fast_handle = self.create_optimized_pipeline(state, vk::PipelineCreateFlags::empty());
        }

        if fast_handle == vk::Pipeline::null() && base_handle == vk::Pipeline::null() {
            self.log_state(log::Level::Error, state);
        }

        self.stats
            .num_graphics_pipelines
            .fetch_add(1, Ordering::Relaxed);

        self.instances
            .push(GraphicsPipelineInstance::new(state.clone(), base_handle, fast_handle))
    }

    fn create_base_instance(&self, key: BaseInstanceKey) -> &BaseInstance {
        // Callers hold the pipeline mutex, so the scan cannot race an
        // append of the same key
        for instance in self.base_instances.iter() {
            if Arc::ptr_eq(&instance.key.vi_library, &key.vi_library)
                && Arc::ptr_eq(&instance.key.fo_library, &key.fo_library)
                && instance.key.args == key.args
            {
                return instance;
            }
        }

        let handle = self.create_base_pipeline(&key);
        self.base_instances.push(BaseInstance { key, handle })
    }

    fn can_create_base_pipeline(&self, state: &GraphicsPipelineState) -> bool {
        if self.vs_library.is_none() || self.fs_library.is_none() {
            return false;
        }

        base_pipeline_compatible(&self.shaders, state)
    }

    fn create_base_pipeline(&self, key: &BaseInstanceKey) -> vk::Pipeline {
        let (vs_library, fs_library) = match (&self.vs_library, &self.fs_library) {
            (Some(vs_library), Some(fs_library)) => (vs_library, fs_library),
            _ => return vk::Pipeline::null(),
        };

        let libraries = [
            key.vi_library.handle(),
            vs_library.pipeline_handle(key.args),
            fs_library.pipeline_handle(key.args),
            key.fo_library.handle(),
        ];

        let lib_info = vk::PipelineLibraryCreateInfoKHR {
            library_count: libraries.len() as u32,
            p_libraries: libraries.as_ptr(),
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            p_next: &lib_info as *const _ as *const _,
            layout: self.bindings.pipeline_layout(true),
            base_pipeline_index: -1,
            ..Default::default()
        };

        match self.device.create_graphics_pipeline(&info) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                error!("Failed to link base pipeline: {}", err);
                vk::Pipeline::null()
            }
        }
    }

    fn create_optimized_pipeline(
        &self,
        state: &GraphicsPipelineState,
        flags: vk::PipelineCreateFlags,
    ) -> vk::Pipeline {
        // Set up dynamic state as the state vector demands
        let dynamic_states = optimized_dynamic_states(state, self.flags);

        let dy_info = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let spec_data = SpecConstantData::new(&state.sc.spec_constants);
        let spec_info = spec_data.spec_info();

        // Build stage info for all provided shaders. Cached lookups use
        // module identifiers, everything else passes patched code.
        let mut stage_info = ShaderStageInfo::new();

        if flags.contains(vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED) {
            let vs_library = match &self.vs_library {
                Some(vs_library) => vs_library,
                None => return vk::Pipeline::null(),
            };

            stage_info.add_stage_with_identifier(
                vk::ShaderStageFlags::VERTEX,
                vs_library.module_identifier(),
                &spec_info,
            );

            if self.shaders.fs.is_some() {
                let fs_library = match &self.fs_library {
                    Some(fs_library) => fs_library,
                    None => return vk::Pipeline::null(),
                };

                stage_info.add_stage_with_identifier(
                    vk::ShaderStageFlags::FRAGMENT,
                    fs_library.module_identifier(),
                    &spec_info,
                );
            }
        } else {
            stage_info.add_stage(
                vk::ShaderStageFlags::VERTEX,
                self.shader_code(&self.shaders.vs, state),
                &spec_info,
            );

            if let Some(tcs) = &self.shaders.tcs {
                stage_info.add_stage(
                    vk::ShaderStageFlags::TESSELLATION_CONTROL,
                    self.shader_code(tcs, state),
                    &spec_info,
                );
            }

            if let Some(tes) = &self.shaders.tes {
                stage_info.add_stage(
                    vk::ShaderStageFlags::TESSELLATION_EVALUATION,
                    self.shader_code(tes, state),
                    &spec_info,
                );
            }

            if let Some(gs) = &self.shaders.gs {
                stage_info.add_stage(
                    vk::ShaderStageFlags::GEOMETRY,
                    self.shader_code(gs, state),
                    &spec_info,
                );
            }

            if let Some(fs) = &self.shaders.fs {
                stage_info.add_stage(
                    vk::ShaderStageFlags::FRAGMENT,
                    self.shader_code(fs, state),
                    &spec_info,
                );
            }
        }

        let vi_state = VertexInputState::new(state, &self.shaders.vs);
        let pr_state =
            PreRasterizationState::new(self.device.info(), state, self.shaders.gs.as_deref());
        let fs_state = FragmentShaderState::new(state);
        let fo_state = FragmentOutputState::new(state, self.shaders.fs.as_deref());

        // Vertex input state
        let vi_bindings_vk: SmallVec<[vk::VertexInputBindingDescription; 8]> = vi_state
            .bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect();

        let vi_attributes_vk: SmallVec<[vk::VertexInputAttributeDescription; 8]> = vi_state
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();

        let vi_divisors_vk: SmallVec<[vk::VertexInputBindingDivisorDescriptionEXT; 8]> = vi_state
            .divisors
            .iter()
            .map(|divisor| vk::VertexInputBindingDivisorDescriptionEXT {
                binding: divisor.binding,
                divisor: divisor.divisor,
            })
            .collect();

        let mut vi_info = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: vi_bindings_vk.len() as u32,
            p_vertex_binding_descriptions: vi_bindings_vk.as_ptr(),
            vertex_attribute_description_count: vi_attributes_vk.len() as u32,
            p_vertex_attribute_descriptions: vi_attributes_vk.as_ptr(),
            ..Default::default()
        };

        let mut vi_divisor_info_vk = None;

        if !vi_divisors_vk.is_empty()
            && self.device.features().vertex_attribute_instance_rate_divisor
        {
            let divisor_info =
                vi_divisor_info_vk.insert(vk::PipelineVertexInputDivisorStateCreateInfoEXT {
                    vertex_binding_divisor_count: vi_divisors_vk.len() as u32,
                    p_vertex_binding_divisors: vi_divisors_vk.as_ptr(),
                    ..Default::default()
                });

            vi_info.p_next = divisor_info as *const _ as _;
        }

        let ia_info = vk::PipelineInputAssemblyStateCreateInfo {
            topology: vi_state.primitive_topology,
            primitive_restart_enable: vi_state.primitive_restart as vk::Bool32,
            ..Default::default()
        };

        let ts_info = vk::PipelineTessellationStateCreateInfo {
            patch_control_points: pr_state.patch_control_points,
            ..Default::default()
        };

        // Viewport and scissor counts are always dynamic
        let vp_info = vk::PipelineViewportStateCreateInfo::default();

        // Rasterization state with its extension chain
        let mut rs_info = vk::PipelineRasterizationStateCreateInfo {
            depth_clamp_enable: pr_state.depth_clamp_enable as vk::Bool32,
            rasterizer_discard_enable: pr_state.rasterizer_discard as vk::Bool32,
            polygon_mode: pr_state.polygon_mode,
            depth_bias_enable: pr_state.depth_bias_enable as vk::Bool32,
            line_width: 1.0,
            ..Default::default()
        };

        let mut rs_xfb_stream_info = None;

        if pr_state.xfb_rasterized_stream > 0 {
            let stream_info =
                rs_xfb_stream_info.insert(vk::PipelineRasterizationStateStreamCreateInfoEXT {
                    rasterization_stream: pr_state.xfb_rasterized_stream,
                    ..Default::default()
                });

            stream_info.p_next = rs_info.p_next as _;
            rs_info.p_next = stream_info as *const _ as _;
        }

        let mut rs_depth_clip_info = None;

        if let Some(depth_clip_enable) = pr_state.depth_clip_enable {
            let depth_clip_info =
                rs_depth_clip_info.insert(vk::PipelineRasterizationDepthClipStateCreateInfoEXT {
                    depth_clip_enable: depth_clip_enable as vk::Bool32,
                    ..Default::default()
                });

            depth_clip_info.p_next = rs_info.p_next as _;
            rs_info.p_next = depth_clip_info as *const _ as _;
        }

        let mut rs_conservative_info = None;

        if pr_state.conservative_mode != vk::ConservativeRasterizationModeEXT::DISABLED {
            let conservative_info = rs_conservative_info.insert(
                vk::PipelineRasterizationConservativeStateCreateInfoEXT {
                    conservative_rasterization_mode: pr_state.conservative_mode,
                    extra_primitive_overestimation_size: 0.0,
                    ..Default::default()
                },
            );

            conservative_info.p_next = rs_info.p_next as _;
            rs_info.p_next = conservative_info as *const _ as _;
        }

        // Multisample state
        let sample_mask: vk::SampleMask = fo_state.sample_mask;

        let ms_info = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: fo_state.rasterization_samples,
            sample_shading_enable: fo_state.enable_sample_shading as vk::Bool32,
            min_sample_shading: if fo_state.enable_sample_shading { 1.0 } else { 0.0 },
            p_sample_mask: &sample_mask,
            alpha_to_coverage_enable: fo_state.enable_alpha_to_coverage as vk::Bool32,
            ..Default::default()
        };

        // Depth-stencil state
        let ds_info = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: fs_state.enable_depth_test as vk::Bool32,
            depth_write_enable: fs_state.enable_depth_write as vk::Bool32,
            depth_compare_op: fs_state.depth_compare_op,
            depth_bounds_test_enable: fs_state.enable_depth_bounds_test as vk::Bool32,
            stencil_test_enable: fs_state.enable_stencil_test as vk::Bool32,
            front: (&fs_state.front).into(),
            back: (&fs_state.back).into(),
            ..Default::default()
        };

        // Color blend state
        let cb_attachments_vk: SmallVec<[vk::PipelineColorBlendAttachmentState; 8]> =
            fo_state.attachments.iter().map(Into::into).collect();

        let cb_info = vk::PipelineColorBlendStateCreateInfo {
            logic_op_enable: fo_state.enable_logic_op as vk::Bool32,
            logic_op: fo_state.logic_op,
            attachment_count: cb_attachments_vk.len() as u32,
            p_attachments: cb_attachments_vk.as_ptr(),
            ..Default::default()
        };

        let rendering_info = vk::PipelineRenderingCreateInfo {
            color_attachment_count: fo_state.color_formats.len() as u32,
            p_color_attachment_formats: fo_state.color_formats.as_ptr(),
            depth_attachment_format: fo_state.depth_format,
            stencil_attachment_format: fo_state.stencil_format,
            ..Default::default()
        };

        let mut info = vk::GraphicsPipelineCreateInfo {
            p_next: &rendering_info as *const _ as *const _,
            flags,
            stage_count: stage_info.stage_count(),
            p_stages: stage_info.stage_infos().as_ptr(),
            p_vertex_input_state: &vi_info,
            p_input_assembly_state: &ia_info,
            p_tessellation_state: &ts_info,
            p_viewport_state: &vp_info,
            p_rasterization_state: &rs_info,
            p_multisample_state: &ms_info,
            p_depth_stencil_state: &ds_info,
            p_color_blend_state: &cb_info,
            p_dynamic_state: &dy_info,
            layout: self.bindings.pipeline_layout(false),
            base_pipeline_index: -1,
            ..Default::default()
        };

        if pr_state.patch_control_points == 0 {
            info.p_tessellation_state = ptr::null();
        }

        match self.device.create_graphics_pipeline(&info) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                // Ignore errors from cached lookups; a miss there just
                // means the optimized variant gets compiled the slow way.
                if !flags.contains(vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED) {
                    error!("Failed to compile optimized pipeline: {}", err);
                }

                vk::Pipeline::null()
            }
        }
    }

    fn shader_code(&self, shader: &Arc<Shader>, state: &GraphicsPipelineState) -> SpirvCodeBuffer {
        let patch = stage_patch_info(&self.shaders, shader, state);
        shader.get_code(&self.bindings, &patch)
    }

    fn validate_state(&self, state: &GraphicsPipelineState, trusted: bool) -> bool {
        if !validate_state_fast(&self.shaders, state) {
            return false;
        }

        // Exit here on the fast path; thorough validation only applies to
        // state vectors from an untrusted source, i.e. the cache
        if trusted {
            return true;
        }

        if !self.shaders.validate() {
            error!("Invalid pipeline: Shader types do not match stage");
            return false;
        }

        if !validate_vertex_layout(state) {
            return false;
        }

        for attribute in &state.il_attributes {
            let format_info = self.device.format_properties(attribute.format);

            if !format_info
                .buffer_features
                .contains(vk::FormatFeatureFlags::VERTEX_BUFFER)
            {
                error!(
                    "Invalid pipeline: Format {:?} not supported for vertex buffers",
                    attribute.format
                );
                return false;
            }
        }

        if state.rs.conservative_mode != vk::ConservativeRasterizationModeEXT::DISABLED {
            if !self.device.info().extensions.ext_conservative_rasterization {
                error!("Conservative rasterization not supported by device");
                return false;
            }

            if state.rs.conservative_mode == vk::ConservativeRasterizationModeEXT::UNDERESTIMATE
                && !self
                    .device
                    .info()
                    .properties
                    .conservative_primitive_underestimation
            {
                error!("Primitive underestimation not supported by device");
                return false;
            }
        }

        if state.ds.enable_depth_bounds_test && !self.device.features().depth_bounds {
            error!("Depth bounds not supported by device");
            return false;
        }

        let depth_format = state.rt.depth_stencil_format;

        if depth_format != vk::Format::UNDEFINED {
            let format_info = self.device.format_properties(depth_format);

            if !format_info
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
            {
                error!(
                    "Format {:?} not supported as depth-stencil attachment",
                    depth_format
                );
                return false;
            }
        }

        for &color_format in &state.rt.color_formats {
            if color_format != vk::Format::UNDEFINED {
                let format_info = self.device.format_properties(color_format);

                if !format_info
                    .optimal_tiling_features
                    .contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT)
                {
                    error!("Format {:?} not supported as color attachment", color_format);
                    return false;
                }
            }
        }

        true
    }

    fn write_state_to_cache(&self, state: &GraphicsPipelineState) {
        let key = StateCacheKey::for_shaders(&self.shaders);
        self.state_cache.add_graphics_pipeline(key, state);
    }

    fn log_state(&self, level: log::Level, state: &GraphicsPipelineState) {
        let mut msg = String::new();

        let _ = writeln!(msg, "Shader stages:");
        let _ = writeln!(msg, "  vs  : {}", self.shaders.vs.debug_name());

        for (name, shader) in [
            ("tcs", &self.shaders.tcs),
            ("tes", &self.shaders.tes),
            ("gs ", &self.shaders.gs),
            ("fs ", &self.shaders.fs),
        ] {
            if let Some(shader) = shader {
                let _ = writeln!(msg, "  {} : {}", name, shader.debug_name());
            }
        }

        // Input assembly state
        let topology = state.ia.primitive_topology;
        let _ = write!(msg, "Primitive topology: {:?}", topology);

        if topology == vk::PrimitiveTopology::PATCH_LIST {
            let _ = writeln!(msg, " [{}]", state.ia.patch_vertex_count);
        } else {
            let _ = writeln!(
                msg,
                " [restart: {}]",
                if state.ia.primitive_restart { "yes" } else { "no" }
            );
        }

        // Vertex input state
        for binding in &state.il_bindings {
            let _ = writeln!(msg, "Vertex binding {} [{}]", binding.binding, binding.stride);

            for attribute in &state.il_attributes {
                if attribute.binding == binding.binding {
                    let _ = writeln!(
                        msg,
                        "  {} [{}]: {:?}",
                        attribute.location, attribute.offset, attribute.format
                    );
                }
            }
        }

        // Rasterizer state
        let _ = writeln!(msg, "Rasterizer state:");
        let _ = writeln!(
            msg,
            "  depth clip:      {}",
            if state.rs.depth_clip_enable { "yes" } else { "no" }
        );
        let _ = writeln!(
            msg,
            "  depth bias:      {}",
            if state.rs.depth_bias_enable { "yes" } else { "no" }
        );
        let _ = writeln!(msg, "  polygon mode:    {:?}", state.rs.polygon_mode);
        let _ = writeln!(
            msg,
            "  conservative:    {}",
            if state.rs.conservative_mode == vk::ConservativeRasterizationModeEXT::DISABLED {
                "no"
            } else {
                "yes"
            }
        );

        // Multisample state
        let sample_count = if !state.ms.sample_count.is_empty() {
            state.ms.sample_count
        } else if !state.rs.sample_count.is_empty() {
            state.rs.sample_count
        } else {
            vk::SampleCountFlags::TYPE_1
        };

        let _ = writeln!(
            msg,
            "Sample count: {} [0x{:x}]",
            sample_count.as_raw(),
            state.ms.sample_mask
        );
        let _ = writeln!(
            msg,
            "  alphaToCoverage: {}",
            if state.ms.enable_alpha_to_coverage { "yes" } else { "no" }
        );

        // Depth-stencil state
        if state.ds.enable_depth_test {
            let _ = writeln!(
                msg,
                "Depth test:        yes [write: {}, op: {:?}]",
                if state.ds.enable_depth_write { "yes" } else { "no" },
                state.ds.depth_compare_op
            );
        } else {
            let _ = writeln!(msg, "Depth test:        no");
        }

        let _ = writeln!(
            msg,
            "Depth bounds test: {}",
            if state.ds.enable_depth_bounds_test { "yes" } else { "no" }
        );
        let _ = writeln!(
            msg,
            "Stencil test:      {}",
            if state.ds.enable_stencil_test { "yes" } else { "no" }
        );

        if state.ds.enable_stencil_test {
            for (name, ops) in [("front", &state.ds_front), ("back ", &state.ds_back)] {
                let _ = writeln!(
                    msg,
                    "  {}: [c=0x{:x},w=0x{:x},op={:?}] fail={:?},pass={:?},depthFail={:?}",
                    name,
                    ops.compare_mask,
                    ops.write_mask,
                    ops.compare_op,
                    ops.fail_op,
                    ops.pass_op,
                    ops.depth_fail_op
                );
            }
        }

        // Logic op state
        if state.om.enable_logic_op {
            let _ = writeln!(msg, "Logic op:          yes [{:?}]", state.om.logic_op);
        } else {
            let _ = writeln!(msg, "Logic op:          no");
        }

        // Render target and blend state
        let depth_format = state.rt.depth_stencil_format;

        if depth_format != vk::Format::UNDEFINED {
            let writable_aspects = crate::format::lookup_format_info(depth_format)
                .map(|info| info.aspect_mask & !state.rt.depth_stencil_readonly_aspects)
                .unwrap_or_default();

            let _ = writeln!(
                msg,
                "Depth attachment: {:?} [{}{}]",
                depth_format,
                if writable_aspects.contains(vk::ImageAspectFlags::DEPTH) { "d" } else { " " },
                if writable_aspects.contains(vk::ImageAspectFlags::STENCIL) { "s" } else { " " },
            );
        } else {
            let _ = writeln!(msg, "Depth attachment: {:?}", depth_format);
        }

        let mut has_color_attachments = false;

        for i in 0..MAX_RENDER_TARGETS {
            let format = state.rt.color_formats[i];

            if format == vk::Format::UNDEFINED {
                continue;
            }

            if !has_color_attachments {
                let _ = writeln!(msg, "Color attachments:");
                has_color_attachments = true;
            }

            let components = b"rgba";
            let blend = &state.om_blend[i];
            let swizzle = &state.om_swizzle[i];

            let write_mask = blend.color_write_mask.as_raw();
            let channel = |index: u32| {
                if write_mask & (1u32 << index) != 0 {
                    components[index as usize] as char
                } else {
                    ' '
                }
            };

            let _ = write!(
                msg,
                "  {}: {:?} [{}{}{}{}] blend: ",
                i,
                format,
                channel(swizzle.r_index()),
                channel(swizzle.g_index()),
                channel(swizzle.b_index()),
                channel(swizzle.a_index()),
            );

            if blend.blend_enable {
                let _ = writeln!(
                    msg,
                    "yes (c:{:?},{:?},{:?};a:{:?},{:?},{:?})",
                    blend.src_color_blend_factor,
                    blend.dst_color_blend_factor,
                    blend.color_blend_op,
                    blend.src_alpha_blend_factor,
                    blend.dst_alpha_blend_factor,
                    blend.alpha_blend_op
                );
            } else {
                let _ = writeln!(msg, "no");
            }
        }

        // Spec constants
        let mut has_spec_constants = false;

        for (i, &value) in state.sc.spec_constants.iter().enumerate() {
            if value != 0 {
                if !has_spec_constants {
                    let _ = writeln!(msg, "Specialization constants:");
                    has_spec_constants = true;
                }

                let _ = writeln!(msg, "  {}: 0x{:08x}", i, value);
            }
        }

        log::log!(level, "{}", msg);
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        // Base handles are owned by the base instance records; instances
        // only own their optimized variant.
        for instance in self.instances.iter() {
            self.device.destroy_pipeline(instance.fast_handle());
        }

        for base_instance in self.base_instances.iter() {
            self.device.destroy_pipeline(base_instance.handle);
        }
    }
}

/// Whether the library-linked fast path can serve the given shader set and
/// state. Anything the libraries cannot express dynamically falls back to
/// the optimized path.
pub(crate) fn base_pipeline_compatible(
    shaders: &GraphicsShaderSet,
    state: &GraphicsPipelineState,
) -> bool {
    // Certain rasterization states cannot be set dynamically, so the
    // libraries assume defaults for them, most notably the polygon mode
    // and conservative rasterization settings
    if state.rs.polygon_mode != vk::PolygonMode::FILL
        || state.rs.conservative_mode != vk::ConservativeRasterizationModeEXT::DISABLED
    {
        return false;
    }

    if let Some(fs) = &shaders.fs {
        // If the fragment shader has inputs not produced by the vertex
        // shader, the fragment shader needs to be patched
        let vs_io_mask = shaders.vs.info().output_mask;
        let fs_io_mask = fs.info().input_mask;

        if (vs_io_mask & fs_io_mask) != fs_io_mask {
            return false;
        }

        // Dual-source blending requires patching the fragment shader
        if state.use_dual_source_blending() {
            return false;
        }

        // The fragment shader library assumes single-sampled rendering
        // when the shader runs per sample
        if fs.flags().contains(ShaderFlags::HAS_SAMPLE_RATE_SHADING)
            && (state.ms.sample_count != vk::SampleCountFlags::TYPE_1
                || state.ms.sample_mask == 0
                || state.ms.enable_alpha_to_coverage)
        {
            return false;
        }
    }

    // Remapping fragment shader outputs would require spec constants
    for i in 0..MAX_RENDER_TARGETS {
        if writes_render_target(shaders, state, i) && !state.om_swizzle[i].is_identity() {
            return false;
        }
    }

    true
}

/// Whether the pipeline writes the given render target: the fragment shader
/// produces the output, the write mask enables it, and a format is bound.
pub(crate) fn writes_render_target(
    shaders: &GraphicsShaderSet,
    state: &GraphicsPipelineState,
    target: usize,
) -> bool {
    let fs_output_mask = shaders.fs.as_ref().map_or(0u32, |fs| fs.info().output_mask);

    if fs_output_mask & (1u32 << target) == 0 {
        return false;
    }

    if state.om_blend[target].color_write_mask.is_empty() {
        return false;
    }

    state.rt.color_formats[target] != vk::Format::UNDEFINED
}

/// Structural checks cheap enough to run on every lookup of a state vector
/// from the render thread.
pub(crate) fn validate_state_fast(
    shaders: &GraphicsShaderSet,
    state: &GraphicsPipelineState,
) -> bool {
    // Tessellation shaders and patch topologies must be used together
    let has_patches = state.ia.primitive_topology == vk::PrimitiveTopology::PATCH_LIST;

    let has_tcs = shaders.tcs.is_some();
    let has_tes = shaders.tes.is_some();

    if has_patches != has_tcs || has_patches != has_tes {
        return false;
    }

    // Filter out undefined primitive topologies
    if state.ia.primitive_topology == PRIMITIVE_TOPOLOGY_UNDEFINED {
        return false;
    }

    // Prevent unintended out-of-bounds access to the layout arrays
    if state.il_attributes.len() > MAX_VERTEX_ATTRIBUTES
        || state.il_bindings.len() > MAX_VERTEX_BINDINGS
    {
        return false;
    }

    true
}

/// Validates the vertex layout of an untrusted state vector: locations and
/// bindings in range, no duplicate locations, no dangling binding
/// references.
pub(crate) fn validate_vertex_layout(state: &GraphicsPipelineState) -> bool {
    let mut binding_mask = 0u32;

    for binding in &state.il_bindings {
        if binding.binding >= MAX_VERTEX_BINDINGS as u32 {
            error!("Invalid pipeline: Vertex binding {} out of range", binding.binding);
            return false;
        }

        binding_mask |= 1u32 << binding.binding;
    }

    let mut location_mask = 0u32;

    for attribute in &state.il_attributes {
        if attribute.location >= MAX_VERTEX_ATTRIBUTES as u32 {
            error!(
                "Invalid pipeline: Vertex location {} out of range",
                attribute.location
            );
            return false;
        }

        if location_mask & (1u32 << attribute.location) != 0 {
            error!(
                "Invalid pipeline: Vertex location {} defined twice",
                attribute.location
            );
            return false;
        }

        if attribute.binding >= MAX_VERTEX_BINDINGS as u32
            || binding_mask & (1u32 << attribute.binding) == 0
        {
            error!(
                "Invalid pipeline: Vertex binding {} not defined",
                attribute.binding
            );
            return false;
        }

        location_mask |= 1u32 << attribute.location;
    }

    true
}

/// Selects the dynamic state set of an optimized pipeline.
pub(crate) fn optimized_dynamic_states(
    state: &GraphicsPipelineState,
    flags: GraphicsPipelineFlags,
) -> SmallVec<[vk::DynamicState; 9]> {
    let mut dynamic_states = SmallVec::new();

    dynamic_states.push(vk::DynamicState::VIEWPORT_WITH_COUNT);
    dynamic_states.push(vk::DynamicState::SCISSOR_WITH_COUNT);

    if state.use_dynamic_vertex_strides() {
        dynamic_states.push(vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE);
    }

    if state.use_dynamic_depth_bias() {
        dynamic_states.push(vk::DynamicState::DEPTH_BIAS);
    }

    if state.use_dynamic_depth_bounds() {
        dynamic_states.push(vk::DynamicState::DEPTH_BOUNDS);
    }

    if state.use_dynamic_blend_constants() {
        dynamic_states.push(vk::DynamicState::BLEND_CONSTANTS);
    }

    if state.use_dynamic_stencil_ref() {
        dynamic_states.push(vk::DynamicState::STENCIL_REFERENCE);
    }

    // With rasterizer discard there is nothing to cull
    if !flags.contains(GraphicsPipelineFlags::HAS_RASTERIZER_DISCARD) {
        dynamic_states.push(vk::DynamicState::CULL_MODE);
        dynamic_states.push(vk::DynamicState::FRONT_FACE);
    }

    dynamic_states
}

/// Computes the patch options for one shader stage under the given state:
/// output fixups for the fragment stage, and the mask of consumed inputs no
/// earlier stage provides.
pub(crate) fn stage_patch_info(
    shaders: &GraphicsShaderSet,
    shader: &Shader,
    state: &GraphicsPipelineState,
) -> ShaderPatchInfo {
    let info = shader.info();
    let mut patch = ShaderPatchInfo::default();

    // Fix up fragment shader outputs for dual-source blending and
    // component remaps
    if info.stage == vk::ShaderStageFlags::FRAGMENT {
        patch.fs_dual_src_blend = state.use_dual_source_blending();

        for i in 0..MAX_RENDER_TARGETS {
            if writes_render_target(shaders, state, i) {
                patch.rt_swizzles[i] = state.om_swizzle[i];
            }
        }
    }

    // Deal with undefined shader inputs
    let consumed_inputs = info.input_mask;

    let provided_inputs = if info.stage == vk::ShaderStageFlags::VERTEX {
        state
            .il_attributes
            .iter()
            .fold(0u32, |mask, attribute| mask | (1u32 << attribute.location))
    } else if info.stage != vk::ShaderStageFlags::TESSELLATION_EVALUATION {
        prev_stage_shader(shaders, info.stage).map_or(0u32, |prev| prev.info().output_mask)
    } else {
        // Technically not correct, but this would need a lot of extra care
        consumed_inputs
    };

    patch.undefined_inputs = (provided_inputs & consumed_inputs) ^ consumed_inputs;
    patch
}

/// Returns the shader feeding the given stage, or `None` for the vertex
/// stage.
pub(crate) fn prev_stage_shader(
    shaders: &GraphicsShaderSet,
    stage: vk::ShaderStageFlags,
) -> Option<&Arc<Shader>> {
    if stage == vk::ShaderStageFlags::VERTEX {
        return None;
    }

    if stage == vk::ShaderStageFlags::TESSELLATION_EVALUATION {
        return shaders.tcs.as_ref();
    }

    let mut result = Some(&shaders.vs);

    if stage == vk::ShaderStageFlags::TESSELLATION_CONTROL {
        return result;
    }

    if shaders.tes.is_some() {
        result = shaders.tes.as_ref();
    }

    if stage == vk::ShaderStageFlags::GEOMETRY {
        return result;
    }

    if shaders.gs.is_some() {
        result = shaders.gs.as_ref();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{ColorSwizzle, DynamicStateFlags};
    use crate::shader::{ShaderInfo, SpirvCodeBuffer};
    use smallvec::smallvec;

    fn shader(stage: vk::ShaderStageFlags, flags: ShaderFlags, info: ShaderInfo) -> Arc<Shader> {
        Shader::new(
            ShaderInfo { stage, ..info },
            flags,
            SpirvCodeBuffer::new(vec![0x0723_0203]),
            "shader",
        )
    }

    fn vs_fs_set(vs_output_mask: u32, fs_input_mask: u32, fs_output_mask: u32) -> GraphicsShaderSet {
        let mut shaders = GraphicsShaderSet::new(shader(
            vk::ShaderStageFlags::VERTEX,
            ShaderFlags::empty(),
            ShaderInfo {
                output_mask: vs_output_mask,
                ..ShaderInfo::default()
            },
        ));

        shaders.fs = Some(shader(
            vk::ShaderStageFlags::FRAGMENT,
            ShaderFlags::empty(),
            ShaderInfo {
                input_mask: fs_input_mask,
                output_mask: fs_output_mask,
                ..ShaderInfo::default()
            },
        ));

        shaders
    }

    fn renderable_state() -> GraphicsPipelineState {
        let mut state = GraphicsPipelineState::default();
        state.ia.primitive_topology = vk::PrimitiveTopology::TRIANGLE_LIST;
        state.rt.color_formats[0] = vk::Format::R8G8B8A8_UNORM;
        state
    }

    #[test]
    fn base_path_eligibility() {
        let shaders = vs_fs_set(0b11, 0b11, 0b1);
        let state = renderable_state();

        assert!(base_pipeline_compatible(&shaders, &state));

        // Non-fill polygon modes cannot be expressed by the libraries
        let mut line_state = state.clone();
        line_state.rs.polygon_mode = vk::PolygonMode::LINE;
        assert!(!base_pipeline_compatible(&shaders, &line_state));

        let mut conservative_state = state.clone();
        conservative_state.rs.conservative_mode =
            vk::ConservativeRasterizationModeEXT::OVERESTIMATE;
        assert!(!base_pipeline_compatible(&shaders, &conservative_state));
    }

    #[test]
    fn base_path_requires_matching_interfaces() {
        // The fragment shader consumes an input the vertex shader never
        // writes, which requires patching.
        let shaders = vs_fs_set(0b01, 0b11, 0b1);
        let state = renderable_state();

        assert!(!base_pipeline_compatible(&shaders, &state));
    }

    #[test]
    fn base_path_rejects_dual_source_blending() {
        let shaders = vs_fs_set(0b1, 0b1, 0b1);
        let mut state = renderable_state();

        state.om_blend[0].blend_enable = true;
        state.om_blend[0].src_color_blend_factor = vk::BlendFactor::SRC1_ALPHA;

        assert!(!base_pipeline_compatible(&shaders, &state));
    }

    #[test]
    fn base_path_limits_sample_rate_shading() {
        let mut shaders = vs_fs_set(0b1, 0b1, 0b1);
        shaders.fs = Some(shader(
            vk::ShaderStageFlags::FRAGMENT,
            ShaderFlags::HAS_SAMPLE_RATE_SHADING,
            ShaderInfo {
                input_mask: 0b1,
                output_mask: 0b1,
                ..ShaderInfo::default()
            },
        ));

        // Single-sampled with a live sample mask is fine
        let mut state = renderable_state();
        state.ms.sample_count = vk::SampleCountFlags::TYPE_1;
        assert!(base_pipeline_compatible(&shaders, &state));

        let mut msaa = state.clone();
        msaa.ms.sample_count = vk::SampleCountFlags::TYPE_4;
        assert!(!base_pipeline_compatible(&shaders, &msaa));

        let mut masked = state.clone();
        masked.ms.sample_mask = 0;
        assert!(!base_pipeline_compatible(&shaders, &masked));

        let mut a2c = state.clone();
        a2c.ms.enable_alpha_to_coverage = true;
        assert!(!base_pipeline_compatible(&shaders, &a2c));
    }

    #[test]
    fn base_path_requires_identity_swizzles() {
        let shaders = vs_fs_set(0b1, 0b1, 0b1);
        let mut state = renderable_state();

        state.om_swizzle[0] = ColorSwizzle::new(3, 1, 2, 0);
        assert!(!base_pipeline_compatible(&shaders, &state));

        // Swizzles on unwritten targets are irrelevant
        state.om_swizzle[0] = ColorSwizzle::IDENTITY;
        state.om_swizzle[5] = ColorSwizzle::new(0, 0, 0, 0);
        assert!(base_pipeline_compatible(&shaders, &state));
    }

    #[test]
    fn fast_validation_checks_tessellation_coherence() {
        let shaders = vs_fs_set(0, 0, 0b1);

        // Patch topology without tessellation shaders
        let mut state = renderable_state();
        state.ia.primitive_topology = vk::PrimitiveTopology::PATCH_LIST;
        assert!(!validate_state_fast(&shaders, &state));

        // Tessellation shaders without patch topology
        let mut tess_shaders = vs_fs_set(0, 0, 0b1);
        tess_shaders.tcs = Some(shader(
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderFlags::empty(),
            ShaderInfo::default(),
        ));
        tess_shaders.tes = Some(shader(
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderFlags::empty(),
            ShaderInfo::default(),
        ));
        let state = renderable_state();
        assert!(!validate_state_fast(&tess_shaders, &state));

        // Both together pass
        let mut patch_state = renderable_state();
        patch_state.ia.primitive_topology = vk::PrimitiveTopology::PATCH_LIST;
        patch_state.ia.patch_vertex_count = 3;
        assert!(validate_state_fast(&tess_shaders, &patch_state));
    }

    #[test]
    fn fast_validation_rejects_undefined_topology() {
        let shaders = vs_fs_set(0, 0, 0b1);
        let state = GraphicsPipelineState::default();

        assert!(!validate_state_fast(&shaders, &state));
    }

    #[test]
    fn fast_validation_enforces_layout_limits() {
        let shaders = vs_fs_set(0, 0, 0b1);
        let mut state = renderable_state();

        for location in 0..MAX_VERTEX_ATTRIBUTES as u32 {
            state.il_attributes.push(crate::pipeline::state::VertexAttribute {
                location,
                ..Default::default()
            });
        }
        assert!(validate_state_fast(&shaders, &state));

        state.il_attributes.push(Default::default());
        assert!(!validate_state_fast(&shaders, &state));
    }

    #[test]
    fn vertex_layout_validation() {
        let mut state = renderable_state();
        state.il_bindings.push(crate::pipeline::state::VertexBinding {
            binding: 0,
            ..Default::default()
        });

        state.il_attributes.push(crate::pipeline::state::VertexAttribute {
            location: 1,
            binding: 0,
            ..Default::default()
        });
        assert!(validate_vertex_layout(&state));

        // Duplicate location
        let mut duplicate = state.clone();
        duplicate.il_attributes.push(crate::pipeline::state::VertexAttribute {
            location: 1,
            binding: 0,
            ..Default::default()
        });
        assert!(!validate_vertex_layout(&duplicate));

        // Attribute referencing an undefined binding
        let mut dangling = state.clone();
        dangling.il_attributes.push(crate::pipeline::state::VertexAttribute {
            location: 2,
            binding: 7,
            ..Default::default()
        });
        assert!(!validate_vertex_layout(&dangling));
    }

    #[test]
    fn dynamic_state_selection() {
        let mut state = renderable_state();

        let base: Vec<_> =
            optimized_dynamic_states(&state, GraphicsPipelineFlags::empty()).to_vec();
        assert_eq!(
            base,
            [
                vk::DynamicState::VIEWPORT_WITH_COUNT,
                vk::DynamicState::SCISSOR_WITH_COUNT,
                vk::DynamicState::CULL_MODE,
                vk::DynamicState::FRONT_FACE,
            ]
        );

        state.rs.dynamic_state = DynamicStateFlags::VERTEX_STRIDES
            | DynamicStateFlags::DEPTH_BIAS
            | DynamicStateFlags::DEPTH_BOUNDS
            | DynamicStateFlags::BLEND_CONSTANTS
            | DynamicStateFlags::STENCIL_REF;

        let all: Vec<_> = optimized_dynamic_states(
            &state,
            GraphicsPipelineFlags::HAS_RASTERIZER_DISCARD,
        )
        .to_vec();
        assert_eq!(
            all,
            [
                vk::DynamicState::VIEWPORT_WITH_COUNT,
                vk::DynamicState::SCISSOR_WITH_COUNT,
                vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE,
                vk::DynamicState::DEPTH_BIAS,
                vk::DynamicState::DEPTH_BOUNDS,
                vk::DynamicState::BLEND_CONSTANTS,
                vk::DynamicState::STENCIL_REFERENCE,
            ]
        );
    }

    #[test]
    fn undefined_inputs_for_vertex_stage() {
        let mut shaders = vs_fs_set(0, 0b11, 0b1);
        shaders.vs = shader(
            vk::ShaderStageFlags::VERTEX,
            ShaderFlags::empty(),
            ShaderInfo {
                input_mask: 0b111,
                ..ShaderInfo::default()
            },
        );

        let mut state = renderable_state();
        state.il_attributes = smallvec![
            crate::pipeline::state::VertexAttribute {
                location: 0,
                ..Default::default()
            },
            crate::pipeline::state::VertexAttribute {
                location: 2,
                ..Default::default()
            },
        ];

        let patch = stage_patch_info(&shaders, &shaders.vs, &state);
        assert_eq!(patch.undefined_inputs, 0b010);
    }

    #[test]
    fn undefined_inputs_for_fragment_stage() {
        let shaders = vs_fs_set(0b01, 0b11, 0b1);
        let state = renderable_state();

        let fs = shaders.fs.clone().unwrap();
        let patch = stage_patch_info(&shaders, &fs, &state);
        assert_eq!(patch.undefined_inputs, 0b10);
    }

    #[test]
    fn tessellation_evaluation_inputs_count_as_provided() {
        let mut shaders = vs_fs_set(0b1, 0b1, 0b1);
        shaders.tcs = Some(shader(
            vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderFlags::empty(),
            ShaderInfo::default(),
        ));
        let tes = shader(
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderFlags::empty(),
            ShaderInfo {
                input_mask: 0b1010,
                ..ShaderInfo::default()
            },
        );
        shaders.tes = Some(tes.clone());

        let state = renderable_state();
        let patch = stage_patch_info(&shaders, &tes, &state);
        assert_eq!(patch.undefined_inputs, 0);
    }

    #[test]
    fn previous_stage_resolution() {
        let mut shaders = vs_fs_set(0b1, 0b1, 0b1);

        // With no intermediate stages the fragment shader reads from vs
        let fs = shaders.fs.clone().unwrap();
        let prev = prev_stage_shader(&shaders, fs.info().stage).unwrap();
        assert!(Arc::ptr_eq(prev, &shaders.vs));

        // A geometry shader takes over once present
        let gs = shader(
            vk::ShaderStageFlags::GEOMETRY,
            ShaderFlags::empty(),
            ShaderInfo {
                output_mask: 0b1,
                ..ShaderInfo::default()
            },
        );
        shaders.gs = Some(gs.clone());

        let prev = prev_stage_shader(&shaders, vk::ShaderStageFlags::FRAGMENT).unwrap();
        assert!(Arc::ptr_eq(prev, &gs));

        // The geometry shader itself reads from tes when present, vs
        // otherwise
        let prev = prev_stage_shader(&shaders, vk::ShaderStageFlags::GEOMETRY).unwrap();
        assert!(Arc::ptr_eq(prev, &shaders.vs));

        let tes = shader(
            vk::ShaderStageFlags::TESSELLATION_EVALUATION,
            ShaderFlags::empty(),
            ShaderInfo::default(),
        );
        shaders.tes = Some(tes.clone());

        let prev = prev_stage_shader(&shaders, vk::ShaderStageFlags::GEOMETRY).unwrap();
        assert!(Arc::ptr_eq(prev, &tes));

        assert!(prev_stage_shader(&shaders, vk::ShaderStageFlags::VERTEX).is_none());
    }

    #[test]
    fn fragment_patch_options_cover_written_targets() {
        let shaders = vs_fs_set(0b1, 0b1, 0b11);
        let mut state = renderable_state();
        state.rt.color_formats[1] = vk::Format::R8_UNORM;
        state.om_swizzle[0] = ColorSwizzle::new(2, 1, 0, 3);
        state.om_swizzle[1] = ColorSwizzle::new(3, 3, 3, 3);

        let fs = shaders.fs.clone().unwrap();
        let patch = stage_patch_info(&shaders, &fs, &state);

        assert_eq!(patch.rt_swizzles[0], ColorSwizzle::new(2, 1, 0, 3));
        assert_eq!(patch.rt_swizzles[1], ColorSwizzle::new(3, 3, 3, 3));
        assert!(!patch.fs_dual_src_blend);

        // Targets without a bound format keep the identity mapping
        state.rt.color_formats[1] = vk::Format::UNDEFINED;
        let patch = stage_patch_info(&shaders, &fs, &state);
        assert_eq!(patch.rt_swizzles[1], ColorSwizzle::IDENTITY);
    }
}
