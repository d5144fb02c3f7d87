// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The GPU driver collaborator.
//!
//! [`Device`] wraps the dispatch tables the pipeline core calls into,
//! together with a [`DeviceInfo`] snapshot of the features, extensions and
//! properties that influence pipeline construction. The snapshot is plain
//! data and can be built without a live driver, which keeps all state
//! derivation logic independent of the GPU it eventually runs on.
//!
//! The surrounding translation layer owns instance and logical device
//! creation; dropping a `Device` does not destroy the `VkDevice`.

use ash::vk;
use std::sync::Arc;

/// Device features consumed by pipeline construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// `VK_EXT_depth_clip_enable`: depth clip can be controlled separately
    /// from depth clamp.
    pub depth_clip_enable: bool,
    /// `VK_EXT_vertex_attribute_divisor`: instance-rate bindings may carry a
    /// divisor other than one.
    pub vertex_attribute_instance_rate_divisor: bool,
    /// `VK_EXT_pipeline_creation_cache_control` or Vulkan 1.3:
    /// `FAIL_ON_PIPELINE_COMPILE_REQUIRED` is legal at pipeline creation.
    pub pipeline_creation_cache_control: bool,
    /// Core `depthBounds` feature.
    pub depth_bounds: bool,
    /// `VK_EXT_transform_feedback` feature bit.
    pub transform_feedback: bool,
    /// `VK_EXT_graphics_pipeline_library`: pipelines may be linked from
    /// pre-compiled libraries.
    pub graphics_pipeline_library: bool,
    /// `VK_EXT_shader_module_identifier`: cached pipelines can be created
    /// from module identifiers instead of SPIR-V code.
    pub shader_module_identifier: bool,
}

/// Device extensions consumed by pipeline construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceExtensions {
    pub ext_conservative_rasterization: bool,
    pub ext_depth_clip_enable: bool,
    pub ext_vertex_attribute_divisor: bool,
    pub ext_graphics_pipeline_library: bool,
    pub ext_shader_module_identifier: bool,
    pub ext_transform_feedback: bool,
}

/// Adapter properties consumed by pipeline construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    /// `VK_EXT_conservative_rasterization`: the implementation supports the
    /// underestimation mode.
    pub conservative_primitive_underestimation: bool,
}

/// Capability snapshot of the adapter a device was created on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub features: DeviceFeatures,
    pub extensions: DeviceExtensions,
    pub properties: DeviceProperties,
}

/// The GPU driver object.
///
/// Provides the pipeline-create and pipeline-destroy primitives, feature
/// flags and format queries the core consumes. All other driver
/// functionality lives in the surrounding layer.
pub struct Device {
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    info: DeviceInfo,
}

impl Device {
    /// Wraps an already-created logical device.
    ///
    /// `info` must describe the capabilities the device was created with;
    /// the core trusts it when deciding which structures to chain into
    /// pipeline create info.
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        info: DeviceInfo,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance,
            device,
            physical_device,
            info,
        })
    }

    /// Capability snapshot of the adapter.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device features relevant to pipeline construction.
    pub fn features(&self) -> &DeviceFeatures {
        &self.info.features
    }

    /// Whether optimized pipelines may be requested from the driver cache
    /// with `FAIL_ON_PIPELINE_COMPILE_REQUIRED`.
    pub fn can_use_pipeline_cache_control(&self) -> bool {
        self.info.features.pipeline_creation_cache_control
    }

    /// Queries format properties from the adapter.
    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// Creates a single graphics pipeline.
    ///
    /// Returns the raw driver error so callers can distinguish a cache miss
    /// under `FAIL_ON_PIPELINE_COMPILE_REQUIRED` from an actual failure.
    pub(crate) fn create_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo,
    ) -> std::result::Result<vk::Pipeline, vk::Result> {
        let result = unsafe {
            self.device.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };

        match result {
            Ok(mut pipelines) => Ok(pipelines.remove(0)),
            Err((_, err)) => Err(err),
        }
    }

    /// Destroys a pipeline handle. Null handles are ignored.
    pub(crate) fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        if pipeline != vk::Pipeline::null() {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    /// Destroys a pipeline layout handle. Null handles are ignored.
    pub(crate) fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        if layout != vk::PipelineLayout::null() {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("physical_device", &self.physical_device)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}
