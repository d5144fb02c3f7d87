// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Pre-compiled per-shader pipeline libraries.
//!
//! For every vertex and fragment shader, the shader backend pre-compiles
//! pipeline libraries covering the pre-rasterization and fragment-shader
//! interface stages, one variant per argument combination. Linking those
//! against a vertex-input and a fragment-output library yields a usable
//! pipeline without compiling any shader code at draw time.

use crate::device::Device;
use crate::shader::ShaderModuleIdentifier;
use ash::vk;
use std::sync::Arc;

/// Arguments selecting a variant of a shader pipeline library.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderPipelineLibraryArgs {
    pub depth_clip_enable: bool,
}

/// A pre-compiled vertex- or fragment-stage pipeline library.
///
/// Owns one pipeline handle per argument combination, plus the driver
/// module identifier of the underlying shader, which lets optimized
/// pipelines be requested from the driver cache without providing code.
pub struct ShaderPipelineLibrary {
    device: Arc<Device>,
    variants: [vk::Pipeline; 2],
    identifier: ShaderModuleIdentifier,
}

impl ShaderPipelineLibrary {
    /// Wraps the pre-compiled variant handles, indexed by
    /// `depth_clip_enable`. Ownership of the handles transfers to the
    /// library object.
    pub fn new(
        device: Arc<Device>,
        variants: [vk::Pipeline; 2],
        identifier: ShaderModuleIdentifier,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            variants,
            identifier,
        })
    }

    /// Returns the library handle for the given arguments.
    pub fn pipeline_handle(&self, args: ShaderPipelineLibraryArgs) -> vk::Pipeline {
        self.variants[args.depth_clip_enable as usize]
    }

    /// The driver-side identifier of the shader module.
    pub fn module_identifier(&self) -> &ShaderModuleIdentifier {
        &self.identifier
    }
}

impl Drop for ShaderPipelineLibrary {
    fn drop(&mut self) {
        for &variant in &self.variants {
            self.device.destroy_pipeline(variant);
        }
    }
}
