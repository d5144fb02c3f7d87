// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Graphics pipeline compilation and caching core for a Vulkan-based
//! translation layer.
//!
//! The central object is the [`GraphicsPipeline`]: one per unique set of
//! shaders, created through the [`PipelineManager`]. Each draw submission
//! presents a [`GraphicsPipelineState`] vector to
//! [`GraphicsPipeline::get_handle`], which synchronously returns the best
//! `VkPipeline` handle currently available for that state:
//!
//! - a *fast* (monolithic, fully optimized) pipeline if one has already been
//!   compiled, either earlier this run or through the driver's own cache;
//! - otherwise a *base* pipeline, linked on the spot from four pre-compiled
//!   pipeline libraries, while a worker thread compiles the optimized
//!   variant in the background and publishes it for subsequent lookups.
//!
//! States that cannot use the library path (non-trivial polygon modes,
//! shader interface mismatches, output swizzles and the like) are compiled
//! synchronously and recorded for the on-disk state cache, so the next run
//! can warm them up ahead of time.
//!
//! The GPU driver, the shader object model, binding layouts and the
//! persistence layer are collaborators behind narrow interfaces; see the
//! [`device`], [`shader`] and [`pipeline`] modules.

pub use crate::device::Device;
pub use crate::pipeline::graphics::GraphicsPipeline;
pub use crate::pipeline::manager::PipelineManager;
pub use crate::pipeline::state::GraphicsPipelineState;

use ash::vk;
use thiserror::Error;

pub mod device;
pub mod format;
pub mod pipeline;
pub mod shader;
pub mod sync;

/// Maximum number of simultaneously bound render targets.
pub const MAX_RENDER_TARGETS: usize = 8;

/// Maximum number of vertex attributes in a pipeline state vector.
pub const MAX_VERTEX_ATTRIBUTES: usize = 32;

/// Maximum number of vertex buffer bindings in a pipeline state vector.
pub const MAX_VERTEX_BINDINGS: usize = 32;

/// Maximum number of pipeline specialization constants.
pub const MAX_SPEC_CONSTANTS: usize = 12;

/// Error type for pipeline object creation.
///
/// Per-draw failures are deliberately not errors: an invalid state vector or
/// a failed optimized compile results in a null handle and a log entry, and
/// the draw using it is skipped.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Creating a vertex-input or fragment-output pipeline library failed.
    #[error("failed to create pipeline library: {0}")]
    PipelineLibraryCreation(vk::Result),

    /// The driver rejected a pipeline object creation call.
    #[error("failed to create pipeline: {0}")]
    PipelineCreation(vk::Result),
}

pub type Result<T> = std::result::Result<T, Error>;
