// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The binding layout collaborator.
//!
//! Descriptor set layouts and their merging rules are owned by the
//! surrounding translation layer; the pipeline core only consumes the two
//! pipeline layout handles built from them and the global barrier that
//! summarizes every resource the layout can touch.

use crate::device::Device;
use ash::vk;
use std::sync::Arc;

/// Pipeline-wide synchronization requirements of a binding layout: every
/// stage that may access a bound resource and every access type that may
/// occur, merged over all bindings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalBarrier {
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
}

/// The binding layout objects of one pipeline.
///
/// Two layout variants exist: the complete layout used by monolithic
/// pipelines, and a variant created with independent descriptor sets for
/// linking pipeline libraries. Both handles are owned here and destroyed on
/// drop.
pub struct BindingLayout {
    device: Arc<Device>,
    complete_layout: vk::PipelineLayout,
    independent_layout: vk::PipelineLayout,
    barrier: GlobalBarrier,
}

impl BindingLayout {
    pub fn new(
        device: Arc<Device>,
        complete_layout: vk::PipelineLayout,
        independent_layout: vk::PipelineLayout,
        barrier: GlobalBarrier,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            complete_layout,
            independent_layout,
            barrier,
        })
    }

    /// Returns the pipeline layout handle. `independent` selects the
    /// variant compatible with graphics pipeline libraries.
    pub fn pipeline_layout(&self, independent: bool) -> vk::PipelineLayout {
        if independent {
            self.independent_layout
        } else {
            self.complete_layout
        }
    }

    /// The merged barrier for all resources this layout can reach.
    pub fn global_barrier(&self) -> GlobalBarrier {
        self.barrier
    }
}

impl Drop for BindingLayout {
    fn drop(&mut self) {
        self.device.destroy_pipeline_layout(self.complete_layout);
        self.device.destroy_pipeline_layout(self.independent_layout);
    }
}

impl std::fmt::Debug for BindingLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingLayout")
            .field("complete_layout", &self.complete_layout)
            .field("independent_layout", &self.independent_layout)
            .field("barrier", &self.barrier)
            .finish()
    }
}
