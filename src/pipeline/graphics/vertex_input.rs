// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The vertex input interface sub-vector and its pipeline library.

use crate::device::Device;
use crate::pipeline::state::{GraphicsPipelineState, VertexAttribute};
use crate::shader::Shader;
use crate::{Error, Result};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

/// One compacted vertex buffer binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

/// Divisor record for one instance-rate binding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputDivisor {
    pub binding: u32,
    pub divisor: u32,
}

/// Normalized vertex input state: input assembly plus the subset of the
/// vertex layout that the vertex shader actually reads.
///
/// Unused attributes are dropped and the remaining bindings renumbered
/// densely in source order, so that layouts differing only in dead inputs
/// share one pipeline library.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VertexInputState {
    pub primitive_topology: vk::PrimitiveTopology,
    pub primitive_restart: bool,
    pub bindings: SmallVec<[VertexInputBinding; 8]>,
    pub attributes: SmallVec<[VertexAttribute; 8]>,
    pub divisors: SmallVec<[VertexInputDivisor; 8]>,
    pub dynamic_vertex_strides: bool,
}

impl VertexInputState {
    pub fn new(state: &GraphicsPipelineState, vs: &Shader) -> Self {
        let attr_mask = vs.info().input_mask;

        // Find out which bindings are used based on the attribute mask
        let mut binding_mask = 0u32;

        for attribute in &state.il_attributes {
            if attr_mask & (1u32 << attribute.location) != 0 {
                binding_mask |= 1u32 << attribute.binding;
            }
        }

        // Process vertex bindings. Binding numbers are compacted on the
        // fly so that vertex buffers can be updated more easily.
        let mut binding_map = [0u32; crate::MAX_VERTEX_BINDINGS];
        let mut bindings: SmallVec<[VertexInputBinding; 8]> = SmallVec::new();
        let mut divisors: SmallVec<[VertexInputDivisor; 8]> = SmallVec::new();

        for binding in &state.il_bindings {
            if binding_mask & (1u32 << binding.binding) == 0 {
                continue;
            }

            let compact_index = bindings.len() as u32;
            binding_map[binding.binding as usize] = compact_index;

            bindings.push(VertexInputBinding {
                binding: compact_index,
                stride: binding.stride,
                input_rate: binding.input_rate,
            });

            if binding.input_rate == vk::VertexInputRate::INSTANCE && binding.divisor != 1 {
                divisors.push(VertexInputDivisor {
                    binding: compact_index,
                    divisor: binding.divisor,
                });
            }
        }

        // Process vertex attributes, filtering out unused ones
        let mut attributes: SmallVec<[VertexAttribute; 8]> = SmallVec::new();

        for attribute in &state.il_attributes {
            if attr_mask & (1u32 << attribute.location) != 0 {
                attributes.push(VertexAttribute {
                    location: attribute.location,
                    binding: binding_map[attribute.binding as usize],
                    format: attribute.format,
                    offset: attribute.offset,
                });
            }
        }

        // This must be bit-identical to the incoming state vector, the
        // normalized state may otherwise change behaviour here.
        let dynamic_vertex_strides = state.use_dynamic_vertex_strides();

        Self {
            primitive_topology: state.ia.primitive_topology,
            primitive_restart: state.ia.primitive_restart,
            bindings,
            attributes,
            divisors,
            dynamic_vertex_strides,
        }
    }
}

/// Owns the vertex-input-interface pipeline library built from one
/// [`VertexInputState`].
pub struct VertexInputLibrary {
    device: Arc<Device>,
    handle: vk::Pipeline,
}

impl VertexInputLibrary {
    pub fn new(device: Arc<Device>, state: &VertexInputState) -> Result<Self> {
        let bindings_vk: SmallVec<[vk::VertexInputBindingDescription; 8]> = state
            .bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: binding.input_rate,
            })
            .collect();

        let attributes_vk: SmallVec<[vk::VertexInputAttributeDescription; 8]> = state
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: attribute.format,
                offset: attribute.offset,
            })
            .collect();

        let divisors_vk: SmallVec<[vk::VertexInputBindingDivisorDescriptionEXT; 8]> = state
            .divisors
            .iter()
            .map(|divisor| vk::VertexInputBindingDivisorDescriptionEXT {
                binding: divisor.binding,
                divisor: divisor.divisor,
            })
            .collect();

        let mut vi_info = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: bindings_vk.len() as u32,
            p_vertex_binding_descriptions: bindings_vk.as_ptr(),
            vertex_attribute_description_count: attributes_vk.len() as u32,
            p_vertex_attribute_descriptions: attributes_vk.as_ptr(),
            ..Default::default()
        };

        let mut divisor_info_vk = None;

        if !divisors_vk.is_empty()
            && device
                .features()
                .vertex_attribute_instance_rate_divisor
        {
            let divisor_info =
                divisor_info_vk.insert(vk::PipelineVertexInputDivisorStateCreateInfoEXT {
                    vertex_binding_divisor_count: divisors_vk.len() as u32,
                    p_vertex_binding_divisors: divisors_vk.as_ptr(),
                    ..Default::default()
                });

            vi_info.p_next = divisor_info as *const _ as *const _;
        }

        let ia_info = vk::PipelineInputAssemblyStateCreateInfo {
            topology: state.primitive_topology,
            primitive_restart_enable: state.primitive_restart as vk::Bool32,
            ..Default::default()
        };

        let dynamic_states = [vk::DynamicState::VERTEX_INPUT_BINDING_STRIDE];

        let dy_info = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: state.dynamic_vertex_strides as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let lib_info = vk::GraphicsPipelineLibraryCreateInfoEXT {
            flags: vk::GraphicsPipelineLibraryFlagsEXT::VERTEX_INPUT_INTERFACE,
            ..Default::default()
        };

        let info = vk::GraphicsPipelineCreateInfo {
            p_next: &lib_info as *const _ as *const _,
            flags: vk::PipelineCreateFlags::LIBRARY_KHR,
            p_vertex_input_state: &vi_info,
            p_input_assembly_state: &ia_info,
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

impl Drop for VertexInputLibrary {
    fn drop(&mut self) {
        self.device.destroy_pipeline(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::{DynamicStateFlags, VertexBinding};
    use crate::shader::{ShaderFlags, ShaderInfo, SpirvCodeBuffer};
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn vertex_shader(input_mask: u32) -> Arc<Shader> {
        Shader::new(
            ShaderInfo {
                stage: vk::ShaderStageFlags::VERTEX,
                input_mask,
                ..ShaderInfo::default()
            },
            ShaderFlags::empty(),
            SpirvCodeBuffer::new(vec![0x0723_0203]),
            "vs",
        )
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn state_with_layout() -> GraphicsPipelineState {
        let mut state = GraphicsPipelineState::default();
        state.ia.primitive_topology = vk::PrimitiveTopology::TRIANGLE_LIST;

        for location in 0..4u32 {
            state.il_attributes.push(VertexAttribute {
                location,
                binding: location / 2,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: 16 * (location % 2),
            });
        }

        for binding in 0..2u32 {
            state.il_bindings.push(VertexBinding {
                binding,
                stride: 32,
                ..VertexBinding::default()
            });
        }

        state
    }

    #[test]
    fn unused_attributes_are_filtered() {
        let state = state_with_layout();
        let vs = vertex_shader(0b0101);

        let vi = VertexInputState::new(&state, &vs);

        let locations: Vec<u32> = vi.attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, [0, 2]);

        let bindings: Vec<u32> = vi.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(bindings, [0, 1]);

        assert_eq!(vi.attributes[0].binding, 0);
        assert_eq!(vi.attributes[1].binding, 1);
        assert!(vi.divisors.is_empty());
    }

    #[test]
    fn unused_bindings_are_compacted_away() {
        let mut state = GraphicsPipelineState::default();
        state.ia.primitive_topology = vk::PrimitiveTopology::TRIANGLE_LIST;

        state.il_attributes.push(VertexAttribute {
            location: 0,
            binding: 2,
            format: vk::Format::R32G32_SFLOAT,
            offset: 0,
        });

        state.il_bindings.push(VertexBinding {
            binding: 0,
            stride: 8,
            ..VertexBinding::default()
        });
        state.il_bindings.push(VertexBinding {
            binding: 2,
            stride: 24,
            ..VertexBinding::default()
        });

        let vi = VertexInputState::new(&state, &vertex_shader(0b1));

        assert_eq!(vi.bindings.len(), 1);
        assert_eq!(vi.bindings[0].binding, 0);
        assert_eq!(vi.bindings[0].stride, 24);
        assert_eq!(vi.attributes[0].binding, 0);
    }

    #[test]
    fn divisors_only_for_nontrivial_instance_rate() {
        let mut state = state_with_layout();
        state.il_bindings[0].input_rate = vk::VertexInputRate::INSTANCE;
        state.il_bindings[0].divisor = 4;
        state.il_bindings[1].input_rate = vk::VertexInputRate::INSTANCE;
        state.il_bindings[1].divisor = 1;

        let vi = VertexInputState::new(&state, &vertex_shader(0b1111));

        assert_eq!(vi.divisors.len(), 1);
        assert_eq!(
            vi.divisors[0],
            VertexInputDivisor {
                binding: 0,
                divisor: 4
            }
        );
    }

    #[test]
    fn dynamic_strides_are_copied_verbatim() {
        let mut state = state_with_layout();
        let vs = vertex_shader(0b1111);

        let without = VertexInputState::new(&state, &vs);
        assert!(!without.dynamic_vertex_strides);

        state.rs.dynamic_state |= DynamicStateFlags::VERTEX_STRIDES;
        let with = VertexInputState::new(&state, &vs);
        assert!(with.dynamic_vertex_strides);

        assert_ne!(without, with);
        assert_ne!(hash_of(&without), hash_of(&with));
    }

    #[test]
    fn rebuilding_preserves_equality_class() {
        let state = state_with_layout();
        let vs = vertex_shader(0b0101);

        let first = VertexInputState::new(&state, &vs);
        let second = VertexInputState::new(&state.clone(), &vs);

        assert_eq!(first, second);
        assert_eq!(hash_of(&first), hash_of(&second));

        // Rebuilding from the equality-relevant fields yields the same class.
        let copy = VertexInputState {
            primitive_topology: first.primitive_topology,
            primitive_restart: first.primitive_restart,
            bindings: first.bindings.clone(),
            attributes: first.attributes.clone(),
            divisors: first.divisors.clone(),
            dynamic_vertex_strides: first.dynamic_vertex_strides,
        };
        assert_eq!(first, copy);
        assert_eq!(hash_of(&first), hash_of(&copy));
    }
}
