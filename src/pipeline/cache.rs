// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The pipeline state cache.
//!
//! Collects the (shader set, state vector) pairs worth compiling ahead of
//! time on the next run. Only states that cannot be served by the
//! library-linking fast path are recorded; linking is cheap enough to redo
//! every run. The on-disk encoding and file handling belong to the
//! persistence layer, which reads [`StateCache::entries`] and replays them
//! through the pipeline manager.

use crate::pipeline::state::GraphicsPipelineState;
use crate::shader::{GraphicsShaderSet, ShaderKey};
use ahash::HashSet;
use parking_lot::Mutex;
use std::sync::Arc;

/// Identifies the shader set of a cached pipeline. Absent stages carry the
/// default key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct StateCacheKey {
    pub vs: ShaderKey,
    pub tcs: ShaderKey,
    pub tes: ShaderKey,
    pub gs: ShaderKey,
    pub fs: ShaderKey,
}

impl StateCacheKey {
    pub fn for_shaders(shaders: &GraphicsShaderSet) -> Self {
        let key = |shader: &Option<Arc<crate::shader::Shader>>| {
            shader.as_ref().map(|shader| shader.key()).unwrap_or_default()
        };

        Self {
            vs: shaders.vs.key(),
            tcs: key(&shaders.tcs),
            tes: key(&shaders.tes),
            gs: key(&shaders.gs),
            fs: key(&shaders.fs),
        }
    }
}

/// One recorded pipeline: the shaders it was built from and the state
/// vector to compile.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateCacheEntry {
    pub key: StateCacheKey,
    pub state: GraphicsPipelineState,
}

/// In-memory collection backing the on-disk pipeline state cache.
pub struct StateCache {
    entries: Mutex<HashSet<StateCacheEntry>>,
}

impl StateCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashSet::default()),
        })
    }

    /// Records a graphics pipeline state. Duplicate entries are ignored.
    pub fn add_graphics_pipeline(&self, key: StateCacheKey, state: &GraphicsPipelineState) {
        let entry = StateCacheEntry {
            key,
            state: state.clone(),
        };

        self.entries.lock().insert(entry);
    }

    /// Snapshot of all recorded entries, for persistence and replay.
    pub fn entries(&self) -> Vec<StateCacheEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn test_key(hash: u64) -> StateCacheKey {
        StateCacheKey {
            vs: ShaderKey {
                stage: vk::ShaderStageFlags::VERTEX,
                hash,
            },
            ..StateCacheKey::default()
        }
    }

    #[test]
    fn duplicate_entries_are_ignored() {
        let cache = StateCache::new();
        let state = GraphicsPipelineState::default();

        cache.add_graphics_pipeline(test_key(1), &state);
        cache.add_graphics_pipeline(test_key(1), &state);
        assert_eq!(cache.len(), 1);

        // A different state under the same shaders is a new entry
        let mut other = state.clone();
        other.ia.primitive_topology = vk::PrimitiveTopology::LINE_LIST;
        cache.add_graphics_pipeline(test_key(1), &other);
        assert_eq!(cache.len(), 2);

        // Same state under different shaders as well
        cache.add_graphics_pipeline(test_key(2), &state);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn entries_round_trip() {
        let cache = StateCache::new();
        assert!(cache.is_empty());

        let mut state = GraphicsPipelineState::default();
        state.ia.primitive_topology = vk::PrimitiveTopology::TRIANGLE_STRIP;
        cache.add_graphics_pipeline(test_key(7), &state);

        let entries = cache.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, test_key(7));
        assert_eq!(entries[0].state, state);
    }
}
