// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The pipeline manager.
//!
//! Owns everything shared between pipeline objects: the worker pool, the
//! state cache, the deduplicated state-library caches and the pipeline
//! objects themselves. Pipelines and libraries are grow-only; they live
//! until the manager and every pipeline referencing them are dropped.

use crate::device::Device;
use crate::pipeline::cache::{StateCache, StateCacheKey};
use crate::pipeline::graphics::{
    FragmentOutputLibrary, FragmentOutputState, GraphicsPipeline, VertexInputLibrary,
    VertexInputState,
};
use crate::pipeline::layout::BindingLayout;
use crate::pipeline::library::ShaderPipelineLibrary;
use crate::pipeline::worker::PipelineWorkers;
use crate::shader::GraphicsShaderSet;
use crate::Result;
use ahash::HashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Counters tracking what the caches have produced so far.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub num_graphics_pipelines: AtomicU32,
    pub num_graphics_libraries: AtomicU32,
}

/// Deduplicated cache of state pipeline libraries, shared between the
/// manager and every pipeline object it created.
pub struct PipelineLibraryCache {
    device: Arc<Device>,
    stats: Arc<PipelineStats>,
    vi_libraries: Mutex<HashMap<VertexInputState, Arc<VertexInputLibrary>>>,
    fo_libraries: Mutex<HashMap<FragmentOutputState, Arc<FragmentOutputLibrary>>>,
}

impl PipelineLibraryCache {
    fn new(device: Arc<Device>, stats: Arc<PipelineStats>) -> Arc<Self> {
        Arc::new(Self {
            device,
            stats,
            vi_libraries: Mutex::new(HashMap::default()),
            fo_libraries: Mutex::new(HashMap::default()),
        })
    }

    /// Returns the vertex input library for the given sub-vector, creating
    /// it on first use.
    pub fn create_vertex_input_library(
        &self,
        state: &VertexInputState,
    ) -> Result<Arc<VertexInputLibrary>> {
        let mut libraries = self.vi_libraries.lock();

        if let Some(library) = libraries.get(state) {
            return Ok(Arc::clone(library));
        }

        let library = Arc::new(VertexInputLibrary::new(Arc::clone(&self.device), state)?);
        libraries.insert(state.clone(), Arc::clone(&library));

        self.stats
            .num_graphics_libraries
            .fetch_add(1, Ordering::Relaxed);

        Ok(library)
    }

    /// Returns the fragment output library for the given sub-vector,
    /// creating it on first use.
    pub fn create_fragment_output_library(
        &self,
        state: &FragmentOutputState,
    ) -> Result<Arc<FragmentOutputLibrary>> {
        let mut libraries = self.fo_libraries.lock();

        if let Some(library) = libraries.get(state) {
            return Ok(Arc::clone(library));
        }

        let library = Arc::new(FragmentOutputLibrary::new(Arc::clone(&self.device), state)?);
        libraries.insert(state.clone(), Arc::clone(&library));

        self.stats
            .num_graphics_libraries
            .fetch_add(1, Ordering::Relaxed);

        Ok(library)
    }
}

/// Creates and deduplicates pipeline objects.
pub struct PipelineManager {
    device: Arc<Device>,
    libraries: Arc<PipelineLibraryCache>,
    workers: Arc<PipelineWorkers>,
    state_cache: Arc<StateCache>,
    stats: Arc<PipelineStats>,
    pipelines: Mutex<HashMap<StateCacheKey, Arc<GraphicsPipeline>>>,
}

impl PipelineManager {
    pub fn new(device: Arc<Device>) -> Arc<Self> {
        Self::with_workers(device, PipelineWorkers::new())
    }

    pub fn with_workers(device: Arc<Device>, workers: Arc<PipelineWorkers>) -> Arc<Self> {
        let stats = Arc::new(PipelineStats::default());

        Arc::new(Self {
            libraries: PipelineLibraryCache::new(Arc::clone(&device), Arc::clone(&stats)),
            device,
            workers,
            state_cache: StateCache::new(),
            stats,
            pipelines: Mutex::new(HashMap::default()),
        })
    }

    /// Returns the pipeline object for the given shader set, creating it on
    /// first use.
    pub fn create_graphics_pipeline(
        &self,
        shaders: GraphicsShaderSet,
        bindings: Arc<BindingLayout>,
        vs_library: Option<Arc<ShaderPipelineLibrary>>,
        fs_library: Option<Arc<ShaderPipelineLibrary>>,
    ) -> Arc<GraphicsPipeline> {
        let key = StateCacheKey::for_shaders(&shaders);

        let mut pipelines = self.pipelines.lock();

        if let Some(pipeline) = pipelines.get(&key) {
            return Arc::clone(pipeline);
        }

        let pipeline = GraphicsPipeline::new(
            Arc::clone(&self.device),
            self,
            shaders,
            bindings,
            vs_library,
            fs_library,
        );

        pipelines.insert(key, Arc::clone(&pipeline));
        pipeline
    }

    /// Queues background compilation for every recorded state cache entry
    /// whose pipeline object already exists.
    pub fn replay_state_cache(&self) {
        for entry in self.state_cache.entries() {
            let pipeline = self.pipelines.lock().get(&entry.key).cloned();

            if let Some(pipeline) = pipeline {
                self.workers.compile_graphics_pipeline(pipeline, entry.state);
            }
        }
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub(crate) fn library_cache(&self) -> Arc<PipelineLibraryCache> {
        Arc::clone(&self.libraries)
    }

    pub(crate) fn workers(&self) -> Arc<PipelineWorkers> {
        Arc::clone(&self.workers)
    }

    pub(crate) fn state_cache(&self) -> Arc<StateCache> {
        Arc::clone(&self.state_cache)
    }

    pub(crate) fn stats_handle(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }
}
