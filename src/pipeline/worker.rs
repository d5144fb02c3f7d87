// Copyright (c) 2023 The refract developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Background pipeline compilation workers.
//!
//! A fixed pool of threads drains a FIFO queue of compile jobs. Threads are
//! only spawned once the first job arrives, so applications that never miss
//! the caches pay nothing. Jobs are never cancelled; on shutdown the pool
//! finishes whatever is queued before the threads exit.

use crate::pipeline::graphics::GraphicsPipeline;
use crate::pipeline::state::GraphicsPipelineState;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type WorkerJob = Box<dyn FnOnce() + Send>;

struct WorkerQueue {
    jobs: Mutex<VecDeque<WorkerJob>>,
    cond: Condvar,
    stop: AtomicBool,
}

/// The worker pool compiling optimized pipelines in the background.
pub struct PipelineWorkers {
    queue: Arc<WorkerQueue>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_count: usize,
}

impl PipelineWorkers {
    /// Creates a pool sized to half the available hardware threads, which
    /// leaves headroom for the render threads feeding it.
    pub fn new() -> Arc<Self> {
        let parallelism = thread::available_parallelism().map_or(1, |count| count.get());

        Self::with_thread_count((parallelism / 2).max(1))
    }

    pub fn with_thread_count(thread_count: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Arc::new(WorkerQueue {
                jobs: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            threads: Mutex::new(Vec::new()),
            thread_count: thread_count.max(1),
        })
    }

    /// Queues background compilation of the optimized pipeline for the
    /// given state.
    pub fn compile_graphics_pipeline(
        &self,
        pipeline: Arc<GraphicsPipeline>,
        state: GraphicsPipelineState,
    ) {
        self.submit(Box::new(move || pipeline.compile(&state)));
    }

    /// Number of jobs waiting to be picked up.
    pub fn pending_jobs(&self) -> usize {
        self.queue.jobs.lock().len()
    }

    pub(crate) fn submit(&self, job: WorkerJob) {
        self.ensure_started();

        let mut jobs = self.queue.jobs.lock();
        jobs.push_back(job);
        drop(jobs);

        self.queue.cond.notify_one();
    }

    fn ensure_started(&self) {
        let mut threads = self.threads.lock();

        if !threads.is_empty() {
            return;
        }

        for index in 0..self.thread_count {
            let queue = Arc::clone(&self.queue);

            let handle = thread::Builder::new()
                .name(format!("pipeline-worker-{}", index))
                .spawn(move || worker_main(&queue));

            match handle {
                Ok(handle) => threads.push(handle),
                Err(err) => log::error!("Failed to spawn pipeline worker: {}", err),
            }
        }
    }
}

impl Drop for PipelineWorkers {
    fn drop(&mut self) {
        self.queue.stop.store(true, Ordering::Relaxed);
        self.queue.cond.notify_all();

        for handle in self.threads.get_mut().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_main(queue: &WorkerQueue) {
    loop {
        let job = {
            let mut jobs = queue.jobs.lock();

            loop {
                if let Some(job) = jobs.pop_front() {
                    break Some(job);
                }

                if queue.stop.load(Ordering::Relaxed) {
                    break None;
                }

                queue.cond.wait(&mut jobs);
            }
        };

        match job {
            Some(job) => job(),
            None => return,
        }
    }
}
