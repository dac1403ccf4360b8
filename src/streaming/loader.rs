/// Loader Pipeline
///
/// Worker threads that turn scheduled requests into published slots.
///
/// Without a transform every worker runs the whole load:
/// `pop -> acquire cache slot -> read -> publish`.
///
/// With a transform, reader workers fill a staging buffer and hand its slot
/// id over a bounded channel to transform workers, which acquire the cache
/// slot, transform and publish. The channel holds at most one message per
/// staging slot, so sending never blocks. A stage that cannot get a slot in
/// time returns the job to the scheduler instead of waiting on the stage
/// before it.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{StreamError, StreamResult};
use crate::memory::SlotId;
use crate::streaming::request::LoadJob;
use crate::streaming::stream_cache::CacheCore;

pub struct LoaderPipeline {
    core: Arc<CacheCore>,
    workers: Vec<JoinHandle<()>>,
}

impl LoaderPipeline {
    /// Spawn the worker threads for `core`
    pub(crate) fn start(core: Arc<CacheCore>) -> StreamResult<Self> {
        // Dropping a half-built pipeline joins whatever already started
        let mut pipeline = Self { core: core.clone(), workers: Vec::new() };
        let loader_threads = core.config.loader_threads;

        match &core.staging {
            None => {
                for index in 0..loader_threads {
                    let core = core.clone();
                    pipeline.workers.push(spawn(format!("tile-loader-{}", index), move || run_direct(&core))?);
                }
            }
            Some(staging) => {
                let (sender, receiver) = bounded::<SlotId>(staging.slot_count());
                for index in 0..loader_threads {
                    let core = core.clone();
                    let sender = sender.clone();
                    pipeline
                        .workers
                        .push(spawn(format!("tile-loader-{}", index), move || run_reader(&core, &sender))?);
                }
                for index in 0..core.config.transform_threads {
                    let core = core.clone();
                    let receiver = receiver.clone();
                    pipeline
                        .workers
                        .push(spawn(format!("tile-transform-{}", index), move || run_transform(&core, &receiver))?);
                }
            }
        }

        log::info!(
            "[LoaderPipeline::start] {} workers ({})",
            pipeline.workers.len(),
            if core.staging.is_some() { "read + transform" } else { "direct" }
        );
        Ok(pipeline)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop handing out jobs and join every worker. In-flight loads finish
    /// first; queued requests are left in the scheduler.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.core.running.store(false, Ordering::Release);
        self.core.scheduler.shutdown();
        self.core.pool.wake_all();
        if let Some(staging) = &self.core.staging {
            staging.wake_all();
        }

        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("tile-worker").to_string();
            if worker.join().is_err() {
                log::error!("[LoaderPipeline::shutdown] {} panicked", name);
            }
        }
        log::info!("[LoaderPipeline::shutdown] all workers stopped");
    }
}

impl Drop for LoaderPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn<F>(name: String, body: F) -> StreamResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        log::debug!("[LoaderPipeline] {} started", name);
        body();
        log::debug!("[LoaderPipeline] {} stopped", name);
    })?;
    Ok(handle)
}

fn next_job(core: &CacheCore) -> Option<LoadJob> {
    if !core.running.load(Ordering::Acquire) {
        return None;
    }
    core.scheduler.pop_highest(core.config.idle_wait())
}

fn run_direct(core: &CacheCore) {
    while core.running.load(Ordering::Acquire) {
        if let Some(job) = next_job(core) {
            load_direct(core, job);
        }
    }
}

fn load_direct(core: &CacheCore, job: LoadJob) {
    let Some(slot) = core.acquire_cache_slot(&job) else {
        return;
    };

    let length = job.extent.length as usize;
    let read = core.pool.with_write(slot, |buf| core.store.read_at(job.extent.offset, &mut buf[..length]));

    match read {
        Ok(Ok(())) => core.publish(slot, length, &job),
        Ok(Err(source)) => {
            core.discard_slot(slot);
            core.retry_or_fail(
                job,
                StreamError::TransientIo { id: job.id, offset: job.extent.offset, length: job.extent.length, source },
            );
        }
        Err(e) => {
            core.discard_slot(slot);
            core.retry_or_fail(job, e);
        }
    }
}

fn run_reader(core: &CacheCore, sender: &Sender<SlotId>) {
    while core.running.load(Ordering::Acquire) {
        if let Some(job) = next_job(core) {
            read_raw(core, job, sender);
        }
    }
}

/// Stage one: raw bytes into a staging buffer
fn read_raw(core: &CacheCore, job: LoadJob, sender: &Sender<SlotId>) {
    let Some(staging) = &core.staging else {
        return;
    };
    let Some(raw_slot) = staging.acquire_free(core.config.acquire_timeout(), |_, _| {}) else {
        core.requeue_exhausted(job, "staging");
        return;
    };
    staging.set_assoc(raw_slot, job);

    let length = job.extent.length as usize;
    let read = staging.with_write(raw_slot, |buf| core.store.read_at(job.extent.offset, &mut buf[..length]));

    let error = match read {
        Ok(Ok(())) => match sender.send(raw_slot) {
            Ok(()) => return,
            Err(_) => StreamError::ShutDown { component: "transform stage".to_string() },
        },
        Ok(Err(source)) => {
            StreamError::TransientIo { id: job.id, offset: job.extent.offset, length: job.extent.length, source }
        }
        Err(e) => e,
    };

    if let Err(e) = staging.recycle(raw_slot) {
        log::error!("[LoaderPipeline::read_raw] staging slot {}: {}", raw_slot, e);
    }
    core.retry_or_fail(job, error);
}

fn run_transform(core: &CacheCore, receiver: &Receiver<SlotId>) {
    loop {
        match receiver.recv_timeout(core.config.idle_wait()) {
            Ok(raw_slot) => transform_raw(core, raw_slot),
            Err(RecvTimeoutError::Timeout) => {
                if !core.running.load(Ordering::Acquire) && receiver.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Stage two: staging buffer through the transform into a cache slot
fn transform_raw(core: &CacheCore, raw_slot: SlotId) {
    let (Some(staging), Some(transform)) = (&core.staging, &core.transform) else {
        return;
    };
    let Some(job) = staging.assoc(raw_slot) else {
        log::error!("[LoaderPipeline::transform_raw] staging slot {} carries no job", raw_slot);
        if let Err(e) = staging.recycle(raw_slot) {
            log::error!("[LoaderPipeline::transform_raw] staging slot {}: {}", raw_slot, e);
        }
        return;
    };

    if let Some(slot) = core.acquire_cache_slot(&job) {
        let length = job.extent.length as usize;
        let result = staging
            .with_write(raw_slot, |raw| core.pool.with_write(slot, |out| transform.transform(job.id, &raw[..length], out)))
            .and_then(|inner| inner)
            .and_then(|result| result);

        match result {
            Ok(written) if written <= core.pool.slot_size() => core.publish(slot, written, &job),
            Ok(written) => {
                core.discard_slot(slot);
                core.retry_or_fail(
                    job,
                    StreamError::TransformFailed {
                        id: job.id,
                        reason: format!("wrote {} bytes into a {} byte slot", written, core.pool.slot_size()),
                    },
                );
            }
            Err(e) => {
                core.discard_slot(slot);
                core.retry_or_fail(job, e);
            }
        }
    }

    if let Err(e) = staging.recycle(raw_slot) {
        log::error!("[LoaderPipeline::transform_raw] staging slot {}: {}", raw_slot, e);
    }
}
