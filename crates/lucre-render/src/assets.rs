//! Asset upload on worker threads.
//!
//! Two rayon pools do the work: primary for texture decode and upload,
//! secondary for model uploads and IBL decoding. Every worker thread (plus the
//! thread creating the uploader) is registered in [`ResourcePools`], so a
//! worker records and submits on its own command pool and signals its own
//! timeline semaphore. Results come back either through a [`TaskHandle`] or
//! through the completion queue drained by the main thread.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::ThreadId;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use lucre_gpu::{GpuDevice, ResourcePools, UploadTicket};

use crate::error::{RenderError, Result};
use crate::ibl::{DecodedIbl, IblBuilder};
use crate::model::{Builder, Model};
use crate::texture::{upload_texture, DecodedImage, Texture};

/// Which worker pool runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPool {
    Primary,
    Secondary,
}

/// Result of a task running on a worker pool.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T>>,
    taken: bool,
}

impl<T> TaskHandle<T> {
    fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx, taken: false }
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| RenderError::TaskFailed("worker dropped the task".to_string()))?
    }

    /// The result, if the task has finished. Yields it at most once.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if self.taken {
            return None;
        }
        let result = match self.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => Err(RenderError::TaskFailed(
                "worker dropped the task".to_string(),
            )),
        };
        self.taken = true;
        Some(result)
    }
}

/// An upload finished on a worker, waiting for the main thread to adopt it.
#[derive(Debug)]
pub enum CompletedUpload {
    Texture {
        name: String,
        texture: Texture,
        ticket: UploadTicket,
    },
    Model {
        name: String,
        model: Model,
    },
    Failed {
        name: String,
        error: RenderError,
    },
}

fn build_pool(kind: &'static str, threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("lucre-{kind}-{i}"))
        .build()
        .map_err(|e| RenderError::TaskFailed(format!("{kind} pool: {e}")))
}

/// Ids of every thread in `pool`, gathered by running a job on each.
pub fn worker_thread_ids(pool: &rayon::ThreadPool) -> Vec<ThreadId> {
    pool.broadcast(|_| std::thread::current().id())
}

/// Worker pools and the per-thread GPU resources they upload with.
pub struct AssetUploader {
    gpu: Arc<GpuDevice>,
    pools: Arc<ResourcePools>,
    primary: rayon::ThreadPool,
    secondary: rayon::ThreadPool,
    completed_tx: Sender<CompletedUpload>,
    completed_rx: Receiver<CompletedUpload>,
}

impl AssetUploader {
    /// Spin up both pools and register their threads and the calling thread.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        gpu: Arc<GpuDevice>,
        primary_workers: usize,
        secondary_workers: usize,
    ) -> Result<Self> {
        let primary = build_pool("primary", primary_workers)?;
        let secondary = build_pool("secondary", secondary_workers)?;

        let threads: Vec<ThreadId> = std::iter::once(std::thread::current().id())
            .chain(worker_thread_ids(&primary))
            .chain(worker_thread_ids(&secondary))
            .collect();
        let pools = Arc::new(ResourcePools::new(&gpu, threads)?);
        let (completed_tx, completed_rx) = channel::unbounded();

        tracing::info!(
            "Asset uploader: {} primary, {} secondary workers",
            primary.current_num_threads(),
            secondary.current_num_threads()
        );

        Ok(Self {
            gpu,
            pools,
            primary,
            secondary,
            completed_tx,
            completed_rx,
        })
    }

    pub fn gpu(&self) -> &Arc<GpuDevice> {
        &self.gpu
    }

    /// Per-thread pools of every registered thread.
    pub fn pools(&self) -> &Arc<ResourcePools> {
        &self.pools
    }

    fn pool(&self, kind: WorkerPool) -> &rayon::ThreadPool {
        match kind {
            WorkerPool::Primary => &self.primary,
            WorkerPool::Secondary => &self.secondary,
        }
    }

    /// Run `task` on a worker. The task runs on a registered thread, so it may
    /// use the calling thread's entry in the pools.
    pub fn spawn<T, F>(&self, kind: WorkerPool, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&GpuDevice, &ResourcePools) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let gpu = Arc::clone(&self.gpu);
        let pools = Arc::clone(&self.pools);
        self.pool(kind).spawn(move || {
            if tx.send(task(&gpu, &pools)).is_err() {
                tracing::trace!("Task finished after its handle was dropped");
            }
        });
        TaskHandle::new(rx)
    }

    /// Decode and upload a texture; an undecodable file becomes the placeholder.
    pub fn load_texture(&self, path: PathBuf, srgb: bool) -> TaskHandle<(Texture, UploadTicket)> {
        self.spawn(WorkerPool::Primary, move |gpu, pools| {
            let decoded = DecodedImage::load_or_placeholder(&path);
            let name = path.display().to_string();
            // SAFETY: worker threads are registered in `pools`
            unsafe { upload_texture(gpu, pools, &decoded, srgb, &name) }
        })
    }

    /// Upload a model built elsewhere.
    pub fn upload_model(&self, builder: Builder, name: String) -> TaskHandle<Model> {
        self.spawn(WorkerPool::Secondary, move |gpu, pools| {
            // SAFETY: worker threads are registered in `pools`
            unsafe { Model::upload(gpu, pools, &builder, &name) }
        })
    }

    /// Decode the nine IBL files; the decode fans out over the secondary pool.
    pub fn decode_ibl(&self, builder: IblBuilder) -> TaskHandle<DecodedIbl> {
        self.spawn(WorkerPool::Secondary, move |_, _| builder.decode())
    }

    /// Decode and upload a texture, delivering it through the completion queue.
    pub fn queue_texture(&self, path: PathBuf, srgb: bool) {
        let tx = self.completed_tx.clone();
        let gpu = Arc::clone(&self.gpu);
        let pools = Arc::clone(&self.pools);
        self.primary.spawn(move || {
            let name = path.display().to_string();
            let decoded = DecodedImage::load_or_placeholder(&path);
            // SAFETY: worker threads are registered in `pools`
            let upload = match unsafe { upload_texture(&gpu, &pools, &decoded, srgb, &name) } {
                Ok((texture, ticket)) => CompletedUpload::Texture {
                    name,
                    texture,
                    ticket,
                },
                Err(error) => CompletedUpload::Failed { name, error },
            };
            deliver(&tx, upload, |upload| {
                // SAFETY: the texture was created on `gpu` and never handed out
                unsafe { discard(&gpu, upload) }
            });
        });
    }

    /// Upload a model, delivering it through the completion queue.
    pub fn queue_model(&self, builder: Builder, name: String) {
        let tx = self.completed_tx.clone();
        let gpu = Arc::clone(&self.gpu);
        let pools = Arc::clone(&self.pools);
        self.secondary.spawn(move || {
            // SAFETY: worker threads are registered in `pools`
            let upload = match unsafe { Model::upload(&gpu, &pools, &builder, &name) } {
                Ok(model) => CompletedUpload::Model { name, model },
                Err(error) => CompletedUpload::Failed { name, error },
            };
            deliver(&tx, upload, |upload| {
                // SAFETY: the model was created on `gpu` and never handed out
                unsafe { discard(&gpu, upload) }
            });
        });
    }

    /// Everything finished since the last call, without blocking.
    pub fn drain_completed(&self) -> Vec<CompletedUpload> {
        self.completed_rx.try_iter().collect()
    }

    /// Free staging buffers whose uploads have landed.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reclaim(&self) -> Result<usize> {
        Ok(self.pools.reclaim_all_staging(&self.gpu)?)
    }

    /// Wait for in-flight uploads and destroy every thread's pools.
    ///
    /// Uploads still queued on the workers are dropped.
    ///
    /// # Safety
    /// No other clone of the pools may be used afterwards.
    pub unsafe fn destroy(self) -> Result<()> {
        let Self {
            gpu,
            pools,
            primary,
            secondary,
            completed_rx,
            ..
        } = self;
        drop(primary);
        drop(secondary);
        gpu.wait_idle()?;
        for upload in completed_rx.try_iter() {
            match upload {
                CompletedUpload::Texture { texture, .. } => texture.destroy(&gpu),
                CompletedUpload::Model { model, .. } => model.destroy(&gpu),
                CompletedUpload::Failed { .. } => {}
            }
        }
        pools.destroy(&gpu);
        Ok(())
    }
}

/// Send `item`, or hand it to `discard` when the receiver is gone.
///
/// Returns whether the item was delivered.
fn deliver<T>(tx: &Sender<T>, item: T, discard: impl FnOnce(T)) -> bool {
    match tx.send(item) {
        Ok(()) => true,
        Err(channel::SendError(item)) => {
            tracing::trace!("Completion queue closed, freeing the upload on the worker");
            discard(item);
            false
        }
    }
}

/// Free an upload nobody will adopt once its copy has landed.
///
/// # Safety
/// The upload's resources must belong to `gpu` and be referenced nowhere else.
unsafe fn discard(gpu: &GpuDevice, upload: CompletedUpload) {
    match upload {
        CompletedUpload::Texture {
            name,
            texture,
            ticket,
        } => match ticket.wait(gpu.device()) {
            Ok(()) => texture.destroy(gpu),
            Err(e) => tracing::warn!("Leaking texture {name}: {e}"),
        },
        CompletedUpload::Model { name, model } => match model.ticket.wait(gpu.device()) {
            Ok(()) => model.destroy(gpu),
            Err(e) => tracing::warn!("Leaking model {name}: {e}"),
        },
        CompletedUpload::Failed { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_worker_once() {
        let pool = build_pool("test", 3).unwrap();
        let mut ids = worker_thread_ids(&pool);
        assert_eq!(ids.len(), 3);
        ids.sort_by_key(|id| format!("{id:?}"));
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&std::thread::current().id()));
    }

    #[test]
    fn zero_workers_still_builds_one_thread() {
        let pool = build_pool("test", 0).unwrap();
        assert_eq!(pool.current_num_threads(), 1);
    }

    #[test]
    fn task_handle_yields_result_once() {
        let (tx, rx) = channel::bounded(1);
        let mut handle = TaskHandle::new(rx);
        assert!(handle.try_take().is_none());
        tx.send(Ok(7)).unwrap();
        assert_eq!(handle.try_take().unwrap().unwrap(), 7);
        assert!(handle.try_take().is_none());
    }

    #[test]
    fn delivered_uploads_are_not_discarded() {
        let (tx, rx) = channel::unbounded();
        let mut discarded = Vec::new();
        assert!(deliver(&tx, "albedo", |item| discarded.push(item)));
        assert!(discarded.is_empty());
        assert_eq!(rx.try_recv().unwrap(), "albedo");
    }

    #[test]
    fn uploads_without_a_receiver_are_discarded() {
        let (tx, rx) = channel::unbounded();
        drop(rx);
        let mut discarded = Vec::new();
        assert!(!deliver(&tx, "albedo", |item| discarded.push(item)));
        assert_eq!(discarded, vec!["albedo"]);
    }

    #[test]
    fn dropped_task_reports_failure() {
        let (tx, rx) = channel::bounded::<Result<u32>>(1);
        drop(tx);
        let err = TaskHandle::new(rx).wait().unwrap_err();
        assert!(matches!(err, RenderError::TaskFailed(_)));
    }
}
