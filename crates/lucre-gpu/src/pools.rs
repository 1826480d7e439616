//! Per-thread command pools, descriptor pools, and upload semaphores.
//!
//! The set of threads is fixed at startup: the main thread plus every worker
//! thread. Each gets its own pools, looked up by [`ThreadId`]; a thread only
//! allocates from and resets its own entry.

use std::thread::ThreadId;

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::command::CommandPool;
use crate::descriptors::DescriptorPool;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::memory::Buffer;
use crate::sync::TimelineSemaphore;
use crate::upload::{SignalCounter, UploadTracker};

/// A value per registered thread.
#[derive(Debug)]
pub struct PerThread<T> {
    entries: HashMap<ThreadId, T>,
}

impl<T> PerThread<T> {
    /// Build one entry per thread id. Duplicate ids keep their first entry.
    pub fn new(
        threads: impl IntoIterator<Item = ThreadId>,
        mut make: impl FnMut(ThreadId) -> Result<T>,
    ) -> Result<Self> {
        let mut entries = HashMap::new();
        for tid in threads {
            if !entries.contains_key(&tid) {
                entries.insert(tid, make(tid)?);
            }
        }
        Ok(Self { entries })
    }

    /// Entry of a specific thread.
    pub fn get(&self, tid: ThreadId) -> Result<&T> {
        self.entries
            .get(&tid)
            .ok_or_else(|| GpuError::ThreadNotRegistered(format!("{tid:?}")))
    }

    /// Entry of the calling thread.
    pub fn current(&self) -> Result<&T> {
        self.get(std::thread::current().id())
    }

    /// Whether a thread has an entry.
    pub fn contains(&self, tid: ThreadId) -> bool {
        self.entries.contains_key(&tid)
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries.
    pub fn iter(&self) -> impl Iterator<Item = (&ThreadId, &T)> {
        self.entries.iter()
    }
}

/// Pools owned by one thread.
pub struct ThreadResources {
    pub command_pool: CommandPool,
    pub descriptor_pool: DescriptorPool,
    pub upload_semaphore: TimelineSemaphore,
    signal_value: SignalCounter,
    staging: Mutex<UploadTracker<Buffer>>,
    commands: Mutex<UploadTracker<vk::CommandBuffer>>,
}

impl ThreadResources {
    /// Create the pools for one thread.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(gpu: &GpuDevice) -> Result<Self> {
        let device = gpu.device();
        Ok(Self {
            command_pool: CommandPool::new(
                device,
                gpu.graphics_queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?,
            descriptor_pool: DescriptorPool::per_thread(device)?,
            upload_semaphore: TimelineSemaphore::new(device, 0)?,
            signal_value: SignalCounter::default(),
            staging: Mutex::new(UploadTracker::default()),
            commands: Mutex::new(UploadTracker::default()),
        })
    }

    /// Reserve the next value this thread's upload semaphore will be signaled with.
    pub fn next_signal_value(&self) -> u64 {
        self.signal_value.reserve()
    }

    /// The last value reserved with [`Self::next_signal_value`].
    pub fn last_signal_value(&self) -> u64 {
        self.signal_value.last()
    }

    /// Keep a staging buffer alive until the semaphore reaches `value`.
    pub fn track_staging(&self, value: u64, buffer: Buffer) {
        self.staging.lock().track(value, buffer);
    }

    /// Keep an upload command buffer until the semaphore reaches `value`.
    pub fn track_command_buffer(&self, value: u64, cmd: vk::CommandBuffer) {
        self.commands.lock().track(value, cmd);
    }

    /// Return finished upload command buffers to the pool.
    ///
    /// # Safety
    /// Call only from the thread owning these pools.
    pub unsafe fn reclaim_command_buffers(&self, gpu: &GpuDevice) -> Result<usize> {
        let completed = self.upload_semaphore.value(gpu.device())?;
        let done = self.commands.lock().reclaim(completed);
        for &cmd in &done {
            self.command_pool.free(gpu, cmd);
        }
        Ok(done.len())
    }

    /// Staging buffers still waiting on the GPU.
    pub fn staging_in_flight(&self) -> usize {
        self.staging.lock().len()
    }

    /// Free staging buffers whose upload the GPU has finished.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reclaim_staging(&self, gpu: &GpuDevice) -> Result<usize> {
        let completed = self.upload_semaphore.value(gpu.device())?;
        let done = self.staging.lock().reclaim(completed);
        let count = done.len();
        for buffer in done {
            gpu.free_buffer(buffer);
        }
        Ok(count)
    }

    /// Destroy the pools.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, gpu: &GpuDevice) {
        let device = gpu.device();
        for buffer in self.staging.lock().drain() {
            gpu.free_buffer(buffer);
        }
        self.command_pool.destroy(device);
        self.descriptor_pool.destroy(device);
        self.upload_semaphore.destroy(device);
    }
}

/// Per-thread pools for every registered thread.
pub struct ResourcePools {
    threads: PerThread<ThreadResources>,
}

impl ResourcePools {
    /// Create pools for the given threads.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(gpu: &GpuDevice, threads: impl IntoIterator<Item = ThreadId>) -> Result<Self> {
        let threads = PerThread::new(threads, |_| ThreadResources::new(gpu))?;
        tracing::debug!("Created resource pools for {} threads", threads.len());
        Ok(Self { threads })
    }

    /// Pools of the calling thread.
    pub fn current(&self) -> Result<&ThreadResources> {
        self.threads.current()
    }

    /// Pools of a specific thread.
    pub fn get(&self, tid: ThreadId) -> Result<&ThreadResources> {
        self.threads.get(tid)
    }

    /// Command pool of the calling thread.
    pub fn command_pool(&self) -> Result<&CommandPool> {
        Ok(&self.current()?.command_pool)
    }

    /// Descriptor pool of the calling thread.
    pub fn descriptor_pool(&self) -> Result<&DescriptorPool> {
        Ok(&self.current()?.descriptor_pool)
    }

    /// Upload semaphore of the calling thread.
    pub fn upload_semaphore(&self) -> Result<TimelineSemaphore> {
        Ok(self.current()?.upload_semaphore)
    }

    /// Reset a thread's command pool.
    ///
    /// # Safety
    /// None of the pool's command buffers may be pending; call from the owning thread.
    pub unsafe fn reset_command_pool(&self, gpu: &GpuDevice, tid: ThreadId) -> Result<()> {
        self.get(tid)?.command_pool.reset(gpu)
    }

    /// Reset a thread's descriptor pool.
    ///
    /// # Safety
    /// None of the pool's sets may be in use; call from the owning thread.
    pub unsafe fn reset_descriptor_pool(&self, gpu: &GpuDevice, tid: ThreadId) -> Result<()> {
        self.get(tid)?.descriptor_pool.reset(gpu)
    }

    /// Number of registered threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Free finished staging buffers of every thread.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn reclaim_all_staging(&self, gpu: &GpuDevice) -> Result<usize> {
        let mut total = 0;
        for (_, resources) in self.threads.iter() {
            total += resources.reclaim_staging(gpu)?;
        }
        Ok(total)
    }

    /// Destroy every thread's pools.
    ///
    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&self, gpu: &GpuDevice) {
        for (_, resources) in self.threads.iter() {
            resources.destroy(gpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use std::sync::{Arc, Barrier};

    #[test]
    fn each_thread_resolves_its_own_entry() {
        let map = Arc::new(RwLock::new(None::<PerThread<ThreadId>>));
        let ready = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let map = Arc::clone(&map);
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || {
                    ready.wait();
                    let guard = map.read();
                    let per_thread = guard.as_ref().unwrap();
                    *per_thread.current().unwrap() == std::thread::current().id()
                })
            })
            .collect();

        let main = std::thread::current().id();
        let ids = workers.iter().map(|h| h.thread().id()).chain([main]);
        *map.write() = Some(PerThread::new(ids, Ok).unwrap());
        ready.wait();

        for worker in workers {
            assert!(worker.join().unwrap());
        }
        let guard = map.read();
        let per_thread = guard.as_ref().unwrap();
        assert_eq!(per_thread.len(), 4);
        assert_eq!(*per_thread.current().unwrap(), main);
    }

    #[test]
    fn unregistered_threads_are_rejected() {
        let per_thread: PerThread<u32> = PerThread::new(std::iter::empty(), |_| Ok(0)).unwrap();
        assert!(matches!(
            per_thread.current(),
            Err(GpuError::ThreadNotRegistered(_))
        ));
    }

    #[test]
    fn duplicate_ids_create_one_entry() {
        let main = std::thread::current().id();
        let mut made = 0;
        let per_thread = PerThread::new([main, main], |_| {
            made += 1;
            Ok(made)
        })
        .unwrap();
        assert_eq!(per_thread.len(), 1);
        assert_eq!(*per_thread.current().unwrap(), 1);
    }
}
