//! Staging uploads signaled through per-thread timeline semaphores.
//!
//! A worker records copies on its own command pool and submits them with its
//! upload semaphore set to a freshly reserved value. The returned
//! [`UploadTicket`] travels with the asset; the consumer waits on it before
//! recording anything that reads the destination.

use std::sync::atomic::{AtomicU64, Ordering};

use ash::vk;

use crate::command::{begin_command_buffer, end_command_buffer};
use crate::device::GpuDevice;
use crate::error::Result;
use crate::memory::{Buffer, MemoryUsage};
use crate::pools::{ResourcePools, ThreadResources};
use crate::sync::TimelineSemaphore;

/// Proof of a submitted upload: the semaphore and the value it will reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTicket {
    pub semaphore: TimelineSemaphore,
    pub value: u64,
}

impl UploadTicket {
    /// A ticket that is already satisfied (nothing was uploaded).
    pub fn ready() -> Self {
        Self {
            semaphore: TimelineSemaphore {
                semaphore: vk::Semaphore::null(),
            },
            value: 0,
        }
    }

    /// Whether waiting is a no-op.
    pub fn is_ready_trivially(&self) -> bool {
        self.value == 0
    }

    /// Block until the upload has completed.
    ///
    /// # Safety
    /// The semaphore must still exist.
    pub unsafe fn wait(&self, device: &ash::Device) -> Result<()> {
        if self.is_ready_trivially() {
            return Ok(());
        }
        self.semaphore.wait(device, self.value, u64::MAX)
    }

    /// Whether the upload has completed, without blocking.
    ///
    /// # Safety
    /// The semaphore must still exist.
    pub unsafe fn is_complete(&self, device: &ash::Device) -> Result<bool> {
        if self.is_ready_trivially() {
            return Ok(true);
        }
        Ok(self.semaphore.value(device)? >= self.value)
    }
}

/// Values a thread's upload semaphore will be signaled with, starting at 1.
#[derive(Debug, Default)]
pub struct SignalCounter(AtomicU64);

impl SignalCounter {
    /// Reserve the next value.
    pub fn reserve(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// The last value reserved; 0 before the first upload.
    pub fn last(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Resources kept alive until a timeline value is reached.
#[derive(Debug)]
pub struct UploadTracker<T> {
    pending: Vec<(u64, T)>,
}

impl<T> Default for UploadTracker<T> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
        }
    }
}

impl<T> UploadTracker<T> {
    /// Hold `item` until the counter reaches `value`.
    pub fn track(&mut self, value: u64, item: T) {
        self.pending.push((value, item));
    }

    /// Release every item whose value is `<= completed`.
    pub fn reclaim(&mut self, completed: u64) -> Vec<T> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(value, _)| *value <= completed);
        self.pending = pending;
        done.into_iter().map(|(_, item)| item).collect()
    }

    /// Release everything. Only valid after a device wait-idle.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(_, item)| item)
            .collect()
    }

    /// Number of held items.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Record `record` on the calling thread's pool and submit it, signaling the
/// thread's upload semaphore. Staging buffers are held until the GPU is done.
///
/// # Safety
/// The calling thread must be registered and every handle `record` uses valid.
pub unsafe fn submit_upload<F>(
    gpu: &GpuDevice,
    pools: &ResourcePools,
    staging: Vec<Buffer>,
    record: F,
) -> Result<UploadTicket>
where
    F: FnOnce(vk::CommandBuffer),
{
    let resources = pools.current()?;
    resources.reclaim_staging(gpu)?;
    resources.reclaim_command_buffers(gpu)?;

    let device = gpu.device();
    let cmd = resources
        .command_pool
        .allocate(gpu, vk::CommandBufferLevel::PRIMARY)?;
    begin_command_buffer(device, cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
    record(cmd);
    end_command_buffer(device, cmd)?;

    let ticket = signal_ticket(resources);
    let signal_values = [ticket.value];
    let mut timeline_info =
        vk::TimelineSemaphoreSubmitInfo::default().signal_semaphore_values(&signal_values);
    let cmds = [cmd];
    let signals = [ticket.semaphore.semaphore];
    let submit = vk::SubmitInfo::default()
        .command_buffers(&cmds)
        .signal_semaphores(&signals)
        .push_next(&mut timeline_info);

    gpu.submit(&[submit], vk::Fence::null())?;

    resources.track_command_buffer(ticket.value, cmd);
    for buffer in staging {
        resources.track_staging(ticket.value, buffer);
    }

    Ok(ticket)
}

fn signal_ticket(resources: &ThreadResources) -> UploadTicket {
    UploadTicket {
        semaphore: resources.upload_semaphore,
        value: resources.next_signal_value(),
    }
}

/// Create a device-local buffer filled with `data` via a staging copy.
///
/// The buffer must not be read by the GPU until the returned ticket is waited on.
///
/// # Safety
/// The calling thread must be registered in `pools`.
pub unsafe fn create_device_local_buffer(
    gpu: &GpuDevice,
    pools: &ResourcePools,
    data: &[u8],
    usage: vk::BufferUsageFlags,
    name: &str,
) -> Result<(Buffer, UploadTicket)> {
    let size = data.len() as u64;

    let staging = gpu.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::HostVisible,
        &format!("{name}_staging"),
    )?;
    staging.write_bytes(0, data)?;

    let destination = gpu.create_buffer(
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::DeviceLocal,
        name,
    )?;

    let region = vk::BufferCopy::default()
        .src_offset(staging.offset)
        .dst_offset(destination.offset)
        .size(size);
    let (src, dst) = (staging.buffer, destination.buffer);
    let device = gpu.device();

    let ticket = submit_upload(gpu, pools, vec![staging], |cmd| {
        device.cmd_copy_buffer(cmd, src, dst, &[region]);
    })?;

    Ok((destination, ticket))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_are_released_once_their_value_is_reached() {
        let mut tracker = UploadTracker::default();
        tracker.track(1, "a");
        tracker.track(2, "b");
        tracker.track(3, "c");

        assert!(tracker.reclaim(0).is_empty());
        assert_eq!(tracker.reclaim(2), vec!["a", "b"]);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.reclaim(10), vec!["c"]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn drain_releases_everything() {
        let mut tracker = UploadTracker::default();
        tracker.track(5, 1);
        tracker.track(9, 2);
        assert_eq!(tracker.drain(), vec![1, 2]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn each_worker_signals_strictly_increasing_values() {
        use crate::pools::PerThread;
        use parking_lot::RwLock;
        use std::sync::{Arc, Barrier};
        use std::thread::ThreadId;

        let counters = Arc::new(RwLock::new(None::<PerThread<SignalCounter>>));
        let ready = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let counters = Arc::clone(&counters);
                let ready = Arc::clone(&ready);
                std::thread::spawn(move || {
                    ready.wait();
                    let guard = counters.read();
                    let counter = guard.as_ref().unwrap().current().unwrap();
                    (0..50).map(|_| counter.reserve()).collect::<Vec<u64>>()
                })
            })
            .collect();

        let ids: Vec<ThreadId> = workers.iter().map(|h| h.thread().id()).collect();
        *counters.write() = Some(PerThread::new(ids.clone(), |_| Ok(SignalCounter::default())).unwrap());
        ready.wait();

        for (worker, id) in workers.into_iter().zip(ids) {
            let values = worker.join().unwrap();
            assert_eq!(values, (1..=50).collect::<Vec<u64>>());
            let guard = counters.read();
            assert_eq!(guard.as_ref().unwrap().get(id).unwrap().last(), 50);
        }
    }

    #[test]
    fn consumer_sees_uploads_in_signal_order() {
        let counter = SignalCounter::default();
        assert_eq!(counter.last(), 0);

        let mut staging = UploadTracker::default();
        for name in ["mesh", "albedo", "normal"] {
            staging.track(counter.reserve(), name);
        }
        assert_eq!(counter.last(), 3);

        // The semaphore has reached the mesh upload only
        assert_eq!(staging.reclaim(1), vec!["mesh"]);
        // A later value releases everything signaled before it
        assert_eq!(staging.reclaim(counter.last()), vec!["albedo", "normal"]);
        assert!(staging.is_empty());
    }

    #[test]
    fn ready_tickets_need_no_wait() {
        assert!(UploadTicket::ready().is_ready_trivially());
    }
}
