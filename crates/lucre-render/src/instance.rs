//! Per-instance transforms in host-visible buffers.
//!
//! Each in-flight slot owns a copy, bound both as a vertex stream (instanced
//! pipelines) and as a storage buffer (bindless pipelines).

use ash::vk;
use glam::Mat4;
use lucre_core::constants::MAX_FRAMES_IN_FLIGHT;
use lucre_entity::Transform;
use lucre_gpu::{Buffer, GpuDevice, MemoryUsage};

use crate::error::Result;

/// One instance record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct InstanceData {
    pub model: [[f32; 4]; 4],
    pub normal: [[f32; 4]; 4],
}

impl Default for InstanceData {
    fn default() -> Self {
        Self::from_matrices(Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

impl InstanceData {
    pub fn from_matrices(model: Mat4, normal: Mat4) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            normal: normal.to_cols_array_2d(),
        }
    }
}

impl From<&Transform> for InstanceData {
    fn from(transform: &Transform) -> Self {
        Self::from_matrices(transform.matrix(), transform.normal_matrix())
    }
}

/// Local instance records plus, per in-flight slot, whether that slot's copy
/// lags behind them.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    records: Vec<InstanceData>,
    /// Bit `n` set while slot `n` needs a flush.
    stale: u32,
    slots: usize,
}

impl InstanceStore {
    /// `count` identity instances mirrored into `slots` copies, all initially stale.
    pub fn new(count: usize, slots: usize) -> Self {
        let slots = slots.clamp(1, u32::BITS as usize);
        let mut store = Self {
            records: vec![InstanceData::default(); count],
            stale: 0,
            slots,
        };
        store.mark_all_stale();
        store
    }

    fn mark_all_stale(&mut self) {
        self.stale = u32::MAX >> (u32::BITS as usize - self.slots);
    }

    /// Number of instances.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of slot copies.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Set one instance. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, transform: &Transform) -> bool {
        let Some(slot) = self.records.get_mut(index) else {
            return false;
        };
        let record = InstanceData::from(transform);
        if *slot != record {
            *slot = record;
            self.mark_all_stale();
        }
        true
    }

    pub fn get(&self, index: usize) -> Option<&InstanceData> {
        self.records.get(index)
    }

    /// Whether any slot still needs a flush.
    pub fn is_dirty(&self) -> bool {
        self.stale != 0
    }

    pub fn is_stale(&self, slot: usize) -> bool {
        slot < self.slots && self.stale & (1 << slot) != 0
    }

    /// Hand the records to `flush` if `slot` is stale, then mark it current.
    pub fn take_dirty<E>(
        &mut self,
        slot: usize,
        flush: impl FnOnce(&[InstanceData]) -> std::result::Result<(), E>,
    ) -> std::result::Result<bool, E> {
        if !self.is_stale(slot) {
            return Ok(false);
        }
        flush(&self.records)?;
        self.stale &= !(1 << slot);
        Ok(true)
    }
}

/// Instance records mirrored into one host-visible, coherent buffer per
/// in-flight slot, so a frame never overwrites records the GPU is still reading.
#[derive(Debug)]
pub struct InstanceBuffer {
    store: InstanceStore,
    buffers: Vec<Buffer>,
}

impl InstanceBuffer {
    /// Create buffers for `count` instances, one per in-flight slot.
    pub fn new(gpu: &GpuDevice, count: usize, name: &str) -> Result<Self> {
        let size = (count.max(1) * std::mem::size_of::<InstanceData>()) as u64;
        let mut buffers = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            let buffer = gpu.create_buffer(
                size,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryUsage::HostVisible,
                &format!("{name}[{slot}]"),
            );
            match buffer {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        gpu.free_buffer(buffer);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(Self {
            store: InstanceStore::new(count, MAX_FRAMES_IN_FLIGHT),
            buffers,
        })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// The copy read by frames recorded in `slot`.
    pub fn buffer(&self, slot: usize) -> Option<&Buffer> {
        self.buffers.get(slot)
    }

    /// Update one instance and mark every slot stale.
    pub fn set_instance(&mut self, index: usize, transform: &Transform) -> bool {
        self.store.set(index, transform)
    }

    /// Copy the records into `slot`'s buffer if it missed a change.
    pub fn update(&mut self, slot: usize) -> Result<bool> {
        let Some(buffer) = self.buffers.get(slot) else {
            return Ok(false);
        };
        Ok(self.store.take_dirty(slot, |records| buffer.write(records))?)
    }

    /// Bind `slot`'s copy as the instance vertex stream.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: usize) {
        let Some(buffer) = self.buffers.get(slot) else {
            return;
        };
        device.cmd_bind_vertex_buffers(
            cmd,
            crate::model::INSTANCE_BINDING,
            &[buffer.buffer],
            &[buffer.offset],
        );
    }

    /// Retire every slot's buffer.
    pub fn destroy(self, gpu: &GpuDevice) {
        for buffer in self.buffers {
            gpu.free_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn flush_all(store: &mut InstanceStore) {
        for slot in 0..store.slots() {
            store.take_dirty(slot, |_| Ok::<_, ()>(())).unwrap();
        }
    }

    #[test]
    fn setting_a_transform_marks_dirty_until_flushed() {
        let mut store = InstanceStore::new(4, 1);
        let mut flushed = 0;
        assert!(store
            .take_dirty(0, |r| {
                flushed = r.len();
                Ok::<_, ()>(())
            })
            .unwrap());
        assert_eq!(flushed, 4);
        assert!(!store.is_dirty());

        assert!(store.set(2, &Transform::from_position(Vec3::X)));
        assert!(store.is_dirty());
        assert_eq!(store.get(2).unwrap().model[3], [1.0, 0.0, 0.0, 1.0]);
        assert!(store.take_dirty(0, |_| Ok::<_, ()>(())).unwrap());
    }

    #[test]
    fn change_reaches_every_slot_once() {
        let mut store = InstanceStore::new(2, MAX_FRAMES_IN_FLIGHT);
        flush_all(&mut store);

        store.set(1, &Transform::from_position(Vec3::Y));
        // Frame N writes its own copy; the copy a previous frame may still be
        // reading stays stale until its slot comes around.
        assert!(store.take_dirty(0, |_| Ok::<_, ()>(())).unwrap());
        assert!(!store.is_stale(0));
        for slot in 1..MAX_FRAMES_IN_FLIGHT {
            assert!(store.is_stale(slot));
        }
        assert!(!store.take_dirty(0, |_| Ok::<_, ()>(())).unwrap());

        for slot in 1..MAX_FRAMES_IN_FLIGHT {
            let mut seen = None;
            assert!(store
                .take_dirty(slot, |r| {
                    seen = Some(r[1]);
                    Ok::<_, ()>(())
                })
                .unwrap());
            assert_eq!(seen.unwrap().model[3], [0.0, 1.0, 0.0, 1.0]);
        }
        assert!(!store.is_dirty());
    }

    #[test]
    fn change_between_slot_flushes_restales_flushed_slots() {
        let mut store = InstanceStore::new(1, 3);
        flush_all(&mut store);

        store.set(0, &Transform::from_position(Vec3::X));
        store.take_dirty(0, |_| Ok::<_, ()>(())).unwrap();
        store.set(0, &Transform::from_position(Vec3::Z));
        assert!((0..3).all(|slot| store.is_stale(slot)));
    }

    #[test]
    fn clean_store_skips_flush() {
        let mut store = InstanceStore::new(1, 1);
        store.take_dirty(0, |_| Ok::<_, ()>(())).unwrap();
        let flushed =
            store.take_dirty(0, |_| -> std::result::Result<(), ()> { panic!("no flush expected") });
        assert_eq!(flushed, Ok(false));
    }

    #[test]
    fn unknown_slot_is_never_stale() {
        let mut store = InstanceStore::new(1, 2);
        assert!(!store.is_stale(2));
        assert_eq!(store.take_dirty(7, |_| Err("unreachable")), Ok(false));
    }

    #[test]
    fn unchanged_transform_stays_clean() {
        let mut store = InstanceStore::new(1, 2);
        flush_all(&mut store);
        store.set(0, &Transform::default());
        assert!(!store.is_dirty());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut store = InstanceStore::new(1, 1);
        assert!(!store.set(5, &Transform::default()));
    }

    #[test]
    fn failed_flush_keeps_slot_stale() {
        let mut store = InstanceStore::new(1, 2);
        assert!(store.take_dirty(1, |_| Err("lost")).is_err());
        assert!(store.is_stale(1));
        assert!(store.is_stale(0));
    }
}
