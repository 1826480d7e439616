//! Bindless texture and storage-image arrays.
//!
//! Each [`BindlessTable`] owns one descriptor set holding a single large array
//! binding. Assets are registered through its [`BindlessRegistry`], which hands
//! out stable dense indices and queues the descriptor writes; the queue is
//! flushed once per frame, before any draw that samples the array is recorded.
//! Index 0 is reserved for the texture atlas and doubles as the overflow fallback.

use crate::descriptors::DescriptorSetLayoutBuilder;
use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use hashbrown::HashMap;
use lucre_core::constants::TEXTURE_ATLAS_INDEX;
use parking_lot::Mutex;

/// Stable identity of a registered asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(pub u64);

/// Which kind of array a table holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindlessKind {
    /// Combined image samplers.
    Textures,
    /// Storage images.
    StorageImages,
}

impl BindlessKind {
    /// Descriptor type of the array binding.
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::Textures => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Self::StorageImages => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    /// Layout the referenced images are in when sampled.
    pub fn image_layout(self) -> vk::ImageLayout {
        match self {
            Self::Textures => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::StorageImages => vk::ImageLayout::GENERAL,
        }
    }
}

/// One queued array-element write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindlessWrite {
    pub index: u32,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
}

#[derive(Default)]
struct RegistryState {
    indices: HashMap<AssetId, u32>,
    pending: Vec<BindlessWrite>,
    next_index: u32,
}

/// Thread-safe map from assets to stable array indices.
pub struct BindlessRegistry {
    capacity: u32,
    state: Mutex<RegistryState>,
}

impl BindlessRegistry {
    /// Create a registry for an array of `capacity` elements.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            state: Mutex::new(RegistryState {
                next_index: TEXTURE_ATLAS_INDEX + 1,
                ..RegistryState::default()
            }),
        }
    }

    /// Array size.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Fill the reserved slot 0.
    pub fn set_atlas(&self, view: vk::ImageView, sampler: vk::Sampler) {
        self.state.lock().pending.push(BindlessWrite {
            index: TEXTURE_ATLAS_INDEX,
            view,
            sampler,
        });
    }

    /// Register an asset and return its index.
    ///
    /// Known assets get their existing index back. When the array is full the
    /// atlas index is returned and nothing is queued.
    pub fn add(&self, asset: AssetId, view: vk::ImageView, sampler: vk::Sampler) -> u32 {
        let mut state = self.state.lock();
        if let Some(&index) = state.indices.get(&asset) {
            return index;
        }
        if state.next_index >= self.capacity {
            tracing::warn!(
                "Bindless array full ({} entries); {:?} falls back to the atlas",
                self.capacity,
                asset
            );
            return TEXTURE_ATLAS_INDEX;
        }

        let index = state.next_index;
        state.next_index += 1;
        state.indices.insert(asset, index);
        state.pending.push(BindlessWrite {
            index,
            view,
            sampler,
        });
        index
    }

    /// Index of a registered asset.
    pub fn index_of(&self, asset: AssetId) -> Option<u32> {
        self.state.lock().indices.get(&asset).copied()
    }

    /// Number of registered assets (the atlas excluded).
    pub fn len(&self) -> usize {
        self.state.lock().indices.len()
    }

    /// Whether no asset has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes queued since the last update.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Move the queued writes out and hand them to `write` in one batch.
    ///
    /// Does nothing when the queue is empty. Returns the number of writes issued.
    pub fn update(&self, write: impl FnOnce(&[BindlessWrite])) -> usize {
        let pending = std::mem::take(&mut self.state.lock().pending);
        if pending.is_empty() {
            return 0;
        }
        write(&pending);
        pending.len()
    }
}

/// A bindless descriptor array: layout, update-after-bind pool, and its single set.
pub struct BindlessTable {
    kind: BindlessKind,
    registry: BindlessRegistry,
    layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl BindlessTable {
    /// Create the table.
    ///
    /// # Safety
    /// The device must support the bindless descriptor-indexing features.
    pub unsafe fn new(gpu: &GpuDevice, kind: BindlessKind, capacity: u32) -> Result<Self> {
        let device = gpu.device();
        let ty = kind.descriptor_type();

        let layout = DescriptorSetLayoutBuilder::new()
            .binding_with_flags(
                0,
                ty,
                capacity,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
                    | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                    | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
            )
            .update_after_bind()
            .build(device)?;

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(ty)
            .descriptor_count(capacity)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = device.create_descriptor_pool(&pool_info, None)?;

        let counts = [capacity];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts)
            .push_next(&mut variable_info);

        let set = {
            let _guard = gpu.lock();
            device.allocate_descriptor_sets(&alloc_info)
        }
        .map_err(|e| GpuError::AllocationFailed(format!("Bindless set: {e}")))?[0];

        tracing::debug!("Created bindless {:?} table with {} slots", kind, capacity);

        Ok(Self {
            kind,
            registry: BindlessRegistry::new(capacity),
            layout,
            pool,
            set,
        })
    }

    /// The registry assigning indices into this table.
    pub fn registry(&self) -> &BindlessRegistry {
        &self.registry
    }

    /// Descriptor set layout to put into pipeline layouts.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// The single descriptor set to bind.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Register an asset; see [`BindlessRegistry::add`].
    pub fn add(&self, asset: AssetId, view: vk::ImageView, sampler: vk::Sampler) -> u32 {
        self.registry.add(asset, view, sampler)
    }

    /// Flush queued writes with one batched descriptor update.
    ///
    /// # Safety
    /// Every queued view and sampler must still be alive.
    pub unsafe fn update(&self, gpu: &GpuDevice) -> usize {
        let kind = self.kind;
        let set = self.set;
        self.registry.update(|pending| {
            let infos: Vec<vk::DescriptorImageInfo> = pending
                .iter()
                .map(|w| {
                    vk::DescriptorImageInfo::default()
                        .image_view(w.view)
                        .sampler(w.sampler)
                        .image_layout(kind.image_layout())
                })
                .collect();
            let writes: Vec<vk::WriteDescriptorSet<'_>> = pending
                .iter()
                .zip(&infos)
                .map(|(w, info)| {
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(0)
                        .dst_array_element(w.index)
                        .descriptor_type(kind.descriptor_type())
                        .image_info(std::slice::from_ref(info))
                })
                .collect();
            gpu.update_descriptor_sets(&writes);
        })
    }

    /// Destroy the table.
    ///
    /// # Safety
    /// The set must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        device.destroy_descriptor_set_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::Arc;

    fn view(raw: u64) -> vk::ImageView {
        vk::ImageView::from_raw(raw)
    }

    #[test]
    fn indices_start_after_the_atlas() {
        let registry = BindlessRegistry::new(16);
        let a = registry.add(AssetId(10), view(1), vk::Sampler::null());
        let b = registry.add(AssetId(11), view(2), vk::Sampler::null());
        let c = registry.add(AssetId(12), view(3), vk::Sampler::null());
        assert_eq!([a, b, c], [1, 2, 3]);
    }

    #[test]
    fn flushed_writes_land_on_their_indices() {
        let registry = BindlessRegistry::new(16);
        registry.add(AssetId(1), view(100), vk::Sampler::null());
        registry.add(AssetId(2), view(200), vk::Sampler::null());
        registry.add(AssetId(3), view(300), vk::Sampler::null());

        let mut slots = vec![vk::ImageView::null(); 4];
        let issued = registry.update(|writes| {
            for w in writes {
                slots[w.index as usize] = w.view;
            }
        });
        assert_eq!(issued, 3);
        assert_eq!(slots[2], view(200));
    }

    #[test]
    fn re_adding_returns_the_same_index() {
        let registry = BindlessRegistry::new(16);
        let first = registry.add(AssetId(5), view(1), vk::Sampler::null());
        registry.update(|_| {});
        let again = registry.add(AssetId(5), view(9), vk::Sampler::null());
        assert_eq!(first, again);
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.index_of(AssetId(5)), Some(first));
    }

    #[test]
    fn update_with_nothing_pending_is_a_no_op() {
        let registry = BindlessRegistry::new(4);
        let mut calls = 0;
        assert_eq!(registry.update(|_| calls += 1), 0);
        assert_eq!(registry.update(|_| calls += 1), 0);
        assert_eq!(calls, 0);

        registry.add(AssetId(1), view(1), vk::Sampler::null());
        assert_eq!(registry.update(|_| calls += 1), 1);
        assert_eq!(registry.update(|_| calls += 1), 0);
        assert_eq!(calls, 1);
    }

    #[test]
    fn overflow_falls_back_to_the_atlas() {
        let registry = BindlessRegistry::new(3);
        assert_eq!(registry.add(AssetId(1), view(1), vk::Sampler::null()), 1);
        assert_eq!(registry.add(AssetId(2), view(2), vk::Sampler::null()), 2);
        assert_eq!(
            registry.add(AssetId(3), view(3), vk::Sampler::null()),
            TEXTURE_ATLAS_INDEX
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pending_count(), 2);
    }

    #[test]
    fn atlas_write_targets_slot_zero() {
        let registry = BindlessRegistry::new(4);
        registry.set_atlas(view(77), vk::Sampler::null());
        let mut seen = Vec::new();
        registry.update(|writes| seen.extend_from_slice(writes));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].index, TEXTURE_ATLAS_INDEX);
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_registration_hands_out_unique_indices() {
        let registry = Arc::new(BindlessRegistry::new(1024));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..100u64)
                        .map(|i| registry.add(AssetId(t * 1000 + i), view(1), vk::Sampler::null()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400);
        assert_eq!(all[0], 1);
        assert_eq!(all[399], 400);
    }
}
