//! Descriptor set management.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Per-thread descriptor pool capacity per descriptor type.
pub const THREAD_POOL_DESCRIPTORS_PER_TYPE: u32 = 10_000;
/// Per-thread descriptor pool set capacity.
pub const THREAD_POOL_MAX_SETS: u32 = 40_000;

/// Pool sizes of the per-thread descriptor pools.
pub fn thread_pool_sizes() -> [vk::DescriptorPoolSize; 5] {
    [
        vk::DescriptorType::UNIFORM_BUFFER,
        vk::DescriptorType::STORAGE_BUFFER,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        vk::DescriptorType::INPUT_ATTACHMENT,
        vk::DescriptorType::STORAGE_IMAGE,
    ]
    .map(|ty| {
        vk::DescriptorPoolSize::default()
            .ty(ty)
            .descriptor_count(THREAD_POOL_DESCRIPTORS_PER_TYPE)
    })
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
    binding_flags: Vec<vk::DescriptorBindingFlags>,
    update_after_bind: bool,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding_with_flags(
            binding,
            descriptor_type,
            count,
            stage_flags,
            vk::DescriptorBindingFlags::empty(),
        )
    }

    /// Add a binding with descriptor-indexing flags.
    pub fn binding_with_flags(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
        flags: vk::DescriptorBindingFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self.binding_flags.push(flags);
        self
    }

    /// Mark the layout as usable with update-after-bind pools.
    pub fn update_after_bind(mut self) -> Self {
        self.update_after_bind = true;
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Add an array of combined image samplers.
    pub fn sampled_image_array(
        self,
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage_flags,
        )
    }

    /// Add an input attachment binding (fragment stage).
    pub fn input_attachment(self, binding: u32) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::INPUT_ATTACHMENT,
            1,
            vk::ShaderStageFlags::FRAGMENT,
        )
    }

    /// Number of bindings so far.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether no binding has been added.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&self.binding_flags);

        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);
        if self.update_after_bind {
            layout_info =
                layout_info.flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL);
        }
        if self.binding_flags.iter().any(|f| !f.is_empty()) {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

/// Descriptor pool for allocating descriptor sets.
#[derive(Debug)]
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        flags: vk::DescriptorPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(flags);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Create a pool with the per-thread capacities.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn per_thread(device: &ash::Device) -> Result<Self> {
        Self::new(
            device,
            THREAD_POOL_MAX_SETS,
            &thread_pool_sizes(),
            vk::DescriptorPoolCreateFlags::empty(),
        )
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate one descriptor set per layout.
    ///
    /// # Safety
    /// The pool must belong to `gpu`.
    pub unsafe fn allocate(
        &self,
        gpu: &GpuDevice,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(layouts);

        let _guard = gpu.lock();
        gpu.device()
            .allocate_descriptor_sets(&alloc_info)
            .map_err(|e| GpuError::AllocationFailed(format!("Descriptor set allocation: {e}")))
    }

    /// Allocate a single descriptor set.
    ///
    /// # Safety
    /// The pool must belong to `gpu`.
    pub unsafe fn allocate_one(
        &self,
        gpu: &GpuDevice,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let sets = self.allocate(gpu, &[layout])?;
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::AllocationFailed("Empty descriptor allocation".to_string()))
    }

    /// Reset the pool, freeing all descriptor sets.
    ///
    /// # Safety
    /// No descriptor set from this pool may be in use.
    pub unsafe fn reset(&self, gpu: &GpuDevice) -> Result<()> {
        let _guard = gpu.lock();
        gpu.device()
            .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())?;
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferWrite {
    set: vk::DescriptorSet,
    binding: u32,
    ty: vk::DescriptorType,
    info: vk::DescriptorBufferInfo,
}

#[derive(Debug, Clone, Copy)]
struct ImageWrite {
    set: vk::DescriptorSet,
    binding: u32,
    array_element: u32,
    ty: vk::DescriptorType,
    info: vk::DescriptorImageInfo,
}

/// Collects descriptor writes and flushes them in one batched call.
#[derive(Debug, Default)]
pub struct DescriptorWriter {
    buffers: Vec<BufferWrite>,
    images: Vec<ImageWrite>,
}

impl DescriptorWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a uniform buffer write.
    pub fn uniform_buffer(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorBufferInfo,
    ) -> &mut Self {
        self.buffers.push(BufferWrite {
            set,
            binding,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            info,
        });
        self
    }

    /// Queue a storage buffer write.
    pub fn storage_buffer(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        info: vk::DescriptorBufferInfo,
    ) -> &mut Self {
        self.buffers.push(BufferWrite {
            set,
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            info,
        });
        self
    }

    /// Queue a combined image sampler write.
    pub fn sampled_image(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.image_at(
            set,
            binding,
            0,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .sampler(sampler)
                .image_layout(layout),
        )
    }

    /// Queue an input attachment write.
    pub fn input_attachment(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.image_at(
            set,
            binding,
            0,
            vk::DescriptorType::INPUT_ATTACHMENT,
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(layout),
        )
    }

    /// Queue a storage image write.
    pub fn storage_image(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        view: vk::ImageView,
    ) -> &mut Self {
        self.image_at(
            set,
            binding,
            0,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorImageInfo::default()
                .image_view(view)
                .image_layout(vk::ImageLayout::GENERAL),
        )
    }

    /// Queue an image write into an array element.
    pub fn image_at(
        &mut self,
        set: vk::DescriptorSet,
        binding: u32,
        array_element: u32,
        ty: vk::DescriptorType,
        info: vk::DescriptorImageInfo,
    ) -> &mut Self {
        self.images.push(ImageWrite {
            set,
            binding,
            array_element,
            ty,
            info,
        });
        self
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.buffers.len() + self.images.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vulkan write structures referencing this writer's infos.
    pub fn writes(&self) -> Vec<vk::WriteDescriptorSet<'_>> {
        let buffers = self.buffers.iter().map(|w| {
            vk::WriteDescriptorSet::default()
                .dst_set(w.set)
                .dst_binding(w.binding)
                .descriptor_type(w.ty)
                .buffer_info(std::slice::from_ref(&w.info))
        });
        let images = self.images.iter().map(|w| {
            vk::WriteDescriptorSet::default()
                .dst_set(w.set)
                .dst_binding(w.binding)
                .dst_array_element(w.array_element)
                .descriptor_type(w.ty)
                .image_info(std::slice::from_ref(&w.info))
        });
        buffers.chain(images).collect()
    }

    /// Issue every queued write in one `vkUpdateDescriptorSets` call.
    ///
    /// # Safety
    /// The sets and referenced resources must be valid.
    pub unsafe fn flush(&mut self, gpu: &GpuDevice) {
        gpu.update_descriptor_sets(&self.writes());
        self.buffers.clear();
        self.images.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn thread_pools_have_ten_thousand_of_each_type() {
        let sizes = thread_pool_sizes();
        assert!(sizes.iter().all(|s| s.descriptor_count == 10_000));
        assert!(sizes
            .iter()
            .any(|s| s.ty == vk::DescriptorType::INPUT_ATTACHMENT));
        assert_eq!(THREAD_POOL_MAX_SETS, 40_000);
    }

    #[test]
    fn writer_batches_buffers_and_images() {
        let set = vk::DescriptorSet::from_raw(7);
        let mut writer = DescriptorWriter::new();
        writer
            .uniform_buffer(
                set,
                0,
                vk::DescriptorBufferInfo::default().range(vk::WHOLE_SIZE),
            )
            .input_attachment(set, 1, vk::ImageView::from_raw(3), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .image_at(
                set,
                0,
                42,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::DescriptorImageInfo::default(),
            );

        let writes = writer.writes();
        assert_eq!(writes.len(), 3);
        assert_eq!(writes[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(writes[1].descriptor_type, vk::DescriptorType::INPUT_ATTACHMENT);
        assert_eq!(writes[2].dst_array_element, 42);
        assert!(writes.iter().all(|w| w.descriptor_count == 1));
    }

    #[test]
    fn layout_builder_counts_bindings() {
        let builder = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .input_attachment(1)
            .sampled_image_array(2, 4, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(builder.len(), 3);
        assert!(!builder.is_empty());
    }
}
