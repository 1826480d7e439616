//! GPU memory management.
//!
//! Buffers are sub-allocated by size class: requests between [`MIN_ALLOC`] and
//! [`MAX_SMALL_ALLOC`] are rounded up to a power of two and carved out of
//! [`BLOCK_SIZE`] blocks, one block pool per `{size class, usage, memory}` key.
//! Larger requests get a dedicated allocation. Freed buffers go through the
//! per-frame retirement buckets before their range is reused or destroyed.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;

use crate::error::{GpuError, Result};
use crate::retire::RetirementBuckets;

/// Smallest size class in bytes.
pub const MIN_ALLOC: u64 = 512;
/// Largest size class served from blocks.
pub const MAX_SMALL_ALLOC: u64 = 64 * 1024;
/// Size of each block small allocations are carved from.
pub const BLOCK_SIZE: u64 = 512 * 1024;

/// Where an allocation lives and how the CPU may touch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryUsage {
    /// Device-local, not mappable.
    DeviceLocal,
    /// Host-visible and coherent, persistently mapped.
    HostVisible,
    /// Host-visible and cached for GPU-to-CPU readback.
    Readback,
}

impl MemoryUsage {
    /// The gpu-allocator location for this usage.
    pub fn location(self) -> MemoryLocation {
        match self {
            Self::DeviceLocal => MemoryLocation::GpuOnly,
            Self::HostVisible => MemoryLocation::CpuToGpu,
            Self::Readback => MemoryLocation::GpuToCpu,
        }
    }
}

/// Size-class decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Served from a block pool; the value is the rounded slot size.
    Small(u64),
    /// Served by its own allocation of exactly this many bytes.
    Dedicated(u64),
}

impl SizeClass {
    /// Classify a request of `size` bytes with the given offset alignment.
    pub fn of(size: u64, alignment: u64) -> Self {
        let wanted = size.max(alignment).max(1);
        if wanted > MAX_SMALL_ALLOC {
            return Self::Dedicated(size);
        }
        Self::Small(wanted.next_power_of_two().max(MIN_ALLOC))
    }

    /// Bytes reserved for the request.
    pub fn bytes(self) -> u64 {
        match self {
            Self::Small(bytes) | Self::Dedicated(bytes) => bytes,
        }
    }
}

/// Key of a block pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub size_class: u64,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
}

/// A device buffer with its own memory, as handed out by a [`MemoryBackend`].
pub struct BackingBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: u64,
    pub mapped_ptr: Option<NonNull<u8>>,
    pub device_address: Option<vk::DeviceAddress>,
}

// SAFETY: the mapping lives as long as the allocation; access goes through the
// device mutex.
unsafe impl Send for BackingBuffer {}

/// A device image with its own memory, as handed out by a [`MemoryBackend`].
pub struct BackingImage {
    pub image: vk::Image,
    pub allocation: Option<Allocation>,
    pub size: u64,
}

/// Source of raw device memory for the allocator.
///
/// The Vulkan implementation is [`GpuMemoryBackend`]; tests substitute a fake.
pub trait MemoryBackend {
    /// Create a buffer bound to fresh memory.
    fn allocate_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<BackingBuffer>;

    /// Destroy a buffer and free its memory.
    fn release_buffer(&mut self, buffer: BackingBuffer) -> Result<()>;

    /// Create an image bound to fresh memory.
    fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<BackingImage>;

    /// Destroy an image and free its memory.
    fn release_image(&mut self, image: BackingImage) -> Result<()>;
}

/// Where a [`Buffer`]'s range came from.
enum BufferOrigin {
    Pooled { key: PoolKey, block: u32 },
    Dedicated(BackingBuffer),
}

/// A buffer range handed out by the [`MemoryAllocator`].
///
/// Pooled buffers share their `buffer` handle with the rest of the block;
/// always bind with [`Buffer::offset`].
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub allocated_size: u64,
    mapped_ptr: Option<NonNull<u8>>,
    device_address: Option<vk::DeviceAddress>,
    origin: BufferOrigin,
}

// SAFETY: the mapped pointer points into persistently mapped memory owned by the
// allocator; the range is exclusively owned by this handle.
unsafe impl Send for Buffer {}
// SAFETY: shared access only reads the handle fields; writes through the mapped
// pointer require the caller to own the range.
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("buffer", &self.buffer)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("allocated_size", &self.allocated_size)
            .field("dedicated", &self.is_dedicated())
            .finish()
    }
}

impl Buffer {
    /// Whether this buffer owns its own allocation.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.origin, BufferOrigin::Dedicated(_))
    }

    /// Device address of the start of this range, if requested at creation.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address.map(|base| base + self.offset)
    }

    /// Mapped pointer to the start of this range (host-visible memory only).
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.mapped_ptr
            // SAFETY: offset lies inside the mapped block
            .map(|p| unsafe { p.as_ptr().add(self.offset as usize) })
    }

    /// Descriptor info covering the requested size of this range.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(self.offset)
            .range(self.size)
    }

    /// Write data to the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.write_bytes(0, bytemuck::cast_slice(data))
    }

    /// Write raw bytes at `offset` within this range (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at {offset} exceeds buffer size {}",
                data.len(),
                self.size
            )));
        }

        // SAFETY: bounds checked above, the mapping is live while the buffer exists
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Read the whole range back (must be host-visible).
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;
        // SAFETY: the mapped range holds at least `size` bytes
        let bytes = unsafe { std::slice::from_raw_parts(ptr, self.size as usize) };
        Ok(bytes.to_vec())
    }
}

/// An image and its allocation, with its logically tracked layout.
pub struct Image {
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    /// Layout after the last recorded transition.
    pub layout: vk::ImageLayout,
    backing: BackingImage,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("image", &self.image)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .field("array_layers", &self.array_layers)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Image {
    /// Bytes of device memory backing this image.
    pub fn memory_size(&self) -> u64 {
        self.backing.size
    }

    /// 2D extent of mip level 0.
    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }
}

/// Description of an image to create.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl ImageDesc {
    /// A single-mip, single-layer 2D image.
    pub fn new_2d(format: vk::Format, extent: vk::Extent2D, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent,
            mip_levels: 1,
            array_layers: 1,
            usage,
            flags: vk::ImageCreateFlags::empty(),
        }
    }

    /// Set the mip level count.
    pub fn mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    /// Set the array layer count.
    pub fn layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers.max(1);
        self
    }

    /// Six-layer cube-compatible image.
    pub fn cube(mut self) -> Self {
        self.array_layers = 6;
        self.flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        self
    }
}

/// Full mip chain length for an extent.
pub fn mip_count(extent: vk::Extent2D) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

/// Allocation counters exposed for telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Live backend allocations (blocks, dedicated buffers, images).
    pub num_allocations: u64,
    /// Bytes held by live backend allocations.
    pub total_bytes: u64,
    /// High-water mark of `num_allocations`.
    pub peak_allocations: u64,
    /// High-water mark of `total_bytes`.
    pub peak_total_bytes: u64,
    /// Bytes of buffer ranges handed out and not yet recycled.
    pub bytes_in_use: u64,
    /// High-water mark of `bytes_in_use`.
    pub peak_bytes_in_use: u64,
}

impl MemoryStats {
    fn add_allocation(&mut self, bytes: u64) {
        self.num_allocations += 1;
        self.total_bytes += bytes;
        self.peak_allocations = self.peak_allocations.max(self.num_allocations);
        self.peak_total_bytes = self.peak_total_bytes.max(self.total_bytes);
    }

    fn remove_allocation(&mut self, bytes: u64) {
        self.num_allocations = self.num_allocations.saturating_sub(1);
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
    }

    fn acquire(&mut self, bytes: u64) {
        self.bytes_in_use += bytes;
        self.peak_bytes_in_use = self.peak_bytes_in_use.max(self.bytes_in_use);
    }

    fn release(&mut self, bytes: u64) {
        self.bytes_in_use = self.bytes_in_use.saturating_sub(bytes);
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    block: u32,
    offset: u64,
}

/// Blocks of one `{size class, usage, memory}` key and their free slots.
#[derive(Default)]
struct BlockPool {
    blocks: Vec<BackingBuffer>,
    free: Vec<Slot>,
}

/// A resource waiting in a retirement bucket.
enum Retired {
    Buffer(Buffer),
    Image(Image),
}

/// Block-based sub-allocator with frame-indexed retirement.
pub struct MemoryAllocator<B: MemoryBackend = GpuMemoryBackend> {
    backend: B,
    pools: HashMap<PoolKey, BlockPool>,
    retired: RetirementBuckets<Retired>,
    frame_index: usize,
    stats: MemoryStats,
}

impl<B: MemoryBackend> MemoryAllocator<B> {
    /// Create an allocator with one retirement bucket per frame in flight.
    pub fn new(backend: B, frames_in_flight: usize) -> Self {
        Self {
            backend,
            pools: HashMap::new(),
            retired: RetirementBuckets::new(frames_in_flight),
            frame_index: 0,
            stats: MemoryStats::default(),
        }
    }

    /// Access the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Current allocation counters.
    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Frame index new retirements are filed under.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// Resources still waiting for their frame slot.
    pub fn retired_count(&self) -> usize {
        self.retired.pending_count()
    }

    /// Whether the retirement bucket of `frame_index` is empty.
    pub fn retired_bucket_is_empty(&self, frame_index: usize) -> bool {
        self.retired.bucket_is_empty(frame_index)
    }

    /// Start recording frame slot `frame_index`.
    ///
    /// Everything retired the last time this slot was recorded is recycled or
    /// destroyed. The caller must have waited on the slot's in-flight fence.
    pub fn begin_frame(&mut self, frame_index: usize) -> Result<()> {
        self.frame_index = frame_index;
        let retired: Vec<Retired> = self.retired.drain(frame_index).collect();
        for item in retired {
            self.destroy_retired(item)?;
        }
        Ok(())
    }

    /// Allocate a buffer range.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<Buffer> {
        self.create_buffer_aligned(size, 1, usage, memory, name)
    }

    /// Allocate a buffer range whose offset honours `alignment`.
    pub fn create_buffer_aligned(
        &mut self,
        size: u64,
        alignment: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<Buffer> {
        if size == 0 {
            return Err(GpuError::AllocationFailed(format!(
                "Zero-sized buffer requested for {name}"
            )));
        }

        match SizeClass::of(size, alignment) {
            SizeClass::Dedicated(bytes) => {
                let backing = self.backend.allocate_buffer(bytes, usage, memory, name)?;
                self.stats.add_allocation(backing.size);
                self.stats.acquire(bytes);
                Ok(Buffer {
                    buffer: backing.buffer,
                    offset: 0,
                    size,
                    allocated_size: bytes,
                    mapped_ptr: backing.mapped_ptr,
                    device_address: backing.device_address,
                    origin: BufferOrigin::Dedicated(backing),
                })
            }
            SizeClass::Small(size_class) => {
                let key = PoolKey {
                    size_class,
                    usage,
                    memory,
                };
                let slot = self.take_slot(key)?;
                let pool = &self.pools[&key];
                let block = &pool.blocks[slot.block as usize];
                self.stats.acquire(size_class);
                Ok(Buffer {
                    buffer: block.buffer,
                    offset: slot.offset,
                    size,
                    allocated_size: size_class,
                    mapped_ptr: block.mapped_ptr,
                    device_address: block.device_address,
                    origin: BufferOrigin::Pooled {
                        key,
                        block: slot.block,
                    },
                })
            }
        }
    }

    /// Return a buffer; its range is recycled once the current frame slot comes around again.
    pub fn free_buffer(&mut self, buffer: Buffer) {
        self.retired.retire(self.frame_index, Retired::Buffer(buffer));
    }

    /// Create an image with its own allocation.
    pub fn create_image(&mut self, desc: &ImageDesc, name: &str) -> Result<Image> {
        let create_info = vk::ImageCreateInfo::default()
            .flags(desc.flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let backing = self
            .backend
            .allocate_image(&create_info, MemoryUsage::DeviceLocal, name)?;
        self.stats.add_allocation(backing.size);

        Ok(Image {
            image: backing.image,
            format: desc.format,
            extent: create_info.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            layout: vk::ImageLayout::UNDEFINED,
            backing,
        })
    }

    /// Schedule an image for destruction once the current frame slot completes.
    pub fn destroy_image(&mut self, image: Image) {
        self.retired.retire(self.frame_index, Retired::Image(image));
    }

    /// Destroy everything parked in every bucket. Only valid after a device wait-idle.
    pub fn flush_retired(&mut self) -> Result<()> {
        for item in self.retired.drain_all() {
            self.destroy_retired(item)?;
        }
        Ok(())
    }

    /// Release every block and pending resource.
    ///
    /// Buffers still held by callers dangle afterwards; call only at teardown after
    /// a device wait-idle.
    pub fn shutdown(&mut self) -> Result<()> {
        self.flush_retired()?;
        for (_, pool) in self.pools.drain() {
            for block in pool.blocks {
                self.stats.remove_allocation(block.size);
                self.backend.release_buffer(block)?;
            }
        }
        Ok(())
    }

    fn take_slot(&mut self, key: PoolKey) -> Result<Slot> {
        let needs_block = self.pools.get(&key).map_or(true, |pool| pool.free.is_empty());
        if needs_block {
            let name = format!("block_{}b_{:?}", key.size_class, key.memory);
            let backing = self
                .backend
                .allocate_buffer(BLOCK_SIZE, key.usage, key.memory, &name)?;
            self.stats.add_allocation(backing.size);
            tracing::debug!(
                "Allocated {} KB block for {} B slots ({:?}, {:?})",
                BLOCK_SIZE / 1024,
                key.size_class,
                key.usage,
                key.memory
            );

            let pool = self.pools.entry(key).or_default();
            let block = pool.blocks.len() as u32;
            pool.blocks.push(backing);
            let slots = BLOCK_SIZE / key.size_class;
            // Reverse so slots are handed out in ascending offset order
            pool.free.extend((0..slots).rev().map(|i| Slot {
                block,
                offset: i * key.size_class,
            }));
        }

        self.pools
            .get_mut(&key)
            .and_then(|pool| pool.free.pop())
            .ok_or_else(|| GpuError::AllocationFailed("Block pool exhausted".to_string()))
    }

    fn destroy_retired(&mut self, item: Retired) -> Result<()> {
        match item {
            Retired::Buffer(buffer) => {
                self.stats.release(buffer.allocated_size);
                match buffer.origin {
                    BufferOrigin::Pooled { key, block } => {
                        let pool = self.pools.get_mut(&key).ok_or_else(|| {
                            GpuError::InvalidState("Freed buffer from unknown pool".to_string())
                        })?;
                        pool.free.push(Slot {
                            block,
                            offset: buffer.offset,
                        });
                    }
                    BufferOrigin::Dedicated(backing) => {
                        self.stats.remove_allocation(backing.size);
                        self.backend.release_buffer(backing)?;
                    }
                }
            }
            Retired::Image(image) => {
                self.stats.remove_allocation(image.backing.size);
                self.backend.release_image(image.backing)?;
            }
        }
        Ok(())
    }
}

/// [`MemoryBackend`] over gpu-allocator.
pub struct GpuMemoryBackend {
    allocator: Option<Allocator>,
    device: Arc<ash::Device>,
}

impl GpuMemoryBackend {
    /// Create a new backend.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            device,
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    pub fn shutdown(&mut self) {
        // gpu_allocator::Allocator's Drop frees the device memory
        if let Some(allocator) = self.allocator.take() {
            drop(allocator);
        }
    }
}

impl Drop for GpuMemoryBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MemoryBackend for GpuMemoryBackend {
    fn allocate_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<BackingBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory.location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())?;
        }

        let mapped_ptr = allocation.mapped_ptr().map(|p| p.cast::<u8>());
        let device_address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| {
                let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
                unsafe { self.device.get_buffer_device_address(&info) }
            });

        Ok(BackingBuffer {
            buffer,
            allocation: Some(allocation),
            size,
            mapped_ptr,
            device_address,
        })
    }

    fn release_buffer(&mut self, mut buffer: BackingBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.allocator()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }
        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        Ok(())
    }

    fn allocate_image(
        &mut self,
        create_info: &vk::ImageCreateInfo<'_>,
        memory: MemoryUsage,
        name: &str,
    ) -> Result<BackingImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self
            .allocator()?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory.location(),
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        Ok(BackingImage {
            image,
            size: requirements.size,
            allocation: Some(allocation),
        })
    }

    fn release_image(&mut self, mut image: BackingImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator()?
                .free(allocation)
                .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;
        }
        unsafe {
            self.device.destroy_image(image.image, None);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ash::vk::Handle;

    /// Backend that hands out fake handles and counts live allocations.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        next_handle: u64,
        pub live_buffers: usize,
        pub live_images: usize,
        pub buffer_sizes: Vec<u64>,
    }

    impl MemoryBackend for FakeBackend {
        fn allocate_buffer(
            &mut self,
            size: u64,
            _usage: vk::BufferUsageFlags,
            _memory: MemoryUsage,
            _name: &str,
        ) -> Result<BackingBuffer> {
            self.next_handle += 1;
            self.live_buffers += 1;
            self.buffer_sizes.push(size);
            Ok(BackingBuffer {
                buffer: vk::Buffer::from_raw(self.next_handle),
                allocation: None,
                size,
                mapped_ptr: None,
                device_address: Some(self.next_handle << 32),
            })
        }

        fn release_buffer(&mut self, _buffer: BackingBuffer) -> Result<()> {
            self.live_buffers -= 1;
            Ok(())
        }

        fn allocate_image(
            &mut self,
            create_info: &vk::ImageCreateInfo<'_>,
            _memory: MemoryUsage,
            _name: &str,
        ) -> Result<BackingImage> {
            self.next_handle += 1;
            self.live_images += 1;
            let extent = create_info.extent;
            Ok(BackingImage {
                image: vk::Image::from_raw(self.next_handle),
                allocation: None,
                size: u64::from(extent.width) * u64::from(extent.height) * 4,
            })
        }

        fn release_image(&mut self, _image: BackingImage) -> Result<()> {
            self.live_images -= 1;
            Ok(())
        }
    }

    fn allocator() -> MemoryAllocator<FakeBackend> {
        MemoryAllocator::new(FakeBackend::default(), 2)
    }

    const UNIFORM: vk::BufferUsageFlags = vk::BufferUsageFlags::UNIFORM_BUFFER;

    #[test]
    fn size_classes_round_to_powers_of_two() {
        assert_eq!(SizeClass::of(1, 1), SizeClass::Small(512));
        assert_eq!(SizeClass::of(512, 1), SizeClass::Small(512));
        assert_eq!(SizeClass::of(513, 1), SizeClass::Small(1024));
        assert_eq!(SizeClass::of(1000, 256), SizeClass::Small(1024));
        assert_eq!(SizeClass::of(64 * 1024, 1), SizeClass::Small(64 * 1024));
        assert_eq!(SizeClass::of(64 * 1024 + 1, 1), SizeClass::Dedicated(64 * 1024 + 1));
    }

    #[test]
    fn alignment_can_push_a_request_into_a_larger_class() {
        assert_eq!(SizeClass::of(100, 4096), SizeClass::Small(4096));
        assert_eq!(SizeClass::of(100, 128 * 1024), SizeClass::Dedicated(100));
    }

    #[test]
    fn small_buffers_share_one_block() {
        let mut alloc = allocator();
        let a = alloc
            .create_buffer(1000, UNIFORM, MemoryUsage::HostVisible, "a")
            .unwrap();
        let b = alloc
            .create_buffer(1000, UNIFORM, MemoryUsage::HostVisible, "b")
            .unwrap();

        assert_eq!(a.buffer, b.buffer);
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1024);
        assert_eq!(a.allocated_size, 1024);
        assert_eq!(alloc.stats().num_allocations, 1);
        assert_eq!(alloc.stats().total_bytes, BLOCK_SIZE);
        assert_eq!(alloc.backend().buffer_sizes, vec![BLOCK_SIZE]);
    }

    #[test]
    fn pools_are_keyed_by_usage_and_memory() {
        let mut alloc = allocator();
        let a = alloc
            .create_buffer(600, UNIFORM, MemoryUsage::HostVisible, "a")
            .unwrap();
        let b = alloc
            .create_buffer(
                600,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryUsage::HostVisible,
                "b",
            )
            .unwrap();
        let c = alloc
            .create_buffer(600, UNIFORM, MemoryUsage::DeviceLocal, "c")
            .unwrap();

        assert_ne!(a.buffer, b.buffer);
        assert_ne!(a.buffer, c.buffer);
        assert_eq!(alloc.stats().num_allocations, 3);
    }

    #[test]
    fn large_buffers_are_dedicated() {
        let mut alloc = allocator();
        let big = alloc
            .create_buffer(1 << 20, UNIFORM, MemoryUsage::DeviceLocal, "big")
            .unwrap();
        assert!(big.is_dedicated());
        assert_eq!(big.offset, 0);
        assert_eq!(alloc.stats().total_bytes, 1 << 20);

        alloc.free_buffer(big);
        assert_eq!(alloc.backend().live_buffers, 1);
        alloc.begin_frame(1).unwrap();
        assert_eq!(alloc.backend().live_buffers, 1);
        alloc.begin_frame(0).unwrap();
        assert_eq!(alloc.backend().live_buffers, 0);
        assert_eq!(alloc.stats().total_bytes, 0);
    }

    #[test]
    fn freed_ranges_wait_for_their_frame_slot() {
        let mut alloc = allocator();
        alloc.begin_frame(0).unwrap();
        let a = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "a")
            .unwrap();
        let offset = a.offset;
        alloc.free_buffer(a);
        assert!(!alloc.retired_bucket_is_empty(0));

        // Frame 1 must not see the range again
        alloc.begin_frame(1).unwrap();
        let b = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "b")
            .unwrap();
        assert_ne!(b.offset, offset);
        alloc.free_buffer(b);

        // Back at slot 0 the range is recycled
        alloc.begin_frame(0).unwrap();
        assert!(alloc.retired_bucket_is_empty(0));
        let c = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "c")
            .unwrap();
        assert_eq!(c.offset, offset);
    }

    #[test]
    fn retired_range_returns_only_when_its_slot_comes_around() {
        const FRAMES: usize = 3;
        let mut alloc = MemoryAllocator::new(FakeBackend::default(), FRAMES);
        alloc.begin_frame(0).unwrap();
        let first = alloc
            .create_buffer(2048, UNIFORM, MemoryUsage::HostVisible, "first")
            .unwrap();
        let offset = first.offset;
        alloc.free_buffer(first);

        // The other slots may still have the range in flight
        for slot in 1..FRAMES {
            alloc.begin_frame(slot).unwrap();
            assert!(!alloc.retired_bucket_is_empty(0));
            let other = alloc
                .create_buffer(2048, UNIFORM, MemoryUsage::HostVisible, "other")
                .unwrap();
            assert_ne!(other.offset, offset, "reused while slot {slot} was recording");
            alloc.free_buffer(other);
        }

        alloc.begin_frame(0).unwrap();
        assert!(alloc.retired_bucket_is_empty(0));
        let again = alloc
            .create_buffer(2048, UNIFORM, MemoryUsage::HostVisible, "again")
            .unwrap();
        assert_eq!(again.offset, offset);
        assert_eq!(alloc.stats().num_allocations, 1);
    }

    #[test]
    fn steady_state_churn_stays_within_twice_the_working_set() {
        let mut alloc = allocator();
        for frame in 0..16usize {
            alloc.begin_frame(frame % 2).unwrap();
            assert!(alloc.retired_bucket_is_empty(frame % 2));
            let buffers: Vec<_> = (0..400)
                .map(|i| {
                    alloc
                        .create_buffer(1024, UNIFORM, MemoryUsage::HostVisible, &format!("b{i}"))
                        .unwrap()
                })
                .collect();
            for buffer in buffers {
                alloc.free_buffer(buffer);
            }
            let stats = alloc.stats();
            assert!(stats.total_bytes <= 2 * stats.peak_bytes_in_use);
        }

        // Recycling means no growth after the first two frames
        assert_eq!(alloc.stats().num_allocations, 2);
    }

    #[test]
    fn images_are_retired_then_released() {
        let mut alloc = allocator();
        let desc = ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            vk::ImageUsageFlags::SAMPLED,
        );
        let image = alloc.create_image(&desc, "img").unwrap();
        assert_eq!(image.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(alloc.backend().live_images, 1);

        alloc.destroy_image(image);
        assert_eq!(alloc.backend().live_images, 1);
        alloc.flush_retired().unwrap();
        assert_eq!(alloc.backend().live_images, 0);
    }

    #[test]
    fn shutdown_releases_blocks() {
        let mut alloc = allocator();
        let a = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "a")
            .unwrap();
        alloc.free_buffer(a);
        alloc.shutdown().unwrap();
        assert_eq!(alloc.backend().live_buffers, 0);
        assert_eq!(alloc.stats().total_bytes, 0);
    }

    #[test]
    fn device_address_includes_range_offset() {
        let mut alloc = allocator();
        let _a = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "a")
            .unwrap();
        let b = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::HostVisible, "b")
            .unwrap();
        assert_eq!(b.device_address(), Some((1 << 32) + 512));
    }

    #[test]
    fn unmapped_buffers_reject_writes() {
        let mut alloc = allocator();
        let a = alloc
            .create_buffer(512, UNIFORM, MemoryUsage::DeviceLocal, "a")
            .unwrap();
        assert!(a.write(&[1u32, 2, 3]).is_err());
    }

    #[test]
    fn zero_sized_requests_fail() {
        let mut alloc = allocator();
        assert!(alloc
            .create_buffer(0, UNIFORM, MemoryUsage::HostVisible, "empty")
            .is_err());
    }

    #[test]
    fn mip_count_covers_largest_dimension() {
        assert_eq!(mip_count(vk::Extent2D { width: 1, height: 1 }), 1);
        assert_eq!(mip_count(vk::Extent2D { width: 256, height: 64 }), 9);
        assert_eq!(mip_count(vk::Extent2D { width: 300, height: 2 }), 9);
    }
}
