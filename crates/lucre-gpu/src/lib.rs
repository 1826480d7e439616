//! Vulkan layer of the Lucre renderer.
//!
//! This crate provides:
//! - Instance, physical device selection, and the logical device with its
//!   global submission mutex
//! - Block-based GPU memory allocation with per-frame retirement
//! - Per-thread command pools, descriptor pools, and upload semaphores
//! - Swapchain and surface handling
//! - Classical and bindless descriptor management
//! - Render-pass pipelines and SPIR-V shader loading

pub mod bindless;
pub mod capabilities;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod pools;
pub mod retire;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod upload;

pub use bindless::{AssetId, BindlessKind, BindlessRegistry, BindlessTable};
pub use capabilities::{BindlessFeatures, GpuCapabilities, GpuVendor};
pub use command::{execute_single_time_commands, CommandPool};
pub use descriptors::{DescriptorPool, DescriptorSetLayoutBuilder, DescriptorWriter};
pub use device::{GpuDevice, GpuDeviceBuilder};
pub use error::{GpuError, Result};
pub use image::ImageView;
pub use memory::{Buffer, Image, ImageDesc, MemoryAllocator, MemoryStats, MemoryUsage};
pub use pipeline::{BlendMode, GraphicsPipeline, GraphicsPipelineConfig};
pub use pools::{ResourcePools, ThreadResources};
pub use sampler::{SamplerKind, SamplerRegistry};
pub use shader::{ShaderCache, ShaderStage};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{AcquireStatus, PresentStatus, Swapchain};
pub use sync::{create_fence, create_semaphore, FrameSync, TimelineSemaphore};
pub use upload::{SignalCounter, UploadTicket, UploadTracker};
