//! Image views and layout transitions.
//!
//! Layouts are tracked logically: [`Image::layout`] always holds the layout the
//! last recorded barrier (or render pass final layout, via [`Image::assume_layout`])
//! left the image in.

use crate::error::Result;
use crate::memory::Image;
use ash::vk;

/// A view onto a subresource range of an [`Image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageView {
    pub view: vk::ImageView,
    pub image: vk::Image,
    pub format: vk::Format,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl ImageView {
    /// Create a view of the whole image.
    ///
    /// # Safety
    /// The device and image must be valid.
    pub unsafe fn whole(device: &ash::Device, image: &Image) -> Result<Self> {
        let view_type = if image.array_layers == 6 {
            vk::ImageViewType::CUBE
        } else if image.array_layers > 1 {
            vk::ImageViewType::TYPE_2D_ARRAY
        } else {
            vk::ImageViewType::TYPE_2D
        };
        Self::new(device, image, view_type, 0, image.mip_levels, 0, image.array_layers)
    }

    /// Create a 2D view of a single mip level and layer.
    ///
    /// # Safety
    /// The device and image must be valid.
    pub unsafe fn single(device: &ash::Device, image: &Image, mip: u32, layer: u32) -> Result<Self> {
        Self::new(device, image, vk::ImageViewType::TYPE_2D, mip, 1, layer, 1)
    }

    /// Create a view.
    ///
    /// # Safety
    /// The device and image must be valid and the range must lie inside the image.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn new(
        device: &ash::Device,
        image: &Image,
        view_type: vk::ImageViewType,
        base_mip: u32,
        mip_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) -> Result<Self> {
        let view = create_raw_view(
            device,
            image.image,
            image.format,
            view_type,
            subresource_range(image.format, base_mip, mip_count, base_layer, layer_count),
        )?;

        Ok(Self {
            view,
            image: image.image,
            format: image.format,
            base_mip,
            mip_count,
            base_layer,
            layer_count,
        })
    }

    /// Destroy the view.
    ///
    /// # Safety
    /// The view must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.view, None);
    }
}

/// Create a raw image view (used for swapchain images, which have no [`Image`]).
///
/// # Safety
/// The device and image must be valid.
pub unsafe fn create_raw_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    view_type: vk::ImageViewType,
    range: vk::ImageSubresourceRange,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(view_type)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(range);

    Ok(device.create_image_view(&view_info, None)?)
}

/// Aspect flags for a format.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Whether a format is a depth format.
pub fn is_depth_format(format: vk::Format) -> bool {
    aspect_mask(format).contains(vk::ImageAspectFlags::DEPTH)
}

/// Subresource range for a format.
pub fn subresource_range(
    format: vk::Format,
    base_mip: u32,
    mip_count: u32,
    base_layer: u32,
    layer_count: u32,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(aspect_mask(format))
        .base_mip_level(base_mip)
        .level_count(mip_count)
        .base_array_layer(base_layer)
        .layer_count(layer_count)
}

/// Access mask and pipeline stage that produce or consume a layout.
pub fn layout_access(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::UNDEFINED => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::GENERAL => (
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER,
        ),
        vk::ImageLayout::PRESENT_SRC_KHR => (
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}

/// Build the barrier for moving `range` from one layout to another.
pub fn layout_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (
    vk::ImageMemoryBarrier<'static>,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
) {
    let (src_access, src_stage) = layout_access(old_layout);
    let (dst_access, dst_stage) = layout_access(new_layout);

    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range);

    (barrier, src_stage, dst_stage)
}

impl Image {
    /// Record a transition of every subresource to `new_layout`.
    ///
    /// # Safety
    /// The command buffer must be recording and the image must be valid.
    pub unsafe fn transition(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
    ) {
        if self.layout == new_layout {
            return;
        }
        let range = subresource_range(self.format, 0, self.mip_levels, 0, self.array_layers);
        let (barrier, src_stage, dst_stage) =
            layout_barrier(self.image, range, self.layout, new_layout);
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
        self.layout = new_layout;
    }

    /// Record that a render pass left the image in `layout`.
    pub fn assume_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_masks() {
        assert_eq!(aspect_mask(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(is_depth_format(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(!is_depth_format(vk::Format::R16G16B16A16_SFLOAT));
    }

    #[test]
    fn upload_barrier_waits_on_transfer() {
        let range = subresource_range(vk::Format::R8G8B8A8_SRGB, 0, 1, 0, 1);
        let (barrier, src, dst) = layout_barrier(
            vk::Image::null(),
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn undefined_source_has_no_access() {
        let (access, stage) = layout_access(vk::ImageLayout::UNDEFINED);
        assert!(access.is_empty());
        assert_eq!(stage, vk::PipelineStageFlags::TOP_OF_PIPE);
    }
}
