//! Render targets and framebuffers.
//!
//! The 3D pass renders into offscreen images (scene color, depth, G-buffer);
//! post-processing and GUI render into the output images (swapchain images or
//! an offscreen output). Everything here is rebuilt on resize.

use ash::vk;
use lucre_gpu::image::ImageView;
use lucre_gpu::memory::{mip_count, Image, ImageDesc};
use lucre_gpu::{GpuDevice, Result};

use crate::render_pass::{attachment, PassFormats, RenderPassGraph, BASE_COLOR_FORMAT, GBUFFER_HDR_FORMAT};

/// An image with a view of its whole range.
#[derive(Debug)]
pub struct Attachment {
    pub image: Image,
    pub view: ImageView,
}

impl Attachment {
    /// Create a single-mip 2D attachment.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        gpu: &GpuDevice,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        name: &str,
    ) -> Result<Self> {
        let image = gpu.create_image(&ImageDesc::new_2d(format, extent, usage), name)?;
        let view = ImageView::whole(gpu.device(), &image)?;
        Ok(Self { image, view })
    }

    /// Destroy the view and retire the image.
    ///
    /// # Safety
    /// The attachment must not be in use.
    pub unsafe fn destroy(self, gpu: &GpuDevice) {
        self.view.destroy(gpu.device());
        gpu.destroy_image(self.image);
    }
}

/// Extent of each bloom mip, finest first.
pub fn bloom_mip_extents(extent: vk::Extent2D, levels: u32) -> Vec<vk::Extent2D> {
    let levels = levels.clamp(1, mip_count(extent));
    (0..levels)
        .map(|mip| vk::Extent2D {
            width: (extent.width >> mip).max(1),
            height: (extent.height >> mip).max(1),
        })
        .collect()
}

/// Emission image with one view and framebuffer per bloom mip.
#[derive(Debug)]
pub struct BloomChain {
    pub image: Image,
    /// Single-mip views, finest first. `mips[0]` is the 3D pass attachment.
    pub mips: Vec<ImageView>,
    pub extents: Vec<vk::Extent2D>,
    /// Framebuffer per mip, compatible with both bloom passes.
    pub framebuffers: Vec<vk::Framebuffer>,
}

impl BloomChain {
    /// Number of mips.
    pub fn levels(&self) -> u32 {
        self.mips.len() as u32
    }
}

/// Offscreen images written by the 3D pass.
#[derive(Debug)]
pub struct SceneTargets {
    pub extent: vk::Extent2D,
    pub color: Attachment,
    pub depth: Attachment,
    pub pos: Attachment,
    pub normal: Attachment,
    pub base_color: Attachment,
    pub material: Attachment,
    pub emission: BloomChain,
}

impl SceneTargets {
    /// Views in the 3D pass attachment order.
    pub fn attachment_views(&self) -> [vk::ImageView; attachment::COUNT] {
        [
            self.color.view.view,
            self.depth.view.view,
            self.pos.view.view,
            self.normal.view.view,
            self.base_color.view.view,
            self.material.view.view,
            self.emission.mips[0].view,
        ]
    }

    /// G-buffer views in the lighting subpass input order.
    pub fn gbuffer_views(&self) -> [vk::ImageView; 5] {
        [
            self.pos.view.view,
            self.normal.view.view,
            self.base_color.view.view,
            self.material.view.view,
            self.emission.mips[0].view,
        ]
    }
}

unsafe fn create_framebuffer(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<vk::Framebuffer> {
    let info = vk::FramebufferCreateInfo::default()
        .render_pass(render_pass)
        .attachments(views)
        .width(extent.width)
        .height(extent.height)
        .layers(1);
    Ok(device.create_framebuffer(&info, None)?)
}

/// Scene targets plus every framebuffer of the color passes.
#[derive(Debug)]
pub struct RenderTargets {
    pub scene: SceneTargets,
    /// One per output image.
    pub scene_framebuffers: Vec<vk::Framebuffer>,
    /// One per output image.
    pub post_framebuffers: Vec<vk::Framebuffer>,
    /// One per output image.
    pub gui_framebuffers: Vec<vk::Framebuffer>,
}

impl RenderTargets {
    /// Create targets for `extent` and framebuffers for each output view.
    ///
    /// # Safety
    /// The device, passes, and output views must be valid.
    pub unsafe fn new(
        gpu: &GpuDevice,
        passes: &RenderPassGraph,
        output_views: &[vk::ImageView],
        extent: vk::Extent2D,
        bloom_mip_levels: u32,
    ) -> Result<Self> {
        let scene = create_scene_targets(gpu, passes, &passes.formats, extent, bloom_mip_levels)?;
        let device = gpu.device();
        let attachments = scene.attachment_views();

        let mut scene_framebuffers = Vec::with_capacity(output_views.len());
        let mut post_framebuffers = Vec::with_capacity(output_views.len());
        let mut gui_framebuffers = Vec::with_capacity(output_views.len());
        for &output in output_views {
            scene_framebuffers.push(create_framebuffer(
                device,
                passes.scene,
                &attachments,
                extent,
            )?);
            post_framebuffers.push(create_framebuffer(
                device,
                passes.post_process,
                &[output, scene.color.view.view, scene.emission.mips[0].view],
                extent,
            )?);
            gui_framebuffers.push(create_framebuffer(device, passes.gui, &[output], extent)?);
        }

        tracing::debug!(
            "Render targets {}x{} ({} bloom mips, {} outputs)",
            extent.width,
            extent.height,
            scene.emission.levels(),
            output_views.len()
        );

        Ok(Self {
            scene,
            scene_framebuffers,
            post_framebuffers,
            gui_framebuffers,
        })
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.scene.extent
    }

    /// Destroy framebuffers and views; retire the images.
    ///
    /// # Safety
    /// Nothing built on the targets may be in use.
    pub unsafe fn destroy(self, gpu: &GpuDevice) {
        let device = gpu.device();
        for framebuffer in self
            .scene_framebuffers
            .into_iter()
            .chain(self.post_framebuffers)
            .chain(self.gui_framebuffers)
            .chain(self.scene.emission.framebuffers)
        {
            device.destroy_framebuffer(framebuffer, None);
        }
        for view in &self.scene.emission.mips {
            view.destroy(device);
        }
        gpu.destroy_image(self.scene.emission.image);
        for target in [
            self.scene.color,
            self.scene.depth,
            self.scene.pos,
            self.scene.normal,
            self.scene.base_color,
            self.scene.material,
        ] {
            target.destroy(gpu);
        }
    }
}

unsafe fn create_scene_targets(
    gpu: &GpuDevice,
    passes: &RenderPassGraph,
    formats: &PassFormats,
    extent: vk::Extent2D,
    bloom_mip_levels: u32,
) -> Result<SceneTargets> {
    let gbuffer_usage =
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::INPUT_ATTACHMENT;
    let sampled_color = gbuffer_usage | vk::ImageUsageFlags::SAMPLED;

    let color = Attachment::new(gpu, formats.scene_color(), extent, sampled_color, "scene_color")?;
    let depth = Attachment::new(
        gpu,
        formats.depth,
        extent,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
        "scene_depth",
    )?;
    let pos = Attachment::new(gpu, GBUFFER_HDR_FORMAT, extent, gbuffer_usage, "gbuffer_pos")?;
    let normal = Attachment::new(gpu, GBUFFER_HDR_FORMAT, extent, gbuffer_usage, "gbuffer_normal")?;
    let base_color =
        Attachment::new(gpu, BASE_COLOR_FORMAT, extent, gbuffer_usage, "gbuffer_base_color")?;
    let material =
        Attachment::new(gpu, GBUFFER_HDR_FORMAT, extent, gbuffer_usage, "gbuffer_material")?;

    let extents = bloom_mip_extents(extent, bloom_mip_levels);
    let emission_image = gpu.create_image(
        &ImageDesc::new_2d(GBUFFER_HDR_FORMAT, extent, sampled_color).mips(extents.len() as u32),
        "gbuffer_emission",
    )?;
    let device = gpu.device();
    let mut mips = Vec::with_capacity(extents.len());
    let mut framebuffers = Vec::with_capacity(extents.len());
    for (mip, &mip_extent) in extents.iter().enumerate() {
        let view = ImageView::single(device, &emission_image, mip as u32, 0)?;
        framebuffers.push(create_framebuffer(
            device,
            passes.bloom_down,
            &[view.view],
            mip_extent,
        )?);
        mips.push(view);
    }

    Ok(SceneTargets {
        extent,
        color,
        depth,
        pos,
        normal,
        base_color,
        material,
        emission: BloomChain {
            image: emission_image,
            mips,
            extents,
            framebuffers,
        },
    })
}

/// One shadow map: depth image, view, and framebuffer.
#[derive(Debug)]
pub struct ShadowMap {
    pub depth: Attachment,
    pub framebuffer: vk::Framebuffer,
    pub size: u32,
}

impl ShadowMap {
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size,
            height: self.size,
        }
    }
}

/// All shadow maps. Independent of the window size.
#[derive(Debug, Default)]
pub struct ShadowMaps {
    pub maps: Vec<ShadowMap>,
}

impl ShadowMaps {
    /// Create `count` square shadow maps.
    ///
    /// # Safety
    /// The device and shadow pass must be valid.
    pub unsafe fn new(gpu: &GpuDevice, passes: &RenderPassGraph, count: u32, size: u32) -> Result<Self> {
        let extent = vk::Extent2D {
            width: size,
            height: size,
        };
        let mut maps = Vec::with_capacity(count as usize);
        for i in 0..count {
            let depth = Attachment::new(
                gpu,
                passes.formats.depth,
                extent,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
                &format!("shadow_map_{i}"),
            )?;
            let framebuffer = create_framebuffer(gpu.device(), passes.shadow, &[depth.view.view], extent)?;
            maps.push(ShadowMap {
                depth,
                framebuffer,
                size,
            });
        }
        Ok(Self { maps })
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Destroy every map.
    ///
    /// # Safety
    /// No map may be in use.
    pub unsafe fn destroy(self, gpu: &GpuDevice) {
        for map in self.maps {
            gpu.device().destroy_framebuffer(map.framebuffer, None);
            map.depth.destroy(gpu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_mips_halve_down_to_one_pixel() {
        let extents = bloom_mip_extents(
            vk::Extent2D {
                width: 1280,
                height: 720,
            },
            6,
        );
        assert_eq!(extents.len(), 6);
        assert_eq!(extents[0].width, 1280);
        assert_eq!(extents[5].width, 40);
        assert_eq!(extents[5].height, 22);
    }

    #[test]
    fn bloom_levels_are_clamped_to_the_mip_chain() {
        let tiny = vk::Extent2D {
            width: 4,
            height: 4,
        };
        assert_eq!(bloom_mip_extents(tiny, 6).len(), 3);
        assert_eq!(bloom_mip_extents(tiny, 0).len(), 1);
    }
}
