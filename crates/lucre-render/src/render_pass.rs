//! Render pass declarations: shadow, 3D (deferred), bloom, post-processing, GUI.
//!
//! Each pass is first described as a [`RenderPassDesc`] (plain data, testable
//! without a device) and then created from it.

use ash::vk;
use lucre_gpu::{GpuError, Result};

/// Attachment indices of the 3D pass, in declaration order.
pub mod attachment {
    pub const COLOR: u32 = 0;
    pub const DEPTH: u32 = 1;
    pub const POS: u32 = 2;
    pub const NORMAL: u32 = 3;
    pub const BASE_COLOR: u32 = 4;
    pub const MATERIAL: u32 = 5;
    pub const EMISSION: u32 = 6;

    /// Attachments written by the geometry subpass, in shader output order.
    pub const GBUFFER: [u32; 5] = [POS, NORMAL, BASE_COLOR, MATERIAL, EMISSION];
    pub const COUNT: usize = 7;
}

/// Subpass indices.
pub mod subpass {
    pub const SHADOW: u32 = 0;
    pub const GEOMETRY: u32 = 0;
    pub const LIGHTING: u32 = 1;
    pub const TRANSPARENCY: u32 = 2;
    pub const BLOOM: u32 = 0;
    pub const GUI: u32 = 0;
}

/// Post-processing pass attachment indices.
pub mod post_attachment {
    pub const OUTPUT: u32 = 0;
    pub const SCENE_COLOR: u32 = 1;
    pub const EMISSION: u32 = 2;
}

/// G-buffer format for POS, NORMAL, MATERIAL, and EMISSION.
pub const GBUFFER_HDR_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;
/// G-buffer format for BASE_COLOR.
pub const BASE_COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

/// Formats and output layout the passes are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassFormats {
    /// Format of the presentable (or offscreen output) image.
    pub output: vk::Format,
    pub depth: vk::Format,
    /// Layout the output image is left in: `PRESENT_SRC_KHR` for a swapchain,
    /// `TRANSFER_SRC_OPTIMAL` for offscreen readback.
    pub output_layout: vk::ImageLayout,
}

impl PassFormats {
    /// Scene color uses the output format.
    pub fn scene_color(&self) -> vk::Format {
        self.output
    }
}

/// One subpass.
#[derive(Debug, Clone, Default)]
pub struct SubpassDesc {
    pub color: Vec<vk::AttachmentReference>,
    pub input: Vec<vk::AttachmentReference>,
    pub depth: Option<vk::AttachmentReference>,
}

/// A render pass as plain data.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub subpasses: Vec<SubpassDesc>,
    pub dependencies: Vec<vk::SubpassDependency>,
}

impl RenderPassDesc {
    /// Create the render pass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn create(&self, device: &ash::Device) -> Result<vk::RenderPass> {
        let subpasses: Vec<vk::SubpassDescription> = self
            .subpasses
            .iter()
            .map(|s| {
                let desc = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&s.color)
                    .input_attachments(&s.input);
                match &s.depth {
                    Some(depth) => desc.depth_stencil_attachment(depth),
                    None => desc,
                }
            })
            .collect();

        let info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);

        device
            .create_render_pass(&info, None)
            .map_err(|e| GpuError::PipelineCreation(format!("render pass: {e}")))
    }

    /// Color attachments written by `subpass`.
    pub fn color_count(&self, subpass: u32) -> u32 {
        self.subpasses
            .get(subpass as usize)
            .map_or(0, |s| s.color.len() as u32)
    }
}

fn describe(
    format: vk::Format,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    initial_layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
) -> vk::AttachmentDescription {
    vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(load_op)
        .store_op(store_op)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(initial_layout)
        .final_layout(final_layout)
}

fn reference(index: u32, layout: vk::ImageLayout) -> vk::AttachmentReference {
    vk::AttachmentReference::default()
        .attachment(index)
        .layout(layout)
}

fn dependency(
    src_subpass: u32,
    dst_subpass: u32,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(src_subpass)
        .dst_subpass(dst_subpass)
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .dependency_flags(vk::DependencyFlags::BY_REGION)
}

/// Shadow pass: depth only, cleared, stored, left read-only for sampling.
pub fn shadow_pass_desc(depth_format: vk::Format) -> RenderPassDesc {
    RenderPassDesc {
        attachments: vec![describe(
            depth_format,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        )],
        subpasses: vec![SubpassDesc {
            depth: Some(reference(0, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)),
            ..SubpassDesc::default()
        }],
        dependencies: vec![
            dependency(
                vk::SUBPASS_EXTERNAL,
                subpass::SHADOW,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
                vk::AccessFlags::SHADER_READ,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            ),
            dependency(
                subpass::SHADOW,
                vk::SUBPASS_EXTERNAL,
                vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                vk::AccessFlags::SHADER_READ,
            ),
        ],
    }
}

/// 3D pass: geometry, lighting, and transparency subpasses.
pub fn scene_pass_desc(formats: &PassFormats) -> RenderPassDesc {
    use attachment::{BASE_COLOR, COLOR, DEPTH, EMISSION, GBUFFER, MATERIAL, NORMAL, POS};

    let clear = vk::AttachmentLoadOp::CLEAR;
    let store = vk::AttachmentStoreOp::STORE;
    let dont_care = vk::AttachmentStoreOp::DONT_CARE;
    let undefined = vk::ImageLayout::UNDEFINED;
    let attachment_optimal = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

    let mut attachments = vec![vk::AttachmentDescription::default(); attachment::COUNT];
    attachments[COLOR as usize] = describe(formats.scene_color(), clear, store, undefined, read_only);
    attachments[DEPTH as usize] = describe(
        formats.depth,
        clear,
        dont_care,
        undefined,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
    );
    attachments[POS as usize] =
        describe(GBUFFER_HDR_FORMAT, clear, dont_care, undefined, attachment_optimal);
    attachments[NORMAL as usize] =
        describe(GBUFFER_HDR_FORMAT, clear, dont_care, undefined, attachment_optimal);
    attachments[BASE_COLOR as usize] =
        describe(BASE_COLOR_FORMAT, clear, dont_care, undefined, attachment_optimal);
    attachments[MATERIAL as usize] =
        describe(GBUFFER_HDR_FORMAT, clear, dont_care, undefined, attachment_optimal);
    // Emission feeds the bloom chain
    attachments[EMISSION as usize] = describe(GBUFFER_HDR_FORMAT, clear, store, undefined, read_only);

    let geometry = SubpassDesc {
        color: GBUFFER
            .iter()
            .map(|&i| reference(i, attachment_optimal))
            .collect(),
        input: Vec::new(),
        depth: Some(reference(DEPTH, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)),
    };
    let lighting = SubpassDesc {
        color: vec![reference(COLOR, attachment_optimal)],
        input: GBUFFER.iter().map(|&i| reference(i, read_only)).collect(),
        depth: Some(reference(DEPTH, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)),
    };
    let transparency = SubpassDesc {
        color: vec![reference(COLOR, attachment_optimal)],
        input: Vec::new(),
        depth: Some(reference(DEPTH, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)),
    };

    let color_output = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let fragment_tests =
        vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let color_rw = vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;

    let dependencies = vec![
        dependency(
            vk::SUBPASS_EXTERNAL,
            subpass::GEOMETRY,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            color_output | fragment_tests,
            vk::AccessFlags::MEMORY_READ,
            color_rw | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        dependency(
            subpass::GEOMETRY,
            subpass::LIGHTING,
            color_output | fragment_tests,
            vk::PipelineStageFlags::FRAGMENT_SHADER | fragment_tests,
            color_rw | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::INPUT_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        dependency(
            subpass::LIGHTING,
            subpass::TRANSPARENCY,
            color_output,
            vk::PipelineStageFlags::FRAGMENT_SHADER | color_output,
            color_rw,
            vk::AccessFlags::INPUT_ATTACHMENT_READ | color_rw,
        ),
        dependency(
            subpass::GEOMETRY,
            vk::SUBPASS_EXTERNAL,
            color_output,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            color_rw,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ,
        ),
        dependency(
            subpass::TRANSPARENCY,
            vk::SUBPASS_EXTERNAL,
            color_output,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            color_rw,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ,
        ),
    ];

    RenderPassDesc {
        attachments,
        subpasses: vec![geometry, lighting, transparency],
        dependencies,
    }
}

fn single_color_dependencies() -> Vec<vk::SubpassDependency> {
    let color_output = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    vec![
        dependency(
            vk::SUBPASS_EXTERNAL,
            0,
            color_output | vk::PipelineStageFlags::FRAGMENT_SHADER,
            color_output | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::INPUT_ATTACHMENT_READ,
        ),
        dependency(
            0,
            vk::SUBPASS_EXTERNAL,
            color_output,
            color_output | vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::SHADER_READ,
        ),
    ]
}

/// One bloom step: writes a single emission mip.
///
/// Down-sampling clears the target mip; up-sampling loads it and blends the
/// coarser mip on top.
pub fn bloom_pass_desc(load_op: vk::AttachmentLoadOp) -> RenderPassDesc {
    let initial = if load_op == vk::AttachmentLoadOp::LOAD {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else {
        vk::ImageLayout::UNDEFINED
    };
    RenderPassDesc {
        attachments: vec![describe(
            GBUFFER_HDR_FORMAT,
            load_op,
            vk::AttachmentStoreOp::STORE,
            initial,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )],
        subpasses: vec![SubpassDesc {
            color: vec![reference(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)],
            ..SubpassDesc::default()
        }],
        dependencies: single_color_dependencies(),
    }
}

/// Post-processing pass: composites scene color and bloomed emission into the output.
pub fn post_process_pass_desc(formats: &PassFormats) -> RenderPassDesc {
    let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    let input = |format| {
        describe(
            format,
            vk::AttachmentLoadOp::LOAD,
            vk::AttachmentStoreOp::DONT_CARE,
            read_only,
            read_only,
        )
    };

    RenderPassDesc {
        attachments: vec![
            describe(
                formats.output,
                vk::AttachmentLoadOp::DONT_CARE,
                vk::AttachmentStoreOp::STORE,
                vk::ImageLayout::UNDEFINED,
                formats.output_layout,
            ),
            input(formats.scene_color()),
            input(GBUFFER_HDR_FORMAT),
        ],
        subpasses: vec![SubpassDesc {
            color: vec![reference(
                post_attachment::OUTPUT,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            )],
            input: vec![
                reference(post_attachment::SCENE_COLOR, read_only),
                reference(post_attachment::EMISSION, read_only),
            ],
            depth: None,
        }],
        dependencies: single_color_dependencies(),
    }
}

/// GUI pass: draws over the post-processed output without clearing it.
pub fn gui_pass_desc(formats: &PassFormats) -> RenderPassDesc {
    RenderPassDesc {
        attachments: vec![describe(
            formats.output,
            vk::AttachmentLoadOp::LOAD,
            vk::AttachmentStoreOp::STORE,
            formats.output_layout,
            formats.output_layout,
        )],
        subpasses: vec![SubpassDesc {
            color: vec![reference(0, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)],
            ..SubpassDesc::default()
        }],
        dependencies: single_color_dependencies(),
    }
}

/// Every render pass of a frame.
#[derive(Debug)]
pub struct RenderPassGraph {
    pub formats: PassFormats,
    pub shadow: vk::RenderPass,
    pub scene: vk::RenderPass,
    pub bloom_down: vk::RenderPass,
    pub bloom_up: vk::RenderPass,
    pub post_process: vk::RenderPass,
    pub gui: vk::RenderPass,
}

impl RenderPassGraph {
    /// Create all passes.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, formats: PassFormats) -> Result<Self> {
        let descs = [
            shadow_pass_desc(formats.depth),
            scene_pass_desc(&formats),
            bloom_pass_desc(vk::AttachmentLoadOp::CLEAR),
            bloom_pass_desc(vk::AttachmentLoadOp::LOAD),
            post_process_pass_desc(&formats),
            gui_pass_desc(&formats),
        ];

        let mut passes = Vec::with_capacity(descs.len());
        for desc in &descs {
            match desc.create(device) {
                Ok(pass) => passes.push(pass),
                Err(e) => {
                    for pass in passes {
                        device.destroy_render_pass(pass, None);
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "Created render passes (output {:?}, depth {:?})",
            formats.output,
            formats.depth
        );

        Ok(Self {
            formats,
            shadow: passes[0],
            scene: passes[1],
            bloom_down: passes[2],
            bloom_up: passes[3],
            post_process: passes[4],
            gui: passes[5],
        })
    }

    /// Whether passes built for `self` can render to an output of `format`.
    pub fn is_compatible(&self, format: vk::Format) -> bool {
        self.formats.output == format
    }

    /// Destroy all passes.
    ///
    /// # Safety
    /// No framebuffer or pipeline built against them may be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for pass in [
            self.shadow,
            self.scene,
            self.bloom_down,
            self.bloom_up,
            self.post_process,
            self.gui,
        ] {
            device.destroy_render_pass(pass, None);
        }
    }
}

/// Begin a render pass with inline subpass contents.
///
/// # Safety
/// The command buffer must be recording outside any render pass.
pub unsafe fn begin_render_pass(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
    clear_values: &[vk::ClearValue],
) {
    let info = vk::RenderPassBeginInfo::default()
        .render_pass(render_pass)
        .framebuffer(framebuffer)
        .render_area(vk::Rect2D::default().extent(extent))
        .clear_values(clear_values);
    device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
}

/// Clear values of the 3D pass, in attachment order.
pub fn scene_clear_values(clear_color: [f32; 4]) -> [vk::ClearValue; attachment::COUNT] {
    let zero = vk::ClearValue {
        color: vk::ClearColorValue { float32: [0.0; 4] },
    };
    let mut values = [zero; attachment::COUNT];
    values[attachment::COLOR as usize] = vk::ClearValue {
        color: vk::ClearColorValue {
            float32: clear_color,
        },
    };
    values[attachment::DEPTH as usize] = depth_clear_value();
    values
}

/// Depth cleared to the far plane.
pub fn depth_clear_value() -> vk::ClearValue {
    vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: 1.0,
            stencil: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats() -> PassFormats {
        PassFormats {
            output: vk::Format::B8G8R8A8_SRGB,
            depth: vk::Format::D32_SFLOAT,
            output_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    #[test]
    fn scene_attachments_follow_declared_order_and_formats() {
        let desc = scene_pass_desc(&formats());
        let formats: Vec<_> = desc.attachments.iter().map(|a| a.format).collect();
        assert_eq!(
            formats,
            vec![
                vk::Format::B8G8R8A8_SRGB,
                vk::Format::D32_SFLOAT,
                GBUFFER_HDR_FORMAT,
                GBUFFER_HDR_FORMAT,
                BASE_COLOR_FORMAT,
                GBUFFER_HDR_FORMAT,
                GBUFFER_HDR_FORMAT,
            ]
        );
    }

    #[test]
    fn subpasses_run_geometry_lighting_transparency() {
        let desc = scene_pass_desc(&formats());
        assert_eq!(desc.subpasses.len(), 3);

        let geometry = &desc.subpasses[subpass::GEOMETRY as usize];
        let written: Vec<_> = geometry.color.iter().map(|r| r.attachment).collect();
        assert_eq!(written, attachment::GBUFFER.to_vec());
        assert_eq!(
            geometry.depth.map(|d| d.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        );

        let lighting = &desc.subpasses[subpass::LIGHTING as usize];
        let read: Vec<_> = lighting.input.iter().map(|r| r.attachment).collect();
        assert_eq!(read, attachment::GBUFFER.to_vec());
        assert_eq!(lighting.color[0].attachment, attachment::COLOR);
        assert_eq!(
            lighting.depth.map(|d| d.layout),
            Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
        );

        let transparency = &desc.subpasses[subpass::TRANSPARENCY as usize];
        assert!(transparency.input.is_empty());
        assert_eq!(transparency.color[0].attachment, attachment::COLOR);
        assert_eq!(desc.color_count(subpass::GEOMETRY), 5);
    }

    #[test]
    fn internal_dependencies_chain_the_subpasses() {
        let desc = scene_pass_desc(&formats());
        let edge = |src, dst| {
            desc.dependencies
                .iter()
                .find(|d| d.src_subpass == src && d.dst_subpass == dst)
                .copied()
        };

        let geometry_to_lighting = edge(subpass::GEOMETRY, subpass::LIGHTING).unwrap();
        assert!(geometry_to_lighting
            .src_stage_mask
            .contains(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT));
        assert!(geometry_to_lighting
            .dst_stage_mask
            .contains(vk::PipelineStageFlags::FRAGMENT_SHADER));
        assert!(geometry_to_lighting
            .dst_access_mask
            .contains(vk::AccessFlags::INPUT_ATTACHMENT_READ));
        assert_eq!(
            geometry_to_lighting.dependency_flags,
            vk::DependencyFlags::BY_REGION
        );

        assert!(edge(subpass::LIGHTING, subpass::TRANSPARENCY).is_some());
        assert!(edge(vk::SUBPASS_EXTERNAL, subpass::GEOMETRY).is_some());
        assert!(edge(subpass::GEOMETRY, vk::SUBPASS_EXTERNAL).is_some());
        // Never backwards
        assert!(desc
            .dependencies
            .iter()
            .filter(|d| d.src_subpass != vk::SUBPASS_EXTERNAL
                && d.dst_subpass != vk::SUBPASS_EXTERNAL)
            .all(|d| d.src_subpass < d.dst_subpass));
    }

    #[test]
    fn shadow_pass_is_depth_only_and_read_only_afterwards() {
        let desc = shadow_pass_desc(vk::Format::D32_SFLOAT);
        assert_eq!(desc.attachments.len(), 1);
        let depth = desc.attachments[0];
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.store_op, vk::AttachmentStoreOp::STORE);
        assert_eq!(
            depth.final_layout,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert!(desc.subpasses[0].color.is_empty());

        let into = desc.dependencies[0];
        assert_eq!(into.src_subpass, vk::SUBPASS_EXTERNAL);
        assert_eq!(into.src_stage_mask, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(
            into.dst_stage_mask,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        );
        let out = desc.dependencies[1];
        assert_eq!(out.src_stage_mask, vk::PipelineStageFlags::LATE_FRAGMENT_TESTS);
        assert_eq!(out.dst_stage_mask, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn gui_pass_preserves_previous_content() {
        let desc = gui_pass_desc(&formats());
        assert_eq!(desc.attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            desc.attachments[0].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn post_process_reads_color_and_emission_as_inputs() {
        let desc = post_process_pass_desc(&formats());
        let inputs: Vec<_> = desc.subpasses[0].input.iter().map(|r| r.attachment).collect();
        assert_eq!(
            inputs,
            vec![post_attachment::SCENE_COLOR, post_attachment::EMISSION]
        );
        assert_eq!(
            desc.attachments[post_attachment::OUTPUT as usize].final_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn offscreen_output_ends_in_transfer_layout() {
        let offscreen = PassFormats {
            output_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ..formats()
        };
        let desc = gui_pass_desc(&offscreen);
        assert_eq!(
            desc.attachments[0].final_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn bloom_up_loads_what_bloom_down_stored() {
        let down = bloom_pass_desc(vk::AttachmentLoadOp::CLEAR);
        let up = bloom_pass_desc(vk::AttachmentLoadOp::LOAD);
        assert_eq!(down.attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            up.attachments[0].initial_layout,
            down.attachments[0].final_layout
        );
    }

    #[test]
    fn scene_clear_values_reset_depth_to_far() {
        let values = scene_clear_values([0.1, 0.2, 0.3, 1.0]);
        unsafe {
            assert_eq!(values[attachment::DEPTH as usize].depth_stencil.depth, 1.0);
            assert_eq!(
                values[attachment::COLOR as usize].color.float32,
                [0.1, 0.2, 0.3, 1.0]
            );
        }
    }
}
