//! Baked graphics pipelines.
//!
//! Pipelines are built against a render pass and subpass index. The defaults
//! are a triangle list, counter-clockwise front faces, back-face culling, and
//! `LESS` depth testing with writes; viewport and scissor are dynamic.

use crate::error::{GpuError, Result};
use ash::vk;
use lucre_core::constants::MAX_PUSH_CONSTANT_BYTES;

/// How fragments combine with the color attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Overwrite.
    Opaque,
    /// `src.a * src + (1 - src.a) * dst`.
    AlphaBlend,
    /// `src + dst`.
    Additive,
}

impl BlendMode {
    /// Blend state for one attachment.
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        match self {
            Self::Opaque => state.blend_enable(false),
            Self::AlphaBlend => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                .alpha_blend_op(vk::BlendOp::ADD),
            Self::Additive => state
                .blend_enable(true)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ONE)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ONE)
                .alpha_blend_op(vk::BlendOp::ADD),
        }
    }
}

/// Rasterizer depth bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant: f32,
    pub slope: f32,
}

/// Graphics pipeline configuration.
#[derive(Clone)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: vk::ShaderModule,
    /// `None` for depth-only pipelines.
    pub fragment_shader: Option<vk::ShaderModule>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub depth_bias: Option<DepthBias>,
    pub blend: BlendMode,
    /// Color attachments the subpass writes.
    pub color_attachment_count: u32,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: vk::ShaderModule::null(),
            fragment_shader: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            depth_bias: None,
            blend: BlendMode::Opaque,
            color_attachment_count: 1,
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

impl GraphicsPipelineConfig {
    /// Target a render pass subpass.
    pub fn target(mut self, render_pass: vk::RenderPass, subpass: u32) -> Self {
        self.render_pass = render_pass;
        self.subpass = subpass;
        self
    }

    /// Set the shader modules.
    pub fn shaders(mut self, vertex: vk::ShaderModule, fragment: Option<vk::ShaderModule>) -> Self {
        self.vertex_shader = vertex;
        self.fragment_shader = fragment;
        self
    }

    /// Set the vertex input layout.
    pub fn vertex_input(
        mut self,
        bindings: Vec<vk::VertexInputBindingDescription>,
        attributes: Vec<vk::VertexInputAttributeDescription>,
    ) -> Self {
        self.vertex_bindings = bindings;
        self.vertex_attributes = attributes;
        self
    }

    /// Set depth test and write.
    pub fn depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    /// Set blending and the number of color attachments it applies to.
    pub fn blend(mut self, blend: BlendMode, color_attachment_count: u32) -> Self {
        self.blend = blend;
        self.color_attachment_count = color_attachment_count;
        self
    }

    /// Set the cull mode.
    pub fn cull(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    /// Enable depth bias.
    pub fn depth_bias(mut self, constant: f32, slope: f32) -> Self {
        self.depth_bias = Some(DepthBias { constant, slope });
        self
    }

    /// One blend state per color attachment.
    pub fn blend_attachments(&self) -> Vec<vk::PipelineColorBlendAttachmentState> {
        (0..self.color_attachment_count)
            .map(|_| self.blend.attachment_state())
            .collect()
    }
}

/// Total push-constant bytes across ranges (ranges may overlap across stages).
pub fn push_constant_bytes(ranges: &[vk::PushConstantRange]) -> u32 {
    ranges
        .iter()
        .map(|r| r.offset + r.size)
        .max()
        .unwrap_or(0)
}

/// Reject push-constant layouts over the per-system budget.
pub fn check_push_constant_budget(ranges: &[vk::PushConstantRange]) -> Result<()> {
    let bytes = push_constant_bytes(ranges);
    if bytes > MAX_PUSH_CONSTANT_BYTES {
        return Err(GpuError::PipelineCreation(format!(
            "Push constants use {bytes} bytes, budget is {MAX_PUSH_CONSTANT_BYTES}"
        )));
    }
    Ok(())
}

/// Create a pipeline layout.
///
/// # Safety
/// The device and set layouts must be valid.
pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    descriptor_set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    check_push_constant_budget(push_constant_ranges)?;

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(descriptor_set_layouts)
        .push_constant_ranges(push_constant_ranges);

    device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Graphics pipeline wrapper.
#[derive(Debug)]
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline.
    ///
    /// # Safety
    /// The device, render pass, and shader modules must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        let layout = create_pipeline_layout(device, descriptor_set_layouts, push_constant_ranges)?;

        match Self::with_layout(device, config, layout) {
            Ok(pipeline) => Ok(Self { pipeline, layout }),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    unsafe fn with_layout(
        device: &ash::Device,
        config: &GraphicsPipelineConfig,
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(config.vertex_shader)
            .name(c"main")];
        if let Some(fragment) = config.fragment_shader {
            shader_stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment)
                    .name(c"main"),
            );
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.vertex_bindings)
            .vertex_attribute_descriptions(&config.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let bias = config.depth_bias;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(bias.is_some())
            .depth_bias_constant_factor(bias.map_or(0.0, |b| b.constant))
            .depth_bias_slope_factor(bias.map_or(0.0, |b| b.slope))
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = config.blend_attachments();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(config.render_pass)
            .subpass(config.subpass);

        let pipelines = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

        Ok(pipelines[0])
    }

    /// Bind the pipeline.
    ///
    /// # Safety
    /// The command buffer must be recording inside a compatible subpass.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
    }

    /// Destroy the pipeline.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Set a full-extent viewport and scissor.
///
/// # Safety
/// The command buffer must be recording.
pub unsafe fn set_viewport_and_scissor(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    extent: vk::Extent2D,
) {
    let viewport = vk::Viewport::default()
        .width(extent.width as f32)
        .height(extent.height as f32)
        .max_depth(1.0);
    let scissor = vk::Rect2D::default().extent(extent);
    device.cmd_set_viewport(cmd, 0, &[viewport]);
    device.cmd_set_scissor(cmd, 0, &[scissor]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_baked_state() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(config.front_face, vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(config.cull_mode, vk::CullModeFlags::BACK);
        assert!(config.depth_test && config.depth_write);
        assert_eq!(config.depth_compare, vk::CompareOp::LESS);
    }

    #[test]
    fn one_blend_state_per_color_attachment() {
        let gbuffer = GraphicsPipelineConfig::default().blend(BlendMode::Opaque, 5);
        let states = gbuffer.blend_attachments();
        assert_eq!(states.len(), 5);
        assert!(states.iter().all(|s| s.blend_enable == vk::FALSE));

        let shadow = GraphicsPipelineConfig::default().blend(BlendMode::Opaque, 0);
        assert!(shadow.blend_attachments().is_empty());
    }

    #[test]
    fn alpha_blend_is_standard_over() {
        let state = BlendMode::AlphaBlend.attachment_state();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(state.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
    }

    #[test]
    fn push_constant_budget_is_enforced() {
        let within = [
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::VERTEX)
                .size(64),
            vk::PushConstantRange::default()
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .offset(64)
                .size(64),
        ];
        assert_eq!(push_constant_bytes(&within), 128);
        assert!(check_push_constant_budget(&within).is_ok());

        let over = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .size(132)];
        assert!(check_push_constant_budget(&over).is_err());
        assert_eq!(push_constant_bytes(&[]), 0);
    }

    #[test]
    fn depth_bias_builder() {
        let config = GraphicsPipelineConfig::default().depth_bias(8.0, 3.0);
        assert_eq!(
            config.depth_bias,
            Some(DepthBias {
                constant: 8.0,
                slope: 3.0
            })
        );
    }
}
