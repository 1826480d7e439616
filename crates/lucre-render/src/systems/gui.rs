//! GUI pass: screen-space sprites and immediate-mode GUI geometry.

use std::mem::{offset_of, size_of};

use ash::vk;
use glam::{Mat4, Vec2};
use lucre_entity::{draw_items, MaterialTag};
use lucre_gpu::{DescriptorWriter, GraphicsPipeline, MemoryUsage, SamplerKind};

use super::{bind_pipeline, bind_sets, push, FrameContext, RenderSystem, SceneView, SystemContext};
use crate::arena::Handle;
use crate::error::Result;
use crate::model::MaterialRef;
use crate::pipelines::{PipelineId, ScalarPushConstants, Stage, TintedPushConstants};
use crate::texture::Texture;

/// GUI vertex in screen pixels, origin top-left.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GuiVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    /// RGBA8, unorm.
    pub color: [u8; 4],
}

impl GuiVertex {
    pub fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    pub fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        let attr = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
        };
        vec![
            attr(0, vk::Format::R32G32_SFLOAT, offset_of!(Self, position)),
            attr(1, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attr(2, vk::Format::R8G8B8A8_UNORM, offset_of!(Self, color)),
        ]
    }
}

/// Triangles submitted by the application each frame.
#[derive(Debug, Clone, Default)]
pub struct GuiDrawList {
    pub vertices: Vec<GuiVertex>,
    pub indices: Vec<u32>,
    /// Font or icon atlas; white when unset.
    pub texture: Option<Handle<Texture>>,
}

impl GuiDrawList {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.indices.clear();
    }

    /// Append an axis-aligned rectangle covering the full texture.
    pub fn push_rect(&mut self, min: Vec2, max: Vec2, color: [u8; 4]) {
        let base = self.vertices.len() as u32;
        let corners = [
            ([min.x, min.y], [0.0, 0.0]),
            ([max.x, min.y], [1.0, 0.0]),
            ([max.x, max.y], [1.0, 1.0]),
            ([min.x, max.y], [0.0, 1.0]),
        ];
        self.vertices
            .extend(corners.iter().map(|&(position, uv)| GuiVertex { position, uv, color }));
        self.indices
            .extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

/// Pixel coordinates (origin top-left) to clip space.
pub fn screen_projection(extent: vk::Extent2D) -> Mat4 {
    Mat4::orthographic_rh(
        0.0,
        extent.width as f32,
        0.0,
        extent.height as f32,
        -1.0,
        1.0,
    )
}

/// Scale and offset taking GUI pixels to clip space, as push constants.
pub fn gui_transform(extent: vk::Extent2D) -> ScalarPushConstants {
    ScalarPushConstants {
        values: [
            2.0 / extent.width.max(1) as f32,
            2.0 / extent.height.max(1) as f32,
            -1.0,
            -1.0,
        ],
    }
}

/// Entities tagged [`MaterialTag::Sprite2D`], positioned in pixels.
pub struct Sprite2DSystem {
    pipeline: GraphicsPipeline,
}

impl Sprite2DSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Sprite2D)?,
        })
    }
}

impl RenderSystem for Sprite2DSystem {
    fn name(&self) -> &'static str {
        "sprite_2d"
    }

    fn stage(&self) -> Stage {
        Stage::Gui
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let items = draw_items(scene.world, MaterialTag::Sprite2D);
        if items.is_empty() {
            return Ok(());
        }
        let resources = &*scene.resources;
        let device = frame.device();
        let projection = screen_projection(frame.extent);
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);

        for item in items {
            let model = resources.model(item.model)?;
            let constants = TintedPushConstants {
                model: (projection * item.transform.matrix()).to_cols_array_2d(),
                tint: [1.0; 4],
            };
            push(device, frame.cmd, &self.pipeline, stages, &constants);
            model.bind(device, frame.cmd);
            for submesh in &model.submeshes {
                let material = match submesh.material {
                    Some(MaterialRef::Classical(handle)) => Some(handle),
                    _ => None,
                };
                let set = resources.material_set(material)?;
                bind_sets(device, frame.cmd, &self.pipeline, 0, &[set]);
                model.draw_submesh(device, frame.cmd, submesh, 1);
            }
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

/// Draws [`GuiDrawList`] from the scene resources.
pub struct GuiSystem {
    pipeline: GraphicsPipeline,
}

impl GuiSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::Gui)?,
        })
    }
}

impl RenderSystem for GuiSystem {
    fn name(&self) -> &'static str {
        "gui"
    }

    fn stage(&self) -> Stage {
        Stage::Gui
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let list = &scene.resources.gui;
        if list.is_empty() {
            return Ok(());
        }
        let gpu = frame.gpu;
        let device = frame.device();

        let set = frame.allocate_set(frame.layouts.single_texture)?;
        let view = scene.resources.texture_view_or_white(list.texture)?;
        DescriptorWriter::new()
            .sampled_image(
                set,
                0,
                view,
                frame.samplers.get(SamplerKind::LinearClamp),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .flush(gpu);

        // Both buffers are retired right away and stay alive until this frame slot is reused
        let vertices = gpu.create_buffer(
            (list.vertices.len() * size_of::<GuiVertex>()) as u64,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            MemoryUsage::HostVisible,
            "gui_vertices",
        )?;
        let indices = match gpu.create_buffer(
            (list.indices.len() * size_of::<u32>()) as u64,
            vk::BufferUsageFlags::INDEX_BUFFER,
            MemoryUsage::HostVisible,
            "gui_indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                gpu.free_buffer(vertices);
                return Err(e.into());
            }
        };
        let written = vertices
            .write(&list.vertices)
            .and_then(|()| indices.write(&list.indices));

        if written.is_ok() {
            bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
            bind_sets(device, frame.cmd, &self.pipeline, 0, &[set]);
            push(
                device,
                frame.cmd,
                &self.pipeline,
                vk::ShaderStageFlags::VERTEX,
                &gui_transform(frame.extent),
            );
            device.cmd_bind_vertex_buffers(frame.cmd, 0, &[vertices.buffer], &[vertices.offset]);
            device.cmd_bind_index_buffer(frame.cmd, indices.buffer, indices.offset, vk::IndexType::UINT32);
            device.cmd_draw_indexed(frame.cmd, list.indices.len() as u32, 1, 0, 0, 0);
        }
        gpu.free_buffer(vertices);
        gpu.free_buffer(indices);
        Ok(written?)
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn gui_vertex_is_twenty_bytes_with_packed_color() {
        assert_eq!(size_of::<GuiVertex>(), 20);
        let attributes = GuiVertex::attributes();
        assert_eq!(attributes[2].format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(attributes[2].offset, 16);
    }

    #[test]
    fn rect_appends_two_triangles() {
        let mut list = GuiDrawList::default();
        list.push_rect(Vec2::ZERO, Vec2::new(10.0, 5.0), [255; 4]);
        list.push_rect(Vec2::ONE, Vec2::new(2.0, 2.0), [0, 0, 0, 255]);
        assert_eq!(list.vertices.len(), 8);
        assert_eq!(list.indices.len(), 12);
        assert_eq!(&list.indices[6..9], &[4, 5, 6]);
        list.clear();
        assert!(list.is_empty());
    }

    #[test]
    fn screen_projection_puts_origin_top_left() {
        let extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let projection = screen_projection(extent);
        let top_left = projection * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let bottom_right = projection * Vec4::new(800.0, 600.0, 0.0, 1.0);
        assert_relative_eq!(top_left.x, -1.0, epsilon = 1e-6);
        assert_relative_eq!(top_left.y, -1.0, epsilon = 1e-6);
        assert_relative_eq!(bottom_right.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(bottom_right.y, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn gui_transform_maps_pixels_to_clip_space() {
        let values = gui_transform(vk::Extent2D {
            width: 400,
            height: 200,
        })
        .values;
        assert_relative_eq!(400.0 * values[0] + values[2], 1.0);
        assert_relative_eq!(200.0 * values[1] + values[3], 1.0);
    }
}
