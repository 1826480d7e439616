//! Models: packed vertex/index buffers built from a [`Builder`].

use std::mem::{offset_of, size_of};

use ash::vk;
use glam::{Vec2, Vec3, Vec4};
use lucre_gpu::upload::create_device_local_buffer;
use lucre_gpu::{Buffer, GpuDevice, ResourcePools, UploadTicket};

use crate::arena::Handle;
use crate::error::{RenderError, Result};
use crate::instance::InstanceData;
use crate::material::Material;

/// Vertex layout shared by every non-bindless pipeline.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 4],
    pub joint_ids: [u32; 4],
    pub weights: [f32; 4],
}

/// Vertex stream binding.
pub const VERTEX_BINDING: u32 = 0;
/// Per-instance stream binding.
pub const INSTANCE_BINDING: u32 = 1;
/// First attribute location of the instance stream.
pub const INSTANCE_FIRST_LOCATION: u32 = 7;

impl Vertex {
    pub fn new(position: Vec3, color: Vec4, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
            tangent: [1.0, 0.0, 0.0, 1.0],
            joint_ids: [0; 4],
            weights: [0.0; 4],
        }
    }

    /// Vertex bindings: the vertex stream only.
    pub fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription::default()
            .binding(VERTEX_BINDING)
            .stride(size_of::<Self>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)]
    }

    /// Attributes of the vertex stream, locations 0..=6.
    pub fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        let attr = |location, format, offset: usize| {
            vk::VertexInputAttributeDescription::default()
                .binding(VERTEX_BINDING)
                .location(location)
                .format(format)
                .offset(offset as u32)
        };
        vec![
            attr(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attr(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, color)),
            attr(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attr(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attr(4, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, tangent)),
            attr(5, vk::Format::R32G32B32A32_UINT, offset_of!(Self, joint_ids)),
            attr(6, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, weights)),
        ]
    }

    /// Vertex plus per-instance streams.
    pub fn instanced_bindings() -> Vec<vk::VertexInputBindingDescription> {
        let mut bindings = Self::bindings();
        bindings.push(
            vk::VertexInputBindingDescription::default()
                .binding(INSTANCE_BINDING)
                .stride(size_of::<InstanceData>() as u32)
                .input_rate(vk::VertexInputRate::INSTANCE),
        );
        bindings
    }

    /// Vertex attributes plus the instance model and normal matrices (one
    /// location per column), locations 7..=14.
    pub fn instanced_attributes() -> Vec<vk::VertexInputAttributeDescription> {
        let mut attributes = Self::attributes();
        attributes.extend((0..8u32).map(|column| {
            vk::VertexInputAttributeDescription::default()
                .binding(INSTANCE_BINDING)
                .location(INSTANCE_FIRST_LOCATION + column)
                .format(vk::Format::R32G32B32A32_SFLOAT)
                .offset(column * 16)
        }));
        attributes
    }
}

/// Material a submesh is drawn with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialRef {
    /// Classical per-material descriptor set.
    Classical(Handle<Material>),
    /// Index into the bindless material/texture array.
    Bindless(u32),
}

/// A draw range within a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submesh {
    pub first_index: u32,
    pub index_count: u32,
    pub first_vertex: u32,
    pub vertex_count: u32,
    pub material: Option<MaterialRef>,
}

/// CPU-side model data produced by ingest.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub submeshes: Vec<Submesh>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a submesh from its own vertices and (local) indices.
    pub fn push_submesh(
        &mut self,
        vertices: &[Vertex],
        indices: &[u32],
        material: Option<MaterialRef>,
    ) -> &mut Self {
        let first_vertex = self.vertices.len() as u32;
        let first_index = self.indices.len() as u32;
        self.vertices.extend_from_slice(vertices);
        self.indices.extend_from_slice(indices);
        self.submeshes.push(Submesh {
            first_index,
            index_count: indices.len() as u32,
            first_vertex,
            vertex_count: vertices.len() as u32,
            material,
        });
        self
    }

    /// Check that every submesh and index stays in bounds.
    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() {
            return Err(RenderError::InvalidModel("model has no vertices".to_string()));
        }
        if self.submeshes.is_empty() {
            return Err(RenderError::InvalidModel("model has no submeshes".to_string()));
        }

        let vertex_count = self.vertices.len() as u64;
        let index_count = self.indices.len() as u64;
        for (i, submesh) in self.submeshes.iter().enumerate() {
            let vertex_end = u64::from(submesh.first_vertex) + u64::from(submesh.vertex_count);
            if vertex_end > vertex_count {
                return Err(RenderError::InvalidModel(format!(
                    "submesh {i} vertices end at {vertex_end}, model has {vertex_count}"
                )));
            }
            if submesh.index_count == 0 {
                continue;
            }
            let index_end = u64::from(submesh.first_index) + u64::from(submesh.index_count);
            if index_end > index_count {
                return Err(RenderError::InvalidModel(format!(
                    "submesh {i} indices end at {index_end}, model has {index_count}"
                )));
            }
            let range = submesh.first_index as usize..index_end as usize;
            if let Some(&bad) = self.indices[range]
                .iter()
                .find(|&&index| index >= submesh.vertex_count)
            {
                return Err(RenderError::InvalidModel(format!(
                    "submesh {i} index {bad} out of {} vertices",
                    submesh.vertex_count
                )));
            }
        }
        Ok(())
    }

    /// Assign `material` to every submesh.
    pub fn with_material(mut self, material: MaterialRef) -> Self {
        for submesh in &mut self.submeshes {
            submesh.material = Some(material);
        }
        self
    }

    /// Axis-aligned cube of edge `size`, centered on the origin, one submesh.
    pub fn cube(size: f32, color: Vec4) -> Self {
        let h = size * 0.5;
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_X, Vec3::Y, Vec3::Z),
            (Vec3::Y, Vec3::NEG_Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::Z, Vec3::X),
            (Vec3::Z, Vec3::Y, Vec3::X),
            (Vec3::NEG_Z, Vec3::Y, Vec3::NEG_X),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, up, right) in faces {
            let base = vertices.len() as u32;
            let center = normal * h;
            for (u, v) in [(0.0, 1.0), (1.0, 1.0), (1.0, 0.0), (0.0, 0.0)] {
                let position = center + right * (u * 2.0 - 1.0) * h + up * (1.0 - v * 2.0) * h;
                vertices.push(Vertex::new(position, color, normal, Vec2::new(u, v)));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        let mut builder = Self::new();
        builder.push_submesh(&vertices, &indices, None);
        builder
    }

    /// Square in the XZ plane facing `+Y`.
    pub fn plane(size: f32, color: Vec4) -> Self {
        let h = size * 0.5;
        let corners = [
            (Vec3::new(-h, 0.0, h), Vec2::new(0.0, 1.0)),
            (Vec3::new(h, 0.0, h), Vec2::new(1.0, 1.0)),
            (Vec3::new(h, 0.0, -h), Vec2::new(1.0, 0.0)),
            (Vec3::new(-h, 0.0, -h), Vec2::new(0.0, 0.0)),
        ];
        let vertices: Vec<Vertex> = corners
            .iter()
            .map(|&(p, uv)| Vertex::new(p, color, Vec3::Y, uv))
            .collect();
        let mut builder = Self::new();
        builder.push_submesh(&vertices, &[0, 1, 2, 0, 2, 3], None);
        builder
    }

    /// Quad in the XY plane facing `+Z`.
    pub fn quad(width: f32, height: f32, color: Vec4) -> Self {
        let (w, h) = (width * 0.5, height * 0.5);
        let corners = [
            (Vec3::new(-w, -h, 0.0), Vec2::new(0.0, 1.0)),
            (Vec3::new(w, -h, 0.0), Vec2::new(1.0, 1.0)),
            (Vec3::new(w, h, 0.0), Vec2::new(1.0, 0.0)),
            (Vec3::new(-w, h, 0.0), Vec2::new(0.0, 0.0)),
        ];
        let vertices: Vec<Vertex> = corners
            .iter()
            .map(|&(p, uv)| Vertex::new(p, color, Vec3::Z, uv))
            .collect();
        let mut builder = Self::new();
        builder.push_submesh(&vertices, &[0, 1, 2, 0, 2, 3], None);
        builder
    }
}

/// GPU model: device-local vertex buffer, optional index buffer, submeshes.
#[derive(Debug)]
pub struct Model {
    pub vertex_buffer: Buffer,
    pub index_buffer: Option<Buffer>,
    pub submeshes: Vec<Submesh>,
    pub vertex_count: u32,
    pub index_count: u32,
    /// Must be waited on before the first draw.
    pub ticket: UploadTicket,
}

impl Model {
    /// Upload `builder` through the calling thread's pools.
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn upload(
        gpu: &GpuDevice,
        pools: &ResourcePools,
        builder: &Builder,
        name: &str,
    ) -> Result<Self> {
        builder.validate()?;

        let mut vertex_usage = vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER;
        if gpu.capabilities().supports_buffer_device_address {
            vertex_usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        let (vertex_buffer, mut ticket) = create_device_local_buffer(
            gpu,
            pools,
            bytemuck::cast_slice(&builder.vertices),
            vertex_usage,
            &format!("{name}_vertices"),
        )?;

        let index_buffer = if builder.indices.is_empty() {
            None
        } else {
            let (buffer, index_ticket) = create_device_local_buffer(
                gpu,
                pools,
                bytemuck::cast_slice(&builder.indices),
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
                &format!("{name}_indices"),
            )?;
            // Same thread, same semaphore: the later value covers both
            ticket = index_ticket;
            Some(buffer)
        };

        Ok(Self {
            vertex_buffer,
            index_buffer,
            submeshes: builder.submeshes.clone(),
            vertex_count: builder.vertices.len() as u32,
            index_count: builder.indices.len() as u32,
            ticket,
        })
    }

    /// Bind vertex (and index) buffers.
    ///
    /// # Safety
    /// The command buffer must be recording.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffers(
            cmd,
            VERTEX_BINDING,
            &[self.vertex_buffer.buffer],
            &[self.vertex_buffer.offset],
        );
        if let Some(index) = &self.index_buffer {
            device.cmd_bind_index_buffer(cmd, index.buffer, index.offset, vk::IndexType::UINT32);
        }
    }

    /// Draw one submesh `instance_count` times.
    ///
    /// # Safety
    /// Buffers must be bound and the command buffer recording.
    pub unsafe fn draw_submesh(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        submesh: &Submesh,
        instance_count: u32,
    ) {
        if self.index_buffer.is_some() && submesh.index_count > 0 {
            device.cmd_draw_indexed(
                cmd,
                submesh.index_count,
                instance_count,
                submesh.first_index,
                submesh.first_vertex as i32,
                0,
            );
        } else {
            device.cmd_draw(
                cmd,
                submesh.vertex_count,
                instance_count,
                submesh.first_vertex,
                0,
            );
        }
    }

    /// Device address of the vertex buffer, for bindless pipelines.
    pub fn vertex_address(&self) -> Option<vk::DeviceAddress> {
        self.vertex_buffer.device_address()
    }

    /// Retire the buffers.
    pub fn destroy(self, gpu: &GpuDevice) {
        gpu.free_buffer(self.vertex_buffer);
        if let Some(index) = self.index_buffer {
            gpu.free_buffer(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_attributes_match_layout() {
        let attributes = Vertex::attributes();
        assert_eq!(attributes.len(), 7);
        assert_eq!(attributes[0].offset, 0);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[5].format, vk::Format::R32G32B32A32_UINT);
        assert_eq!(Vertex::bindings()[0].stride as usize, size_of::<Vertex>());
        let locations: Vec<_> = attributes.iter().map(|a| a.location).collect();
        assert_eq!(locations, (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn instance_stream_follows_vertex_stream() {
        let bindings = Vertex::instanced_bindings();
        assert_eq!(bindings[1].input_rate, vk::VertexInputRate::INSTANCE);
        assert_eq!(bindings[1].stride, 128);

        let attributes = Vertex::instanced_attributes();
        assert_eq!(attributes.len(), 15);
        let last = attributes[14];
        assert_eq!(last.location, 14);
        assert_eq!(last.binding, INSTANCE_BINDING);
        assert_eq!(last.offset, 112);
    }

    #[test]
    fn cube_has_six_faces() {
        let cube = Builder::cube(2.0, Vec4::ONE);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.validate().is_ok());
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.abs() <= 1.0)));
    }

    #[test]
    fn cube_faces_wind_counter_clockwise_outward() {
        let cube = Builder::cube(2.0, Vec4::ONE);
        for tri in cube.indices.chunks(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(cube.vertices[i as usize].position));
            let normal = Vec3::from(cube.vertices[tri[0] as usize].normal);
            assert!((b - a).cross(c - a).dot(normal) > 0.0);
        }
    }

    #[test]
    fn submeshes_index_locally() {
        let mut builder = Builder::new();
        let plane = Builder::plane(1.0, Vec4::ONE);
        builder.push_submesh(&plane.vertices, &plane.indices, None);
        builder.push_submesh(&plane.vertices, &plane.indices, Some(MaterialRef::Bindless(3)));
        assert_eq!(builder.submeshes[1].first_vertex, 4);
        assert_eq!(builder.submeshes[1].first_index, 6);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn validation_rejects_out_of_range_data() {
        assert!(Builder::new().validate().is_err());

        let mut bad_index = Builder::plane(1.0, Vec4::ONE);
        bad_index.indices[0] = 9;
        assert!(bad_index.validate().is_err());

        let mut bad_range = Builder::plane(1.0, Vec4::ONE);
        bad_range.submeshes[0].index_count = 12;
        assert!(bad_range.validate().is_err());
    }
}
