//! Image-based lighting inputs and the HDRI skybox cube.

use std::path::{Path, PathBuf};

use ash::vk;
use glam::{Vec2, Vec3, Vec4};
use lucre_gpu::{DescriptorWriter, GpuDevice, ResourcePools, SamplerKind, SamplerRegistry, UploadTicket};
use rayon::prelude::*;

use crate::error::Result;
use crate::layouts::ibl_binding;
use crate::model::{Builder, Vertex};
use crate::texture::{upload_mip_chain, upload_texture, DecodedImage, Texture};

/// Number of prefiltered specular mips.
pub const SPECULAR_MIPS: usize = 6;
/// Vertices of the skybox cube.
pub const SKYBOX_VERTEX_COUNT: usize = 36;

/// The nine IBL source files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IblFiles {
    pub brdf_lut: PathBuf,
    pub environment: PathBuf,
    pub diffuse: PathBuf,
    /// Prefiltered specular, mip 0 first; each is half the size of the previous.
    pub specular: [PathBuf; SPECULAR_MIPS],
}

impl IblFiles {
    /// Files in order: BRDF LUT, environment, diffuse, specular mips 0..6.
    pub fn from_paths(paths: [PathBuf; 9]) -> Self {
        let [brdf_lut, environment, diffuse, s0, s1, s2, s3, s4, s5] = paths;
        Self {
            brdf_lut,
            environment,
            diffuse,
            specular: [s0, s1, s2, s3, s4, s5],
        }
    }

    /// Every path in load order.
    pub fn paths(&self) -> Vec<&Path> {
        [&self.brdf_lut, &self.environment, &self.diffuse]
            .into_iter()
            .chain(&self.specular)
            .map(PathBuf::as_path)
            .collect()
    }
}

/// Decoded IBL images.
#[derive(Debug, Clone)]
pub struct DecodedIbl {
    pub brdf_lut: DecodedImage,
    pub environment: DecodedImage,
    pub diffuse: DecodedImage,
    pub specular: Vec<DecodedImage>,
}

/// A descriptor set and the layout it was allocated with.
#[derive(Debug, Clone, Copy)]
pub struct ResourceDescriptor {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
}

/// Uploaded IBL textures, their descriptor set, and the skybox cube.
#[derive(Debug)]
pub struct Ibl {
    pub brdf_lut: Texture,
    pub environment: Texture,
    pub diffuse: Texture,
    pub specular: Texture,
    pub descriptor: ResourceDescriptor,
    pub skybox: Builder,
}

impl Ibl {
    /// # Safety
    /// The textures must not be in use.
    pub unsafe fn destroy(self, gpu: &GpuDevice) {
        for texture in [self.brdf_lut, self.environment, self.diffuse, self.specular] {
            texture.destroy(gpu);
        }
    }
}

/// Loads the nine IBL files and builds an [`Ibl`].
#[derive(Debug, Clone)]
pub struct IblBuilder {
    files: IblFiles,
}

impl IblBuilder {
    pub fn new(files: IblFiles) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &IblFiles {
        &self.files
    }

    /// Decode all nine files in parallel. Any failure fails the whole set.
    pub fn decode(&self) -> Result<DecodedIbl> {
        let mut images = self
            .files
            .paths()
            .into_par_iter()
            .map(DecodedImage::load)
            .collect::<Result<Vec<_>>>()?
            .into_iter();

        let mut next = || images.next().unwrap_or_else(DecodedImage::placeholder);
        let brdf_lut = next();
        let environment = next();
        let diffuse = next();
        let specular = (0..SPECULAR_MIPS).map(|_| next()).collect();
        Ok(DecodedIbl {
            brdf_lut,
            environment,
            diffuse,
            specular,
        })
    }

    /// Upload decoded images and write the IBL descriptor set.
    ///
    /// The returned ticket covers every upload (they share one semaphore).
    ///
    /// # Safety
    /// The calling thread must be registered in `pools`.
    pub unsafe fn build(
        decoded: &DecodedIbl,
        gpu: &GpuDevice,
        pools: &ResourcePools,
        layout: vk::DescriptorSetLayout,
        samplers: &SamplerRegistry,
    ) -> Result<(Ibl, UploadTicket)> {
        let (brdf_lut, _) = upload_mip_chain(
            gpu,
            pools,
            std::slice::from_ref(&decoded.brdf_lut),
            false,
            false,
            "ibl_brdf_lut",
        )?;
        let (environment, _) = upload_texture(gpu, pools, &decoded.environment, true, "ibl_environment")?;
        let (diffuse, _) = upload_texture(gpu, pools, &decoded.diffuse, true, "ibl_diffuse")?;
        let (specular, ticket) =
            upload_mip_chain(gpu, pools, &decoded.specular, true, false, "ibl_specular")?;

        let set = pools.descriptor_pool()?.allocate_one(gpu, layout)?;
        let clamp = samplers.get(SamplerKind::LinearClamp);
        let repeat = samplers.get(SamplerKind::LinearRepeat);
        let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        DescriptorWriter::new()
            .sampled_image(set, ibl_binding::BRDF_LUT, brdf_lut.view.view, clamp, read_only)
            .sampled_image(set, ibl_binding::ENVIRONMENT, environment.view.view, repeat, read_only)
            .sampled_image(set, ibl_binding::DIFFUSE, diffuse.view.view, repeat, read_only)
            .sampled_image(set, ibl_binding::SPECULAR, specular.view.view, repeat, read_only)
            .flush(gpu);

        tracing::debug!(
            "IBL ready: environment {}x{}, {} specular mips",
            decoded.environment.width,
            decoded.environment.height,
            decoded.specular.len()
        );

        Ok((
            Ibl {
                brdf_lut,
                environment,
                diffuse,
                specular,
                descriptor: ResourceDescriptor { layout, set },
                skybox: skybox_builder(),
            },
            ticket,
        ))
    }
}

/// The 36 corners of an NDC cube, two triangles per face, wound for viewing
/// from inside.
pub fn skybox_cube_vertices() -> [Vec3; SKYBOX_VERTEX_COUNT] {
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::NEG_Z, Vec3::X),
        (Vec3::Z, Vec3::Y, Vec3::NEG_X),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];
    let mut vertices = [Vec3::ZERO; SKYBOX_VERTEX_COUNT];
    for (face, (normal, up, right)) in faces.into_iter().enumerate() {
        let corner = |u: f32, v: f32| normal + right * u + up * v;
        let quad = [
            corner(-1.0, -1.0),
            corner(1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, -1.0),
            corner(1.0, 1.0),
            corner(-1.0, 1.0),
        ];
        vertices[face * 6..face * 6 + 6].copy_from_slice(&quad);
    }
    vertices
}

/// Non-indexed single-submesh skybox model.
pub fn skybox_builder() -> Builder {
    let vertices: Vec<Vertex> = skybox_cube_vertices()
        .into_iter()
        .map(|p| Vertex::new(p, Vec4::ONE, -p.normalize(), Vec2::ZERO))
        .collect();
    let mut builder = Builder::new();
    builder.push_submesh(&vertices, &[], None);
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> IblFiles {
        IblFiles::from_paths(std::array::from_fn(|i| PathBuf::from(format!("ibl/{i}.hdr"))))
    }

    #[test]
    fn nine_files_map_to_their_slots() {
        let files = files();
        assert_eq!(files.brdf_lut, PathBuf::from("ibl/0.hdr"));
        assert_eq!(files.diffuse, PathBuf::from("ibl/2.hdr"));
        assert_eq!(files.specular[5], PathBuf::from("ibl/8.hdr"));
        assert_eq!(files.paths().len(), 9);
    }

    #[test]
    fn missing_files_fail_the_set() {
        assert!(IblBuilder::new(files()).decode().is_err());
    }

    #[test]
    fn skybox_has_36_corners_of_the_ndc_cube() {
        let vertices = skybox_cube_vertices();
        assert_eq!(vertices.len(), SKYBOX_VERTEX_COUNT);
        for v in vertices {
            assert_eq!(v.abs(), Vec3::ONE);
        }
    }

    #[test]
    fn skybox_faces_point_inward() {
        let vertices = skybox_cube_vertices();
        for tri in vertices.chunks(3) {
            let normal = (tri[1] - tri[0]).cross(tri[2] - tri[0]);
            let center = (tri[0] + tri[1] + tri[2]) / 3.0;
            assert!(normal.dot(center) < 0.0);
        }
    }

    #[test]
    fn skybox_builder_is_valid_and_unindexed() {
        let builder = skybox_builder();
        assert!(builder.validate().is_ok());
        assert!(builder.indices.is_empty());
        assert_eq!(builder.submeshes[0].vertex_count, 36);
    }
}
