//! Texture ingest: decode with `image`, upload through staging, build mips by blits.
//!
//! Decoding runs on worker threads. A file that cannot be decoded is reported
//! to the caller, which substitutes [`DecodedImage::placeholder`].

use std::path::Path;

use ash::vk;
use image::DynamicImage;
use lucre_gpu::image::{subresource_range, ImageView};
use lucre_gpu::memory::{mip_count, Image, ImageDesc};
use lucre_gpu::upload::submit_upload;
use lucre_gpu::{GpuDevice, MemoryUsage, ResourcePools, UploadTicket};

use crate::error::{RenderError, Result};

/// Decoded pixel data.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// 8-bit RGBA.
    Rgba8(Vec<u8>),
    /// 32-bit float RGBA (HDR/EXR).
    Rgba32F(Vec<f32>),
}

/// A decoded image ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Pixels,
}

impl DecodedImage {
    /// 1x1 magenta, used when a texture fails to load.
    pub fn placeholder() -> Self {
        Self::solid([255, 0, 255, 255])
    }

    /// 1x1 image of one color.
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            pixels: Pixels::Rgba8(rgba.to_vec()),
        }
    }

    /// Convert a decoded [`DynamicImage`], keeping float precision for HDR sources.
    pub fn from_dynamic(image: DynamicImage) -> Self {
        let (width, height) = (image.width(), image.height());
        let pixels = match image {
            DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
                Pixels::Rgba32F(image.into_rgba32f().into_raw())
            }
            other => Pixels::Rgba8(other.into_rgba8().into_raw()),
        };
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Decode a file.
    pub fn load(path: &Path) -> Result<Self> {
        let image = image::open(path).map_err(|e| RenderError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_dynamic(image))
    }

    /// Decode an in-memory file.
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self> {
        let image = image::load_from_memory(bytes).map_err(|e| RenderError::Decode {
            path: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::from_dynamic(image))
    }

    /// Decode a file, or log and fall back to the placeholder.
    pub fn load_or_placeholder(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("{e}; using placeholder texture");
            Self::placeholder()
        })
    }

    pub fn is_hdr(&self) -> bool {
        matches!(self.pixels, Pixels::Rgba32F(_))
    }

    /// Raw bytes in upload order.
    pub fn bytes(&self) -> &[u8] {
        match &self.pixels {
            Pixels::Rgba8(data) => data,
            Pixels::Rgba32F(data) => bytemuck::cast_slice(data),
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }

    /// GPU format: float for HDR, sRGB or linear 8-bit otherwise.
    pub fn format(&self, srgb: bool) -> vk::Format {
        match (&self.pixels, srgb) {
            (Pixels::Rgba32F(_), _) => vk::Format::R32G32B32A32_SFLOAT,
            (Pixels::Rgba8(_), true) => vk::Format::R8G8B8A8_SRGB,
            (Pixels::Rgba8(_), false) => vk::Format::R8G8B8A8_UNORM,
        }
    }
}

/// A sampled texture.
#[derive(Debug)]
pub struct Texture {
    pub image: Image,
    pub view: ImageView,
    /// Bindless index once registered.
    pub bindless_index: Option<u32>,
}

impl Texture {
    /// Destroy the view and retire the image.
    ///
    /// # Safety
    /// The texture must not be in use.
    pub unsafe fn destroy(self, gpu: &GpuDevice) {
        self.view.destroy(gpu.device());
        gpu.destroy_image(self.image);
    }
}

/// Whether `format` supports linear blits (needed for mip generation).
pub fn supports_linear_blit(gpu: &GpuDevice, format: vk::Format) -> bool {
    let properties = unsafe {
        gpu.instance()
            .get_physical_device_format_properties(gpu.physical_device(), format)
    };
    properties
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR | vk::FormatFeatureFlags::BLIT_SRC | vk::FormatFeatureFlags::BLIT_DST)
}

/// Record a barrier on a mip range.
unsafe fn mip_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: &Image,
    base_mip: u32,
    mip_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let range = subresource_range(image.format, base_mip, mip_count, 0, image.array_layers);
    let (barrier, src_stage, dst_stage) =
        lucre_gpu::image::layout_barrier(image.image, range, old, new);
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Record mip generation: each level is blitted from the previous one.
///
/// Expects mip 0 in `TRANSFER_DST_OPTIMAL` and leaves every mip in
/// `SHADER_READ_ONLY_OPTIMAL`.
///
/// # Safety
/// The command buffer must be recording and the format must support linear blits.
pub unsafe fn record_mip_generation(device: &ash::Device, cmd: vk::CommandBuffer, image: &mut Image) {
    let layers = image.array_layers;
    let aspect = vk::ImageAspectFlags::COLOR;
    let mut width = image.extent.width as i32;
    let mut height = image.extent.height as i32;

    for mip in 1..image.mip_levels {
        mip_barrier(
            device,
            cmd,
            image,
            mip - 1,
            1,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );

        let next_width = (width / 2).max(1);
        let next_height = (height / 2).max(1);
        let blit = vk::ImageBlit::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(mip - 1)
                    .layer_count(layers),
            )
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: width,
                    y: height,
                    z: 1,
                },
            ])
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(aspect)
                    .mip_level(mip)
                    .layer_count(layers),
            )
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: next_width,
                    y: next_height,
                    z: 1,
                },
            ]);
        device.cmd_blit_image(
            cmd,
            image.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[blit],
            vk::Filter::LINEAR,
        );

        mip_barrier(
            device,
            cmd,
            image,
            mip - 1,
            1,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        width = next_width;
        height = next_height;
    }

    mip_barrier(
        device,
        cmd,
        image,
        image.mip_levels - 1,
        1,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    );
    image.assume_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
}

/// Upload `levels` as the mip chain of one image (level `i` is mip `i`).
///
/// With a single level and `generate_mips`, the remaining mips are blitted.
///
/// # Safety
/// The calling thread must be registered in `pools`.
pub unsafe fn upload_mip_chain(
    gpu: &GpuDevice,
    pools: &ResourcePools,
    levels: &[DecodedImage],
    srgb: bool,
    generate_mips: bool,
    name: &str,
) -> Result<(Texture, UploadTicket)> {
    let first = levels
        .first()
        .ok_or_else(|| RenderError::InvalidModel(format!("{name}: no image levels")))?;
    let format = first.format(srgb);
    for (mip, level) in levels.iter().enumerate() {
        let expected = (first.width >> mip).max(1);
        if level.width != expected || level.format(srgb) != format {
            return Err(RenderError::Decode {
                path: name.to_string(),
                reason: format!("level {mip} is {}px wide, expected {expected}", level.width),
            });
        }
    }

    let generate = generate_mips && levels.len() == 1 && supports_linear_blit(gpu, format);
    let mip_levels = if generate {
        mip_count(first.extent())
    } else {
        levels.len() as u32
    };

    let usage = vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_DST
        | vk::ImageUsageFlags::TRANSFER_SRC;
    let mut image = gpu.create_image(
        &ImageDesc::new_2d(format, first.extent(), usage).mips(mip_levels),
        name,
    )?;

    let total: usize = levels.iter().map(|l| l.bytes().len()).sum();
    let staging = gpu.create_buffer(
        total as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::HostVisible,
        &format!("{name}_staging"),
    )?;
    let mut regions = Vec::with_capacity(levels.len());
    let mut offset = 0u64;
    for (mip, level) in levels.iter().enumerate() {
        staging.write_bytes(offset, level.bytes())?;
        regions.push(
            vk::BufferImageCopy::default()
                .buffer_offset(staging.offset + offset)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(mip as u32)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: level.width,
                    height: level.height,
                    depth: 1,
                }),
        );
        offset += level.bytes().len() as u64;
    }

    let device = gpu.device();
    let src = staging.buffer;
    let ticket = submit_upload(gpu, pools, vec![staging], |cmd| {
        image.transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        device.cmd_copy_buffer_to_image(
            cmd,
            src,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        if generate {
            record_mip_generation(device, cmd, &mut image);
        } else {
            image.transition(device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
    })?;

    let view = ImageView::whole(device, &image)?;
    Ok((
        Texture {
            image,
            view,
            bindless_index: None,
        },
        ticket,
    ))
}

/// Upload one decoded image, generating mips.
///
/// # Safety
/// The calling thread must be registered in `pools`.
pub unsafe fn upload_texture(
    gpu: &GpuDevice,
    pools: &ResourcePools,
    decoded: &DecodedImage,
    srgb: bool,
    name: &str,
) -> Result<(Texture, UploadTicket)> {
    upload_mip_chain(gpu, pools, std::slice::from_ref(decoded), srgb, true, name)
}

/// Upload six equally sized faces (+X, -X, +Y, -Y, +Z, -Z) as a cube image.
///
/// # Safety
/// The calling thread must be registered in `pools`.
pub unsafe fn upload_cubemap(
    gpu: &GpuDevice,
    pools: &ResourcePools,
    faces: &[DecodedImage; 6],
    srgb: bool,
    name: &str,
) -> Result<(Texture, UploadTicket)> {
    let first = &faces[0];
    let format = first.format(srgb);
    if let Some(face) = faces
        .iter()
        .position(|f| f.extent() != first.extent() || f.format(srgb) != format)
    {
        return Err(RenderError::Decode {
            path: name.to_string(),
            reason: format!("cube face {face} does not match face 0"),
        });
    }

    let usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
    let mut image = gpu.create_image(&ImageDesc::new_2d(format, first.extent(), usage).cube(), name)?;

    let face_bytes = first.bytes().len() as u64;
    let staging = gpu.create_buffer(
        face_bytes * 6,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::HostVisible,
        &format!("{name}_staging"),
    )?;
    let mut regions = Vec::with_capacity(6);
    for (layer, face) in faces.iter().enumerate() {
        let offset = face_bytes * layer as u64;
        staging.write_bytes(offset, face.bytes())?;
        regions.push(
            vk::BufferImageCopy::default()
                .buffer_offset(staging.offset + offset)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_array_layer(layer as u32)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: first.width,
                    height: first.height,
                    depth: 1,
                }),
        );
    }

    let device = gpu.device();
    let src = staging.buffer;
    let ticket = submit_upload(gpu, pools, vec![staging], |cmd| {
        image.transition(device, cmd, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        device.cmd_copy_buffer_to_image(
            cmd,
            src,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        image.transition(device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    })?;

    let view = ImageView::whole(device, &image)?;
    Ok((
        Texture {
            image,
            view,
            bindless_index: None,
        },
        ticket,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb32FImage, RgbaImage};

    #[test]
    fn placeholder_is_one_magenta_pixel() {
        let placeholder = DecodedImage::placeholder();
        assert_eq!((placeholder.width, placeholder.height), (1, 1));
        assert_eq!(placeholder.bytes(), &[255, 0, 255, 255]);
        assert_eq!(placeholder.format(true), vk::Format::R8G8B8A8_SRGB);
        assert_eq!(placeholder.format(false), vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn float_sources_stay_float() {
        let hdr = DynamicImage::ImageRgb32F(Rgb32FImage::new(2, 2));
        let decoded = DecodedImage::from_dynamic(hdr);
        assert!(decoded.is_hdr());
        assert_eq!(decoded.bytes().len(), 2 * 2 * 4 * 4);
        assert_eq!(decoded.format(true), vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn png_bytes_decode_to_rgba8() {
        let mut png = Vec::new();
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 4])));
        source
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let decoded = DecodedImage::from_bytes(&png, "test.png").unwrap();
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(&decoded.bytes()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn missing_file_falls_back_to_placeholder() {
        let decoded = DecodedImage::load_or_placeholder(Path::new("does/not/exist.png"));
        assert_eq!(decoded, DecodedImage::placeholder());
        assert!(matches!(
            DecodedImage::load(Path::new("does/not/exist.png")),
            Err(RenderError::Decode { .. })
        ));
    }
}
