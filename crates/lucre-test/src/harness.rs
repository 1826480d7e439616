//! Test harness for headless rendering and visual regression testing.
//!
//! [`HeadlessRenderer`] drives the full frame graph into an offscreen target
//! and reads the final image back, so scenes can be checked without a display.

use std::mem::ManuallyDrop;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::Vec3;
use image::{Rgba, RgbaImage};
use lucre_core::RendererConfig;
use lucre_entity::World;
use lucre_gpu::GpuDeviceBuilder;
use lucre_render::{Camera, FrameOutcome, Renderer};

use crate::{Result, TestError, VisualTestConfig};

/// Time step handed to the renderer for every test frame.
const TEST_TIMESTEP: f32 = 1.0 / 60.0;

/// Renderer settings for tests: shaders from the workspace `bin-int`
/// directory (or `LUCRE_SHADER_DIR`), validation on, small worker pools.
pub fn test_config() -> RendererConfig {
    let shader_dir = std::env::var_os("LUCRE_SHADER_DIR").map_or_else(
        || Path::new(env!("CARGO_MANIFEST_DIR")).join("../../bin-int"),
        PathBuf::from,
    );
    RendererConfig {
        validation: true,
        shadow_map_size: 512,
        primary_workers: 2,
        secondary_workers: 1,
        shader_dir,
        ..RendererConfig::default()
    }
}

/// Headless renderer for testing.
///
/// Owns a headless device and a [`Renderer`] with an offscreen output.
pub struct HeadlessRenderer {
    renderer: ManuallyDrop<Renderer>,
    width: u32,
    height: u32,
}

impl HeadlessRenderer {
    /// Create a new headless renderer.
    ///
    /// # Arguments
    /// * `width` - Output image width
    /// * `height` - Output image height
    pub fn new(width: u32, height: u32) -> Result<Self> {
        Self::with_config(width, height, test_config())
    }

    /// Create a headless renderer with custom settings.
    pub fn with_config(width: u32, height: u32, config: RendererConfig) -> Result<Self> {
        let gpu = GpuDeviceBuilder::new()
            .app_name("lucre-test")
            .validation(config.validation)
            .headless(true)
            .build()
            .map_err(|e| TestError::Gpu(e.to_string()))?;

        // SAFETY: the device was just created and the renderer stays on this thread
        let renderer = unsafe { Renderer::offscreen(Arc::new(gpu), width, height, config)? };

        Ok(Self {
            renderer: ManuallyDrop::new(renderer),
            width,
            height,
        })
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut Renderer {
        &mut self.renderer
    }

    /// Render one frame of `world` and read it back.
    pub fn render(&mut self, world: &World, camera: &Camera) -> Result<RgbaImage> {
        // SAFETY: the renderer is only used from the thread that created it
        let outcome = unsafe { self.renderer.render(world, camera, TEST_TIMESTEP)? };
        if outcome == FrameOutcome::Skipped {
            return Err(TestError::Gpu("Frame was skipped".to_string()));
        }
        // SAFETY: same thread; the frame above was submitted
        Ok(unsafe { self.renderer.read_output()? })
    }

    /// Resize the offscreen output. Applied on the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(width, height);
        self.width = width;
        self.height = height;
    }

    /// Get the output dimensions.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl Drop for HeadlessRenderer {
    fn drop(&mut self) {
        // SAFETY: the renderer is taken exactly once, here
        let renderer = unsafe { ManuallyDrop::take(&mut self.renderer) };
        // SAFETY: drop runs on the owning thread
        if let Err(e) = unsafe { renderer.destroy() } {
            tracing::error!("Failed to destroy headless renderer: {e}");
        }
    }
}

/// Visual regression test runner.
///
/// Compares rendered images against baseline images and reports differences.
pub struct VisualRegressionTest {
    config: VisualTestConfig,
    renderer: HeadlessRenderer,
}

impl VisualRegressionTest {
    /// Create a new visual regression test runner.
    ///
    /// # Arguments
    /// * `config` - Test configuration
    pub fn new(config: VisualTestConfig) -> Result<Self> {
        Self::with_dimensions(config, 256, 256)
    }

    /// Create with custom dimensions.
    pub fn with_dimensions(config: VisualTestConfig, width: u32, height: u32) -> Result<Self> {
        let renderer = HeadlessRenderer::new(width, height)?;
        Ok(Self { config, renderer })
    }

    /// The renderer, for uploading the models and materials a scene needs.
    pub fn renderer_mut(&mut self) -> &mut HeadlessRenderer {
        &mut self.renderer
    }

    /// Run a test case.
    ///
    /// # Arguments
    /// * `name` - Test case name (used for baseline filename)
    /// * `world` - The entities to render
    /// * `camera` - Camera configuration
    pub fn run_test(&mut self, name: &str, world: &World, camera: &Camera) -> Result<()> {
        let image = self.renderer.render(world, camera)?;
        self.compare_and_save(name, &image)
    }

    fn compare_and_save(&self, name: &str, image: &RgbaImage) -> Result<()> {
        std::fs::create_dir_all(&self.config.baseline_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        let baseline_path = format!("{}/{}.png", self.config.baseline_dir, name);
        let output_path = format!("{}/{}.png", self.config.output_dir, name);

        image.save(&output_path)?;

        if Path::new(&baseline_path).exists() {
            let baseline = image::open(&baseline_path)?.to_rgba8();

            let diff = compare_images(&baseline, image)?;
            if diff > self.config.threshold {
                let diff_path = format!("{}/{}_diff.png", self.config.output_dir, name);
                create_diff_image(&baseline, image).save(&diff_path)?;

                return Err(TestError::ImageComparison(format!(
                    "Image difference {:.4} exceeds threshold {:.4} (see {})",
                    diff, self.config.threshold, diff_path
                )));
            }
        } else {
            image.save(&baseline_path)?;
            tracing::info!("Created new baseline: {}", baseline_path);
        }

        Ok(())
    }
}

/// Compare two images and return the normalized RGB difference (0.0-1.0).
pub fn compare_images(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    if max_diff == 0 {
        return Ok(0.0);
    }
    Ok(total_diff as f64 / max_diff as f64)
}

/// Mark pixels that differ by more than 10 in any channel red; dim the rest.
pub fn create_diff_image(a: &RgbaImage, b: &RgbaImage) -> RgbaImage {
    let (width, height) = a.dimensions();
    RgbaImage::from_fn(width, height, |x, y| {
        let pa = a.get_pixel(x, y);
        let Some(pb) = b.get_pixel_checked(x, y) else {
            return Rgba([255, 0, 0, 255]);
        };
        let max_diff = (0..3).map(|c| pa[c].abs_diff(pb[c])).max().unwrap_or(0);
        if max_diff > 10 {
            Rgba([255, 0, 0, 255])
        } else {
            Rgba([pa[0] / 2, pa[1] / 2, pa[2] / 2, 255])
        }
    })
}

/// Orthographic camera at `+Z` looking down `-Z` at the origin, covering
/// `size` x `size` world units.
pub fn create_test_camera(size: f32) -> Camera {
    Camera::orthographic(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba(rgba))
    }

    #[test]
    fn identical_images_have_no_difference() {
        let a = solid(4, 4, [10, 20, 30, 255]);
        assert_eq!(compare_images(&a, &a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_completely() {
        let black = solid(2, 2, [0, 0, 0, 255]);
        let white = solid(2, 2, [255, 255, 255, 0]);
        assert!((compare_images(&black, &white).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_sizes_are_an_error() {
        let a = solid(2, 2, [0; 4]);
        let b = solid(3, 2, [0; 4]);
        assert!(matches!(
            compare_images(&a, &b),
            Err(TestError::ImageComparison(_))
        ));
    }

    #[test]
    fn diff_image_marks_changed_pixels() {
        let a = solid(2, 1, [100, 100, 100, 255]);
        let mut b = a.clone();
        b.put_pixel(1, 0, Rgba([100, 180, 100, 255]));

        let diff = create_diff_image(&a, &b);
        assert_eq!(diff.get_pixel(0, 0), &Rgba([50, 50, 50, 255]));
        assert_eq!(diff.get_pixel(1, 0), &Rgba([255, 0, 0, 255]));
    }

    #[test]
    fn test_config_points_at_shaders() {
        let config = test_config();
        assert!(config.validate().is_ok());
        assert!(config.vertex_shader_path("pbr").ends_with("pbr.vert.spv"));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_renderer_creation() {
        let renderer = HeadlessRenderer::new(64, 64).unwrap();
        assert_eq!(renderer.dimensions(), (64, 64));
        assert!(!renderer.renderer().system_names().is_empty());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn render_empty_world_is_clear_color() {
        let mut renderer = HeadlessRenderer::new(16, 16).unwrap();
        let image = renderer
            .render(&World::new(), &create_test_camera(2.0))
            .unwrap();
        assert_eq!(image.dimensions(), (16, 16));
        assert_eq!(image.get_pixel(8, 8), &Rgba([0, 0, 0, 255]));
    }
}
