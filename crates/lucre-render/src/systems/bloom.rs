//! Bloom over the emission mip chain, then the composite into the output.

use ash::vk;
use lucre_gpu::{DescriptorWriter, GraphicsPipeline, SamplerKind};

use super::{
    bind_pipeline, bind_sets, draw_fullscreen, push, FrameContext, RenderSystem, SceneView,
    SystemContext,
};
use crate::error::Result;
use crate::pipelines::{PipelineId, ScalarPushConstants, Stage};
use crate::render_pass::begin_render_pass;

/// One bloom render pass: sample `source`, write `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomStep {
    pub source: u32,
    pub target: u32,
    pub upsample: bool,
}

/// Down-sample into mips `1..levels`, then up-sample back into `levels-2..=0`.
pub fn bloom_steps(levels: u32) -> Vec<BloomStep> {
    if levels < 2 {
        return Vec::new();
    }
    let down = (1..levels).map(|target| BloomStep {
        source: target - 1,
        target,
        upsample: false,
    });
    let up = (0..levels - 1).rev().map(|target| BloomStep {
        source: target + 1,
        target,
        upsample: true,
    });
    down.chain(up).collect()
}

/// Walks the emission chain with one render pass per mip.
pub struct BloomSystem {
    down: GraphicsPipeline,
    up: GraphicsPipeline,
}

impl BloomSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            down: ctx.bake(PipelineId::BloomDown)?,
            up: ctx.bake(PipelineId::BloomUp)?,
        })
    }
}

impl RenderSystem for BloomSystem {
    fn name(&self) -> &'static str {
        "bloom"
    }

    fn stage(&self) -> Stage {
        Stage::Bloom
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, _scene: &mut SceneView<'_>) -> Result<()> {
        let device = frame.device();
        let chain = &frame.targets.scene.emission;
        let sampler = frame.samplers.get(SamplerKind::LinearClamp);

        for step in bloom_steps(chain.levels()) {
            let (pass, pipeline) = if step.upsample {
                (frame.passes.bloom_up, &self.up)
            } else {
                (frame.passes.bloom_down, &self.down)
            };
            let source = chain.mips[step.source as usize].view;
            let source_extent = chain.extents[step.source as usize];
            let target_extent = chain.extents[step.target as usize];

            let set = frame.allocate_set(frame.layouts.single_texture)?;
            DescriptorWriter::new()
                .sampled_image(set, 0, source, sampler, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .flush(frame.gpu);

            let clear = [vk::ClearValue {
                color: vk::ClearColorValue { float32: [0.0; 4] },
            }];
            begin_render_pass(
                device,
                frame.cmd,
                pass,
                chain.framebuffers[step.target as usize],
                target_extent,
                &clear,
            );
            bind_pipeline(device, frame.cmd, pipeline, target_extent);
            bind_sets(device, frame.cmd, pipeline, 0, &[set]);
            let constants = ScalarPushConstants {
                values: [
                    1.0 / source_extent.width as f32,
                    1.0 / source_extent.height as f32,
                    step.target as f32,
                    0.0,
                ],
            };
            push(device, frame.cmd, pipeline, vk::ShaderStageFlags::FRAGMENT, &constants);
            draw_fullscreen(device, frame.cmd);
            device.cmd_end_render_pass(frame.cmd);
        }
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.down.destroy(device);
        self.up.destroy(device);
    }
}

/// Tone-maps scene color plus bloomed emission into the output image.
pub struct CompositeSystem {
    pipeline: GraphicsPipeline,
}

impl CompositeSystem {
    /// # Safety
    /// See [`SystemContext::bake`].
    pub unsafe fn new(ctx: &mut SystemContext<'_>) -> Result<Self> {
        Ok(Self {
            pipeline: ctx.bake(PipelineId::PostProcessingBloom)?,
        })
    }
}

impl RenderSystem for CompositeSystem {
    fn name(&self) -> &'static str {
        "post_processing_bloom"
    }

    fn stage(&self) -> Stage {
        Stage::PostProcess
    }

    unsafe fn record(&mut self, frame: &FrameContext<'_>, scene: &mut SceneView<'_>) -> Result<()> {
        let device = frame.device();
        let targets = &frame.targets.scene;
        let read_only = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;

        let set = frame.allocate_set(frame.layouts.post)?;
        DescriptorWriter::new()
            .input_attachment(set, 0, targets.color.view.view, read_only)
            .input_attachment(set, 1, targets.emission.mips[0].view, read_only)
            .flush(frame.gpu);

        bind_pipeline(device, frame.cmd, &self.pipeline, frame.extent);
        bind_sets(device, frame.cmd, &self.pipeline, 0, &[set]);
        let constants = ScalarPushConstants {
            values: [scene.resources.bloom_strength, scene.resources.exposure, 0.0, 0.0],
        };
        push(
            device,
            frame.cmd,
            &self.pipeline,
            vk::ShaderStageFlags::FRAGMENT,
            &constants,
        );
        draw_fullscreen(device, frame.cmd);
        Ok(())
    }

    unsafe fn destroy(&mut self, device: &ash::Device) {
        self.pipeline.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_mip_has_no_bloom_steps() {
        assert!(bloom_steps(1).is_empty());
        assert!(bloom_steps(0).is_empty());
    }

    #[test]
    fn chain_goes_down_then_back_up_to_mip_zero() {
        let steps = bloom_steps(4);
        let targets: Vec<_> = steps.iter().map(|s| (s.target, s.upsample)).collect();
        assert_eq!(
            targets,
            vec![
                (1, false),
                (2, false),
                (3, false),
                (2, true),
                (1, true),
                (0, true),
            ]
        );
    }

    #[test]
    fn each_step_samples_its_neighbor() {
        for step in bloom_steps(6) {
            if step.upsample {
                assert_eq!(step.source, step.target + 1);
            } else {
                assert_eq!(step.source + 1, step.target);
            }
        }
    }
}
