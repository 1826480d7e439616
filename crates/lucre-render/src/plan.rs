//! Frame planning: which systems run in which stage, and what a resize or an
//! out-of-date swapchain forces the renderer to rebuild.

use bitflags::bitflags;
use lucre_gpu::{AcquireStatus, PresentStatus};

use crate::pipelines::Stage;

/// System indices grouped by stage, in recording order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePlan {
    stages: Vec<(Stage, Vec<usize>)>,
}

impl FramePlan {
    /// Group systems (given by their stages, in registration order).
    ///
    /// Within a stage, systems keep registration order.
    pub fn new(stages: impl IntoIterator<Item = Stage>) -> Self {
        let stages: Vec<Stage> = stages.into_iter().collect();
        let plan = Stage::ORDER
            .iter()
            .map(|&stage| {
                let members = stages
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| **s == stage)
                    .map(|(i, _)| i)
                    .collect();
                (stage, members)
            })
            .collect();
        Self { stages: plan }
    }

    /// Systems recorded in `stage`.
    pub fn systems(&self, stage: Stage) -> &[usize] {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map_or(&[], |(_, members)| members.as_slice())
    }

    /// Every `(stage, systems)` pair in recording order, empty stages included.
    pub fn iter(&self) -> impl Iterator<Item = (Stage, &[usize])> {
        self.stages.iter().map(|(s, m)| (*s, m.as_slice()))
    }

    /// Stages to record for `decision`: every stage, or none for a skipped frame.
    pub fn recorded(&self, decision: FrameDecision) -> impl Iterator<Item = (Stage, &[usize])> {
        let count = if decision.image_index().is_some() {
            self.stages.len()
        } else {
            0
        };
        self.iter().take(count)
    }

    /// Total number of planned systems.
    pub fn len(&self) -> usize {
        self.stages.iter().map(|(_, m)| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

bitflags! {
    /// What must be recreated before the next frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RebuildFlags: u8 {
        const SWAPCHAIN = 1 << 0;
        /// Scene targets and every framebuffer.
        const FRAMEBUFFERS = 1 << 1;
        /// Render passes and the pipelines baked against them.
        const RENDER_PASSES = 1 << 2;
    }
}

impl RebuildFlags {
    /// Work after the swapchain was recreated. Render passes only follow a format change.
    pub fn after_swapchain_rebuild(format_changed: bool) -> Self {
        let mut flags = Self::SWAPCHAIN | Self::FRAMEBUFFERS;
        if format_changed {
            flags |= Self::RENDER_PASSES;
        }
        flags
    }

    /// Everything that follows from `self` once the new output's format is known.
    pub fn expand(self, format_changed: bool) -> Self {
        if self.contains(Self::SWAPCHAIN) {
            self | Self::after_swapchain_rebuild(format_changed)
        } else {
            self
        }
    }

    pub fn rebuilds_passes(self) -> bool {
        self.contains(Self::RENDER_PASSES)
    }

    /// Scene targets and framebuffers follow a new output or new passes.
    pub fn rebuilds_targets(self) -> bool {
        self.intersects(Self::FRAMEBUFFERS | Self::RENDER_PASSES)
    }

    /// Work left by a frame that failed between acquire and submit. An acquired
    /// image that is never presented only comes back with a new swapchain.
    pub fn after_abandoned(decision: FrameDecision) -> Self {
        match decision {
            FrameDecision::Record { .. } => Self::SWAPCHAIN,
            FrameDecision::Skip { .. } => Self::empty(),
        }
    }

    /// Whether presenting left the swapchain needing a rebuild.
    pub fn from_present(status: PresentStatus) -> Self {
        if status.needs_rebuild() {
            Self::SWAPCHAIN
        } else {
            Self::empty()
        }
    }
}

/// What to do with the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Record into the acquired image; `rebuild` is set when the swapchain is suboptimal.
    Record { image_index: u32, rebuild: bool },
    /// Nothing to draw into; rebuild (if asked) and try again next frame.
    Skip { rebuild: bool },
}

impl FrameDecision {
    /// Decide from an acquire result.
    pub fn from_acquire(status: AcquireStatus) -> Self {
        match status {
            AcquireStatus::Acquired {
                image_index,
                suboptimal,
            } => Self::Record {
                image_index,
                rebuild: suboptimal,
            },
            AcquireStatus::OutOfDate => Self::Skip { rebuild: true },
        }
    }

    pub fn needs_rebuild(self) -> bool {
        match self {
            Self::Record { rebuild, .. } | Self::Skip { rebuild } => rebuild,
        }
    }

    /// The image to record into; `None` when the frame is skipped.
    pub fn image_index(self) -> Option<u32> {
        match self {
            Self::Record { image_index, .. } => Some(image_index),
            Self::Skip { .. } => None,
        }
    }

    pub fn rebuild_flags(self) -> RebuildFlags {
        if self.needs_rebuild() {
            RebuildFlags::SWAPCHAIN
        } else {
            RebuildFlags::empty()
        }
    }
}

/// A zero-sized window (minimized) has no surface to render into.
pub fn is_renderable(width: u32, height: u32) -> bool {
    width > 0 && height > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::PipelineId;

    #[test]
    fn systems_group_by_stage_keeping_registration_order() {
        let plan = FramePlan::new([
            Stage::Gui,
            Stage::Geometry,
            Stage::Shadow,
            Stage::Geometry,
            Stage::Lighting,
        ]);
        assert_eq!(plan.systems(Stage::Shadow), &[2]);
        assert_eq!(plan.systems(Stage::Geometry), &[1, 3]);
        assert_eq!(plan.systems(Stage::Gui), &[0]);
        assert!(plan.systems(Stage::Bloom).is_empty());
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn plan_iterates_in_frame_order() {
        let plan = FramePlan::new([Stage::PostProcess, Stage::Transparency]);
        let order: Vec<Stage> = plan.iter().map(|(s, _)| s).collect();
        assert_eq!(order, Stage::ORDER.to_vec());
    }

    #[test]
    fn render_passes_rebuild_only_on_format_change() {
        let same = RebuildFlags::after_swapchain_rebuild(false);
        assert!(same.contains(RebuildFlags::FRAMEBUFFERS));
        assert!(!same.contains(RebuildFlags::RENDER_PASSES));
        assert!(RebuildFlags::after_swapchain_rebuild(true).contains(RebuildFlags::RENDER_PASSES));
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let decision = FrameDecision::from_acquire(AcquireStatus::OutOfDate);
        assert_eq!(decision, FrameDecision::Skip { rebuild: true });
    }

    #[test]
    fn suboptimal_acquire_still_records() {
        let decision = FrameDecision::from_acquire(AcquireStatus::Acquired {
            image_index: 2,
            suboptimal: true,
        });
        assert_eq!(
            decision,
            FrameDecision::Record {
                image_index: 2,
                rebuild: true
            }
        );
        assert!(decision.needs_rebuild());
    }

    #[test]
    fn present_status_maps_to_rebuild() {
        assert!(RebuildFlags::from_present(PresentStatus::Presented).is_empty());
        assert_eq!(
            RebuildFlags::from_present(PresentStatus::OutOfDate),
            RebuildFlags::SWAPCHAIN
        );
    }

    #[test]
    fn out_of_date_frame_records_nothing_and_requests_a_swapchain() {
        let plan = FramePlan::new(Stage::ORDER);
        let decision = FrameDecision::from_acquire(AcquireStatus::OutOfDate);

        assert_eq!(decision.image_index(), None);
        assert_eq!(decision.rebuild_flags(), RebuildFlags::SWAPCHAIN);
        assert_eq!(plan.recorded(decision).count(), 0);
    }

    #[test]
    fn acquired_frame_records_every_stage_in_order() {
        let plan = FramePlan::new(Stage::ORDER);
        let decision = FrameDecision::from_acquire(AcquireStatus::Acquired {
            image_index: 1,
            suboptimal: false,
        });

        assert_eq!(decision.image_index(), Some(1));
        assert!(decision.rebuild_flags().is_empty());
        let stages: Vec<Stage> = plan.recorded(decision).map(|(s, _)| s).collect();
        assert_eq!(stages, Stage::ORDER.to_vec());
    }

    #[test]
    fn frame_composes_shadow_then_scene_then_post_then_gui() {
        // Declaration order of the standard system set
        let declared = [
            PipelineId::Shadow,
            PipelineId::Pbr,
            PipelineId::PbrInstanced,
            PipelineId::PbrBindless,
            PipelineId::Grass,
            PipelineId::DeferredLighting,
            PipelineId::PointLight,
            PipelineId::Cubemap,
            PipelineId::Water,
            PipelineId::Sprite,
            PipelineId::Debug,
            PipelineId::BloomDown,
            PipelineId::PostProcessingBloom,
            PipelineId::Sprite2D,
            PipelineId::Gui,
        ];
        let plan = FramePlan::new(declared.iter().map(|id| id.stage()));

        let recorded: Vec<(Stage, usize)> = plan
            .iter()
            .flat_map(|(stage, members)| members.iter().map(move |&i| (stage, i)))
            .collect();
        assert_eq!(recorded.len(), declared.len());
        assert_eq!(recorded.first(), Some(&(Stage::Shadow, 0)));
        assert_eq!(recorded.last(), Some(&(Stage::Gui, declared.len() - 1)));
        // Stages never go backwards and systems keep declaration order
        assert!(recorded.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].1 < w[1].1));
    }

    #[test]
    fn extent_only_change_rebuilds_framebuffers_but_not_passes() {
        let flags = RebuildFlags::SWAPCHAIN.expand(false);
        assert!(flags.rebuilds_targets());
        assert!(!flags.rebuilds_passes());
    }

    #[test]
    fn format_change_rebuilds_passes_and_targets() {
        let flags = RebuildFlags::SWAPCHAIN.expand(true);
        assert!(flags.rebuilds_passes());
        assert!(flags.rebuilds_targets());
    }

    #[test]
    fn nothing_requested_expands_to_nothing() {
        let flags = RebuildFlags::empty().expand(true);
        assert!(flags.is_empty());
        assert!(!flags.rebuilds_targets());
    }

    #[test]
    fn abandoned_frame_recreates_the_swapchain() {
        let acquired = FrameDecision::Record {
            image_index: 0,
            rebuild: false,
        };
        assert_eq!(RebuildFlags::after_abandoned(acquired), RebuildFlags::SWAPCHAIN);
        assert!(RebuildFlags::after_abandoned(FrameDecision::Skip { rebuild: true }).is_empty());
    }

    #[test]
    fn minimized_window_is_not_renderable() {
        assert!(!is_renderable(0, 600));
        assert!(!is_renderable(800, 0));
        assert!(is_renderable(1, 1));
    }
}
