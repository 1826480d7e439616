//! Per-frame information.

/// Timing of the frame about to be rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Frames rendered before this one.
    pub frame_number: u64,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
}

impl FrameInfo {
    /// Width over height; 1 for a degenerate size.
    pub fn aspect_ratio(&self) -> f32 {
        if self.width == 0 || self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_frame_has_unit_aspect() {
        let frame = FrameInfo {
            dt: 0.016,
            frame_number: 0,
            width: 0,
            height: 720,
        };
        assert_eq!(frame.aspect_ratio(), 1.0);
    }

    #[test]
    fn aspect_is_width_over_height() {
        let frame = FrameInfo {
            dt: 0.016,
            frame_number: 3,
            width: 1280,
            height: 640,
        };
        assert_eq!(frame.aspect_ratio(), 2.0);
    }
}
