use std::fmt;

/// Measurements of one tracked and rendered frame.
#[derive(Copy, Clone, Debug, Default)]
pub struct FrameStats {
    pub traversal_ms: f64,
    pub render_ms: f64,
    pub rendered_points: u64,
    pub front_size: usize,
    pub segment_size: usize,
}

/// Mini struct to accumulate per-frame statistics easily
pub struct OctreeStats {
    pub frames: u32,
    pub avg_traversal_ms: f64,
    pub avg_render_ms: f64,
    pub max_traversal_ms: f64,
    pub rendered_points: u64,
    pub front_size: usize,
    total_traversal_ms: f64,
    total_render_ms: f64,
}

impl OctreeStats {
    pub fn new() -> Self {
        Self {
            frames: 0,
            avg_traversal_ms: 0.0,
            avg_render_ms: 0.0,
            max_traversal_ms: 0.0,
            rendered_points: 0,
            front_size: 0,
            total_traversal_ms: 0.0,
            total_render_ms: 0.0,
        }
    }

    pub fn add_frame(&mut self, frame: &FrameStats) {
        self.frames += 1;
        self.total_traversal_ms += frame.traversal_ms;
        self.total_render_ms += frame.render_ms;
        if frame.traversal_ms > self.max_traversal_ms {
            self.max_traversal_ms = frame.traversal_ms;
        }
        self.avg_traversal_ms = self.total_traversal_ms / self.frames as f64;
        self.avg_render_ms = self.total_render_ms / self.frames as f64;
        self.rendered_points = frame.rendered_points;
        self.front_size = frame.front_size;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for OctreeStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OctreeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Frames: {}, front: {}, points: {}, traversal avg: {:.3} ms (max {:.3}), render avg: {:.3} ms",
            self.frames,
            self.front_size,
            self.rendered_points,
            self.avg_traversal_ms,
            self.max_traversal_ms,
            self.avg_render_ms
        ))?;
        Ok(())
    }
}
