use crate::data_structures::bbox::Bbox;
use crate::data_structures::morton::{Morton, MortonCode};
use crate::data_structures::vector::*;

/// Dimensional info of an octree at one level: maps world positions to
/// Morton codes and Morton codes back to node bounding boxes. Two instances
/// at different levels over the same spatial frame are routinely used side
/// by side during construction.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OctreeDimensions {
    origin: Vec3f32,
    size: Vec3f32,
    node_size: Vec3f32,
    level: u8,
}

impl OctreeDimensions {
    pub fn new(origin: Vec3f32, size: Vec3f32, level: u8) -> Self {
        debug_assert!(level <= Morton::MAX_LEVEL);
        let cells = (1u64 << level) as f32;
        Self {
            origin,
            size,
            node_size: size / cells,
            level,
        }
    }

    /// Same spatial frame, different level.
    pub fn at_level(&self, level: u8) -> Self {
        Self::new(self.origin, self.size, level)
    }

    pub fn level_above(&self) -> Self {
        self.at_level(self.level - 1)
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn origin(&self) -> Vec3f32 {
        self.origin
    }

    pub fn size(&self) -> Vec3f32 {
        self.size
    }

    pub fn calc_morton(&self, pos: Vec3f32) -> Morton {
        let rel = pos - self.origin;
        let cells = (1u64 << self.level) as f32 - 1.0;
        let x = (rel.0 / self.node_size.0).clamp(0.0, cells) as u32;
        let y = (rel.1 / self.node_size.1).clamp(0.0, cells) as u32;
        let z = (rel.2 / self.node_size.2).clamp(0.0, cells) as u32;
        Morton::build(x, y, z, self.level)
    }

    /// Boundaries of the node identified by the given code. The code level
    /// must match this dimension's level.
    pub fn morton_box(&self, code: &Morton) -> Bbox {
        debug_assert_eq!(code.level(), self.level);
        let (x, y, z) = code.decode();
        let min = self.origin
            + vec3f(
                x as f32 * self.node_size.0,
                y as f32 * self.node_size.1,
                z as f32 * self.node_size.2,
            );
        Bbox::from_min_max(min, min + self.node_size)
    }
}

/// Streaming bounding-box scan over a point set, producing normalized octree
/// dimensions. Normalization maps into [(0,0,0), (1,1,1)] preserving aspect
/// ratio, so only the largest extent reaches 1.
#[derive(Debug)]
pub struct DimCalculator {
    origin: Vec3f32,
    max_coords: Vec3f32,
}

impl DimCalculator {
    pub fn new() -> Self {
        let huge = f32::MAX;
        Self {
            origin: vec3f(huge, huge, huge),
            max_coords: vec3f(-huge, -huge, -huge),
        }
    }

    pub fn insert(&mut self, pos: Vec3f32) {
        self.origin = self.origin.min_elements(pos);
        self.max_coords = self.max_coords.max_elements(pos);
    }

    pub fn dimensions(&self, max_level: u8) -> DimOriginScale {
        if self.origin.0 > self.max_coords.0 {
            // No points inserted; hand out a unit frame.
            let dim =
                OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), max_level);
            return DimOriginScale::new(dim, vec3f(0.0, 0.0, 0.0), 1.0);
        }
        let size = self.max_coords - self.origin;
        let extent = size.max_element();
        // Degenerate clouds (a single point, or all points coinciding) still
        // need a usable frame.
        let scale = if extent > 0.0 { 1.0 / extent } else { 1.0 };
        let normalized = if extent > 0.0 {
            size * scale
        } else {
            vec3f(1.0, 1.0, 1.0)
        };
        let dim = OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), normalized, max_level);
        DimOriginScale::new(dim, self.origin, scale)
    }
}

impl Default for DimCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized dimensions together with the origin and scale that produced
/// them.
#[derive(Copy, Clone, Debug)]
pub struct DimOriginScale {
    dim: OctreeDimensions,
    origin: Vec3f32,
    scale: f32,
}

impl DimOriginScale {
    pub fn new(dim: OctreeDimensions, origin: Vec3f32, scale: f32) -> Self {
        Self { dim, origin, scale }
    }

    pub fn scale_point(&self, pos: Vec3f32) -> Vec3f32 {
        (pos - self.origin) * self.scale
    }

    pub fn dimensions(&self) -> OctreeDimensions {
        self.dim
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn morton_box_contains_position() {
        let dim = OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 5);
        let pos = vec3f(0.37, 0.11, 0.93);
        let code = dim.calc_morton(pos);
        let bbox = dim.morton_box(&code);
        assert!(bbox.contains(pos));
    }

    #[test]
    fn parent_box_contains_child_box() {
        let dim = OctreeDimensions::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 6);
        let pos = vec3f(0.62, 0.58, 0.27);
        let code = dim.calc_morton(pos);
        let parent_box = dim.level_above().morton_box(&code.traverse_up());
        let child_box = dim.morton_box(&code);
        assert!(parent_box.contains(child_box.min));
        assert!(parent_box.contains(child_box.max));
    }

    #[test]
    fn normalization_preserves_aspect() {
        let mut calc = DimCalculator::new();
        calc.insert(vec3f(1.0, 2.0, 3.0));
        calc.insert(vec3f(2.0, 2.5, 3.25));
        let dos = calc.dimensions(4);
        // Largest extent is x = 1.0, so scale is 1.
        assert!((dos.scale() - 1.0).abs() < 1e-6);
        let size = dos.dimensions().size();
        assert!((size.0 - 1.0).abs() < 1e-6);
        assert!((size.1 - 0.5).abs() < 1e-6);
        assert!((size.2 - 0.25).abs() < 1e-6);
        assert_eq!(dos.scale_point(vec3f(1.0, 2.0, 3.0)), vec3f(0.0, 0.0, 0.0));
    }

    #[test]
    fn eleven_point_scan_scale() {
        // Eleven points spanning 0.30 on every axis normalize with
        // scale 1/0.3.
        let mut calc = DimCalculator::new();
        for i in 0..11 {
            let base = 0.01 + 0.03 * i as f32;
            calc.insert(vec3f(base, base + 0.01, base + 0.02));
        }
        let dos = calc.dimensions(10);
        assert!((dos.scale() - 1.0 / 0.3).abs() < 1e-4);
    }
}
