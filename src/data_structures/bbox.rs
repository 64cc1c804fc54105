///
/// Axis aligned bounding box
/// Adapted from Javascript/C++ code provided by Jeppe Revall Frisvad,
/// originally based on code by Nvidia, MIT License (2008-2010)

use super::vector::*;

///
/// ### Bounding Box
/// Axis aligned bounding box type
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Bbox {
    pub min: Vec3f32,
    pub max: Vec3f32,
}

impl Bbox {
    ///
    /// Create a new bounding box including nothing
    pub fn new() -> Bbox {
        Self {
            min: vec3f(1.0e+37, 1.0e+37, 1.0e+37),
            max: vec3f(-1.0e+37, -1.0e+37, -1.0e+37),
        }
    }

    pub fn from_min_max(min: Vec3f32, max: Vec3f32) -> Bbox {
        Self { min, max }
    }

    /// Extend the bounding box to include the given vertex
    pub fn include_vertex(&mut self, v: Vec3f32) {
        self.min = self.min.min_elements(v);
        self.max = self.max.max_elements(v);
    }

    /// Extend the bounding box to include the given bounding box
    pub fn include_bbox(&mut self, other: &Bbox) {
        self.min = self.min.min_elements(other.min);
        self.max = self.max.max_elements(other.max);
    }

    /// Get the center of the bounding box
    pub fn center(&self) -> Vec3f32 {
        (self.min + self.max) * 0.5
    }

    /// Get the extents of the bounding box
    /// also called the diagonal
    pub fn extent(&self) -> Vec3f32 {
        self.max - self.min
    }

    pub fn contains(&self, p: Vec3f32) -> bool {
        self.min.0 <= p.0
            && self.min.1 <= p.1
            && self.min.2 <= p.2
            && p.0 <= self.max.0
            && p.1 <= self.max.1
            && p.2 <= self.max.2
    }

    /// The eight corner vertices, used for frustum half-space tests.
    pub fn corners(&self) -> [Vec3f32; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            vec3f(lo.0, lo.1, lo.2),
            vec3f(hi.0, lo.1, lo.2),
            vec3f(lo.0, hi.1, lo.2),
            vec3f(hi.0, hi.1, lo.2),
            vec3f(lo.0, lo.1, hi.2),
            vec3f(hi.0, lo.1, hi.2),
            vec3f(lo.0, hi.1, hi.2),
            vec3f(hi.0, hi.1, hi.2),
        ]
    }
}

impl Default for Bbox {
    fn default() -> Self {
        Self::new()
    }
}
