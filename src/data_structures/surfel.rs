use std::io::{Read, Write};

use super::vector::*;
use crate::error::Result;

/// Base tangent length assigned to leaf-level splats, in the normalized
/// model space of the unit cube.
pub const LEAF_TANGENT_SCALE: f32 = 0.000035;

/// Linear splat growth applied per level walking up from the leaves. A
/// parent keeps roughly one fifth of each child's samples spread over eight
/// times the volume, so its disks have to cover more area.
pub const SPLAT_GROWTH_PER_LEVEL: f32 = 1.6;

/// Oriented elliptical splat: center plus two tangent half-axes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Zeroable, bytemuck::Pod)]
pub struct Surfel {
    pub center: Vec3f32,
    pub u: Vec3f32,
    pub v: Vec3f32,
}

static_assertions::assert_eq_size!(Surfel, [f32; 9]);

pub const SURFEL_SIZE: usize = std::mem::size_of::<Surfel>();

impl Surfel {
    pub fn new(center: Vec3f32, u: Vec3f32, v: Vec3f32) -> Self {
        Self { center, u, v }
    }

    /// Builds the tangent frame of an oriented point. The first tangent runs
    /// from the position towards an axis intercept of the surfel plane, the
    /// second completes the frame. Returns `None` for degenerate normals.
    pub fn from_point(pos: Vec3f32, normal: Vec3f32) -> Option<Self> {
        let epsilon = 1e-10;

        if !pos.is_finite() || !normal.is_finite() {
            return None;
        }

        let plane_minus_d = dot(normal, pos);

        let point_on_plane = if normal.0.abs() > epsilon {
            vec3f(plane_minus_d / normal.0, 0.0, 0.0)
        } else if normal.1.abs() > epsilon {
            vec3f(0.0, plane_minus_d / normal.1, 0.0)
        } else if normal.2.abs() > epsilon {
            vec3f(0.0, 0.0, plane_minus_d / normal.2)
        } else {
            return None;
        };

        let mut u = point_on_plane - pos;
        if u.magnitude() < epsilon {
            // The position sits exactly on the axis intercept; any direction
            // in the plane works.
            u = normal.cross(vec3f(1.0, 0.0, 0.0));
            if u.magnitude() < epsilon {
                u = normal.cross(vec3f(0.0, 1.0, 0.0));
            }
        }
        u = u.normalize();
        let v = normal.normalize().cross(u);

        Some(Self {
            center: pos,
            u: u * LEAF_TANGENT_SCALE,
            v: v * LEAF_TANGENT_SCALE,
        })
    }

    pub fn multiply_tangents(&mut self, multiplier: f32) {
        self.u = self.u * multiplier;
        self.v = self.v * multiplier;
    }

    /// Binary persistence. Structure: | center | u | v |, nine LE floats.
    pub fn persist<W: Write>(&self, out: &mut W) -> Result<()> {
        out.write_all(bytemuck::bytes_of(self))?;
        Ok(())
    }

    pub fn restore<R: Read>(input: &mut R) -> Result<Self> {
        let mut buf = [0u8; SURFEL_SIZE];
        input.read_exact(&mut buf)?;
        Ok(bytemuck::pod_read_unaligned(&buf))
    }
}

/// Tangent multiplier for a node at `level` in a hierarchy with leaves at
/// `leaf_level`. Leaves render their surfels untouched.
pub fn tangent_multiplier(level: u8, leaf_level: u8) -> f32 {
    let delta = leaf_level.saturating_sub(level) as i32;
    SPLAT_GROWTH_PER_LEVEL.powi(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tangents_orthogonal_to_normal() {
        let normal = vec3f(0.0, 0.0, 1.0);
        let surfel = Surfel::from_point(vec3f(0.2, 0.3, 0.4), normal).unwrap();
        assert!(dot(surfel.u, normal).abs() < 1e-6);
        assert!(dot(surfel.v, normal).abs() < 1e-6);
        assert!(dot(surfel.u, surfel.v).abs() < 1e-9);
    }

    #[test]
    fn zero_normal_rejected() {
        assert!(Surfel::from_point(vec3f(0.1, 0.1, 0.1), vec3f(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn persistence_round_trip() {
        let surfel = Surfel::new(
            vec3f(1.0, 2.0, 3.0),
            vec3f(0.1, 0.0, 0.0),
            vec3f(0.0, 0.1, 0.0),
        );
        let mut buf = Vec::new();
        surfel.persist(&mut buf).unwrap();
        assert_eq!(buf.len(), SURFEL_SIZE);
        let restored = Surfel::restore(&mut buf.as_slice()).unwrap();
        assert_eq!(surfel, restored);
    }

    #[test]
    fn multiplier_grows_towards_root() {
        assert_eq!(tangent_multiplier(10, 10), 1.0);
        assert!(tangent_multiplier(9, 10) > 1.0);
        assert!(tangent_multiplier(0, 10) > tangent_multiplier(5, 10));
    }
}
