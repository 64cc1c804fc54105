use std::ops::{Add, Div, Index, IndexMut, Mul, Neg, Sub};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Default, bytemuck::Zeroable)]
pub struct Vec3<T>(pub T, pub T, pub T);

unsafe impl<T> bytemuck::Pod for Vec3<T> where T: bytemuck::Pod {}

pub type Vec3f32 = Vec3<f32>;

#[inline(always)]
pub const fn vec3f(f0: f32, f1: f32, f2: f32) -> Vec3<f32> {
    Vec3::<f32>(f0, f1, f2)
}

pub fn dot<T>(v1: Vec3<T>, v2: Vec3<T>) -> T
where
    T: Mul<Output = T> + Add<Output = T>,
{
    v1.0 * v2.0 + v1.1 * v2.1 + v1.2 * v2.2
}

impl Vec3<f32> {
    pub fn magnitude(self) -> f32 {
        dot(self, self).sqrt()
    }

    pub fn normalize(self) -> Self {
        let magnitude = self.magnitude();
        Self(self.0 / magnitude, self.1 / magnitude, self.2 / magnitude)
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self(
            self.1 * rhs.2 - self.2 * rhs.1,
            self.2 * rhs.0 - self.0 * rhs.2,
            self.0 * rhs.1 - self.1 * rhs.0,
        )
    }

    pub fn min_elements(self, rhs: Self) -> Self {
        Self(
            f32::min(self.0, rhs.0),
            f32::min(self.1, rhs.1),
            f32::min(self.2, rhs.2),
        )
    }

    pub fn max_elements(self, rhs: Self) -> Self {
        Self(
            f32::max(self.0, rhs.0),
            f32::max(self.1, rhs.1),
            f32::max(self.2, rhs.2),
        )
    }

    pub fn max_element(self) -> f32 {
        f32::max(self.0, f32::max(self.1, self.2))
    }

    pub fn is_finite(self) -> bool {
        self.0.is_finite() && self.1.is_finite() && self.2.is_finite()
    }
}

impl<T> Add<Vec3<T>> for Vec3<T>
where
    T: Add<Output = T>,
{
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0, self.1 + rhs.1, self.2 + rhs.2)
    }
}

impl<T> Sub<Vec3<T>> for Vec3<T>
where
    T: Sub<Output = T>,
{
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0, self.1 - rhs.1, self.2 - rhs.2)
    }
}

impl<T> Mul<T> for Vec3<T>
where
    T: Mul<Output = T> + Copy,
{
    type Output = Self;

    fn mul(self, rhs: T) -> Self::Output {
        Self(self.0 * rhs, self.1 * rhs, self.2 * rhs)
    }
}

impl<T> Div<T> for Vec3<T>
where
    T: Div<Output = T> + Copy,
{
    type Output = Self;

    fn div(self, rhs: T) -> Self::Output {
        Self(self.0 / rhs, self.1 / rhs, self.2 / rhs)
    }
}

impl<T> Neg for Vec3<T>
where
    T: Neg<Output = T>,
{
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(-self.0, -self.1, -self.2)
    }
}

impl<T> Index<u32> for Vec3<T> {
    type Output = T;

    fn index(&self, index: u32) -> &Self::Output {
        match index {
            0 => &self.0,
            1 => &self.1,
            2 => &self.2,
            _ => panic!("vector index {index} out of bounds"),
        }
    }
}

impl<T> IndexMut<u32> for Vec3<T> {
    fn index_mut(&mut self, index: u32) -> &mut Self::Output {
        match index {
            0 => &mut self.0,
            1 => &mut self.1,
            2 => &mut self.2,
            _ => panic!("vector index {index} out of bounds"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_of_axes() {
        let x = vec3f(1.0, 0.0, 0.0);
        let y = vec3f(0.0, 1.0, 0.0);
        assert_eq!(x.cross(y), vec3f(0.0, 0.0, 1.0));
    }

    #[test]
    fn normalize_unit_length() {
        let v = vec3f(3.0, 4.0, 0.0).normalize();
        assert!((v.magnitude() - 1.0).abs() < 1e-6);
    }
}
