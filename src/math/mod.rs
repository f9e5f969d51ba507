//! Shared geometric primitives: bounds, rays, surface interactions.
//!
//! Ray/BVH math proper (ray-triangle intersection, SAH evaluation) is
//! assumed to be library-quality plumbing per spec.md §1; what lives here
//! is the small set of value types every other component needs to agree on.

use glam::Vec3;

pub mod ray;

pub use ray::Ray;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds3 {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for Bounds3 {
    fn default() -> Self {
        Bounds3::empty()
    }
}

impl Bounds3 {
    pub fn empty() -> Self {
        Bounds3 {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn from_point(p: Vec3) -> Self {
        Bounds3 { min: p, max: p }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn union(&self, other: &Bounds3) -> Bounds3 {
        Bounds3 {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn union_point(&self, p: Vec3) -> Bounds3 {
        Bounds3 {
            min: self.min.min(p),
            max: self.max.max(p),
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn diagonal(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.diagonal();
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Largest axis: 0 = x, 1 = y, 2 = z. Used by the SAH builder to pick a split axis.
    pub fn max_extent_axis(&self) -> usize {
        let d = self.diagonal();
        if d.x > d.y && d.x > d.z {
            0
        } else if d.y > d.z {
            1
        } else {
            2
        }
    }

    /// Position of `p` within the bounds, normalized to `[0, 1]` per axis.
    pub fn offset(&self, p: Vec3) -> Vec3 {
        let mut o = p - self.min;
        let d = self.diagonal();
        if d.x > 0.0 {
            o.x /= d.x;
        }
        if d.y > 0.0 {
            o.y /= d.y;
        }
        if d.z > 0.0 {
            o.z /= d.z;
        }
        o
    }

    /// Slab-test intersection against a ray, returning the entry/exit distances if any.
    pub fn intersect_ray(&self, ray: &Ray) -> Option<(f32, f32)> {
        let inv_dir = Vec3::new(1.0 / ray.direction.x, 1.0 / ray.direction.y, 1.0 / ray.direction.z);
        let t0 = (self.min - ray.origin) * inv_dir;
        let t1 = (self.max - ray.origin) * inv_dir;
        let t_small = t0.min(t1);
        let t_big = t0.max(t1);

        let t_min = t_small.x.max(t_small.y).max(t_small.z).max(0.0);
        let t_max = t_big.x.min(t_big.y).min(t_big.z).min(ray.t_max());

        if t_min <= t_max { Some((t_min, t_max)) } else { None }
    }
}

/// Surface sample delivered to an integrator's hit task.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceInteraction {
    pub position: Vec3,
    pub normal: Vec3,
    pub geometric_normal: Vec3,
    pub uv: glam::Vec2,
    pub wo: Vec3,
    pub primitive_id: u32,
    pub material_id: u32,
    pub area_light_id: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_grows_bounds() {
        let a = Bounds3::from_point(Vec3::new(0.0, 0.0, 0.0));
        let b = Bounds3::from_point(Vec3::new(1.0, 2.0, 3.0));
        let u = a.union(&b);
        assert_eq!(u.min, Vec3::ZERO);
        assert_eq!(u.max, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn surface_area_of_unit_cube_is_six() {
        let b = Bounds3 {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        };
        assert!((b.surface_area() - 6.0).abs() < 1e-6);
    }
}
