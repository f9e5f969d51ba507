use std::sync::atomic::{AtomicU32, Ordering};

use glam::Vec3;

/// A ray with an interior-mutable `t_max`.
///
/// BVH traversal tightens `t_max` as a side effect of finding closer hits.
/// Storing it as bit-cast `AtomicU32` (rather than a plain `Cell<f32>`) lets
/// traversal code take `&Ray` everywhere, including across a pause/resume
/// boundary in the top-level BVH (§4.8) and across the task graph's queues
/// once a ray is batched into another subscene's task, without re-threading
/// `&mut Ray` through deeply recursive or queued code paths — a `Cell` would
/// make `Ray` (and anything holding one) `!Sync`, which the task queues
/// require.
#[derive(Debug)]
pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    t_max: AtomicU32,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3, t_max: f32) -> Self {
        Ray {
            origin,
            direction,
            t_max: AtomicU32::new(t_max.to_bits()),
        }
    }

    pub fn t_max(&self) -> f32 {
        f32::from_bits(self.t_max.load(Ordering::Relaxed))
    }

    /// Tightens `t_max`; a no-op if `t` is not strictly closer.
    pub fn tighten(&self, t: f32) {
        let mut current = self.t_max.load(Ordering::Relaxed);
        loop {
            if t >= f32::from_bits(current) {
                return;
            }
            match self.t_max.compare_exchange_weak(
                current,
                t.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.origin + self.direction * t
    }
}

impl Clone for Ray {
    fn clone(&self) -> Self {
        Ray {
            origin: self.origin,
            direction: self.direction,
            t_max: AtomicU32::new(self.t_max.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tighten_only_shrinks() {
        let ray = Ray::new(Vec3::ZERO, Vec3::X, 10.0);
        ray.tighten(5.0);
        assert_eq!(ray.t_max(), 5.0);
        ray.tighten(7.0);
        assert_eq!(ray.t_max(), 5.0, "tighten must never grow t_max");
    }
}
