//! Minimal reference integrator (§6 ADDED): not a BxDF system, just enough
//! direct lighting to drive the core end-to-end for tests and the demo
//! binary (spec.md §8 scenario 1). Registers the four task handles the
//! batching accelerator (C9) delivers to, spawns camera rays through a
//! `StagingBuffer` so high-frequency spawning doesn't contend directly on
//! the entry task's queue, and accumulates contributions into a row-major
//! framebuffer.

use std::sync::Arc;

use glam::Vec3;
use parking_lot::Mutex;

use crate::accel::{BatchingAccelerator, IntegratorTaskHandles};
use crate::config::Config;
use crate::error::CoreResult;
use crate::math::{Ray, SurfaceInteraction};
use crate::scene::Scene;
use crate::stats::Stats;
use crate::task_graph::{Handle, StagingBuffer, TaskGraph};

/// Per-ray integrator state preserved across batching suspensions
/// (spec.md §3 "RayState / AnyRayState"). The reference integrator only
/// ever spawns primary rays, so this is just the pixel it belongs to.
#[derive(Clone, Copy)]
pub struct RayState {
    pub pixel: (u32, u32),
}

/// A single point light: the only light type this fixture supports.
#[derive(Clone, Copy)]
pub struct PointLight {
    pub position: Vec3,
    pub intensity: f32,
}

/// Fixed orthographic camera looking down -Z, framing
/// `[-half_extent, half_extent]^2` in the XY plane at `z = eye_z`.
pub struct OrthographicCamera {
    pub eye_z: f32,
    pub half_extent: f32,
}

impl OrthographicCamera {
    fn ray_for_pixel(&self, x: u32, y: u32, width: u32, height: u32) -> Ray {
        let u = (x as f32 + 0.5) / width as f32 * 2.0 - 1.0;
        let v = 1.0 - (y as f32 + 0.5) / height as f32 * 2.0;
        let origin = Vec3::new(u * self.half_extent, v * self.half_extent, self.eye_z);
        Ray::new(origin, Vec3::new(0.0, 0.0, -1.0), f32::INFINITY)
    }
}

/// Direct-lighting-only reference integrator: `dot(normal, -ray.dir) *
/// light.intensity / distance^2` at the first hit, zero on miss. No
/// bounces, no importance sampling, no RNG — a fixture, not a renderer.
pub struct ReferenceIntegrator;

impl ReferenceIntegrator {
    /// Renders `width x height` pixels at `spp` samples each and returns a
    /// row-major `Vec3` framebuffer. All samples of a pixel are identical
    /// (this fixture has no sampling randomness — Non-goal per §1); `spp`
    /// exists only so the average divides out cleanly for callers that
    /// pass more than one.
    pub fn render(
        scene: &Scene,
        config: &Config,
        camera: &OrthographicCamera,
        light: PointLight,
        width: u32,
        height: u32,
        spp: u32,
    ) -> CoreResult<Vec<Vec3>> {
        config.validate()?;
        let stats = Arc::new(Stats::new());
        let mut graph = TaskGraph::new(config.worker_threads, stats.clone());

        let pixel_count = (width as usize) * (height as usize);
        let framebuffer = Arc::new(Mutex::new(vec![Vec3::ZERO; pixel_count]));

        type Delivered = (Ray, Option<SurfaceInteraction>, RayState);

        let fb_hit = framebuffer.clone();
        let hit: Handle<Delivered> = graph.add_task(
            "integrator-hit",
            move |items: &[Delivered], _: Option<&()>, _: &TaskGraph| {
                let mut fb = fb_hit.lock();
                for (ray, si, state) in items {
                    let Some(si) = si.as_ref() else {
                        crate::fatal!("hit delivery without a surface interaction");
                    };
                    let to_light = light.position - si.position;
                    let distance_squared = to_light.length_squared();
                    let cos_theta = si.normal.dot(-ray.direction).max(0.0);
                    let contribution = if distance_squared > 0.0 {
                        cos_theta * light.intensity / distance_squared
                    } else {
                        0.0
                    };
                    let index = state.pixel.1 as usize * width as usize + state.pixel.0 as usize;
                    fb[index] += Vec3::splat(contribution);
                }
            },
        );
        let miss: Handle<Delivered> = graph.add_task(
            "integrator-miss",
            |_: &[Delivered], _: Option<&()>, _: &TaskGraph| {},
        );
        let anyhit: Handle<Delivered> = graph.add_task(
            "integrator-anyhit",
            |_: &[Delivered], _: Option<&()>, _: &TaskGraph| {
                crate::fatal!("reference integrator never issues occlusion queries");
            },
        );
        let anymiss: Handle<Delivered> = graph.add_task(
            "integrator-anymiss",
            |_: &[Delivered], _: Option<&()>, _: &TaskGraph| {
                crate::fatal!("reference integrator never issues occlusion queries");
            },
        );

        let accel = BatchingAccelerator::new(
            scene,
            config,
            stats,
            &mut graph,
            IntegratorTaskHandles { hit, miss, anyhit, anymiss },
        )?;

        let mut staging = StagingBuffer::new(256);
        for y in 0..height {
            for x in 0..width {
                for _ in 0..spp {
                    let ray = camera.ray_for_pixel(x, y, width, height);
                    if let Some(batch) = staging.push((ray, RayState { pixel: (x, y) })) {
                        accel.intersect_many(&graph, batch);
                    }
                }
            }
        }
        let remaining = staging.take();
        if !remaining.is_empty() {
            accel.intersect_many(&graph, remaining);
        }

        graph.run();

        // Every closure holding a clone of `framebuffer` lives inside
        // `graph`/`accel`; drop both so the only owner left is this
        // function's local binding.
        drop(accel);
        drop(graph);
        let mut fb = Arc::try_unwrap(framebuffer)
            .unwrap_or_else(|_| panic!("a task kernel outlived graph.run()"))
            .into_inner();
        if spp > 1 {
            for pixel in &mut fb {
                *pixel /= spp as f32;
            }
        }
        Ok(fb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{SceneBuilder, SceneObject, Shape};
    use glam::Vec3;

    fn single_quad_scene() -> Scene {
        let mut builder = SceneBuilder::new();
        let half = 5.0f32;
        let shape = Arc::new(Shape::new(
            0,
            vec![[0, 1, 2], [0, 2, 3]],
            vec![
                Vec3::new(-half, -half, 0.0),
                Vec3::new(half, -half, 0.0),
                Vec3::new(half, half, 0.0),
                Vec3::new(-half, half, 0.0),
            ],
            vec![Vec3::Z; 4],
            vec![],
        ));
        builder.add_object(
            builder.root(),
            SceneObject {
                shape,
                material_id: 0,
                area_light_id: None,
            },
        );
        builder.build()
    }

    #[test]
    fn every_covered_pixel_matches_the_closed_form_direct_lighting_value() {
        let scene = single_quad_scene();
        let mut config = Config::default();
        config.primitives_per_subscene = 1024;
        config.svdag_resolution = 0;
        config.worker_threads = 2;

        let camera = OrthographicCamera {
            eye_z: 5.0,
            half_extent: 4.0,
        };
        let light = PointLight {
            position: Vec3::new(0.0, 0.0, 5.0),
            intensity: 10.0,
        };

        let fb = ReferenceIntegrator::render(&scene, &config, &camera, light, 8, 8, 1).unwrap();
        assert_eq!(fb.len(), 64);

        // The plane is a z=0 XY square facing +Z; every camera ray travels
        // straight down -Z, so every pixel's hit point sits directly under
        // the light (same x, y), isolating distance = light.position.z.
        let cos_theta = 1.0; // normal (0,0,1) dot -ray.dir (0,0,1)
        let expected = cos_theta * light.intensity / (light.position.z * light.position.z);
        for pixel in &fb {
            assert!((pixel.x - expected).abs() < 1e-3, "pixel {pixel:?} expected {expected}");
        }
    }

    #[test]
    fn rays_missing_all_geometry_contribute_nothing() {
        let scene = single_quad_scene();
        let mut config = Config::default();
        config.primitives_per_subscene = 1024;
        config.svdag_resolution = 0;

        let camera = OrthographicCamera {
            eye_z: 5.0,
            half_extent: 100.0, // far wider than the 5-unit half-extent quad
        };
        let light = PointLight {
            position: Vec3::new(0.0, 0.0, 5.0),
            intensity: 10.0,
        };

        let fb = ReferenceIntegrator::render(&scene, &config, &camera, light, 4, 4, 1).unwrap();
        // Corner pixels of a much wider frame must miss the quad entirely.
        assert_eq!(fb[0], Vec3::ZERO);
        assert_eq!(*fb.last().unwrap(), Vec3::ZERO);
    }
}
