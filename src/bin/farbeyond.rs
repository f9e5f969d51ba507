//! Demo/test driver for the out-of-core path tracer core. Builds a small
//! procedural scene, runs the reference integrator to completion, and
//! prints a pixel-sum summary. No image I/O: this binary exists to exercise
//! the crate end-to-end, not to produce pictures.

use std::sync::Arc;

use clap::Parser;
use farbeyond::config::{CacheMode, Config};
use farbeyond::integrator::{OrthographicCamera, PointLight, ReferenceIntegrator};
use farbeyond::scene::{Scene, SceneBuilder, SceneObject, Shape};
use glam::Vec3;
use tracing_subscriber::EnvFilter;

/// Renders a procedural scene through the out-of-core path tracer core.
#[derive(Parser, Debug)]
#[command(name = "farbeyond", version, about)]
struct Args {
    /// Image width in pixels.
    #[arg(long, default_value_t = 64)]
    width: u32,

    /// Image height in pixels.
    #[arg(long, default_value_t = 64)]
    height: u32,

    /// Samples per pixel.
    #[arg(long, default_value_t = 1)]
    spp: u32,

    /// Build the instanced 8x grid scene instead of a single plane.
    #[arg(long)]
    grid: bool,

    /// Target primitives per subscene (C5 batching-point budget).
    #[arg(long, default_value_t = Config::default().primitives_per_subscene)]
    primitives_per_subscene: usize,

    /// Shape residency cache budget, in bytes (C3 instance 1).
    #[arg(long, default_value_t = Config::default().geometry_cache_bytes)]
    geometry_cache_bytes: u64,

    /// Bottom-level BVH residency cache budget, in bytes (C3 instance 2).
    #[arg(long, default_value_t = Config::default().bvh_cache_bytes)]
    bvh_cache_bytes: u64,

    /// Voxel grid resolution for the SVDAG culler; 0 disables culling.
    #[arg(long, default_value_t = Config::default().svdag_resolution)]
    svdag_resolution: u32,

    /// Task-graph worker pool size.
    #[arg(long, default_value_t = Config::default().worker_threads)]
    worker_threads: usize,
}

fn plane_scene() -> Scene {
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

/// Scenario 2's instanced 8x grid: one small mesh referenced by eight
/// `SceneNode` children with distinct translations, so the same `Shape` is
/// instanced rather than duplicated.
fn instanced_grid_scene() -> Scene {
    let mut builder = SceneBuilder::new();
    let shape = Arc::new(Shape::new(
        0,
        vec![[0, 1, 2], [0, 2, 3]],
        vec![
            Vec3::new(-0.5, -0.5, 0.0),
            Vec3::new(0.5, -0.5, 0.0),
            Vec3::new(0.5, 0.5, 0.0),
            Vec3::new(-0.5, 0.5, 0.0),
        ],
        vec![Vec3::Z; 4],
        vec![],
    ));
    for i in 0..8i32 {
        let child = builder.add_node();
        builder.add_object(
            child,
            SceneObject {
                shape: shape.clone(),
                material_id: 0,
                area_light_id: None,
            },
        );
        let offset = Vec3::new((i - 4) as f32 * 2.0, 0.0, 0.0);
        builder.attach(builder.root(), child, Some(glam::Mat4::from_translation(offset)));
    }
    builder.build()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config {
        primitives_per_subscene: args.primitives_per_subscene,
        geometry_cache_bytes: args.geometry_cache_bytes,
        bvh_cache_bytes: args.bvh_cache_bytes,
        svdag_resolution: args.svdag_resolution,
        worker_threads: args.worker_threads,
        cache_mode: CacheMode::Sequential,
        ..Config::default()
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    let scene = if args.grid {
        instanced_grid_scene()
    } else {
        plane_scene()
    };

    let camera = OrthographicCamera {
        eye_z: 10.0,
        half_extent: if args.grid { 10.0 } else { 6.0 },
    };
    let light = PointLight {
        position: Vec3::new(0.0, 0.0, 10.0),
        intensity: 40.0,
    };

    tracing::info!(
        width = args.width,
        height = args.height,
        spp = args.spp,
        grid = args.grid,
        "rendering"
    );

    let framebuffer =
        ReferenceIntegrator::render(&scene, &config, &camera, light, args.width, args.height, args.spp)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "render failed");
                std::process::exit(1);
            });

    let sum: Vec3 = framebuffer.iter().copied().sum();
    let covered = framebuffer.iter().filter(|p| p.x > 0.0).count();
    tracing::info!(
        pixel_sum = ?sum,
        pixels_covered = covered,
        total_pixels = framebuffer.len(),
        "done"
    );
}
