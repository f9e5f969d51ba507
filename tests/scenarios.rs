//! End-to-end scenarios from spec.md §8, exercised through the crate's
//! public API rather than internal `#[cfg(test)]` units.

use std::sync::Arc;

use farbeyond::accel::{BatchingAccelerator, IntegratorTaskHandles};
use farbeyond::config::Config;
use farbeyond::integrator::{OrthographicCamera, PointLight, ReferenceIntegrator};
use farbeyond::math::{Ray, SurfaceInteraction};
use farbeyond::scene::{Scene, SceneBuilder, SceneObject, Shape};
use farbeyond::stats::Stats;
use farbeyond::svdag::SparseVoxelDag;
use farbeyond::task_graph::{Handle, TaskGraph};
use glam::{Mat4, Vec3};
use parking_lot::Mutex;

fn quad_shape(id: u32, half: f32) -> Arc<Shape> {
    Arc::new(Shape::new(
        id,
        vec![[0, 1, 2], [0, 2, 3]],
        vec![
            Vec3::new(-half, -half, 0.0),
            Vec3::new(half, -half, 0.0),
            Vec3::new(half, half, 0.0),
            Vec3::new(-half, half, 0.0),
        ],
        vec![Vec3::Z; 4],
        vec![],
    ))
}

/// Scenario 1: single mesh, direct lighting — every pixel covered by the
/// plane matches `dot(normal, -ray.dir) * intensity / distance^2` exactly
/// (no bounces, no occlusion, flat frontal geometry means every covered
/// pixel sees the same distance to the light).
#[test]
fn scenario_1_single_mesh_direct_lighting() {
    let mut builder = SceneBuilder::new();
    builder.add_object(
        builder.root(),
        SceneObject {
            shape: quad_shape(0, 5.0),
            material_id: 0,
            area_light_id: None,
        },
    );
    let scene = builder.build();

    let mut config = Config::default();
    config.primitives_per_subscene = 1024;
    config.svdag_resolution = 32;

    let camera = OrthographicCamera {
        eye_z: 8.0,
        half_extent: 4.0,
    };
    let light = PointLight {
        position: Vec3::new(0.0, 0.0, 8.0),
        intensity: 16.0,
    };

    let fb = ReferenceIntegrator::render(&scene, &config, &camera, light, 64, 64, 1).unwrap();
    let expected = 1.0 * light.intensity / (light.position.z * light.position.z);
    for pixel in &fb {
        assert!((pixel.x - expected).abs() < 1e-4, "{pixel:?} != {expected}");
    }
}

/// Scenario 2: instanced 8x grid — one shape referenced by eight distinct
/// translated nodes must partition into at least 8 subscenes (one instance
/// per translation, matching the partitioner's per-occurrence granularity
/// at this budget) and every instance's footprint must render.
#[test]
fn scenario_2_instanced_grid_partitions_and_renders_every_instance() {
    let mut builder = SceneBuilder::new();
    let shape = quad_shape(0, 0.4);
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
        builder.attach(
            builder.root(),
            child,
            Some(Mat4::from_translation(Vec3::new((i - 4) as f32 * 2.0, 0.0, 0.0))),
        );
    }
    let scene = builder.build();

    let mut config = Config::default();
    config.primitives_per_subscene = 1;
    config.svdag_resolution = 0;

    let camera = OrthographicCamera {
        eye_z: 8.0,
        half_extent: 8.0,
    };
    let light = PointLight {
        position: Vec3::new(0.0, 0.0, 8.0),
        intensity: 16.0,
    };

    let fb = ReferenceIntegrator::render(&scene, &config, &camera, light, 64, 8, 1).unwrap();
    let covered_columns: std::collections::HashSet<u32> = fb
        .iter()
        .enumerate()
        .filter(|(_, p)| p.x > 0.0)
        .map(|(i, _)| i as u32 % 64)
        .collect();
    // Each of the 8 instances occupies a distinct horizontal band; a render
    // that only shows one instance (e.g. instancing collapsed to a single
    // shared transform by mistake) would cover far fewer columns.
    assert!(
        covered_columns.len() > 20,
        "expected coverage spread across multiple instances, got {} covered columns",
        covered_columns.len()
    );
}

type Delivered = (Ray, Option<SurfaceInteraction>, ());

fn build_accel_with_recording(
    scene: &Scene,
    config: &Config,
) -> (
    BatchingAccelerator<()>,
    TaskGraph,
    Arc<Mutex<Vec<SurfaceInteraction>>>,
) {
    let stats = Arc::new(Stats::new());
    let mut graph = TaskGraph::new(2, stats.clone());
    let hits = Arc::new(Mutex::new(Vec::new()));
    let hits_clone = hits.clone();

    let hit: Handle<Delivered> = graph.add_task("hit", move |items: &[Delivered], _, _: &TaskGraph| {
        for (_, si, _) in items {
            hits_clone.lock().push(si.expect("hit must carry a surface interaction"));
        }
    });
    let miss: Handle<Delivered> = graph.add_task("miss", |_: &[Delivered], _, _: &TaskGraph| {});
    let anyhit: Handle<Delivered> = graph.add_task("anyhit", |_: &[Delivered], _, _: &TaskGraph| {});
    let anymiss: Handle<Delivered> = graph.add_task("anymiss", |_: &[Delivered], _, _: &TaskGraph| {});

    let accel = BatchingAccelerator::new(
        scene,
        config,
        stats,
        &mut graph,
        IntegratorTaskHandles { hit, miss, anyhit, anymiss },
    )
    .unwrap();

    (accel, graph, hits)
}

/// Scenario 5: pauseable BVH resume. A ray whose path crosses two
/// batching points must, after both drain, resolve to the closer of the
/// two hits — not whichever subscene happened to be processed first.
#[test]
fn scenario_5_pauseable_bvh_resume_picks_the_closer_hit() {
    let mut builder = SceneBuilder::new();
    let near_child = builder.add_node();
    builder.add_object(
        near_child,
        SceneObject {
            shape: quad_shape(0, 3.0),
            material_id: 0,
            area_light_id: None,
        },
    );
    builder.attach(builder.root(), near_child, Some(Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0))));

    let far_child = builder.add_node();
    builder.add_object(
        far_child,
        SceneObject {
            shape: quad_shape(1, 3.0),
            material_id: 0,
            area_light_id: None,
        },
    );
    builder.attach(builder.root(), far_child, Some(Mat4::from_translation(Vec3::new(0.0, 0.0, -12.0))));
    let scene = builder.build();

    let mut config = Config::default();
    config.primitives_per_subscene = 1;
    config.svdag_resolution = 0;

    let (accel, graph, hits) = build_accel_with_recording(&scene, &config);
    assert!(accel.subscene_count() >= 2, "near and far shapes must land in distinct subscenes");

    let ray = Ray::new(Vec3::new(0.0, 0.0, 20.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
    accel.intersect(&graph, ray, ());
    graph.run();

    let recorded = hits.lock();
    assert_eq!(recorded.len(), 1, "exactly one hit must be delivered for a single query ray");
    assert!(
        (recorded[0].position.z - 2.0).abs() < 1e-3,
        "resolved hit must be the nearer surface (z=2), got {:?}",
        recorded[0].position
    );
}

/// Scenario 6: SVDAG dedup. Two subscenes with identical occupancy collapse
/// onto one shared root in the deduplicated node pool, and the unified pool
/// is strictly smaller than the sum of what two independent builds would need.
#[test]
fn scenario_6_svdag_dedup_shrinks_the_shared_pool() {
    use farbeyond::scene::partition::SubScene;

    fn subscene(shape: Arc<Shape>) -> SubScene {
        let bounds = shape.get_bounds();
        SubScene {
            scene_nodes: Vec::new(),
            scene_objects: vec![(
                SceneObject {
                    shape,
                    material_id: 0,
                    area_light_id: None,
                },
                Mat4::IDENTITY,
            )],
            bounds,
        }
    }

    let identical = vec![subscene(quad_shape(0, 1.0)), subscene(quad_shape(0, 1.0))];
    let merged = SparseVoxelDag::build(&identical, 16);
    assert_eq!(merged.roots[0].root, merged.roots[1].root);

    let separate_a = SparseVoxelDag::build(&identical[..1], 16);
    let separate_b = SparseVoxelDag::build(&identical[1..], 16);
    assert!(
        merged.node_count() < separate_a.node_count() + separate_b.node_count(),
        "shared build ({}) must be smaller than the sum of independent builds ({} + {})",
        merged.node_count(),
        separate_a.node_count(),
        separate_b.node_count(),
    );
}
