//! Batching acceleration structure (C9): glues the residency cache (C3),
//! task graph (C4), subscene partitioner (C5), per-subscene BVH cache (C6),
//! SVDAG culler (C7) and top-level pauseable BVH (C8) into the two methods
//! an integrator actually calls, `intersect`/`intersect_any` (spec.md §4.9).
//!
//! Data flow per ray: `intersect` enqueues onto an implicit "top-level
//! traversal" task so the first call and every resumption share one code
//! path (`advance`). That task's kernel walks C8; a `Paused` outcome
//! forwards the ray into the batching point's own task, whose kernel runs
//! the SVDAG occupancy test, makes the subscene's shapes/BVH resident
//! through C3, runs the bottom-level intersection, and calls `advance`
//! again to resume C8 — until the top-level tree drains to `Hit`/`Miss`,
//! delivered to whichever of the integrator's four task handles matches.

use std::sync::{Arc, OnceLock};

use ahash::{AHashMap, AHashSet};

use crate::bvh::cached::{CachedBvh, ShapeRegistry};
use crate::bvh::pauseable::{PauseableBvh, PauseableInsertHandle, TraversalOutcome};
use crate::cache::serializer::{Deserializer, InMemorySerializer, Serializer};
use crate::cache::{CacheHandle, CachedPtr, Evictable, ResidencyCache};
use crate::config::Config;
use crate::error::CoreResult;
use crate::math::{Bounds3, Ray, SurfaceInteraction};
use crate::scene::partition::{self, PartitionWarning, SubScene};
use crate::scene::Scene;
use crate::stats::Stats;
use crate::task_graph::{Handle, TaskGraph};

/// The four task handles a consumer (normally `integrator::ReferenceIntegrator`)
/// registers before constructing a [`BatchingAccelerator`]; every delivered
/// item is `(Ray, Option<SurfaceInteraction>, RayState)` per spec.md §6.
pub struct IntegratorTaskHandles<S> {
    pub hit: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    pub miss: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    pub anyhit: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    pub anymiss: Handle<(Ray, Option<SurfaceInteraction>, S)>,
}

impl<S> Clone for IntegratorTaskHandles<S> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<S> Copy for IntegratorTaskHandles<S> {}

#[derive(Clone, Copy)]
enum QueryMode {
    Nearest,
    Any,
}

#[derive(Clone)]
struct BestHit {
    object_index: u32,
    shape: Arc<crate::scene::Shape>,
    primitive_hit: crate::scene::shape::PrimitiveHit,
}

/// One in-flight query as it moves through the task graph. Carries its own
/// resume handle so a ray can be paused at one batching point and resumed
/// at another without the caller ever seeing the suspension.
#[derive(Clone)]
struct TraversalItem<S> {
    ray: Ray,
    handle: Option<PauseableInsertHandle>,
    state: S,
    mode: QueryMode,
    best_hit: Option<BestHit>,
}

/// Static data loaded once per flush of a subscene's task: the shapes and
/// bottom-level BVH made resident through C3 for the duration of that flush.
#[derive(Default)]
struct SubsceneStatic {
    shapes: Vec<CachedPtr<crate::scene::Shape>>,
    bvh: Option<CachedPtr<CachedBvh>>,
}

pub struct BatchingAccelerator<S> {
    entry: Handle<TraversalItem<S>>,
    shape_cache: Arc<ResidencyCache<crate::scene::Shape>>,
    bvh_cache: Arc<ResidencyCache<CachedBvh>>,
    partition_warnings: Vec<PartitionWarning>,
    subscene_count: usize,
}

impl<S: Clone + Send + Sync + 'static> BatchingAccelerator<S> {
    /// Builds the whole pipeline: partitions the scene (C5), builds one
    /// `CachedBvh` per subscene (C6) and registers it and every shape it
    /// references with their residency caches (C3), builds the SVDAG
    /// culler (C7) and the top-level pauseable BVH (C8), and registers the
    /// top-level and per-subscene tasks with `graph` (C4).
    pub fn new(
        scene: &Scene,
        config: &Config,
        stats: Arc<Stats>,
        graph: &mut TaskGraph,
        integrator_tasks: IntegratorTaskHandles<S>,
    ) -> CoreResult<Self> {
        let result = partition::partition(scene, config.primitives_per_subscene)?;
        let subscenes = result.subscenes;
        for warning in &result.warnings {
            tracing::warn!(
                shape_id = warning.shape_id,
                primitive_count = warning.primitive_count,
                budget = warning.budget,
                "subscene partitioner could not reduce a shape below budget"
            );
        }

        let shape_cache = Arc::new(ResidencyCache::new(config.geometry_cache_bytes, stats.clone()));
        let bvh_cache = Arc::new(ResidencyCache::new(config.bvh_cache_bytes, stats.clone()));

        // Serialize and register every distinct shape once, regardless of
        // how many subscenes/occurrences reference it.
        let shape_serializer: Box<dyn Serializer> = Box::new(InMemorySerializer::new());
        let mut shape_handles: AHashMap<u32, CacheHandle> = AHashMap::default();
        for sub in &subscenes {
            for (obj, _) in &sub.scene_objects {
                if !shape_handles.contains_key(&obj.shape.id) {
                    obj.shape.serialize(shape_serializer.as_ref());
                    let handle = shape_cache.register(obj.shape.clone());
                    shape_handles.insert(obj.shape.id, handle);
                }
            }
        }
        let shape_deserializer: Arc<dyn Deserializer> =
            Arc::from(shape_serializer.create_deserializer()?);

        // Build + serialize + register one CachedBvh per subscene.
        let shape_registry = Arc::new(ShapeRegistry::from_subscenes(&subscenes));
        let bvh_serializer: Box<dyn Serializer> = Box::new(InMemorySerializer::new());
        let mut bvh_handles = Vec::with_capacity(subscenes.len());
        for (k, sub) in subscenes.iter().enumerate() {
            let bvh = CachedBvh::build(k as u32, sub, shape_registry.clone());
            bvh.serialize(bvh_serializer.as_ref());
            bvh_handles.push(bvh_cache.register(Arc::new(bvh)));
        }
        let bvh_deserializer: Arc<dyn Deserializer> =
            Arc::from(bvh_serializer.create_deserializer()?);

        // `svdag_resolution == 0` disables culling entirely (Config's
        // documented escape hatch): every batching point is treated as
        // unconditionally occupied rather than building a degenerate DAG.
        let svdag = if config.svdag_resolution == 0 {
            None
        } else {
            Some(Arc::new(crate::svdag::SparseVoxelDag::build(
                &subscenes,
                config.svdag_resolution,
            )))
        };

        let subscene_bounds: Vec<Bounds3> = subscenes.iter().map(|s| s.bounds).collect();
        let top_level = Arc::new(PauseableBvh::build(&subscene_bounds));
        let subscene_count = subscenes.len();

        let subscene_handles_cell: Arc<OnceLock<Vec<Handle<TraversalItem<S>>>>> =
            Arc::new(OnceLock::new());

        let IntegratorTaskHandles {
            hit,
            miss,
            anyhit,
            anymiss,
        } = integrator_tasks;

        // The implicit "top level traversal" task: every `intersect` call
        // and every resumption after a batching point funnels through here,
        // so there is no special case for "the very first traversal step".
        let entry_top_level = top_level.clone();
        let entry_handles_cell = subscene_handles_cell.clone();
        let entry: Handle<TraversalItem<S>> = graph.add_task(
            "top-level-traversal",
            move |items: &[TraversalItem<S>], _: Option<&()>, graph: &TaskGraph| {
                let handles = entry_handles_cell
                    .get()
                    .expect("subscene task handles must be published before the graph runs");
                for item in items {
                    advance(item.clone(), &entry_top_level, handles, hit, miss, anyhit, anymiss, graph);
                }
            },
        );

        let mut subscene_handles = Vec::with_capacity(subscene_count);
        for (k, sub) in subscenes.iter().enumerate() {
            let bvh_handle = bvh_handles[k];
            let mut shape_ids = AHashSet::default();
            for (obj, _) in &sub.scene_objects {
                shape_ids.insert(obj.shape.id);
            }
            let sub_shape_handles: Vec<CacheHandle> = shape_ids
                .iter()
                .map(|id| *shape_handles.get(id).expect("every shape was registered above"))
                .collect();

            let shape_cache_loader = shape_cache.clone();
            let bvh_cache_loader = bvh_cache.clone();
            let shape_deserializer_loader = shape_deserializer.clone();
            let bvh_deserializer_loader = bvh_deserializer.clone();
            let loader = move |data: &mut SubsceneStatic| {
                data.shapes = sub_shape_handles
                    .iter()
                    .map(|h| shape_cache_loader.make_resident(*h, shape_deserializer_loader.as_ref()))
                    .collect();
                data.bvh = Some(bvh_cache_loader.make_resident(bvh_handle, bvh_deserializer_loader.as_ref()));
            };

            let svdag_kernel = svdag.clone();
            let top_level_kernel = top_level.clone();
            let handles_cell_kernel = subscene_handles_cell.clone();
            let kernel = move |items: &[TraversalItem<S>], static_data: Option<&SubsceneStatic>, graph: &TaskGraph| {
                let static_data = static_data.expect("subscene task always loads its static data");
                for item in items {
                    let mut item = item.clone();
                    let occupied = svdag_kernel
                        .as_ref()
                        .map(|dag| dag.intersect_scalar(k, &item.ray))
                        .unwrap_or(true);

                    if occupied {
                        match item.mode {
                            QueryMode::Nearest => {
                                if let Some(bvh_ptr) = static_data.bvh.as_ref() {
                                    if let Some(hit_result) = bvh_ptr.get().intersect(&item.ray) {
                                        item.best_hit = Some(BestHit {
                                            object_index: hit_result.object_index,
                                            shape: hit_result.shape.clone(),
                                            primitive_hit: hit_result.primitive_hit,
                                        });
                                    }
                                }
                            }
                            QueryMode::Any => {
                                let found = static_data
                                    .bvh
                                    .as_ref()
                                    .map(|b| b.intersect_any(&item.ray))
                                    .unwrap_or(false);
                                if found {
                                    graph.enqueue(anyhit, (item.ray, None, item.state));
                                    continue;
                                }
                            }
                        }
                    }

                    let handles = handles_cell_kernel
                        .get()
                        .expect("subscene task handles must be published before the graph runs");
                    advance(item, &top_level_kernel, handles, hit, miss, anyhit, anymiss, graph);
                }
            };

            let handle = graph.add_task_with_static(format!("subscene-{k}"), loader, kernel);
            subscene_handles.push(handle);
        }
        subscene_handles_cell
            .set(subscene_handles)
            .unwrap_or_else(|_| unreachable!("subscene handles are published exactly once"));

        Ok(BatchingAccelerator {
            entry,
            shape_cache,
            bvh_cache,
            partition_warnings: result.warnings,
            subscene_count,
        })
    }

    /// Enqueues a nearest-hit query. Architecturally asynchronous: the
    /// result is delivered later to the integrator's `hit`/`miss` task, not
    /// returned from this call (spec.md §4.9 — the only suspension point is
    /// a ray entering a batching-point leaf; everything else, including this
    /// enqueue, runs to completion on the calling thread).
    pub fn intersect(&self, graph: &TaskGraph, ray: Ray, state: S) {
        graph.enqueue(
            self.entry,
            TraversalItem {
                ray,
                handle: None,
                state,
                mode: QueryMode::Nearest,
                best_hit: None,
            },
        );
    }

    /// Enqueues an occlusion query; delivered to `anyhit`/`anymiss`.
    pub fn intersect_any(&self, graph: &TaskGraph, ray: Ray, state: S) {
        graph.enqueue(
            self.entry,
            TraversalItem {
                ray,
                handle: None,
                state,
                mode: QueryMode::Any,
                best_hit: None,
            },
        );
    }

    /// Batch form of [`Self::intersect`], for callers that already have a
    /// flushed batch of rays on hand (e.g. a `StagingBuffer` drain) and want
    /// one `enqueue_many` instead of one push per ray.
    pub fn intersect_many(&self, graph: &TaskGraph, rays: impl IntoIterator<Item = (Ray, S)>) {
        let items = rays.into_iter().map(|(ray, state)| TraversalItem {
            ray,
            handle: None,
            state,
            mode: QueryMode::Nearest,
            best_hit: None,
        });
        graph.enqueue_many(self.entry, items);
    }

    pub fn partition_warnings(&self) -> &[PartitionWarning] {
        &self.partition_warnings
    }

    pub fn subscene_count(&self) -> usize {
        self.subscene_count
    }

    pub fn geometry_cache_used_bytes(&self) -> u64 {
        self.shape_cache.used_bytes()
    }

    pub fn bvh_cache_used_bytes(&self) -> u64 {
        self.bvh_cache.used_bytes()
    }
}

/// Resumes top-level traversal (C8) for one item and routes the outcome:
/// forward into the paused-at subscene's task, or deliver to whichever of
/// the integrator's four task handles matches `mode`/outcome.
#[allow(clippy::too_many_arguments)]
fn advance<S: Clone + Send + Sync + 'static>(
    mut item: TraversalItem<S>,
    top_level: &PauseableBvh,
    subscene_handles: &[Handle<TraversalItem<S>>],
    hit: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    miss: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    anyhit: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    anymiss: Handle<(Ray, Option<SurfaceInteraction>, S)>,
    graph: &TaskGraph,
) {
    // `Any`-mode rays never reach here having found occlusion: the subscene
    // kernel above routes a found occlusion straight to `anyhit` and only
    // falls through to `advance` when that subscene reported nothing, so
    // `Any` must never contribute a hit to the top-level decision.
    let hit_found = match item.mode {
        QueryMode::Nearest => item.best_hit.is_some(),
        QueryMode::Any => false,
    };
    let outcome = top_level.intersect(&item.ray, item.handle.take(), hit_found);
    match outcome {
        TraversalOutcome::Hit => match item.mode {
            QueryMode::Nearest => {
                let si = item
                    .best_hit
                    .as_ref()
                    .map(|bh| bh.shape.fill_surface_interaction(&item.ray, &bh.primitive_hit));
                graph.enqueue(hit, (item.ray, si, item.state));
            }
            // `hit_found` is hardcoded false for `Any` above, so this arm is
            // unreachable in practice; kept so an any-mode item is still
            // routed somewhere sane rather than silently dropped if that
            // ever changes.
            QueryMode::Any => graph.enqueue(anyhit, (item.ray, None, item.state)),
        },
        TraversalOutcome::Miss => match item.mode {
            QueryMode::Nearest => graph.enqueue(miss, (item.ray, None, item.state)),
            QueryMode::Any => graph.enqueue(anymiss, (item.ray, None, item.state)),
        },
        TraversalOutcome::Paused { handle, leaf_index } => {
            item.handle = Some(handle);
            graph.enqueue(subscene_handles[leaf_index as usize], item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{SceneBuilder, SceneObject, Shape};
    use glam::Vec3;
    use parking_lot::Mutex;

    #[derive(Clone)]
    struct PixelState {
        pixel: (u32, u32),
    }

    fn single_triangle_scene() -> Scene {
        let mut builder = SceneBuilder::new();
        builder.add_object(
            builder.root(),
            SceneObject {
                shape: Arc::new(Shape::new(
                    0,
                    vec![[0, 1, 2]],
                    vec![Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), Vec3::new(0.0, 2.0, 0.0)],
                    vec![Vec3::Z; 3],
                    vec![],
                )),
                material_id: 0,
                area_light_id: None,
            },
        );
        builder.build()
    }

    #[test]
    fn nearest_hit_is_delivered_to_the_hit_task() {
        let scene = single_triangle_scene();
        let mut config = Config::default();
        config.primitives_per_subscene = 1024;
        config.svdag_resolution = 16;
        let stats = Arc::new(Stats::new());
        let mut graph = TaskGraph::new(2, stats.clone());

        let hits: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let misses: Arc<Mutex<Vec<(u32, u32)>>> = Arc::new(Mutex::new(Vec::new()));
        let hits_clone = hits.clone();
        let misses_clone = misses.clone();

        type Delivered = (Ray, Option<SurfaceInteraction>, PixelState);
        let hit: Handle<Delivered> = graph.add_task("hit", move |items: &[Delivered], _, _: &TaskGraph| {
            for (_, si, state) in items {
                assert!(si.is_some(), "hit delivery must carry a surface interaction");
                hits_clone.lock().push(state.pixel);
            }
        });
        let miss: Handle<Delivered> = graph.add_task("miss", move |items: &[Delivered], _, _: &TaskGraph| {
            for (_, _, state) in items {
                misses_clone.lock().push(state.pixel);
            }
        });
        let anyhit: Handle<Delivered> = graph.add_task("anyhit", |_: &[Delivered], _, _: &TaskGraph| {});
        let anymiss: Handle<Delivered> = graph.add_task("anymiss", |_: &[Delivered], _, _: &TaskGraph| {});

        let accel = BatchingAccelerator::new(
            &scene,
            &config,
            stats,
            &mut graph,
            IntegratorTaskHandles { hit, miss, anyhit, anymiss },
        )
        .unwrap();

        let hitting = Ray::new(Vec3::new(0.3, 0.3, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        accel.intersect(&graph, hitting, PixelState { pixel: (0, 0) });
        let missing = Ray::new(Vec3::new(50.0, 50.0, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        accel.intersect(&graph, missing, PixelState { pixel: (1, 1) });

        graph.run();

        assert_eq!(hits.lock().as_slice(), &[(0, 0)]);
        assert_eq!(misses.lock().as_slice(), &[(1, 1)]);
    }

    #[test]
    fn instanced_grid_partitions_into_multiple_subscenes() {
        let mut builder = SceneBuilder::new();
        for i in 0..8u32 {
            let child = builder.add_node();
            builder.add_object(
                child,
                SceneObject {
                    shape: Arc::new(Shape::new(
                        i,
                        vec![[0, 1, 2]],
                        vec![Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 1.0, 0.0)],
                        vec![Vec3::Z; 3],
                        vec![],
                    )),
                    material_id: 0,
                    area_light_id: None,
                },
            );
            builder.attach(
                builder.root(),
                child,
                Some(glam::Mat4::from_translation(Vec3::new(i as f32 * 10.0, 0.0, 0.0))),
            );
        }
        let scene = builder.build();

        let mut config = Config::default();
        config.primitives_per_subscene = 1;
        config.svdag_resolution = 0;
        let stats = Arc::new(Stats::new());
        let mut graph = TaskGraph::new(2, stats.clone());

        type Delivered = (Ray, Option<SurfaceInteraction>, ());
        let hit: Handle<Delivered> = graph.add_task("hit", |_: &[Delivered], _, _: &TaskGraph| {});
        let miss: Handle<Delivered> = graph.add_task("miss", |_: &[Delivered], _, _: &TaskGraph| {});
        let anyhit: Handle<Delivered> = graph.add_task("anyhit", |_: &[Delivered], _, _: &TaskGraph| {});
        let anymiss: Handle<Delivered> = graph.add_task("anymiss", |_: &[Delivered], _, _: &TaskGraph| {});

        let accel = BatchingAccelerator::new(
            &scene,
            &config,
            stats,
            &mut graph,
            IntegratorTaskHandles { hit, miss, anyhit, anymiss },
        )
        .unwrap();

        assert!(accel.subscene_count() >= 8, "one triangle per subscene at budget 1");
        assert!(accel.partition_warnings().is_empty());
    }
}
