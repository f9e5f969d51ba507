//! Per-subscene bottom-level BVH (C6): wraps the shared SAH builder over a
//! subscene's flattened primitive list (every instance occurrence already
//! resolved to a concrete shape + transform by the partitioner), and is
//! itself an [`Evictable`] so it pages through the same residency cache as
//! shapes (spec.md §4.6: "registers the resulting CachedBVH as an evictable
//! in C3").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use glam::Mat4;
use parking_lot::RwLock;

use crate::bvh::sah::{self, SahNodeKind};
use crate::cache::serializer::{Allocation, Deserializer, Serializer};
use crate::cache::Evictable;
use crate::math::{Bounds3, Ray};
use crate::scene::partition::SubScene;
use crate::scene::shape::PrimitiveHit;
use crate::scene::Shape;

/// Lookup from shape id to the shared `Arc<Shape>`, built once when the
/// scene is loaded and shared (by `Arc`) across every `CachedBvh` — shapes
/// themselves page in and out of the residency cache independently of any
/// one subscene's BVH.
pub struct ShapeRegistry {
    shapes: AHashMap<u32, Arc<Shape>>,
}

impl ShapeRegistry {
    pub fn from_subscenes(subscenes: &[SubScene]) -> Self {
        let mut shapes = AHashMap::default();
        for sub in subscenes {
            for (obj, _) in &sub.scene_objects {
                shapes.entry(obj.shape.id).or_insert_with(|| obj.shape.clone());
            }
        }
        ShapeRegistry { shapes }
    }

    pub fn get(&self, id: u32) -> Arc<Shape> {
        self.shapes
            .get(&id)
            .expect("ShapeRegistry must be built from every subscene before any CachedBvh intersects")
            .clone()
    }
}

/// One leaf occurrence: a specific primitive of a specific shape, in world
/// space via `transform` (identity for non-instanced occurrences).
#[derive(Clone, Copy)]
struct PrimitiveRef {
    shape_id: u32,
    primitive_id: u32,
    object_index: u32,
    transform: Mat4,
    inverse_transform: Mat4,
}

struct FlatNode {
    bounds: Bounds3,
    kind: SahNodeKind,
}

pub struct CachedBvhHit {
    pub t: f32,
    pub object_index: u32,
    pub shape: Arc<Shape>,
    pub primitive_hit: PrimitiveHit,
}

struct Built {
    nodes: Vec<FlatNode>,
    root: u32,
    primitive_refs: Vec<PrimitiveRef>,
}

pub struct CachedBvh {
    pub subscene_id: u32,
    shapes: Arc<ShapeRegistry>,
    bounds: Bounds3,
    built: RwLock<Option<Built>>,
    alloc: RwLock<Option<Allocation>>,
    resident: AtomicBool,
    serialized_primitive_count: usize,
}

impl CachedBvh {
    pub fn build(subscene_id: u32, subscene: &SubScene, shapes: Arc<ShapeRegistry>) -> Self {
        let mut primitive_refs = Vec::new();
        let mut item_bounds = Vec::new();
        let mut item_weights = Vec::new();

        for (object_index, (obj, transform)) in subscene.scene_objects.iter().enumerate() {
            let inverse = transform.inverse();
            for p in 0..obj.shape.num_primitives() {
                let local_bounds = obj.shape.get_primitive_bounds(p);
                let world_bounds = transform_bounds(&local_bounds, transform);
                item_bounds.push(world_bounds);
                item_weights.push(1usize);
                primitive_refs.push(PrimitiveRef {
                    shape_id: obj.shape.id,
                    primitive_id: p as u32,
                    object_index: object_index as u32,
                    transform: *transform,
                    inverse_transform: inverse,
                });
            }
        }

        let serialized_primitive_count = primitive_refs.len();
        // Bottom-level leaves hold a handful of primitives each (2-8 wide
        // per spec.md §4.6); not a subscene-sized budget.
        const LEAF_WIDTH: usize = 4;
        let build = sah::build(&item_bounds, &item_weights, LEAF_WIDTH);

        let nodes: Vec<FlatNode> = build
            .nodes
            .iter()
            .map(|n| FlatNode {
                bounds: n.bounds,
                kind: n.kind,
            })
            .collect();
        let ordered_refs: Vec<PrimitiveRef> = build
            .ordered_indices
            .iter()
            .map(|&i| primitive_refs[i])
            .collect();

        CachedBvh {
            subscene_id,
            shapes,
            bounds: subscene.bounds,
            built: RwLock::new(Some(Built {
                nodes,
                root: build.root,
                primitive_refs: ordered_refs,
            })),
            alloc: RwLock::new(None),
            resident: AtomicBool::new(true),
            serialized_primitive_count,
        }
    }

    pub fn bounds(&self) -> Bounds3 {
        self.bounds
    }

    /// Nearest-hit traversal. Requires every shape referenced by a visited
    /// leaf to currently be resident; callers (C9) are responsible for that
    /// via the task graph's static-data loader.
    pub fn intersect(&self, ray: &Ray) -> Option<CachedBvhHit> {
        let built = self.built.read();
        let built = built.as_ref().expect("CachedBvh must be resident to intersect");
        let mut best: Option<CachedBvhHit> = None;
        self.intersect_node(built, built.root, ray, &mut best);
        best
    }

    fn intersect_node(&self, built: &Built, node_idx: u32, ray: &Ray, best: &mut Option<CachedBvhHit>) {
        let node = &built.nodes[node_idx as usize];
        if node.bounds.intersect_ray(ray).is_none() {
            return;
        }
        match node.kind {
            SahNodeKind::Leaf { start, count } => {
                for i in start..start + count {
                    let pref = &built.primitive_refs[i as usize];
                    let shape = self.shapes.get(pref.shape_id);
                    // Instance transforms are rigid (translation + rotation,
                    // no scale), so `t` is identical in local and world
                    // space and a local hit can directly tighten `ray`.
                    let local_origin = pref.inverse_transform.transform_point3(ray.origin);
                    let local_dir = pref.inverse_transform.transform_vector3(ray.direction);
                    let local_ray = Ray::new(local_origin, local_dir, ray.t_max());
                    if let Some(hit) = shape.intersect_primitive(&local_ray, pref.primitive_id as usize) {
                        ray.tighten(hit.t);
                        *best = Some(CachedBvhHit {
                            t: hit.t,
                            object_index: pref.object_index,
                            shape,
                            primitive_hit: hit,
                        });
                    }
                }
            }
            SahNodeKind::Interior { left, right, .. } => {
                self.intersect_node(built, left, ray, best);
                self.intersect_node(built, right, ray, best);
            }
        }
    }

    pub fn intersect_any(&self, ray: &Ray) -> bool {
        let built = self.built.read();
        let built = built.as_ref().expect("CachedBvh must be resident to intersect");
        self.intersect_any_node(built, built.root, ray)
    }

    fn intersect_any_node(&self, built: &Built, node_idx: u32, ray: &Ray) -> bool {
        let node = &built.nodes[node_idx as usize];
        if node.bounds.intersect_ray(ray).is_none() {
            return false;
        }
        match node.kind {
            SahNodeKind::Leaf { start, count } => {
                for i in start..start + count {
                    let pref = &built.primitive_refs[i as usize];
                    let shape = self.shapes.get(pref.shape_id);
                    let local_origin = pref.inverse_transform.transform_point3(ray.origin);
                    let local_dir = pref.inverse_transform.transform_vector3(ray.direction);
                    let local_ray = Ray::new(local_origin, local_dir, ray.t_max());
                    if shape.intersect_primitive(&local_ray, pref.primitive_id as usize).is_some() {
                        return true;
                    }
                }
                false
            }
            SahNodeKind::Interior { left, right, .. } => {
                self.intersect_any_node(built, left, ray) || self.intersect_any_node(built, right, ray)
            }
        }
    }
}

fn transform_bounds(bounds: &Bounds3, transform: &Mat4) -> Bounds3 {
    let mut out = Bounds3::empty();
    for i in 0..8 {
        let corner = glam::Vec3::new(
            if i & 1 == 0 { bounds.min.x } else { bounds.max.x },
            if i & 2 == 0 { bounds.min.y } else { bounds.max.y },
            if i & 4 == 0 { bounds.min.z } else { bounds.max.z },
        );
        out = out.union_point(transform.transform_point3(corner));
    }
    out
}

const SERIALIZED_NODE_SIZE: usize = std::mem::size_of::<[f32; 6]>() + std::mem::size_of::<u32>() * 3;
const SERIALIZED_REF_SIZE: usize = std::mem::size_of::<u32>() * 3 + std::mem::size_of::<[f32; 16]>();

impl Evictable for CachedBvh {
    fn serialize(&self, serializer: &dyn Serializer) {
        let built_guard = self.built.read();
        let built = built_guard.as_ref().expect("serialize called before build");

        let total = 8 + built.nodes.len() * SERIALIZED_NODE_SIZE + built.primitive_refs.len() * SERIALIZED_REF_SIZE;
        let (alloc, ptr) = serializer.allocate_and_map(total);

        unsafe {
            let mut cursor = ptr;
            write_u32(&mut cursor, built.nodes.len() as u32);
            write_u32(&mut cursor, built.root);

            for node in &built.nodes {
                write_f32(&mut cursor, node.bounds.min.x);
                write_f32(&mut cursor, node.bounds.min.y);
                write_f32(&mut cursor, node.bounds.min.z);
                write_f32(&mut cursor, node.bounds.max.x);
                write_f32(&mut cursor, node.bounds.max.y);
                write_f32(&mut cursor, node.bounds.max.z);
                match node.kind {
                    SahNodeKind::Leaf { start, count } => {
                        write_u32(&mut cursor, 0);
                        write_u32(&mut cursor, start);
                        write_u32(&mut cursor, count);
                    }
                    SahNodeKind::Interior { left, right, axis } => {
                        write_u32(&mut cursor, 1);
                        write_u32(&mut cursor, left);
                        write_u32(&mut cursor, (right << 8) | axis as u32);
                    }
                }
            }

            for pref in &built.primitive_refs {
                write_u32(&mut cursor, pref.shape_id);
                write_u32(&mut cursor, pref.primitive_id);
                write_u32(&mut cursor, pref.object_index);
                for v in pref.transform.to_cols_array() {
                    write_f32(&mut cursor, v);
                }
            }
        }
        serializer.unmap_previous_allocations();

        *self.alloc.write() = Some(alloc);
        *self.built.write() = None;
        self.resident.store(false, Ordering::Release);
    }

    fn make_resident(&self, deserializer: &dyn Deserializer) {
        let alloc = self.alloc.read().expect("serialize must run before make_resident");
        let ptr = deserializer.map(alloc);

        unsafe {
            let mut cursor = ptr;
            let node_count = read_u32(&mut cursor) as usize;
            let root = read_u32(&mut cursor);

            let mut nodes = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                let min = glam::Vec3::new(read_f32(&mut cursor), read_f32(&mut cursor), read_f32(&mut cursor));
                let max = glam::Vec3::new(read_f32(&mut cursor), read_f32(&mut cursor), read_f32(&mut cursor));
                let discriminant = read_u32(&mut cursor);
                let kind = if discriminant == 0 {
                    let start = read_u32(&mut cursor);
                    let count = read_u32(&mut cursor);
                    SahNodeKind::Leaf { start, count }
                } else {
                    let left = read_u32(&mut cursor);
                    let packed = read_u32(&mut cursor);
                    SahNodeKind::Interior {
                        left,
                        right: packed >> 8,
                        axis: (packed & 0xff) as u8,
                    }
                };
                nodes.push(FlatNode {
                    bounds: Bounds3 { min, max },
                    kind,
                });
            }

            let mut primitive_refs = Vec::with_capacity(self.serialized_primitive_count);
            for _ in 0..self.serialized_primitive_count {
                let shape_id = read_u32(&mut cursor);
                let primitive_id = read_u32(&mut cursor);
                let object_index = read_u32(&mut cursor);
                let mut cols = [0f32; 16];
                for c in cols.iter_mut() {
                    *c = read_f32(&mut cursor);
                }
                let transform = Mat4::from_cols_array(&cols);
                primitive_refs.push(PrimitiveRef {
                    shape_id,
                    primitive_id,
                    object_index,
                    transform,
                    inverse_transform: transform.inverse(),
                });
            }

            *self.built.write() = Some(Built {
                nodes,
                root,
                primitive_refs,
            });
        }
        self.resident.store(true, Ordering::Release);
    }

    fn evict(&self) {
        *self.built.write() = None;
        self.resident.store(false, Ordering::Release);
    }

    fn size_bytes(&self) -> usize {
        if self.resident.load(Ordering::Acquire) {
            let built = self.built.read();
            built
                .as_ref()
                .map(|b| b.nodes.len() * SERIALIZED_NODE_SIZE + b.primitive_refs.len() * SERIALIZED_REF_SIZE)
                .unwrap_or(0)
        } else {
            0
        }
    }

    fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }
}

unsafe fn write_u32(cursor: &mut *mut u8, v: u32) {
    std::ptr::write_unaligned(*cursor as *mut u32, v);
    *cursor = cursor.add(4);
}
unsafe fn write_f32(cursor: &mut *mut u8, v: f32) {
    std::ptr::write_unaligned(*cursor as *mut f32, v);
    *cursor = cursor.add(4);
}
unsafe fn read_u32(cursor: &mut *const u8) -> u32 {
    let v = std::ptr::read_unaligned(*cursor as *const u32);
    *cursor = cursor.add(4);
    v
}
unsafe fn read_f32(cursor: &mut *const u8) -> f32 {
    let v = std::ptr::read_unaligned(*cursor as *const f32);
    *cursor = cursor.add(4);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::serializer::InMemorySerializer;
    use crate::scene::{SceneObject, Shape as SceneShape};
    use glam::Vec3;

    fn triangle_shape(id: u32) -> Arc<SceneShape> {
        Arc::new(SceneShape::new(
            id,
            vec![[0, 1, 2]],
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![Vec3::Z, Vec3::Z, Vec3::Z],
            vec![],
        ))
    }

    fn single_triangle_subscene() -> SubScene {
        let shape = triangle_shape(0);
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

    #[test]
    fn intersects_the_only_primitive() {
        let sub = single_triangle_subscene();
        let registry = Arc::new(ShapeRegistry::from_subscenes(std::slice::from_ref(&sub)));
        let bvh = CachedBvh::build(0, &sub, registry);

        let ray = Ray::new(Vec3::new(0.2, 0.2, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        let hit = bvh.intersect(&ray).expect("ray must hit the triangle");
        assert!((hit.t - 1.0).abs() < 1e-4);
    }

    #[test]
    fn evict_round_trip_preserves_intersection_result() {
        let sub = single_triangle_subscene();
        let registry = Arc::new(ShapeRegistry::from_subscenes(std::slice::from_ref(&sub)));
        let bvh = CachedBvh::build(0, &sub, registry);

        let serializer: Box<dyn Serializer> = Box::new(InMemorySerializer::new());
        bvh.serialize(serializer.as_ref());
        assert!(!bvh.is_resident());
        let deserializer = serializer.create_deserializer().unwrap();
        bvh.make_resident(deserializer.as_ref());
        assert!(bvh.is_resident());

        let ray = Ray::new(Vec3::new(0.2, 0.2, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        let hit = bvh.intersect(&ray).expect("geometry must survive round-trip");
        assert!((hit.t - 1.0).abs() < 1e-4);
    }

    #[test]
    fn intersect_any_short_circuits_on_first_hit() {
        let sub = single_triangle_subscene();
        let registry = Arc::new(ShapeRegistry::from_subscenes(std::slice::from_ref(&sub)));
        let bvh = CachedBvh::build(0, &sub, registry);

        let hitting = Ray::new(Vec3::new(0.2, 0.2, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        assert!(bvh.intersect_any(&hitting));

        let missing = Ray::new(Vec3::new(5.0, 5.0, 1.0), Vec3::new(0.0, 0.0, -1.0), f32::INFINITY);
        assert!(!bvh.intersect_any(&missing));
    }
}
