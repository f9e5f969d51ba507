//! `Shape`: an evictable triangle mesh. Ray–triangle math proper is
//! assumed to be library-quality plumbing (spec.md §1); what's here is the
//! Evictable wiring and a Möller–Trumbore intersection routine good enough
//! to drive the reference integrator and the test suite.

use std::sync::atomic::{AtomicBool, Ordering};

use glam::{Vec2, Vec3};
use parking_lot::RwLock;

use crate::cache::serializer::{Allocation, Deserializer, Serializer};
use crate::cache::Evictable;
use crate::math::{Bounds3, Ray, SurfaceInteraction};

/// One ray-primitive intersection result.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveHit {
    pub t: f32,
    pub u: f32,
    pub v: f32,
    pub primitive_id: u32,
}

#[derive(Debug, Clone)]
struct MeshData {
    indices: Vec<[u32; 3]>,
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
}

impl MeshData {
    fn bytes_len(&self) -> usize {
        self.indices.len() * std::mem::size_of::<[u32; 3]>()
            + self.positions.len() * std::mem::size_of::<Vec3>()
            + self.normals.len() * std::mem::size_of::<Vec3>()
            + self.uvs.len() * std::mem::size_of::<Vec2>()
    }
}

/// An evictable triangle mesh, shared by any number of `SceneObject`s.
pub struct Shape {
    pub id: u32,
    num_primitives: usize,
    num_vertices: usize,
    num_uvs: usize,
    bounds: Bounds3,
    primitive_bounds: Vec<Bounds3>,
    data: RwLock<Option<MeshData>>,
    alloc: RwLock<Option<Allocation>>,
    resident: AtomicBool,
    serialized_len: usize,
}

impl Shape {
    pub fn new(
        id: u32,
        indices: Vec<[u32; 3]>,
        positions: Vec<Vec3>,
        normals: Vec<Vec3>,
        uvs: Vec<Vec2>,
    ) -> Self {
        let mut bounds = Bounds3::empty();
        let mut primitive_bounds = Vec::with_capacity(indices.len());
        for tri in &indices {
            let mut b = Bounds3::from_point(positions[tri[0] as usize]);
            b = b.union_point(positions[tri[1] as usize]);
            b = b.union_point(positions[tri[2] as usize]);
            bounds = bounds.union(&b);
            primitive_bounds.push(b);
        }

        let num_primitives = indices.len();
        let num_vertices = positions.len();
        let num_uvs = uvs.len();
        let mesh = MeshData {
            indices,
            positions,
            normals,
            uvs,
        };
        let serialized_len = mesh.bytes_len();

        Shape {
            id,
            num_primitives,
            num_vertices,
            num_uvs,
            bounds,
            primitive_bounds,
            data: RwLock::new(Some(mesh)),
            alloc: RwLock::new(None),
            resident: AtomicBool::new(true),
            serialized_len,
        }
    }

    pub fn num_primitives(&self) -> usize {
        self.num_primitives
    }

    pub fn get_bounds(&self) -> Bounds3 {
        self.bounds
    }

    pub fn get_primitive_bounds(&self, i: usize) -> Bounds3 {
        self.primitive_bounds[i]
    }

    pub fn intersect_primitive(&self, ray: &Ray, i: usize) -> Option<PrimitiveHit> {
        let data = self.data.read();
        let mesh = data.as_ref().expect("shape must be resident to intersect");
        let tri = mesh.indices[i];
        let p0 = mesh.positions[tri[0] as usize];
        let p1 = mesh.positions[tri[1] as usize];
        let p2 = mesh.positions[tri[2] as usize];

        let (t, u, v) = moller_trumbore(ray, p0, p1, p2)?;
        Some(PrimitiveHit {
            t,
            u,
            v,
            primitive_id: i as u32,
        })
    }

    /// Splits this shape's primitives into several standalone shapes, one
    /// per entry of `groups` (each a list of this shape's primitive
    /// indices). Used by the subscene partitioner (C5) to break a single
    /// oversized mesh into leaf-sized pieces before partitioning; each
    /// output shape owns a private, remapped copy of just the vertex data
    /// its primitives reference. `id_base` is the id assigned to
    /// `groups[0]`; subsequent groups get consecutive ids.
    pub fn split_by_primitive_groups(&self, id_base: u32, groups: &[Vec<usize>]) -> Vec<Shape> {
        let data = self.data.read();
        let mesh = data.as_ref().expect("shape must be resident to split");

        groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let mut indices = Vec::with_capacity(group.len());
                let mut positions = Vec::new();
                let mut normals = Vec::new();
                let mut uvs = Vec::new();
                let mut remap: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();

                for &prim in group {
                    let tri = mesh.indices[prim];
                    let mut new_tri = [0u32; 3];
                    for k in 0..3 {
                        let orig = tri[k];
                        let new_idx = *remap.entry(orig).or_insert_with(|| {
                            positions.push(mesh.positions[orig as usize]);
                            normals.push(mesh.normals[orig as usize]);
                            if !mesh.uvs.is_empty() {
                                uvs.push(mesh.uvs[orig as usize]);
                            }
                            (positions.len() - 1) as u32
                        });
                        new_tri[k] = new_idx;
                    }
                    indices.push(new_tri);
                }

                Shape::new(id_base + i as u32, indices, positions, normals, uvs)
            })
            .collect()
    }

    pub fn fill_surface_interaction(&self, ray: &Ray, hit: &PrimitiveHit) -> SurfaceInteraction {
        let data = self.data.read();
        let mesh = data.as_ref().expect("shape must be resident to shade");
        let tri = mesh.indices[hit.primitive_id as usize];
        let p0 = mesh.positions[tri[0] as usize];
        let p1 = mesh.positions[tri[1] as usize];
        let p2 = mesh.positions[tri[2] as usize];
        let n0 = mesh.normals[tri[0] as usize];
        let n1 = mesh.normals[tri[1] as usize];
        let n2 = mesh.normals[tri[2] as usize];

        let w = 1.0 - hit.u - hit.v;
        let normal = (n0 * w + n1 * hit.u + n2 * hit.v).normalize_or_zero();
        let geometric_normal = (p1 - p0).cross(p2 - p0).normalize_or_zero();
        let uv = if mesh.uvs.is_empty() {
            Vec2::new(hit.u, hit.v)
        } else {
            let uv0 = mesh.uvs[tri[0] as usize];
            let uv1 = mesh.uvs[tri[1] as usize];
            let uv2 = mesh.uvs[tri[2] as usize];
            uv0 * w + uv1 * hit.u + uv2 * hit.v
        };

        SurfaceInteraction {
            position: ray.at(hit.t),
            normal,
            geometric_normal,
            uv,
            wo: -ray.direction,
            primitive_id: hit.primitive_id,
            material_id: 0,
            area_light_id: None,
        }
    }
}

/// Standard watertight Möller–Trumbore ray-triangle intersection.
fn moller_trumbore(ray: &Ray, p0: Vec3, p1: Vec3, p2: Vec3) -> Option<(f32, f32, f32)> {
    const EPSILON: f32 = 1e-8;
    let edge1 = p1 - p0;
    let edge2 = p2 - p0;
    let h = ray.direction.cross(edge2);
    let a = edge1.dot(h);
    if a.abs() < EPSILON {
        return None;
    }
    let f = 1.0 / a;
    let s = ray.origin - p0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(edge1);
    let v = f * ray.direction.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * edge2.dot(q);
    if t > EPSILON && t < ray.t_max() {
        Some((t, u, v))
    } else {
        None
    }
}

impl Evictable for Shape {
    fn serialize(&self, serializer: &dyn Serializer) {
        let mesh_guard = self.data.read();
        let mesh = mesh_guard.as_ref().expect("serialize called before data is populated");

        let (alloc, ptr) = serializer.allocate_and_map(self.serialized_len);
        let mut cursor = ptr;
        unsafe {
            let n = mesh.indices.len() * std::mem::size_of::<[u32; 3]>();
            std::ptr::copy_nonoverlapping(mesh.indices.as_ptr() as *const u8, cursor, n);
            cursor = cursor.add(n);

            let n = mesh.positions.len() * std::mem::size_of::<Vec3>();
            std::ptr::copy_nonoverlapping(mesh.positions.as_ptr() as *const u8, cursor, n);
            cursor = cursor.add(n);

            let n = mesh.normals.len() * std::mem::size_of::<Vec3>();
            std::ptr::copy_nonoverlapping(mesh.normals.as_ptr() as *const u8, cursor, n);
            cursor = cursor.add(n);

            let n = mesh.uvs.len() * std::mem::size_of::<Vec2>();
            std::ptr::copy_nonoverlapping(mesh.uvs.as_ptr() as *const u8, cursor, n);
        }
        serializer.unmap_previous_allocations();

        *self.alloc.write() = Some(alloc);
        *self.data.write() = None;
        self.resident.store(false, Ordering::Release);
    }

    fn make_resident(&self, deserializer: &dyn Deserializer) {
        let alloc = self.alloc.read().expect("serialize must run before make_resident");
        let ptr = deserializer.map(alloc);

        let n_tris = self.num_primitives;
        let n_verts = self.num_vertices;
        let n_uvs = self.num_uvs;

        unsafe {
            let mut cursor = ptr;
            let indices = read_vec::<[u32; 3]>(cursor, n_tris);
            cursor = cursor.add(n_tris * std::mem::size_of::<[u32; 3]>());

            let positions = read_vec::<Vec3>(cursor, n_verts);
            cursor = cursor.add(n_verts * std::mem::size_of::<Vec3>());

            let normals = read_vec::<Vec3>(cursor, n_verts);
            cursor = cursor.add(n_verts * std::mem::size_of::<Vec3>());

            let uvs = read_vec::<Vec2>(cursor, n_uvs);

            *self.data.write() = Some(MeshData {
                indices,
                positions,
                normals,
                uvs,
            });
        }
        self.resident.store(true, Ordering::Release);
    }

    fn evict(&self) {
        *self.data.write() = None;
        self.resident.store(false, Ordering::Release);
    }

    fn size_bytes(&self) -> usize {
        if self.resident.load(Ordering::Acquire) {
            self.serialized_len
        } else {
            // Non-resident footprint: just the fixed per-primitive bounds
            // kept around so the BVH/partitioner can still query geometry
            // without paging the mesh back in.
            self.primitive_bounds.len() * std::mem::size_of::<Bounds3>()
        }
    }

    fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }
}

unsafe fn read_vec<T: Copy>(ptr: *const u8, count: usize) -> Vec<T> {
    let src = ptr as *const T;
    let mut v = Vec::with_capacity(count);
    std::ptr::copy_nonoverlapping(src, v.as_mut_ptr(), count);
    v.set_len(count);
    v
}
