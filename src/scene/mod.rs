//! The in-memory scene graph (spec.md §3, §9 Design Note): an arena of
//! `SceneNode`s, edges addressed by index, an optional 4×4 transform per
//! edge. Kept entirely resident — it is orders of magnitude smaller than
//! the geometry it references, which is what actually gets paged through
//! the residency cache (grounded in `pandora/graphics_core/scene.h`'s
//! `SceneNode`/`Scene` split between a tiny always-resident graph and
//! heavyweight `Shape`s reached through it).

pub mod partition;
pub mod shape;

use std::sync::Arc;

use glam::Mat4;

use crate::math::Bounds3;
pub use shape::Shape;

/// Index into a `Scene`'s node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// A single instance of a shape within the graph: the shape plus the
/// material/area-light it's bound to at this occurrence (opaque IDs per
/// SPEC_FULL.md §3.1 — shading and light sampling are out of scope here).
#[derive(Clone)]
pub struct SceneObject {
    pub shape: Arc<Shape>,
    pub material_id: u32,
    pub area_light_id: Option<u32>,
}

/// An edge from a parent node to a child node, with an optional transform.
/// `None` means identity — kept distinct so instancing code can tell
/// "no transform was ever applied" from "an identity transform was applied",
/// which matters when hashing for SVDAG/BVH dedup.
#[derive(Clone, Copy)]
pub struct Edge {
    pub child: NodeId,
    pub transform: Option<Mat4>,
}

#[derive(Clone, Default)]
pub struct SceneNode {
    pub objects: Vec<SceneObject>,
    pub children: Vec<Edge>,
}

/// The scene graph: an arena of nodes reached from `root`. Shapes are
/// reference-counted (`Arc<Shape>`) so the same mesh can be instanced under
/// many nodes with different transforms without duplicating geometry.
pub struct Scene {
    nodes: Vec<SceneNode>,
    root: NodeId,
}

impl Scene {
    pub fn node(&self, id: NodeId) -> &SceneNode {
        &self.nodes[id.0 as usize]
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// World-space bounds of the subtree rooted at `id`, recursing through
    /// child transforms. Mirrors `SceneNode::computeBounds` in the original.
    pub fn compute_bounds(&self, id: NodeId) -> Bounds3 {
        let node = self.node(id);
        let mut bounds = Bounds3::empty();
        for obj in &node.objects {
            bounds = bounds.union(&obj.shape.get_bounds());
        }
        for edge in &node.children {
            let mut child_bounds = self.compute_bounds(edge.child);
            if let Some(transform) = edge.transform {
                child_bounds = transform_bounds(&child_bounds, &transform);
            }
            bounds = bounds.union(&child_bounds);
        }
        bounds
    }

    /// Total primitive count counting every instance separately (what a ray
    /// tracer actually has to be able to intersect).
    pub fn count_instanced_primitives(&self) -> usize {
        self.count_instanced_from(self.root)
    }

    fn count_instanced_from(&self, id: NodeId) -> usize {
        let node = self.node(id);
        let mut count: usize = node.objects.iter().map(|o| o.shape.num_primitives()).sum();
        for edge in &node.children {
            count += self.count_instanced_from(edge.child);
        }
        count
    }

    /// Total primitive count counting each distinct `Shape` once, regardless
    /// of how many times it's instanced (what has to actually live in the
    /// residency cache at once, in the worst case).
    pub fn count_unique_primitives(&self) -> usize {
        let mut seen = ahash::AHashSet::new();
        let mut count = 0usize;
        self.count_unique_from(self.root, &mut seen, &mut count);
        count
    }

    fn count_unique_from(&self, id: NodeId, seen: &mut ahash::AHashSet<u32>, count: &mut usize) {
        let node = self.node(id);
        for obj in &node.objects {
            if seen.insert(obj.shape.id) {
                *count += obj.shape.num_primitives();
            }
        }
        for edge in &node.children {
            self.count_unique_from(edge.child, seen, count);
        }
    }

    /// Walks every (shape, world transform) occurrence in the graph. Used by
    /// the subscene partitioner (C5) to flatten the graph into a primitive
    /// list without caring about graph structure afterward.
    pub fn for_each_instance(&self, mut visit: impl FnMut(&SceneObject, Mat4)) {
        self.walk(self.root, Mat4::IDENTITY, &mut visit);
    }

    /// Like [`Scene::for_each_instance`] but starting from an arbitrary node
    /// with a caller-supplied base transform, used by the partitioner to
    /// flatten one child subtree at a time.
    pub fn for_each_instance_from(&self, node: NodeId, base_transform: Mat4, mut visit: impl FnMut(&SceneObject, Mat4)) {
        self.walk(node, base_transform, &mut visit);
    }

    fn walk(&self, id: NodeId, transform: Mat4, visit: &mut impl FnMut(&SceneObject, Mat4)) {
        let node = self.node(id);
        for obj in &node.objects {
            visit(obj, transform);
        }
        for edge in &node.children {
            let child_transform = match edge.transform {
                Some(t) => transform * t,
                None => transform,
            };
            self.walk(edge.child, child_transform, visit);
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

/// Incrementally builds a `Scene`'s node arena. Mirrors `SceneBuilder` in
/// the original: nodes/objects are added by index, transforms attached per
/// edge, and `build()` freezes the graph.
#[derive(Default)]
pub struct SceneBuilder {
    nodes: Vec<SceneNode>,
}

impl SceneBuilder {
    pub fn new() -> Self {
        SceneBuilder {
            nodes: vec![SceneNode::default()],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn add_node(&mut self) -> NodeId {
        self.nodes.push(SceneNode::default());
        NodeId((self.nodes.len() - 1) as u32)
    }

    pub fn add_object(&mut self, node: NodeId, object: SceneObject) {
        self.nodes[node.0 as usize].objects.push(object);
    }

    pub fn attach(&mut self, parent: NodeId, child: NodeId, transform: Option<Mat4>) {
        self.nodes[parent.0 as usize]
            .children
            .push(Edge { child, transform });
    }

    pub fn build(self) -> Scene {
        Scene {
            nodes: self.nodes,
            root: NodeId(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_triangle_shape(id: u32) -> Arc<Shape> {
        Arc::new(Shape::new(
            id,
            vec![[0, 1, 2]],
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![Vec3::Z, Vec3::Z, Vec3::Z],
            vec![],
        ))
    }

    #[test]
    fn instancing_counts_primitives_per_occurrence_but_not_per_unique_shape() {
        let mut builder = SceneBuilder::new();
        let shape = unit_triangle_shape(0);
        let child = builder.add_node();
        builder.add_object(
            child,
            SceneObject {
                shape: shape.clone(),
                material_id: 0,
                area_light_id: None,
            },
        );
        // Instance the same node 8 times under root with distinct transforms.
        for i in 0..8 {
            let t = Mat4::from_translation(Vec3::new(i as f32, 0.0, 0.0));
            builder.attach(builder.root(), child, Some(t));
        }
        let scene = builder.build();

        assert_eq!(scene.count_instanced_primitives(), 8);
        assert_eq!(scene.count_unique_primitives(), 1);
    }

    #[test]
    fn bounds_follow_edge_transforms() {
        let mut builder = SceneBuilder::new();
        let shape = unit_triangle_shape(0);
        let child = builder.add_node();
        builder.add_object(
            child,
            SceneObject {
                shape,
                material_id: 0,
                area_light_id: None,
            },
        );
        builder.attach(
            builder.root(),
            child,
            Some(Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0))),
        );
        let scene = builder.build();
        let bounds = scene.compute_bounds(scene.root());
        assert!(bounds.min.x >= 9.999 && bounds.max.x <= 11.001);
    }

    #[test]
    fn for_each_instance_visits_every_occurrence_with_composed_transform() {
        let mut builder = SceneBuilder::new();
        let shape = unit_triangle_shape(0);
        let child = builder.add_node();
        builder.add_object(
            child,
            SceneObject {
                shape,
                material_id: 0,
                area_light_id: None,
            },
        );
        let middle = builder.add_node();
        builder.attach(middle, child, Some(Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))));
        builder.attach(
            builder.root(),
            middle,
            Some(Mat4::from_translation(Vec3::new(5.0, 0.0, 0.0))),
        );
        let scene = builder.build();

        let mut visits = Vec::new();
        scene.for_each_instance(|_obj, transform| visits.push(transform));
        assert_eq!(visits.len(), 1);
        let translated = visits[0].transform_point3(Vec3::ZERO);
        assert!((translated.x - 6.0).abs() < 1e-5);
    }
}
