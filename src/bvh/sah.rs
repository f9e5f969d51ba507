//! A single generic surface-area-heuristic BVH builder shared by the
//! subscene partitioner (C5), the per-subscene bottom-level BVH (C6), and
//! the top-level pauseable BVH (C8) — SPEC_FULL.md §4.5 calls out that all
//! three should share one builder rather than reimplementing binned SAH
//! three times. Operates purely over `(bounds, weight)` pairs so callers
//! can reorder their own leaf payloads (primitives, subscenes, scene-graph
//! items) to match `ordered_indices` afterward.

use crate::math::Bounds3;

const NUM_BUCKETS: usize = 12;

#[derive(Debug, Clone, Copy)]
pub enum SahNodeKind {
    Leaf { start: u32, count: u32 },
    Interior { left: u32, right: u32, axis: u8 },
}

#[derive(Debug, Clone, Copy)]
pub struct SahNode {
    pub bounds: Bounds3,
    pub kind: SahNodeKind,
}

pub struct SahBuildResult {
    /// Flattened node array, built bottom-up: children always precede their
    /// parent, so `root` is the last index, not necessarily `0`.
    pub nodes: Vec<SahNode>,
    /// Index of the root node within `nodes`.
    pub root: u32,
    /// `ordered_indices[i]` is the original item index now at leaf slot `i`.
    /// A leaf's `start..start+count` range indexes into this array.
    pub ordered_indices: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Bucket {
    count: usize,
    bounds: Bounds3,
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket {
            count: 0,
            bounds: Bounds3::empty(),
        }
    }
}

/// Builds a SAH-greedy binary BVH over `item_bounds`/`item_weights` (equal
/// length; weight is typically a primitive count used for the partitioner's
/// budget decisions, or simply `1` per item for plain spatial BVHs).
/// `max_leaf_weight` bounds the summed weight of any leaf.
pub fn build(item_bounds: &[Bounds3], item_weights: &[usize], max_leaf_weight: usize) -> SahBuildResult {
    assert_eq!(item_bounds.len(), item_weights.len());

    let mut indices: Vec<usize> = (0..item_bounds.len()).collect();
    let mut nodes = Vec::new();

    if indices.is_empty() {
        nodes.push(SahNode {
            bounds: Bounds3::empty(),
            kind: SahNodeKind::Leaf { start: 0, count: 0 },
        });
        return SahBuildResult {
            nodes,
            root: 0,
            ordered_indices: Vec::new(),
        };
    }

    let mut ordered = Vec::with_capacity(indices.len());
    let root = build_recursive(
        item_bounds,
        item_weights,
        &mut indices,
        max_leaf_weight,
        &mut nodes,
        &mut ordered,
    );

    SahBuildResult {
        nodes,
        root,
        ordered_indices: ordered,
    }
}

/// Returns the index of the node just pushed.
fn build_recursive(
    item_bounds: &[Bounds3],
    item_weights: &[usize],
    indices: &mut [usize],
    max_leaf_weight: usize,
    nodes: &mut Vec<SahNode>,
    ordered: &mut Vec<usize>,
) -> u32 {
    let mut node_bounds = Bounds3::empty();
    let mut centroid_bounds = Bounds3::empty();
    let mut total_weight = 0usize;
    for &i in indices.iter() {
        node_bounds = node_bounds.union(&item_bounds[i]);
        centroid_bounds = centroid_bounds.union_point(item_bounds[i].centroid());
        total_weight += item_weights[i];
    }

    let make_leaf = |ordered: &mut Vec<usize>, indices: &[usize]| -> SahNodeKind {
        let start = ordered.len() as u32;
        ordered.extend_from_slice(indices);
        SahNodeKind::Leaf {
            start,
            count: indices.len() as u32,
        }
    };

    if indices.len() == 1 || total_weight <= max_leaf_weight {
        let kind = make_leaf(ordered, indices);
        nodes.push(SahNode {
            bounds: node_bounds,
            kind,
        });
        return (nodes.len() - 1) as u32;
    }

    let axis = centroid_bounds.max_extent_axis();
    let extent = centroid_bounds.diagonal()[axis];

    if extent <= 0.0 {
        // All centroids coincide on this axis: splitting further can't help,
        // fall back to a leaf to guarantee termination.
        let kind = make_leaf(ordered, indices);
        nodes.push(SahNode {
            bounds: node_bounds,
            kind,
        });
        return (nodes.len() - 1) as u32;
    }

    let mut buckets = [Bucket::default(); NUM_BUCKETS];
    let bucket_of = |i: usize| -> usize {
        let offset = (item_bounds[i].centroid()[axis] - centroid_bounds.min[axis]) / extent;
        ((offset * NUM_BUCKETS as f32) as usize).min(NUM_BUCKETS - 1)
    };
    for &i in indices.iter() {
        let b = bucket_of(i);
        buckets[b].count += 1;
        buckets[b].bounds = buckets[b].bounds.union(&item_bounds[i]);
    }

    // Cost of splitting after bucket `b` (buckets 0..=b go left).
    let mut best_cost = f32::INFINITY;
    let mut best_split = 0usize;
    for split in 0..NUM_BUCKETS - 1 {
        let mut left_bounds = Bounds3::empty();
        let mut left_count = 0usize;
        for b in &buckets[..=split] {
            left_bounds = left_bounds.union(&b.bounds);
            left_count += b.count;
        }
        let mut right_bounds = Bounds3::empty();
        let mut right_count = 0usize;
        for b in &buckets[split + 1..] {
            right_bounds = right_bounds.union(&b.bounds);
            right_count += b.count;
        }
        if left_count == 0 || right_count == 0 {
            continue;
        }
        let cost = left_bounds.surface_area() * left_count as f32
            + right_bounds.surface_area() * right_count as f32;
        if cost < best_cost {
            best_cost = cost;
            best_split = split;
        }
    }

    if best_cost.is_infinite() {
        // Every item landed in one bucket (degenerate distribution); split
        // the index list in half by position instead of failing to split.
        let mid = indices.len() / 2;
        indices.select_nth_unstable_by(mid, |&a, &b| {
            item_bounds[a].centroid()[axis]
                .partial_cmp(&item_bounds[b].centroid()[axis])
                .unwrap()
        });
        return build_interior(
            item_bounds,
            item_weights,
            indices,
            mid,
            axis,
            node_bounds,
            max_leaf_weight,
            nodes,
            ordered,
        );
    }

    let mid = partition_by_bucket(indices, &bucket_of, best_split);
    build_interior(
        item_bounds,
        item_weights,
        indices,
        mid,
        axis,
        node_bounds,
        max_leaf_weight,
        nodes,
        ordered,
    )
}

fn partition_by_bucket(indices: &mut [usize], bucket_of: &impl Fn(usize) -> usize, split: usize) -> usize {
    let (mut lo, mut hi) = (0usize, indices.len());
    while lo < hi {
        if bucket_of(indices[lo]) <= split {
            lo += 1;
        } else {
            hi -= 1;
            indices.swap(lo, hi);
        }
    }
    lo.max(1).min(indices.len() - 1)
}

#[allow(clippy::too_many_arguments)]
fn build_interior(
    item_bounds: &[Bounds3],
    item_weights: &[usize],
    indices: &mut [usize],
    mid: usize,
    axis: usize,
    node_bounds: Bounds3,
    max_leaf_weight: usize,
    nodes: &mut Vec<SahNode>,
    ordered: &mut Vec<usize>,
) -> u32 {
    let (left_indices, right_indices) = indices.split_at_mut(mid);
    let left = build_recursive(item_bounds, item_weights, left_indices, max_leaf_weight, nodes, ordered);
    let right = build_recursive(item_bounds, item_weights, right_indices, max_leaf_weight, nodes, ordered);
    nodes.push(SahNode {
        bounds: node_bounds,
        kind: SahNodeKind::Interior {
            left,
            right,
            axis: axis as u8,
        },
    });
    (nodes.len() - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn bounds_at(x: f32) -> Bounds3 {
        Bounds3 {
            min: Vec3::new(x, 0.0, 0.0),
            max: Vec3::new(x + 1.0, 1.0, 1.0),
        }
    }

    #[test]
    fn single_item_is_one_leaf() {
        let bounds = vec![bounds_at(0.0)];
        let weights = vec![4usize];
        let result = build(&bounds, &weights, 100);
        assert_eq!(result.ordered_indices, vec![0]);
        assert!(matches!(result.nodes[0].kind, SahNodeKind::Leaf { count: 1, .. }));
    }

    #[test]
    fn every_leaf_respects_the_weight_budget() {
        let bounds: Vec<Bounds3> = (0..64).map(|i| bounds_at(i as f32 * 2.0)).collect();
        let weights: Vec<usize> = vec![1; 64];
        let result = build(&bounds, &weights, 8);

        for node in &result.nodes {
            if let SahNodeKind::Leaf { count, .. } = node.kind {
                assert!(count as usize <= 8, "leaf exceeded weight budget: {count}");
            }
        }
    }

    #[test]
    fn ordered_indices_is_a_permutation_of_all_items() {
        let bounds: Vec<Bounds3> = (0..20).map(|i| bounds_at(i as f32)).collect();
        let weights: Vec<usize> = vec![1; 20];
        let result = build(&bounds, &weights, 4);

        let mut sorted = result.ordered_indices.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn root_bounds_contain_every_item() {
        let bounds: Vec<Bounds3> = (0..10).map(|i| bounds_at(i as f32 * 3.0)).collect();
        let weights: Vec<usize> = vec![1; 10];
        let result = build(&bounds, &weights, 3);
        let root = &result.nodes[result.root as usize];
        for b in &bounds {
            assert!(root.bounds.min.x <= b.min.x && root.bounds.max.x >= b.max.x);
        }
    }
}
