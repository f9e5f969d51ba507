//! Top-level pauseable BVH over batching points (C8). Traversal never blocks
//! a worker thread: reaching a leaf suspends the walk and hands the caller
//! an opaque handle (a value, not a stack frame) to resume from later, once
//! the leaf's subscene has been processed by C4/C9 (spec.md §4.8).
//!
//! The spec calls for a 4-wide SIMD node layout; we build the same shared
//! binary `sah` tree used by C5/C6 instead (DESIGN.md records this as an
//! Open Question resolution) — the pause/resume contract is unaffected
//! either way, since suspension happens at leaves regardless of node arity.

use crate::bvh::sah::{self, SahNodeKind};
use crate::math::{Bounds3, Ray};

/// Resume point for a paused traversal: the DFS stack of not-yet-visited
/// sibling subtrees, plus whether any leaf processed so far actually
/// recorded a hit. Tracked explicitly rather than inferred from
/// `ray.t_max()`'s finiteness, since a caller is free to start a query
/// with an already-finite `t_max` (e.g. a shadow ray's distance-to-light)
/// with no hit ever having been found.
#[derive(Debug, Clone)]
pub struct PauseableInsertHandle {
    stack: Vec<u32>,
    hit_found: bool,
}

#[derive(Debug)]
pub enum TraversalOutcome {
    /// Traversal exited the tree and some leaf along the way reported a hit.
    Hit,
    /// Traversal exited the tree and no leaf ever reported a hit.
    Miss,
    /// Ray must wait on subscene `leaf_index`; `handle` resumes traversal
    /// once that subscene has been tested.
    Paused {
        handle: PauseableInsertHandle,
        leaf_index: u32,
    },
}

pub struct PauseableBvh {
    nodes: Vec<sah::SahNode>,
    /// Maps a leaf's `start` index to the original subscene index.
    ordered_subscene_indices: Vec<usize>,
    root: u32,
}

impl PauseableBvh {
    /// Builds the top-level tree over one bounds value per subscene. Every
    /// leaf holds exactly one subscene (weight-1 items, leaf budget 1).
    pub fn build(subscene_bounds: &[Bounds3]) -> Self {
        let weights = vec![1usize; subscene_bounds.len()];
        let build = sah::build(subscene_bounds, &weights, 1);
        PauseableBvh {
            nodes: build.nodes,
            ordered_subscene_indices: build.ordered_indices,
            root: build.root,
        }
    }

    pub fn subscene_count(&self) -> usize {
        self.ordered_subscene_indices.len()
    }

    /// Starts or resumes traversal. Pass `None` to start fresh, or the
    /// handle returned by a prior `Paused` outcome to continue.
    /// `hit_found_since_pause` tells the traversal whether the leaf it was
    /// paused at actually recorded a hit; it is folded into the handle so
    /// the `Hit`/`Miss` decision at drain time reflects every leaf visited
    /// so far rather than just the most recent one.
    pub fn intersect(
        &self,
        ray: &Ray,
        handle: Option<PauseableInsertHandle>,
        hit_found_since_pause: bool,
    ) -> TraversalOutcome {
        let (mut stack, hit_found) = match handle {
            Some(h) => (h.stack, h.hit_found || hit_found_since_pause),
            None => (vec![self.root], hit_found_since_pause),
        };

        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx as usize];
            if node.bounds.intersect_ray(ray).is_none() {
                continue;
            }
            match node.kind {
                SahNodeKind::Leaf { start, count } => {
                    debug_assert_eq!(count, 1, "top-level leaves hold exactly one subscene");
                    let subscene_index = self.ordered_subscene_indices[start as usize];
                    return TraversalOutcome::Paused {
                        handle: PauseableInsertHandle { stack, hit_found },
                        leaf_index: subscene_index as u32,
                    };
                }
                SahNodeKind::Interior { left, right, .. } => {
                    // Push far child first so the near child (by whichever
                    // axis the SAH split chose) is visited first on pop.
                    stack.push(right);
                    stack.push(left);
                }
            }
        }

        if hit_found {
            TraversalOutcome::Hit
        } else {
            TraversalOutcome::Miss
        }
    }
}
