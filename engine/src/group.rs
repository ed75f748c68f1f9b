//! Equation groups and their bounding boxes
//!
//! An equation group is one set of update rules applied together at every
//! time step. The engine drives groups through the [`EqGroup`] capability
//! trait and keeps the per-group state it owns (the bounding box) next to
//! the kernel in an [`EqGroupSlot`].

use crate::context::StencilContext;
use crate::error::{EngineError, Result};
use data::{array4, layout::Layout4321, volume, Coords, Idx, DIM_NAMES, NUM_DIMS};
use rayon::prelude::*;

/// Identity of a grid within its owning context
pub type GridId = usize;

/// Capability set of one equation group
///
/// Implementations come from per-problem bindings (in real deployments,
/// generated code). The engine never looks inside an update rule; it only
/// needs the group's domain predicate, its written-grid list, and the
/// scalar/cluster evaluation entry points.
pub trait EqGroup: Send + Sync {
    fn name(&self) -> &str;

    /// Estimated floating-point operations per point update
    fn scalar_fp_ops(&self) -> usize;

    /// Number of grid writes per point update
    fn scalar_points_updated(&self) -> usize;

    /// Grids written by this group, in a rank-invariant order
    fn eq_grids(&self) -> &[GridId];

    /// Whether this group updates the point `c` at time `t`
    fn is_in_valid_domain(&self, ctx: &StencilContext, t: Idx, c: Coords) -> bool;

    /// Evaluate one point with scalar code
    fn calc_scalar(&self, ctx: &StencilContext, t: Idx, c: Coords);

    /// Evaluate one fully unrolled cluster whose first vector sits at the
    /// normalized vector coordinate `vec_begin`
    fn calc_cluster(&self, ctx: &StencilContext, t: Idx, vec_begin: Coords);

    /// Warm L1 for the cluster at `vec_begin`; no-op by default
    fn prefetch_l1_cluster(&self, _ctx: &StencilContext, _t: Idx, _vec_begin: Coords) {}

    /// Warm L2 for the cluster at `vec_begin`; no-op by default
    fn prefetch_l2_cluster(&self, _ctx: &StencilContext, _t: Idx, _vec_begin: Coords) {}

    /// Warm L1 for the leading edge of a sweep along dimension `dim`
    fn prefetch_l1_cluster_edge(
        &self,
        _ctx: &StencilContext,
        _t: Idx,
        _vec_begin: Coords,
        _dim: usize,
    ) {
    }

    /// Warm L2 for the leading edge of a sweep along dimension `dim`
    fn prefetch_l2_cluster_edge(
        &self,
        _ctx: &StencilContext,
        _t: Idx,
        _vec_begin: Coords,
        _dim: usize,
    ) {
    }
}

/// Minimum enclosing rectangle of the points a group updates
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BoundingBox {
    pub begin: Coords,
    pub end: Coords,

    /// Number of points the domain predicate actually selected
    pub size: Idx,

    pub valid: bool,
}
//
impl BoundingBox {
    /// Length along each dimension
    pub fn len(&self) -> Coords {
        array4(|d| self.end[d] - self.begin[d])
    }

    /// Volume of the enclosing rectangle (equals `size` for valid boxes)
    pub fn rect_volume(&self) -> Idx {
        volume(self.len())
    }

    /// Axis-aligned union; sizes add up as every point belongs to one group
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            begin: array4(|d| self.begin[d].min(other.begin[d])),
            end: array4(|d| self.end[d].max(other.end[d])),
            size: self.size + other.size,
            valid: true,
        }
    }
}

/// An equation group plus the engine-owned state attached to it
pub struct EqGroupSlot {
    pub kernel: Box<dyn EqGroup>,
    pub bb: BoundingBox,
}
//
impl EqGroupSlot {
    pub fn new(kernel: Box<dyn EqGroup>) -> Self {
        Self {
            kernel,
            bb: BoundingBox::default(),
        }
    }

    /// Discover and validate this group's bounding box
    ///
    /// Scans the whole rank domain at `t = 0` (boxes are assumed identical
    /// across time steps), keeping the min/max corner and the point count.
    /// Rejects predicates whose point set is not a solid rectangle and
    /// rectangles that are not whole multiples of the cluster size.
    pub fn find_bounding_box(&mut self, ctx: &StencilContext) -> Result<()> {
        if self.bb.valid {
            return Ok(());
        }
        let kernel = &*self.kernel;
        let layout = Layout4321::new(ctx.rank_size);
        let acc = (0..layout.size())
            .into_par_iter()
            .fold(PointAcc::empty, |acc, i| {
                let c = layout.unlayout(i);
                if kernel.is_in_valid_domain(ctx, 0, c) {
                    acc.with_point(c)
                } else {
                    acc
                }
            })
            .reduce(PointAcc::empty, PointAcc::merge);

        let bb = if acc.count == 0 {
            BoundingBox {
                valid: true,
                ..BoundingBox::default()
            }
        } else {
            BoundingBox {
                begin: acc.min,
                end: array4(|d| acc.max[d] + 1),
                size: acc.count,
                valid: true,
            }
        };

        if bb.rect_volume() != bb.size {
            return Err(EngineError::NonRectangularDomain {
                group: kernel.name().to_owned(),
                points: bb.size,
                expected: bb.rect_volume(),
            });
        }
        let cpts = ctx.fold.cluster_pts();
        let len = bb.len();
        for d in 0..NUM_DIMS {
            if len[d] % cpts[d] != 0 {
                return Err(EngineError::PartialCluster {
                    group: kernel.name().to_owned(),
                    dim: DIM_NAMES[d],
                    len: len[d],
                    cluster: cpts[d],
                });
            }
        }
        self.bb = bb;
        Ok(())
    }
}

/// Parallel reduction state for the bounding-box scan
#[derive(Copy, Clone)]
struct PointAcc {
    min: Coords,
    max: Coords,
    count: Idx,
}
//
impl PointAcc {
    fn empty() -> Self {
        Self {
            min: [Idx::MAX; NUM_DIMS],
            max: [Idx::MIN; NUM_DIMS],
            count: 0,
        }
    }

    fn with_point(mut self, c: Coords) -> Self {
        for d in 0..NUM_DIMS {
            self.min[d] = self.min[d].min(c[d]);
            self.max[d] = self.max[d].max(c[d]);
        }
        self.count += 1;
        self
    }

    fn merge(a: Self, b: Self) -> Self {
        if a.count == 0 {
            return b;
        }
        if b.count == 0 {
            return a;
        }
        Self {
            min: array4(|d| a.min[d].min(b.min[d])),
            max: array4(|d| a.max[d].max(b.max[d])),
            count: a.count + b.count,
        }
    }
}
