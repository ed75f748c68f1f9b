//! Temporal wavefront planning
//!
//! When a region evaluates more than one time step, successive inner steps
//! must shift their spatial window backward so that a block only reads data
//! its predecessors have already produced. The shift per step and dimension
//! is the skew angle: the stencil halo rounded up to cluster granularity.
//! The rank window is extended on the high side so the shifted sweeps still
//! cover the whole domain.

use crate::context::StencilContext;
use data::{array4, fold::round_up, Coords, Idx};

/// Skew angle per dimension
///
/// A region that spans the whole bounding box along a dimension has no
/// spatial neighbor region to skew into, so its angle is zero there.
pub fn compute_angles(ctx: &StencilContext) -> Coords {
    let cpts = ctx.fold.cluster_pts();
    let bb_len = ctx.bb.len();
    array4(|d| {
        if ctx.region_size[d] < bb_len[d] {
            round_up(ctx.halo[d], cpts[d])
        } else {
            0
        }
    })
}

/// Number of backward shifts a full super-step performs
///
/// Each of the `num_groups` equation groups at each of the `region_time`
/// inner steps shifts once, except that the very first evaluation happens
/// unshifted. Assumes every later group depends on every earlier one.
pub fn num_shifts(num_groups: usize, region_time: Idx) -> Idx {
    num_groups as Idx * region_time - 1
}

/// High-side extension of the rank window that accommodates `nshifts`
/// backward shifts
pub fn extend_end(end: Coords, angles: Coords, nshifts: Idx) -> Coords {
    array4(|d| end[d] + angles[d] * nshifts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SizeConfig, StencilContext};
    use crate::group::BoundingBox;
    use data::fold::Fold;

    fn ctx_with_bb(region_size: Coords, halo: Coords, fold: Fold) -> StencilContext {
        let sizes = SizeConfig {
            rank_size: [1, 16, 16, 16],
            region_size,
            halo,
            ..SizeConfig::default()
        };
        let mut ctx = StencilContext::new("test", sizes, fold).unwrap();
        ctx.bb = BoundingBox {
            begin: [0; 4],
            end: [1, 16, 16, 16],
            size: 16 * 16 * 16,
            valid: true,
        };
        ctx
    }

    #[test]
    fn full_span_region_needs_no_skew() {
        let ctx = ctx_with_bb([1, 16, 16, 16], [0, 1, 1, 1], Fold::scalar());
        assert_eq!(compute_angles(&ctx), [0; 4]);
    }

    #[test]
    fn partial_region_skews_by_halo() {
        let ctx = ctx_with_bb([1, 8, 8, 16], [0, 1, 1, 1], Fold::scalar());
        assert_eq!(compute_angles(&ctx), [0, 1, 1, 0]);
    }

    #[test]
    fn angle_rounds_to_cluster() {
        let ctx = ctx_with_bb([1, 8, 8, 8], [0, 1, 1, 4], Fold::z_vec(4, 2));
        // Cluster is 8 points along z, so a halo of 4 skews by a whole
        // cluster there.
        assert_eq!(compute_angles(&ctx), [0, 1, 1, 8]);
    }

    #[test]
    fn shift_count_is_fully_cross_group() {
        assert_eq!(num_shifts(1, 1), 0);
        assert_eq!(num_shifts(1, 2), 1);
        assert_eq!(num_shifts(3, 2), 5);
    }

    #[test]
    fn window_extends_on_high_side_only() {
        let end = extend_end([1, 16, 16, 16], [0, 1, 1, 0], 3);
        assert_eq!(end, [1, 19, 19, 16]);
    }
}
