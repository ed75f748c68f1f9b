//! Hierarchical loop driver
//!
//! [`EquationSet`] evaluates an ordered list of equation groups over a
//! rank's domain, either with straightforward scalar code
//! ([`EquationSet::calc_rank_ref`]) or through the tiled hierarchy
//! ([`EquationSet::calc_rank_opt`]): time super-steps over regions, regions
//! over parallel blocks, blocks over fully unrolled SIMD clusters, with
//! temporal wavefront skewing inside each region.

use crate::context::StencilContext;
use crate::error::{EngineError, Result};
use crate::group::{EqGroup, EqGroupSlot};
use crate::tiling::{num_steps, Tile, TileSpan};
use crate::{halo, wavefront};
use data::{array4, layout::Layout4321, Coords, Idx, NUM_DIMS};
use log::{info, trace};
use rayon::prelude::*;

/// Work totals discovered at init, for the driver's throughput report
#[derive(Copy, Clone, Debug, Default)]
pub struct InitStats {
    /// Grid point updates per evaluated time step
    pub points_updated: Idx,

    /// Estimated floating-point operations per evaluated time step
    pub fp_ops: Idx,
}

/// Ordered collection of the equation groups of one problem
pub struct EquationSet {
    pub name: String,
    pub groups: Vec<EqGroupSlot>,
}
//
impl EquationSet {
    pub fn new(name: impl Into<String>, kernels: Vec<Box<dyn EqGroup>>) -> Self {
        Self {
            name: name.into(),
            groups: kernels.into_iter().map(EqGroupSlot::new).collect(),
        }
    }

    /// Discover bounding boxes and report per-group work statistics
    ///
    /// Idempotent: later calls return the same totals without re-scanning.
    pub fn init(&mut self, ctx: &mut StencilContext) -> Result<InitStats> {
        self.find_bounding_boxes(ctx)?;
        let mut stats = InitStats::default();
        for slot in &self.groups {
            let updates_point = slot.kernel.scalar_points_updated() as Idx;
            let fp_ops_point = slot.kernel.scalar_fp_ops() as Idx;
            let updates_domain = updates_point * slot.bb.size;
            let fp_ops_domain = fp_ops_point * slot.bb.size;
            let len = slot.bb.len();
            info!(
                "equation-group '{}': sub-domain {}x{}x{}x{}, {} points, \
                 {} updates and ~{} FP ops per step",
                slot.kernel.name(),
                len[0],
                len[1],
                len[2],
                len[3],
                slot.bb.size,
                updates_domain,
                fp_ops_domain
            );
            stats.points_updated += updates_domain;
            stats.fp_ops += fp_ops_domain;
        }
        Ok(stats)
    }

    /// Discover every group's bounding box and their rank-wide union
    ///
    /// Also replaces "whole domain" default region sizes by the rank
    /// bounding-box lengths.
    pub fn find_bounding_boxes(&mut self, ctx: &mut StencilContext) -> Result<()> {
        if ctx.bb.valid {
            return Ok(());
        }
        for slot in &mut self.groups {
            slot.find_bounding_box(&*ctx)?;
        }
        let mut union: Option<crate::group::BoundingBox> = None;
        for slot in &self.groups {
            union = Some(match union {
                None => slot.bb,
                Some(bb) => bb.union(&slot.bb),
            });
        }
        ctx.bb = union.unwrap_or_default();
        ctx.bb.valid = true;

        let bb_len = ctx.bb.len();
        for d in 0..NUM_DIMS {
            if ctx.region_size[d] == ctx.rank_size[d] {
                ctx.region_size[d] = bb_len[d];
            }
        }
        Ok(())
    }

    /// Evaluate all groups over the full time window with scalar code
    ///
    /// The reference implementation: no tiling, no vectors, no wavefront;
    /// every point of each group's bounding box is tested against the domain
    /// predicate and updated in place.
    pub fn calc_rank_ref(&mut self, ctx: &mut StencilContext) -> Result<()> {
        self.init(ctx)?;
        let begin_dt = ctx.begin_dt;
        let end_dt = begin_dt + ctx.dt;
        trace!("calc_rank_ref({begin_dt}..{end_dt})");

        for t in begin_dt..end_dt {
            for gi in 0..self.groups.len() {
                halo::exchange_halos(ctx, &*self.groups[gi].kernel, t, t + 1)?;

                let slot = &self.groups[gi];
                let kernel = &*slot.kernel;
                let bb = slot.bb;
                if bb.size == 0 {
                    continue;
                }
                let shape = Layout4321::new(bb.len());
                let ctx = &*ctx;
                (0..shape.size()).into_par_iter().for_each(|i| {
                    let rel = shape.unlayout(i);
                    let c = array4(|d| bb.begin[d] + rel[d]);
                    // The predicate is redundant for rectangular boxes but
                    // kept to match what the group actually declared.
                    if kernel.is_in_valid_domain(ctx, t, c) {
                        kernel.calc_scalar(ctx, t, c);
                    }
                });
            }
        }
        Ok(())
    }

    /// Evaluate all groups over the full time window through the tiled
    /// hierarchy
    pub fn calc_rank_opt(&mut self, ctx: &mut StencilContext) -> Result<()> {
        self.init(ctx)?;
        if self.groups.is_empty() {
            return Ok(());
        }
        let begin_dt = ctx.begin_dt;
        let end_dt = begin_dt + ctx.dt;
        let step_dt = ctx.region_time;
        trace!("calc_rank_opt({begin_dt}..{end_dt} by {step_dt})");

        ctx.angles = wavefront::compute_angles(ctx);
        trace!("wavefront angles: {:?}", ctx.angles);

        // Extend the sweep window so overlapping regions still cover the
        // whole domain after all backward shifts of one super-step.
        let nshifts = wavefront::num_shifts(self.groups.len(), ctx.region_time);
        let begin_d = ctx.bb.begin;
        let end_d = wavefront::extend_end(ctx.bb.end, ctx.angles, nshifts);
        trace!("extended rank window: {begin_d:?}..{end_d:?}");

        let num_dt = num_steps(begin_dt, end_dt, step_dt);
        for index_dt in 0..num_dt {
            let start_dt = begin_dt + index_dt * step_dt;
            let stop_dt = (start_dt + step_dt).min(end_dt);

            if step_dt == 1 {
                // One time step per region: exchange and evaluate one group
                // at a time.
                for gi in 0..self.groups.len() {
                    halo::exchange_halos(ctx, &*self.groups[gi].kernel, start_dt, stop_dt)?;
                    self.sweep_regions(ctx, &[gi], start_dt, stop_dt, begin_d, end_d)?;
                }
            } else {
                // Temporal wavefront: all halos first, then every group is
                // evaluated inside each region pass.
                for gi in 0..self.groups.len() {
                    halo::exchange_halos(ctx, &*self.groups[gi].kernel, start_dt, stop_dt)?;
                }
                let all: Vec<usize> = (0..self.groups.len()).collect();
                self.sweep_regions(ctx, &all, start_dt, stop_dt, begin_d, end_d)?;
            }
        }
        Ok(())
    }

    /// Run `calc_region` for every region tile of the extended rank window
    fn sweep_regions(
        &self,
        ctx: &StencilContext,
        sel: &[usize],
        start_dt: Idx,
        stop_dt: Idx,
        begin_d: Coords,
        end_d: Coords,
    ) -> Result<()> {
        for region in TileSpan::new(begin_d, end_d, ctx.region_size).tiles() {
            self.calc_region(ctx, sel, start_dt, stop_dt, region)?;
        }
        Ok(())
    }

    /// Evaluate the selected groups over one region
    ///
    /// Walks the inner time steps; for each step and group, clips the region
    /// window to the group's bounding box, runs the parallel block sweep on
    /// the clip if it is non-empty, then shifts the window backward by the
    /// skew angles. An empty clip does not end the time loop: a shifted
    /// window may re-enter the box at a later step.
    fn calc_region(
        &self,
        ctx: &StencilContext,
        sel: &[usize],
        start_dt: Idx,
        stop_dt: Idx,
        region: Tile,
    ) -> Result<()> {
        trace!(
            "calc_region({start_dt}..{stop_dt}, {:?}..{:?})",
            region.start,
            region.stop
        );
        let step_rt = ctx.block_time;
        if step_rt != 1 {
            return Err(EngineError::TemporalBlocking { step: step_rt });
        }

        let mut window = region;
        let num_rt = num_steps(start_dt, stop_dt, step_rt);
        for index_rt in 0..num_rt {
            let start_rt = start_dt + index_rt * step_rt;
            let stop_rt = (start_rt + step_rt).min(stop_dt);
            debug_assert_eq!(stop_rt, start_rt + 1);
            let rt = start_rt;

            for &gi in sel {
                let slot = &self.groups[gi];
                let clipped = window.clip(slot.bb.begin, slot.bb.end);
                if !clipped.is_empty() {
                    let blocks = TileSpan::new(clipped.start, clipped.stop, ctx.block_size)
                        .with_group(ctx.group_size)
                        .tiles();
                    ctx.install_region(|| {
                        blocks
                            .par_iter()
                            .for_each(|block| calc_block(&*slot.kernel, ctx, rt, *block));
                    });
                }
                window.shift_back(ctx.angles);
            }
        }
        Ok(())
    }
}

/// Dimension whose advance carried the sweep from `from` onto a new row at
/// `to`, if any
fn edge_dim(from: &Tile, to: &Tile, begin_v: Coords) -> Option<usize> {
    match (0..NUM_DIMS).find(|&d| to.start[d] != from.start[d]) {
        Some(d) if to.start[3] == begin_v[3] && d < 3 => Some(d),
        _ => None,
    }
}

/// Evaluate one cache block as a sweep of fully unrolled clusters
///
/// Element bounds are converted to vector indices (exact: bounds are
/// vector-aligned by construction) and visited in cluster-sized steps, with
/// light prefetch lookahead of one cluster for L1 and two for L2.
fn calc_block(kernel: &dyn EqGroup, ctx: &StencilContext, t: Idx, block: Tile) {
    trace!(
        "{}.calc_block({t}, {:?}..{:?})",
        kernel.name(),
        block.start,
        block.stop
    );
    let vlen = ctx.fold.vlen;
    let begin_v = array4(|d| block.start[d] / vlen[d]);
    let end_v = array4(|d| block.stop[d] / vlen[d]);
    let clusters = TileSpan::new(begin_v, end_v, ctx.fold.clen).tiles();

    for (i, cluster) in clusters.iter().enumerate() {
        debug_assert_eq!(
            cluster.len(),
            ctx.fold.clen,
            "partial cluster in block sweep; pick cluster-multiple sizes"
        );
        // A lookahead that crosses into a new row warms the edge for the
        // dimension that advanced; otherwise plain in-row lookahead.
        if let Some(next) = clusters.get(i + 1) {
            match edge_dim(cluster, next, begin_v) {
                Some(d) => kernel.prefetch_l1_cluster_edge(ctx, t, next.start, d),
                None => kernel.prefetch_l1_cluster(ctx, t, next.start),
            }
        }
        if let Some(ahead) = clusters.get(i + 2) {
            match edge_dim(&clusters[i + 1], ahead, begin_v) {
                Some(d) => kernel.prefetch_l2_cluster_edge(ctx, t, ahead.start, d),
                None => kernel.prefetch_l2_cluster(ctx, t, ahead.start),
            }
        }
        kernel.calc_cluster(ctx, t, cluster.start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SizeConfig;
    use data::fold::Fold;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Group that touches nothing but remembers how many clusters ran
    struct CountingGroup {
        name: String,
        grids: Vec<crate::group::GridId>,
        clusters: Arc<AtomicUsize>,
    }
    //
    impl EqGroup for CountingGroup {
        fn name(&self) -> &str {
            &self.name
        }
        fn scalar_fp_ops(&self) -> usize {
            1
        }
        fn scalar_points_updated(&self) -> usize {
            1
        }
        fn eq_grids(&self) -> &[crate::group::GridId] {
            &self.grids
        }
        fn is_in_valid_domain(&self, _ctx: &StencilContext, _t: Idx, _c: Coords) -> bool {
            true
        }
        fn calc_scalar(&self, _ctx: &StencilContext, _t: Idx, _c: Coords) {}
        fn calc_cluster(&self, _ctx: &StencilContext, _t: Idx, _vec_begin: Coords) {
            self.clusters.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn counting_setup(rank: Coords) -> (StencilContext, EquationSet, Arc<AtomicUsize>) {
        let sizes = SizeConfig {
            rank_size: rank,
            region_size: rank,
            block_size: [1, 4, 4, 4],
            halo: [0; 4],
            ..SizeConfig::default()
        };
        let mut ctx = StencilContext::new("count", sizes, Fold::scalar()).unwrap();
        let g = ctx.add_grid("g", true).unwrap();
        let clusters = Arc::new(AtomicUsize::new(0));
        let eqs = EquationSet::new(
            "count",
            vec![Box::new(CountingGroup {
                name: "count".into(),
                grids: vec![g],
                clusters: clusters.clone(),
            })],
        );
        (ctx, eqs, clusters)
    }

    #[test]
    fn bounding_boxes_are_idempotent() {
        let (mut ctx, mut eqs, _) = counting_setup([1, 8, 8, 8]);
        eqs.find_bounding_boxes(&mut ctx).unwrap();
        let first = eqs.groups[0].bb;
        eqs.find_bounding_boxes(&mut ctx).unwrap();
        assert_eq!(eqs.groups[0].bb, first);
        assert_eq!(ctx.bb.size, 8 * 8 * 8);
        assert_eq!(first.rect_volume(), first.size);
    }

    #[test]
    fn region_default_resets_to_bb() {
        let (mut ctx, mut eqs, _) = counting_setup([1, 8, 8, 8]);
        assert_eq!(ctx.region_size, [1, 8, 8, 8]);
        eqs.find_bounding_boxes(&mut ctx).unwrap();
        assert_eq!(ctx.region_size, ctx.bb.len());
    }

    #[test]
    fn opt_visits_every_cluster_once() {
        let (mut ctx, mut eqs, clusters) = counting_setup([1, 8, 8, 8]);
        ctx.dt = 2;
        eqs.calc_rank_opt(&mut ctx).unwrap();
        assert_eq!(clusters.load(Ordering::Relaxed), 2 * 8 * 8 * 8);
    }

    #[test]
    fn temporal_blocking_is_rejected() {
        let (mut ctx, mut eqs, _) = counting_setup([1, 8, 8, 8]);
        ctx.block_time = 2;
        let err = eqs.calc_rank_opt(&mut ctx).unwrap_err();
        assert!(matches!(err, EngineError::TemporalBlocking { step: 2 }));
    }

    #[test]
    fn init_reports_work_totals() {
        let (mut ctx, mut eqs, _) = counting_setup([1, 4, 4, 4]);
        let stats = eqs.init(&mut ctx).unwrap();
        assert_eq!(stats.points_updated, 64);
        assert_eq!(stats.fp_ops, 64);
    }
}
