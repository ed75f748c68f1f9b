//! Per-rank problem state
//!
//! [`StencilContext`] owns everything one rank computes on: the grid set,
//! the parameter arrays, the exchange buffers and shadow snapshots keyed by
//! grid identity, the size hierarchy, and the communicator state. Problem
//! bindings populate it (grids, params), then hand it to the driver.

use crate::error::{EngineError, Result};
use crate::group::{BoundingBox, GridId};
use crate::topology::{self, RankComm};
use data::{
    fold::Fold, grid::ScalarGrid, grid::VecGrid, params::Param, Coords, Idx, Real, DIM_NAMES,
    EPSILON, NUM_DIMS,
};
use log::info;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Number of wrap-around time levels allocated per grid
pub const TIME_ALLOC: Idx = 2;

/// The size hierarchy and frequencies of one problem setup
///
/// All spatial sizes are in elements. A region size left equal to the rank
/// size means "whole domain" and is replaced by the rank bounding-box length
/// during initialization.
#[derive(Copy, Clone, Debug)]
pub struct SizeConfig {
    /// First time step to evaluate
    pub begin_dt: Idx,

    /// Number of time steps to evaluate
    pub dt: Idx,

    /// Rank-local domain size
    pub rank_size: Coords,

    /// Time steps evaluated per region pass (the wavefront depth)
    pub region_time: Idx,

    /// Region tile size
    pub region_size: Coords,

    /// Time steps per block; anything but 1 is rejected by the driver
    pub block_time: Idx,

    /// Block tile size
    pub block_size: Coords,

    /// Locality group size of the block sweep, in blocks
    pub group_size: Coords,

    /// Halo width required by the stencil
    pub halo: Coords,

    /// Extra padding on top of the halo, to steer alignment
    pub extra_pad: Coords,

    /// Time cluster length; must currently be 1
    pub cpts_t: Idx,

    /// Copy interiors out to shadow grids every this many steps (0 = never)
    pub shadow_out_freq: Idx,

    /// Copy shadow grids back in every this many steps (0 = never)
    pub shadow_in_freq: Idx,
}
//
impl Default for SizeConfig {
    fn default() -> Self {
        Self {
            begin_dt: 0,
            dt: 1,
            rank_size: [1, 64, 64, 64],
            region_time: 1,
            region_size: [1, 64, 64, 64],
            block_time: 1,
            block_size: [1, 16, 16, 16],
            group_size: [1; NUM_DIMS],
            halo: [0, 1, 1, 1],
            extra_pad: [0; NUM_DIMS],
            cpts_t: 1,
            shadow_out_freq: 0,
            shadow_in_freq: 0,
        }
    }
}

/// Process-wide owned state of one rank
pub struct StencilContext {
    pub name: String,

    pub begin_dt: Idx,
    pub dt: Idx,
    pub rank_size: Coords,
    pub region_time: Idx,
    pub region_size: Coords,
    pub block_time: Idx,
    pub block_size: Coords,
    pub group_size: Coords,
    pub halo: Coords,
    pub extra_pad: Coords,

    /// Temporal skewing angle per dimension, set by the wavefront planner
    pub angles: Coords,

    pub fold: Fold,

    /// Rank-wide bounding box, the union of all group boxes
    pub bb: BoundingBox,

    pub shadow_out_freq: Idx,
    pub shadow_in_freq: Idx,

    /// Seconds spent in shadow copies and halo exchanges so far
    pub shadow_time: f64,
    pub mpi_time: f64,

    pub(crate) grids: Vec<VecGrid>,
    pub(crate) eq_grids: Vec<GridId>,
    pub(crate) params: Vec<Param>,
    pub(crate) shadows: HashMap<GridId, ScalarGrid>,
    pub(crate) comm: RankComm,

    region_pool: Option<rayon::ThreadPool>,
}
//
impl std::fmt::Debug for StencilContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StencilContext")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl StencilContext {
    /// Set up an empty context; grids and params are added afterwards
    pub fn new(name: impl Into<String>, sizes: SizeConfig, fold: Fold) -> Result<Self> {
        if sizes.cpts_t != 1 {
            return Err(EngineError::TimeCluster {
                cpts_t: sizes.cpts_t,
            });
        }
        // Halo windows are exchanged at vector granularity, so halo widths
        // must be whole vectors along vectorized dimensions.
        for d in 0..NUM_DIMS {
            if sizes.halo[d] % fold.vlen[d] != 0 {
                return Err(EngineError::UnalignedHalo {
                    dim: DIM_NAMES[d],
                    halo: sizes.halo[d],
                    vlen: fold.vlen[d],
                });
            }
        }
        Ok(Self {
            name: name.into(),
            begin_dt: sizes.begin_dt,
            dt: sizes.dt,
            rank_size: sizes.rank_size,
            region_time: sizes.region_time,
            region_size: sizes.region_size,
            block_time: sizes.block_time,
            block_size: sizes.block_size,
            group_size: sizes.group_size,
            halo: sizes.halo,
            extra_pad: sizes.extra_pad,
            angles: [0; NUM_DIMS],
            fold,
            bb: BoundingBox::default(),
            shadow_out_freq: sizes.shadow_out_freq,
            shadow_in_freq: sizes.shadow_in_freq,
            shadow_time: 0.0,
            mpi_time: 0.0,
            grids: Vec::new(),
            eq_grids: Vec::new(),
            params: Vec::new(),
            shadows: HashMap::new(),
            comm: RankComm::solo(),
            region_pool: None,
        })
    }

    /// Allocate a grid sized to this rank; `updated` marks it as written by
    /// some equation group, which makes it participate in halo exchange
    pub fn add_grid(&mut self, name: impl Into<String>, updated: bool) -> Result<GridId> {
        let grid = VecGrid::new(
            name,
            self.rank_size,
            self.halo,
            self.extra_pad,
            TIME_ALLOC,
            self.fold,
        )?;
        let id = self.grids.len();
        self.grids.push(grid);
        if updated {
            self.eq_grids.push(id);
        }
        Ok(id)
    }

    /// Allocate a named parameter array
    pub fn add_param(&mut self, name: impl Into<String>, len: usize) -> usize {
        self.params.push(Param::new(name, len));
        self.params.len() - 1
    }

    #[inline]
    pub fn grid(&self, id: GridId) -> &VecGrid {
        &self.grids[id]
    }

    #[inline]
    pub fn param(&self, i: usize) -> &Param {
        &self.params[i]
    }

    pub fn grids(&self) -> &[VecGrid] {
        &self.grids
    }

    /// Grids written by some equation group, in registration order
    pub fn eq_grids(&self) -> &[GridId] {
        &self.eq_grids
    }

    pub fn comm(&self) -> &RankComm {
        &self.comm
    }

    pub fn my_rank(&self) -> usize {
        self.comm.fabric.my_rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.comm.fabric.num_ranks()
    }

    /// Wire up the communicator, allocate exchange buffers and shadow grids,
    /// and report the total allocation
    ///
    /// `layout` is the rank grid `(nrn, nrx, nry, nrz)`. With
    /// `find_rank_location` the rank derives its own coordinate from its
    /// rank id; otherwise the coordinate already set on the communicator
    /// state is kept.
    pub fn alloc_all(
        &mut self,
        fabric: Arc<dyn crate::fabric::Fabric>,
        layout: Coords,
        find_rank_location: bool,
    ) -> Result<usize> {
        topology::setup_comm(self, fabric, layout, find_rank_location)?;
        if self.shadow_out_freq > 0 || self.shadow_in_freq > 0 {
            self.alloc_shadows();
        }
        info!(
            "rank {}: {} grids ({} updated), {} params",
            self.my_rank(),
            self.grids.len(),
            self.eq_grids.len(),
            self.params.len()
        );
        let nbytes = self.num_bytes();
        info!("rank {}: total allocation: {} bytes", self.my_rank(), nbytes);
        Ok(nbytes)
    }

    /// Allocate one interior-sized shadow snapshot per updated grid
    fn alloc_shadows(&mut self) {
        for &gi in &self.eq_grids {
            let name = format!("shadow-{}", self.grids[gi].name());
            self.shadows.insert(gi, ScalarGrid::new(name, self.rank_size));
        }
    }

    /// Total bytes held by grids, params, exchange buffers and shadows
    pub fn num_bytes(&self) -> usize {
        let grids: usize = self.grids.iter().map(|g| g.num_bytes()).sum();
        let params: usize = self.params.iter().map(|p| p.num_bytes()).sum();
        let bufs: usize = (self.comm.bufs.values())
            .map(|pair| pair.send.num_bytes() + pair.recv.num_bytes())
            .sum();
        let shadows: usize = self.shadows.values().map(|s| s.num_bytes()).sum();
        grids + params + bufs + shadows
    }

    /// Seed every grid and parameter, advancing the seed by 0.01 per object
    /// so that no two objects start identical
    pub fn init_values(
        &mut self,
        mut grid_fn: impl FnMut(&VecGrid, Real),
        mut param_fn: impl FnMut(&mut Param, Real),
    ) {
        let mut v: Real = 0.1;
        for grid in &self.grids {
            grid_fn(grid, v);
            v += 0.01;
        }
        for shadow in self.shadows.values_mut() {
            shadow.fill(v);
            v += 0.01;
        }
        for param in &mut self.params {
            param_fn(param, v);
            v += 0.01;
        }
    }

    /// Element-wise comparison with another context's grids and params
    ///
    /// Returns the number of mismatching elements under [`EPSILON`].
    pub fn compare(&self, reference: &StencilContext) -> usize {
        info!("comparing '{}' to '{}'", self.name, reference.name);
        if self.grids.len() != reference.grids.len() {
            log::error!("number of grids not equal");
            return 1;
        }
        if self.params.len() != reference.params.len() {
            log::error!("number of params not equal");
            return 1;
        }
        let mut errs = 0;
        for (mine, theirs) in self.grids.iter().zip(&reference.grids) {
            let grid_errs = mine.compare(theirs, EPSILON);
            if grid_errs > 0 {
                log::warn!("grid '{}': {} mismatches", mine.name(), grid_errs);
            }
            errs += grid_errs;
        }
        for (mine, theirs) in self.params.iter().zip(&reference.params) {
            errs += mine.compare(theirs, EPSILON);
        }
        errs
    }

    /// Pick the thread count used inside `calc_region`; `None` restores the
    /// shared pool ("max threads")
    pub fn set_region_threads(&mut self, threads: Option<NonZeroUsize>) {
        self.region_pool = threads.map(|n| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n.get())
                .build()
                .expect("failed to build region thread pool")
        });
    }

    /// Run `f` under the region thread count, falling back to the shared
    /// pool when none was configured
    pub(crate) fn install_region<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.region_pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_sizes() -> SizeConfig {
        SizeConfig {
            rank_size: [1, 8, 8, 8],
            region_size: [1, 8, 8, 8],
            block_size: [1, 4, 4, 4],
            ..SizeConfig::default()
        }
    }

    #[test]
    fn grids_and_params_register() {
        let mut ctx = StencilContext::new("test", small_sizes(), Fold::scalar()).unwrap();
        let a = ctx.add_grid("a", true).unwrap();
        let b = ctx.add_grid("b", false).unwrap();
        ctx.add_param("coef", 4);
        assert_eq!(ctx.eq_grids(), &[a]);
        assert_eq!(ctx.grid(b).name(), "b");
        assert!(ctx.num_bytes() > 0);
    }

    #[test]
    fn time_cluster_must_be_one() {
        let sizes = SizeConfig {
            cpts_t: 2,
            ..small_sizes()
        };
        let err = StencilContext::new("test", sizes, Fold::scalar()).unwrap_err();
        assert!(matches!(err, EngineError::TimeCluster { cpts_t: 2 }));
    }

    #[test]
    fn unaligned_halo_is_rejected() {
        let sizes = SizeConfig {
            halo: [0, 1, 1, 2],
            ..small_sizes()
        };
        let err = StencilContext::new("test", sizes, Fold::z_vec(4, 1)).unwrap_err();
        assert!(matches!(err, EngineError::UnalignedHalo { dim: "z", .. }));
    }

    #[test]
    fn seeding_advances_per_object() {
        let mut ctx = StencilContext::new("test", small_sizes(), Fold::scalar()).unwrap();
        ctx.add_grid("a", true).unwrap();
        ctx.add_grid("b", true).unwrap();
        let mut seeds = Vec::new();
        ctx.init_values(
            |grid, seed| {
                grid.fill(seed);
                seeds.push(seed);
            },
            |param, seed| param.fill(seed),
        );
        assert_eq!(seeds.len(), 2);
        assert!((seeds[1] - seeds[0] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn compare_self_is_clean() {
        let mut ctx = StencilContext::new("test", small_sizes(), Fold::scalar()).unwrap();
        ctx.add_grid("a", true).unwrap();
        ctx.init_values(|grid, seed| grid.fill(seed), |param, seed| param.fill(seed));
        assert_eq!(ctx.compare(&ctx), 0);
    }
}
