//! Vector fold descriptor
//!
//! SIMD-friendly grids do not store scalars in plain row-major order: points
//! are folded into fixed-shape vectors of `vlen_n * vlen_x * vlen_y * vlen_z`
//! elements, and the innermost compute tile (a "cluster") covers `clen_d`
//! consecutive vectors along each dimension. Each problem binding picks one
//! fold for all of its grids and the engine carries it around at runtime.

use crate::{array4, volume, Coords, Idx, NUM_DIMS};

/// Vector and cluster shape shared by every grid of one problem
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fold {
    /// SIMD lanes along each spatial dimension
    pub vlen: Coords,

    /// Cluster length along each spatial dimension, in vectors
    pub clen: Coords,
}
//
impl Fold {
    /// Fold of a scalar computation: one point per vector, one vector per cluster
    pub fn scalar() -> Self {
        Self {
            vlen: [1; NUM_DIMS],
            clen: [1; NUM_DIMS],
        }
    }

    /// Fold that only vectorizes along z, the common CPU layout
    pub fn z_vec(lanes: Idx, cluster_z: Idx) -> Self {
        let mut fold = Self::scalar();
        fold.vlen[crate::DIM_Z] = lanes;
        fold.clen[crate::DIM_Z] = cluster_z;
        fold
    }

    /// Number of scalar elements in one vector
    pub fn points_per_vector(&self) -> usize {
        volume(self.vlen) as usize
    }

    /// Cluster length in points along each dimension: `vlen_d * clen_d`
    pub fn cluster_pts(&self) -> Coords {
        array4(|d| self.vlen[d] * self.clen[d])
    }
}
//
impl Default for Fold {
    fn default() -> Self {
        Self::scalar()
    }
}

/// Round `x` up to the next multiple of `mult`
#[inline]
pub fn round_up(x: Idx, mult: Idx) -> Idx {
    debug_assert!(mult > 0);
    (x + mult - 1) / mult * mult
}
