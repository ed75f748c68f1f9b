//! Storage primitives used by the stencil engine
//!
//! Grids live here; the policy of when and how they are touched lives in the
//! `engine` crate. Everything is parameterized over four spatial dimensions
//! conventionally named `(n, x, y, z)` plus a wrap-around time dimension.

pub mod fold;
pub mod grid;
pub mod layout;
pub mod params;

/// Computation precision
pub type Real = f32;

/// Index type for all spatial and temporal coordinates
///
/// Signed on purpose: halo-relative coordinates reach below zero.
pub type Idx = i64;

/// Number of spatial dimensions
pub const NUM_DIMS: usize = 4;

/// Spatial coordinate or size tuple in `(n, x, y, z)` order
pub type Coords = [Idx; NUM_DIMS];

/// Indices of the spatial dimensions within a [`Coords`] tuple
pub const DIM_N: usize = 0;
pub const DIM_X: usize = 1;
pub const DIM_Y: usize = 2;
pub const DIM_Z: usize = 3;

/// Printable dimension names, in [`Coords`] order
pub const DIM_NAMES: [&str; NUM_DIMS] = ["n", "x", "y", "z"];

/// Tolerance used when comparing grids produced by different code paths
pub const EPSILON: Real = 1e-4;

/// Byte alignment of grid storage allocations
pub const GRID_ALIGNMENT: usize = 64;

/// Shorthand to create an array of 4 elements, knowing an index -> value mapping
#[inline(always)]
pub fn array4<T>(f: impl FnMut(usize) -> T) -> [T; NUM_DIMS] {
    std::array::from_fn::<T, NUM_DIMS, _>(f)
}

/// Product of all components of a size tuple
#[inline]
pub fn volume(sizes: Coords) -> Idx {
    sizes.iter().product()
}

/// Things that can go wrong when setting up storage
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// A grid dimension is not a multiple of the vector fold length
    #[error(
        "grid '{grid}': size {size} along {dim} is not a multiple of the \
         vector length {vlen}"
    )]
    UnalignedDim {
        grid: String,
        dim: &'static str,
        size: Idx,
        vlen: Idx,
    },

    /// A grid dimension or time depth is not positive
    #[error("grid '{grid}': size {size} along {dim} must be positive")]
    EmptyDim {
        grid: String,
        dim: &'static str,
        size: Idx,
    },
}
