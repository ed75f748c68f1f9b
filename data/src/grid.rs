//! Grid storage
//!
//! Three kinds of grid live here:
//!
//! - [`VecGrid`], the main simulation storage: a wrap-around time dimension
//!   over a 4-D spatial box, stored as folded SIMD vectors with halo+pad
//!   space on every side.
//! - [`BufGrid`], a zero-based folded box without halos, used for exchange
//!   buffers and exposable as raw bytes.
//! - [`ScalarGrid`], a plain ndarray box used for shadow snapshots.
//!
//! As always in SIMD, the folded layout is non-obvious: each spatial
//! dimension is counted in vectors of `vlen_d` lanes, vectors are laid out
//! row-major with `n` outermost and `z` innermost, and the `vlen_n * vlen_x *
//! vlen_y * vlen_z` scalars of one vector are contiguous in memory in the
//! same row-major lane order. An element coordinate therefore splits into a
//! vector coordinate (division by `vlen_d`) and a lane offset (remainder).

use crate::{
    array4, fold::round_up, fold::Fold, layout::Layout4321, Coords, Idx, Real, StorageError,
    DIM_NAMES, GRID_ALIGNMENT, NUM_DIMS,
};
use ndarray::Array4;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Aligned scalar storage with interior mutability
///
/// Grid writes go through `&self` so that one grid can be updated from many
/// threads during a parallel block sweep. The engine guarantees that
/// concurrent writers touch disjoint points (rectangular bounding boxes,
/// non-overlapping block tiles) and that packing/unpacking never overlaps a
/// compute sweep; this type does not and cannot check that discipline.
struct AlignedStorage {
    ptr: NonNull<Real>,
    len: usize,
}
//
// SAFETY: the storage is plain `Real` data. Concurrent access discipline
// (disjoint writes, no read of a concurrently-written element) is upheld by
// the engine's sequencing, as described above.
unsafe impl Send for AlignedStorage {}
unsafe impl Sync for AlignedStorage {}
//
impl AlignedStorage {
    /// Allocate `len` zero-initialized scalars at [`GRID_ALIGNMENT`]
    fn new(len: usize) -> Self {
        assert!(len > 0, "empty grid allocation");
        let layout = Layout::array::<Real>(len)
            .and_then(|l| l.align_to(GRID_ALIGNMENT))
            .expect("invalid grid layout");
        // SAFETY: layout has non-zero size; all-zero bytes are a valid Real.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr.cast::<Real>()) else {
            alloc::handle_alloc_error(layout)
        };
        Self { ptr, len }
    }

    #[inline]
    fn get(&self, i: usize) -> Real {
        debug_assert!(i < self.len);
        // SAFETY: i is in bounds; see type-level access discipline.
        unsafe { *self.ptr.as_ptr().add(i) }
    }

    #[inline]
    fn set(&self, i: usize, v: Real) {
        debug_assert!(i < self.len);
        // SAFETY: i is in bounds; see type-level access discipline.
        unsafe { *self.ptr.as_ptr().add(i) = v }
    }
}
//
impl Drop for AlignedStorage {
    fn drop(&mut self) {
        let layout = Layout::array::<Real>(self.len)
            .and_then(|l| l.align_to(GRID_ALIGNMENT))
            .expect("invalid grid layout");
        // SAFETY: allocated in new() with the same layout computation.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), layout) }
    }
}

/// Folded-vector simulation grid with halo+pad and wrap-around time
pub struct VecGrid {
    name: String,
    fold: Fold,

    /// Interior size along each spatial dimension, in elements
    dims: Coords,

    /// Allocated halo+pad on each side of each dimension, in elements
    ///
    /// Rounded up to a vector multiple so that every padded element has an
    /// addressable vector.
    pads: Coords,

    /// Number of wrap-around time levels
    time_alloc: Idx,

    /// Allocated extent along each spatial dimension, in vectors
    vec_alloc: Layout4321,

    /// Scalars per vector, cached from the fold
    ppv: usize,

    storage: AlignedStorage,
}
//
impl VecGrid {
    /// Allocate a grid of `dims` interior elements with `halo + extra_pad`
    /// elements of padding on each side and `time_alloc` time levels
    pub fn new(
        name: impl Into<String>,
        dims: Coords,
        halo: Coords,
        extra_pad: Coords,
        time_alloc: Idx,
        fold: Fold,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        if time_alloc <= 0 {
            return Err(StorageError::EmptyDim {
                grid: name,
                dim: "t",
                size: time_alloc,
            });
        }
        for d in 0..NUM_DIMS {
            if dims[d] <= 0 {
                return Err(StorageError::EmptyDim {
                    grid: name,
                    dim: DIM_NAMES[d],
                    size: dims[d],
                });
            }
            if dims[d] % fold.vlen[d] != 0 {
                return Err(StorageError::UnalignedDim {
                    grid: name,
                    dim: DIM_NAMES[d],
                    size: dims[d],
                    vlen: fold.vlen[d],
                });
            }
        }
        let pads = array4(|d| round_up(halo[d] + extra_pad[d], fold.vlen[d]));
        let vec_alloc = Layout4321::new(array4(|d| (dims[d] + 2 * pads[d]) / fold.vlen[d]));
        let ppv = fold.points_per_vector();
        let len = time_alloc as usize * vec_alloc.size() as usize * ppv;
        Ok(Self {
            name,
            fold,
            dims,
            pads,
            time_alloc,
            vec_alloc,
            ppv,
            storage: AlignedStorage::new(len),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Interior size along each spatial dimension, in elements
    pub fn dims(&self) -> Coords {
        self.dims
    }

    /// Allocated halo+pad width along dimension `d`, in elements
    pub fn pad(&self, d: usize) -> Idx {
        self.pads[d]
    }

    pub fn fold(&self) -> &Fold {
        &self.fold
    }

    /// Number of wrap-around time levels
    pub fn time_alloc(&self) -> Idx {
        self.time_alloc
    }

    /// Total allocation size in bytes
    pub fn num_bytes(&self) -> usize {
        self.storage.len * std::mem::size_of::<Real>()
    }

    /// Linear index of element `(t, c)`
    ///
    /// Spatial coordinates may reach into the pad: `-pad_d <= c_d <
    /// dims_d + pad_d`.
    #[inline]
    fn elem_index(&self, t: Idx, c: Coords) -> usize {
        let mut vec_coord = [0; NUM_DIMS];
        let mut lane = [0; NUM_DIMS];
        for d in 0..NUM_DIMS {
            let e = c[d] + self.pads[d];
            debug_assert!(
                (0..self.dims[d] + 2 * self.pads[d]).contains(&e),
                "grid '{}': element coordinate {} out of bounds along {}",
                self.name,
                c[d],
                DIM_NAMES[d]
            );
            vec_coord[d] = e / self.fold.vlen[d];
            lane[d] = e % self.fold.vlen[d];
        }
        let lane_off = Layout4321::new(self.fold.vlen).layout(lane);
        self.vec_index_raw(t, vec_coord) + lane_off as usize
    }

    /// Linear index of the first scalar of the vector at padded vector
    /// coordinate `v`
    #[inline]
    fn vec_index_raw(&self, t: Idx, v: Coords) -> usize {
        let tw = t.rem_euclid(self.time_alloc);
        let linear = tw * self.vec_alloc.size() + self.vec_alloc.layout(v);
        linear as usize * self.ppv
    }

    /// Read one element at time `t` and spatial coordinate `c`
    #[inline]
    pub fn read_elem(&self, t: Idx, c: Coords) -> Real {
        self.storage.get(self.elem_index(t, c))
    }

    /// Write one element at time `t` and spatial coordinate `c`
    ///
    /// Takes `&self`: see the access discipline on the storage above.
    #[inline]
    pub fn write_elem(&self, val: Real, t: Idx, c: Coords) {
        self.storage.set(self.elem_index(t, c), val);
    }

    /// Translate a normalized vector coordinate (0 = first interior vector,
    /// negative values reach into the halo) into a padded one
    #[inline]
    fn pad_vec_coord(&self, v: Coords) -> Coords {
        array4(|d| {
            let adj = v[d] + self.pads[d] / self.fold.vlen[d];
            debug_assert!(
                (0..self.vec_alloc_dim(d)).contains(&adj),
                "grid '{}': vector coordinate {} out of bounds along {}",
                self.name,
                v[d],
                DIM_NAMES[d]
            );
            adj
        })
    }

    #[inline]
    fn vec_alloc_dim(&self, d: usize) -> Idx {
        (self.dims[d] + 2 * self.pads[d]) / self.fold.vlen[d]
    }

    /// Copy the vector at normalized vector coordinate `v` into `dst`
    #[inline]
    pub fn read_vec_norm(&self, t: Idx, v: Coords, dst: &mut [Real]) {
        debug_assert_eq!(dst.len(), self.ppv);
        let base = self.vec_index_raw(t, self.pad_vec_coord(v));
        for (lane, out) in dst.iter_mut().enumerate() {
            *out = self.storage.get(base + lane);
        }
    }

    /// Overwrite the vector at normalized vector coordinate `v` from `src`
    #[inline]
    pub fn write_vec_norm(&self, t: Idx, v: Coords, src: &[Real]) {
        debug_assert_eq!(src.len(), self.ppv);
        let base = self.vec_index_raw(t, self.pad_vec_coord(v));
        for (lane, val) in src.iter().enumerate() {
            self.storage.set(base + lane, *val);
        }
    }

    /// Fill the whole allocation (pads included) with one value
    pub fn fill(&self, val: Real) {
        for i in 0..self.storage.len {
            self.storage.set(i, val);
        }
    }

    /// Fill the whole allocation from an element-coordinate mapping
    ///
    /// Visits every time level and every element including the pads, so a
    /// freshly seeded grid has well-defined halo contents too.
    pub fn fill_with(&self, mut f: impl FnMut(Idx, Coords) -> Real) {
        for t in 0..self.time_alloc {
            self.for_each_padded_coord(|c| {
                self.write_elem(f(t, c), t, c);
            });
        }
    }

    fn for_each_padded_coord(&self, mut f: impl FnMut(Coords)) {
        let lo = array4(|d| -self.pads[d]);
        let hi = array4(|d| self.dims[d] + self.pads[d]);
        for n in lo[0]..hi[0] {
            for x in lo[1]..hi[1] {
                for y in lo[2]..hi[2] {
                    for z in lo[3]..hi[3] {
                        f([n, x, y, z]);
                    }
                }
            }
        }
    }

    /// Count interior elements that differ from `other` by more than `epsilon`
    ///
    /// All time levels are compared; pads are not, since different code paths
    /// legitimately leave different garbage there.
    pub fn compare(&self, other: &VecGrid, epsilon: Real) -> usize {
        assert_eq!(self.dims, other.dims, "comparing grids of different sizes");
        assert_eq!(self.time_alloc, other.time_alloc);
        let mut mismatches = 0;
        for t in 0..self.time_alloc {
            for n in 0..self.dims[0] {
                for x in 0..self.dims[1] {
                    for y in 0..self.dims[2] {
                        for z in 0..self.dims[3] {
                            let c = [n, x, y, z];
                            let a = self.read_elem(t, c);
                            let b = other.read_elem(t, c);
                            if (a - b).abs() > epsilon {
                                mismatches += 1;
                            }
                        }
                    }
                }
            }
        }
        mismatches
    }
}

/// Zero-based folded buffer grid, used for halo exchange staging
///
/// No halo, no pad, no time dimension. Allocation is rounded up to whole
/// vectors along each dimension so that any element window fits.
pub struct BufGrid {
    name: String,
    /// Extent along each spatial dimension, in vectors
    vec_dims: Layout4321,
    ppv: usize,
    data: Vec<Real>,
}
//
impl BufGrid {
    /// Allocate a buffer covering `sizes` elements under the given fold
    pub fn new(name: impl Into<String>, sizes: Coords, fold: Fold) -> Self {
        let vec_dims = Layout4321::new(array4(|d| {
            (round_up(sizes[d], fold.vlen[d]) / fold.vlen[d]).max(1)
        }));
        let ppv = fold.points_per_vector();
        let len = vec_dims.size() as usize * ppv;
        Self {
            name: name.into(),
            vec_dims,
            ppv,
            data: vec![0.0; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<Real>()
    }

    #[inline]
    fn vec_index(&self, v: Coords) -> usize {
        self.vec_dims.layout(v) as usize * self.ppv
    }

    /// Copy the vector at zero-based vector coordinate `v` into `dst`
    #[inline]
    pub fn read_vec(&self, v: Coords, dst: &mut [Real]) {
        let base = self.vec_index(v);
        dst.copy_from_slice(&self.data[base..base + self.ppv]);
    }

    /// Overwrite the vector at zero-based vector coordinate `v` from `src`
    #[inline]
    pub fn write_vec(&mut self, v: Coords, src: &[Real]) {
        let base = self.vec_index(v);
        self.data[base..base + self.ppv].copy_from_slice(src);
    }

    /// Buffer contents as bytes, for handing to the fabric
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    /// Mutable buffer contents as bytes, for receiving from the fabric
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.data)
    }
}

/// Plain scalar box used for shadow snapshots
pub struct ScalarGrid {
    name: String,
    data: Array4<Real>,
}
//
impl ScalarGrid {
    pub fn new(name: impl Into<String>, dims: Coords) -> Self {
        let shape = array4(|d| dims[d] as usize);
        Self {
            name: name.into(),
            data: Array4::zeros(shape),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn get(&self, c: Coords) -> Real {
        self.data[array4(|d| c[d] as usize)]
    }

    #[inline]
    pub fn set(&mut self, c: Coords, val: Real) {
        self.data[array4(|d| c[d] as usize)] = val;
    }

    pub fn fill(&mut self, val: Real) {
        self.data.fill(val);
    }

    pub fn num_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<Real>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_grid(fold: Fold) -> VecGrid {
        VecGrid::new("test", [1, 4, 4, 8], [0, 1, 1, 4], [0; 4], 2, fold).unwrap()
    }

    #[test]
    fn elem_roundtrip_scalar_fold() {
        let grid = small_grid(Fold::scalar());
        grid.write_elem(3.5, 0, [0, 1, 2, 3]);
        assert_eq!(grid.read_elem(0, [0, 1, 2, 3]), 3.5);
        // Other time level is untouched
        assert_eq!(grid.read_elem(1, [0, 1, 2, 3]), 0.0);
        // Time wraps around
        assert_eq!(grid.read_elem(2, [0, 1, 2, 3]), 3.5);
    }

    #[test]
    fn halo_coordinates_are_addressable() {
        let grid = small_grid(Fold::scalar());
        grid.write_elem(1.0, 0, [0, -1, 0, 0]);
        grid.write_elem(2.0, 0, [0, 4, 3, 7]);
        assert_eq!(grid.read_elem(0, [0, -1, 0, 0]), 1.0);
        assert_eq!(grid.read_elem(0, [0, 4, 3, 7]), 2.0);
    }

    #[test]
    fn vec_and_elem_access_agree() {
        let fold = Fold::z_vec(4, 1);
        let grid = small_grid(fold);
        grid.write_vec_norm(0, [0, 0, 0, 1], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(grid.read_elem(0, [0, 0, 0, 4]), 1.0);
        assert_eq!(grid.read_elem(0, [0, 0, 0, 7]), 4.0);
        let mut v = [0.0; 4];
        grid.read_vec_norm(0, [0, 0, 0, 1], &mut v);
        assert_eq!(v, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn negative_vec_coords_reach_halo() {
        let fold = Fold::z_vec(4, 1);
        let grid = small_grid(fold);
        grid.write_vec_norm(0, [0, 0, 0, -1], &[9.0; 4]);
        assert_eq!(grid.read_elem(0, [0, 0, 0, -4]), 9.0);
        assert_eq!(grid.read_elem(0, [0, 0, 0, -1]), 9.0);
    }

    #[test]
    fn pad_rounds_to_vector_multiple() {
        let grid = VecGrid::new("pads", [1, 4, 4, 8], [0, 1, 1, 1], [0; 4], 1, Fold::z_vec(4, 1))
            .unwrap();
        assert_eq!(grid.pad(crate::DIM_X), 1);
        assert_eq!(grid.pad(crate::DIM_Z), 4);
    }

    #[test]
    fn unaligned_dim_rejected() {
        let err = VecGrid::new("bad", [1, 4, 4, 6], [0; 4], [0; 4], 1, Fold::z_vec(4, 1));
        assert!(matches!(err, Err(StorageError::UnalignedDim { .. })));
    }

    #[test]
    fn compare_counts_mismatches() {
        let a = small_grid(Fold::scalar());
        let b = small_grid(Fold::scalar());
        a.fill(1.0);
        b.fill(1.0);
        assert_eq!(a.compare(&b, crate::EPSILON), 0);
        b.write_elem(1.0 + 2.0 * crate::EPSILON, 1, [0, 3, 3, 3]);
        assert_eq!(a.compare(&b, crate::EPSILON), 1);
    }

    #[test]
    fn buf_grid_bytes_roundtrip() {
        let mut buf = BufGrid::new("buf", [1, 1, 2, 8], Fold::z_vec(4, 1));
        buf.write_vec([0, 0, 1, 1], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(buf.num_bytes(), 1 * 1 * 2 * 2 * 4 * 4);
        let bytes: Vec<u8> = buf.as_bytes().to_vec();
        let mut other = BufGrid::new("buf2", [1, 1, 2, 8], Fold::z_vec(4, 1));
        other.as_bytes_mut().copy_from_slice(&bytes);
        let mut v = [0.0; 4];
        other.read_vec([0, 0, 1, 1], &mut v);
        assert_eq!(v, [1.0, 2.0, 3.0, 4.0]);
    }
}
