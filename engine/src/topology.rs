//! Rank topology and exchange-buffer management
//!
//! Ranks form a 4-D Cartesian grid laid out row-major (`n` outermost, `z`
//! innermost). Each rank derives (or is told) its coordinate, learns every
//! other rank's coordinate through one broadcast per rank, and keeps a table
//! of the neighbors it will exchange halos with, plus a send/recv buffer
//! pair per neighbor per updated grid.

use crate::context::StencilContext;
use crate::error::{EngineError, Result};
use crate::fabric::Fabric;
use crate::group::GridId;
use data::{array4, grid::BufGrid, layout::Layout4321, volume, Coords, Idx, NUM_DIMS};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum Manhattan distance to a rank we exchange halos with
pub const MAX_EXCH_DIST: Idx = 4;

/// Staging buffers for one direction of one grid's halo traffic
pub struct BufPair {
    pub send: BufGrid,
    pub recv: BufGrid,
}

/// Communicator state of one rank
pub struct RankComm {
    pub fabric: Arc<dyn Fabric>,

    /// Ranks per dimension `(nrn, nrx, nry, nrz)`
    pub layout: Coords,

    /// This rank's coordinate within the layout
    pub coord: Coords,

    /// Neighbor rank per offset; offsets are `-1..=1` per dimension and an
    /// entry exists only if halo traffic with that rank is possible
    pub neighbors: HashMap<Coords, usize>,

    /// Exchange buffers keyed by (grid, neighbor offset); an entry exists
    /// iff the neighbor exists and the slab volume is non-zero
    pub bufs: HashMap<(GridId, Coords), BufPair>,
}
//
impl RankComm {
    /// Undistributed state: one rank, no neighbors
    pub fn solo() -> Self {
        Self {
            fabric: Arc::new(crate::fabric::LocalFabric::solo()),
            layout: [1; NUM_DIMS],
            coord: [0; NUM_DIMS],
            neighbors: HashMap::new(),
            bufs: HashMap::new(),
        }
    }
}

/// Select the neighbors of rank `my_rank` from the global coordinate table
///
/// A rank qualifies iff it sits within distance 1 along every dimension
/// (Chebyshev) and within [`MAX_EXCH_DIST`] in total (Manhattan). The own
/// rank must be at distance exactly 0 and nobody else may be.
fn select_neighbors(
    coords: &[Coords],
    my_rank: usize,
    mine: Coords,
) -> Result<Vec<(Coords, usize)>> {
    let mut neighbors = Vec::new();
    for (rn, &theirs) in coords.iter().enumerate() {
        let delta = array4(|d| theirs[d] - mine[d]);
        let mdist: Idx = delta.iter().map(|d| d.abs()).sum();
        if rn == my_rank {
            if mdist != 0 {
                return Err(EngineError::SelfDistance {
                    rank: my_rank,
                    dist: mdist,
                });
            }
            continue;
        }
        if mdist == 0 {
            return Err(EngineError::RankCollision {
                rank: my_rank,
                other: rn,
            });
        }
        if delta.iter().any(|d| d.abs() > 1) {
            continue;
        }
        if mdist > MAX_EXCH_DIST {
            continue;
        }
        neighbors.push((delta, rn));
    }
    Ok(neighbors)
}

/// Wire up the communicator state of `ctx`
///
/// Distributes coordinates (one broadcast per rank), selects neighbors, and
/// allocates the per-grid send/recv buffer pairs. Buffer slabs are sized
/// `halo_d` along offset dimensions and the full rank size along the rest;
/// zero-volume slabs are elided.
pub(crate) fn setup_comm(
    ctx: &mut StencilContext,
    fabric: Arc<dyn Fabric>,
    layout: Coords,
    find_rank_location: bool,
) -> Result<()> {
    let num_ranks = fabric.num_ranks();
    let my_rank = fabric.my_rank();
    let covered = volume(layout);
    if covered != num_ranks as Idx {
        return Err(EngineError::BadRankLayout {
            layout,
            covered,
            num_ranks,
        });
    }

    let coord = if find_rank_location {
        Layout4321::new(layout).unlayout(my_rank as Idx)
    } else {
        ctx.comm.coord
    };
    info!("logical coordinates of rank {my_rank}: {coord:?}");

    // Everyone learns everyone's coordinate, one broadcast per rank.
    let mut coords = Vec::with_capacity(num_ranks);
    for rn in 0..num_ranks {
        let mut entry: Coords = if rn == my_rank { coord } else { [0; NUM_DIMS] };
        fabric.broadcast(rn, bytemuck::cast_slice_mut(&mut entry[..]))?;
        coords.push(entry);
    }

    let mut neighbors = HashMap::new();
    let mut bufs = HashMap::new();
    for (delta, rn) in select_neighbors(&coords, my_rank, coord)? {
        // Slab size toward this neighbor: full extent along aligned
        // dimensions, halo width along offset ones.
        let sizes = array4(|d| {
            if delta[d] == 0 {
                ctx.rank_size[d]
            } else {
                ctx.halo[d]
            }
        });
        if volume(sizes) == 0 {
            info!("no halo exchange needed between ranks {my_rank} and {rn}");
            continue;
        }
        info!(
            "neighbor of rank {my_rank} at {:?} is rank {rn}",
            coords[rn]
        );
        neighbors.insert(delta, rn);
        for &gi in &ctx.eq_grids {
            let grid_name = ctx.grids[gi].name();
            let send = BufGrid::new(
                format!("{grid_name}_send_halo_from_{my_rank}_to_{rn}"),
                sizes,
                ctx.fold,
            );
            let recv = BufGrid::new(
                format!("{grid_name}_recv_halo_by_{my_rank}_from_{rn}"),
                sizes,
                ctx.fold,
            );
            bufs.insert((gi, delta), BufPair { send, recv });
        }
    }
    info!(
        "rank {my_rank}: {} neighbor(s) within exchange distance",
        neighbors.len()
    );

    ctx.comm = RankComm {
        fabric,
        layout,
        coord,
        neighbors,
        bufs,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_coords(layout: Coords) -> Vec<Coords> {
        let l = Layout4321::new(layout);
        (0..l.size()).map(|i| l.unlayout(i)).collect()
    }

    fn neighbors_of(coords: &[Coords], my_rank: usize) -> Vec<(Coords, usize)> {
        select_neighbors(coords, my_rank, coords[my_rank]).unwrap()
    }

    #[test]
    fn line_of_ranks_has_line_neighbors() {
        let coords = grid_coords([1, 3, 1, 1]);
        let neighbors = neighbors_of(&coords, 1);
        let offsets: Vec<Coords> = neighbors.iter().map(|(d, _)| *d).collect();
        assert!(offsets.contains(&[0, -1, 0, 0]));
        assert!(offsets.contains(&[0, 1, 0, 0]));
        assert_eq!(neighbors.len(), 2);
    }

    #[test]
    fn corner_rank_sees_diagonals() {
        let coords = grid_coords([1, 2, 2, 2]);
        let neighbors = neighbors_of(&coords, 0);
        // All 7 other ranks of a 2x2x2 box are within Chebyshev distance 1
        // and Manhattan distance 3.
        assert_eq!(neighbors.len(), 7);
    }

    #[test]
    fn chebyshev_cutoff_excludes_far_ranks() {
        let coords = grid_coords([1, 5, 1, 1]);
        let neighbors = neighbors_of(&coords, 0);
        assert_eq!(neighbors.len(), 1);
        assert_eq!(neighbors[0].0, [0, 1, 0, 0]);
    }

    #[test]
    fn manhattan_cutoff_applies() {
        // A full 4-D diagonal would be at Manhattan distance 4; shrink the
        // cutoff scenario by checking the constant directly instead of
        // synthesizing a 5-D case.
        let coords = grid_coords([2, 2, 2, 2]);
        let neighbors = neighbors_of(&coords, 0);
        // 15 other corners, all within Chebyshev 1; Manhattan distances are
        // 1..=4, all within MAX_EXCH_DIST.
        assert_eq!(neighbors.len(), 15);
    }

    #[test]
    fn colliding_coordinates_are_fatal() {
        let coords = vec![[0, 0, 0, 0], [0, 0, 0, 0]];
        let err = select_neighbors(&coords, 0, coords[0]).unwrap_err();
        assert!(matches!(err, EngineError::RankCollision { other: 1, .. }));
    }

    #[test]
    fn displaced_self_is_fatal() {
        let coords = grid_coords([1, 2, 1, 1]);
        // Rank 0 believes it sits at x=5, but the broadcast table has it at
        // the origin, so its self-distance is non-zero.
        let err = select_neighbors(&coords, 0, [0, 5, 0, 0]);
        assert!(matches!(
            err,
            Err(EngineError::SelfDistance { rank: 0, dist: 5 })
        ));
    }
}
