//! Loop tiling utilities
//!
//! The rank, region, block and halo sweeps are all the same shape: walk a
//! 4-D window in steps of a tile size, clipping the last tile against the
//! window edge, optionally visiting tiles in locality groups. One small
//! utility produces the tile list and callers supply the body, so the four
//! nest levels never hand-roll their own loop pyramids.

use data::{array4, Coords, Idx, NUM_DIMS};

/// One tile of a sweep: `[start, stop)` along every dimension
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tile {
    pub start: Coords,
    pub stop: Coords,
}
//
impl Tile {
    /// Length along each dimension
    pub fn len(&self) -> Coords {
        array4(|d| self.stop[d] - self.start[d])
    }

    /// Whether the tile holds at least one point
    pub fn is_empty(&self) -> bool {
        (0..NUM_DIMS).any(|d| self.stop[d] <= self.start[d])
    }

    /// Intersection with another window, which may come out empty
    pub fn clip(&self, begin: Coords, end: Coords) -> Tile {
        Tile {
            start: array4(|d| self.start[d].max(begin[d])),
            stop: array4(|d| self.stop[d].min(end[d])),
        }
    }

    /// Shift both bounds by `-delta` along every dimension
    pub fn shift_back(&mut self, delta: Coords) {
        for d in 0..NUM_DIMS {
            self.start[d] -= delta[d];
            self.stop[d] -= delta[d];
        }
    }
}

/// A 4-D window to be swept in `step`-sized tiles
///
/// `group` clusters consecutive tiles: the sweep first visits all tiles of
/// one group of `group_d` tiles along each dimension before moving to the
/// next group, improving reuse between neighboring tiles. A group size of 1
/// degenerates to plain row-major order.
#[derive(Copy, Clone, Debug)]
pub struct TileSpan {
    pub begin: Coords,
    pub end: Coords,
    pub step: Coords,
    pub group: Coords,
}
//
impl TileSpan {
    pub fn new(begin: Coords, end: Coords, step: Coords) -> Self {
        Self {
            begin,
            end,
            step,
            group: [1; NUM_DIMS],
        }
    }

    pub fn with_group(mut self, group: Coords) -> Self {
        self.group = group;
        self
    }

    /// Materialize the tile list in sweep order
    ///
    /// Tiles at the high edge are clipped to the window; an empty window
    /// yields no tiles.
    pub fn tiles(&self) -> Vec<Tile> {
        for d in 0..NUM_DIMS {
            debug_assert!(self.step[d] > 0, "tile step must be positive");
            debug_assert!(self.group[d] > 0, "tile group must be positive");
        }
        let group_step = array4(|d| self.step[d] * self.group[d]);
        let mut tiles = Vec::new();
        self.for_each_start(group_step, |group_start| {
            let group_stop = array4(|d| (group_start[d] + group_step[d]).min(self.end[d]));
            let inner = TileSpan::new(group_start, group_stop, self.step);
            inner.for_each_start(self.step, |start| {
                tiles.push(Tile {
                    start,
                    stop: array4(|d| (start[d] + self.step[d]).min(inner.end[d])),
                });
            });
        });
        tiles
    }

    /// Row-major walk over tile start positions with the given step
    fn for_each_start(&self, step: Coords, mut f: impl FnMut(Coords)) {
        let mut n = self.begin[0];
        while n < self.end[0] {
            let mut x = self.begin[1];
            while x < self.end[1] {
                let mut y = self.begin[2];
                while y < self.end[2] {
                    let mut z = self.begin[3];
                    while z < self.end[3] {
                        f([n, x, y, z]);
                        z += step[3];
                    }
                    y += step[2];
                }
                x += step[1];
            }
            n += step[0];
        }
    }
}

/// Number of `step`-sized strides needed to cover `begin..end`
#[inline]
pub fn num_steps(begin: Idx, end: Idx, step: Idx) -> Idx {
    debug_assert!(step > 0);
    if end <= begin {
        0
    } else {
        (end - begin + step - 1) / step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Every point of the window must appear in exactly one tile
    fn assert_covers(span: &TileSpan) {
        let mut seen = HashSet::new();
        for tile in span.tiles() {
            for n in tile.start[0]..tile.stop[0] {
                for x in tile.start[1]..tile.stop[1] {
                    for y in tile.start[2]..tile.stop[2] {
                        for z in tile.start[3]..tile.stop[3] {
                            assert!(seen.insert([n, x, y, z]), "point visited twice");
                        }
                    }
                }
            }
        }
        let expected: Idx = (0..NUM_DIMS)
            .map(|d| (span.end[d] - span.begin[d]).max(0))
            .product();
        assert_eq!(seen.len() as Idx, expected);
    }

    #[test]
    fn exact_tiling_covers_window() {
        assert_covers(&TileSpan::new([0; 4], [2, 4, 4, 8], [1, 2, 2, 4]));
    }

    #[test]
    fn ragged_tiling_clips_edges() {
        let span = TileSpan::new([0, 1, 0, 3], [1, 6, 5, 10], [1, 4, 2, 4]);
        assert_covers(&span);
        let last = *span.tiles().last().unwrap();
        assert!(last.stop.iter().zip(&span.end).all(|(s, e)| s <= e));
    }

    #[test]
    fn grouped_tiling_still_covers_window() {
        let span = TileSpan::new([0; 4], [1, 8, 8, 8], [1, 2, 2, 2]).with_group([1, 2, 2, 1]);
        assert_covers(&span);
    }

    #[test]
    fn empty_window_has_no_tiles() {
        let span = TileSpan::new([0, 4, 0, 0], [1, 4, 8, 8], [1; 4]);
        assert!(span.tiles().is_empty());
    }

    #[test]
    fn clip_and_shift() {
        let mut tile = Tile {
            start: [0, 2, 2, 2],
            stop: [1, 6, 6, 6],
        };
        let clipped = tile.clip([0, 4, 0, 0], [1, 8, 4, 8]);
        assert_eq!(clipped.start, [0, 4, 2, 2]);
        assert_eq!(clipped.stop, [1, 6, 4, 6]);
        tile.shift_back([0, 1, 1, 1]);
        assert_eq!(tile.start, [0, 1, 1, 1]);
        assert_eq!(tile.stop, [1, 5, 5, 5]);
    }

    #[test]
    fn num_steps_rounds_up() {
        assert_eq!(num_steps(0, 10, 4), 3);
        assert_eq!(num_steps(0, 8, 4), 2);
        assert_eq!(num_steps(5, 5, 1), 0);
        assert_eq!(num_steps(5, 3, 1), 0);
    }
}
