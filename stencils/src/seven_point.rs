//! 7-point diffusion stencil
//!
//! Each point becomes a weighted average of itself and its six face
//! neighbors along x, y and z:
//!
//! ```text
//! u(t+1, c) = w0 * u(t, c) + w1 * sum of u(t, c ± e_d) for d in {x, y, z}
//! ```
//!
//! The weights live in a two-entry parameter array so that validation runs
//! can perturb them without recompiling. The scalar path is the obvious
//! triple loop body; the cluster path evaluates whole folded vectors,
//! splicing lanes from the neighboring vector for the offsets that cross a
//! vector boundary.

use data::{
    array4, fold::Fold, layout::Layout4321, Coords, Idx, Real, DIM_X, DIM_Y, DIM_Z,
};
use engine::{
    EqGroup, EquationSet, GridId, Result, SizeConfig, StencilContext,
};

/// Which points of the rank domain an equation group claims
///
/// `Full` is the production shape. The others exist to exercise the
/// bounding-box discovery: a smaller box is still valid, a sphere is the
/// canonical non-rectangular offender.
#[derive(Copy, Clone, Debug)]
pub enum Domain {
    Full,
    Box { begin: Coords, end: Coords },
    Sphere { center: Coords, radius2: Idx },
}
//
impl Domain {
    fn contains(&self, rank_size: Coords, c: Coords) -> bool {
        match *self {
            Domain::Full => (0..4).all(|d| (0..rank_size[d]).contains(&c[d])),
            Domain::Box { begin, end } => (0..4).all(|d| (begin[d]..end[d]).contains(&c[d])),
            Domain::Sphere { center, radius2 } => {
                let r2: Idx = (0..4).map(|d| (c[d] - center[d]).pow(2)).sum();
                r2 <= radius2
            }
        }
    }
}

/// The 7-point diffusion equation group
pub struct SevenPoint {
    name: String,
    grids: Vec<GridId>,
    coef: usize,
    domain: Domain,
}
//
impl SevenPoint {
    pub fn new(name: impl Into<String>, grid: GridId, coef: usize, domain: Domain) -> Self {
        Self {
            name: name.into(),
            grids: vec![grid],
            coef,
            domain,
        }
    }

    fn weights(&self, ctx: &StencilContext) -> (Real, Real) {
        let w = ctx.param(self.coef);
        (w.get(0), w.get(1))
    }
}
//
impl EqGroup for SevenPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn scalar_fp_ops(&self) -> usize {
        // 7 multiplies and 6 adds per point.
        13
    }

    fn scalar_points_updated(&self) -> usize {
        1
    }

    fn eq_grids(&self) -> &[GridId] {
        &self.grids
    }

    fn is_in_valid_domain(&self, ctx: &StencilContext, _t: Idx, c: Coords) -> bool {
        self.domain.contains(ctx.rank_size, c)
    }

    fn calc_scalar(&self, ctx: &StencilContext, t: Idx, c: Coords) {
        let g = ctx.grid(self.grids[0]);
        let (w0, w1) = self.weights(ctx);
        let mut acc = w0 * g.read_elem(t, c);
        for d in [DIM_X, DIM_Y, DIM_Z] {
            for s in [-1, 1] {
                let mut nb = c;
                nb[d] += s;
                acc += w1 * g.read_elem(t, nb);
            }
        }
        g.write_elem(acc, t + 1, c);
    }

    fn calc_cluster(&self, ctx: &StencilContext, t: Idx, vec_begin: Coords) {
        let g = ctx.grid(self.grids[0]);
        let (w0, w1) = self.weights(ctx);
        let fold = &ctx.fold;
        let lanes = Layout4321::new(fold.vlen);
        let ppv = fold.points_per_vector();
        let mut center = vec![0.0; ppv];
        let mut adjacent = vec![0.0; ppv];
        let mut acc = vec![0.0; ppv];

        // The cluster is a fixed-shape tile of clen_d vectors per dimension.
        for vn in 0..fold.clen[0] {
            for vx in 0..fold.clen[1] {
                for vy in 0..fold.clen[2] {
                    for vz in 0..fold.clen[3] {
                        let v = array4(|d| vec_begin[d] + [vn, vx, vy, vz][d]);
                        g.read_vec_norm(t, v, &mut center);
                        for (a, c) in acc.iter_mut().zip(&center) {
                            *a = w0 * c;
                        }
                        for d in [DIM_X, DIM_Y, DIM_Z] {
                            for s in [-1, 1] {
                                let mut nv = v;
                                nv[d] += s;
                                g.read_vec_norm(t, nv, &mut adjacent);
                                splice_add(
                                    fold, &lanes, d, s, w1, &center, &adjacent, &mut acc,
                                );
                            }
                        }
                        g.write_vec_norm(t + 1, v, &acc);
                    }
                }
            }
        }
    }
}

/// Accumulate `w * u(t, . ± e_d)` over all lanes of one vector
///
/// A one-element shift along `d` mostly permutes lanes of the center
/// vector; the lanes that fall off its edge come from the neighboring
/// vector along `d` instead.
fn splice_add(
    fold: &Fold,
    lanes: &Layout4321,
    d: usize,
    s: Idx,
    w: Real,
    center: &[Real],
    adjacent: &[Real],
    acc: &mut [Real],
) {
    for (l, a) in acc.iter_mut().enumerate() {
        let mut lc = lanes.unlayout(l as Idx);
        lc[d] += s;
        let val = if (0..fold.vlen[d]).contains(&lc[d]) {
            center[lanes.layout(lc) as usize]
        } else {
            lc[d] -= s * fold.vlen[d];
            adjacent[lanes.layout(lc) as usize]
        };
        *a += w * val;
    }
}

/// Assemble a single-grid 7-point problem over the given sizes
pub fn build_problem(
    name: &str,
    sizes: SizeConfig,
    fold: Fold,
    domain: Domain,
) -> Result<(StencilContext, EquationSet)> {
    let mut ctx = StencilContext::new(name, sizes, fold)?;
    let grid = ctx.add_grid("pressure", true)?;
    let coef = ctx.add_param("weights", 2);
    let eqs = EquationSet::new(
        name,
        vec![Box::new(SevenPoint::new("diffuse", grid, coef, domain))],
    );
    Ok((ctx, eqs))
}

/// Deterministic seeding for validation runs
///
/// Grid elements get a position-dependent hash on top of the per-grid seed,
/// so that transposed or shifted evaluations cannot accidentally agree. The
/// weights are normalized to sum to one, which keeps iterates bounded for
/// any number of steps.
pub fn seed_values(ctx: &mut StencilContext) {
    ctx.init_values(
        |grid, seed| {
            grid.fill_with(move |t, c| {
                let h = (c[0] * 3 + c[1] * 5 + c[2] * 7 + c[3] * 11 + t * 13).rem_euclid(32);
                seed + h as Real / 256.0
            })
        },
        |param, seed| {
            let w0 = 0.5 - seed * 0.5;
            let w1 = (1.0 - w0) / 6.0;
            param.set(0, w0);
            param.set(1, w1);
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::EPSILON;

    fn sizes(rank: Coords) -> SizeConfig {
        SizeConfig {
            rank_size: rank,
            region_size: rank,
            block_size: rank,
            halo: [0, 1, 1, 1],
            ..SizeConfig::default()
        }
    }

    #[test]
    fn sphere_domain_is_not_rectangular() {
        let d = Domain::Sphere {
            center: [0, 4, 4, 4],
            radius2: 9,
        };
        assert!(d.contains([1, 8, 8, 8], [0, 4, 4, 4]));
        assert!(d.contains([1, 8, 8, 8], [0, 4, 4, 7]));
        assert!(!d.contains([1, 8, 8, 8], [0, 4, 7, 7]));
    }

    /// The cluster path must agree with the scalar path lane for lane
    #[test]
    fn cluster_matches_scalar_under_folding() {
        let fold = Fold::z_vec(4, 2);
        // Halos must be whole vectors along z under this fold.
        let folded_sizes = SizeConfig {
            halo: [0, 1, 1, 4],
            ..sizes([1, 4, 4, 16])
        };
        let (mut scalar_ctx, _) =
            build_problem("scalar", folded_sizes, fold, Domain::Full).unwrap();
        let (mut vector_ctx, _) =
            build_problem("vector", folded_sizes, fold, Domain::Full).unwrap();
        seed_values(&mut scalar_ctx);
        seed_values(&mut vector_ctx);

        let group = SevenPoint::new("diffuse", 0, 0, Domain::Full);

        // One full step through each path.
        for n in 0..1 {
            for x in 0..4 {
                for y in 0..4 {
                    for z in 0..16 {
                        group.calc_scalar(&scalar_ctx, 0, [n, x, y, z]);
                    }
                }
            }
        }
        for x in 0..4 {
            for y in 0..4 {
                // One cluster covers 2 vectors = 8 elements along z.
                for zv in [0, 2] {
                    group.calc_cluster(&vector_ctx, 0, [0, x, y, zv]);
                }
            }
        }

        assert_eq!(scalar_ctx.grid(0).compare(vector_ctx.grid(0), EPSILON), 0);
    }
}
