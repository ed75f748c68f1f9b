use anyhow::{bail, Context};
use clap::Parser;
use data::{fold::Fold, Coords, Idx};
use engine::{Fabric, LocalFabric, SizeConfig};
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;
use stencils::{build_problem, seed_values, Domain};

/// Drive the tiled stencil engine over a synthetic diffusion problem
#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of time steps
    #[arg(long, default_value_t = 10)]
    dt: Idx,

    /// Rank domain size along n
    #[arg(long, default_value_t = 1)]
    dn: Idx,

    /// Rank domain size along x
    #[arg(long, default_value_t = 64)]
    dx: Idx,

    /// Rank domain size along y
    #[arg(long, default_value_t = 64)]
    dy: Idx,

    /// Rank domain size along z
    #[arg(long, default_value_t = 64)]
    dz: Idx,

    /// Time steps per region (wavefront depth)
    #[arg(long, default_value_t = 1)]
    rt: Idx,

    /// Region size along each of x/y/z; 0 means the whole domain
    #[arg(long, default_value_t = 0)]
    rx: Idx,
    #[arg(long, default_value_t = 0)]
    ry: Idx,
    #[arg(long, default_value_t = 0)]
    rz: Idx,

    /// Block size along each of x/y/z; 0 means one block per region
    #[arg(long, default_value_t = 16)]
    bx: Idx,
    #[arg(long, default_value_t = 16)]
    by: Idx,
    #[arg(long, default_value_t = 16)]
    bz: Idx,

    /// Stencil halo width along x/y/z
    #[arg(long, default_value_t = 1)]
    halo: Idx,

    /// SIMD lanes along z
    #[arg(long, default_value_t = 1)]
    vlen_z: Idx,

    /// Cluster length along z, in vectors
    #[arg(long, default_value_t = 1)]
    clen_z: Idx,

    /// Number of ranks to run in this process (threads over an in-process
    /// fabric); ignored under MPI, where the launcher decides
    #[arg(long, default_value_t = 1)]
    num_ranks: usize,

    /// Rank mesh extent along x; 0 lays all ranks out along x
    #[arg(long, default_value_t = 0)]
    nrx: Idx,

    /// Worker threads inside each region; 0 uses the shared pool
    #[arg(long, default_value_t = 0)]
    region_threads: usize,

    /// Copy interiors to shadow grids every this many steps (0 = never)
    #[arg(long, default_value_t = 0)]
    shadow_out: Idx,

    /// Copy shadow grids back every this many steps (0 = never)
    #[arg(long, default_value_t = 0)]
    shadow_in: Idx,

    /// Also run the scalar reference and compare (single rank only)
    #[arg(long)]
    validate: bool,
}
//
impl Args {
    fn size_config(&self) -> SizeConfig {
        let rank_size: Coords = [self.dn, self.dx, self.dy, self.dz];
        let pick = |v: Idx, whole: Idx| if v == 0 { whole } else { v };
        let region_size: Coords = [
            self.dn,
            pick(self.rx, self.dx),
            pick(self.ry, self.dy),
            pick(self.rz, self.dz),
        ];
        let block_size: Coords = [
            self.dn,
            pick(self.bx, region_size[1]),
            pick(self.by, region_size[2]),
            pick(self.bz, region_size[3]),
        ];
        SizeConfig {
            dt: self.dt,
            rank_size,
            region_time: self.rt,
            region_size,
            block_size,
            halo: [0, self.halo, self.halo, self.halo],
            shadow_out_freq: self.shadow_out,
            shadow_in_freq: self.shadow_in,
            ..SizeConfig::default()
        }
    }

    fn fold(&self) -> Fold {
        Fold::z_vec(self.vlen_z, self.clen_z)
    }

    fn rank_layout(&self, num_ranks: usize) -> Coords {
        if self.nrx == 0 {
            [1, num_ranks as Idx, 1, 1]
        } else {
            [1, self.nrx, 1, 1]
        }
    }
}

/// What one rank reports back after its run
struct RankReport {
    rank: usize,
    bytes: usize,
    elapsed: f64,
    points_per_step: Idx,
    mpi_time: f64,
    shadow_time: f64,
    mismatches: Option<usize>,
}

/// Allocate, seed, run and (optionally) validate one rank
fn run_rank(args: &Args, fabric: Arc<dyn Fabric>, layout: Coords) -> anyhow::Result<RankReport> {
    let rank = fabric.my_rank();
    let sizes = args.size_config();
    let fold = args.fold();

    let (mut ctx, mut eqs) = build_problem("diffusion", sizes, fold, Domain::Full)
        .context("failed to set up problem")?;
    let bytes = ctx.alloc_all(fabric.clone(), layout, true)?;
    if let Some(threads) = std::num::NonZeroUsize::new(args.region_threads) {
        ctx.set_region_threads(Some(threads));
    }
    seed_values(&mut ctx);
    let stats = eqs.init(&mut ctx)?;

    let start = Instant::now();
    eqs.calc_rank_opt(&mut ctx)?;
    let elapsed = start.elapsed().as_secs_f64();

    let mismatches = if args.validate {
        if fabric.num_ranks() > 1 {
            warn!("validation is only wired up for single-rank runs; skipping");
            None
        } else {
            let (mut ref_ctx, mut ref_eqs) =
                build_problem("reference", sizes, fold, Domain::Full)?;
            seed_values(&mut ref_ctx);
            ref_eqs.calc_rank_ref(&mut ref_ctx)?;
            Some(ctx.compare(&ref_ctx))
        }
    } else {
        None
    };

    Ok(RankReport {
        rank,
        bytes,
        elapsed,
        points_per_step: stats.points_updated,
        mpi_time: ctx.mpi_time,
        shadow_time: ctx.shadow_time,
        mismatches,
    })
}

fn report(reports: &[RankReport], dt: Idx) -> anyhow::Result<()> {
    let mut failed = false;
    for r in reports {
        let total_points = r.points_per_step * dt;
        let rate = total_points as f64 / r.elapsed.max(1e-9);
        println!(
            "rank {}: {} bytes allocated, {} point-updates in {:.3}s \
             ({:.3e} points/s, {:.3}s exchanging, {:.3}s shadowing)",
            r.rank, r.bytes, total_points, r.elapsed, rate, r.mpi_time, r.shadow_time
        );
        match r.mismatches {
            Some(0) => println!("rank {}: validation PASSED", r.rank),
            Some(n) => {
                println!("rank {}: validation FAILED with {n} mismatches", r.rank);
                failed = true;
            }
            None => {}
        }
    }
    if failed {
        bail!("validation failed");
    }
    Ok(())
}

#[cfg(feature = "mpi")]
fn main() -> anyhow::Result<()> {
    use engine::fabric::mpi_fabric::MpiFabric;
    use mpi::traits::Communicator;

    env_logger::init();
    let args = Args::parse();
    let universe = mpi::initialize().context("failed to initialize MPI")?;
    let world = universe.world();
    let num_ranks = world.size() as usize;
    let fabric: Arc<dyn Fabric> = Arc::new(MpiFabric::new(world));
    info!("running on {num_ranks} MPI rank(s)");
    let layout = args.rank_layout(num_ranks);
    let r = run_rank(&args, fabric, layout)?;
    report(&[r], args.dt)
}

#[cfg(not(feature = "mpi"))]
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let num_ranks = args.num_ranks.max(1);
    let layout = args.rank_layout(num_ranks);
    info!("running {num_ranks} rank(s) over the in-process fabric");

    let mut handles = Vec::new();
    for fabric in LocalFabric::mesh(num_ranks) {
        let args = args.clone();
        handles.push(std::thread::spawn(move || {
            run_rank(&args, Arc::new(fabric), layout)
        }));
    }
    let mut reports = Vec::new();
    for handle in handles {
        reports.push(handle.join().expect("rank thread panicked")?);
    }
    reports.sort_by_key(|r| r.rank);
    report(&reports, args.dt)
}
