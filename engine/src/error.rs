//! Engine error taxonomy
//!
//! All preconditions are checked once at the boundary (bounding-box
//! discovery, communicator setup, driver entry); there is no recoverable
//! error class. Library code returns these as `Err` so that callers and
//! tests observe the diagnostic; turning one into a non-zero process exit
//! is the binary's job.

use crate::fabric::FabricError;
use data::{Coords, Idx, StorageError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The domain predicate of an equation group selected a non-rectangular
    /// point set
    #[error(
        "domain for equation group '{group}' contains {points} points, but \
         {expected} were expected for a rectangular solid; non-rectangular \
         domains are not supported"
    )]
    NonRectangularDomain {
        group: String,
        points: Idx,
        expected: Idx,
    },

    /// A bounding-box length is not a whole number of clusters
    #[error(
        "domain length {len} along {dim} for equation group '{group}' is not \
         a multiple of the cluster size {cluster}"
    )]
    PartialCluster {
        group: String,
        dim: &'static str,
        len: Idx,
        cluster: Idx,
    },

    /// A halo width is not a whole number of vectors, so halo windows could
    /// not be exchanged at vector granularity
    #[error(
        "halo width {halo} along {dim} is not a multiple of the vector \
         length {vlen}"
    )]
    UnalignedHalo {
        dim: &'static str,
        halo: Idx,
        vlen: Idx,
    },

    /// Only one time step per cluster is supported
    #[error("time cluster length {cpts_t} is not supported; expected 1")]
    TimeCluster { cpts_t: Idx },

    /// Temporal blocking (more than one time step per block) is not
    /// implemented
    #[error("temporal blocking is not yet supported (block time step {step})")]
    TemporalBlocking { step: Idx },

    /// The rank grid does not match the communicator size
    #[error("rank layout {layout:?} covers {covered} ranks, but the fabric has {num_ranks}")]
    BadRankLayout {
        layout: Coords,
        covered: Idx,
        num_ranks: usize,
    },

    /// A rank's own coordinate is not where the layout says it should be
    #[error("internal error: distance from rank {rank} to its own coordinate is {dist}")]
    SelfDistance { rank: usize, dist: Idx },

    /// Two ranks claim the same coordinate
    #[error("rank {other} is at distance 0 from rank {rank}")]
    RankCollision { rank: usize, other: usize },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Fabric(#[from] FabricError),
}
