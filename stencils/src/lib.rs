//! Reference stencil bindings
//!
//! In production the equation groups fed to the engine come from generated
//! code; this crate supplies hand-written stand-ins of the same shape: a
//! 7-point diffusion stencil with scalar and vectorized evaluation paths,
//! configurable domain predicates for exercising bounding-box validation,
//! and a one-call problem setup used by the driver binary and the test
//! suite.

pub mod seven_point;

pub use seven_point::{build_problem, seed_values, Domain, SevenPoint};
