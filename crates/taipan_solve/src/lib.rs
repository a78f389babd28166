#![deny(missing_docs)]

//! `taipan_solve` turns match specs plus installed state into an ordered
//! set of install/remove decisions by solving a SAT-style rule system over
//! an indexed package [`Pool`].
//!
//! The crate exposes:
//!
//! * [`Pool`]: interning of package names and dependency specs,
//!   repos of solvables, and the what-provides index.
//! * [`Solver`]: the solve loop: job encoding, unit propagation,
//!   chronological backtracking, decision queue output.
//! * [`Problem`]: the structured conflict report returned when no
//!   solution exists, with graph compression and human readable rendering.

mod conflict_map;
mod id;
mod jobs;
mod pool;
mod problem;
mod rules;
mod solvable;
mod solver;
mod sorting;

pub use conflict_map::ConflictMap;
pub use id::{NameId, RepoId, RuleId, SolvableId, SpecId};
pub use jobs::{SolveJob, SolveJobs, SolveOperation, SolverFlags};
pub use pool::{Pool, Repo};
pub use problem::{
    ConflictKind, DisplayUnsat, MergedProblemNode, Problem, ProblemEdge, ProblemNode,
    ProblemsGraph,
};
pub use solvable::PackageSolvable;
pub use solver::{Solution, SolveStep, Solver};

/// The error of a failed solve.
#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    /// There is no set of packages that satisfies the jobs. The payload
    /// cites the conflicting rules; render it with
    /// [`Solver::display_problem`].
    #[error("the requested packages cannot be installed together")]
    Unsolvable(Problem),

    /// A removal was requested for specs that are not installed.
    #[error("the following packages are not installed: {}", .0.join(", "))]
    NotInstalled(Vec<String>),

    /// A dependency string in the repodata could not be parsed.
    #[error(transparent)]
    InvalidMatchSpec(#[from] taipan_conda_types::ParseMatchSpecError),
}
