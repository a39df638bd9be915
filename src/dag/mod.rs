// src/dag/mod.rs

//! Dependency graph representation and leveling.
//!
//! - [`graph`] holds nodes with typed (hard/soft) dependency edges and
//!   answers structural queries (validation, cycles, ancestors).
//! - [`leveler`] turns a graph into ordered execution levels.

pub mod graph;
pub mod leveler;

pub use graph::DependencyGraph;
pub use leveler::{ExecutionLevel, execution_levels};
