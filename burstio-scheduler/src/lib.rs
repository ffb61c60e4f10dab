//! burstio scheduler
//!
//! Pulls tasks from a shard of the central queue, batches them and places
//! each batch on workers with a pluggable solver:
//! - `knapsack` - fewest workers that can hold the batch (multiple knapsack)
//! - `round_robin` - cycle through workers
//! - `random` - uniform choice
//! - `default` - best published score

pub mod knapsack;
pub mod scheduler;
pub mod solver;

pub use knapsack::{task_value, DpSolver, KnapsackSolution, MultipleKnapsack};
pub use scheduler::TaskScheduler;
pub use solver::{build_solver, DefaultSolver, RandomSolver, RoundRobinSolver, Solver};
