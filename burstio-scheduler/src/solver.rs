//! Placement policies
//!
//! Every policy maps a batch of tasks onto the workers that published a
//! status. Tasks already bound to a worker keep it; only the rest are
//! placed by the policy.

use crate::knapsack::{DpSolver, MultipleKnapsack};
use burstio_core::error::{BurstError, Result};
use burstio_core::{
    SchedulerSettings, SolverInput, SolverKind, SolverOutput, WorkerId, WorkerSettings,
    WorkerStatus,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maps a task batch to workers
pub trait Solver: Send + Sync {
    fn solve(&self, input: SolverInput, workers: &[WorkerStatus]) -> Result<SolverOutput>;
}

/// Create the solver selected in the settings
pub fn build_solver(scheduler: &SchedulerSettings, worker: &WorkerSettings) -> Box<dyn Solver> {
    match scheduler.solver {
        SolverKind::Knapsack => Box::new(DpSolver::new(
            MultipleKnapsack::new(scheduler.knapsack_node_limit),
            scheduler.max_workers_per_batch,
            worker.energy,
        )),
        SolverKind::RoundRobin => Box::new(RoundRobinSolver::new()),
        SolverKind::Random => Box::new(RandomSolver::new()),
        SolverKind::Default => Box::new(DefaultSolver),
    }
}

/// Place every unpinned task with `pick`, keeping pinned ones in place
fn place_with<F>(input: SolverInput, workers: &[WorkerStatus], mut pick: F) -> Result<SolverOutput>
where
    F: FnMut() -> WorkerId,
{
    let (pinned, free) = input.partition_pinned();
    if !free.is_empty() && workers.is_empty() {
        return Err(BurstError::NoSolution {
            tasks: free.len(),
            max_workers: 0,
        });
    }

    let mut placements: Vec<WorkerId> = vec![0; input.len()];
    for (slot, worker) in pinned {
        placements[slot] = worker;
    }
    for slot in free {
        placements[slot] = pick();
    }
    Ok(SolverOutput::from_placements(input.tasks, &placements))
}

/// Cycles through workers, continuing across batches
#[derive(Debug, Default)]
pub struct RoundRobinSolver {
    next: AtomicUsize,
}

impl RoundRobinSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Solver for RoundRobinSolver {
    fn solve(&self, input: SolverInput, workers: &[WorkerStatus]) -> Result<SolverOutput> {
        place_with(input, workers, || {
            let turn = self.next.fetch_add(1, Ordering::Relaxed);
            workers[turn % workers.len()].id
        })
    }
}

/// Uniformly random worker per task
pub struct RandomSolver {
    rng: Mutex<StdRng>,
}

impl RandomSolver {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic sequence, for tests and reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Solver for RandomSolver {
    fn solve(&self, input: SolverInput, workers: &[WorkerStatus]) -> Result<SolverOutput> {
        let mut rng = self.rng.lock();
        place_with(input, workers, || workers[rng.gen_range(0..workers.len())].id)
    }
}

/// Everything to the best-scored worker, lowest id on ties
#[derive(Debug, Default)]
pub struct DefaultSolver;

impl Solver for DefaultSolver {
    fn solve(&self, input: SolverInput, workers: &[WorkerStatus]) -> Result<SolverOutput> {
        let best = workers
            .iter()
            .max_by(|a, b| a.score.total_cmp(&b.score).then(b.id.cmp(&a.id)))
            .map(|w| w.id);
        place_with(input, workers, || best.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burstio_core::{File, Location, Task, TaskId, TaskKind};

    fn make_read(id: u64, worker: Option<WorkerId>) -> Task {
        let mut source = File::new(Location::Pfs, "f", id * 10, 10);
        source.worker = worker;
        Task::new(
            TaskKind::Read,
            TaskId(id),
            source,
            File::new(Location::Cache, format!("f#read{}", id), id * 10, 10),
        )
    }

    fn make_workers(scores: &[f64]) -> Vec<WorkerStatus> {
        scores
            .iter()
            .enumerate()
            .map(|(i, &score)| WorkerStatus {
                id: i as WorkerId,
                score,
                capacity: 1 << 30,
            })
            .collect()
    }

    fn batch(n: u64) -> SolverInput {
        SolverInput::new((0..n).map(|i| make_read(i, None)).collect())
    }

    #[test]
    fn test_round_robin_continues_across_batches() {
        let solver = RoundRobinSolver::new();
        let workers = make_workers(&[100.0, 100.0, 100.0]);

        let first = solver.solve(batch(2), &workers).unwrap();
        let second = solver.solve(batch(2), &workers).unwrap();
        assert_eq!(first.assignment[&TaskId(0)], 0);
        assert_eq!(first.assignment[&TaskId(1)], 1);
        assert_eq!(second.assignment[&TaskId(0)], 2);
        assert_eq!(second.assignment[&TaskId(1)], 0);
    }

    #[test]
    fn test_random_stays_in_range() {
        let solver = RandomSolver::with_seed(7);
        let workers = make_workers(&[100.0, 100.0]);
        let output = solver.solve(batch(50), &workers).unwrap();
        assert_eq!(output.task_count(), 50);
        assert!(output.by_worker.keys().all(|w| *w < 2));
    }

    #[test]
    fn test_default_picks_best_score() {
        let workers = make_workers(&[120.0, 310.5, 310.5, 90.0]);
        let output = DefaultSolver.solve(batch(3), &workers).unwrap();
        assert_eq!(output.by_worker.len(), 1);
        assert_eq!(output.by_worker[&1].len(), 3);
    }

    #[test]
    fn test_pinned_tasks_keep_worker() {
        let input = SolverInput::new(vec![make_read(0, Some(5)), make_read(1, None)]);
        let output = RoundRobinSolver::new()
            .solve(input, &make_workers(&[100.0]))
            .unwrap();
        assert_eq!(output.assignment[&TaskId(0)], 5);
        assert_eq!(output.assignment[&TaskId(1)], 0);
    }

    #[test]
    fn test_no_workers() {
        let err = RoundRobinSolver::new().solve(batch(1), &[]).unwrap_err();
        assert!(matches!(err, BurstError::NoSolution { tasks: 1, .. }));

        // Only pinned tasks need no worker list
        let input = SolverInput::new(vec![make_read(0, Some(2))]);
        assert!(DefaultSolver.solve(input, &[]).is_ok());
    }

    #[test]
    fn test_build_solver() {
        let mut scheduler = SchedulerSettings::default();
        let worker = WorkerSettings::default();
        for kind in [
            SolverKind::Knapsack,
            SolverKind::RoundRobin,
            SolverKind::Random,
            SolverKind::Default,
        ] {
            scheduler.solver = kind;
            let solver = build_solver(&scheduler, &worker);
            let output = solver.solve(batch(4), &make_workers(&[100.0, 200.0])).unwrap();
            assert_eq!(output.task_count(), 4);
        }
    }
}
