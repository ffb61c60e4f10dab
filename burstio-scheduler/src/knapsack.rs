//! Knapsack placement
//!
//! `MultipleKnapsack` packs weighted items into bins of fixed capacity,
//! maximizing the total value of the items packed. `DpSolver` runs it for a
//! growing number of workers, smallest remaining capacity first, and keeps
//! the first worker count that places every task. When the bounded search
//! gave up before proving a batch infeasible, one unbounded search over
//! every allowed worker settles it.

use crate::solver::Solver;
use burstio_core::error::{BurstError, Result};
use burstio_core::{SolverInput, SolverOutput, WorkerId, WorkerStatus};
use tracing::{debug, instrument, warn};

/// Result of one multiple-knapsack run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnapsackSolution {
    /// Sum of the values of packed items
    pub value: u64,
    /// Bin of each item, `None` when left out
    pub assignment: Vec<Option<usize>>,
    /// False when the node limit cut the search short, so a better
    /// packing may exist
    pub exhausted: bool,
}

impl KnapsackSolution {
    /// Whether every item got a bin
    pub fn is_complete(&self) -> bool {
        self.assignment.iter().all(Option::is_some)
    }
}

/// Branch-and-bound multiple-knapsack solver.
///
/// Starts from a best-fit-decreasing packing and searches for better ones
/// until the bound proves optimality or `node_limit` search nodes have
/// been expanded, in which case the best packing found so far is returned.
#[derive(Debug, Clone)]
pub struct MultipleKnapsack {
    node_limit: usize,
}

impl MultipleKnapsack {
    pub fn new(node_limit: usize) -> Self {
        Self {
            node_limit: node_limit.max(1),
        }
    }

    pub fn solve(&self, values: &[u64], weights: &[u64], capacities: &[u64]) -> KnapsackSolution {
        self.search(values, weights, capacities, self.node_limit)
    }

    /// Search without a node limit
    pub fn solve_exact(&self, values: &[u64], weights: &[u64], capacities: &[u64]) -> KnapsackSolution {
        self.search(values, weights, capacities, usize::MAX)
    }

    fn search(
        &self,
        values: &[u64],
        weights: &[u64],
        capacities: &[u64],
        node_limit: usize,
    ) -> KnapsackSolution {
        let n = values.len().min(weights.len());

        // Heaviest first, the most valuable breaking ties
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| weights[b].cmp(&weights[a]).then(values[b].cmp(&values[a])));

        let greedy = best_fit(&order, values, weights, capacities);
        if greedy.is_complete() || capacities.is_empty() {
            return greedy;
        }

        // suffix[i] = value of order[i..], the optimistic bound
        let mut suffix = vec![0u64; n + 1];
        for i in (0..n).rev() {
            suffix[i] = suffix[i + 1] + values[order[i]];
        }

        let mut search = Search {
            order: &order,
            values,
            weights,
            suffix: &suffix,
            remaining: capacities.to_vec(),
            current: vec![None; n],
            value: 0,
            best_value: greedy.value,
            best: greedy.assignment,
            nodes: 0,
            node_limit,
            truncated: false,
        };
        search.descend(0);

        if search.truncated {
            debug!(nodes = search.nodes, "Knapsack search hit node limit");
        }

        KnapsackSolution {
            value: search.best_value,
            assignment: search.best,
            exhausted: !search.truncated,
        }
    }
}

/// Best-fit decreasing: each item goes to the fullest bin that still holds it
fn best_fit(order: &[usize], values: &[u64], weights: &[u64], capacities: &[u64]) -> KnapsackSolution {
    let mut remaining = capacities.to_vec();
    let mut assignment = vec![None; order.len()];
    let mut value = 0;

    for &item in order {
        let bin = remaining
            .iter()
            .enumerate()
            .filter(|(_, &room)| room >= weights[item])
            .min_by_key(|(_, &room)| room)
            .map(|(bin, _)| bin);

        if let Some(bin) = bin {
            remaining[bin] -= weights[item];
            assignment[item] = Some(bin);
            value += values[item];
        }
    }

    KnapsackSolution {
        value,
        assignment,
        exhausted: true,
    }
}

struct Search<'a> {
    order: &'a [usize],
    values: &'a [u64],
    weights: &'a [u64],
    suffix: &'a [u64],
    remaining: Vec<u64>,
    current: Vec<Option<usize>>,
    value: u64,
    best_value: u64,
    best: Vec<Option<usize>>,
    nodes: usize,
    node_limit: usize,
    truncated: bool,
}

impl Search<'_> {
    fn descend(&mut self, pos: usize) {
        if self.value + self.suffix[pos] <= self.best_value {
            return;
        }
        if self.nodes >= self.node_limit {
            self.truncated = true;
            return;
        }
        self.nodes += 1;
        if pos == self.order.len() {
            self.best_value = self.value;
            self.best.clone_from(&self.current);
            return;
        }

        let item = self.order[pos];
        let weight = self.weights[item];

        // Bins with equal room are interchangeable; try one of each
        let mut tried: Vec<u64> = Vec::new();
        for bin in 0..self.remaining.len() {
            let room = self.remaining[bin];
            if room < weight || tried.contains(&room) {
                continue;
            }
            tried.push(room);

            self.remaining[bin] -= weight;
            self.current[item] = Some(bin);
            self.value += self.values[item];

            self.descend(pos + 1);

            self.value -= self.values[item];
            self.current[item] = None;
            self.remaining[bin] += weight;
        }

        self.descend(pos + 1);
    }
}

/// Value of a task placed on a worker with this score
pub fn task_value(score: f64, energy: u32) -> u64 {
    let value = 100.0 + score - f64::from(energy) * 100.0 / 5.0;
    value.max(1.0) as u64
}

/// Knapsack placement policy
pub struct DpSolver {
    knapsack: MultipleKnapsack,
    max_workers: Option<usize>,
    energy: u32,
}

impl DpSolver {
    pub fn new(knapsack: MultipleKnapsack, max_workers: Option<usize>, energy: u32) -> Self {
        Self {
            knapsack,
            max_workers,
            energy,
        }
    }
}

impl DpSolver {
    /// Item values and bin capacities for a set of workers
    fn bins_of(&self, bins: &[WorkerStatus], items: usize) -> (Vec<u64>, Vec<u64>) {
        let value = bins
            .iter()
            .map(|w| task_value(w.score, self.energy))
            .min()
            .unwrap_or(1);
        let capacities = bins.iter().map(|w| w.capacity).collect();
        (vec![value; items], capacities)
    }
}

impl Solver for DpSolver {
    #[instrument(skip(self, input, workers), fields(tasks = input.len(), workers = workers.len()))]
    fn solve(&self, input: SolverInput, workers: &[WorkerStatus]) -> Result<SolverOutput> {
        let (pinned, free) = input.partition_pinned();
        let mut placements: Vec<WorkerId> = vec![0; input.len()];
        for (slot, worker) in pinned {
            placements[slot] = worker;
        }
        if free.is_empty() {
            return Ok(SolverOutput::from_placements(input.tasks, &placements));
        }

        let mut sorted = workers.to_vec();
        sorted.sort_by_key(|w| (w.capacity, w.id));
        let max_k = self
            .max_workers
            .unwrap_or(sorted.len())
            .min(sorted.len());

        let weights: Vec<u64> = free.iter().map(|&i| input.sizes[i]).collect();
        let mut unproven = false;

        for k in 1..=max_k {
            let bins = &sorted[..k];
            let (values, capacities) = self.bins_of(bins, weights.len());
            let solution = self.knapsack.solve(&values, &weights, &capacities);
            if !solution.is_complete() {
                unproven |= !solution.exhausted;
                continue;
            }

            for (&slot, bin) in free.iter().zip(solution.assignment.iter().flatten()) {
                placements[slot] = bins[*bin].id;
            }
            debug!(k, value = solution.value, "Knapsack placement found");
            return Ok(SolverOutput::from_placements(input.tasks, &placements));
        }

        if unproven && max_k > 0 {
            warn!(
                tasks = free.len(),
                max_workers = max_k,
                "Knapsack search truncated, retrying without node limit"
            );
            let bins = &sorted[..max_k];
            let (values, capacities) = self.bins_of(bins, weights.len());
            let solution = self.knapsack.solve_exact(&values, &weights, &capacities);
            if solution.is_complete() {
                for (&slot, bin) in free.iter().zip(solution.assignment.iter().flatten()) {
                    placements[slot] = bins[*bin].id;
                }
                return Ok(SolverOutput::from_placements(input.tasks, &placements));
            }
        }

        warn!(tasks = free.len(), max_workers = max_k, "No knapsack placement fits");
        Err(BurstError::NoSolution {
            tasks: free.len(),
            max_workers: max_k,
        })
    }
}
