//! Placement solver input and output

use crate::types::{Task, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Worker identifier, also the index of its queue
pub type WorkerId = u32;

/// Score and remaining capacity a worker last published
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub score: f64,
    pub capacity: u64,
}

/// A batch of pending tasks with their byte sizes
#[derive(Debug, Clone, Default)]
pub struct SolverInput {
    pub tasks: Vec<Task>,
    pub sizes: Vec<u64>,
}

impl SolverInput {
    pub fn new(tasks: Vec<Task>) -> Self {
        let sizes = tasks.iter().map(Task::size).collect();
        Self { tasks, sizes }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Split task indices into those already bound to a worker and the rest
    pub fn partition_pinned(&self) -> (Vec<(usize, WorkerId)>, Vec<usize>) {
        let mut pinned = Vec::new();
        let mut free = Vec::new();
        for (i, task) in self.tasks.iter().enumerate() {
            match task.pinned_worker() {
                Some(worker) => pinned.push((i, worker)),
                None => free.push(i),
            }
        }
        (pinned, free)
    }
}

/// Task to worker mapping, also grouped per worker
#[derive(Debug, Clone, Default)]
pub struct SolverOutput {
    pub assignment: HashMap<TaskId, WorkerId>,
    pub by_worker: BTreeMap<WorkerId, Vec<Task>>,
}

impl SolverOutput {
    /// Build the output from tasks and an index-aligned list of workers
    pub fn from_placements(tasks: Vec<Task>, placements: &[WorkerId]) -> Self {
        let mut output = SolverOutput::default();
        for (task, &worker) in tasks.into_iter().zip(placements) {
            output.assignment.insert(task.task_id, worker);
            output.by_worker.entry(worker).or_default().push(task);
        }
        output
    }

    pub fn task_count(&self) -> usize {
        self.assignment.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{File, Location, TaskKind};

    fn make_task(id: u64, worker: Option<WorkerId>) -> Task {
        let mut source = File::new(Location::Buffers, format!("f#{}", id), 0, 100);
        source.worker = worker;
        Task::new(
            TaskKind::Read,
            TaskId(id),
            source,
            File::new(Location::Cache, format!("f#r{}", id), 0, 100),
        )
    }

    #[test]
    fn test_partition_pinned() {
        let input = SolverInput::new(vec![make_task(1, None), make_task(2, Some(4)), make_task(3, None)]);
        let (pinned, free) = input.partition_pinned();
        assert_eq!(pinned, vec![(1, 4)]);
        assert_eq!(free, vec![0, 2]);
        assert_eq!(input.sizes, vec![100, 100, 100]);
    }

    #[test]
    fn test_from_placements() {
        let tasks = vec![make_task(1, None), make_task(2, None), make_task(3, None)];
        let output = SolverOutput::from_placements(tasks, &[0, 1, 0]);
        assert_eq!(output.task_count(), 3);
        assert_eq!(output.assignment[&TaskId(2)], 1);
        assert_eq!(output.by_worker[&0].len(), 2);
        assert_eq!(output.by_worker[&1][0].task_id, TaskId(2));
    }
}
