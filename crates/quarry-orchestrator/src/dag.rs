use quarry_core::{QuarryError, QuarryResult, Worker, WorkerId, WorkerStatus};
use std::collections::{HashMap, VecDeque};

/// Worker dependency graph.
///
/// Workers live in an arena indexed by position. Edges are kept separately:
/// `dependencies[i]` lists what node `i` waits on and `dependents[i]` lists
/// the nodes waiting on `i`. `remaining[i]` counts dependencies that have not
/// completed yet, so readiness is a counter check rather than a scan.
#[derive(Debug, Clone)]
pub struct WorkerGraph {
    nodes: Vec<Worker>,
    index: HashMap<WorkerId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    remaining: Vec<usize>,
}

impl WorkerGraph {
    /// Builds the graph, rejecting duplicate ids, unknown dependency ids and
    /// cycles with `QuarryError::InvalidGraph`.
    pub fn new(workers: Vec<Worker>) -> QuarryResult<Self> {
        let mut index = HashMap::with_capacity(workers.len());
        for (i, worker) in workers.iter().enumerate() {
            if index.insert(worker.id, i).is_some() {
                return Err(QuarryError::InvalidGraph(format!(
                    "duplicate worker id {}",
                    worker.id
                )));
            }
        }

        let mut dependencies = vec![Vec::new(); workers.len()];
        let mut dependents = vec![Vec::new(); workers.len()];
        for (i, worker) in workers.iter().enumerate() {
            for dep in &worker.dependencies {
                let Some(&j) = index.get(dep) else {
                    return Err(QuarryError::InvalidGraph(format!(
                        "worker {} depends on unknown worker {dep}",
                        worker.sequence
                    )));
                };
                if !dependencies[i].contains(&j) {
                    dependencies[i].push(j);
                    dependents[j].push(i);
                }
            }
        }

        let remaining = dependencies
            .iter()
            .map(|deps| {
                deps.iter()
                    .filter(|&&j| workers[j].status != WorkerStatus::Complete)
                    .count()
            })
            .collect();

        let graph = Self {
            nodes: workers,
            index,
            dependencies,
            dependents,
            remaining,
        };
        if let Some(i) = graph.find_cycle() {
            return Err(QuarryError::InvalidGraph(format!(
                "dependency cycle through worker {}",
                graph.nodes[i].sequence
            )));
        }
        Ok(graph)
    }

    /// Returns the index of some node on a cycle.
    fn find_cycle(&self) -> Option<usize> {
        // 0 = unvisited, 1 = in progress, 2 = done
        let mut marks = vec![0u8; self.nodes.len()];
        (0..self.nodes.len()).find(|&i| self.dfs_cycle(i, &mut marks))
    }

    fn dfs_cycle(&self, i: usize, marks: &mut [u8]) -> bool {
        match marks[i] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        marks[i] = 1;
        for &dep in &self.dependencies[i] {
            if self.dfs_cycle(dep, marks) {
                return true;
            }
        }
        marks[i] = 2;
        false
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn worker(&self, i: usize) -> &Worker {
        &self.nodes[i]
    }

    /// Mutable access for recording output. Status changes go through
    /// [`transition`](Self::transition) so the counters stay in step.
    pub fn worker_mut(&mut self, i: usize) -> &mut Worker {
        &mut self.nodes[i]
    }

    pub fn index_of(&self, id: &WorkerId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.nodes
    }

    pub fn into_workers(self) -> Vec<Worker> {
        self.nodes
    }

    /// Moves node `i` to `to`. Completing a node releases its dependents.
    pub fn transition(&mut self, i: usize, to: WorkerStatus) -> QuarryResult<()> {
        self.nodes[i].transition(to)?;
        if to == WorkerStatus::Complete {
            for &d in &self.dependents[i] {
                self.remaining[d] = self.remaining[d].saturating_sub(1);
            }
        }
        Ok(())
    }

    /// Pending nodes whose dependencies have all completed, in sequence order.
    pub fn ready(&self) -> Vec<usize> {
        let mut ready: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].status == WorkerStatus::Pending && self.remaining[i] == 0)
            .collect();
        ready.sort_by_key(|&i| self.nodes[i].sequence);
        ready
    }

    /// Pending nodes, in sequence order.
    pub fn pending(&self) -> Vec<usize> {
        let mut pending: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].status == WorkerStatus::Pending)
            .collect();
        pending.sort_by_key(|&i| self.nodes[i].sequence);
        pending
    }

    /// Pending nodes with a dependency that ended without completing.
    pub fn blocked(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| {
                self.nodes[i].status == WorkerStatus::Pending
                    && self.dependencies[i].iter().any(|&j| {
                        let status = self.nodes[j].status;
                        status.is_terminal() && status != WorkerStatus::Complete
                    })
            })
            .collect()
    }

    /// Marks every pending node downstream of `i` as Skipped and returns
    /// them in the order they were reached.
    pub fn skip_dependents_of(&mut self, i: usize) -> Vec<usize> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<(usize, usize)> =
            self.dependents[i].iter().map(|&d| (d, i)).collect();
        while let Some((node, cause)) = queue.pop_front() {
            if self.nodes[node].status != WorkerStatus::Pending {
                continue;
            }
            let cause_seq = self.nodes[cause].sequence;
            let worker = &mut self.nodes[node];
            if worker.transition(WorkerStatus::Skipped).is_err() {
                continue;
            }
            worker.error = Some(format!("dependency {cause_seq} did not complete"));
            skipped.push(node);
            queue.extend(self.dependents[node].iter().map(|&d| (d, node)));
        }
        skipped
    }

    /// Kahn order, ties broken by sequence number.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut indegree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut frontier: Vec<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !frontier.is_empty() {
            frontier.sort_by_key(|&i| std::cmp::Reverse(self.nodes[i].sequence));
            let Some(i) = frontier.pop() else { break };
            order.push(i);
            for &d in &self.dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    frontier.push(d);
                }
            }
        }
        order
    }

    /// Every node reached a terminal status.
    pub fn is_done(&self) -> bool {
        self.nodes.iter().all(|w| w.status.is_terminal())
    }
}
