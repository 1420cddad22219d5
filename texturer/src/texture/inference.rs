use log::debug;
use petgraph::unionfind::UnionFind;
use rayon::prelude::*;

use base::defs::{Error, ErrorKind::*, Result};

/// Cost of disagreeing neighbours and of the undefined label.
pub const MAX_ENERGY: f64 = 1.0;

/// Smoothness prior: free when both neighbours pick the same defined view.
pub fn potts(l1: usize, l2: usize) -> f64 {
    if l1 == l2 && l1 != 0 {
        0.0
    } else {
        MAX_ENERGY
    }
}

/// Discrete pairwise labeling problem. A node may only take the labels it
/// has a data cost for.
pub struct LabelingProblem {
    pub num_labels: usize,
    pub data_costs: Vec<Vec<(usize, f64)>>,
    pub edges: Vec<[usize; 2]>,
    pub smoothness: fn(usize, usize) -> f64,
}

impl LabelingProblem {
    pub fn new(num_nodes: usize, num_labels: usize) -> LabelingProblem {
        LabelingProblem {
            num_labels,
            data_costs: vec![vec![]; num_nodes],
            edges: vec![],
            smoothness: potts,
        }
    }

    pub fn set_data_cost(&mut self, node: usize, label: usize, cost: f64) {
        let costs = &mut self.data_costs[node];
        match costs.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = cost,
            None => costs.push((label, cost)),
        }
    }

    pub fn add_edge(&mut self, a: usize, b: usize) {
        self.edges.push([a, b]);
    }

    pub fn energy(&self, labels: &[usize]) -> f64 {
        let data: f64 = self
            .data_costs
            .iter()
            .zip(labels)
            .map(|(costs, &label)| {
                costs
                    .iter()
                    .find(|(l, _)| *l == label)
                    .map_or(f64::INFINITY, |(_, c)| *c)
            })
            .sum();
        let smooth: f64 = self
            .edges
            .iter()
            .map(|&[a, b]| (self.smoothness)(labels[a], labels[b]))
            .sum();
        data + smooth
    }

    fn validate(&self) -> Result<()> {
        for (node, costs) in self.data_costs.iter().enumerate() {
            if costs.is_empty() {
                return Err(Error::new(
                    BadParameter,
                    format!("node {} has no candidate labels", node),
                ));
            }
            if let Some((label, _)) = costs.iter().find(|(l, _)| *l >= self.num_labels) {
                return Err(Error::new(
                    BadParameter,
                    format!("node {} uses label {} out of range", node, label),
                ));
            }
        }
        let num_nodes = self.data_costs.len();
        if let Some(edge) = self.edges.iter().find(|e| e[0] >= num_nodes || e[1] >= num_nodes) {
            return Err(Error::new(
                BadParameter,
                format!("edge {:?} references a missing node", edge),
            ));
        }
        Ok(())
    }
}

pub trait EnergyMinimizer {
    fn minimize(&self, problem: &LabelingProblem) -> Result<Vec<usize>>;
}

/// Synchronous min-sum loopy belief propagation. Returns the lowest energy
/// labeling seen over all iterations.
pub struct LoopyBeliefPropagation {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for LoopyBeliefPropagation {
    fn default() -> Self {
        LoopyBeliefPropagation {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

fn beliefs(
    problem: &LabelingProblem,
    incoming: &[Vec<usize>],
    messages: &[Vec<f64>],
    node: usize,
) -> Vec<f64> {
    let mut belief: Vec<f64> = problem.data_costs[node].iter().map(|(_, c)| *c).collect();
    for &msg in &incoming[node] {
        for (b, m) in belief.iter_mut().zip(&messages[msg]) {
            *b += m;
        }
    }
    belief
}

fn decode(problem: &LabelingProblem, incoming: &[Vec<usize>], messages: &[Vec<f64>]) -> Vec<usize> {
    (0..problem.data_costs.len())
        .map(|node| {
            let belief = beliefs(problem, incoming, messages, node);
            let best = belief
                .iter()
                .enumerate()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map_or(0, |(i, _)| i);
            problem.data_costs[node][best].0
        })
        .collect()
}

impl EnergyMinimizer for LoopyBeliefPropagation {
    fn minimize(&self, problem: &LabelingProblem) -> Result<Vec<usize>> {
        problem.validate()?;
        let num_nodes = problem.data_costs.len();

        // Directed message 2e goes a -> b along edge e, 2e + 1 goes b -> a.
        let targets: Vec<(usize, usize)> = problem
            .edges
            .iter()
            .flat_map(|&[a, b]| [(a, b), (b, a)])
            .collect();
        let mut incoming = vec![vec![]; num_nodes];
        for (msg, &(_, to)) in targets.iter().enumerate() {
            incoming[to].push(msg);
        }
        let mut messages: Vec<Vec<f64>> = targets
            .iter()
            .map(|&(_, to)| vec![0.0; problem.data_costs[to].len()])
            .collect();

        let mut best_labels = decode(problem, &incoming, &messages);
        let mut best_energy = problem.energy(&best_labels);
        for iteration in 0..self.max_iterations {
            let updated: Vec<Vec<f64>> = targets
                .par_iter()
                .enumerate()
                .map(|(msg, &(from, to))| {
                    let mut h = beliefs(problem, &incoming, &messages, from);
                    for (hv, m) in h.iter_mut().zip(&messages[msg ^ 1]) {
                        *hv -= m;
                    }
                    let mut out: Vec<f64> = problem.data_costs[to]
                        .iter()
                        .map(|&(lj, _)| {
                            problem.data_costs[from]
                                .iter()
                                .zip(&h)
                                .map(|(&(li, _), hv)| hv + (problem.smoothness)(li, lj))
                                .fold(f64::INFINITY, f64::min)
                        })
                        .collect();
                    let min = out.iter().copied().fold(f64::INFINITY, f64::min);
                    out.iter_mut().for_each(|v| *v -= min);
                    out
                })
                .collect();

            let delta = updated
                .iter()
                .zip(&messages)
                .flat_map(|(new, old)| new.iter().zip(old).map(|(n, o)| (n - o).abs()))
                .fold(0.0, f64::max);
            messages = updated;

            let labels = decode(problem, &incoming, &messages);
            let energy = problem.energy(&labels);
            if energy < best_energy {
                best_energy = energy;
                best_labels = labels;
            }
            if delta < self.tolerance {
                debug!("    belief propagation converged after {} iterations", iteration + 1);
                break;
            }
        }
        if !best_energy.is_finite() {
            return Err(Error::new(SolverFailure, "labeling energy is not finite".to_string()));
        }
        Ok(best_labels)
    }
}

pub trait ConnectedComponents {
    /// Component id per node, numbered by first appearance.
    fn components(&self, num_nodes: usize, edges: &[[usize; 2]]) -> Vec<usize>;
}

pub struct UnionFindComponents;

impl ConnectedComponents for UnionFindComponents {
    fn components(&self, num_nodes: usize, edges: &[[usize; 2]]) -> Vec<usize> {
        let mut partition = UnionFind::new(num_nodes);
        for &[a, b] in edges {
            partition.union(a, b);
        }
        let roots = partition.into_labeling();
        let mut compact = vec![usize::MAX; num_nodes];
        let mut next = 0;
        roots
            .into_iter()
            .map(|root| {
                if compact[root] == usize::MAX {
                    compact[root] = next;
                    next += 1;
                }
                compact[root]
            })
            .collect()
    }
}
