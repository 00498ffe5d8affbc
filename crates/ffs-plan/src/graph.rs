//! Move dependency graph.
//!
//! Nodes live in an arena indexed by position; adjacency is a list of
//! node indices per node. An edge `a -> b` means `a` waits on `b`: the
//! destination of `a` overlaps the current position of `b`, so `b` must
//! vacate first.

use ffs_extent::Extent;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// One relocation: the bytes at logical offset `logical` move from
/// `source` to `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Piece {
    pub logical: u64,
    pub source: Extent,
    pub destination: Extent,
}

/// Strongly-connected component of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    /// Node indices, ascending.
    pub members: Vec<usize>,
    /// More than one member. Self-loops never occur.
    pub cyclic: bool,
    /// Lowest logical offset among the members.
    pub first_logical: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyGraph {
    nodes: Vec<Piece>,
    waits_on: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build edges by binary search over sources sorted by offset.
    ///
    /// Sources come from one extent map and never overlap each other.
    #[must_use]
    pub fn build(nodes: Vec<Piece>) -> Self {
        let mut by_source: Vec<usize> = (0..nodes.len()).collect();
        by_source.sort_unstable_by_key(|&i| nodes[i].source);

        let mut waits_on = vec![Vec::new(); nodes.len()];
        for (a, piece) in nodes.iter().enumerate() {
            let dest = piece.destination;
            let start = by_source.partition_point(|&b| {
                let src = nodes[b].source;
                (src.region(), src.end()) <= (dest.region(), dest.offset())
            });
            for &b in &by_source[start..] {
                let src = nodes[b].source;
                if src.region() != dest.region() || src.offset() >= dest.end() {
                    break;
                }
                if b != a {
                    waits_on[a].push(b);
                }
            }
        }
        Self { nodes, waits_on }
    }

    #[must_use]
    pub fn nodes(&self) -> &[Piece] {
        &self.nodes
    }

    #[must_use]
    pub fn waits_on(&self, node: usize) -> &[usize] {
        &self.waits_on[node]
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.waits_on.iter().map(Vec::len).sum()
    }

    /// Strongly-connected components (iterative Tarjan).
    #[must_use]
    pub fn components(&self) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0_usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut call: Vec<(usize, usize)> = Vec::new();
        let mut next_index = 0_usize;
        let mut out = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            index[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            call.push((root, 0));

            while let Some(&(v, edge)) = call.last() {
                if let Some(&w) = self.waits_on[v].get(edge) {
                    if let Some(top) = call.last_mut() {
                        top.1 += 1;
                    }
                    if index[w] == UNVISITED {
                        index[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        call.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                    continue;
                }

                call.pop();
                if let Some(&(parent, _)) = call.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[v]);
                }
                if lowlink[v] == index[v] {
                    let mut members = Vec::new();
                    while let Some(w) = stack.pop() {
                        on_stack[w] = false;
                        members.push(w);
                        if w == v {
                            break;
                        }
                    }
                    members.sort_unstable();
                    out.push(members);
                }
            }
        }
        out
    }

    /// Components in execution order: each one after every component it
    /// waits on, ties broken by ascending lowest logical offset.
    #[must_use]
    pub fn schedule(&self) -> Vec<Component> {
        let sccs = self.components();
        let mut comp_of = vec![0_usize; self.nodes.len()];
        for (c, members) in sccs.iter().enumerate() {
            for &m in members {
                comp_of[m] = c;
            }
        }

        let mut waits: Vec<usize> = vec![0; sccs.len()];
        let mut waiters: Vec<Vec<usize>> = vec![Vec::new(); sccs.len()];
        for (c, members) in sccs.iter().enumerate() {
            let mut deps: Vec<usize> = members
                .iter()
                .flat_map(|&m| self.waits_on[m].iter().map(|&w| comp_of[w]))
                .filter(|&d| d != c)
                .collect();
            deps.sort_unstable();
            deps.dedup();
            waits[c] = deps.len();
            for d in deps {
                waiters[d].push(c);
            }
        }

        let first_logical: Vec<u64> = sccs
            .iter()
            .map(|members| {
                members
                    .iter()
                    .map(|&m| self.nodes[m].logical)
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(u64, usize)>> = waits
            .iter()
            .enumerate()
            .filter(|&(_, &w)| w == 0)
            .map(|(c, _)| Reverse((first_logical[c], c)))
            .collect();

        let mut order = Vec::with_capacity(sccs.len());
        while let Some(Reverse((_, c))) = ready.pop() {
            order.push(c);
            for &x in &waiters[c] {
                waits[x] -= 1;
                if waits[x] == 0 {
                    ready.push(Reverse((first_logical[x], x)));
                }
            }
        }

        order
            .into_iter()
            .map(|c| Component {
                cyclic: sccs[c].len() > 1,
                first_logical: first_logical[c],
                members: sccs[c].clone(),
            })
            .collect()
    }
}

/// Graph diagnostics: nodes, edges and the component schedule.
#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    pub graph: DependencyGraph,
    pub schedule: Vec<Component>,
}
