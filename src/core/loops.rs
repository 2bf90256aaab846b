//! Closed loops of interferograms for phase closure checks.
//!
//! Loops are simple cycles of a fixed number of epochs in the undirected
//! epoch connectivity graph, found by exhaustive depth-first search with
//! backtracking. Each cycle is discovered once per traversal direction, so
//! the raw count is halved, and loops sharing the same vertex set are
//! reported once.

use crate::types::{IfgError, IfgResult};
use ndarray::Array2;
use std::collections::HashSet;

/// Loops found in an epoch network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopSet {
    /// Number of distinct cycles (raw discoveries halved)
    pub count: usize,
    /// Deduplicated loops as epoch ids, in discovery order
    pub loops: Vec<Vec<usize>>,
}

impl LoopSet {
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }
}

struct CycleSearch<'a> {
    graph: &'a Array2<u8>,
    marked: Vec<bool>,
    count: usize,
    loops: Vec<Vec<usize>>,
}

impl<'a> CycleSearch<'a> {
    fn connected(&self, a: usize, b: usize) -> bool {
        self.graph[[a, b]] != 0
    }

    /// Extend `path` (ending at `vert`) by `remaining` more vertices and
    /// record it if the last one connects back to `start`
    fn dfs(&mut self, remaining: usize, vert: usize, start: usize, path: &mut Vec<usize>) {
        self.marked[vert] = true;

        if remaining == 0 {
            self.marked[vert] = false;
            if self.connected(vert, start) {
                self.count += 1;
                self.loops.push(path.clone());
            }
            return;
        }

        for next in 0..self.graph.nrows() {
            if !self.marked[next] && self.connected(vert, next) {
                path.push(next);
                self.dfs(remaining - 1, next, start, path);
                path.pop();
            }
        }

        self.marked[vert] = false;
    }
}

/// Find every simple cycle of `loop_length` vertices in the undirected graph
/// given by the square 0/1 adjacency matrix `graph`.
///
/// Vertices are numbered by row. A loop length below 3 is rejected since
/// shorter closed walks are not cycles of a simple graph.
pub fn find_cycles(graph: &Array2<u8>, loop_length: usize) -> IfgResult<LoopSet> {
    let (rows, cols) = graph.dim();
    if rows != cols {
        return Err(IfgError::Validation(format!(
            "Adjacency matrix must be square, got {}x{}",
            rows, cols
        )));
    }
    if loop_length < 3 {
        return Err(IfgError::Validation(format!(
            "Loop length must be at least 3, got {}",
            loop_length
        )));
    }

    log::info!("Finding loops of length {}", loop_length);

    let mut search = CycleSearch {
        graph,
        marked: vec![false; rows],
        count: 0,
        loops: Vec::new(),
    };

    // a cycle through a later start vertex would already have been found
    for start in 0..rows.saturating_sub(loop_length - 1) {
        let mut path = vec![start];
        search.dfs(loop_length - 1, start, start, &mut path);
        search.marked[start] = true;
    }

    let count = search.count / 2;
    let loops = dedupe_loops(search.loops);
    log::info!("Found {} loops of length {}", count, loop_length);

    Ok(LoopSet { count, loops })
}

/// Drop loops whose vertex set was already seen, keeping the first
/// discovered ordering of each
pub fn dedupe_loops(loops: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
    let mut seen: HashSet<Vec<usize>> = HashSet::new();
    let mut filtered = Vec::new();

    for lp in loops {
        let mut members = lp.clone();
        members.sort_unstable();
        if seen.insert(members) {
            filtered.push(lp);
        }
    }

    log::info!("After dedupe number of remaining loops {}", filtered.len());
    filtered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize, edges: &[(usize, usize)]) -> Array2<u8> {
        let mut g = Array2::zeros((n, n));
        for &(a, b) in edges {
            g[[a, b]] = 1;
            g[[b, a]] = 1;
        }
        g
    }

    #[test]
    fn test_triangle() {
        let g = graph(3, &[(0, 1), (1, 2), (2, 0)]);
        let result = find_cycles(&g, 3).unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.loops, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_no_cycle_of_length() {
        // path graph has no cycles at all
        let g = graph(4, &[(0, 1), (1, 2), (2, 3)]);
        let result = find_cycles(&g, 3).unwrap();
        assert_eq!(result.count, 0);
        assert!(result.is_empty());

        // a square has no triangles
        let g = graph(4, &[(0, 1), (1, 2), (2, 3), (3, 0)]);
        let result = find_cycles(&g, 3).unwrap();
        assert_eq!(result.count, 0);
        assert!(result.loops.is_empty());
    }

    #[test]
    fn test_square_and_triangles() {
        // square with one diagonal: two triangles and one 4-cycle
        let g = graph(4, &[(0, 1), (1, 2), (2, 3), (3, 0), (0, 2)]);

        let triangles = find_cycles(&g, 3).unwrap();
        assert_eq!(triangles.count, 2);
        assert_eq!(triangles.loops, vec![vec![0, 1, 2], vec![0, 2, 3]]);

        let squares = find_cycles(&g, 4).unwrap();
        assert_eq!(squares.count, 1);
        assert_eq!(squares.loops, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_complete_graph_k4() {
        let g = graph(4, &[(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]);
        assert_eq!(find_cycles(&g, 3).unwrap().count, 4);

        // K4 has three distinct 4-cycles, all over the same vertex set
        let squares = find_cycles(&g, 4).unwrap();
        assert_eq!(squares.count, 3);
        assert_eq!(squares.len(), 1);
    }

    #[test]
    fn test_loop_longer_than_graph() {
        let g = graph(3, &[(0, 1), (1, 2), (2, 0)]);
        let result = find_cycles(&g, 5).unwrap();
        assert_eq!(result, LoopSet::default());
    }

    #[test]
    fn test_dedupe_rotations() {
        let loops = vec![vec![0, 1, 2], vec![1, 2, 0], vec![2, 1, 0], vec![0, 1, 3]];
        assert_eq!(dedupe_loops(loops), vec![vec![0, 1, 2], vec![0, 1, 3]]);
    }

    #[test]
    fn test_invalid_input() {
        assert!(find_cycles(&Array2::zeros((2, 3)), 3).is_err());
        assert!(find_cycles(&graph(3, &[(0, 1)]), 2).is_err());
    }
}
