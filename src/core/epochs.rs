//! Epoch connectivity of an interferogram set

use crate::core::loops::{find_cycles, LoopSet};
use crate::types::{Epoch, IfgError, IfgResult, Interferogram};
use ndarray::Array2;
use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::{NodeIndex, UnGraph};
use std::borrow::Borrow;
use std::collections::BTreeMap;

/// All epochs referenced by `ifgs`: every first epoch, then every second
pub fn all_epochs<I: Borrow<Interferogram>>(ifgs: &[I]) -> Vec<Epoch> {
    let firsts = ifgs.iter().map(|i| Borrow::<Interferogram>::borrow(i).first());
    let seconds = ifgs.iter().map(|i| Borrow::<Interferogram>::borrow(i).second());
    firsts.chain(seconds).collect()
}

/// Map each distinct epoch to a contiguous id in date order
pub fn epoch_ids(epochs: &[Epoch]) -> BTreeMap<Epoch, usize> {
    let mut sorted = epochs.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted.into_iter().enumerate().map(|(i, e)| (e, i)).collect()
}

/// Undirected multigraph with epochs as vertices and interferograms as edges.
///
/// Node indices equal epoch ids; edge weights are indices into the
/// interferogram list the network was built from.
#[derive(Debug, Clone)]
pub struct EpochNetwork {
    graph: UnGraph<Epoch, usize>,
    ids: BTreeMap<Epoch, usize>,
}

impl EpochNetwork {
    pub fn from_ifgs(ifgs: &[Interferogram]) -> IfgResult<Self> {
        let pairs: Vec<(Epoch, Epoch)> = ifgs.iter().map(|i| (i.first(), i.second())).collect();
        Self::from_epoch_pairs(&pairs)
    }

    pub fn from_epoch_pairs(pairs: &[(Epoch, Epoch)]) -> IfgResult<Self> {
        let epochs: Vec<Epoch> = pairs
            .iter()
            .map(|p| p.0)
            .chain(pairs.iter().map(|p| p.1))
            .collect();
        let ids = epoch_ids(&epochs);

        let mut graph = UnGraph::with_capacity(ids.len(), pairs.len());
        for &epoch in ids.keys() {
            graph.add_node(epoch);
        }

        for (idx, &(first, second)) in pairs.iter().enumerate() {
            if first == second {
                return Err(IfgError::Validation(format!(
                    "Interferogram {} connects epoch {} to itself",
                    idx, first
                )));
            }
            graph.add_edge(NodeIndex::new(ids[&first]), NodeIndex::new(ids[&second]), idx);
        }

        Ok(Self { graph, ids })
    }

    pub fn num_epochs(&self) -> usize {
        self.graph.node_count()
    }

    pub fn num_ifgs(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn epoch_ids(&self) -> &BTreeMap<Epoch, usize> {
        &self.ids
    }

    pub fn id(&self, epoch: Epoch) -> Option<usize> {
        self.ids.get(&epoch).copied()
    }

    pub fn epoch(&self, id: usize) -> Option<Epoch> {
        self.graph.node_weight(NodeIndex::new(id)).copied()
    }

    /// Symmetric 0/1 connectivity matrix indexed by epoch id
    pub fn adjacency_matrix(&self) -> Array2<u8> {
        let n = self.num_epochs();
        let mut adj = Array2::<u8>::zeros((n, n));
        for edge in self.graph.raw_edges() {
            let (a, b) = (edge.source().index(), edge.target().index());
            adj[[a, b]] = 1;
            adj[[b, a]] = 1;
        }
        adj
    }

    /// All loops of `loop_length` epochs in the network
    pub fn find_loops(&self, loop_length: usize) -> IfgResult<LoopSet> {
        find_cycles(&self.adjacency_matrix(), loop_length)
    }

    /// Interferogram indices closing a loop of epoch ids, one per
    /// consecutive pair including the closing pair. `None` when a pair is
    /// not connected.
    pub fn loop_interferograms(&self, vertices: &[usize]) -> Option<Vec<usize>> {
        if vertices.len() < 2 {
            return None;
        }
        let n = vertices.len();
        (0..n)
            .map(|k| {
                let a = NodeIndex::new(vertices[k]);
                let b = NodeIndex::new(vertices[(k + 1) % n]);
                self.graph
                    .find_edge(a, b)
                    .and_then(|e| self.graph.edge_weight(e).copied())
            })
            .collect()
    }

    /// Epoch sequence of a loop of epoch ids
    pub fn loop_epochs(&self, vertices: &[usize]) -> Option<Vec<Epoch>> {
        vertices.iter().map(|&v| self.epoch(v)).collect()
    }
}

/// Indices of the interferograms forming a minimum spanning tree (forest, if
/// the network is disconnected) of `ifgs`, in ascending order.
///
/// Edges are weighted by NaN fraction so the most complete interferogram
/// is kept between any pair of epochs; ties fall back to input order.
pub fn mst_indices(ifgs: &[Interferogram]) -> IfgResult<Vec<usize>> {
    let network = EpochNetwork::from_ifgs(ifgs)?;

    let mut graph: UnGraph<Epoch, (f64, usize)> = UnGraph::with_capacity(network.num_epochs(), ifgs.len());
    for &epoch in network.ids.keys() {
        graph.add_node(epoch);
    }
    for (idx, ifg) in ifgs.iter().enumerate() {
        let a = NodeIndex::new(network.ids[&ifg.first()]);
        let b = NodeIndex::new(network.ids[&ifg.second()]);
        graph.add_edge(a, b, (ifg.nan_fraction(), idx));
    }

    let mut tree: Vec<usize> = min_spanning_tree(&graph)
        .filter_map(|element| match element {
            Element::Edge { weight, .. } => Some(weight.1),
            Element::Node { .. } => None,
        })
        .collect();
    tree.sort_unstable();

    if tree.len() + 1 < network.num_epochs() {
        log::warn!(
            "Interferogram network is disconnected: {} epochs spanned by {} tree edges",
            network.num_epochs(),
            tree.len()
        );
    }

    Ok(tree)
}
