//! Merged result graph: the union of all accepted paths, annotated with
//! which path indices touch each node and edge. This is what the client
//! renders.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::title::Title;

#[derive(Debug, Clone, Serialize)]
pub struct MergedNode {
    pub title: Title,
    pub paths: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedEdge {
    pub source: Title,
    pub target: Title,
    pub paths: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedGraph {
    pub nodes: Vec<MergedNode>,
    pub edges: Vec<MergedEdge>,
}

/// Union the paths of one result set into a single graph. Node and edge
/// order is deterministic (lexicographic by title).
pub fn merge_paths(paths: &[Vec<Title>]) -> MergedGraph {
    let mut nodes: BTreeMap<Title, BTreeSet<usize>> = BTreeMap::new();
    let mut edges: BTreeMap<(Title, Title), BTreeSet<usize>> = BTreeMap::new();
    for (idx, path) in paths.iter().enumerate() {
        for t in path {
            nodes.entry(t.clone()).or_default().insert(idx);
        }
        for pair in path.windows(2) {
            edges
                .entry((pair[0].clone(), pair[1].clone()))
                .or_default()
                .insert(idx);
        }
    }
    MergedGraph {
        nodes: nodes
            .into_iter()
            .map(|(title, idxs)| MergedNode { title, paths: idxs.into_iter().collect() })
            .collect(),
        edges: edges
            .into_iter()
            .map(|((source, target), idxs)| MergedEdge {
                source,
                target,
                paths: idxs.into_iter().collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(titles: &[&str]) -> Vec<Title> {
        titles.iter().map(|s| Title::normalize(s).expect("title")).collect()
    }

    #[test]
    fn shared_nodes_carry_both_path_indices() {
        let g = merge_paths(&[path(&["A", "B", "C"]), path(&["A", "X", "C"])]);
        assert_eq!(g.nodes.len(), 4);
        assert_eq!(g.edges.len(), 4);
        let a = g.nodes.iter().find(|n| n.title.as_str() == "A").expect("node A");
        assert_eq!(a.paths, vec![0, 1]);
        let x = g.nodes.iter().find(|n| n.title.as_str() == "X").expect("node X");
        assert_eq!(x.paths, vec![1]);
    }

    #[test]
    fn edges_track_the_paths_using_them() {
        let g = merge_paths(&[path(&["A", "D"]), path(&["A", "B", "C", "D"])]);
        let direct = g
            .edges
            .iter()
            .find(|e| e.source.as_str() == "A" && e.target.as_str() == "D")
            .expect("edge A->D");
        assert_eq!(direct.paths, vec![0]);
        let hop = g
            .edges
            .iter()
            .find(|e| e.source.as_str() == "A" && e.target.as_str() == "B")
            .expect("edge A->B");
        assert_eq!(hop.paths, vec![1]);
    }

    #[test]
    fn empty_input_yields_empty_graph() {
        let g = merge_paths(&[]);
        assert!(g.nodes.is_empty());
        assert!(g.edges.is_empty());
    }
}
