//! In-memory topology view: blueprint graph, partitions, cut, node→host
//! fanout, and the seen-nodes set.
//!
//! Grounded on `original_source/controller/main.cpp`'s topology-loading
//! section (the globals it populates from `blueprint.json` /
//! `partition.json` / `hosts.json` before entering the epoll-wait loop).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct NodeSpec {
    pub id: i32,
    #[serde(default)]
    pub neighbors: Vec<i32>,
}

#[derive(Debug, Deserialize)]
pub struct Blueprint {
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct PartitionFile {
    /// Array of partitions; the last element is the cut.
    pub partitions: Vec<Vec<i32>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostEntry {
    pub id: u32,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct HostsFile {
    pub hosts: Vec<HostEntry>,
    pub self_id: u32,
}

pub fn load_blueprint(conf_dir: &Path) -> Result<Blueprint, ConfigError> {
    load_json(&conf_dir.join("blueprint.json"))
}

/// `partition.json` is optional; its absence means a single implicit
/// partition containing every blueprint node and an empty cut.
pub fn load_partitions(conf_dir: &Path, blueprint: &Blueprint) -> Result<PartitionFile, ConfigError> {
    let path = conf_dir.join("partition.json");
    if !path.exists() {
        let all: Vec<i32> = blueprint.nodes.iter().map(|n| n.id).collect();
        return Ok(PartitionFile { partitions: vec![all, Vec::new()] });
    }
    load_json(&path)
}

pub fn load_hosts(path: &Path) -> Result<HostsFile, ConfigError> {
    load_json(path)
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

pub struct Topology {
    neighbors: HashMap<i32, Vec<i32>>,
    /// Non-cut partitions, in iteration-sweep order.
    partitions: Vec<Vec<i32>>,
    cut: Vec<i32>,
    node_host: HashMap<i32, u32>,
    self_host: u32,
    seen_nodes: Mutex<HashSet<i32>>,
}

impl Topology {
    pub fn build(blueprint: Blueprint, partition_file: PartitionFile, self_host: u32, n_hosts: u32) -> Result<Topology, ConfigError> {
        if partition_file.partitions.is_empty() {
            return Err(ConfigError::EmptyPartitions);
        }
        let known_nodes: HashSet<i32> = blueprint.nodes.iter().map(|n| n.id).collect();
        for node in &blueprint.nodes {
            for &nbr in &node.neighbors {
                if !known_nodes.contains(&nbr) {
                    return Err(ConfigError::UnknownNode { path: PathBuf::from("blueprint.json"), node: nbr as u32 });
                }
            }
        }
        for part in &partition_file.partitions {
            for &node in part {
                if !known_nodes.contains(&node) {
                    return Err(ConfigError::UnknownNode { path: PathBuf::from("partition.json"), node: node as u32 });
                }
            }
        }
        let neighbors: HashMap<i32, Vec<i32>> = blueprint.nodes.iter().map(|n| (n.id, n.neighbors.clone())).collect();

        let mut parts = partition_file.partitions;
        let cut = parts.pop().unwrap_or_default();

        // Static fanout: a node's owning host is fixed by its position in
        // blueprint declaration order, round-robined across hosts. This
        // keeps the mapping deterministic and independent of partition
        // membership.
        let mut node_host = HashMap::new();
        for (i, node) in blueprint.nodes.iter().enumerate() {
            let host = if n_hosts == 0 { 0 } else { (i as u32) % n_hosts };
            node_host.insert(node.id, host);
        }
        for &node in &cut {
            node_host.entry(node).or_insert_with(|| {
                if n_hosts == 0 { 0 } else { (node as u32) % n_hosts }
            });
        }

        Ok(Topology {
            neighbors,
            partitions: parts,
            cut,
            node_host,
            self_host,
            seen_nodes: Mutex::new(HashSet::new()),
        })
    }

    pub fn n_parts(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, idx: usize) -> &[i32] {
        &self.partitions[idx]
    }

    pub fn cut(&self) -> &[i32] {
        &self.cut
    }

    pub fn is_cut(&self, node: i32) -> bool {
        self.cut.contains(&node)
    }

    pub fn host_of(&self, node: i32) -> u32 {
        self.node_host.get(&node).copied().unwrap_or(self.self_host)
    }

    pub fn is_local(&self, node: i32) -> bool {
        self.host_of(node) == self.self_host
    }

    pub fn neighbors(&self, node: i32) -> &[i32] {
        self.neighbors.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Mirrors the original's startup diagnostic dump of the loaded graph
    /// before the reactor loop starts: per-partition membership and
    /// channel targets, the cut, and each node's neighbor list. DEBUG
    /// only — a large blueprint makes this noisy at INFO.
    pub fn log_debug_dump(&self) {
        tracing::debug!(cut = ?self.cut, cut_nchannel = self.cut_nchannel(), "topology: cut");
        for idx in 0..self.partitions.len() {
            tracing::debug!(
                idx,
                nodes = ?self.partitions[idx],
                target_nchannel = self.target_nchannel(idx),
                "topology: partition"
            );
        }
        let mut nodes: Vec<i32> = self.neighbors.keys().copied().collect();
        nodes.sort_unstable();
        for node in nodes {
            tracing::debug!(
                node,
                host = self.host_of(node),
                neighbors = ?self.neighbors(node),
                "topology: node"
            );
        }
    }

    pub fn local_nodes_for_worker(&self, worker: usize, nthreads: usize) -> impl Iterator<Item = i32> + '_ {
        self.node_host
            .keys()
            .copied()
            .filter(move |&id| self.is_local(id) && (id as usize) % nthreads.max(1) == worker)
    }

    /// Undirected edges among `{partition[idx]} ∪ cut` whose owning
    /// endpoint(s) touch this host; used to drive BUILDUP connect
    /// attempts and to size `target_nchannel`.
    pub fn edges_for_active_partition(&self, idx: usize) -> Vec<(i32, i32)> {
        let mut active: HashSet<i32> = self.partitions[idx].iter().copied().collect();
        active.extend(self.cut.iter().copied());

        let mut seen_pairs = HashSet::new();
        let mut edges = Vec::new();
        for &u in &active {
            for &v in self.neighbors(u) {
                if !active.contains(&v) {
                    continue;
                }
                let key = if u < v { (u, v) } else { (v, u) };
                if seen_pairs.insert(key) {
                    edges.push(key);
                }
            }
        }
        edges
    }

    pub fn target_nchannel(&self, idx: usize) -> i64 {
        self.edges_for_active_partition(idx).len() as i64
    }

    pub fn cut_nchannel(&self) -> i64 {
        let cut: HashSet<i32> = self.cut.iter().copied().collect();
        let mut seen_pairs = HashSet::new();
        for &u in &cut {
            for &v in self.neighbors(u) {
                if !cut.contains(&v) {
                    continue;
                }
                seen_pairs.insert(if u < v { (u, v) } else { (v, u) });
            }
        }
        seen_pairs.len() as i64
    }

    pub fn is_seen(&self, node: i32) -> bool {
        self.seen_nodes.lock().unwrap().contains(&node)
    }

    pub fn mark_seen(&self, nodes: impl IntoIterator<Item = i32>) {
        let mut seen = self.seen_nodes.lock().unwrap();
        seen.extend(nodes);
    }
}

#[allow(dead_code)]
pub fn default_hosts_path() -> PathBuf {
    PathBuf::from("hosts.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint() -> Blueprint {
        Blueprint {
            nodes: vec![
                NodeSpec { id: 1, neighbors: vec![2] },
                NodeSpec { id: 2, neighbors: vec![1, 3] },
                NodeSpec { id: 3, neighbors: vec![2] },
            ],
        }
    }

    #[test]
    fn single_partition_with_empty_cut_counts_line_edges() {
        let pf = PartitionFile { partitions: vec![vec![1, 2, 3], vec![]] };
        let topo = Topology::build(blueprint(), pf, 0, 1).unwrap();
        assert_eq!(topo.n_parts(), 1);
        assert_eq!(topo.target_nchannel(0), 2);
        assert_eq!(topo.cut_nchannel(), 0);
    }

    #[test]
    fn cut_membership_is_queryable() {
        let pf = PartitionFile { partitions: vec![vec![1, 2], vec![3]] };
        let topo = Topology::build(blueprint(), pf, 0, 1).unwrap();
        assert!(topo.is_cut(3));
        assert!(!topo.is_cut(1));
    }

    #[test]
    fn seen_nodes_accumulate() {
        let pf = PartitionFile { partitions: vec![vec![1, 2, 3], vec![]] };
        let topo = Topology::build(blueprint(), pf, 0, 1).unwrap();
        assert!(!topo.is_seen(1));
        topo.mark_seen([1, 2]);
        assert!(topo.is_seen(1));
        assert!(!topo.is_seen(3));
    }

    #[test]
    fn partition_referencing_unknown_node_is_rejected() {
        let pf = PartitionFile { partitions: vec![vec![1, 2, 99], vec![]] };
        let err = Topology::build(blueprint(), pf, 0, 1).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { node: 99, .. }));
    }

    #[test]
    fn blueprint_neighbor_referencing_unknown_node_is_rejected() {
        let bp = Blueprint { nodes: vec![NodeSpec { id: 1, neighbors: vec![42] }] };
        let pf = PartitionFile { partitions: vec![vec![1], vec![]] };
        let err = Topology::build(bp, pf, 0, 1).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode { node: 42, .. }));
    }
}
