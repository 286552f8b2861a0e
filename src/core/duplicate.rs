//! Duplicate clustering.
//!
//! Photos with the same content hash are unioned first. The remaining
//! representatives are then compared pairwise by perceptual hash and unioned
//! when within the threshold. Clusters are the connected components, so
//! near-duplicate chains join transitively.

use serde::Serialize;
use std::collections::HashMap;

use crate::core::perceptual::PerceptualHash;
use crate::database::models::{Cluster, ClusterAssignment, ClusterKind, DupKind, Photo};

/// Disjoint-set forest with path compression and union by size.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Returns false when `a` and `b` were already connected.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return false;
        }
        let (big, small) = if self.size[ra] >= self.size[rb] { (ra, rb) } else { (rb, ra) };
        self.parent[small] = big;
        self.size[big] += self.size[small];
        true
    }

    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }
}

/// The fingerprint data clustering needs from a photo.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCandidate {
    pub path: String,
    pub content_hash: Option<String>,
    pub perceptual_hash: Option<PerceptualHash>,
}

impl ClusterCandidate {
    pub fn from_photo(photo: &Photo) -> Self {
        Self {
            path: photo.path.clone(),
            content_hash: photo.content_hash.clone(),
            perceptual_hash: photo
                .perceptual_hash
                .as_deref()
                .and_then(PerceptualHash::from_hex),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusteringResult {
    pub clusters: Vec<Cluster>,
    pub assignments: Vec<ClusterAssignment>,
}

impl ClusteringResult {
    pub fn duplicate_clusters(&self) -> usize {
        self.clusters
            .iter()
            .filter(|c| c.kind != ClusterKind::Singleton)
            .count()
    }
}

pub struct DuplicateDetector {
    threshold: u32,
}

impl DuplicateDetector {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Partition `candidates` into clusters.
    ///
    /// Output is independent of input order: candidates are sorted by path,
    /// cluster ids are assigned 1.. in order of each cluster's smallest path.
    /// A candidate without a content hash (undecodable) is always a singleton.
    pub fn cluster(&self, candidates: &[ClusterCandidate]) -> ClusteringResult {
        let mut sorted: Vec<&ClusterCandidate> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        let n = sorted.len();
        let mut uf = UnionFind::new(n);

        let mut first_by_hash: HashMap<&str, usize> = HashMap::new();
        let mut hash_counts: HashMap<&str, usize> = HashMap::new();
        let mut representatives: Vec<(usize, PerceptualHash)> = Vec::new();

        for (index, candidate) in sorted.iter().enumerate() {
            let Some(hash) = candidate.content_hash.as_deref() else {
                continue;
            };
            *hash_counts.entry(hash).or_insert(0) += 1;
            match first_by_hash.get(hash) {
                Some(&first) => {
                    uf.union(first, index);
                }
                None => {
                    first_by_hash.insert(hash, index);
                    if let Some(phash) = candidate.perceptual_hash {
                        representatives.push((index, phash));
                    }
                }
            }
        }

        for i in 0..representatives.len() {
            let (a, hash_a) = representatives[i];
            for &(b, hash_b) in &representatives[i + 1..] {
                if uf.connected(a, b) {
                    continue;
                }
                if hash_a.distance(&hash_b) <= self.threshold {
                    uf.union(a, b);
                }
            }
        }

        let mut cluster_of_root: HashMap<usize, usize> = HashMap::new();
        let mut members: Vec<Vec<usize>> = Vec::new();
        for index in 0..n {
            let root = uf.find(index);
            let slot = *cluster_of_root.entry(root).or_insert_with(|| {
                members.push(Vec::new());
                members.len() - 1
            });
            members[slot].push(index);
        }

        let mut result = ClusteringResult::default();
        for (slot, indices) in members.iter().enumerate() {
            let id = slot as i64 + 1;
            let kind = cluster_kind(indices.iter().map(|&i| sorted[i].content_hash.as_deref()));

            for &i in indices {
                let candidate = sorted[i];
                let exact_twin = candidate
                    .content_hash
                    .as_deref()
                    .is_some_and(|h| hash_counts.get(h).copied().unwrap_or(0) > 1);
                let dup_kind = if exact_twin {
                    DupKind::Exact
                } else if indices.len() > 1 {
                    DupKind::Near
                } else {
                    DupKind::None
                };
                result.assignments.push(ClusterAssignment {
                    path: candidate.path.clone(),
                    cluster_id: id,
                    dup_kind,
                });
            }

            result.clusters.push(Cluster {
                id,
                kind,
                members: indices.iter().map(|&i| sorted[i].path.clone()).collect(),
            });
        }

        result
    }
}

fn cluster_kind<'a>(mut hashes: impl ExactSizeIterator<Item = Option<&'a str>>) -> ClusterKind {
    if hashes.len() <= 1 {
        return ClusterKind::Singleton;
    }
    let first = hashes.next().flatten();
    match first {
        Some(first) if hashes.all(|h| h == Some(first)) => ClusterKind::ExactDuplicate,
        _ => ClusterKind::NearDuplicate,
    }
}
