//! Hierarchical density-based clustering over a dense distance matrix.
//!
//! Mutual reachability distances feed a minimum spanning tree, which is
//! turned into a single-linkage hierarchy, condensed by `min_cluster_size`,
//! and cut with excess-of-mass selection. The root cluster is never selected.

use digest_types::GroupLabel;

use crate::space::DistanceMatrix;
use crate::ClusteringError;

/// HDBSCAN parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdbscanParams {
    /// Smallest group the condensed tree keeps as a cluster.
    pub min_cluster_size: usize,
    /// Neighborhood size used for core distances.
    pub min_samples: usize,
}

impl HdbscanParams {
    /// Uses `min_cluster_size` for both parameters.
    pub fn new(min_cluster_size: usize) -> Self {
        Self {
            min_cluster_size,
            min_samples: min_cluster_size,
        }
    }

    pub fn validate(&self) -> Result<(), ClusteringError> {
        if self.min_cluster_size < 2 {
            return Err(ClusteringError::invalid_parameter(format!(
                "min_cluster_size must be >= 2, got {}",
                self.min_cluster_size
            )));
        }
        if self.min_samples == 0 || self.min_samples > self.min_cluster_size {
            return Err(ClusteringError::invalid_parameter(format!(
                "min_samples must be within 1..={}, got {}",
                self.min_cluster_size, self.min_samples
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MergeNode {
    left: usize,
    right: usize,
    distance: f64,
    size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondensedChild {
    Point(usize),
    Cluster(usize),
}

#[derive(Debug, Clone, Copy)]
struct CondensedEdge {
    parent: usize,
    child: CondensedChild,
    lambda: f64,
    size: usize,
}

/// Labels every point with a cluster or `GroupLabel::Noise`.
#[tracing::instrument(level = "debug", skip(distances), fields(points = distances.size()))]
pub fn hdbscan(
    distances: &DistanceMatrix,
    params: &HdbscanParams,
) -> Result<Vec<GroupLabel>, ClusteringError> {
    params.validate()?;
    let points = distances.size();
    if points < 2 {
        return Ok(vec![GroupLabel::Noise; points]);
    }

    let core = core_distances(distances, params.min_samples);
    let mut edges = mutual_reachability_mst(distances, &core);
    if edges.iter().any(|(_, _, weight)| !weight.is_finite()) {
        return Err(ClusteringError::NonFinite {
            stage: "mutual_reachability",
        });
    }
    edges.sort_by(|left, right| left.2.total_cmp(&right.2));

    let merges = single_linkage(points, &edges);
    let condensed = condense(points, &merges, params.min_cluster_size);
    let cluster_count = condensed
        .iter()
        .filter_map(|edge| match edge.child {
            CondensedChild::Cluster(id) => Some(id + 1),
            CondensedChild::Point(_) => None,
        })
        .max()
        .unwrap_or(1);
    let selected = select_clusters(&condensed, cluster_count);
    let labels = label_points(points, &condensed, cluster_count, &selected);

    tracing::debug!(
        clusters = selected.iter().filter(|flag| **flag).count(),
        noise = labels.iter().filter(|label| label.is_noise()).count(),
        "hdbscan labelling complete"
    );
    Ok(labels)
}

fn core_distances(distances: &DistanceMatrix, min_samples: usize) -> Vec<f64> {
    let points = distances.size();
    let rank = (min_samples - 1).min(points - 1);
    (0..points)
        .map(|point| {
            let mut row = (0..points)
                .map(|other| distances.get(point, other))
                .collect::<Vec<_>>();
            row.sort_by(f64::total_cmp);
            row[rank]
        })
        .collect()
}

/// Dense Prim's algorithm over mutual reachability distances.
fn mutual_reachability_mst(distances: &DistanceMatrix, core: &[f64]) -> Vec<(usize, usize, f64)> {
    let points = distances.size();
    let mut in_tree = vec![false; points];
    let mut best = vec![f64::INFINITY; points];
    let mut best_from = vec![0usize; points];
    let mut edges = Vec::with_capacity(points - 1);

    let mut current = 0;
    in_tree[current] = true;
    for _ in 1..points {
        for other in 0..points {
            if in_tree[other] {
                continue;
            }
            let reach = distances.get(current, other).max(core[current]).max(core[other]);
            if reach < best[other] {
                best[other] = reach;
                best_from[other] = current;
            }
        }

        let mut next = None;
        for other in 0..points {
            if in_tree[other] {
                continue;
            }
            match next {
                Some(chosen) if best[other] >= best[chosen] => {}
                _ => next = Some(other),
            }
        }
        let Some(next) = next else {
            break;
        };
        in_tree[next] = true;
        edges.push((best_from[next], next, best[next]));
        current = next;
    }
    edges
}

fn single_linkage(points: usize, sorted_edges: &[(usize, usize, f64)]) -> Vec<MergeNode> {
    let mut parent = (0..2 * points - 1).collect::<Vec<_>>();
    let mut sizes = vec![1usize; 2 * points - 1];
    let mut merges = Vec::with_capacity(points - 1);

    fn find(parent: &mut [usize], mut node: usize) -> usize {
        while parent[node] != node {
            parent[node] = parent[parent[node]];
            node = parent[node];
        }
        node
    }

    for (left, right, distance) in sorted_edges {
        let left_root = find(&mut parent, *left);
        let right_root = find(&mut parent, *right);
        let node = points + merges.len();
        let size = sizes[left_root] + sizes[right_root];
        parent[left_root] = node;
        parent[right_root] = node;
        sizes[node] = size;
        merges.push(MergeNode {
            left: left_root,
            right: right_root,
            distance: *distance,
            size,
        });
    }
    merges
}

fn condense(points: usize, merges: &[MergeNode], min_cluster_size: usize) -> Vec<CondensedEdge> {
    let node_size = |node: usize| -> usize {
        if node < points {
            1
        } else {
            merges[node - points].size
        }
    };
    let leaves_of = |node: usize| -> Vec<usize> {
        let mut leaves = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            if current < points {
                leaves.push(current);
            } else {
                let merge = merges[current - points];
                stack.push(merge.right);
                stack.push(merge.left);
            }
        }
        leaves
    };

    let mut condensed = Vec::new();
    let mut next_cluster = 1usize;
    let root = points + merges.len() - 1;
    let mut stack = vec![(root, 0usize)];

    while let Some((node, cluster)) = stack.pop() {
        if node < points {
            continue;
        }
        let merge = merges[node - points];
        let lambda = 1.0 / merge.distance.max(f64::EPSILON);
        let left_size = node_size(merge.left);
        let right_size = node_size(merge.right);
        let left_viable = left_size >= min_cluster_size;
        let right_viable = right_size >= min_cluster_size;

        match (left_viable, right_viable) {
            (true, true) => {
                for (child, size) in [(merge.left, left_size), (merge.right, right_size)] {
                    let id = next_cluster;
                    next_cluster += 1;
                    condensed.push(CondensedEdge {
                        parent: cluster,
                        child: CondensedChild::Cluster(id),
                        lambda,
                        size,
                    });
                    stack.push((child, id));
                }
            }
            (false, false) => {
                for point in leaves_of(merge.left).into_iter().chain(leaves_of(merge.right)) {
                    condensed.push(CondensedEdge {
                        parent: cluster,
                        child: CondensedChild::Point(point),
                        lambda,
                        size: 1,
                    });
                }
            }
            (left_viable, _) => {
                let (shed, kept) = if left_viable {
                    (merge.right, merge.left)
                } else {
                    (merge.left, merge.right)
                };
                for point in leaves_of(shed) {
                    condensed.push(CondensedEdge {
                        parent: cluster,
                        child: CondensedChild::Point(point),
                        lambda,
                        size: 1,
                    });
                }
                stack.push((kept, cluster));
            }
        }
    }
    condensed
}

/// Excess-of-mass selection; cluster `0` is the root and is never selected.
fn select_clusters(condensed: &[CondensedEdge], cluster_count: usize) -> Vec<bool> {
    let mut birth = vec![0.0_f64; cluster_count];
    let mut children = vec![Vec::new(); cluster_count];
    for edge in condensed {
        if let CondensedChild::Cluster(id) = edge.child {
            birth[id] = edge.lambda;
            children[edge.parent].push(id);
        }
    }

    let mut stability = vec![0.0_f64; cluster_count];
    for edge in condensed {
        stability[edge.parent] += (edge.lambda - birth[edge.parent]) * edge.size as f64;
    }

    let mut selected = vec![false; cluster_count];
    for cluster in (1..cluster_count).rev() {
        let subtree = children[cluster]
            .iter()
            .map(|child| stability[*child])
            .sum::<f64>();
        if children[cluster].is_empty() || stability[cluster] >= subtree {
            selected[cluster] = true;
            let mut stack = children[cluster].clone();
            while let Some(descendant) = stack.pop() {
                selected[descendant] = false;
                stack.extend(children[descendant].iter().copied());
            }
        } else {
            stability[cluster] = subtree;
        }
    }
    selected
}

fn label_points(
    points: usize,
    condensed: &[CondensedEdge],
    cluster_count: usize,
    selected: &[bool],
) -> Vec<GroupLabel> {
    let mut cluster_parent = vec![None; cluster_count];
    let mut point_cluster = vec![0usize; points];
    for edge in condensed {
        match edge.child {
            CondensedChild::Cluster(id) => cluster_parent[id] = Some(edge.parent),
            CondensedChild::Point(point) => point_cluster[point] = edge.parent,
        }
    }

    let mut dense = vec![None; cluster_count];
    let mut next_label = 0;
    for (cluster, flag) in selected.iter().enumerate() {
        if *flag {
            dense[cluster] = Some(next_label);
            next_label += 1;
        }
    }

    point_cluster
        .into_iter()
        .map(|mut cluster| loop {
            if let Some(label) = dense[cluster] {
                break GroupLabel::Group(label);
            }
            match cluster_parent[cluster] {
                Some(parent) => cluster = parent,
                None => break GroupLabel::Noise,
            }
        })
        .collect()
}
