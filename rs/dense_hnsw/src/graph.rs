use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashSet, VecDeque},
};

use crate::error::IndexError;

/// Dense internal node id, also the vector slot it owns.
pub type NodeId = u32;

/// Number of graph levels a node can be assigned to.
pub const MAX_LEVEL: u8 = 16;

/// Distance oracle the graph ranks nodes with.
pub(crate) trait Space {
    /// Distance from the query to a stored node.
    fn distance_to(&self, id: NodeId) -> f32;

    /// Distance between two stored nodes.
    fn distance_between(&self, a: NodeId, b: NodeId) -> f32;
}

/// Layer generator for HNSW graph.
///
/// Draws node levels from an exponential distribution over a seedable stream,
/// so a fixed seed reproduces the same graph shape.
#[derive(Debug, Clone)]
pub struct LayerGen {
    rng: StdRng,
    /// Scaling factor for the exponential distribution
    scale: f64,
    /// Maximum layer (exclusive)
    max_level: u8,
}

impl LayerGen {
    /// Creates a new layer generator
    ///
    /// # Arguments
    ///
    /// * `connectivity` - Maximum connections per node
    /// * `seed` - Fixed seed, or `None` to seed from the operating system
    pub fn new(connectivity: usize, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        LayerGen {
            rng,
            scale: 1.0 / (connectivity.max(2) as f64).ln(),
            max_level: MAX_LEVEL,
        }
    }

    /// Generates a random layer for a new node.
    pub fn generate(&mut self) -> u8 {
        let val: f64 = self.rng.random();
        // 使用指数分布计算层级
        let level = (-(1.0 - val).ln() * self.scale).floor();
        (level as u8).min(self.max_level - 1)
    }
}

/// HNSW graph node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// The highest layer this node appears in.
    #[serde(rename = "l")]
    pub level: u8,

    /// Neighbors at each layer, in insertion order.
    #[serde(rename = "n")]
    pub neighbors: Vec<SmallVec<[NodeId; 32]>>,

    /// Insertion sequence number. Slot ids are reused, so ids alone do not
    /// tell which node came first.
    #[serde(rename = "s")]
    pub seq: u64,
}

impl GraphNode {
    fn new(level: u8, connectivity: usize, seq: u64) -> Self {
        let neighbors = (0..=level)
            .map(|l| SmallVec::with_capacity(level_bound(connectivity, l)))
            .collect();
        Self {
            level,
            neighbors,
            seq,
        }
    }
}

/// Maximum neighbor count at `level`. Layer 0 keeps twice as many.
pub fn level_bound(connectivity: usize, level: u8) -> usize {
    if level == 0 {
        connectivity * 2
    } else {
        connectivity
    }
}

/// Multi-level proximity graph over node ids.
#[derive(Debug, Clone)]
pub struct Graph {
    connectivity: usize,
    /// Slot-indexed nodes, `None` for free slots.
    nodes: Vec<Option<GraphNode>>,
    /// Entry point for search (node_id, layer)
    entry: Option<(NodeId, u8)>,
    /// Sequence number of the next inserted node.
    next_seq: u64,
    layer_gen: LayerGen,
}

impl Graph {
    pub fn new(connectivity: usize, seed: Option<u64>) -> Self {
        Self {
            connectivity,
            nodes: Vec::new(),
            entry: None,
            next_seq: 0,
            layer_gen: LayerGen::new(connectivity, seed),
        }
    }

    /// Rebuilds a graph from persisted parts, checking every structural invariant.
    pub fn from_parts(
        connectivity: usize,
        seed: Option<u64>,
        nodes: Vec<Option<GraphNode>>,
        entry: Option<(NodeId, u8)>,
    ) -> Result<Self, IndexError> {
        let level_of = |id: NodeId| {
            nodes
                .get(id as usize)
                .and_then(|n| n.as_ref())
                .map(|n| n.level)
        };

        let mut seqs: HashSet<u64> = HashSet::with_capacity(nodes.len());
        for (id, node) in nodes.iter().enumerate() {
            let Some(node) = node else { continue };
            if !seqs.insert(node.seq) {
                return Err(IndexError::corrupt(format!(
                    "node {id} repeats insertion sequence {}",
                    node.seq
                )));
            }
            if node.level >= MAX_LEVEL {
                return Err(IndexError::corrupt(format!(
                    "node {id} has level {} beyond the maximum",
                    node.level
                )));
            }
            if node.neighbors.len() != node.level as usize + 1 {
                return Err(IndexError::corrupt(format!(
                    "node {id} has {} neighbor lists for level {}",
                    node.neighbors.len(),
                    node.level
                )));
            }
            for (level, list) in node.neighbors.iter().enumerate() {
                let level = level as u8;
                if list.len() > level_bound(connectivity, level) {
                    return Err(IndexError::corrupt(format!(
                        "node {id} exceeds the neighbor bound at level {level}"
                    )));
                }
                for (i, &n) in list.iter().enumerate() {
                    if n as usize == id || list[..i].contains(&n) {
                        return Err(IndexError::corrupt(format!(
                            "node {id} has a self or duplicate edge at level {level}"
                        )));
                    }
                    if !level_of(n).is_some_and(|l| l >= level) {
                        return Err(IndexError::corrupt(format!(
                            "node {id} links to missing node {n} at level {level}"
                        )));
                    }
                }
            }
        }

        let top = nodes.iter().flatten().map(|n| n.level).max();
        match (entry, top) {
            (None, None) => {}
            (Some((id, level)), Some(top)) if level_of(id) == Some(level) && level == top => {}
            _ => {
                return Err(IndexError::corrupt(format!(
                    "entry point {entry:?} does not match the graph"
                )));
            }
        }

        let next_seq = seqs.into_iter().max().map_or(0, |seq| seq + 1);
        Ok(Self {
            connectivity,
            nodes,
            entry,
            next_seq,
            layer_gen: LayerGen::new(connectivity, seed),
        })
    }

    pub fn nodes(&self) -> &[Option<GraphNode>] {
        &self.nodes
    }

    pub fn entry(&self) -> Option<(NodeId, u8)> {
        self.entry
    }

    pub fn max_level(&self) -> Option<u8> {
        self.entry.map(|(_, level)| level)
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id as usize).and_then(|n| n.as_ref())
    }

    /// Neighbors of `id` at `level`, empty when the node is absent or lower.
    pub fn neighbors(&self, id: NodeId, level: u8) -> &[NodeId] {
        self.node(id)
            .and_then(|n| n.neighbors.get(level as usize))
            .map(|l| l.as_slice())
            .unwrap_or(&[])
    }

    pub fn draw_level(&mut self) -> u8 {
        self.layer_gen.generate()
    }

    pub fn reserve(&mut self, slots: usize) -> Result<(), IndexError> {
        self.nodes
            .try_reserve_exact(slots.saturating_sub(self.nodes.len()))
            .map_err(|_| IndexError::CapacityExceeded { capacity: slots })
    }

    pub fn memory_usage(&self) -> usize {
        self.nodes.capacity() * size_of::<Option<GraphNode>>()
            + self
                .nodes
                .iter()
                .flatten()
                .map(|n| {
                    n.neighbors.capacity() * size_of::<SmallVec<[NodeId; 32]>>()
                        + n.neighbors
                            .iter()
                            .filter(|l| l.spilled())
                            .map(|l| l.capacity() * size_of::<NodeId>())
                            .sum::<usize>()
                })
                .sum::<usize>()
    }

    /// Links node `id` into the graph at levels `0..=level`.
    ///
    /// The node's vector must already be reachable through `space`, which
    /// measures distances from that vector.
    pub(crate) fn insert<S: Space>(&mut self, id: NodeId, level: u8, ef: usize, space: &S) {
        let slot = id as usize;
        if self.nodes.len() <= slot {
            self.nodes.resize(slot + 1, None);
        }
        self.nodes[slot] = Some(GraphNode::new(level, self.connectivity, self.next_seq));
        self.next_seq += 1;

        let Some((entry, top)) = self.entry else {
            self.entry = Some((id, level));
            return;
        };

        let mut ep = entry;
        let mut ep_dist = space.distance_to(ep);
        // Search from top layer down to find the best entry point
        for current in ((level + 1)..=top).rev() {
            (ep, ep_dist) = self.greedy(space, ep, ep_dist, current);
        }

        let mut overflow: VecDeque<(NodeId, u8)> = VecDeque::new();
        for current in (0..=level.min(top)).rev() {
            let nearest = self.search_layer(space, ep, ep_dist, current, ef);
            if let Some(&(dist, node)) = nearest.first() {
                ep = node;
                ep_dist = dist;
            }

            let candidates: Vec<(f32, NodeId)> =
                nearest.into_iter().filter(|&(_, n)| n != id).collect();
            let bound = level_bound(self.connectivity, current);
            let selected = select_diverse(candidates, bound, |a, b| space.distance_between(a, b));

            // 1. 添加到新节点的邻居列表
            if let Some(node) = self.nodes[slot].as_mut() {
                node.neighbors[current as usize] = selected.iter().copied().collect();
            }

            // 2. 添加反向连接，超出上限的邻居稍后修剪
            for &neighbor in &selected {
                let Some(list) = self.nodes[neighbor as usize]
                    .as_mut()
                    .and_then(|n| n.neighbors.get_mut(current as usize))
                else {
                    continue;
                };
                if !list.contains(&id) {
                    list.push(id);
                }
                if list.len() > bound {
                    overflow.push_back((neighbor, current));
                }
            }
        }

        while let Some((node, current)) = overflow.pop_front() {
            self.prune(node, current, space);
        }

        if level > top {
            self.entry = Some((id, level));
        }
    }

    /// Searches the `ef` nearest nodes to the query, ascending by distance
    /// with ties ordered by node id.
    pub(crate) fn search<S: Space>(&self, space: &S, ef: usize) -> Vec<(f32, NodeId)> {
        let Some((mut ep, top)) = self.entry else {
            return Vec::new();
        };
        let mut ep_dist = space.distance_to(ep);
        // 从最高层向下搜索入口点
        for current in (1..=top).rev() {
            (ep, ep_dist) = self.greedy(space, ep, ep_dist, current);
        }
        // 在底层搜索最近的邻居
        self.search_layer(space, ep, ep_dist, 0, ef)
    }

    /// Detaches node `id` from every neighbor list and frees its slot.
    ///
    /// Returns false if the node was not in the graph.
    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(removed) = self.nodes.get_mut(id as usize).and_then(Option::take) else {
            return false;
        };

        // 遍历所有节点，删除与已删除节点的连接
        for node in self.nodes.iter_mut().flatten() {
            for list in node.neighbors.iter_mut() {
                list.retain(|n| *n != id);
            }
        }

        if self.entry.is_some_and(|(entry, _)| entry == id) {
            // 最高层中最早插入的节点成为新的入口点
            self.entry = self
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i as NodeId, n.level, n.seq)))
                .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
                .map(|(id, level, _)| (id, level));
            log::debug!(
                action = "remove",
                removed = id,
                removed_level = removed.level,
                entry:? = self.entry;
                "entry point promoted"
            );
        }
        true
    }

    /// Greedy 1-nearest walk at one level.
    fn greedy<S: Space>(&self, space: &S, ep: NodeId, ep_dist: f32, level: u8) -> (NodeId, f32) {
        let mut best = (OrderedFloat(ep_dist), ep);
        loop {
            let mut changed = false;
            for &neighbor in self.neighbors(best.1, level) {
                let candidate = (OrderedFloat(space.distance_to(neighbor)), neighbor);
                if candidate < best {
                    best = candidate;
                    changed = true;
                }
            }
            if !changed {
                return (best.1, best.0.0);
            }
        }
    }

    /// Beam search of width `ef` within one level.
    fn search_layer<S: Space>(
        &self,
        space: &S,
        ep: NodeId,
        ep_dist: f32,
        level: u8,
        ef: usize,
    ) -> Vec<(f32, NodeId)> {
        let ef = ef.max(1);
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(ef * 2);
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat<f32>, NodeId)>> =
            BinaryHeap::with_capacity(ef * 2);
        let mut results: BinaryHeap<(OrderedFloat<f32>, NodeId)> =
            BinaryHeap::with_capacity(ef + 1);

        let start = (OrderedFloat(ep_dist), ep);
        visited.insert(ep);
        candidates.push(Reverse(start));
        results.push(start);

        while let Some(Reverse(current)) = candidates.pop() {
            if results.len() >= ef && results.peek().is_some_and(|&worst| current > worst) {
                break;
            }

            for &neighbor in self.neighbors(current.1, level) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let candidate = (OrderedFloat(space.distance_to(neighbor)), neighbor);
                let accept = results.len() < ef || results.peek().is_some_and(|&w| candidate < w);
                if accept {
                    candidates.push(Reverse(candidate));
                    results.push(candidate);
                    // Prune distant results
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        results
            .into_sorted_vec()
            .into_iter()
            .map(|(d, id)| (d.0, id))
            .collect()
    }

    /// Re-prunes an overflowing neighbor list with the diversity rule.
    fn prune<S: Space>(&mut self, id: NodeId, level: u8, space: &S) {
        let bound = level_bound(self.connectivity, level);
        let list = self.neighbors(id, level);
        if list.len() <= bound {
            return;
        }
        let mut candidates: Vec<(f32, NodeId)> = list
            .iter()
            .map(|&n| (space.distance_between(id, n), n))
            .collect();
        candidates.sort_by_key(|&(d, n)| (OrderedFloat(d), n));
        let selected = select_diverse(candidates, bound, |a, b| space.distance_between(a, b));

        if let Some(list) = self.nodes[id as usize]
            .as_mut()
            .and_then(|n| n.neighbors.get_mut(level as usize))
        {
            *list = selected.into_iter().collect();
        }
    }
}

/// Selects up to `m` neighbors from candidates sorted by ascending distance.
///
/// A candidate is kept only if no already selected neighbor is closer to it
/// than the base node is. Lists that already fit are kept whole.
fn select_diverse<F>(candidates: Vec<(f32, NodeId)>, m: usize, distance: F) -> Vec<NodeId>
where
    F: Fn(NodeId, NodeId) -> f32,
{
    if candidates.len() <= m {
        return candidates.into_iter().map(|(_, n)| n).collect();
    }

    let mut selected: Vec<NodeId> = Vec::with_capacity(m);
    for (dist, candidate) in candidates {
        if selected.len() >= m {
            break;
        }
        if selected.iter().all(|&s| distance(candidate, s) >= dist) {
            selected.push(candidate);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Points<'a> {
        points: &'a [Vec<f32>],
        query: &'a [f32],
    }

    fn l2(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
    }

    impl Space for Points<'_> {
        fn distance_to(&self, id: NodeId) -> f32 {
            l2(self.query, &self.points[id as usize])
        }

        fn distance_between(&self, a: NodeId, b: NodeId) -> f32 {
            l2(&self.points[a as usize], &self.points[b as usize])
        }
    }

    fn build(points: &[Vec<f32>], connectivity: usize, ef: usize) -> Graph {
        let mut graph = Graph::new(connectivity, Some(42));
        for (i, p) in points.iter().enumerate() {
            let level = graph.draw_level();
            graph.insert(i as NodeId, level, ef, &Points { points, query: p });
        }
        graph
    }

    fn random_points(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dims).map(|_| rng.random::<f32>()).collect())
            .collect()
    }

    fn assert_invariants(graph: &Graph) {
        let rebuilt = Graph::from_parts(
            graph.connectivity,
            None,
            graph.nodes.clone(),
            graph.entry,
        );
        assert!(rebuilt.is_ok(), "{:?}", rebuilt.err());
    }

    #[test]
    fn test_layer_gen() {
        let mut a = LayerGen::new(16, Some(7));
        let mut b = LayerGen::new(16, Some(7));
        let levels: Vec<u8> = (0..1000).map(|_| a.generate()).collect();
        assert_eq!(levels, (0..1000).map(|_| b.generate()).collect::<Vec<_>>());
        assert!(levels.iter().all(|&l| l < MAX_LEVEL));

        // 大部分节点位于第 0 层
        let zeros = levels.iter().filter(|&&l| l == 0).count();
        assert!(zeros > 800, "zeros: {zeros}");
        assert!(levels.iter().any(|&l| l > 0));

        // connectivity 1 behaves like 2
        let mut one = LayerGen::new(1, Some(7));
        let mut two = LayerGen::new(2, Some(7));
        for _ in 0..100 {
            assert_eq!(one.generate(), two.generate());
        }
    }

    #[test]
    fn test_select_diverse() {
        // Points on a line: 1 and 2 are on the same side of 0.
        let points = [vec![0.0f32], vec![1.0], vec![2.0], vec![-1.5]];
        let space = Points {
            points: &points,
            query: &points[0],
        };
        let candidates = vec![(1.0, 1), (2.25, 3), (4.0, 2)];
        let selected = select_diverse(candidates.clone(), 2, |a, b| space.distance_between(a, b));
        assert_eq!(selected, vec![1, 3]);

        // Lists that fit are kept whole
        let selected = select_diverse(candidates, 3, |a, b| space.distance_between(a, b));
        assert_eq!(selected, vec![1, 3, 2]);
    }

    #[test]
    fn test_insert_and_search() {
        let points = random_points(500, 8, 1);
        let graph = build(&points, 8, 64);
        assert_invariants(&graph);

        let mut hits = 0;
        for q in random_points(50, 8, 2) {
            let space = Points {
                points: &points,
                query: &q,
            };
            let results = graph.search(&space, 64);
            assert_eq!(results.len(), 64);
            assert!(results.windows(2).all(|w| w[0].0 <= w[1].0));

            let truth = (0..points.len() as NodeId)
                .min_by_key(|&i| (OrderedFloat(space.distance_to(i)), i))
                .unwrap();
            if results[0].1 == truth {
                hits += 1;
            }
        }
        assert!(hits >= 48, "recall@1 too low: {hits}/50");
    }

    #[test]
    fn test_bidirectional_edges() {
        let points = random_points(200, 4, 3);
        let graph = build(&points, 4, 32);
        let mut reciprocal = 0;
        let mut total = 0;
        for (id, node) in graph.nodes.iter().enumerate() {
            let node = node.as_ref().unwrap();
            for (level, list) in node.neighbors.iter().enumerate() {
                for &n in list {
                    total += 1;
                    if graph.neighbors(n, level as u8).contains(&(id as NodeId)) {
                        reciprocal += 1;
                    }
                }
            }
        }
        // Only re-pruning drops the reverse edge.
        assert!(reciprocal * 2 >= total, "{reciprocal}/{total}");
    }

    #[test]
    fn test_remove() {
        let points: Vec<Vec<f32>> = (0..100).map(|i| vec![i as f32]).collect();
        let mut graph = build(&points, 8, 16);

        assert!(graph.remove(50));
        assert!(!graph.remove(50));
        assert!(graph.node(50).is_none());
        for node in graph.nodes.iter().flatten() {
            assert!(node.neighbors.iter().all(|l| !l.contains(&50)));
        }
        assert_invariants(&graph);

        // Remove the entry point until one node is left.
        while let Some((entry, level)) = graph.entry {
            let top = graph.nodes.iter().flatten().map(|n| n.level).max().unwrap();
            assert_eq!(level, top);
            graph.remove(entry);
            assert_invariants(&graph);
        }
        assert!(graph.nodes.iter().all(|n| n.is_none()));
        let space = Points {
            points: &points,
            query: &points[0],
        };
        assert!(graph.search(&space, 10).is_empty());
    }

    #[test]
    fn test_promotion_prefers_first_inserted() {
        let points: Vec<Vec<f32>> = (0..3).map(|i| vec![i as f32]).collect();
        let insert = |graph: &mut Graph, id: NodeId, level: u8| {
            let space = Points {
                points: &points,
                query: &points[id as usize],
            };
            graph.insert(id, level, 16, &space);
        };

        let mut graph = Graph::new(4, Some(1));
        insert(&mut graph, 0, 2);
        insert(&mut graph, 1, 1);
        insert(&mut graph, 2, 1);

        // 槽位 1 被复用，此时它比节点 2 更晚插入
        assert!(graph.remove(1));
        insert(&mut graph, 1, 1);
        assert_eq!(graph.entry(), Some((0, 2)));

        assert!(graph.remove(0));
        assert_eq!(graph.entry(), Some((2, 1)));
        assert_invariants(&graph);

        // The order survives a rebuild from parts.
        let mut rebuilt =
            Graph::from_parts(4, None, graph.nodes.clone(), graph.entry).unwrap();
        assert!(rebuilt.remove(2));
        assert_eq!(rebuilt.entry(), Some((1, 1)));
        assert_eq!(rebuilt.next_seq, 4);
    }

    #[test]
    fn test_from_parts_rejects_corruption() {
        let points = random_points(50, 4, 4);
        let graph = build(&points, 4, 16);

        let mut nodes = graph.nodes.clone();
        let (entry, _) = graph.entry.unwrap();
        nodes[entry as usize].as_mut().unwrap().neighbors[0].push(entry);
        assert!(matches!(
            Graph::from_parts(4, None, nodes, graph.entry),
            Err(IndexError::CorruptState { .. })
        ));

        let mut nodes = graph.nodes.clone();
        nodes[0].as_mut().unwrap().neighbors[0].push(999);
        assert!(Graph::from_parts(4, None, nodes, graph.entry).is_err());

        assert!(Graph::from_parts(4, None, graph.nodes.clone(), None).is_err());
        assert!(Graph::from_parts(4, None, vec![], Some((0, 0))).is_err());
    }
}
