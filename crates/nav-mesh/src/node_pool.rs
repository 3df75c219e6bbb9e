//! Node pool and priority queue primitives for graph searches
//!
//! Every search over the polygon graph keeps its frontier in these
//! structures. Nodes are addressed by 1-based [`NodeIndex`] values, with
//! `0` meaning "none"; parent links are indices rather than references so
//! a search can freely mutate the pool while the open list holds handles
//! into it.

use super::PolyRef;

/// Node flags for pathfinding state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags(pub u8);

impl NodeFlags {
    pub const OPEN: NodeFlags = NodeFlags(0x01);
    pub const CLOSED: NodeFlags = NodeFlags(0x02);
    /// The node's parent is not adjacent; reconstruction must raycast
    /// between the two
    pub const PARENT_DETACHED: NodeFlags = NodeFlags(0x04);

    #[inline]
    pub fn contains(self, flag: NodeFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, flag: NodeFlags) {
        self.0 |= flag.0;
    }

    #[inline]
    pub fn remove(&mut self, flag: NodeFlags) {
        self.0 &= !flag.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// 1-based index of a node in a pool; `0` is "no node"
pub type NodeIndex = u16;

/// Sentinel for the end of a hash chain
const NULL_IDX: NodeIndex = NodeIndex::MAX;

/// Node in a graph search
#[derive(Debug, Clone, Default)]
pub struct Node {
    /// Position the search associated with the node, usually a portal
    /// midpoint
    pub pos: [f32; 3],
    /// Cost from the search origin to this node
    pub cost: f32,
    /// Total cost used for queue ordering (cost plus heuristic)
    pub total: f32,
    /// 1-based index of the parent node, 0 for none
    pub pidx: NodeIndex,
    /// Extra state distinguishing multiple nodes on one polygon, e.g.
    /// the boundary side a tile crossing arrived through
    pub state: u8,
    /// Search flags
    pub flags: NodeFlags,
    /// Polygon the node stands on
    pub id: PolyRef,
}

/// Pool of search nodes with a chained hash lookup by polygon ref
///
/// Multiple nodes may exist for one polygon as long as their `state`
/// differs. Allocation order is stable, which keeps searches
/// deterministic for identical inputs.
pub struct NodePool {
    nodes: Vec<Node>,
    first: Vec<NodeIndex>,
    next: Vec<NodeIndex>,
    max_nodes: usize,
    hash_size: usize,
    node_count: usize,
}

impl NodePool {
    /// Creates a pool holding up to `max_nodes` nodes; `hash_size` must
    /// be a power of two
    pub fn new(max_nodes: usize, hash_size: usize) -> Self {
        debug_assert!(hash_size.is_power_of_two());
        debug_assert!(max_nodes > 0);
        // 0-based chain indices must stay clear of the null sentinel.
        debug_assert!(max_nodes <= NULL_IDX as usize);

        Self {
            nodes: vec![Node::default(); max_nodes],
            first: vec![NULL_IDX; hash_size],
            next: vec![NULL_IDX; max_nodes],
            max_nodes,
            hash_size,
            node_count: 0,
        }
    }

    /// Forgets all nodes without releasing storage
    pub fn clear(&mut self) {
        self.first.fill(NULL_IDX);
        self.node_count = 0;
    }

    /// Maximum number of nodes the pool can hold
    #[inline]
    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Number of nodes currently allocated
    #[inline]
    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Integer hash distributing polygon refs across buckets
    /// (Thomas Wang 64-bit mix)
    #[inline]
    fn hash_ref(id: PolyRef) -> usize {
        let mut a = id.id();
        a = (!a).wrapping_add(a << 18);
        a ^= a >> 31;
        a = a.wrapping_mul(21);
        a ^= a >> 11;
        a = a.wrapping_add(a << 6);
        a ^= a >> 22;
        a as u32 as usize
    }

    /// Returns the node for `(id, state)`, allocating it zeroed if it
    /// does not exist yet. `None` when the pool is saturated.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let bucket = Self::hash_ref(id) & (self.hash_size - 1);
        let mut i = self.first[bucket];
        while i != NULL_IDX {
            let n = &self.nodes[i as usize];
            if n.id == id && n.state == state {
                return Some(i + 1);
            }
            i = self.next[i as usize];
        }

        if self.node_count >= self.max_nodes {
            return None;
        }

        let i = self.node_count as NodeIndex;
        self.node_count += 1;

        let node = &mut self.nodes[i as usize];
        node.pos = [0.0; 3];
        node.pidx = 0;
        node.cost = 0.0;
        node.total = 0.0;
        node.id = id;
        node.state = state;
        node.flags = NodeFlags::default();

        self.next[i as usize] = self.first[bucket];
        self.first[bucket] = i;

        Some(i + 1)
    }

    /// Finds the node for `(id, state)` without allocating
    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        let bucket = Self::hash_ref(id) & (self.hash_size - 1);
        let mut i = self.first[bucket];
        while i != NULL_IDX {
            let n = &self.nodes[i as usize];
            if n.id == id && n.state == state {
                return Some(i + 1);
            }
            i = self.next[i as usize];
        }
        None
    }

    /// Collects every node on the polygon regardless of state, up to
    /// `max_nodes` of them
    pub fn find_nodes(&self, id: PolyRef, max_nodes: usize) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        let bucket = Self::hash_ref(id) & (self.hash_size - 1);
        let mut i = self.first[bucket];
        while i != NULL_IDX && out.len() < max_nodes {
            if self.nodes[i as usize].id == id {
                out.push(i + 1);
            }
            i = self.next[i as usize];
        }
        out
    }

    /// Resolves a 1-based index to the node; `0` resolves to `None`
    #[inline]
    pub fn node(&self, idx: NodeIndex) -> Option<&Node> {
        if idx == 0 || idx as usize > self.node_count {
            None
        } else {
            Some(&self.nodes[(idx - 1) as usize])
        }
    }

    /// Mutable variant of [`NodePool::node`]
    #[inline]
    pub fn node_mut(&mut self, idx: NodeIndex) -> Option<&mut Node> {
        if idx == 0 || idx as usize > self.node_count {
            None
        } else {
            Some(&mut self.nodes[(idx - 1) as usize])
        }
    }
}

/// Binary min-heap of node indices ordered by [`Node::total`]
///
/// The heap stores pool indices, so every operation takes the pool to
/// read the current totals. `modify` re-sorts a node whose total was
/// lowered after it was pushed.
pub struct NodeQueue {
    heap: Vec<NodeIndex>,
}

impl NodeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Index of the cheapest node without removing it
    #[inline]
    pub fn peek(&self) -> Option<NodeIndex> {
        self.heap.first().copied()
    }

    #[inline]
    fn total(&self, pool: &NodePool, i: usize) -> f32 {
        pool.node(self.heap[i]).map_or(f32::MAX, |n| n.total)
    }

    /// Pushes a node index onto the heap
    pub fn push(&mut self, idx: NodeIndex, pool: &NodePool) {
        self.heap.push(idx);
        self.bubble_up(self.heap.len() - 1, idx, pool);
    }

    /// Pops the node with the lowest total
    pub fn pop(&mut self, pool: &NodePool) -> Option<NodeIndex> {
        if self.heap.is_empty() {
            return None;
        }
        let result = self.heap[0];
        let last = self.heap.pop().unwrap();
        if !self.heap.is_empty() {
            self.heap[0] = last;
            self.trickle_down(0, last, pool);
        }
        Some(result)
    }

    /// Re-sorts a node whose total cost decreased
    pub fn modify(&mut self, idx: NodeIndex, pool: &NodePool) {
        for i in 0..self.heap.len() {
            if self.heap[i] == idx {
                self.bubble_up(i, idx, pool);
                return;
            }
        }
    }

    fn bubble_up(&mut self, mut i: usize, idx: NodeIndex, pool: &NodePool) {
        let total = pool.node(idx).map_or(f32::MAX, |n| n.total);
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.total(pool, parent) <= total {
                break;
            }
            self.heap[i] = self.heap[parent];
            i = parent;
        }
        self.heap[i] = idx;
    }

    fn trickle_down(&mut self, mut i: usize, idx: NodeIndex, pool: &NodePool) {
        let total = pool.node(idx).map_or(f32::MAX, |n| n.total);
        loop {
            let child1 = 2 * i + 1;
            if child1 >= self.heap.len() {
                break;
            }
            let child2 = child1 + 1;
            let mut min_child = child1;
            if child2 < self.heap.len() && self.total(pool, child2) < self.total(pool, child1) {
                min_child = child2;
            }
            if total <= self.total(pool, min_child) {
                break;
            }
            self.heap[i] = self.heap[min_child];
            i = min_child;
        }
        self.heap[i] = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool_alloc_and_find() {
        let mut pool = NodePool::new(16, 8);

        let a = PolyRef::new(1);
        let i1 = pool.get_node(a, 0).unwrap();
        assert_eq!(pool.node(i1).unwrap().id, a);
        assert_eq!(pool.node(i1).unwrap().state, 0);

        // Same (ref, state) pair returns the same node.
        let i2 = pool.get_node(a, 0).unwrap();
        assert_eq!(i1, i2);

        // A different state allocates a second node on the same ref.
        let i3 = pool.get_node(a, 1).unwrap();
        assert_ne!(i1, i3);

        assert_eq!(pool.find_node(a, 0), Some(i1));
        assert_eq!(pool.find_node(a, 1), Some(i3));
        assert_eq!(pool.find_node(a, 2), None);
        assert_eq!(pool.find_nodes(a, 8).len(), 2);
        assert_eq!(pool.node_count(), 2);
    }

    #[test]
    fn test_node_pool_indices_are_one_based() {
        let mut pool = NodePool::new(4, 4);
        assert!(pool.node(0).is_none());
        let i = pool.get_node(PolyRef::new(7), 0).unwrap();
        assert_eq!(i, 1);
        assert!(pool.node(i).is_some());
    }

    #[test]
    fn test_node_pool_saturation() {
        let mut pool = NodePool::new(2, 2);
        assert!(pool.get_node(PolyRef::new(1), 0).is_some());
        assert!(pool.get_node(PolyRef::new(2), 0).is_some());
        assert!(pool.get_node(PolyRef::new(3), 0).is_none());

        // Existing nodes are still reachable at saturation.
        assert!(pool.get_node(PolyRef::new(2), 0).is_some());
    }

    #[test]
    fn test_clear_is_equivalent_to_fresh_pool() {
        let mut pool = NodePool::new(8, 4);
        pool.get_node(PolyRef::new(1), 0).unwrap();
        pool.get_node(PolyRef::new(2), 0).unwrap();
        pool.clear();
        assert_eq!(pool.node_count(), 0);
        assert_eq!(pool.find_node(PolyRef::new(1), 0), None);
        // First allocation after clear gets index 1 again.
        assert_eq!(pool.get_node(PolyRef::new(9), 0), Some(1));
    }

    #[test]
    fn test_queue_orders_by_total() {
        let mut pool = NodePool::new(16, 8);
        let mut queue = NodeQueue::new(16);

        for (r, total) in [(1u64, 5.0f32), (2, 3.0), (3, 7.0), (4, 1.0)] {
            let i = pool.get_node(PolyRef::new(r), 0).unwrap();
            pool.node_mut(i).unwrap().total = total;
            queue.push(i, &pool);
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop(&pool))
            .map(|i| pool.node(i).unwrap().id.id())
            .collect();
        assert_eq!(order, vec![4, 2, 1, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_modify_reorders() {
        let mut pool = NodePool::new(16, 8);
        let mut queue = NodeQueue::new(16);

        let a = pool.get_node(PolyRef::new(1), 0).unwrap();
        pool.node_mut(a).unwrap().total = 10.0;
        queue.push(a, &pool);

        let b = pool.get_node(PolyRef::new(2), 0).unwrap();
        pool.node_mut(b).unwrap().total = 5.0;
        queue.push(b, &pool);

        // Lower a's total below b's and re-sort.
        pool.node_mut(a).unwrap().total = 1.0;
        queue.modify(a, &pool);

        assert_eq!(queue.pop(&pool), Some(a));
        assert_eq!(queue.pop(&pool), Some(b));
    }
}
