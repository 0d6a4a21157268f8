use crate::point::{
    PointArena,
    PointKey,
};

/// Search tree over scheduled points ordered by remaining resources,
/// annotated with the minimum `at` in each subtree.
///
/// Threaded through the `m_*` link fields of the arena points. The key is
/// the `m_remaining` snapshot taken at insertion (duplicates allowed);
/// whenever a point's live `remaining` changes, the planner removes and
/// re-inserts it. The `m_min_at` annotation is maintained structurally on
/// every split and merge, so `get_mintime` answers "earliest point with at
/// least R free" in one descent.
#[derive(Clone, Debug, Default)]
pub(crate) struct MinTimeTree {
    root: Option<PointKey>,
    len: usize,
}

impl MinTimeTree {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, arena: &mut PointArena, node: PointKey) {
        debug_assert!(!arena[node].in_mt_tree);
        let key = arena[node].remaining;
        arena[node].m_remaining = key;
        arena[node].m_parent = None;
        arena[node].m_child = [None; 2];
        arena[node].m_min_at = node;
        arena[node].in_mt_tree = true;
        match self.root {
            None => self.root = Some(node),
            Some(root) => self.root = Some(self.insert_node(arena, root, key, node)),
        }
        self.len += 1;
    }

    fn insert_node(
        &mut self,
        arena: &mut PointArena,
        parent: PointKey,
        key: i64,
        node: PointKey,
    ) -> PointKey {
        if arena[node].m_weight < arena[parent].m_weight {
            // to maintain heap ordering, `node` replaces `parent` in the tree
            let (l, r) = self.split(arena, parent, key);
            arena[node].m_child = [l, r];
            if let Some(l) = l {
                arena[l].m_parent = Some(node);
            }
            if let Some(r) = r {
                arena[r].m_parent = Some(node);
            }
            self.recalculate_annotation(arena, node);
            return node;
        }
        let child = if key < arena[parent].m_remaining { 0 } else { 1 };
        let inserted = if let Some(child_node) = arena[parent].m_child[child] {
            self.insert_node(arena, child_node, key, node)
        } else {
            node
        };
        arena[parent].m_child[child] = Some(inserted);
        arena[inserted].m_parent = Some(parent);
        self.recalculate_annotation(arena, parent);
        parent
    }

    /// Splits the subtree at `node` into one side with keys `<= key` and
    /// one with keys `> key`.
    fn split(
        &mut self,
        arena: &mut PointArena,
        node: PointKey,
        key: i64,
    ) -> (Option<PointKey>, Option<PointKey>) {
        if arena[node].m_remaining <= key {
            if let Some(child) = arena[node].m_child[1] {
                let (r0, r1) = self.split(arena, child, key);
                arena[node].m_child[1] = r0;
                if let Some(r0) = r0 {
                    arena[r0].m_parent = Some(node);
                }
                self.recalculate_annotation(arena, node);
                (Some(node), r1)
            } else {
                (Some(node), None)
            }
        } else {
            if let Some(child) = arena[node].m_child[0] {
                let (l0, l1) = self.split(arena, child, key);
                arena[node].m_child[0] = l1;
                if let Some(l1) = l1 {
                    arena[l1].m_parent = Some(node);
                }
                self.recalculate_annotation(arena, node);
                (l0, Some(node))
            } else {
                (None, Some(node))
            }
        }
    }

    /// Unlinks `n` and clears its membership flag. The point stays in the
    /// arena (it may be parked in an availability-iteration tracker).
    pub fn remove(&mut self, arena: &mut PointArena, n: PointKey) {
        debug_assert!(arena[n].in_mt_tree);
        let children = arena[n].m_child;
        let new_child = self.merge(arena, children[0], children[1]);
        let parent = arena[n].m_parent;
        if let Some(c) = new_child {
            arena[c].m_parent = parent;
        }
        match parent {
            Some(p) => {
                Self::replace_child(arena, p, n, new_child);
                self.recalculate_annotations_to_root(arena, p);
            },
            None => self.root = new_child,
        }
        arena[n].m_parent = None;
        arena[n].m_child = [None; 2];
        arena[n].m_min_at = n;
        arena[n].in_mt_tree = false;
        self.len -= 1;
    }

    fn replace_child(arena: &mut PointArena, parent: PointKey, from: PointKey, to: Option<PointKey>) {
        if arena[parent].m_child[0] == Some(from) {
            arena[parent].m_child[0] = to;
        } else {
            assert_eq!(arena[parent].m_child[1], Some(from));
            arena[parent].m_child[1] = to;
        }
    }

    /// Merges two subtrees. Order-preserving: keys under `n` must be less
    /// than or equal to keys under `m`.
    fn merge(
        &mut self,
        arena: &mut PointArena,
        n: Option<PointKey>,
        m: Option<PointKey>,
    ) -> Option<PointKey> {
        let Some(n) = n else {
            return m;
        };
        let Some(m) = m else {
            return Some(n);
        };
        debug_assert!(arena[n].m_remaining <= arena[m].m_remaining);
        if arena[n].m_weight <= arena[m].m_weight {
            // n becomes the root
            let n_right = arena[n].m_child[1];
            let right = self.merge(arena, n_right, Some(m));
            arena[n].m_child[1] = right;
            if let Some(r) = right {
                arena[r].m_parent = Some(n);
            }
            self.recalculate_annotation(arena, n);
            Some(n)
        } else {
            // m becomes the root
            let m_left = arena[m].m_child[0];
            let left = self.merge(arena, Some(n), m_left);
            arena[m].m_child[0] = left;
            if let Some(l) = left {
                arena[l].m_parent = Some(m);
            }
            self.recalculate_annotation(arena, m);
            Some(m)
        }
    }

    /// Recalculates `m_min_at` for `node` from its children.
    fn recalculate_annotation(&mut self, arena: &mut PointArena, node: PointKey) {
        let mut ix = node;
        for child in arena[node].m_child {
            if let Some(c) = child {
                let m = arena[c].m_min_at;
                if arena[m].at < arena[ix].at {
                    ix = m;
                }
            }
        }
        arena[node].m_min_at = ix;
    }

    fn recalculate_annotations_to_root(&mut self, arena: &mut PointArena, node: PointKey) {
        let mut node = Some(node);
        while let Some(n) = node {
            self.recalculate_annotation(arena, n);
            node = arena[n].m_parent;
        }
    }

    /// The point with the smallest `at` among those whose recorded
    /// remaining is at least `request`.
    pub fn get_mintime(&self, arena: &PointArena, request: i64) -> Option<PointKey> {
        let (anchor, min_time) = self.find_mintime_anchor(arena, request);
        self.find_mintime_point(arena, anchor?, min_time)
    }

    fn right_branch_mintime(&self, arena: &PointArena, n: PointKey) -> i64 {
        let mut min_time = i64::MAX;
        if let Some(right) = arena[n].m_child[1] {
            min_time = arena[arena[right].m_min_at].at;
        }
        min_time.min(arena[n].at)
    }

    fn find_mintime_anchor(&self, arena: &PointArena, request: i64) -> (Option<PointKey>, i64) {
        let mut node = self.root;
        let mut anchor = None;
        let mut min_time = i64::MAX;
        while let Some(n) = node {
            if request <= arena[n].m_remaining {
                // The visiting node satisfies the request, so every node in
                // its right subtree does too; their best time is the right
                // branch minimum. The left subtree may still hold a
                // satisfying node with a smaller time.
                let right_min_time = self.right_branch_mintime(arena, n);
                if right_min_time < min_time {
                    min_time = right_min_time;
                    anchor = Some(n);
                }
                node = arena[n].m_child[0];
            } else {
                // Nothing in the left subtree can satisfy the request:
                // search right.
                node = arena[n].m_child[1];
            }
        }
        (anchor, min_time)
    }

    fn find_mintime_point(
        &self,
        arena: &PointArena,
        anchor: PointKey,
        min_time: i64,
    ) -> Option<PointKey> {
        if arena[anchor].at == min_time {
            return Some(anchor);
        }
        let mut node = arena[anchor].m_child[1];
        while let Some(n) = node {
            if arena[n].at == min_time {
                return Some(n);
            }
            node = match arena[n].m_child[0] {
                Some(l) if arena[arena[l].m_min_at].at == min_time => Some(l),
                _ => arena[n].m_child[1],
            };
        }
        // Once an anchor was found there must be a point achieving its
        // minimum time.
        debug_assert!(false, "anchored min-time point missing");
        None
    }

    #[cfg(test)]
    pub fn check_invariants(&self, arena: &PointArena) {
        let count = match self.root {
            Some(root) => {
                assert_eq!(arena[root].m_parent, None);
                let (min_at, size) = self.check_subtree(arena, root, i64::MIN, i64::MAX);
                assert_eq!(arena[arena[root].m_min_at].at, arena[min_at].at);
                size
            },
            None => 0,
        };
        assert_eq!(count, self.len);
    }

    /// Checks key ordering, weight heap ordering, parent pointers, and the
    /// min-time annotation. Returns the node achieving the subtree minimum
    /// and the subtree size.
    #[cfg(test)]
    fn check_subtree(
        &self,
        arena: &PointArena,
        n: PointKey,
        lo: i64,
        hi: i64,
    ) -> (PointKey, usize) {
        let key = arena[n].m_remaining;
        assert!(lo <= key && key <= hi, "key {key} out of range [{lo}, {hi}]");
        assert!(arena[n].in_mt_tree);
        let mut min_at = n;
        let mut size = 1;
        for (c, lo, hi) in [(arena[n].m_child[0], lo, key), (arena[n].m_child[1], key, hi)] {
            if let Some(c) = c {
                assert_eq!(arena[c].m_parent, Some(n));
                assert!(arena[n].m_weight <= arena[c].m_weight);
                let (sub_min, sub_size) = self.check_subtree(arena, c, lo, hi);
                size += sub_size;
                if arena[sub_min].at < arena[min_at].at {
                    min_at = sub_min;
                }
            }
        }
        assert_eq!(arena[arena[n].m_min_at].at, arena[min_at].at);
        (min_at, size)
    }
}
