use errors::ErrorMetadata;

use crate::point::{
    PointArena,
    PointKey,
};

/// Search tree over scheduled points ordered by `at`.
///
/// This is a treap threaded through the `t_*` link fields of the arena
/// points: a node's `t_weight` is minimal within its subtree, so the tree
/// stays balanced in expectation without rebalance bookkeeping on delete.
/// Times are unique; inserting a duplicate is an error.
#[derive(Clone, Debug, Default)]
pub(crate) struct PointTree {
    root: Option<PointKey>,
    len: usize,
}

impl PointTree {
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, arena: &mut PointArena, node: PointKey) -> anyhow::Result<()> {
        let at = arena[node].at;
        if self.search(arena, at).is_some() {
            anyhow::bail!(ErrorMetadata::already_exists(
                "PointExists",
                format!("a scheduled point at time {at} already exists"),
            ));
        }
        arena[node].t_parent = None;
        arena[node].t_child = [None; 2];
        match self.root {
            None => self.root = Some(node),
            Some(root) => self.root = Some(self.insert_node(arena, root, at, node)),
        }
        self.len += 1;
        Ok(())
    }

    fn insert_node(
        &mut self,
        arena: &mut PointArena,
        parent: PointKey,
        at: i64,
        node: PointKey,
    ) -> PointKey {
        if arena[node].t_weight < arena[parent].t_weight {
            // to maintain heap ordering, `node` replaces `parent` in the tree
            let (l, r) = self.split(arena, parent, at);
            arena[node].t_child = [l, r];
            if let Some(l) = l {
                arena[l].t_parent = Some(node);
            }
            if let Some(r) = r {
                arena[r].t_parent = Some(node);
            }
            return node;
        }
        let child = if at < arena[parent].at { 0 } else { 1 };
        let inserted = if let Some(child_node) = arena[parent].t_child[child] {
            self.insert_node(arena, child_node, at, node)
        } else {
            node
        };
        arena[parent].t_child[child] = Some(inserted);
        arena[inserted].t_parent = Some(parent);
        parent
    }

    /// Splits the subtree at `node` into two: one where all times are
    /// `<= at` and one `> at`.
    fn split(
        &mut self,
        arena: &mut PointArena,
        node: PointKey,
        at: i64,
    ) -> (Option<PointKey>, Option<PointKey>) {
        if arena[node].at <= at {
            if let Some(child) = arena[node].t_child[1] {
                let (r0, r1) = self.split(arena, child, at);
                arena[node].t_child[1] = r0;
                if let Some(r0) = r0 {
                    arena[r0].t_parent = Some(node);
                }
                (Some(node), r1)
            } else {
                (Some(node), None)
            }
        } else {
            if let Some(child) = arena[node].t_child[0] {
                let (l0, l1) = self.split(arena, child, at);
                arena[node].t_child[0] = l1;
                if let Some(l1) = l1 {
                    arena[l1].t_parent = Some(node);
                }
                (l0, Some(node))
            } else {
                (None, Some(node))
            }
        }
    }

    /// Unlinks `n` from the tree. The point itself stays in the arena.
    pub fn remove(&mut self, arena: &mut PointArena, n: PointKey) {
        let children = arena[n].t_child;
        let new_child = self.merge(arena, children[0], children[1]);
        let parent = arena[n].t_parent;
        if let Some(c) = new_child {
            arena[c].t_parent = parent;
        }
        match parent {
            Some(p) => Self::replace_child(arena, p, n, new_child),
            None => self.root = new_child,
        }
        arena[n].t_parent = None;
        arena[n].t_child = [None; 2];
        self.len -= 1;
    }

    fn replace_child(arena: &mut PointArena, parent: PointKey, from: PointKey, to: Option<PointKey>) {
        if arena[parent].t_child[0] == Some(from) {
            arena[parent].t_child[0] = to;
        } else {
            assert_eq!(arena[parent].t_child[1], Some(from));
            arena[parent].t_child[1] = to;
        }
    }

    /// Merges two subtrees into one. Order-preserving: times under `n`
    /// must precede times under `m`.
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
        debug_assert!(arena[n].at <= arena[m].at);
        if arena[n].t_weight <= arena[m].t_weight {
            // n becomes the root
            let n_right = arena[n].t_child[1];
            let right = self.merge(arena, n_right, Some(m));
            arena[n].t_child[1] = right;
            if let Some(r) = right {
                arena[r].t_parent = Some(n);
            }
            Some(n)
        } else {
            // m becomes the root
            let m_left = arena[m].t_child[0];
            let left = self.merge(arena, Some(n), m_left);
            arena[m].t_child[0] = left;
            if let Some(l) = left {
                arena[l].t_parent = Some(m);
            }
            Some(m)
        }
    }

    /// Exact-time lookup.
    pub fn search(&self, arena: &PointArena, at: i64) -> Option<PointKey> {
        let mut node = self.root;
        while let Some(n) = node {
            if at < arena[n].at {
                node = arena[n].t_child[0];
            } else if at > arena[n].at {
                node = arena[n].t_child[1];
            } else {
                return Some(n);
            }
        }
        None
    }

    /// The most recent point at or before `at`: the point describing the
    /// resource state in effect at time `at`.
    pub fn get_state(&self, arena: &PointArena, at: i64) -> Option<PointKey> {
        let mut last_state = None;
        let mut node = self.root;
        while let Some(n) = node {
            if at < arena[n].at {
                node = arena[n].t_child[0];
            } else if at > arena[n].at {
                last_state = Some(n);
                node = arena[n].t_child[1];
            } else {
                return Some(n);
            }
        }
        last_state
    }

    /// In-order successor.
    pub fn next(&self, arena: &PointArena, n: PointKey) -> Option<PointKey> {
        if let Some(mut right) = arena[n].t_child[1] {
            while let Some(l) = arena[right].t_child[0] {
                right = l;
            }
            return Some(right);
        }
        let mut cur = n;
        while let Some(parent) = arena[cur].t_parent {
            if arena[parent].t_child[0] == Some(cur) {
                return Some(parent);
            }
            cur = parent;
        }
        None
    }

    pub fn first(&self, arena: &PointArena) -> Option<PointKey> {
        let mut node = self.root?;
        while let Some(l) = arena[node].t_child[0] {
            node = l;
        }
        Some(node)
    }

    #[cfg(test)]
    pub fn check_invariants(&self, arena: &PointArena) {
        let count = match self.root {
            Some(root) => {
                assert_eq!(arena[root].t_parent, None);
                self.check_subtree(arena, root, i64::MIN, i64::MAX)
            },
            None => 0,
        };
        assert_eq!(count, self.len);
    }

    /// Checks time ordering, weight heap ordering, and parent pointers.
    /// Returns the subtree size.
    #[cfg(test)]
    fn check_subtree(&self, arena: &PointArena, n: PointKey, lo: i64, hi: i64) -> usize {
        let at = arena[n].at;
        assert!(lo <= at && at <= hi, "point time {at} out of range [{lo}, {hi}]");
        let mut size = 1;
        for (c, lo, hi) in [
            (arena[n].t_child[0], lo, at),
            (arena[n].t_child[1], at, hi),
        ] {
            if let Some(c) = c {
                assert_eq!(arena[c].t_parent, Some(n));
                assert!(arena[n].t_weight <= arena[c].t_weight);
                size += self.check_subtree(arena, c, lo, hi);
            }
        }
        size
    }
}
