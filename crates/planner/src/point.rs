use std::{
    num::NonZeroU32,
    ops::{
        Index,
        IndexMut,
    },
};

use anyhow::Context;
use errors::ErrorMetadata;
use slab::Slab;

/// A scheduled point: a time at which the planner's free-resource count
/// changes. Points are shared by every span that starts or ends at their
/// time (`ref_count`) plus the planner's own base point, and are threaded
/// through both search trees via the link fields below.
#[derive(Clone, Debug)]
pub(crate) struct ScheduledPoint {
    /// Resource-state changing time.
    pub at: i64,
    /// Quantity allocated across spans covering this point.
    pub scheduled: i64,
    /// Quantity free at and after this point, until the next point.
    pub remaining: i64,
    /// Number of span endpoints pinned here (plus one for the base point).
    pub ref_count: u32,
    /// True while the point is a member of the min-time resource tree;
    /// false while it is extracted for an availability iteration.
    pub in_mt_tree: bool,

    // Links for the time-ordered tree.
    pub t_weight: u32,
    pub t_parent: Option<PointKey>,
    pub t_child: [Option<PointKey>; 2],

    // Links for the min-time resource tree. The key is a snapshot of
    // `remaining` taken at insertion; points get re-inserted whenever
    // their live value changes.
    pub m_weight: u32,
    pub m_parent: Option<PointKey>,
    pub m_child: [Option<PointKey>; 2],
    pub m_remaining: i64,
    /// Points to the node with the smallest `at` in the subtree rooted at
    /// this node (min-time tree only).
    pub m_min_at: PointKey,
}

impl ScheduledPoint {
    /// Logical resource state, independent of tree position. This is what
    /// planner equality and the invariant checks compare.
    pub fn state(&self) -> (i64, i64, i64, u32, bool) {
        (
            self.at,
            self.scheduled,
            self.remaining,
            self.ref_count,
            self.in_mt_tree,
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PointKey(NonZeroU32);

impl PointKey {
    fn new(index: usize) -> anyhow::Result<Self> {
        u32::try_from(index + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .map(Self)
            .context(ErrorMetadata::out_of_memory())
    }

    fn index(&self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Arena holding every scheduled point of one planner. Keys stay valid
/// across clones, which is what lets `Planner` derive `Clone` despite the
/// span-to-point back-references.
#[derive(Clone, Debug, Default)]
pub(crate) struct PointArena {
    points: Slab<ScheduledPoint>,
}

impl PointArena {
    pub fn new() -> Self {
        Self { points: Slab::new() }
    }

    /// Inserts a point built by `f`, which receives the key it will live
    /// under (the min-time annotation is self-referential at rest).
    pub fn insert_with(
        &mut self,
        f: impl FnOnce(PointKey) -> ScheduledPoint,
    ) -> anyhow::Result<PointKey> {
        let entry = self.points.vacant_entry();
        let key = PointKey::new(entry.key())?;
        entry.insert(f(key));
        Ok(key)
    }

    pub fn free(&mut self, key: PointKey) {
        self.points.remove(key.index());
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.points.len()
    }
}

impl Index<PointKey> for PointArena {
    type Output = ScheduledPoint;

    fn index(&self, index: PointKey) -> &Self::Output {
        &self.points[index.index()]
    }
}

impl IndexMut<PointKey> for PointArena {
    fn index_mut(&mut self, index: PointKey) -> &mut Self::Output {
        &mut self.points[index.index()]
    }
}
