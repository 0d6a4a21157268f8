use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fmt,
};

use common::ResourceType;
use errors::ErrorMetadata;

use crate::planner::{
    Planner,
    SpanId,
};

/// Composite span identifier, unique per multi-planner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MultiSpanId(pub u64);

impl fmt::Display for MultiSpanId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Entry {
    resource_type: ResourceType,
    total: u64,
    planner: Planner,
}

#[derive(Clone, Debug, PartialEq)]
struct RequestMulti {
    on_or_after: i64,
    duration: u64,
    counts: HashMap<ResourceType, u64>,
}

/// A conjunction of per-resource-type planners sharing one span-id space.
///
/// Child planners are kept both in declared order (callers pass arrays
/// aligned to that order) and in a type-keyed index for the reduction and
/// update paths; the two views are kept synchronized on every mutation. A
/// composite span records one child span id per planner; `None` marks a
/// child whose span was fully removed by partial cancel.
#[derive(Clone, Debug)]
pub struct MultiPlanner {
    entries: Vec<Entry>,
    by_type: HashMap<ResourceType, usize>,
    span_lookup: BTreeMap<MultiSpanId, Vec<Option<SpanId>>>,
    span_counter: u64,
    iter_request: Option<RequestMulti>,
}

impl MultiPlanner {
    pub fn new(
        base_time: i64,
        duration: u64,
        resources: &[(ResourceType, u64)],
    ) -> anyhow::Result<Self> {
        if duration < 1 || resources.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadMultiPlan",
                format!(
                    "multi planner needs at least one resource type and a positive duration, \
                     got {} types for {duration}",
                    resources.len(),
                ),
            ));
        }
        let mut entries = Vec::with_capacity(resources.len());
        let mut by_type = HashMap::with_capacity(resources.len());
        for (i, &(resource_type, total)) in resources.iter().enumerate() {
            if by_type.insert(resource_type, i).is_some() {
                anyhow::bail!(ErrorMetadata::already_exists(
                    "DuplicateResourceType",
                    format!("resource type {resource_type} listed twice"),
                ));
            }
            entries.push(Entry {
                resource_type,
                total,
                planner: Planner::new(base_time, duration, total, resource_type)?,
            });
        }
        Ok(Self {
            entries,
            by_type,
            span_lookup: BTreeMap::new(),
            span_counter: 0,
            iter_request: None,
        })
    }

    pub fn base_time(&self) -> i64 {
        self.entries[0].planner.base_time()
    }

    pub fn duration(&self) -> i64 {
        self.entries[0].planner.duration()
    }

    pub fn resources_len(&self) -> usize {
        self.entries.len()
    }

    pub fn resource_type_at(&self, i: usize) -> anyhow::Result<ResourceType> {
        Ok(self.entry_at(i)?.resource_type)
    }

    pub fn resource_total_at(&self, i: usize) -> anyhow::Result<i64> {
        Ok(self.entry_at(i)?.planner.total())
    }

    pub fn resource_total_by_type(&self, resource_type: ResourceType) -> anyhow::Result<i64> {
        let &i = self.by_type.get(&resource_type).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "UnknownResourceType",
                format!("no planner for resource type {resource_type}"),
            ))
        })?;
        Ok(self.entries[i].planner.total())
    }

    pub fn planner_at(&self, i: usize) -> anyhow::Result<&Planner> {
        Ok(&self.entry_at(i)?.planner)
    }

    /// Earliest `t >= on_or_after` at which every child can hold its
    /// request throughout `[t, t + duration)`. Iterates candidates on the
    /// first child and verifies the rest.
    pub fn avail_time_first(
        &mut self,
        on_or_after: i64,
        duration: u64,
        requests: &[u64],
    ) -> anyhow::Result<Option<i64>> {
        self.check_len(requests.len())?;
        self.iter_request = Some(RequestMulti {
            on_or_after,
            duration,
            counts: self
                .entries
                .iter()
                .zip(requests)
                .map(|(e, &r)| (e.resource_type, r))
                .collect(),
        });
        let mut t = self.entries[0]
            .planner
            .avail_time_first(on_or_after, duration, requests[0])?;
        while let Some(candidate) = t {
            if self.rest_avail_during(candidate, duration, requests)? {
                return Ok(Some(candidate));
            }
            t = self.entries[0].planner.avail_time_next()?;
        }
        Ok(None)
    }

    /// Resumes the iteration started by the last
    /// [`MultiPlanner::avail_time_first`].
    pub fn avail_time_next(&mut self) -> anyhow::Result<Option<i64>> {
        let req = self.iter_request.clone().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::invalid_argument(
                "NoActiveIteration",
                "avail_time_next called without a preceding avail_time_first",
            ))
        })?;
        loop {
            let Some(candidate) = self.entries[0].planner.avail_time_next()? else {
                return Ok(None);
            };
            let mut unmet = false;
            for entry in &self.entries[1..] {
                let request = *req.counts.get(&entry.resource_type).unwrap_or(&0);
                if !entry.planner.avail_during(candidate, req.duration, request)? {
                    unmet = true;
                    break;
                }
            }
            if !unmet {
                return Ok(Some(candidate));
            }
        }
    }

    /// True iff every child can hold its request throughout the window.
    pub fn avail_during(&self, at: i64, duration: u64, requests: &[u64]) -> anyhow::Result<bool> {
        self.check_len(requests.len())?;
        for (entry, &request) in self.entries.iter().zip(requests) {
            if !entry.planner.avail_during(at, duration, request)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn avail_resources_at(&self, at: i64, i: usize) -> anyhow::Result<i64> {
        self.entry_at(i)?.planner.avail_resources_at(at)
    }

    /// Free units per child at `at`, aligned to the stored type order.
    pub fn avail_resources_array_at(&self, at: i64) -> anyhow::Result<Vec<i64>> {
        self.entries
            .iter()
            .map(|e| e.planner.avail_resources_at(at))
            .collect()
    }

    /// Minimum free units per child over the window, aligned to the stored
    /// type order.
    pub fn avail_resources_array_during(
        &self,
        at: i64,
        duration: u64,
    ) -> anyhow::Result<Vec<i64>> {
        self.entries
            .iter()
            .map(|e| e.planner.avail_resources_during(at, duration))
            .collect()
    }

    /// Atomically places one child span per planner. On any child failure
    /// the spans already created are removed and the error propagates.
    pub fn add_span(
        &mut self,
        start: i64,
        duration: u64,
        requests: &[u64],
    ) -> anyhow::Result<MultiSpanId> {
        self.check_len(requests.len())?;
        let id = MultiSpanId(self.span_counter);
        let mut children: Vec<Option<SpanId>> = Vec::with_capacity(self.entries.len());
        for (i, &request) in requests.iter().enumerate() {
            match self.entries[i].planner.add_span(start, duration, request) {
                Ok(child) => children.push(Some(child)),
                Err(e) => {
                    for (j, child) in children.iter().enumerate() {
                        if let Some(child) = child {
                            // Rollback of a just-created span cannot fail.
                            self.entries[j]
                                .planner
                                .rem_span(*child)
                                .expect("rollback of freshly added span");
                        }
                    }
                    return Err(e);
                },
            }
        }
        self.span_counter += 1;
        self.span_lookup.insert(id, children);
        Ok(id)
    }

    /// Removes every remaining child span of the composite.
    pub fn rem_span(&mut self, id: MultiSpanId) -> anyhow::Result<()> {
        let children = self.span_lookup.get(&id).cloned().ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "MultiSpanNotFound",
                format!("no composite span with id {id} exists"),
            ))
        })?;
        for (i, child) in children.iter().enumerate() {
            // A child may have been fully removed by a prior partial
            // cancel; its entry is None.
            if let Some(child) = child {
                self.entries[i].planner.rem_span(*child)?;
            }
        }
        self.span_lookup.remove(&id);
        Ok(())
    }

    /// Partial cancel across resource types. Types present in the
    /// composite but absent from `reductions` are reduced by zero, which
    /// removes the zero-sized child spans created for resources the job
    /// did not request. Returns whether every child entry is now gone.
    pub fn reduce_span(
        &mut self,
        id: MultiSpanId,
        reductions: &[(ResourceType, u64)],
    ) -> anyhow::Result<bool> {
        if !self.span_lookup.contains_key(&id) {
            anyhow::bail!(ErrorMetadata::not_found(
                "MultiSpanNotFound",
                format!("no composite span with id {id} exists"),
            ));
        }
        let mut reduced = vec![false; self.entries.len()];
        for &(resource_type, amount) in reductions {
            let amount = i64::try_from(amount).map_err(|_| {
                anyhow::anyhow!(ErrorMetadata::out_of_range(
                    "ReductionTooLarge",
                    format!("reduction {amount} exceeds the representable range"),
                ))
            })?;
            let &i = self.by_type.get(&resource_type).ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::invalid_argument(
                    "UnknownResourceType",
                    format!("cannot reduce unknown resource type {resource_type}"),
                ))
            })?;
            self.reduce_child(id, i, amount)?;
            reduced[i] = true;
        }
        for i in 0..self.entries.len() {
            if !reduced[i] {
                self.reduce_child(id, i, 0)?;
            }
        }
        let children = self.span_lookup.get(&id).expect("checked above");
        if children.iter().all(|c| c.is_none()) {
            self.span_lookup.remove(&id);
            return Ok(true);
        }
        Ok(false)
    }

    fn reduce_child(&mut self, id: MultiSpanId, i: usize, amount: i64) -> anyhow::Result<()> {
        let child = self.span_lookup.get(&id).expect("checked by caller")[i];
        // A child already collapsed by an earlier partial cancel is
        // tolerated; there is nothing left to reduce.
        let Some(child) = child else {
            return Ok(());
        };
        let removed = self.entries[i].planner.reduce_span(child, amount)?;
        if removed {
            self.span_lookup.get_mut(&id).expect("checked by caller")[i] = None;
        }
        Ok(())
    }

    /// Elastic reconfiguration: planners are added for new types (sharing
    /// the composite base and duration), totals updated and order
    /// normalized for existing ones, and planners removed for types no
    /// longer listed. Composite span vectors are permuted to stay aligned.
    pub fn update(&mut self, resources: &[(ResourceType, u64)]) -> anyhow::Result<()> {
        if resources.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadMultiPlan",
                "cannot update a multi planner to zero resource types",
            ));
        }
        let base_time = self.base_time();
        let duration = u64::try_from(self.duration()).expect("plan duration is positive");
        let mut new_entries = Vec::with_capacity(resources.len());
        let mut new_by_type = HashMap::with_capacity(resources.len());
        // old index feeding each new position; None for a fresh planner
        let mut source = Vec::with_capacity(resources.len());
        let mut taken = vec![false; self.entries.len()];
        for (i, &(resource_type, total)) in resources.iter().enumerate() {
            if new_by_type.insert(resource_type, i).is_some() {
                anyhow::bail!(ErrorMetadata::already_exists(
                    "DuplicateResourceType",
                    format!("resource type {resource_type} listed twice"),
                ));
            }
            match self.by_type.get(&resource_type) {
                Some(&old) => {
                    let mut entry = self.entries[old].clone();
                    entry.total = total;
                    entry.planner.update_total(total)?;
                    taken[old] = true;
                    source.push(Some(old));
                    new_entries.push(entry);
                },
                None => {
                    source.push(None);
                    new_entries.push(Entry {
                        resource_type,
                        total,
                        planner: Planner::new(base_time, duration, total, resource_type)?,
                    });
                },
            }
        }
        if taken.iter().any(|t| !t) {
            log_removed_types(&self.entries, &taken);
        }
        for children in self.span_lookup.values_mut() {
            let remapped: Vec<Option<SpanId>> = source
                .iter()
                .map(|&src| src.and_then(|old| children[old]))
                .collect();
            *children = remapped;
        }
        self.entries = new_entries;
        self.by_type = new_by_type;
        Ok(())
    }

    /// Resets every child planner and discards all composite spans.
    pub fn reset(&mut self, base_time: i64, duration: u64) -> anyhow::Result<()> {
        for entry in &mut self.entries {
            entry.planner.reset(base_time, duration)?;
        }
        self.span_lookup.clear();
        self.iter_request = None;
        Ok(())
    }

    pub fn span_count(&self) -> usize {
        self.span_lookup.len()
    }

    pub fn span_ids(&self) -> impl Iterator<Item = MultiSpanId> + '_ {
        self.span_lookup.keys().copied()
    }

    /// Units planned for `resource_type` by the composite span.
    pub fn span_planned_for(
        &self,
        id: MultiSpanId,
        resource_type: ResourceType,
    ) -> anyhow::Result<i64> {
        let children = self.span_lookup.get(&id).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "MultiSpanNotFound",
                format!("no composite span with id {id} exists"),
            ))
        })?;
        let &i = self.by_type.get(&resource_type).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "UnknownResourceType",
                format!("no planner for resource type {resource_type}"),
            ))
        })?;
        match children[i] {
            Some(child) => self.entries[i].planner.span_resource_count(child),
            None => Ok(0),
        }
    }

    fn entry_at(&self, i: usize) -> anyhow::Result<&Entry> {
        self.entries.get(i).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::invalid_argument(
                "ResourceIndexOutOfBounds",
                format!("resource index {i} out of bounds for {} types", self.entries.len()),
            ))
        })
    }

    fn check_len(&self, len: usize) -> anyhow::Result<()> {
        if len != self.entries.len() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "ResourceArityMismatch",
                format!("got {len} resource counts for {} planners", self.entries.len()),
            ));
        }
        Ok(())
    }

    fn rest_avail_during(
        &self,
        at: i64,
        duration: u64,
        requests: &[u64],
    ) -> anyhow::Result<bool> {
        for (entry, &request) in self.entries.iter().zip(requests).skip(1) {
            if !entry.planner.avail_during(at, duration, request)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn log_removed_types(entries: &[Entry], taken: &[bool]) {
    for (entry, &taken) in entries.iter().zip(taken) {
        if !taken {
            tracing::debug!(
                "removing planner for resource type {} on update",
                entry.resource_type,
            );
        }
    }
}

impl PartialEq for MultiPlanner {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries && self.span_lookup == other.span_lookup
    }
}

impl Eq for MultiPlanner {}
