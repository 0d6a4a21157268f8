use std::{
    collections::BTreeMap,
    fmt,
};

use common::ResourceType;
use errors::ErrorMetadata;
use fastrand::Rng;

use crate::{
    mintime_tree::MinTimeTree,
    point::{
        PointArena,
        PointKey,
        ScheduledPoint,
    },
    point_tree::PointTree,
};

/// Planner-unique span identifier, monotonically increasing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpanId(pub u64);

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A placed interval `[start, last)` holding `planned` units of the
/// planner's resource. Endpoint points are pinned via their ref counts for
/// the lifetime of the span.
#[derive(Copy, Clone, Debug)]
struct Span {
    start: i64,
    last: i64,
    planned: i64,
    in_system: bool,
    start_p: PointKey,
    last_p: PointKey,
}

/// The availability request held between `avail_time_first` and
/// `avail_time_next`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Request {
    on_or_after: i64,
    duration: i64,
    count: i64,
}

/// A single-resource-type reservation timeline over `[base, base + duration]`.
///
/// All operations are O(log n) in the number of scheduled points, except
/// the per-covered-point updates of span placement and removal, which are
/// linear in the points the span overlaps.
#[derive(Clone, Debug)]
pub struct Planner {
    total: i64,
    resource_type: ResourceType,
    plan_start: i64,
    plan_end: i64,
    points: PointArena,
    by_time: PointTree,
    by_remaining: MinTimeTree,
    span_lookup: BTreeMap<SpanId, Span>,
    /// Points extracted from the min-time tree during an availability
    /// iteration, keyed by time; restored on the next structural mutation
    /// or the next `avail_time_first`.
    avail_time_iter: BTreeMap<i64, PointKey>,
    current_request: Option<Request>,
    span_counter: u64,
    rng: Rng,
}

impl Planner {
    /// Creates a planner spanning `[base_time, base_time + duration]` with
    /// one initial point at `base_time` holding the full `total`.
    pub fn new(
        base_time: i64,
        duration: u64,
        total: u64,
        resource_type: ResourceType,
    ) -> anyhow::Result<Self> {
        if duration < 1 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadPlanDuration",
                format!("planner duration must be at least 1, got {duration}"),
            ));
        }
        let total = i64::try_from(total).map_err(|_| {
            anyhow::anyhow!(ErrorMetadata::out_of_range(
                "TotalTooLarge",
                format!("resource total {total} exceeds the representable range"),
            ))
        })?;
        let plan_end = i64::try_from(duration)
            .ok()
            .and_then(|d| base_time.checked_add(d))
            .ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::invalid_argument(
                    "PlanEndOverflow",
                    format!("base time {base_time} plus duration {duration} overflows"),
                ))
            })?;
        let mut planner = Self {
            total,
            resource_type,
            plan_start: base_time,
            plan_end,
            points: PointArena::new(),
            by_time: PointTree::new(),
            by_remaining: MinTimeTree::new(),
            span_lookup: BTreeMap::new(),
            avail_time_iter: BTreeMap::new(),
            current_request: None,
            span_counter: 0,
            rng: Rng::new(),
        };
        planner.install_base_point()?;
        Ok(planner)
    }

    pub fn base_time(&self) -> i64 {
        self.plan_start
    }

    pub fn duration(&self) -> i64 {
        self.plan_end - self.plan_start
    }

    pub fn total(&self) -> i64 {
        self.total
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Earliest `t >= on_or_after` such that `request` units are free
    /// throughout `[t, t + duration)`, or `None` if no such time exists in
    /// the plan window. Starts an iteration resumable via
    /// [`Planner::avail_time_next`].
    pub fn avail_time_first(
        &mut self,
        on_or_after: i64,
        duration: u64,
        request: u64,
    ) -> anyhow::Result<Option<i64>> {
        if on_or_after < self.plan_start || on_or_after >= self.plan_end || duration < 1 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadAvailWindow",
                format!(
                    "availability window (at {on_or_after} for {duration}) falls outside \
                     [{}, {})",
                    self.plan_start, self.plan_end,
                ),
            ));
        }
        let request = self.request_in_range(request)?;
        let duration = duration as i64;
        self.restore_track_points();
        self.current_request = Some(Request {
            on_or_after,
            duration,
            count: request,
        });
        Ok(self.avail_at(on_or_after, duration, request))
    }

    /// Resumes the iteration started by the last
    /// [`Planner::avail_time_first`], returning the next candidate time.
    pub fn avail_time_next(&mut self) -> anyhow::Result<Option<i64>> {
        let req = self.current_request.ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::invalid_argument(
                "NoActiveIteration",
                "avail_time_next called without a preceding avail_time_first",
            ))
        })?;
        if req.count > self.total {
            anyhow::bail!(ErrorMetadata::out_of_range(
                "RequestExceedsTotal",
                format!("request {} exceeds resource total {}", req.count, self.total),
            ));
        }
        Ok(self.avail_at(req.on_or_after, req.duration, req.count))
    }

    /// True iff `request` units are free throughout `[at, at + duration)`.
    /// A window running past the plan end is not available.
    pub fn avail_during(&self, at: i64, duration: u64, request: u64) -> anyhow::Result<bool> {
        if duration < 1 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadAvailWindow",
                format!("availability window duration must be at least 1, got {duration}"),
            ));
        }
        let request = self.request_in_range(request)?;
        let duration = duration as i64;
        if at.saturating_add(duration) > self.plan_end {
            return Ok(false);
        }
        let mut point = self.state_or_first(at);
        while let Some(p) = point {
            if self.points[p].at >= at.saturating_add(duration) {
                break;
            }
            if request > self.points[p].remaining {
                return Ok(false);
            }
            point = self.by_time.next(&self.points, p);
        }
        Ok(true)
    }

    /// Free units at the point covering `at`.
    pub fn avail_resources_at(&self, at: i64) -> anyhow::Result<i64> {
        if at < self.plan_start || at > self.plan_end {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "TimeOutsidePlan",
                format!("time {at} falls outside [{}, {}]", self.plan_start, self.plan_end),
            ));
        }
        let state = self
            .by_time
            .get_state(&self.points, at)
            .expect("base point covers every in-window time");
        Ok(self.points[state].remaining)
    }

    /// Minimum free units over the points in `[at, at + duration)`.
    pub fn avail_resources_during(&self, at: i64, duration: u64) -> anyhow::Result<i64> {
        if at > self.plan_end || duration < 1 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadAvailWindow",
                format!("window (at {at} for {duration}) falls outside the plan"),
            ));
        }
        let duration = duration as i64;
        let mut point = self.state_or_first(at);
        let mut min = point.map(|p| self.points[p].remaining).unwrap_or(self.total);
        while let Some(p) = point {
            if self.points[p].at >= at.saturating_add(duration) {
                break;
            }
            min = min.min(self.points[p].remaining);
            point = self.by_time.next(&self.points, p);
        }
        Ok(min)
    }

    /// Earliest `t >= on_or_after` at which fewer than `request` units are
    /// free, or `None` if the request stays satisfied through the plan end.
    pub fn unavail_time_first(
        &self,
        on_or_after: i64,
        request: u64,
    ) -> anyhow::Result<Option<i64>> {
        if on_or_after < self.plan_start || on_or_after >= self.plan_end {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "TimeOutsidePlan",
                format!(
                    "time {on_or_after} falls outside [{}, {})",
                    self.plan_start, self.plan_end,
                ),
            ));
        }
        let request = self.request_in_range(request)?;
        let mut point = self.state_or_first(on_or_after);
        while let Some(p) = point {
            if request > self.points[p].remaining {
                return Ok(Some(self.points[p].at));
            }
            point = self.by_time.next(&self.points, p);
        }
        Ok(None)
    }

    /// Places a span of `request` units over `[start, start + duration)`,
    /// inserting (or pinning) points at both ends and debiting every
    /// covered point. Restores any points parked by an availability
    /// iteration first.
    pub fn add_span(&mut self, start: i64, duration: u64, request: u64) -> anyhow::Result<SpanId> {
        self.span_input_check(start, duration, request)?;
        if !self.avail_during(start, duration, request)? {
            anyhow::bail!(ErrorMetadata::out_of_range(
                "InsufficientResources",
                format!(
                    "{request} {} not available throughout [{start}, {})",
                    self.resource_type,
                    start + duration as i64,
                ),
            ));
        }
        self.span_counter += 1;
        let id = SpanId(self.span_counter);
        if self.span_lookup.contains_key(&id) {
            anyhow::bail!(ErrorMetadata::already_exists(
                "SpanExists",
                format!("span id {id} is already in use"),
            ));
        }
        self.restore_track_points();
        self.current_request = None;

        let planned = request as i64;
        let last = start + duration as i64;
        let start_p = self.get_or_new_point(start)?;
        self.points[start_p].ref_count += 1;
        let last_p = self.get_or_new_point(last)?;
        self.points[last_p].ref_count += 1;

        let touched = self.overlap_points(start, last);
        let total = self.total;
        for &k in &touched {
            let point = &mut self.points[k];
            point.scheduled += planned;
            point.remaining = (total - point.scheduled).max(0);
        }
        self.update_mt_tree(&touched);

        self.span_lookup.insert(
            id,
            Span {
                start,
                last,
                planned,
                in_system: true,
                start_p,
                last_p,
            },
        );
        Ok(id)
    }

    /// Reverses [`Planner::add_span`], crediting every covered point and
    /// reclaiming endpoint points whose ref count drops to zero.
    pub fn rem_span(&mut self, id: SpanId) -> anyhow::Result<()> {
        let span = *self.span_lookup.get(&id).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "SpanNotFound",
                format!("no span with id {id} exists in this planner"),
            ))
        })?;
        self.restore_track_points();
        self.current_request = None;

        self.points[span.start_p].ref_count -= 1;
        self.points[span.last_p].ref_count -= 1;
        let touched = self.overlap_points(span.start, span.last);
        let total = self.total;
        for &k in &touched {
            let point = &mut self.points[k];
            point.scheduled -= span.planned;
            debug_assert!(point.scheduled >= 0);
            point.remaining = (total - point.scheduled).max(0);
        }
        self.update_mt_tree(&touched);

        for endpoint in [span.start_p, span.last_p] {
            if self.points[endpoint].ref_count == 0 {
                self.by_time.remove(&mut self.points, endpoint);
                if self.points[endpoint].in_mt_tree {
                    self.by_remaining.remove(&mut self.points, endpoint);
                }
                self.points.free(endpoint);
            }
        }
        self.span_lookup.remove(&id);
        Ok(())
    }

    /// Partial cancel. Removing exactly the planned amount removes the
    /// span; removing less subtracts from it; removing zero is a no-op.
    /// Returns whether the span fully collapsed.
    pub fn reduce_span(&mut self, id: SpanId, delta: i64) -> anyhow::Result<bool> {
        if delta < 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NegativeReduction",
                format!("cannot reduce span {id} by negative amount {delta}"),
            ));
        }
        let span = *self.span_lookup.get(&id).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "SpanNotFound",
                format!("no span with id {id} exists in this planner"),
            ))
        })?;
        // Planned can be zero (common under a multi-planner, which enters
        // zero-sized child spans for resources a job did not request), and
        // delta may be zero as well. A delta identical to planned removes
        // the span even when both are zero.
        if delta == span.planned {
            self.rem_span(id)?;
            return Ok(true);
        }
        if delta == 0 {
            return Ok(false);
        }
        if delta > span.planned {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "ReductionExceedsPlanned",
                format!("cannot reduce span {id} by {delta}: only {} planned", span.planned),
            ));
        }
        self.restore_track_points();
        self.current_request = None;
        self.span_lookup.get_mut(&id).expect("span looked up above").planned -= delta;
        let touched = self.overlap_points(span.start, span.last);
        let total = self.total;
        for &k in &touched {
            let point = &mut self.points[k];
            point.scheduled -= delta;
            debug_assert!(point.scheduled >= 0);
            point.remaining = (total - point.scheduled).max(0);
        }
        self.update_mt_tree(&touched);
        Ok(false)
    }

    /// Elastic total update: applies the delta to `remaining` at every
    /// point, clamping at zero, and re-keys live min-time-tree entries.
    pub fn update_total(&mut self, new_total: u64) -> anyhow::Result<()> {
        let new_total = i64::try_from(new_total).map_err(|_| {
            anyhow::anyhow!(ErrorMetadata::out_of_range(
                "TotalTooLarge",
                format!("resource total {new_total} exceeds the representable range"),
            ))
        })?;
        if new_total == self.total {
            return Ok(());
        }
        self.total = new_total;
        let mut point = self.by_time.first(&self.points);
        while let Some(p) = point {
            // Remaining never goes negative: a shrink below the currently
            // scheduled amount clamps at zero, and the deficit is repaid as
            // spans release.
            self.points[p].remaining = (new_total - self.points[p].scheduled).max(0);
            if self.points[p].in_mt_tree {
                self.by_remaining.remove(&mut self.points, p);
                self.by_remaining.insert(&mut self.points, p);
            }
            point = self.by_time.next(&self.points, p);
        }
        Ok(())
    }

    /// Discards all spans and re-creates the single base point with the
    /// current total.
    pub fn reset(&mut self, base_time: i64, duration: u64) -> anyhow::Result<()> {
        if duration < 1 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "BadPlanDuration",
                format!("planner duration must be at least 1, got {duration}"),
            ));
        }
        let plan_end = i64::try_from(duration)
            .ok()
            .and_then(|d| base_time.checked_add(d))
            .ok_or_else(|| {
                anyhow::anyhow!(ErrorMetadata::invalid_argument(
                    "PlanEndOverflow",
                    format!("base time {base_time} plus duration {duration} overflows"),
                ))
            })?;
        self.plan_start = base_time;
        self.plan_end = plan_end;
        self.points = PointArena::new();
        self.by_time = PointTree::new();
        self.by_remaining = MinTimeTree::new();
        self.span_lookup.clear();
        self.avail_time_iter.clear();
        self.current_request = None;
        self.span_counter = 0;
        self.install_base_point()
    }

    pub fn span_count(&self) -> usize {
        self.span_lookup.len()
    }

    pub fn span_ids(&self) -> impl Iterator<Item = SpanId> + '_ {
        self.span_lookup.keys().copied()
    }

    pub fn is_active_span(&self, id: SpanId) -> anyhow::Result<bool> {
        Ok(self.span(id)?.in_system)
    }

    pub fn span_start_time(&self, id: SpanId) -> anyhow::Result<i64> {
        Ok(self.span(id)?.start)
    }

    pub fn span_duration(&self, id: SpanId) -> anyhow::Result<i64> {
        let span = self.span(id)?;
        Ok(span.last - span.start)
    }

    pub fn span_resource_count(&self, id: SpanId) -> anyhow::Result<i64> {
        Ok(self.span(id)?.planned)
    }

    fn span(&self, id: SpanId) -> anyhow::Result<&Span> {
        self.span_lookup.get(&id).ok_or_else(|| {
            anyhow::anyhow!(ErrorMetadata::not_found(
                "SpanNotFound",
                format!("no span with id {id} exists in this planner"),
            ))
        })
    }

    fn install_base_point(&mut self) -> anyhow::Result<()> {
        let p0 = self.new_point(self.plan_start, 0, self.total, 1)?;
        self.by_time.insert(&mut self.points, p0)?;
        self.by_remaining.insert(&mut self.points, p0);
        Ok(())
    }

    fn new_point(
        &mut self,
        at: i64,
        scheduled: i64,
        remaining: i64,
        ref_count: u32,
    ) -> anyhow::Result<PointKey> {
        let t_weight = self.rng.u32(..);
        let m_weight = self.rng.u32(..);
        self.points.insert_with(|key| ScheduledPoint {
            at,
            scheduled,
            remaining,
            ref_count,
            in_mt_tree: false,
            t_weight,
            t_parent: None,
            t_child: [None; 2],
            m_weight,
            m_parent: None,
            m_child: [None; 2],
            m_remaining: remaining,
            m_min_at: key,
        })
    }

    fn request_in_range(&self, request: u64) -> anyhow::Result<i64> {
        match i64::try_from(request) {
            Ok(r) if r <= self.total => Ok(r),
            _ => anyhow::bail!(ErrorMetadata::out_of_range(
                "RequestExceedsTotal",
                format!("request {request} exceeds resource total {}", self.total),
            )),
        }
    }

    fn span_input_check(&self, start: i64, duration: u64, request: u64) -> anyhow::Result<()> {
        let last = i64::try_from(duration)
            .ok()
            .filter(|&d| d >= 1)
            .and_then(|d| start.checked_add(d));
        match last {
            Some(last) if start >= self.plan_start && last <= self.plan_end => {},
            _ => anyhow::bail!(ErrorMetadata::invalid_argument(
                "SpanOutsidePlan",
                format!(
                    "span (at {start} for {duration}) does not fit in [{}, {}]",
                    self.plan_start, self.plan_end,
                ),
            )),
        }
        self.request_in_range(request)?;
        Ok(())
    }

    /// The point covering `at`, or the first point after it when `at`
    /// precedes the plan.
    fn state_or_first(&self, at: i64) -> Option<PointKey> {
        self.by_time
            .get_state(&self.points, at)
            .or_else(|| self.by_time.first(&self.points))
    }

    fn get_or_new_point(&mut self, at: i64) -> anyhow::Result<PointKey> {
        if let Some(k) = self.by_time.search(&self.points, at) {
            return Ok(k);
        }
        let state = self
            .by_time
            .get_state(&self.points, at)
            .expect("base point covers every in-window time");
        let (scheduled, remaining) = {
            let s = &self.points[state];
            (s.scheduled, s.remaining)
        };
        let point = self.new_point(at, scheduled, remaining, 0)?;
        self.by_time.insert(&mut self.points, point)?;
        self.by_remaining.insert(&mut self.points, point);
        Ok(point)
    }

    /// Points in `[start, last)`, in time order, starting from the state
    /// point (which is the span's own start point once it exists).
    fn overlap_points(&self, start: i64, last: i64) -> Vec<PointKey> {
        let mut touched = Vec::new();
        let mut point = self.by_time.get_state(&self.points, start);
        while let Some(p) = point {
            if self.points[p].at >= last {
                break;
            }
            if self.points[p].at >= start {
                touched.push(p);
            }
            point = self.by_time.next(&self.points, p);
        }
        touched
    }

    /// Re-keys touched points in the min-time tree after their `remaining`
    /// changed. Points with no remaining reference stay out so they can be
    /// reclaimed.
    fn update_mt_tree(&mut self, touched: &[PointKey]) {
        for &p in touched {
            if self.points[p].in_mt_tree {
                self.by_remaining.remove(&mut self.points, p);
            }
            if self.points[p].ref_count > 0 && !self.points[p].in_mt_tree {
                self.by_remaining.insert(&mut self.points, p);
            }
        }
    }

    /// Re-inserts the points parked by an availability iteration.
    fn restore_track_points(&mut self) {
        let parked = std::mem::take(&mut self.avail_time_iter);
        for (_, p) in parked {
            if !self.points[p].in_mt_tree {
                self.by_remaining.insert(&mut self.points, p);
            }
        }
    }

    /// Core of the availability iteration: repeatedly pull the earliest
    /// point with sufficient recorded remaining, park it so the next call
    /// sees the next candidate, and check the full window from it.
    fn avail_at(&mut self, on_or_after: i64, duration: i64, request: i64) -> Option<i64> {
        while let Some(start_point) = self.by_remaining.get_mintime(&self.points, request) {
            let at = self.points[start_point].at;
            if at < on_or_after {
                self.by_remaining.remove(&mut self.points, start_point);
                self.avail_time_iter.insert(at, start_point);
                continue;
            }
            if self.span_ok(start_point, duration, request) {
                self.by_remaining.remove(&mut self.points, start_point);
                self.avail_time_iter.insert(at, start_point);
                if at.saturating_add(duration) > self.plan_end {
                    return None;
                }
                return Some(at);
            }
            // span_ok parked the failing candidate already
        }
        None
    }

    /// True iff every point from `start_point` through the window keeps
    /// `request` units free. On failure the candidate is parked.
    fn span_ok(&mut self, start_point: PointKey, duration: i64, request: i64) -> bool {
        let start_at = self.points[start_point].at;
        let mut next = Some(start_point);
        while let Some(p) = next {
            if self.points[p].at >= start_at.saturating_add(duration) {
                break;
            }
            if request > self.points[p].remaining {
                self.by_remaining.remove(&mut self.points, start_point);
                self.avail_time_iter.insert(start_at, start_point);
                return false;
            }
            next = self.by_time.next(&self.points, p);
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        self.by_time.check_invariants(&self.points);
        self.by_remaining.check_invariants(&self.points);
        let mut in_mt = 0;
        let mut count = 0;
        let mut point = self.by_time.first(&self.points);
        let mut prev_at = None;
        while let Some(p) = point {
            let sp = &self.points[p];
            assert!(sp.scheduled >= 0, "negative scheduled at {}", sp.at);
            assert_eq!(
                sp.remaining,
                (self.total - sp.scheduled).max(0),
                "remaining out of sync with scheduled at {}",
                sp.at,
            );
            assert!(self.plan_start <= sp.at && sp.at <= self.plan_end);
            if let Some(prev) = prev_at {
                assert!(prev < sp.at);
            }
            prev_at = Some(sp.at);
            if sp.in_mt_tree {
                in_mt += 1;
            } else {
                // extracted points must be parked in the iteration tracker
                assert!(self.avail_time_iter.contains_key(&sp.at));
            }
            count += 1;
            point = self.by_time.next(&self.points, p);
        }
        assert_eq!(count, self.by_time.len());
        assert_eq!(count, self.points.len());
        assert_eq!(in_mt, self.by_remaining.len());
    }
}

/// Observable-state equality: point sequences, spans, parked iteration
/// points, and bounds. The span-id allocation cursor is excluded so a
/// planner compares equal to its pre-add state after an add/remove pair.
impl PartialEq for Planner {
    fn eq(&self, other: &Self) -> bool {
        if self.total != other.total
            || self.resource_type != other.resource_type
            || self.plan_start != other.plan_start
            || self.plan_end != other.plan_end
            || self.current_request != other.current_request
        {
            return false;
        }
        if self.by_time.len() != other.by_time.len()
            || self.span_lookup.len() != other.span_lookup.len()
            || self.avail_time_iter.len() != other.avail_time_iter.len()
        {
            return false;
        }
        let mut a = self.by_time.first(&self.points);
        let mut b = other.by_time.first(&other.points);
        while let (Some(pa), Some(pb)) = (a, b) {
            if self.points[pa].state() != other.points[pb].state() {
                return false;
            }
            a = self.by_time.next(&self.points, pa);
            b = other.by_time.next(&other.points, pb);
        }
        if a.is_some() || b.is_some() {
            return false;
        }
        for ((id_a, sa), (id_b, sb)) in self.span_lookup.iter().zip(other.span_lookup.iter()) {
            if id_a != id_b
                || sa.start != sb.start
                || sa.last != sb.last
                || sa.planned != sb.planned
                || sa.in_system != sb.in_system
            {
                return false;
            }
        }
        self.avail_time_iter
            .keys()
            .eq(other.avail_time_iter.keys())
    }
}

impl Eq for Planner {}
