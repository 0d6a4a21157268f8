use std::collections::BTreeMap;

use cmd_util::env::env_config;
use common::ResourceType;
use errors::ErrorMetadataAnyhowExt;
use proptest::prelude::*;

use crate::{
    MultiPlanner,
    Planner,
    SpanId,
};

fn cores() -> ResourceType {
    ResourceType::intern("core")
}

#[test]
fn test_new_validation() {
    let err = Planner::new(0, 0, 10, cores()).unwrap_err();
    assert!(err.is_invalid_argument());
    let err = Planner::new(0, 100, u64::MAX, cores()).unwrap_err();
    assert!(err.is_out_of_range());
    let planner = Planner::new(5, 100, 10, cores()).unwrap();
    assert_eq!(planner.base_time(), 5);
    assert_eq!(planner.duration(), 100);
    assert_eq!(planner.total(), 10);
    assert_eq!(planner.resource_type(), cores());
}

#[test]
fn test_add_rem_round_trip() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    let before = planner.clone();
    let id = planner.add_span(100, 200, 4)?;
    assert_ne!(planner, before);
    assert_eq!(planner.avail_resources_at(150)?, 6);
    assert_eq!(planner.avail_resources_at(300)?, 10);
    planner.rem_span(id)?;
    assert_eq!(planner, before);
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_rem_span_unknown() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    let err = planner.rem_span(SpanId(42)).unwrap_err();
    assert!(err.is_not_found());
    Ok(())
}

#[test]
fn test_partial_cancel() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    let pristine = planner.clone();
    let id = planner.add_span(0, 100, 6)?;
    let removed = planner.reduce_span(id, 2)?;
    assert!(!removed);
    assert_eq!(planner.avail_resources_during(0, 100)?, 6);
    assert_eq!(planner.span_resource_count(id)?, 4);
    let removed = planner.reduce_span(id, 4)?;
    assert!(removed);
    assert_eq!(planner.avail_resources_during(0, 100)?, 10);
    assert_eq!(planner, pristine);
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_reduce_full_equals_rem() -> anyhow::Result<()> {
    let mut a = Planner::new(0, 1000, 10, cores())?;
    let mut b = a.clone();
    let id_a = a.add_span(10, 50, 3)?;
    let id_b = b.add_span(10, 50, 3)?;
    a.rem_span(id_a)?;
    assert!(b.reduce_span(id_b, 3)?);
    assert_eq!(a, b);
    Ok(())
}

#[test]
fn test_reduce_validation() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    let id = planner.add_span(0, 10, 4)?;
    assert!(planner.reduce_span(id, -1).unwrap_err().is_invalid_argument());
    assert!(planner.reduce_span(id, 5).unwrap_err().is_invalid_argument());
    // reducing by zero is a no-op on a non-empty span
    assert!(!planner.reduce_span(id, 0)?);
    assert_eq!(planner.span_resource_count(id)?, 4);
    Ok(())
}

#[test]
fn test_avail_time_iteration() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 10000, 10, cores())?;
    // staircase: free resources grow as each span ends
    planner.add_span(0, 1000, 5)?;
    planner.add_span(0, 2000, 3)?;
    planner.add_span(0, 3000, 2)?;
    assert_eq!(planner.avail_time_first(0, 100, 10)?, Some(3000));
    assert_eq!(planner.avail_time_next()?, None);
    assert_eq!(planner.avail_time_first(0, 100, 3)?, Some(1000));
    assert_eq!(planner.avail_time_next()?, Some(2000));
    assert_eq!(planner.avail_time_next()?, Some(3000));
    assert_eq!(planner.avail_time_next()?, None);
    // the window must hold throughout its duration
    assert_eq!(planner.avail_time_first(0, 2000, 6)?, Some(2000));
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_avail_time_first_respects_on_or_after() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 10000, 10, cores())?;
    planner.add_span(0, 1000, 5)?;
    assert_eq!(planner.avail_time_first(500, 100, 10)?, Some(1000));
    assert_eq!(planner.avail_time_first(0, 100, 1)?, Some(0));
    assert!(planner
        .avail_time_first(-1, 100, 1)
        .unwrap_err()
        .is_invalid_argument());
    assert!(planner
        .avail_time_first(0, 100, 11)
        .unwrap_err()
        .is_out_of_range());
    Ok(())
}

#[test]
fn test_mutation_invalidates_iteration() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 10000, 10, cores())?;
    planner.add_span(0, 1000, 5)?;
    assert_eq!(planner.avail_time_first(0, 100, 1)?, Some(0));
    planner.add_span(2000, 100, 1)?;
    let err = planner.avail_time_next().unwrap_err();
    assert!(err.is_invalid_argument());
    // a fresh first re-establishes the iteration
    assert_eq!(planner.avail_time_first(0, 100, 1)?, Some(0));
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_avail_during_window_edges() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 100, 4, cores())?;
    planner.add_span(0, 100, 2)?;
    assert!(planner.avail_during(0, 100, 2)?);
    assert!(!planner.avail_during(0, 100, 3)?);
    // a window running past the plan end is never available
    assert!(!planner.avail_during(50, 100, 1)?);
    assert!(planner.avail_during(0, 1, 0)?);
    assert!(planner.avail_during(-5, 10, 2)?);
    Ok(())
}

#[test]
fn test_update_total() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    planner.add_span(0, 100, 8)?;
    planner.update_total(4)?;
    // remaining clamps at zero rather than going negative
    assert_eq!(planner.avail_resources_at(50)?, 0);
    assert_eq!(planner.avail_resources_at(500)?, 4);
    planner.check_invariants();
    let snapshot = planner.clone();
    planner.update_total(4)?;
    assert_eq!(planner, snapshot);
    // growing back repays the clamped deficit exactly
    planner.update_total(12)?;
    assert_eq!(planner.avail_resources_at(50)?, 4);
    assert_eq!(planner.avail_resources_at(500)?, 12);
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_unavail_time_first() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    planner.add_span(200, 100, 8)?;
    assert_eq!(planner.unavail_time_first(0, 5)?, Some(200));
    assert_eq!(planner.unavail_time_first(0, 2)?, None);
    assert_eq!(planner.unavail_time_first(300, 5)?, None);
    Ok(())
}

#[test]
fn test_reset_reproducibility() -> anyhow::Result<()> {
    let mut planner = Planner::new(0, 1000, 10, cores())?;
    planner.add_span(0, 100, 4)?;
    planner.add_span(50, 200, 2)?;
    let populated = planner.clone();
    planner.reset(0, 1000)?;
    assert_eq!(planner.span_count(), 0);
    assert_eq!(planner.avail_resources_at(50)?, 10);
    planner.add_span(0, 100, 4)?;
    planner.add_span(50, 200, 2)?;
    assert_eq!(planner, populated);
    planner.check_invariants();
    Ok(())
}

#[test]
fn test_multi_staircase() -> anyhow::Result<()> {
    let types: Vec<ResourceType> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|t| ResourceType::intern(t))
        .collect();
    let resources: Vec<(ResourceType, u64)> =
        types.iter().copied().zip([10, 20, 30, 40, 50]).collect();
    let mut multi = MultiPlanner::new(0, 1_000_000, &resources)?;
    multi.add_span(0, 1000, &[1, 0, 0, 0, 0])?;
    multi.add_span(0, 2000, &[0, 2, 0, 0, 0])?;
    multi.add_span(0, 3000, &[0, 0, 3, 0, 0])?;
    multi.add_span(0, 4000, &[0, 0, 0, 4, 0])?;
    multi.add_span(0, 5000, &[0, 0, 0, 0, 5])?;

    assert_eq!(multi.avail_time_first(0, 1000, &[10, 20, 30, 40, 45])?, Some(4000));
    assert_eq!(multi.avail_time_next()?, Some(5000));
    assert_eq!(multi.avail_time_next()?, None);

    assert_eq!(multi.avail_time_first(0, 1000, &[0, 0, 0, 30, 40])?, Some(0));
    assert_eq!(multi.avail_time_first(0, 1000, &[10, 18, 30, 30, 30])?, Some(3000));

    assert_eq!(
        multi.avail_resources_array_at(0)?,
        vec![9, 18, 27, 36, 45],
    );
    assert_eq!(
        multi.avail_resources_array_at(4500)?,
        vec![10, 20, 30, 40, 45],
    );
    Ok(())
}

#[test]
fn test_multi_add_span_rolls_back() -> anyhow::Result<()> {
    let resources = vec![
        (ResourceType::intern("core"), 4),
        (ResourceType::intern("memory"), 16),
    ];
    let mut multi = MultiPlanner::new(0, 1000, &resources)?;
    let before = multi.clone();
    // second child cannot satisfy its request; the first must be rolled back
    let err = multi.add_span(0, 100, &[2, 32]).unwrap_err();
    assert!(err.is_out_of_range());
    assert_eq!(multi, before);
    let err = multi.add_span(0, 100, &[2]).unwrap_err();
    assert!(err.is_invalid_argument());
    Ok(())
}

#[test]
fn test_multi_reduce_span() -> anyhow::Result<()> {
    let core = ResourceType::intern("core");
    let memory = ResourceType::intern("memory");
    let mut multi = MultiPlanner::new(0, 1000, &[(core, 4), (memory, 16)])?;
    // the job uses cores only; the memory child span is zero-sized
    let id = multi.add_span(0, 100, &[2, 0])?;
    assert_eq!(multi.span_planned_for(id, core)?, 2);
    assert_eq!(multi.span_planned_for(id, memory)?, 0);

    // reducing just a core subset removes the zero-sized memory child too
    let removed = multi.reduce_span(id, &[(core, 1)])?;
    assert!(!removed);
    assert_eq!(multi.span_planned_for(id, core)?, 1);
    assert_eq!(multi.span_planned_for(id, memory)?, 0);

    let removed = multi.reduce_span(id, &[(core, 1)])?;
    assert!(removed);
    assert!(multi.rem_span(id).unwrap_err().is_not_found());
    assert_eq!(multi.avail_resources_array_at(50)?, vec![4, 16]);

    let id = multi.add_span(0, 100, &[2, 8])?;
    let unknown = ResourceType::intern("gpu");
    assert!(multi
        .reduce_span(id, &[(unknown, 1)])
        .unwrap_err()
        .is_invalid_argument());
    Ok(())
}

#[test]
fn test_multi_update_elasticity() -> anyhow::Result<()> {
    let core = ResourceType::intern("core");
    let memory = ResourceType::intern("memory");
    let gpu = ResourceType::intern("gpu");
    let mut multi = MultiPlanner::new(0, 1000, &[(core, 4), (memory, 16)])?;
    let id = multi.add_span(0, 100, &[2, 8])?;

    // reorder, resize, grow by one type, drop another
    multi.update(&[(memory, 32), (gpu, 2)])?;
    assert_eq!(multi.resources_len(), 2);
    assert_eq!(multi.resource_type_at(0)?, memory);
    assert_eq!(multi.resource_type_at(1)?, gpu);
    assert_eq!(multi.resource_total_by_type(memory)?, 32);
    assert!(multi.resource_total_by_type(core).unwrap_err().is_not_found());

    // the composite span follows the surviving child
    assert_eq!(multi.span_planned_for(id, memory)?, 8);
    assert_eq!(multi.span_planned_for(id, gpu)?, 0);
    assert_eq!(multi.avail_resources_array_at(50)?, vec![24, 2]);
    Ok(())
}

/// Naive reference: spans as a list, availability by scanning breakpoints.
#[derive(Default)]
struct Model {
    base: i64,
    end: i64,
    total: i64,
    spans: BTreeMap<u64, (i64, i64, i64)>,
    next_id: u64,
}

impl Model {
    fn new(base: i64, end: i64, total: i64) -> Self {
        Self {
            base,
            end,
            total,
            spans: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn remaining_at(&self, t: i64) -> i64 {
        let scheduled: i64 = self
            .spans
            .values()
            .filter(|&&(start, last, _)| start <= t && t < last)
            .map(|&(_, _, planned)| planned)
            .sum();
        self.total - scheduled
    }

    /// Times at which the resource profile can change.
    fn points(&self) -> Vec<i64> {
        let mut ts = vec![self.base];
        for &(start, last, _) in self.spans.values() {
            ts.push(start);
            ts.push(last);
        }
        ts.sort_unstable();
        ts.dedup();
        ts
    }

    fn min_remaining(&self, at: i64, duration: i64) -> i64 {
        let lo = at.max(self.base);
        let mut min = self.remaining_at(lo);
        for t in self.points() {
            if t > lo && t < at + duration {
                min = min.min(self.remaining_at(t));
            }
        }
        min
    }

    fn avail_during(&self, at: i64, duration: i64, request: i64) -> bool {
        if at + duration > self.end {
            return false;
        }
        self.min_remaining(at, duration) >= request
    }

    /// All times the availability iteration should yield, in order.
    fn avail_times(&self, on_or_after: i64, duration: i64, request: i64) -> Vec<i64> {
        self.points()
            .into_iter()
            .filter(|&t| t >= on_or_after && self.avail_during(t, duration, request))
            .collect()
    }

    fn add(&mut self, start: i64, last: i64, planned: i64) -> u64 {
        self.next_id += 1;
        self.spans.insert(self.next_id, (start, last, planned));
        self.next_id
    }
}

const HORIZON: i64 = 1000;

#[derive(Clone, Debug, proptest_derive::Arbitrary)]
enum Action {
    Add {
        #[proptest(strategy = "0i64..900")]
        start: i64,
        #[proptest(strategy = "1u64..=100")]
        duration: u64,
        #[proptest(strategy = "0u64..=8")]
        request: u64,
    },
    Remove(prop::sample::Index),
    Reduce {
        index: prop::sample::Index,
        #[proptest(strategy = "0i64..=8")]
        delta: i64,
    },
    Iterate {
        #[proptest(strategy = "0i64..900")]
        on_or_after: i64,
        #[proptest(strategy = "1u64..=100")]
        duration: u64,
        #[proptest(strategy = "0u64..=8")]
        request: u64,
    },
}

struct Test {
    planner: Planner,
    model: Model,
    // planner span id -> model span id
    live: Vec<(SpanId, u64)>,
}

impl Test {
    fn new(total: i64) -> Self {
        Self {
            planner: Planner::new(0, HORIZON as u64, total as u64, cores()).unwrap(),
            model: Model::new(0, HORIZON, total),
            live: Vec::new(),
        }
    }

    fn execute(&mut self, action: Action) -> anyhow::Result<()> {
        match action {
            Action::Add {
                start,
                duration,
                request,
            } => {
                let fits = self.model.avail_during(start, duration as i64, request as i64);
                match self.planner.add_span(start, duration, request) {
                    Ok(id) => {
                        assert!(fits, "planner placed an unavailable span");
                        let model_id = self.model.add(start, start + duration as i64, request as i64);
                        self.live.push((id, model_id));
                    },
                    Err(e) => {
                        assert!(!fits, "planner refused an available span: {e}");
                    },
                }
            },
            Action::Remove(index) => {
                if self.live.is_empty() {
                    return Ok(());
                }
                let (id, model_id) = self.live.swap_remove(index.index(self.live.len()));
                self.planner.rem_span(id)?;
                self.model.spans.remove(&model_id);
            },
            Action::Reduce { index, delta } => {
                if self.live.is_empty() {
                    return Ok(());
                }
                let i = index.index(self.live.len());
                let (id, model_id) = self.live[i];
                let planned = self.model.spans[&model_id].2;
                if delta > planned {
                    assert!(self.planner.reduce_span(id, delta).is_err());
                    return Ok(());
                }
                let removed = self.planner.reduce_span(id, delta)?;
                assert_eq!(removed, delta == planned);
                if removed {
                    self.live.swap_remove(i);
                    self.model.spans.remove(&model_id);
                } else {
                    self.model.spans.get_mut(&model_id).unwrap().2 -= delta;
                }
            },
            Action::Iterate {
                on_or_after,
                duration,
                request,
            } => {
                let expected = self.model.avail_times(on_or_after, duration as i64, request as i64);
                let mut actual = Vec::new();
                let mut t = self.planner.avail_time_first(on_or_after, duration, request)?;
                while let Some(found) = t {
                    actual.push(found);
                    t = self.planner.avail_time_next()?;
                }
                assert_eq!(actual, expected);
            },
        }
        Ok(())
    }

    fn check(&self) {
        self.planner.check_invariants();
        for t in [0, 1, 137, 500, 999] {
            assert_eq!(
                self.planner.avail_resources_at(t).unwrap(),
                self.model.remaining_at(t),
                "remaining mismatch at {t}",
            );
        }
        for (at, d) in [(0, 1000), (100, 50), (700, 300)] {
            assert_eq!(
                self.planner.avail_resources_during(at, d).unwrap(),
                self.model.min_remaining(at, d as i64),
                "min remaining mismatch over ({at}, {d})",
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32 * env_config("QMANAGER_PROPTEST_MULTIPLIER", 1),
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn proptest_planner_matches_model(actions in prop::collection::vec(any::<Action>(), 1..40)) {
        let mut test = Test::new(8);
        for action in actions {
            test.execute(action).unwrap();
            test.check();
        }
    }
}
